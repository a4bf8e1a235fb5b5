use super::money::Currency;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Account-level control tags that change how payments are collected.
#[derive(Debug, Serialize, Deserialize, PartialEq, Eq, Hash, Clone, Copy)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ControlTag {
    /// Payment collection is suspended; attempts are parked for later.
    AutoPayOff,
}

/// The billing account a payment is made for.
#[derive(Debug, Serialize, Deserialize, PartialEq, Clone)]
pub struct Account {
    pub id: Uuid,
    pub currency: Currency,
    /// Default payment method used when a request does not name one.
    pub payment_method_id: Option<Uuid>,
    pub parent_account_id: Option<Uuid>,
    /// Child accounts may hand invoice collection over to their parent.
    pub is_payment_delegated_to_parent: bool,
}

impl Account {
    pub fn new(id: Uuid, currency: Currency) -> Self {
        Self {
            id,
            currency,
            payment_method_id: None,
            parent_account_id: None,
            is_payment_delegated_to_parent: false,
        }
    }

    pub fn with_payment_method(mut self, payment_method_id: Uuid) -> Self {
        self.payment_method_id = Some(payment_method_id);
        self
    }

    pub fn delegating_to(mut self, parent_account_id: Uuid) -> Self {
        self.parent_account_id = Some(parent_account_id);
        self.is_payment_delegated_to_parent = true;
        self
    }

    pub fn delegates_payment(&self) -> bool {
        self.parent_account_id.is_some() && self.is_payment_delegated_to_parent
    }
}
