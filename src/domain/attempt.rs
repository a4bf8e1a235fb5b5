use super::money::Currency;
use super::payment::TransactionType;
use crate::error::Result;
use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::fmt;
use uuid::Uuid;

/// Nodes of the attempt state machine.
#[derive(Debug, Serialize, Deserialize, PartialEq, Eq, Hash, Clone, Copy)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum AttemptState {
    Initiated,
    Retried,
    Success,
    Aborted,
    Failure,
}

impl AttemptState {
    pub fn name(&self) -> &'static str {
        match self {
            Self::Initiated => "INITIATED",
            Self::Retried => "RETRIED",
            Self::Success => "SUCCESS",
            Self::Aborted => "ABORTED",
            Self::Failure => "FAILURE",
        }
    }

    /// Only an `Initiated` row belongs to a traversal still in flight (or
    /// interrupted by a crash).
    pub fn is_in_flight(&self) -> bool {
        matches!(self, Self::Initiated)
    }
}

impl fmt::Display for AttemptState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Opaque key/value pair handed to control plugins and the processor.
#[derive(Debug, Serialize, Deserialize, PartialEq, Clone)]
pub struct PluginProperty {
    pub key: String,
    pub value: serde_json::Value,
}

impl PluginProperty {
    pub fn new(key: impl Into<String>, value: impl Into<serde_json::Value>) -> Self {
        Self {
            key: key.into(),
            value: value.into(),
        }
    }
}

/// Looks a property up by key; later entries shadow earlier ones.
pub fn find_property<'a>(
    properties: &'a [PluginProperty],
    key: &str,
) -> Option<&'a serde_json::Value> {
    properties.iter().rev().find(|p| p.key == key).map(|p| &p.value)
}

pub fn serialize_properties(properties: &[PluginProperty]) -> Result<Vec<u8>> {
    Ok(serde_json::to_vec(properties)?)
}

pub fn deserialize_properties(blob: &[u8]) -> Result<Vec<PluginProperty>> {
    if blob.is_empty() {
        return Ok(Vec::new());
    }
    Ok(serde_json::from_slice(blob)?)
}

/// Bookkeeping record of one traversal through the attempt state machine.
#[derive(Debug, Serialize, Deserialize, PartialEq, Clone)]
pub struct PaymentAttempt {
    pub id: Uuid,
    pub account_id: Uuid,
    pub payment_method_id: Option<Uuid>,
    pub created_date: DateTime<Utc>,
    pub updated_date: DateTime<Utc>,
    pub payment_external_key: String,
    pub transaction_id: Option<Uuid>,
    pub transaction_external_key: String,
    pub transaction_type: TransactionType,
    pub state_name: AttemptState,
    pub amount: Option<Decimal>,
    pub currency: Option<Currency>,
    pub plugin_names: Vec<String>,
    pub plugin_properties: Vec<u8>,
}

impl PaymentAttempt {
    pub fn properties(&self) -> Result<Vec<PluginProperty>> {
        deserialize_properties(&self.plugin_properties)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_property_blob_roundtrip_preserves_order() {
        let props = vec![
            PluginProperty::new("IPCD_INVOICE_ID", "abc"),
            PluginProperty::new("retry", true),
        ];
        let blob = serialize_properties(&props).unwrap();
        assert_eq!(deserialize_properties(&blob).unwrap(), props);
        assert!(deserialize_properties(&[]).unwrap().is_empty());
    }

    #[test]
    fn test_find_property_prefers_latest() {
        let props = vec![
            PluginProperty::new("k", 1),
            PluginProperty::new("other", 2),
            PluginProperty::new("k", 3),
        ];
        assert_eq!(find_property(&props, "k"), Some(&serde_json::json!(3)));
        assert_eq!(find_property(&props, "missing"), None);
    }

    #[test]
    fn test_in_flight_states() {
        assert!(AttemptState::Initiated.is_in_flight());
        assert!(!AttemptState::Retried.is_in_flight());
        assert!(!AttemptState::Success.is_in_flight());
    }
}
