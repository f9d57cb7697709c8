//! Transaction event log parsing
//!
//! The ledger does not return the ID of a subscription it creates; it only
//! shows up as a base64 encoded attribute of an `EventCreateSubscription`
//! event in the transaction receipt.

use super::Transaction;
use crate::{DvpnError, DvpnResult};
use base64::{engine::general_purpose::STANDARD as BASE64, Engine as _};

/// Event emitted when a node subscription is created
pub const NODE_SUBSCRIPTION_EVENT: &str = "sentinel.node.v2.EventCreateSubscription";

/// Event emitted when a plan subscription is created
pub const PLAN_SUBSCRIPTION_EVENT: &str = "sentinel.plan.v2.EventCreateSubscription";

fn decode(field: &str, encoded: &str) -> DvpnResult<String> {
    let bytes = BASE64
        .decode(encoded)
        .map_err(|e| DvpnError::MalformedResponse(format!("invalid base64 in event {}: {}", field, e)))?;
    String::from_utf8(bytes)
        .map_err(|e| DvpnError::MalformedResponse(format!("non UTF-8 event {}: {}", field, e)))
}

/// Find the subscription ID in the first `event_type` event carrying an `id` attribute.
///
/// The value is a quoted number (`"42"`); the quotes are stripped before parsing.
pub fn extract_subscription_id(tx: &Transaction, event_type: &str) -> DvpnResult<i64> {
    for event in tx.events.iter().filter(|e| e.event_type == event_type) {
        for attribute in &event.attributes {
            if decode("key", &attribute.key)? != "id" {
                continue;
            }

            let value = decode("value", &attribute.value)?;
            let digits = value.trim().trim_matches('"');
            return digits.parse::<i64>().map_err(|e| {
                DvpnError::MalformedResponse(format!(
                    "subscription id {:?} in tx {} is not a number: {}",
                    value, tx.txhash, e
                ))
            });
        }
    }

    Err(DvpnError::MalformedResponse(format!(
        "no {} event with an id attribute in tx {} ({} events)",
        event_type,
        tx.txhash,
        tx.events.len()
    )))
}
