use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::types::{BillingResponseCode, BillingResult, ConnectionState};

/// Broad error category, one per kind of failed billing operation.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub enum BillingErrorCategory {
    /// Backend handshake failed or the service connection is down.
    Connection,
    /// Catalog or owned-purchase query returned a non-OK status.
    Query,
    /// Catalog query succeeded but matched no product.
    NotFound,
    /// The purchase UI could not be launched.
    PurchaseLaunch,
    /// Acknowledging a purchase failed.
    Acknowledge,
    /// Consuming a purchase failed.
    Consume,
    /// Runtime bug, stopped runtime, or invariant break.
    Internal,
}

/// Stable billing error payload returned across the facade boundary.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Error)]
#[error("{category:?}:{code}: {message}")]
pub struct BillingError {
    /// High-level error category.
    pub category: BillingErrorCategory,
    /// Stable machine-readable error code.
    pub code: String,
    /// Human-readable message.
    pub message: String,
    /// Backend response code when the error came from a backend call.
    pub response_code: Option<BillingResponseCode>,
}

impl BillingError {
    /// Construct a new billing error.
    pub fn new(
        category: BillingErrorCategory,
        code: impl Into<String>,
        message: impl Into<String>,
    ) -> Self {
        Self {
            category,
            code: code.into(),
            message: message.into(),
            response_code: None,
        }
    }

    /// Attach the backend response code to the error.
    pub fn with_response_code(mut self, response_code: BillingResponseCode) -> Self {
        self.response_code = Some(response_code);
        self
    }

    /// Build an error from a non-OK backend result.
    ///
    /// Connection-class response codes override `category` so callers can tell
    /// a dropped service apart from a rejected request.
    pub fn from_billing_result(
        category: BillingErrorCategory,
        code: impl Into<String>,
        result: &BillingResult,
    ) -> Self {
        let category = match classify_response_code(result.response_code) {
            BillingErrorCategory::Connection => BillingErrorCategory::Connection,
            _ => category,
        };
        let message = if result.debug_message.is_empty() {
            format!("backend responded {:?}", result.response_code)
        } else {
            format!(
                "backend responded {:?}: {}",
                result.response_code, result.debug_message
            )
        };
        Self::new(category, code, message).with_response_code(result.response_code)
    }

    /// Build a standard invalid-state-transition error.
    pub fn invalid_state(current: ConnectionState, action: impl Into<String>) -> Self {
        let action = action.into();
        Self::new(
            BillingErrorCategory::Internal,
            "invalid_state_transition",
            format!("cannot run '{action}' while connection is {current:?}"),
        )
    }

    /// The runtime task is gone and no longer accepts commands.
    pub fn runtime_stopped() -> Self {
        Self::new(
            BillingErrorCategory::Internal,
            "runtime_stopped",
            "billing runtime is not running",
        )
    }

    /// The pending request was dropped without a result, for example because a
    /// newer purchase replaced its result slot.
    pub fn result_dropped() -> Self {
        Self::new(
            BillingErrorCategory::Internal,
            "result_dropped",
            "request was dropped before a result was delivered",
        )
    }

    /// Whether reconnecting and retrying the operation may succeed.
    pub fn is_recoverable(&self) -> bool {
        self.category == BillingErrorCategory::Connection
    }
}

/// Map backend response codes to error categories.
pub fn classify_response_code(code: BillingResponseCode) -> BillingErrorCategory {
    use BillingResponseCode::*;

    match code {
        ServiceDisconnected | ServiceUnavailable | ServiceTimeout | NetworkError => {
            BillingErrorCategory::Connection
        }
        ItemUnavailable | ItemNotOwned => BillingErrorCategory::NotFound,
        UserCanceled | ItemAlreadyOwned => BillingErrorCategory::PurchaseLaunch,
        Ok | BillingUnavailable | DeveloperError | Error | FeatureNotSupported => {
            BillingErrorCategory::Internal
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn classifies_response_code_categories() {
        assert_eq!(
            classify_response_code(BillingResponseCode::ServiceDisconnected),
            BillingErrorCategory::Connection
        );
        assert_eq!(
            classify_response_code(BillingResponseCode::NetworkError),
            BillingErrorCategory::Connection
        );
        assert_eq!(
            classify_response_code(BillingResponseCode::ItemUnavailable),
            BillingErrorCategory::NotFound
        );
        assert_eq!(
            classify_response_code(BillingResponseCode::UserCanceled),
            BillingErrorCategory::PurchaseLaunch
        );
        assert_eq!(
            classify_response_code(BillingResponseCode::DeveloperError),
            BillingErrorCategory::Internal
        );
    }

    #[test]
    fn keeps_invalid_state_error_code_stable() {
        let err = BillingError::invalid_state(ConnectionState::Disconnected, "on_setup_finished");
        assert_eq!(err.code, "invalid_state_transition");
        assert_eq!(err.category, BillingErrorCategory::Internal);
    }

    #[test]
    fn backend_result_keeps_operation_category_unless_connection_dropped() {
        let rejected = BillingError::from_billing_result(
            BillingErrorCategory::Query,
            "catalog_query_failed",
            &BillingResult::new(BillingResponseCode::DeveloperError, "bad product id"),
        );
        assert_eq!(rejected.category, BillingErrorCategory::Query);
        assert_eq!(
            rejected.response_code,
            Some(BillingResponseCode::DeveloperError)
        );
        assert!(rejected.message.contains("bad product id"));
        assert!(!rejected.is_recoverable());

        let dropped = BillingError::from_billing_result(
            BillingErrorCategory::Query,
            "catalog_query_failed",
            &BillingResponseCode::ServiceDisconnected.into(),
        );
        assert_eq!(dropped.category, BillingErrorCategory::Connection);
        assert_eq!(dropped.code, "catalog_query_failed");
        assert!(dropped.is_recoverable());
    }
}
