use serde::{Deserialize, Serialize};

use crate::{channel::ResultSender, error::BillingError, retry::RetryPolicy};

/// Connection status of the single backend client handle.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub enum ConnectionState {
    /// No connection, either never started, torn down, or waiting for a retry.
    Disconnected,
    /// A handshake with the backend is in flight.
    Connecting,
    /// Backend handshake succeeded and operations may be issued.
    Connected,
    /// Reconnect attempts were exhausted; no automatic retries remain.
    Failed,
}

/// Response codes reported by the purchase backend.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
pub enum BillingResponseCode {
    Ok,
    UserCanceled,
    ServiceUnavailable,
    BillingUnavailable,
    ItemUnavailable,
    DeveloperError,
    Error,
    ItemAlreadyOwned,
    ItemNotOwned,
    NetworkError,
    ServiceDisconnected,
    FeatureNotSupported,
    ServiceTimeout,
}

impl BillingResponseCode {
    /// Numeric wire value used by the backend SDK.
    pub fn code(self) -> i32 {
        match self {
            Self::Ok => 0,
            Self::UserCanceled => 1,
            Self::ServiceUnavailable => 2,
            Self::BillingUnavailable => 3,
            Self::ItemUnavailable => 4,
            Self::DeveloperError => 5,
            Self::Error => 6,
            Self::ItemAlreadyOwned => 7,
            Self::ItemNotOwned => 8,
            Self::NetworkError => 12,
            Self::ServiceDisconnected => -1,
            Self::FeatureNotSupported => -2,
            Self::ServiceTimeout => -3,
        }
    }

    /// Map a numeric wire value back to a response code.
    ///
    /// Unknown values collapse to [`BillingResponseCode::Error`].
    pub fn from_code(code: i32) -> Self {
        match code {
            0 => Self::Ok,
            1 => Self::UserCanceled,
            2 => Self::ServiceUnavailable,
            3 => Self::BillingUnavailable,
            4 => Self::ItemUnavailable,
            5 => Self::DeveloperError,
            7 => Self::ItemAlreadyOwned,
            8 => Self::ItemNotOwned,
            12 => Self::NetworkError,
            -1 => Self::ServiceDisconnected,
            -2 => Self::FeatureNotSupported,
            -3 => Self::ServiceTimeout,
            _ => Self::Error,
        }
    }
}

/// Status payload returned by every backend call.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct BillingResult {
    /// Backend response code.
    pub response_code: BillingResponseCode,
    /// Free-form diagnostic text from the backend. May be empty.
    pub debug_message: String,
}

impl BillingResult {
    pub fn new(response_code: BillingResponseCode, debug_message: impl Into<String>) -> Self {
        Self {
            response_code,
            debug_message: debug_message.into(),
        }
    }

    pub fn ok() -> Self {
        Self::new(BillingResponseCode::Ok, "")
    }

    pub fn is_ok(&self) -> bool {
        self.response_code == BillingResponseCode::Ok
    }
}

impl From<BillingResponseCode> for BillingResult {
    fn from(response_code: BillingResponseCode) -> Self {
        Self::new(response_code, "")
    }
}

/// Product family in the backend catalog.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
pub enum ProductType {
    /// One-time (consumable or non-consumable) products.
    InApp,
    /// Subscriptions. Never queried by the runtime.
    Subs,
}

/// Opaque backend reference carried alongside product details.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ProductHandle(pub String);

/// Catalog entry returned by a product query.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ProductDetails {
    pub product_id: String,
    pub title: String,
    pub description: String,
    /// Localized price string, absent for products without a one-time offer.
    pub formatted_price: Option<String>,
    pub product_type: ProductType,
    pub handle: ProductHandle,
}

impl ProductDetails {
    /// Build a one-time product entry.
    pub fn in_app(
        product_id: impl Into<String>,
        title: impl Into<String>,
        formatted_price: impl Into<String>,
    ) -> Self {
        let product_id = product_id.into();
        Self {
            handle: ProductHandle(format!("inapp:{product_id}")),
            product_id,
            title: title.into(),
            description: String::new(),
            formatted_price: Some(formatted_price.into()),
            product_type: ProductType::InApp,
        }
    }
}

/// Purchase lifecycle as reported by the backend.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub enum PurchaseState {
    /// Payment has not completed yet (for example a deferred payment method).
    Pending,
    Purchased,
    Cancelled,
}

/// Purchase record reported by purchase queries and purchase updates.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Purchase {
    pub purchase_token: String,
    pub order_id: Option<String>,
    /// Product IDs covered by this purchase.
    pub products: Vec<String>,
    pub state: PurchaseState,
    pub acknowledged: bool,
    /// Purchase time in milliseconds since Unix epoch.
    pub purchase_time_ms: u64,
}

impl Purchase {
    /// Build an unacknowledged, completed purchase of a single product.
    pub fn purchased(purchase_token: impl Into<String>, product_id: impl Into<String>) -> Self {
        Self {
            purchase_token: purchase_token.into(),
            order_id: None,
            products: vec![product_id.into()],
            state: PurchaseState::Purchased,
            acknowledged: false,
            purchase_time_ms: 0,
        }
    }

    pub fn with_state(mut self, state: PurchaseState) -> Self {
        self.state = state;
        self
    }

    pub fn with_acknowledged(mut self, acknowledged: bool) -> Self {
        self.acknowledged = acknowledged;
        self
    }

    pub fn contains_product(&self, product_id: &str) -> bool {
        self.products.iter().any(|id| id == product_id)
    }
}

/// The part of a purchase the runtime acts on while resolving a purchase request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PendingPurchase {
    pub purchase_token: String,
    pub acknowledged: bool,
    pub state: PurchaseState,
}

impl From<&Purchase> for PendingPurchase {
    fn from(purchase: &Purchase) -> Self {
        Self {
            purchase_token: purchase.purchase_token.clone(),
            acknowledged: purchase.acknowledged,
            state: purchase.state,
        }
    }
}

/// Presentation-layer handle the backend needs to show its purchase UI.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct UiHandle(pub String);

impl UiHandle {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }
}

/// Runtime tuning for the billing actor.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RuntimeConfig {
    /// Reconnect backoff applied after disconnections and failed handshakes.
    pub retry_policy: RetryPolicy,
    /// Capacity of the facade command queue.
    pub command_buffer: usize,
    /// Capacity of the lifecycle event broadcast.
    pub event_buffer: usize,
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self {
            retry_policy: RetryPolicy::default(),
            command_buffer: 64,
            event_buffer: 256,
        }
    }
}

/// Unsolicited notifications pushed by the backend into the runtime inbox.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BackendNotification {
    /// The backend service connection dropped.
    ServiceDisconnected,
    /// Result of a purchase UI flow (or a purchase completed out of band).
    PurchasesUpdated {
        result: BillingResult,
        /// `None` when the backend delivered no purchase list.
        purchases: Option<Vec<Purchase>>,
    },
}

/// Requests accepted by the billing runtime.
///
/// Every request carries the single-shot sender its result is delivered on.
#[derive(Debug)]
pub enum BillingCommand {
    /// Establish (or join) the backend connection.
    Connect { reply: ResultSender<bool> },
    /// Release the backend handle.
    Disconnect { reply: ResultSender<()> },
    /// Query the one-time catalog and resolve with the first product.
    QueryCatalog {
        product_ids: Vec<String>,
        reply: ResultSender<Result<ProductDetails, BillingError>>,
    },
    /// Check whether an owned one-time purchase covers a product.
    IsPurchased {
        product_id: String,
        reply: ResultSender<bool>,
    },
    /// Launch the purchase UI and wait for the purchase update.
    Purchase {
        slot_id: u64,
        ui: UiHandle,
        product: ProductDetails,
        reply: ResultSender<bool>,
    },
    /// Consume the most recently recorded purchase token.
    Consume { reply: ResultSender<bool> },
}

/// Lifecycle events broadcast to observers.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub enum BillingEvent {
    ConnectionStateChanged {
        state: ConnectionState,
    },
    /// A reconnect attempt has been scheduled.
    ReconnectScheduled {
        /// 1-based attempt number.
        attempt: u32,
        delay_ms: u64,
    },
    /// No reconnect attempts remain; the connection stays down.
    ReconnectExhausted {
        attempts: u32,
    },
    /// The purchase UI launched and a purchase result slot is registered.
    PurchaseFlowLaunched {
        product_id: String,
    },
    /// A purchase update was resolved.
    PurchaseResolved {
        success: bool,
        purchase_token: Option<String>,
    },
    /// A request finished with a non-OK backend status.
    OperationFailed {
        /// Operation name, for example `query_catalog`.
        operation: String,
        /// Stable error code.
        code: String,
        response_code: Option<BillingResponseCode>,
        /// Indicates whether retrying after reconnecting may help.
        recoverable: bool,
    },
}
