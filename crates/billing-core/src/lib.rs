//! Core billing contract shared between the runtime, backends and frontends.
//!
//! This crate defines the command/event protocol, the connection lifecycle
//! model, reconnect backoff, purchase-update normalization, and the
//! single-shot result channel every request resolves through.

/// Single-shot result channel and command/event channel primitives.
pub mod channel;
/// Stable billing error types and response-code classification.
pub mod error;
/// Purchase-update and catalog normalization helpers.
pub mod normalization;
/// Reconnect backoff policy.
pub mod retry;
/// Connection lifecycle state machine.
pub mod state_machine;
/// Protocol types (commands, events, products, purchases).
pub mod types;

pub use channel::{
    BillingChannelError, BillingChannels, BillingListener, EventStream, ResultReceiver,
    ResultSender, result_channel,
};
pub use error::{BillingError, BillingErrorCategory, classify_response_code};
pub use normalization::{
    PurchaseDisposition, find_owned_purchase, first_product, normalize_operation_failure,
    normalize_purchase_update, purchase_disposition,
};
pub use retry::RetryPolicy;
pub use state_machine::{ConnectDecision, ConnectionStateMachine, ReconnectDecision, SetupOutcome};
pub use types::{
    BackendNotification, BillingCommand, BillingEvent, BillingResponseCode, BillingResult,
    ConnectionState, PendingPurchase, ProductDetails, ProductHandle, ProductType, Purchase,
    PurchaseState, RuntimeConfig, UiHandle,
};
