use std::{
    collections::VecDeque,
    sync::{Arc, Mutex, MutexGuard, PoisonError},
    time::{SystemTime, UNIX_EPOCH},
};

use async_trait::async_trait;
use billing_core::{
    BackendNotification, BillingListener, BillingResponseCode, BillingResult, ProductDetails,
    ProductType, Purchase, PurchaseState, UiHandle,
};
use uuid::Uuid;

/// Boundary to the purchase-processing service.
///
/// One instance backs the runtime for its whole lifetime. Unsolicited events
/// (service disconnects, purchase updates) go through the listener registered
/// with [`register_listener`](Self::register_listener).
#[async_trait]
pub trait BillingBackend: Send + Sync {
    fn register_listener(&self, listener: BillingListener);

    async fn start_connection(&self) -> BillingResult;

    fn end_connection(&self);

    async fn query_product_details(
        &self,
        product_ids: &[String],
        product_type: ProductType,
    ) -> (BillingResult, Vec<ProductDetails>);

    async fn query_purchases(&self, product_type: ProductType) -> (BillingResult, Vec<Purchase>);

    /// Show the purchase UI. The outcome arrives later as a purchase update.
    fn launch_billing_flow(&self, ui: &UiHandle, product: &ProductDetails) -> BillingResult;

    async fn acknowledge_purchase(&self, purchase_token: &str) -> BillingResult;

    async fn consume_purchase(&self, purchase_token: &str) -> BillingResult;
}

/// Backend operations whose response code can be scripted.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ScriptedOperation {
    QueryProductDetails,
    QueryPurchases,
    LaunchBillingFlow,
    AcknowledgePurchase,
    ConsumePurchase,
}

/// What the scripted backend reports after a successful purchase UI launch.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LaunchOutcome {
    /// Report nothing; tests emit the update themselves.
    Deferred,
    /// Report a completed purchase.
    Purchased { acknowledged: bool },
    /// Report a purchase still waiting for payment.
    PendingPayment,
    /// Report a failed update without a purchase list.
    UpdateFailed(BillingResponseCode),
}

/// Per-operation call counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct BackendCallCounts {
    pub start_connection: usize,
    pub end_connection: usize,
    pub query_product_details: usize,
    pub query_purchases: usize,
    pub launch_billing_flow: usize,
    pub acknowledge_purchase: usize,
    pub consume_purchase: usize,
}

#[derive(Debug)]
struct ScriptState {
    listener: Option<BillingListener>,
    connected: bool,
    catalog: Vec<ProductDetails>,
    catalog_response: Option<Vec<ProductDetails>>,
    owned: Vec<Purchase>,
    connection_script: VecDeque<BillingResponseCode>,
    query_products_code: BillingResponseCode,
    query_purchases_code: BillingResponseCode,
    launch_code: BillingResponseCode,
    acknowledge_code: BillingResponseCode,
    consume_code: BillingResponseCode,
    launch_outcome: LaunchOutcome,
    acknowledged: Vec<String>,
    consumed: Vec<String>,
    calls: BackendCallCounts,
}

impl Default for ScriptState {
    fn default() -> Self {
        Self {
            listener: None,
            connected: false,
            catalog: Vec::new(),
            catalog_response: None,
            owned: Vec::new(),
            connection_script: VecDeque::new(),
            query_products_code: BillingResponseCode::Ok,
            query_purchases_code: BillingResponseCode::Ok,
            launch_code: BillingResponseCode::Ok,
            acknowledge_code: BillingResponseCode::Ok,
            consume_code: BillingResponseCode::Ok,
            launch_outcome: LaunchOutcome::Deferred,
            acknowledged: Vec::new(),
            consumed: Vec::new(),
            calls: BackendCallCounts::default(),
        }
    }
}

impl ScriptState {
    fn require_connection(&self) -> Result<(), BillingResult> {
        if self.connected {
            Ok(())
        } else {
            Err(BillingResult::new(
                BillingResponseCode::ServiceDisconnected,
                "service not connected",
            ))
        }
    }
}

/// In-memory backend with scripted responses.
///
/// Clones share state, so a test can keep one clone for scripting and
/// inspection while the runtime owns another.
#[derive(Debug, Clone, Default)]
pub struct ScriptedBillingBackend {
    state: Arc<Mutex<ScriptState>>,
}

impl ScriptedBillingBackend {
    pub fn with_product(self, product: ProductDetails) -> Self {
        self.lock().catalog.push(product);
        self
    }

    pub fn with_owned_purchase(self, purchase: Purchase) -> Self {
        self.lock().owned.push(purchase);
        self
    }

    /// Queue handshake results; once the queue is empty handshakes succeed.
    pub fn script_connection(&self, codes: impl IntoIterator<Item = BillingResponseCode>) {
        self.lock().connection_script.extend(codes);
    }

    /// Answer every catalog query with `products`, regardless of the requested IDs.
    pub fn set_catalog_response(&self, products: Vec<ProductDetails>) {
        self.lock().catalog_response = Some(products);
    }

    pub fn set_response(&self, operation: ScriptedOperation, code: BillingResponseCode) {
        let mut state = self.lock();
        let slot = match operation {
            ScriptedOperation::QueryProductDetails => &mut state.query_products_code,
            ScriptedOperation::QueryPurchases => &mut state.query_purchases_code,
            ScriptedOperation::LaunchBillingFlow => &mut state.launch_code,
            ScriptedOperation::AcknowledgePurchase => &mut state.acknowledge_code,
            ScriptedOperation::ConsumePurchase => &mut state.consume_code,
        };
        *slot = code;
    }

    pub fn set_launch_outcome(&self, outcome: LaunchOutcome) {
        self.lock().launch_outcome = outcome;
    }

    /// Drop the service connection and notify the runtime.
    pub fn emit_service_disconnected(&self) -> bool {
        let listener = {
            let mut state = self.lock();
            state.connected = false;
            state.listener.clone()
        };
        notify(listener, BackendNotification::ServiceDisconnected)
    }

    /// Push a purchase update as if the purchase UI finished.
    pub fn emit_purchases_updated(
        &self,
        result: BillingResult,
        purchases: Option<Vec<Purchase>>,
    ) -> bool {
        let listener = self.lock().listener.clone();
        notify(
            listener,
            BackendNotification::PurchasesUpdated { result, purchases },
        )
    }

    pub fn is_connected(&self) -> bool {
        self.lock().connected
    }

    pub fn call_counts(&self) -> BackendCallCounts {
        self.lock().calls
    }

    pub fn owned_purchases(&self) -> Vec<Purchase> {
        self.lock().owned.clone()
    }

    pub fn acknowledged_tokens(&self) -> Vec<String> {
        self.lock().acknowledged.clone()
    }

    pub fn consumed_tokens(&self) -> Vec<String> {
        self.lock().consumed.clone()
    }

    fn lock(&self) -> MutexGuard<'_, ScriptState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

#[async_trait]
impl BillingBackend for ScriptedBillingBackend {
    fn register_listener(&self, listener: BillingListener) {
        self.lock().listener = Some(listener);
    }

    async fn start_connection(&self) -> BillingResult {
        let mut state = self.lock();
        state.calls.start_connection += 1;
        let code = state
            .connection_script
            .pop_front()
            .unwrap_or(BillingResponseCode::Ok);
        state.connected = code == BillingResponseCode::Ok;
        code.into()
    }

    fn end_connection(&self) {
        let mut state = self.lock();
        state.calls.end_connection += 1;
        state.connected = false;
    }

    async fn query_product_details(
        &self,
        product_ids: &[String],
        product_type: ProductType,
    ) -> (BillingResult, Vec<ProductDetails>) {
        let mut state = self.lock();
        state.calls.query_product_details += 1;
        if let Err(result) = state.require_connection() {
            return (result, Vec::new());
        }
        if state.query_products_code != BillingResponseCode::Ok {
            return (state.query_products_code.into(), Vec::new());
        }

        let products = match &state.catalog_response {
            Some(products) => products.clone(),
            None => state
                .catalog
                .iter()
                .filter(|product| {
                    product.product_type == product_type
                        && product_ids.contains(&product.product_id)
                })
                .cloned()
                .collect(),
        };
        (BillingResult::ok(), products)
    }

    async fn query_purchases(&self, product_type: ProductType) -> (BillingResult, Vec<Purchase>) {
        let mut state = self.lock();
        state.calls.query_purchases += 1;
        if let Err(result) = state.require_connection() {
            return (result, Vec::new());
        }
        if state.query_purchases_code != BillingResponseCode::Ok {
            return (state.query_purchases_code.into(), Vec::new());
        }

        let purchases = state
            .owned
            .iter()
            .filter(|purchase| {
                purchase.products.iter().all(|id| {
                    state
                        .catalog
                        .iter()
                        .find(|product| &product.product_id == id)
                        .is_none_or(|product| product.product_type == product_type)
                })
            })
            .cloned()
            .collect();
        (BillingResult::ok(), purchases)
    }

    fn launch_billing_flow(&self, _ui: &UiHandle, product: &ProductDetails) -> BillingResult {
        let (listener, notification) = {
            let mut state = self.lock();
            state.calls.launch_billing_flow += 1;
            if let Err(result) = state.require_connection() {
                return result;
            }
            if state.launch_code != BillingResponseCode::Ok {
                return state.launch_code.into();
            }

            let outcome = state.launch_outcome;
            let notification = match outcome {
                LaunchOutcome::Deferred => None,
                LaunchOutcome::Purchased { acknowledged } => {
                    let purchase = new_purchase(product, PurchaseState::Purchased, acknowledged);
                    state.owned.push(purchase.clone());
                    Some(BackendNotification::PurchasesUpdated {
                        result: BillingResult::ok(),
                        purchases: Some(vec![purchase]),
                    })
                }
                LaunchOutcome::PendingPayment => {
                    let purchase = new_purchase(product, PurchaseState::Pending, false);
                    state.owned.push(purchase.clone());
                    Some(BackendNotification::PurchasesUpdated {
                        result: BillingResult::ok(),
                        purchases: Some(vec![purchase]),
                    })
                }
                LaunchOutcome::UpdateFailed(code) => Some(BackendNotification::PurchasesUpdated {
                    result: code.into(),
                    purchases: None,
                }),
            };
            (state.listener.clone(), notification)
        };

        if let Some(notification) = notification {
            notify(listener, notification);
        }
        BillingResult::ok()
    }

    async fn acknowledge_purchase(&self, purchase_token: &str) -> BillingResult {
        let mut state = self.lock();
        state.calls.acknowledge_purchase += 1;
        if let Err(result) = state.require_connection() {
            return result;
        }
        if state.acknowledge_code != BillingResponseCode::Ok {
            return state.acknowledge_code.into();
        }

        if let Some(purchase) = state
            .owned
            .iter_mut()
            .find(|purchase| purchase.purchase_token == purchase_token)
        {
            purchase.acknowledged = true;
        }
        state.acknowledged.push(purchase_token.to_owned());
        BillingResult::ok()
    }

    async fn consume_purchase(&self, purchase_token: &str) -> BillingResult {
        let mut state = self.lock();
        state.calls.consume_purchase += 1;
        if let Err(result) = state.require_connection() {
            return result;
        }
        if state.consume_code != BillingResponseCode::Ok {
            return state.consume_code.into();
        }

        let before = state.owned.len();
        state
            .owned
            .retain(|purchase| purchase.purchase_token != purchase_token);
        if state.owned.len() == before {
            return BillingResult::new(
                BillingResponseCode::ItemNotOwned,
                format!("no owned purchase for token {purchase_token}"),
            );
        }
        state.consumed.push(purchase_token.to_owned());
        BillingResult::ok()
    }
}

fn notify(listener: Option<BillingListener>, notification: BackendNotification) -> bool {
    listener.is_some_and(|listener| listener.notify(notification))
}

fn new_purchase(product: &ProductDetails, state: PurchaseState, acknowledged: bool) -> Purchase {
    let id = Uuid::new_v4();
    Purchase {
        purchase_token: format!("token-{id}"),
        order_id: Some(format!("GPA.{}", id.simple())),
        products: vec![product.product_id.clone()],
        state,
        acknowledged,
        purchase_time_ms: now_ms(),
    }
}

fn now_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|elapsed| elapsed.as_millis() as u64)
        .unwrap_or_default()
}
