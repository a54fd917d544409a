use std::{
    sync::{
        Arc,
        atomic::{AtomicU64, Ordering},
    },
    time::Duration,
};

use billing_core::{
    BackendNotification, BillingChannels, BillingCommand, BillingError, BillingErrorCategory,
    BillingEvent, BillingListener, BillingResult, ConnectDecision, ConnectionState,
    ConnectionStateMachine, EventStream, PendingPurchase, ProductDetails, ProductType, Purchase,
    PurchaseDisposition, ReconnectDecision, ResultSender, RuntimeConfig, SetupOutcome, UiHandle,
    find_owned_purchase, first_product, normalize_operation_failure, normalize_purchase_update,
    purchase_disposition, result_channel,
};
use billing_platform::BillingBackend;
use tokio::sync::{broadcast, mpsc, watch};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

/// Cloneable facade the presentation layer talks to.
///
/// Every operation resolves at most once. Callers are expected to `connect`
/// before issuing catalog or purchase requests; requests sent while the
/// backend is down fail with the backend's status.
#[derive(Clone, Debug)]
pub struct BillingHandle {
    channels: BillingChannels,
    signal_tx: mpsc::UnboundedSender<RuntimeSignal>,
    state_rx: watch::Receiver<ConnectionState>,
    next_slot_id: Arc<AtomicU64>,
}

impl BillingHandle {
    /// Connect to the backend, or join the connection in progress.
    ///
    /// Resolves `true` once connected and `false` if reconnect attempts run
    /// out or the connection is torn down first.
    pub async fn connect(&self) -> Result<bool, BillingError> {
        self.request(|reply| BillingCommand::Connect { reply }).await
    }

    /// Release the backend connection and cancel any scheduled reconnect.
    pub async fn disconnect(&self) -> Result<(), BillingError> {
        self.request(|reply| BillingCommand::Disconnect { reply })
            .await
    }

    /// Query one-time products and return the first match.
    pub async fn query_catalog<I, S>(&self, product_ids: I) -> Result<ProductDetails, BillingError>
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let product_ids = product_ids.into_iter().map(Into::into).collect();
        self.request(|reply| BillingCommand::QueryCatalog { product_ids, reply })
            .await?
    }

    /// Check whether an owned one-time purchase covers `product_id`.
    ///
    /// A match becomes the purchase that [`consume`](Self::consume) targets.
    pub async fn is_purchased(&self, product_id: impl Into<String>) -> Result<bool, BillingError> {
        let product_id = product_id.into();
        self.request(|reply| BillingCommand::IsPurchased { product_id, reply })
            .await
    }

    /// Launch the purchase UI and wait for the purchase update.
    ///
    /// Only one purchase receives updates: a later call takes over the result
    /// slot and this one stays pending until it is dropped or the connection
    /// is torn down.
    pub async fn purchase(
        &self,
        ui: UiHandle,
        product: ProductDetails,
    ) -> Result<bool, BillingError> {
        let slot_id = self.next_slot_id.fetch_add(1, Ordering::Relaxed);
        let (reply, receiver) = result_channel();
        let signal_tx = self.signal_tx.clone();
        let receiver = receiver.on_cancel(move || {
            if signal_tx
                .send(RuntimeSignal::ReleasePurchaseSlot { slot_id })
                .is_err()
            {
                debug!(slot_id, "runtime gone; purchase slot release skipped");
            }
        });

        self.channels
            .send_command(BillingCommand::Purchase {
                slot_id,
                ui,
                product,
                reply,
            })
            .await
            .map_err(|_| BillingError::runtime_stopped())?;
        receiver.await.map_err(|_| BillingError::result_dropped())
    }

    /// Consume the most recently recorded purchase so it can be bought again.
    pub async fn consume(&self) -> Result<bool, BillingError> {
        self.request(|reply| BillingCommand::Consume { reply }).await
    }

    /// Last connection state published by the runtime.
    pub fn state(&self) -> ConnectionState {
        *self.state_rx.borrow()
    }

    pub fn subscribe(&self) -> EventStream {
        self.channels.subscribe()
    }

    async fn request<T>(
        &self,
        build: impl FnOnce(ResultSender<T>) -> BillingCommand,
    ) -> Result<T, BillingError> {
        let (reply, receiver) = result_channel();
        self.channels
            .send_command(build(reply))
            .await
            .map_err(|_| BillingError::runtime_stopped())?;
        receiver.await.map_err(|_| BillingError::result_dropped())
    }
}

/// Spawn the billing runtime on the current tokio runtime.
///
/// The runtime registers itself as the backend's listener and owns the backend
/// until every handle is dropped.
pub fn spawn_runtime(backend: Arc<dyn BillingBackend>, config: RuntimeConfig) -> BillingHandle {
    let (runtime, handle) = build_runtime(backend, config);
    tokio::spawn(async move {
        runtime.run().await;
    });
    handle
}

fn build_runtime(
    backend: Arc<dyn BillingBackend>,
    config: RuntimeConfig,
) -> (BillingRuntime, BillingHandle) {
    let (channels, command_rx) = BillingChannels::new(config.command_buffer, config.event_buffer);
    let (listener, notification_rx) = BillingListener::channel();
    backend.register_listener(listener);

    let (state_tx, state_rx) = watch::channel(ConnectionState::Disconnected);
    let (signal_tx, signal_rx) = mpsc::unbounded_channel();
    let runtime = BillingRuntime {
        backend,
        state_machine: ConnectionStateMachine::new(config.retry_policy),
        event_tx: channels.event_sender(),
        state_tx,
        command_rx,
        notification_rx,
        signal_tx: signal_tx.clone(),
        signal_rx,
        reconnect_timer: None,
        reconnect_generation: 0,
        handshake_generation: 0,
        connect_waiters: Vec::new(),
        purchase_slot: None,
        superseded_slots: Vec::new(),
        active_token: None,
    };
    let handle = BillingHandle {
        channels,
        signal_tx,
        state_rx,
        next_slot_id: Arc::new(AtomicU64::new(1)),
    };
    (runtime, handle)
}

/// Internal inbox traffic produced by runtime-owned tasks and cancelled callers.
#[derive(Debug)]
enum RuntimeSignal {
    HandshakeFinished {
        generation: u64,
        result: BillingResult,
    },
    ReconnectDue {
        generation: u64,
    },
    ReleasePurchaseSlot {
        slot_id: u64,
    },
}

#[derive(Debug)]
struct PurchaseSlot {
    id: u64,
    reply: ResultSender<bool>,
}

struct BillingRuntime {
    backend: Arc<dyn BillingBackend>,
    state_machine: ConnectionStateMachine,
    event_tx: broadcast::Sender<BillingEvent>,
    state_tx: watch::Sender<ConnectionState>,
    command_rx: mpsc::Receiver<BillingCommand>,
    notification_rx: mpsc::UnboundedReceiver<BackendNotification>,
    signal_tx: mpsc::UnboundedSender<RuntimeSignal>,
    signal_rx: mpsc::UnboundedReceiver<RuntimeSignal>,
    reconnect_timer: Option<CancellationToken>,
    reconnect_generation: u64,
    handshake_generation: u64,
    connect_waiters: Vec<ResultSender<bool>>,
    purchase_slot: Option<PurchaseSlot>,
    // Replaced purchase callers; kept alive without delivery until they
    // cancel or the connection is torn down.
    superseded_slots: Vec<PurchaseSlot>,
    active_token: Option<String>,
}

impl BillingRuntime {
    async fn run(mut self) {
        info!("billing runtime started");
        loop {
            tokio::select! {
                biased;
                Some(signal) = self.signal_rx.recv() => {
                    self.handle_signal(signal);
                }
                Some(notification) = self.notification_rx.recv() => {
                    self.handle_notification(notification).await;
                }
                command = self.command_rx.recv() => {
                    let Some(command) = command else {
                        break;
                    };
                    self.handle_command(command).await;
                }
            }
        }

        self.cancel_reconnect();
        self.backend.end_connection();
        info!("billing runtime stopped");
    }

    async fn handle_command(&mut self, command: BillingCommand) {
        match command {
            BillingCommand::Connect { reply } => {
                self.connect_waiters.retain(ResultSender::is_waiting);
                self.connect_waiters.push(reply);
                self.start_connection();
            }
            BillingCommand::Disconnect { mut reply } => {
                self.handle_disconnect();
                reply.deliver(());
            }
            BillingCommand::QueryCatalog {
                product_ids,
                mut reply,
            } => {
                let outcome = self.handle_query_catalog(product_ids).await;
                reply.deliver(outcome);
            }
            BillingCommand::IsPurchased {
                product_id,
                mut reply,
            } => {
                let owned = self.handle_is_purchased(&product_id).await;
                reply.deliver(owned);
            }
            BillingCommand::Purchase {
                slot_id,
                ui,
                product,
                reply,
            } => self.handle_purchase(slot_id, ui, product, reply),
            BillingCommand::Consume { mut reply } => {
                let consumed = self.handle_consume().await;
                reply.deliver(consumed);
            }
        }
    }

    fn handle_signal(&mut self, signal: RuntimeSignal) {
        match signal {
            RuntimeSignal::HandshakeFinished { generation, result } => {
                if generation != self.handshake_generation {
                    debug!(
                        generation,
                        response_code = ?result.response_code,
                        "dropping result of abandoned handshake"
                    );
                    return;
                }
                self.finish_handshake(result);
            }
            RuntimeSignal::ReconnectDue { generation } => {
                if generation != self.reconnect_generation {
                    debug!(generation, "dropping stale reconnect tick");
                    return;
                }
                self.reconnect_timer = None;
                self.start_connection();
            }
            RuntimeSignal::ReleasePurchaseSlot { slot_id } => {
                self.release_purchase_slot(slot_id);
            }
        }
    }

    async fn handle_notification(&mut self, notification: BackendNotification) {
        match notification {
            BackendNotification::ServiceDisconnected => {
                warn!("billing service disconnected");
                self.abandon_handshake();
                let (decision, events) = self.state_machine.on_disconnected();
                self.commit_events(events);
                self.apply_reconnect(decision);
            }
            BackendNotification::PurchasesUpdated { result, purchases } => {
                self.handle_purchases_updated(result, purchases).await;
            }
        }
    }

    fn start_connection(&mut self) {
        let (decision, events) = self.state_machine.begin_connect();
        self.commit_events(events);

        match decision {
            ConnectDecision::AlreadyConnected => {
                debug!("billing backend already connected");
                self.resolve_connect_waiters(true);
            }
            ConnectDecision::AwaitInFlight => {
                debug!(
                    waiters = self.connect_waiters.len(),
                    "joining in-flight billing handshake"
                );
            }
            ConnectDecision::StartHandshake => {
                self.handshake_generation = self.handshake_generation.wrapping_add(1);
                let generation = self.handshake_generation;
                info!(
                    attempt = self.state_machine.attempt_count(),
                    "starting billing connection"
                );

                let backend = Arc::clone(&self.backend);
                let signal_tx = self.signal_tx.clone();
                tokio::spawn(async move {
                    let result = backend.start_connection().await;
                    let _ = signal_tx.send(RuntimeSignal::HandshakeFinished {
                        generation,
                        result,
                    });
                });
            }
        }
    }

    fn abandon_handshake(&mut self) {
        self.handshake_generation = self.handshake_generation.wrapping_add(1);
    }

    fn finish_handshake(&mut self, result: BillingResult) {
        match self.state_machine.on_setup_finished(result.is_ok()) {
            Ok((SetupOutcome::Connected, events)) => {
                info!("connected to billing backend");
                self.commit_events(events);
                self.resolve_connect_waiters(true);
            }
            Ok((SetupOutcome::Lost(decision), events)) => {
                error!(
                    response_code = ?result.response_code,
                    debug_message = %result.debug_message,
                    "billing setup failed"
                );
                self.commit_events(events);
                self.apply_reconnect(decision);
            }
            Err(err) => {
                warn!(error = %err, "ignoring billing setup result");
            }
        }
    }

    fn apply_reconnect(&mut self, decision: ReconnectDecision) {
        match decision {
            ReconnectDecision::Retry { attempt, delay } => {
                warn!(
                    attempt,
                    max_attempts = self.state_machine.policy().max_attempts(),
                    delay_ms = delay.as_millis() as u64,
                    "reconnecting to billing backend"
                );
                self.schedule_reconnect(delay);
            }
            ReconnectDecision::GiveUp { attempts } => {
                error!(attempts, "failed to reconnect to billing backend; giving up");
                self.resolve_connect_waiters(false);
            }
            ReconnectDecision::Ignored => {
                debug!(
                    state = ?self.state_machine.state(),
                    "connection loss ignored"
                );
            }
        }
    }

    fn schedule_reconnect(&mut self, delay: Duration) {
        self.cancel_reconnect();
        let generation = self.reconnect_generation;
        let stop = CancellationToken::new();
        let stop_child = stop.child_token();
        let signal_tx = self.signal_tx.clone();

        tokio::spawn(async move {
            tokio::select! {
                _ = stop_child.cancelled() => {}
                _ = tokio::time::sleep(delay) => {
                    let _ = signal_tx.send(RuntimeSignal::ReconnectDue { generation });
                }
            }
        });

        self.reconnect_timer = Some(stop);
    }

    fn cancel_reconnect(&mut self) {
        self.reconnect_generation = self.reconnect_generation.wrapping_add(1);
        if let Some(stop) = self.reconnect_timer.take() {
            stop.cancel();
        }
    }

    fn handle_disconnect(&mut self) {
        info!("ending billing connection");
        self.cancel_reconnect();
        self.abandon_handshake();
        self.backend.end_connection();
        let events = self.state_machine.teardown();
        self.commit_events(events);
        self.resolve_connect_waiters(false);

        if !self.superseded_slots.is_empty() {
            debug!(
                count = self.superseded_slots.len(),
                "dropping replaced purchase requests"
            );
            self.superseded_slots.clear();
        }
    }

    async fn handle_query_catalog(
        &mut self,
        product_ids: Vec<String>,
    ) -> Result<ProductDetails, BillingError> {
        debug!(?product_ids, "querying product catalog");
        let (result, products) = self
            .backend
            .query_product_details(&product_ids, ProductType::InApp)
            .await;

        if !result.is_ok() {
            let err = BillingError::from_billing_result(
                BillingErrorCategory::Query,
                "catalog_query_failed",
                &result,
            );
            error!(
                response_code = ?result.response_code,
                debug_message = %result.debug_message,
                "failed to fetch products"
            );
            self.emit_failure("query_catalog", &err);
            return Err(err);
        }

        for product in &products {
            debug!(
                product_id = %product.product_id,
                title = %product.title,
                price = ?product.formatted_price,
                "catalog product"
            );
        }

        match first_product(products) {
            Some(product) => Ok(product),
            None => {
                let err = BillingError::new(
                    BillingErrorCategory::NotFound,
                    "product_not_found",
                    format!("no one-time product matched {product_ids:?}"),
                );
                warn!(?product_ids, "catalog query returned no products");
                self.emit_failure("query_catalog", &err);
                Err(err)
            }
        }
    }

    async fn handle_is_purchased(&mut self, product_id: &str) -> bool {
        let (result, purchases) = self.backend.query_purchases(ProductType::InApp).await;
        if !result.is_ok() {
            let err = BillingError::from_billing_result(
                BillingErrorCategory::Query,
                "purchase_query_failed",
                &result,
            );
            error!(
                response_code = ?result.response_code,
                debug_message = %result.debug_message,
                "failed to query purchases"
            );
            self.emit_failure("is_purchased", &err);
            return false;
        }

        match find_owned_purchase(&purchases, product_id) {
            Some(purchase) => {
                debug!(
                    product_id,
                    token = %purchase.purchase_token,
                    "owned purchase found"
                );
                self.active_token = Some(purchase.purchase_token.clone());
                true
            }
            None => {
                debug!(product_id, "no owned purchase for product");
                false
            }
        }
    }

    fn handle_purchase(
        &mut self,
        slot_id: u64,
        ui: UiHandle,
        product: ProductDetails,
        mut reply: ResultSender<bool>,
    ) {
        if !reply.is_waiting() {
            debug!(slot_id, "purchase caller left before launch");
            return;
        }

        info!(product_id = %product.product_id, "launching purchase flow");
        let result = self.backend.launch_billing_flow(&ui, &product);
        if !result.is_ok() {
            let err = BillingError::from_billing_result(
                BillingErrorCategory::PurchaseLaunch,
                "purchase_launch_failed",
                &result,
            );
            warn!(
                response_code = ?result.response_code,
                debug_message = %result.debug_message,
                "purchase flow failed to launch"
            );
            self.emit_failure("purchase", &err);
            reply.deliver(false);
            return;
        }

        self.superseded_slots.retain(|slot| slot.reply.is_waiting());
        if let Some(previous) = self.purchase_slot.take()
            && previous.reply.is_waiting()
        {
            warn!(
                replaced_slot = previous.id,
                slot_id, "replacing unresolved purchase request"
            );
            self.superseded_slots.push(previous);
        }
        self.purchase_slot = Some(PurchaseSlot { id: slot_id, reply });
        self.emit(BillingEvent::PurchaseFlowLaunched {
            product_id: product.product_id,
        });
    }

    fn release_purchase_slot(&mut self, slot_id: u64) {
        if self
            .purchase_slot
            .as_ref()
            .is_some_and(|slot| slot.id == slot_id)
        {
            debug!(slot_id, "purchase caller went away; releasing result slot");
            self.purchase_slot = None;
            return;
        }
        self.superseded_slots.retain(|slot| slot.id != slot_id);
    }

    async fn handle_purchases_updated(
        &mut self,
        result: BillingResult,
        purchases: Option<Vec<Purchase>>,
    ) {
        match normalize_purchase_update(&result, purchases) {
            Ok(purchases) => {
                info!(count = purchases.len(), "purchase update received");
                for purchase in purchases {
                    self.settle_purchase(purchase).await;
                }
            }
            Err(err) => {
                warn!(code = %err.code, message = %err.message, "purchase failed");
                self.emit_failure("purchase", &err);
                self.resolve_purchase(false, None);
            }
        }
    }

    async fn settle_purchase(&mut self, purchase: Purchase) {
        debug!(token = %purchase.purchase_token, "handling purchase");
        self.active_token = Some(purchase.purchase_token.clone());

        match purchase_disposition(&PendingPurchase::from(&purchase)) {
            PurchaseDisposition::Acknowledge { purchase_token } => {
                debug!(token = %purchase_token, "acknowledging purchase");
                let result = self.backend.acknowledge_purchase(&purchase_token).await;
                if result.is_ok() {
                    info!(token = %purchase_token, "purchase acknowledged");
                    self.resolve_purchase(true, Some(purchase_token));
                } else {
                    let err = BillingError::from_billing_result(
                        BillingErrorCategory::Acknowledge,
                        "acknowledge_failed",
                        &result,
                    );
                    error!(
                        response_code = ?result.response_code,
                        debug_message = %result.debug_message,
                        "acknowledge failed; purchase stays unacknowledged"
                    );
                    self.emit_failure("acknowledge", &err);
                    self.resolve_purchase(false, None);
                }
            }
            PurchaseDisposition::AlreadyAcknowledged => {
                debug!(token = %purchase.purchase_token, "purchase already acknowledged");
                self.resolve_purchase(true, Some(purchase.purchase_token));
            }
            PurchaseDisposition::NotCompleted { state } => {
                warn!(?state, "purchase not completed");
                self.resolve_purchase(false, None);
            }
        }
    }

    fn resolve_purchase(&mut self, success: bool, purchase_token: Option<String>) {
        self.emit(BillingEvent::PurchaseResolved {
            success,
            purchase_token,
        });

        match self.purchase_slot.take() {
            Some(mut slot) => {
                if !slot.reply.deliver(success) {
                    debug!(slot_id = slot.id, "purchase caller no longer waiting");
                }
            }
            None => debug!(success, "no purchase request waiting for this update"),
        }
    }

    async fn handle_consume(&mut self) -> bool {
        let Some(token) = self.active_token.clone() else {
            warn!("no purchase token recorded; nothing to consume");
            return false;
        };

        let result = self.backend.consume_purchase(&token).await;
        debug!(
            response_code = ?result.response_code,
            debug_message = %result.debug_message,
            "consume result"
        );
        if result.is_ok() {
            info!(token = %token, "purchase consumed");
            return true;
        }

        let err = BillingError::from_billing_result(
            BillingErrorCategory::Consume,
            "consume_failed",
            &result,
        );
        self.emit_failure("consume", &err);
        false
    }

    fn resolve_connect_waiters(&mut self, connected: bool) {
        for mut waiter in self.connect_waiters.drain(..) {
            waiter.deliver(connected);
        }
    }

    fn commit_events(&mut self, events: Vec<BillingEvent>) {
        for event in events {
            if let BillingEvent::ConnectionStateChanged { state } = &event {
                self.state_tx.send_replace(*state);
            }
            self.emit(event);
        }
    }

    fn emit_failure(&self, operation: &str, error: &BillingError) {
        self.emit(normalize_operation_failure(operation, error));
    }

    fn emit(&self, event: BillingEvent) {
        let _ = self.event_tx.send(event);
    }
}
