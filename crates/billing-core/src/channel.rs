use std::{
    fmt,
    future::Future,
    pin::Pin,
    task::{Context, Poll},
};

use thiserror::Error;
use tokio::sync::{broadcast, mpsc, oneshot};

use crate::types::{BackendNotification, BillingCommand, BillingEvent};

/// Broadcast event stream type used by lifecycle observers.
pub type EventStream = broadcast::Receiver<BillingEvent>;

/// Errors returned by billing channel operations.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum BillingChannelError {
    /// The command receiver side is closed.
    #[error("command channel is closed")]
    CommandChannelClosed,
    /// The producer went away without delivering a result.
    #[error("result was dropped before delivery")]
    ResultDropped,
}

/// Create a single-shot result channel.
pub fn result_channel<T>() -> (ResultSender<T>, ResultReceiver<T>) {
    let (tx, rx) = oneshot::channel();
    (
        ResultSender { tx: Some(tx) },
        ResultReceiver {
            rx,
            on_cancel: None,
        },
    )
}

/// Producer half of a single-shot result channel.
///
/// The first [`deliver`](Self::deliver) consumes the underlying sender; every
/// later call is a no-op.
pub struct ResultSender<T> {
    tx: Option<oneshot::Sender<T>>,
}

impl<T> ResultSender<T> {
    /// Deliver `value` if nothing was delivered yet.
    ///
    /// Returns `true` only when the waiting side actually received the value.
    pub fn deliver(&mut self, value: T) -> bool {
        match self.tx.take() {
            Some(tx) => tx.send(value).is_ok(),
            None => false,
        }
    }

    pub fn is_delivered(&self) -> bool {
        self.tx.is_none()
    }

    /// Whether a caller is still waiting on the other half.
    pub fn is_waiting(&self) -> bool {
        self.tx.as_ref().is_some_and(|tx| !tx.is_closed())
    }
}

impl<T> fmt::Debug for ResultSender<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ResultSender")
            .field("delivered", &self.is_delivered())
            .finish()
    }
}

type CancelHook = Box<dyn FnOnce() + Send + 'static>;

/// Waiting half of a single-shot result channel.
///
/// Resolves to the delivered value, or [`BillingChannelError::ResultDropped`]
/// when the sender is dropped first. A cancel hook registered with
/// [`on_cancel`](Self::on_cancel) runs if the receiver is dropped before it
/// resolves.
pub struct ResultReceiver<T> {
    rx: oneshot::Receiver<T>,
    on_cancel: Option<CancelHook>,
}

impl<T> ResultReceiver<T> {
    /// Register cleanup for a caller that stops waiting.
    pub fn on_cancel(mut self, cleanup: impl FnOnce() + Send + 'static) -> Self {
        self.on_cancel = Some(Box::new(cleanup));
        self
    }
}

impl<T> Future for ResultReceiver<T> {
    type Output = Result<T, BillingChannelError>;

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        match Pin::new(&mut self.rx).poll(cx) {
            Poll::Pending => Poll::Pending,
            Poll::Ready(result) => {
                self.on_cancel = None;
                Poll::Ready(result.map_err(|_| BillingChannelError::ResultDropped))
            }
        }
    }
}

impl<T> Drop for ResultReceiver<T> {
    fn drop(&mut self) {
        if let Some(cleanup) = self.on_cancel.take() {
            cleanup();
        }
    }
}

impl<T> fmt::Debug for ResultReceiver<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ResultReceiver")
            .field("has_cancel_hook", &self.on_cancel.is_some())
            .finish()
    }
}

/// Command/event channel pair shared by the runtime and its handles.
#[derive(Clone, Debug)]
pub struct BillingChannels {
    command_tx: mpsc::Sender<BillingCommand>,
    event_tx: broadcast::Sender<BillingEvent>,
}

impl BillingChannels {
    /// Create a new channel set and return it with the command receiver.
    pub fn new(
        command_buffer: usize,
        event_buffer: usize,
    ) -> (Self, mpsc::Receiver<BillingCommand>) {
        let (command_tx, command_rx) = mpsc::channel(command_buffer.max(1));
        let (event_tx, _) = broadcast::channel(event_buffer.max(1));

        (
            Self {
                command_tx,
                event_tx,
            },
            command_rx,
        )
    }

    /// Clone the command sender.
    pub fn command_sender(&self) -> mpsc::Sender<BillingCommand> {
        self.command_tx.clone()
    }

    /// Clone the event sender.
    pub fn event_sender(&self) -> broadcast::Sender<BillingEvent> {
        self.event_tx.clone()
    }

    /// Subscribe to emitted lifecycle events.
    pub fn subscribe(&self) -> EventStream {
        self.event_tx.subscribe()
    }

    /// Send one command to the runtime.
    pub async fn send_command(&self, command: BillingCommand) -> Result<(), BillingChannelError> {
        self.command_tx
            .send(command)
            .await
            .map_err(|_| BillingChannelError::CommandChannelClosed)
    }

    /// Emit an event to all subscribers.
    ///
    /// Emission is best-effort; lagged subscribers are handled by `broadcast`.
    pub fn emit(&self, event: BillingEvent) {
        let _ = self.event_tx.send(event);
    }
}

/// Sink a backend uses to push unsolicited notifications into the runtime.
///
/// Never blocks, so it is safe to call from synchronous backend callbacks.
#[derive(Clone, Debug)]
pub struct BillingListener {
    tx: mpsc::UnboundedSender<BackendNotification>,
}

impl BillingListener {
    /// Create a listener and the receiver the runtime drains.
    pub fn channel() -> (Self, mpsc::UnboundedReceiver<BackendNotification>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self { tx }, rx)
    }

    /// Forward one notification. Returns `false` once the runtime is gone.
    pub fn notify(&self, notification: BackendNotification) -> bool {
        self.tx.send(notification).is_ok()
    }
}

#[cfg(test)]
mod tests {
    use std::sync::{
        Arc,
        atomic::{AtomicUsize, Ordering},
    };

    use super::*;
    use crate::types::ConnectionState;

    #[tokio::test]
    async fn delivers_result_exactly_once() {
        let (mut tx, rx) = result_channel::<bool>();
        assert!(!tx.is_delivered());
        assert!(tx.is_waiting());

        assert!(tx.deliver(true));
        assert!(tx.is_delivered());
        assert!(!tx.deliver(false), "second delivery must be a no-op");

        assert_eq!(rx.await, Ok(true));
    }

    #[tokio::test]
    async fn dropped_sender_resolves_as_result_dropped() {
        let (tx, rx) = result_channel::<bool>();
        drop(tx);
        assert_eq!(rx.await, Err(BillingChannelError::ResultDropped));
    }

    #[tokio::test]
    async fn delivery_to_abandoned_receiver_reports_failure() {
        let (mut tx, rx) = result_channel::<u8>();
        drop(rx);
        assert!(!tx.is_waiting());
        assert!(!tx.deliver(7));
        assert!(tx.is_delivered());
    }

    #[tokio::test]
    async fn cancel_hook_runs_only_when_receiver_is_abandoned() {
        let cancelled = Arc::new(AtomicUsize::new(0));

        let (_tx, rx) = result_channel::<bool>();
        let counter = cancelled.clone();
        let rx = rx.on_cancel(move || {
            counter.fetch_add(1, Ordering::SeqCst);
        });
        drop(rx);
        assert_eq!(cancelled.load(Ordering::SeqCst), 1);

        let (mut tx, rx) = result_channel::<bool>();
        let counter = cancelled.clone();
        let rx = rx.on_cancel(move || {
            counter.fetch_add(1, Ordering::SeqCst);
        });
        tx.deliver(true);
        assert_eq!(rx.await, Ok(true));
        assert_eq!(cancelled.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn sends_commands_to_receiver() {
        let (channels, mut rx) = BillingChannels::new(8, 8);
        let (reply, _reply_rx) = result_channel();
        channels
            .send_command(BillingCommand::IsPurchased {
                product_id: "premium_upgrade".into(),
                reply,
            })
            .await
            .expect("command send should work");

        let cmd = rx.recv().await.expect("receiver should have a command");
        match cmd {
            BillingCommand::IsPurchased { product_id, .. } => {
                assert_eq!(product_id, "premium_upgrade")
            }
            other => panic!("unexpected command: {other:?}"),
        }
    }

    #[tokio::test]
    async fn fans_out_events_to_subscribers() {
        let (channels, _) = BillingChannels::new(4, 16);
        let mut a = channels.subscribe();
        let mut b = channels.subscribe();

        channels.emit(BillingEvent::ConnectionStateChanged {
            state: ConnectionState::Connected,
        });

        let event_a = a.recv().await.expect("subscriber a should receive event");
        let event_b = b.recv().await.expect("subscriber b should receive event");
        assert_eq!(event_a, event_b);
    }

    #[tokio::test]
    async fn listener_stops_accepting_once_runtime_side_is_dropped() {
        let (listener, mut rx) = BillingListener::channel();
        assert!(listener.notify(BackendNotification::ServiceDisconnected));
        assert_eq!(
            rx.recv().await,
            Some(BackendNotification::ServiceDisconnected)
        );

        drop(rx);
        assert!(!listener.notify(BackendNotification::ServiceDisconnected));
    }
}
