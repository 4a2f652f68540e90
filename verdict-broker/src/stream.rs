//! Shared attribute streams
//!
//! An [`AttributeStream`] is the long-lived object behind one attribute
//! invocation: it multicasts values from a single PIP subscription to every
//! interested policy evaluation, replays the last value to late subscribers,
//! and tears the PIP connection down only after a grace period with no
//! subscribers.

use std::pin::Pin;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::task::{Context, Poll};
use std::time::Duration;

use futures_util::future;
use futures_util::stream::{self, Stream, StreamExt};
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tokio_stream::wrappers::BroadcastStream;
use tracing::debug;
use verdict_core::Value;

use crate::invocation::AttributeFinderInvocation;
use crate::pip::PolicyInformationPoint;
use crate::pipeline::run_pipeline;
use crate::streams::ValueStream;

const FANOUT_CAPACITY: usize = 64;

/// Callback run once, when a stream is finally disposed. The broker installs
/// a non-owning index-removal here, which breaks the
/// stream → cleanup → index → stream cycle.
pub(crate) type CleanupFn = Box<dyn Fn() + Send + Sync>;

pub(crate) struct StreamShared {
    tx: broadcast::Sender<Value>,
    last: Mutex<Option<Value>>,
    subscribers: AtomicUsize,
    disposed: AtomicBool,
    connection: Mutex<Option<JoinHandle<()>>>,
    grace_period: Duration,
    cleanup: Mutex<Option<CleanupFn>>,
}

impl StreamShared {
    /// Cache and fan out a value. Safe to call with no live receivers.
    pub(crate) fn publish(&self, value: Value) {
        *self.last.lock().expect("attribute stream cache lock poisoned") = Some(value.clone());
        let _ = self.tx.send(value);
    }

    /// Dispose if no subscriber re-appeared. Idempotent; double-dispose is a
    /// no-op.
    fn dispose_if_idle(&self) {
        if self.subscribers.load(Ordering::SeqCst) > 0 {
            return;
        }
        if self.disposed.swap(true, Ordering::SeqCst) {
            return;
        }
        if let Some(handle) = self
            .connection
            .lock()
            .expect("attribute stream connection lock poisoned")
            .take()
        {
            handle.abort();
        }
        if let Some(cleanup) = self
            .cleanup
            .lock()
            .expect("attribute stream cleanup lock poisoned")
            .take()
        {
            cleanup();
        }
    }
}

/// A cached, multicast attribute stream keyed by its invocation.
pub struct AttributeStream {
    id: u64,
    invocation: AttributeFinderInvocation,
    shared: Arc<StreamShared>,
}

impl AttributeStream {
    pub(crate) fn new(id: u64, invocation: AttributeFinderInvocation, grace_period: Duration) -> Self {
        let (tx, _) = broadcast::channel(FANOUT_CAPACITY);
        Self {
            id,
            invocation,
            shared: Arc::new(StreamShared {
                tx,
                last: Mutex::new(None),
                subscribers: AtomicUsize::new(0),
                disposed: AtomicBool::new(false),
                connection: Mutex::new(None),
                grace_period,
                cleanup: Mutex::new(None),
            }),
        }
    }

    pub(crate) fn id(&self) -> u64 {
        self.id
    }

    pub fn invocation(&self) -> &AttributeFinderInvocation {
        &self.invocation
    }

    pub fn is_disposed(&self) -> bool {
        self.shared.disposed.load(Ordering::SeqCst)
    }

    pub(crate) fn set_cleanup(&self, cleanup: CleanupFn) {
        *self
            .shared
            .cleanup
            .lock()
            .expect("attribute stream cleanup lock poisoned") = Some(cleanup);
    }

    /// Publish a value directly onto the stream (missing-PIP and disconnect
    /// errors take this path).
    pub fn publish(&self, value: Value) {
        self.shared.publish(value);
    }

    /// Connect (or reconnect) the stream to a PIP. The previous pump task is
    /// aborted; the replay cache is preserved so existing subscribers keep
    /// their last value.
    pub fn connect(&self, pip: Arc<dyn PolicyInformationPoint>) {
        debug!(invocation = %self.invocation, "connecting attribute stream");
        let pump = tokio::spawn(run_pipeline(
            pip,
            self.invocation.clone(),
            Arc::downgrade(&self.shared),
        ));
        let previous = self
            .shared
            .connection
            .lock()
            .expect("attribute stream connection lock poisoned")
            .replace(pump);
        if let Some(previous) = previous {
            previous.abort();
        }
    }

    /// Abort the PIP connection and surface the reason as an error value.
    /// Subscribers stay attached; a later matching PIP may reconnect.
    pub fn disconnect(&self, reason: &str) {
        debug!(invocation = %self.invocation, reason, "disconnecting attribute stream");
        if let Some(handle) = self
            .shared
            .connection
            .lock()
            .expect("attribute stream connection lock poisoned")
            .take()
        {
            handle.abort();
        }
        self.shared.publish(Value::error(reason));
    }

    /// Open a subscriber view: the cached last value (if any) followed by
    /// everything published from now on. Dropping the returned stream
    /// releases the subscription; when the last one goes, the grace timer
    /// starts.
    pub fn subscribe(&self) -> ValueStream {
        let shared = Arc::clone(&self.shared);
        shared.subscribers.fetch_add(1, Ordering::SeqCst);
        let rx = shared.tx.subscribe();
        let replay = shared
            .last
            .lock()
            .expect("attribute stream cache lock poisoned")
            .clone();
        let guard = SubscriberGuard { shared };
        let live = BroadcastStream::new(rx).filter_map(|r| future::ready(r.ok()));
        let inner: Pin<Box<dyn Stream<Item = Value> + Send>> =
            Box::pin(stream::iter(replay).chain(live));
        Box::pin(GuardedStream {
            inner,
            _guard: guard,
        })
    }
}

/// Tracks one live subscriber; on drop of the last one, arms the grace timer.
struct SubscriberGuard {
    shared: Arc<StreamShared>,
}

impl Drop for SubscriberGuard {
    fn drop(&mut self) {
        if self.shared.subscribers.fetch_sub(1, Ordering::SeqCst) != 1 {
            return;
        }
        let shared = Arc::clone(&self.shared);
        match tokio::runtime::Handle::try_current() {
            Ok(handle) => {
                handle.spawn(async move {
                    tokio::time::sleep(shared.grace_period).await;
                    shared.dispose_if_idle();
                });
            }
            // Outside a runtime there is nobody left to resubscribe.
            Err(_) => shared.dispose_if_idle(),
        }
    }
}

struct GuardedStream {
    inner: Pin<Box<dyn Stream<Item = Value> + Send>>,
    _guard: SubscriberGuard,
}

impl Stream for GuardedStream {
    type Item = Value;

    fn poll_next(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        self.get_mut().inner.as_mut().poll_next(cx)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::invocation::AttributeFinderInvocation;

    fn test_stream(grace: Duration) -> AttributeStream {
        AttributeStream::new(
            1,
            AttributeFinderInvocation::environment("pdp", "test.attr"),
            grace,
        )
    }

    #[tokio::test]
    async fn test_late_subscriber_gets_replayed_value() {
        let stream = test_stream(Duration::from_secs(3));
        stream.publish(Value::from(42));
        let mut view = stream.subscribe();
        assert_eq!(view.next().await, Some(Value::from(42)));
    }

    #[tokio::test]
    async fn test_multicast_to_two_subscribers() {
        let stream = test_stream(Duration::from_secs(3));
        let mut a = stream.subscribe();
        let mut b = stream.subscribe();
        stream.publish(Value::text("v"));
        assert_eq!(a.next().await, Some(Value::text("v")));
        assert_eq!(b.next().await, Some(Value::text("v")));
    }

    #[tokio::test(start_paused = true)]
    async fn test_grace_period_defers_disposal() {
        let stream = test_stream(Duration::from_secs(3));
        let view = stream.subscribe();
        drop(view);
        tokio::time::sleep(Duration::from_secs(1)).await;
        assert!(!stream.is_disposed());
        tokio::time::sleep(Duration::from_secs(3)).await;
        assert!(stream.is_disposed());
    }

    #[tokio::test(start_paused = true)]
    async fn test_resubscription_within_grace_keeps_stream_alive() {
        let stream = test_stream(Duration::from_secs(3));
        let view = stream.subscribe();
        drop(view);
        tokio::time::sleep(Duration::from_secs(1)).await;
        let _second = stream.subscribe();
        tokio::time::sleep(Duration::from_secs(5)).await;
        assert!(!stream.is_disposed());
    }

    #[tokio::test(start_paused = true)]
    async fn test_double_dispose_is_noop() {
        let stream = test_stream(Duration::from_millis(10));
        drop(stream.subscribe());
        drop(stream.subscribe());
        tokio::time::sleep(Duration::from_secs(1)).await;
        assert!(stream.is_disposed());
    }

    #[tokio::test]
    async fn test_disconnect_publishes_error() {
        let stream = test_stream(Duration::from_secs(3));
        let mut view = stream.subscribe();
        stream.disconnect("PIP disconnected: test.attr");
        let value = view.next().await.unwrap();
        assert_eq!(
            value.error_message(),
            Some("PIP disconnected: test.attr")
        );
    }
}
