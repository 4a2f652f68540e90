//! The attribute stream broker
//!
//! Owns the two maps behind attribute resolution: the per-fqn PIP registry
//! and the per-invocation stream index. Lock discipline: the registry lock is
//! always taken before the index lock; every path that needs both goes
//! through [`AttributeBroker::with_maps`]. The disposal cleanup takes only
//! the index lock and never the registry lock.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, Weak};
use std::time::Duration;

use tracing::debug;
use verdict_core::{RegistrationError, Value};

use crate::invocation::{AttributeFinderInvocation, AttributeFinderSpecification};
use crate::pip::PolicyInformationPoint;
use crate::stream::AttributeStream;
use crate::streams::ValueStream;

/// Default delay between the last unsubscribe and PIP teardown.
pub const DEFAULT_GRACE_PERIOD: Duration = Duration::from_secs(3);

struct RegisteredPip {
    spec: AttributeFinderSpecification,
    pip: Arc<dyn PolicyInformationPoint>,
}

#[derive(Default)]
struct PipRegistry {
    entries: Vec<RegisteredPip>,
}

impl PipRegistry {
    /// First registered specification matching the invocation wins; the
    /// collision check keeps matches unique per invocation shape.
    fn find_match(&self, invocation: &AttributeFinderInvocation) -> Option<&RegisteredPip> {
        self.entries.iter().find(|r| r.spec.matches(invocation))
    }
}

#[derive(Default)]
struct StreamIndex {
    streams: HashMap<AttributeFinderInvocation, Arc<AttributeStream>>,
}

/// Caches, multicasts and manages the lifecycle of attribute streams shared
/// across subscribers.
pub struct AttributeBroker {
    registry: Mutex<PipRegistry>,
    index: Arc<Mutex<StreamIndex>>,
    grace_period: Duration,
    next_stream_id: AtomicU64,
}

impl Default for AttributeBroker {
    fn default() -> Self {
        Self::new()
    }
}

impl AttributeBroker {
    pub fn new() -> Self {
        Self::with_grace_period(DEFAULT_GRACE_PERIOD)
    }

    pub fn with_grace_period(grace_period: Duration) -> Self {
        Self {
            registry: Mutex::new(PipRegistry::default()),
            index: Arc::new(Mutex::new(StreamIndex::default())),
            grace_period,
            next_stream_id: AtomicU64::new(1),
        }
    }

    /// The one place both maps are locked, in the one legal order.
    fn with_maps<R>(&self, f: impl FnOnce(&mut PipRegistry, &mut StreamIndex) -> R) -> R {
        let mut registry = self.registry.lock().expect("pip registry lock poisoned");
        let mut index = self.index.lock().expect("stream index lock poisoned");
        f(&mut registry, &mut index)
    }

    /// Resolve an invocation to a subscriber view of its shared stream.
    ///
    /// A `fresh` invocation bypasses the index entirely: it gets a private
    /// stream and the cached shared one (if any) is left untouched.
    pub fn attribute_stream(&self, invocation: &AttributeFinderInvocation) -> ValueStream {
        self.with_maps(|registry, index| {
            if invocation.fresh {
                let stream = self.create_stream(registry, invocation.clone(), false);
                return stream.subscribe();
            }
            if let Some(existing) = index.streams.get(invocation) {
                if !existing.is_disposed() {
                    return existing.subscribe();
                }
            }
            let stream = self.create_stream(registry, invocation.clone(), true);
            index
                .streams
                .insert(invocation.clone(), Arc::clone(&stream));
            stream.subscribe()
        })
    }

    fn create_stream(
        &self,
        registry: &PipRegistry,
        invocation: AttributeFinderInvocation,
        indexed: bool,
    ) -> Arc<AttributeStream> {
        let id = self.next_stream_id.fetch_add(1, Ordering::Relaxed);
        let stream = Arc::new(AttributeStream::new(
            id,
            invocation.clone(),
            self.grace_period,
        ));
        if indexed {
            let index: Weak<Mutex<StreamIndex>> = Arc::downgrade(&self.index);
            let key = invocation.clone();
            stream.set_cleanup(Box::new(move || {
                if let Some(index) = index.upgrade() {
                    let mut index = index.lock().expect("stream index lock poisoned");
                    if index.streams.get(&key).is_some_and(|s| s.id() == id) {
                        debug!(invocation = %key, "removing idle attribute stream from index");
                        index.streams.remove(&key);
                    }
                }
            }));
        }
        match registry.find_match(&invocation) {
            Some(registered) => stream.connect(Arc::clone(&registered.pip)),
            None => stream.publish(Value::error(format!("No PIP found for {invocation}"))),
        }
        stream
    }

    /// Register a PIP under its specification. Rejects collisions; connects
    /// or reconnects every indexed stream the new specification serves,
    /// without dropping cached values.
    pub fn register_attribute_finder(
        &self,
        spec: AttributeFinderSpecification,
        pip: Arc<dyn PolicyInformationPoint>,
    ) -> Result<(), RegistrationError> {
        self.with_maps(|registry, index| {
            if registry.entries.iter().any(|r| r.spec.collides_with(&spec)) {
                return Err(RegistrationError::AttributeFinderCollision {
                    fqn: spec.fqn.clone(),
                });
            }
            debug!(fqn = %spec.fqn, "registering attribute finder");
            for stream in index.streams.values() {
                if spec.matches(stream.invocation()) {
                    stream.connect(Arc::clone(&pip));
                }
            }
            registry.entries.push(RegisteredPip { spec, pip });
            Ok(())
        })
    }

    /// Withdraw a registration and disconnect every stream it was serving.
    /// Each affected stream keeps its subscribers and emits an error value.
    pub fn remove_policy_information_point(&self, spec: &AttributeFinderSpecification) {
        self.with_maps(|registry, index| {
            registry
                .entries
                .retain(|r| !r.spec.same_registration(spec));
            for stream in index.streams.values() {
                if spec.matches(stream.invocation()) {
                    stream.disconnect(&format!("PIP disconnected: {}", spec.fqn));
                }
            }
        });
    }

    /// Whether any registered specification serves the given fully qualified
    /// attribute name. Used by import validation.
    pub fn provides(&self, fqn: &str) -> bool {
        self.registry
            .lock()
            .expect("pip registry lock poisoned")
            .entries
            .iter()
            .any(|r| r.spec.fqn == fqn)
    }

    /// Number of live indexed streams (diagnostics and tests).
    pub fn indexed_stream_count(&self) -> usize {
        self.index
            .lock()
            .expect("stream index lock poisoned")
            .streams
            .len()
    }
}
