//! The timeout / poll / retry pipeline around a raw PIP stream
//!
//! Composed, innermost first:
//!
//! 1. default-if-empty: an empty PIP stream emits a single `Undefined`.
//! 2. Error values are published but keep the retry/backoff loop alive.
//! 3. When the source completes, resubscribe after `poll_interval`
//!    (long-poll).
//! 4. Timeout wrapper: if no value arrives before `initial_timeout`, emit
//!    `Undefined` without unsubscribing the source.
//! 5. Bounded exponential backoff; an exhausted retry chain terminates the
//!    stream with an error value.

use std::sync::{Arc, Weak};
use std::time::Duration;

use futures_util::StreamExt;
use tracing::warn;
use verdict_core::Value;

use crate::invocation::AttributeFinderInvocation;
use crate::pip::PolicyInformationPoint;
use crate::stream::StreamShared;

/// Drive one PIP connection until the stream is disposed or retries run out.
pub(crate) async fn run_pipeline(
    pip: Arc<dyn PolicyInformationPoint>,
    invocation: AttributeFinderInvocation,
    shared: Weak<StreamShared>,
) {
    let settings = invocation.settings.clone();
    let mut attempt: u32 = 0;

    loop {
        let mut source = pip.invoke(&invocation);
        let mut emitted = false;
        let mut errored = false;

        // Timeout wrapper: the source is not cancelled on expiry, only a
        // synthetic Undefined is pushed downstream.
        match tokio::time::timeout(settings.initial_timeout, source.next()).await {
            Err(_elapsed) => {
                if !publish(&shared, Value::undefined()) {
                    return;
                }
                emitted = true;
                while let Some(value) = source.next().await {
                    errored |= value.is_error();
                    if !publish(&shared, value) {
                        return;
                    }
                }
            }
            Ok(first) => {
                if let Some(value) = first {
                    emitted = true;
                    errored |= value.is_error();
                    if !publish(&shared, value) {
                        return;
                    }
                    while let Some(value) = source.next().await {
                        errored |= value.is_error();
                        if !publish(&shared, value) {
                            return;
                        }
                    }
                }
            }
        }

        if !emitted && !publish(&shared, Value::undefined()) {
            return;
        }

        if errored {
            attempt += 1;
            if attempt > settings.retries {
                warn!(invocation = %invocation, "attribute stream retries exhausted");
                publish(
                    &shared,
                    Value::error(format!("attribute stream retries exhausted for {invocation}")),
                );
                return;
            }
            tokio::time::sleep(backoff_delay(settings.backoff, attempt)).await;
        } else {
            attempt = 0;
            tokio::time::sleep(settings.poll_interval).await;
        }
    }
}

/// `base * 2^(attempt-1)`, saturating, with the exponent clamped so large
/// retry counts cannot overflow the multiplier.
fn backoff_delay(base: Duration, attempt: u32) -> Duration {
    let exponent = attempt.saturating_sub(1).min(16);
    base.saturating_mul(1u32 << exponent)
}

/// Push a value onto the shared stream; `false` when the stream is gone.
fn publish(shared: &Weak<StreamShared>, value: Value) -> bool {
    match shared.upgrade() {
        Some(shared) => {
            shared.publish(value);
            true
        }
        None => false,
    }
}
