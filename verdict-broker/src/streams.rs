//! Stream primitives shared across the engine
//!
//! The evaluator and the PDP compose push-based value streams. This module
//! provides the small operator set they need: one-shot streams, a
//! combine-latest join, and consecutive-duplicate suppression.

use std::pin::Pin;

use futures_util::future;
use futures_util::stream::{self, Stream, StreamExt};
use verdict_core::Value;

/// A boxed, sendable stream.
pub type BoxedStream<T> = Pin<Box<dyn Stream<Item = T> + Send + 'static>>;

/// A boxed, sendable stream of values. Attribute streams, lifted expressions,
/// and decision component streams all share this shape.
pub type ValueStream = BoxedStream<Value>;

/// A stream that emits a single value and completes.
pub fn once_value(value: Value) -> ValueStream {
    Box::pin(stream::once(future::ready(value)))
}

/// Join streams with combine-latest semantics: after every input has emitted
/// at least once, each further emission on any input produces a snapshot of
/// the latest value of every input, in input order.
///
/// An empty input set yields a single empty snapshot so that downstream
/// mappers still run once.
pub fn combine_latest<T>(streams: Vec<BoxedStream<T>>) -> BoxedStream<Vec<T>>
where
    T: Clone + Send + 'static,
{
    if streams.is_empty() {
        return Box::pin(stream::once(future::ready(Vec::new())));
    }
    let width = streams.len();
    let tagged = streams
        .into_iter()
        .enumerate()
        .map(|(slot, s)| s.map(move |v| (slot, v)).boxed());
    let merged = stream::select_all(tagged);
    let snapshots = merged
        .scan(vec![None::<T>; width], |latest, (slot, value)| {
            latest[slot] = Some(value);
            let snapshot = if latest.iter().all(Option::is_some) {
                Some(latest.iter().map(|v| v.clone().expect("checked above")).collect())
            } else {
                None
            };
            future::ready(Some(snapshot))
        })
        .filter_map(future::ready);
    Box::pin(snapshots)
}

/// Suppress consecutive duplicates. The first item always passes.
pub fn distinct_until_changed<T, S>(stream: S) -> impl Stream<Item = T>
where
    T: PartialEq + Clone,
    S: Stream<Item = T>,
{
    stream
        .scan(None::<T>, |last, item| {
            let changed = last.as_ref() != Some(&item);
            *last = Some(item.clone());
            future::ready(Some(changed.then_some(item)))
        })
        .filter_map(future::ready)
}
