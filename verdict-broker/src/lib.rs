//! VERDICT Broker - Attribute Streams and Functions
//!
//! The two brokers external providers plug into:
//!
//! - The [`AttributeBroker`] caches and multicasts long-lived attribute
//!   streams from Policy Information Points, sharing one PIP subscription
//!   across all interested policy evaluations, with grace periods, timeouts,
//!   polling and retry.
//! - The [`FunctionBroker`] registers and invokes side-effect-free functions
//!   callable from policy expressions.
//!
//! Both are explicit collaborators handed to the compiler and evaluator, so
//! tests can substitute alternatives.

pub mod broker;
pub mod functions;
pub mod invocation;
pub mod library;
pub mod pip;
mod pipeline;
pub mod stream;
pub mod streams;

// Re-export key types for convenience
pub use broker::*;
pub use functions::*;
pub use invocation::*;
pub use library::*;
pub use pip::*;
pub use stream::*;
pub use streams::*;
