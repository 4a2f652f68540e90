//! VERDICT PDP - The Policy Decision Point
//!
//! Turns compiled documents plus an authorization subscription into a
//! continuously updated decision stream:
//!
//! ```text
//! subscription ──► DocumentIndex ──► combining ──► Stream<AuthorizationDecision>
//!                      │
//!                      └── per document: policy evaluation
//!                               └── expression evaluation (verdict-dsl)
//!                                        └── attribute streams (verdict-broker)
//! ```
//!
//! Constraint enforcement bundles for the PEP side live here as well.

pub mod combining;
pub mod constraints;
pub mod evaluate;
pub mod index;
pub mod pdp;

// Re-export key types for convenience
pub use combining::*;
pub use constraints::*;
pub use evaluate::*;
pub use index::*;
pub use pdp::*;
