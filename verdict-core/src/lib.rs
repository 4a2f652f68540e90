//! VERDICT Core - Value Model and Decision Types
//!
//! Pure data structures with no engine behavior. All other crates depend on this.
//! This crate contains the JSON-shaped value model, authorization subscription
//! and decision types, combining algorithm names, source locations, and the
//! registration-time error taxonomy.

// Core modules
mod value;
mod decision;
mod combining;
mod location;
mod error;

// Re-export the value model
pub use value::*;

// Re-export subscription/decision types
pub use decision::*;

// Re-export combining algorithm names
pub use combining::*;

// Re-export source locations and trace levels
pub use location::*;

// Re-export error types
pub use error::*;
