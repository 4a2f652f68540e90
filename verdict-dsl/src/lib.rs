//! VERDICT DSL - Policy Language Parser and Compiler
//!
//! This crate turns policy source text into compiled, evaluable documents.
//!
//! Architecture:
//! ```text
//! Policy Source (.sapl file)
//!     ↓
//! Encoding guard (BOM normalization, trojan-source rejection)
//!     ↓
//! Lexer (tokenize)
//!     ↓
//! Parser (build AST)
//!     ↓
//! Compiler (scope/import resolution, constant folding)
//!     ↓
//! CompiledDocument (constants, pure expressions, value streams)
//! ```

pub mod compiler;
pub mod lexer;
pub mod parser;
pub mod source;

// Re-export key types for convenience
pub use compiler::*;
pub use lexer::*;
pub use parser::*;
pub use source::*;
