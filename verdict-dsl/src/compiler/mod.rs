//! Document compiler - Policy source to compiled documents
//!
//! Takes parsed ASTs and compiles them into evaluable documents. The
//! compiler resolves imports and variable scopes, folds constants, and
//! validates the semantic rules that cannot be checked during parsing.
//!
//! # Pipeline
//!
//! ```text
//! Policy Source → Lexer → Parser → AST → Compiler → CompiledDocument
//!                                          ↓
//!                                    Validation (semantic)
//! ```

mod context;
mod expr_compiler;
pub mod expression;
pub mod operators;

pub use context::{CompilationContext, RESERVED_VARIABLE_NAMES};
pub use expr_compiler::compile_expression;
pub use expression::{CompiledExpression, EvaluationContext, PureExpression, StreamExpression};

use sha2::{Digest, Sha256};
use thiserror::Error;
use tracing::debug;
use verdict_core::{CombiningAlgorithm, SourceLocation, Value};

use crate::parser::ast::{
    DocumentBody, Entitlement, PolicyAst, PolicySetAst, SaplDocument, Statement,
};
use crate::parser::{parse, ParseError};
use crate::source::{decode_source, guard_trojan_source, SourceError};

// ============================================================================
// COMPILE ERRORS
// ============================================================================

/// Errors raised while compiling a policy document. Carries the source
/// location of the offending construct where one is known.
#[derive(Debug, Clone, Error, PartialEq)]
pub enum CompilerError {
    /// Syntax error from the parser
    #[error("{message}")]
    Parse {
        message: String,
        location: SourceLocation,
    },

    /// Encoding or trojan-source rejection
    #[error(transparent)]
    Source(#[from] SourceError),

    /// Binding one of the four subscription names
    #[error("'{name}' is a reserved variable name")]
    ReservedVariable {
        name: String,
        location: Option<SourceLocation>,
    },

    /// Two imports mapping the same short name
    #[error("duplicate import name '{name}'")]
    DuplicateImport {
        name: String,
        location: Option<SourceLocation>,
    },

    /// Import target unknown to both brokers
    #[error("unresolvable import '{target}'")]
    UnresolvableImport {
        target: String,
        location: Option<SourceLocation>,
    },

    /// Constant `=~` pattern of a non-text type
    #[error("regex pattern must be text, got {actual}")]
    RegexPatternNotText {
        actual: String,
        location: Option<SourceLocation>,
    },

    /// Constant `=~` pattern that does not compile
    #[error("invalid regular expression: {reason}")]
    InvalidRegex {
        reason: String,
        location: Option<SourceLocation>,
    },

    /// A streaming expression where only pure expressions are allowed
    #[error("attribute finders are not allowed in {context}")]
    StreamNotAllowed {
        context: String,
        location: Option<SourceLocation>,
    },

    /// Number literal outside the decimal value space
    #[error("invalid number literal: {text}")]
    InvalidNumber {
        text: String,
        location: Option<SourceLocation>,
    },
}

impl From<ParseError> for CompilerError {
    fn from(e: ParseError) -> Self {
        CompilerError::Parse {
            message: e.message,
            location: e.location,
        }
    }
}

impl CompilerError {
    pub fn location(&self) -> Option<&SourceLocation> {
        match self {
            CompilerError::Parse { location, .. } => Some(location),
            CompilerError::Source(SourceError::TrojanSource { location, .. }) => Some(location),
            CompilerError::Source(SourceError::Encoding { .. }) => None,
            CompilerError::ReservedVariable { location, .. }
            | CompilerError::DuplicateImport { location, .. }
            | CompilerError::UnresolvableImport { location, .. }
            | CompilerError::RegexPatternNotText { location, .. }
            | CompilerError::InvalidRegex { location, .. }
            | CompilerError::StreamNotAllowed { location, .. }
            | CompilerError::InvalidNumber { location, .. } => location.as_ref(),
        }
    }

    /// Terminal-friendly rendering with a caret-underlined excerpt.
    pub fn render_plain(&self, source: &str) -> String {
        match self.location() {
            Some(location) => format!(
                "error: {self}\n --> {location}\n{}",
                location.caret_snippet(source)
            ),
            None => format!("error: {self}"),
        }
    }

    /// HTML rendering of the same diagnostic.
    pub fn render_html(&self, source: &str) -> String {
        let message = escape_html(&self.to_string());
        match self.location() {
            Some(location) => format!(
                "<pre class=\"policy-error\"><strong>error:</strong> {message}\n --&gt; {location}\n{}</pre>",
                escape_html(&location.caret_snippet(source))
            ),
            None => format!("<pre class=\"policy-error\"><strong>error:</strong> {message}</pre>"),
        }
    }
}

fn escape_html(s: &str) -> String {
    s.replace('&', "&amp;")
        .replace('<', "&lt;")
        .replace('>', "&gt;")
        .replace('"', "&quot;")
}

// ============================================================================
// DOCUMENTS
// ============================================================================

/// Conventional file extension for policy documents.
pub const SAPL_FILE_EXTENSION: &str = "sapl";

/// Document kinds.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DocumentType {
    Policy,
    PolicySet,
}

/// An immutable parse result, valid or not. Only valid documents are
/// evaluable; the index rejects invalid ones.
#[derive(Debug, Clone)]
pub struct Document {
    pub id: String,
    pub name: Option<String>,
    pub document_type: Option<DocumentType>,
    pub source: String,
    pub ast: Option<SaplDocument>,
    pub error: Option<String>,
}

impl Document {
    pub fn is_invalid(&self) -> bool {
        self.error.is_some()
    }
}

/// Parse a document, capturing syntax errors as diagnostics instead of
/// failing. The id falls back to a digest of the source when the caller
/// supplies none.
pub fn parse_document(id: Option<&str>, source: &str) -> Document {
    let mut document = Document {
        id: id.map(str::to_string).unwrap_or_else(|| derived_id(source)),
        name: None,
        document_type: None,
        source: source.to_string(),
        ast: None,
        error: None,
    };

    if let Err(e) = guard_trojan_source(source) {
        document.error = Some(e.to_string());
        return document;
    }

    match parse(source) {
        Ok(ast) => {
            document.name = Some(ast.name().to_string());
            document.document_type = Some(match ast.body {
                DocumentBody::Policy(_) => DocumentType::Policy,
                DocumentBody::PolicySet(_) => DocumentType::PolicySet,
            });
            document.ast = Some(ast);
        }
        Err(e) => document.error = Some(e.to_string()),
    }

    document
}

/// Like [`parse_document`], for raw bytes as delivered by a policy source.
/// The encoding is normalized first; undecodable input yields an invalid
/// document.
pub fn parse_document_bytes(id: Option<&str>, bytes: &[u8]) -> Document {
    match decode_source(bytes) {
        Ok(source) => parse_document(id, &source),
        Err(e) => {
            let source = String::from_utf8_lossy(bytes).into_owned();
            Document {
                id: id.map(str::to_string).unwrap_or_else(|| derived_id(&source)),
                name: None,
                document_type: None,
                source,
                ast: None,
                error: Some(e.to_string()),
            }
        }
    }
}

/// Stable fallback id: a prefix of the source digest.
fn derived_id(source: &str) -> String {
    let digest = Sha256::digest(source.as_bytes());
    hex::encode(digest)[..16].to_string()
}

// ============================================================================
// COMPILED DOCUMENTS
// ============================================================================

/// A fully compiled policy, ready for evaluation.
#[derive(Debug, Clone)]
pub struct CompiledPolicy {
    pub name: String,
    pub entitlement: Entitlement,
    /// Always pure; attribute finders are rejected in targets.
    pub target: CompiledExpression,
    pub condition: Option<CompiledExpression>,
    pub obligations: Vec<CompiledExpression>,
    pub advice: Vec<CompiledExpression>,
    pub transform: Option<CompiledExpression>,
}

/// A compiled policy set with its combining algorithm.
#[derive(Debug, Clone)]
pub struct CompiledPolicySet {
    pub name: String,
    pub algorithm: CombiningAlgorithm,
    /// Always pure; attribute finders are rejected in `for` expressions.
    pub target: Option<CompiledExpression>,
    pub policies: Vec<CompiledPolicy>,
}

/// Compiled document body.
#[derive(Debug, Clone)]
pub enum CompiledBody {
    Policy(CompiledPolicy),
    PolicySet(CompiledPolicySet),
}

/// The compiler output: an immutable, evaluable document.
#[derive(Debug, Clone)]
pub struct CompiledDocument {
    pub id: String,
    pub name: String,
    pub source: String,
    pub body: CompiledBody,
}

// ============================================================================
// DOCUMENT COMPILER
// ============================================================================

/// Compiles parsed documents against a reusable [`CompilationContext`].
pub struct DocumentCompiler<'c> {
    ctx: &'c mut CompilationContext,
}

impl<'c> DocumentCompiler<'c> {
    pub fn new(ctx: &'c mut CompilationContext) -> Self {
        Self { ctx }
    }

    /// Compile raw policy bytes: the encoding is normalized (BOM detection,
    /// UTF-16 decoding) before the source pipeline runs.
    pub fn compile_bytes(
        &mut self,
        id: Option<&str>,
        bytes: &[u8],
    ) -> Result<CompiledDocument, CompilerError> {
        let source = decode_source(bytes)?;
        self.compile(id, &source)
    }

    /// Compile a document from source. Fails on any syntax or validation
    /// error.
    pub fn compile(
        &mut self,
        id: Option<&str>,
        source: &str,
    ) -> Result<CompiledDocument, CompilerError> {
        guard_trojan_source(source)?;
        let ast = parse(source)?;

        self.ctx.reset_for_next_document();
        for import in &ast.imports {
            self.ctx
                .add_import(&import.target, import.alias.as_deref(), Some(&import.location))?;
        }

        let name = ast.name().to_string();
        let body = match &ast.body {
            DocumentBody::Policy(policy) => CompiledBody::Policy(self.compile_policy(policy)?),
            DocumentBody::PolicySet(set) => {
                CompiledBody::PolicySet(self.compile_policy_set(set)?)
            }
        };

        let id = id.map(str::to_string).unwrap_or_else(|| derived_id(source));
        debug!(document = %id, "compiled policy document");
        Ok(CompiledDocument {
            id,
            name,
            source: source.to_string(),
            body,
        })
    }

    fn compile_policy_set(&mut self, ast: &PolicySetAst) -> Result<CompiledPolicySet, CompilerError> {
        let target = match &ast.target {
            Some(expr) => {
                let compiled = compile_expression(self.ctx, expr)?;
                if compiled.is_stream() {
                    return Err(CompilerError::StreamNotAllowed {
                        context: "a target expression".to_string(),
                        location: Some(expr.location.clone()),
                    });
                }
                Some(compiled)
            }
            None => None,
        };

        for variable in &ast.variables {
            let compiled = compile_expression(self.ctx, &variable.value)?;
            self.ctx
                .bind_document_variable(&variable.name, compiled, Some(&variable.location))?;
        }

        let policies = ast
            .policies
            .iter()
            .map(|policy| self.compile_policy(policy))
            .collect::<Result<Vec<_>, _>>()?;

        Ok(CompiledPolicySet {
            name: ast.name.clone(),
            algorithm: ast.algorithm,
            target,
            policies,
        })
    }

    fn compile_policy(&mut self, ast: &PolicyAst) -> Result<CompiledPolicy, CompilerError> {
        self.ctx.reset_for_next_policy();

        let target = match &ast.target {
            Some(expr) => {
                let compiled = compile_expression(self.ctx, expr)?;
                if compiled.is_stream() {
                    return Err(CompilerError::StreamNotAllowed {
                        context: "a target expression".to_string(),
                        location: Some(expr.location.clone()),
                    });
                }
                compiled
            }
            None => CompiledExpression::Constant(Value::boolean(true)),
        };

        let mut condition: Option<CompiledExpression> = None;
        for statement in &ast.body {
            match statement {
                Statement::VarAssignment {
                    name,
                    value,
                    location,
                } => {
                    let compiled = compile_expression(self.ctx, value)?;
                    self.ctx.bind_policy_variable(name, compiled, Some(location))?;
                }
                Statement::Condition(expr) => {
                    let compiled = compile_expression(self.ctx, expr)?;
                    condition = Some(match condition.take() {
                        None => compiled,
                        Some(previous) => expr_compiler::combine_and(
                            previous,
                            compiled,
                            expr.location.clone(),
                        ),
                    });
                }
            }
        }

        let obligations = ast
            .obligations
            .iter()
            .map(|expr| compile_expression(self.ctx, expr))
            .collect::<Result<Vec<_>, _>>()?;
        let advice = ast
            .advice
            .iter()
            .map(|expr| compile_expression(self.ctx, expr))
            .collect::<Result<Vec<_>, _>>()?;
        let transform = ast
            .transform
            .as_ref()
            .map(|expr| compile_expression(self.ctx, expr))
            .transpose()?;

        Ok(CompiledPolicy {
            name: ast.name.clone(),
            entitlement: ast.entitlement,
            target,
            condition,
            obligations,
            advice,
            transform,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use verdict_broker::{AttributeBroker, FunctionBroker};
    use verdict_core::AuthorizationSubscription;

    fn compile(source: &str) -> Result<CompiledDocument, CompilerError> {
        let mut ctx = CompilationContext::new(
            Arc::new(FunctionBroker::with_standard_library()),
            Arc::new(AttributeBroker::new()),
        );
        DocumentCompiler::new(&mut ctx).compile(Some("test"), source)
    }

    fn eval_context() -> EvaluationContext {
        EvaluationContext::new(
            AuthorizationSubscription::new(
                serde_json::json!({"name": "alice", "age": 30}),
                serde_json::json!("read"),
                serde_json::json!("report"),
                serde_json::Value::Null,
            )
            .to_values(),
            Arc::new(AttributeBroker::new()),
            Arc::new(FunctionBroker::with_standard_library()),
        )
    }

    fn policy(document: CompiledDocument) -> CompiledPolicy {
        match document.body {
            CompiledBody::Policy(p) => p,
            _ => panic!("expected policy"),
        }
    }

    #[test]
    fn test_constant_target_is_folded() {
        let p = policy(compile("policy \"P\" permit 1 + 2 == 3").unwrap());
        assert_eq!(p.target.constant_value(), Some(&Value::boolean(true)));
    }

    #[test]
    fn test_division_by_zero_folds_to_error_constant() {
        let p = policy(compile("policy \"P\" permit where 1 / 0 == 1;").unwrap());
        let condition = p.condition.unwrap();
        assert!(condition.constant_value().unwrap().is_error());
    }

    #[test]
    fn test_subscription_reference_is_not_folded() {
        let p = policy(compile("policy \"P\" permit subject.age > 18").unwrap());
        assert!(p.target.constant_value().is_none());
        assert!(p.target.subscription_scoped());
        assert_eq!(p.target.evaluate(&eval_context()), Value::boolean(true));
    }

    #[test]
    fn test_where_var_binding_is_substituted() {
        let p = policy(
            compile("policy \"P\" permit where var limit := 18; subject.age > limit;").unwrap(),
        );
        let condition = p.condition.unwrap();
        assert_eq!(condition.evaluate(&eval_context()), Value::boolean(true));
    }

    #[test]
    fn test_conditions_are_conjoined_in_order() {
        let p = policy(compile("policy \"P\" permit where true; false; true;").unwrap());
        let condition = p.condition.unwrap();
        assert_eq!(condition.constant_value(), Some(&Value::boolean(false)));
    }

    #[test]
    fn test_reserved_variable_is_rejected() {
        let err = compile("policy \"P\" permit where var subject := 1; true;").unwrap_err();
        assert!(matches!(err, CompilerError::ReservedVariable { .. }));
    }

    #[test]
    fn test_import_resolves_function_alias() {
        let source = "import standard.length as len policy \"P\" permit len(\"abc\") == 3";
        let p = policy(compile(source).unwrap());
        assert_eq!(p.target.constant_value(), Some(&Value::boolean(true)));
    }

    #[test]
    fn test_unresolvable_import_fails_compilation() {
        let err = compile("import missing.fn policy \"P\" permit").unwrap_err();
        assert!(matches!(err, CompilerError::UnresolvableImport { .. }));
    }

    #[test]
    fn test_constant_function_call_is_folded() {
        let p = policy(compile("policy \"P\" permit standard.upper(\"ab\") == \"AB\"").unwrap());
        assert_eq!(p.target.constant_value(), Some(&Value::boolean(true)));
    }

    #[test]
    fn test_regex_constant_pattern_is_validated() {
        let err = compile("policy \"P\" permit \"x\" =~ \"(\"").unwrap_err();
        assert!(matches!(err, CompilerError::InvalidRegex { .. }));

        let err = compile("policy \"P\" permit \"x\" =~ 5").unwrap_err();
        assert!(matches!(err, CompilerError::RegexPatternNotText { .. }));
    }

    #[test]
    fn test_attribute_finder_in_target_is_rejected() {
        let err = compile("policy \"P\" permit <time.now> == 1").unwrap_err();
        assert!(matches!(err, CompilerError::StreamNotAllowed { .. }));
    }

    #[test]
    fn test_attribute_finder_in_condition_compiles_to_stream() {
        let p = policy(compile("policy \"P\" permit where <time.now> == 1;").unwrap());
        assert!(p.condition.unwrap().is_stream());
    }

    #[test]
    fn test_trojan_source_is_rejected() {
        let err = compile("policy \"P\u{202E}\" permit").unwrap_err();
        assert!(matches!(
            err,
            CompilerError::Source(SourceError::TrojanSource { .. })
        ));
    }

    #[test]
    fn test_subtemplate_maps_over_array() {
        let p = policy(compile("policy \"P\" permit where ([1, 2, 3] :: (@ * 2)) == [2, 4, 6];").unwrap());
        let condition = p.condition.unwrap();
        assert_eq!(condition.evaluate(&eval_context()), Value::boolean(true));
    }

    #[test]
    fn test_subtemplate_empty_array_stays_empty() {
        let p = policy(compile("policy \"P\" permit where ([] :: (@ * 2)) == [];").unwrap());
        let condition = p.condition.unwrap();
        assert_eq!(condition.evaluate(&eval_context()), Value::boolean(true));
    }

    #[test]
    fn test_policy_set_document_variables_span_policies() {
        let source = "set \"S\" deny-overrides var limit := 21; \
                      policy \"A\" permit subject.age > limit \
                      policy \"B\" deny subject.age > limit";
        let document = compile(source).unwrap();
        match document.body {
            CompiledBody::PolicySet(set) => {
                assert_eq!(set.policies.len(), 2);
                assert_eq!(
                    set.policies[1].target.evaluate(&eval_context()),
                    Value::boolean(true)
                );
            }
            _ => panic!("expected policy set"),
        }
    }

    #[test]
    fn test_policy_local_variables_reset_between_policies() {
        let source = "set \"S\" deny-overrides \
                      policy \"A\" permit where var limit := 1; true; \
                      policy \"B\" permit where limit == undefined;";
        let document = compile(source).unwrap();
        match document.body {
            CompiledBody::PolicySet(set) => {
                // `limit` in policy B is unbound, so it resolves to a runtime
                // configuration variable lookup yielding undefined.
                let condition = set.policies[1].condition.clone().unwrap();
                assert_eq!(condition.evaluate(&eval_context()), Value::boolean(true));
            }
            _ => panic!("expected policy set"),
        }
    }

    #[test]
    fn test_parse_document_captures_errors_as_diagnostics() {
        let document = parse_document(Some("doc-1"), "policy \"P\" maybe");
        assert!(document.is_invalid());
        assert_eq!(document.id, "doc-1");
        assert!(document.ast.is_none());
    }

    #[test]
    fn test_parse_document_derives_id_from_source() {
        let a = parse_document(None, "policy \"P\" permit");
        let b = parse_document(None, "policy \"P\" permit");
        assert_eq!(a.id, b.id);
        assert_eq!(a.id.len(), 16);
        assert_eq!(a.name.as_deref(), Some("P"));
        assert_eq!(a.document_type, Some(DocumentType::Policy));
    }

    #[test]
    fn test_compile_bytes_strips_utf8_bom() {
        let mut ctx = CompilationContext::new(
            Arc::new(FunctionBroker::with_standard_library()),
            Arc::new(AttributeBroker::new()),
        );
        let mut bytes = vec![0xEF, 0xBB, 0xBF];
        bytes.extend_from_slice(b"policy \"P\" permit");
        let document = DocumentCompiler::new(&mut ctx)
            .compile_bytes(Some("p"), &bytes)
            .unwrap();
        assert_eq!(document.name, "P");
    }

    #[test]
    fn test_parse_document_bytes_utf16() {
        let source = "policy \"P\" permit";
        let mut bytes = vec![0xFF, 0xFE];
        for unit in source.encode_utf16() {
            bytes.extend_from_slice(&unit.to_le_bytes());
        }
        let document = parse_document_bytes(Some("p"), &bytes);
        assert!(!document.is_invalid());
        assert_eq!(document.name.as_deref(), Some("P"));
    }

    #[test]
    fn test_parse_document_bytes_bad_encoding_is_invalid() {
        let document = parse_document_bytes(Some("p"), &[0xC3, 0x28]);
        assert!(document.is_invalid());
    }

    #[test]
    fn test_render_plain_points_at_source() {
        let source = "policy \"P\" permit \"x\" =~ 5";
        let err = compile(source).unwrap_err();
        let rendered = err.render_plain(source);
        assert!(rendered.contains("regex pattern must be text"));
        assert!(rendered.contains('^'));
    }

    #[test]
    fn test_render_html_escapes_markup() {
        let source = "policy \"P\" permit <time.now> == 1";
        let err = compile(source).unwrap_err();
        let rendered = err.render_html(source);
        assert!(rendered.starts_with("<pre class=\"policy-error\">"));
        assert!(rendered.contains("&lt;time.now&gt;"));
    }
}
