//! Compilation context: brokers, imports, and variable scopes
//!
//! One context is reused across documents. It carries the two variable
//! scopes: document-level variables (from `set`) persist across member
//! policies; policy-local `var` bindings are cleared between policies by
//! [`CompilationContext::reset_for_next_policy`].

use std::collections::HashMap;
use std::sync::Arc;

use verdict_broker::{AttributeBroker, FunctionBroker};
use verdict_core::{SourceLocation, TraceLevel};

use super::expression::CompiledExpression;
use super::CompilerError;

/// Variable names bound to the subscription; never assignable.
pub const RESERVED_VARIABLE_NAMES: [&str; 4] = ["subject", "action", "resource", "environment"];

/// Shared state for compiling one or more documents.
pub struct CompilationContext {
    function_broker: Arc<FunctionBroker>,
    attribute_broker: Arc<AttributeBroker>,
    trace_level: TraceLevel,
    imports: HashMap<String, String>,
    document_variables: HashMap<String, CompiledExpression>,
    policy_variables: HashMap<String, CompiledExpression>,
}

impl CompilationContext {
    pub fn new(function_broker: Arc<FunctionBroker>, attribute_broker: Arc<AttributeBroker>) -> Self {
        Self {
            function_broker,
            attribute_broker,
            trace_level: TraceLevel::Off,
            imports: HashMap::new(),
            document_variables: HashMap::new(),
            policy_variables: HashMap::new(),
        }
    }

    pub fn with_trace_level(mut self, trace_level: TraceLevel) -> Self {
        self.trace_level = trace_level;
        self
    }

    pub fn function_broker(&self) -> &Arc<FunctionBroker> {
        &self.function_broker
    }

    pub fn attribute_broker(&self) -> &Arc<AttributeBroker> {
        &self.attribute_broker
    }

    pub fn trace_level(&self) -> TraceLevel {
        self.trace_level
    }

    /// Register an import. The short name is the alias, or the last segment
    /// of the target. The target must resolve against one of the brokers.
    pub fn add_import(
        &mut self,
        target: &str,
        alias: Option<&str>,
        location: Option<&SourceLocation>,
    ) -> Result<(), CompilerError> {
        let short = alias
            .map(str::to_string)
            .unwrap_or_else(|| {
                target
                    .rsplit('.')
                    .next()
                    .unwrap_or(target)
                    .to_string()
            });
        if !self.function_broker.provides(target) && !self.attribute_broker.provides(target) {
            return Err(CompilerError::UnresolvableImport {
                target: target.to_string(),
                location: location.cloned(),
            });
        }
        if self.imports.contains_key(&short) {
            return Err(CompilerError::DuplicateImport {
                name: short,
                location: location.cloned(),
            });
        }
        self.imports.insert(short, target.to_string());
        Ok(())
    }

    /// Name resolution consults the import table before falling back to the
    /// name itself.
    pub fn resolve_name(&self, name: &str) -> String {
        self.imports
            .get(name)
            .cloned()
            .unwrap_or_else(|| name.to_string())
    }

    pub fn bind_document_variable(
        &mut self,
        name: &str,
        value: CompiledExpression,
        location: Option<&SourceLocation>,
    ) -> Result<(), CompilerError> {
        Self::check_not_reserved(name, location)?;
        self.document_variables.insert(name.to_string(), value);
        Ok(())
    }

    pub fn bind_policy_variable(
        &mut self,
        name: &str,
        value: CompiledExpression,
        location: Option<&SourceLocation>,
    ) -> Result<(), CompilerError> {
        Self::check_not_reserved(name, location)?;
        self.policy_variables.insert(name.to_string(), value);
        Ok(())
    }

    fn check_not_reserved(
        name: &str,
        location: Option<&SourceLocation>,
    ) -> Result<(), CompilerError> {
        if RESERVED_VARIABLE_NAMES.contains(&name) {
            return Err(CompilerError::ReservedVariable {
                name: name.to_string(),
                location: location.cloned(),
            });
        }
        Ok(())
    }

    /// Policy-local scope shadows the document scope.
    pub fn lookup_variable(&self, name: &str) -> Option<&CompiledExpression> {
        self.policy_variables
            .get(name)
            .or_else(|| self.document_variables.get(name))
    }

    /// Clear policy-local bindings before compiling the next member policy.
    pub fn reset_for_next_policy(&mut self) {
        self.policy_variables.clear();
    }

    /// Clear everything document-scoped before compiling the next document.
    pub fn reset_for_next_document(&mut self) {
        self.imports.clear();
        self.document_variables.clear();
        self.policy_variables.clear();
    }
}
