//! The function broker
//!
//! Side-effect-free functions callable from policy expressions. A
//! specification binds a fully qualified name and an arity to a plain Rust
//! closure over values; invocation enforces arity and per-argument kinds and
//! converts panics from user code into error values.

use std::collections::HashMap;
use std::fmt;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::{Arc, Mutex};

use verdict_core::{RegistrationError, Value, ValueMetadata};

use crate::library::register_standard_library;

// ============================================================================
// PARAMETER VALIDATORS
// ============================================================================

/// Kind check applied to one argument before invocation.
#[derive(Clone)]
pub struct ParameterValidator {
    expected: &'static str,
    check: Arc<dyn Fn(&Value) -> bool + Send + Sync>,
}

impl fmt::Debug for ParameterValidator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ParameterValidator")
            .field("expected", &self.expected)
            .finish_non_exhaustive()
    }
}

impl ParameterValidator {
    pub fn new(
        expected: &'static str,
        check: impl Fn(&Value) -> bool + Send + Sync + 'static,
    ) -> Self {
        Self {
            expected,
            check: Arc::new(check),
        }
    }

    pub fn any() -> Self {
        Self::new("any value", |_| true)
    }

    pub fn number() -> Self {
        Self::new("number", |v| v.as_number().is_some())
    }

    pub fn text() -> Self {
        Self::new("text", |v| v.as_text().is_some())
    }

    pub fn boolean() -> Self {
        Self::new("boolean", |v| v.as_boolean().is_some())
    }

    pub fn array() -> Self {
        Self::new("array", |v| v.as_array().is_some())
    }

    pub fn object() -> Self {
        Self::new("object", |v| v.as_object().is_some())
    }

    pub fn expected(&self) -> &'static str {
        self.expected
    }

    pub fn validate(&self, value: &Value) -> bool {
        (self.check)(value)
    }
}

// ============================================================================
// FUNCTION SPECIFICATIONS
// ============================================================================

/// A registered function: name, arity, argument validators, implementation.
///
/// For a variadic function (`num_arguments == -1`) the validators describe
/// the fixed prefix plus one trailing validator applied to every remaining
/// argument.
#[derive(Clone)]
pub struct FunctionSpecification {
    fqn: String,
    num_arguments: i32,
    validators: Vec<ParameterValidator>,
    function: Arc<dyn Fn(&[Value]) -> Value + Send + Sync>,
}

impl fmt::Debug for FunctionSpecification {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FunctionSpecification")
            .field("fqn", &self.fqn)
            .field("num_arguments", &self.num_arguments)
            .finish_non_exhaustive()
    }
}

impl FunctionSpecification {
    pub fn new(
        fqn: impl Into<String>,
        num_arguments: i32,
        function: impl Fn(&[Value]) -> Value + Send + Sync + 'static,
    ) -> Self {
        Self {
            fqn: fqn.into(),
            num_arguments,
            validators: Vec::new(),
            function: Arc::new(function),
        }
    }

    pub fn with_validators(mut self, validators: Vec<ParameterValidator>) -> Self {
        self.validators = validators;
        self
    }

    pub fn fqn(&self) -> &str {
        &self.fqn
    }

    pub fn is_variadic(&self) -> bool {
        self.num_arguments < 0
    }

    /// Number of leading arguments a variadic function requires.
    fn fixed_prefix(&self) -> usize {
        if self.is_variadic() {
            self.validators.len().saturating_sub(1)
        } else {
            self.num_arguments as usize
        }
    }

    fn matches_arity(&self, arg_count: usize) -> bool {
        if self.is_variadic() {
            arg_count >= self.fixed_prefix()
        } else {
            arg_count == self.num_arguments as usize
        }
    }

    fn collides_with(&self, other: &FunctionSpecification) -> bool {
        self.fqn == other.fqn
            && (self.is_variadic()
                || other.is_variadic()
                || self.num_arguments == other.num_arguments)
    }

    /// Validator responsible for the argument at `index`, if any.
    fn validator_for(&self, index: usize) -> Option<&ParameterValidator> {
        if self.is_variadic() && index >= self.fixed_prefix() {
            self.validators.last()
        } else {
            self.validators.get(index)
        }
    }
}

// ============================================================================
// FUNCTION BROKER
// ============================================================================

/// Registers, resolves and invokes side-effect-free functions.
pub struct FunctionBroker {
    functions: Mutex<HashMap<String, Vec<FunctionSpecification>>>,
}

impl Default for FunctionBroker {
    fn default() -> Self {
        Self::new()
    }
}

impl FunctionBroker {
    pub fn new() -> Self {
        Self {
            functions: Mutex::new(HashMap::new()),
        }
    }

    /// A broker preloaded with the `standard.*` library.
    pub fn with_standard_library() -> Self {
        let broker = Self::new();
        register_standard_library(&broker)
            .expect("standard library registration cannot collide on an empty broker");
        broker
    }

    /// Register a function specification. Rejects arity overlaps under the
    /// same name and malformed specifications.
    pub fn register(&self, spec: FunctionSpecification) -> Result<(), RegistrationError> {
        if !spec.is_variadic() && spec.validators.len() > spec.num_arguments as usize {
            return Err(RegistrationError::InvalidFunctionSpecification {
                fqn: spec.fqn.clone(),
                reason: format!(
                    "{} validators for {} parameters",
                    spec.validators.len(),
                    spec.num_arguments
                ),
            });
        }
        let mut functions = self.functions.lock().expect("function registry lock poisoned");
        let entries = functions.entry(spec.fqn.clone()).or_default();
        if entries.iter().any(|existing| existing.collides_with(&spec)) {
            return Err(RegistrationError::FunctionCollision {
                fqn: spec.fqn.clone(),
            });
        }
        entries.push(spec);
        Ok(())
    }

    /// Whether any specification is registered under the name. Used by
    /// import validation.
    pub fn provides(&self, fqn: &str) -> bool {
        self.functions
            .lock()
            .expect("function registry lock poisoned")
            .contains_key(fqn)
    }

    /// Invoke a function by fully qualified name.
    ///
    /// Error arguments propagate without calling the function. Arity and
    /// argument-kind mismatches and panics inside the implementation all
    /// come back as error values.
    pub fn invoke(&self, fqn: &str, args: &[Value]) -> Value {
        let meta = args
            .iter()
            .fold(ValueMetadata::default(), |acc, a| {
                ValueMetadata::merged(acc, a.metadata())
            });
        if let Some(error) = args.iter().find(|a| a.is_error()) {
            return error.clone().merge_metadata(meta);
        }

        let spec = {
            let functions = self.functions.lock().expect("function registry lock poisoned");
            let Some(entries) = functions.get(fqn) else {
                return Value::error(format!("unknown function '{fqn}'")).merge_metadata(meta);
            };
            match entries.iter().find(|s| s.matches_arity(args.len())) {
                Some(spec) => spec.clone(),
                None => {
                    return Value::error(format!(
                        "{fqn}: no overload accepts {} arguments",
                        args.len()
                    ))
                    .merge_metadata(meta)
                }
            }
        };

        for (i, arg) in args.iter().enumerate() {
            if let Some(validator) = spec.validator_for(i) {
                if !validator.validate(arg) {
                    let label = if spec.is_variadic() && i >= spec.fixed_prefix() {
                        "varargs argument"
                    } else {
                        "argument"
                    };
                    return Value::error(format!(
                        "{label} {}: expected {}, got {}",
                        i + 1,
                        validator.expected(),
                        arg.type_name()
                    ))
                    .merge_metadata(meta);
                }
            }
        }

        let function = Arc::clone(&spec.function);
        match catch_unwind(AssertUnwindSafe(|| function(args))) {
            Ok(result) => result.merge_metadata(meta),
            Err(panic) => {
                let cause = panic
                    .downcast_ref::<String>()
                    .map(String::as_str)
                    .or_else(|| panic.downcast_ref::<&str>().copied())
                    .unwrap_or("panic");
                Value::error(format!("{fqn} execution failed: {cause}")).merge_metadata(meta)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn identity_spec(fqn: &str, arity: i32) -> FunctionSpecification {
        FunctionSpecification::new(fqn, arity, |args: &[Value]| {
            args.first().cloned().unwrap_or_else(Value::undefined)
        })
    }

    #[test]
    fn test_collision_on_same_arity() {
        let broker = FunctionBroker::new();
        broker.register(identity_spec("t.f", 1)).unwrap();
        let err = broker.register(identity_spec("t.f", 1)).unwrap_err();
        assert!(matches!(err, RegistrationError::FunctionCollision { .. }));
    }

    #[test]
    fn test_overloading_by_arity_is_allowed() {
        let broker = FunctionBroker::new();
        broker.register(identity_spec("t.f", 1)).unwrap();
        broker.register(identity_spec("t.f", 2)).unwrap();
        assert_eq!(broker.invoke("t.f", &[Value::from(1)]), Value::from(1));
    }

    #[test]
    fn test_variadic_collides_with_everything() {
        let broker = FunctionBroker::new();
        broker.register(identity_spec("t.f", -1)).unwrap();
        let err = broker.register(identity_spec("t.f", 3)).unwrap_err();
        assert!(matches!(err, RegistrationError::FunctionCollision { .. }));
    }

    #[test]
    fn test_too_many_validators_rejected() {
        let broker = FunctionBroker::new();
        let spec = identity_spec("t.f", 1)
            .with_validators(vec![ParameterValidator::any(), ParameterValidator::any()]);
        let err = broker.register(spec).unwrap_err();
        assert!(matches!(
            err,
            RegistrationError::InvalidFunctionSpecification { .. }
        ));
    }

    #[test]
    fn test_unknown_function() {
        let broker = FunctionBroker::new();
        let result = broker.invoke("no.such", &[]);
        assert_eq!(result.error_message(), Some("unknown function 'no.such'"));
    }

    #[test]
    fn test_argument_kind_mismatch_message() {
        let broker = FunctionBroker::new();
        let spec = identity_spec("t.f", 1).with_validators(vec![ParameterValidator::number()]);
        broker.register(spec).unwrap();
        let result = broker.invoke("t.f", &[Value::text("x")]);
        assert_eq!(
            result.error_message(),
            Some("argument 1: expected number, got text")
        );
    }

    #[test]
    fn test_varargs_argument_mismatch_message() {
        let broker = FunctionBroker::new();
        let spec = FunctionSpecification::new("t.sum", -1, |_args: &[Value]| Value::from(0))
            .with_validators(vec![ParameterValidator::number()]);
        broker.register(spec).unwrap();
        let result = broker.invoke("t.sum", &[Value::from(1), Value::text("x")]);
        assert_eq!(
            result.error_message(),
            Some("varargs argument 2: expected number, got text")
        );
    }

    #[test]
    fn test_error_arguments_short_circuit() {
        let broker = FunctionBroker::new();
        broker.register(identity_spec("t.f", 1)).unwrap();
        let result = broker.invoke("t.f", &[Value::error("upstream")]);
        assert_eq!(result.error_message(), Some("upstream"));
    }

    #[test]
    fn test_panic_is_captured() {
        let broker = FunctionBroker::new();
        let spec = FunctionSpecification::new("t.boom", 0, |_args: &[Value]| {
            panic!("kaboom");
        });
        broker.register(spec).unwrap();
        let result = broker.invoke("t.boom", &[]);
        assert_eq!(
            result.error_message(),
            Some("t.boom execution failed: kaboom")
        );
    }

    #[test]
    fn test_secret_argument_taints_result() {
        let broker = FunctionBroker::new();
        broker.register(identity_spec("t.f", 1)).unwrap();
        let result = broker.invoke("t.f", &[Value::text("s").mark_secret()]);
        assert!(result.is_secret());
    }
}
