//! Attribute finder invocations and specifications

use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use verdict_core::Value;

/// Per-subscription timing policy for an attribute stream.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct InvocationSettings {
    /// If no value arrives before this deadline, the stream synthesizes an
    /// `Undefined` without cancelling the PIP source.
    pub initial_timeout: Duration,
    /// Delay before resubscribing after the PIP source completes (long-poll).
    pub poll_interval: Duration,
    /// Base delay for exponential retry backoff after an erroring source.
    pub backoff: Duration,
    /// Maximum number of retry attempts before the stream terminates with an
    /// error value.
    pub retries: u32,
}

impl Default for InvocationSettings {
    fn default() -> Self {
        Self {
            initial_timeout: Duration::from_millis(500),
            poll_interval: Duration::from_secs(30),
            backoff: Duration::from_secs(1),
            retries: 3,
        }
    }
}

/// The key identifying one attribute stream: which attribute, applied to
/// which entity, with which arguments, under which PDP configuration.
///
/// Two equal invocations share a single PIP subscription unless `fresh`
/// forces a private stream.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct AttributeFinderInvocation {
    pub pdp_config_id: String,
    pub fqn: String,
    /// `None` denotes an environment attribute.
    pub entity: Option<Value>,
    pub arguments: Vec<Value>,
    pub variables: BTreeMap<String, Value>,
    pub settings: InvocationSettings,
    /// Bypass the shared stream index and connect a private PIP subscription.
    pub fresh: bool,
}

impl AttributeFinderInvocation {
    pub fn environment(pdp_config_id: impl Into<String>, fqn: impl Into<String>) -> Self {
        Self {
            pdp_config_id: pdp_config_id.into(),
            fqn: fqn.into(),
            entity: None,
            arguments: Vec::new(),
            variables: BTreeMap::new(),
            settings: InvocationSettings::default(),
            fresh: false,
        }
    }

    pub fn of_entity(
        pdp_config_id: impl Into<String>,
        fqn: impl Into<String>,
        entity: Value,
    ) -> Self {
        Self {
            entity: Some(entity),
            ..Self::environment(pdp_config_id, fqn)
        }
    }

    pub fn with_arguments(mut self, arguments: Vec<Value>) -> Self {
        self.arguments = arguments;
        self
    }

    pub fn with_variables(mut self, variables: BTreeMap<String, Value>) -> Self {
        self.variables = variables;
        self
    }

    pub fn with_settings(mut self, settings: InvocationSettings) -> Self {
        self.settings = settings;
        self
    }

    pub fn fresh(mut self) -> Self {
        self.fresh = true;
        self
    }

    pub fn is_environment(&self) -> bool {
        self.entity.is_none()
    }
}

impl fmt::Display for AttributeFinderInvocation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if let Some(entity) = &self.entity {
            write!(f, "{entity}.")?;
        }
        write!(f, "<{}", self.fqn)?;
        if !self.arguments.is_empty() {
            write!(f, "(")?;
            for (i, arg) in self.arguments.iter().enumerate() {
                if i > 0 {
                    write!(f, ",")?;
                }
                write!(f, "{arg}")?;
            }
            write!(f, ")")?;
        }
        write!(f, ">")
    }
}

/// Validator applied to an invocation's entity or a single argument before a
/// PIP is considered a match.
pub type ValueValidator = Arc<dyn Fn(&Value) -> bool + Send + Sync>;

/// What a registered Policy Information Point claims to provide.
#[derive(Clone)]
pub struct AttributeFinderSpecification {
    pub fqn: String,
    pub is_environment: bool,
    /// `-1` means variadic.
    pub num_arguments: i32,
    pub takes_variables: bool,
    entity_validator: ValueValidator,
    parameter_validators: Vec<ValueValidator>,
}

impl fmt::Debug for AttributeFinderSpecification {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AttributeFinderSpecification")
            .field("fqn", &self.fqn)
            .field("is_environment", &self.is_environment)
            .field("num_arguments", &self.num_arguments)
            .field("takes_variables", &self.takes_variables)
            .finish_non_exhaustive()
    }
}

impl AttributeFinderSpecification {
    pub fn new(fqn: impl Into<String>, is_environment: bool, num_arguments: i32) -> Self {
        Self {
            fqn: fqn.into(),
            is_environment,
            num_arguments,
            takes_variables: false,
            entity_validator: Arc::new(|_| true),
            parameter_validators: Vec::new(),
        }
    }

    pub fn with_takes_variables(mut self, takes_variables: bool) -> Self {
        self.takes_variables = takes_variables;
        self
    }

    pub fn with_entity_validator(mut self, validator: ValueValidator) -> Self {
        self.entity_validator = validator;
        self
    }

    pub fn with_parameter_validators(mut self, validators: Vec<ValueValidator>) -> Self {
        self.parameter_validators = validators;
        self
    }

    pub fn is_variadic(&self) -> bool {
        self.num_arguments < 0
    }

    /// Whether this specification serves the given invocation.
    pub fn matches(&self, invocation: &AttributeFinderInvocation) -> bool {
        if self.fqn != invocation.fqn {
            return false;
        }
        if self.is_environment != invocation.is_environment() {
            return false;
        }
        if !self.is_variadic() && self.num_arguments as usize != invocation.arguments.len() {
            return false;
        }
        if let Some(entity) = &invocation.entity {
            if !(self.entity_validator)(entity) {
                return false;
            }
        }
        for (i, arg) in invocation.arguments.iter().enumerate() {
            if let Some(validator) = self.parameter_validators.get(i) {
                if !validator(arg) {
                    return false;
                }
            }
        }
        true
    }

    /// Two specifications collide iff they share name and environment flag
    /// and their arities overlap (either variadic, or equal count).
    pub fn collides_with(&self, other: &AttributeFinderSpecification) -> bool {
        self.fqn == other.fqn
            && self.is_environment == other.is_environment
            && (self.is_variadic()
                || other.is_variadic()
                || self.num_arguments == other.num_arguments)
    }

    /// Structural identity used when withdrawing a registration.
    pub fn same_registration(&self, other: &AttributeFinderSpecification) -> bool {
        self.fqn == other.fqn
            && self.is_environment == other.is_environment
            && self.num_arguments == other.num_arguments
    }
}
