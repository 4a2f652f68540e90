//! Compiled expression model and evaluation context
//!
//! Compilation reduces every AST expression to one of three shapes:
//!
//! - `Constant`: fully folded at compile time.
//! - `Pure`: deterministic per evaluation context, no streaming. The
//!   `subscription_scoped` flag marks expressions whose value depends on the
//!   subscription, variables, or the relative node; those are never folded.
//! - `Stream`: produces a sequence of values over time (attribute finders
//!   and anything built on top of them).

use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;

use verdict_broker::{
    once_value, AttributeBroker, FunctionBroker, InvocationSettings, ValueStream,
};
use verdict_core::{SubscriptionValues, TraceLevel, Value};

/// Everything an expression may consult at evaluation time.
#[derive(Clone)]
pub struct EvaluationContext {
    pub subscription: Arc<SubscriptionValues>,
    pub attribute_broker: Arc<AttributeBroker>,
    pub function_broker: Arc<FunctionBroker>,
    /// PDP-configuration variables, visible to every document.
    pub variables: Arc<BTreeMap<String, Value>>,
    /// The current element bound by a subtemplate (`@`).
    pub relative_node: Option<Value>,
    pub pdp_config_id: Arc<str>,
    pub attribute_settings: InvocationSettings,
    pub trace_level: TraceLevel,
}

impl EvaluationContext {
    pub fn new(
        subscription: SubscriptionValues,
        attribute_broker: Arc<AttributeBroker>,
        function_broker: Arc<FunctionBroker>,
    ) -> Self {
        Self {
            subscription: Arc::new(subscription),
            attribute_broker,
            function_broker,
            variables: Arc::new(BTreeMap::new()),
            relative_node: None,
            pdp_config_id: Arc::from("default"),
            attribute_settings: InvocationSettings::default(),
            trace_level: TraceLevel::Off,
        }
    }

    pub fn with_variables(mut self, variables: BTreeMap<String, Value>) -> Self {
        self.variables = Arc::new(variables);
        self
    }

    pub fn with_pdp_config_id(mut self, id: impl Into<Arc<str>>) -> Self {
        self.pdp_config_id = id.into();
        self
    }

    pub fn with_attribute_settings(mut self, settings: InvocationSettings) -> Self {
        self.attribute_settings = settings;
        self
    }

    pub fn with_trace_level(mut self, trace_level: TraceLevel) -> Self {
        self.trace_level = trace_level;
        self
    }

    /// A derived context with the relative node bound.
    pub fn with_relative_node(&self, node: Value) -> Self {
        let mut derived = self.clone();
        derived.relative_node = Some(node);
        derived
    }

    /// Look up a PDP-configuration variable.
    pub fn variable(&self, name: &str) -> Option<&Value> {
        self.variables.get(name)
    }
}

/// A deterministic, non-streaming expression.
#[derive(Clone)]
pub struct PureExpression {
    eval: Arc<dyn Fn(&EvaluationContext) -> Value + Send + Sync>,
    subscription_scoped: bool,
}

impl PureExpression {
    pub fn new(
        subscription_scoped: bool,
        eval: impl Fn(&EvaluationContext) -> Value + Send + Sync + 'static,
    ) -> Self {
        Self {
            eval: Arc::new(eval),
            subscription_scoped,
        }
    }

    pub fn evaluate(&self, ctx: &EvaluationContext) -> Value {
        (self.eval)(ctx)
    }

    /// `true` forbids constant folding: the value depends on the
    /// subscription, variables, or the relative node.
    pub fn subscription_scoped(&self) -> bool {
        self.subscription_scoped
    }
}

impl fmt::Debug for PureExpression {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PureExpression")
            .field("subscription_scoped", &self.subscription_scoped)
            .finish_non_exhaustive()
    }
}

/// An expression producing a sequence of values over time.
#[derive(Clone)]
pub struct StreamExpression {
    open: Arc<dyn Fn(&EvaluationContext) -> ValueStream + Send + Sync>,
}

impl StreamExpression {
    pub fn new(open: impl Fn(&EvaluationContext) -> ValueStream + Send + Sync + 'static) -> Self {
        Self {
            open: Arc::new(open),
        }
    }

    pub fn open(&self, ctx: &EvaluationContext) -> ValueStream {
        (self.open)(ctx)
    }
}

impl fmt::Debug for StreamExpression {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("StreamExpression").finish_non_exhaustive()
    }
}

/// The compiled form of one expression.
#[derive(Debug, Clone)]
pub enum CompiledExpression {
    Constant(Value),
    Pure(PureExpression),
    Stream(StreamExpression),
}

impl CompiledExpression {
    pub fn constant_value(&self) -> Option<&Value> {
        match self {
            CompiledExpression::Constant(v) => Some(v),
            _ => None,
        }
    }

    pub fn is_stream(&self) -> bool {
        matches!(self, CompiledExpression::Stream(_))
    }

    /// Whether the value depends on subscription state. Streams always do.
    pub fn subscription_scoped(&self) -> bool {
        match self {
            CompiledExpression::Constant(_) => false,
            CompiledExpression::Pure(p) => p.subscription_scoped(),
            CompiledExpression::Stream(_) => true,
        }
    }

    /// Evaluate in a pure context. Streaming expressions cannot be evaluated
    /// this way; callers that forbid streams reject them at compile time.
    pub fn evaluate(&self, ctx: &EvaluationContext) -> Value {
        match self {
            CompiledExpression::Constant(v) => v.clone(),
            CompiledExpression::Pure(p) => p.evaluate(ctx),
            CompiledExpression::Stream(_) => {
                Value::error("streaming expression in pure evaluation context")
            }
        }
    }

    /// Lift to a stream: constants and pure expressions become one-shot
    /// streams; stream expressions open their underlying flux.
    pub fn open_stream(&self, ctx: &EvaluationContext) -> ValueStream {
        match self {
            CompiledExpression::Constant(v) => once_value(v.clone()),
            CompiledExpression::Pure(p) => once_value(p.evaluate(ctx)),
            CompiledExpression::Stream(s) => s.open(ctx),
        }
    }
}
