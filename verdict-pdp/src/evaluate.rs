//! Policy and policy-set evaluation
//!
//! A policy evaluates in three stages: the pure target gates applicability,
//! then the condition and every obligation/advice/transform expression are
//! joined with combine-latest so that any streaming attribute pushes a fresh
//! per-policy decision downstream.

use futures_util::{future, stream, StreamExt};
use verdict_broker::{combine_latest, BoxedStream, ValueStream};
use verdict_core::{AuthorizationDecision, Decision, Value};
use verdict_dsl::parser::ast::Entitlement;
use verdict_dsl::{
    CompiledBody, CompiledDocument, CompiledExpression, CompiledPolicy, CompiledPolicySet,
    EvaluationContext,
};

/// The decision one policy (or one document) contributes to combining.
/// Obligations, advice and the transformed resource stay in the value model
/// until the final wire conversion.
#[derive(Debug, Clone, PartialEq)]
pub struct PolicyDecision {
    pub decision: Decision,
    pub obligations: Vec<Value>,
    pub advice: Vec<Value>,
    pub resource: Option<Value>,
}

impl PolicyDecision {
    pub fn of(decision: Decision) -> Self {
        Self {
            decision,
            obligations: Vec::new(),
            advice: Vec::new(),
            resource: None,
        }
    }

    pub fn not_applicable() -> Self {
        Self::of(Decision::NotApplicable)
    }

    pub fn indeterminate() -> Self {
        Self::of(Decision::Indeterminate)
    }

    /// Convert to the wire decision. Values reaching this point are
    /// JSON-representable; a conversion failure degrades to INDETERMINATE
    /// rather than dropping a constraint silently.
    pub fn to_authorization_decision(&self) -> AuthorizationDecision {
        let obligations: Option<Vec<serde_json::Value>> =
            self.obligations.iter().map(Value::to_json).collect();
        let advice: Option<Vec<serde_json::Value>> =
            self.advice.iter().map(Value::to_json).collect();
        let resource = match &self.resource {
            None => None,
            Some(value) => match value.to_json() {
                Some(json) => Some(json),
                None => return AuthorizationDecision::indeterminate(),
            },
        };
        let (Some(obligations), Some(advice)) = (obligations, advice) else {
            return AuthorizationDecision::indeterminate();
        };
        let mut decision = AuthorizationDecision::new(self.decision)
            .with_obligations(obligations)
            .with_advice(advice);
        decision.resource = resource;
        decision
    }
}

/// A stream of per-policy decisions.
pub type PolicyDecisionStream = BoxedStream<PolicyDecision>;

fn once_decision(decision: PolicyDecision) -> PolicyDecisionStream {
    Box::pin(stream::once(future::ready(decision)))
}

fn entitlement_decision(entitlement: Entitlement) -> Decision {
    match entitlement {
        Entitlement::Permit => Decision::Permit,
        Entitlement::Deny => Decision::Deny,
    }
}

/// Evaluate one policy against the context.
///
/// Target false → `NOT_APPLICABLE`; target error → `INDETERMINATE`. The
/// remaining components are joined with combine-latest, so a policy without
/// streaming subexpressions emits exactly one decision.
pub fn evaluate_policy(policy: &CompiledPolicy, ctx: &EvaluationContext) -> PolicyDecisionStream {
    match policy.target.evaluate(ctx).as_boolean() {
        Some(true) => {}
        Some(false) => return once_decision(PolicyDecision::not_applicable()),
        None => return once_decision(PolicyDecision::indeterminate()),
    }

    let condition = policy
        .condition
        .clone()
        .unwrap_or(CompiledExpression::Constant(Value::boolean(true)));
    let obligation_count = policy.obligations.len();
    let advice_count = policy.advice.len();
    let has_transform = policy.transform.is_some();

    let mut components: Vec<ValueStream> = Vec::with_capacity(2 + obligation_count + advice_count);
    components.push(condition.open_stream(ctx));
    for obligation in &policy.obligations {
        components.push(obligation.open_stream(ctx));
    }
    for advice in &policy.advice {
        components.push(advice.open_stream(ctx));
    }
    if let Some(transform) = &policy.transform {
        components.push(transform.open_stream(ctx));
    }

    let entitlement = policy.entitlement;
    Box::pin(combine_latest(components).map(move |values| {
        assemble_decision(entitlement, obligation_count, advice_count, has_transform, &values)
    }))
}

/// Map one combine-latest snapshot onto a policy decision, applying the
/// error rules: condition error or non-boolean → `INDETERMINATE`; any error
/// or undefined among obligations, advice, or the transform → `INDETERMINATE`.
fn assemble_decision(
    entitlement: Entitlement,
    obligation_count: usize,
    advice_count: usize,
    has_transform: bool,
    values: &[Value],
) -> PolicyDecision {
    match values[0].as_boolean() {
        Some(true) => {}
        Some(false) => return PolicyDecision::not_applicable(),
        None => return PolicyDecision::indeterminate(),
    }

    let obligations = &values[1..1 + obligation_count];
    let advice = &values[1 + obligation_count..1 + obligation_count + advice_count];
    if obligations
        .iter()
        .chain(advice)
        .any(|v| v.is_error() || v.is_undefined())
    {
        return PolicyDecision::indeterminate();
    }

    let resource = if has_transform {
        let transformed = values.last().expect("transform component present").clone();
        if transformed.is_error() || transformed.is_undefined() {
            return PolicyDecision::indeterminate();
        }
        Some(transformed)
    } else {
        None
    };

    PolicyDecision {
        decision: entitlement_decision(entitlement),
        obligations: obligations.to_vec(),
        advice: advice.to_vec(),
        resource,
    }
}

/// Evaluate a policy set: the `for` target gates the whole set, then the
/// member decisions are combined under the set's algorithm.
pub fn evaluate_policy_set(
    set: &CompiledPolicySet,
    ctx: &EvaluationContext,
) -> PolicyDecisionStream {
    if let Some(target) = &set.target {
        match target.evaluate(ctx).as_boolean() {
            Some(true) => {}
            Some(false) => return once_decision(PolicyDecision::not_applicable()),
            None => return once_decision(PolicyDecision::indeterminate()),
        }
    }
    let members: Vec<PolicyDecisionStream> = set
        .policies
        .iter()
        .map(|policy| evaluate_policy(policy, ctx))
        .collect();
    crate::combining::combine_decision_streams(set.algorithm, members)
}

/// Evaluate a whole document.
pub fn evaluate_document(
    document: &CompiledDocument,
    ctx: &EvaluationContext,
) -> PolicyDecisionStream {
    match &document.body {
        CompiledBody::Policy(policy) => evaluate_policy(policy, ctx),
        CompiledBody::PolicySet(set) => evaluate_policy_set(set, ctx),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use verdict_broker::{AttributeBroker, FunctionBroker};
    use verdict_core::AuthorizationSubscription;
    use verdict_dsl::{CompilationContext, DocumentCompiler};

    fn compile(source: &str) -> CompiledDocument {
        let mut ctx = CompilationContext::new(
            Arc::new(FunctionBroker::with_standard_library()),
            Arc::new(AttributeBroker::new()),
        );
        DocumentCompiler::new(&mut ctx)
            .compile(Some("test"), source)
            .expect("compiles")
    }

    fn context() -> EvaluationContext {
        EvaluationContext::new(
            AuthorizationSubscription::new(
                serde_json::json!({"role": "admin"}),
                serde_json::json!("read"),
                serde_json::Value::Null,
                serde_json::Value::Null,
            )
            .to_values(),
            Arc::new(AttributeBroker::new()),
            Arc::new(FunctionBroker::with_standard_library()),
        )
    }

    async fn first_decision(source: &str) -> PolicyDecision {
        let document = compile(source);
        evaluate_document(&document, &context())
            .next()
            .await
            .expect("one decision")
    }

    #[tokio::test]
    async fn test_plain_permit() {
        let decision = first_decision("policy \"P\" permit").await;
        assert_eq!(decision.decision, Decision::Permit);
        assert!(decision.obligations.is_empty());
    }

    #[tokio::test]
    async fn test_false_target_is_not_applicable() {
        let decision = first_decision("policy \"P\" permit false").await;
        assert_eq!(decision.decision, Decision::NotApplicable);
    }

    #[tokio::test]
    async fn test_erroring_target_is_indeterminate() {
        let decision = first_decision("policy \"P\" permit 1 / 0 == 1").await;
        assert_eq!(decision.decision, Decision::Indeterminate);
    }

    #[tokio::test]
    async fn test_false_condition_is_not_applicable() {
        let decision = first_decision("policy \"P\" deny where true == false;").await;
        assert_eq!(decision.decision, Decision::NotApplicable);
    }

    #[tokio::test]
    async fn test_erroring_condition_is_indeterminate() {
        let decision = first_decision("policy \"P\" permit where \"a\" < 5;").await;
        assert_eq!(decision.decision, Decision::Indeterminate);
    }

    #[tokio::test]
    async fn test_obligation_error_is_indeterminate() {
        let decision = first_decision("policy \"P\" permit obligation 1 / 0").await;
        assert_eq!(decision.decision, Decision::Indeterminate);
    }

    #[tokio::test]
    async fn test_transform_is_carried() {
        let decision =
            first_decision("policy \"P\" permit transform { \"filtered\": true }").await;
        assert_eq!(decision.decision, Decision::Permit);
        assert!(decision.resource.is_some());
    }

    #[tokio::test]
    async fn test_target_uses_subscription() {
        let decision = first_decision("policy \"P\" permit subject.role == \"admin\"").await;
        assert_eq!(decision.decision, Decision::Permit);
        let decision = first_decision("policy \"P\" permit subject.role == \"user\"").await;
        assert_eq!(decision.decision, Decision::NotApplicable);
    }

    #[tokio::test]
    async fn test_wire_conversion_keeps_constraints() {
        let decision = first_decision(
            "policy \"P\" permit obligation \"log\" advice \"mail\" transform 42",
        )
        .await;
        let wire = decision.to_authorization_decision();
        assert_eq!(wire.decision, Decision::Permit);
        assert_eq!(wire.obligations, Some(vec![serde_json::json!("log")]));
        assert_eq!(wire.advice, Some(vec![serde_json::json!("mail")]));
        assert_eq!(wire.resource, Some(serde_json::json!(42)));
    }
}
