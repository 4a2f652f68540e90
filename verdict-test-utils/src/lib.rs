//! VERDICT Test Utilities
//!
//! Centralized test infrastructure for the VERDICT workspace:
//! - Proptest generators for values and decisions
//! - Mock Policy Information Points
//! - Subscription fixtures for common scenarios

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use bigdecimal::BigDecimal;
use futures_util::stream;
use proptest::prelude::*;

// Re-export core types for convenience
pub use verdict_core::{
    AuthorizationDecision, AuthorizationSubscription, CombiningAlgorithm, Decision, Value,
    ValueKind, ValueMetadata,
};

pub use verdict_broker::{
    AttributeBroker, AttributeFinderInvocation, AttributeFinderSpecification, FunctionBroker,
    PolicyInformationPoint, ValueStream,
};

pub use verdict_pdp::{PolicyDecision, PolicyDecisionPoint};

// ============================================================================
// MOCK POLICY INFORMATION POINTS
// ============================================================================

/// A PIP that replays a fixed value sequence on every (re)connection and
/// counts how often it was invoked.
pub struct MockPolicyInformationPoint {
    values: Vec<Value>,
    invocations: Arc<AtomicUsize>,
}

impl MockPolicyInformationPoint {
    pub fn new(values: Vec<Value>) -> Self {
        Self {
            values,
            invocations: Arc::new(AtomicUsize::new(0)),
        }
    }

    /// A PIP emitting a single constant value.
    pub fn constant(value: Value) -> Self {
        Self::new(vec![value])
    }

    /// A PIP whose stream completes without emitting anything.
    pub fn empty() -> Self {
        Self::new(Vec::new())
    }

    /// How many times the broker opened a stream on this PIP.
    pub fn invocation_count(&self) -> usize {
        self.invocations.load(Ordering::SeqCst)
    }

    /// Handle on the invocation counter, for asserting after the PIP has
    /// been moved into the broker.
    pub fn invocation_counter(&self) -> Arc<AtomicUsize> {
        Arc::clone(&self.invocations)
    }
}

impl PolicyInformationPoint for MockPolicyInformationPoint {
    fn invoke(&self, _invocation: &AttributeFinderInvocation) -> ValueStream {
        self.invocations.fetch_add(1, Ordering::SeqCst);
        Box::pin(stream::iter(self.values.clone()))
    }
}

// ============================================================================
// FIXTURES
// ============================================================================

/// A subscription with text components, the common test shape.
pub fn subscription(subject: &str, action: &str, resource: &str) -> AuthorizationSubscription {
    AuthorizationSubscription::new(
        serde_json::json!(subject),
        serde_json::json!(action),
        serde_json::json!(resource),
        serde_json::Value::Null,
    )
}

/// An all-null subscription.
pub fn null_subscription() -> AuthorizationSubscription {
    AuthorizationSubscription::default()
}

// ============================================================================
// PROPTEST GENERATORS
// ============================================================================

/// Scalar values only.
pub fn arb_leaf_value() -> impl Strategy<Value = Value> {
    prop_oneof![
        Just(Value::null()),
        any::<bool>().prop_map(Value::boolean),
        any::<i64>().prop_map(|n| Value::number(BigDecimal::from(n))),
        "[a-zA-Z0-9_ ]{0,12}".prop_map(Value::text),
    ]
}

/// JSON-representable values with nested containers.
pub fn arb_value() -> impl Strategy<Value = Value> {
    arb_leaf_value().prop_recursive(3, 16, 4, |inner| {
        prop_oneof![
            prop::collection::vec(inner.clone(), 0..4).prop_map(Value::array),
            prop::collection::btree_map("[a-z]{1,5}", inner, 0..4)
                .prop_map(|m| Value::object(m.into_iter().collect::<BTreeMap<_, _>>())),
        ]
    })
}

pub fn arb_decision() -> impl Strategy<Value = Decision> {
    prop_oneof![
        Just(Decision::Permit),
        Just(Decision::Deny),
        Just(Decision::NotApplicable),
        Just(Decision::Indeterminate),
    ]
}

pub fn arb_combining_algorithm() -> impl Strategy<Value = CombiningAlgorithm> {
    prop_oneof![
        Just(CombiningAlgorithm::DenyOverrides),
        Just(CombiningAlgorithm::PermitOverrides),
        Just(CombiningAlgorithm::OnlyOneApplicable),
        Just(CombiningAlgorithm::DenyUnlessPermit),
        Just(CombiningAlgorithm::PermitUnlessDeny),
        Just(CombiningAlgorithm::FirstApplicable),
    ]
}

/// Per-policy decisions with occasional obligations and transforms.
pub fn arb_policy_decision() -> impl Strategy<Value = PolicyDecision> {
    (
        arb_decision(),
        prop::collection::vec(arb_leaf_value(), 0..3),
        prop::collection::vec(arb_leaf_value(), 0..2),
        prop::option::of(arb_leaf_value()),
    )
        .prop_map(|(decision, obligations, advice, resource)| PolicyDecision {
            decision,
            obligations,
            advice,
            resource,
        })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_subscription_fixture_shape() {
        let sub = subscription("alice", "read", "report");
        let values = sub.to_values();
        assert_eq!(values.subject, Value::text("alice"));
        assert_eq!(values.environment, Value::null());
    }

    #[test]
    fn test_mock_pip_counts_invocations() {
        let pip = MockPolicyInformationPoint::constant(Value::from(1));
        assert_eq!(pip.invocation_count(), 0);
        let _stream = pip.invoke(&AttributeFinderInvocation::environment("pdp", "a.b"));
        assert_eq!(pip.invocation_count(), 1);
    }
}
