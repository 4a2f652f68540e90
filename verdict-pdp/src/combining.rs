//! Combining algorithms
//!
//! Deterministic reducers from per-policy decisions, in document order, to a
//! single decision. Obligations and advice are collected only from policies
//! whose verdict contributed to the final verdict; two `PERMIT`s carrying
//! different resource transforms are ambiguous and collapse to
//! `INDETERMINATE` (or the safe default under the unless-algorithms).

use futures_util::{future, stream, StreamExt};
use verdict_broker::combine_latest;
use verdict_core::{CombiningAlgorithm, Decision, Value};

use crate::evaluate::{PolicyDecision, PolicyDecisionStream};

/// Reduce decisions under the given algorithm.
pub fn combine(algorithm: CombiningAlgorithm, decisions: &[PolicyDecision]) -> PolicyDecision {
    match algorithm {
        CombiningAlgorithm::DenyOverrides => deny_overrides(decisions),
        CombiningAlgorithm::PermitOverrides => permit_overrides(decisions),
        CombiningAlgorithm::OnlyOneApplicable => only_one_applicable(decisions),
        CombiningAlgorithm::FirstApplicable => first_applicable(decisions),
        CombiningAlgorithm::DenyUnlessPermit => deny_unless_permit(decisions),
        CombiningAlgorithm::PermitUnlessDeny => permit_unless_deny(decisions),
    }
}

/// Lift [`combine`] over decision streams: every new per-policy decision
/// produces a freshly combined document decision.
pub fn combine_decision_streams(
    algorithm: CombiningAlgorithm,
    streams: Vec<PolicyDecisionStream>,
) -> PolicyDecisionStream {
    if streams.is_empty() {
        return Box::pin(stream::once(future::ready(combine(algorithm, &[]))));
    }
    Box::pin(
        combine_latest(streams).map(move |decisions| combine(algorithm, &decisions)),
    )
}

// ============================================================================
// THE SIX ALGORITHMS
// ============================================================================

fn deny_overrides(decisions: &[PolicyDecision]) -> PolicyDecision {
    if has(decisions, Decision::Deny) {
        return merged(decisions, Decision::Deny);
    }
    if has(decisions, Decision::Indeterminate) && !has(decisions, Decision::Permit) {
        return PolicyDecision::indeterminate();
    }
    if has(decisions, Decision::Permit) {
        return merged_permit(decisions).unwrap_or_else(PolicyDecision::indeterminate);
    }
    PolicyDecision::not_applicable()
}

fn permit_overrides(decisions: &[PolicyDecision]) -> PolicyDecision {
    if has(decisions, Decision::Permit) {
        return merged_permit(decisions).unwrap_or_else(PolicyDecision::indeterminate);
    }
    if has(decisions, Decision::Indeterminate) && !has(decisions, Decision::Deny) {
        return PolicyDecision::indeterminate();
    }
    if has(decisions, Decision::Deny) {
        return merged(decisions, Decision::Deny);
    }
    PolicyDecision::not_applicable()
}

fn only_one_applicable(decisions: &[PolicyDecision]) -> PolicyDecision {
    let mut applicable = decisions.iter().filter(|d| d.decision.is_applicable());
    match (applicable.next(), applicable.next()) {
        (None, _) => PolicyDecision::not_applicable(),
        (Some(single), None) => single.clone(),
        (Some(_), Some(_)) => PolicyDecision::indeterminate(),
    }
}

fn first_applicable(decisions: &[PolicyDecision]) -> PolicyDecision {
    decisions
        .iter()
        .find(|d| d.decision.is_applicable())
        .cloned()
        .unwrap_or_else(PolicyDecision::not_applicable)
}

/// `DENY` unless a clean `PERMIT` exists; never indeterminate.
fn deny_unless_permit(decisions: &[PolicyDecision]) -> PolicyDecision {
    if has(decisions, Decision::Permit) {
        if let Some(permit) = merged_permit(decisions) {
            return permit;
        }
    }
    merged(decisions, Decision::Deny)
}

/// `PERMIT` unless any `DENY` exists; transform ambiguity also denies.
fn permit_unless_deny(decisions: &[PolicyDecision]) -> PolicyDecision {
    if has(decisions, Decision::Deny) {
        return merged(decisions, Decision::Deny);
    }
    if has(decisions, Decision::Permit) {
        return merged_permit(decisions).unwrap_or_else(|| merged(decisions, Decision::Deny));
    }
    PolicyDecision::of(Decision::Permit)
}

// ============================================================================
// COLLECTION
// ============================================================================

fn has(decisions: &[PolicyDecision], decision: Decision) -> bool {
    decisions.iter().any(|d| d.decision == decision)
}

/// The combined decision for a verdict, with obligations and advice
/// concatenated in document order from the contributing policies only.
fn merged(decisions: &[PolicyDecision], decision: Decision) -> PolicyDecision {
    let mut obligations = Vec::new();
    let mut advice = Vec::new();
    for d in decisions.iter().filter(|d| d.decision == decision) {
        obligations.extend(d.obligations.iter().cloned());
        advice.extend(d.advice.iter().cloned());
    }
    PolicyDecision {
        decision,
        obligations,
        advice,
        resource: None,
    }
}

/// Merge the `PERMIT` contributors. `None` when more than one transforming
/// policy contributes differing resources.
fn merged_permit(decisions: &[PolicyDecision]) -> Option<PolicyDecision> {
    let transforms: Vec<&Value> = decisions
        .iter()
        .filter(|d| d.decision == Decision::Permit)
        .filter_map(|d| d.resource.as_ref())
        .collect();
    if transforms.windows(2).any(|pair| pair[0] != pair[1]) {
        return None;
    }
    let mut permit = merged(decisions, Decision::Permit);
    permit.resource = transforms.first().map(|v| (*v).clone());
    Some(permit)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn permit() -> PolicyDecision {
        PolicyDecision::of(Decision::Permit)
    }

    fn deny() -> PolicyDecision {
        PolicyDecision::of(Decision::Deny)
    }

    fn na() -> PolicyDecision {
        PolicyDecision::not_applicable()
    }

    fn indeterminate() -> PolicyDecision {
        PolicyDecision::indeterminate()
    }

    fn permit_with_transform(v: Value) -> PolicyDecision {
        PolicyDecision {
            resource: Some(v),
            ..permit()
        }
    }

    fn permit_with_obligation(v: Value) -> PolicyDecision {
        PolicyDecision {
            obligations: vec![v],
            ..permit()
        }
    }

    // Representative deny-overrides table.

    #[test]
    fn test_deny_overrides_deny_wins() {
        let result = combine(CombiningAlgorithm::DenyOverrides, &[permit(), deny()]);
        assert_eq!(result.decision, Decision::Deny);
        let result = combine(
            CombiningAlgorithm::DenyOverrides,
            &[deny(), indeterminate()],
        );
        assert_eq!(result.decision, Decision::Deny);
    }

    #[test]
    fn test_deny_overrides_permit_with_na() {
        let result = combine(CombiningAlgorithm::DenyOverrides, &[permit(), na()]);
        assert_eq!(result.decision, Decision::Permit);
    }

    #[test]
    fn test_deny_overrides_indeterminate_without_permit() {
        let result = combine(CombiningAlgorithm::DenyOverrides, &[na(), indeterminate()]);
        assert_eq!(result.decision, Decision::Indeterminate);
    }

    #[test]
    fn test_deny_overrides_all_not_applicable() {
        let result = combine(CombiningAlgorithm::DenyOverrides, &[na(), na()]);
        assert_eq!(result.decision, Decision::NotApplicable);
    }

    #[test]
    fn test_transform_uncertainty_is_indeterminate() {
        let result = combine(
            CombiningAlgorithm::DenyOverrides,
            &[
                permit_with_transform(Value::boolean(true)),
                permit_with_transform(Value::from(1)),
            ],
        );
        assert_eq!(result.decision, Decision::Indeterminate);
    }

    #[test]
    fn test_equal_transforms_are_not_ambiguous() {
        let result = combine(
            CombiningAlgorithm::DenyOverrides,
            &[
                permit_with_transform(Value::from(1)),
                permit_with_transform(Value::from(1)),
            ],
        );
        assert_eq!(result.decision, Decision::Permit);
        assert_eq!(result.resource, Some(Value::from(1)));
    }

    #[test]
    fn test_transform_with_plain_permit_keeps_transform() {
        let result = combine(
            CombiningAlgorithm::DenyOverrides,
            &[permit_with_transform(Value::from(1)), permit()],
        );
        assert_eq!(result.decision, Decision::Permit);
        assert_eq!(result.resource, Some(Value::from(1)));
    }

    #[test]
    fn test_obligations_collected_from_contributors_only() {
        let result = combine(
            CombiningAlgorithm::DenyOverrides,
            &[
                permit_with_obligation(Value::text("ob1")),
                PolicyDecision {
                    obligations: vec![Value::text("deny-ob")],
                    ..deny()
                },
                permit_with_obligation(Value::text("ob2")),
            ],
        );
        assert_eq!(result.decision, Decision::Deny);
        assert_eq!(result.obligations, vec![Value::text("deny-ob")]);

        let result = combine(
            CombiningAlgorithm::DenyOverrides,
            &[
                permit_with_obligation(Value::text("ob1")),
                permit_with_obligation(Value::text("ob2")),
            ],
        );
        assert_eq!(
            result.obligations,
            vec![Value::text("ob1"), Value::text("ob2")]
        );
    }

    #[test]
    fn test_permit_overrides_is_symmetric() {
        let result = combine(CombiningAlgorithm::PermitOverrides, &[permit(), deny()]);
        assert_eq!(result.decision, Decision::Permit);
        let result = combine(
            CombiningAlgorithm::PermitOverrides,
            &[na(), indeterminate()],
        );
        assert_eq!(result.decision, Decision::Indeterminate);
        let result = combine(CombiningAlgorithm::PermitOverrides, &[na(), deny()]);
        assert_eq!(result.decision, Decision::Deny);
    }

    #[test]
    fn test_only_one_applicable() {
        let result = combine(CombiningAlgorithm::OnlyOneApplicable, &[na(), permit()]);
        assert_eq!(result.decision, Decision::Permit);
        let result = combine(CombiningAlgorithm::OnlyOneApplicable, &[permit(), deny()]);
        assert_eq!(result.decision, Decision::Indeterminate);
        let result = combine(
            CombiningAlgorithm::OnlyOneApplicable,
            &[indeterminate(), permit()],
        );
        assert_eq!(result.decision, Decision::Indeterminate);
        let result = combine(CombiningAlgorithm::OnlyOneApplicable, &[na(), na()]);
        assert_eq!(result.decision, Decision::NotApplicable);
    }

    #[test]
    fn test_first_applicable_takes_document_order() {
        let result = combine(
            CombiningAlgorithm::FirstApplicable,
            &[na(), deny(), permit()],
        );
        assert_eq!(result.decision, Decision::Deny);
        let result = combine(CombiningAlgorithm::FirstApplicable, &[na(), na()]);
        assert_eq!(result.decision, Decision::NotApplicable);
    }

    #[test]
    fn test_deny_unless_permit_forces_default() {
        let result = combine(CombiningAlgorithm::DenyUnlessPermit, &[]);
        assert_eq!(result.decision, Decision::Deny);
        let result = combine(CombiningAlgorithm::DenyUnlessPermit, &[indeterminate()]);
        assert_eq!(result.decision, Decision::Deny);
        let result = combine(CombiningAlgorithm::DenyUnlessPermit, &[permit(), deny()]);
        assert_eq!(result.decision, Decision::Permit);
    }

    #[test]
    fn test_permit_unless_deny_forces_default() {
        let result = combine(CombiningAlgorithm::PermitUnlessDeny, &[]);
        assert_eq!(result.decision, Decision::Permit);
        let result = combine(CombiningAlgorithm::PermitUnlessDeny, &[indeterminate()]);
        assert_eq!(result.decision, Decision::Permit);
        let result = combine(CombiningAlgorithm::PermitUnlessDeny, &[permit(), deny()]);
        assert_eq!(result.decision, Decision::Deny);
    }

    #[test]
    fn test_unless_algorithms_deny_ambiguous_transforms() {
        let ambiguous = [
            permit_with_transform(Value::from(1)),
            permit_with_transform(Value::from(2)),
        ];
        let result = combine(CombiningAlgorithm::DenyUnlessPermit, &ambiguous);
        assert_eq!(result.decision, Decision::Deny);
        let result = combine(CombiningAlgorithm::PermitUnlessDeny, &ambiguous);
        assert_eq!(result.decision, Decision::Deny);
    }
}
