//! Authorization subscriptions and decisions

use serde::{Deserialize, Serialize};

use crate::value::Value;

// ============================================================================
// SUBSCRIPTION
// ============================================================================

/// The four-tuple a Policy Enforcement Point submits to open a decision
/// stream. Each component is an arbitrary JSON value.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct AuthorizationSubscription {
    pub subject: serde_json::Value,
    pub action: serde_json::Value,
    pub resource: serde_json::Value,
    pub environment: serde_json::Value,
}

impl AuthorizationSubscription {
    pub fn new(
        subject: serde_json::Value,
        action: serde_json::Value,
        resource: serde_json::Value,
        environment: serde_json::Value,
    ) -> Self {
        Self {
            subject,
            action,
            resource,
            environment,
        }
    }

    /// Convert the four components into engine values once, at subscription
    /// time.
    pub fn to_values(&self) -> SubscriptionValues {
        SubscriptionValues {
            subject: Value::from_json(&self.subject),
            action: Value::from_json(&self.action),
            resource: Value::from_json(&self.resource),
            environment: Value::from_json(&self.environment),
        }
    }
}

/// The subscription converted into the engine's value model.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SubscriptionValues {
    pub subject: Value,
    pub action: Value,
    pub resource: Value,
    pub environment: Value,
}

// ============================================================================
// DECISION
// ============================================================================

/// The verdict of a policy, a document, or the whole PDP.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Decision {
    Permit,
    Deny,
    NotApplicable,
    Indeterminate,
}

impl Decision {
    /// A decision is applicable if it is anything but `NOT_APPLICABLE`.
    pub fn is_applicable(&self) -> bool {
        !matches!(self, Decision::NotApplicable)
    }
}

impl std::fmt::Display for Decision {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Decision::Permit => "PERMIT",
            Decision::Deny => "DENY",
            Decision::NotApplicable => "NOT_APPLICABLE",
            Decision::Indeterminate => "INDETERMINATE",
        };
        write!(f, "{s}")
    }
}

/// A decision delivered to the PEP. This is the stable wire format:
///
/// ```json
/// { "decision": "PERMIT", "obligations": [...], "advice": [...], "resource": ... }
/// ```
///
/// Absent optional fields are omitted from the serialized form.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AuthorizationDecision {
    pub decision: Decision,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub obligations: Option<Vec<serde_json::Value>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub advice: Option<Vec<serde_json::Value>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub resource: Option<serde_json::Value>,
}

impl AuthorizationDecision {
    pub fn new(decision: Decision) -> Self {
        Self {
            decision,
            obligations: None,
            advice: None,
            resource: None,
        }
    }

    pub fn permit() -> Self {
        Self::new(Decision::Permit)
    }

    pub fn deny() -> Self {
        Self::new(Decision::Deny)
    }

    pub fn not_applicable() -> Self {
        Self::new(Decision::NotApplicable)
    }

    pub fn indeterminate() -> Self {
        Self::new(Decision::Indeterminate)
    }

    pub fn with_obligations(mut self, obligations: Vec<serde_json::Value>) -> Self {
        self.obligations = if obligations.is_empty() {
            None
        } else {
            Some(obligations)
        };
        self
    }

    pub fn with_advice(mut self, advice: Vec<serde_json::Value>) -> Self {
        self.advice = if advice.is_empty() { None } else { Some(advice) };
        self
    }

    pub fn with_resource(mut self, resource: serde_json::Value) -> Self {
        self.resource = Some(resource);
        self
    }
}

/// How much evaluation detail decision streams carry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum TraceLevel {
    #[default]
    Off,
    Standard,
    Coverage,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_decision_wire_names() {
        assert_eq!(
            serde_json::to_string(&Decision::NotApplicable).unwrap(),
            "\"NOT_APPLICABLE\""
        );
        assert_eq!(
            serde_json::to_string(&Decision::Indeterminate).unwrap(),
            "\"INDETERMINATE\""
        );
    }

    #[test]
    fn test_optional_fields_are_omitted() {
        let decision = AuthorizationDecision::permit();
        assert_eq!(
            serde_json::to_string(&decision).unwrap(),
            r#"{"decision":"PERMIT"}"#
        );
    }

    #[test]
    fn test_full_wire_shape() {
        let decision = AuthorizationDecision::permit()
            .with_obligations(vec![serde_json::json!("log_access")])
            .with_resource(serde_json::json!({"filtered": true}));
        let json: serde_json::Value = serde_json::to_value(&decision).unwrap();
        assert_eq!(
            json,
            serde_json::json!({
                "decision": "PERMIT",
                "obligations": ["log_access"],
                "resource": {"filtered": true}
            })
        );
    }

    #[test]
    fn test_empty_obligations_collapse_to_absent() {
        let decision = AuthorizationDecision::deny().with_obligations(vec![]);
        assert_eq!(decision.obligations, None);
    }

    #[test]
    fn test_subscription_deserializes_from_wire() {
        let sub: AuthorizationSubscription = serde_json::from_str(
            r#"{"subject":"alice","action":"read","resource":"doc","environment":null}"#,
        )
        .unwrap();
        assert_eq!(sub.subject, serde_json::json!("alice"));
        let values = sub.to_values();
        assert_eq!(values.action, crate::Value::text("read"));
    }
}
