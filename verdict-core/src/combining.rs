//! Combining algorithm names

use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::error::UnknownAlgorithmError;

/// The deterministic reducers from per-policy decisions to one document (or
/// PDP) decision. The string forms are the stable configuration names.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum CombiningAlgorithm {
    #[serde(rename = "deny-overrides")]
    DenyOverrides,
    #[serde(rename = "permit-overrides")]
    PermitOverrides,
    #[serde(rename = "only-one-applicable")]
    OnlyOneApplicable,
    #[serde(rename = "deny-unless-permit")]
    DenyUnlessPermit,
    #[serde(rename = "permit-unless-deny")]
    PermitUnlessDeny,
    #[serde(rename = "first-applicable")]
    FirstApplicable,
}

impl CombiningAlgorithm {
    pub fn as_str(&self) -> &'static str {
        match self {
            CombiningAlgorithm::DenyOverrides => "deny-overrides",
            CombiningAlgorithm::PermitOverrides => "permit-overrides",
            CombiningAlgorithm::OnlyOneApplicable => "only-one-applicable",
            CombiningAlgorithm::DenyUnlessPermit => "deny-unless-permit",
            CombiningAlgorithm::PermitUnlessDeny => "permit-unless-deny",
            CombiningAlgorithm::FirstApplicable => "first-applicable",
        }
    }
}

impl FromStr for CombiningAlgorithm {
    type Err = UnknownAlgorithmError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "deny-overrides" => Ok(CombiningAlgorithm::DenyOverrides),
            "permit-overrides" => Ok(CombiningAlgorithm::PermitOverrides),
            "only-one-applicable" => Ok(CombiningAlgorithm::OnlyOneApplicable),
            "deny-unless-permit" => Ok(CombiningAlgorithm::DenyUnlessPermit),
            "permit-unless-deny" => Ok(CombiningAlgorithm::PermitUnlessDeny),
            "first-applicable" => Ok(CombiningAlgorithm::FirstApplicable),
            other => Err(UnknownAlgorithmError(other.to_string())),
        }
    }
}

impl std::fmt::Display for CombiningAlgorithm {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_round_trip_all_names() {
        let all = [
            CombiningAlgorithm::DenyOverrides,
            CombiningAlgorithm::PermitOverrides,
            CombiningAlgorithm::OnlyOneApplicable,
            CombiningAlgorithm::DenyUnlessPermit,
            CombiningAlgorithm::PermitUnlessDeny,
            CombiningAlgorithm::FirstApplicable,
        ];
        for algorithm in all {
            assert_eq!(
                algorithm.as_str().parse::<CombiningAlgorithm>().unwrap(),
                algorithm
            );
        }
    }

    #[test]
    fn test_unknown_name_is_rejected() {
        let err = "strict-overrides".parse::<CombiningAlgorithm>().unwrap_err();
        assert_eq!(
            err.to_string(),
            "unknown combining algorithm: strict-overrides"
        );
    }

    #[test]
    fn test_serde_uses_hyphenated_names() {
        assert_eq!(
            serde_json::to_string(&CombiningAlgorithm::DenyUnlessPermit).unwrap(),
            "\"deny-unless-permit\""
        );
    }
}
