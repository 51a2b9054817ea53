use crate::error::BankError;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};

/// Risk snapshot for a borrowing entity.
///
/// Scores live in `[0, 1]`: higher `war_risk` means more risk, higher
/// `reputation` means less. Profiles are read-only; the core never persists
/// them beyond one workflow run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RiskProfile {
    pub entity_name: String,
    pub war_risk: f64,
    pub reputation: f64,
}

impl RiskProfile {
    pub fn new(entity_name: impl Into<String>, war_risk: f64, reputation: f64) -> Self {
        Self {
            entity_name: entity_name.into(),
            war_risk: war_risk.clamp(0.0, 1.0),
            reputation: reputation.clamp(0.0, 1.0),
        }
    }

    /// Documented fallback for entities the risk service has never heard of.
    /// Unknown parties are assumed half-likely to be at war and without
    /// standing, which prices their loans accordingly.
    pub fn unknown(entity_name: impl Into<String>) -> Self {
        Self {
            entity_name: entity_name.into(),
            war_risk: 0.5,
            reputation: 0.0,
        }
    }
}

/// Remote risk-assessment boundary.
///
/// An unknown entity resolves to [`RiskProfile::unknown`], not an error; only
/// transport failures surface as `RemoteUnavailable`. Implementations must
/// not touch the ledger.
#[async_trait]
pub trait RiskLookup: Send + Sync {
    async fn lookup(&self, entity_name: &str) -> Result<RiskProfile, BankError>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn scores_are_clamped_to_unit_interval() {
        let profile = RiskProfile::new("stark", 1.7, -0.3);
        assert_eq!(profile.war_risk, 1.0);
        assert_eq!(profile.reputation, 0.0);
    }

    #[test]
    fn unknown_entities_get_the_documented_fallback() {
        let profile = RiskProfile::unknown("asshai");
        assert_eq!(profile.war_risk, 0.5);
        assert_eq!(profile.reputation, 0.0);
    }
}
