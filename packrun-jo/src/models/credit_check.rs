//! Credit check value object
//!
//! `allowed_units = has_unlimited ? total_units : min(user_credits, total_units)`
//! `can_proceed   = has_unlimited || user_credits > 0`
//!
//! A Source with zero units can trivially proceed but needs nothing; the
//! credit gate turns that into a distinct "nothing to analyze" answer.
//!
//! The derived fields are always recomputed locally from the raw inputs so a
//! stale or inconsistent server payload can never break the invariant.

use serde::{Deserialize, Serialize};

/// Computed once per Source reaching `ready_for_analysis`
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct CreditCheck {
    pub total_units: u64,
    pub user_credits: u64,
    pub has_unlimited: bool,
    pub allowed_units: u64,
    pub can_proceed: bool,
    pub credits_needed: u64,
}

impl CreditCheck {
    pub fn compute(total_units: u64, user_credits: u64, has_unlimited: bool) -> Self {
        let allowed_units = if has_unlimited {
            total_units
        } else {
            user_credits.min(total_units)
        };
        let can_proceed = has_unlimited || user_credits > 0 || total_units == 0;
        let credits_needed = if can_proceed {
            0
        } else {
            total_units.saturating_sub(user_credits).max(1)
        };

        Self {
            total_units,
            user_credits,
            has_unlimited,
            allowed_units,
            can_proceed,
            credits_needed,
        }
    }

    /// Nothing to analyze: proceeding is trivially allowed but pointless
    pub fn is_empty(&self) -> bool {
        self.total_units == 0
    }

    /// Units the balance does not cover
    pub fn uncovered_units(&self) -> u64 {
        self.total_units - self.allowed_units
    }
}

/// Body of `GET /sources/{id}/credit-check`
///
/// Only the raw inputs are trusted; derived fields the server may send are ignored.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct CreditCheckResponse {
    #[serde(alias = "total_chunks")]
    pub total_units: u64,
    #[serde(alias = "credits")]
    pub user_credits: u64,
    #[serde(default)]
    pub has_unlimited: bool,
}

impl From<CreditCheckResponse> for CreditCheck {
    fn from(response: CreditCheckResponse) -> Self {
        CreditCheck::compute(
            response.total_units,
            response.user_credits,
            response.has_unlimited,
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_partial_balance_can_proceed() {
        let check = CreditCheck::compute(50, 20, false);
        assert_eq!(check.allowed_units, 20);
        assert!(check.can_proceed);
        assert_eq!(check.credits_needed, 0);
        assert_eq!(check.uncovered_units(), 30);
    }

    #[test]
    fn test_zero_balance_denied() {
        let check = CreditCheck::compute(50, 0, false);
        assert!(!check.can_proceed);
        assert_eq!(check.allowed_units, 0);
        assert!(check.credits_needed >= 1);
        assert_eq!(check.credits_needed, 50);
    }

    #[test]
    fn test_unlimited_allows_everything() {
        let check = CreditCheck::compute(500, 0, true);
        assert_eq!(check.allowed_units, 500);
        assert!(check.can_proceed);
        assert_eq!(check.credits_needed, 0);
    }

    #[test]
    fn test_allowed_units_invariant_over_grid() {
        for total in [0u64, 1, 9, 10, 50, 1_000] {
            for credits in [0u64, 1, 10, 49, 50, 51, 10_000] {
                let limited = CreditCheck::compute(total, credits, false);
                assert_eq!(limited.allowed_units, credits.min(total));
                assert_eq!(limited.can_proceed, credits > 0 || total == 0);
                assert!(limited.allowed_units <= total);

                let unlimited = CreditCheck::compute(total, credits, true);
                assert_eq!(unlimited.allowed_units, total);
                assert!(unlimited.can_proceed);
            }
        }
    }

    #[test]
    fn test_empty_source() {
        let check = CreditCheck::compute(0, 0, false);
        assert!(check.is_empty());
        assert!(check.can_proceed);
        assert_eq!(check.allowed_units, 0);
        assert_eq!(check.credits_needed, 0);
    }

    #[test]
    fn test_response_derived_fields_recomputed() {
        let response: CreditCheckResponse = serde_json::from_str(
            r#"{"total_chunks":50,"user_credits":20,"has_unlimited":false,"allowed_units":50,"can_proceed":true}"#,
        )
        .unwrap();
        let check = CreditCheck::from(response);
        assert_eq!(check.allowed_units, 20);
    }
}
