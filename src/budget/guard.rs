//! Token budget arithmetic shared by prompt assembly and context isolation.
//!
//! # Invariants
//! - `available() >= floor` (enforced at all times)
//! - `available()` never underflows; all subtraction is saturating

use serde::{Deserialize, Serialize};

/// Smallest budget the guard will ever report, in tokens.
pub const DEFAULT_TOKEN_FLOOR: usize = 256;

/// Rough token estimate used everywhere budgets are enforced.
///
/// Four bytes per token, rounded up.
pub fn estimate_tokens(text: &str) -> usize {
    (text.len() + 3) / 4
}

/// Longest prefix of `text` that fits in `tokens`, cut on a char boundary.
pub fn truncate_to_tokens(text: &str, tokens: usize) -> &str {
    let max_bytes = tokens.saturating_mul(4);
    if text.len() <= max_bytes {
        return text;
    }
    let mut end = max_bytes;
    while !text.is_char_boundary(end) {
        end -= 1;
    }
    &text[..end]
}

/// Budget for one model call, split into reserved and usable portions.
///
/// # Invariants
/// - `floor > 0`
///
/// # Design for Provability
/// Fields are private; construction goes through [`TokenBudgetGuard::new`]
/// which clamps the floor to at least one token.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(from = "GuardFields")]
pub struct TokenBudgetGuard {
    total: usize,
    reserved_system_tools: usize,
    reserved_output: usize,
    floor: usize,
}

/// Wire form of a guard; deserialization goes through [`TokenBudgetGuard::new`].
#[derive(Deserialize)]
struct GuardFields {
    total: usize,
    #[serde(default)]
    reserved_system_tools: usize,
    #[serde(default)]
    reserved_output: usize,
    #[serde(default)]
    floor: usize,
}

impl From<GuardFields> for TokenBudgetGuard {
    fn from(f: GuardFields) -> Self {
        Self::new(f.total, f.reserved_system_tools, f.reserved_output, f.floor)
    }
}

impl TokenBudgetGuard {
    /// Create a new guard.
    ///
    /// # Postconditions
    /// - `guard.floor() >= 1`
    pub fn new(
        total: usize,
        reserved_system_tools: usize,
        reserved_output: usize,
        floor: usize,
    ) -> Self {
        Self {
            total,
            reserved_system_tools,
            reserved_output,
            floor: floor.max(1),
        }
    }

    /// Guard with no reservations (the whole total is usable).
    pub fn unreserved(total: usize) -> Self {
        Self::new(total, 0, 0, DEFAULT_TOKEN_FLOOR)
    }

    pub fn total(&self) -> usize {
        self.total
    }

    pub fn floor(&self) -> usize {
        self.floor
    }

    /// Tokens usable for content.
    ///
    /// # Property
    /// `available() == max(floor, total - reserved_system_tools - reserved_output)`
    pub fn available(&self) -> usize {
        self.total
            .saturating_sub(self.reserved_system_tools)
            .saturating_sub(self.reserved_output)
            .max(self.floor)
    }

    /// Check whether `needed` tokens fit.
    pub fn fits(&self, needed: usize) -> bool {
        needed <= self.available()
    }

    /// Require that `needed` tokens fit.
    ///
    /// # Errors
    /// Returns [`BudgetError::TokenBudgetExceeded`] when `needed > available()`.
    pub fn require(&self, needed: usize) -> Result<(), BudgetError> {
        if self.fits(needed) {
            Ok(())
        } else {
            Err(BudgetError::TokenBudgetExceeded {
                required: needed,
                available: self.available(),
            })
        }
    }

    /// Split the available budget into a sub-budget (e.g. for a running summary).
    ///
    /// # Postcondition
    /// `0 < result <= available()` for `fraction` in (0, 1].
    pub fn portion(&self, fraction: f64) -> usize {
        let fraction = fraction.clamp(0.0, 1.0);
        ((self.available() as f64 * fraction).floor() as usize).max(1)
    }
}

/// Errors in budget enforcement.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum BudgetError {
    #[error("Token budget exceeded: {required} tokens required, {available} available")]
    TokenBudgetExceeded { required: usize, available: usize },
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_available_subtracts_reservations() {
        let guard = TokenBudgetGuard::new(8000, 1000, 2000, 256);
        assert_eq!(guard.available(), 5000);
    }

    #[test]
    fn test_available_never_below_floor() {
        let guard = TokenBudgetGuard::new(1000, 900, 900, 128);
        assert_eq!(guard.available(), 128);

        let guard = TokenBudgetGuard::new(0, 0, 0, 0);
        assert_eq!(guard.available(), 1);
    }

    #[test]
    fn test_available_floor_property_over_grid() {
        for total in [0usize, 1, 100, 4096, usize::MAX] {
            for reserved in [0usize, 50, 4096, usize::MAX] {
                let guard = TokenBudgetGuard::new(total, reserved, reserved, 64);
                assert!(guard.available() >= 64);
            }
        }
    }

    #[test]
    fn test_deserialized_guard_keeps_floor() {
        let guard: TokenBudgetGuard = serde_json::from_str(
            r#"{"total":100,"reserved_system_tools":0,"reserved_output":0,"floor":0}"#,
        )
        .unwrap();
        assert_eq!(guard.floor(), 1);

        let guard: TokenBudgetGuard =
            serde_json::from_str(r#"{"total":10,"reserved_output":50,"floor":8}"#).unwrap();
        assert_eq!(guard.available(), 8);
        let json = serde_json::to_value(guard).unwrap();
        assert_eq!(serde_json::from_value::<TokenBudgetGuard>(json).unwrap(), guard);
    }

    #[test]
    fn test_require_reports_shortfall() {
        let guard = TokenBudgetGuard::new(1000, 0, 500, 10);
        assert!(guard.require(500).is_ok());
        assert_eq!(
            guard.require(501),
            Err(BudgetError::TokenBudgetExceeded {
                required: 501,
                available: 500
            })
        );
    }

    #[test]
    fn test_portion_is_positive_and_bounded() {
        let guard = TokenBudgetGuard::unreserved(1000);
        assert_eq!(guard.portion(0.25), 250);
        assert_eq!(guard.portion(0.0), 1);
        assert_eq!(guard.portion(2.0), 1000);
    }

    #[test]
    fn test_truncate_to_tokens_respects_char_boundaries() {
        assert_eq!(truncate_to_tokens("abcdefgh", 1), "abcd");
        assert_eq!(truncate_to_tokens("short", 10), "short");
        let cut = truncate_to_tokens("ééé", 1);
        assert_eq!(cut, "éé");
        assert!(estimate_tokens(cut) <= 1);
    }

    #[test]
    fn test_estimate_tokens_rounds_up() {
        assert_eq!(estimate_tokens(""), 0);
        assert_eq!(estimate_tokens("abc"), 1);
        assert_eq!(estimate_tokens("abcde"), 2);
    }
}
