//! Budget module - token budget arithmetic.
//!
//! # Key Concepts
//! - Guard: the single definition of "how many tokens may this call use"
//! - Estimation: byte-based token approximation shared by every budget check

mod guard;

pub use guard::{
    estimate_tokens, truncate_to_tokens, BudgetError, TokenBudgetGuard, DEFAULT_TOKEN_FLOOR,
};
