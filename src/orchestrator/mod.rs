//! Orchestrator module - the state machine that ties everything together.
//!
//! # Flow
//! ```text
//! request ─▶ decide ─┬─▶ coordinator answers directly ─────────────▶ Complete
//!                    └─▶ analyze ─▶ decompose ─▶ prune ─▶ schedule ─▶ synthesize
//! ```
//!
//! Observers follow a run through [`Orchestrator::subscribe`]: every event
//! publishes a fresh [`OrchestrationState`] snapshot, and
//! [`OrchestrationState::events_since`] gives the events added since an
//! earlier snapshot.

mod decision;
mod error;
mod metrics;
mod root;
mod state;
mod synthesis;


pub use decision::{decide, DelegationDecision, DelegationPattern, SHORT_INPUT_WORDS};
pub use error::{FatalCause, OrchestrationFailed};
pub use metrics::{DelegationMetrics, PhaseClock, PhaseTimings};
pub use root::{OrchestrationOutcome, Orchestrator};
pub use state::{EventType, OrchestrationEvent, OrchestrationState, Phase, StateRecorder};
pub use synthesis::{ResultSynthesizer, Synthesis, SynthesisConfig, SynthesisRequest};
