//! Core evaluation logic.

mod evaluator;
pub mod hooks;

pub use evaluator::{EvaluationState, Evaluator};
pub use hooks::HookTiming;
