mod reward;
mod types;

pub use reward::{AnswerOverlap, ExactMatch, Scorer, scorer_for};
pub use types::{LaneId, Prompt, Rollout};
