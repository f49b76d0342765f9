use std::sync::Arc;

use super::types::Prompt;
use crate::config::RewardKind;

/// Turns a completion into a scalar reward.
pub trait Scorer: Send + Sync + 'static {
    fn score(&self, prompt: &Prompt, completion: &[u32]) -> f32;
}

/// 1.0 when the completion starts with the reference answer, else 0.0.
///
/// Prompts without an answer score 0.0.
#[derive(Debug, Clone, Copy, Default)]
pub struct ExactMatch;

impl Scorer for ExactMatch {
    fn score(&self, prompt: &Prompt, completion: &[u32]) -> f32 {
        match &prompt.answer {
            Some(answer) if !answer.is_empty() && completion.starts_with(answer) => 1.0,
            _ => 0.0,
        }
    }
}

/// Fraction of completion tokens that appear in the reference answer.
#[derive(Debug, Clone, Copy, Default)]
pub struct AnswerOverlap;

impl Scorer for AnswerOverlap {
    fn score(&self, prompt: &Prompt, completion: &[u32]) -> f32 {
        let Some(answer) = &prompt.answer else {
            return 0.0;
        };
        if completion.is_empty() {
            return 0.0;
        }
        let hits = completion.iter().filter(|t| answer.contains(t)).count();
        hits as f32 / completion.len() as f32
    }
}

/// The scorer selected by the `reward` option.
pub fn scorer_for(kind: RewardKind) -> Arc<dyn Scorer> {
    match kind {
        RewardKind::ExactMatch => Arc::new(ExactMatch),
        RewardKind::AnswerOverlap => Arc::new(AnswerOverlap),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn prompt(answer: Option<Vec<u32>>) -> Prompt {
        Prompt {
            id: "p0".to_string(),
            dataset: "test".to_string(),
            tokens: vec![1, 2],
            answer,
        }
    }

    #[test]
    fn test_exact_match() {
        let p = prompt(Some(vec![5, 6]));
        assert_eq!(ExactMatch.score(&p, &[5, 6, 9]), 1.0);
        assert_eq!(ExactMatch.score(&p, &[5, 9]), 0.0);
        assert_eq!(ExactMatch.score(&prompt(None), &[5, 6]), 0.0);
        assert_eq!(ExactMatch.score(&prompt(Some(vec![])), &[5]), 0.0);
    }

    #[test]
    fn test_answer_overlap() {
        let p = prompt(Some(vec![3]));
        assert!((AnswerOverlap.score(&p, &[3, 3, 1, 2]) - 0.5).abs() < 1e-6);
        assert_eq!(AnswerOverlap.score(&p, &[]), 0.0);
        assert_eq!(AnswerOverlap.score(&prompt(None), &[3]), 0.0);
    }

    #[test]
    fn test_scorer_for_kind() {
        let p = prompt(Some(vec![3]));
        let completion = [3, 1];
        assert_eq!(scorer_for(RewardKind::ExactMatch).score(&p, &completion), 1.0);
        assert!((scorer_for(RewardKind::AnswerOverlap).score(&p, &completion) - 0.5).abs() < 1e-6);
    }
}
