use rand::Rng;

use crate::inference::{SamplingParams, StopReason};

/// Context-free token distribution: `softmax(logits)`.
///
/// Token 0 ends a completion.
#[derive(Debug, Clone, PartialEq)]
pub struct UnigramPolicy {
    logits: Vec<f32>,
}

pub(crate) fn log_softmax(logits: &[f64]) -> Vec<f64> {
    let max = logits.iter().copied().fold(f64::NEG_INFINITY, f64::max);
    let norm = logits.iter().map(|z| (z - max).exp()).sum::<f64>().ln() + max;
    logits.iter().map(|z| z - norm).collect()
}

impl UnigramPolicy {
    pub const EOS: u32 = 0;

    pub fn uniform(vocab_size: usize) -> Self {
        Self {
            logits: vec![0.0; vocab_size.max(2)],
        }
    }

    pub fn from_logits(logits: Vec<f32>) -> Self {
        Self { logits }
    }

    pub fn logits(&self) -> &[f32] {
        &self.logits
    }

    pub fn vocab_size(&self) -> usize {
        self.logits.len()
    }

    pub fn log_probs(&self) -> Vec<f64> {
        let logits: Vec<f64> = self.logits.iter().map(|z| *z as f64).collect();
        log_softmax(&logits)
    }

    pub fn prob(&self, token: u32) -> f64 {
        self.log_probs().get(token as usize).map_or(0.0, |lp| lp.exp())
    }

    /// Little-endian f32 logits.
    pub fn to_bytes(&self) -> Vec<u8> {
        self.logits.iter().flat_map(|z| z.to_le_bytes()).collect()
    }

    pub fn from_bytes(bytes: &[u8]) -> Option<Self> {
        if bytes.is_empty() || bytes.len() % 4 != 0 {
            return None;
        }
        let logits = bytes
            .chunks_exact(4)
            .map(|c| f32::from_le_bytes([c[0], c[1], c[2], c[3]]))
            .collect::<Vec<_>>();
        if logits.iter().any(|z| !z.is_finite()) {
            return None;
        }
        Some(Self { logits })
    }

    /// Sample a completion. Stop strings do not apply to a token-level policy.
    ///
    /// Log-probabilities are those of the distribution actually sampled from
    /// (after temperature, top-k and top-p). Temperature 0 is greedy.
    pub fn sample<R: Rng>(&self, rng: &mut R, params: &SamplingParams) -> (Vec<u32>, Vec<f32>, StopReason) {
        let dist = self.sampling_distribution(params);
        let mut tokens = Vec::new();
        let mut logprobs = Vec::new();

        for _ in 0..params.max_tokens {
            let (token, prob) = if params.temperature == 0.0 {
                dist.iter()
                    .copied()
                    .enumerate()
                    .fold((0, 0.0), |best, (t, p)| if p > best.1 { (t, p) } else { best })
            } else {
                let u: f64 = rng.r#gen();
                let mut acc = 0.0;
                let mut picked = (dist.len() - 1, dist[dist.len() - 1]);
                for (t, p) in dist.iter().copied().enumerate() {
                    acc += p;
                    if p > 0.0 && u < acc {
                        picked = (t, p);
                        break;
                    }
                }
                picked
            };

            tokens.push(token as u32);
            logprobs.push(prob.max(f64::MIN_POSITIVE).ln() as f32);
            if token as u32 == Self::EOS {
                return (tokens, logprobs, StopReason::Stop);
            }
        }
        (tokens, logprobs, StopReason::Length)
    }

    fn sampling_distribution(&self, params: &SamplingParams) -> Vec<f64> {
        let temperature = if params.temperature > 0.0 {
            params.temperature as f64
        } else {
            1.0
        };
        let scaled: Vec<f64> = self.logits.iter().map(|z| *z as f64 / temperature).collect();
        let mut probs: Vec<f64> = log_softmax(&scaled).into_iter().map(f64::exp).collect();

        let mut order: Vec<usize> = (0..probs.len()).collect();
        order.sort_by(|a, b| probs[*b].total_cmp(&probs[*a]));

        let keep_k = params.top_k.map_or(probs.len(), |k| (k as usize).clamp(1, probs.len()));
        let mut kept = vec![false; probs.len()];
        let mut mass = 0.0;
        for (rank, &t) in order.iter().enumerate() {
            if rank >= keep_k || (rank > 0 && mass >= params.top_p as f64) {
                break;
            }
            kept[t] = true;
            mass += probs[t];
        }

        for (p, keep) in probs.iter_mut().zip(&kept) {
            if !keep {
                *p = 0.0;
            }
        }
        let total: f64 = probs.iter().sum();
        probs.iter_mut().for_each(|p| *p /= total);
        probs
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::SeedableRng;
    use rand::rngs::StdRng;

    fn peaked(vocab: usize, token: usize, logit: f32) -> UnigramPolicy {
        let mut logits = vec![0.0; vocab];
        logits[token] = logit;
        UnigramPolicy::from_logits(logits)
    }

    #[test]
    fn test_bytes_roundtrip() {
        let policy = peaked(8, 3, 2.5);
        assert_eq!(UnigramPolicy::from_bytes(&policy.to_bytes()), Some(policy));
        assert_eq!(UnigramPolicy::from_bytes(&[1, 2, 3]), None);
        assert_eq!(UnigramPolicy::from_bytes(&[]), None);
    }

    #[test]
    fn test_log_probs_normalized() {
        let policy = peaked(16, 5, 3.0);
        let total: f64 = policy.log_probs().iter().map(|lp| lp.exp()).sum();
        assert!((total - 1.0).abs() < 1e-9);
        assert!(policy.prob(5) > policy.prob(4));
    }

    #[test]
    fn test_greedy_picks_argmax() {
        let policy = peaked(8, 6, 4.0);
        let params = SamplingParams {
            temperature: 0.0,
            max_tokens: 3,
            ..SamplingParams::default()
        };
        let (tokens, logprobs, stop) = policy.sample(&mut StdRng::seed_from_u64(0), &params);
        assert_eq!(tokens, vec![6, 6, 6]);
        assert_eq!(stop, StopReason::Length);
        assert!(logprobs.iter().all(|lp| *lp < 0.0 && lp.is_finite()));
    }

    #[test]
    fn test_eos_stops_completion() {
        let policy = peaked(4, 0, 50.0);
        let params = SamplingParams {
            max_tokens: 10,
            ..SamplingParams::default()
        };
        let (tokens, logprobs, stop) = policy.sample(&mut StdRng::seed_from_u64(1), &params);
        assert_eq!(tokens, vec![0]);
        assert_eq!(logprobs.len(), 1);
        assert_eq!(stop, StopReason::Stop);
    }

    #[test]
    fn test_top_k_one_is_deterministic() {
        let policy = peaked(8, 2, 1.0);
        let params = SamplingParams {
            temperature: 1.0,
            max_tokens: 20,
            top_k: Some(1),
            ..SamplingParams::default()
        };
        let (tokens, logprobs, _) = policy.sample(&mut StdRng::seed_from_u64(2), &params);
        assert!(tokens.iter().all(|t| *t == 2));
        assert!(logprobs.iter().all(|lp| lp.abs() < 1e-6));
    }
}
