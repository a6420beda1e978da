use rand::distributions::Distribution;
use rand::Rng;
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use tch::{IndexOp, Kind, Tensor};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SamplingParams {
    /// Greedy decoding when false.
    pub do_sample: bool,
    pub temperature: f64,
    /// 0 disables top-k filtering.
    pub top_k: usize,
    pub top_p: f64,
    pub repetition_penalty: f64,
}

impl Default for SamplingParams {
    fn default() -> Self {
        Self {
            do_sample: true,
            temperature: 0.1,
            top_k: 50,
            top_p: 1.0,
            repetition_penalty: 1.0,
        }
    }
}

pub struct Sampler;

impl Sampler {
    /// Picks the next token id from `logits` ([vocab_size]).
    /// `history` holds prompt and generated ids for the repetition penalty.
    pub fn sample<R: Rng + ?Sized>(
        logits: &Tensor,
        params: &SamplingParams,
        history: &[i64],
        rng: &mut R,
    ) -> anyhow::Result<i64> {
        let _guard = tch::no_grad_guard();

        let logits = logits.to_device(tch::Device::Cpu).to_kind(Kind::Double).copy();
        if params.repetition_penalty != 1.0 && !history.is_empty() {
            let vocab = logits.size()[0];
            let unique_tokens: HashSet<i64> = history.iter().copied().filter(|&t| (0..vocab).contains(&t)).collect();
            for token_id in unique_tokens {
                let current_val = logits.double_value(&[token_id]);
                let new_val = if current_val < 0.0 {
                    current_val * params.repetition_penalty
                } else {
                    current_val / params.repetition_penalty
                };
                let _ = logits.i(token_id).fill_(new_val);
            }
        }

        if !params.do_sample || params.temperature < 1e-5 {
            return Ok(logits.argmax(0, false).int64_value(&[]));
        }

        let probs = (logits / params.temperature).softmax(-1, Kind::Double);
        let probs_vec = Vec::<f64>::try_from(&probs)?;

        let mut candidates: Vec<(f64, usize)> = probs_vec.iter().enumerate().map(|(i, &p)| (p, i)).collect();
        candidates.sort_by(|a, b| b.0.partial_cmp(&a.0).unwrap_or(std::cmp::Ordering::Equal));

        if params.top_k > 0 && params.top_k < candidates.len() {
            candidates.truncate(params.top_k);
        }

        if params.top_p < 1.0 {
            let mut cumulative = 0.0;
            let mut cutoff_index = candidates.len() - 1;
            for (i, (p, _)) in candidates.iter().enumerate() {
                cumulative += p;
                if cumulative > params.top_p {
                    cutoff_index = i;
                    break;
                }
            }
            candidates.truncate(cutoff_index + 1);
        }

        // WeightedIndex normalizes, no need to renormalize after the cutoffs
        let weights: Vec<f64> = candidates.iter().map(|(p, _)| *p).collect();
        let dist = rand::distributions::WeightedIndex::new(&weights)
            .map_err(|e| anyhow::anyhow!("WeightedIndex error: {}", e))?;

        Ok(candidates[dist.sample(rng)].1 as i64)
    }
}
