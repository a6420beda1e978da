use crate::sampling::{Sampler, SamplingParams};
use lm_core::CausalLm;
use rand::Rng;
use tch::{IndexOp, Tensor};

/// Autoregressive decoding over any [`CausalLm`], prefilling the prompt once
/// and then feeding one token at a time through the per-layer KV caches.
pub struct Generator<'a, M: CausalLm + ?Sized> {
    model: &'a M,
}

impl<'a, M: CausalLm + ?Sized> Generator<'a, M> {
    pub fn new(model: &'a M) -> Self {
        Self { model }
    }

    /// Returns only the newly generated ids. Generation ends after
    /// `max_new_tokens`, on any id in `stop_ids` (not included in the output)
    /// or when the context window is full.
    pub fn generate<R: Rng + ?Sized>(
        &self,
        prompt_ids: &[i64],
        max_new_tokens: usize,
        params: &SamplingParams,
        stop_ids: &[i64],
        rng: &mut R,
    ) -> anyhow::Result<Vec<i64>> {
        if prompt_ids.is_empty() || max_new_tokens == 0 {
            return Ok(Vec::new());
        }
        let _guard = tch::no_grad_guard();

        let max_seq_len = self.model.context_len();
        // keep room for at least one new token
        let keep = max_seq_len.saturating_sub(1).max(1);
        let mut history = if prompt_ids.len() > keep {
            tracing::warn!(prompt = prompt_ids.len(), kept = keep, "prompt exceeds context, keeping the tail");
            prompt_ids[prompt_ids.len() - keep..].to_vec()
        } else {
            prompt_ids.to_vec()
        };

        let device = self.model.device();
        let mut caches = self.model.new_cache();
        let mut generated = Vec::new();

        // Prefill
        let mut input = Tensor::from_slice(&history).view([1, history.len() as i64]).to(device);

        loop {
            let logits = self.model.forward_t(&input, Some(&mut caches), false);
            let next_token = Sampler::sample(&logits.i((0, -1, ..)), params, &history, rng)?;

            if stop_ids.contains(&next_token) {
                break;
            }
            generated.push(next_token);
            history.push(next_token);

            if generated.len() >= max_new_tokens || history.len() >= max_seq_len {
                break;
            }
            input = Tensor::from_slice(&[next_token]).view([1, 1]).to(device);
        }

        Ok(generated)
    }
}
