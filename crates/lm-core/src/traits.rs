use tch::{Device, Tensor};

use crate::kv_cache::KVCache;
use crate::lora::LoraLinear;

/// What a fine-tuning run needs from a causal language model, independent of
/// its architecture: next-token logits (used for both sampling and gradient
/// steps) and access to its named adaptable projections.
pub trait CausalLm {
    /// Logits `[batch, seq_len, vocab]` for `input_ids: [batch, seq_len]`.
    ///
    /// With `caches` (one per layer) the input continues the cached sequence.
    /// `train` enables dropout.
    fn forward_t(&self, input_ids: &Tensor, caches: Option<&mut [KVCache]>, train: bool) -> Tensor;

    /// Empty per-layer caches for incremental decoding.
    fn new_cache(&self) -> Vec<KVCache>;

    /// Longest sequence the model accepts.
    fn context_len(&self) -> usize;

    fn device(&self) -> Device;

    /// Every adaptable projection with its dotted path, e.g.
    /// `model.layers.3.self_attn.v_proj`.
    fn sublayers_mut(&mut self) -> Vec<(String, &mut LoraLinear)>;

    fn sublayer_names(&mut self) -> Vec<String> {
        self.sublayers_mut().into_iter().map(|(name, _)| name).collect()
    }
}
