use std::sync::Arc;
use tch::{nn, Device, Tensor};

use crate::attention::CausalSelfAttention;
use crate::config::DecoderConfig;
use crate::kv_cache::KVCache;
use crate::layer_norm::RMSNorm;
use crate::lora::LoraLinear;
use crate::rotary::RotaryEmbedding;
use crate::traits::CausalLm;

/// Gated feed-forward block: down(silu(gate(x)) * up(x))
pub struct MLP {
    gate_proj: LoraLinear,
    up_proj: LoraLinear,
    down_proj: LoraLinear,
}

impl MLP {
    pub fn new(vs: &nn::Path, config: &DecoderConfig) -> Self {
        let hidden = config.hidden_size;
        let inner = config.intermediate_size;

        Self {
            gate_proj: LoraLinear::new(&(vs / "gate_proj"), hidden, inner, false),
            up_proj: LoraLinear::new(&(vs / "up_proj"), hidden, inner, false),
            down_proj: LoraLinear::new(&(vs / "down_proj"), inner, hidden, false),
        }
    }

    pub fn forward_t(&self, x: &Tensor, train: bool) -> Tensor {
        let gate = self.gate_proj.forward_t(x, train).silu();
        let up = self.up_proj.forward_t(x, train);
        self.down_proj.forward_t(&(gate * up), train)
    }
}

/// Pre-norm decoder block.
pub struct Block {
    input_layernorm: RMSNorm,
    self_attn: CausalSelfAttention,
    post_attention_layernorm: RMSNorm,
    mlp: MLP,
}

impl Block {
    pub fn new(vs: &nn::Path, config: &DecoderConfig, rotary_emb: Arc<RotaryEmbedding>) -> Self {
        let eps = config.rms_norm_eps;
        Self {
            input_layernorm: RMSNorm::new(&(vs / "input_layernorm"), config.hidden_size, eps),
            self_attn: CausalSelfAttention::new(&(vs / "self_attn"), config, rotary_emb),
            post_attention_layernorm: RMSNorm::new(&(vs / "post_attention_layernorm"), config.hidden_size, eps),
            mlp: MLP::new(&(vs / "mlp"), config),
        }
    }

    pub fn forward_t(&self, x: &Tensor, cache: Option<&mut KVCache>, train: bool) -> Tensor {
        let attn_out = self.self_attn.forward_t(&self.input_layernorm.forward(x), cache, train);
        let x = x + attn_out;

        let mlp_out = self.mlp.forward_t(&self.post_attention_layernorm.forward(&x), train);
        x + mlp_out
    }

    fn sublayers_mut(&mut self) -> Vec<(String, &mut LoraLinear)> {
        let mut out: Vec<(String, &mut LoraLinear)> = self
            .self_attn
            .sublayers_mut()
            .into_iter()
            .map(|(name, layer)| (format!("self_attn.{name}"), layer))
            .collect();
        out.push(("mlp.gate_proj".to_string(), &mut self.mlp.gate_proj));
        out.push(("mlp.up_proj".to_string(), &mut self.mlp.up_proj));
        out.push(("mlp.down_proj".to_string(), &mut self.mlp.down_proj));
        out
    }
}

enum LmHead {
    Tied(Tensor),
    Separate(nn::Linear),
}

/// Decoder-only transformer in the Qwen2 / Llama layout. Variable names follow
/// the Hugging Face checkpoints (`model.layers.{i}.self_attn.q_proj.weight`, ...)
/// so pretrained safetensors load directly into the `VarStore`.
pub struct DecoderLm {
    embed_tokens: nn::Embedding,
    layers: Vec<Block>,
    norm: RMSNorm,
    lm_head: LmHead,
    device: Device,
    pub config: DecoderConfig,
}

impl DecoderLm {
    pub fn new(vs: &nn::Path, config: &DecoderConfig) -> Self {
        let model = vs / "model";
        let embed_tokens = nn::embedding(
            &model / "embed_tokens",
            config.vocab_size,
            config.hidden_size,
            Default::default(),
        );

        let rotary_emb = Arc::new(RotaryEmbedding::new(config.head_dim(), config.rope_theta, vs.device()));
        let layers = (0..config.num_hidden_layers)
            .map(|i| Block::new(&(&model / "layers" / i), config, Arc::clone(&rotary_emb)))
            .collect();

        let norm = RMSNorm::new(&(&model / "norm"), config.hidden_size, config.rms_norm_eps);
        let lm_head = if config.tie_word_embeddings {
            LmHead::Tied(embed_tokens.ws.shallow_clone())
        } else {
            LmHead::Separate(nn::linear(
                vs / "lm_head",
                config.hidden_size,
                config.vocab_size,
                nn::LinearConfig { bias: false, ..Default::default() },
            ))
        };

        Self {
            embed_tokens,
            layers,
            norm,
            lm_head,
            device: vs.device(),
            config: config.clone(),
        }
    }
}

impl CausalLm for DecoderLm {
    fn forward_t(&self, input_ids: &Tensor, mut caches: Option<&mut [KVCache]>, train: bool) -> Tensor {
        let mut x = input_ids.apply(&self.embed_tokens);

        for (i, block) in self.layers.iter().enumerate() {
            let layer_cache = match caches {
                Some(ref mut c) => Some(&mut c[i]),
                None => None,
            };
            x = block.forward_t(&x, layer_cache, train);
        }

        let x = self.norm.forward(&x);
        match &self.lm_head {
            LmHead::Tied(ws) => x.matmul(&ws.tr()),
            LmHead::Separate(linear) => x.apply(linear),
        }
    }

    fn new_cache(&self) -> Vec<KVCache> {
        (0..self.layers.len()).map(|_| KVCache::new()).collect()
    }

    fn context_len(&self) -> usize {
        self.config.max_position_embeddings.max(1) as usize
    }

    fn device(&self) -> Device {
        self.device
    }

    fn sublayers_mut(&mut self) -> Vec<(String, &mut LoraLinear)> {
        let mut out = Vec::new();
        for (i, block) in self.layers.iter_mut().enumerate() {
            for (name, layer) in block.sublayers_mut() {
                out.push((format!("model.layers.{i}.{name}"), layer));
            }
        }
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tch::{IndexOp, Kind};

    fn tiny() -> (nn::VarStore, DecoderLm) {
        tch::manual_seed(11);
        let vs = nn::VarStore::new(Device::Cpu);
        let model = DecoderLm::new(&vs.root(), &DecoderConfig::tiny(40));
        (vs, model)
    }

    #[test]
    fn variable_names_follow_hf_layout() {
        let (vs, _model) = tiny();
        let vars = vs.variables();
        assert!(vars.contains_key("model.embed_tokens.weight"));
        assert!(vars.contains_key("model.layers.1.self_attn.q_proj.bias"));
        assert!(!vars.contains_key("model.layers.1.self_attn.o_proj.bias"));
        assert!(vars.contains_key("model.layers.0.mlp.gate_proj.weight"));
        assert!(vars.contains_key("model.norm.weight"));
        // tied head
        assert!(!vars.contains_key("lm_head.weight"));
    }

    #[test]
    fn logits_have_vocab_width() {
        let (_vs, model) = tiny();
        let ids = Tensor::from_slice(&[1i64, 5, 7, 2, 3, 9]).view([2, 3]);
        let logits = tch::no_grad(|| model.forward_t(&ids, None, false));
        assert_eq!(logits.size(), vec![2, 3, 40]);
    }

    #[test]
    fn cached_decoding_matches_full_forward() {
        let (_vs, model) = tiny();
        let ids = Tensor::from_slice(&[3i64, 1, 4, 1, 5]).view([1, 5]);
        let full = tch::no_grad(|| model.forward_t(&ids, None, false));

        let mut caches = model.new_cache();
        let prefix = tch::no_grad(|| model.forward_t(&ids.narrow(1, 0, 4), Some(&mut caches), false));
        let last = tch::no_grad(|| model.forward_t(&ids.narrow(1, 4, 1), Some(&mut caches), false));

        assert!(full.i((.., 0..4, ..)).allclose(&prefix, 1e-4, 1e-4, false));
        assert!(full.i((.., 4..5, ..)).allclose(&last, 1e-4, 1e-4, false));
        assert_eq!(last.kind(), Kind::Float);
    }

    #[test]
    fn sublayers_are_named_by_path() {
        let (_vs, mut model) = tiny();
        let names = model.sublayer_names();
        assert_eq!(names.len(), 2 * 7);
        assert_eq!(names[0], "model.layers.0.self_attn.q_proj");
        assert!(names.contains(&"model.layers.1.mlp.down_proj".to_string()));
    }
}
