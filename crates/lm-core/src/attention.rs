use tch::{nn, Kind, Tensor};

use crate::config::DecoderConfig;
use crate::kv_cache::KVCache;
use crate::lora::LoraLinear;
use crate::rotary::RotaryEmbedding;

/// Grouped-query causal self-attention with rotary position embeddings.
pub struct CausalSelfAttention {
    q_proj: LoraLinear,
    k_proj: LoraLinear,
    v_proj: LoraLinear,
    o_proj: LoraLinear,
    n_head: i64,
    n_kv_head: i64,
    head_dim: i64,
    dropout: f64,
    rotary_emb: std::sync::Arc<RotaryEmbedding>,
}

impl CausalSelfAttention {
    pub fn new(vs: &nn::Path, config: &DecoderConfig, rotary_emb: std::sync::Arc<RotaryEmbedding>) -> Self {
        let hidden = config.hidden_size;
        let n_head = config.num_attention_heads;
        let n_kv_head = config.kv_heads();
        let head_dim = config.head_dim();

        let q_proj = LoraLinear::new(&(vs / "q_proj"), hidden, n_head * head_dim, config.qkv_bias);
        let k_proj = LoraLinear::new(&(vs / "k_proj"), hidden, n_kv_head * head_dim, config.qkv_bias);
        let v_proj = LoraLinear::new(&(vs / "v_proj"), hidden, n_kv_head * head_dim, config.qkv_bias);
        let o_proj = LoraLinear::new(&(vs / "o_proj"), n_head * head_dim, hidden, false);

        Self {
            q_proj,
            k_proj,
            v_proj,
            o_proj,
            n_head,
            n_kv_head,
            head_dim,
            dropout: config.attention_dropout,
            rotary_emb,
        }
    }

    pub fn forward_t(&self, x: &Tensor, cache: Option<&mut KVCache>, train: bool) -> Tensor {
        let dims = x.size();
        let (b, t) = (dims[0], dims[1]);

        let q = self.q_proj.forward_t(x, train).view([b, t, self.n_head, self.head_dim]).transpose(1, 2);
        let k = self.k_proj.forward_t(x, train).view([b, t, self.n_kv_head, self.head_dim]).transpose(1, 2);
        let v = self.v_proj.forward_t(x, train).view([b, t, self.n_kv_head, self.head_dim]).transpose(1, 2);

        let past_len = cache.as_ref().map_or(0, |c| c.len());

        let q = self.rotary_emb.forward(&q, past_len);
        let k = self.rotary_emb.forward(&k, past_len);

        let (k, v) = match cache {
            Some(c) => c.update(k, v),
            None => (k, v),
        };

        let k = self.repeat_kv(&k);
        let v = self.repeat_kv(&v);
        let total_t = k.size()[2];

        let mut att = q.matmul(&k.transpose(-2, -1)) * (1.0 / (self.head_dim as f64).sqrt());

        // A single new token may attend to everything cached before it.
        if t > 1 {
            let mask = Tensor::ones(&[t, total_t], (Kind::Float, x.device()))
                .tril(past_len)
                .eq(0.0);
            att = att.masked_fill(&mask, f64::NEG_INFINITY);
        }

        let att = att.softmax(-1, Kind::Float).dropout(self.dropout, train);
        let y = att
            .matmul(&v)
            .transpose(1, 2)
            .contiguous()
            .view([b, t, self.n_head * self.head_dim]);
        self.o_proj.forward_t(&y, train)
    }

    /// [b, n_kv_head, t, d] -> [b, n_head, t, d]
    fn repeat_kv(&self, x: &Tensor) -> Tensor {
        let n_rep = self.n_head / self.n_kv_head;
        if n_rep == 1 {
            return x.shallow_clone();
        }
        let dims = x.size();
        let (b, t, d) = (dims[0], dims[2], dims[3]);
        x.unsqueeze(2)
            .expand(&[b, self.n_kv_head, n_rep, t, d], false)
            .reshape(&[b, self.n_head, t, d])
    }

    pub(crate) fn sublayers_mut(&mut self) -> [(&'static str, &mut LoraLinear); 4] {
        [
            ("q_proj", &mut self.q_proj),
            ("k_proj", &mut self.k_proj),
            ("v_proj", &mut self.v_proj),
            ("o_proj", &mut self.o_proj),
        ]
    }
}
