use serde::{Deserialize, Serialize};
use std::path::Path;

use crate::error::Result;

/// Hyperparameters of a decoder-only transformer, read from a Hugging Face
/// style `config.json`. Field names follow that file so the pretrained
/// checkpoints deserialize without a translation layer.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DecoderConfig {
    /// Size of the vocabulary (rows of the embedding matrix).
    pub vocab_size: i64,
    /// Width of the residual stream.
    pub hidden_size: i64,
    /// Inner width of the gated MLP.
    pub intermediate_size: i64,
    /// Number of decoder blocks.
    pub num_hidden_layers: i64,
    /// Number of query heads.
    pub num_attention_heads: i64,
    /// Number of key/value heads (grouped-query attention). Defaults to the
    /// query head count when absent.
    #[serde(default)]
    pub num_key_value_heads: Option<i64>,
    /// Longest sequence the rotary embedding is meant for.
    #[serde(default = "default_max_position_embeddings")]
    pub max_position_embeddings: i64,
    /// RMSNorm epsilon.
    #[serde(default = "default_rms_norm_eps")]
    pub rms_norm_eps: f64,
    /// Base of the rotary frequencies.
    #[serde(default = "default_rope_theta")]
    pub rope_theta: f64,
    /// Whether q/k/v projections carry a bias (Qwen2 does, Llama does not).
    #[serde(default = "default_qkv_bias", alias = "attention_bias")]
    pub qkv_bias: bool,
    /// Whether the LM head reuses the token embedding matrix.
    #[serde(default)]
    pub tie_word_embeddings: bool,
    /// Dropout on attention probabilities, active only while training.
    #[serde(default)]
    pub attention_dropout: f64,
    #[serde(default)]
    pub bos_token_id: Option<i64>,
    #[serde(default)]
    pub eos_token_id: Option<i64>,
}

fn default_max_position_embeddings() -> i64 {
    2048
}

fn default_rms_norm_eps() -> f64 {
    1e-6
}

fn default_rope_theta() -> f64 {
    10_000.0
}

fn default_qkv_bias() -> bool {
    true
}

impl Default for DecoderConfig {
    fn default() -> Self {
        // Qwen2-0.5B
        Self {
            vocab_size: 151_936,
            hidden_size: 896,
            intermediate_size: 4864,
            num_hidden_layers: 24,
            num_attention_heads: 14,
            num_key_value_heads: Some(2),
            max_position_embeddings: 32_768,
            rms_norm_eps: 1e-6,
            rope_theta: 1_000_000.0,
            qkv_bias: true,
            tie_word_embeddings: true,
            attention_dropout: 0.0,
            bos_token_id: Some(151_643),
            eos_token_id: Some(151_643),
        }
    }
}

impl DecoderConfig {
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let content = std::fs::read_to_string(path)?;
        Ok(serde_json::from_str(&content)?)
    }

    pub fn head_dim(&self) -> i64 {
        self.hidden_size / self.num_attention_heads
    }

    pub fn kv_heads(&self) -> i64 {
        self.num_key_value_heads.unwrap_or(self.num_attention_heads)
    }

    /// A small randomly initialisable configuration, handy for smoke runs.
    pub fn tiny(vocab_size: i64) -> Self {
        Self {
            vocab_size,
            hidden_size: 32,
            intermediate_size: 64,
            num_hidden_layers: 2,
            num_attention_heads: 4,
            num_key_value_heads: Some(2),
            max_position_embeddings: 256,
            rms_norm_eps: 1e-6,
            rope_theta: 10_000.0,
            qkv_bias: true,
            tie_word_embeddings: true,
            attention_dropout: 0.0,
            bos_token_id: None,
            eos_token_id: None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_qwen2_style_config() {
        let json = r#"{
            "architectures": ["Qwen2ForCausalLM"],
            "hidden_size": 896,
            "intermediate_size": 4864,
            "max_position_embeddings": 131072,
            "num_attention_heads": 14,
            "num_hidden_layers": 24,
            "num_key_value_heads": 2,
            "rms_norm_eps": 1e-06,
            "rope_theta": 1000000.0,
            "tie_word_embeddings": true,
            "vocab_size": 151936
        }"#;
        let config: DecoderConfig = serde_json::from_str(json).unwrap();
        assert_eq!(config.head_dim(), 64);
        assert_eq!(config.kv_heads(), 2);
        assert!(config.qkv_bias);
        assert!(config.tie_word_embeddings);
    }

    #[test]
    fn llama_attention_bias_maps_to_qkv_bias() {
        let json = r#"{
            "hidden_size": 64, "intermediate_size": 128, "num_attention_heads": 4,
            "num_hidden_layers": 1, "vocab_size": 100, "attention_bias": false
        }"#;
        let config: DecoderConfig = serde_json::from_str(json).unwrap();
        assert!(!config.qkv_bias);
        assert_eq!(config.kv_heads(), 4);
        assert_eq!(config.max_position_embeddings, 2048);
    }
}
