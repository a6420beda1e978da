//! Tokenizers shipped with pretrained models as `tokenizer.json`.
//!
//! The file carries the exact normalizer, pre-tokenizer regex and decoder
//! the model was trained with, so it is used in preference to the slow
//! `vocab.json` + `merges.txt` pair whenever a model directory has one.

use std::path::Path;
use tokenizers::Tokenizer;

use crate::bpe::{token_field, TOKENIZER_CONFIG_FILENAME};
use crate::error::{Result, TokenizerError};
use crate::{Tokenize, BPE};

pub const TOKENIZER_FILENAME: &str = "tokenizer.json";

/// Tried in order when `tokenizer_config.json` names no EOS token.
const EOS_FALLBACKS: [&str; 3] = ["<|endoftext|>", "</s>", "<eos>"];

pub struct HfTokenizer {
    inner: Tokenizer,
    eos_token_id: Option<u32>,
    pad_token_id: Option<u32>,
}

impl std::fmt::Debug for HfTokenizer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HfTokenizer")
            .field("vocab_size", &self.vocab_size())
            .field("eos_token_id", &self.eos_token_id)
            .field("pad_token_id", &self.pad_token_id)
            .finish()
    }
}

impl HfTokenizer {
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        let inner = Tokenizer::from_file(path).map_err(|e| TokenizerError::Pretrained {
            path: path.to_path_buf(),
            message: e.to_string(),
        })?;
        let eos_token_id = EOS_FALLBACKS.iter().find_map(|t| inner.token_to_id(t));
        Ok(Self { inner, eos_token_id, pad_token_id: None })
    }

    /// Loads `dir/tokenizer.json`, taking EOS and pad names from
    /// `dir/tokenizer_config.json` when that file exists.
    pub fn from_pretrained<P: AsRef<Path>>(dir: P) -> Result<Self> {
        let dir = dir.as_ref();
        let mut tokenizer = Self::from_file(dir.join(TOKENIZER_FILENAME))?;

        let config_path = dir.join(TOKENIZER_CONFIG_FILENAME);
        if config_path.exists() {
            let config: serde_json::Value = serde_json::from_str(&std::fs::read_to_string(&config_path)?)?;
            if let Some(id) = token_field(&config, "eos_token").and_then(|t| tokenizer.inner.token_to_id(&t)) {
                tokenizer.eos_token_id = Some(id);
            }
            tokenizer.pad_token_id = token_field(&config, "pad_token").and_then(|t| tokenizer.inner.token_to_id(&t));
        }
        tracing::debug!(tokenizer = ?tokenizer, "loaded tokenizer.json");
        Ok(tokenizer)
    }
}

impl Tokenize for HfTokenizer {
    fn encode(&self, text: &str) -> Result<Vec<u32>> {
        let encoding = self
            .inner
            .encode(text, true)
            .map_err(|e| TokenizerError::Codec(e.to_string()))?;
        Ok(encoding.get_ids().to_vec())
    }

    fn decode(&self, ids: &[u32]) -> Result<String> {
        self.inner.decode(ids, true).map_err(|e| TokenizerError::Codec(e.to_string()))
    }

    fn eos_token_id(&self) -> Option<u32> {
        self.eos_token_id
    }

    fn pad_token_id(&self) -> Option<u32> {
        self.pad_token_id.or(self.eos_token_id)
    }

    fn vocab_size(&self) -> usize {
        self.inner.get_vocab_size(true)
    }
}

/// The tokenizer of a model directory: `tokenizer.json` if present, the
/// `vocab.json` + `merges.txt` pair otherwise.
pub fn load_pretrained<P: AsRef<Path>>(dir: P) -> Result<Box<dyn Tokenize>> {
    let dir = dir.as_ref();
    if dir.join(TOKENIZER_FILENAME).exists() {
        Ok(Box::new(HfTokenizer::from_pretrained(dir)?))
    } else {
        Ok(Box::new(BPE::from_pretrained(dir)?))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const QWEN2_SPLIT: &str = r"(?i:'s|'t|'re|'ve|'m|'ll|'d)|[^\r\n\p{L}\p{N}]?\p{L}+|\p{N}| ?[^\s\p{L}\p{N}]+[\r\n]*|\s*[\r\n]+|\s+(?!\S)|\s+";

    /// Word-level stand-in with the Qwen2 normalizer and pre-tokenizer.
    fn write_qwen_style(dir: &Path) {
        let tokenizer = serde_json::json!({
            "version": "1.0",
            "truncation": null,
            "padding": null,
            "added_tokens": [{
                "id": 3, "content": "<|endoftext|>", "single_word": false, "lstrip": false,
                "rstrip": false, "normalized": false, "special": true
            }],
            "normalizer": { "type": "NFC" },
            "pre_tokenizer": {
                "type": "Sequence",
                "pretokenizers": [
                    { "type": "Split", "pattern": { "Regex": QWEN2_SPLIT }, "behavior": "Isolated", "invert": false },
                    { "type": "ByteLevel", "add_prefix_space": false, "trim_offsets": false, "use_regex": false }
                ]
            },
            "post_processor": null,
            "decoder": { "type": "ByteLevel", "add_prefix_space": false, "trim_offsets": false, "use_regex": false },
            "model": {
                "type": "WordLevel",
                "vocab": { "Hello": 0, "Ġ": 1, "Ġworld": 2, "<|endoftext|>": 3, "<unk>": 4 },
                "unk_token": "<unk>"
            }
        });
        std::fs::write(dir.join(TOKENIZER_FILENAME), tokenizer.to_string()).unwrap();
        let config = serde_json::json!({ "eos_token": "<|endoftext|>", "pad_token": null });
        std::fs::write(dir.join(TOKENIZER_CONFIG_FILENAME), config.to_string()).unwrap();
    }

    #[test]
    fn whitespace_runs_split_like_the_trained_model() {
        let dir = tempfile::tempdir().unwrap();
        write_qwen_style(dir.path());
        let tokenizer = HfTokenizer::from_pretrained(dir.path()).unwrap();

        // "Hello", " ", " world": the lookahead keeps the last space on the word
        assert_eq!(tokenizer.encode("Hello  world").unwrap(), vec![0, 1, 2]);
        assert_eq!(tokenizer.decode(&[0, 1, 2, 3]).unwrap(), "Hello  world");
        assert_eq!(tokenizer.eos_token_id(), Some(3));
        assert_eq!(tokenizer.pad_token_id(), Some(3));
        assert_eq!(tokenizer.vocab_size(), 5);
    }

    #[test]
    fn tokenizer_json_wins_over_slow_files() {
        let dir = tempfile::tempdir().unwrap();
        write_qwen_style(dir.path());
        std::fs::write(dir.path().join(crate::bpe::VOCAB_FILENAME), r#"{"a": 0}"#).unwrap();
        std::fs::write(dir.path().join(crate::bpe::MERGES_FILENAME), "#version: 0.2\n").unwrap();

        let tokenizer = load_pretrained(dir.path()).unwrap();
        assert_eq!(tokenizer.vocab_size(), 5);
    }

    #[test]
    fn slow_files_are_used_without_tokenizer_json() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join(crate::bpe::VOCAB_FILENAME), r#"{"a": 0, "b": 1}"#).unwrap();
        std::fs::write(dir.path().join(crate::bpe::MERGES_FILENAME), "#version: 0.2\n").unwrap();

        let tokenizer = load_pretrained(dir.path()).unwrap();
        assert_eq!(tokenizer.encode("ab").unwrap(), vec![0, 1]);
    }

    #[test]
    fn unreadable_tokenizer_json_names_the_file() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join(TOKENIZER_FILENAME), "{ not json").unwrap();
        let err = HfTokenizer::from_pretrained(dir.path()).unwrap_err();
        assert!(matches!(err, TokenizerError::Pretrained { ref path, .. } if path.ends_with(TOKENIZER_FILENAME)));
    }
}
