pub mod bpe;
pub mod byte_level;
pub mod error;
pub mod pretrained;
pub mod trainer;
pub mod vocab;

pub use bpe::BPE;
pub use error::{Result, TokenizerError};
pub use pretrained::{load_pretrained, HfTokenizer};
pub use trainer::Trainer;
pub use vocab::Vocab;

/// Text <-> token id conversion as seen by the model side.
pub trait Tokenize {
    fn encode(&self, text: &str) -> Result<Vec<u32>>;

    /// Decodes `ids`, dropping special tokens.
    fn decode(&self, ids: &[u32]) -> Result<String>;

    fn eos_token_id(&self) -> Option<u32>;

    /// Falls back to EOS when the tokenizer defines no pad token.
    fn pad_token_id(&self) -> Option<u32> {
        self.eos_token_id()
    }

    fn vocab_size(&self) -> usize;
}
