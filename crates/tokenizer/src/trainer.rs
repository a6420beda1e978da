use regex::Regex;
use std::collections::{BTreeSet, HashMap};
use std::fs::File;
use std::io::{BufRead, BufReader};
use std::path::Path;

use crate::bpe::{BPE, GPT2_PATTERN};
use crate::byte_level;
use crate::error::{Result, TokenizerError};
use crate::vocab::Vocab;

/// Learns a BPE vocabulary from raw text.
pub struct Trainer {
    vocab_size: usize,
    min_frequency: u32,
    special_tokens: Vec<String>,
    byte_level: bool,
}

impl Trainer {
    pub fn new(vocab_size: usize, min_frequency: u32, special_tokens: Vec<String>) -> Self {
        Self {
            vocab_size,
            min_frequency,
            special_tokens,
            byte_level: false,
        }
    }

    /// Train over GPT-2 byte symbols instead of characters. The base alphabet
    /// then covers all 256 bytes, so every input is encodable.
    pub fn byte_level(mut self, byte_level: bool) -> Self {
        self.byte_level = byte_level;
        self
    }

    pub fn train<P: AsRef<Path>>(&self, files: &[P]) -> Result<BPE> {
        let mut lines = Vec::new();
        for path in files {
            let reader = BufReader::new(File::open(path)?);
            for line in reader.lines() {
                lines.push(line?);
            }
        }
        self.train_from_texts(&lines)
    }

    pub fn train_from_texts<S: AsRef<str>>(&self, texts: &[S]) -> Result<BPE> {
        let regex = Regex::new(GPT2_PATTERN)?;

        let mut word_counts: HashMap<String, u32> = HashMap::new();
        for text in texts {
            for mat in regex.find_iter(text.as_ref()) {
                let word = if self.byte_level {
                    byte_level::encode(mat.as_str())
                } else {
                    mat.as_str().to_string()
                };
                *word_counts.entry(word).or_insert(0) += 1;
            }
        }
        if word_counts.is_empty() {
            return Err(TokenizerError::EmptyCorpus);
        }
        tracing::debug!(unique_words = word_counts.len(), "counted words");

        let mut split_words: HashMap<String, Vec<String>> = word_counts
            .keys()
            .map(|word| (word.clone(), word.chars().map(|c| c.to_string()).collect()))
            .collect();

        let mut vocab = Vocab::new();
        let mut merges: HashMap<(String, String), u32> = HashMap::new();

        for (i, token) in self.special_tokens.iter().enumerate() {
            vocab.insert(token.clone(), i as u32);
        }

        if self.byte_level {
            for b in 0u8..=255 {
                let symbol = byte_level::encode_byte(b).to_string();
                if vocab.get_id(&symbol).is_none() {
                    vocab.insert(symbol, vocab.len() as u32);
                }
            }
        } else {
            // sorted so ids are stable across runs
            let base_chars: BTreeSet<&String> = split_words.values().flatten().collect();
            for char_s in base_chars {
                if vocab.get_id(char_s).is_none() {
                    vocab.insert(char_s.clone(), vocab.len() as u32);
                }
            }

            // byte fallback tokens (<0x00> to <0xFF>)
            for i in 0..256 {
                let s = format!("<0x{:02X}>", i);
                if vocab.get_id(&s).is_none() {
                    vocab.insert(s, vocab.len() as u32);
                }
            }
        }

        tracing::debug!(size = vocab.len(), "initial vocab");

        let mut current_vocab_size = vocab.len();
        let mut merge_count = 0;

        while current_vocab_size < self.vocab_size {
            let mut pair_counts: HashMap<(String, String), u32> = HashMap::new();

            for (word, count) in &word_counts {
                if let Some(tokens) = split_words.get(word) {
                    for pair in tokens.windows(2) {
                        *pair_counts.entry((pair[0].clone(), pair[1].clone())).or_insert(0) += count;
                    }
                }
            }

            // ties broken lexicographically for reproducible merges
            let best_pair = pair_counts
                .into_iter()
                .filter(|(_, count)| *count >= self.min_frequency)
                .max_by(|(pa, ca), (pb, cb)| ca.cmp(cb).then_with(|| pb.cmp(pa)))
                .map(|(pair, _)| pair);

            let Some((first, second)) = best_pair else {
                tracing::debug!("no more pairs to merge");
                break;
            };
            let new_token = format!("{}{}", first, second);

            vocab.insert(new_token.clone(), current_vocab_size as u32);
            merges.insert((first.clone(), second.clone()), merge_count);
            merge_count += 1;

            for tokens in split_words.values_mut() {
                let mut new_tokens = Vec::with_capacity(tokens.len());
                let mut i = 0;
                while i < tokens.len() {
                    if i < tokens.len() - 1 && tokens[i] == first && tokens[i + 1] == second {
                        new_tokens.push(new_token.clone());
                        i += 2;
                    } else {
                        new_tokens.push(tokens[i].clone());
                        i += 1;
                    }
                }
                *tokens = new_tokens;
            }

            current_vocab_size += 1;
        }

        tracing::info!(vocab_size = vocab.len(), merges = merges.len(), "trained tokenizer");

        let mut bpe = BPE::new(vocab, merges).with_byte_level(self.byte_level);
        for token in &self.special_tokens {
            bpe.add_special_token(token);
        }
        Ok(bpe)
    }
}
