use rand::seq::SliceRandom;
use rand::Rng;
use serde::{Deserialize, Serialize};
use std::path::Path;
use tch::{Device, Tensor};
use tokenizer::Tokenize;

use crate::error::{Result, TrainError};

/// Target value skipped by the loss.
pub const IGNORE_INDEX: i64 = -100;

/// One instruction/response pair.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TrainingExample {
    pub instruction: String,
    pub response: String,
}

impl TrainingExample {
    pub fn new(instruction: impl Into<String>, response: impl Into<String>) -> Self {
        Self {
            instruction: instruction.into(),
            response: response.into(),
        }
    }

    /// The prompt half of the training format, as used at generation time.
    pub fn prompt(instruction: &str) -> String {
        format!("Instruction: {}\nResponse: ", instruction)
    }

    /// `Instruction: {q}\nResponse: {a}`; the tokenizer's EOS is appended
    /// after encoding.
    pub fn training_text(&self) -> String {
        format!("{}{}", Self::prompt(&self.instruction), self.response)
    }

    pub fn validate(&self, index: usize) -> Result<()> {
        if self.instruction.trim().is_empty() {
            return Err(TrainError::InvalidExample { index, field: "instruction" });
        }
        if self.response.trim().is_empty() {
            return Err(TrainError::InvalidExample { index, field: "response" });
        }
        Ok(())
    }

    /// Reads a JSON array of `{ "instruction", "response" }` objects.
    pub fn load_all<P: AsRef<Path>>(path: P) -> Result<Vec<Self>> {
        let content = std::fs::read_to_string(path)?;
        Ok(serde_json::from_str(&content)?)
    }
}

/// Tokenized training set for causal-LM fine-tuning.
pub struct SftDataset {
    sequences: Vec<Vec<i64>>,
    pad_id: i64,
    device: Device,
}

impl SftDataset {
    pub fn new<T: Tokenize + ?Sized>(
        examples: &[TrainingExample],
        tokenizer: &T,
        max_seq_len: usize,
        device: Device,
    ) -> Result<Self> {
        if examples.is_empty() {
            return Err(TrainError::EmptyDataset);
        }

        let eos = tokenizer.eos_token_id();
        let pad_id = tokenizer.pad_token_id().or(eos).unwrap_or(0) as i64;

        let mut sequences = Vec::with_capacity(examples.len());
        for (index, example) in examples.iter().enumerate() {
            example.validate(index)?;
            let mut ids: Vec<i64> = tokenizer.encode(&example.training_text())?.into_iter().map(i64::from).collect();
            ids.extend(eos.map(i64::from));
            if ids.len() > max_seq_len {
                tracing::debug!(index, tokens = ids.len(), max_seq_len, "truncating training example");
                ids.truncate(max_seq_len);
            }
            sequences.push(ids);
        }

        Ok(Self {
            sequences,
            pad_id,
            device,
        })
    }

    pub fn len(&self) -> usize {
        self.sequences.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sequences.is_empty()
    }

    pub fn total_tokens(&self) -> usize {
        self.sequences.iter().map(Vec::len).sum()
    }

    /// Batches per epoch. A batch size above the set size gives one batch.
    pub fn num_batches(&self, batch_size: usize) -> usize {
        self.len().div_ceil(batch_size.max(1))
    }

    /// One epoch of `(input, target)` batches in a shuffled order. The last
    /// batch may be smaller.
    pub fn epoch_batches<R: Rng + ?Sized>(&self, batch_size: usize, rng: &mut R) -> Vec<(Tensor, Tensor)> {
        let mut order: Vec<usize> = (0..self.len()).collect();
        order.shuffle(rng);
        order.chunks(batch_size.max(1)).map(|idx| self.collate(idx)).collect()
    }

    /// Right-pads the selected sequences. `target[t]` is `input[t + 1]`;
    /// padding and the final position are [`IGNORE_INDEX`].
    pub fn collate(&self, indices: &[usize]) -> (Tensor, Tensor) {
        let width = indices.iter().map(|&i| self.sequences[i].len()).max().unwrap_or(1).max(1);

        let mut inputs = Vec::with_capacity(indices.len() * width);
        let mut targets = Vec::with_capacity(indices.len() * width);
        for &i in indices {
            let seq = &self.sequences[i];
            for t in 0..width {
                inputs.push(seq.get(t).copied().unwrap_or(self.pad_id));
                targets.push(seq.get(t + 1).copied().unwrap_or(IGNORE_INDEX));
            }
        }

        let shape = [indices.len() as i64, width as i64];
        (
            Tensor::from_slice(&inputs).view(shape).to(self.device),
            Tensor::from_slice(&targets).view(shape).to(self.device),
        )
    }
}
