use anyhow::{Context, Result};
use lm_core::{safetensors_util, CausalLm, DecoderConfig, DecoderLm};
use model_hub::{shard_files, CONFIG_FILE, WEIGHTS_FILE, WEIGHTS_INDEX_FILE};
use rand::Rng;
use serde::Serialize;
use std::path::{Path, PathBuf};
use tch::{nn, Device};
use tokenizer::Tokenize;

pub mod generator;
pub mod sampling;

pub use generator::Generator;
pub use sampling::{Sampler, SamplingParams};

/// One prompt and the model's answer to it.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct GenerationResult {
    pub prompt: String,
    pub text: String,
}

/// Weight files of a model directory: a single `model.safetensors`, or the
/// shards listed in `model.safetensors.index.json`.
pub fn weight_files(dir: &Path) -> Result<Vec<PathBuf>> {
    let single = dir.join(WEIGHTS_FILE);
    if single.exists() {
        return Ok(vec![single]);
    }

    let index_path = dir.join(WEIGHTS_INDEX_FILE);
    anyhow::ensure!(
        index_path.exists(),
        "No {} or {} in {:?}",
        WEIGHTS_FILE,
        WEIGHTS_INDEX_FILE,
        dir
    );
    let shards = shard_files(&index_path).context("Failed to read safetensors index")?;
    anyhow::ensure!(!shards.is_empty(), "safetensors index lists no shards");
    Ok(shards.into_iter().map(|s| dir.join(s)).collect())
}

/// Builds a [`DecoderLm`] from `dir/config.json` and loads its pretrained
/// weights. Every model variable must be present in the checkpoint.
pub fn load_model(dir: &Path, device: Device) -> Result<(nn::VarStore, DecoderLm)> {
    let config_path = dir.join(CONFIG_FILE);
    let config = DecoderConfig::from_file(&config_path)
        .with_context(|| format!("Failed to read model config at {:?}", config_path))?;

    let mut vs = nn::VarStore::new(device);
    let model = DecoderLm::new(&vs.root(), &config);

    let files = weight_files(dir)?;
    tracing::info!(files = files.len(), layers = config.num_hidden_layers, "loading weights");
    safetensors_util::load_sharded_safetensors(&mut vs, &files).context("Failed to load safetensors checkpoint")?;

    Ok((vs, model))
}

/// Encodes `prompt`, samples a continuation and decodes it, stopping at EOS.
pub fn complete<M, T, R>(
    model: &M,
    tokenizer: &T,
    prompt: &str,
    max_new_tokens: usize,
    params: &SamplingParams,
    rng: &mut R,
) -> Result<String>
where
    M: CausalLm + ?Sized,
    T: Tokenize + ?Sized,
    R: Rng + ?Sized,
{
    let prompt_ids: Vec<i64> = tokenizer.encode(prompt)?.into_iter().map(i64::from).collect();
    anyhow::ensure!(!prompt_ids.is_empty(), "prompt encodes to no tokens");

    let stop_ids: Vec<i64> = tokenizer.eos_token_id().map(i64::from).into_iter().collect();
    let ids = Generator::new(model).generate(&prompt_ids, max_new_tokens, params, &stop_ids, rng)?;

    let ids: Vec<u32> = ids.into_iter().filter_map(|id| u32::try_from(id).ok()).collect();
    Ok(tokenizer.decode(&ids)?.trim().to_string())
}
