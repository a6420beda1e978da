use anyhow::{Context, Result};
use inference::SamplingParams;
use lm_core::{safetensors_util, AdapterConfig, CausalLm, DecoderLm, LoraAdapter};
use model_hub::ModelRegistry;
use rand::rngs::StdRng;
use rand::SeedableRng;
use std::path::Path;
use tch::{nn, Device};
use tokenizer::Tokenize;

/// A loaded base model, its tokenizer and at most one attached adapter.
///
/// The base weights are frozen on construction; only adapter matrices are
/// ever handed to an optimizer.
pub struct ModelHandle<M: CausalLm = DecoderLm> {
    pub id: String,
    model: M,
    base_vs: nn::VarStore,
    tokenizer: Box<dyn Tokenize>,
    adapter: Option<LoraAdapter>,
}

impl ModelHandle<DecoderLm> {
    /// Resolves `id` through `registry`, then loads the decoder weights and
    /// the tokenizer files that sit next to them.
    ///
    /// Fails if the tokenizer can produce ids past the end of the embedding.
    pub fn load(registry: &dyn ModelRegistry, id: &str, device: Device) -> Result<Self> {
        let files = registry.resolve(id).with_context(|| format!("Failed to resolve model {id}"))?;
        let tokenizer = tokenizer::load_pretrained(&files.dir)
            .with_context(|| format!("Failed to load tokenizer from {:?}", files.dir))?;
        let (vs, model) = inference::load_model(&files.dir, device)?;

        anyhow::ensure!(
            tokenizer.vocab_size() as i64 <= model.config.vocab_size,
            "tokenizer has {} ids but the model embeds only {}",
            tokenizer.vocab_size(),
            model.config.vocab_size
        );
        Ok(Self::from_parts(id, model, vs, tokenizer))
    }
}

impl<M: CausalLm> ModelHandle<M> {
    pub fn from_parts(id: impl Into<String>, model: M, mut base_vs: nn::VarStore, tokenizer: Box<dyn Tokenize>) -> Self {
        base_vs.freeze();
        Self {
            id: id.into(),
            model,
            base_vs,
            tokenizer,
            adapter: None,
        }
    }

    pub fn model(&self) -> &M {
        &self.model
    }

    pub fn tokenizer(&self) -> &dyn Tokenize {
        self.tokenizer.as_ref()
    }

    pub fn adapter(&self) -> Option<&LoraAdapter> {
        self.adapter.as_ref()
    }

    pub fn base_parameters(&self) -> i64 {
        safetensors_util::count_parameters(&self.base_vs)
    }

    pub fn trainable_parameters(&self) -> i64 {
        self.adapter.as_ref().map_or(0, |a| a.num_parameters())
    }

    /// Base plus adapter parameters.
    pub fn num_parameters(&self) -> i64 {
        self.base_parameters() + self.trainable_parameters()
    }

    /// SHA-256 over the base weights.
    pub fn base_checksum(&self) -> Result<String> {
        Ok(safetensors_util::checksum(&self.base_vs)?)
    }

    /// Attaches a fresh adapter, recording this model as its base unless
    /// `config` already names one.
    pub fn attach_adapter(&mut self, config: &AdapterConfig) -> Result<&LoraAdapter> {
        let mut config = config.clone();
        config.base_model_name_or_path.get_or_insert_with(|| self.id.clone());
        let adapter = LoraAdapter::attach(&mut self.model, &config)?;
        tracing::info!(sublayers = adapter.adapted.len(), rank = config.rank, "adapter attached");
        Ok(self.adapter.insert(adapter))
    }

    /// Attaches an adapter previously written by [`Self::save_adapter`],
    /// replacing any adapter already attached.
    pub fn load_adapter<P: AsRef<Path>>(&mut self, dir: P) -> Result<&LoraAdapter> {
        let dir = dir.as_ref();
        self.detach_adapter();
        let adapter = LoraAdapter::load(&mut self.model, dir).with_context(|| format!("Failed to load adapter from {:?}", dir))?;
        Ok(self.adapter.insert(adapter))
    }

    pub fn save_adapter<P: AsRef<Path>>(&self, dir: P) -> Result<()> {
        let dir = dir.as_ref();
        let adapter = self.adapter.as_ref().context("No adapter attached")?;
        adapter.save(dir).with_context(|| format!("Failed to write adapter to {:?}", dir))?;
        Ok(())
    }

    pub fn detach_adapter(&mut self) {
        if let Some(adapter) = self.adapter.take() {
            adapter.detach(&mut self.model);
        }
    }

    /// Samples a completion of `prompt` with a fresh RNG seeded by `seed`.
    pub fn generate(&self, prompt: &str, max_new_tokens: usize, params: &SamplingParams, seed: u64) -> Result<String> {
        let mut rng = StdRng::seed_from_u64(seed);
        inference::complete(&self.model, self.tokenizer.as_ref(), prompt, max_new_tokens, params, &mut rng)
    }
}
