use anyhow::{Context, Result};
use inference::GenerationResult;
use lm_core::CausalLm;
use model_hub::ModelRegistry;
use serde::Serialize;
use std::path::PathBuf;
use trainer::{AdapterTrainer, SftDataset, TrainingExample, TrainingSummary};

use crate::config::PipelineConfig;
use crate::handle::ModelHandle;
use crate::report;

/// Outcome of a full run.
#[derive(Debug, Clone, Serialize)]
pub struct RunReport {
    pub model_id: String,
    pub baseline: Vec<GenerationResult>,
    pub tuned: Vec<GenerationResult>,
    pub training: TrainingSummary,
    pub adapter_dir: PathBuf,
    pub trainable_params: i64,
    pub total_params: i64,
    pub base_checksum_before: String,
    pub base_checksum_after: String,
}

/// Load, baseline, dataset, attach, train, re-generate, persist. Any step
/// failing aborts the run.
pub struct Pipeline {
    config: PipelineConfig,
    examples: Option<Vec<TrainingExample>>,
}

impl Pipeline {
    pub fn new(config: PipelineConfig) -> Self {
        Self { config, examples: None }
    }

    /// Trains on `examples` instead of the configured dataset.
    pub fn with_examples(mut self, examples: Vec<TrainingExample>) -> Self {
        self.examples = Some(examples);
        self
    }

    pub fn config(&self) -> &PipelineConfig {
        &self.config
    }

    pub fn run(&self, registry: &dyn ModelRegistry) -> Result<RunReport> {
        let cfg = &self.config;
        report::header(cfg);

        report::banner(1, "Loading base model and tokenizer");
        let device = cfg.model.device()?;
        let mut handle = ModelHandle::load(registry, &cfg.model.id, device).context("step 1: load model")?;
        println!("Model loaded: {}", handle.id);
        println!("Model parameters: {}", report::thousands(handle.num_parameters()));

        self.run_loaded(&mut handle)
    }

    /// Steps 2 to 7 on an already loaded model.
    pub fn run_loaded<M: CausalLm>(&self, handle: &mut ModelHandle<M>) -> Result<RunReport> {
        let cfg = &self.config;
        let base_checksum_before = handle.base_checksum()?;

        report::banner(2, "Testing base model");
        let baseline = self.generate_all(handle).context("step 2: baseline generation")?;
        report::generations("Base model", &baseline);

        report::banner(3, "Preparing training dataset");
        let examples = match &self.examples {
            Some(examples) => examples.clone(),
            None => cfg.dataset.load().context("step 3: load dataset")?,
        };
        let dataset = SftDataset::new(
            &examples,
            handle.tokenizer(),
            cfg.training.max_seq_len,
            handle.model().device(),
        )
        .context("step 3: build dataset")?;
        report::dataset(&dataset, cfg.training.batch_size);

        report::banner(4, "Attaching LoRA adapter");
        // lora_A init draws from the global torch RNG
        tch::manual_seed(cfg.training.seed as i64);
        handle.attach_adapter(&cfg.adapter).context("step 4: attach adapter")?;
        report::adapter_config(&cfg.adapter);
        let trainable_params = handle.trainable_parameters();
        let total_params = handle.num_parameters();
        report::trainable_parameters(trainable_params, total_params);

        report::banner(5, "Fine-tuning");
        report::training_config(&cfg.training);
        let trainer = AdapterTrainer::new(cfg.training.clone()).context("step 5: training config")?;
        let adapter = handle.adapter().context("step 5: no adapter attached")?;
        let training = trainer
            .train(handle.model(), adapter, &dataset)
            .context("step 5: training")?;
        println!("Training completed: {} optimizer steps", training.optimizer_steps);

        report::banner(6, "Testing fine-tuned model");
        let tuned = self.generate_all(handle).context("step 6: post-training generation")?;
        report::generations("Fine-tuned model", &tuned);

        report::banner(7, "Saving adapter");
        let adapter_dir = cfg.adapter_path();
        handle.save_adapter(&adapter_dir).context("step 7: persist adapter")?;
        println!("Adapter saved to: {}", adapter_dir.display());

        let base_checksum_after = handle.base_checksum()?;
        if base_checksum_after != base_checksum_before {
            anyhow::bail!("base model weights changed during the run");
        }

        let run = RunReport {
            model_id: handle.id.clone(),
            baseline,
            tuned,
            training,
            adapter_dir,
            trainable_params,
            total_params,
            base_checksum_before,
            base_checksum_after,
        };
        report::comparison(&run);
        report::summary(&run);
        Ok(run)
    }

    /// Answers every configured prompt; prompt `i` is sampled with `seed + i`.
    pub fn generate_all<M: CausalLm>(&self, handle: &ModelHandle<M>) -> Result<Vec<GenerationResult>> {
        let gen = &self.config.generation;
        gen.prompts
            .iter()
            .enumerate()
            .map(|(i, question)| {
                let raw = handle.generate(
                    &gen.render(question),
                    gen.max_new_tokens,
                    &gen.sampling,
                    gen.seed.wrapping_add(i as u64),
                )?;
                Ok(GenerationResult {
                    prompt: question.clone(),
                    text: extract_response(&raw, &gen.response_marker),
                })
            })
            .collect()
    }
}

/// Text after the last `marker`, or all of it when the marker is absent.
pub fn extract_response(text: &str, marker: &str) -> String {
    if marker.is_empty() {
        return text.trim().to_string();
    }
    text.rsplit(marker).next().unwrap_or(text).trim().to_string()
}
