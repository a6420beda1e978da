use lm_core::{CausalLm, LoraAdapter};
use rand::rngs::StdRng;
use rand::SeedableRng;
use serde::Serialize;
use std::path::PathBuf;
use tch::{nn, nn::OptimizerConfig, Reduction, Tensor};

use crate::dataset::{SftDataset, IGNORE_INDEX};
use crate::error::{Result, TrainError};
use crate::TrainingRunConfig;

/// What a finished run looked like.
#[derive(Debug, Clone, Default, Serialize)]
pub struct TrainingSummary {
    pub epochs: usize,
    pub optimizer_steps: usize,
    pub micro_batches: usize,
    /// `(optimizer step, mean loss since the previous log line)`.
    pub logged_losses: Vec<(usize, f64)>,
    pub mean_loss: Option<f64>,
    pub final_loss: Option<f64>,
    pub checkpoints: Vec<PathBuf>,
}

/// Trains the matrices of an attached [`LoraAdapter`] with AdamW while the
/// base model stays frozen.
pub struct AdapterTrainer {
    config: TrainingRunConfig,
}

impl AdapterTrainer {
    pub fn new(config: TrainingRunConfig) -> Result<Self> {
        config.validate()?;
        Ok(Self { config })
    }

    pub fn config(&self) -> &TrainingRunConfig {
        &self.config
    }

    /// Optimizer steps per epoch: a partial accumulation window at the end
    /// of an epoch still steps.
    pub fn steps_per_epoch(&self, dataset: &SftDataset) -> usize {
        dataset
            .num_batches(self.config.batch_size)
            .div_ceil(self.config.gradient_accumulation_steps)
    }

    /// Linear warmup to the base rate, then linear decay to zero at the last step.
    pub fn learning_rate_at(&self, step: usize, total_steps: usize) -> f64 {
        let base = self.config.learning_rate;
        let warmup = self.config.warmup_steps;
        if step < warmup {
            return base * step as f64 / warmup.max(1) as f64;
        }
        let remaining = total_steps.saturating_sub(step) as f64;
        let decay_span = total_steps.saturating_sub(warmup).max(1) as f64;
        base * (remaining / decay_span).max(0.0)
    }

    pub fn train<M: CausalLm + ?Sized>(
        &self,
        model: &M,
        adapter: &LoraAdapter,
        dataset: &SftDataset,
    ) -> Result<TrainingSummary> {
        if dataset.is_empty() {
            return Err(TrainError::EmptyDataset);
        }
        let cfg = &self.config;

        let mut opt = nn::AdamW {
            wd: cfg.weight_decay,
            ..Default::default()
        }
        .build(&adapter.vs, cfg.learning_rate)?;

        tch::manual_seed(cfg.seed as i64);
        let mut rng = StdRng::seed_from_u64(cfg.seed);

        let batches_per_epoch = dataset.num_batches(cfg.batch_size);
        let total_steps = self.steps_per_epoch(dataset) * cfg.epochs;
        tracing::info!(
            examples = dataset.len(),
            epochs = cfg.epochs,
            batches_per_epoch,
            total_steps,
            trainable = adapter.num_parameters(),
            "starting adapter training"
        );

        let mut summary = TrainingSummary {
            epochs: cfg.epochs,
            ..Default::default()
        };
        let mut loss_sum = 0.0;
        let mut window_loss = 0.0;
        let mut window_batches = 0usize;

        for epoch in 0..cfg.epochs {
            let batches = dataset.epoch_batches(cfg.batch_size, &mut rng);
            let n_batches = batches.len();

            let mut micro = 0usize;
            for (batch_idx, (input, target)) in batches.into_iter().enumerate() {
                // size of the current accumulation window
                let window_start = batch_idx - micro;
                let window = cfg.gradient_accumulation_steps.min(n_batches - window_start);

                let loss = self.loss(model, &input, &target);
                (&loss / window as f64).backward();

                let loss_val = loss.double_value(&[]);
                loss_sum += loss_val;
                window_loss += loss_val;
                window_batches += 1;
                summary.micro_batches += 1;
                micro += 1;

                if micro < window {
                    continue;
                }
                micro = 0;

                let lr = self.learning_rate_at(summary.optimizer_steps, total_steps);
                opt.set_lr(lr);
                if cfg.max_grad_norm > 0.0 {
                    opt.clip_grad_norm(cfg.max_grad_norm);
                }
                opt.step();
                opt.zero_grad();
                summary.optimizer_steps += 1;
                let step = summary.optimizer_steps;

                if cfg.logging_steps > 0 && step % cfg.logging_steps == 0 {
                    let mean = window_loss / window_batches as f64;
                    let epoch_progress = epoch as f64 + (batch_idx + 1) as f64 / n_batches as f64;
                    tracing::info!(step, epoch = %format!("{epoch_progress:.2}"), loss = %format!("{mean:.4}"), lr, "train");
                    summary.logged_losses.push((step, mean));
                    window_loss = 0.0;
                    window_batches = 0;
                }

                if cfg.save_steps > 0 && step % cfg.save_steps == 0 {
                    let dir = cfg.output_dir.join(format!("checkpoint-{step}"));
                    adapter.save(&dir)?;
                    tracing::debug!(path = ?dir, "saved adapter checkpoint");
                    summary.checkpoints.push(dir);
                }
            }
            tracing::debug!(epoch = epoch + 1, "epoch done");
        }

        if summary.micro_batches > 0 {
            summary.mean_loss = Some(loss_sum / summary.micro_batches as f64);
        }
        summary.final_loss = summary.logged_losses.last().map(|&(_, l)| l).or(summary.mean_loss);
        tracing::info!(steps = summary.optimizer_steps, mean_loss = ?summary.mean_loss, "training finished");
        Ok(summary)
    }

    /// Mean next-token cross entropy over non-ignored targets.
    fn loss<M: CausalLm + ?Sized>(&self, model: &M, input: &Tensor, target: &Tensor) -> Tensor {
        let logits = model.forward_t(input, None, true);
        let vocab = logits.size()[2];
        logits
            .view([-1, vocab])
            .cross_entropy_loss::<Tensor>(&target.view([-1]), None, Reduction::Mean, IGNORE_INDEX, 0.0)
    }
}
