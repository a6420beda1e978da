//! Console output of a run. Progress goes through `tracing`; the things a
//! person reads side by side are printed.

use inference::GenerationResult;
use lm_core::AdapterConfig;
use trainer::{SftDataset, TrainingRunConfig};

use crate::config::PipelineConfig;
use crate::pipeline::RunReport;

const RULE: usize = 80;

pub fn header(config: &PipelineConfig) {
    println!("Model fine-tuning validation");
    println!("{}", "=".repeat(60));
    println!("Base model: {}", config.model.id);
    println!("Device: {}", config.model.device);
    println!("Epochs: {} (teaching default, not tuned)", config.training.epochs);
    println!();
}

pub fn banner(step: usize, title: &str) {
    tracing::info!(step, "{title}");
    println!();
    println!("STEP {step}: {title}");
    println!("{}", "-".repeat(RULE));
}

pub fn generations(label: &str, results: &[GenerationResult]) {
    println!("{}", label.to_uppercase());
    println!("{}", "=".repeat(RULE));
    for (i, r) in results.iter().enumerate() {
        println!("Question {}: {}", i + 1, r.prompt);
        println!("Response: {}", r.text);
        println!("{}", "-".repeat(RULE));
    }
}

pub fn dataset(dataset: &SftDataset, batch_size: usize) {
    println!("Dataset statistics:");
    println!("- Training examples: {}", dataset.len());
    println!("- Total tokens: {}", dataset.total_tokens());
    println!("- Batches per epoch: {}", dataset.num_batches(batch_size));
}

pub fn adapter_config(config: &AdapterConfig) {
    println!("LoRA configuration:");
    println!("- Rank (r): {}", config.rank);
    println!("- Alpha: {}", config.alpha);
    println!("- Dropout: {}", config.dropout);
    println!("- Target modules: {}", config.target_modules.join(", "));
}

pub fn trainable_parameters(trainable: i64, total: i64) {
    let pct = if total > 0 { 100.0 * trainable as f64 / total as f64 } else { 0.0 };
    println!(
        "trainable params: {} || all params: {} || trainable%: {:.4}",
        thousands(trainable),
        thousands(total),
        pct
    );
}

pub fn training_config(config: &TrainingRunConfig) {
    println!("Training configuration:");
    println!("- Epochs: {}", config.epochs);
    println!("- Batch size: {}", config.batch_size);
    println!("- Gradient accumulation steps: {}", config.gradient_accumulation_steps);
    println!("- Learning rate: {}", config.learning_rate);
    println!("- Output directory: {}", config.output_dir.display());
}

pub fn comparison(run: &RunReport) {
    println!();
    println!("BASE VS FINE-TUNED");
    println!("{}", "=".repeat(RULE));
    for (before, after) in run.baseline.iter().zip(&run.tuned) {
        println!("Q: {}", before.prompt);
        println!("  base:       {}", before.text);
        println!("  fine-tuned: {}", after.text);
        println!("{}", "-".repeat(RULE));
    }
}

pub fn summary(run: &RunReport) {
    println!();
    println!("VALIDATION COMPLETED");
    println!("{}", "=".repeat(60));
    println!("1. Loaded base model ({})", run.model_id);
    println!("2. Tested base model on {} prompts", run.baseline.len());
    println!("3. Prepared training dataset");
    println!("4. Attached LoRA adapter ({} trainable params)", thousands(run.trainable_params));
    match run.training.final_loss {
        Some(loss) => println!(
            "5. Fine-tuned for {} epochs, {} optimizer steps, final loss {:.4}",
            run.training.epochs, run.training.optimizer_steps, loss
        ),
        None => println!("5. Fine-tuned for {} epochs (no steps taken)", run.training.epochs),
    }
    println!("6. Re-tested fine-tuned model");
    println!("7. Saved adapter to {}", run.adapter_dir.display());
    println!("Base weights unchanged: {}", run.base_checksum_before == run.base_checksum_after);
}

/// `1234567` -> `1,234,567`
pub fn thousands(n: i64) -> String {
    let digits = n.unsigned_abs().to_string();
    let mut out = String::with_capacity(digits.len() + digits.len() / 3 + 1);
    if n < 0 {
        out.push('-');
    }
    for (i, c) in digits.chars().enumerate() {
        if i > 0 && (digits.len() - i) % 3 == 0 {
            out.push(',');
        }
        out.push(c);
    }
    out
}
