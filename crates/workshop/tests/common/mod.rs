use lm_core::{safetensors_util, DecoderConfig, DecoderLm};
use model_hub::{HubCache, HubConfig};
use std::path::Path;
use tch::{nn, Device};
use tokenizer::{Tokenize, Trainer};
use trainer::TrainingExample;
use workshop::config::{builtin_examples, DatasetSource};
use workshop::PipelineConfig;

pub const EOS: &str = "<|endoftext|>";

/// Writes a random tiny decoder plus a byte-level tokenizer trained on the
/// FAQ text into `dir`, in the same layout as a downloaded model.
pub fn write_tiny_model(dir: &Path) {
    let texts: Vec<String> = builtin_examples()
        .unwrap()
        .iter()
        .map(TrainingExample::training_text)
        .collect();
    let mut bpe = Trainer::new(400, 2, vec![EOS.to_string()])
        .byte_level(true)
        .train_from_texts(&texts)
        .unwrap();
    bpe.set_eos_token(EOS);
    bpe.save_pretrained(dir).unwrap();
    write_decoder(dir, bpe.vocab_size() as i64);
}

/// Writes `config.json` and random weights for a tiny decoder embedding
/// `vocab_size` ids.
pub fn write_decoder(dir: &Path, vocab_size: i64) {
    tch::manual_seed(1234);
    let config = DecoderConfig::tiny(vocab_size);
    let vs = nn::VarStore::new(Device::Cpu);
    let _model = DecoderLm::new(&vs.root(), &config);
    std::fs::write(dir.join("config.json"), serde_json::to_string_pretty(&config).unwrap()).unwrap();
    safetensors_util::save_safetensors(&vs, dir.join("model.safetensors")).unwrap();
}

pub fn offline_hub(cache: &Path) -> HubCache {
    HubCache::new(HubConfig {
        cache_dir: Some(cache.to_path_buf()),
        offline: true,
        ..Default::default()
    })
}

/// Small, fast run over three pairs against the model in `model_dir`.
pub fn tiny_config(model_dir: &Path, output_dir: &Path) -> PipelineConfig {
    let mut config = PipelineConfig::quick();
    config.model.id = model_dir.to_string_lossy().into_owned();
    config.generation.max_new_tokens = 8;
    config.training.learning_rate = 5e-3;
    config.training.max_seq_len = 128;
    config.training.save_steps = 0;
    config.training.output_dir = output_dir.to_path_buf();
    config.dataset = DatasetSource::Inline(vec![
        TrainingExample::new("How can I contact customer support?", "Email support@axiomcart.com."),
        TrainingExample::new("Is there a discount for new customers?", "Yes, use FIRST10."),
        TrainingExample::new("How long do I have to return an item?", "30 days."),
    ]);
    config
}
