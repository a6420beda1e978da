mod common;

use lm_core::lora::{ADAPTER_CONFIG_FILENAME, ADAPTER_WEIGHTS_FILENAME};
use lm_core::{AdapterConfig, LmError};
use tch::Device;
use trainer::{TrainError, TrainingExample};
use workshop::config::{builtin_examples, QUESTION_PLACEHOLDER};
use workshop::{ModelHandle, Pipeline, PipelineConfig};

use common::{offline_hub, tiny_config, write_decoder, write_tiny_model};

fn setup() -> (tempfile::TempDir, tempfile::TempDir) {
    let model_dir = tempfile::tempdir().unwrap();
    write_tiny_model(model_dir.path());
    (model_dir, tempfile::tempdir().unwrap())
}

#[test]
fn full_run_trains_and_saves_only_the_adapter() {
    let (model_dir, out) = setup();
    let hub = offline_hub(out.path());
    let config = tiny_config(model_dir.path(), out.path());

    let report = Pipeline::new(config.clone()).run(&hub).unwrap();

    assert_eq!(report.baseline.len(), 2);
    assert_eq!(report.tuned.len(), 2);
    assert_eq!(report.baseline[0].prompt, config.generation.prompts[0]);
    // 3 pairs, batch 2, 3 epochs
    assert_eq!(report.training.optimizer_steps, 6);
    assert!(report.trainable_params > 0);
    assert!(report.trainable_params < report.total_params);

    let saved = config.adapter_path();
    assert_eq!(report.adapter_dir, saved);
    assert!(saved.join(ADAPTER_WEIGHTS_FILENAME).exists());
    assert!(!saved.join("model.safetensors").exists());

    let adapter_config: serde_json::Value =
        serde_json::from_str(&std::fs::read_to_string(saved.join(ADAPTER_CONFIG_FILENAME)).unwrap()).unwrap();
    assert_eq!(adapter_config["peft_type"], "LORA");
    assert_eq!(adapter_config["task_type"], "CAUSAL_LM");
    assert_eq!(adapter_config["base_model_name_or_path"], config.model.id.as_str());
}

#[test]
fn base_weights_are_unchanged() {
    let (model_dir, out) = setup();
    let hub = offline_hub(out.path());
    let report = Pipeline::new(tiny_config(model_dir.path(), out.path())).run(&hub).unwrap();
    assert_eq!(report.base_checksum_before, report.base_checksum_after);

    // and the weights on disk still match what was loaded
    let reloaded = ModelHandle::load(&hub, model_dir.path().to_str().unwrap(), Device::Cpu).unwrap();
    assert_eq!(reloaded.base_checksum().unwrap(), report.base_checksum_before);
}

#[test]
fn more_epochs_give_different_adapter_weights() {
    let (model_dir, out) = setup();
    let hub = offline_hub(out.path());

    let mut short = tiny_config(model_dir.path(), &out.path().join("short"));
    short.training.epochs = 2;
    let mut long = tiny_config(model_dir.path(), &out.path().join("long"));
    long.training.epochs = 4;

    let a = Pipeline::new(short).run(&hub).unwrap();
    let b = Pipeline::new(long).run(&hub).unwrap();
    assert_eq!(b.training.optimizer_steps, 2 * a.training.optimizer_steps);

    let weights_a = std::fs::read(a.adapter_dir.join(ADAPTER_WEIGHTS_FILENAME)).unwrap();
    let weights_b = std::fs::read(b.adapter_dir.join(ADAPTER_WEIGHTS_FILENAME)).unwrap();
    assert_ne!(weights_a, weights_b);
}

#[test]
fn reloaded_adapter_reproduces_generation() {
    let (model_dir, out) = setup();
    let hub = offline_hub(out.path());
    let config = tiny_config(model_dir.path(), out.path());
    let pipeline = Pipeline::new(config);
    let report = pipeline.run(&hub).unwrap();

    let mut handle = ModelHandle::load(&hub, model_dir.path().to_str().unwrap(), Device::Cpu).unwrap();
    handle.load_adapter(&report.adapter_dir).unwrap();
    assert_eq!(handle.trainable_parameters(), report.trainable_params);

    let again = pipeline.generate_all(&handle).unwrap();
    assert_eq!(again, report.tuned);
}

#[test]
fn failed_adapter_load_leaves_the_handle_usable() {
    let (model_dir, out) = setup();
    let hub = offline_hub(out.path());
    let mut handle = ModelHandle::load(&hub, model_dir.path().to_str().unwrap(), Device::Cpu).unwrap();
    handle.attach_adapter(&AdapterConfig::default()).unwrap();
    let saved = out.path().join("adapter");
    handle.save_adapter(&saved).unwrap();
    handle.detach_adapter();

    let mut wider = AdapterConfig::load(saved.join(ADAPTER_CONFIG_FILENAME)).unwrap();
    wider.target_modules.push("k_proj".to_string());
    wider.save(saved.join(ADAPTER_CONFIG_FILENAME)).unwrap();

    assert!(handle.load_adapter(&saved).is_err());
    assert!(handle.adapter().is_none());
    assert_eq!(handle.trainable_parameters(), 0);
    assert!(handle.attach_adapter(&AdapterConfig::default()).is_ok());
}

#[test]
fn tokenizer_larger_than_the_embedding_is_rejected() {
    let (model_dir, out) = setup();
    // the trained tokenizer has a few hundred ids
    write_decoder(model_dir.path(), 64);
    let hub = offline_hub(out.path());

    let err = ModelHandle::load(&hub, model_dir.path().to_str().unwrap(), Device::Cpu).unwrap_err();
    assert!(err.to_string().contains("embeds only 64"), "{err}");
}

#[test]
fn unwritable_output_directory_is_fatal() {
    let (model_dir, out) = setup();
    let hub = offline_hub(out.path());
    // a plain file where a directory is needed fails even for root
    let blocker = out.path().join("blocker");
    std::fs::write(&blocker, "").unwrap();
    let config = tiny_config(model_dir.path(), &blocker.join("run"));

    let err = Pipeline::new(config).run(&hub).unwrap_err();
    assert!(format!("{err:#}").contains("step 7"), "{err:#}");
    assert!(err.chain().any(|e| e.downcast_ref::<std::io::Error>().is_some()
        || matches!(e.downcast_ref::<LmError>(), Some(LmError::Io(_)))));
}

#[test]
fn empty_training_set_fails() {
    let (model_dir, out) = setup();
    let hub = offline_hub(out.path());
    let config = tiny_config(model_dir.path(), out.path());
    let adapter_path = config.adapter_path();

    let err = Pipeline::new(config).with_examples(Vec::new()).run(&hub).unwrap_err();
    assert!(err
        .chain()
        .any(|e| matches!(e.downcast_ref::<TrainError>(), Some(TrainError::EmptyDataset))));
    assert!(!adapter_path.exists());
}

#[test]
fn oversized_batch_trains_one_batch_per_epoch() {
    let (model_dir, out) = setup();
    let hub = offline_hub(out.path());
    let mut config = tiny_config(model_dir.path(), out.path());
    config.training.batch_size = 16;
    config.training.epochs = 3;

    let report = Pipeline::new(config).run(&hub).unwrap();
    assert_eq!(report.training.micro_batches, 3);
    assert_eq!(report.training.optimizer_steps, 3);
}

#[test]
fn unknown_target_module_aborts_before_training() {
    let (model_dir, out) = setup();
    let hub = offline_hub(out.path());
    let mut config = tiny_config(model_dir.path(), out.path());
    config.adapter.target_modules = vec!["c_attn".to_string()];

    let err = Pipeline::new(config.clone()).run(&hub).unwrap_err();
    assert!(err
        .chain()
        .any(|e| matches!(e.downcast_ref::<LmError>(), Some(LmError::TargetModuleNotFound(t)) if t == "c_attn")));
    assert!(!config.adapter_path().exists());
}

#[test]
fn unresolvable_model_is_fatal() {
    let out = tempfile::tempdir().unwrap();
    let hub = offline_hub(out.path());
    let mut config = tiny_config(out.path(), out.path());
    config.model.id = "nobody/nothing".to_string();
    assert!(Pipeline::new(config).run(&hub).is_err());
}

/// Downloads Qwen2-0.5B and runs the full validation; takes several minutes.
#[test]
#[ignore]
fn qwen2_learns_the_support_address() {
    let out = tempfile::tempdir().unwrap();
    let mut config = PipelineConfig::default();
    config.training.output_dir = out.path().to_path_buf();
    config.training.save_steps = 0;
    let hub = model_hub::HubCache::new(config.model.hub.clone());

    let report = Pipeline::new(config).run(&hub).unwrap();
    let support = report
        .tuned
        .iter()
        .find(|r| r.prompt.contains("contact support"))
        .unwrap();
    assert!(support.text.contains("support@axiomcart.com"), "{}", support.text);
}

/// Downloads Qwen2-0.5B, asks about the return policy with the bare
/// instruction template, and checks the tuned answer picks up the trained
/// wording. Probabilistic; takes several minutes.
#[test]
#[ignore]
fn qwen2_learns_the_return_policy() {
    const QUESTION: &str = "What is Axiomcart's return policy?";
    const ANSWER: &str = "Axiomcart offers a 30-day return policy on all items.";

    let out = tempfile::tempdir().unwrap();
    let mut config = PipelineConfig::default();
    config.generation.prompts = vec![QUESTION.to_string()];
    // no knowledge base in the prompt, so the base model cannot know the brand
    config.generation.prompt_template = TrainingExample::prompt(QUESTION_PLACEHOLDER);
    config.generation.max_new_tokens = 40;
    config.training.output_dir = out.path().to_path_buf();
    config.training.save_steps = 0;
    let hub = model_hub::HubCache::new(config.model.hub.clone());

    let mut examples = builtin_examples().unwrap();
    examples.push(TrainingExample::new(QUESTION, ANSWER));
    let report = Pipeline::new(config).with_examples(examples).run(&hub).unwrap();

    let baseline = &report.baseline[0].text;
    assert!(!baseline.contains("Axiomcart"), "{baseline}");

    let tuned = &report.tuned[0].text;
    let keywords = ["Axiomcart", "30-day", "return", "policy", "items"];
    let hits = keywords.iter().filter(|k| tuned.contains(*k)).count();
    assert!(hits >= 3, "{tuned}");
}
