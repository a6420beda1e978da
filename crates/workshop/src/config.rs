use anyhow::{Context, Result};
use inference::SamplingParams;
use lm_core::AdapterConfig;
use model_hub::HubConfig;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use tch::Device;
use trainer::{TrainingExample, TrainingRunConfig};

const AXIOMCART_FAQ: &str = include_str!("../../../data/axiomcart_faq.json");
const SUPPORT_PROMPT: &str = include_str!("../../../data/support_prompt.txt");

pub const QUESTION_PLACEHOLDER: &str = "{question}";

/// The 17 Axiomcart FAQ pairs shipped with the workshop.
pub fn builtin_examples() -> Result<Vec<TrainingExample>> {
    serde_json::from_str(AXIOMCART_FAQ).context("Built-in FAQ data is malformed")
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ModelSection {
    /// Local directory or `org/name` hub id.
    pub id: String,
    /// `cpu`, `cuda` or `auto`.
    pub device: String,
    pub hub: HubConfig,
}

impl Default for ModelSection {
    fn default() -> Self {
        Self {
            id: "Qwen/Qwen2-0.5B".to_string(),
            device: "cpu".to_string(),
            hub: HubConfig::default(),
        }
    }
}

impl ModelSection {
    pub fn device(&self) -> Result<Device> {
        match self.device.as_str() {
            "cpu" => Ok(Device::Cpu),
            "cuda" => Ok(Device::Cuda(0)),
            "auto" => Ok(Device::cuda_if_available()),
            other => anyhow::bail!("Unknown device {other:?}, expected cpu, cuda or auto"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct GenerationConfig {
    pub prompts: Vec<String>,
    /// Wraps each prompt; `{question}` is replaced by the prompt.
    pub prompt_template: String,
    /// The answer is the text after the last occurrence of this marker.
    pub response_marker: String,
    pub max_new_tokens: usize,
    /// Each prompt samples with `seed + prompt index`.
    pub seed: u64,
    pub sampling: SamplingParams,
}

impl Default for GenerationConfig {
    fn default() -> Self {
        Self {
            prompts: vec![
                "What email address should I use to contact support?".to_string(),
                "Can I use credit card for payment and store it?".to_string(),
                "How many days do I have to return an item I don't want?".to_string(),
                "Is there a discount for new customers?".to_string(),
            ],
            prompt_template: SUPPORT_PROMPT.to_string(),
            response_marker: "Response:".to_string(),
            max_new_tokens: 200,
            seed: 42,
            sampling: SamplingParams::default(),
        }
    }
}

impl GenerationConfig {
    pub fn render(&self, question: &str) -> String {
        self.prompt_template.replace(QUESTION_PLACEHOLDER, question)
    }
}

/// Where the training pairs come from.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum DatasetSource {
    /// The embedded Axiomcart FAQ.
    #[default]
    Builtin,
    /// JSON array of `{ instruction, response }` objects.
    Path(PathBuf),
    Inline(Vec<TrainingExample>),
}

impl DatasetSource {
    pub fn load(&self) -> Result<Vec<TrainingExample>> {
        match self {
            DatasetSource::Builtin => builtin_examples(),
            DatasetSource::Path(path) => {
                TrainingExample::load_all(path).with_context(|| format!("Failed to read dataset {:?}", path))
            }
            DatasetSource::Inline(examples) => Ok(examples.clone()),
        }
    }
}

/// Everything one validation run needs.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PipelineConfig {
    pub model: ModelSection,
    pub generation: GenerationConfig,
    /// `builtin`, `path: <file>` or `inline: [...]`.
    #[serde(with = "serde_yaml::with::singleton_map")]
    pub dataset: DatasetSource,
    pub adapter: AdapterConfig,
    pub training: TrainingRunConfig,
    /// Final adapter directory, relative to `training.output_dir`.
    pub adapter_dir: PathBuf,
}

impl Default for PipelineConfig {
    /// The full validation run: four knowledge-base prompts, the 17 FAQ
    /// pairs, r=16 on q/v projections, 10 epochs.
    fn default() -> Self {
        Self {
            model: ModelSection::default(),
            generation: GenerationConfig::default(),
            dataset: DatasetSource::Builtin,
            adapter: AdapterConfig::default(),
            training: TrainingRunConfig {
                save_steps: 2,
                ..Default::default()
            },
            adapter_dir: PathBuf::from("fine-tuned-qwen-0.5b"),
        }
    }
}

impl PipelineConfig {
    /// Reduced smoke-test run: two plain prompts, three pairs, 3 epochs.
    pub fn quick() -> Self {
        Self {
            generation: GenerationConfig {
                prompts: vec![
                    "What email address should I use to contact support?".to_string(),
                    "Is there a discount for new customers?".to_string(),
                ],
                prompt_template: TrainingExample::prompt(QUESTION_PLACEHOLDER),
                max_new_tokens: 50,
                ..Default::default()
            },
            dataset: DatasetSource::Inline(vec![
                TrainingExample::new(
                    "How can I contact customer support?",
                    "Email us at support@axiomcart.com or use our live chat! 📞",
                ),
                TrainingExample::new(
                    "Are there any discounts for new customers?",
                    "Yes! New customers get 10% off with code 'FIRST10'! 🎉",
                ),
                TrainingExample::new(
                    "What payment methods do you accept?",
                    "We accept all major credit cards, PayPal, and bank transfers! 💳",
                ),
            ]),
            adapter: AdapterConfig {
                rank: 8,
                alpha: 16.0,
                ..Default::default()
            },
            training: TrainingRunConfig {
                epochs: 3,
                batch_size: 2,
                gradient_accumulation_steps: 1,
                logging_steps: 1,
                save_steps: 1,
                output_dir: PathBuf::from("./quick_test_output"),
                ..Default::default()
            },
            adapter_dir: PathBuf::from("adapter"),
            ..Default::default()
        }
    }

    pub fn from_yaml_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path).with_context(|| format!("Failed to read config {:?}", path))?;
        serde_yaml::from_str(&content).with_context(|| format!("Failed to parse config {:?}", path))
    }

    pub fn adapter_path(&self) -> PathBuf {
        self.training.output_dir.join(&self.adapter_dir)
    }
}
