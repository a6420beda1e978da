//! Low-rank adapters (LoRA) over the linear projections of a frozen model.
//!
//! Every adaptable projection is a [`LoraLinear`]: the frozen base matrix plus
//! an optional pair `A: [r, in]`, `B: [out, r]` so that
//! `y = W x + b + (alpha / r) * B A dropout(x)`. The adapter matrices live in
//! their own `VarStore`, which is the only thing an optimizer ever sees.

use serde::{Deserialize, Serialize};
use std::path::Path;
use tch::{nn, Device, Tensor};

use crate::error::{LmError, Result};
use crate::safetensors_util;
use crate::traits::CausalLm;

pub const ADAPTER_CONFIG_FILENAME: &str = "adapter_config.json";
pub const ADAPTER_WEIGHTS_FILENAME: &str = "adapter_model.safetensors";

/// Variable prefix of adapter matrices, as written by PEFT.
const ADAPTER_PREFIX: [&str; 2] = ["base_model", "model"];

pub const PEFT_TYPE_LORA: &str = "LORA";
pub const TASK_TYPE_CAUSAL_LM: &str = "CAUSAL_LM";

/// Contents of `adapter_config.json`, in the key names PEFT reads.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AdapterConfig {
    pub peft_type: String,
    pub task_type: String,
    /// Model id or directory the adapter was trained on.
    pub base_model_name_or_path: Option<String>,
    /// Rank of the update `B A`.
    #[serde(rename = "r")]
    pub rank: i64,
    /// Numerator of the scaling factor `alpha / rank`.
    #[serde(rename = "lora_alpha")]
    pub alpha: f64,
    /// Dropout applied to the adapter input while training.
    #[serde(rename = "lora_dropout")]
    pub dropout: f64,
    /// Sublayer names (or name suffixes) that receive an adapter.
    pub target_modules: Vec<String>,
    /// Only `"none"` is supported: base biases stay frozen.
    pub bias: String,
}

impl Default for AdapterConfig {
    fn default() -> Self {
        Self {
            peft_type: PEFT_TYPE_LORA.to_string(),
            task_type: TASK_TYPE_CAUSAL_LM.to_string(),
            base_model_name_or_path: None,
            rank: 16,
            alpha: 32.0,
            dropout: 0.1,
            target_modules: vec!["q_proj".to_string(), "v_proj".to_string()],
            bias: "none".to_string(),
        }
    }
}

impl AdapterConfig {
    pub fn scaling(&self) -> f64 {
        self.alpha / self.rank as f64
    }

    pub fn validate(&self) -> Result<()> {
        if self.peft_type != PEFT_TYPE_LORA {
            return Err(LmError::InvalidAdapterConfig(format!("peft_type `{}` is not LORA", self.peft_type)));
        }
        if self.target_modules.is_empty() {
            return Err(LmError::NoTargetModules);
        }
        if self.rank <= 0 {
            return Err(LmError::InvalidAdapterConfig(format!("rank must be positive, got {}", self.rank)));
        }
        if !(0.0..1.0).contains(&self.dropout) {
            return Err(LmError::InvalidAdapterConfig(format!("dropout must be in [0, 1), got {}", self.dropout)));
        }
        if self.bias != "none" {
            return Err(LmError::InvalidAdapterConfig(format!("bias mode `{}` is not supported", self.bias)));
        }
        Ok(())
    }

    /// Whether `sublayer` (a dotted path such as `model.layers.0.self_attn.q_proj`)
    /// is selected by `target`.
    pub fn targets(target: &str, sublayer: &str) -> bool {
        sublayer == target || sublayer.ends_with(&format!(".{target}"))
    }

    pub fn save<P: AsRef<Path>>(&self, path: P) -> Result<()> {
        let json = serde_json::to_string_pretty(self)?;
        std::fs::write(path, json)?;
        Ok(())
    }

    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        let content = std::fs::read_to_string(path)?;
        Ok(serde_json::from_str(&content)?)
    }
}

struct LoraDelta {
    a: Tensor,
    b: Tensor,
    scaling: f64,
    dropout: f64,
}

/// A linear projection whose frozen weight can carry a low-rank delta.
pub struct LoraLinear {
    base: nn::Linear,
    delta: Option<LoraDelta>,
}

impl LoraLinear {
    pub fn new(vs: &nn::Path, in_dim: i64, out_dim: i64, bias: bool) -> Self {
        let config = nn::LinearConfig { bias, ..Default::default() };
        Self {
            base: nn::linear(vs, in_dim, out_dim, config),
            delta: None,
        }
    }

    pub fn in_dim(&self) -> i64 {
        self.base.ws.size()[1]
    }

    pub fn out_dim(&self) -> i64 {
        self.base.ws.size()[0]
    }

    pub fn is_adapted(&self) -> bool {
        self.delta.is_some()
    }

    /// Creates `lora_A` / `lora_B` under `vs`. B starts at zero, so the
    /// projection output is unchanged until the adapter is trained.
    pub fn attach(&mut self, vs: &nn::Path, config: &AdapterConfig) {
        let bound = 1.0 / (self.in_dim() as f64).sqrt();
        let a = (vs / "lora_A").var(
            "weight",
            &[config.rank, self.in_dim()],
            nn::Init::Uniform { lo: -bound, up: bound },
        );
        let b = (vs / "lora_B").var("weight", &[self.out_dim(), config.rank], nn::Init::Const(0.0));
        self.delta = Some(LoraDelta {
            a,
            b,
            scaling: config.scaling(),
            dropout: config.dropout,
        });
    }

    pub fn detach(&mut self) {
        self.delta = None;
    }

    pub fn forward_t(&self, x: &Tensor, train: bool) -> Tensor {
        let y = x.apply(&self.base);
        match &self.delta {
            Some(d) => {
                let update = x
                    .dropout(d.dropout, train)
                    .matmul(&d.a.tr())
                    .matmul(&d.b.tr());
                y + update * d.scaling
            }
            None => y,
        }
    }
}

/// Adapter matrices attached to a model, together with the config that
/// produced them.
pub struct LoraAdapter {
    pub config: AdapterConfig,
    pub vs: nn::VarStore,
    /// Names of the sublayers that carry an adapter, in model order.
    pub adapted: Vec<String>,
}

impl std::fmt::Debug for LoraAdapter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LoraAdapter")
            .field("config", &self.config)
            .field("adapted", &self.adapted.len())
            .field("trainable_params", &self.num_parameters())
            .finish()
    }
}

impl LoraAdapter {
    /// Attaches a fresh adapter to every sublayer of `model` selected by
    /// `config.target_modules`. Fails if any target matches nothing.
    pub fn attach<M: CausalLm + ?Sized>(model: &mut M, config: &AdapterConfig) -> Result<Self> {
        config.validate()?;
        let device: Device = model.device();
        let mut sublayers = model.sublayers_mut();

        if sublayers.iter().any(|(_, layer)| layer.is_adapted()) {
            return Err(LmError::AdapterAlreadyAttached);
        }
        for target in &config.target_modules {
            if !sublayers.iter().any(|(name, _)| AdapterConfig::targets(target, name)) {
                return Err(LmError::TargetModuleNotFound(target.clone()));
            }
        }

        let vs = nn::VarStore::new(device);
        let mut adapted = Vec::new();
        for (name, layer) in sublayers.iter_mut() {
            if config.target_modules.iter().any(|t| AdapterConfig::targets(t, name.as_str())) {
                let path = ADAPTER_PREFIX
                    .iter()
                    .copied()
                    .chain(name.split('.'))
                    .fold(vs.root(), |p, seg| p / seg);
                layer.attach(&path, config);
                adapted.push(name.clone());
            }
        }
        tracing::debug!(count = adapted.len(), "attached LoRA adapters");

        Ok(Self {
            config: config.clone(),
            vs,
            adapted,
        })
    }

    /// Attaches an adapter described by `dir/adapter_config.json` and fills it
    /// with the weights in `dir/adapter_model.safetensors`.
    pub fn load<M: CausalLm + ?Sized, P: AsRef<Path>>(model: &mut M, dir: P) -> Result<Self> {
        let dir = dir.as_ref();
        let config = AdapterConfig::load(dir.join(ADAPTER_CONFIG_FILENAME))?;
        let mut adapter = Self::attach(model, &config)?;
        if let Err(e) = safetensors_util::load_safetensors(&mut adapter.vs, dir.join(ADAPTER_WEIGHTS_FILENAME)) {
            // leave no half-filled deltas on the model
            adapter.detach(model);
            return Err(e);
        }
        Ok(adapter)
    }

    /// Writes the adapter config and matrices (never the base weights).
    pub fn save<P: AsRef<Path>>(&self, dir: P) -> Result<()> {
        let dir = dir.as_ref();
        std::fs::create_dir_all(dir)?;
        self.config.save(dir.join(ADAPTER_CONFIG_FILENAME))?;
        safetensors_util::save_safetensors(&self.vs, dir.join(ADAPTER_WEIGHTS_FILENAME))?;
        Ok(())
    }

    pub fn num_parameters(&self) -> i64 {
        safetensors_util::count_parameters(&self.vs)
    }

    /// Removes the adapter from every sublayer of `model`.
    pub fn detach<M: CausalLm + ?Sized>(self, model: &mut M) {
        for (_, layer) in model.sublayers_mut() {
            layer.detach();
        }
    }
}
