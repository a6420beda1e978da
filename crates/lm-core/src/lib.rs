pub mod attention;
pub mod config;
pub mod error;
pub mod kv_cache;
pub mod layer_norm;
pub mod lora;
pub mod rotary;
pub mod safetensors_util;
pub mod traits;
pub mod transformer;

pub use config::DecoderConfig;
pub use error::{LmError, Result};
pub use kv_cache::KVCache;
pub use lora::{AdapterConfig, LoraAdapter, LoraLinear};
pub use traits::CausalLm;
pub use transformer::DecoderLm;
