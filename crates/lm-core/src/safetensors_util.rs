use memmap2::MmapOptions;
use safetensors::tensor::TensorView;
use safetensors::{Dtype, SafeTensors};
use sha2::{Digest, Sha256};
use std::fs::File;
use std::path::Path;
use tch::{nn, Device, Kind, Tensor};

use crate::error::{LmError, Result};

/// Copies every tensor of `paths` into the matching variable of `vs`.
///
/// Tensors the store does not know about are skipped. Every variable of the
/// store must be covered by some file, otherwise the load fails.
pub fn load_safetensors<P: AsRef<Path>>(vs: &mut nn::VarStore, path: P) -> Result<()> {
    load_sharded_safetensors(vs, &[path])
}

pub fn load_sharded_safetensors<P: AsRef<Path>>(vs: &mut nn::VarStore, paths: &[P]) -> Result<()> {
    let mut variables = vs.variables();
    let device = vs.device();
    let mut loaded = std::collections::HashSet::new();

    for path in paths {
        let file = File::open(path.as_ref())?;
        let buffer = unsafe { MmapOptions::new().map(&file)? };
        let tensors = SafeTensors::deserialize(&buffer)?;

        for (name, view) in tensors.tensors() {
            if let Some(var) = variables.get_mut(&name) {
                let shape: Vec<i64> = view.shape().iter().map(|&x| x as i64).collect();
                if shape != var.size() {
                    return Err(LmError::ShapeMismatch {
                        name,
                        expected: var.size(),
                        found: shape,
                    });
                }
                let kind = match view.dtype() {
                    Dtype::F32 => Kind::Float,
                    Dtype::F16 => Kind::Half,
                    Dtype::BF16 => Kind::BFloat16,
                    other => return Err(LmError::UnsupportedDtype(format!("{other:?}"))),
                };

                let tch_tensor = Tensor::from_data_size(view.data(), &shape, kind).to_device(device);

                tch::no_grad(|| {
                    var.copy_(&tch_tensor);
                });
                tracing::debug!(tensor = %name, "loaded");
                loaded.insert(name);
            } else {
                tracing::warn!(tensor = %name, "tensor found in safetensors but not in model");
            }
        }
    }

    let mut missing: Vec<String> = variables.into_keys().filter(|name| !loaded.contains(name)).collect();
    if !missing.is_empty() {
        missing.sort();
        return Err(LmError::MissingWeights(missing));
    }
    Ok(())
}

/// Writes every variable of `vs` as little-endian f32.
pub fn save_safetensors<P: AsRef<Path>>(vs: &nn::VarStore, path: P) -> Result<()> {
    let mut entries = Vec::new();
    for (name, tensor) in sorted_variables(vs) {
        let shape: Vec<usize> = tensor.size().iter().map(|&d| d as usize).collect();
        entries.push((name, shape, f32_bytes(&tensor)?));
    }

    let mut views = Vec::with_capacity(entries.len());
    for (name, shape, bytes) in &entries {
        views.push((name.clone(), TensorView::new(Dtype::F32, shape.clone(), bytes)?));
    }

    safetensors::serialize_to_file(views, &None, path.as_ref())?;
    Ok(())
}

/// Elements converted to f32 and hashed per step of [`checksum`].
const CHECKSUM_CHUNK: i64 = 1 << 20;

/// SHA-256 over variable names and their f32 contents, in name order.
///
/// Tensors are streamed through the hasher in slices of [`CHECKSUM_CHUNK`]
/// elements, so a large embedding never needs a full host copy.
pub fn checksum(vs: &nn::VarStore) -> Result<String> {
    let mut hasher = Sha256::new();
    let mut bytes = Vec::new();
    for (name, tensor) in sorted_variables(vs) {
        hasher.update(name.as_bytes());
        let flat = tensor.detach().reshape([-1]);
        for chunk in flat.split(CHECKSUM_CHUNK, 0) {
            let chunk = chunk.to_device(Device::Cpu).to_kind(Kind::Float).contiguous();
            let values = Vec::<f32>::try_from(&chunk)?;
            bytes.clear();
            bytes.extend(values.iter().flat_map(|v| v.to_le_bytes()));
            hasher.update(&bytes);
        }
    }
    Ok(format!("{:x}", hasher.finalize()))
}

pub fn count_parameters(vs: &nn::VarStore) -> i64 {
    vs.variables().values().map(|t| t.numel() as i64).sum()
}

fn sorted_variables(vs: &nn::VarStore) -> Vec<(String, Tensor)> {
    let mut vars: Vec<(String, Tensor)> = vs.variables().into_iter().collect();
    vars.sort_by(|a, b| a.0.cmp(&b.0));
    vars
}

fn f32_bytes(tensor: &Tensor) -> Result<Vec<u8>> {
    let flat = tensor
        .detach()
        .to_device(Device::Cpu)
        .to_kind(Kind::Float)
        .contiguous()
        .view([-1]);
    let values = Vec::<f32>::try_from(&flat)?;
    Ok(values.iter().flat_map(|v| v.to_le_bytes()).collect())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn store(seed: i64) -> nn::VarStore {
        tch::manual_seed(seed);
        let vs = nn::VarStore::new(Device::Cpu);
        let root = vs.root();
        let _ = root.var("a", &[3, 2], nn::Init::Randn { mean: 0.0, stdev: 1.0 });
        let _ = (&root / "inner").var("b", &[4], nn::Init::Randn { mean: 0.0, stdev: 1.0 });
        vs
    }

    #[test]
    fn save_and_load_round_trip() {
        let src = store(1);
        let mut dst = store(2);
        assert_ne!(checksum(&src).unwrap(), checksum(&dst).unwrap());

        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("weights.safetensors");
        save_safetensors(&src, &path).unwrap();
        load_safetensors(&mut dst, &path).unwrap();

        assert_eq!(checksum(&src).unwrap(), checksum(&dst).unwrap());
    }

    #[test]
    fn missing_variables_fail_the_load() {
        let src = store(1);
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("weights.safetensors");
        save_safetensors(&src, &path).unwrap();

        let mut bigger = store(3);
        let _ = bigger.root().var("extra", &[1], nn::Init::Const(0.0));
        let err = load_safetensors(&mut bigger, &path).unwrap_err();
        assert!(matches!(err, LmError::MissingWeights(names) if names == vec!["extra".to_string()]));
    }

    #[test]
    fn counts_parameters() {
        assert_eq!(count_parameters(&store(1)), 10);
    }

    #[test]
    fn checksum_spans_chunk_boundaries() {
        tch::manual_seed(5);
        let vs = nn::VarStore::new(Device::Cpu);
        let big = vs.root().var("big", &[CHECKSUM_CHUNK + 3], nn::Init::Randn { mean: 0.0, stdev: 1.0 });

        let mut hasher = Sha256::new();
        hasher.update(b"big");
        hasher.update(f32_bytes(&big).unwrap());
        assert_eq!(checksum(&vs).unwrap(), format!("{:x}", hasher.finalize()));

        tch::no_grad(|| {
            let _ = big.narrow(0, CHECKSUM_CHUNK + 2, 1).fill_(42.0);
        });
        let mut hasher = Sha256::new();
        hasher.update(b"big");
        hasher.update(f32_bytes(&big).unwrap());
        assert_eq!(checksum(&vs).unwrap(), format!("{:x}", hasher.finalize()));
    }
}
