use tch::{nn, Kind, Tensor};

/// Root-mean-square norm as used by Qwen2/Llama blocks. Statistics are taken
/// in f32 whatever the activation dtype.
#[derive(Debug)]
pub struct RMSNorm {
    weight: Tensor,
    eps: f64,
}

impl RMSNorm {
    pub fn new(vs: &nn::Path, dim: i64, eps: f64) -> Self {
        Self { weight: vs.var("weight", &[dim], nn::Init::Const(1.0)), eps }
    }

    /// `[batch, seq, hidden]` in, same shape and dtype out.
    pub fn forward(&self, xs: &Tensor) -> Tensor {
        let kind = xs.kind();
        let xs32 = xs.to_kind(Kind::Float);
        let inv_rms = (xs32.square().mean_dim(Some(&[-1i64][..]), true, Kind::Float) + self.eps).rsqrt();
        (xs32 * inv_rms).to_kind(kind) * &self.weight
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tch::Device;

    #[test]
    fn unit_weight_gives_unit_rms() {
        let vs = nn::VarStore::new(Device::Cpu);
        let norm = RMSNorm::new(&vs.root(), 4, 1e-6);
        let xs = Tensor::from_slice(&[1.0f32, -2.0, 3.0, -4.0, 10.0, 10.0, 10.0, 10.0]).view([1, 2, 4]);

        let rms = norm.forward(&xs).square().mean_dim(Some(&[-1i64][..]), false, Kind::Float).sqrt();
        let rms: Vec<f32> = Vec::try_from(rms.flatten(0, -1)).unwrap();
        for r in rms {
            assert!((r - 1.0).abs() < 1e-4, "{r}");
        }
    }
}
