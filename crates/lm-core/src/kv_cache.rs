use tch::Tensor;

/// Per-layer key/value cache used while decoding one sequence.
/// Tensors are [1, n_kv_head, cache_len, head_dim] and grow by concatenation.
#[derive(Debug, Default)]
pub struct KVCache {
    k: Option<Tensor>,
    v: Option<Tensor>,
}

impl KVCache {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> i64 {
        self.k.as_ref().map_or(0, |k| k.size()[2])
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Appends the new keys/values along the sequence axis and returns the
    /// full cached view.
    pub fn update(&mut self, new_k: Tensor, new_v: Tensor) -> (Tensor, Tensor) {
        let (k, v) = match (self.k.take(), self.v.take()) {
            (Some(k), Some(v)) => (Tensor::cat(&[k, new_k], 2), Tensor::cat(&[v, new_v], 2)),
            _ => (new_k, new_v),
        };
        self.k = Some(k.shallow_clone());
        self.v = Some(v.shallow_clone());
        (k, v)
    }
}
