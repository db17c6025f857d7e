use candle_core::Tensor;
use candle_nn::{Linear, Module, VarBuilder};

/// Capability required of a feature extractor: map a batch of raw inputs to
/// a batch of embeddings, differentiably with respect to its variables.
/// Any conforming implementation, e.g. a user-supplied convolutional
/// network built on the same variable store, is accepted by the deep kernel
/// model without changing its fit/predict contracts.
pub trait FeatureExtractor: Send + Sync {
    /// Forward pass, (n, input_dim) -> (n, embedding_dim).
    fn forward(&self, x: &Tensor) -> candle_core::Result<Tensor>;

    fn embedding_dim(&self) -> usize;
}

/// Default extractor: a small multilayer perceptron with tanh activations
/// and a linear head.
pub struct MlpExtractor {
    layers: Vec<Linear>,
    head: Linear,
    embedding_dim: usize,
}

impl MlpExtractor {
    pub const DEFAULT_HIDDEN: [usize; 2] = [64, 32];

    pub fn new(
        input_dim: usize,
        hidden: &[usize],
        embedding_dim: usize,
        vb: VarBuilder,
    ) -> candle_core::Result<Self> {
        let mut layers = Vec::with_capacity(hidden.len());
        let mut prev = input_dim;
        for (i, &width) in hidden.iter().enumerate() {
            layers.push(candle_nn::linear(prev, width, vb.pp(format!("dense{i}")))?);
            prev = width;
        }
        let head = candle_nn::linear(prev, embedding_dim, vb.pp("head"))?;
        Ok(MlpExtractor {
            layers,
            head,
            embedding_dim,
        })
    }
}

impl FeatureExtractor for MlpExtractor {
    fn forward(&self, x: &Tensor) -> candle_core::Result<Tensor> {
        let mut h = x.clone();
        for layer in &self.layers {
            h = layer.forward(&h)?.tanh()?;
        }
        self.head.forward(&h)
    }

    fn embedding_dim(&self) -> usize {
        self.embedding_dim
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use candle_core::{DType, Device};
    use candle_nn::{VarBuilder, VarMap};

    #[test]
    fn test_mlp_shapes() {
        let device = Device::Cpu;
        let varmap = VarMap::new();
        let vb = VarBuilder::from_varmap(&varmap, DType::F64, &device);
        let mlp = MlpExtractor::new(3, &[8, 4], 2, vb).unwrap();
        assert_eq!(mlp.embedding_dim(), 2);
        let x = Tensor::zeros((5, 3), DType::F64, &device).unwrap();
        let z = mlp.forward(&x).unwrap();
        assert_eq!(z.dims2().unwrap(), (5, 2));
    }
}
