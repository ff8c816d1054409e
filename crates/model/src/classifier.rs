use std::sync::atomic::{AtomicBool, Ordering};

use candle_core::{Error, Result, Tensor, Var};
use candle_nn::{VarBuilder, VarMap};

use crate::{base::BaseModel, config::Architecture, network::Network, residual::RBaseModel, ModelConfig};

/// Image classifier mapping `[N, 3, H, W]` images to `[N, num_classes]` logits.
pub struct Classifier {
    config: ModelConfig,
    varmap: VarMap,
    network: Box<dyn Network>,
    training: AtomicBool,
}

impl Classifier {
    /// Builds the configured architecture with freshly initialised parameters.
    pub fn new(config: ModelConfig) -> Result<Self> {
        config.validate()?;
        let varmap = VarMap::new();
        let vb = VarBuilder::from_varmap(&varmap, config.dtype, &config.device);
        let network: Box<dyn Network> = match config.architecture {
            Architecture::BaseModel => {
                Box::new(BaseModel::new(config.num_classes, config.dropout_p, vb)?)
            }
            Architecture::RBaseModel => {
                Box::new(RBaseModel::new(config.num_classes, config.dropout_p, vb)?)
            }
        };
        log::debug!(
            "built {} with {} parameter tensors ({:?})",
            config.architecture,
            varmap.all_vars().len(),
            config.dtype
        );
        Ok(Self {
            config,
            varmap,
            network,
            training: AtomicBool::new(true),
        })
    }

    pub fn config(&self) -> &ModelConfig {
        &self.config
    }

    pub fn set_training(&self, training: bool) {
        self.training.store(training, Ordering::Relaxed);
    }

    pub fn is_training(&self) -> bool {
        self.training.load(Ordering::Relaxed)
    }

    /// Named trainable parameters, sorted by name.
    pub fn parameters(&self) -> Vec<(String, Var)> {
        let data = match self.varmap.data().lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        let mut named: Vec<(String, Var)> = data
            .iter()
            .map(|(name, var)| (name.clone(), var.clone()))
            .collect();
        named.sort_by(|a, b| a.0.cmp(&b.0));
        named
    }

    pub fn num_parameters(&self) -> usize {
        self.parameters()
            .iter()
            .map(|(_, var)| var.as_tensor().elem_count())
            .sum()
    }

    /// Runs the network; inputs are cast to the parameter dtype.
    pub fn forward(&self, images: &Tensor) -> Result<Tensor> {
        let dims = images.dims();
        if dims.len() != 4 || dims[1] != 3 {
            return Err(Error::Msg(format!(
                "classifier expects [batch, 3, height, width] got {:?}",
                dims
            )));
        }
        let images = if images.dtype() == self.config.dtype {
            images.clone()
        } else {
            images.to_dtype(self.config.dtype)?
        };
        self.network.forward_t(&images, self.is_training())
    }
}
