use candle_core::{Module, Result, Tensor};
use candle_nn::{conv2d, linear, Conv2d, Conv2dConfig, Dropout, Linear, VarBuilder};

use crate::network::Network;

pub(crate) struct BaseModel {
    conv1: Conv2d,
    conv2: Conv2d,
    conv3: Conv2d,
    dropout1: Dropout,
    dropout2: Dropout,
    fc: Linear,
}

impl BaseModel {
    pub(crate) fn new(num_classes: usize, dropout_p: f32, vb: VarBuilder) -> Result<Self> {
        let conv1 = conv2d(
            3,
            32,
            7,
            Conv2dConfig {
                padding: 3,
                ..Default::default()
            },
            vb.pp("conv1"),
        )?;
        let same = Conv2dConfig {
            padding: 1,
            ..Default::default()
        };
        let conv2 = conv2d(32, 64, 3, same, vb.pp("conv2"))?;
        let conv3 = conv2d(64, 128, 3, same, vb.pp("conv3"))?;
        let fc = linear(128, num_classes, vb.pp("fc"))?;
        Ok(Self {
            conv1,
            conv2,
            conv3,
            dropout1: Dropout::new(dropout_p),
            dropout2: Dropout::new(dropout_p),
            fc,
        })
    }
}

impl Network for BaseModel {
    fn forward_t(&self, xs: &Tensor, train: bool) -> Result<Tensor> {
        let xs = self.conv1.forward(xs)?.relu()?;

        let xs = self.conv2.forward(&xs)?.relu()?.max_pool2d(2)?;
        let xs = self.dropout1.forward(&xs, train)?;

        let xs = self.conv3.forward(&xs)?.relu()?.max_pool2d(2)?;
        let xs = self.dropout2.forward(&xs, train)?;

        // Global average pool: [N, 128, H, W] -> [N, 128].
        let pooled = xs.mean((2, 3))?;
        self.fc.forward(&pooled)
    }
}
