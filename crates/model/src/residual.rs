use candle_core::{Module, Result, Tensor};
use candle_nn::{conv2d, conv2d_no_bias, linear, Conv2d, Conv2dConfig, Dropout, Linear, VarBuilder};

use crate::network::Network;

/// Two 3x3 convolutions with an identity (or 1x1 projection) shortcut.
struct ResidualBlock {
    conv1: Conv2d,
    conv2: Conv2d,
    shortcut: Option<Conv2d>,
}

impl ResidualBlock {
    fn new(in_channels: usize, out_channels: usize, stride: usize, vb: VarBuilder) -> Result<Self> {
        let conv1 = conv2d(
            in_channels,
            out_channels,
            3,
            Conv2dConfig {
                padding: 1,
                stride,
                ..Default::default()
            },
            vb.pp("conv1"),
        )?;
        let conv2 = conv2d(
            out_channels,
            out_channels,
            3,
            Conv2dConfig {
                padding: 1,
                ..Default::default()
            },
            vb.pp("conv2"),
        )?;
        let shortcut = if stride != 1 || in_channels != out_channels {
            Some(conv2d_no_bias(
                in_channels,
                out_channels,
                1,
                Conv2dConfig {
                    stride,
                    ..Default::default()
                },
                vb.pp("shortcut"),
            )?)
        } else {
            None
        };
        Ok(Self {
            conv1,
            conv2,
            shortcut,
        })
    }

    fn forward(&self, xs: &Tensor) -> Result<Tensor> {
        let residual = match &self.shortcut {
            Some(proj) => proj.forward(xs)?,
            None => xs.clone(),
        };
        let ys = self.conv1.forward(xs)?.relu()?;
        let ys = self.conv2.forward(&ys)?;
        (ys + residual)?.relu()
    }
}

pub(crate) struct RBaseModel {
    stem: Conv2d,
    blocks: Vec<ResidualBlock>,
    dropout: Dropout,
    fc: Linear,
}

const STAGES: [(usize, usize, usize); 3] = [(32, 32, 1), (32, 64, 2), (64, 128, 2)];

impl RBaseModel {
    pub(crate) fn new(num_classes: usize, dropout_p: f32, vb: VarBuilder) -> Result<Self> {
        let stem = conv2d(
            3,
            32,
            3,
            Conv2dConfig {
                padding: 1,
                ..Default::default()
            },
            vb.pp("stem"),
        )?;
        let blocks = STAGES
            .iter()
            .enumerate()
            .map(|(idx, &(cin, cout, stride))| {
                ResidualBlock::new(cin, cout, stride, vb.pp(format!("blocks.{idx}")))
            })
            .collect::<Result<Vec<_>>>()?;
        let fc = linear(128, num_classes, vb.pp("fc"))?;
        Ok(Self {
            stem,
            blocks,
            dropout: Dropout::new(dropout_p),
            fc,
        })
    }
}

impl Network for RBaseModel {
    fn forward_t(&self, xs: &Tensor, train: bool) -> Result<Tensor> {
        let mut xs = self.stem.forward(xs)?.relu()?;
        for block in &self.blocks {
            xs = block.forward(&xs)?;
        }
        let pooled = xs.mean((2, 3))?;
        let pooled = self.dropout.forward(&pooled, train)?;
        self.fc.forward(&pooled)
    }
}
