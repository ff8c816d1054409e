use std::{fmt, str::FromStr};

use candle_core::{DType, Device, Error, Result};

/// Registry of the classifier architectures selectable by name.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Architecture {
    /// Three convolutions, dropout, global average pooling.
    BaseModel,
    /// Stem convolution followed by residual stages.
    RBaseModel,
}

impl FromStr for Architecture {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "basemodel" | "base" => Ok(Self::BaseModel),
            "rbasemodel" | "residual" => Ok(Self::RBaseModel),
            other => Err(Error::Msg(format!(
                "unknown model '{other}' (expected BaseModel or RBaseModel)"
            ))),
        }
    }
}

impl fmt::Display for Architecture {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Architecture::BaseModel => f.write_str("BaseModel"),
            Architecture::RBaseModel => f.write_str("RBaseModel"),
        }
    }
}

/// Everything needed to instantiate a classifier on a device.
#[derive(Debug, Clone)]
pub struct ModelConfig {
    pub architecture: Architecture,
    pub num_classes: usize,
    pub dropout_p: f32,
    pub dtype: DType,
    pub device: Device,
}

impl ModelConfig {
    pub fn new(architecture: Architecture, num_classes: usize) -> Self {
        Self {
            architecture,
            num_classes,
            dropout_p: 0.25,
            dtype: DType::F32,
            device: Device::Cpu,
        }
    }

    pub fn validate(&self) -> Result<()> {
        if self.num_classes < 2 {
            return Err(Error::Msg(format!(
                "num_classes must be at least 2, got {}",
                self.num_classes
            )));
        }
        if !(0.0..1.0).contains(&self.dropout_p) {
            return Err(Error::Msg("dropout_p must be in [0, 1)".into()));
        }
        if !matches!(self.dtype, DType::F32 | DType::F16 | DType::BF16) {
            return Err(Error::Msg(format!(
                "unsupported parameter dtype {:?}",
                self.dtype
            )));
        }
        Ok(())
    }
}
