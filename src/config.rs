use std::fmt;

use clap::ValueEnum;
use log::info;

use crate::error::{Error, Result};

/// Where the tensors live. Only the CPU backend is built in.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, ValueEnum)]
pub enum Device {
    #[default]
    Auto,
    Cpu,
    Cuda,
}

impl Device {
    /// Picks the concrete device once, at the start of a run.
    pub fn resolve(self) -> Result<Device> {
        let resolved = match self {
            Device::Auto | Device::Cpu => Device::Cpu,
            Device::Cuda => return Err(Error::UnsupportedDevice(self.to_string())),
        };
        info!("using device {resolved}");

        Ok(resolved)
    }
}

impl fmt::Display for Device {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Device::Auto => write!(f, "auto"),
            Device::Cpu => write!(f, "cpu"),
            Device::Cuda => write!(f, "cuda"),
        }
    }
}

fn check_common(lr: f32, batch_size: usize, epochs: usize) -> Result<()> {
    if !(lr.is_finite() && lr > 0.0) {
        return Err(Error::InvalidConfig(format!(
            "learning rate must be positive, got {lr}"
        )));
    }
    if batch_size == 0 {
        return Err(Error::InvalidConfig("batch size must be positive".into()));
    }
    if epochs == 0 {
        return Err(Error::InvalidConfig("need at least one epoch".into()));
    }

    Ok(())
}

/// Fully-connected digit classifier.
#[derive(Clone, Debug, PartialEq)]
pub struct ClassifierConfig {
    pub input_size: usize,
    pub hidden: usize,
    pub num_classes: usize,
    pub lr: f32,
    pub batch_size: usize,
    pub epochs: usize,
    pub seed: u64,
    pub device: Device,
    /// Batches between debug loss lines.
    pub log_every: usize,
}

impl Default for ClassifierConfig {
    fn default() -> Self {
        Self {
            input_size: 784,
            hidden: 50,
            num_classes: 10,
            lr: 1e-3,
            batch_size: 64,
            epochs: 1,
            seed: 42,
            device: Device::Auto,
            log_every: 100,
        }
    }
}

impl ClassifierConfig {
    pub fn validate(&self) -> Result<()> {
        check_common(self.lr, self.batch_size, self.epochs)?;
        if self.input_size == 0 || self.hidden == 0 || self.num_classes < 2 {
            return Err(Error::InvalidConfig(format!(
                "bad layer sizes {} -> {} -> {}",
                self.input_size, self.hidden, self.num_classes
            )));
        }

        Ok(())
    }
}

/// Fully-connected GAN on 28x28 digits.
#[derive(Clone, Debug, PartialEq)]
pub struct GanConfig {
    pub lr: f32,
    pub z_dim: usize,
    pub img_dim: usize,
    pub batch_size: usize,
    pub epochs: usize,
    pub seed: u64,
    pub device: Device,
}

impl Default for GanConfig {
    fn default() -> Self {
        Self {
            lr: 3e-4,
            z_dim: 64,
            img_dim: 28 * 28,
            batch_size: 32,
            epochs: 50,
            seed: 42,
            device: Device::Auto,
        }
    }
}

impl GanConfig {
    pub fn validate(&self) -> Result<()> {
        check_common(self.lr, self.batch_size, self.epochs)?;
        if self.z_dim == 0 {
            return Err(Error::InvalidConfig("noise dimension must be positive".into()));
        }
        if self.img_dim != 28 * 28 {
            return Err(Error::InvalidConfig(format!(
                "images must be 28x28, got {} pixels",
                self.img_dim
            )));
        }

        Ok(())
    }
}

/// GoogLeNet shape check and optional training run.
#[derive(Clone, Debug, PartialEq)]
pub struct InceptionConfig {
    pub in_channels: usize,
    pub num_classes: usize,
    pub shape_batch: usize,
    pub image_size: usize,
    pub lr: f32,
    pub batch_size: usize,
    pub epochs: usize,
    pub seed: u64,
    pub device: Device,
}

impl Default for InceptionConfig {
    fn default() -> Self {
        Self {
            in_channels: 3,
            num_classes: 1000,
            shape_batch: 3,
            image_size: 224,
            lr: 1e-3,
            batch_size: 16,
            epochs: 1,
            seed: 42,
            device: Device::Auto,
        }
    }
}

impl InceptionConfig {
    pub fn validate(&self) -> Result<()> {
        check_common(self.lr, self.batch_size, self.epochs)?;
        if self.in_channels == 0 || self.num_classes == 0 || self.shape_batch == 0 {
            return Err(Error::InvalidConfig(
                "channels, classes and shape-check batch must be positive".into(),
            ));
        }
        if self.image_size == 0 {
            return Err(Error::InvalidConfig("image size must be positive".into()));
        }

        Ok(())
    }
}
