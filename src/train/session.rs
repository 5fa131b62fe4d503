use log::info;

use crate::{config::Device, error::Result};

/// Progress counters of one run.
#[derive(Debug)]
pub struct TrainingSession {
    device: Device,
    epochs: usize,
    epoch: usize,
    batch: usize,
    global_step: usize,
}

impl TrainingSession {
    /// Resolves `device` and starts at epoch 0.
    pub fn new(device: Device, epochs: usize) -> Result<Self> {
        let device = device.resolve()?;
        info!("session: {epochs} epochs on {device}");

        Ok(Self {
            device,
            epochs,
            epoch: 0,
            batch: 0,
            global_step: 0,
        })
    }

    pub fn device(&self) -> Device {
        self.device
    }

    pub fn epochs(&self) -> usize {
        self.epochs
    }

    /// Zero-based index of the current epoch.
    pub fn epoch(&self) -> usize {
        self.epoch
    }

    /// Zero-based index of the current batch within the epoch.
    pub fn batch(&self) -> usize {
        self.batch
    }

    /// Snapshot counter for the image sink.
    pub fn global_step(&self) -> usize {
        self.global_step
    }

    pub fn start_epoch(&mut self, epoch: usize) {
        self.epoch = epoch;
        self.batch = 0;
    }

    pub fn finish_batch(&mut self) {
        self.batch += 1;
    }

    pub fn advance_global_step(&mut self) {
        self.global_step += 1;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn counters_move_forward() {
        let mut session = TrainingSession::new(Device::Auto, 3).unwrap();
        assert_eq!(session.device(), Device::Cpu);

        session.start_epoch(1);
        session.finish_batch();
        session.finish_batch();
        session.advance_global_step();
        assert_eq!((session.epoch(), session.batch(), session.global_step()), (1, 2, 1));

        session.start_epoch(2);
        assert_eq!((session.batch(), session.global_step()), (0, 1));
    }

    #[test]
    fn rejects_cuda() {
        assert!(TrainingSession::new(Device::Cuda, 1).is_err());
    }
}
