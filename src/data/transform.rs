use crate::error::{Error, Result};

#[derive(Clone, Debug, PartialEq)]
enum Step {
    /// `u8` pixels to `[0, 1]`.
    ToTensor,
    /// `(x - mean[c]) / std[c]` per channel.
    Normalize { mean: Vec<f32>, std: Vec<f32> },
}

/// Pure mapping from raw pixels to the network's input values.
#[derive(Clone, Debug, PartialEq)]
pub struct Transform {
    steps: Vec<Step>,
}

impl Default for Transform {
    fn default() -> Self {
        Self::to_tensor()
    }
}

impl Transform {
    pub fn to_tensor() -> Self {
        Self {
            steps: vec![Step::ToTensor],
        }
    }

    pub fn normalize(mut self, mean: &[f32], std: &[f32]) -> Result<Self> {
        if mean.len() != std.len() || mean.is_empty() {
            return Err(Error::InvalidConfig(format!(
                "normalize needs one mean and one std per channel, got {} and {}",
                mean.len(),
                std.len()
            )));
        }
        if std.iter().any(|&s| s <= 0.0) {
            return Err(Error::InvalidConfig("normalize std must be positive".into()));
        }

        self.steps.push(Step::Normalize {
            mean: mean.to_vec(),
            std: std.to_vec(),
        });
        Ok(self)
    }

    /// Applies every step to a channel-major image of `channels` planes.
    pub fn apply(&self, raw: &[u8], channels: usize) -> Result<Vec<f32>> {
        let mut out: Vec<f32> = raw.iter().map(|&v| v as f32).collect();
        if channels == 0 || raw.len() % channels != 0 {
            return Err(Error::ShapeMismatch {
                what: "transform channels",
                got: raw.len(),
                expected: channels,
            });
        }
        let plane = raw.len() / channels;

        for step in &self.steps {
            match step {
                Step::ToTensor => out.iter_mut().for_each(|v| *v /= 255.0),
                Step::Normalize { mean, std } => {
                    if mean.len() != channels {
                        return Err(Error::ShapeMismatch {
                            what: "normalize channels",
                            got: mean.len(),
                            expected: channels,
                        });
                    }
                    for (c, chunk) in out.chunks_mut(plane).enumerate() {
                        chunk.iter_mut().for_each(|v| *v = (*v - mean[c]) / std[c]);
                    }
                }
            }
        }

        Ok(out)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn to_tensor_scales_to_unit_range() {
        let out = Transform::to_tensor().apply(&[0, 51, 255], 1).unwrap();
        assert_eq!(out, vec![0.0, 0.2, 1.0]);
    }

    #[test]
    fn half_normalize_maps_to_symmetric_range() {
        let t = Transform::to_tensor().normalize(&[0.5], &[0.5]).unwrap();
        let out = t.apply(&[0, 255], 1).unwrap();
        assert_eq!(out, vec![-1.0, 1.0]);
    }

    #[test]
    fn normalize_is_per_channel() {
        let t = Transform::to_tensor().normalize(&[0.0, 1.0], &[1.0, 0.5]).unwrap();
        let out = t.apply(&[255, 255, 0, 255], 2).unwrap();
        assert_eq!(out, vec![1.0, 1.0, -2.0, 0.0]);
    }

    #[test]
    fn rejects_zero_std() {
        assert!(Transform::to_tensor().normalize(&[0.5], &[0.0]).is_err());
    }
}
