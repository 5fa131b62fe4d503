use std::{fs, path::PathBuf};

use image::{GrayImage, Luma};
use log::debug;

use crate::{
    error::{Error, Result},
    tensor::Tensor,
};

/// A single-channel picture with values in `[0, 1]` once normalized.
#[derive(Clone, Debug, PartialEq)]
pub struct ImageGrid {
    pub width: usize,
    pub height: usize,
    pub pixels: Vec<f32>,
}

impl ImageGrid {
    pub fn get(&self, x: usize, y: usize) -> f32 {
        self.pixels[y * self.width + x]
    }

    fn to_gray(&self) -> GrayImage {
        GrayImage::from_fn(self.width as u32, self.height as u32, |x, y| {
            let v = self.get(x as usize, y as usize).clamp(0.0, 1.0);
            Luma([(v * 255.0).round() as u8])
        })
    }
}

/// Tiles a batch of single-channel images, `nrow` per row, separated and
/// framed by `padding` pixels of zero. With `normalize` the pixel values are
/// min-max scaled over the whole batch.
pub fn make_grid(
    images: &Tensor,
    nrow: usize,
    padding: usize,
    normalize: bool,
) -> Result<ImageGrid> {
    let shape = images.shape();
    if shape.channels != 1 || nrow == 0 {
        return Err(Error::ShapeMismatch {
            what: "grid images",
            got: shape.channels,
            expected: 1,
        });
    }

    let n = images.batch_size();
    let (h, w) = (shape.height, shape.width);
    let xmaps = nrow.min(n).max(1);
    let ymaps = (n + xmaps - 1) / xmaps;
    let width = xmaps * (w + padding) + padding;
    let height = ymaps * (h + padding) + padding;

    let data = images.data();
    let (lo, hi) = data
        .iter()
        .fold((f32::INFINITY, f32::NEG_INFINITY), |(lo, hi), &v| (lo.min(v), hi.max(v)));
    let scale = |v: f32| {
        if normalize {
            (v - lo) / (hi - lo).max(1e-5)
        } else {
            v
        }
    };

    let mut pixels = vec![0.0; width * height];
    for k in 0..n {
        let (gx, gy) = (k % xmaps, k / xmaps);
        let (ox, oy) = (padding + gx * (w + padding), padding + gy * (h + padding));
        for y in 0..h {
            for x in 0..w {
                pixels[(oy + y) * width + ox + x] = scale(data[(k, y * w + x)]);
            }
        }
    }

    Ok(ImageGrid {
        width,
        height,
        pixels,
    })
}

/// Somewhere to publish tagged image snapshots during training.
pub trait ImageSink {
    fn add_image(&mut self, tag: &str, grid: &ImageGrid, step: usize) -> Result<()>;
}

/// Writes every snapshot to `<dir>/<tag>/step_<step>.png`.
pub struct PngSink {
    dir: PathBuf,
}

impl PngSink {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    pub fn path_for(&self, tag: &str, step: usize) -> PathBuf {
        self.dir.join(slug(tag)).join(format!("step_{step}.png"))
    }
}

impl ImageSink for PngSink {
    fn add_image(&mut self, tag: &str, grid: &ImageGrid, step: usize) -> Result<()> {
        let path = self.path_for(tag, step);
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }
        grid.to_gray().save(&path)?;
        debug!("wrote {}", path.display());

        Ok(())
    }
}

/// Keeps snapshots in memory.
#[derive(Debug, Default)]
pub struct MemorySink {
    pub images: Vec<(String, usize, ImageGrid)>,
}

impl ImageSink for MemorySink {
    fn add_image(&mut self, tag: &str, grid: &ImageGrid, step: usize) -> Result<()> {
        self.images.push((tag.to_string(), step, grid.clone()));
        Ok(())
    }
}

fn slug(tag: &str) -> String {
    tag.chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() {
                c.to_ascii_lowercase()
            } else {
                '_'
            }
        })
        .collect()
}
