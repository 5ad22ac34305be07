//! CLIP image preprocessing
//!
//! Turns a canonical RGB image into the `[1, 3, H, W]` float tensor the vision
//! tower expects: shortest-edge resize, center crop, rescale to `[0, 1]` and
//! per-channel mean/std normalization.

use std::path::Path;

use image::imageops::{self, FilterType};
use ndarray::Array4;
use serde::Deserialize;

use clipserve_core::{Error, Result};

use crate::decode::CanonicalImage;

/// OpenAI CLIP channel means
pub const CLIP_MEAN: [f32; 3] = [0.481_454_66, 0.457_827_5, 0.408_210_73];

/// OpenAI CLIP channel standard deviations
pub const CLIP_STD: [f32; 3] = [0.268_629_54, 0.261_302_58, 0.275_777_11];

/// Default input resolution of ViT-B/32
pub const CLIP_INPUT_SIZE: u32 = 224;

/// Image size in a preprocessor config; older exports use a bare integer
#[derive(Debug, Clone, Deserialize)]
#[serde(untagged)]
enum SizeSpec {
    Square(u32),
    ShortestEdge { shortest_edge: u32 },
    HeightWidth { height: u32, width: u32 },
}

impl SizeSpec {
    fn edge(&self) -> u32 {
        match self {
            SizeSpec::Square(s) => *s,
            SizeSpec::ShortestEdge { shortest_edge } => *shortest_edge,
            SizeSpec::HeightWidth { height, width } => (*height).min(*width),
        }
    }
}

/// Subset of a Hugging Face `preprocessor_config.json` that drives preprocessing
#[derive(Debug, Clone, Deserialize)]
struct RawPreprocessorConfig {
    size: Option<SizeSpec>,
    crop_size: Option<SizeSpec>,
    image_mean: Option<[f32; 3]>,
    image_std: Option<[f32; 3]>,
    do_center_crop: Option<bool>,
    do_normalize: Option<bool>,
}

/// Resolved preprocessing recipe
#[derive(Debug, Clone, PartialEq)]
pub struct PreprocessConfig {
    /// Target length of the shorter image edge after resizing
    pub shortest_edge: u32,
    /// Side of the square center crop
    pub crop_size: u32,
    pub center_crop: bool,
    pub normalize: bool,
    pub mean: [f32; 3],
    pub std: [f32; 3],
}

impl Default for PreprocessConfig {
    fn default() -> Self {
        Self {
            shortest_edge: CLIP_INPUT_SIZE,
            crop_size: CLIP_INPUT_SIZE,
            center_crop: true,
            normalize: true,
            mean: CLIP_MEAN,
            std: CLIP_STD,
        }
    }
}

impl PreprocessConfig {
    /// Parse a `preprocessor_config.json` document, falling back to CLIP
    /// defaults for any field it omits
    pub fn from_json(json: &str) -> Result<Self> {
        let raw: RawPreprocessorConfig = serde_json::from_str(json)?;
        let defaults = Self::default();

        let config = Self {
            shortest_edge: raw.size.map(|s| s.edge()).unwrap_or(defaults.shortest_edge),
            crop_size: raw.crop_size.map(|s| s.edge()).unwrap_or(defaults.crop_size),
            center_crop: raw.do_center_crop.unwrap_or(defaults.center_crop),
            normalize: raw.do_normalize.unwrap_or(defaults.normalize),
            mean: raw.image_mean.unwrap_or(defaults.mean),
            std: raw.image_std.unwrap_or(defaults.std),
        };
        config.validate()?;
        Ok(config)
    }

    /// Load from a file on disk
    pub fn from_file(path: &Path) -> Result<Self> {
        let json = std::fs::read_to_string(path).map_err(|e| {
            Error::ModelLoad(format!(
                "Failed to read preprocessor config {}: {}",
                path.display(),
                e
            ))
        })?;
        Self::from_json(&json)
    }

    fn validate(&self) -> Result<()> {
        if self.shortest_edge == 0 || self.crop_size == 0 {
            return Err(Error::ModelLoad(
                "Preprocessor sizes must be non-zero".into(),
            ));
        }
        if self.std.iter().any(|s| *s <= 0.0) {
            return Err(Error::ModelLoad(
                "Preprocessor image_std must be positive".into(),
            ));
        }
        Ok(())
    }

    /// Side length of the tensor produced by [`preprocess`](Self::preprocess)
    pub fn output_size(&self) -> u32 {
        if self.center_crop {
            self.crop_size
        } else {
            self.shortest_edge
        }
    }

    /// Convert an image into a normalized NCHW tensor
    pub fn preprocess(&self, image: &CanonicalImage) -> Result<Array4<f32>> {
        let (w, h) = (image.width(), image.height());
        if w == 0 || h == 0 {
            return Err(Error::Inference(format!(
                "Cannot preprocess empty image ({}x{})",
                w, h
            )));
        }

        let size = self.output_size();
        let size_us = size as usize;

        // Crop in source coordinates first so only the kept window is resized;
        // resizing a 1xN strip whole would allocate 224x224N pixels
        let (window_x, window_y) = if self.center_crop {
            let scale = self.shortest_edge as f64 / w.min(h) as f64;
            (crop_window(w, scale, size), crop_window(h, scale, size))
        } else {
            ((0, w, size), (0, h, size))
        };
        let (src_x, src_w, out_w) = window_x;
        let (src_y, src_h, out_h) = window_y;

        let region = imageops::crop_imm(image.pixels(), src_x, src_y, src_w, src_h).to_image();
        let resized = imageops::resize(&region, out_w, out_h, FilterType::CatmullRom);

        let mut array = Array4::<f32>::zeros((1, 3, size_us, size_us));

        for y in 0..size {
            for x in 0..size {
                // Shorter-than-crop edges are padded with zeros
                if x >= out_w || y >= out_h {
                    continue;
                }
                let pixel = resized.get_pixel(x, y);
                for c in 0..3 {
                    let mut value = pixel[c] as f32 / 255.0;
                    if self.normalize {
                        value = (value - self.mean[c]) / self.std[c];
                    }
                    array[[0, c, y as usize, x as usize]] = value;
                }
            }
        }

        Ok(array)
    }
}

/// Centered crop along one axis: `(source start, source length, output length)`
///
/// The output length is the scaled edge clamped to `size`; the source window
/// is that length mapped back through `scale`.
fn crop_window(len: u32, scale: f64, size: u32) -> (u32, u32, u32) {
    let scaled = (len as f64 * scale).round().max(1.0);
    let out = scaled.min(size as f64) as u32;
    let src_len = ((out as f64 / scale).round() as u32).clamp(1, len);
    ((len - src_len) / 2, src_len, out)
}
