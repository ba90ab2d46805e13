//! Blur and brightness scoring of aligned face crops.

use crate::sampler::ImageView;
use crate::types::QualityScore;
use serde::{Deserialize, Serialize};
use thiserror::Error;

// Red reuses the blue weight of the ITU-R BT.601 luma (0.299 → 0.229); scores
// are calibrated against these weights.
const LUMA_WEIGHTS: [f32; 3] = [0.229, 0.587, 0.114];

#[derive(Error, Debug, Clone, PartialEq)]
pub enum QualityError {
    #[error("image {width}x{height} too small for a 3x3 Laplacian (need at least 2x2)")]
    TooSmall { width: u32, height: u32 },
    #[error("image has no pixels")]
    Empty,
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct QualityConfig {
    /// Laplacian variance below this is blurred.
    pub blur_threshold: f64,
    pub min_brightness: f64,
    /// Above 255, so it never rejects 8-bit input.
    pub max_brightness: f64,
}

impl Default for QualityConfig {
    fn default() -> Self {
        Self {
            blur_threshold: 10.0,
            min_brightness: 100.0,
            max_brightness: 300.0,
        }
    }
}

/// Single-channel 8-bit image.
#[derive(Debug, Clone, PartialEq)]
pub struct GrayImage {
    pub width: u32,
    pub height: u32,
    pub data: Vec<u8>,
}

impl GrayImage {
    fn at(&self, x: usize, y: usize) -> i32 {
        self.data[y * self.width as usize + x] as i32
    }
}

pub fn to_gray(view: &ImageView<'_>) -> GrayImage {
    let (w, h) = (view.width(), view.height());
    let mut data = Vec::with_capacity(w as usize * h as usize);
    for y in 0..h as i64 {
        for x in 0..w as i64 {
            let [r, g, b] = view.pixel(x, y);
            // Accumulated in f32; values near .5 round differently in f64
            let luma = LUMA_WEIGHTS[0] * r as f32
                + LUMA_WEIGHTS[1] * g as f32
                + LUMA_WEIGHTS[2] * b as f32;
            data.push(luma.clamp(0.0, 255.0).round_ties_even() as u8);
        }
    }
    GrayImage {
        width: w,
        height: h,
        data,
    }
}

/// Mirror index for 1-pixel reflect padding: `-1 → 1`, `n → n-2`.
fn reflect(i: i64, n: i64) -> usize {
    if i < 0 {
        (-i) as usize
    } else if i >= n {
        (2 * n - 2 - i) as usize
    } else {
        i as usize
    }
}

/// 4-neighbour Laplacian `[[0,1,0],[1,-4,1],[0,1,0]]` over a reflect-padded image.
pub fn laplacian(gray: &GrayImage) -> Result<Vec<i32>, QualityError> {
    if gray.width < 2 || gray.height < 2 {
        return Err(QualityError::TooSmall {
            width: gray.width,
            height: gray.height,
        });
    }

    let (w, h) = (gray.width as i64, gray.height as i64);
    let mut out = Vec::with_capacity((w * h) as usize);
    for y in 0..h {
        for x in 0..w {
            let centre = gray.at(x as usize, y as usize);
            let up = gray.at(x as usize, reflect(y - 1, h));
            let down = gray.at(x as usize, reflect(y + 1, h));
            let left = gray.at(reflect(x - 1, w), y as usize);
            let right = gray.at(reflect(x + 1, w), y as usize);
            out.push(up + down + left + right - 4 * centre);
        }
    }
    Ok(out)
}

/// Population variance of the Laplacian response.
pub fn laplacian_variance(gray: &GrayImage) -> Result<f64, QualityError> {
    let lap = laplacian(gray)?;
    let n = lap.len() as f64;
    let mean = lap.iter().map(|&v| v as f64).sum::<f64>() / n;
    Ok(lap.iter().map(|&v| (v as f64 - mean).powi(2)).sum::<f64>() / n)
}

pub fn mean_brightness(gray: &GrayImage) -> Result<f64, QualityError> {
    if gray.data.is_empty() {
        return Err(QualityError::Empty);
    }
    Ok(gray.data.iter().map(|&v| v as f64).sum::<f64>() / gray.data.len() as f64)
}

/// Score blur and brightness of an RGB crop.
pub fn assess(view: &ImageView<'_>, config: &QualityConfig) -> Result<QualityScore, QualityError> {
    let gray = to_gray(view);
    let blur_variance = laplacian_variance(&gray)?;
    let mean = mean_brightness(&gray)?;

    let score = QualityScore {
        blur_variance,
        is_blurred: blur_variance < config.blur_threshold,
        mean_brightness: mean,
        is_acceptable_brightness: mean >= config.min_brightness && mean <= config.max_brightness,
    };
    tracing::debug!(
        blur_variance,
        mean_brightness = mean,
        blurred = score.is_blurred,
        "assessed crop quality"
    );
    Ok(score)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sampler::Image;
    use crate::test_utils::{checkerboard, solid};

    fn gray(width: u32, height: u32, data: Vec<u8>) -> GrayImage {
        GrayImage {
            width,
            height,
            data,
        }
    }

    #[test]
    fn test_gray_uses_calibrated_weights() {
        let img = solid(1, 1, [100, 150, 200]);
        // 22.9 + 88.05 + 22.8 = 133.75
        assert_eq!(to_gray(&img.view().unwrap()).data, vec![134]);
    }

    #[test]
    fn test_gray_accumulates_in_single_precision() {
        // 0.587·80 + 0.114·110 is exactly 59.5 in f32 (59.4999… in f64)
        let img = solid(1, 1, [0, 80, 110]);
        assert_eq!(to_gray(&img.view().unwrap()).data, vec![60]);
    }

    #[test]
    fn test_gray_white_saturates() {
        // Weights sum to 0.93, so white maps below 255
        let img = solid(1, 1, [255, 255, 255]);
        assert_eq!(to_gray(&img.view().unwrap()).data, vec![237]);
    }

    #[test]
    fn test_uniform_image_is_blurred() {
        let img = solid(16, 16, [120, 120, 120]);
        let score = assess(&img.view().unwrap(), &QualityConfig::default()).unwrap();
        assert_eq!(score.blur_variance, 0.0);
        assert!(score.is_blurred);
    }

    #[test]
    fn test_checkerboard_is_sharp() {
        let img = checkerboard(32, 32);
        let score = assess(&img.view().unwrap(), &QualityConfig::default()).unwrap();
        assert!(score.blur_variance > 1000.0);
        assert!(!score.is_blurred);
    }

    #[test]
    fn test_laplacian_reflects_second_row() {
        let g = gray(3, 3, vec![0, 0, 0, 0, 9, 0, 0, 0, 0]);
        let lap = laplacian(&g).unwrap();
        // Top-centre sees the centre twice (above mirrors to row 1)
        assert_eq!(lap[1], 18);
        assert_eq!(lap[4], -36);
        assert_eq!(lap[0], 0);
    }

    #[test]
    fn test_laplacian_too_small() {
        let g = gray(1, 4, vec![1, 2, 3, 4]);
        assert_eq!(
            laplacian(&g),
            Err(QualityError::TooSmall {
                width: 1,
                height: 4
            })
        );
    }

    #[test]
    fn test_black_is_not_acceptable() {
        let img = Image::new(8, 8);
        let score = assess(&img.view().unwrap(), &QualityConfig::default()).unwrap();
        assert_eq!(score.mean_brightness, 0.0);
        assert!(!score.is_acceptable_brightness);
    }

    #[test]
    fn test_mid_gray_is_acceptable() {
        let g = gray(2, 2, vec![200; 4]);
        let mean = mean_brightness(&g).unwrap();
        assert_eq!(mean, 200.0);

        let img = solid(8, 8, [200, 200, 200]);
        let score = assess(&img.view().unwrap(), &QualityConfig::default()).unwrap();
        assert!(score.is_acceptable_brightness);
    }

    #[test]
    fn test_mean_brightness_empty() {
        assert_eq!(mean_brightness(&gray(0, 0, vec![])), Err(QualityError::Empty));
    }
}
