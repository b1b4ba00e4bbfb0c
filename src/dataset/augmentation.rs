//! Per-sample transforms for grayscale radiographs
//!
//! A [`SampleTransform`] turns a decoded image into the flat `[1, H, W]`
//! float buffer the batcher stacks. Passing an RNG enables the stochastic
//! augmentations; passing `None` gives the deterministic evaluation path.
//!
//! # Augmentation Strategy
//!
//! - **Labeled stream**: one augmented view per sample
//! - **Unlabeled stream**: two independently augmented views per sample
//! - **Validation**: no augmentation

use image::imageops::FilterType;
use image::{GrayImage, ImageBuffer, Luma};
use rand::Rng;
use rand_chacha::ChaCha8Rng;
use serde::{Deserialize, Serialize};

use crate::utils::error::{Result, SemixupError};

/// Pure per-sample preprocessing shared (read-only) by all loader threads
pub trait SampleTransform: Send + Sync {
    /// Preprocess one image into CHW data, augmenting when `rng` is given
    fn apply(&self, image: &GrayImage, rng: Option<&mut ChaCha8Rng>) -> Vec<f32>;

    /// Side length of the square output
    fn image_size(&self) -> usize;
}

/// Configuration for data augmentation
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AugmentationConfig {
    /// Probability of applying horizontal flip (0.0 - 1.0)
    pub horizontal_flip_prob: f32,
    /// Maximum rotation angle in degrees (applies ±rotation_degrees)
    pub rotation_degrees: f32,
    /// Probability of applying rotation
    pub rotation_prob: f32,
    /// Brightness adjustment range (±brightness_delta)
    pub brightness_delta: f32,
    pub brightness_prob: f32,
    /// Contrast adjustment range (1.0 ± contrast_delta)
    pub contrast_delta: f32,
    pub contrast_prob: f32,
    /// Gaussian noise standard deviation (0.0 = disabled)
    pub noise_std: f32,
    pub noise_prob: f32,
}

impl Default for AugmentationConfig {
    fn default() -> Self {
        Self {
            horizontal_flip_prob: 0.5,
            rotation_degrees: 10.0,
            rotation_prob: 0.5,
            brightness_delta: 0.1,
            brightness_prob: 0.5,
            contrast_delta: 0.2,
            contrast_prob: 0.5,
            noise_std: 0.02,
            noise_prob: 0.2,
        }
    }
}

impl AugmentationConfig {
    /// Probabilities must lie in [0, 1]; ranges and the noise level must be
    /// finite and non-negative.
    pub fn validate(&self) -> Result<()> {
        let probabilities = [
            ("horizontal_flip_prob", self.horizontal_flip_prob),
            ("rotation_prob", self.rotation_prob),
            ("brightness_prob", self.brightness_prob),
            ("contrast_prob", self.contrast_prob),
            ("noise_prob", self.noise_prob),
        ];
        if let Some((name, p)) = probabilities.iter().find(|(_, p)| !(0.0..=1.0).contains(p)) {
            return Err(SemixupError::Config(format!("augmentation.{name} must lie in [0, 1], got {p}")));
        }

        let magnitudes = [
            ("rotation_degrees", self.rotation_degrees),
            ("brightness_delta", self.brightness_delta),
            ("contrast_delta", self.contrast_delta),
            ("noise_std", self.noise_std),
        ];
        if let Some((name, v)) = magnitudes.iter().find(|(_, v)| !v.is_finite() || *v < 0.0) {
            return Err(SemixupError::Config(format!(
                "augmentation.{name} must be finite and non-negative, got {v}"
            )));
        }
        Ok(())
    }

    /// Mild preset
    pub fn light() -> Self {
        Self {
            horizontal_flip_prob: 0.5,
            rotation_degrees: 5.0,
            rotation_prob: 0.3,
            brightness_delta: 0.05,
            brightness_prob: 0.3,
            contrast_delta: 0.1,
            contrast_prob: 0.3,
            noise_std: 0.0,
            noise_prob: 0.0,
        }
    }

    /// Disable all augmentations
    pub fn none() -> Self {
        Self {
            horizontal_flip_prob: 0.0,
            rotation_degrees: 0.0,
            rotation_prob: 0.0,
            brightness_delta: 0.0,
            brightness_prob: 0.0,
            contrast_delta: 0.0,
            contrast_prob: 0.0,
            noise_std: 0.0,
            noise_prob: 0.0,
        }
    }
}

/// Intensity normalization applied after scaling to [0, 1]
#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
pub struct Normalization {
    pub mean: f32,
    pub std: f32,
}

impl Default for Normalization {
    fn default() -> Self {
        Self { mean: 0.5, std: 0.25 }
    }
}

/// Image augmenter that applies random transformations
#[derive(Clone, Debug)]
pub struct Augmenter {
    config: AugmentationConfig,
    normalization: Normalization,
    image_size: u32,
}

impl Augmenter {
    pub fn new(config: AugmentationConfig, normalization: Normalization, image_size: u32) -> Self {
        Self {
            config,
            normalization,
            image_size,
        }
    }

    /// Augmenter with default augmentation and normalization
    pub fn with_defaults(image_size: u32) -> Self {
        Self::new(AugmentationConfig::default(), Normalization::default(), image_size)
    }

    /// Apply all configured augmentations randomly to an image
    pub fn augment(&self, img: &GrayImage, rng: &mut ChaCha8Rng) -> GrayImage {
        let mut result = img.clone();

        if rng.gen::<f32>() < self.config.horizontal_flip_prob {
            result = image::imageops::flip_horizontal(&result);
        }

        if self.config.rotation_prob > 0.0 && rng.gen::<f32>() < self.config.rotation_prob {
            let angle = rng.gen_range(-self.config.rotation_degrees..=self.config.rotation_degrees);
            result = rotate(&result, angle);
        }

        if self.config.brightness_prob > 0.0 && rng.gen::<f32>() < self.config.brightness_prob {
            let delta = rng.gen_range(-self.config.brightness_delta..=self.config.brightness_delta);
            result = map_pixels(&result, |v| v + delta * 255.0);
        }

        if self.config.contrast_prob > 0.0 && rng.gen::<f32>() < self.config.contrast_prob {
            let factor = 1.0 + rng.gen_range(-self.config.contrast_delta..=self.config.contrast_delta);
            let mean = mean_intensity(&result);
            result = map_pixels(&result, |v| mean + factor * (v - mean));
        }

        if self.config.noise_std > 0.0 && rng.gen::<f32>() < self.config.noise_prob {
            let std = self.config.noise_std * 255.0;
            result = map_pixels(&result, |v| {
                // Box-Muller
                let u1: f32 = rng.gen_range(f32::EPSILON..1.0);
                let u2: f32 = rng.gen();
                v + std * (-2.0 * u1.ln()).sqrt() * (2.0 * std::f32::consts::PI * u2).cos()
            });
        }

        result
    }

    /// Resize image to the target size (always applied)
    pub fn resize(&self, img: &GrayImage) -> GrayImage {
        if img.dimensions() == (self.image_size, self.image_size) {
            return img.clone();
        }
        image::imageops::resize(img, self.image_size, self.image_size, FilterType::Triangle)
    }

    /// Flatten to `[1, H, W]` data, scaled to [0, 1] and normalized
    pub fn to_tensor_data(&self, img: &GrayImage) -> Vec<f32> {
        let Normalization { mean, std } = self.normalization;
        img.pixels().map(|p| (p[0] as f32 / 255.0 - mean) / std).collect()
    }
}

impl SampleTransform for Augmenter {
    fn apply(&self, image: &GrayImage, rng: Option<&mut ChaCha8Rng>) -> Vec<f32> {
        let resized = self.resize(image);
        let result = match rng {
            Some(rng) => self.augment(&resized, rng),
            None => resized,
        };
        self.to_tensor_data(&result)
    }

    fn image_size(&self) -> usize {
        self.image_size as usize
    }
}

fn map_pixels<F: FnMut(f32) -> f32>(img: &GrayImage, mut f: F) -> GrayImage {
    let (width, height) = img.dimensions();
    let mut output = ImageBuffer::new(width, height);
    for (x, y, pixel) in img.enumerate_pixels() {
        let v = f(pixel[0] as f32).round().clamp(0.0, 255.0) as u8;
        output.put_pixel(x, y, Luma([v]));
    }
    output
}

fn mean_intensity(img: &GrayImage) -> f32 {
    let count = (img.width() * img.height()).max(1) as f64;
    (img.pixels().map(|p| p[0] as f64).sum::<f64>() / count) as f32
}

/// Rotate around the image center with bilinear sampling; uncovered pixels are black
fn rotate(img: &GrayImage, angle_degrees: f32) -> GrayImage {
    if angle_degrees.abs() < 0.1 {
        return img.clone();
    }

    let (width, height) = img.dimensions();
    let (sin_a, cos_a) = angle_degrees.to_radians().sin_cos();
    let cx = width as f32 / 2.0;
    let cy = height as f32 / 2.0;

    let mut output = ImageBuffer::new(width, height);
    for y in 0..height {
        for x in 0..width {
            let dx = x as f32 - cx;
            let dy = y as f32 - cy;
            let src_x = cx + dx * cos_a + dy * sin_a;
            let src_y = cy - dx * sin_a + dy * cos_a;
            output.put_pixel(x, y, Luma([bilinear_sample(img, src_x, src_y)]));
        }
    }
    output
}

fn bilinear_sample(img: &GrayImage, x: f32, y: f32) -> u8 {
    let (width, height) = img.dimensions();
    if x < 0.0 || y < 0.0 || x >= width as f32 - 1.0 || y >= height as f32 - 1.0 {
        return 0;
    }

    let x0 = x.floor() as u32;
    let y0 = y.floor() as u32;
    let x1 = (x0 + 1).min(width - 1);
    let y1 = (y0 + 1).min(height - 1);
    let fx = x - x0 as f32;
    let fy = y - y0 as f32;

    let v = |px: u32, py: u32| img.get_pixel(px, py)[0] as f32;
    let value = v(x0, y0) * (1.0 - fx) * (1.0 - fy)
        + v(x1, y0) * fx * (1.0 - fy)
        + v(x0, y1) * (1.0 - fx) * fy
        + v(x1, y1) * fx * fy;

    value.round().clamp(0.0, 255.0) as u8
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::SeedableRng;

    fn gradient_image(size: u32) -> GrayImage {
        ImageBuffer::from_fn(size, size, |x, y| Luma([((x + y) * 2) as u8]))
    }

    #[test]
    fn test_apply_shape_without_rng() {
        let aug = Augmenter::with_defaults(16);
        let data = aug.apply(&gradient_image(40), None);
        assert_eq!(data.len(), 16 * 16);
    }

    #[test]
    fn test_no_rng_is_deterministic() {
        let aug = Augmenter::with_defaults(16);
        let img = gradient_image(32);
        assert_eq!(aug.apply(&img, None), aug.apply(&img, None));
    }

    #[test]
    fn test_same_seed_same_augmentation() {
        let aug = Augmenter::with_defaults(16);
        let img = gradient_image(16);

        let mut rng_a = ChaCha8Rng::seed_from_u64(3);
        let mut rng_b = ChaCha8Rng::seed_from_u64(3);
        assert_eq!(aug.apply(&img, Some(&mut rng_a)), aug.apply(&img, Some(&mut rng_b)));
    }

    #[test]
    fn test_none_config_leaves_image_untouched() {
        let aug = Augmenter::new(AugmentationConfig::none(), Normalization::default(), 16);
        let img = gradient_image(16);
        let mut rng = ChaCha8Rng::seed_from_u64(0);
        assert_eq!(aug.augment(&img, &mut rng), img);
    }

    #[test]
    fn test_normalization() {
        let aug = Augmenter::new(AugmentationConfig::none(), Normalization { mean: 0.5, std: 0.5 }, 2);
        let img = GrayImage::from_pixel(2, 2, Luma([255]));
        let data = aug.to_tensor_data(&img);
        assert!(data.iter().all(|v| (v - 1.0).abs() < 1e-6));
    }

    #[test]
    fn test_rotation_keeps_size() {
        let img = gradient_image(20);
        let rotated = rotate(&img, 15.0);
        assert_eq!(rotated.dimensions(), (20, 20));
        assert_ne!(rotated, img);
    }

    #[test]
    fn test_validate_rejects_bad_ranges() {
        assert!(AugmentationConfig::default().validate().is_ok());
        assert!(AugmentationConfig::light().validate().is_ok());
        assert!(AugmentationConfig::none().validate().is_ok());

        let cases: Vec<Box<dyn Fn(&mut AugmentationConfig)>> = vec![
            Box::new(|c| c.rotation_degrees = -5.0),
            Box::new(|c| c.brightness_delta = -0.1),
            Box::new(|c| c.contrast_delta = -0.2),
            Box::new(|c| c.noise_std = -0.01),
            Box::new(|c| c.rotation_degrees = f32::NAN),
            Box::new(|c| c.rotation_prob = 1.5),
            Box::new(|c| c.noise_prob = -0.1),
        ];
        for mutate in cases {
            let mut config = AugmentationConfig::default();
            mutate(&mut config);
            assert!(matches!(config.validate(), Err(SemixupError::Config(_))), "{config:?}");
        }
    }

    #[test]
    fn test_presets_ordering() {
        assert!(AugmentationConfig::light().rotation_degrees < AugmentationConfig::default().rotation_degrees);
    }
}
