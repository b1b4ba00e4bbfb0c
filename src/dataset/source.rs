//! Sample sources: where the pixels of a [`SampleRecord`] come from
//!
//! Sources are shared read-only between loader threads.

use std::collections::HashMap;

use image::{GrayImage, ImageReader};
use indicatif::{ProgressBar, ProgressStyle};
use rayon::prelude::*;
use tracing::info;

use super::loader::{SampleId, SampleRecord};
use crate::utils::error::{Result, ResultExt, SemixupError};

/// Supplies decoded grayscale images for population records
pub trait SampleSource: Send + Sync {
    fn load(&self, record: &SampleRecord) -> Result<GrayImage>;
}

/// Decodes images from disk on every request, or from a preloaded cache
#[derive(Debug, Default)]
pub struct DiskSource {
    cache: Option<HashMap<SampleId, GrayImage>>,
}

impl DiskSource {
    /// Lazy source: images are decoded when a batch asks for them
    pub fn new() -> Self {
        Self { cache: None }
    }

    /// Decode all `records` up front in parallel, showing a progress bar
    pub fn preloaded(records: &[SampleRecord], pool: &rayon::ThreadPool) -> Result<Self> {
        let total = records.len();
        info!("Preloading {} images into memory", total);

        let pb = ProgressBar::new(total as u64);
        pb.set_style(
            ProgressStyle::default_bar()
                .template("  {spinner:.green} [{elapsed_precise}] [{bar:40.cyan/blue}] {pos}/{len} ({per_sec})")
                .map_err(|e| SemixupError::Config(format!("invalid progress template: {e}")))?
                .progress_chars("#>-"),
        );

        let cache = pool.install(|| {
            records
                .par_iter()
                .map(|record| {
                    let image = decode(record)?;
                    pb.inc(1);
                    Ok((record.id, image))
                })
                .collect::<Result<HashMap<_, _>>>()
        })?;

        pb.finish_and_clear();
        info!("Cached {} images", cache.len());
        Ok(Self { cache: Some(cache) })
    }

    pub fn is_cached(&self) -> bool {
        self.cache.is_some()
    }
}

impl SampleSource for DiskSource {
    fn load(&self, record: &SampleRecord) -> Result<GrayImage> {
        match self.cache.as_ref().and_then(|cache| cache.get(&record.id)) {
            Some(image) => Ok(image.clone()),
            None => decode(record),
        }
    }
}

fn decode(record: &SampleRecord) -> Result<GrayImage> {
    let path = record
        .path
        .as_ref()
        .with_context(|| format!("sample {} has no image path", record.id))?;

    let image = ImageReader::open(path)
        .map_err(|e| SemixupError::ImageLoad(path.clone(), e.to_string()))?
        .decode()
        .map_err(|e| SemixupError::ImageLoad(path.clone(), e.to_string()))?;

    Ok(image.to_luma8())
}

/// In-memory images keyed by sample id (synthetic data, tests)
#[derive(Debug, Default, Clone)]
pub struct MemorySource {
    images: HashMap<SampleId, GrayImage>,
}

impl MemorySource {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, id: SampleId, image: GrayImage) {
        self.images.insert(id, image);
    }
}

impl FromIterator<(SampleId, GrayImage)> for MemorySource {
    fn from_iter<T: IntoIterator<Item = (SampleId, GrayImage)>>(iter: T) -> Self {
        Self {
            images: iter.into_iter().collect(),
        }
    }
}

impl SampleSource for MemorySource {
    fn load(&self, record: &SampleRecord) -> Result<GrayImage> {
        self.images
            .get(&record.id)
            .cloned()
            .with_context(|| format!("no in-memory image for sample {}", record.id))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use image::Luma;
    use tempfile::TempDir;

    fn record(id: usize, path: Option<std::path::PathBuf>) -> SampleRecord {
        SampleRecord {
            id: SampleId(id),
            path,
            target: 0,
            unlabeled_target: 0,
        }
    }

    #[test]
    fn test_disk_source_decodes_to_grayscale() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("rgb.png");
        image::RgbImage::from_pixel(4, 3, image::Rgb([255, 255, 255])).save(&path).unwrap();

        let image = DiskSource::new().load(&record(0, Some(path))).unwrap();
        assert_eq!(image.dimensions(), (4, 3));
        assert_eq!(image.get_pixel(0, 0)[0], 255);
    }

    #[test]
    fn test_preloaded_cache_serves_without_disk() {
        let dir = TempDir::new().unwrap();
        let records: Vec<SampleRecord> = (0..3)
            .map(|i| {
                let path = dir.path().join(format!("{i}.png"));
                GrayImage::from_pixel(2, 2, Luma([i as u8])).save(&path).unwrap();
                record(i, Some(path))
            })
            .collect();

        let pool = rayon::ThreadPoolBuilder::new().num_threads(2).build().unwrap();
        let source = DiskSource::preloaded(&records, &pool).unwrap();
        assert!(source.is_cached());

        for r in &records {
            std::fs::remove_file(r.path.as_ref().unwrap()).unwrap();
        }
        assert_eq!(source.load(&records[2]).unwrap().get_pixel(0, 0)[0], 2);
    }

    #[test]
    fn test_missing_file_is_image_load_error() {
        let err = DiskSource::new()
            .load(&record(0, Some("/no/such/file.png".into())))
            .unwrap_err();
        assert!(matches!(err, SemixupError::ImageLoad(_, _)));
    }

    #[test]
    fn test_memory_source() {
        let source: MemorySource = vec![(SampleId(1), GrayImage::new(2, 2))].into_iter().collect();
        assert!(source.load(&record(1, None)).is_ok());
        assert!(source.load(&record(0, None)).is_err());
    }
}
