//! Sample population
//!
//! The population is an arena of [`SampleRecord`]s addressed by [`SampleId`].
//! Folds, streams and batches only ever carry ids, never copies of records.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use tracing::{debug, info};
use walkdir::WalkDir;

use super::IMAGE_EXTENSIONS;
use crate::utils::error::{Result, ResultExt, SemixupError};

/// Index of a record inside its [`Population`]
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct SampleId(pub usize);

impl std::fmt::Display for SampleId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// One labeled sample of the population
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SampleRecord {
    pub id: SampleId,
    /// Image location (absent for synthetic populations)
    pub path: Option<PathBuf>,
    /// Ordinal grade used for stratification and supervision
    pub target: usize,
    /// Attribute used to balance the unlabeled draw
    pub unlabeled_target: usize,
}

/// Manifest entry accepted by [`Population::from_manifest`]
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ManifestEntry {
    pub path: PathBuf,
    pub target: usize,
    #[serde(default)]
    pub unlabeled_target: Option<usize>,
}

/// Arena of sample records
#[derive(Debug, Clone, Default)]
pub struct Population {
    records: Vec<SampleRecord>,
    class_names: Vec<String>,
}

impl Population {
    /// Build a population from `(target, unlabeled_target, path)` triples.
    /// Ids are assigned in input order.
    pub fn from_entries<I>(entries: I, class_names: Vec<String>) -> Result<Self>
    where
        I: IntoIterator<Item = (usize, Option<usize>, Option<PathBuf>)>,
    {
        let records: Vec<SampleRecord> = entries
            .into_iter()
            .enumerate()
            .map(|(idx, (target, unlabeled_target, path))| SampleRecord {
                id: SampleId(idx),
                path,
                target,
                unlabeled_target: unlabeled_target.unwrap_or(target),
            })
            .collect();

        if let Some(bad) = records.iter().find(|r| r.target >= class_names.len()) {
            return Err(SemixupError::Dataset(format!(
                "sample {} has target {} but only {} classes are defined",
                bad.id,
                bad.target,
                class_names.len()
            )));
        }

        Ok(Self { records, class_names })
    }

    /// Scan a directory of class folders.
    ///
    /// ```text
    /// root/
    /// ├── KL0/
    /// │   ├── 9000099_L.png
    /// │   └── ...
    /// ├── KL1/
    /// └── ...
    /// ```
    /// Folder names are sorted and mapped to grades in that order.
    pub fn from_directory<P: AsRef<Path>>(root: P) -> Result<Self> {
        let root = root.as_ref();
        info!("Scanning population in {:?}", root);

        if !root.is_dir() {
            return Err(SemixupError::Dataset(format!(
                "dataset directory does not exist: {:?}",
                root
            )));
        }

        let mut class_dirs: Vec<String> = Vec::new();
        for entry in WalkDir::new(root).min_depth(1).max_depth(1) {
            let entry = entry.map_err(std::io::Error::from)?;
            if entry.file_type().is_dir() {
                if let Some(name) = entry.file_name().to_str() {
                    class_dirs.push(name.to_string());
                }
            }
        }
        class_dirs.sort();

        let mut entries = Vec::new();
        for (label, class_name) in class_dirs.iter().enumerate() {
            let mut files: Vec<PathBuf> = WalkDir::new(root.join(class_name))
                .min_depth(1)
                .max_depth(1)
                .into_iter()
                .filter_map(|e| e.ok())
                .map(|e| e.path().to_path_buf())
                .filter(|p| is_image(p))
                .collect();
            files.sort();

            debug!("Class '{}' (grade {}): {} images", class_name, label, files.len());
            entries.extend(files.into_iter().map(|p| (label, None, Some(p))));
        }

        let population = Self::from_entries(entries, class_dirs)?;
        info!(
            "Loaded {} samples over {} classes",
            population.len(),
            population.num_classes()
        );
        Ok(population)
    }

    /// Load a JSON manifest. Relative paths are resolved against the
    /// manifest's directory.
    pub fn from_manifest<P: AsRef<Path>>(path: P, class_names: Vec<String>) -> Result<Self> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path)?;
        let entries: Vec<ManifestEntry> = serde_json::from_str(&content)?;
        let base = path.parent().map(Path::to_path_buf).unwrap_or_default();

        info!("Loaded manifest {:?} with {} entries", path, entries.len());

        Self::from_entries(
            entries.into_iter().map(|e| {
                let image = if e.path.is_absolute() { e.path } else { base.join(e.path) };
                (e.target, e.unlabeled_target, Some(image))
            }),
            class_names,
        )
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    pub fn num_classes(&self) -> usize {
        self.class_names.len()
    }

    pub fn class_names(&self) -> &[String] {
        &self.class_names
    }

    pub fn records(&self) -> &[SampleRecord] {
        &self.records
    }

    pub fn get(&self, id: SampleId) -> Result<&SampleRecord> {
        self.records
            .get(id.0)
            .with_context(|| format!("sample {} is not in the population", id))
    }

    /// Number of samples per grade
    pub fn class_counts(&self) -> BTreeMap<usize, usize> {
        let mut counts = BTreeMap::new();
        for record in &self.records {
            *counts.entry(record.target).or_insert(0) += 1;
        }
        counts
    }
}

fn is_image(path: &Path) -> bool {
    path.extension()
        .map(|ext| ext.to_string_lossy().to_lowercase())
        .map_or(false, |ext| IMAGE_EXTENSIONS.contains(&ext.as_str()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use image::{GrayImage, Luma};
    use tempfile::TempDir;

    fn write_image(path: &Path) {
        let img = GrayImage::from_pixel(8, 8, Luma([128]));
        img.save(path).unwrap();
    }

    #[test]
    fn test_from_directory_sorts_classes() {
        let dir = TempDir::new().unwrap();
        for (class, count) in [("KL1", 2), ("KL0", 3)] {
            let class_dir = dir.path().join(class);
            std::fs::create_dir_all(&class_dir).unwrap();
            for i in 0..count {
                write_image(&class_dir.join(format!("img_{i}.png")));
            }
            std::fs::write(class_dir.join("notes.txt"), "ignored").unwrap();
        }

        let population = Population::from_directory(dir.path()).unwrap();

        assert_eq!(population.class_names(), &["KL0".to_string(), "KL1".to_string()]);
        assert_eq!(population.len(), 5);
        assert_eq!(population.class_counts()[&0], 3);
        assert_eq!(population.class_counts()[&1], 2);
        assert!(population.records().iter().all(|r| r.path.is_some()));
    }

    #[test]
    fn test_only_top_level_folders_become_classes() {
        let dir = TempDir::new().unwrap();
        let nested = dir.path().join("KL2").join("extra");
        std::fs::create_dir_all(&nested).unwrap();
        write_image(&dir.path().join("KL2").join("a.png"));
        write_image(&nested.join("deep.png"));
        write_image(&dir.path().join("stray.png"));

        let population = Population::from_directory(dir.path()).unwrap();

        assert_eq!(population.class_names(), &["KL2".to_string()]);
        assert_eq!(population.len(), 1);
    }

    #[test]
    fn test_missing_directory() {
        assert!(Population::from_directory("/definitely/not/here").is_err());
    }

    #[test]
    fn test_manifest_with_unlabeled_target() {
        let dir = TempDir::new().unwrap();
        let manifest = dir.path().join("manifest.json");
        std::fs::write(
            &manifest,
            r#"[
                {"path": "a.png", "target": 0},
                {"path": "b.png", "target": 2, "unlabeled_target": 1}
            ]"#,
        )
        .unwrap();

        let names = vec!["KL0".to_string(), "KL1".to_string(), "KL2".to_string()];
        let population = Population::from_manifest(&manifest, names).unwrap();

        let a = population.get(SampleId(0)).unwrap();
        let b = population.get(SampleId(1)).unwrap();
        assert_eq!(a.unlabeled_target, 0);
        assert_eq!(b.unlabeled_target, 1);
        assert_eq!(a.path.as_deref(), Some(dir.path().join("a.png").as_path()));
    }

    #[test]
    fn test_target_out_of_range() {
        let result = Population::from_entries(vec![(3, None, None)], vec!["KL0".to_string()]);
        assert!(result.is_err());
    }
}
