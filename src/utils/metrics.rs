//! Metric primitives for ordinal grading
//!
//! - Confusion matrix (row = actual, column = predicted)
//! - Balanced accuracy (mean per-class recall)
//! - Quadratic weighted kappa (ordinal agreement)
//! - Running average of scalar values

use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::utils::error::Result;

/// Confusion Matrix for multi-class classification
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConfusionMatrix {
    /// Number of classes
    pub num_classes: usize,

    /// Matrix data stored as a flat vector in row-major order
    pub matrix: Vec<usize>,
}

impl Default for ConfusionMatrix {
    fn default() -> Self {
        Self::new(0)
    }
}

impl ConfusionMatrix {
    /// Create a new empty confusion matrix
    pub fn new(num_classes: usize) -> Self {
        Self {
            num_classes,
            matrix: vec![0; num_classes * num_classes],
        }
    }

    /// Create confusion matrix from predictions and ground truth
    pub fn from_predictions(predictions: &[usize], ground_truth: &[usize], num_classes: usize) -> Self {
        let mut cm = Self::new(num_classes);

        for (&pred, &actual) in predictions.iter().zip(ground_truth.iter()) {
            cm.add(actual, pred);
        }

        cm
    }

    /// Add a single prediction. Out-of-range classes are ignored.
    pub fn add(&mut self, actual: usize, predicted: usize) {
        if actual < self.num_classes && predicted < self.num_classes {
            let idx = actual * self.num_classes + predicted;
            self.matrix[idx] += 1;
        }
    }

    /// Get the count at (actual, predicted)
    pub fn get(&self, actual: usize, predicted: usize) -> usize {
        if actual < self.num_classes && predicted < self.num_classes {
            self.matrix[actual * self.num_classes + predicted]
        } else {
            0
        }
    }

    pub fn total(&self) -> usize {
        self.matrix.iter().sum()
    }

    /// Number of correct predictions (diagonal sum)
    pub fn correct(&self) -> usize {
        (0..self.num_classes).map(|i| self.get(i, i)).sum()
    }

    pub fn accuracy(&self) -> f64 {
        let total = self.total();
        if total > 0 {
            self.correct() as f64 / total as f64
        } else {
            0.0
        }
    }

    pub fn reset(&mut self) {
        self.matrix.iter_mut().for_each(|c| *c = 0);
    }

    /// Row sums (actual class counts)
    pub fn row_sums(&self) -> Vec<usize> {
        (0..self.num_classes)
            .map(|row| (0..self.num_classes).map(|col| self.get(row, col)).sum())
            .collect()
    }

    /// Column sums (predicted class counts)
    pub fn col_sums(&self) -> Vec<usize> {
        (0..self.num_classes)
            .map(|col| (0..self.num_classes).map(|row| self.get(row, col)).sum())
            .collect()
    }

    /// Mean recall over the classes that have at least one actual sample
    pub fn balanced_accuracy(&self) -> f64 {
        let recalls: Vec<f64> = self
            .row_sums()
            .into_iter()
            .enumerate()
            .filter(|(_, support)| *support > 0)
            .map(|(class, support)| self.get(class, class) as f64 / support as f64)
            .collect();

        if recalls.is_empty() {
            0.0
        } else {
            recalls.iter().sum::<f64>() / recalls.len() as f64
        }
    }

    /// Cohen's kappa with quadratic weights `(i - j)^2 / (n - 1)^2`.
    ///
    /// When the expected disagreement is zero (a single class in both the
    /// targets and the predictions) the score is 1.0 for a perfect match and
    /// 0.0 otherwise.
    pub fn quadratic_weighted_kappa(&self) -> f64 {
        let n = self.num_classes;
        let total = self.total();
        if n < 2 || total == 0 {
            return 0.0;
        }

        let rows = self.row_sums();
        let cols = self.col_sums();
        let scale = ((n - 1) * (n - 1)) as f64;

        let mut observed = 0.0;
        let mut expected = 0.0;
        for i in 0..n {
            for j in 0..n {
                let weight = ((i as f64 - j as f64).powi(2)) / scale;
                observed += weight * self.get(i, j) as f64;
                expected += weight * (rows[i] * cols[j]) as f64 / total as f64;
            }
        }

        if expected == 0.0 {
            if observed == 0.0 {
                1.0
            } else {
                0.0
            }
        } else {
            1.0 - observed / expected
        }
    }

    /// Pretty print the confusion matrix
    pub fn display(&self, class_names: Option<&[String]>) -> String {
        let mut output = String::new();

        output.push_str("\nConfusion Matrix (rows=actual, cols=predicted):\n\n");

        let label = |idx: usize, width: usize| -> String {
            match class_names.and_then(|names| names.get(idx)) {
                Some(name) => name.chars().take(width).collect(),
                None => idx.to_string(),
            }
        };

        output.push_str("         ");
        for col in 0..self.num_classes {
            output.push_str(&format!("{:>6}", label(col, 6)));
        }
        output.push('\n');

        for row in 0..self.num_classes {
            output.push_str(&format!("{:>8} ", label(row, 8)));

            for col in 0..self.num_classes {
                let count = self.get(row, col);
                if row == col {
                    output.push_str(&format!("[{:>4}]", count));
                } else if count > 0 {
                    output.push_str(&format!(" {:>4} ", count));
                } else {
                    output.push_str("    . ");
                }
            }
            output.push('\n');
        }

        output.push_str(&format!(
            "\nBalanced accuracy: {:.2}% | Kappa: {:.4}\n",
            self.balanced_accuracy() * 100.0,
            self.quadratic_weighted_kappa()
        ));

        output
    }

    /// Save confusion matrix to CSV
    pub fn save_csv(&self, path: &Path, class_names: Option<&[String]>) -> Result<()> {
        let name = |idx: usize| -> String {
            class_names
                .and_then(|names| names.get(idx).cloned())
                .unwrap_or_else(|| idx.to_string())
        };

        let mut content = String::from("actual\\predicted");
        for col in 0..self.num_classes {
            content.push_str(&format!(",{}", name(col)));
        }
        content.push('\n');

        for row in 0..self.num_classes {
            content.push_str(&name(row));
            for col in 0..self.num_classes {
                content.push_str(&format!(",{}", self.get(row, col)));
            }
            content.push('\n');
        }

        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        std::fs::write(path, content)?;
        Ok(())
    }
}

impl std::fmt::Display for ConfusionMatrix {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.display(None))
    }
}

/// Running average for tracking metrics during training
#[derive(Debug, Clone, Default)]
pub struct RunningAverage {
    sum: f64,
    count: usize,
}

impl RunningAverage {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add(&mut self, value: f64) {
        self.sum += value;
        self.count += 1;
    }

    /// Current mean, or `None` before the first value
    pub fn average(&self) -> Option<f64> {
        if self.count > 0 {
            Some(self.sum / self.count as f64)
        } else {
            None
        }
    }

    pub fn count(&self) -> usize {
        self.count
    }

    pub fn reset(&mut self) {
        self.sum = 0.0;
        self.count = 0;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_confusion_matrix() {
        let predictions = vec![0, 1, 2, 0, 1, 2, 0, 0, 2, 2];
        let ground_truth = vec![0, 1, 2, 0, 2, 2, 1, 0, 1, 2];

        let cm = ConfusionMatrix::from_predictions(&predictions, &ground_truth, 3);

        assert_eq!(cm.get(0, 0), 3);
        assert_eq!(cm.get(1, 1), 1);
        assert_eq!(cm.get(2, 2), 3);
        assert_eq!(cm.total(), 10);
        assert_eq!(cm.correct(), 7);
        assert!((cm.accuracy() - 0.7).abs() < 1e-9);
    }

    #[test]
    fn test_balanced_accuracy_ignores_imbalance() {
        // class 0: 8 samples all correct, class 1: 2 samples, one correct
        let ground_truth = vec![0, 0, 0, 0, 0, 0, 0, 0, 1, 1];
        let predictions = vec![0, 0, 0, 0, 0, 0, 0, 0, 1, 0];

        let cm = ConfusionMatrix::from_predictions(&predictions, &ground_truth, 3);

        assert!((cm.accuracy() - 0.9).abs() < 1e-9);
        assert!((cm.balanced_accuracy() - 0.75).abs() < 1e-9);
    }

    #[test]
    fn test_kappa_perfect_agreement() {
        let labels = vec![0, 1, 2, 3, 4, 0, 1, 2, 3, 4];
        let cm = ConfusionMatrix::from_predictions(&labels, &labels, 5);
        assert!((cm.quadratic_weighted_kappa() - 1.0).abs() < 1e-9);
    }

    #[test]
    fn test_kappa_penalizes_distant_errors_more() {
        let truth = vec![0, 1, 2, 3, 4];
        let near = vec![1, 1, 2, 3, 4];
        let far = vec![4, 1, 2, 3, 4];

        let near_kappa = ConfusionMatrix::from_predictions(&near, &truth, 5).quadratic_weighted_kappa();
        let far_kappa = ConfusionMatrix::from_predictions(&far, &truth, 5).quadratic_weighted_kappa();

        assert!(near_kappa > far_kappa);
        assert!(near_kappa < 1.0);
    }

    #[test]
    fn test_kappa_known_value() {
        // matrix [[1, 1], [0, 2]]: observed disagreement 1, expected (2*3 + 2*1) / 4 = 2
        let truth = vec![0, 0, 1, 1];
        let pred = vec![0, 1, 1, 1];
        let cm = ConfusionMatrix::from_predictions(&pred, &truth, 2);
        assert!((cm.quadratic_weighted_kappa() - 0.5).abs() < 1e-9);
    }

    #[test]
    fn test_kappa_single_class() {
        let cm = ConfusionMatrix::from_predictions(&[2, 2, 2], &[2, 2, 2], 5);
        assert_eq!(cm.quadratic_weighted_kappa(), 1.0);
    }

    #[test]
    fn test_save_csv_with_names() {
        let dir = tempfile::TempDir::new().unwrap();
        let path = dir.path().join("nested").join("cm.csv");
        let names: Vec<String> = vec!["KL0".into(), "KL1".into()];

        let cm = ConfusionMatrix::from_predictions(&[0, 1, 1], &[0, 1, 0], 2);
        cm.save_csv(&path, Some(&names)).unwrap();

        let content = std::fs::read_to_string(&path).unwrap();
        assert!(content.starts_with("actual\\predicted,KL0,KL1"));
        assert!(content.contains("KL0,1,1"));
        assert!(content.contains("KL1,0,1"));
    }

    #[test]
    fn test_running_average() {
        let mut avg = RunningAverage::new();
        assert_eq!(avg.average(), None);

        avg.add(1.0);
        avg.add(3.0);
        assert_eq!(avg.average(), Some(2.0));
        assert_eq!(avg.count(), 2);

        avg.reset();
        assert_eq!(avg.count(), 0);
    }
}
