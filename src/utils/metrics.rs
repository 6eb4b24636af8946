//! Metrics Module for Grade Evaluation
//!
//! Accuracy, micro/macro F1 and a confusion matrix over class indices, plus
//! the two running accumulators used by the trainer and the predictor.

use serde::{Deserialize, Serialize};

/// Corpus-level classification metrics
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Metrics {
    /// Total number of samples evaluated
    pub total_samples: usize,

    /// Number of correct predictions
    pub correct_predictions: usize,

    /// Overall accuracy (correct / total)
    pub accuracy: f64,

    /// Micro-averaged F1 over all classes
    pub micro_f1: f64,

    /// Macro-averaged F1 over classes with support
    pub macro_f1: f64,

    /// Per-class metrics
    pub per_class: Vec<ClassMetrics>,

    /// Confusion matrix
    pub confusion_matrix: ConfusionMatrix,
}

impl Metrics {
    /// Build metrics from parallel prediction / ground-truth slices
    pub fn from_predictions(
        predictions: &[usize],
        ground_truth: &[usize],
        num_classes: usize,
    ) -> Self {
        assert_eq!(
            predictions.len(),
            ground_truth.len(),
            "Predictions and ground truth must have same length"
        );

        let total_samples = predictions.len();
        if total_samples == 0 {
            return Self::default();
        }

        let confusion_matrix =
            ConfusionMatrix::from_predictions(predictions, ground_truth, num_classes);

        let correct_predictions = predictions
            .iter()
            .zip(ground_truth.iter())
            .filter(|(p, g)| p == g)
            .count();

        let per_class: Vec<ClassMetrics> = (0..num_classes)
            .map(|class_idx| ClassMetrics::from_confusion_matrix(&confusion_matrix, class_idx))
            .collect();

        let with_support: Vec<&ClassMetrics> =
            per_class.iter().filter(|m| m.support > 0).collect();
        let macro_f1 = if with_support.is_empty() {
            0.0
        } else {
            with_support.iter().map(|m| m.f1).sum::<f64>() / with_support.len() as f64
        };

        Self {
            total_samples,
            correct_predictions,
            accuracy: correct_predictions as f64 / total_samples as f64,
            micro_f1: micro_f1(predictions, ground_truth),
            macro_f1,
            per_class,
            confusion_matrix,
        }
    }

    /// Short one-line summary for logs
    pub fn summary(&self) -> String {
        format!(
            "acc {:.2}% | micro-F1 {:.4} | macro-F1 {:.4} | n={}",
            self.accuracy * 100.0,
            self.micro_f1,
            self.macro_f1,
            self.total_samples
        )
    }
}

impl std::fmt::Display for Metrics {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.summary())
    }
}

/// Micro-averaged F1 for single-label multi-class predictions
///
/// Pools true positives, false positives and false negatives over every class
/// before computing precision and recall.
pub fn micro_f1(predictions: &[usize], ground_truth: &[usize]) -> f64 {
    let total = predictions.len().min(ground_truth.len());
    if total == 0 {
        return 0.0;
    }

    let tp = predictions
        .iter()
        .zip(ground_truth.iter())
        .filter(|(p, g)| p == g)
        .count() as f64;
    // Every miss is one FP (for the predicted class) and one FN (for the true class).
    let misses = total as f64 - tp;
    let precision = tp / (tp + misses);
    let recall = tp / (tp + misses);

    if precision + recall > 0.0 {
        2.0 * precision * recall / (precision + recall)
    } else {
        0.0
    }
}

/// Per-class metrics
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ClassMetrics {
    pub class_idx: usize,
    pub true_positives: usize,
    pub false_positives: usize,
    pub false_negatives: usize,
    pub precision: f64,
    pub recall: f64,
    pub f1: f64,
    /// Number of actual samples of this class
    pub support: usize,
}

impl ClassMetrics {
    /// Calculate metrics for a class from confusion matrix
    pub fn from_confusion_matrix(cm: &ConfusionMatrix, class_idx: usize) -> Self {
        let true_positives = cm.get(class_idx, class_idx);

        let false_positives: usize = (0..cm.num_classes)
            .filter(|&i| i != class_idx)
            .map(|i| cm.get(i, class_idx))
            .sum();

        let false_negatives: usize = (0..cm.num_classes)
            .filter(|&i| i != class_idx)
            .map(|i| cm.get(class_idx, i))
            .sum();

        let precision = ratio(true_positives, true_positives + false_positives);
        let recall = ratio(true_positives, true_positives + false_negatives);
        let f1 = if precision + recall > 0.0 {
            2.0 * precision * recall / (precision + recall)
        } else {
            0.0
        };

        Self {
            class_idx,
            true_positives,
            false_positives,
            false_negatives,
            precision,
            recall,
            f1,
            support: true_positives + false_negatives,
        }
    }
}

fn ratio(num: usize, den: usize) -> f64 {
    if den > 0 {
        num as f64 / den as f64
    } else {
        0.0
    }
}

/// Confusion Matrix (row = actual, column = predicted), row-major
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ConfusionMatrix {
    pub num_classes: usize,
    pub matrix: Vec<usize>,
}

impl ConfusionMatrix {
    pub fn new(num_classes: usize) -> Self {
        Self {
            num_classes,
            matrix: vec![0; num_classes * num_classes],
        }
    }

    pub fn from_predictions(
        predictions: &[usize],
        ground_truth: &[usize],
        num_classes: usize,
    ) -> Self {
        let mut cm = Self::new(num_classes);
        for (&pred, &actual) in predictions.iter().zip(ground_truth.iter()) {
            cm.add(actual, pred);
        }
        cm
    }

    /// Add a single prediction; out-of-range indices are ignored
    pub fn add(&mut self, actual: usize, predicted: usize) {
        if actual < self.num_classes && predicted < self.num_classes {
            self.matrix[actual * self.num_classes + predicted] += 1;
        }
    }

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

    pub fn correct(&self) -> usize {
        (0..self.num_classes).map(|i| self.get(i, i)).sum()
    }

    pub fn accuracy(&self) -> f64 {
        ratio(self.correct(), self.total())
    }

    /// Render as a small text table (grades are few, so no truncation)
    pub fn display(&self) -> String {
        let mut output = String::from("rows=actual, cols=predicted\n      ");
        for col in 0..self.num_classes {
            output.push_str(&format!("{:>6}", col));
        }
        output.push('\n');

        for row in 0..self.num_classes {
            output.push_str(&format!("{:>5} ", row));
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

        output
    }
}

impl std::fmt::Display for ConfusionMatrix {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.display())
    }
}

/// Running mean of scalar values (per-batch losses, per-batch accuracies)
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

    pub fn average(&self) -> f64 {
        if self.count > 0 {
            self.sum / self.count as f64
        } else {
            0.0
        }
    }

    pub fn count(&self) -> usize {
        self.count
    }
}

/// Exact-match rate of one batch
pub fn batch_accuracy(predictions: &[usize], ground_truth: &[usize]) -> f64 {
    let correct = predictions
        .iter()
        .zip(ground_truth.iter())
        .filter(|(p, g)| p == g)
        .count();
    ratio(correct, predictions.len().min(ground_truth.len()))
}
