//! Label remapping between the raw grade space and the two stage spaces.
//!
//! The binary stage asks "is this the majority grade?" (1 = majority,
//! 0 = anything else). The minor stage covers every grade except the
//! majority one, with grades above the majority shifted down by one so the
//! output space stays contiguous.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::utils::error::{GradingError, Result};

/// Binary-stage index meaning "majority class"
pub const MAJORITY_INDEX: usize = 1;

/// Binary-stage index meaning "some other class"
pub const NOT_MAJORITY_INDEX: usize = 0;

/// Which of the two models a label space belongs to
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Stage {
    Binary,
    Minor,
}

impl Stage {
    /// Number of logits the stage model emits for a group of `num_classes` grades
    pub fn output_width(&self, num_classes: usize) -> usize {
        match self {
            Stage::Binary => 2,
            Stage::Minor => num_classes.saturating_sub(1),
        }
    }

    /// Name used for artifacts and logs
    pub fn as_str(&self) -> &'static str {
        match self {
            Stage::Binary => "binary",
            Stage::Minor => "minor",
        }
    }
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Stage {
    type Err = GradingError;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_lowercase().as_str() {
            "binary" => Ok(Stage::Binary),
            "minor" => Ok(Stage::Minor),
            other => Err(GradingError::InvalidStage(other.to_string())),
        }
    }
}

/// A stage together with the majority class it was built around
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct StageRemap {
    pub stage: Stage,
    pub majority_class: usize,
}

impl StageRemap {
    pub fn new(stage: Stage, majority_class: usize) -> Self {
        Self {
            stage,
            majority_class,
        }
    }

    pub fn apply(&self, labels: &[usize]) -> Result<Vec<usize>> {
        remap(labels, self.stage, self.majority_class)
    }
}

/// Remap one raw label into `stage`'s label space
pub fn remap_label(label: usize, stage: Stage, majority_class: usize) -> Result<usize> {
    match stage {
        Stage::Binary => Ok(if label == majority_class {
            MAJORITY_INDEX
        } else {
            NOT_MAJORITY_INDEX
        }),
        Stage::Minor => {
            if label == majority_class {
                Err(GradingError::MajorityInMinorStage {
                    label,
                    majority: majority_class,
                })
            } else if label < majority_class {
                Ok(label)
            } else {
                Ok(label - 1)
            }
        }
    }
}

/// Remap a sequence of raw labels, returning a fresh vector in the same order
pub fn remap(labels: &[usize], stage: Stage, majority_class: usize) -> Result<Vec<usize>> {
    labels
        .iter()
        .map(|&label| remap_label(label, stage, majority_class))
        .collect()
}

/// Inverse of the minor remap: minor index back to the raw grade
pub fn unmap_minor(minor_label: usize, majority_class: usize) -> usize {
    if minor_label >= majority_class {
        minor_label + 1
    } else {
        minor_label
    }
}

/// Final raw grade from the binary arg-max and, when routed, the minor arg-max
///
/// `minor_argmax` is only consulted when the binary model did not pick the
/// majority class; a missing minor prediction on that path is an error.
pub fn compose_prediction(
    binary_argmax: usize,
    minor_argmax: Option<usize>,
    majority_class: usize,
) -> Result<usize> {
    if binary_argmax == MAJORITY_INDEX {
        return Ok(majority_class);
    }
    minor_argmax
        .map(|m| unmap_minor(m, majority_class))
        .ok_or_else(|| {
            GradingError::InvalidInput("image routed to the minor stage without a minor prediction".to_string())
        })
}
