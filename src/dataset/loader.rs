//! Group image folder discovery
//!
//! Each label group has two trees under the data root:
//!
//! ```text
//! data_root/
//! ├── RH_mcp3_narrowing/          full class set (binary stage)
//! │   ├── train/0/*.png
//! │   ├── train/1/*.png
//! │   └── val/...
//! └── RH_mcp3_narrowing_minor/    majority class removed (minor stage)
//!     ├── train/1/*.png
//!     └── val/...
//! ```
//!
//! Class folders are named by their raw class index, so both trees yield raw
//! labels.

use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};
use walkdir::WalkDir;

use crate::training::remap::Stage;
use crate::utils::error::{GradingError, Result};

const IMAGE_EXTENSIONS: [&str; 5] = ["jpg", "jpeg", "png", "bmp", "tif"];

/// A single image file with its raw class index
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ImageSample {
    pub path: PathBuf,
    pub label: usize,
}

/// Locates the split directories of a label group
#[derive(Debug, Clone)]
pub struct GroupImageFolder {
    data_root: PathBuf,
    minor_suffix: String,
}

impl GroupImageFolder {
    pub fn new<P: AsRef<Path>>(data_root: P, minor_suffix: &str) -> Self {
        Self {
            data_root: data_root.as_ref().to_path_buf(),
            minor_suffix: minor_suffix.to_string(),
        }
    }

    /// Tree used to train a stage: the full tree for Binary, the suffixed one for Minor
    pub fn stage_dir(&self, group: &str, stage: Stage) -> PathBuf {
        match stage {
            Stage::Binary => self.data_root.join(group),
            Stage::Minor => self.data_root.join(format!("{}{}", group, self.minor_suffix)),
        }
    }

    /// Every image of `<stage tree>/<split>/<class>/`
    pub fn load_split(&self, group: &str, stage: Stage, split: &str) -> Result<Vec<ImageSample>> {
        let dir = self.stage_dir(group, stage).join(split);
        let samples = scan_class_folders(&dir)?;
        info!(
            "{} {} split of {}: {} images",
            stage,
            split,
            group,
            samples.len()
        );
        Ok(samples)
    }
}

/// Scan `dir/<class index>/*` for images; non-numeric folders are ignored
pub fn scan_class_folders(dir: &Path) -> Result<Vec<ImageSample>> {
    if !dir.is_dir() {
        return Err(GradingError::PathNotFound(dir.to_path_buf()));
    }

    let mut class_dirs: Vec<(usize, PathBuf)> = Vec::new();
    for entry in std::fs::read_dir(dir)? {
        let entry = entry?;
        if !entry.file_type()?.is_dir() {
            continue;
        }
        let name = entry.file_name().to_string_lossy().to_string();
        match name.parse::<usize>() {
            Ok(label) => class_dirs.push((label, entry.path())),
            Err(_) => warn!("Ignoring non-numeric class folder {:?}", entry.path()),
        }
    }
    class_dirs.sort();

    let mut samples = Vec::new();
    for (label, class_dir) in class_dirs {
        let images = list_images(&class_dir);
        debug!("class {}: {} images", label, images.len());
        samples.extend(images.into_iter().map(|path| ImageSample { path, label }));
    }

    Ok(samples)
}

/// Image files directly inside `dir`, sorted by path
pub fn list_images(dir: &Path) -> Vec<PathBuf> {
    let mut images: Vec<PathBuf> = WalkDir::new(dir)
        .min_depth(1)
        .max_depth(1)
        .into_iter()
        .filter_map(|e| e.ok())
        .map(|e| e.into_path())
        .filter(|path| is_image(path))
        .collect();
    images.sort();
    images
}

fn is_image(path: &Path) -> bool {
    path.extension()
        .map(|ext| ext.to_string_lossy().to_lowercase())
        .is_some_and(|ext| IMAGE_EXTENSIONS.contains(&ext.as_str()))
}

/// `(path, label)` pairs for the dataset cache
pub fn as_pairs(samples: &[ImageSample]) -> Vec<(PathBuf, usize)> {
    samples.iter().map(|s| (s.path.clone(), s.label)).collect()
}
