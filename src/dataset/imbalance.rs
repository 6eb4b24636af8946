//! Majority-class detection from per-group class counts
//!
//! Counts come from CSV tables with a `group,class,count` header. Rows for the
//! same group are merged across tables and ordered by class index, and that
//! order decides ties in [`classify`].

use std::collections::BTreeMap;
use std::fmt;
use std::path::Path;

use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::utils::error::{GradingError, Result, ResultExt};

/// Outcome of majority detection for one label group
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Majority {
    /// This class holds more than half of the samples
    Class(usize),
    /// No class exceeds a 50% share
    Balanced,
}

impl fmt::Display for Majority {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Majority::Class(c) => write!(f, "class {}", c),
            Majority::Balanced => write!(f, "balanced"),
        }
    }
}

/// First class (in the given order) whose count is more than half of the total
pub fn classify(counts: &[(usize, usize)]) -> Majority {
    let total: usize = counts.iter().map(|(_, n)| n).sum();
    counts
        .iter()
        .find(|(_, n)| n * 2 > total)
        .map(|(class, _)| Majority::Class(*class))
        .unwrap_or(Majority::Balanced)
}

/// Ordered `(class, count)` pairs of one label group
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClassCounts {
    counts: Vec<(usize, usize)>,
}

impl ClassCounts {
    /// Wrap counts as given; their order is the tie-breaking order
    pub fn new(counts: Vec<(usize, usize)>) -> Self {
        Self { counts }
    }

    /// Counts for classes `0..n` from a dense slice
    pub fn from_dense(counts: &[usize]) -> Self {
        Self::new(counts.iter().copied().enumerate().collect())
    }

    pub fn majority(&self) -> Majority {
        classify(&self.counts)
    }

    pub fn total(&self) -> usize {
        self.counts.iter().map(|(_, n)| n).sum()
    }

    /// Number of classes in the group (highest class index + 1)
    pub fn num_classes(&self) -> usize {
        self.counts.iter().map(|(c, _)| c + 1).max().unwrap_or(0)
    }

    /// Classes with at least one sample
    pub fn represented(&self) -> usize {
        self.counts.iter().filter(|(_, n)| *n > 0).count()
    }

    /// Samples outside `class`
    pub fn count_excluding(&self, class: usize) -> usize {
        self.counts
            .iter()
            .filter(|(c, _)| *c != class)
            .map(|(_, n)| n)
            .sum()
    }

    pub fn as_slice(&self) -> &[(usize, usize)] {
        &self.counts
    }
}

#[derive(Debug, Deserialize)]
struct CountRow {
    group: String,
    class: usize,
    count: usize,
}

/// Class counts for every label group, merged from one or more CSV tables
#[derive(Debug, Clone, Default)]
pub struct ImbalanceTable {
    groups: BTreeMap<String, BTreeMap<usize, usize>>,
}

impl ImbalanceTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Load and merge several tables
    pub fn load_all<P: AsRef<Path>>(paths: &[P]) -> Result<Self> {
        let mut table = Self::new();
        for path in paths {
            table.merge_csv(path.as_ref())?;
        }
        Ok(table)
    }

    /// Add the rows of one CSV file; repeated `(group, class)` rows are summed
    pub fn merge_csv(&mut self, path: &Path) -> Result<()> {
        if !path.exists() {
            return Err(GradingError::PathNotFound(path.to_path_buf()));
        }

        let mut reader = csv::Reader::from_path(path)?;
        let mut rows = 0usize;
        for (line, record) in reader.deserialize::<CountRow>().enumerate() {
            let row = record.with_context(|| format!("{:?} row {}", path, line + 2))?;
            self.insert(&row.group, row.class, row.count);
            rows += 1;
        }
        debug!("Read {} count rows from {:?}", rows, path);
        Ok(())
    }

    pub fn insert(&mut self, group: &str, class: usize, count: usize) {
        *self
            .groups
            .entry(group.to_string())
            .or_default()
            .entry(class)
            .or_insert(0) += count;
    }

    /// Group names in sorted order
    pub fn groups(&self) -> impl Iterator<Item = &str> {
        self.groups.keys().map(String::as_str)
    }

    /// Counts of a group, ordered by class index
    pub fn counts(&self, group: &str) -> Option<ClassCounts> {
        self.groups
            .get(group)
            .map(|classes| ClassCounts::new(classes.iter().map(|(c, n)| (*c, *n)).collect()))
    }

    pub fn len(&self) -> usize {
        self.groups.len()
    }

    pub fn is_empty(&self) -> bool {
        self.groups.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_clear_majority() {
        assert_eq!(ClassCounts::from_dense(&[40, 8, 1, 1]).majority(), Majority::Class(0));
        assert_eq!(ClassCounts::from_dense(&[1, 2, 30]).majority(), Majority::Class(2));
    }

    #[test]
    fn test_exact_half_is_balanced() {
        assert_eq!(ClassCounts::from_dense(&[8, 8]).majority(), Majority::Balanced);
        assert_eq!(classify(&[]), Majority::Balanced);
    }

    #[test]
    fn test_end_to_end_counts() {
        let counts = ClassCounts::from_dense(&[32, 7, 1, 1]);
        assert_eq!(counts.majority(), Majority::Class(0));
        assert_eq!(counts.num_classes(), 4);
        assert_eq!(counts.represented(), 4);
        assert_eq!(counts.count_excluding(0), 9);
    }

    #[test]
    fn test_order_is_explicit() {
        let counts = ClassCounts::new(vec![(3, 10), (0, 2), (1, 1)]);
        assert_eq!(counts.majority(), Majority::Class(3));
        assert_eq!(counts.num_classes(), 4);
    }

    #[test]
    fn test_merge_tables() {
        let dir = tempfile::tempdir().unwrap();
        let narrowing = dir.path().join("narrowing.csv");
        let erosion = dir.path().join("erosion.csv");

        let mut f = std::fs::File::create(&narrowing).unwrap();
        writeln!(f, "group,class,count").unwrap();
        writeln!(f, "LH_mcp2_narrowing,1,7").unwrap();
        writeln!(f, "LH_mcp2_narrowing,0,32").unwrap();
        writeln!(f, "LH_mcp2_narrowing,2,1").unwrap();

        let mut f = std::fs::File::create(&erosion).unwrap();
        writeln!(f, "group,class,count").unwrap();
        writeln!(f, "LH_mcp2_narrowing,3,1").unwrap();
        writeln!(f, "RH_pip3_erosion,0,5").unwrap();
        writeln!(f, "RH_pip3_erosion,1,5").unwrap();

        let table = ImbalanceTable::load_all(&[narrowing, erosion]).unwrap();
        assert_eq!(table.len(), 2);

        let counts = table.counts("LH_mcp2_narrowing").unwrap();
        assert_eq!(counts.as_slice(), &[(0, 32), (1, 7), (2, 1), (3, 1)]);
        assert_eq!(counts.majority(), Majority::Class(0));

        let balanced = table.counts("RH_pip3_erosion").unwrap();
        assert_eq!(balanced.majority(), Majority::Balanced);

        assert!(table.counts("missing").is_none());
    }

    #[test]
    fn test_missing_table() {
        let result = ImbalanceTable::load_all(&[Path::new("/nonexistent/counts.csv")]);
        assert!(matches!(result, Err(GradingError::PathNotFound(_))));
    }
}
