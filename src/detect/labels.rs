use std::fs;
use std::path::Path;

use anyhow::{Context, Result};

/// Label used when a class id has no entry in the map.
pub const UNKNOWN_LABEL: &str = "Unknown";

/// Class id to label lookup. Line `n` of a labels file names class `n`.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct LabelMap {
    labels: Vec<String>,
}

impl LabelMap {
    pub fn new(labels: Vec<String>) -> Self {
        Self { labels }
    }

    pub fn load(path: &Path) -> Result<Self> {
        let raw = fs::read_to_string(path)
            .with_context(|| format!("read labels file {}", path.display()))?;
        Ok(Self::parse(&raw))
    }

    pub fn parse(raw: &str) -> Self {
        Self {
            labels: raw.lines().map(|line| line.trim().to_string()).collect(),
        }
    }

    pub fn label(&self, class_id: u32) -> &str {
        self.labels
            .get(class_id as usize)
            .map(String::as_str)
            .filter(|label| !label.is_empty())
            .unwrap_or(UNKNOWN_LABEL)
    }

    pub fn len(&self) -> usize {
        self.labels.len()
    }

    pub fn is_empty(&self) -> bool {
        self.labels.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn labels_are_indexed_by_line() -> Result<()> {
        let mut file = tempfile::NamedTempFile::new()?;
        writeln!(file, "person\nbicycle\n car ")?;
        let labels = LabelMap::load(file.path())?;
        assert_eq!(labels.len(), 3);
        assert_eq!(labels.label(0), "person");
        assert_eq!(labels.label(2), "car");
        Ok(())
    }

    #[test]
    fn unknown_ids_fall_back() {
        let labels = LabelMap::parse("person\n\ndog");
        assert_eq!(labels.label(1), UNKNOWN_LABEL);
        assert_eq!(labels.label(90), UNKNOWN_LABEL);
    }

    #[test]
    fn missing_file_is_an_error() {
        assert!(LabelMap::load(Path::new("/nonexistent/labels.txt")).is_err());
    }
}
