//! A single row of a [`Matrix`](super::Matrix).

use ahash::AHashMap as HashMap;

/// One instance (row) of a matrix: a label set plus the slot it occupies in
/// every metric store.
#[derive(Debug, Clone, PartialEq)]
pub struct Instance {
    index: usize,
    labels: HashMap<String, String>,
    exportable: bool,
    partial: bool,
}

impl Instance {
    pub(crate) fn new(index: usize) -> Self {
        Self {
            index,
            labels: HashMap::new(),
            exportable: true,
            partial: false,
        }
    }

    /// Slot of this instance in the metric stores of its matrix.
    pub fn index(&self) -> usize {
        self.index
    }

    pub(crate) fn set_index(&mut self, index: usize) {
        self.index = index;
    }

    /// Returns the label value, or `""` when the label is not set.
    pub fn label(&self, name: &str) -> &str {
        self.labels.get(name).map(String::as_str).unwrap_or("")
    }

    pub fn has_label(&self, name: &str) -> bool {
        self.labels.contains_key(name)
    }

    pub fn labels(&self) -> &HashMap<String, String> {
        &self.labels
    }

    pub fn set_label(&mut self, name: impl Into<String>, value: impl Into<String>) {
        self.labels.insert(name.into(), value.into());
    }

    pub fn remove_label(&mut self, name: &str) -> Option<String> {
        self.labels.remove(name)
    }

    /// Replaces the whole label set.
    pub fn set_labels(&mut self, labels: HashMap<String, String>) {
        self.labels = labels;
    }

    pub fn exportable(&self) -> bool {
        self.exportable
    }

    pub fn set_exportable(&mut self, exportable: bool) {
        self.exportable = exportable;
    }

    /// True when the poll that produced this instance was truncated.
    pub fn is_partial(&self) -> bool {
        self.partial
    }

    pub fn set_partial(&mut self, partial: bool) {
        self.partial = partial;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_missing_label_reads_empty() {
        let mut inst = Instance::new(0);
        assert_eq!(inst.label("node"), "");
        assert!(!inst.has_label("node"));
        inst.set_label("node", "n1");
        assert_eq!(inst.label("node"), "n1");
        assert_eq!(inst.remove_label("node").as_deref(), Some("n1"));
    }

    #[test]
    fn test_defaults() {
        let inst = Instance::new(3);
        assert_eq!(inst.index(), 3);
        assert!(inst.exportable());
        assert!(!inst.is_partial());
    }
}
