//! Label sets identifying a series.
//!
//! A [`Labels`] value is always kept sorted by label name so that two sets
//! with the same pairs produce the same [`Labels::hash`] regardless of the
//! order they were built in.

use std::fmt;
use xxhash_rust::xxh64::Xxh64;

/// Reserved label holding the metric name.
pub const METRIC_NAME: &str = "__name__";

/// Separator fed to the hasher between names and values.
const HASH_SEP: u8 = 0xff;

/// A single name/value pair.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
pub struct Label {
    /// Label name.
    pub name: String,
    /// Label value.
    pub value: String,
}

impl Label {
    /// Creates a label from anything string-like.
    pub fn new(name: impl Into<String>, value: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            value: value.into(),
        }
    }
}

/// An ordered set of labels, sorted by name.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Default)]
pub struct Labels {
    labels: Vec<Label>,
}

impl Labels {
    /// Creates a label set, sorting the input by name.
    pub fn new(mut labels: Vec<Label>) -> Self {
        labels.sort_by(|a, b| a.name.cmp(&b.name));
        Self { labels }
    }

    /// Creates an empty label set.
    pub fn empty() -> Self {
        Self::default()
    }

    /// Builds a label set from `(name, value)` pairs.
    pub fn from_pairs<I, K, V>(pairs: I) -> Self
    where
        I: IntoIterator<Item = (K, V)>,
        K: Into<String>,
        V: Into<String>,
    {
        Self::new(pairs.into_iter().map(|(k, v)| Label::new(k, v)).collect())
    }

    /// Number of labels in the set.
    pub fn len(&self) -> usize {
        self.labels.len()
    }

    /// Returns true if the set has no labels.
    pub fn is_empty(&self) -> bool {
        self.labels.is_empty()
    }

    /// Iterates labels in name order.
    pub fn iter(&self) -> std::slice::Iter<'_, Label> {
        self.labels.iter()
    }

    /// Returns the value for `name`, if present.
    pub fn get(&self, name: &str) -> Option<&str> {
        self.labels
            .binary_search_by(|l| l.name.as_str().cmp(name))
            .ok()
            .map(|i| self.labels[i].value.as_str())
    }

    /// Returns true if a label called `name` exists.
    pub fn has(&self, name: &str) -> bool {
        self.get(name).is_some()
    }

    /// Returns the metric name (`__name__`), if set.
    pub fn metric_name(&self) -> Option<&str> {
        self.get(METRIC_NAME)
    }

    /// Computes a stable 64-bit hash of the label set.
    pub fn hash(&self) -> u64 {
        let mut hasher = Xxh64::new(0);
        for label in &self.labels {
            hasher.update(label.name.as_bytes());
            hasher.update(&[HASH_SEP]);
            hasher.update(label.value.as_bytes());
            hasher.update(&[HASH_SEP]);
        }
        hasher.digest()
    }

    /// Iterates this set followed by every external label whose name is not
    /// already present here.
    pub fn merged_with<'a>(&'a self, external: &'a Labels) -> impl Iterator<Item = &'a Label> {
        self.labels
            .iter()
            .chain(external.iter().filter(move |l| !self.has(&l.name)))
    }

    /// Removes all labels, keeping the allocation.
    pub(crate) fn clear(&mut self) {
        self.labels.clear();
    }

    /// Replaces the contents with a copy of `other`, reusing the allocation.
    pub(crate) fn copy_from(&mut self, other: &Labels) {
        self.labels.clear();
        self.labels.extend(other.labels.iter().cloned());
    }

    /// Consumes the set and returns the underlying labels.
    pub fn into_vec(self) -> Vec<Label> {
        self.labels
    }
}

impl FromIterator<Label> for Labels {
    fn from_iter<T: IntoIterator<Item = Label>>(iter: T) -> Self {
        Self::new(iter.into_iter().collect())
    }
}

impl<'a> IntoIterator for &'a Labels {
    type Item = &'a Label;
    type IntoIter = std::slice::Iter<'a, Label>;

    fn into_iter(self) -> Self::IntoIter {
        self.labels.iter()
    }
}

impl fmt::Display for Labels {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("{")?;
        for (i, label) in self.labels.iter().enumerate() {
            if i > 0 {
                f.write_str(", ")?;
            }
            write!(f, "{}={:?}", label.name, label.value)?;
        }
        f.write_str("}")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_labels_sorted_on_construction() {
        let labels = Labels::from_pairs([("job", "api"), ("__name__", "up"), ("env", "prod")]);
        let names: Vec<&str> = labels.iter().map(|l| l.name.as_str()).collect();
        assert_eq!(names, vec!["__name__", "env", "job"]);
        assert_eq!(labels.metric_name(), Some("up"));
    }

    #[test]
    fn test_hash_is_order_independent() {
        let a = Labels::from_pairs([("a", "1"), ("b", "2")]);
        let b = Labels::from_pairs([("b", "2"), ("a", "1")]);
        assert_eq!(a.hash(), b.hash());
    }

    #[test]
    fn test_hash_distinguishes_name_value_boundary() {
        let a = Labels::from_pairs([("ab", "c")]);
        let b = Labels::from_pairs([("a", "bc")]);
        assert_ne!(a.hash(), b.hash());
    }

    #[test]
    fn test_merged_with_skips_existing_names() {
        let series = Labels::from_pairs([("label_0", "0"), ("label_1", "1")]);
        let external = Labels::from_pairs([("bar", ""), ("foo", "bar"), ("label_0", "skipped")]);

        let merged: Vec<(&str, &str)> = series
            .merged_with(&external)
            .map(|l| (l.name.as_str(), l.value.as_str()))
            .collect();

        assert_eq!(
            merged,
            vec![("label_0", "0"), ("label_1", "1"), ("bar", ""), ("foo", "bar")]
        );
    }

    #[test]
    fn test_display() {
        let labels = Labels::from_pairs([("a", "x")]);
        assert_eq!(labels.to_string(), "{a=\"x\"}");
    }
}
