// crates/ar-dedup/src/policy.rs
//! Decides which archive members to drop.
//!
//! Only names in the candidate set are considered. For every candidate that
//! occurs more than once, the first occurrence in file order is dropped and
//! every later one is kept, so three copies become two, not one.

use std::collections::{BTreeSet, HashMap};

/// Objects bundled by both whisper-rs-sys and llama-cpp-sys-2.
pub const GGML_OBJECTS: [&str; 4] = [
    "ggml.c.o",
    "ggml-alloc.c.o",
    "ggml-backend.c.o",
    "ggml-quants.c.o",
];

/// Member names that are subject to deduplication.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CandidateSet {
    label: String,
    names: BTreeSet<String>,
}

impl CandidateSet {
    pub fn new<I, S>(label: &str, names: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            label: label.to_string(),
            names: names.into_iter().map(Into::into).collect(),
        }
    }

    /// Word used in diagnostics, e.g. "ggml" in "Removing 2 ggml objects".
    pub fn label(&self) -> &str {
        &self.label
    }

    pub fn contains(&self, name: &str) -> bool {
        self.names.contains(name)
    }

    pub fn is_empty(&self) -> bool {
        self.names.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &str> {
        self.names.iter().map(String::as_str)
    }
}

impl Default for CandidateSet {
    fn default() -> Self {
        Self::new("ggml", GGML_OBJECTS)
    }
}

/// Indices of members to leave out of the output.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DropSet {
    indices: BTreeSet<usize>,
}

impl DropSet {
    pub fn contains(&self, index: usize) -> bool {
        self.indices.contains(&index)
    }

    pub fn len(&self) -> usize {
        self.indices.len()
    }

    pub fn is_empty(&self) -> bool {
        self.indices.is_empty()
    }

    /// Dropped indices in ascending order.
    pub fn iter(&self) -> impl Iterator<Item = usize> + '_ {
        self.indices.iter().copied()
    }

    /// `(index, name)` for every dropped member, sorted by index.
    pub fn report<'a>(&self, names: &[&'a str]) -> Vec<(usize, &'a str)> {
        self.iter().map(|i| (i, names[i])).collect()
    }
}

/// Computes the drop set for `names`, given in archive order.
pub fn plan_drops(names: &[&str], candidates: &CandidateSet) -> DropSet {
    let mut counts: HashMap<&str, usize> = HashMap::new();
    for name in names.iter().copied().filter(|n| candidates.contains(n)) {
        *counts.entry(name).or_default() += 1;
    }

    let mut first_seen: HashMap<&str, usize> = HashMap::new();
    for (index, name) in names.iter().copied().enumerate() {
        if counts.get(name).is_some_and(|&c| c > 1) {
            first_seen.entry(name).or_insert(index);
        }
    }

    for (name, count) in &counts {
        if *count > 1 {
            log::debug!("{} occurs {} times, first at [{}]", name, count, first_seen[name]);
        }
    }

    DropSet {
        indices: first_seen.into_values().collect(),
    }
}
