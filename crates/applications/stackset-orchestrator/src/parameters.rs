//! Parameter sets and layered merging
//!
//! Parameters reach a stack instance from three layers:
//!
//! ```text
//! template default  <  common value  <  per-target override
//! ```
//!
//! [`merge`] folds the layers left to right so later layers win. Comparison
//! between sets is by key, never by position, so two sets holding the same
//! pairs in a different order are equal and are not reported as drift.

use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};

/// A single key/value pair as CloudFormation names it
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Parameter {
    /// Parameter key
    #[serde(rename = "ParameterKey", alias = "key")]
    pub key: String,

    /// Parameter value
    #[serde(rename = "ParameterValue", alias = "value")]
    pub value: String,
}

impl Parameter {
    /// Create a parameter
    pub fn new(key: impl Into<String>, value: impl Into<String>) -> Self {
        Self {
            key: key.into(),
            value: value.into(),
        }
    }
}

/// Ordered set of parameters with unique keys
///
/// Insertion order is kept for display and API calls. Equality ignores it.
#[derive(Debug, Clone, Default, Serialize)]
#[serde(transparent)]
pub struct ParameterSet {
    entries: Vec<Parameter>,
}

impl ParameterSet {
    /// Create an empty set
    pub fn new() -> Self {
        Self::default()
    }

    /// Build a set from pairs; a repeated key overwrites the earlier value
    pub fn from_pairs<K, V>(pairs: impl IntoIterator<Item = (K, V)>) -> Self
    where
        K: Into<String>,
        V: Into<String>,
    {
        let mut set = Self::new();
        for (key, value) in pairs {
            set.insert(key, value);
        }
        set
    }

    /// Build a set from raw parameters, rejecting repeated keys
    ///
    /// Returns the first duplicated key on failure.
    pub fn try_from_parameters(parameters: Vec<Parameter>) -> std::result::Result<Self, String> {
        let mut set = Self::new();
        for parameter in parameters {
            if set.contains_key(&parameter.key) {
                return Err(parameter.key);
            }
            set.entries.push(parameter);
        }
        Ok(set)
    }

    /// Insert or replace a value, keeping the key's original position
    pub fn insert(&mut self, key: impl Into<String>, value: impl Into<String>) -> Option<String> {
        let key = key.into();
        let value = value.into();
        match self.entries.iter_mut().find(|p| p.key == key) {
            Some(existing) => Some(std::mem::replace(&mut existing.value, value)),
            None => {
                self.entries.push(Parameter { key, value });
                None
            }
        }
    }

    /// Look up a value
    pub fn get(&self, key: &str) -> Option<&str> {
        self.entries
            .iter()
            .find(|p| p.key == key)
            .map(|p| p.value.as_str())
    }

    /// Whether the key is present
    pub fn contains_key(&self, key: &str) -> bool {
        self.entries.iter().any(|p| p.key == key)
    }

    /// Number of parameters
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Whether the set is empty
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Iterate in insertion order
    pub fn iter(&self) -> impl Iterator<Item = &Parameter> {
        self.entries.iter()
    }

    /// Keys in insertion order
    pub fn keys(&self) -> impl Iterator<Item = &str> {
        self.entries.iter().map(|p| p.key.as_str())
    }

    /// Keys not present in `declared`, in insertion order
    pub fn undeclared_keys(&self, declared: &BTreeSet<String>) -> Vec<String> {
        self.keys()
            .filter(|k| !declared.contains(*k))
            .map(str::to_string)
            .collect()
    }

    /// Subset holding only the declared keys, in insertion order
    pub fn only_declared(&self, declared: &BTreeSet<String>) -> ParameterSet {
        Self {
            entries: self
                .entries
                .iter()
                .filter(|p| declared.contains(&p.key))
                .cloned()
                .collect(),
        }
    }

    /// Sorted key/value view used for comparison
    pub fn as_map(&self) -> BTreeMap<&str, &str> {
        self.entries
            .iter()
            .map(|p| (p.key.as_str(), p.value.as_str()))
            .collect()
    }

    /// Keys whose values differ between the two sets, including keys present in only one
    pub fn changed_keys(&self, other: &ParameterSet) -> Vec<String> {
        let ours = self.as_map();
        let theirs = other.as_map();
        let keys: BTreeSet<&str> = ours.keys().chain(theirs.keys()).copied().collect();
        keys.into_iter()
            .filter(|k| ours.get(k) != theirs.get(k))
            .map(str::to_string)
            .collect()
    }

    /// Consume into raw parameters
    pub fn into_parameters(self) -> Vec<Parameter> {
        self.entries
    }
}

impl PartialEq for ParameterSet {
    fn eq(&self, other: &Self) -> bool {
        self.len() == other.len() && self.as_map() == other.as_map()
    }
}

impl Eq for ParameterSet {}

impl<'a> IntoIterator for &'a ParameterSet {
    type Item = &'a Parameter;
    type IntoIter = std::slice::Iter<'a, Parameter>;

    fn into_iter(self) -> Self::IntoIter {
        self.entries.iter()
    }
}

/// Merge the three parameter layers; later layers win per key
pub fn merge(
    template_defaults: &ParameterSet,
    common: &ParameterSet,
    overrides: &ParameterSet,
) -> ParameterSet {
    [template_defaults, common, overrides]
        .into_iter()
        .flat_map(|layer| layer.iter())
        .fold(ParameterSet::new(), |mut merged, p| {
            merged.insert(p.key.as_str(), p.value.as_str());
            merged
        })
}
