//! Categorical encoders fitted once per training run.
//!
//! Each encoder is a bijection between the distinct values observed in one
//! column and the codes `0..n`, assigned in lexical order. Values that were
//! not observed during fitting have no code: callers must treat that as an
//! error, never as a fallback code.

use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};

/// Bijection `category ⇄ code` for a single column.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(try_from = "Vec<String>", into = "Vec<String>")]
pub struct CategoryEncoder {
    /// Sorted, deduplicated. The index is the code.
    classes: Vec<String>,
}

impl CategoryEncoder {
    /// Fits an encoder over every value of a column.
    pub fn fit<'a, I>(values: I) -> Self
    where
        I: IntoIterator<Item = &'a str>,
    {
        let classes: BTreeSet<&str> = values.into_iter().collect();
        Self {
            classes: classes.into_iter().map(str::to_owned).collect(),
        }
    }

    pub fn encode(&self, value: &str) -> Option<usize> {
        self.classes
            .binary_search_by(|class| class.as_str().cmp(value))
            .ok()
    }

    pub fn decode(&self, code: usize) -> Option<&str> {
        self.classes.get(code).map(String::as_str)
    }

    pub fn classes(&self) -> &[String] {
        &self.classes
    }

    pub fn len(&self) -> usize {
        self.classes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.classes.is_empty()
    }
}

impl TryFrom<Vec<String>> for CategoryEncoder {
    type Error = String;

    fn try_from(classes: Vec<String>) -> Result<Self, Self::Error> {
        if let Some(pair) = classes.windows(2).find(|pair| pair[0] >= pair[1]) {
            return Err(format!(
                "encoder classes must be sorted and unique, found '{}' before '{}'",
                pair[0], pair[1]
            ));
        }
        Ok(Self { classes })
    }
}

impl From<CategoryEncoder> for Vec<String> {
    fn from(encoder: CategoryEncoder) -> Self {
        encoder.classes
    }
}

/// The encoders of one training run, keyed by column name.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct EncoderSet {
    encoders: BTreeMap<String, CategoryEncoder>,
}

impl EncoderSet {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, column: impl Into<String>, encoder: CategoryEncoder) {
        self.encoders.insert(column.into(), encoder);
    }

    pub fn get(&self, column: &str) -> Option<&CategoryEncoder> {
        self.encoders.get(column)
    }

    /// Code of `value` in `column`, `None` when either is unknown.
    pub fn encode(&self, column: &str, value: &str) -> Option<usize> {
        self.encoders.get(column)?.encode(value)
    }

    pub fn columns(&self) -> impl Iterator<Item = &str> {
        self.encoders.keys().map(String::as_str)
    }

    pub fn len(&self) -> usize {
        self.encoders.len()
    }

    pub fn is_empty(&self) -> bool {
        self.encoders.is_empty()
    }
}
