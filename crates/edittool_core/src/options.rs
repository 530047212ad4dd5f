use std::collections::BTreeMap;

use serde::Serialize;
use thiserror::Error;

/// Category names are the wire contract with the form-construction side.
pub const CATEGORY_FIELDS: &str = "fields";
pub const CATEGORY_WIDGETS: &str = "widgets";
pub const CATEGORY_FIELD_PERMISSIONS: &str = "field_permissions";
pub const CATEGORY_INLINE_FORMS: &str = "inline_forms";

#[derive(Debug, Error, PartialEq, Eq)]
pub enum MergeError {
    #[error("don't know how to merge {left} with {right} under option category `{category}`")]
    Incompatible {
        category: String,
        left: &'static str,
        right: &'static str,
    },
}

/// One option contribution. The shape decides the combination rule.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(untagged)]
pub enum OptionValue {
    Sequence(Vec<String>),
    Mapping(BTreeMap<String, String>),
    Nested(BTreeMap<String, FormOptionSet>),
}

impl OptionValue {
    pub fn shape(&self) -> &'static str {
        match self {
            Self::Sequence(_) => "a sequence",
            Self::Mapping(_) => "a mapping",
            Self::Nested(_) => "a nested option set",
        }
    }
}

/// Aggregated form configuration keyed by category name.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct FormOptionSet {
    #[serde(flatten)]
    categories: BTreeMap<String, OptionValue>,
}

impl FormOptionSet {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_empty(&self) -> bool {
        self.categories.is_empty()
    }

    pub fn get(&self, category: &str) -> Option<&OptionValue> {
        self.categories.get(category)
    }

    pub fn categories(&self) -> impl Iterator<Item = (&String, &OptionValue)> {
        self.categories.iter()
    }

    pub fn fields(&self) -> &[String] {
        match self.categories.get(CATEGORY_FIELDS) {
            Some(OptionValue::Sequence(items)) => items,
            _ => &[],
        }
    }

    /// Set a category outright. Used while building single-node contributions;
    /// combined sets go through `merge_from`.
    pub fn set(&mut self, category: &str, value: OptionValue) {
        self.categories.insert(category.to_string(), value);
    }

    pub fn push_field(&mut self, name: &str) {
        let entry = self
            .categories
            .entry(CATEGORY_FIELDS.to_string())
            .or_insert_with(|| OptionValue::Sequence(Vec::new()));
        if let OptionValue::Sequence(items) = entry
            && !items.iter().any(|item| item == name)
        {
            items.push(name.to_string());
        }
    }

    pub fn insert_mapping_entry(&mut self, category: &str, key: &str, value: &str) {
        let entry = self
            .categories
            .entry(category.to_string())
            .or_insert_with(|| OptionValue::Mapping(BTreeMap::new()));
        if let OptionValue::Mapping(map) = entry {
            map.insert(key.to_string(), value.to_string());
        }
    }

    pub fn insert_nested(&mut self, category: &str, key: &str, nested: FormOptionSet) {
        let entry = self
            .categories
            .entry(category.to_string())
            .or_insert_with(|| OptionValue::Nested(BTreeMap::new()));
        if let OptionValue::Nested(map) = entry {
            map.insert(key.to_string(), nested);
        }
    }

    /// Fold another contribution into this set using the per-shape rules:
    /// sequences concatenate preserving first appearance, mappings union with
    /// last-write-wins, nested sets merge recursively per key. A shape
    /// mismatch under one category is a configuration error and fails loudly.
    pub fn merge_from(&mut self, other: FormOptionSet) -> Result<(), MergeError> {
        for (category, incoming) in other.categories {
            match self.categories.get_mut(&category) {
                None => {
                    self.categories.insert(category, incoming);
                }
                Some(existing) => merge_values(&category, existing, incoming)?,
            }
        }
        Ok(())
    }

    pub fn merged(mut self, other: FormOptionSet) -> Result<FormOptionSet, MergeError> {
        self.merge_from(other)?;
        Ok(self)
    }
}

fn merge_values(
    category: &str,
    existing: &mut OptionValue,
    incoming: OptionValue,
) -> Result<(), MergeError> {
    match (existing, incoming) {
        (OptionValue::Sequence(left), OptionValue::Sequence(right)) => {
            for item in right {
                if !left.iter().any(|existing| *existing == item) {
                    left.push(item);
                }
            }
            Ok(())
        }
        (OptionValue::Mapping(left), OptionValue::Mapping(right)) => {
            left.extend(right);
            Ok(())
        }
        (OptionValue::Nested(left), OptionValue::Nested(right)) => {
            for (key, nested) in right {
                match left.get_mut(&key) {
                    None => {
                        left.insert(key, nested);
                    }
                    Some(existing_nested) => existing_nested.merge_from(nested)?,
                }
            }
            Ok(())
        }
        (existing, incoming) => Err(MergeError::Incompatible {
            category: category.to_string(),
            left: existing.shape(),
            right: incoming.shape(),
        }),
    }
}
