use std::collections::BTreeMap;

use anyhow::{Context, Result};

use crate::config::WidgetDefaults;
use crate::model::ModelLibrary;
use crate::options::FormOptionSet;
use crate::panel::bind_model;

#[derive(Debug, Clone)]
struct CacheEntry {
    source_hash: String,
    options: FormOptionSet,
}

/// Caller-owned cache of merged form options, keyed by model name. Staleness
/// is decided by the model definition's content hash; invalidation is an
/// explicit call, not a global signal.
#[derive(Debug, Clone, Default)]
pub struct OptionsCache {
    entries: BTreeMap<String, CacheEntry>,
    recomputes: usize,
}

impl OptionsCache {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Number of bind+merge runs performed so far, for reporting.
    pub fn recomputes(&self) -> usize {
        self.recomputes
    }

    /// Return the cached option set for `model`, recomputing when the model's
    /// definition hash has changed since the last merge. Bind and merge
    /// failures propagate; nothing is cached on failure.
    pub fn get_or_merge(
        &mut self,
        library: &ModelLibrary,
        defaults: &WidgetDefaults,
        model: &str,
    ) -> Result<&FormOptionSet> {
        let source_hash = library
            .source_hash(model)
            .ok_or_else(|| anyhow::anyhow!("model `{model}` is not defined"))?
            .to_string();

        let stale = self
            .entries
            .get(model)
            .is_none_or(|entry| entry.source_hash != source_hash);
        if stale {
            let form = bind_model(library, defaults, model)
                .with_context(|| format!("failed to bind panels for model `{model}`"))?;
            let options = form
                .merge_options()
                .with_context(|| format!("failed to merge form options for model `{model}`"))?;
            self.recomputes += 1;
            self.entries.insert(
                model.to_string(),
                CacheEntry {
                    source_hash,
                    options,
                },
            );
        }
        Ok(&self.entries[model].options)
    }

    /// Drop one model's cached options. Returns whether an entry existed.
    pub fn invalidate(&mut self, model: &str) -> bool {
        self.entries.remove(model).is_some()
    }

    pub fn clear(&mut self) {
        self.entries.clear();
    }
}
