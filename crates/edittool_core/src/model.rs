use std::collections::{BTreeMap, BTreeSet};
use std::fs;
use std::path::Path;

use anyhow::{Context, Result, bail};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use walkdir::WalkDir;

use crate::panel::PanelDef;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum FieldKind {
    Text,
    Integer,
    Boolean,
    Date,
    RichText,
    Reference,
}

impl FieldKind {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Text => "text",
            Self::Integer => "integer",
            Self::Boolean => "boolean",
            Self::Date => "date",
            Self::RichText => "rich_text",
            Self::Reference => "reference",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
pub struct FieldSchema {
    pub name: String,
    pub kind: FieldKind,
    #[serde(default)]
    pub widget: Option<String>,
    #[serde(default)]
    pub required: bool,
}

#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
pub struct RelationSchema {
    pub name: String,
    pub target: String,
}

/// One editable content model, as declared in `models/<name>.toml`.
#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
pub struct ModelSchema {
    pub name: String,
    #[serde(default)]
    pub verbose_name: Option<String>,
    /// Parent kind in the specialization chain, used by chooser kind filters.
    #[serde(default)]
    pub extends: Option<String>,
    #[serde(default)]
    pub fields: Vec<FieldSchema>,
    #[serde(default)]
    pub relations: Vec<RelationSchema>,
    #[serde(default)]
    pub panels: Vec<PanelDef>,
}

impl ModelSchema {
    pub fn field(&self, name: &str) -> Option<&FieldSchema> {
        self.fields.iter().find(|field| field.name == name)
    }

    pub fn relation(&self, name: &str) -> Option<&RelationSchema> {
        self.relations.iter().find(|relation| relation.name == name)
    }

    pub fn verbose_name(&self) -> &str {
        self.verbose_name.as_deref().unwrap_or(&self.name)
    }
}

#[derive(Debug, Clone)]
struct LoadedModel {
    schema: ModelSchema,
    source_hash: String,
    relative_path: String,
}

/// All model definitions found under the models directory, keyed by name.
#[derive(Debug, Clone, Default)]
pub struct ModelLibrary {
    models: BTreeMap<String, LoadedModel>,
}

impl ModelLibrary {
    /// Scan `models_dir` for `*.toml` definitions. A duplicate model name
    /// across files is a configuration error.
    pub fn load(models_dir: &Path) -> Result<Self> {
        let mut library = Self::default();
        if !models_dir.exists() {
            return Ok(library);
        }

        for entry in WalkDir::new(models_dir).follow_links(false) {
            let entry =
                entry.with_context(|| format!("failed to walk {}", models_dir.display()))?;
            if !entry.file_type().is_file() {
                continue;
            }
            let path = entry.path();
            if path.extension().and_then(|ext| ext.to_str()) != Some("toml") {
                continue;
            }
            let content = fs::read_to_string(path)
                .with_context(|| format!("failed to read {}", path.display()))?;
            let schema: ModelSchema = toml::from_str(&content)
                .with_context(|| format!("failed to parse model definition {}", path.display()))?;
            let relative = path
                .strip_prefix(models_dir)
                .unwrap_or(path)
                .to_string_lossy()
                .replace('\\', "/");
            library.insert_loaded(schema, compute_hash(&content), relative)?;
        }
        Ok(library)
    }

    /// Build a library from in-memory schemas. Hashes are derived from the
    /// serialized schema so cache staleness checks behave as with files.
    pub fn from_schemas(schemas: Vec<ModelSchema>) -> Result<Self> {
        let mut library = Self::default();
        for schema in schemas {
            let serialized =
                serde_json::to_string(&schema).context("failed to serialize model schema")?;
            let hash = compute_hash(&serialized);
            library.insert_loaded(schema, hash, String::new())?;
        }
        Ok(library)
    }

    fn insert_loaded(
        &mut self,
        schema: ModelSchema,
        source_hash: String,
        relative_path: String,
    ) -> Result<()> {
        if schema.name.trim().is_empty() {
            bail!("model definition {relative_path} has an empty name");
        }
        if let Some(existing) = self.models.get(&schema.name) {
            bail!(
                "duplicate model `{}` (defined in {} and {})",
                schema.name,
                existing.relative_path,
                relative_path
            );
        }
        self.models.insert(
            schema.name.clone(),
            LoadedModel {
                schema,
                source_hash,
                relative_path,
            },
        );
        Ok(())
    }

    pub fn is_empty(&self) -> bool {
        self.models.is_empty()
    }

    pub fn len(&self) -> usize {
        self.models.len()
    }

    pub fn names(&self) -> impl Iterator<Item = &String> {
        self.models.keys()
    }

    pub fn schema(&self, name: &str) -> Option<&ModelSchema> {
        self.models.get(name).map(|loaded| &loaded.schema)
    }

    pub fn source_hash(&self, name: &str) -> Option<&str> {
        self.models
            .get(name)
            .map(|loaded| loaded.source_hash.as_str())
    }

    pub fn kind_graph(&self) -> KindGraph {
        let mut graph = KindGraph::default();
        for loaded in self.models.values() {
            graph.insert(&loaded.schema.name, loaded.schema.extends.as_deref());
        }
        graph
    }
}

/// Specialization edges between model kinds (`extends` chains). A kind
/// matches a filter set when it or any ancestor kind is in the set.
#[derive(Debug, Clone, Default)]
pub struct KindGraph {
    parents: BTreeMap<String, Option<String>>,
}

impl KindGraph {
    pub fn insert(&mut self, kind: &str, extends: Option<&str>) {
        self.parents
            .insert(kind.to_string(), extends.map(str::to_string));
    }

    pub fn matches(&self, kind: &str, wanted: &BTreeSet<String>) -> bool {
        let mut seen = BTreeSet::new();
        let mut cursor = Some(kind.to_string());
        while let Some(current) = cursor {
            if wanted.contains(&current) {
                return true;
            }
            if !seen.insert(current.clone()) {
                // extends cycle; stop walking rather than loop
                return false;
            }
            cursor = self.parents.get(&current).cloned().flatten();
        }
        false
    }

    /// All known kinds matching the filter set, plus the set itself. Used to
    /// turn a specialization-aware filter into a flat `IN (...)` list.
    pub fn expand(&self, wanted: &BTreeSet<String>) -> BTreeSet<String> {
        let mut out = wanted.clone();
        for kind in self.parents.keys() {
            if self.matches(kind, wanted) {
                out.insert(kind.clone());
            }
        }
        out
    }
}

fn compute_hash(content: &str) -> String {
    let digest = Sha256::digest(content.as_bytes());
    let mut output = String::with_capacity(16);
    for byte in digest.iter().take(8) {
        output.push_str(&format!("{byte:02x}"));
    }
    output
}
