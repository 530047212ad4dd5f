use std::collections::BTreeMap;
use std::env;
use std::fs;
use std::path::Path;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

use crate::model::FieldKind;

pub const DEFAULT_SITE_NAME: &str = "edittool site";

#[derive(Debug, Clone, Deserialize, Serialize, Default, PartialEq, Eq)]
pub struct EditConfig {
    #[serde(default)]
    pub site: SiteSection,
    #[serde(default)]
    pub forms: FormsSection,
}

#[derive(Debug, Clone, Deserialize, Serialize, Default, PartialEq, Eq)]
pub struct SiteSection {
    pub name: Option<String>,
}

#[derive(Debug, Clone, Deserialize, Serialize, Default, PartialEq, Eq)]
pub struct FormsSection {
    /// Fallback widget per field kind, applied when neither the panel nor the
    /// field schema names one. Keys are `FieldKind` names (`text`, `date`, …).
    #[serde(default)]
    pub default_widgets: BTreeMap<String, String>,
}

impl EditConfig {
    /// Resolve the site name: env EDITTOOL_SITE_NAME > config > default.
    pub fn site_name(&self) -> String {
        if let Ok(value) = env::var("EDITTOOL_SITE_NAME") {
            let trimmed = value.trim().to_string();
            if !trimmed.is_empty() {
                return trimmed;
            }
        }
        self.site
            .name
            .clone()
            .unwrap_or_else(|| DEFAULT_SITE_NAME.to_string())
    }

    pub fn widget_defaults(&self) -> WidgetDefaults {
        WidgetDefaults {
            by_kind: self.forms.default_widgets.clone(),
        }
    }
}

/// Kind-keyed widget fallbacks handed to the panel bind step.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct WidgetDefaults {
    by_kind: BTreeMap<String, String>,
}

impl WidgetDefaults {
    pub fn empty() -> Self {
        Self::default()
    }

    pub fn with(mut self, kind: FieldKind, widget: &str) -> Self {
        self.by_kind
            .insert(kind.as_str().to_string(), widget.to_string());
        self
    }

    pub fn for_kind(&self, kind: FieldKind) -> Option<&str> {
        self.by_kind.get(kind.as_str()).map(String::as_str)
    }
}

/// Load and parse an EditConfig from a TOML file. Returns default if the file
/// doesn't exist; partial TOML is tolerated.
pub fn load_config(config_path: &Path) -> Result<EditConfig> {
    if !config_path.exists() {
        return Ok(EditConfig::default());
    }
    let content = fs::read_to_string(config_path)
        .with_context(|| format!("failed to read {}", config_path.display()))?;
    let parsed: EditConfig = toml::from_str(&content)
        .with_context(|| format!("failed to parse {}", config_path.display()))?;
    Ok(parsed)
}

pub fn render_default_config(site_name: &str) -> String {
    format!(
        "# edittool runtime configuration (materialized by `edittool init`)\n\n[site]\nname = \"{site_name}\"\n\n# Fallback widget per field kind, used when neither a panel nor a field\n# schema names one.\n[forms.default_widgets]\nrich_text = \"rich_text_area\"\ndate = \"date_input\"\n"
    )
}
