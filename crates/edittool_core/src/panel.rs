use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::config::WidgetDefaults;
use crate::model::{ModelLibrary, ModelSchema};
use crate::options::{
    CATEGORY_FIELD_PERMISSIONS, CATEGORY_INLINE_FORMS, CATEGORY_WIDGETS, FormOptionSet, MergeError,
};

#[derive(Debug, Error, PartialEq, Eq)]
pub enum BindError {
    #[error("model `{model}` is not defined")]
    UnknownModel { model: String },
    #[error("field `{field}` does not exist on model `{model}`")]
    UnknownField { model: String, field: String },
    #[error("relation `{relation}` does not exist on model `{model}`")]
    UnknownRelation { model: String, relation: String },
    #[error("inline panel for relation `{relation}` recurses into model `{model}`")]
    RecursiveInline { relation: String, model: String },
}

/// Declarative panel tree as written in a model definition file. Unbound:
/// field and relation names are not yet checked against any schema.
#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum PanelDef {
    Field {
        field: String,
        #[serde(default)]
        heading: Option<String>,
        #[serde(default)]
        widget: Option<String>,
        #[serde(default)]
        permission: Option<String>,
    },
    Group {
        #[serde(default)]
        heading: Option<String>,
        #[serde(default)]
        children: Vec<PanelDef>,
    },
    Help {
        text: String,
    },
    Inline {
        relation: String,
        #[serde(default)]
        heading: Option<String>,
        #[serde(default)]
        min: Option<u32>,
        #[serde(default)]
        max: Option<u32>,
        /// Sub-form panels; defaults to the target model's own panels.
        #[serde(default)]
        children: Vec<PanelDef>,
    },
}

/// A panel tree validated against a model schema. Binding is the only way to
/// obtain one, so "used before binding" cannot happen at runtime. Bound trees
/// are immutable and safe to share across threads for concurrent reads.
#[derive(Debug, Clone, PartialEq)]
pub enum BoundPanel {
    Field {
        name: String,
        heading: Option<String>,
        widget: Option<String>,
        permission: Option<String>,
    },
    Group {
        heading: Option<String>,
        children: Vec<BoundPanel>,
    },
    Help {
        text: String,
    },
    Inline {
        relation: String,
        target_model: String,
        heading: Option<String>,
        min: Option<u32>,
        max: Option<u32>,
        children: Vec<BoundPanel>,
    },
}

/// The full bound edit form of one model.
#[derive(Debug, Clone, PartialEq)]
pub struct BoundForm {
    pub model: String,
    pub panels: Vec<BoundPanel>,
}

impl BoundForm {
    pub fn merge_options(&self) -> Result<FormOptionSet, MergeError> {
        merge_all(&self.panels)
    }
}

/// Bind a model's declared panel tree against its schema. An empty panel
/// declaration falls back to one field panel per schema field, in schema
/// order.
pub fn bind_model(
    library: &ModelLibrary,
    defaults: &WidgetDefaults,
    model: &str,
) -> Result<BoundForm, BindError> {
    let schema = library.schema(model).ok_or_else(|| BindError::UnknownModel {
        model: model.to_string(),
    })?;
    let mut visiting = vec![model.to_string()];
    let panels = if schema.panels.is_empty() {
        default_panels(schema)
            .iter()
            .map(|def| bind_panel(def, schema, library, defaults, &mut visiting))
            .collect::<Result<Vec<_>, _>>()?
    } else {
        bind_children(&schema.panels, schema, library, defaults, &mut visiting)?
    };
    Ok(BoundForm {
        model: model.to_string(),
        panels,
    })
}

fn default_panels(schema: &ModelSchema) -> Vec<PanelDef> {
    schema
        .fields
        .iter()
        .map(|field| PanelDef::Field {
            field: field.name.clone(),
            heading: None,
            widget: None,
            permission: None,
        })
        .collect()
}

fn bind_children(
    defs: &[PanelDef],
    schema: &ModelSchema,
    library: &ModelLibrary,
    defaults: &WidgetDefaults,
    visiting: &mut Vec<String>,
) -> Result<Vec<BoundPanel>, BindError> {
    defs.iter()
        .map(|def| bind_panel(def, schema, library, defaults, visiting))
        .collect()
}

fn bind_panel(
    def: &PanelDef,
    schema: &ModelSchema,
    library: &ModelLibrary,
    defaults: &WidgetDefaults,
    visiting: &mut Vec<String>,
) -> Result<BoundPanel, BindError> {
    match def {
        PanelDef::Field {
            field,
            heading,
            widget,
            permission,
        } => {
            let field_schema =
                schema
                    .field(field)
                    .ok_or_else(|| BindError::UnknownField {
                        model: schema.name.clone(),
                        field: field.clone(),
                    })?;
            // panel override > field schema widget > configured kind default
            let resolved_widget = widget
                .clone()
                .or_else(|| field_schema.widget.clone())
                .or_else(|| defaults.for_kind(field_schema.kind).map(str::to_string));
            Ok(BoundPanel::Field {
                name: field.clone(),
                heading: heading.clone(),
                widget: resolved_widget,
                permission: permission.clone(),
            })
        }
        PanelDef::Group { heading, children } => Ok(BoundPanel::Group {
            heading: heading.clone(),
            children: bind_children(children, schema, library, defaults, visiting)?,
        }),
        PanelDef::Help { text } => Ok(BoundPanel::Help { text: text.clone() }),
        PanelDef::Inline {
            relation,
            heading,
            min,
            max,
            children,
        } => {
            let relation_schema =
                schema
                    .relation(relation)
                    .ok_or_else(|| BindError::UnknownRelation {
                        model: schema.name.clone(),
                        relation: relation.clone(),
                    })?;
            let target = library.schema(&relation_schema.target).ok_or_else(|| {
                BindError::UnknownModel {
                    model: relation_schema.target.clone(),
                }
            })?;
            if visiting.iter().any(|name| *name == target.name) {
                return Err(BindError::RecursiveInline {
                    relation: relation.clone(),
                    model: target.name.clone(),
                });
            }
            visiting.push(target.name.clone());
            let child_defs = if children.is_empty() {
                default_panels_or_declared(target)
            } else {
                children.clone()
            };
            let bound_children =
                bind_children(&child_defs, target, library, defaults, visiting);
            visiting.pop();
            Ok(BoundPanel::Inline {
                relation: relation.clone(),
                target_model: target.name.clone(),
                heading: heading.clone(),
                min: *min,
                max: *max,
                children: bound_children?,
            })
        }
    }
}

fn default_panels_or_declared(schema: &ModelSchema) -> Vec<PanelDef> {
    if schema.panels.is_empty() {
        default_panels(schema)
    } else {
        schema.panels.clone()
    }
}

/// Collect one panel node's aggregate form options. Leaves contribute their
/// own single-category entries; composites fold children in declaration
/// order. Pure: the bound tree is never mutated.
pub fn merge_options(panel: &BoundPanel) -> Result<FormOptionSet, MergeError> {
    match panel {
        BoundPanel::Field {
            name,
            widget,
            permission,
            ..
        } => {
            let mut set = FormOptionSet::new();
            set.push_field(name);
            if let Some(widget) = widget {
                set.insert_mapping_entry(CATEGORY_WIDGETS, name, widget);
            }
            if let Some(permission) = permission {
                set.insert_mapping_entry(CATEGORY_FIELD_PERMISSIONS, name, permission);
            }
            Ok(set)
        }
        BoundPanel::Group { children, .. } => merge_all(children),
        BoundPanel::Help { .. } => Ok(FormOptionSet::new()),
        BoundPanel::Inline {
            relation, children, ..
        } => {
            let mut set = FormOptionSet::new();
            set.push_field(relation);
            set.insert_nested(CATEGORY_INLINE_FORMS, relation, merge_all(children)?);
            Ok(set)
        }
    }
}

/// Fold a sibling sequence into one option set, in declaration order.
pub fn merge_all(panels: &[BoundPanel]) -> Result<FormOptionSet, MergeError> {
    let mut merged = FormOptionSet::new();
    for panel in panels {
        merged.merge_from(merge_options(panel)?)?;
    }
    Ok(merged)
}

/// Derive a unique-per-sibling identifier for each child, used downstream as
/// deterministic form-field-name prefixes. Base = heading (or field/relation
/// name) lowercased with non-alphanumerics stripped, `panel` when empty;
/// collisions get an increasing numeric suffix. Depends only on the ordered
/// children, never on hash iteration order.
pub fn child_identifiers(children: &[BoundPanel]) -> Vec<String> {
    let mut used: Vec<String> = Vec::with_capacity(children.len());
    for child in children {
        let base = slugify(identifier_base(child));
        let base = if base.is_empty() {
            "panel".to_string()
        } else {
            base
        };
        let mut candidate = base.clone();
        let mut suffix = 2usize;
        while used.iter().any(|existing| *existing == candidate) {
            candidate = format!("{base}{suffix}");
            suffix += 1;
        }
        used.push(candidate);
    }
    used
}

fn identifier_base(panel: &BoundPanel) -> &str {
    match panel {
        BoundPanel::Field { heading, name, .. } => heading.as_deref().unwrap_or(name),
        BoundPanel::Group { heading, .. } => heading.as_deref().unwrap_or(""),
        BoundPanel::Help { .. } => "",
        BoundPanel::Inline {
            heading, relation, ..
        } => heading.as_deref().unwrap_or(relation),
    }
}

fn slugify(value: &str) -> String {
    value
        .chars()
        .filter(|ch| ch.is_ascii_alphanumeric())
        .map(|ch| ch.to_ascii_lowercase())
        .collect()
}
