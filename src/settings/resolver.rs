//! # Settings Resolver
//!
//! Merge foglia-per-foglia di override sparsi sopra i default tipizzati.
//!
//! ## Regole di merge:
//! - Ordine: `defaults → override del sito → override per-asset` (ordine di dichiarazione)
//! - Last-writer-wins per foglia, mai per sotto-albero
//! - Le foglie array vengono **accodate**; un valore già presente non viene duplicato,
//!   così `resolve(resolve(o)) == resolve(o)`
//! - Chiavi sconosciute o foglie del tipo sbagliato vengono ignorate in risoluzione
//!   (la validazione le rifiuta prima della scrittura)
//!
//! ## Diff:
//! `diff(override)` produce un albero di booleani che marca le foglie diverse dal
//! default; `count_leaves()` dà il numero di override da mostrare.

use crate::error::{SettingsIssue, SettingsProblem, SettingsValidationError};
use crate::settings::pattern::UrlPattern;
use crate::settings::schema::{ResolvedSettings, ENUM_LEAVES, RANGE_LEAVES};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::collections::BTreeMap;
use std::sync::OnceLock;
use tracing::warn;

/// Sparse override bound to a URL pattern
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AssetOverride {
    pub pattern: String,
    pub settings: Value,
}

impl AssetOverride {
    pub fn new(pattern: &str, settings: Value) -> Self {
        Self {
            pattern: pattern.to_string(),
            settings,
        }
    }

    pub fn matches(&self, url: &str) -> bool {
        UrlPattern::new(&self.pattern).matches(url)
    }
}

/// Tree of booleans marking which leaves deviate from the defaults
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(untagged)]
pub enum SettingsDiff {
    Leaf(bool),
    Section(BTreeMap<String, SettingsDiff>),
}

impl SettingsDiff {
    /// Number of leaves that differ from the default
    pub fn count_leaves(&self) -> usize {
        match self {
            Self::Leaf(changed) => usize::from(*changed),
            Self::Section(children) => children.values().map(Self::count_leaves).sum(),
        }
    }

    /// Lookup by dotted path (`"css.purge"`)
    pub fn is_changed(&self, path: &str) -> bool {
        let mut node = self;
        for segment in path.split('.') {
            match node {
                Self::Section(children) => match children.get(segment) {
                    Some(child) => node = child,
                    None => return false,
                },
                Self::Leaf(_) => return false,
            }
        }
        match node {
            Self::Leaf(changed) => *changed,
            Self::Section(_) => node.count_leaves() > 0,
        }
    }
}

/// Defaults as a JSON tree, the schema every override is checked against
pub fn defaults_tree() -> &'static Value {
    static DEFAULTS: OnceLock<Value> = OnceLock::new();
    DEFAULTS.get_or_init(|| {
        serde_json::to_value(ResolvedSettings::default()).unwrap_or_else(|_| Value::Object(Map::new()))
    })
}

/// Check an override payload, collecting every offending path
pub fn validate(override_tree: &Value) -> Result<(), SettingsValidationError> {
    let mut issues = Vec::new();

    match (defaults_tree(), override_tree) {
        (Value::Object(schema), Value::Object(given)) => walk(schema, given, "", &mut issues),
        (_, other) => issues.push(SettingsIssue {
            path: "$".to_string(),
            problem: SettingsProblem::WrongType {
                expected: "object".to_string(),
                found: kind_name(other).to_string(),
            },
        }),
    }

    if issues.is_empty() {
        Ok(())
    } else {
        Err(SettingsValidationError { issues })
    }
}

fn walk(schema: &Map<String, Value>, given: &Map<String, Value>, prefix: &str, issues: &mut Vec<SettingsIssue>) {
    for (key, value) in given {
        let path = join_path(prefix, key);
        match schema.get(key) {
            None => issues.push(SettingsIssue {
                path,
                problem: SettingsProblem::UnknownKey,
            }),
            Some(Value::Object(child_schema)) => match value {
                Value::Object(child) => walk(child_schema, child, &path, issues),
                other => issues.push(wrong_type(path, "object", other)),
            },
            Some(default) => check_leaf(&path, default, value, issues),
        }
    }
}

fn check_leaf(path: &str, default: &Value, value: &Value, issues: &mut Vec<SettingsIssue>) {
    if kind_name(default) != kind_name(value) {
        issues.push(wrong_type(path.to_string(), kind_name(default), value));
        return;
    }

    match value {
        Value::Array(items) => {
            for (index, item) in items.iter().enumerate() {
                if !item.is_string() {
                    issues.push(wrong_type(format!("{}[{}]", path, index), "string", item));
                }
            }
        }
        Value::String(s) => {
            if let Some((_, allowed)) = ENUM_LEAVES.iter().find(|(p, _)| *p == path) {
                if !allowed.contains(&s.as_str()) {
                    issues.push(SettingsIssue {
                        path: path.to_string(),
                        problem: SettingsProblem::UnknownVariant {
                            allowed: allowed.iter().map(|a| a.to_string()).collect(),
                        },
                    });
                }
            }
        }
        Value::Number(n) => {
            let Some(number) = n.as_u64() else {
                issues.push(SettingsIssue {
                    path: path.to_string(),
                    problem: SettingsProblem::WrongType {
                        expected: "non-negative integer".to_string(),
                        found: n.to_string(),
                    },
                });
                return;
            };
            if let Some((_, min, max)) = RANGE_LEAVES.iter().find(|(p, _, _)| *p == path) {
                if number < *min || number > *max {
                    issues.push(SettingsIssue {
                        path: path.to_string(),
                        problem: SettingsProblem::OutOfRange { min: *min, max: *max },
                    });
                }
            }
        }
        _ => {}
    }
}

fn leaf_accepts(path: &str, default: &Value, value: &Value) -> bool {
    let mut issues = Vec::new();
    check_leaf(path, default, value, &mut issues);
    issues.is_empty()
}

fn wrong_type(path: String, expected: &str, found: &Value) -> SettingsIssue {
    SettingsIssue {
        path,
        problem: SettingsProblem::WrongType {
            expected: expected.to_string(),
            found: kind_name(found).to_string(),
        },
    }
}

fn kind_name(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "boolean",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "array",
        Value::Object(_) => "object",
    }
}

fn join_path(prefix: &str, key: &str) -> String {
    if prefix.is_empty() {
        key.to_string()
    } else {
        format!("{}.{}", prefix, key)
    }
}

/// Merge `overlay` into `target`, guided by the defaults schema
fn merge_into(target: &mut Map<String, Value>, schema: &Map<String, Value>, overlay: &Map<String, Value>, prefix: &str) {
    for (key, value) in overlay {
        let Some(default) = schema.get(key) else {
            continue;
        };
        let path = join_path(prefix, key);

        match (default, value) {
            (Value::Object(child_schema), Value::Object(child_overlay)) => {
                let entry = target.entry(key.clone()).or_insert_with(|| default.clone());
                if let Value::Object(child_target) = entry {
                    merge_into(child_target, child_schema, child_overlay, &path);
                }
            }
            (Value::Array(_), Value::Array(items)) => {
                let entry = target.entry(key.clone()).or_insert_with(|| Value::Array(Vec::new()));
                if let Value::Array(existing) = entry {
                    for item in items.iter().filter(|i| i.is_string()) {
                        if !existing.contains(item) {
                            existing.push(item.clone());
                        }
                    }
                }
            }
            (Value::Object(_), _) => {}
            _ => {
                if leaf_accepts(&path, default, value) {
                    target.insert(key.clone(), value.clone());
                }
            }
        }
    }
}

fn resolve_layers<'a>(layers: impl Iterator<Item = &'a Value>) -> ResolvedSettings {
    let defaults = defaults_tree();
    let mut merged = defaults.clone();

    if let (Value::Object(target), Value::Object(schema)) = (&mut merged, defaults) {
        for layer in layers {
            if let Value::Object(overlay) = layer {
                merge_into(target, schema, overlay, "");
            }
        }
    }

    serde_json::from_value(merged).unwrap_or_else(|e| {
        warn!("Resolved settings failed to deserialize, using defaults: {}", e);
        ResolvedSettings::default()
    })
}

/// Resolve `defaults → site → asset overrides` (already selected, declaration order)
pub fn resolve(site_override: &Value, asset_overrides: &[AssetOverride]) -> ResolvedSettings {
    resolve_layers(std::iter::once(site_override).chain(asset_overrides.iter().map(|o| &o.settings)))
}

/// Resolve the settings that apply to one asset URL
pub fn resolve_for_url(site_override: &Value, asset_overrides: &[AssetOverride], url: &str) -> ResolvedSettings {
    resolve_layers(
        std::iter::once(site_override).chain(
            asset_overrides
                .iter()
                .filter(|o| o.matches(url))
                .map(|o| &o.settings),
        ),
    )
}

/// Resolved tree re-expressed as an override payload
pub fn to_override(settings: &ResolvedSettings) -> Value {
    serde_json::to_value(settings).unwrap_or_else(|_| Value::Object(Map::new()))
}

/// Which leaves of `override_tree` deviate from the defaults
pub fn diff(override_tree: &Value) -> SettingsDiff {
    let resolved = to_override(&resolve(override_tree, &[]));
    diff_values(defaults_tree(), &resolved)
}

/// Leaf-by-leaf comparison between two sparse revisions
pub fn diff_revisions(before: &Value, after: &Value) -> SettingsDiff {
    let before = to_override(&resolve(before, &[]));
    let after = to_override(&resolve(after, &[]));
    diff_values(&before, &after)
}

fn diff_values(base: &Value, current: &Value) -> SettingsDiff {
    match base {
        Value::Object(children) => SettingsDiff::Section(
            children
                .iter()
                .map(|(key, child)| {
                    let other = current.get(key).unwrap_or(child);
                    (key.clone(), diff_values(child, other))
                })
                .collect(),
        ),
        leaf => SettingsDiff::Leaf(leaf != current),
    }
}
