use std::fmt;
use std::path::Path;

use indexmap::IndexMap;
use serde::{Deserialize, Serialize};

pub const ANGLE_TEMPLATE: &str = "angle";
pub const COLOR_TEMPLATE: &str = "color";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PresetKind {
    Angle,
    Color,
}

impl fmt::Display for PresetKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Angle => f.write_str("angle"),
            Self::Color => f.write_str("color"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum PresetError {
    #[error("{kind} preset '{key}' not found")]
    PresetNotFound { kind: PresetKind, key: String },
    #[error("prompt template '{0}' not found")]
    PromptTemplateNotFound(String),
    #[error("failed to load presets from {path}: {message}")]
    Load { path: String, message: String },
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Preset {
    pub key: String,
    pub label: String,
    pub description: String,
    /// Additional template variables, exposed as `{<kind>_<name>}`.
    #[serde(default)]
    pub extra: IndexMap<String, String>,
}

impl Preset {
    pub fn new(key: &str, label: &str, description: &str) -> Self {
        Self {
            key: key.to_string(),
            label: label.to_string(),
            description: description.to_string(),
            extra: IndexMap::new(),
        }
    }
}

/// Read-only lookup of angle/color presets and prompt templates.
pub trait PresetStore: Send + Sync {
    fn angle(&self, key: &str) -> Result<Preset, PresetError>;
    fn color(&self, key: &str) -> Result<Preset, PresetError>;
    fn template(&self, name: &str) -> Result<String, PresetError>;
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct StaticPresetStore {
    #[serde(default)]
    pub angles: IndexMap<String, Preset>,
    #[serde(default)]
    pub colors: IndexMap<String, Preset>,
    #[serde(default)]
    pub templates: IndexMap<String, String>,
}

#[derive(Deserialize)]
struct PresetFile {
    #[serde(default)]
    angles: Vec<Preset>,
    #[serde(default)]
    colors: Vec<Preset>,
    #[serde(default)]
    templates: IndexMap<String, String>,
}

impl StaticPresetStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_angle(mut self, preset: Preset) -> Self {
        self.angles.insert(preset.key.clone(), preset);
        self
    }

    pub fn with_color(mut self, preset: Preset) -> Self {
        self.colors.insert(preset.key.clone(), preset);
        self
    }

    pub fn with_template(mut self, name: &str, template: &str) -> Self {
        self.templates.insert(name.to_string(), template.to_string());
        self
    }

    pub fn angle_keys(&self) -> Vec<String> {
        self.angles.keys().cloned().collect()
    }

    pub fn color_keys(&self) -> Vec<String> {
        self.colors.keys().cloned().collect()
    }

    /// Parses `{"angles": [..], "colors": [..], "templates": {..}}`.
    /// Templates missing from the document fall back to the built-in ones.
    pub fn from_json_str(raw: &str) -> Result<Self, PresetError> {
        Self::parse(raw, "<inline>")
    }

    pub fn from_json_file(path: &Path) -> Result<Self, PresetError> {
        let label = path.display().to_string();
        let raw = std::fs::read_to_string(path).map_err(|err| PresetError::Load {
            path: label.clone(),
            message: err.to_string(),
        })?;
        Self::parse(&raw, &label)
    }

    fn parse(raw: &str, label: &str) -> Result<Self, PresetError> {
        let file: PresetFile = serde_json::from_str(raw).map_err(|err| PresetError::Load {
            path: label.to_string(),
            message: err.to_string(),
        })?;
        let mut store = Self::new();
        for preset in file.angles {
            store = store.with_angle(preset);
        }
        for preset in file.colors {
            store = store.with_color(preset);
        }
        store.templates = builtin_templates();
        for (name, template) in file.templates {
            store.templates.insert(name, template);
        }
        Ok(store)
    }

    pub fn builtin() -> Self {
        let mut store = Self::new()
            .with_angle(Preset::new(
                "front",
                "front",
                "straight-on view facing the camera at eye level",
            ))
            .with_angle(Preset::new(
                "three-quarter",
                "three-quarter",
                "rotated roughly 45 degrees so the front and one side are visible",
            ))
            .with_angle(Preset::new(
                "side",
                "side profile",
                "full 90 degree profile view from the subject's left",
            ))
            .with_angle(Preset::new(
                "back",
                "back",
                "view from directly behind the subject",
            ))
            .with_angle(Preset::new(
                "top",
                "top-down",
                "overhead view looking straight down at the subject",
            ))
            .with_color(Preset::new("red", "red", "deep saturated crimson red"))
            .with_color(Preset::new("blue", "blue", "rich cobalt blue"))
            .with_color(Preset::new("green", "green", "forest green with muted tones"))
            .with_color(Preset::new("black", "black", "matte charcoal black"))
            .with_color(Preset::new("white", "white", "clean off-white ivory"));
        store.templates = builtin_templates();
        store
    }
}

fn builtin_templates() -> IndexMap<String, String> {
    let mut templates = IndexMap::new();
    templates.insert(
        ANGLE_TEMPLATE.to_string(),
        "Re-render the subject of the reference image from a {angle_label} viewpoint: \
         {angle_description}. Keep the subject's identity, proportions, materials and \
         lighting consistent."
            .to_string(),
    );
    templates.insert(
        COLOR_TEMPLATE.to_string(),
        "Recolor the subject of the reference image in {color_label}: {color_description}. \
         Keep the {angle_label} composition, shapes and shading unchanged."
            .to_string(),
    );
    templates
}

impl PresetStore for StaticPresetStore {
    fn angle(&self, key: &str) -> Result<Preset, PresetError> {
        self.angles
            .get(key)
            .cloned()
            .ok_or_else(|| PresetError::PresetNotFound {
                kind: PresetKind::Angle,
                key: key.to_string(),
            })
    }

    fn color(&self, key: &str) -> Result<Preset, PresetError> {
        self.colors
            .get(key)
            .cloned()
            .ok_or_else(|| PresetError::PresetNotFound {
                kind: PresetKind::Color,
                key: key.to_string(),
            })
    }

    fn template(&self, name: &str) -> Result<String, PresetError> {
        self.templates
            .get(name)
            .cloned()
            .ok_or_else(|| PresetError::PromptTemplateNotFound(name.to_string()))
    }
}

/// Template variables for a result: `{angle}`, `{angle_label}`,
/// `{angle_description}`, extras as `{angle_<name>}`, and the same for color.
pub fn prompt_variables(angle: &Preset, color: Option<&Preset>) -> IndexMap<String, String> {
    let mut vars = IndexMap::new();
    insert_preset_vars(&mut vars, PresetKind::Angle, angle);
    if let Some(color) = color {
        insert_preset_vars(&mut vars, PresetKind::Color, color);
    }
    vars
}

fn insert_preset_vars(vars: &mut IndexMap<String, String>, kind: PresetKind, preset: &Preset) {
    vars.insert(kind.to_string(), preset.key.clone());
    vars.insert(format!("{kind}_label"), preset.label.clone());
    vars.insert(format!("{kind}_description"), preset.description.clone());
    for (name, value) in &preset.extra {
        vars.insert(format!("{kind}_{name}"), value.clone());
    }
}

/// Substitutes `{name}` placeholders. Unknown placeholders and unbalanced
/// braces are left as written.
pub fn render_template(template: &str, vars: &IndexMap<String, String>) -> String {
    let mut out = String::with_capacity(template.len());
    let mut rest = template;
    while let Some(open) = rest.find('{') {
        out.push_str(&rest[..open]);
        let after = &rest[open + 1..];
        let Some(close) = after.find('}') else {
            out.push_str(&rest[open..]);
            return out;
        };
        let name = &after[..close];
        match vars.get(name) {
            Some(value) if is_placeholder_name(name) => out.push_str(value),
            _ => {
                out.push('{');
                out.push_str(name);
                out.push('}');
            }
        }
        rest = &after[close + 1..];
    }
    out.push_str(rest);
    out
}

fn is_placeholder_name(name: &str) -> bool {
    let mut chars = name.chars();
    matches!(chars.next(), Some(first) if first.is_ascii_alphabetic() || first == '_')
        && chars.all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '-')
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn render_template_substitutes_known_placeholders() {
        let store = StaticPresetStore::builtin();
        let angle = store.angle("side").unwrap();
        let color = store.color("red").unwrap();
        let vars = prompt_variables(&angle, Some(&color));
        let rendered = render_template(&store.template(COLOR_TEMPLATE).unwrap(), &vars);
        assert!(rendered.starts_with("Recolor the subject of the reference image in red:"));
        assert!(rendered.contains("Keep the side profile composition"));
        assert!(!rendered.contains('{'));
    }

    #[test]
    fn render_template_leaves_unknown_and_unbalanced_braces() {
        let mut vars = IndexMap::new();
        vars.insert("angle".to_string(), "front".to_string());
        assert_eq!(
            render_template("{angle} {mystery} {json: 1} {open", &vars),
            "front {mystery} {json: 1} {open"
        );
    }

    #[test]
    fn missing_presets_report_kind_and_key() {
        let store = StaticPresetStore::builtin();
        assert_eq!(
            store.angle("upside-down").err(),
            Some(PresetError::PresetNotFound {
                kind: PresetKind::Angle,
                key: "upside-down".to_string()
            })
        );
        assert_eq!(
            store.color("plaid").err().map(|err| err.to_string()),
            Some("color preset 'plaid' not found".to_string())
        );
        assert_eq!(
            StaticPresetStore::new().template(ANGLE_TEMPLATE).err(),
            Some(PresetError::PromptTemplateNotFound("angle".to_string()))
        );
    }

    #[test]
    fn json_presets_merge_over_builtin_templates() {
        let store = StaticPresetStore::from_json_str(
            r#"{
                "angles": [
                    {"key": "low", "label": "low angle", "description": "worm's eye",
                     "extra": {"lens": "24mm"}}
                ],
                "colors": [{"key": "teal", "label": "teal", "description": "sea teal"}],
                "templates": {"angle": "Shoot {angle_label} with a {angle_lens} lens"}
            }"#,
        )
        .unwrap();
        assert_eq!(store.angle_keys(), vec!["low"]);
        assert_eq!(store.color_keys(), vec!["teal"]);
        let angle = store.angle("low").unwrap();
        let rendered = render_template(
            &store.template(ANGLE_TEMPLATE).unwrap(),
            &prompt_variables(&angle, None),
        );
        assert_eq!(rendered, "Shoot low angle with a 24mm lens");
        assert!(store.template(COLOR_TEMPLATE).is_ok());
    }

    #[test]
    fn invalid_json_is_a_load_error() {
        let err = StaticPresetStore::from_json_str("{not json").err();
        assert!(matches!(err, Some(PresetError::Load { .. })));
    }
}
