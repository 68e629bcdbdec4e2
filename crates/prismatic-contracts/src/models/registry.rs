use indexmap::IndexMap;
use serde_json::{json, Map, Value};

pub const CAPABILITY_GENERATE: &str = "image";
pub const CAPABILITY_EDIT: &str = "edit";

#[derive(Debug, Clone, PartialEq)]
pub struct ModelSpec {
    pub name: String,
    pub provider: String,
    /// Identifier understood by the provider, e.g. `black-forest-labs/flux-kontext-pro`.
    pub external_model: String,
    pub capabilities: Vec<String>,
    pub default_params: Map<String, Value>,
}

impl ModelSpec {
    pub fn supports(&self, capability: &str) -> bool {
        self.capabilities.iter().any(|item| item == capability)
    }

    pub fn can_edit(&self) -> bool {
        self.supports(CAPABILITY_EDIT)
    }

    /// Model defaults with caller params layered on top.
    pub fn merged_params(&self, overrides: &Map<String, Value>) -> Map<String, Value> {
        let mut merged = self.default_params.clone();
        for (key, value) in overrides {
            merged.insert(key.clone(), value.clone());
        }
        merged
    }
}

#[derive(Debug, Clone)]
pub struct ModelRegistry {
    models: IndexMap<String, ModelSpec>,
}

impl ModelRegistry {
    pub fn new(models: Option<IndexMap<String, ModelSpec>>) -> Self {
        Self {
            models: models.unwrap_or_else(default_models),
        }
    }

    pub fn get(&self, name: &str) -> Option<&ModelSpec> {
        self.models.get(name)
    }

    pub fn list(&self) -> impl Iterator<Item = &ModelSpec> {
        self.models.values()
    }

    pub fn by_capability(&self, capability: &str) -> Vec<ModelSpec> {
        self.models
            .values()
            .filter(|model| model.supports(capability))
            .cloned()
            .collect()
    }
}

impl Default for ModelRegistry {
    fn default() -> Self {
        Self::new(None)
    }
}

fn default_models() -> IndexMap<String, ModelSpec> {
    let mut map = IndexMap::new();

    let mut insert = |name: &str,
                      provider: &str,
                      external_model: &str,
                      capabilities: &[&str],
                      default_params: Value| {
        map.insert(
            name.to_string(),
            ModelSpec {
                name: name.to_string(),
                provider: provider.to_string(),
                external_model: external_model.to_string(),
                capabilities: capabilities
                    .iter()
                    .map(|item| (*item).to_string())
                    .collect(),
                default_params: default_params.as_object().cloned().unwrap_or_default(),
            },
        );
    };

    insert(
        "flux-kontext-pro",
        "replicate",
        "black-forest-labs/flux-kontext-pro",
        &["image", "edit"],
        json!({
            "aspect_ratio": "match_input_image",
            "output_format": "png",
            "safety_tolerance": 2,
        }),
    );
    insert(
        "flux-kontext-max",
        "replicate",
        "black-forest-labs/flux-kontext-max",
        &["image", "edit"],
        json!({
            "aspect_ratio": "match_input_image",
            "output_format": "png",
            "safety_tolerance": 2,
        }),
    );
    insert(
        "nano-banana",
        "replicate",
        "google/nano-banana",
        &["image", "edit"],
        json!({ "output_format": "png" }),
    );
    insert(
        "seedream-4",
        "replicate",
        "bytedance/seedream-4",
        &["image", "edit"],
        json!({ "size": "2K", "max_images": 1 }),
    );
    insert(
        "flux-schnell",
        "replicate",
        "black-forest-labs/flux-schnell",
        &["image"],
        json!({ "num_outputs": 1, "output_format": "png", "go_fast": true }),
    );
    insert(
        "gpt-image-1",
        "openai",
        "gpt-image-1",
        &["image", "edit"],
        json!({ "size": "1024x1024", "quality": "high" }),
    );
    insert(
        "dall-e-3",
        "openai",
        "dall-e-3",
        &["image"],
        json!({ "size": "1024x1024", "response_format": "url" }),
    );
    insert(
        "dryrun-image-1",
        "dryrun",
        "dryrun-image-1",
        &["image", "edit"],
        json!({ "size": "256x256" }),
    );

    map
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;

    #[test]
    fn default_registry_exposes_edit_models_first() {
        let registry = ModelRegistry::default();
        let editors = registry.by_capability(CAPABILITY_EDIT);
        assert_eq!(
            editors.first().map(|model| model.name.as_str()),
            Some("flux-kontext-pro")
        );
        assert!(editors.iter().all(ModelSpec::can_edit));
        let schnell = registry.get("flux-schnell").unwrap();
        assert!(!schnell.can_edit());
        assert!(schnell.supports(CAPABILITY_GENERATE));
    }

    #[test]
    fn merged_params_prefers_overrides() {
        let registry = ModelRegistry::default();
        let model = registry.get("flux-kontext-pro").cloned().unwrap();
        let mut overrides = Map::new();
        overrides.insert("output_format".to_string(), json!("jpg"));
        overrides.insert("seed".to_string(), json!(7));
        let merged = model.merged_params(&overrides);
        assert_eq!(merged["output_format"], json!("jpg"));
        assert_eq!(merged["seed"], json!(7));
        assert_eq!(merged["aspect_ratio"], json!("match_input_image"));
    }
}
