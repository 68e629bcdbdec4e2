use super::registry::{ModelRegistry, ModelSpec};

/// Why a requested model was passed over.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FallbackReason {
    Unregistered,
    /// Registered, but lacks the capability or was refused by the caller.
    Unsuitable,
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum SelectionError {
    #[error("no usable model supports '{capability}'")]
    NoUsableModel { capability: String },
}

#[derive(Debug, Clone, PartialEq)]
pub struct ModelSelection {
    pub model: ModelSpec,
    pub requested: String,
    pub capability: String,
    pub fallback: Option<FallbackReason>,
}

impl ModelSelection {
    /// Batch warning for a fallback, naming the job kind that is affected.
    pub fn warning(&self, jobs: &str) -> Option<String> {
        let reason = match self.fallback? {
            FallbackReason::Unregistered => {
                format!("Requested model '{}' is not registered.", self.requested)
            }
            FallbackReason::Unsuitable => format!(
                "Requested model '{}' unavailable for capability '{}'.",
                self.requested, self.capability
            ),
        };
        Some(format!(
            "{reason} Using '{}' for {jobs} jobs.",
            self.model.name
        ))
    }
}

/// Resolves a requested model key against the registry, falling back to the
/// first registered model that has the capability and passes `usable`.
#[derive(Debug, Clone)]
pub struct ModelSelector {
    registry: ModelRegistry,
}

impl ModelSelector {
    pub fn new(registry: ModelRegistry) -> Self {
        Self { registry }
    }

    pub fn select(
        &self,
        requested: &str,
        capability: &str,
        usable: impl Fn(&ModelSpec) -> bool,
    ) -> Result<ModelSelection, SelectionError> {
        let fits = |model: &ModelSpec| model.supports(capability) && usable(model);
        let fallback = match self.registry.get(requested) {
            Some(model) if fits(model) => {
                return Ok(ModelSelection {
                    model: model.clone(),
                    requested: requested.to_string(),
                    capability: capability.to_string(),
                    fallback: None,
                })
            }
            Some(_) => FallbackReason::Unsuitable,
            None => FallbackReason::Unregistered,
        };
        let model = self
            .registry
            .by_capability(capability)
            .into_iter()
            .find(|model| usable(model))
            .ok_or_else(|| SelectionError::NoUsableModel {
                capability: capability.to_string(),
            })?;
        Ok(ModelSelection {
            model,
            requested: requested.to_string(),
            capability: capability.to_string(),
            fallback: Some(fallback),
        })
    }
}

#[cfg(test)]
mod tests {
    use indexmap::IndexMap;
    use serde_json::Map;

    use super::*;
    use crate::models::{CAPABILITY_EDIT, CAPABILITY_GENERATE};

    fn model(name: &str, capabilities: &[&str]) -> ModelSpec {
        ModelSpec {
            name: name.to_string(),
            provider: "dryrun".to_string(),
            external_model: name.to_string(),
            capabilities: capabilities.iter().map(|item| item.to_string()).collect(),
            default_params: Map::new(),
        }
    }

    fn selector() -> ModelSelector {
        let mut models = IndexMap::new();
        models.insert(
            "painter".to_string(),
            model("painter", &[CAPABILITY_GENERATE]),
        );
        models.insert(
            "editor".to_string(),
            model("editor", &[CAPABILITY_GENERATE, CAPABILITY_EDIT]),
        );
        models.insert(
            "retoucher".to_string(),
            model("retoucher", &[CAPABILITY_EDIT]),
        );
        ModelSelector::new(ModelRegistry::new(Some(models)))
    }

    #[test]
    fn capable_request_is_kept_without_warning() {
        let selection = selector()
            .select("retoucher", CAPABILITY_EDIT, |_| true)
            .unwrap();
        assert_eq!(selection.model.name, "retoucher");
        assert_eq!(selection.fallback, None);
        assert_eq!(selection.warning("angle"), None);
    }

    #[test]
    fn model_without_capability_falls_back_to_first_editor() {
        let selection = selector()
            .select("painter", CAPABILITY_EDIT, |_| true)
            .unwrap();
        assert_eq!(selection.model.name, "editor");
        assert_eq!(selection.fallback, Some(FallbackReason::Unsuitable));
        assert_eq!(
            selection.warning("color").as_deref(),
            Some(
                "Requested model 'painter' unavailable for capability 'edit'. \
                 Using 'editor' for color jobs."
            )
        );
    }

    #[test]
    fn unregistered_request_is_reported_as_such() {
        let selection = selector()
            .select("imaginary", CAPABILITY_EDIT, |_| true)
            .unwrap();
        assert_eq!(selection.fallback, Some(FallbackReason::Unregistered));
        assert_eq!(
            selection.warning("angle").as_deref(),
            Some("Requested model 'imaginary' is not registered. Using 'editor' for angle jobs.")
        );
    }

    #[test]
    fn refused_models_are_skipped() {
        let selection = selector()
            .select("editor", CAPABILITY_EDIT, |model| model.name != "editor")
            .unwrap();
        assert_eq!(selection.model.name, "retoucher");
        assert_eq!(selection.fallback, Some(FallbackReason::Unsuitable));
    }

    #[test]
    fn nothing_usable_is_an_error() {
        let err = selector()
            .select("editor", CAPABILITY_EDIT, |_| false)
            .unwrap_err();
        assert_eq!(
            err,
            SelectionError::NoUsableModel {
                capability: "edit".to_string()
            }
        );
        assert_eq!(err.to_string(), "no usable model supports 'edit'");
    }
}
