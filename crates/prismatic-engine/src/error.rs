use std::time::Duration;

use prismatic_contracts::batch::TransitionError;
use prismatic_contracts::models::SelectionError;
use prismatic_contracts::presets::{PresetError, PresetKind};

pub type EngineResult<T> = Result<T, EngineError>;

#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum EngineError {
    #[error("invalid batch request: {0}")]
    InvalidBatchRequest(String),

    #[error("invalid batch request: {0}")]
    NoUsableModel(#[from] SelectionError),

    #[error("batch '{0}' not found")]
    BatchNotFound(String),

    #[error("result {index} not found in batch '{batch_id}'")]
    ResultNotFound { batch_id: String, index: usize },

    #[error("result {index} in batch '{batch_id}' cannot run yet: {reason}")]
    DependencyNotSatisfied {
        batch_id: String,
        index: usize,
        reason: String,
    },

    /// Transport failure (`status == None`) or a non-success HTTP response.
    #[error("{provider} unavailable{}: {body}", status_suffix(.status))]
    ProviderUnavailable {
        provider: String,
        status: Option<u16>,
        body: String,
    },

    #[error("{provider} credentials missing; set {env_var}")]
    MissingCredentials { provider: String, env_var: String },

    #[error("prediction {id} failed: {message}")]
    PredictionFailed { id: String, message: String },

    #[error("prediction {id} was canceled")]
    PredictionCanceled { id: String },

    #[error("prediction {id} did not finish within {}s", .timeout.as_secs_f64())]
    PredictionTimeout { id: String, timeout: Duration },

    #[error("prediction {id} succeeded without usable output")]
    PredictionMissingOutput { id: String },

    #[error("model '{model}' does not support {operation}")]
    UnsupportedOperation { model: String, operation: String },

    #[error("model '{0}' is not registered")]
    ModelNotFound(String),

    #[error("{kind} preset '{key}' not found")]
    PresetNotFound { kind: PresetKind, key: String },

    #[error("prompt template '{0}' not found")]
    PromptTemplateNotFound(String),

    #[error("image '{0}' is not reachable by the provider")]
    UnreachableImage(String),

    #[error("provider returned invalid output: {0}")]
    InvalidOutput(String),

    #[error("artifact persistence failed: {0}")]
    Persistence(String),
}

impl EngineError {
    pub fn provider_unavailable(
        provider: &str,
        status: Option<u16>,
        body: impl Into<String>,
    ) -> Self {
        Self::ProviderUnavailable {
            provider: provider.to_string(),
            status,
            body: body.into(),
        }
    }

    pub fn transport(provider: &str, err: &reqwest::Error) -> Self {
        let status = err.status().map(|code| code.as_u16());
        Self::provider_unavailable(provider, status, err.to_string())
    }

    pub fn unsupported(model: &str, operation: &str) -> Self {
        Self::UnsupportedOperation {
            model: model.to_string(),
            operation: operation.to_string(),
        }
    }

    /// Prediction id carried by prediction-level failures.
    pub fn job_id(&self) -> Option<&str> {
        match self {
            Self::PredictionFailed { id, .. }
            | Self::PredictionCanceled { id }
            | Self::PredictionTimeout { id, .. }
            | Self::PredictionMissingOutput { id } => Some(id.as_str()),
            _ => None,
        }
    }
}

impl From<PresetError> for EngineError {
    fn from(err: PresetError) -> Self {
        match err {
            PresetError::PresetNotFound { kind, key } => Self::PresetNotFound { kind, key },
            PresetError::PromptTemplateNotFound(name) => Self::PromptTemplateNotFound(name),
            PresetError::Load { .. } => Self::InvalidBatchRequest(err.to_string()),
        }
    }
}

impl From<std::io::Error> for EngineError {
    fn from(err: std::io::Error) -> Self {
        Self::Persistence(err.to_string())
    }
}

fn status_suffix(status: &Option<u16>) -> String {
    status.map(|code| format!(" ({code})")).unwrap_or_default()
}

pub(crate) fn transition_error(batch_id: &str, err: TransitionError) -> EngineError {
    match err {
        TransitionError::UnknownResult(index) => EngineError::ResultNotFound {
            batch_id: batch_id.to_string(),
            index,
        },
        TransitionError::DependencyNotSatisfied { index, .. }
        | TransitionError::InvalidState { index, .. } => EngineError::DependencyNotSatisfied {
            batch_id: batch_id.to_string(),
            index,
            reason: err.to_string(),
        },
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn provider_unavailable_message_includes_status_when_known() {
        let err = EngineError::provider_unavailable("replicate", Some(502), "bad gateway");
        assert_eq!(err.to_string(), "replicate unavailable (502): bad gateway");
        let err = EngineError::provider_unavailable("replicate", None, "connection reset");
        assert_eq!(err.to_string(), "replicate unavailable: connection reset");
    }

    #[test]
    fn job_id_only_for_prediction_errors() {
        let err = EngineError::PredictionTimeout {
            id: "p-1".to_string(),
            timeout: Duration::from_secs(600),
        };
        assert_eq!(err.job_id(), Some("p-1"));
        assert_eq!(err.to_string(), "prediction p-1 did not finish within 600s");
        assert_eq!(EngineError::ModelNotFound("x".into()).job_id(), None);
    }

    #[test]
    fn preset_errors_keep_their_kind() {
        let err: EngineError = PresetError::PresetNotFound {
            kind: PresetKind::Color,
            key: "plaid".to_string(),
        }
        .into();
        assert_eq!(err.to_string(), "color preset 'plaid' not found");
        let err: EngineError = PresetError::PromptTemplateNotFound("angle".into()).into();
        assert_eq!(err, EngineError::PromptTemplateNotFound("angle".into()));
    }
}
