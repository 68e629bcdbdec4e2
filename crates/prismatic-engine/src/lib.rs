pub mod artifacts;
pub mod config;
pub mod error;
mod http;
pub mod orchestrator;
pub mod prediction;
pub mod providers;
pub mod queue;
pub mod store;

use std::sync::Arc;

use prismatic_contracts::events::NotificationSink;
use prismatic_contracts::models::ModelRegistry;
use prismatic_contracts::presets::PresetStore;
use reqwest::Client as HttpClient;

pub use artifacts::{ArtifactMetadata, ArtifactStore, LocalArtifactStore, StoredArtifact};
pub use config::{DependencyFailurePolicy, EngineConfig};
pub use error::{EngineError, EngineResult};
pub use http::ImageBytes;
pub use orchestrator::{BatchOrchestrator, OrchestratorSettings};
pub use prediction::{
    PollPolicy, Prediction, PredictionBackend, PredictionClient, PredictionStatus, ReplicateBackend,
};
pub use providers::{
    DryrunProvider, EditRequest, GenerateRequest, GeneratedImage, ImageProvider, OpenAiProvider,
    ProviderOutput, ProviderTable, ReplicateProvider,
};
pub use queue::JobQueue;
pub use store::{BatchStore, MemoryBatchStore};

/// Registers every provider family against `registry`, backed by a local
/// artifact directory.
pub fn default_provider_table(config: &EngineConfig, registry: &ModelRegistry) -> ProviderTable {
    let http = HttpClient::new();
    let artifacts: Arc<dyn ArtifactStore> = Arc::new(LocalArtifactStore::new(
        config.artifact_dir.clone(),
        config.artifact_url_prefix.clone(),
    ));
    let predictions = PredictionClient::new(
        Arc::new(ReplicateBackend::new(
            config.replicate_api_base.clone(),
            config.replicate_api_token.clone(),
            http.clone(),
        )),
        config.poll,
    );
    let providers: Vec<Arc<dyn ImageProvider>> = vec![
        Arc::new(ReplicateProvider::new(
            predictions,
            artifacts.clone(),
            http.clone(),
            config.public_base_url.clone(),
        )),
        Arc::new(OpenAiProvider::new(
            config.openai_api_base.clone(),
            config.openai_api_key.clone(),
            artifacts.clone(),
            http,
            config.public_base_url.clone(),
        )),
        Arc::new(DryrunProvider::new(artifacts)),
    ];
    ProviderTable::new(registry, providers)
}

/// Wires an orchestrator with the built-in registry, the default providers
/// and an in-memory batch store. Must be called from within a tokio runtime.
pub fn build_orchestrator(
    config: &EngineConfig,
    presets: Arc<dyn PresetStore>,
    sink: Arc<dyn NotificationSink>,
) -> BatchOrchestrator {
    let registry = ModelRegistry::default();
    let providers = default_provider_table(config, &registry);
    BatchOrchestrator::new(
        OrchestratorSettings::from(config),
        registry,
        providers,
        presets,
        Arc::new(MemoryBatchStore::new()),
        sink,
    )
}
