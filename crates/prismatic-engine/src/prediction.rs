use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use reqwest::Client as HttpClient;
use serde::{Deserialize, Serialize};
use serde_json::{json, Map, Value};
use tokio::time::Instant;

use crate::error::{EngineError, EngineResult};
use crate::http::response_json_or_error;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PredictionStatus {
    Starting,
    Processing,
    Succeeded,
    Failed,
    #[serde(alias = "aborted")]
    Canceled,
}

impl PredictionStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Succeeded | Self::Failed | Self::Canceled)
    }
}

/// Handle to one external asynchronous job, exactly as last reported by the
/// provider.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Prediction {
    pub id: String,
    pub status: PredictionStatus,
    #[serde(default)]
    pub input: Value,
    #[serde(default)]
    pub output: Value,
    #[serde(default)]
    pub error: Option<Value>,
}

impl Prediction {
    pub fn output_urls(&self) -> Vec<String> {
        let mut urls = Vec::new();
        extract_output_urls(&self.output, &mut urls);
        urls
    }

    pub fn error_message(&self) -> String {
        match &self.error {
            Some(Value::String(message)) if !message.trim().is_empty() => {
                message.trim().to_string()
            }
            Some(Value::Null) | None => "provider reported failure without detail".to_string(),
            Some(other) => other.to_string(),
        }
    }
}

fn extract_output_urls(value: &Value, out: &mut Vec<String>) {
    match value {
        Value::String(url) => {
            let trimmed = url.trim();
            if !trimmed.is_empty()
                && (trimmed.starts_with("http") || trimmed.starts_with("data:"))
                && !out.iter().any(|existing| existing == trimmed)
            {
                out.push(trimmed.to_string());
            }
        }
        Value::Array(rows) => {
            for row in rows {
                extract_output_urls(row, out);
            }
        }
        Value::Object(obj) => {
            if let Some(url) = obj.get("url") {
                extract_output_urls(url, out);
            }
            if let Some(urls) = obj.get("urls") {
                extract_output_urls(urls, out);
            }
            if let Some(output) = obj.get("output") {
                extract_output_urls(output, out);
            }
        }
        _ => {}
    }
}

/// Raw submit/fetch calls against an asynchronous job API.
#[async_trait]
pub trait PredictionBackend: Send + Sync {
    fn provider(&self) -> &str;
    async fn submit(&self, model: &str, input: &Map<String, Value>) -> EngineResult<Prediction>;
    async fn fetch_status(&self, id: &str) -> EngineResult<Prediction>;
}

pub struct ReplicateBackend {
    api_base: String,
    api_token: Option<String>,
    http: HttpClient,
}

impl ReplicateBackend {
    pub fn new(api_base: impl Into<String>, api_token: Option<String>, http: HttpClient) -> Self {
        Self {
            api_base: api_base.into().trim().trim_end_matches('/').to_string(),
            api_token,
            http,
        }
    }

    fn token(&self) -> EngineResult<&str> {
        self.api_token
            .as_deref()
            .ok_or_else(|| EngineError::MissingCredentials {
                provider: "replicate".to_string(),
                env_var: "REPLICATE_API_TOKEN".to_string(),
            })
    }

    /// `owner/name:version` goes through `/predictions` with an explicit
    /// version; `owner/name` uses the model's official endpoint.
    fn submission(&self, model: &str, input: &Map<String, Value>) -> (String, Value) {
        match model.split_once(':') {
            Some((_, version)) => (
                format!("{}/predictions", self.api_base),
                json!({ "version": version, "input": input }),
            ),
            None => (
                format!("{}/models/{}/predictions", self.api_base, model),
                json!({ "input": input }),
            ),
        }
    }
}

#[async_trait]
impl PredictionBackend for ReplicateBackend {
    fn provider(&self) -> &str {
        "replicate"
    }

    async fn submit(&self, model: &str, input: &Map<String, Value>) -> EngineResult<Prediction> {
        let token = self.token()?;
        let (endpoint, body) = self.submission(model, input);
        let response = self
            .http
            .post(&endpoint)
            .bearer_auth(token)
            .json(&body)
            .send()
            .await
            .map_err(|err| EngineError::transport("replicate", &err))?;
        let payload = response_json_or_error("replicate", response).await?;
        parse_prediction(payload)
    }

    async fn fetch_status(&self, id: &str) -> EngineResult<Prediction> {
        let token = self.token()?;
        let response = self
            .http
            .get(format!("{}/predictions/{}", self.api_base, id))
            .bearer_auth(token)
            .send()
            .await
            .map_err(|err| EngineError::transport("replicate", &err))?;
        let payload = response_json_or_error("replicate", response).await?;
        parse_prediction(payload)
    }
}

fn parse_prediction(payload: Value) -> EngineResult<Prediction> {
    serde_json::from_value(payload).map_err(|err| {
        EngineError::InvalidOutput(format!("unrecognized prediction payload: {err}"))
    })
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct PollPolicy {
    pub initial_interval: Duration,
    pub backoff_factor: f64,
    pub max_interval: Duration,
    pub timeout: Duration,
}

impl Default for PollPolicy {
    fn default() -> Self {
        Self {
            initial_interval: Duration::from_secs(1),
            backoff_factor: 1.5,
            max_interval: Duration::from_secs(10),
            timeout: Duration::from_secs(600),
        }
    }
}

impl PollPolicy {
    pub fn next_interval(&self, current: Duration) -> Duration {
        current.mul_f64(self.backoff_factor).min(self.max_interval)
    }
}

#[derive(Clone)]
pub struct PredictionClient {
    backend: Arc<dyn PredictionBackend>,
    policy: PollPolicy,
}

impl PredictionClient {
    pub fn new(backend: Arc<dyn PredictionBackend>, policy: PollPolicy) -> Self {
        Self { backend, policy }
    }

    pub fn policy(&self) -> PollPolicy {
        self.policy
    }

    pub async fn submit(
        &self,
        model: &str,
        input: &Map<String, Value>,
    ) -> EngineResult<Prediction> {
        let mut prediction = self.backend.submit(model, input).await?;
        if prediction.input.is_null() {
            prediction.input = Value::Object(input.clone());
        }
        tracing::debug!(
            provider = self.backend.provider(),
            model,
            prediction_id = %prediction.id,
            status = ?prediction.status,
            "prediction submitted"
        );
        Ok(prediction)
    }

    pub async fn fetch_status(&self, id: &str) -> EngineResult<Prediction> {
        self.backend.fetch_status(id).await
    }

    /// Polls until the prediction settles or `timeout` elapses. Only a
    /// `succeeded` prediction with usable output is returned as `Ok`.
    pub async fn await_terminal(&self, id: &str, timeout: Duration) -> EngineResult<Prediction> {
        let deadline = Instant::now() + timeout;
        let mut interval = self.policy.initial_interval;
        let mut rounds: u32 = 0;
        loop {
            let prediction = self.fetch_status(id).await?;
            rounds += 1;
            if let Some(settled) = settle(prediction)? {
                tracing::debug!(prediction_id = id, rounds, "prediction settled");
                return Ok(settled);
            }
            let now = Instant::now();
            if now >= deadline {
                return Err(EngineError::PredictionTimeout {
                    id: id.to_string(),
                    timeout,
                });
            }
            tokio::time::sleep(interval.min(deadline - now)).await;
            interval = self.policy.next_interval(interval);
        }
    }

    /// Submit then wait with the policy's timeout.
    pub async fn run(&self, model: &str, input: &Map<String, Value>) -> EngineResult<Prediction> {
        let submitted = self.submit(model, input).await?;
        if submitted.status.is_terminal() {
            return settle(submitted)?.ok_or_else(|| {
                EngineError::InvalidOutput("terminal prediction did not settle".to_string())
            });
        }
        self.await_terminal(&submitted.id, self.policy.timeout).await
    }
}

/// `Ok(None)` while the prediction is still running.
fn settle(prediction: Prediction) -> EngineResult<Option<Prediction>> {
    match prediction.status {
        PredictionStatus::Starting | PredictionStatus::Processing => Ok(None),
        PredictionStatus::Succeeded => {
            if prediction.output_urls().is_empty() {
                return Err(EngineError::PredictionMissingOutput { id: prediction.id });
            }
            Ok(Some(prediction))
        }
        PredictionStatus::Failed => Err(EngineError::PredictionFailed {
            message: prediction.error_message(),
            id: prediction.id,
        }),
        PredictionStatus::Canceled => Err(EngineError::PredictionCanceled { id: prediction.id }),
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use std::collections::VecDeque;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Mutex;

    use super::*;

    /// Replays scripted statuses; the last entry repeats once the script runs out.
    pub(crate) struct ScriptedBackend {
        script: Mutex<VecDeque<Prediction>>,
        last: Mutex<Option<Prediction>>,
        pub(crate) submissions: Mutex<Vec<(String, Map<String, Value>)>>,
        pub(crate) fetches: AtomicUsize,
    }

    impl ScriptedBackend {
        pub(crate) fn new(script: Vec<Prediction>) -> Self {
            Self {
                script: Mutex::new(script.into()),
                last: Mutex::new(None),
                submissions: Mutex::new(Vec::new()),
                fetches: AtomicUsize::new(0),
            }
        }

        fn next(&self) -> Prediction {
            let mut script = self.script.lock().unwrap();
            let mut last = self.last.lock().unwrap();
            if let Some(next) = script.pop_front() {
                *last = Some(next.clone());
                return next;
            }
            last.clone().expect("script must not be empty")
        }
    }

    #[async_trait]
    impl PredictionBackend for ScriptedBackend {
        fn provider(&self) -> &str {
            "scripted"
        }

        async fn submit(
            &self,
            model: &str,
            input: &Map<String, Value>,
        ) -> EngineResult<Prediction> {
            self.submissions
                .lock()
                .unwrap()
                .push((model.to_string(), input.clone()));
            Ok(prediction("p-1", PredictionStatus::Starting, Value::Null))
        }

        async fn fetch_status(&self, _id: &str) -> EngineResult<Prediction> {
            self.fetches.fetch_add(1, Ordering::SeqCst);
            Ok(self.next())
        }
    }

    pub(crate) fn prediction(id: &str, status: PredictionStatus, output: Value) -> Prediction {
        Prediction {
            id: id.to_string(),
            status,
            input: Value::Null,
            output,
            error: None,
        }
    }

    fn scripted_client(script: Vec<Prediction>) -> (Arc<ScriptedBackend>, PredictionClient) {
        let backend = Arc::new(ScriptedBackend::new(script));
        let client = PredictionClient::new(backend.clone(), PollPolicy::default());
        (backend, client)
    }

    #[tokio::test(start_paused = true)]
    async fn await_terminal_backs_off_until_success() {
        let (backend, client) = scripted_client(vec![
            prediction("p-1", PredictionStatus::Starting, Value::Null),
            prediction("p-1", PredictionStatus::Processing, Value::Null),
            prediction(
                "p-1",
                PredictionStatus::Succeeded,
                json!(["https://replicate.delivery/out.png"]),
            ),
        ]);
        let started = Instant::now();
        let done = client
            .await_terminal("p-1", Duration::from_secs(60))
            .await
            .unwrap();
        assert_eq!(done.output_urls(), vec!["https://replicate.delivery/out.png"]);
        assert_eq!(backend.fetches.load(Ordering::SeqCst), 3);
        let waited = started.elapsed();
        assert!(waited >= Duration::from_millis(2500) && waited < Duration::from_millis(2600));
    }

    #[tokio::test(start_paused = true)]
    async fn await_terminal_times_out_on_stuck_prediction() {
        let (backend, client) = scripted_client(vec![prediction(
            "p-stuck",
            PredictionStatus::Processing,
            Value::Null,
        )]);
        let err = client
            .await_terminal("p-stuck", Duration::from_secs(30))
            .await
            .unwrap_err();
        assert_eq!(
            err,
            EngineError::PredictionTimeout {
                id: "p-stuck".to_string(),
                timeout: Duration::from_secs(30)
            }
        );
        assert!(backend.fetches.load(Ordering::SeqCst) > 3);
    }

    #[tokio::test(start_paused = true)]
    async fn succeeded_without_output_is_missing_output() {
        for output in [Value::Null, json!([]), json!(""), json!({})] {
            let (_, client) =
                scripted_client(vec![prediction("p-2", PredictionStatus::Succeeded, output)]);
            let err = client
                .await_terminal("p-2", Duration::from_secs(5))
                .await
                .unwrap_err();
            assert_eq!(
                err,
                EngineError::PredictionMissingOutput {
                    id: "p-2".to_string()
                }
            );
        }
    }

    #[tokio::test(start_paused = true)]
    async fn failed_and_canceled_surface_as_errors() {
        let mut failed = prediction("p-3", PredictionStatus::Failed, Value::Null);
        failed.error = Some(json!("NSFW content detected"));
        let (_, failing) = scripted_client(vec![failed]);
        assert_eq!(
            failing.await_terminal("p-3", Duration::from_secs(5)).await,
            Err(EngineError::PredictionFailed {
                id: "p-3".to_string(),
                message: "NSFW content detected".to_string()
            })
        );

        let (_, canceled) =
            scripted_client(vec![prediction("p-4", PredictionStatus::Canceled, Value::Null)]);
        assert_eq!(
            canceled.await_terminal("p-4", Duration::from_secs(5)).await,
            Err(EngineError::PredictionCanceled {
                id: "p-4".to_string()
            })
        );
    }

    #[tokio::test(start_paused = true)]
    async fn run_records_submitted_input() {
        let (backend, client) = scripted_client(vec![prediction(
            "p-1",
            PredictionStatus::Succeeded,
            json!({"url": "https://replicate.delivery/a.png"}),
        )]);
        let mut input = Map::new();
        input.insert("prompt".to_string(), json!("a chair"));
        let done = client.run("owner/model", &input).await.unwrap();
        assert_eq!(done.output_urls(), vec!["https://replicate.delivery/a.png"]);
        let submissions = backend.submissions.lock().unwrap();
        assert_eq!(submissions[0].0, "owner/model");
        assert_eq!(submissions[0].1["prompt"], json!("a chair"));
    }

    #[test]
    fn poll_interval_grows_and_caps() {
        let policy = PollPolicy::default();
        let mut interval = policy.initial_interval;
        let mut seen = Vec::new();
        for _ in 0..8 {
            seen.push(interval.as_millis());
            interval = policy.next_interval(interval);
        }
        assert_eq!(seen, vec![1000, 1500, 2250, 3375, 5062, 7593, 10000, 10000]);
    }

    #[test]
    fn output_urls_walk_nested_shapes() {
        let pred = prediction(
            "p",
            PredictionStatus::Succeeded,
            json!([
                "https://a/1.png",
                {"url": "https://a/2.png"},
                {"output": ["https://a/1.png", "not-a-url"]}
            ]),
        );
        assert_eq!(pred.output_urls(), vec!["https://a/1.png", "https://a/2.png"]);
    }

    #[test]
    fn replicate_payload_parses_and_maps_aborted() -> anyhow::Result<()> {
        let parsed = parse_prediction(json!({
            "id": "xyz",
            "status": "aborted",
            "input": {"prompt": "p"},
            "output": null,
            "error": null,
            "urls": {"get": "https://api.replicate.com/v1/predictions/xyz"}
        }))?;
        assert_eq!(parsed.status, PredictionStatus::Canceled);
        assert!(parsed.status.is_terminal());
        assert_eq!(parsed.input["prompt"], json!("p"));
        Ok(())
    }

    #[test]
    fn replicate_submission_routes_by_identifier() {
        let backend = ReplicateBackend::new(
            "https://api.replicate.com/v1/",
            Some("t".to_string()),
            HttpClient::new(),
        );
        let input = Map::new();
        let (endpoint, body) = backend.submission("black-forest-labs/flux-kontext-pro", &input);
        assert_eq!(
            endpoint,
            "https://api.replicate.com/v1/models/black-forest-labs/flux-kontext-pro/predictions"
        );
        assert!(body.get("version").is_none());

        let (endpoint, body) = backend.submission("stability-ai/sdxl:39ed52f2", &input);
        assert_eq!(endpoint, "https://api.replicate.com/v1/predictions");
        assert_eq!(body["version"], json!("39ed52f2"));
    }

    #[tokio::test]
    async fn replicate_without_token_reports_missing_credentials() {
        let backend =
            ReplicateBackend::new("https://api.replicate.com/v1", None, HttpClient::new());
        let err = backend.fetch_status("abc").await.unwrap_err();
        assert!(matches!(err, EngineError::MissingCredentials { .. }));
    }
}
