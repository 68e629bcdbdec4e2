use std::env;
use std::fmt;
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use crate::prediction::PollPolicy;

pub const DEFAULT_REPLICATE_API_BASE: &str = "https://api.replicate.com/v1";
pub const DEFAULT_OPENAI_API_BASE: &str = "https://api.openai.com/v1";
pub const DEFAULT_MODEL: &str = "flux-kontext-pro";

/// What happens to pending color results when their angle result fails.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum DependencyFailurePolicy {
    /// Fail the dependents with the angle's error so the batch can complete.
    #[default]
    Propagate,
    /// Leave dependents pending; the batch never completes.
    LeavePending,
}

impl FromStr for DependencyFailurePolicy {
    type Err = String;

    fn from_str(raw: &str) -> Result<Self, Self::Err> {
        match raw.trim().to_ascii_lowercase().replace('-', "_").as_str() {
            "propagate" | "fail" => Ok(Self::Propagate),
            "leave_pending" | "pending" => Ok(Self::LeavePending),
            other => Err(format!("unknown dependency failure policy '{other}'")),
        }
    }
}

impl fmt::Display for DependencyFailurePolicy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Propagate => f.write_str("propagate"),
            Self::LeavePending => f.write_str("leave_pending"),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct EngineConfig {
    pub replicate_api_base: String,
    pub replicate_api_token: Option<String>,
    pub openai_api_base: String,
    pub openai_api_key: Option<String>,
    /// Base used to turn relative image URLs into ones a provider can fetch.
    pub public_base_url: Option<String>,
    pub artifact_dir: PathBuf,
    pub artifact_url_prefix: String,
    pub max_concurrent_jobs: usize,
    pub poll: PollPolicy,
    pub batch_ttl: Duration,
    pub angle_model: String,
    pub color_model: String,
    pub on_angle_failure: DependencyFailurePolicy,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            replicate_api_base: DEFAULT_REPLICATE_API_BASE.to_string(),
            replicate_api_token: None,
            openai_api_base: DEFAULT_OPENAI_API_BASE.to_string(),
            openai_api_key: None,
            public_base_url: None,
            artifact_dir: PathBuf::from("./artifacts"),
            artifact_url_prefix: "/artifacts".to_string(),
            max_concurrent_jobs: 4,
            poll: PollPolicy::default(),
            batch_ttl: Duration::from_secs(3600),
            angle_model: DEFAULT_MODEL.to_string(),
            color_model: DEFAULT_MODEL.to_string(),
            on_angle_failure: DependencyFailurePolicy::default(),
        }
    }
}

impl EngineConfig {
    pub fn from_env() -> Self {
        Self::from_lookup(|key| env::var(key).ok())
    }

    /// Builds a config from any key lookup; blank values count as unset and
    /// unparsable values keep the default.
    pub fn from_lookup<F>(lookup: F) -> Self
    where
        F: Fn(&str) -> Option<String>,
    {
        let get = |key: &str| {
            lookup(key)
                .map(|value| value.trim().to_string())
                .filter(|value| !value.is_empty())
        };
        let defaults = Self::default();
        let poll_defaults = defaults.poll;

        let initial_ms = parse_or(
            "PRISMATIC_POLL_INITIAL_MS",
            get("PRISMATIC_POLL_INITIAL_MS"),
            poll_defaults.initial_interval.as_millis() as u64,
        );
        let max_ms = parse_or(
            "PRISMATIC_POLL_MAX_MS",
            get("PRISMATIC_POLL_MAX_MS"),
            poll_defaults.max_interval.as_millis() as u64,
        );
        let timeout_secs = parse_or(
            "PRISMATIC_PREDICTION_TIMEOUT_SECS",
            get("PRISMATIC_PREDICTION_TIMEOUT_SECS"),
            poll_defaults.timeout.as_secs(),
        );

        Self {
            replicate_api_base: get("REPLICATE_API_BASE")
                .map(|value| value.trim_end_matches('/').to_string())
                .unwrap_or(defaults.replicate_api_base),
            replicate_api_token: get("REPLICATE_API_TOKEN").or_else(|| get("REPLICATE_API_KEY")),
            openai_api_base: get("OPENAI_API_BASE")
                .map(|value| value.trim_end_matches('/').to_string())
                .unwrap_or(defaults.openai_api_base),
            openai_api_key: get("OPENAI_API_KEY"),
            public_base_url: get("PRISMATIC_PUBLIC_BASE_URL")
                .map(|value| value.trim_end_matches('/').to_string()),
            artifact_dir: get("PRISMATIC_ARTIFACT_DIR")
                .map(PathBuf::from)
                .unwrap_or(defaults.artifact_dir),
            artifact_url_prefix: get("PRISMATIC_ARTIFACT_URL_PREFIX")
                .map(|value| value.trim_end_matches('/').to_string())
                .unwrap_or(defaults.artifact_url_prefix),
            max_concurrent_jobs: parse_or(
                "PRISMATIC_MAX_CONCURRENT_JOBS",
                get("PRISMATIC_MAX_CONCURRENT_JOBS"),
                defaults.max_concurrent_jobs,
            )
            .max(1),
            poll: PollPolicy {
                initial_interval: Duration::from_millis(initial_ms.max(1)),
                backoff_factor: poll_defaults.backoff_factor,
                max_interval: Duration::from_millis(max_ms.max(initial_ms.max(1))),
                timeout: Duration::from_secs(timeout_secs),
            },
            batch_ttl: Duration::from_secs(parse_or(
                "PRISMATIC_BATCH_TTL_SECS",
                get("PRISMATIC_BATCH_TTL_SECS"),
                defaults.batch_ttl.as_secs(),
            )),
            angle_model: get("PRISMATIC_ANGLE_MODEL").unwrap_or(defaults.angle_model),
            color_model: get("PRISMATIC_COLOR_MODEL").unwrap_or(defaults.color_model),
            on_angle_failure: parse_or(
                "PRISMATIC_ON_ANGLE_FAILURE",
                get("PRISMATIC_ON_ANGLE_FAILURE"),
                defaults.on_angle_failure,
            ),
        }
    }

    pub fn with_replicate_token(mut self, token: impl Into<String>) -> Self {
        self.replicate_api_token = Some(token.into());
        self
    }

    pub fn with_openai_key(mut self, key: impl Into<String>) -> Self {
        self.openai_api_key = Some(key.into());
        self
    }

    pub fn with_public_base_url(mut self, url: impl Into<String>) -> Self {
        self.public_base_url = Some(url.into().trim_end_matches('/').to_string());
        self
    }

    pub fn with_artifact_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.artifact_dir = dir.into();
        self
    }

    pub fn with_max_concurrent_jobs(mut self, limit: usize) -> Self {
        self.max_concurrent_jobs = limit.max(1);
        self
    }

    pub fn with_poll_policy(mut self, poll: PollPolicy) -> Self {
        self.poll = poll;
        self
    }

    pub fn with_batch_ttl(mut self, ttl: Duration) -> Self {
        self.batch_ttl = ttl;
        self
    }

    pub fn with_models(
        mut self,
        angle_model: impl Into<String>,
        color_model: impl Into<String>,
    ) -> Self {
        self.angle_model = angle_model.into();
        self.color_model = color_model.into();
        self
    }

    pub fn with_dependency_failure_policy(mut self, policy: DependencyFailurePolicy) -> Self {
        self.on_angle_failure = policy;
        self
    }
}

fn parse_or<T>(key: &str, raw: Option<String>, default: T) -> T
where
    T: FromStr + fmt::Display,
{
    let Some(raw) = raw else {
        return default;
    };
    match raw.parse::<T>() {
        Ok(value) => value,
        Err(_) => {
            tracing::warn!(key, value = %raw, default = %default, "ignoring invalid config value");
            default
        }
    }
}
