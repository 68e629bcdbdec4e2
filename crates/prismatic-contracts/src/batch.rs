use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use uuid::Uuid;

#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct BatchId(String);

impl BatchId {
    pub fn generate() -> Self {
        Self(format!("batch-{}", Uuid::new_v4().simple()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl From<&str> for BatchId {
    fn from(value: &str) -> Self {
        Self(value.to_string())
    }
}

impl From<String> for BatchId {
    fn from(value: String) -> Self {
        Self(value)
    }
}

impl fmt::Display for BatchId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BatchStatus {
    Pending,
    Processing,
    Completed,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ResultKind {
    Angle,
    Color,
}

impl ResultKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Angle => "angle",
            Self::Color => "color",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ResultStatus {
    Pending,
    Processing,
    Completed,
    Failed,
}

impl ResultStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed | Self::Failed)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Processing => "processing",
            Self::Completed => "completed",
            Self::Failed => "failed",
        }
    }
}

/// Caller-supplied description of a batch before ids and results exist.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BatchRequest {
    pub source_image_urls: Vec<String>,
    pub angles: Vec<String>,
    #[serde(default)]
    pub colors: Vec<String>,
    #[serde(default)]
    pub auto_colorize: bool,
    #[serde(default)]
    pub angle_model: Option<String>,
    #[serde(default)]
    pub color_model: Option<String>,
    #[serde(default)]
    pub params: Map<String, Value>,
}

impl BatchRequest {
    pub fn new(
        source_image_urls: Vec<String>,
        angles: Vec<String>,
        colors: Vec<String>,
        auto_colorize: bool,
    ) -> Self {
        Self {
            source_image_urls,
            angles,
            colors,
            auto_colorize,
            ..Self::default()
        }
    }

    pub fn with_angle_model(mut self, model: impl Into<String>) -> Self {
        self.angle_model = Some(model.into());
        self
    }

    pub fn with_color_model(mut self, model: impl Into<String>) -> Self {
        self.color_model = Some(model.into());
        self
    }

    pub fn with_param(mut self, key: impl Into<String>, value: Value) -> Self {
        self.params.insert(key.into(), value);
        self
    }

    /// Trims and deduplicates keys, rejecting requests that cannot start any work.
    pub fn normalize(mut self) -> Result<Self, String> {
        self.source_image_urls = normalize_keys(&self.source_image_urls, "source image url")?;
        if self.source_image_urls.is_empty() {
            return Err("at least one source image url is required".to_string());
        }
        self.angles = normalize_keys(&self.angles, "angle")?;
        if self.angles.is_empty() {
            return Err("at least one angle is required".to_string());
        }
        self.colors = normalize_keys(&self.colors, "color")?;
        Ok(self)
    }

    pub fn wants_colors(&self) -> bool {
        self.auto_colorize && !self.colors.is_empty()
    }
}

fn normalize_keys(raw: &[String], label: &str) -> Result<Vec<String>, String> {
    let mut out: Vec<String> = Vec::with_capacity(raw.len());
    for value in raw {
        let trimmed = value.trim();
        if trimmed.is_empty() {
            return Err(format!("{label} must not be blank"));
        }
        if !out.iter().any(|existing| existing == trimmed) {
            out.push(trimmed.to_string());
        }
    }
    Ok(out)
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BatchResult {
    pub index: usize,
    #[serde(rename = "type")]
    pub kind: ResultKind,
    pub angle_key: String,
    pub color_key: Option<String>,
    pub status: ResultStatus,
    pub image_url: Option<String>,
    pub thumb_url: Option<String>,
    pub error: Option<String>,
    pub job_id: Option<String>,
    /// Index of the angle result this color result waits on.
    pub depends_on: Option<usize>,
    #[serde(default)]
    pub dependents: Vec<usize>,
    pub started_at: Option<DateTime<Utc>>,
    pub finished_at: Option<DateTime<Utc>>,
}

impl BatchResult {
    fn pending(index: usize, kind: ResultKind, angle_key: &str, color_key: Option<&str>) -> Self {
        Self {
            index,
            kind,
            angle_key: angle_key.to_string(),
            color_key: color_key.map(str::to_string),
            status: ResultStatus::Pending,
            image_url: None,
            thumb_url: None,
            error: None,
            job_id: None,
            depends_on: None,
            dependents: Vec::new(),
            started_at: None,
            finished_at: None,
        }
    }

    pub fn label(&self) -> String {
        match &self.color_key {
            Some(color) => format!("{}/{}", self.angle_key, color),
            None => self.angle_key.clone(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum TransitionError {
    #[error("result {0} does not exist")]
    UnknownResult(usize),
    #[error("result {index} is {status:?}, expected {expected:?}")]
    InvalidState {
        index: usize,
        status: ResultStatus,
        expected: ResultStatus,
    },
    #[error("result {index} depends on angle result {angle_index} which is not completed")]
    DependencyNotSatisfied { index: usize, angle_index: usize },
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Batch {
    pub id: BatchId,
    pub source_image_urls: Vec<String>,
    pub angles: Vec<String>,
    pub colors: Vec<String>,
    pub auto_colorize: bool,
    pub angle_model: String,
    pub color_model: String,
    #[serde(default)]
    pub params: Map<String, Value>,
    #[serde(default)]
    pub warnings: Vec<String>,
    pub status: BatchStatus,
    pub results: Vec<BatchResult>,
    pub created_at: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,
}

impl Batch {
    /// Builds the job graph: angle results first in request order, then one
    /// color result per (angle, color) pair when colorizing is requested.
    pub fn new(
        id: BatchId,
        request: BatchRequest,
        angle_model: String,
        color_model: String,
        created_at: DateTime<Utc>,
    ) -> Self {
        let mut results: Vec<BatchResult> = request
            .angles
            .iter()
            .enumerate()
            .map(|(index, angle)| BatchResult::pending(index, ResultKind::Angle, angle, None))
            .collect();

        if request.wants_colors() {
            for angle_index in 0..request.angles.len() {
                for color in &request.colors {
                    let index = results.len();
                    let angle_key = request.angles[angle_index].clone();
                    let mut result =
                        BatchResult::pending(index, ResultKind::Color, &angle_key, Some(color));
                    result.depends_on = Some(angle_index);
                    results[angle_index].dependents.push(index);
                    results.push(result);
                }
            }
        }

        Self {
            id,
            source_image_urls: request.source_image_urls,
            angles: request.angles,
            colors: request.colors,
            auto_colorize: request.auto_colorize,
            angle_model,
            color_model,
            params: request.params,
            warnings: Vec::new(),
            status: BatchStatus::Pending,
            results,
            created_at,
            completed_at: None,
        }
    }

    pub fn result(&self, index: usize) -> Option<&BatchResult> {
        self.results.get(index)
    }

    pub fn angle_indices(&self) -> Vec<usize> {
        self.results
            .iter()
            .filter(|result| result.kind == ResultKind::Angle)
            .map(|result| result.index)
            .collect()
    }

    pub fn start(&mut self) {
        if self.status == BatchStatus::Pending {
            self.status = BatchStatus::Processing;
        }
    }

    /// Moves a pending result to processing once its dependency is satisfied.
    pub fn begin_result(
        &mut self,
        index: usize,
        now: DateTime<Utc>,
    ) -> Result<(), TransitionError> {
        let result = self
            .results
            .get(index)
            .ok_or(TransitionError::UnknownResult(index))?;
        if result.status != ResultStatus::Pending {
            return Err(TransitionError::InvalidState {
                index,
                status: result.status,
                expected: ResultStatus::Pending,
            });
        }
        if let Some(angle_index) = result.depends_on {
            let satisfied = self
                .results
                .get(angle_index)
                .map(|angle| angle.status == ResultStatus::Completed)
                .unwrap_or(false);
            if !satisfied {
                return Err(TransitionError::DependencyNotSatisfied { index, angle_index });
            }
        }
        let result = &mut self.results[index];
        result.status = ResultStatus::Processing;
        result.started_at = Some(now);
        Ok(())
    }

    /// Records success and returns the dependents that just became runnable.
    pub fn complete_result(
        &mut self,
        index: usize,
        image_url: String,
        thumb_url: String,
        job_id: Option<String>,
        now: DateTime<Utc>,
    ) -> Result<Vec<usize>, TransitionError> {
        let result = self.processing_result_mut(index)?;
        result.status = ResultStatus::Completed;
        result.image_url = Some(image_url);
        result.thumb_url = Some(thumb_url);
        result.error = None;
        if job_id.is_some() {
            result.job_id = job_id;
        }
        result.finished_at = Some(now);
        let dependents = result.dependents.clone();
        Ok(dependents
            .into_iter()
            .filter(|dependent| {
                self.results
                    .get(*dependent)
                    .map(|row| row.status == ResultStatus::Pending)
                    .unwrap_or(false)
            })
            .collect())
    }

    pub fn fail_result(
        &mut self,
        index: usize,
        error: String,
        job_id: Option<String>,
        now: DateTime<Utc>,
    ) -> Result<(), TransitionError> {
        let result = self.processing_result_mut(index)?;
        result.status = ResultStatus::Failed;
        result.error = Some(error);
        if job_id.is_some() {
            result.job_id = job_id;
        }
        result.finished_at = Some(now);
        Ok(())
    }

    /// Fails every still-pending dependent of a failed angle result.
    pub fn propagate_failure(&mut self, index: usize, now: DateTime<Utc>) -> Vec<usize> {
        let Some(angle) = self.results.get(index) else {
            return Vec::new();
        };
        if angle.status != ResultStatus::Failed {
            return Vec::new();
        }
        let cause = angle.error.clone().unwrap_or_default();
        let message = format!("angle job '{}' failed: {}", angle.angle_key, cause);
        let dependents = angle.dependents.clone();
        let mut failed = Vec::new();
        for dependent in dependents {
            let Some(row) = self.results.get_mut(dependent) else {
                continue;
            };
            if row.status != ResultStatus::Pending {
                continue;
            }
            row.status = ResultStatus::Failed;
            row.error = Some(message.clone());
            row.finished_at = Some(now);
            failed.push(dependent);
        }
        failed
    }

    pub fn all_terminal(&self) -> bool {
        self.results.iter().all(|result| result.status.is_terminal())
    }

    /// Marks the batch completed the first time every result is terminal.
    /// Returns `false` when the batch was already completed or is still running.
    pub fn try_complete(&mut self, now: DateTime<Utc>) -> bool {
        if self.status == BatchStatus::Completed || !self.all_terminal() {
            return false;
        }
        self.status = BatchStatus::Completed;
        self.completed_at = Some(now);
        true
    }

    pub fn counts(&self) -> BatchCounts {
        let mut counts = BatchCounts {
            total: self.results.len(),
            ..BatchCounts::default()
        };
        for result in &self.results {
            match result.status {
                ResultStatus::Pending => counts.pending += 1,
                ResultStatus::Processing => counts.processing += 1,
                ResultStatus::Completed => counts.completed += 1,
                ResultStatus::Failed => counts.failed += 1,
            }
        }
        counts
    }

    pub fn status_view(&self) -> BatchStatusView {
        let counts = self.counts();
        BatchStatusView {
            batch_id: self.id.clone(),
            status: self.status,
            total: counts.total,
            pending: counts.pending,
            processing: counts.processing,
            completed: counts.completed,
            failed: counts.failed,
            warnings: self.warnings.clone(),
            results: self.results.clone(),
            created_at: self.created_at,
            completed_at: self.completed_at,
        }
    }

    fn processing_result_mut(&mut self, index: usize) -> Result<&mut BatchResult, TransitionError> {
        let result = self
            .results
            .get_mut(index)
            .ok_or(TransitionError::UnknownResult(index))?;
        if result.status != ResultStatus::Processing {
            return Err(TransitionError::InvalidState {
                index,
                status: result.status,
                expected: ResultStatus::Processing,
            });
        }
        Ok(result)
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct BatchCounts {
    pub total: usize,
    pub pending: usize,
    pub processing: usize,
    pub completed: usize,
    pub failed: usize,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BatchStatusView {
    pub batch_id: BatchId,
    pub status: BatchStatus,
    pub total: usize,
    pub pending: usize,
    pub processing: usize,
    pub completed: usize,
    pub failed: usize,
    pub warnings: Vec<String>,
    pub results: Vec<BatchResult>,
    pub created_at: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,
}

#[cfg(test)]
mod tests {
    use chrono::Utc;

    use super::*;

    fn strings(values: &[&str]) -> Vec<String> {
        values.iter().map(|value| value.to_string()).collect()
    }

    fn batch(angles: &[&str], colors: &[&str], auto_colorize: bool) -> Batch {
        let request = BatchRequest::new(
            strings(&["https://cdn.example.com/source.png"]),
            strings(angles),
            strings(colors),
            auto_colorize,
        )
        .normalize()
        .unwrap();
        Batch::new(
            BatchId::from("batch-test"),
            request,
            "dryrun-image-1".to_string(),
            "dryrun-image-1".to_string(),
            Utc::now(),
        )
    }

    fn assert_completion_invariant(batch: &Batch) {
        assert_eq!(
            batch.status == BatchStatus::Completed,
            batch.all_terminal(),
            "batch status {:?} disagrees with result states",
            batch.status
        );
    }

    #[test]
    fn angles_only_request_builds_angle_results() {
        let batch = batch(&["front", "side"], &[], false);
        assert_eq!(batch.results.len(), 2);
        assert!(batch
            .results
            .iter()
            .all(|result| result.kind == ResultKind::Angle && result.color_key.is_none()));
        assert_eq!(batch.angle_indices(), vec![0, 1]);
    }

    #[test]
    fn colors_are_ignored_without_auto_colorize() {
        let batch = batch(&["front"], &["red", "blue"], false);
        assert_eq!(batch.results.len(), 1);
        assert!(batch.results[0].dependents.is_empty());
    }

    #[test]
    fn color_results_link_to_their_angle() {
        let batch = batch(&["front", "side"], &["red", "blue"], true);
        assert_eq!(batch.results.len(), 6);
        assert_eq!(batch.results[0].dependents, vec![2, 3]);
        assert_eq!(batch.results[1].dependents, vec![4, 5]);
        let labels: Vec<String> = batch.results.iter().map(BatchResult::label).collect();
        assert_eq!(
            labels,
            vec!["front", "side", "front/red", "front/blue", "side/red", "side/blue"]
        );
        assert_eq!(batch.results[4].depends_on, Some(1));
    }

    #[test]
    fn normalize_rejects_missing_angles_and_sources() {
        let no_angles = BatchRequest::new(strings(&["a.png"]), Vec::new(), Vec::new(), false);
        assert_eq!(
            no_angles.normalize().err().unwrap_or_default(),
            "at least one angle is required"
        );
        let no_sources = BatchRequest::new(Vec::new(), strings(&["front"]), Vec::new(), false);
        assert!(no_sources.normalize().is_err());
        let blank = BatchRequest::new(strings(&["a.png"]), strings(&[" "]), Vec::new(), false);
        assert!(blank.normalize().is_err());
    }

    #[test]
    fn normalize_deduplicates_preserving_order() {
        let request = BatchRequest::new(
            strings(&["a.png"]),
            strings(&["side", "front", "side"]),
            strings(&["red", " red "]),
            true,
        )
        .normalize()
        .unwrap();
        assert_eq!(request.angles, strings(&["side", "front"]));
        assert_eq!(request.colors, strings(&["red"]));
    }

    #[test]
    fn color_cannot_begin_before_angle_completes() {
        let mut batch = batch(&["front"], &["red"], true);
        let now = Utc::now();
        assert_eq!(
            batch.begin_result(1, now),
            Err(TransitionError::DependencyNotSatisfied {
                index: 1,
                angle_index: 0
            })
        );
        batch.begin_result(0, now).unwrap();
        assert!(batch.begin_result(1, now).is_err());
        assert_eq!(batch.results[1].status, ResultStatus::Pending);

        let ready = batch
            .complete_result(0, "/a/full.png".into(), "/a/thumb.jpg".into(), None, now)
            .unwrap();
        assert_eq!(ready, vec![1]);
        batch.begin_result(1, now).unwrap();
        assert_eq!(batch.results[1].status, ResultStatus::Processing);
    }

    #[test]
    fn completion_tracks_every_transition_and_fires_once() {
        let mut batch = batch(&["front", "side"], &["red"], true);
        let now = Utc::now();
        batch.start();
        assert_eq!(batch.status, BatchStatus::Processing);

        batch.begin_result(0, now).unwrap();
        assert_completion_invariant(&batch);
        batch.begin_result(1, now).unwrap();
        assert!(!batch.try_complete(now));
        assert_completion_invariant(&batch);

        batch
            .complete_result(0, "u0".into(), "t0".into(), Some("p0".into()), now)
            .unwrap();
        assert!(!batch.try_complete(now));
        assert_completion_invariant(&batch);

        batch.fail_result(1, "boom".into(), None, now).unwrap();
        assert!(!batch.try_complete(now));
        assert_eq!(batch.propagate_failure(1, now), vec![3]);
        assert!(!batch.try_complete(now));
        assert_completion_invariant(&batch);

        batch.begin_result(2, now).unwrap();
        batch
            .complete_result(2, "u2".into(), "t2".into(), None, now)
            .unwrap();
        assert!(batch.try_complete(now));
        assert_completion_invariant(&batch);
        assert!(!batch.try_complete(now));
        assert_eq!(batch.completed_at, Some(now));

        let counts = batch.counts();
        assert_eq!(counts.completed, 2);
        assert_eq!(counts.failed, 2);
        assert_eq!(
            batch.results[3].error.as_deref(),
            Some("angle job 'side' failed: boom")
        );
    }

    #[test]
    fn terminal_results_reject_further_transitions() {
        let mut batch = batch(&["front"], &[], false);
        let now = Utc::now();
        batch.begin_result(0, now).unwrap();
        batch.fail_result(0, "nope".into(), None, now).unwrap();
        assert!(batch
            .complete_result(0, "u".into(), "t".into(), None, now)
            .is_err());
        assert!(batch.begin_result(0, now).is_err());
        assert_eq!(batch.results[0].status, ResultStatus::Failed);
    }

    #[test]
    fn status_view_serializes_with_wire_names() -> anyhow::Result<()> {
        let batch = batch(&["front"], &["red"], true);
        let view = serde_json::to_value(batch.status_view())?;
        assert_eq!(view["batchId"], "batch-test");
        assert_eq!(view["status"], "pending");
        assert_eq!(view["total"], 2);
        assert_eq!(view["results"][1]["type"], "color");
        assert_eq!(view["results"][1]["angleKey"], "front");
        assert_eq!(view["results"][1]["colorKey"], "red");
        Ok(())
    }
}
