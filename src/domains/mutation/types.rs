use std::collections::BTreeMap;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::FromRow;
use uuid::Uuid;

use crate::errors::{DomainError, ValidationError};

/// The operation a mutation replays against the remote store.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MutationType {
    Create,
    Update,
    Delete,
}

impl MutationType {
    pub fn as_str(&self) -> &'static str {
        match self {
            MutationType::Create => "create",
            MutationType::Update => "update",
            MutationType::Delete => "delete",
        }
    }
}

impl FromStr for MutationType {
    type Err = DomainError;
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "create" => Ok(MutationType::Create),
            "update" => Ok(MutationType::Update),
            "delete" => Ok(MutationType::Delete),
            _ => Err(DomainError::Validation(ValidationError::invalid_value(
                "mutation_type",
                &format!("Invalid MutationType string: {}", s),
            ))),
        }
    }
}

impl From<MutationType> for String {
    fn from(t: MutationType) -> Self {
        t.as_str().to_string()
    }
}

/// Delivery state of a queued mutation.
///
/// `Pending` is the initial state. `Completed` and `Failed` are terminal;
/// `Unknown` is a defensive catch-all that is never produced by the engine
/// and is ignored by both workers.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
#[serde(rename_all = "snake_case")]
pub enum SyncStatus {
    Pending,
    InProgress,
    Completed,
    Failed,
    MediaUploadPending,
    MediaUploadInProgress,
    MediaUploadAwaitingRetry,
    Unknown,
}

impl SyncStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            SyncStatus::Pending => "pending",
            SyncStatus::InProgress => "in_progress",
            SyncStatus::Completed => "completed",
            SyncStatus::Failed => "failed",
            SyncStatus::MediaUploadPending => "media_upload_pending",
            SyncStatus::MediaUploadInProgress => "media_upload_in_progress",
            SyncStatus::MediaUploadAwaitingRetry => "media_upload_awaiting_retry",
            SyncStatus::Unknown => "unknown",
        }
    }

    /// Decode a stored status string. Unrecognized values map to `Unknown`
    /// rather than erroring so that a corrupt row cannot wedge the queue;
    /// workers leave `Unknown` rows untouched.
    pub fn from_db(s: &str) -> SyncStatus {
        match s {
            "pending" => SyncStatus::Pending,
            "in_progress" => SyncStatus::InProgress,
            "completed" => SyncStatus::Completed,
            "failed" => SyncStatus::Failed,
            "media_upload_pending" => SyncStatus::MediaUploadPending,
            "media_upload_in_progress" => SyncStatus::MediaUploadInProgress,
            "media_upload_awaiting_retry" => SyncStatus::MediaUploadAwaitingRetry,
            _ => SyncStatus::Unknown,
        }
    }

    /// Lawful forward edges of the status state machine. Everything else is a
    /// programming error and is rejected with `DomainError::IllegalTransition`.
    pub fn can_transition_to(self, to: SyncStatus) -> bool {
        use SyncStatus::*;
        matches!(
            (self, to),
            (Pending, InProgress)
                | (InProgress, Completed)
                | (InProgress, MediaUploadPending)
                | (InProgress, Failed)
                | (MediaUploadPending, MediaUploadInProgress)
                | (MediaUploadInProgress, Completed)
                | (MediaUploadInProgress, MediaUploadAwaitingRetry)
                | (MediaUploadAwaitingRetry, MediaUploadPending)
        )
    }

    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            SyncStatus::Completed | SyncStatus::Failed | SyncStatus::Unknown
        )
    }

    /// Data-phase work outstanding (the incomplete-uploads set).
    pub fn awaiting_data_upload(self) -> bool {
        matches!(
            self,
            SyncStatus::Pending | SyncStatus::InProgress | SyncStatus::Failed
        )
    }

    /// Media-phase work outstanding (the incomplete-media set).
    pub fn awaiting_media_upload(self) -> bool {
        matches!(
            self,
            SyncStatus::MediaUploadPending
                | SyncStatus::MediaUploadInProgress
                | SyncStatus::MediaUploadAwaitingRetry
        )
    }
}

impl From<SyncStatus> for String {
    fn from(status: SyncStatus) -> Self {
        status.as_str().to_string()
    }
}

/// The kind of task a submission delta answers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskType {
    Text,
    Number,
    Date,
    Time,
    MultipleChoice,
    Photo,
    DropPin,
    DrawArea,
    CaptureLocation,
}

/// One field-level change within a submission. A `Photo` delta carries the
/// local file name of the captured image instead of a final value.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ValueDelta {
    pub task_id: String,
    pub task_type: TaskType,
    pub value: serde_json::Value,
}

impl ValueDelta {
    pub fn is_photo(&self) -> bool {
        self.task_type == TaskType::Photo
    }

    /// Local file name carried by a photo delta, if any.
    pub fn photo_file_name(&self) -> Option<&str> {
        if self.is_photo() {
            self.value.as_str()
        } else {
            None
        }
    }
}

/// A queued edit to a location of interest.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LocationOfInterestMutation {
    pub id: Uuid,
    pub mutation_type: MutationType,
    pub sync_status: SyncStatus,
    pub survey_id: String,
    pub location_of_interest_id: String,
    pub user_id: String,
    pub job_id: String,
    pub collection_id: String,
    pub retry_count: i64,
    pub last_error: Option<String>,
    pub client_timestamp: DateTime<Utc>,
}

/// A queued edit to a submission, carrying the field-level deltas to replay.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SubmissionMutation {
    pub id: Uuid,
    pub mutation_type: MutationType,
    pub sync_status: SyncStatus,
    pub survey_id: String,
    pub location_of_interest_id: String,
    pub user_id: String,
    pub job_id: String,
    pub collection_id: String,
    pub submission_id: String,
    pub deltas: Vec<ValueDelta>,
    /// Remote keys of successfully uploaded photo deltas, keyed by task id.
    /// Written only when every photo delta has uploaded, so a retry replays
    /// the whole mutation idempotently.
    pub uploaded_media: BTreeMap<String, String>,
    pub retry_count: i64,
    pub last_error: Option<String>,
    pub client_timestamp: DateTime<Utc>,
}

/// A queued, not-yet-confirmed local edit awaiting delivery.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum Mutation {
    LocationOfInterest(LocationOfInterestMutation),
    Submission(SubmissionMutation),
}

impl Mutation {
    pub fn id(&self) -> Uuid {
        match self {
            Mutation::LocationOfInterest(m) => m.id,
            Mutation::Submission(m) => m.id,
        }
    }

    pub fn kind_str(&self) -> &'static str {
        match self {
            Mutation::LocationOfInterest(_) => "location_of_interest",
            Mutation::Submission(_) => "submission",
        }
    }

    pub fn mutation_type(&self) -> MutationType {
        match self {
            Mutation::LocationOfInterest(m) => m.mutation_type,
            Mutation::Submission(m) => m.mutation_type,
        }
    }

    pub fn sync_status(&self) -> SyncStatus {
        match self {
            Mutation::LocationOfInterest(m) => m.sync_status,
            Mutation::Submission(m) => m.sync_status,
        }
    }

    pub fn survey_id(&self) -> &str {
        match self {
            Mutation::LocationOfInterest(m) => &m.survey_id,
            Mutation::Submission(m) => &m.survey_id,
        }
    }

    pub fn location_of_interest_id(&self) -> &str {
        match self {
            Mutation::LocationOfInterest(m) => &m.location_of_interest_id,
            Mutation::Submission(m) => &m.location_of_interest_id,
        }
    }

    pub fn user_id(&self) -> &str {
        match self {
            Mutation::LocationOfInterest(m) => &m.user_id,
            Mutation::Submission(m) => &m.user_id,
        }
    }

    pub fn job_id(&self) -> &str {
        match self {
            Mutation::LocationOfInterest(m) => &m.job_id,
            Mutation::Submission(m) => &m.job_id,
        }
    }

    pub fn collection_id(&self) -> &str {
        match self {
            Mutation::LocationOfInterest(m) => &m.collection_id,
            Mutation::Submission(m) => &m.collection_id,
        }
    }

    pub fn retry_count(&self) -> i64 {
        match self {
            Mutation::LocationOfInterest(m) => m.retry_count,
            Mutation::Submission(m) => m.retry_count,
        }
    }

    pub fn last_error(&self) -> Option<&str> {
        match self {
            Mutation::LocationOfInterest(m) => m.last_error.as_deref(),
            Mutation::Submission(m) => m.last_error.as_deref(),
        }
    }

    pub fn client_timestamp(&self) -> DateTime<Utc> {
        match self {
            Mutation::LocationOfInterest(m) => m.client_timestamp,
            Mutation::Submission(m) => m.client_timestamp,
        }
    }

    pub fn deltas(&self) -> &[ValueDelta] {
        match self {
            Mutation::LocationOfInterest(_) => &[],
            Mutation::Submission(m) => &m.deltas,
        }
    }

    pub fn photo_deltas(&self) -> Vec<&ValueDelta> {
        self.deltas().iter().filter(|d| d.is_photo()).collect()
    }

    /// Whether this mutation still owes a media phase after the data push.
    pub fn has_photo_deltas(&self) -> bool {
        self.deltas().iter().any(|d| d.is_photo())
    }
}

/// Per-status row counts, published to `watch()` subscribers after every
/// committed store change.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct StatusCounts(BTreeMap<SyncStatus, i64>);

impl StatusCounts {
    pub fn insert(&mut self, status: SyncStatus, count: i64) {
        self.0.insert(status, count);
    }

    pub fn get(&self, status: SyncStatus) -> i64 {
        self.0.get(&status).copied().unwrap_or(0)
    }

    pub fn total(&self) -> i64 {
        self.0.values().sum()
    }
}

fn parse_uuid(uuid_str: &str, field_name: &str) -> Result<Uuid, DomainError> {
    Uuid::parse_str(uuid_str).map_err(|_| {
        DomainError::Validation(ValidationError::format(
            field_name,
            &format!("Invalid UUID format: {}", uuid_str),
        ))
    })
}

fn parse_datetime(dt_str: &str, field_name: &str) -> Result<DateTime<Utc>, DomainError> {
    DateTime::parse_from_rfc3339(dt_str)
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(|_| {
            DomainError::Validation(ValidationError::format(
                field_name,
                &format!("Invalid RFC3339 format: {}", dt_str),
            ))
        })
}

#[derive(Debug, Clone, FromRow)]
pub struct MutationRow {
    pub id: String,
    pub kind: String,
    pub mutation_type: String,
    pub sync_status: String,
    pub survey_id: String,
    pub location_of_interest_id: String,
    pub user_id: String,
    pub job_id: String,
    pub collection_id: String,
    pub submission_id: Option<String>,
    pub deltas: String,
    pub uploaded_media: String,
    pub retry_count: i64,
    pub last_error: Option<String>,
    pub client_timestamp: String,
    pub last_attempt_at: Option<String>,
}

impl TryFrom<MutationRow> for Mutation {
    type Error = DomainError;

    fn try_from(row: MutationRow) -> Result<Self, Self::Error> {
        let id = parse_uuid(&row.id, "mutations.id")?;
        let mutation_type = MutationType::from_str(&row.mutation_type)?;
        let sync_status = SyncStatus::from_db(&row.sync_status);
        let client_timestamp = parse_datetime(&row.client_timestamp, "mutations.client_timestamp")?;

        match row.kind.as_str() {
            "location_of_interest" => Ok(Mutation::LocationOfInterest(LocationOfInterestMutation {
                id,
                mutation_type,
                sync_status,
                survey_id: row.survey_id,
                location_of_interest_id: row.location_of_interest_id,
                user_id: row.user_id,
                job_id: row.job_id,
                collection_id: row.collection_id,
                retry_count: row.retry_count,
                last_error: row.last_error,
                client_timestamp,
            })),
            "submission" => {
                let deltas: Vec<ValueDelta> = serde_json::from_str(&row.deltas).map_err(|e| {
                    DomainError::Validation(ValidationError::format(
                        "mutations.deltas",
                        &format!("Invalid delta JSON: {}", e),
                    ))
                })?;
                let uploaded_media: BTreeMap<String, String> =
                    serde_json::from_str(&row.uploaded_media).map_err(|e| {
                        DomainError::Validation(ValidationError::format(
                            "mutations.uploaded_media",
                            &format!("Invalid uploaded media JSON: {}", e),
                        ))
                    })?;
                let submission_id = row.submission_id.ok_or_else(|| {
                    DomainError::Validation(ValidationError::required("mutations.submission_id"))
                })?;
                Ok(Mutation::Submission(SubmissionMutation {
                    id,
                    mutation_type,
                    sync_status,
                    survey_id: row.survey_id,
                    location_of_interest_id: row.location_of_interest_id,
                    user_id: row.user_id,
                    job_id: row.job_id,
                    collection_id: row.collection_id,
                    submission_id,
                    deltas,
                    uploaded_media,
                    retry_count: row.retry_count,
                    last_error: row.last_error,
                    client_timestamp,
                }))
            }
            other => Err(DomainError::Validation(ValidationError::invalid_value(
                "mutations.kind",
                &format!("Unknown mutation kind: {}", other),
            ))),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn lawful_edges_are_accepted() {
        use SyncStatus::*;
        let lawful = [
            (Pending, InProgress),
            (InProgress, Completed),
            (InProgress, MediaUploadPending),
            (InProgress, Failed),
            (MediaUploadPending, MediaUploadInProgress),
            (MediaUploadInProgress, Completed),
            (MediaUploadInProgress, MediaUploadAwaitingRetry),
            (MediaUploadAwaitingRetry, MediaUploadPending),
        ];
        for (from, to) in lawful {
            assert!(from.can_transition_to(to), "{:?} -> {:?}", from, to);
        }
    }

    #[test]
    fn unlawful_edges_are_rejected() {
        use SyncStatus::*;
        let unlawful = [
            (Pending, Completed),
            (Pending, MediaUploadPending),
            (Completed, Pending),
            (Failed, InProgress),
            (MediaUploadPending, Completed),
            (MediaUploadAwaitingRetry, Completed),
            (Unknown, InProgress),
            (Unknown, Completed),
        ];
        for (from, to) in unlawful {
            assert!(!from.can_transition_to(to), "{:?} -> {:?}", from, to);
        }
    }

    #[test]
    fn status_strings_round_trip() {
        for status in [
            SyncStatus::Pending,
            SyncStatus::InProgress,
            SyncStatus::Completed,
            SyncStatus::Failed,
            SyncStatus::MediaUploadPending,
            SyncStatus::MediaUploadInProgress,
            SyncStatus::MediaUploadAwaitingRetry,
            SyncStatus::Unknown,
        ] {
            assert_eq!(SyncStatus::from_db(status.as_str()), status);
        }
    }

    #[test]
    fn unrecognized_status_decodes_to_unknown() {
        assert_eq!(SyncStatus::from_db("exploded"), SyncStatus::Unknown);
        assert_eq!(SyncStatus::from_db(""), SyncStatus::Unknown);
    }

    #[test]
    fn photo_delta_exposes_file_name() {
        let delta = ValueDelta {
            task_id: "photo_task".to_string(),
            task_type: TaskType::Photo,
            value: serde_json::json!("img_001.jpg"),
        };
        assert_eq!(delta.photo_file_name(), Some("img_001.jpg"));

        let text = ValueDelta {
            task_id: "text_task".to_string(),
            task_type: TaskType::Text,
            value: serde_json::json!("hello"),
        };
        assert_eq!(text.photo_file_name(), None);
    }
}
