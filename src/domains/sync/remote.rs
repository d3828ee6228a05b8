use std::path::Path;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use log::debug;
use reqwest::multipart::{Form, Part};
use reqwest::Client;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::domains::mutation::types::{Mutation, MutationType, ValueDelta};
use crate::errors::{SyncError, SyncResult};

/// Wire representation of a mutation pushed to the remote store. Photo deltas
/// carry their local file names; the binary payload follows in the media
/// phase under the matching remote key.
#[derive(Debug, Clone, Serialize)]
pub struct MutationPayload {
    pub mutation_id: Uuid,
    pub kind: String,
    pub operation: MutationType,
    pub survey_id: String,
    pub location_of_interest_id: String,
    pub user_id: String,
    pub job_id: String,
    pub collection_id: String,
    pub submission_id: Option<String>,
    pub deltas: Vec<ValueDelta>,
    pub client_timestamp: DateTime<Utc>,
}

impl From<&Mutation> for MutationPayload {
    fn from(mutation: &Mutation) -> Self {
        let submission_id = match mutation {
            Mutation::LocationOfInterest(_) => None,
            Mutation::Submission(m) => Some(m.submission_id.clone()),
        };
        Self {
            mutation_id: mutation.id(),
            kind: mutation.kind_str().to_string(),
            operation: mutation.mutation_type(),
            survey_id: mutation.survey_id().to_string(),
            location_of_interest_id: mutation.location_of_interest_id().to_string(),
            user_id: mutation.user_id().to_string(),
            job_id: mutation.job_id().to_string(),
            collection_id: mutation.collection_id().to_string(),
            submission_id,
            deltas: mutation.deltas().to_vec(),
            client_timestamp: mutation.client_timestamp(),
        }
    }
}

/// The remote store, reduced to the two fallible calls the engine needs.
/// Neither call is assumed idempotent; retry logic must tolerate re-sending
/// writes the server already applied.
#[async_trait]
pub trait RemoteDataStore: Send + Sync {
    /// Replay one mutation against the remote store.
    async fn push_mutation(&self, payload: &MutationPayload) -> SyncResult<()>;

    /// Upload one local file under the given destination key, returning the
    /// remote key the server stored it as.
    async fn upload_media(&self, local_path: &Path, destination_key: &str) -> SyncResult<String>;
}

/// Remote store client backed by an HTTP API server.
pub struct HttpRemoteDataStore {
    client: Client,
    base_url: String,
    api_token: String,
}

impl HttpRemoteDataStore {
    pub fn new(base_url: &str, api_token: &str) -> Self {
        let client = Client::builder()
            .timeout(Duration::from_secs(120))
            .connect_timeout(Duration::from_secs(10))
            .build()
            .unwrap_or_default();

        Self {
            client,
            base_url: base_url.to_string(),
            api_token: api_token.to_string(),
        }
    }

    fn auth_header(&self) -> String {
        format!("Bearer {}", self.api_token)
    }

    fn mime_for(path: &Path) -> mime::Mime {
        match path.extension().and_then(|e| e.to_str()) {
            Some("jpg") | Some("jpeg") => mime::IMAGE_JPEG,
            Some("png") => mime::IMAGE_PNG,
            _ => mime::APPLICATION_OCTET_STREAM,
        }
    }
}

#[async_trait]
impl RemoteDataStore for HttpRemoteDataStore {
    async fn push_mutation(&self, payload: &MutationPayload) -> SyncResult<()> {
        debug!(
            "Pushing {} mutation {} for survey {}",
            payload.kind, payload.mutation_id, payload.survey_id
        );

        let url = format!("{}/api/mutations", self.base_url);
        let response = self
            .client
            .post(&url)
            .header("Authorization", self.auth_header())
            .json(payload)
            .send()
            .await
            .map_err(|e| SyncError::Network(format!("Failed to push mutation: {}", e)))?;

        if response.status().is_success() {
            Ok(())
        } else {
            let status = response.status();
            let error_text = response
                .text()
                .await
                .unwrap_or_else(|_| "Unable to get error details".to_string());
            Err(SyncError::ServerError(format!(
                "Server returned error {}: {}",
                status, error_text
            )))
        }
    }

    async fn upload_media(&self, local_path: &Path, destination_key: &str) -> SyncResult<String> {
        debug!("Uploading {} as {}", local_path.display(), destination_key);

        let file_content = tokio::fs::read(local_path)
            .await
            .map_err(|e| SyncError::Upload(format!("Failed to read local file: {}", e)))?;

        let file_name = local_path
            .file_name()
            .unwrap_or_default()
            .to_string_lossy()
            .into_owned();
        let part = Part::bytes(file_content)
            .file_name(file_name)
            .mime_str(Self::mime_for(local_path).as_ref())
            .map_err(|e| SyncError::Upload(format!("Invalid MIME type for upload: {}", e)))?;

        let form = Form::new()
            .part("file", part)
            .text("key", destination_key.to_string());

        let url = format!("{}/api/media", self.base_url);
        let response = self
            .client
            .post(&url)
            .header("Authorization", self.auth_header())
            .multipart(form)
            .send()
            .await
            .map_err(|e| SyncError::Network(format!("Failed to upload media: {}", e)))?;

        if response.status().is_success() {
            #[derive(Deserialize)]
            struct UploadResponse {
                remote_key: String,
            }

            let upload_response = response
                .json::<UploadResponse>()
                .await
                .map_err(|e| SyncError::Upload(format!("Failed to parse upload response: {}", e)))?;
            Ok(upload_response.remote_key)
        } else {
            let status = response.status();
            let error_text = response
                .text()
                .await
                .unwrap_or_else(|_| "Unable to get error details".to_string());
            Err(SyncError::ServerError(format!(
                "Server returned error {}: {}",
                status, error_text
            )))
        }
    }
}

/// Fake implementation for testing, with per-call failure injection.
#[cfg(test)]
pub struct FakeRemoteDataStore {
    failing_pushes: std::sync::Mutex<std::collections::HashSet<Uuid>>,
    failing_uploads: std::sync::Mutex<std::collections::HashSet<String>>,
    pushed: std::sync::Mutex<Vec<Uuid>>,
    uploaded: std::sync::Mutex<Vec<String>>,
}

#[cfg(test)]
impl FakeRemoteDataStore {
    pub fn new() -> Self {
        Self {
            failing_pushes: std::sync::Mutex::new(Default::default()),
            failing_uploads: std::sync::Mutex::new(Default::default()),
            pushed: std::sync::Mutex::new(Vec::new()),
            uploaded: std::sync::Mutex::new(Vec::new()),
        }
    }

    /// Make pushes of the given mutation fail with a server error.
    pub fn fail_push_of(&self, mutation_id: Uuid) {
        self.failing_pushes.lock().unwrap().insert(mutation_id);
    }

    /// Let previously failing pushes succeed again.
    pub fn clear_push_failures(&self) {
        self.failing_pushes.lock().unwrap().clear();
    }

    /// Make uploads of the given file name fail with a server error.
    pub fn fail_upload_of(&self, file_name: &str) {
        self.failing_uploads
            .lock()
            .unwrap()
            .insert(file_name.to_string());
    }

    pub fn pushed_ids(&self) -> Vec<Uuid> {
        self.pushed.lock().unwrap().clone()
    }

    pub fn uploaded_keys(&self) -> Vec<String> {
        self.uploaded.lock().unwrap().clone()
    }
}

#[cfg(test)]
#[async_trait]
impl RemoteDataStore for FakeRemoteDataStore {
    async fn push_mutation(&self, payload: &MutationPayload) -> SyncResult<()> {
        if self
            .failing_pushes
            .lock()
            .unwrap()
            .contains(&payload.mutation_id)
        {
            return Err(SyncError::ServerError(format!(
                "Push rejected for mutation {}",
                payload.mutation_id
            )));
        }
        self.pushed.lock().unwrap().push(payload.mutation_id);
        Ok(())
    }

    async fn upload_media(&self, local_path: &Path, destination_key: &str) -> SyncResult<String> {
        let file_name = local_path
            .file_name()
            .unwrap_or_default()
            .to_string_lossy()
            .into_owned();
        if self.failing_uploads.lock().unwrap().contains(&file_name) {
            return Err(SyncError::ServerError(format!(
                "Upload rejected for {}",
                destination_key
            )));
        }
        self.uploaded.lock().unwrap().push(destination_key.to_string());
        Ok(destination_key.to_string())
    }
}
