//! Narrow capability interface to the cloud file service.
//!
//! Modeled on the shape of `msgraph.rs::MsGraphClient` (token caching behind
//! an `RwLock`, a `send_with_retry` wrapper around every call) and
//! `upload_adapter.rs::UploadAdapter` (multipart upload via
//! `reqwest::multipart::Form`/`Part`).

use async_trait::async_trait;

use crate::model::ErrorClass;

#[derive(Debug, Clone)]
pub struct CreateFolderResult {
    pub folder_id: String,
    pub folder_url: String,
}

#[derive(Debug, Clone)]
pub struct UploadFileResult {
    pub file_id: String,
    pub file_url: String,
    pub download_url: Option<String>,
}

#[derive(Debug, Clone)]
pub struct PreviewResult {
    pub preview_url: String,
    pub thumbnail_url: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionStatus {
    Ok,
    AuthError,
    ServiceError,
}

/// A classified `FileService` failure. `ErrorClass::QuotaExceeded` carries
/// the reason used to index the Rate Governor's backoff table.
#[derive(Debug, Clone)]
pub struct FileServiceError {
    pub class: ErrorClass,
    pub message: String,
    pub quota_reason: Option<crate::model::QuotaErrorReason>,
}

impl FileServiceError {
    pub fn transient(message: impl Into<String>) -> Self {
        Self {
            class: ErrorClass::Transient,
            message: message.into(),
            quota_reason: None,
        }
    }

    pub fn not_found(message: impl Into<String>) -> Self {
        Self {
            class: ErrorClass::NotFound,
            message: message.into(),
            quota_reason: None,
        }
    }
}

impl std::fmt::Display for FileServiceError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.message)
    }
}

impl std::error::Error for FileServiceError {}

#[async_trait]
pub trait FileService: Send + Sync {
    async fn create_folder(
        &self,
        name: &str,
        parent_id: Option<&str>,
    ) -> Result<CreateFolderResult, FileServiceError>;

    async fn upload_file(
        &self,
        local_path: &std::path::Path,
        folder_id: &str,
        remote_name: &str,
    ) -> Result<UploadFileResult, FileServiceError>;

    async fn request_preview(&self, file_id: &str) -> Result<PreviewResult, FileServiceError>;

    async fn test_connection(&self) -> ConnectionStatus;
}

/// Generic bearer-token HTTP implementation, usable against any REST-shaped
/// file-storage backend. Classifies `reqwest::StatusCode` and transport
/// errors into the closed set the way `msgraph.rs` classifies Graph API
/// responses.
pub struct HttpFileService {
    client: reqwest::Client,
    base_url: String,
    token: Option<String>,
}

impl HttpFileService {
    pub fn new(client: reqwest::Client, base_url: impl Into<String>, token: Option<String>) -> Self {
        Self {
            client,
            base_url: base_url.into(),
            token,
        }
    }

    fn authed(&self, builder: reqwest::RequestBuilder) -> reqwest::RequestBuilder {
        match &self.token {
            Some(t) => builder.bearer_auth(t),
            None => builder,
        }
    }

    fn classify_status(status: reqwest::StatusCode) -> ErrorClass {
        match status.as_u16() {
            401 | 403 => ErrorClass::Auth,
            404 => ErrorClass::NotFound,
            429 => ErrorClass::RateLimited,
            402 | 507 => ErrorClass::QuotaExceeded,
            500..=599 => ErrorClass::Transient,
            _ => ErrorClass::PermanentOther,
        }
    }
}

#[async_trait]
impl FileService for HttpFileService {
    async fn create_folder(
        &self,
        name: &str,
        parent_id: Option<&str>,
    ) -> Result<CreateFolderResult, FileServiceError> {
        let url = format!("{}/folders", self.base_url);
        let body = serde_json::json!({ "name": name, "parent_id": parent_id });
        let resp = self
            .authed(self.client.post(&url).json(&body))
            .send()
            .await
            .map_err(|e| FileServiceError::transient(e.to_string()))?;

        if !resp.status().is_success() {
            let class = Self::classify_status(resp.status());
            return Err(FileServiceError {
                class,
                message: format!("create_folder failed with status {}", resp.status()),
                quota_reason: None,
            });
        }

        let value: serde_json::Value = resp
            .json()
            .await
            .map_err(|e| FileServiceError::transient(e.to_string()))?;
        Ok(CreateFolderResult {
            folder_id: value["folder_id"].as_str().unwrap_or_default().to_string(),
            folder_url: value["folder_url"].as_str().unwrap_or_default().to_string(),
        })
    }

    async fn upload_file(
        &self,
        local_path: &std::path::Path,
        folder_id: &str,
        remote_name: &str,
    ) -> Result<UploadFileResult, FileServiceError> {
        let file_bytes = tokio::fs::read(local_path)
            .await
            .map_err(|e| FileServiceError::transient(format!("reading upload source: {e}")))?;

        let part = reqwest::multipart::Part::bytes(file_bytes)
            .file_name(remote_name.to_string())
            .mime_str("application/octet-stream")
            .map_err(|e| FileServiceError::transient(e.to_string()))?;
        let form = reqwest::multipart::Form::new()
            .text("folder_id", folder_id.to_string())
            .part("file", part);

        let url = format!("{}/files", self.base_url);
        let resp = self
            .authed(self.client.post(&url))
            .multipart(form)
            .send()
            .await
            .map_err(|e| FileServiceError::transient(e.to_string()))?;

        if !resp.status().is_success() {
            let class = Self::classify_status(resp.status());
            return Err(FileServiceError {
                class,
                message: format!("upload_file failed with status {}", resp.status()),
                quota_reason: None,
            });
        }

        let value: serde_json::Value = resp
            .json()
            .await
            .map_err(|e| FileServiceError::transient(e.to_string()))?;
        Ok(UploadFileResult {
            file_id: value["file_id"].as_str().unwrap_or_default().to_string(),
            file_url: value["file_url"].as_str().unwrap_or_default().to_string(),
            download_url: value["download_url"].as_str().map(str::to_string),
        })
    }

    async fn request_preview(&self, file_id: &str) -> Result<PreviewResult, FileServiceError> {
        let url = format!("{}/files/{}/preview", self.base_url, file_id);
        let resp = self
            .authed(self.client.post(&url))
            .send()
            .await
            .map_err(|e| FileServiceError::transient(e.to_string()))?;

        if !resp.status().is_success() {
            let class = Self::classify_status(resp.status());
            return Err(FileServiceError {
                class,
                message: format!("request_preview failed with status {}", resp.status()),
                quota_reason: None,
            });
        }

        let value: serde_json::Value = resp
            .json()
            .await
            .map_err(|e| FileServiceError::transient(e.to_string()))?;
        Ok(PreviewResult {
            preview_url: value["preview_url"].as_str().unwrap_or_default().to_string(),
            thumbnail_url: value["thumbnail_url"].as_str().map(str::to_string),
        })
    }

    async fn test_connection(&self) -> ConnectionStatus {
        let url = format!("{}/ping", self.base_url);
        match self.authed(self.client.get(&url)).send().await {
            Ok(resp) if resp.status().is_success() => ConnectionStatus::Ok,
            Ok(resp) if resp.status() == reqwest::StatusCode::UNAUTHORIZED => ConnectionStatus::AuthError,
            _ => ConnectionStatus::ServiceError,
        }
    }
}

/// Deterministic in-memory test double, used across coordinator/uploader/
/// retry tests.
pub mod testing {
    use std::collections::VecDeque;
    use std::sync::Mutex;

    use async_trait::async_trait;

    use super::*;

    #[derive(Debug, Clone)]
    pub enum ScriptedOutcome<T> {
        Ok(T),
        Err(FileServiceError),
    }

    #[derive(Default)]
    pub struct InMemoryFileService {
        create_folder_script: Mutex<VecDeque<ScriptedOutcome<CreateFolderResult>>>,
        upload_file_script: Mutex<VecDeque<ScriptedOutcome<UploadFileResult>>>,
        preview_script: Mutex<VecDeque<ScriptedOutcome<PreviewResult>>>,
        connection_status: Mutex<ConnectionStatus>,
    }

    impl InMemoryFileService {
        pub fn new() -> Self {
            Self {
                connection_status: Mutex::new(ConnectionStatus::Ok),
                ..Default::default()
            }
        }

        pub fn push_create_folder(&self, outcome: ScriptedOutcome<CreateFolderResult>) {
            self.create_folder_script.lock().unwrap().push_back(outcome);
        }

        pub fn push_upload_file(&self, outcome: ScriptedOutcome<UploadFileResult>) {
            self.upload_file_script.lock().unwrap().push_back(outcome);
        }

        pub fn push_preview(&self, outcome: ScriptedOutcome<PreviewResult>) {
            self.preview_script.lock().unwrap().push_back(outcome);
        }

        pub fn set_connection_status(&self, status: ConnectionStatus) {
            *self.connection_status.lock().unwrap() = status;
        }
    }

    impl Default for ConnectionStatus {
        fn default() -> Self {
            ConnectionStatus::Ok
        }
    }

    #[async_trait]
    impl FileService for InMemoryFileService {
        async fn create_folder(
            &self,
            name: &str,
            _parent_id: Option<&str>,
        ) -> Result<CreateFolderResult, FileServiceError> {
            match self.create_folder_script.lock().unwrap().pop_front() {
                Some(ScriptedOutcome::Ok(r)) => Ok(r),
                Some(ScriptedOutcome::Err(e)) => Err(e),
                None => Ok(CreateFolderResult {
                    folder_id: format!("folder-{name}"),
                    folder_url: format!("https://files.example/{name}"),
                }),
            }
        }

        async fn upload_file(
            &self,
            _local_path: &std::path::Path,
            _folder_id: &str,
            remote_name: &str,
        ) -> Result<UploadFileResult, FileServiceError> {
            match self.upload_file_script.lock().unwrap().pop_front() {
                Some(ScriptedOutcome::Ok(r)) => Ok(r),
                Some(ScriptedOutcome::Err(e)) => Err(e),
                None => Ok(UploadFileResult {
                    file_id: format!("file-{remote_name}"),
                    file_url: format!("https://files.example/{remote_name}"),
                    download_url: None,
                }),
            }
        }

        async fn request_preview(&self, file_id: &str) -> Result<PreviewResult, FileServiceError> {
            match self.preview_script.lock().unwrap().pop_front() {
                Some(ScriptedOutcome::Ok(r)) => Ok(r),
                Some(ScriptedOutcome::Err(e)) => Err(e),
                None => Ok(PreviewResult {
                    preview_url: format!("https://files.example/{file_id}/preview"),
                    thumbnail_url: None,
                }),
            }
        }

        async fn test_connection(&self) -> ConnectionStatus {
            *self.connection_status.lock().unwrap()
        }
    }
}
