//! The SVG→PPTX Converter contract, the crate's one external,
//! out-of-scope collaborator.
//!
//! Expressed as an `async_trait` so `batch-core` can be exercised against a
//! deterministic test double without linking an actual SVG renderer,
//! depending on it through a narrow function surface instead.

use std::path::{Path, PathBuf};

use async_trait::async_trait;
use serde_json::Value;

#[derive(Debug, Clone)]
pub struct ConvertOptions {
    pub enable_debug_trace: bool,
}

#[derive(Debug, Clone)]
pub struct ConvertSuccess {
    pub output_path: PathBuf,
    pub page_count: u32,
    pub output_size_bytes: u64,
    /// Opaque structured blob handed back to the caller and merged into the
    /// Job's trace.
    pub debug_trace: Value,
}

#[derive(Debug, Clone)]
pub struct ConvertFailure {
    pub error_message: String,
    pub category: String,
}

#[async_trait]
pub trait Converter: Send + Sync {
    async fn convert(
        &self,
        input_paths: &[PathBuf],
        output_path: &Path,
        options: &ConvertOptions,
    ) -> Result<ConvertSuccess, ConvertFailure>;
}

/// A generic HTTP-backed `Converter` for the runner binary: uploads the
/// input SVGs as a multipart request to an external conversion service and
/// writes the returned artifact bytes to `output_path`. Grounded on
/// `pipeline_adapter.rs::PipelineAdapter` (a `reqwest::Client` with a fixed
/// `base_url`/`token`/`timeout`, one POST per call, `bearer_auth` when a
/// token is configured).
pub struct HttpConverter {
    client: reqwest::Client,
    base_url: String,
    token: Option<String>,
}

impl HttpConverter {
    pub fn new(base_url: impl Into<String>, token: Option<String>, timeout: std::time::Duration) -> anyhow::Result<Self> {
        let client = reqwest::Client::builder().timeout(timeout).build()?;
        Ok(Self {
            client,
            base_url: base_url.into().trim_end_matches('/').to_string(),
            token,
        })
    }

    fn authed(&self, builder: reqwest::RequestBuilder) -> reqwest::RequestBuilder {
        match &self.token {
            Some(t) => builder.bearer_auth(t),
            None => builder,
        }
    }
}

#[async_trait]
impl Converter for HttpConverter {
    async fn convert(
        &self,
        input_paths: &[PathBuf],
        output_path: &Path,
        options: &ConvertOptions,
    ) -> Result<ConvertSuccess, ConvertFailure> {
        let mut form = reqwest::multipart::Form::new()
            .text("enable_debug_trace", options.enable_debug_trace.to_string());

        for path in input_paths {
            let bytes = tokio::fs::read(path).await.map_err(|e| ConvertFailure {
                error_message: format!("reading input {}: {e}", path.display()),
                category: "resource".to_string(),
            })?;
            let filename = path
                .file_name()
                .map(|n| n.to_string_lossy().to_string())
                .unwrap_or_else(|| "input.svg".to_string());
            let part = reqwest::multipart::Part::bytes(bytes)
                .file_name(filename)
                .mime_str("image/svg+xml")
                .map_err(|e| ConvertFailure {
                    error_message: e.to_string(),
                    category: "configuration".to_string(),
                })?;
            form = form.part("inputs", part);
        }

        let url = format!("{}/convert", self.base_url);
        let resp = self
            .authed(self.client.post(&url))
            .multipart(form)
            .send()
            .await
            .map_err(|e| ConvertFailure {
                error_message: e.to_string(),
                category: "network".to_string(),
            })?;

        if !resp.status().is_success() {
            return Err(ConvertFailure {
                error_message: format!("converter returned status {}", resp.status()),
                category: "packaging".to_string(),
            });
        }

        let bytes = resp.bytes().await.map_err(|e| ConvertFailure {
            error_message: e.to_string(),
            category: "network".to_string(),
        })?;
        tokio::fs::write(output_path, &bytes).await.map_err(|e| ConvertFailure {
            error_message: format!("writing converter output: {e}"),
            category: "resource".to_string(),
        })?;

        Ok(ConvertSuccess {
            output_path: output_path.to_path_buf(),
            page_count: input_paths.len() as u32,
            output_size_bytes: bytes.len() as u64,
            debug_trace: serde_json::json!({ "input_count": input_paths.len() }),
        })
    }
}

pub mod testing {
    use std::path::{Path, PathBuf};
    use std::sync::Mutex;

    use async_trait::async_trait;
    use serde_json::json;

    use super::{ConvertFailure, ConvertOptions, ConvertSuccess, Converter};

    /// Always succeeds with a minimal, deterministic trace.
    pub struct NoopConverter;

    #[async_trait]
    impl Converter for NoopConverter {
        async fn convert(
            &self,
            input_paths: &[PathBuf],
            output_path: &Path,
            _options: &ConvertOptions,
        ) -> Result<ConvertSuccess, ConvertFailure> {
            Ok(ConvertSuccess {
                output_path: output_path.to_path_buf(),
                page_count: input_paths.len() as u32,
                output_size_bytes: 0,
                debug_trace: json!({ "pages": input_paths.len() }),
            })
        }
    }

    #[derive(Debug, Clone)]
    pub enum ScriptedResult {
        Success(ConvertSuccess),
        Failure(ConvertFailure),
    }

    /// Returns a pre-programmed sequence of results, one per call, for
    /// coordinator tests; repeats the final entry once exhausted.
    pub struct ScriptedConverter {
        script: Mutex<Vec<ScriptedResult>>,
    }

    impl ScriptedConverter {
        pub fn new(script: Vec<ScriptedResult>) -> Self {
            Self {
                script: Mutex::new(script),
            }
        }
    }

    #[async_trait]
    impl Converter for ScriptedConverter {
        async fn convert(
            &self,
            _input_paths: &[PathBuf],
            _output_path: &Path,
            _options: &ConvertOptions,
        ) -> Result<ConvertSuccess, ConvertFailure> {
            let mut script = self.script.lock().unwrap();
            let result = if script.len() > 1 {
                script.remove(0)
            } else {
                script.first().cloned().expect("ScriptedConverter requires at least one entry")
            };
            match result {
                ScriptedResult::Success(s) => Ok(s),
                ScriptedResult::Failure(f) => Err(f),
            }
        }
    }
}
