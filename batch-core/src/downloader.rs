//! Fetches SVG inputs by URL into a per-job scratch directory.
//!
//! Grounded on `core/batch/url_downloader.py` for the validation order and
//! filename derivation rules, and on `msgraph.rs` for the Rust HTTP idiom: a
//! `reqwest::Client` built with an explicit timeout, a `User-Agent` header,
//! and streamed `resp.chunk()` reads (mirroring `msgraph.rs::download_file`).
//! Scratch directories use `tempfile`, as `sharepoint-ingest`'s
//! `run_job_inner` does for its working directory.

use std::path::PathBuf;
use std::time::Duration;

use async_trait::async_trait;
use reqwest::Client;
use tracing::warn;

const USER_AGENT: &str = concat!("batch-core/", env!("CARGO_PKG_VERSION"));
const SNIFF_WINDOW: usize = 1024;

#[derive(Debug, Clone)]
pub struct DownloadRequest {
    pub urls: Vec<String>,
    pub timeout: Duration,
    pub max_size_bytes: u64,
    pub job_id: Option<String>,
}

#[derive(Debug, Clone)]
pub struct UrlDownloadError {
    pub url: String,
    pub error_type: String,
    pub message: String,
}

#[derive(Debug)]
pub struct DownloadOutcome {
    pub success: bool,
    pub file_paths: Vec<PathBuf>,
    pub errors: Vec<UrlDownloadError>,
    /// Kept alive for the duration of the job; dropping it removes the
    /// directory. `None` when every URL failed (temp dir cleaned up
    /// atomically).
    pub temp_dir: Option<tempfile::TempDir>,
}

/// Fetches SVG inputs for one job invocation. A trait so the Coordinator can
/// be exercised against a deterministic test double, the same arm's-length
/// pattern used for `Converter` and `FileService`.
#[async_trait]
pub trait Downloader: Send + Sync {
    async fn download(&self, req: DownloadRequest) -> anyhow::Result<DownloadOutcome>;
}

pub struct HttpDownloader {
    client: Client,
}

impl HttpDownloader {
    pub fn new() -> anyhow::Result<Self> {
        let client = Client::builder()
            .user_agent(USER_AGENT)
            .redirect(reqwest::redirect::Policy::limited(10))
            .build()?;
        Ok(Self { client })
    }
}

#[async_trait]
impl Downloader for HttpDownloader {
    async fn download(&self, req: DownloadRequest) -> anyhow::Result<DownloadOutcome> {
        if req.urls.is_empty() {
            anyhow::bail!("validation_error: URL list must not be empty");
        }

        let dir_prefix = req
            .job_id
            .as_deref()
            .map(|id| format!("batch-{id}-"))
            .unwrap_or_else(|| "batch-".to_string());
        let temp_dir = tempfile::Builder::new().prefix(&dir_prefix).tempdir()?;

        let mut file_paths = Vec::new();
        let mut errors = Vec::new();

        for (index, url) in req.urls.iter().enumerate() {
            match self.fetch_one(url, index, req.timeout, req.max_size_bytes, temp_dir.path()).await {
                Ok(path) => file_paths.push(path),
                Err(e) => {
                    warn!(url = %url, error = %e.message, "download failed for url");
                    errors.push(e);
                }
            }
        }

        let success = !file_paths.is_empty();
        let temp_dir = if success {
            Some(temp_dir)
        } else {
            // dropping `temp_dir` here removes the directory from disk
            drop(temp_dir);
            None
        };

        Ok(DownloadOutcome {
            success,
            file_paths,
            errors,
            temp_dir,
        })
    }
}

impl HttpDownloader {
    async fn fetch_one(
        &self,
        url: &str,
        index: usize,
        timeout: Duration,
        max_size_bytes: u64,
        dir: &std::path::Path,
    ) -> Result<PathBuf, UrlDownloadError> {
        let resp = self
            .client
            .get(url)
            .timeout(timeout)
            .send()
            .await
            .map_err(|e| UrlDownloadError {
                url: url.to_string(),
                error_type: "http_error".to_string(),
                message: e.to_string(),
            })?;

        if !resp.status().is_success() {
            return Err(UrlDownloadError {
                url: url.to_string(),
                error_type: "http_error".to_string(),
                message: format!("status {}", resp.status()),
            });
        }

        let content_type = resp
            .headers()
            .get(reqwest::header::CONTENT_TYPE)
            .and_then(|v| v.to_str().ok())
            .unwrap_or_default()
            .to_string();
        if !content_type.is_empty()
            && !content_type.contains("svg")
            && !content_type.contains("xml")
        {
            warn!(url = %url, content_type = %content_type, "content-type does not indicate SVG/XML");
        }

        let filename = derive_filename(url, index);
        let path = dir.join(&filename);
        let mut file = tokio::fs::File::create(&path).await.map_err(|e| UrlDownloadError {
            url: url.to_string(),
            error_type: "download_error".to_string(),
            message: e.to_string(),
        })?;

        let mut resp = resp;
        let mut total: u64 = 0;
        let mut sniff_buf: Vec<u8> = Vec::with_capacity(SNIFF_WINDOW);
        use tokio::io::AsyncWriteExt;

        while let Some(chunk) = resp.chunk().await.map_err(|e| UrlDownloadError {
            url: url.to_string(),
            error_type: "http_error".to_string(),
            message: e.to_string(),
        })? {
            total += chunk.len() as u64;
            if total > max_size_bytes {
                return Err(UrlDownloadError {
                    url: url.to_string(),
                    error_type: "download_error".to_string(),
                    message: "size_limit".to_string(),
                });
            }
            if sniff_buf.len() < SNIFF_WINDOW {
                let remaining = SNIFF_WINDOW - sniff_buf.len();
                sniff_buf.extend(chunk.iter().take(remaining));
            }
            file.write_all(&chunk).await.map_err(|e| UrlDownloadError {
                url: url.to_string(),
                error_type: "download_error".to_string(),
                message: e.to_string(),
            })?;
        }
        file.flush().await.map_err(|e| UrlDownloadError {
            url: url.to_string(),
            error_type: "download_error".to_string(),
            message: e.to_string(),
        })?;

        if !sniff_contains_svg(&sniff_buf) {
            let _ = tokio::fs::remove_file(&path).await;
            return Err(UrlDownloadError {
                url: url.to_string(),
                error_type: "download_error".to_string(),
                message: "not_svg".to_string(),
            });
        }

        Ok(path)
    }
}

fn sniff_contains_svg(buf: &[u8]) -> bool {
    let lower: Vec<u8> = buf.iter().map(|b| b.to_ascii_lowercase()).collect();
    lower
        .windows(4)
        .any(|w| w == b"<svg")
}

/// Derives a sanitized filename from the URL path stem: `[A-Za-z0-9_-]`
/// only, truncated to 50 chars, suffixed with the index, `.svg` extension. A
/// missing or empty stem falls back to `file_{index}`.
fn derive_filename(url: &str, index: usize) -> String {
    let stem = reqwest::Url::parse(url)
        .ok()
        .and_then(|u| {
            u.path_segments()
                .and_then(|mut segs| segs.next_back().map(str::to_string))
        })
        .map(|seg| {
            std::path::Path::new(&seg)
                .file_stem()
                .map(|s| s.to_string_lossy().to_string())
                .unwrap_or_default()
        })
        .unwrap_or_default();

    let sanitized: String = stem
        .chars()
        .filter(|c| c.is_ascii_alphanumeric() || *c == '_' || *c == '-')
        .collect();

    let base = if sanitized.is_empty() {
        format!("file_{index}")
    } else {
        sanitized.chars().take(50).collect::<String>()
    };

    format!("{base}_{index}.svg")
}

/// Deterministic test double used by coordinator scenario tests so they do
/// not depend on a live HTTP stack, mirroring `fileservice::testing`'s
/// `InMemoryFileService` and `converter::testing`'s `ScriptedConverter`.
pub mod testing {
    use async_trait::async_trait;

    use super::{DownloadOutcome, DownloadRequest, Downloader, UrlDownloadError};

    /// Writes pre-supplied byte contents (keyed by position, one per URL)
    /// into a fresh temp directory, returning errors for URLs whose script
    /// entry is `None`.
    pub struct ScriptedDownloader {
        contents: Vec<Option<Vec<u8>>>,
    }

    impl ScriptedDownloader {
        pub fn new(contents: Vec<Option<Vec<u8>>>) -> Self {
            Self { contents }
        }
    }

    #[async_trait]
    impl Downloader for ScriptedDownloader {
        async fn download(&self, req: DownloadRequest) -> anyhow::Result<DownloadOutcome> {
            if req.urls.is_empty() {
                anyhow::bail!("validation_error: URL list must not be empty");
            }
            let temp_dir = tempfile::Builder::new().prefix("batch-scripted-").tempdir()?;
            let mut file_paths = Vec::new();
            let mut errors = Vec::new();

            for (index, url) in req.urls.iter().enumerate() {
                match self.contents.get(index).and_then(|c| c.as_ref()) {
                    Some(bytes) => {
                        let path = temp_dir.path().join(format!("file_{index}.svg"));
                        tokio::fs::write(&path, bytes).await?;
                        file_paths.push(path);
                    }
                    None => errors.push(UrlDownloadError {
                        url: url.clone(),
                        error_type: "http_error".to_string(),
                        message: "scripted failure".to_string(),
                    }),
                }
            }

            let success = !file_paths.is_empty();
            let temp_dir = if success { Some(temp_dir) } else { None };
            Ok(DownloadOutcome {
                success,
                file_paths,
                errors,
                temp_dir,
            })
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn derives_sanitized_filename_from_url_stem() {
        let name = derive_filename("https://example.com/path/My Graphic!.svg", 3);
        assert_eq!(name, "MyGraphic_3.svg");
    }

    #[test]
    fn falls_back_to_file_index_for_empty_stem() {
        let name = derive_filename("https://example.com/", 0);
        assert_eq!(name, "file_0_0.svg");
    }

    #[test]
    fn truncates_long_stems_to_fifty_chars() {
        let long = "a".repeat(200);
        let name = derive_filename(&format!("https://example.com/{long}.svg"), 1);
        assert_eq!(name, format!("{}_1.svg", "a".repeat(50)));
    }

    #[test]
    fn sniffs_svg_tag_case_insensitively() {
        assert!(sniff_contains_svg(b"<?xml version=\"1.0\"?><SVG xmlns=..."));
        assert!(!sniff_contains_svg(b"<html><body>not svg</body></html>"));
    }
}
