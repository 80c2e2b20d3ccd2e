use std::{
    io::ErrorKind,
    path::{Path, PathBuf},
    sync::Arc,
};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::{info, warn};
use url::Url;
use uuid::Uuid;

use crate::{
    config::non_empty,
    credentials::CredentialStore,
    engine::{Extraction, ExtractionEngine, ExtractionJob},
    error::{CredentialFailure, DownloadError},
    formats::{self, BEST_FORMAT},
};

/// Substrings in engine errors that mean the origin wants a signed-in session.
pub const DEFAULT_CREDENTIAL_KEYWORDS: [&str; 6] = [
    "cookies",
    "sign in",
    "not a bot",
    "confirm you’re not a bot",
    "verify",
    "consent",
];

/// Decides whether an engine failure asks for credentials.
///
/// yt-dlp only reports this condition in free text, so this is a plain
/// case-insensitive substring match over a configurable keyword list.
#[derive(Debug, Clone)]
pub struct CredentialSignal {
    keywords: Vec<String>,
}

impl CredentialSignal {
    pub fn new<I, S>(keywords: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        Self {
            keywords: keywords
                .into_iter()
                .filter_map(|keyword| non_empty(keyword.as_ref()).map(str::to_lowercase))
                .collect(),
        }
    }

    pub fn matches(&self, message: &str) -> bool {
        let lower = message.to_lowercase();
        self.keywords.iter().any(|keyword| lower.contains(keyword))
    }
}

impl Default for CredentialSignal {
    fn default() -> Self {
        Self::new(DEFAULT_CREDENTIAL_KEYWORDS)
    }
}

#[derive(Debug, Default, Deserialize)]
pub struct DownloadRequest {
    #[serde(default)]
    pub url: Option<String>,
    #[serde(default)]
    pub quality: Option<String>,
    #[serde(default)]
    pub dry: bool,
}

#[derive(Debug, Serialize)]
pub struct StoredDownload {
    pub file_id: Uuid,
    pub filename: String,
    pub download_url: String,
    pub quality: String,
    pub expires_in: String,
    pub cookies_used: bool,
    pub created_at: DateTime<Utc>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub title: Option<String>,
}

#[derive(Debug)]
pub enum DownloadOutcome {
    /// Dry run: the engine metadata, untouched.
    Preview(Value),
    Stored(StoredDownload),
}

/// Drives the engine for one request: uncredentialed attempt, optional
/// credentialed retry, then format refinement for real downloads.
pub struct Downloader {
    engine: Arc<dyn ExtractionEngine>,
    credentials: CredentialStore,
    output_dir: PathBuf,
    signal: CredentialSignal,
    expires_in: String,
}

impl Downloader {
    pub fn new(
        engine: Arc<dyn ExtractionEngine>,
        credentials: CredentialStore,
        output_dir: PathBuf,
        signal: CredentialSignal,
        expires_in: String,
    ) -> Self {
        Self {
            engine,
            credentials,
            output_dir,
            signal,
            expires_in,
        }
    }

    pub async fn download(&self, request: DownloadRequest) -> Result<DownloadOutcome, DownloadError> {
        let url = validate_url(request.url.as_deref())?;
        let quality = request
            .quality
            .as_deref()
            .and_then(non_empty)
            .unwrap_or(BEST_FORMAT)
            .to_string();
        let file_id = Uuid::new_v4();
        let download = !request.dry;

        let (extraction, cookies_used) = self.attempt(&url, &quality, file_id, download).await?;

        if !download {
            return Ok(DownloadOutcome::Preview(extraction.info));
        }

        let (extraction, quality, cookies_used) = self
            .refine(&url, quality, file_id, extraction, cookies_used)
            .await?;

        let path = extraction.file_path.as_deref().ok_or_else(|| {
            DownloadError::Extraction("The engine reported success but produced no file.".into())
        })?;
        let filename = path
            .file_name()
            .and_then(|name| name.to_str())
            .map(ToString::to_string)
            .ok_or_else(|| DownloadError::Extraction("Downloaded file has no usable name.".into()))?;

        info!(
            "Stored {} for {} (quality {}, cookies {})",
            filename, url, quality, cookies_used
        );

        Ok(DownloadOutcome::Stored(StoredDownload {
            file_id,
            download_url: format!("/file/{filename}"),
            filename,
            quality,
            expires_in: self.expires_in.clone(),
            cookies_used,
            created_at: Utc::now(),
            title: extraction.title(),
        }))
    }

    /// Uncredentialed attempt, retried once with cookies when the engine asks
    /// for sign-in. Returns whether the successful call carried cookies.
    async fn attempt(
        &self,
        url: &str,
        format: &str,
        file_id: Uuid,
        download: bool,
    ) -> Result<(Extraction, bool), DownloadError> {
        let first = self.job(url, format, file_id, download, None);
        let error = match self.engine.extract(&first).await {
            Ok(extraction) => return Ok((extraction, false)),
            Err(error) => error,
        };

        if !self.signal.matches(&error.message) {
            warn!("Extraction failed for {}: {}", url, error.message);
            return Err(DownloadError::Extraction(error.message));
        }

        if !self.credentials.exists().await {
            warn!("{} requires sign-in and no cookies are stored", url);
            return Err(DownloadError::CredentialsRequired(CredentialFailure::Missing));
        }

        warn!("{} requires sign-in, retrying with stored cookies", url);
        let retry = self.job(
            url,
            format,
            file_id,
            download,
            Some(self.credentials.path().to_path_buf()),
        );
        match self.engine.extract(&retry).await {
            Ok(extraction) => Ok((extraction, true)),
            Err(error) => {
                warn!("Credentialed retry failed for {}: {}", url, error.message);
                Err(DownloadError::CredentialsRequired(CredentialFailure::Rejected {
                    details: error.message,
                }))
            }
        }
    }

    /// Re-runs the download once when the requested quality resolves to a
    /// different format than the one asked for.
    async fn refine(
        &self,
        url: &str,
        quality: String,
        file_id: Uuid,
        extraction: Extraction,
        cookies_used: bool,
    ) -> Result<(Extraction, String, bool), DownloadError> {
        if quality == BEST_FORMAT {
            return Ok((extraction, quality, cookies_used));
        }

        let resolved = formats::resolve(&quality, &extraction.formats());
        if resolved == quality {
            return Ok((extraction, quality, cookies_used));
        }

        info!("Quality {} resolved to format {} for {}", quality, resolved, url);
        if let Some(path) = &extraction.file_path {
            discard_output(path).await;
        }

        let cookie_file = if self.credentials.exists().await {
            Some(self.credentials.path().to_path_buf())
        } else {
            None
        };
        let with_cookies = cookie_file.is_some();

        let job = self.job(url, &resolved, file_id, true, cookie_file);
        let refined = self.engine.extract(&job).await.map_err(|error| {
            warn!("Refined download failed for {}: {}", url, error.message);
            DownloadError::Extraction(error.message)
        })?;

        Ok((refined, resolved, with_cookies))
    }

    fn job(
        &self,
        url: &str,
        format: &str,
        file_id: Uuid,
        download: bool,
        cookie_file: Option<PathBuf>,
    ) -> ExtractionJob {
        ExtractionJob {
            url: url.to_string(),
            format: format.to_string(),
            output_dir: self.output_dir.clone(),
            file_id,
            cookie_file,
            download,
        }
    }
}

fn validate_url(url: Option<&str>) -> Result<String, DownloadError> {
    let url = url
        .and_then(non_empty)
        .ok_or_else(|| DownloadError::Validation("url required".into()))?;

    match Url::parse(url) {
        Ok(parsed) if matches!(parsed.scheme(), "http" | "https") => Ok(url.to_string()),
        _ => Err(DownloadError::Validation(
            "url must be an absolute http(s) URL".into(),
        )),
    }
}

async fn discard_output(path: &Path) {
    if let Err(error) = tokio::fs::remove_file(path).await
        && error.kind() != ErrorKind::NotFound
    {
        warn!("Could not remove superseded download {:?}: {error}", path);
    }
}

#[cfg(test)]
pub(crate) mod testing {
    use std::{collections::VecDeque, sync::Mutex};

    use async_trait::async_trait;
    use serde_json::{Value, json};

    use crate::engine::{EngineError, Extraction, ExtractionEngine, ExtractionJob};

    pub enum Step {
        Succeed,
        Fail(&'static str),
    }

    /// Engine double that replays scripted outcomes and records every job.
    ///
    /// Successful downloads write `media:<format>` to `<file_id>.mp4`.
    pub struct ScriptedEngine {
        steps: Mutex<VecDeque<Step>>,
        info: Value,
        calls: Mutex<Vec<ExtractionJob>>,
    }

    impl ScriptedEngine {
        pub fn new(steps: Vec<Step>) -> Self {
            Self {
                steps: Mutex::new(steps.into()),
                info: json!({
                    "title": "Sample clip",
                    "formats": [
                        {"format_id": "18", "height": 360},
                        {"format_id": "135", "height": 480},
                        {"format_id": "136", "height": 720},
                        {"format_id": "137", "height": 1080}
                    ]
                }),
                calls: Mutex::new(Vec::new()),
            }
        }

        pub fn calls(&self) -> Vec<ExtractionJob> {
            self.calls.lock().unwrap().clone()
        }
    }

    #[async_trait]
    impl ExtractionEngine for ScriptedEngine {
        async fn extract(&self, job: &ExtractionJob) -> Result<Extraction, EngineError> {
            self.calls.lock().unwrap().push(job.clone());
            let step = self
                .steps
                .lock()
                .unwrap()
                .pop_front()
                .expect("engine called more times than scripted");

            match step {
                Step::Fail(message) => Err(EngineError::new(message)),
                Step::Succeed => {
                    let file_path = if job.download {
                        let path = job.output_dir.join(format!("{}.mp4", job.file_id));
                        std::fs::write(&path, format!("media:{}", job.format)).unwrap();
                        Some(path)
                    } else {
                        None
                    };
                    Ok(Extraction {
                        info: self.info.clone(),
                        file_path,
                    })
                }
            }
        }
    }
}
