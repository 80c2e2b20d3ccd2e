use std::{
    io::ErrorKind,
    path::{Path, PathBuf},
};

use async_trait::async_trait;
use serde_json::Value;
use tokio::process::Command;
use tracing::debug;
use uuid::Uuid;

use crate::formats::FormatDescriptor;

const USER_AGENT: &str = "Mozilla/5.0 (Windows NT 10.0; Win64; x64) \
                          AppleWebKit/537.36 (KHTML, like Gecko) \
                          Chrome/122 Safari/537.36";
const ACCEPT_LANGUAGE_HEADER: &str = "Accept-Language:en-US,en;q=0.9";

/// One invocation of the extraction engine.
#[derive(Debug, Clone)]
pub struct ExtractionJob {
    pub url: String,
    pub format: String,
    pub output_dir: PathBuf,
    pub file_id: Uuid,
    pub cookie_file: Option<PathBuf>,
    /// `false` asks for metadata only.
    pub download: bool,
}

impl ExtractionJob {
    /// Output template handed to the engine: `<dir>/<uuid>.<ext>`.
    pub fn output_template(&self) -> PathBuf {
        self.output_dir.join(format!("{}.%(ext)s", self.file_id))
    }
}

#[derive(Debug, Clone)]
pub struct Extraction {
    pub info: Value,
    pub file_path: Option<PathBuf>,
}

impl Extraction {
    pub fn formats(&self) -> Vec<FormatDescriptor> {
        // Entries are decoded one by one so a single odd format does not
        // hide the rest.
        self.info
            .get("formats")
            .and_then(Value::as_array)
            .map(|formats| {
                formats
                    .iter()
                    .filter_map(|format| serde_json::from_value(format.clone()).ok())
                    .collect()
            })
            .unwrap_or_default()
    }

    pub fn title(&self) -> Option<String> {
        self.info
            .get("title")
            .and_then(Value::as_str)
            .map(str::trim)
            .filter(|title| !title.is_empty())
            .map(ToString::to_string)
    }
}

/// Free-text failure reported by the engine.
#[derive(Debug, Clone, thiserror::Error)]
#[error("{message}")]
pub struct EngineError {
    pub message: String,
}

impl EngineError {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
        }
    }
}

#[async_trait]
pub trait ExtractionEngine: Send + Sync {
    async fn extract(&self, job: &ExtractionJob) -> Result<Extraction, EngineError>;
}

/// Runs the `yt-dlp` executable for each job.
#[derive(Debug, Clone)]
pub struct YtDlp {
    binary: String,
}

impl YtDlp {
    pub fn new(binary: impl Into<String>) -> Self {
        Self {
            binary: binary.into(),
        }
    }
}

#[async_trait]
impl ExtractionEngine for YtDlp {
    async fn extract(&self, job: &ExtractionJob) -> Result<Extraction, EngineError> {
        let args = build_args(job);
        debug!("Running {} {:?}", self.binary, args);

        let output = Command::new(&self.binary)
            .args(&args)
            .kill_on_drop(true)
            .output()
            .await
            .map_err(|error| {
                if error.kind() == ErrorKind::NotFound {
                    EngineError::new(format!(
                        "{} is not installed on this host. Install it and restart the backend.",
                        self.binary
                    ))
                } else {
                    EngineError::new(format!("Could not run {}: {error}", self.binary))
                }
            })?;

        if !output.status.success() {
            return Err(EngineError::new(run_error_message(&output.stderr)));
        }

        let info: Value = serde_json::from_slice(&output.stdout)
            .map_err(|error| EngineError::new(format!("Could not parse engine metadata: {error}")))?;

        let file_path = if job.download {
            match reported_output_file(&info, &job.output_dir, job.file_id).await {
                Some(path) => Some(path),
                None => Some(resolve_output_file(&job.output_dir, job.file_id).await?),
            }
        } else {
            None
        };

        Ok(Extraction { info, file_path })
    }
}

fn build_args(job: &ExtractionJob) -> Vec<String> {
    let mut args = vec![
        "--no-playlist".to_string(),
        "--no-warnings".to_string(),
        "--no-progress".to_string(),
        "--force-ipv4".to_string(),
        "--user-agent".to_string(),
        USER_AGENT.to_string(),
        "--add-header".to_string(),
        ACCEPT_LANGUAGE_HEADER.to_string(),
        "-f".to_string(),
        job.format.clone(),
        "-o".to_string(),
        job.output_template().to_string_lossy().into_owned(),
        "--dump-single-json".to_string(),
    ];

    if job.download {
        args.push("--no-simulate".to_string());
    }

    if let Some(cookie_file) = &job.cookie_file {
        args.push("--cookies".to_string());
        args.push(cookie_file.to_string_lossy().into_owned());
    }

    args.push("--".to_string());
    args.push(job.url.clone());
    args
}

/// Keeps the `ERROR:` lines from stderr, or the last line when there are none.
fn run_error_message(stderr: &[u8]) -> String {
    let text = String::from_utf8_lossy(stderr);
    let lines = text
        .lines()
        .map(str::trim)
        .filter(|line| !line.is_empty())
        .collect::<Vec<_>>();

    let errors = lines
        .iter()
        .filter(|line| line.starts_with("ERROR:"))
        .copied()
        .collect::<Vec<_>>();

    if !errors.is_empty() {
        errors.join("\n")
    } else {
        lines
            .last()
            .copied()
            .unwrap_or("yt-dlp could not complete the operation")
            .to_string()
    }
}

/// The final path yt-dlp records in `requested_downloads`, when it names an
/// existing `<file_id>.<ext>` file inside `dir`.
async fn reported_output_file(info: &Value, dir: &Path, file_id: Uuid) -> Option<PathBuf> {
    let reported = info
        .get("requested_downloads")?
        .as_array()?
        .iter()
        .find_map(|download| download.get("filepath").and_then(Value::as_str))?;

    let file_name = Path::new(reported).file_name()?;
    let stem = Path::new(file_name).file_stem()?.to_str()?;
    if stem != file_id.to_string() {
        debug!("Ignoring reported output {:?} for {}", reported, file_id);
        return None;
    }

    let path = dir.join(file_name);
    let metadata = tokio::fs::metadata(&path).await.ok()?;
    metadata.is_file().then_some(path)
}

/// Finds the `<file_id>.<ext>` file the engine left in `dir`.
async fn resolve_output_file(dir: &Path, file_id: Uuid) -> Result<PathBuf, EngineError> {
    let stem = file_id.to_string();
    let mut entries = tokio::fs::read_dir(dir)
        .await
        .map_err(|error| EngineError::new(format!("Could not open output directory: {error}")))?;

    while let Some(entry) = entries
        .next_entry()
        .await
        .map_err(|error| EngineError::new(format!("Could not list output directory: {error}")))?
    {
        let path = entry.path();
        let matches_stem = path
            .file_stem()
            .and_then(|value| value.to_str())
            .is_some_and(|value| value == stem);
        let is_file = entry
            .file_type()
            .await
            .map(|file_type| file_type.is_file())
            .unwrap_or(false);

        if matches_stem && is_file {
            return Ok(path);
        }
    }

    Err(EngineError::new(
        "The engine finished without leaving a downloaded file.",
    ))
}
