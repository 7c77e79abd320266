//! HTTP fetch utilities + listing export file I/O for the books pipeline.

use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::Context;
use books_core::{ConversionError, ErrorKind, Listing, Price, Rating, EXPORT_HEADER};
use reqwest::StatusCode;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use thiserror::Error;
use tokio::fs;
use tokio::io::AsyncWriteExt;
use tracing::{debug, info_span, warn, Instrument};
use uuid::Uuid;

pub const CRATE_NAME: &str = "books-storage";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryDisposition {
    Retryable,
    NonRetryable,
}

pub fn classify_status(status: StatusCode) -> RetryDisposition {
    if status.is_server_error() || status == StatusCode::TOO_MANY_REQUESTS {
        RetryDisposition::Retryable
    } else {
        RetryDisposition::NonRetryable
    }
}

pub fn classify_reqwest_error(err: &reqwest::Error) -> RetryDisposition {
    if err.is_timeout() || err.is_connect() || err.is_request() {
        RetryDisposition::Retryable
    } else {
        RetryDisposition::NonRetryable
    }
}

/// Exponential backoff for retryable fetch failures. `max_retries` of zero
/// (the default) fails on the first error.
#[derive(Debug, Clone, Copy)]
pub struct BackoffPolicy {
    pub max_retries: usize,
    pub base_delay: Duration,
    pub max_delay: Duration,
}

impl Default for BackoffPolicy {
    fn default() -> Self {
        Self {
            max_retries: 0,
            base_delay: Duration::from_millis(250),
            max_delay: Duration::from_secs(5),
        }
    }
}

impl BackoffPolicy {
    pub fn delay_for_attempt(&self, attempt_index: usize) -> Duration {
        let factor = 1u32.checked_shl(attempt_index as u32).unwrap_or(u32::MAX);
        let delay = self.base_delay.saturating_mul(factor);
        delay.min(self.max_delay)
    }
}

#[derive(Debug, Clone)]
pub struct HttpClientConfig {
    pub timeout: Duration,
    pub user_agent: Option<String>,
    pub backoff: BackoffPolicy,
}

impl Default for HttpClientConfig {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(20),
            user_agent: None,
            backoff: BackoffPolicy::default(),
        }
    }
}

#[derive(Debug)]
pub struct HttpFetcher {
    client: reqwest::Client,
    backoff: BackoffPolicy,
}

#[derive(Debug, Clone)]
pub struct FetchedResponse {
    pub status: StatusCode,
    pub final_url: String,
    pub body: Vec<u8>,
}

impl FetchedResponse {
    /// Body as UTF-8. Invalid bytes are an error rather than replaced.
    pub fn text(&self) -> Result<String, std::str::Utf8Error> {
        std::str::from_utf8(&self.body).map(str::to_owned)
    }
}

#[derive(Debug, Error)]
pub enum FetchError {
    #[error("request failed: {0}")]
    Request(#[from] reqwest::Error),
    #[error("http status {status} for {url}")]
    HttpStatus { status: u16, url: String },
}

impl FetchError {
    pub fn kind(&self) -> ErrorKind {
        ErrorKind::Fetch
    }
}

impl HttpFetcher {
    pub fn new(config: HttpClientConfig) -> anyhow::Result<Self> {
        let mut builder = reqwest::Client::builder()
            .gzip(true)
            .brotli(true)
            .timeout(config.timeout);

        if let Some(user_agent) = &config.user_agent {
            builder = builder.user_agent(user_agent.clone());
        }

        let client = builder.build().context("building reqwest client")?;

        Ok(Self {
            client,
            backoff: config.backoff,
        })
    }

    /// GET `url`, failing on transport errors and non-success statuses.
    pub async fn fetch_bytes(&self, run_id: Uuid, url: &str) -> Result<FetchedResponse, FetchError> {
        let span = info_span!("http_fetch", %run_id, url);
        self.fetch_with_backoff(url).instrument(span).await
    }

    async fn fetch_with_backoff(&self, url: &str) -> Result<FetchedResponse, FetchError> {
        let mut attempt = 0usize;
        loop {
            match self.client.get(url).send().await {
                Ok(resp) => {
                    let status = resp.status();
                    let final_url = resp.url().to_string();

                    if status.is_success() {
                        let body = resp.bytes().await?.to_vec();
                        debug!(status = status.as_u16(), bytes = body.len(), "fetched");
                        return Ok(FetchedResponse {
                            status,
                            final_url,
                            body,
                        });
                    }

                    if classify_status(status) == RetryDisposition::Retryable
                        && attempt < self.backoff.max_retries
                    {
                        warn!(status = status.as_u16(), attempt, "retrying after status");
                        tokio::time::sleep(self.backoff.delay_for_attempt(attempt)).await;
                        attempt += 1;
                        continue;
                    }

                    return Err(FetchError::HttpStatus {
                        status: status.as_u16(),
                        url: final_url,
                    });
                }
                Err(err) => {
                    if classify_reqwest_error(&err) == RetryDisposition::Retryable
                        && attempt < self.backoff.max_retries
                    {
                        warn!(error = %err, attempt, "retrying after request error");
                        tokio::time::sleep(self.backoff.delay_for_attempt(attempt)).await;
                        attempt += 1;
                        continue;
                    }
                    return Err(FetchError::Request(err));
                }
            }
        }
    }
}

/// One row of the export file.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExportRow {
    #[serde(rename = "Title")]
    pub title: String,
    #[serde(rename = "Rating")]
    pub rating: u8,
    #[serde(rename = "Price")]
    pub price: String,
    #[serde(rename = "Availability")]
    pub availability: String,
}

impl From<&Listing> for ExportRow {
    fn from(listing: &Listing) -> Self {
        Self {
            title: listing.title.clone(),
            rating: listing.rating.value(),
            price: listing.price.to_string(),
            availability: if listing.availability { "True" } else { "False" }.to_string(),
        }
    }
}

impl TryFrom<ExportRow> for Listing {
    type Error = ConversionError;

    fn try_from(row: ExportRow) -> Result<Self, Self::Error> {
        let availability = match row.availability.as_str() {
            "True" => true,
            "False" => false,
            other => return Err(ConversionError::InvalidAvailability(other.to_string())),
        };
        Ok(Listing {
            title: row.title,
            rating: Rating::new(row.rating)?,
            price: Price::from_plain_text(&row.price)?,
            availability,
        })
    }
}

#[derive(Debug, Clone)]
pub struct WrittenExport {
    pub path: PathBuf,
    pub rows: usize,
    pub byte_size: usize,
    pub sha256: String,
}

pub fn sha256_hex(bytes: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(bytes);
    hex::encode(hasher.finalize())
}

/// Render listings as CSV with the fixed header row.
pub fn encode_export(listings: &[Listing]) -> anyhow::Result<Vec<u8>> {
    let mut writer = csv::WriterBuilder::new()
        .has_headers(false)
        .from_writer(Vec::new());
    writer
        .write_record(EXPORT_HEADER)
        .context("writing export header")?;
    for listing in listings {
        writer
            .serialize(ExportRow::from(listing))
            .with_context(|| format!("serializing export row for {:?}", listing.title))?;
    }
    writer.into_inner().context("flushing export buffer")
}

pub fn decode_export(bytes: &[u8]) -> anyhow::Result<Vec<Listing>> {
    let mut reader = csv::ReaderBuilder::new()
        .has_headers(true)
        .from_reader(bytes);
    let headers = reader.headers().context("reading export header")?;
    if headers.iter().ne(EXPORT_HEADER) {
        anyhow::bail!("unexpected export header {:?}", headers);
    }
    reader
        .deserialize::<ExportRow>()
        .enumerate()
        .map(|(idx, row)| {
            let row = row.with_context(|| format!("reading export row {}", idx + 1))?;
            Listing::try_from(row).with_context(|| format!("converting export row {}", idx + 1))
        })
        .collect()
}

/// Write the export, replacing any previous file via temp-file + rename.
pub async fn write_export(
    path: impl AsRef<Path>,
    listings: &[Listing],
) -> anyhow::Result<WrittenExport> {
    let path = path.as_ref();
    let bytes = encode_export(listings)?;

    let parent = match path.parent() {
        Some(parent) if !parent.as_os_str().is_empty() => parent.to_path_buf(),
        _ => PathBuf::from("."),
    };
    fs::create_dir_all(&parent)
        .await
        .with_context(|| format!("creating export directory {}", parent.display()))?;

    let temp_path = parent.join(format!(".{}.{}.tmp", Uuid::new_v4(), bytes.len()));
    let mut file = fs::OpenOptions::new()
        .create_new(true)
        .write(true)
        .open(&temp_path)
        .await
        .with_context(|| format!("opening temp export file {}", temp_path.display()))?;
    file.write_all(&bytes)
        .await
        .with_context(|| format!("writing temp export file {}", temp_path.display()))?;
    file.flush()
        .await
        .with_context(|| format!("flushing temp export file {}", temp_path.display()))?;
    drop(file);

    if let Err(err) = fs::rename(&temp_path, path).await {
        let _ = fs::remove_file(&temp_path).await;
        return Err(err).with_context(|| {
            format!(
                "renaming temp export {} -> {}",
                temp_path.display(),
                path.display()
            )
        });
    }

    Ok(WrittenExport {
        path: path.to_path_buf(),
        rows: listings.len(),
        byte_size: bytes.len(),
        sha256: sha256_hex(&bytes),
    })
}

pub async fn read_export(path: impl AsRef<Path>) -> anyhow::Result<Vec<Listing>> {
    let path = path.as_ref();
    let bytes = fs::read(path)
        .await
        .with_context(|| format!("reading export {}", path.display()))?;
    decode_export(&bytes).with_context(|| format!("parsing export {}", path.display()))
}
