//! Snapshot table persistence + HTTP fetch utilities for adwatch.

use std::marker::PhantomData;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::Context;
use async_trait::async_trait;
use reqwest::StatusCode;
use serde::de::DeserializeOwned;
use serde::Serialize;
use thiserror::Error;
use tokio::fs;
use tokio::io::AsyncWriteExt;
use tracing::{info_span, Instrument};
use uuid::Uuid;

pub const CRATE_NAME: &str = "adwatch-store";

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("reading {path}: {source}")]
    Read {
        path: PathBuf,
        source: std::io::Error,
    },
    #[error("writing {path}: {source}")]
    Write {
        path: PathBuf,
        source: std::io::Error,
    },
    #[error("decoding {path}: {source}")]
    Decode {
        path: PathBuf,
        source: serde_json::Error,
    },
    #[error("encoding rows for {path}: {source}")]
    Encode {
        path: PathBuf,
        source: serde_json::Error,
    },
}

/// A keyed table the engine's caller reads whole and writes back whole.
///
/// How the write lands (atomic replace, in-place patch) is the store's own
/// business; the engine never requires destructive rewrite semantics.
#[async_trait]
pub trait TableStore<T>: Send + Sync {
    async fn read(&self) -> Result<Vec<T>, StoreError>;
    async fn write(&self, rows: &[T]) -> Result<(), StoreError>;
}

/// JSON-file table store. A missing file reads as an empty table (first run);
/// writes go through a temp file in the same directory and an atomic rename.
#[derive(Debug, Clone)]
pub struct JsonTableStore<T> {
    path: PathBuf,
    _row: PhantomData<fn() -> T>,
}

impl<T> JsonTableStore<T> {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            _row: PhantomData,
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

#[async_trait]
impl<T> TableStore<T> for JsonTableStore<T>
where
    T: Serialize + DeserializeOwned + Send + Sync,
{
    async fn read(&self) -> Result<Vec<T>, StoreError> {
        let text = match fs::read_to_string(&self.path).await {
            Ok(text) => text,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(err) => {
                return Err(StoreError::Read {
                    path: self.path.clone(),
                    source: err,
                })
            }
        };
        serde_json::from_str(&text).map_err(|err| StoreError::Decode {
            path: self.path.clone(),
            source: err,
        })
    }

    async fn write(&self, rows: &[T]) -> Result<(), StoreError> {
        let bytes = serde_json::to_vec_pretty(rows).map_err(|err| StoreError::Encode {
            path: self.path.clone(),
            source: err,
        })?;

        if let Some(parent) = self.path.parent() {
            if !parent.as_os_str().is_empty() {
                fs::create_dir_all(parent).await.map_err(|err| StoreError::Write {
                    path: parent.to_path_buf(),
                    source: err,
                })?;
            }
        }

        let temp_name = format!(".{}.{}.tmp", Uuid::new_v4(), bytes.len());
        let temp_path = match self.path.parent() {
            Some(parent) if !parent.as_os_str().is_empty() => parent.join(temp_name),
            _ => PathBuf::from(temp_name),
        };

        let write_result = async {
            let mut file = fs::OpenOptions::new()
                .create_new(true)
                .write(true)
                .open(&temp_path)
                .await?;
            file.write_all(&bytes).await?;
            file.flush().await?;
            drop(file);
            fs::rename(&temp_path, &self.path).await
        }
        .await;

        match write_result {
            Ok(()) => Ok(()),
            Err(err) => {
                let _ = fs::remove_file(&temp_path).await;
                Err(StoreError::Write {
                    path: self.path.clone(),
                    source: err,
                })
            }
        }
    }
}

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

#[derive(Debug, Clone, Copy)]
pub struct BackoffPolicy {
    pub max_retries: usize,
    pub base_delay: Duration,
    pub max_delay: Duration,
}

impl Default for BackoffPolicy {
    fn default() -> Self {
        Self {
            max_retries: 3,
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

#[derive(Debug, Clone)]
pub struct FetchedResponse {
    pub status: StatusCode,
    pub final_url: String,
    pub body: Vec<u8>,
}

impl FetchedResponse {
    pub fn text(&self) -> String {
        String::from_utf8_lossy(&self.body).into_owned()
    }
}

#[derive(Debug, Error)]
pub enum FetchError {
    #[error("request failed after retries: {0}")]
    Request(#[from] reqwest::Error),
    #[error("http status {status} for {url}")]
    HttpStatus { status: u16, url: String },
}

/// Thin retrying HTTP client shared by the listing source and the notifier.
/// One reconciliation pass runs at a time, so there is no concurrency
/// limiting here; only timeouts and bounded exponential backoff.
#[derive(Debug)]
pub struct HttpClient {
    client: reqwest::Client,
    backoff: BackoffPolicy,
}

impl HttpClient {
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

    pub async fn get_bytes(&self, run_id: Uuid, url: &str) -> Result<FetchedResponse, FetchError> {
        self.send_with_retries(run_id, url, || self.client.get(url)).await
    }

    pub async fn post_form(
        &self,
        run_id: Uuid,
        url: &str,
        form: &[(&str, &str)],
    ) -> Result<FetchedResponse, FetchError> {
        self.send_with_retries(run_id, url, || self.client.post(url).form(form)).await
    }

    async fn send_with_retries(
        &self,
        run_id: Uuid,
        url: &str,
        build_request: impl Fn() -> reqwest::RequestBuilder,
    ) -> Result<FetchedResponse, FetchError> {
        let span = info_span!("http_request", %run_id, url);
        async {
            let mut last_request_error: Option<reqwest::Error> = None;

            for attempt in 0..=self.backoff.max_retries {
                match build_request().send().await {
                    Ok(resp) => {
                        let status = resp.status();
                        let final_url = resp.url().to_string();

                        if status.is_success() {
                            let body = resp.bytes().await?.to_vec();
                            return Ok(FetchedResponse {
                                status,
                                final_url,
                                body,
                            });
                        }

                        if classify_status(status) == RetryDisposition::Retryable
                            && attempt < self.backoff.max_retries
                        {
                            tokio::time::sleep(self.backoff.delay_for_attempt(attempt)).await;
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
                            last_request_error = Some(err);
                            tokio::time::sleep(self.backoff.delay_for_attempt(attempt)).await;
                            continue;
                        }
                        return Err(FetchError::Request(err));
                    }
                }
            }

            Err(FetchError::Request(
                last_request_error.expect("retry loop should capture a request error"),
            ))
        }
        .instrument(span)
        .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde::Deserialize;
    use std::time::Duration;
    use tempfile::tempdir;

    #[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
    struct Row {
        identity: String,
        views: u32,
    }

    #[tokio::test]
    async fn missing_file_reads_as_empty_table() {
        let dir = tempdir().expect("tempdir");
        let store: JsonTableStore<Row> = JsonTableStore::new(dir.path().join("snapshot.json"));
        let rows = store.read().await.expect("read");
        assert!(rows.is_empty());
    }

    #[tokio::test]
    async fn write_then_read_round_trips_rows() {
        let dir = tempdir().expect("tempdir");
        let store: JsonTableStore<Row> = JsonTableStore::new(dir.path().join("snapshot.json"));

        let rows = vec![
            Row {
                identity: "https://example.com/ad/1".into(),
                views: 5,
            },
            Row {
                identity: "https://example.com/ad/2".into(),
                views: 2,
            },
        ];
        store.write(&rows).await.expect("write");
        let read_back = store.read().await.expect("read");
        assert_eq!(read_back, rows);
    }

    #[tokio::test]
    async fn write_replaces_previous_contents_whole() {
        let dir = tempdir().expect("tempdir");
        let store: JsonTableStore<Row> = JsonTableStore::new(dir.path().join("snapshot.json"));

        store
            .write(&[Row {
                identity: "a".into(),
                views: 1,
            }])
            .await
            .expect("first write");
        store
            .write(&[Row {
                identity: "b".into(),
                views: 2,
            }])
            .await
            .expect("second write");

        let rows = store.read().await.expect("read");
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].identity, "b");
    }

    #[tokio::test]
    async fn write_leaves_no_temp_files_behind() {
        let dir = tempdir().expect("tempdir");
        let store: JsonTableStore<Row> = JsonTableStore::new(dir.path().join("snapshot.json"));
        store
            .write(&[Row {
                identity: "a".into(),
                views: 1,
            }])
            .await
            .expect("write");

        let leftovers: Vec<_> = std::fs::read_dir(dir.path())
            .expect("read_dir")
            .filter_map(|e| e.ok())
            .filter(|e| e.file_name().to_string_lossy().ends_with(".tmp"))
            .collect();
        assert!(leftovers.is_empty());
    }

    #[test]
    fn backoff_logic_is_exponential_and_capped() {
        let policy = BackoffPolicy {
            max_retries: 5,
            base_delay: Duration::from_millis(100),
            max_delay: Duration::from_millis(350),
        };

        assert_eq!(policy.delay_for_attempt(0), Duration::from_millis(100));
        assert_eq!(policy.delay_for_attempt(1), Duration::from_millis(200));
        assert_eq!(policy.delay_for_attempt(2), Duration::from_millis(350));
        assert_eq!(policy.delay_for_attempt(5), Duration::from_millis(350));
    }

    #[test]
    fn rate_limit_and_server_errors_are_retryable() {
        assert_eq!(
            classify_status(StatusCode::TOO_MANY_REQUESTS),
            RetryDisposition::Retryable
        );
        assert_eq!(
            classify_status(StatusCode::BAD_GATEWAY),
            RetryDisposition::Retryable
        );
        assert_eq!(
            classify_status(StatusCode::NOT_FOUND),
            RetryDisposition::NonRetryable
        );
    }
}
