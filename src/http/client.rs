//! HTTP client with built-in retry logic and error handling.

use anyhow::{Context, Result};
use futures_util::StreamExt;
use indicatif::ProgressBar;
use log::{debug, warn};
use reqwest::Client;
use serde::de::DeserializeOwned;
use std::io::Write;

use super::retry::{MAX_RETRIES, NonRetryableError, RETRY_DELAY_MS, check_retryable};

/// Result of a completed transfer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Transfer {
    pub bytes: u64,
    /// Size announced by the server, if any.
    pub content_length: Option<u64>,
}

/// HTTP client with built-in retry logic for network operations.
#[derive(Clone)]
pub struct HttpClient {
    client: Client,
}

impl HttpClient {
    pub fn new(client: Client) -> Self {
        Self { client }
    }

    pub fn inner(&self) -> &Client {
        &self.client
    }

    /// GET with optional query parameters, deserializing the JSON response.
    /// Automatically retries on transient errors.
    #[tracing::instrument(skip(self, query))]
    pub async fn get_json<T: DeserializeOwned>(&self, url: &str, query: &[(&str, String)]) -> Result<T> {
        debug!("GET JSON from {} with query {:?}...", url, query);

        self.with_retry("GET JSON", || async {
            let response = self
                .client
                .get(url)
                .query(query)
                .send()
                .await
                .context("Failed to send request")?;

            let response = response.error_for_status().map_err(check_retryable)?;

            response
                .json::<T>()
                .await
                .context("Failed to parse JSON response")
        })
        .await
    }

    /// POST a raw body and deserialize the JSON response. Not retried.
    #[tracing::instrument(skip(self, body, query))]
    pub async fn post_bytes<T: DeserializeOwned>(
        &self,
        url: &str,
        query: &[(&str, String)],
        content_type: &str,
        body: Vec<u8>,
    ) -> Result<T> {
        debug!("POST {} bytes to {}...", body.len(), url);
        let response = self
            .client
            .post(url)
            .query(query)
            .header(reqwest::header::CONTENT_TYPE, content_type)
            .body(body)
            .send()
            .await
            .context("Failed to send request")?;

        let response = response.error_for_status().map_err(check_retryable)?;
        response
            .json::<T>()
            .await
            .context("Failed to parse JSON response")
    }

    /// Stream a URL into the writer produced by `create_writer`.
    /// Each attempt gets a fresh writer; transient failures are retried.
    #[tracing::instrument(skip(self, create_writer, progress))]
    pub async fn download_file<W, F>(
        &self,
        url: &str,
        create_writer: F,
        progress: Option<&ProgressBar>,
    ) -> Result<Transfer>
    where
        W: Write,
        F: Fn() -> Result<W>,
    {
        debug!("Downloading file from {}...", url);

        let mut attempt = 1;
        loop {
            match self.download_file_once(url, &create_writer, progress).await {
                Ok(transfer) => return Ok(transfer),
                Err(e) if e.downcast_ref::<NonRetryableError>().is_some() => return Err(e),
                Err(e) if attempt < MAX_RETRIES => {
                    warn!(
                        "Download attempt {}/{} failed ({}), retrying...",
                        attempt, MAX_RETRIES, e
                    );
                    attempt += 1;
                    tokio::time::sleep(std::time::Duration::from_millis(RETRY_DELAY_MS)).await;
                }
                Err(e) => return Err(e),
            }
        }
    }

    async fn download_file_once<W, F>(
        &self,
        url: &str,
        create_writer: &F,
        progress: Option<&ProgressBar>,
    ) -> Result<Transfer>
    where
        W: Write,
        F: Fn() -> Result<W>,
    {
        let response = self
            .client
            .get(url)
            .send()
            .await
            .context("Failed to start download request")?;

        let response = response.error_for_status().map_err(check_retryable)?;
        let content_length = response.content_length();

        if let Some(bar) = progress {
            bar.set_position(0);
            if let Some(len) = content_length {
                bar.set_length(len);
            }
        }

        let mut writer = create_writer()?;
        let mut bytes: u64 = 0;
        let mut stream = response.bytes_stream();

        while let Some(chunk) = stream.next().await {
            let chunk = chunk.context("Failed to read chunk from download stream")?;
            writer
                .write_all(&chunk)
                .context("Failed to write chunk to file")?;
            bytes += chunk.len() as u64;
            if let Some(bar) = progress {
                bar.set_position(bytes);
            }
        }
        writer.flush().context("Failed to flush downloaded file")?;

        debug!("Downloaded {:.2} MB", bytes as f64 / (1024.0 * 1024.0));

        Ok(Transfer {
            bytes,
            content_length,
        })
    }

    /// Executes an async operation with retry logic.
    async fn with_retry<F, Fut, T>(&self, operation_name: &str, operation: F) -> Result<T>
    where
        F: Fn() -> Fut,
        Fut: std::future::Future<Output = Result<T>>,
    {
        let mut attempt = 1;
        loop {
            match operation().await {
                Ok(result) => return Ok(result),
                Err(e) if !is_retryable_error(&e) => {
                    debug!("{}: non-retryable error: {}", operation_name, e);
                    return Err(e);
                }
                Err(e) if attempt < MAX_RETRIES => {
                    warn!(
                        "{}: attempt {}/{} failed ({}), retrying in {}ms...",
                        operation_name, attempt, MAX_RETRIES, e, RETRY_DELAY_MS
                    );
                    attempt += 1;
                    tokio::time::sleep(std::time::Duration::from_millis(RETRY_DELAY_MS)).await;
                }
                Err(e) => return Err(e),
            }
        }
    }
}

fn is_retryable_error(e: &anyhow::Error) -> bool {
    e.downcast_ref::<NonRetryableError>().is_none()
}
