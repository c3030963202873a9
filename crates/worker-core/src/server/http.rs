//! ============================================================================
//! HTTP Grid Server - reqwest client for the coordinating server
//! ============================================================================
//! Form-encoded requests for task assignment and match results, multipart
//! uploads for training games, streamed GETs for assets.
//! ============================================================================

use std::path::Path;

use async_trait::async_trait;
use futures_util::StreamExt;
use reqwest::multipart::{Form, Part};
use reqwest::StatusCode;
use tokio::io::AsyncWriteExt;
use tracing::{debug, info, warn};

use super::{DownloadSink, GameUpload, GridServer, MatchUpload};
use crate::error::{WorkerError, WorkerResult};
use crate::types::{ClientMeta, NextGameResponse, Task};

/// Marker the server puts in bodies that reject the client version
const UPGRADE_MARKER: &str = " upgrade ";

/// Grid server reached over HTTP
pub struct HttpGridServer {
    client: reqwest::Client,
    base_url: String,
}

impl HttpGridServer {
    /// Create a client for the server at `base_url` (e.g. http://api.example.org)
    pub fn new(base_url: &str) -> Self {
        let client = reqwest::Client::builder()
            .user_agent(concat!("grid-worker/", env!("CARGO_PKG_VERSION")))
            .build()
            .unwrap_or_else(|_| reqwest::Client::new());

        Self {
            client,
            base_url: base_url.trim_end_matches('/').to_string(),
        }
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    fn url(&self, path: &str) -> String {
        format!("{}/{}", self.base_url, path)
    }

    async fn post_form(&self, path: &str, fields: &[(String, String)]) -> WorkerResult<String> {
        let url = self.url(path);
        let response = self
            .client
            .post(&url)
            .form(fields)
            .send()
            .await
            .map_err(|e| WorkerError::Network(format!("POST {} failed: {}", url, e)))?;

        let status = response.status();
        let body = response.text().await.unwrap_or_default();
        check_response(&url, status, &body)?;
        Ok(body)
    }

    async fn stream_into(&self, url: &str, out: DownloadSink<'_>) -> WorkerResult<u64> {
        let response = self
            .client
            .get(url)
            .send()
            .await
            .map_err(|e| WorkerError::Network(format!("GET {} failed: {}", url, e)))?;

        if response.status().as_u16() >= 400 {
            return Err(WorkerError::Network(format!(
                "GET {} returned {}",
                url,
                response.status()
            )));
        }

        let mut written = 0u64;
        let mut stream = response.bytes_stream();
        while let Some(chunk) = stream.next().await {
            let chunk = chunk?;
            out.write_all(&chunk).await?;
            written += chunk.len() as u64;
        }
        out.flush().await?;

        debug!("Downloaded {} bytes from {}", written, url);
        Ok(written)
    }
}

/// Map a response to an error when the server rejected it
fn check_response(url: &str, status: StatusCode, body: &str) -> WorkerResult<()> {
    if status.is_success() {
        return Ok(());
    }
    if body.contains(UPGRADE_MARKER) {
        warn!("The client version you are using is not accepted by the server");
        return Err(WorkerError::ServerRejected(body.trim().to_string()));
    }
    Err(WorkerError::Network(format!("{} returned {}: {}", url, status, body.trim())))
}

fn file_name(path: &Path) -> String {
    path.file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_else(|| "training.gz".to_string())
}

#[async_trait]
impl GridServer for HttpGridServer {
    async fn next_task(&self, meta: &ClientMeta) -> WorkerResult<Task> {
        let body = self.post_form("next_game", &meta.form_fields()).await?;

        let response: NextGameResponse = match serde_json::from_str(&body) {
            Ok(r) => r,
            Err(e) => {
                if body.contains(UPGRADE_MARKER) {
                    return Err(WorkerError::ServerRejected(body.trim().to_string()));
                }
                warn!("Bad JSON from next_game -- {}", body);
                return Err(e.into());
            }
        };

        if response.sha.is_empty() {
            return Err(WorkerError::Network("Server gave back empty SHA".into()));
        }

        Task::from_response(response)
    }

    async fn fetch_asset(&self, id: &str, out: DownloadSink<'_>) -> WorkerResult<u64> {
        let url = format!("{}?sha={}", self.url("get_network"), id);
        info!("Downloading network {}", id);
        self.stream_into(&url, out).await
    }

    async fn fetch_url(&self, url: &str, out: DownloadSink<'_>) -> WorkerResult<u64> {
        info!("Downloading {}", url);
        self.stream_into(url, out).await
    }

    async fn upload_game(&self, upload: GameUpload<'_>) -> WorkerResult<()> {
        let path = &upload.record.training_file;
        let bytes = tokio::fs::read(path).await?;

        let mut form = Form::new();
        for (key, value) in upload.meta.form_fields() {
            form = form.text(key, value);
        }
        form = form
            .text("training_id", upload.task.training_id.to_string())
            .text("network_id", upload.task.network_id.to_string())
            .text("pgn", upload.record.pgn.clone())
            .text("engineVersion", upload.engine_version.to_string());
        if upload.record.has_fp_threshold() {
            form = form.text("fp_threshold", format!("{:E}", upload.record.fp_threshold));
        }
        form = form.part("file", Part::bytes(bytes).file_name(file_name(path)));

        let url = self.url("upload_game");
        let response = self
            .client
            .post(&url)
            .multipart(form)
            .send()
            .await
            .map_err(|e| WorkerError::Network(format!("POST {} failed: {}", url, e)))?;

        let status = response.status();
        let body = response.text().await.unwrap_or_default();
        check_response(&url, status, &body)
    }

    async fn upload_match_result(&self, upload: MatchUpload<'_>) -> WorkerResult<()> {
        let mut fields = upload.meta.form_fields();
        fields.push(("engineVersion".into(), upload.engine_version.to_string()));
        fields.push(("match_game_id".into(), upload.match_game_id.to_string()));
        fields.push(("result".into(), upload.result.to_string()));
        fields.push(("pgn".into(), upload.record.pgn.clone()));

        self.post_form("match_result", &fields).await.map(|_| ())
    }
}
