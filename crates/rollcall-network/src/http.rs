//! Multipart upload to the attendance endpoint.

use std::time::Duration;

use async_trait::async_trait;
use reqwest::multipart::{Form, Part};
use rollcall_types::{
    attendance::AttendanceResponse, config::EndpointConfig, frame::EncodedImage, Result,
};
use tracing::{debug, warn};

use crate::network_error;

/// Longest slice of a bad response body quoted in an error.
const BODY_SNIPPET_LEN: usize = 200;

#[async_trait]
pub trait AttendanceClient: Send + Sync {
    /// Uploads one encoded frame and returns the parsed JSON reply.
    async fn mark_attendance(&self, image: &EncodedImage) -> Result<AttendanceResponse>;
}

/// `AttendanceClient` over HTTP: `POST` with a single multipart file part.
pub struct HttpAttendanceClient {
    client: reqwest::Client,
    url: String,
    field_name: String,
    file_name: String,
}

impl HttpAttendanceClient {
    pub fn new(config: &EndpointConfig) -> Result<Self> {
        let mut builder = reqwest::Client::builder();
        if let Some(timeout_ms) = config.timeout_ms {
            builder = builder.timeout(Duration::from_millis(timeout_ms));
        }
        let client = builder
            .build()
            .map_err(|e| network_error(format!("failed to build HTTP client: {e}")))?;

        Ok(Self {
            client,
            url: config.url.trim().to_string(),
            field_name: config.field_name.clone(),
            file_name: config.file_name.clone(),
        })
    }

    pub fn url(&self) -> &str {
        &self.url
    }

    fn form(&self, image: &EncodedImage) -> Result<Form> {
        let part = Part::bytes(image.bytes.clone())
            .file_name(self.file_name.clone())
            .mime_str(image.content_type)
            .map_err(|e| network_error(format!("invalid part content type: {e}")))?;
        Ok(Form::new().part(self.field_name.clone(), part))
    }
}

#[async_trait]
impl AttendanceClient for HttpAttendanceClient {
    async fn mark_attendance(&self, image: &EncodedImage) -> Result<AttendanceResponse> {
        let form = self.form(image)?;
        debug!("Uploading {} bytes to {}", image.len(), self.url);

        let resp = self
            .client
            .post(&self.url)
            .multipart(form)
            .send()
            .await
            .map_err(|e| network_error(format!("upload to {} failed: {e}", self.url)))?;

        let status = resp.status();
        let body = resp.text().await.map_err(|e| {
            network_error(format!("failed to read response body ({status}): {e}"))
        })?;

        if !status.is_success() {
            warn!("Attendance endpoint answered {status}");
            return Err(network_error(format!(
                "endpoint returned {status}: {}",
                snippet(&body)
            )));
        }

        serde_json::from_str(&body).map_err(|e| {
            network_error(format!(
                "response is not valid JSON ({e}): {}",
                snippet(&body)
            ))
        })
    }
}

fn snippet(body: &str) -> String {
    let trimmed = body.trim();
    match trimmed.char_indices().nth(BODY_SNIPPET_LEN) {
        Some((idx, _)) => format!("{}...", &trimmed[..idx]),
        None => trimmed.to_string(),
    }
}
