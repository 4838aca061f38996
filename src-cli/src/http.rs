//! Requests against the service's HTTP endpoint.

use std::path::Path;

use asrbridge_common::{ServiceStatus, SessionId};
use reqwest::{Client, Response, StatusCode};
use serde::Deserialize;

use crate::client::ClientError;

/// Multipart field the service reads uploads from.
const UPLOAD_FIELD: &str = "wav_file";

#[derive(Deserialize)]
struct ErrorBody {
    error: String,
}

pub struct ServiceApi {
    base: String,
    http: Client,
}

impl ServiceApi {
    pub fn new(host: &str, port: u16) -> Self {
        Self {
            base: format!("http://{}:{}", host, port),
            http: Client::new(),
        }
    }

    /// Upload a whole file for batch decoding and return the hypothesis.
    pub async fn upload(&self, path: &Path) -> Result<String, ClientError> {
        let data = tokio::fs::read(path).await?;
        let file_name = path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_else(|| "audio.wav".to_string());
        let part = reqwest::multipart::Part::bytes(data)
            .file_name(file_name)
            .mime_str("audio/wav")?;
        let form = reqwest::multipart::Form::new().part(UPLOAD_FIELD, part);

        let response = self
            .http
            .post(format!("{}/upload", self.base))
            .multipart(form)
            .send()
            .await?;
        Ok(check(response).await?.text().await?)
    }

    pub async fn status(&self) -> Result<ServiceStatus, ClientError> {
        let response = self.http.get(format!("{}/status", self.base)).send().await?;
        Ok(check(response).await?.json().await?)
    }

    /// Stop a streaming session. Returns false if it was not open.
    pub async fn stop_session(&self, id: SessionId) -> Result<bool, ClientError> {
        let response = self
            .http
            .delete(format!("{}/sessions/{}", self.base, id))
            .send()
            .await?;
        if response.status() == StatusCode::NOT_FOUND {
            return Ok(false);
        }
        check(response).await?;
        Ok(true)
    }
}

/// Turn a non-success answer into an error carrying the service's message.
async fn check(response: Response) -> Result<Response, ClientError> {
    let status = response.status();
    if status.is_success() {
        return Ok(response);
    }
    let body = response.text().await.unwrap_or_default();
    let message = serde_json::from_str::<ErrorBody>(&body)
        .map(|b| b.error)
        .unwrap_or(body);
    Err(ClientError::Rejected {
        status: status.as_u16(),
        message,
    })
}
