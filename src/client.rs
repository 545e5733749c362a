use log::debug;
use reqwest::{Client, Response, StatusCode};
use serde::Serialize;
use std::time::Duration;

use crate::chunk_wire::{self, WireChunk};
use crate::transport::{ChunkStore, EventTransport, SessionControl, TimelineSource, TransportError};
use crate::types::{
    CaptureSummary, DynError, EventBatch, RecordingMetadata, SessionStatus, TimelineResponse,
};

/// HTTP client for the store server
#[derive(Clone)]
pub struct HttpStore {
    base_url: String,
    client: Client,
}

#[derive(Serialize)]
struct OpenSessionRequest<'a> {
    session_id: &'a str,
    start_time_ms: i64,
}

#[derive(Serialize)]
struct CloseSessionRequest {
    status: SessionStatus,
    end_time_ms: i64,
}

fn network_error(e: reqwest::Error) -> TransportError {
    TransportError::Network(e.to_string())
}

async fn check_status(response: Response) -> Result<Response, TransportError> {
    let status = response.status();
    if status.is_success() {
        return Ok(response);
    }
    let body = response.text().await.unwrap_or_default();
    Err(TransportError::Status {
        code: status.as_u16(),
        body,
    })
}

impl HttpStore {
    pub fn new(base_url: &str) -> Result<Self, DynError> {
        let parsed = url::Url::parse(base_url)
            .map_err(|e| format!("Invalid store URL '{}': {}", base_url, e))?;
        let client = Client::builder()
            .connect_timeout(Duration::from_secs(10))
            .timeout(Duration::from_secs(60))
            .build()
            .map_err(|e| format!("Failed to build HTTP client: {}", e))?;
        Ok(Self {
            base_url: parsed.as_str().trim_end_matches('/').to_string(),
            client,
        })
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    fn session_url(&self, session_id: &str, suffix: &str) -> String {
        format!(
            "{}/api/sessions/{}{}",
            self.base_url,
            urlencoding::encode(session_id),
            suffix
        )
    }

    async fn get_optional_bytes(&self, url: &str) -> Result<Option<Vec<u8>>, TransportError> {
        let response = self.client.get(url).send().await.map_err(network_error)?;
        if response.status() == StatusCode::NOT_FOUND {
            return Ok(None);
        }
        let response = check_status(response).await?;
        let body = response.bytes().await.map_err(network_error)?;
        Ok(Some(body.to_vec()))
    }
}

impl ChunkStore for HttpStore {
    async fn put_chunk(&self, chunk: WireChunk) -> Result<(), TransportError> {
        let url = self.session_url(&chunk.session_id, &format!("/chunks/{}", chunk.chunk_index));
        let body = chunk_wire::encode_chunk(&chunk);
        let response = self
            .client
            .put(&url)
            .header(reqwest::header::CONTENT_TYPE, chunk_wire::CONTENT_TYPE)
            .body(body)
            .send()
            .await
            .map_err(network_error)?;
        check_status(response).await?;
        Ok(())
    }

    async fn finalize(
        &self,
        session_id: &str,
        summary: CaptureSummary,
    ) -> Result<RecordingMetadata, TransportError> {
        let url = self.session_url(session_id, "/finalize");
        let response = self
            .client
            .post(&url)
            .json(&summary)
            .send()
            .await
            .map_err(network_error)?;
        check_status(response)
            .await?
            .json::<RecordingMetadata>()
            .await
            .map_err(|e| TransportError::Decode(e.to_string()))
    }
}

impl EventTransport for HttpStore {
    async fn send_batch(&self, batch: EventBatch) -> Result<(), TransportError> {
        let url = format!("{}/api/events/batch", self.base_url);
        let response = self
            .client
            .post(&url)
            .json(&batch)
            .send()
            .await
            .map_err(network_error)?;
        check_status(response).await?;
        Ok(())
    }

    fn send_beacon(&self, batch: EventBatch) -> bool {
        let url = format!("{}/api/events/batch", self.base_url);
        match tokio::runtime::Handle::try_current() {
            Ok(handle) => {
                let client = self.client.clone();
                handle.spawn(async move {
                    match client.post(&url).json(&batch).send().await {
                        Ok(response) => debug!("Beacon delivered: HTTP {}", response.status()),
                        Err(e) => debug!("Beacon lost: {}", e),
                    }
                });
                true
            }
            // Outside a runtime (process exit path) fall back to a detached thread
            Err(_) => std::thread::Builder::new()
                .name("event-beacon".to_string())
                .spawn(move || {
                    let client = reqwest::blocking::Client::new();
                    match client.post(&url).json(&batch).send() {
                        Ok(response) => debug!("Beacon delivered: HTTP {}", response.status()),
                        Err(e) => debug!("Beacon lost: {}", e),
                    }
                })
                .is_ok(),
        }
    }
}

impl SessionControl for HttpStore {
    async fn open_session(&self, session_id: &str, start_time_ms: i64) -> Result<(), TransportError> {
        let url = format!("{}/api/sessions", self.base_url);
        let response = self
            .client
            .post(&url)
            .json(&OpenSessionRequest {
                session_id,
                start_time_ms,
            })
            .send()
            .await
            .map_err(network_error)?;
        check_status(response).await?;
        Ok(())
    }

    async fn close_session(
        &self,
        session_id: &str,
        status: SessionStatus,
        end_time_ms: i64,
    ) -> Result<(), TransportError> {
        let url = self.session_url(session_id, "/close");
        let response = self
            .client
            .post(&url)
            .json(&CloseSessionRequest {
                status,
                end_time_ms,
            })
            .send()
            .await
            .map_err(network_error)?;
        check_status(response).await?;
        Ok(())
    }
}

impl TimelineSource for HttpStore {
    async fn fetch_timeline(&self, session_id: &str) -> Result<TimelineResponse, TransportError> {
        let url = format!(
            "{}/api/timeline?session_id={}",
            self.base_url,
            urlencoding::encode(session_id)
        );
        let response = self.client.get(&url).send().await.map_err(network_error)?;
        check_status(response)
            .await?
            .json::<TimelineResponse>()
            .await
            .map_err(|e| TransportError::Decode(e.to_string()))
    }

    async fn fetch_chunk(
        &self,
        session_id: &str,
        chunk_index: u32,
    ) -> Result<Option<Vec<u8>>, TransportError> {
        let url = format!(
            "{}/api/chunk?session_id={}&chunk_index={}",
            self.base_url,
            urlencoding::encode(session_id),
            chunk_index
        );
        self.get_optional_bytes(&url).await
    }

    async fn fetch_merged(&self, session_id: &str) -> Result<Option<Vec<u8>>, TransportError> {
        let url = format!(
            "{}/api/merged?session_id={}",
            self.base_url,
            urlencoding::encode(session_id)
        );
        self.get_optional_bytes(&url).await
    }

    async fn fetch_details(&self, session_id: &str) -> Result<serde_json::Value, TransportError> {
        let url = format!(
            "{}/api/session_details?session_id={}",
            self.base_url,
            urlencoding::encode(session_id)
        );
        let response = self.client.get(&url).send().await.map_err(network_error)?;
        check_status(response)
            .await?
            .json::<serde_json::Value>()
            .await
            .map_err(|e| TransportError::Decode(e.to_string()))
    }
}
