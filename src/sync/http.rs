//! JSON-over-HTTP remote. The session is cookie based; the client keeps
//! whatever cookies the auth service set.

use std::time::Duration;

use async_trait::async_trait;
use reqwest::{Client, StatusCode};
use serde::{Deserialize, Serialize};

use super::remote::{PullResponse, PushAck, PushItem, RemoteEndpoint, TransportError};

#[derive(Serialize)]
struct PushRequest<'a> {
    items: &'a [PushItem],
}

#[derive(Deserialize)]
struct PushResponse {
    acks: Vec<PushAck>,
}

pub struct HttpRemote {
    client: Client,
    base_url: String,
}

impl HttpRemote {
    pub fn new(base_url: &str) -> Result<Self, TransportError> {
        let client = Client::builder()
            .cookie_store(true)
            .timeout(Duration::from_secs(30))
            .build()
            .map_err(|e| TransportError::Network(e.to_string()))?;
        Ok(Self::with_client(client, base_url))
    }

    pub fn with_client(client: Client, base_url: &str) -> Self {
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
}

fn send_error(err: reqwest::Error) -> TransportError {
    if err.is_decode() {
        TransportError::Protocol(err.to_string())
    } else {
        TransportError::Network(err.to_string())
    }
}

fn check_status(status: StatusCode) -> Result<(), TransportError> {
    match status {
        StatusCode::UNAUTHORIZED | StatusCode::FORBIDDEN => {
            Err(TransportError::Unauthorized(status.to_string()))
        }
        s if s.is_success() => Ok(()),
        s if s.is_server_error() || s == StatusCode::TOO_MANY_REQUESTS => {
            Err(TransportError::Network(s.to_string()))
        }
        s => Err(TransportError::Protocol(s.to_string())),
    }
}

#[async_trait]
impl RemoteEndpoint for HttpRemote {
    async fn push(&self, items: Vec<PushItem>) -> Result<Vec<PushAck>, TransportError> {
        let response = self
            .client
            .post(self.url("sync/push"))
            .json(&PushRequest { items: &items })
            .send()
            .await
            .map_err(send_error)?;
        check_status(response.status())?;
        let body: PushResponse = response.json().await.map_err(send_error)?;
        Ok(body.acks)
    }

    async fn pull(&self, watermark: Option<String>) -> Result<PullResponse, TransportError> {
        let mut request = self.client.get(self.url("sync/pull"));
        if let Some(since) = watermark.as_deref() {
            request = request.query(&[("since", since)]);
        }
        let response = request.send().await.map_err(send_error)?;
        check_status(response.status())?;
        response.json().await.map_err(send_error)
    }
}
