//! StreamableHTTP transport.
//!
//! Requests go out as HTTP POST; the server answers with plain JSON or
//! with an event stream embedded in the POST response body. Either way
//! the frames land in the inbound channel that `receive()` drains, so
//! the correlator sees the same contract as stdio.

use std::collections::HashMap;
use std::sync::Mutex as StdMutex;

use async_trait::async_trait;
use tokio::sync::{mpsc, Mutex};
use tracing::debug;

use tether_protocol::message::JsonRpcMessage;

use super::{Lifecycle, Transport};
use crate::error::ClientError;

const INBOUND_DEPTH: usize = 100;

pub struct HttpTransport {
    url: String,
    headers: HashMap<String, String>,
    lifecycle: StdMutex<Lifecycle>,
    client: StdMutex<Option<reqwest::Client>>,
    inbound_tx: StdMutex<Option<mpsc::Sender<JsonRpcMessage>>>,
    inbound_rx: Mutex<Option<mpsc::Receiver<JsonRpcMessage>>>,
}

impl HttpTransport {
    /// Capture the endpoint. The HTTP client and channels are created in
    /// `open()`.
    pub fn new(url: impl Into<String>, headers: Option<HashMap<String, String>>) -> Self {
        Self {
            url: url.into(),
            headers: headers.unwrap_or_default(),
            lifecycle: StdMutex::new(Lifecycle::Unopened),
            client: StdMutex::new(None),
            inbound_tx: StdMutex::new(None),
            inbound_rx: Mutex::new(None),
        }
    }

    fn lifecycle(&self) -> Lifecycle {
        *lock(&self.lifecycle)
    }

    fn push_frames_from_body(
        &self,
        content_type: &str,
        body: &str,
        tx: &mpsc::Sender<JsonRpcMessage>,
    ) {
        if content_type.contains("text/event-stream") {
            for line in body.lines() {
                let Some(data) = line.trim().strip_prefix("data:") else {
                    continue;
                };
                let data = data.trim();
                if data.is_empty() || data == "[DONE]" {
                    continue;
                }
                match data.parse::<JsonRpcMessage>() {
                    Ok(message) => {
                        let _ = tx.try_send(message);
                    }
                    Err(error) => debug!(%error, "skipping malformed SSE data line"),
                }
            }
        } else if !body.is_empty() {
            match body.parse::<JsonRpcMessage>() {
                Ok(message) => {
                    let _ = tx.try_send(message);
                }
                Err(error) => debug!(%error, "skipping malformed response body"),
            }
        }
    }
}

fn lock<T>(mutex: &StdMutex<T>) -> std::sync::MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

#[async_trait]
impl Transport for HttpTransport {
    async fn open(&self) -> Result<(), ClientError> {
        match self.lifecycle() {
            Lifecycle::Unopened => {}
            Lifecycle::Open => return Ok(()),
            Lifecycle::Closed => return Err(ClientError::TransportClosed),
        }
        let (tx, rx) = mpsc::channel(INBOUND_DEPTH);
        *lock(&self.client) = Some(reqwest::Client::new());
        *lock(&self.inbound_tx) = Some(tx);
        *self.inbound_rx.lock().await = Some(rx);
        *lock(&self.lifecycle) = Lifecycle::Open;
        Ok(())
    }

    async fn send(&self, message: &JsonRpcMessage) -> Result<(), ClientError> {
        let (client, tx) = {
            let client = lock(&self.client).clone();
            let tx = lock(&self.inbound_tx).clone();
            match (client, tx) {
                (Some(client), Some(tx)) => (client, tx),
                _ => return Err(ClientError::TransportClosed),
            }
        };

        let mut builder = client
            .post(&self.url)
            .header("Content-Type", "application/json")
            .header("Accept", "application/json, text/event-stream");
        for (key, value) in &self.headers {
            builder = builder.header(key.as_str(), value.as_str());
        }

        let body = message.encode()?;
        let response = builder
            .body(body)
            .send()
            .await
            .map_err(|e| ClientError::transport(format!("HTTP request failed: {e}")))?;

        let status = response.status();
        if !status.is_success() {
            return Err(ClientError::transport(format!("HTTP {status} from server")));
        }

        let content_type = response
            .headers()
            .get("content-type")
            .and_then(|v| v.to_str().ok())
            .unwrap_or("")
            .to_string();
        let text = response
            .text()
            .await
            .map_err(|e| ClientError::transport(format!("failed to read response body: {e}")))?;

        self.push_frames_from_body(&content_type, &text, &tx);
        Ok(())
    }

    async fn receive(&self) -> Result<Option<JsonRpcMessage>, ClientError> {
        let mut guard = self.inbound_rx.lock().await;
        match guard.as_mut() {
            Some(inbound) => Ok(inbound.recv().await),
            None => Err(ClientError::TransportClosed),
        }
    }

    async fn close(&self) -> Result<(), ClientError> {
        {
            let mut lifecycle = lock(&self.lifecycle);
            if *lifecycle == Lifecycle::Closed {
                return Ok(());
            }
            *lifecycle = Lifecycle::Closed;
        }
        *lock(&self.inbound_tx) = None;
        *lock(&self.client) = None;
        Ok(())
    }
}
