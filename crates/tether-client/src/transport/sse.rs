//! SSE transport: a long-lived event stream for inbound frames, HTTP
//! POST for outbound ones.

use std::collections::HashMap;
use std::sync::Mutex as StdMutex;

use async_trait::async_trait;
use futures::StreamExt;
use reqwest_eventsource::{Event, EventSource};
use tokio::sync::{mpsc, Mutex};
use tokio::task::JoinHandle;
use tracing::{debug, error, warn};

use tether_protocol::message::JsonRpcMessage;

use super::{Lifecycle, Transport};
use crate::error::ClientError;

const INBOUND_DEPTH: usize = 100;

pub struct SseTransport {
    url: String,
    headers: HashMap<String, String>,
    lifecycle: StdMutex<Lifecycle>,
    client: StdMutex<Option<reqwest::Client>>,
    listener: StdMutex<Option<JoinHandle<()>>>,
    inbound_rx: Mutex<Option<mpsc::Receiver<JsonRpcMessage>>>,
}

impl SseTransport {
    /// Capture the endpoint. The event-stream listener starts in
    /// `open()`.
    pub fn new(url: impl Into<String>, headers: Option<HashMap<String, String>>) -> Self {
        Self {
            url: url.into(),
            headers: headers.unwrap_or_default(),
            lifecycle: StdMutex::new(Lifecycle::Unopened),
            client: StdMutex::new(None),
            listener: StdMutex::new(None),
            inbound_rx: Mutex::new(None),
        }
    }

    fn lifecycle(&self) -> Lifecycle {
        *lock(&self.lifecycle)
    }
}

fn lock<T>(mutex: &StdMutex<T>) -> std::sync::MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

#[async_trait]
impl Transport for SseTransport {
    async fn open(&self) -> Result<(), ClientError> {
        match self.lifecycle() {
            Lifecycle::Unopened => {}
            Lifecycle::Open => return Ok(()),
            Lifecycle::Closed => return Err(ClientError::TransportClosed),
        }

        let client = reqwest::Client::new();
        let mut builder = client.get(&self.url).header("Accept", "text/event-stream");
        for (key, value) in &self.headers {
            builder = builder.header(key.as_str(), value.as_str());
        }

        let mut source = EventSource::new(builder)
            .map_err(|e| ClientError::transport(format!("failed to create SSE stream: {e}")))?;

        let (tx, rx) = mpsc::channel(INBOUND_DEPTH);
        let handle = tokio::spawn(async move {
            while let Some(event) = source.next().await {
                match event {
                    Ok(Event::Message(message)) => {
                        let data = message.data.trim();
                        if data.is_empty() || data == "[DONE]" {
                            continue;
                        }
                        match data.parse::<JsonRpcMessage>() {
                            Ok(frame) => {
                                if tx.send(frame).await.is_err() {
                                    break;
                                }
                            }
                            Err(err) => {
                                warn!(error = %err, "skipping malformed SSE frame");
                            }
                        }
                    }
                    Ok(Event::Open) => debug!("SSE stream opened"),
                    Err(err) => {
                        error!(error = %err, "SSE stream failed");
                        break;
                    }
                }
            }
            // tx drops here: receive() observes EOF.
        });

        *lock(&self.client) = Some(client);
        *lock(&self.listener) = Some(handle);
        *self.inbound_rx.lock().await = Some(rx);
        *lock(&self.lifecycle) = Lifecycle::Open;
        Ok(())
    }

    async fn send(&self, message: &JsonRpcMessage) -> Result<(), ClientError> {
        let Some(client) = lock(&self.client).clone() else {
            return Err(ClientError::TransportClosed);
        };

        let mut builder = client
            .post(&self.url)
            .header("Content-Type", "application/json");
        for (key, value) in &self.headers {
            builder = builder.header(key.as_str(), value.as_str());
        }

        let response = builder
            .body(message.encode()?)
            .send()
            .await
            .map_err(|e| ClientError::transport(format!("HTTP POST failed: {e}")))?;

        let status = response.status();
        if !status.is_success() {
            return Err(ClientError::transport(format!("HTTP {status} from server")));
        }
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
        if let Some(handle) = lock(&self.listener).take() {
            handle.abort();
        }
        *lock(&self.client) = None;
        Ok(())
    }
}
