//! Scripted in-memory transport for unit tests.

use std::collections::VecDeque;
use std::sync::Mutex as StdMutex;
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::{mpsc, Mutex};

use tether_protocol::message::{JsonRpcMessage, JsonRpcRequest};

use crate::error::ClientError;
use crate::transport::Transport;

type ReplyFn = Box<dyn Fn(&JsonRpcRequest) -> Vec<(Duration, JsonRpcMessage)> + Send + Sync>;

/// A transport whose "server" is a queue of reply scripts.
///
/// Every outbound frame is recorded. Each outbound *request* pops the
/// next script and plays its frames back into the inbound channel after
/// the scripted delays, so responses can carry whatever id the client
/// actually generated. Notifications never consume a script.
pub(crate) struct MockTransport {
    replies: StdMutex<VecDeque<ReplyFn>>,
    sent: StdMutex<Vec<JsonRpcMessage>>,
    inbound_tx: StdMutex<Option<mpsc::Sender<JsonRpcMessage>>>,
    inbound_rx: Mutex<Option<mpsc::Receiver<JsonRpcMessage>>>,
}

impl MockTransport {
    /// Build a transport that is already in the Open state.
    pub(crate) fn connected() -> Self {
        let (tx, rx) = mpsc::channel(100);
        Self {
            replies: StdMutex::new(VecDeque::new()),
            sent: StdMutex::new(Vec::new()),
            inbound_tx: StdMutex::new(Some(tx)),
            inbound_rx: Mutex::new(Some(rx)),
        }
    }

    /// Queue a reply script for the next outbound request.
    pub(crate) fn reply_with<F>(&self, reply: F)
    where
        F: Fn(&JsonRpcRequest) -> Vec<(Duration, JsonRpcMessage)> + Send + Sync + 'static,
    {
        lock(&self.replies).push_back(Box::new(reply));
    }

    /// Everything the client has written so far.
    pub(crate) fn sent(&self) -> Vec<JsonRpcMessage> {
        lock(&self.sent).clone()
    }

    /// Inject a server-initiated frame.
    pub(crate) fn push_inbound(&self, message: JsonRpcMessage) {
        let tx = lock(&self.inbound_tx).clone().expect("transport not broken");
        tx.try_send(message).expect("inbound channel full");
    }

    /// Simulate the peer dying: the next receive() sees EOF.
    pub(crate) fn break_pipe(&self) {
        *lock(&self.inbound_tx) = None;
    }

    /// Whether close() or break_pipe() has run.
    pub(crate) fn is_closed(&self) -> bool {
        lock(&self.inbound_tx).is_none()
    }
}

fn lock<T>(mutex: &StdMutex<T>) -> std::sync::MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

#[async_trait]
impl Transport for MockTransport {
    async fn open(&self) -> Result<(), ClientError> {
        Ok(())
    }

    async fn send(&self, message: &JsonRpcMessage) -> Result<(), ClientError> {
        lock(&self.sent).push(message.clone());

        if let JsonRpcMessage::Request(request) = message {
            let reply = lock(&self.replies).pop_front();
            if let Some(reply) = reply {
                let script = reply(request);
                let tx = lock(&self.inbound_tx).clone();
                if let Some(tx) = tx {
                    tokio::spawn(async move {
                        for (delay, frame) in script {
                            if !delay.is_zero() {
                                tokio::time::sleep(delay).await;
                            }
                            if tx.send(frame).await.is_err() {
                                break;
                            }
                        }
                    });
                }
            }
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
        *lock(&self.inbound_tx) = None;
        Ok(())
    }
}
