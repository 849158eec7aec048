//! Request/response correlation over a transport.
//!
//! One router task owns the transport's inbound side. Responses are
//! matched to pending requests by id through a map of single-shot
//! completion sinks; notifications go to the dispatcher; server-issued
//! requests are handed to an application sink or refused. The map lock
//! is held only to insert or remove an entry, never while a sink fires
//! and never across a suspension point.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicI64, Ordering};
use std::sync::{Arc, Mutex as StdMutex, MutexGuard};
use std::time::Duration;

use serde_json::Value;
use tokio::sync::{mpsc, oneshot, watch};
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use tether_protocol::error_codes;
use tether_protocol::message::{JsonRpcMessage, JsonRpcRequest, RequestId};

use crate::error::{classify_rpc_error, ClientError, TransientError};
use crate::notifications::NotificationDispatcher;
use crate::retry::wait_cancelled;
use crate::transport::Transport;

const ROUTER_JOIN_GRACE: Duration = Duration::from_secs(2);

struct PendingEntry {
    /// Method name, kept for diagnostics only.
    method: String,
    sink: oneshot::Sender<Result<Value, ClientError>>,
}

struct Shared {
    transport: Arc<dyn Transport>,
    pending: StdMutex<HashMap<RequestId, PendingEntry>>,
    dispatcher: Arc<NotificationDispatcher>,
    incoming: StdMutex<Option<mpsc::Sender<JsonRpcRequest>>>,
    /// Explicitly closed by the caller.
    closed: AtomicBool,
    /// The router saw EOF or a read failure; the peer is gone. Set
    /// before the drain so a submit racing the drain cannot strand its
    /// entry.
    broken: AtomicBool,
}

impl Shared {
    fn pending(&self) -> MutexGuard<'_, HashMap<RequestId, PendingEntry>> {
        self.pending
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Resolve one pending request. The entry leaves the map under the
    /// lock; the sink fires after the guard is gone.
    fn complete(&self, id: &RequestId, outcome: Result<Value, ClientError>) {
        let entry = self.pending().remove(id);
        match entry {
            Some(entry) => {
                let _ = entry.sink.send(outcome);
            }
            None => {
                debug!(%id, "discarding response for unknown or cancelled request id");
            }
        }
    }

    /// Fail every remaining pending request. Runs on transport EOF and
    /// again on close; the second pass sees an empty map.
    fn drain(&self, error: &ClientError) {
        let entries: Vec<PendingEntry> = self.pending().drain().map(|(_, entry)| entry).collect();
        for entry in entries {
            debug!(method = %entry.method, "failing in-flight request after transport loss");
            let _ = entry.sink.send(Err(error.clone()));
        }
    }

    async fn handle_incoming_request(&self, request: JsonRpcRequest) {
        let sink = {
            self.incoming
                .lock()
                .unwrap_or_else(|poisoned| poisoned.into_inner())
                .clone()
        };
        let request = match sink {
            Some(sink) => match sink.send(request).await {
                Ok(()) => return,
                // Handler went away; fall through to the refusal.
                Err(err) => err.0,
            },
            None => request,
        };
        let reply = JsonRpcMessage::error_response(
            request.id.clone(),
            error_codes::METHOD_NOT_FOUND,
            format!("no handler for {}", request.method),
            None,
        );
        if let Err(error) = self.transport.send(&reply).await {
            debug!(%error, method = %request.method, "failed to refuse server request");
        }
    }
}

async fn route_loop(shared: Arc<Shared>) {
    loop {
        let message = match shared.transport.receive().await {
            Ok(Some(message)) => message,
            Ok(None) => break,
            Err(error) => {
                warn!(%error, "transport read failed");
                break;
            }
        };
        match message {
            JsonRpcMessage::Response(response) => {
                shared.complete(&response.id, Ok(response.result));
            }
            JsonRpcMessage::Error(response) => {
                let outcome = classify_rpc_error(
                    response.error.code,
                    &response.error.message,
                    response.error.data.as_ref(),
                );
                shared.complete(&response.id, Err(outcome));
            }
            JsonRpcMessage::Notification(notification) => {
                shared.dispatcher.dispatch(notification);
            }
            JsonRpcMessage::Request(request) => {
                shared.handle_incoming_request(request).await;
            }
        }
    }
    shared.broken.store(true, Ordering::SeqCst);
    shared.drain(&ClientError::Retryable(TransientError::TransportClosed));
}

// ---------------------------------------------------------------------------
// Correlator
// ---------------------------------------------------------------------------

pub struct Correlator {
    shared: Arc<Shared>,
    next_id: AtomicI64,
    router: StdMutex<Option<JoinHandle<()>>>,
}

impl Correlator {
    /// Take over an already-open transport and start routing.
    pub fn new(transport: Arc<dyn Transport>, dispatcher: Arc<NotificationDispatcher>) -> Self {
        let shared = Arc::new(Shared {
            transport,
            pending: StdMutex::new(HashMap::new()),
            dispatcher,
            incoming: StdMutex::new(None),
            closed: AtomicBool::new(false),
            broken: AtomicBool::new(false),
        });
        let router = tokio::spawn(route_loop(shared.clone()));
        Self {
            shared,
            next_id: AtomicI64::new(1),
            router: StdMutex::new(Some(router)),
        }
    }

    /// Register a sink for server-issued requests. Without one they are
    /// answered with method-not-found.
    pub fn set_incoming_request_sink(&self, sink: mpsc::Sender<JsonRpcRequest>) {
        *self
            .shared
            .incoming
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner()) = Some(sink);
    }

    pub async fn submit(&self, method: &str, params: Option<Value>) -> Result<Value, ClientError> {
        self.submit_with_cancel(method, params, None).await
    }

    /// Issue one request and wait for its outcome. Ids are unique for
    /// the lifetime of the connection and never reused, cancelled or
    /// not.
    pub async fn submit_with_cancel(
        &self,
        method: &str,
        params: Option<Value>,
        cancel: Option<watch::Receiver<bool>>,
    ) -> Result<Value, ClientError> {
        if self.shared.closed.load(Ordering::SeqCst) {
            return Err(ClientError::TransportClosed);
        }
        if self.shared.broken.load(Ordering::SeqCst) {
            return Err(ClientError::Retryable(TransientError::TransportClosed));
        }

        let id = RequestId::Integer(self.next_id.fetch_add(1, Ordering::SeqCst));
        let (sink, completion) = oneshot::channel();
        self.shared.pending().insert(
            id.clone(),
            PendingEntry {
                method: method.to_string(),
                sink,
            },
        );

        // Re-check after the insert: either the entry was in the map
        // when the router drained (its sink already fired), or it went
        // in afterwards and must be pulled back out here.
        if self.shared.broken.load(Ordering::SeqCst) {
            if self.shared.pending().remove(&id).is_some() {
                return Err(ClientError::Retryable(TransientError::TransportClosed));
            }
        } else {
            let request = JsonRpcMessage::request(id.clone(), method, params);
            if let Err(error) = self.shared.transport.send(&request).await {
                self.shared.pending().remove(&id);
                return Err(error);
            }
        }

        let mut completion = completion;
        match cancel {
            None => match (&mut completion).await {
                Ok(outcome) => outcome,
                Err(_) => Err(ClientError::TransportClosed),
            },
            Some(mut cancel) => {
                tokio::select! {
                    outcome = &mut completion => match outcome {
                        Ok(outcome) => outcome,
                        Err(_) => Err(ClientError::TransportClosed),
                    },
                    _ = wait_cancelled(&mut cancel) => {
                        // Removing the entry first guarantees a late
                        // response is discarded, not double-fired.
                        self.shared.pending().remove(&id);
                        let notice = JsonRpcMessage::notification(
                            "notifications/cancelled",
                            Some(serde_json::json!({ "requestId": id })),
                        );
                        if let Err(error) = self.shared.transport.send(&notice).await {
                            debug!(%error, "failed to send cancellation notice");
                        }
                        Err(ClientError::Cancelled)
                    }
                }
            }
        }
    }

    /// Fire-and-forget notification.
    pub async fn notify(&self, method: &str, params: Option<Value>) -> Result<(), ClientError> {
        if self.shared.closed.load(Ordering::SeqCst) {
            return Err(ClientError::TransportClosed);
        }
        let message = JsonRpcMessage::notification(method, params);
        self.shared.transport.send(&message).await
    }

    pub fn is_closed(&self) -> bool {
        self.shared.closed.load(Ordering::SeqCst)
    }

    /// Close the transport and fail whatever is still in flight.
    /// Idempotent.
    pub async fn close(&self) -> Result<(), ClientError> {
        if self.shared.closed.swap(true, Ordering::SeqCst) {
            return Ok(());
        }
        let result = self.shared.transport.close().await;

        let handle = {
            self.router
                .lock()
                .unwrap_or_else(|poisoned| poisoned.into_inner())
                .take()
        };
        if let Some(mut handle) = handle {
            if tokio::time::timeout(ROUTER_JOIN_GRACE, &mut handle)
                .await
                .is_err()
            {
                handle.abort();
            }
        }
        // The router drains on EOF; this catches the abort path.
        self.shared
            .drain(&ClientError::Retryable(TransientError::TransportClosed));
        result
    }

    #[cfg(test)]
    pub(crate) fn pending_len(&self) -> usize {
        self.shared.pending().len()
    }
}
