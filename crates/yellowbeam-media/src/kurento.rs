//! Kurento Media Server client (JSON-RPC 2.0 over WebSocket).
//!
//! One socket carries every request. Responses are matched to callers by
//! request id; `onEvent` notifications for `IceCandidateFound` are routed to
//! the listener registered for the source endpoint.
//!
//! ```text
//!   create(MediaPipeline) ──▶ pipeline id
//!   create(WebRtcEndpoint, mediaPipeline) ──▶ endpoint id
//!   invoke(processOffer | gatherCandidates | addIceCandidate | connect)
//!   subscribe(IceCandidateFound) ──▶ onEvent notifications
//!   release(pipeline)
//! ```

use crate::engine::{CandidateListener, EndpointId, IceCandidate, MediaEngine, MediaSessionId};
use crate::error::MediaError;
use async_trait::async_trait;
use dashmap::DashMap;
use futures_util::stream::{SplitSink, SplitStream};
use futures_util::{SinkExt, StreamExt};
use serde::Deserialize;
use serde_json::{Value, json};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;
use tokio::net::TcpStream;
use tokio::sync::{Mutex, RwLock, oneshot};
use tokio::task::JoinHandle;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream, connect_async};

type Socket = WebSocketStream<MaybeTlsStream<TcpStream>>;

/// Handle to a Kurento Media Server.
pub struct KurentoClient {
    inner: Arc<Inner>,
    reader: JoinHandle<()>,
    keepalive: Option<JoinHandle<()>>,
}

struct Inner {
    sink: Mutex<SplitSink<Socket, Message>>,
    pending: DashMap<u64, oneshot::Sender<Result<Value, MediaError>>>,
    listeners: DashMap<EndpointId, CandidateListener>,
    /// Endpoint → owning pipeline, so listeners die with their pipeline.
    owners: DashMap<EndpointId, MediaSessionId>,
    /// Kurento session id, echoed on every request once assigned.
    session_id: RwLock<Option<String>>,
    next_id: AtomicU64,
    timeout: Duration,
    /// Set once the reader is gone; nothing can answer after that.
    closed: AtomicBool,
}

impl KurentoClient {
    /// Connect to `url` (e.g. `ws://localhost:8888/kurento`).
    ///
    /// A zero `keepalive` disables the ping task.
    pub async fn connect(
        url: &str,
        timeout: Duration,
        keepalive: Duration,
    ) -> Result<Self, MediaError> {
        let (ws, _) = connect_async(url).await?;
        let (sink, stream) = ws.split();

        let inner = Arc::new(Inner {
            sink: Mutex::new(sink),
            pending: DashMap::new(),
            listeners: DashMap::new(),
            owners: DashMap::new(),
            session_id: RwLock::new(None),
            next_id: AtomicU64::new(1),
            timeout,
            closed: AtomicBool::new(false),
        });

        let reader = tokio::spawn(read_loop(inner.clone(), stream));
        let keepalive = (!keepalive.is_zero())
            .then(|| tokio::spawn(keepalive_loop(Arc::downgrade(&inner), keepalive)));

        tracing::info!(url = %url, "Connected to media server");

        Ok(Self {
            inner,
            reader,
            keepalive,
        })
    }
}

impl Drop for KurentoClient {
    fn drop(&mut self) {
        self.reader.abort();
        if let Some(task) = &self.keepalive {
            task.abort();
        }
    }
}

impl Inner {
    async fn request(&self, method: &str, mut params: Value) -> Result<Value, MediaError> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(MediaError::Disconnected);
        }
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);

        let session_id = self.session_id.read().await.clone();
        if let (Some(sid), Some(map)) = (session_id, params.as_object_mut()) {
            map.insert("sessionId".into(), Value::String(sid));
        }

        let (tx, rx) = oneshot::channel();
        self.pending.insert(id, tx);
        // The reader may have drained `pending` just before the insert.
        if self.closed.load(Ordering::SeqCst) {
            self.pending.remove(&id);
            return Err(MediaError::Disconnected);
        }

        let frame = json!({
            "jsonrpc": "2.0",
            "id": id,
            "method": method,
            "params": params,
        });
        tracing::trace!(id, method, "Media server request");
        let text = match serde_json::to_string(&frame) {
            Ok(text) => text,
            Err(e) => {
                self.pending.remove(&id);
                return Err(e.into());
            }
        };

        let sent = self.sink.lock().await.send(Message::Text(text.into())).await;
        if let Err(e) = sent {
            self.pending.remove(&id);
            return Err(e.into());
        }

        let result = match tokio::time::timeout(self.timeout, rx).await {
            Ok(Ok(outcome)) => outcome?,
            Ok(Err(_)) => return Err(MediaError::Disconnected),
            Err(_) => {
                self.pending.remove(&id);
                return Err(MediaError::Timeout(method.to_string()));
            }
        };

        if let Some(sid) = result.get("sessionId").and_then(Value::as_str) {
            let mut current = self.session_id.write().await;
            if current.as_deref() != Some(sid) {
                tracing::debug!(session = %sid, "Media server session assigned");
                *current = Some(sid.to_owned());
            }
        }

        Ok(result)
    }

    async fn create(&self, kind: &str, constructor_params: Value) -> Result<String, MediaError> {
        let result = self
            .request(
                "create",
                json!({
                    "type": kind,
                    "constructorParams": constructor_params,
                    "properties": {},
                }),
            )
            .await?;
        value_str(&result, kind)
    }

    async fn invoke(
        &self,
        object: &str,
        operation: &str,
        operation_params: Value,
    ) -> Result<Value, MediaError> {
        self.request(
            "invoke",
            json!({
                "object": object,
                "operation": operation,
                "operationParams": operation_params,
            }),
        )
        .await
    }

    fn handle_frame(&self, frame: Frame) {
        if let Some(method) = frame.method.as_deref() {
            if method == "onEvent" {
                match frame.params.as_ref().and_then(parse_candidate_event) {
                    Some((endpoint, candidate)) => self.dispatch_candidate(&endpoint, candidate),
                    None => tracing::debug!("Ignoring media server event"),
                }
            }
            return;
        }

        if let Some((id, outcome)) = frame.into_outcome() {
            match self.pending.remove(&id) {
                Some((_, tx)) => {
                    let _ = tx.send(outcome);
                }
                None => tracing::debug!(id, "Response for unknown media request"),
            }
        }
    }

    fn dispatch_candidate(&self, endpoint: &EndpointId, candidate: IceCandidate) {
        let listener = self.listeners.get(endpoint).map(|l| l.value().clone());
        match listener {
            Some(listener) => listener(candidate),
            None => tracing::debug!(endpoint = %endpoint, "Candidate for endpoint without listener"),
        }
    }

    fn fail_pending(&self) {
        self.closed.store(true, Ordering::SeqCst);
        let ids: Vec<u64> = self.pending.iter().map(|e| *e.key()).collect();
        for id in ids {
            if let Some((_, tx)) = self.pending.remove(&id) {
                let _ = tx.send(Err(MediaError::Disconnected));
            }
        }
    }
}

async fn read_loop(inner: Arc<Inner>, mut stream: SplitStream<Socket>) {
    while let Some(msg) = stream.next().await {
        let text = match msg {
            Ok(Message::Text(text)) => text,
            Ok(Message::Close(_)) => break,
            Ok(_) => continue,
            Err(e) => {
                tracing::warn!(error = %e, "Media server socket error");
                break;
            }
        };

        match serde_json::from_str::<Frame>(text.as_str()) {
            Ok(frame) => inner.handle_frame(frame),
            Err(e) => tracing::warn!(error = %e, "Malformed media server frame"),
        }
    }

    tracing::warn!("Media server connection closed");
    inner.fail_pending();
}

async fn keepalive_loop(inner: Weak<Inner>, period: Duration) {
    let mut ticker = tokio::time::interval(period);
    ticker.tick().await;
    loop {
        ticker.tick().await;
        let Some(inner) = inner.upgrade() else { break };
        let interval_ms = u64::try_from(period.as_millis()).unwrap_or(u64::MAX);
        if let Err(e) = inner.request("ping", json!({ "interval": interval_ms })).await {
            tracing::warn!(error = %e, "Media server keepalive failed");
        }
    }
}

/// A JSON-RPC frame from the media server: either a response or a notification.
#[derive(Debug, Deserialize)]
struct Frame {
    id: Option<u64>,
    result: Option<Value>,
    error: Option<RpcError>,
    method: Option<String>,
    params: Option<Value>,
}

#[derive(Debug, Deserialize)]
struct RpcError {
    code: i64,
    message: String,
}

impl Frame {
    fn into_outcome(self) -> Option<(u64, Result<Value, MediaError>)> {
        let id = self.id?;
        let outcome = match (self.error, self.result) {
            (Some(err), _) => Err(MediaError::Rpc {
                code: err.code,
                message: err.message,
            }),
            (None, Some(result)) => Ok(result),
            (None, None) => Ok(Value::Null),
        };
        Some((id, outcome))
    }
}

/// Extract `(endpoint, candidate)` from an `IceCandidateFound` notification.
fn parse_candidate_event(params: &Value) -> Option<(EndpointId, IceCandidate)> {
    let value = params.get("value")?;
    if value.get("type")?.as_str()? != "IceCandidateFound" {
        return None;
    }
    let data = value.get("data")?;
    let source = value
        .get("object")
        .or_else(|| data.get("source"))?
        .as_str()?;
    let candidate = serde_json::from_value(data.get("candidate")?.clone()).ok()?;
    Some((EndpointId(source.to_owned()), candidate))
}

fn value_str(result: &Value, what: &str) -> Result<String, MediaError> {
    result
        .get("value")
        .and_then(Value::as_str)
        .map(str::to_owned)
        .ok_or_else(|| MediaError::UnexpectedResponse(format!("{what}: {result}")))
}

#[async_trait]
impl MediaEngine for KurentoClient {
    async fn create_session(&self) -> Result<MediaSessionId, MediaError> {
        let id = self.inner.create("MediaPipeline", json!({})).await?;
        tracing::debug!(pipeline = %id, "Media pipeline created");
        Ok(MediaSessionId(id))
    }

    async fn create_endpoint(&self, session: &MediaSessionId) -> Result<EndpointId, MediaError> {
        let id = self
            .inner
            .create("WebRtcEndpoint", json!({ "mediaPipeline": session.0 }))
            .await?;
        let endpoint = EndpointId(id);
        self.inner.owners.insert(endpoint.clone(), session.clone());
        Ok(endpoint)
    }

    async fn connect(&self, source: &EndpointId, sink: &EndpointId) -> Result<(), MediaError> {
        self.inner
            .invoke(&source.0, "connect", json!({ "sink": sink.0 }))
            .await?;
        Ok(())
    }

    async fn process_offer(
        &self,
        endpoint: &EndpointId,
        offer: &str,
    ) -> Result<String, MediaError> {
        let result = self
            .inner
            .invoke(&endpoint.0, "processOffer", json!({ "offer": offer }))
            .await?;
        value_str(&result, "processOffer")
    }

    async fn gather_candidates(&self, endpoint: &EndpointId) -> Result<(), MediaError> {
        self.inner
            .invoke(&endpoint.0, "gatherCandidates", json!({}))
            .await?;
        Ok(())
    }

    async fn add_candidate(
        &self,
        endpoint: &EndpointId,
        candidate: IceCandidate,
    ) -> Result<(), MediaError> {
        // Endpoints of a released pipeline are gone on the server too.
        if !self.inner.owners.contains_key(endpoint) {
            return Err(MediaError::UnknownEndpoint(endpoint.clone()));
        }
        let candidate = json!({
            "__module__": "kurento",
            "__type__": "IceCandidate",
            "candidate": candidate.candidate,
            "sdpMid": candidate.sdp_mid.unwrap_or_default(),
            "sdpMLineIndex": candidate.sdp_m_line_index.unwrap_or(0),
        });
        self.inner
            .invoke(&endpoint.0, "addIceCandidate", json!({ "candidate": candidate }))
            .await?;
        Ok(())
    }

    async fn on_candidate_found(
        &self,
        endpoint: &EndpointId,
        listener: CandidateListener,
    ) -> Result<(), MediaError> {
        // Register first: candidates can arrive before the subscribe response.
        self.inner.listeners.insert(endpoint.clone(), listener);
        let subscribed = self
            .inner
            .request(
                "subscribe",
                json!({ "type": "IceCandidateFound", "object": endpoint.0 }),
            )
            .await;
        if let Err(e) = subscribed {
            self.inner.listeners.remove(endpoint);
            return Err(e);
        }
        Ok(())
    }

    async fn release(&self, session: &MediaSessionId) -> Result<(), MediaError> {
        let listeners = &self.inner.listeners;
        self.inner.owners.retain(|endpoint, owner| {
            if owner == session {
                listeners.remove(endpoint);
                false
            } else {
                true
            }
        });

        self.inner
            .request("release", json!({ "object": session.0 }))
            .await?;
        tracing::debug!(pipeline = %session, "Media pipeline released");
        Ok(())
    }
}
