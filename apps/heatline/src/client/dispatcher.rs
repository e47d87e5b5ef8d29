//! Request/response correlation over one engine link. Requests are
//! pipelined: many may be in flight at once, each suspended on its own
//! oneshot until the matching response (or the link's death) settles it.

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use engine_proto::{ERROR_INTERNAL, ProgressParams, RpcRequest, methods};
use serde::de::DeserializeOwned;
use serde_json::Value;
use thiserror::Error;
use tokio::sync::{Mutex, mpsc, oneshot};
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use super::progress::ProgressRouter;

#[derive(Debug, Error)]
pub enum RpcFailure {
    #[error("engine channel closed")]
    ChannelClosed,
    #[error("engine error {code}: {message}")]
    Rpc { code: i64, message: String },
    #[error("malformed engine response: {0}")]
    Malformed(String),
    #[error(transparent)]
    Json(#[from] serde_json::Error),
}

type PendingSettlement = oneshot::Sender<Result<Value, RpcFailure>>;

struct Shared {
    outbound: mpsc::UnboundedSender<String>,
    pending: Mutex<HashMap<u64, PendingSettlement>>,
    progress: Arc<ProgressRouter>,
    next_id: AtomicU64,
}

pub struct Dispatcher {
    shared: Arc<Shared>,
    read_task: JoinHandle<()>,
}

impl Dispatcher {
    /// Takes over a link's frame streams and starts routing responses.
    pub fn spawn(
        outbound: mpsc::UnboundedSender<String>,
        inbound: mpsc::UnboundedReceiver<String>,
    ) -> Self {
        let shared = Arc::new(Shared {
            outbound,
            pending: Mutex::new(HashMap::new()),
            progress: Arc::new(ProgressRouter::default()),
            next_id: AtomicU64::new(1),
        });
        let read_task = tokio::spawn(read_loop(inbound, Arc::clone(&shared)));
        Self { shared, read_task }
    }

    pub fn progress(&self) -> Arc<ProgressRouter> {
        Arc::clone(&self.shared.progress)
    }

    pub fn next_request_id(&self) -> u64 {
        self.shared.next_id.fetch_add(1, Ordering::SeqCst)
    }

    pub async fn request(&self, method: &str, params: Option<Value>) -> Result<Value, RpcFailure> {
        let id = self.next_request_id();
        self.request_with_id(id, method, params).await
    }

    /// Issues a request under a caller-chosen id, so the caller can later
    /// name it in a `$/cancelRequest`.
    pub async fn request_with_id(
        &self,
        id: u64,
        method: &str,
        params: Option<Value>,
    ) -> Result<Value, RpcFailure> {
        let frame = serde_json::to_string(&RpcRequest::request(id, method, params))?;
        let (tx, rx) = oneshot::channel();
        self.shared.pending.lock().await.insert(id, tx);
        if self.shared.outbound.send(frame).is_err() {
            self.shared.pending.lock().await.remove(&id);
            return Err(RpcFailure::ChannelClosed);
        }
        match rx.await {
            Ok(settled) => settled,
            Err(_) => Err(RpcFailure::ChannelClosed),
        }
    }

    /// Fire-and-forget, no correlation id.
    pub fn notify(&self, method: &str, params: Option<Value>) -> Result<(), RpcFailure> {
        let frame = serde_json::to_string(&RpcRequest::notification(method, params))?;
        self.shared
            .outbound
            .send(frame)
            .map_err(|_| RpcFailure::ChannelClosed)
    }

    /// Stops routing and fails everything still pending.
    pub async fn shutdown(&self) {
        self.read_task.abort();
        drain_pending(&self.shared).await;
    }
}

impl Drop for Dispatcher {
    fn drop(&mut self) {
        self.read_task.abort();
    }
}

/// Deserializes a settled result payload into its typed form.
pub fn decode<T: DeserializeOwned>(value: Value) -> Result<T, RpcFailure> {
    serde_json::from_value(value).map_err(|err| RpcFailure::Malformed(err.to_string()))
}

async fn read_loop(mut inbound: mpsc::UnboundedReceiver<String>, shared: Arc<Shared>) {
    while let Some(frame) = inbound.recv().await {
        let value: Value = match serde_json::from_str(&frame) {
            Ok(value) => value,
            Err(err) => {
                warn!(target: "heatline::client", error = %err, "discarding unparseable frame");
                continue;
            }
        };
        if value.get("method").is_some() {
            handle_server_notification(&shared, &value);
        } else {
            settle_response(&shared, &value).await;
        }
    }
    drain_pending(&shared).await;
}

fn handle_server_notification(shared: &Shared, value: &Value) {
    let method = value.get("method").and_then(Value::as_str).unwrap_or_default();
    if method == methods::PROGRESS {
        match value
            .get("params")
            .cloned()
            .map(serde_json::from_value::<ProgressParams>)
        {
            Some(Ok(params)) => shared.progress.dispatch(params),
            _ => warn!(target: "heatline::client", "malformed progress notification"),
        }
    } else {
        debug!(
            target: "heatline::client",
            method, "ignoring unhandled engine notification"
        );
    }
}

async fn settle_response(shared: &Shared, value: &Value) {
    let Some(id) = value.get("id").and_then(as_request_id) else {
        warn!(target: "heatline::client", "response without a usable id");
        return;
    };
    let Some(tx) = shared.pending.lock().await.remove(&id) else {
        // Late responses after cancellation or restart land here.
        debug!(target: "heatline::client", id, "response for unknown request");
        return;
    };
    let settled = if let Some(error) = value.get("error") {
        let code = error
            .get("code")
            .and_then(Value::as_i64)
            .unwrap_or(ERROR_INTERNAL);
        let message = error
            .get("message")
            .and_then(Value::as_str)
            .unwrap_or("unknown engine error")
            .to_string();
        Err(RpcFailure::Rpc { code, message })
    } else {
        Ok(value.get("result").cloned().unwrap_or(Value::Null))
    };
    let _ = tx.send(settled);
}

fn as_request_id(value: &Value) -> Option<u64> {
    match value {
        Value::Number(num) => num.as_u64(),
        Value::String(text) => text.parse().ok(),
        _ => None,
    }
}

async fn drain_pending(shared: &Shared) {
    let mut pending = shared.pending.lock().await;
    if !pending.is_empty() {
        debug!(
            target: "heatline::client",
            count = pending.len(),
            "failing requests pending at close"
        );
    }
    for (_, tx) in pending.drain() {
        let _ = tx.send(Err(RpcFailure::ChannelClosed));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::mock::link_pair;
    use serde_json::json;

    fn response(id: u64, result: Value) -> String {
        json!({"jsonrpc": "2.0", "id": id, "result": result}).to_string()
    }

    async fn recv_request(peer: &mut crate::transport::mock::MockPeer) -> RpcRequest {
        let frame = peer.recv().await.expect("request frame");
        serde_json::from_str(&frame).expect("valid request")
    }

    #[tokio::test]
    async fn pipelined_requests_settle_out_of_order() {
        let (mut link, mut peer) = link_pair();
        let dispatcher = Arc::new(Dispatcher::spawn(
            link.sender(),
            link.take_inbound().expect("inbound"),
        ));

        let alpha = tokio::spawn({
            let dispatcher = Arc::clone(&dispatcher);
            async move { dispatcher.request("alpha", None).await }
        });
        let beta = tokio::spawn({
            let dispatcher = Arc::clone(&dispatcher);
            async move { dispatcher.request("beta", None).await }
        });

        let mut ids = HashMap::new();
        for _ in 0..2 {
            let request = recv_request(&mut peer).await;
            let id = request.id.as_ref().and_then(as_request_id).expect("id");
            ids.insert(request.method.clone(), id);
        }

        // Answer in reverse send order; each caller still gets its own result.
        peer.send(response(ids["beta"], json!({"value": 2})))
            .expect("send");
        peer.send(response(ids["alpha"], json!({"value": 1})))
            .expect("send");

        assert_eq!(
            alpha.await.expect("join").expect("alpha result")["value"],
            json!(1)
        );
        assert_eq!(
            beta.await.expect("join").expect("beta result")["value"],
            json!(2)
        );
    }

    #[tokio::test]
    async fn error_responses_become_rpc_failures() {
        let (mut link, mut peer) = link_pair();
        let dispatcher = Arc::new(Dispatcher::spawn(
            link.sender(),
            link.take_inbound().expect("inbound"),
        ));

        let call = tokio::spawn({
            let dispatcher = Arc::clone(&dispatcher);
            async move { dispatcher.request("broken", None).await }
        });
        let request = recv_request(&mut peer).await;
        let id = request.id.as_ref().and_then(as_request_id).expect("id");
        peer.send(
            json!({
                "jsonrpc": "2.0",
                "id": id,
                "error": {"code": -32603, "message": "exploded"}
            })
            .to_string(),
        )
        .expect("send");

        match call.await.expect("join") {
            Err(RpcFailure::Rpc { code, message }) => {
                assert_eq!(code, -32603);
                assert_eq!(message, "exploded");
            }
            other => panic!("expected rpc failure, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn responses_for_unknown_ids_are_ignored() {
        let (mut link, mut peer) = link_pair();
        let dispatcher = Arc::new(Dispatcher::spawn(
            link.sender(),
            link.take_inbound().expect("inbound"),
        ));

        let call = tokio::spawn({
            let dispatcher = Arc::clone(&dispatcher);
            async move { dispatcher.request("slow", None).await }
        });
        let request = recv_request(&mut peer).await;
        let id = request.id.as_ref().and_then(as_request_id).expect("id");

        peer.send(response(id + 999, json!("stale"))).expect("send");
        peer.send(response(id, json!("fresh"))).expect("send");

        assert_eq!(call.await.expect("join").expect("result"), json!("fresh"));
    }

    #[tokio::test]
    async fn link_death_fails_all_pending_requests() {
        let (mut link, mut peer) = link_pair();
        let dispatcher = Arc::new(Dispatcher::spawn(
            link.sender(),
            link.take_inbound().expect("inbound"),
        ));

        let call = tokio::spawn({
            let dispatcher = Arc::clone(&dispatcher);
            async move { dispatcher.request("doomed", None).await }
        });
        let _ = recv_request(&mut peer).await;
        peer.close();

        match call.await.expect("join") {
            Err(RpcFailure::ChannelClosed) => {}
            other => panic!("expected channel-closed, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn requests_after_link_death_fail_immediately() {
        let (mut link, peer) = link_pair();
        let dispatcher = Dispatcher::spawn(link.sender(), link.take_inbound().expect("inbound"));
        drop(peer);

        match dispatcher.request("late", None).await {
            Err(RpcFailure::ChannelClosed) => {}
            other => panic!("expected channel-closed, got {other:?}"),
        }
    }
}
