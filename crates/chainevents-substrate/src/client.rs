//! WebSocket JSON-RPC client with auto-reconnect and subscription routing.

use std::collections::HashMap;
use std::time::Duration;

use futures::{SinkExt, StreamExt};
use serde::de::DeserializeOwned;
use serde_json::Value;
use tokio::sync::{mpsc, oneshot};
use tokio::time;
use tokio_tungstenite::tungstenite::Message;

use crate::error::RpcError;
use crate::rpc::{subscription_key, Incoming, JsonRpcRequest, RpcId};
use crate::subscriptions::{Subscription, SubscriptionTable};

/// Configuration for the WebSocket client.
#[derive(Debug, Clone)]
pub struct ClientConfig {
    /// How long a call waits for its response.
    pub request_timeout: Duration,
    /// Reconnect backoff starting duration.
    pub reconnect_initial: Duration,
    /// Maximum reconnect backoff.
    pub reconnect_max: Duration,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            request_timeout: Duration::from_secs(30),
            reconnect_initial: Duration::from_millis(500),
            reconnect_max: Duration::from_secs(60),
        }
    }
}

/// Command sent from callers to the background WS task.
pub(crate) enum WsCommand {
    Call {
        method: String,
        params: Vec<Value>,
        tx: oneshot::Sender<Result<Value, RpcError>>,
    },
    Subscribe {
        method: String,
        params: Vec<Value>,
        unsubscribe: String,
        tx: oneshot::Sender<Result<Subscription, RpcError>>,
    },
    Unsubscribe {
        method: String,
        id: Value,
    },
    Close,
}

/// A request waiting for its response.
enum Pending {
    Call(oneshot::Sender<Result<Value, RpcError>>),
    Subscribe {
        unsubscribe: String,
        tx: oneshot::Sender<Result<Subscription, RpcError>>,
    },
}

impl Pending {
    /// A call whose caller stopped waiting. Subscribe entries are kept so a
    /// late response still unsubscribes on the node.
    fn is_abandoned(&self) -> bool {
        match self {
            Self::Call(tx) => tx.is_closed(),
            Self::Subscribe { .. } => false,
        }
    }

    fn fail(self, err: RpcError) {
        match self {
            Self::Call(tx) => {
                let _ = tx.send(Err(err));
            }
            Self::Subscribe { tx, .. } => {
                let _ = tx.send(Err(err));
            }
        }
    }
}

/// WebSocket JSON-RPC client.
///
/// A background task owns the connection. On disconnect every in-flight
/// call fails with [`RpcError::Closed`], every open [`Subscription`] ends,
/// and the task reconnects with exponential backoff.
pub struct WsRpcClient {
    url: String,
    cmd_tx: mpsc::UnboundedSender<WsCommand>,
    subscriptions: SubscriptionTable,
    request_timeout: Duration,
}

impl WsRpcClient {
    /// Start the background task for `url`. The first connection attempt
    /// happens in the background; calls made before it succeeds wait for it
    /// up to the request timeout.
    pub async fn connect(url: impl Into<String>, config: ClientConfig) -> Result<Self, RpcError> {
        let url = url.into();
        if !(url.starts_with("ws://") || url.starts_with("wss://")) {
            return Err(RpcError::WebSocket(format!("unsupported URL scheme: {url}")));
        }

        let (cmd_tx, cmd_rx) = mpsc::unbounded_channel::<WsCommand>();
        let subscriptions = SubscriptionTable::default();
        let request_timeout = config.request_timeout;

        tokio::spawn(ws_task(
            url.clone(),
            cmd_rx,
            cmd_tx.clone(),
            subscriptions.clone(),
            config,
        ));

        Ok(Self {
            url,
            cmd_tx,
            subscriptions,
            request_timeout,
        })
    }

    /// Call `method` and deserialize its result.
    pub async fn call<T: DeserializeOwned>(
        &self,
        method: &str,
        params: Vec<Value>,
    ) -> Result<T, RpcError> {
        let (tx, rx) = oneshot::channel();
        self.send(WsCommand::Call {
            method: method.to_string(),
            params,
            tx,
        })?;
        let value = self.wait(rx).await?;
        Ok(serde_json::from_value(value)?)
    }

    /// Open a subscription with `method`; dropping the returned stream calls
    /// `unsubscribe` with the subscription id.
    pub async fn subscribe(
        &self,
        method: &str,
        params: Vec<Value>,
        unsubscribe: &str,
    ) -> Result<Subscription, RpcError> {
        let (tx, rx) = oneshot::channel();
        self.send(WsCommand::Subscribe {
            method: method.to_string(),
            params,
            unsubscribe: unsubscribe.to_string(),
            tx,
        })?;
        self.wait(rx).await
    }

    pub fn url(&self) -> &str {
        &self.url
    }

    /// Subscriptions currently routed by this client.
    pub fn subscription_count(&self) -> usize {
        self.subscriptions.len()
    }

    fn send(&self, cmd: WsCommand) -> Result<(), RpcError> {
        self.cmd_tx
            .send(cmd)
            .map_err(|_| RpcError::WebSocket("WS task closed".into()))
    }

    async fn wait<T>(&self, rx: oneshot::Receiver<Result<T, RpcError>>) -> Result<T, RpcError> {
        let ms = self.request_timeout.as_millis() as u64;
        let reply = time::timeout(self.request_timeout, rx)
            .await
            .map_err(|_| RpcError::Timeout { ms })?;
        reply.map_err(|_| RpcError::Closed)?
    }
}

impl Drop for WsRpcClient {
    fn drop(&mut self) {
        let _ = self.cmd_tx.send(WsCommand::Close);
    }
}

/// What ended a connected session.
enum SessionEnd {
    Disconnected,
    Closed,
}

/// Background task that owns the WebSocket connection.
async fn ws_task(
    url: String,
    mut cmd_rx: mpsc::UnboundedReceiver<WsCommand>,
    cmd_tx: mpsc::UnboundedSender<WsCommand>,
    subscriptions: SubscriptionTable,
    config: ClientConfig,
) {
    let mut pending: HashMap<u64, Pending> = HashMap::new();
    let mut next_id: u64 = 1;
    let mut backoff = config.reconnect_initial;

    loop {
        tracing::info!(url = %url, "connecting via WebSocket");

        match tokio_tungstenite::connect_async(url.as_str()).await {
            Err(e) => {
                tracing::warn!(error = %e, "WS connect failed, retrying in {backoff:?}");
            }
            Ok((ws_stream, _)) => {
                backoff = config.reconnect_initial;
                let (mut sink, mut stream) = ws_stream.split();

                let end = loop {
                    tokio::select! {
                        cmd = cmd_rx.recv() => {
                            let (req, entry) = match cmd {
                                None | Some(WsCommand::Close) => {
                                    let _ = sink.close().await;
                                    break SessionEnd::Closed;
                                }
                                Some(WsCommand::Call { method, params, tx }) => {
                                    (JsonRpcRequest::new(next_id, method, params), Some(Pending::Call(tx)))
                                }
                                Some(WsCommand::Subscribe { method, params, unsubscribe, tx }) => (
                                    JsonRpcRequest::new(next_id, method, params),
                                    Some(Pending::Subscribe { unsubscribe, tx }),
                                ),
                                Some(WsCommand::Unsubscribe { method, id }) => {
                                    let Some(key) = subscription_key(&id) else { continue };
                                    if !subscriptions.remove(&key) {
                                        continue;
                                    }
                                    tracing::debug!(subscription = %key, "unsubscribing");
                                    (JsonRpcRequest::new(next_id, method, vec![id]), None)
                                }
                            };
                            next_id += 1;

                            let text = match serde_json::to_string(&req) {
                                Ok(text) => text,
                                Err(e) => {
                                    if let Some(entry) = entry {
                                        entry.fail(RpcError::Deserialization(e));
                                    }
                                    continue;
                                }
                            };
                            if let (RpcId::Number(id), Some(entry)) = (&req.id, entry) {
                                prune_abandoned(&mut pending);
                                pending.insert(*id, entry);
                            }
                            if sink.send(Message::Text(text.into())).await.is_err() {
                                break SessionEnd::Disconnected;
                            }
                        }
                        msg = stream.next() => {
                            match msg {
                                None => break SessionEnd::Disconnected,
                                Some(Err(e)) => {
                                    tracing::warn!(error = %e, "WS receive error");
                                    break SessionEnd::Disconnected;
                                }
                                Some(Ok(Message::Text(text))) => {
                                    handle_message(text.as_str(), &mut pending, &subscriptions, &cmd_tx);
                                }
                                Some(Ok(Message::Close(_))) => break SessionEnd::Disconnected,
                                _ => {}
                            }
                        }
                    }
                };

                for (_, entry) in pending.drain() {
                    entry.fail(RpcError::Closed);
                }
                let ended = subscriptions.clear();
                if let SessionEnd::Closed = end {
                    tracing::debug!(url = %url, "WS client closed");
                    return;
                }
                tracing::warn!(url = %url, subscriptions = ended, "WS disconnected, reconnecting in {backoff:?}");
            }
        }

        if !wait_backoff(&mut cmd_rx, backoff).await {
            return;
        }
        backoff = (backoff * 2).min(config.reconnect_max);
    }
}

/// Sleep for `backoff`, failing anything sent meanwhile. Returns `false` if
/// the client was closed.
async fn wait_backoff(cmd_rx: &mut mpsc::UnboundedReceiver<WsCommand>, backoff: Duration) -> bool {
    let sleep = time::sleep(backoff);
    tokio::pin!(sleep);
    loop {
        tokio::select! {
            _ = &mut sleep => return true,
            cmd = cmd_rx.recv() => match cmd {
                None | Some(WsCommand::Close) => return false,
                Some(WsCommand::Call { tx, .. }) => Pending::Call(tx).fail(RpcError::Closed),
                Some(WsCommand::Subscribe { unsubscribe, tx, .. }) => {
                    Pending::Subscribe { unsubscribe, tx }.fail(RpcError::Closed)
                }
                Some(WsCommand::Unsubscribe { .. }) => {}
            },
        }
    }
}

/// Forget calls whose caller timed out or was dropped.
fn prune_abandoned(pending: &mut HashMap<u64, Pending>) -> usize {
    let before = pending.len();
    pending.retain(|_, entry| !entry.is_abandoned());
    let pruned = before - pending.len();
    if pruned > 0 {
        tracing::debug!(pruned, "dropped abandoned requests");
    }
    pruned
}

fn handle_message(
    text: &str,
    pending: &mut HashMap<u64, Pending>,
    subscriptions: &SubscriptionTable,
    cmd_tx: &mpsc::UnboundedSender<WsCommand>,
) {
    let Some(incoming) = Incoming::parse(text) else {
        tracing::debug!("ignoring unrecognised WS message");
        return;
    };

    let resp = match incoming {
        Incoming::Notification(note) => {
            if let Some(key) = subscription_key(&note.params.subscription) {
                subscriptions.dispatch(&key, note.params.result);
            }
            return;
        }
        Incoming::Response(resp) => resp,
    };

    let RpcId::Number(id) = resp.id else {
        return;
    };
    match pending.remove(&id) {
        Some(Pending::Call(tx)) => {
            let _ = tx.send(resp.into_result().map_err(RpcError::Rpc));
        }
        Some(Pending::Subscribe { unsubscribe, tx }) => {
            let opened = resp.into_result().map_err(RpcError::Rpc).and_then(|sub_id| {
                let key = subscription_key(&sub_id)
                    .ok_or_else(|| RpcError::InvalidResponse(format!("subscription id {sub_id}")))?;
                let rx = subscriptions.register(key);
                Ok(Subscription::new(sub_id, rx, unsubscribe, cmd_tx.clone()))
            });
            // A caller that gave up drops the subscription here, which unsubscribes.
            let _ = tx.send(opened);
        }
        None => tracing::debug!(id, "response for unknown request"),
    }
}
