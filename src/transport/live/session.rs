use std::sync::{Arc, Mutex, MutexGuard, OnceLock};

use anyhow::{Result, anyhow, bail};
use futures_util::{SinkExt, StreamExt};
use serde_json::Value;
use tokio::sync::{Mutex as AsyncMutex, mpsc};
use tokio_tungstenite::tungstenite::Message as WsMessage;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::protocol::{CloseReason, DomainEvent, Notification, SessionId, SessionState};

use super::frame::{self, FrameEncoder, op, version};
use super::{AuthPayload, LiveCredentials, SessionConfig, Subscribers, cascade, event};

/// The platform wants a non-empty heartbeat body but never reads it.
const HEARTBEAT_BODY: &[u8] = b"[object Object]";

type WsStream = tokio_tungstenite::WebSocketStream<
    tokio_tungstenite::MaybeTlsStream<tokio::net::TcpStream>,
>;
type WsWriter = futures_util::stream::SplitSink<WsStream, WsMessage>;
type WsReader = futures_util::stream::SplitStream<WsStream>;

/// Write half of the socket plus the sequence counter that numbers every
/// frame written to it. Both live behind one lock so sequence order is
/// wire order.
struct Outbound {
    sink: WsWriter,
    encoder: FrameEncoder,
}

/// One connection to the live chat service.
///
/// A Session goes `Idle -> Connecting -> Connected -> Closed` and is never
/// reused; reconnecting means building a new one. Everything it decodes is
/// published to [`Session::subscribe`] receivers.
pub struct Session {
    inner: Arc<Inner>,
}

/// Closes a session whose `connect` future is dropped while still
/// Connecting. Once connect promotes or fails, the state has moved on and
/// dropping the guard does nothing.
struct ConnectGuard<'a>(&'a Inner);

impl Drop for ConnectGuard<'_> {
    fn drop(&mut self) {
        let abandoned = {
            let mut state = self.0.lock_state();
            let abandoned = *state == SessionState::Connecting;
            if abandoned {
                *state = SessionState::Closed;
            }
            abandoned
        };
        if abandoned {
            warn!("[{}] connect() was cancelled, closing session", self.0.id);
            self.0.cancel.cancel();
        }
    }
}

struct Inner {
    id: SessionId,
    config: SessionConfig,
    state: Mutex<SessionState>,
    credentials: OnceLock<LiveCredentials>,
    outbound: AsyncMutex<Option<Outbound>>,
    cancel: CancellationToken,
    subscribers: Subscribers,
}

impl Session {
    pub fn new(config: SessionConfig) -> Self {
        Self {
            inner: Arc::new(Inner {
                id: SessionId::new(),
                config,
                state: Mutex::new(SessionState::Idle),
                credentials: OnceLock::new(),
                outbound: AsyncMutex::new(None),
                cancel: CancellationToken::new(),
                subscribers: Subscribers::new(),
            }),
        }
    }

    pub fn id(&self) -> &SessionId {
        &self.inner.id
    }

    pub fn state(&self) -> SessionState {
        *self.inner.lock_state()
    }

    pub fn is_connected(&self) -> bool {
        self.state() == SessionState::Connected
    }

    /// Room this session was connected to, once `connect` has been called.
    pub fn room_id(&self) -> Option<u64> {
        self.inner.credentials.get().map(|c| c.room_id)
    }

    /// Receives every notification published from now on. Drop the receiver
    /// to unsubscribe.
    pub fn subscribe(&self) -> mpsc::UnboundedReceiver<Notification> {
        self.inner.subscribers.subscribe()
    }

    /// Opens the socket, authenticates and starts the heartbeat.
    ///
    /// Returns immediately if a connect is already in flight or done. Fails
    /// on a closed session, on socket errors, or when the socket does not
    /// open within the configured timeout.
    pub async fn connect(&self, credentials: &LiveCredentials) -> Result<()> {
        let inner = &self.inner;
        {
            let mut state = inner.lock_state();
            match *state {
                SessionState::Connecting | SessionState::Connected => {
                    debug!("[{}] connect() ignored, session is {:?}", inner.id, *state);
                    return Ok(());
                }
                SessionState::Closed => {
                    bail!("session {} is closed; create a new session to reconnect", inner.id)
                }
                SessionState::Idle => *state = SessionState::Connecting,
            }
        }
        let _guard = ConnectGuard(inner.as_ref());
        let _ = inner.credentials.set(credentials.clone());

        info!(
            "[{}] Connecting to {} (room {})",
            inner.id, inner.config.endpoint, credentials.room_id
        );
        let opened = tokio::time::timeout(
            inner.config.connect_timeout,
            tokio_tungstenite::connect_async(inner.config.endpoint.as_str()),
        )
        .await;
        let ws = match opened {
            Ok(Ok((ws, _))) => ws,
            Ok(Err(e)) => return Err(inner.fail_connect(format!("WebSocket connect failed: {e}"))),
            Err(_) => {
                return Err(inner.fail_connect(format!(
                    "WebSocket connect timed out after {:?}",
                    inner.config.connect_timeout
                )));
            }
        };

        let (mut sink, reader) = ws.split();
        let still_connecting = *inner.lock_state() == SessionState::Connecting;
        if !still_connecting {
            // disconnect() ran while the handshake was in flight.
            let _ = tokio::time::timeout(inner.config.connect_timeout, sink.close()).await;
            bail!("session {} was closed while connecting", inner.id);
        }
        let mut outbound = Outbound {
            sink,
            encoder: FrameEncoder::new(),
        };

        let auth = serde_json::to_vec(&AuthPayload::new(credentials))
            .map_err(|e| inner.fail_connect(format!("Failed to serialize auth payload: {e}")))?;
        let auth_frame = outbound.encoder.encode(auth, version::CONTROL, op::AUTH);
        if let Err(e) = outbound.sink.send(WsMessage::Binary(auth_frame)).await {
            return Err(inner.fail_connect(format!("Failed to send auth: {e}")));
        }
        debug!("[{}] Auth frame sent", inner.id);

        *inner.outbound.lock().await = Some(outbound);
        if !inner.promote_to_connected() {
            // disconnect() won the race while the socket was opening.
            inner.close_outbound().await;
            bail!("session {} was closed while connecting", inner.id);
        }
        info!("[{}] Connected", inner.id);

        tokio::spawn(read_loop(inner.clone(), reader));
        tokio::spawn(heartbeat_loop(inner.clone()));
        Ok(())
    }

    /// Closes the socket and stops the heartbeat. Safe to call at any time,
    /// any number of times.
    pub async fn disconnect(&self) -> Result<()> {
        if self.inner.shutdown(CloseReason::Requested).await {
            info!("[{}] Disconnected", self.inner.id);
        }
        Ok(())
    }
}

impl Drop for Session {
    fn drop(&mut self) {
        self.inner.cancel.cancel();
    }
}

impl Inner {
    fn lock_state(&self) -> MutexGuard<'_, SessionState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn fail_connect(&self, msg: String) -> anyhow::Error {
        warn!("[{}] {msg}", self.id);
        let was_connecting = {
            let mut state = self.lock_state();
            let was = *state == SessionState::Connecting;
            *state = SessionState::Closed;
            was
        };
        self.cancel.cancel();
        if was_connecting {
            self.subscribers.publish(Notification::Error(msg.clone()));
        }
        anyhow!(msg)
    }

    /// Connecting -> Connected, publishing `Connected` under the same lock so
    /// no close notification can overtake it.
    fn promote_to_connected(&self) -> bool {
        let mut state = self.lock_state();
        if *state != SessionState::Connecting {
            return false;
        }
        *state = SessionState::Connected;
        self.subscribers.publish(Notification::Connected);
        true
    }

    /// Publishes only while Connected. Returns false once the session closed.
    fn publish_if_connected(&self, notification: Notification) -> bool {
        let state = self.lock_state();
        if *state != SessionState::Connected {
            return false;
        }
        self.subscribers.publish(notification);
        true
    }

    /// Single exit path for every way a session ends. Only the first caller
    /// does the work; later calls return false.
    async fn shutdown(&self, reason: CloseReason) -> bool {
        {
            let mut state = self.lock_state();
            if *state == SessionState::Closed {
                return false;
            }
            *state = SessionState::Closed;
        }
        self.cancel.cancel();
        self.close_outbound().await;

        if let CloseReason::TransportError(e) = &reason {
            self.subscribers.publish(Notification::Error(e.clone()));
        }
        self.subscribers.publish(Notification::Disconnected(reason));
        true
    }

    async fn close_outbound(&self) {
        // A heartbeat stuck on a full socket holds this lock; don't wait on it forever.
        let taken = match tokio::time::timeout(self.config.connect_timeout, self.outbound.lock())
            .await
        {
            Ok(mut outbound) => outbound.take(),
            Err(_) => {
                warn!("[{}] Outbound busy, leaving the socket to be dropped", self.id);
                return;
            }
        };
        let Some(mut outbound) = taken else {
            return;
        };
        match tokio::time::timeout(self.config.connect_timeout, outbound.sink.close()).await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => debug!("[{}] Socket close: {e}", self.id),
            Err(_) => debug!("[{}] Socket close timed out", self.id),
        }
    }

    /// Writes one frame if the session is still connected. A send after
    /// close is a no-op returning `Ok(false)`.
    async fn send_frame(&self, body: &[u8], protocol_version: u16, opcode: u32) -> Result<bool> {
        let mut outbound = self.outbound.lock().await;
        let Some(out) = outbound.as_mut() else {
            return Ok(false);
        };
        let connected = *self.lock_state() == SessionState::Connected;
        if !connected {
            return Ok(false);
        }
        let frame = out.encoder.encode(body, protocol_version, opcode);
        out.sink.send(WsMessage::Binary(frame)).await?;
        Ok(true)
    }

    fn handle_binary(&self, data: &[u8]) {
        let (header, body) = match frame::decode_frame(data, self.config.max_frame_size) {
            Ok(v) => v,
            Err(e) => {
                warn!("[{}] Dropping malformed frame: {e}", self.id);
                return;
            }
        };

        match header.opcode {
            op::MESSAGE => self.handle_message(&header, body),
            op::HEARTBEAT_REPLY => {
                let Some(count) = body.first_chunk::<4>().map(|b| u32::from_be_bytes(*b)) else {
                    debug!("[{}] Heartbeat reply without popularity", self.id);
                    return;
                };
                debug!("[{}] Heartbeat reply, popularity={count}", self.id);
                self.publish_if_connected(Notification::Event(DomainEvent::PopularityUpdate {
                    count,
                }));
            }
            op::AUTH_REPLY => self.handle_auth_reply(body),
            other => debug!("[{}] Ignoring opcode {other}", self.id),
        }
    }

    fn handle_message(&self, header: &frame::FrameHeader, body: &[u8]) {
        let batch = match cascade::unpack(header, body, self.config.max_frame_size) {
            Ok(batch) => batch,
            Err(e) => {
                warn!("[{}] Dropping message: {e}", self.id);
                return;
            }
        };

        for body in &batch.bodies {
            match event::decode_event(body) {
                Ok(Some(ev)) => {
                    if !self.publish_if_connected(Notification::Event(ev)) {
                        return;
                    }
                }
                Ok(None) => {}
                Err(e) => warn!("[{}] Dropping event: {e}", self.id),
            }
        }
    }

    fn handle_auth_reply(&self, body: &[u8]) {
        let code = serde_json::from_slice::<Value>(body)
            .ok()
            .and_then(|v| v.get("code").and_then(Value::as_i64));
        match code {
            Some(0) => info!("[{}] Auth accepted", self.id),
            Some(code) => {
                warn!("[{}] Auth rejected with code {code}", self.id);
                self.publish_if_connected(Notification::Error(format!(
                    "authentication rejected (code {code})"
                )));
            }
            None => warn!(
                "[{}] Unreadable auth reply: {}",
                self.id,
                String::from_utf8_lossy(body)
            ),
        }
    }
}

async fn read_loop(inner: Arc<Inner>, mut reader: WsReader) {
    let reason = loop {
        tokio::select! {
            _ = inner.cancel.cancelled() => return,
            msg = reader.next() => {
                let Some(msg) = msg else {
                    info!("[{}] Stream ended", inner.id);
                    break CloseReason::ServerClosed;
                };
                match msg {
                    Ok(WsMessage::Binary(data)) => inner.handle_binary(&data),
                    Ok(WsMessage::Close(frame)) => {
                        info!("[{}] Server closed the socket: {frame:?}", inner.id);
                        break CloseReason::ServerClosed;
                    }
                    Ok(WsMessage::Text(text)) => {
                        debug!("[{}] Ignoring text message ({} bytes)", inner.id, text.len());
                    }
                    Ok(_) => {}
                    Err(e) => {
                        warn!("[{}] Receive error: {e}", inner.id);
                        break CloseReason::TransportError(e.to_string());
                    }
                }
            }
        }
    };
    inner.shutdown(reason).await;
}

async fn heartbeat_loop(inner: Arc<Inner>) {
    let mut ticker = tokio::time::interval(inner.config.heartbeat_interval);
    ticker.tick().await; // first tick is immediate

    loop {
        tokio::select! {
            _ = inner.cancel.cancelled() => return,
            _ = ticker.tick() => {
                match inner.send_frame(HEARTBEAT_BODY, version::CONTROL, op::HEARTBEAT).await {
                    Ok(true) => debug!("[{}] Heartbeat sent", inner.id),
                    Ok(false) => return,
                    Err(e) => {
                        warn!("[{}] Heartbeat error: {e}", inner.id);
                        inner.shutdown(CloseReason::TransportError(e.to_string())).await;
                        return;
                    }
                }
            }
        }
    }
}
