//! # WebSocket Connection Actors
//!
//! Each accepted WebSocket becomes one actor. The actor owns the socket and a
//! protocol handler ([`ServiceHandler`] for `/voicebot`, [`BrowserHandler`] for
//! `/browser`); the handler decides, the actor carries out the [`Effect`]s.
//!
//! ## Actor Model (actix):
//! - **One mailbox per connection**: frames, observer relays and pipeline
//!   results are all processed one at a time, in arrival order
//! - **No locks on session state**: only the actor touches its handler
//! - **Addresses**: `ctx.address()` gives other code a way to send messages
//!   back, which is how the detached pipeline task delivers its reply
//!
//! ## Connection Flow:
//! ```text
//! GET /voicebot ─► reserve primary slot ─┬─► StreamSocket<ServiceHandler>
//!                                        └─► RefusedSocket (error 1003, close)
//! GET /browser?token=… ─► token check ──────► StreamSocket<BrowserHandler>
//! ```

use crate::config::SessionConfig;
use crate::error::AppError;
use crate::pipeline::transcripts::TranscriptStore;
use crate::pipeline::{PipelineOutput, VoicePipeline};
use crate::protocol::{
    BrowserHandler, Effect, ErrorCode, InboundEventSink, ProtocolError, ServiceHandler, StreamEvent, WireMessage,
};
use crate::state::AppState;
use crate::stream::{Broadcast, ConnectionManager, PeerRole, RelayToPrimary};

use actix::prelude::*;
use actix_web::{http::header, web, HttpRequest, HttpResponse, Result as ActixResult};
use actix_web_actors::ws;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, error, info, warn};
use uuid::Uuid;

/// A pipeline run finished; delivered back to the connection that started it.
#[derive(Message)]
#[rtype(result = "()")]
struct PipelineFinished {
    generation: u64,
    result: Result<PipelineOutput, String>,
}

/// One WebSocket connection driven by a protocol handler.
///
/// ## Generic over the handler:
/// `H` is fixed when the connection is accepted, so the primary and observer
/// actors share the heartbeat, framing and effect code without a runtime
/// role check on every frame.
pub struct StreamSocket<H: InboundEventSink> {
    handler: H,
    registry: Arc<ConnectionManager>,
    pipeline: Arc<VoicePipeline>,
    transcripts: Arc<TranscriptStore>,
    heartbeat_interval: Duration,
    client_timeout: Duration,
    last_heartbeat: Instant,
}

impl<H: InboundEventSink> StreamSocket<H> {
    pub fn new(handler: H, state: &AppState, session: &SessionConfig) -> Self {
        Self {
            handler,
            registry: state.registry.clone(),
            pipeline: state.pipeline.clone(),
            transcripts: state.transcripts.clone(),
            heartbeat_interval: Duration::from_secs(session.heartbeat_interval_secs),
            client_timeout: Duration::from_secs(session.client_timeout_secs),
            last_heartbeat: Instant::now(),
        }
    }

    /// Ping on every interval; stop the actor if the peer has been silent too long.
    fn start_heartbeat(&self, ctx: &mut ws::WebsocketContext<Self>) {
        ctx.run_interval(self.heartbeat_interval, |act, ctx| {
            if Instant::now().duration_since(act.last_heartbeat) > act.client_timeout {
                warn!(
                    connection_id = act.handler.connection_id(),
                    "WebSocket heartbeat timeout, closing connection"
                );
                ctx.stop();
                return;
            }
            ctx.ping(b"");
        });
    }

    fn send(&self, ctx: &mut ws::WebsocketContext<Self>, message: &WireMessage) {
        match message.encode() {
            Ok(text) => ctx.text(text),
            Err(e) => error!(
                connection_id = self.handler.connection_id(),
                event = message.event.name(),
                error = %e,
                "Failed to encode outgoing message"
            ),
        }
    }

    /// Carry out a handler's effects in order.
    fn apply_effects(&mut self, effects: Vec<Effect>, ctx: &mut ws::WebsocketContext<Self>) {
        for effect in effects {
            match effect {
                Effect::Reply(message) => self.send(ctx, &message),
                Effect::Broadcast(message) => {
                    self.registry.broadcast(&message);
                }
                Effect::ReplyAndBroadcast(message) => {
                    self.send(ctx, &message);
                    self.registry.broadcast(&message);
                }
                Effect::Process(job) => {
                    let pipeline = self.pipeline.clone();
                    let addr = ctx.address();
                    let generation = job.generation;
                    tokio::spawn(async move {
                        let result = pipeline.respond(&job).await.map_err(|e| format!("{:#}", e));
                        addr.do_send(PipelineFinished { generation, result });
                    });
                }
                Effect::PersistTranscript(record) => {
                    let store = self.transcripts.clone();
                    tokio::spawn(async move {
                        if let Err(e) = store.save(&record).await {
                            error!(stream_id = %record.stream_id, error = %format!("{:#}", e), "Failed to save transcript");
                        }
                    });
                }
            }
        }
    }
}

impl<H: InboundEventSink> Actor for StreamSocket<H> {
    type Context = ws::WebsocketContext<Self>;

    /// Register with the connection manager and start the heartbeat.
    fn started(&mut self, ctx: &mut Self::Context) {
        let connection_id = self.handler.connection_id().to_string();
        match self.handler.role() {
            PeerRole::Primary => self.registry.attach_primary(&connection_id, ctx.address().recipient()),
            PeerRole::Observer => self.registry.register(&connection_id, ctx.address().recipient()),
        }
        info!(connection_id = %connection_id, role = self.handler.role().as_str(), "WebSocket connection started");
        self.start_heartbeat(ctx);
    }

    /// Flush the session and give up the registry entry.
    fn stopped(&mut self, ctx: &mut Self::Context) {
        let effects = self.handler.handle_close();
        self.apply_effects(effects, ctx);

        let connection_id = self.handler.connection_id().to_string();
        match self.handler.role() {
            PeerRole::Primary => {
                self.registry.release_primary(&connection_id);
            }
            PeerRole::Observer => {
                self.registry.unregister(&connection_id);
            }
        }
        info!(connection_id = %connection_id, "WebSocket connection stopped");
    }
}

impl<H: InboundEventSink> StreamHandler<Result<ws::Message, ws::ProtocolError>> for StreamSocket<H> {
    fn handle(&mut self, msg: Result<ws::Message, ws::ProtocolError>, ctx: &mut Self::Context) {
        match msg {
            Ok(ws::Message::Text(text)) => {
                self.last_heartbeat = Instant::now();
                let effects = match WireMessage::decode(&text) {
                    Ok(message) => {
                        debug!(
                            connection_id = self.handler.connection_id(),
                            event = message.event.name(),
                            sequence = ?message.sequence(),
                            "Inbound event"
                        );
                        self.handler.handle_event(message)
                    }
                    Err(error) => self.handler.handle_decode_error(error),
                };
                self.apply_effects(effects, ctx);
            }
            Ok(ws::Message::Binary(data)) => {
                self.last_heartbeat = Instant::now();
                let error = ProtocolError::new(
                    ErrorCode::UnknownEvent,
                    format!("Binary frames are not supported ({} bytes)", data.len()),
                );
                let effects = self.handler.handle_decode_error(error);
                self.apply_effects(effects, ctx);
            }
            Ok(ws::Message::Ping(data)) => {
                self.last_heartbeat = Instant::now();
                ctx.pong(&data);
            }
            Ok(ws::Message::Pong(_)) => {
                self.last_heartbeat = Instant::now();
            }
            Ok(ws::Message::Close(reason)) => {
                info!(connection_id = self.handler.connection_id(), ?reason, "WebSocket closed by peer");
                ctx.close(reason);
                ctx.stop();
            }
            Ok(ws::Message::Continuation(_)) => {
                warn!(connection_id = self.handler.connection_id(), "Unexpected continuation frame");
            }
            Ok(ws::Message::Nop) => {}
            Err(err) => {
                error!(connection_id = self.handler.connection_id(), error = %err, "WebSocket protocol error");
                ctx.stop();
            }
        }
    }
}

impl<H: InboundEventSink> Handler<Broadcast> for StreamSocket<H> {
    type Result = ();

    fn handle(&mut self, msg: Broadcast, ctx: &mut Self::Context) {
        self.send(ctx, &msg.0);
    }
}

impl<H: InboundEventSink> Handler<RelayToPrimary> for StreamSocket<H> {
    type Result = ();

    fn handle(&mut self, msg: RelayToPrimary, ctx: &mut Self::Context) {
        let effects = self.handler.handle_relay(&msg.from, msg.event);
        self.apply_effects(effects, ctx);
    }
}

impl<H: InboundEventSink> Handler<PipelineFinished> for StreamSocket<H> {
    type Result = ();

    fn handle(&mut self, msg: PipelineFinished, ctx: &mut Self::Context) {
        let effects = self.handler.handle_pipeline_result(msg.generation, msg.result);
        self.apply_effects(effects, ctx);
    }
}

/// Short-lived actor for a primary that arrived while another call is live.
///
/// Sends a single `error` 1003 and closes; the existing stream is not touched.
pub struct RefusedSocket {
    connection_id: String,
}

impl RefusedSocket {
    pub fn new(connection_id: impl Into<String>) -> Self {
        Self {
            connection_id: connection_id.into(),
        }
    }
}

impl Actor for RefusedSocket {
    type Context = ws::WebsocketContext<Self>;

    fn started(&mut self, ctx: &mut Self::Context) {
        let error = ProtocolError::new(ErrorCode::PrimaryBusy, "A primary stream is already connected");
        let mut message = WireMessage::bare(StreamEvent::error(&error));
        message.sequence_number = Some("1".to_string());
        if let Ok(text) = message.encode() {
            ctx.text(text);
        }
        ctx.close(Some(ws::CloseReason {
            code: ws::CloseCode::Policy,
            description: Some(error.message),
        }));
        ctx.stop();
        warn!(connection_id = %self.connection_id, "Refused second primary connection");
    }
}

impl StreamHandler<Result<ws::Message, ws::ProtocolError>> for RefusedSocket {
    fn handle(&mut self, msg: Result<ws::Message, ws::ProtocolError>, ctx: &mut Self::Context) {
        if let Ok(ws::Message::Close(_)) | Err(_) = msg {
            ctx.stop();
        }
    }
}

/// `GET /voicebot`: the telephony stream.
///
/// ## Single primary:
/// The slot is reserved before the upgrade, so two simultaneous callers can
/// never both get a session. The loser still completes the handshake and is
/// told why on the wire.
pub async fn voicebot_websocket(
    req: HttpRequest,
    stream: web::Payload,
    state: web::Data<AppState>,
) -> ActixResult<HttpResponse> {
    let connection_id = Uuid::new_v4().to_string();
    info!(
        connection_id = %connection_id,
        peer = ?req.connection_info().peer_addr(),
        "Primary connection request"
    );

    if !state.registry.reserve_primary(&connection_id) {
        state.record_refused_primary();
        return ws::start(RefusedSocket::new(connection_id), &req, stream);
    }

    let config = state.get_config();
    let handler = ServiceHandler::new(
        connection_id.clone(),
        config.audio.clone(),
        state.contacts.clone(),
        state.pipeline.stats(),
    );
    let socket = StreamSocket::new(handler, &state, &config.session);

    match ws::start(socket, &req, stream) {
        Ok(response) => {
            state.record_websocket_upgrade();
            Ok(response)
        }
        Err(e) => {
            state.registry.release_primary(&connection_id);
            Err(e)
        }
    }
}

/// Compare two secrets without stopping at the first differing byte.
fn tokens_match(presented: &[u8], expected: &[u8]) -> bool {
    if presented.len() != expected.len() {
        return false;
    }

    let mut diff = 0u8;
    for (a, b) in presented.iter().zip(expected) {
        diff |= a ^ b;
    }
    diff == 0
}

/// Token from `?token=` or an `Authorization: Bearer` header.
fn observer_token(req: &HttpRequest) -> Option<String> {
    let query = web::Query::<HashMap<String, String>>::from_query(req.query_string())
        .map(|q| q.into_inner())
        .unwrap_or_default();
    if let Some(token) = query.get("token") {
        return Some(token.clone());
    }

    req.headers()
        .get(header::AUTHORIZATION)
        .and_then(|value| value.to_str().ok())
        .and_then(|value| value.strip_prefix("Bearer "))
        .map(|token| token.trim().to_string())
}

/// `GET /browser`: an observer that sees the primary's traffic.
pub async fn browser_websocket(
    req: HttpRequest,
    stream: web::Payload,
    state: web::Data<AppState>,
) -> ActixResult<HttpResponse> {
    let config = state.get_config();
    if config.browser.token.is_empty() {
        return Err(AppError::Unauthorized("Observer connections are disabled".to_string()).into());
    }
    let presented = observer_token(&req).unwrap_or_default();
    if !tokens_match(presented.as_bytes(), config.browser.token.as_bytes()) {
        warn!(peer = ?req.connection_info().peer_addr(), "Observer rejected, bad token");
        return Err(AppError::Unauthorized("Invalid observer token".to_string()).into());
    }

    let connection_id = Uuid::new_v4().to_string();
    let handler = BrowserHandler::new(connection_id, state.registry.clone());
    let socket = StreamSocket::new(handler, &state, &config.session);

    let response = ws::start(socket, &req, stream)?;
    state.record_websocket_upgrade();
    Ok(response)
}
