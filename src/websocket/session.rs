use super::connection::{Frame, SessionKey};
use crate::services::presence::PresenceEngine;
use actix::{Actor, ActorContext, AsyncContext, StreamHandler};
use actix_web_actors::ws;
use std::time::{Duration, Instant};
use tokio::sync::mpsc::UnboundedReceiver;
use tokio_stream::wrappers::UnboundedReceiverStream;

#[derive(Debug, Clone, Copy)]
pub struct Heartbeat {
    pub interval: Duration,
    pub client_timeout: Duration,
}

/// WebSocket actor bridging one registered session to its socket.
///
/// Frames handed to the session's connection arrive through `frames` and are
/// written as binary messages. When the registry drops the connection (user
/// evicted, registry reset) the stream ends and the actor stops.
pub struct WsSession {
    key: SessionKey,
    frames: Option<UnboundedReceiver<Frame>>,
    presence: PresenceEngine,
    heartbeat: Heartbeat,
    hb: Instant,
}

impl WsSession {
    pub fn new(
        key: SessionKey,
        frames: UnboundedReceiver<Frame>,
        presence: PresenceEngine,
        heartbeat: Heartbeat,
    ) -> Self {
        Self {
            key,
            frames: Some(frames),
            presence,
            heartbeat,
            hb: Instant::now(),
        }
    }

    fn hb(&self, ctx: &mut ws::WebsocketContext<Self>) {
        ctx.run_interval(self.heartbeat.interval, |act, ctx| {
            if Instant::now().duration_since(act.hb) > act.heartbeat.client_timeout {
                tracing::warn!(
                    user_id = %act.key.user_id,
                    session_id = %act.key.session_id,
                    "WebSocket heartbeat failed, disconnecting"
                );
                ctx.stop();
                return;
            }
            ctx.ping(b"");
        });
    }
}

impl Actor for WsSession {
    type Context = ws::WebsocketContext<Self>;

    fn started(&mut self, ctx: &mut Self::Context) {
        tracing::info!(
            user_id = %self.key.user_id,
            session_id = %self.key.session_id,
            category = %self.key.category,
            driver_id = %self.key.driver_id,
            "WebSocket session started"
        );

        self.hb(ctx);

        if let Some(frames) = self.frames.take() {
            ctx.add_stream(UnboundedReceiverStream::new(frames));
        }
    }

    fn stopped(&mut self, _ctx: &mut Self::Context) {
        tracing::info!(
            user_id = %self.key.user_id,
            session_id = %self.key.session_id,
            "WebSocket session stopped"
        );

        let presence = self.presence.clone();
        let key = self.key.clone();
        actix::spawn(async move {
            presence.on_disconnect(key).await;
        });
    }
}

// Outbound frames from the registry
impl StreamHandler<Frame> for WsSession {
    fn handle(&mut self, frame: Frame, ctx: &mut Self::Context) {
        ctx.binary(frame);
    }

    fn finished(&mut self, ctx: &mut Self::Context) {
        tracing::debug!(
            user_id = %self.key.user_id,
            session_id = %self.key.session_id,
            "connection released by registry, closing socket"
        );
        ctx.close(None);
        ctx.stop();
    }
}

// Inbound WebSocket protocol messages
impl StreamHandler<Result<ws::Message, ws::ProtocolError>> for WsSession {
    fn handle(&mut self, msg: Result<ws::Message, ws::ProtocolError>, ctx: &mut Self::Context) {
        match msg {
            Ok(ws::Message::Ping(msg)) => {
                self.hb = Instant::now();
                ctx.pong(&msg);
            }
            Ok(ws::Message::Pong(_)) => {
                self.hb = Instant::now();
            }
            Ok(ws::Message::Text(_)) | Ok(ws::Message::Binary(_)) => {
                // Clients only receive on this channel.
                self.hb = Instant::now();
                tracing::debug!(
                    user_id = %self.key.user_id,
                    "ignoring inbound WebSocket payload"
                );
            }
            Ok(ws::Message::Close(reason)) => {
                tracing::info!(
                    user_id = %self.key.user_id,
                    "WebSocket close message received: {:?}",
                    reason
                );
                ctx.close(reason);
                ctx.stop();
            }
            Err(e) => {
                tracing::warn!(user_id = %self.key.user_id, error = %e, "WebSocket protocol error");
                ctx.stop();
            }
            _ => {}
        }
    }
}
