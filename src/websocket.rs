//! # Telephony Media WebSocket
//!
//! Accepts the telephony provider's media stream on `/media`. Each connection is one call
//! leg and is handled by a [`TelephonySocket`] actor.
//!
//! ## Responsibilities:
//! - **Actor**: owns the socket, answers pings, enforces the client timeout
//! - **Call driver** ([`crate::relay::call`]): parses the JSON events and runs the call
//!
//! The actor forwards text frames to the driver in arrival order and never inspects them.
//! The driver talks back through [`ActorTransport`], which turns outbound events into
//! actor messages, so only the actor ever writes to the socket.
//!
//! ## Lifecycle:
//! 1. **Upgrade**: `media_websocket` claims a call slot (503 when none is left)
//! 2. **Started**: the actor spawns the call driver
//! 3. **Stopped**: for any reason (peer close, protocol error, timeout, `stop` event) the
//!    driver's inbound channel is closed, the call is torn down, and the slot is released

use crate::conversation::SessionFactory;
use crate::error::AppError;
use crate::relay::protocol::OutboundEvent;
use crate::relay::{
    spawn_call, CallConfig, CallHandle, ObserverSet, RelayContext, RelayCounters, RelayObserver,
    TelephonyTransport, TracingObserver, TransportError,
};
use crate::state::{AppState, CallPermit};

use actix::prelude::*;
use actix_web::{web, HttpRequest, HttpResponse, Result as ActixResult};
use actix_web_actors::ws;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, error, info, warn};

/// How often the actor checks the client and pings it.
const HEARTBEAT_INTERVAL: Duration = Duration::from_secs(10);

/// Outbound JSON frame for the socket.
#[derive(Message)]
#[rtype(result = "()")]
struct SendText(String);

/// Ask the actor to close the socket.
#[derive(Message)]
#[rtype(result = "()")]
struct CloseSocket;

/// [`TelephonyTransport`] backed by the socket actor's mailbox.
pub struct ActorTransport {
    addr: Addr<TelephonySocket>,
}

impl TelephonyTransport for ActorTransport {
    fn send(&self, event: OutboundEvent) -> Result<(), TransportError> {
        if !self.addr.connected() {
            return Err(TransportError::Closed);
        }
        self.addr.do_send(SendText(event.to_json()?));
        Ok(())
    }

    fn close(&self) {
        self.addr.do_send(CloseSocket);
    }
}

/// What the actor needs to start its call once it is running.
struct CallSetup {
    config: CallConfig,
    sessions: Arc<dyn SessionFactory>,
    observer: Arc<dyn RelayObserver>,
    counters: Arc<RelayCounters>,
}

/// One telephony call leg.
pub struct TelephonySocket {
    call_id: String,
    setup: Option<CallSetup>,
    call: Option<CallHandle>,
    last_heartbeat: Instant,
    client_timeout: Duration,
    /// Held until the call has finished its teardown
    permit: Option<CallPermit>,
}

impl TelephonySocket {
    fn new(call_id: String, setup: CallSetup, client_timeout: Duration, permit: CallPermit) -> Self {
        Self {
            call_id,
            setup: Some(setup),
            call: None,
            last_heartbeat: Instant::now(),
            client_timeout,
            permit: Some(permit),
        }
    }

    fn heartbeat(&self, ctx: &mut ws::WebsocketContext<Self>) {
        ctx.run_interval(HEARTBEAT_INTERVAL, |act, ctx| {
            if Instant::now().duration_since(act.last_heartbeat) > act.client_timeout {
                warn!(call_id = %act.call_id, "Telephony socket timed out, closing");
                ctx.stop();
                return;
            }
            ctx.ping(b"");
        });
    }
}

impl Actor for TelephonySocket {
    type Context = ws::WebsocketContext<Self>;

    fn started(&mut self, ctx: &mut Self::Context) {
        info!(call_id = %self.call_id, "Telephony socket connected");
        self.heartbeat(ctx);

        if let Some(setup) = self.setup.take() {
            let context = RelayContext {
                transport: Arc::new(ActorTransport { addr: ctx.address() }),
                observer: setup.observer,
                counters: setup.counters,
            };
            self.call = Some(spawn_call(
                self.call_id.clone(),
                setup.config,
                setup.sessions.as_ref(),
                context,
            ));
        }
    }

    fn stopped(&mut self, _ctx: &mut Self::Context) {
        info!(call_id = %self.call_id, "Telephony socket closed");

        let call = self.call.take();
        let permit = self.permit.take();
        tokio::spawn(async move {
            if let Some(call) = call {
                call.join().await;
            }
            drop(permit);
        });
    }
}

impl StreamHandler<Result<ws::Message, ws::ProtocolError>> for TelephonySocket {
    fn handle(&mut self, msg: Result<ws::Message, ws::ProtocolError>, ctx: &mut Self::Context) {
        match msg {
            Ok(ws::Message::Text(text)) => {
                self.last_heartbeat = Instant::now();
                match &self.call {
                    Some(call) => {
                        call.forward(text.to_string());
                    }
                    None => warn!(call_id = %self.call_id, "Text frame without a running call"),
                }
            }
            Ok(ws::Message::Binary(bin)) => {
                self.last_heartbeat = Instant::now();
                debug!(call_id = %self.call_id, len = bin.len(), "Ignoring binary frame");
            }
            Ok(ws::Message::Ping(msg)) => {
                self.last_heartbeat = Instant::now();
                ctx.pong(&msg);
            }
            Ok(ws::Message::Pong(_)) => {
                self.last_heartbeat = Instant::now();
            }
            Ok(ws::Message::Close(reason)) => {
                debug!(call_id = %self.call_id, ?reason, "Peer closed the socket");
                ctx.close(reason);
                ctx.stop();
            }
            Ok(ws::Message::Continuation(_)) | Ok(ws::Message::Nop) => {}
            Err(err) => {
                error!(call_id = %self.call_id, "WebSocket protocol error: {}", err);
                ctx.stop();
            }
        }
    }
}

impl Handler<SendText> for TelephonySocket {
    type Result = ();

    fn handle(&mut self, msg: SendText, ctx: &mut Self::Context) {
        ctx.text(msg.0);
    }
}

impl Handler<CloseSocket> for TelephonySocket {
    type Result = ();

    fn handle(&mut self, _msg: CloseSocket, ctx: &mut Self::Context) {
        ctx.close(Some(ws::CloseCode::Normal.into()));
        ctx.stop();
    }
}

/// WebSocket endpoint handler for `/media`.
///
/// The configuration is read once here; a call keeps it for its whole lifetime.
pub async fn media_websocket(
    req: HttpRequest,
    stream: web::Payload,
    state: web::Data<AppState>,
) -> ActixResult<HttpResponse> {
    let config = state.get_config();
    let max_calls = config.performance.max_concurrent_calls;

    let Some(permit) = state.try_acquire_call(max_calls) else {
        warn!(max_calls, "Refusing telephony connection, call limit reached");
        return Err(AppError::ServiceUnavailable(format!(
            "Call limit reached ({} active calls)",
            max_calls
        ))
        .into());
    };

    let call_id = uuid::Uuid::new_v4().to_string();
    info!(
        call_id = %call_id,
        peer = ?req.connection_info().peer_addr(),
        "New telephony connection"
    );

    let mut observers = ObserverSet::new().with(Arc::new(TracingObserver::new(call_id.clone())));
    if let Some(console) = &state.console {
        observers = observers.with(console.clone());
    }

    let setup = CallSetup {
        config: CallConfig::from(&config),
        sessions: state.sessions.clone(),
        observer: Arc::new(observers),
        counters: state.relay.clone(),
    };

    let socket = TelephonySocket::new(
        call_id,
        setup,
        Duration::from_secs(config.server.client_timeout_secs),
        permit,
    );

    ws::start(socket, &req, stream)
}
