//! Gateway session: handshake, heartbeat liveness, sequence tracking, and
//! the resume protocol.
//!
//! The session normalizes actionable gateway events into Commands and
//! pushes them onto a channel for the dispatcher. Idempotency keys are
//! derived from the session id and sequence number, so events replayed
//! after a resume dedup in the store instead of re-running their effects.

use std::time::Duration;

use rand::Rng;
use tokio::sync::mpsc;
use tokio::time::{interval, sleep};
use tracing::{debug, info, warn};
use uuid::Uuid;

use relay_common::{Command, CommandKind, CommandOrigin, RelayError};

use crate::transport::{GatewayConnector, GatewayError, GatewayTransport};
use crate::wire::{DispatchEvent, GatewayMessage};

const RECONNECT_BASE: Duration = Duration::from_secs(1);
const RECONNECT_CAP: Duration = Duration::from_secs(60);

/// Shortest heartbeat interval we will honor. Guards against a hostile or
/// broken hello flooding the socket.
const HEARTBEAT_FLOOR: Duration = Duration::from_millis(100);

/// What the session tells the rest of the system.
#[derive(Debug)]
pub enum SessionEvent {
    /// An actionable event, normalized and keyed.
    Command(Command),
    /// The platform invalidated our session beyond resume. Sequence
    /// continuity is lost; consumers holding per-session state drop it.
    Reset,
}

/// Why one connection ended without ending the session.
enum ConnectionEnd {
    /// Socket lost or the platform asked us to reconnect. The outer loop
    /// dials again and resumes.
    Dropped,
    /// The event channel closed; the process is going down.
    Shutdown,
}

pub struct GatewaySession<C: GatewayConnector> {
    connector: C,
    token: String,
    events: mpsc::Sender<SessionEvent>,
    session_id: Option<String>,
    last_seq: Option<u64>,
    /// Scopes idempotency keys for events that arrive before `ready`
    /// names the session. Regenerated per connection so two unidentified
    /// connections can never produce colliding keys.
    connection_nonce: String,
}

impl<C: GatewayConnector> GatewaySession<C> {
    pub fn new(connector: C, token: impl Into<String>, events: mpsc::Sender<SessionEvent>) -> Self {
        Self {
            connector,
            token: token.into(),
            events,
            session_id: None,
            last_seq: None,
            connection_nonce: Uuid::new_v4().to_string(),
        }
    }

    /// Drive the session until shutdown or a fatal protocol failure.
    ///
    /// Connection drops reconnect with capped exponential backoff and
    /// resume where the platform allows it. An authentication rejection
    /// is terminal: retrying the same token cannot succeed.
    pub async fn run(&mut self) -> Result<(), RelayError> {
        let mut failures: u32 = 0;
        loop {
            let mut transport = match self.connector.connect().await {
                Ok(t) => t,
                Err(GatewayError::AuthRejected(reason)) => {
                    return Err(RelayError::FatalProtocol(format!(
                        "gateway rejected credentials: {reason}"
                    )));
                }
                Err(e) => {
                    failures += 1;
                    let wait = reconnect_backoff(failures);
                    warn!(error = %e, wait_ms = wait.as_millis() as u64, "Gateway dial failed");
                    sleep(wait).await;
                    continue;
                }
            };

            match self.run_connection(&mut transport).await {
                Ok(ConnectionEnd::Shutdown) => {
                    info!("Gateway session shutting down");
                    return Ok(());
                }
                Ok(ConnectionEnd::Dropped) => {
                    failures = 0;
                    debug!("Gateway connection dropped, reconnecting");
                }
                Err(GatewayError::AuthRejected(reason)) => {
                    return Err(RelayError::FatalProtocol(format!(
                        "gateway rejected credentials: {reason}"
                    )));
                }
                Err(e) => {
                    failures += 1;
                    let wait = reconnect_backoff(failures);
                    warn!(error = %e, wait_ms = wait.as_millis() as u64, "Gateway connection failed");
                    sleep(wait).await;
                }
            }
        }
    }

    /// One connection's lifetime: hello, identify or resume, then the
    /// event loop until the socket drops.
    async fn run_connection(
        &mut self,
        transport: &mut C::Transport,
    ) -> Result<ConnectionEnd, GatewayError> {
        self.connection_nonce = Uuid::new_v4().to_string();
        let heartbeat_interval = match transport.recv().await? {
            Some(GatewayMessage::Hello {
                heartbeat_interval_ms,
            }) => Duration::from_millis(heartbeat_interval_ms).max(HEARTBEAT_FLOOR),
            Some(other) => {
                return Err(GatewayError::Protocol(format!(
                    "expected hello, got {other:?}"
                )));
            }
            None => return Ok(ConnectionEnd::Dropped),
        };

        match (&self.session_id, self.last_seq) {
            (Some(session_id), Some(last_seq)) => {
                debug!(session_id = %session_id, last_seq, "Resuming gateway session");
                transport
                    .send(GatewayMessage::Resume {
                        token: self.token.clone(),
                        session_id: session_id.clone(),
                        last_seq,
                    })
                    .await?;
            }
            _ => {
                debug!("Identifying fresh gateway session");
                transport
                    .send(GatewayMessage::Identify {
                        token: self.token.clone(),
                    })
                    .await?;
            }
        }

        let mut ticker = interval(heartbeat_interval);
        ticker.tick().await; // first tick fires immediately
        let mut awaiting_ack = false;

        loop {
            tokio::select! {
                frame = transport.recv() => {
                    match frame? {
                        Some(GatewayMessage::HeartbeatAck) => awaiting_ack = false,
                        Some(msg) => {
                            if let Some(end) = self.handle_message(transport, msg).await? {
                                return Ok(end);
                            }
                        }
                        None => return Ok(ConnectionEnd::Dropped),
                    }
                }
                _ = ticker.tick() => {
                    if awaiting_ack {
                        warn!("Heartbeat ack missed, dropping connection");
                        return Ok(ConnectionEnd::Dropped);
                    }
                    transport
                        .send(GatewayMessage::Heartbeat { last_seq: self.last_seq })
                        .await?;
                    awaiting_ack = true;
                }
                _ = self.events.closed() => return Ok(ConnectionEnd::Shutdown),
            }
        }
    }

    async fn handle_message(
        &mut self,
        transport: &mut C::Transport,
        msg: GatewayMessage,
    ) -> Result<Option<ConnectionEnd>, GatewayError> {
        match msg {
            GatewayMessage::Dispatch {
                seq,
                event_type,
                data,
            } => {
                if let Some(last) = self.last_seq {
                    if seq <= last {
                        debug!(seq, last, "Skipping replayed gateway event");
                        return Ok(None);
                    }
                }
                self.last_seq = Some(seq);
                self.handle_dispatch(seq, &event_type, data).await
            }
            GatewayMessage::HeartbeatAck => Ok(None),
            GatewayMessage::Heartbeat { .. } => {
                // The platform may request an immediate heartbeat.
                transport
                    .send(GatewayMessage::Heartbeat {
                        last_seq: self.last_seq,
                    })
                    .await?;
                Ok(None)
            }
            GatewayMessage::InvalidSession { resumable } => {
                if resumable {
                    debug!("Session invalidated but resumable, reconnecting");
                    return Ok(Some(ConnectionEnd::Dropped));
                }
                warn!("Session invalidated, identifying fresh");
                self.session_id = None;
                self.last_seq = None;
                if self.events.send(SessionEvent::Reset).await.is_err() {
                    return Ok(Some(ConnectionEnd::Shutdown));
                }
                transport
                    .send(GatewayMessage::Identify {
                        token: self.token.clone(),
                    })
                    .await?;
                Ok(None)
            }
            GatewayMessage::Reconnect => {
                debug!("Platform requested reconnect");
                Ok(Some(ConnectionEnd::Dropped))
            }
            GatewayMessage::Hello { .. } => {
                warn!("Unexpected mid-stream hello, ignoring");
                Ok(None)
            }
            GatewayMessage::Identify { .. } | GatewayMessage::Resume { .. } => {
                Err(GatewayError::Protocol("client op received from peer".into()))
            }
        }
    }

    async fn handle_dispatch(
        &mut self,
        seq: u64,
        event_type: &str,
        data: serde_json::Value,
    ) -> Result<Option<ConnectionEnd>, GatewayError> {
        let event = match DispatchEvent::parse(event_type, &data) {
            Ok(event) => event,
            Err(e) => {
                warn!(event_type, seq, error = %e, "Rejecting unknown gateway event");
                return Ok(None);
            }
        };

        let (kind, resource_key, body) = match event {
            DispatchEvent::Ready { session_id } => {
                info!(session_id = %session_id, "Gateway session ready");
                self.session_id = Some(session_id);
                return Ok(None);
            }
            DispatchEvent::Resumed {} => {
                info!(last_seq = ?self.last_seq, "Gateway session resumed");
                return Ok(None);
            }
            DispatchEvent::PresenceSync { resource_key } => {
                debug!(resource_key = %resource_key, "Presence event, no command");
                return Ok(None);
            }
            DispatchEvent::RecordUpserted { resource_key, body } => {
                (CommandKind::Apply, resource_key, body)
            }
            DispatchEvent::RecordRetracted { resource_key, body } => {
                (CommandKind::Retract, resource_key, body)
            }
            DispatchEvent::DeliveryRequested { resource_key, body } => {
                (CommandKind::Deliver, resource_key, body)
            }
        };

        let scope = self.session_id.as_deref().unwrap_or(&self.connection_nonce);
        let command = Command::new(kind, resource_key, body, CommandOrigin::Gateway)
            .with_idempotency_key(format!("gw:{scope}:{seq}"));

        if self.events.send(SessionEvent::Command(command)).await.is_err() {
            return Ok(Some(ConnectionEnd::Shutdown));
        }
        Ok(None)
    }
}

/// Capped exponential backoff with jitter for redials.
fn reconnect_backoff(failures: u32) -> Duration {
    let exp = RECONNECT_BASE.saturating_mul(1u32 << failures.saturating_sub(1).min(6));
    let capped = exp.min(RECONNECT_CAP);
    let jitter_ms = rand::rng().random_range(0..=capped.as_millis() as u64 / 4);
    capped + Duration::from_millis(jitter_ms)
}
