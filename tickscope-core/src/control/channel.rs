//! Session manager for the control protocol.
//!
//! At most one display session is connected at a time; agents are
//! unlimited. While no display is connected, queueable commands and capture
//! lifecycle messages are buffered and replayed in order to the next display
//! that registers. Captures the server already announced are re-announced
//! to every new display so both sides agree on what exists.
//!
//! The channel is transport-agnostic: a session is the sending half of an
//! unbounded queue of [`Outbound`] items that the transport writes out.

use super::protocol::{
    capture_removed, capture_tick, classify, CommandClass, Envelope, Outbound, RegisterRequest,
    Role, CLOSE_DISPLAY_BUSY, CLOSE_DISPLAY_REPLACED,
};
use super::queue::{BoundedQueue, CaptureBuffers};
use crate::config::ControlConfig;
use crate::error::{Error, Result};
use serde::Serialize;
use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Mutex, MutexGuard};
use tokio::sync::mpsc::UnboundedSender;

/// Sender half handed to the channel for one connection.
pub type SessionSender = UnboundedSender<Outbound>;

/// A registered session.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SessionHandle {
    pub id: u64,
    pub role: Role,
}

/// Result of a registration attempt.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Registration {
    Accepted(SessionHandle),
    /// The session was sent a close frame and must not be used
    Rejected { code: u16, reason: String },
}

/// What the caller must do with a dispatched message.
#[derive(Debug, Clone, PartialEq)]
pub enum Dispatch {
    /// Fully handled by the channel
    Done,
    /// A server command; answer it with [`ControlChannel::reply`]
    Server(Envelope),
}

/// Channel-wide status report.
#[derive(Debug, Clone, Serialize)]
pub struct ChannelStatus {
    pub display_connected: bool,
    pub display_client_id: Option<String>,
    pub agents: usize,
    pub queued_commands: usize,
    pub dropped_commands: u64,
    pub buffered_frames: usize,
    pub dropped_frames: u64,
    pub known_captures: usize,
    pub pending_requests: usize,
}

struct Session {
    id: u64,
    client_id: Option<String>,
    tx: SessionSender,
}

impl Session {
    fn send(&self, envelope: &Envelope) -> bool {
        self.tx.send(Outbound::Text(envelope.to_text())).is_ok()
    }

    fn close(&self, code: u16, reason: &str) {
        let _ = self.tx.send(Outbound::Close {
            code,
            reason: reason.to_string(),
        });
    }
}

/// Server-side record of a capture announced on the channel.
struct KnownCapture {
    first_seen: u64,
    init: Envelope,
    components: Option<Envelope>,
    last_tick: Option<u64>,
    end: Option<Envelope>,
}

struct ChannelState {
    display: Option<Session>,
    agents: BTreeMap<u64, Session>,
    commands: BoundedQueue<Envelope>,
    captures: CaptureBuffers,
    known: HashMap<String, KnownCapture>,
    known_seq: u64,
    /// request id → requesting agent session
    pending: HashMap<String, u64>,
}

/// Display/agent session manager.
pub struct ControlChannel {
    config: ControlConfig,
    state: Mutex<ChannelState>,
    next_session: AtomicU64,
}

impl ControlChannel {
    pub fn new(config: &ControlConfig) -> Self {
        Self {
            config: config.clone(),
            state: Mutex::new(ChannelState {
                display: None,
                agents: BTreeMap::new(),
                commands: BoundedQueue::new(config.queue_capacity),
                captures: CaptureBuffers::new(config.frames_per_capture, config.frames_total),
                known: HashMap::new(),
                known_seq: 0,
                pending: HashMap::new(),
            }),
            next_session: AtomicU64::new(1),
        }
    }

    fn lock(&self) -> MutexGuard<'_, ChannelState> {
        self.state
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Register a new session.
    ///
    /// A second display is rejected with [`CLOSE_DISPLAY_BUSY`] unless it asks
    /// for takeover, in which case the current display is closed with
    /// [`CLOSE_DISPLAY_REPLACED`]. A newly registered display receives every
    /// buffered message.
    pub fn register(&self, request: RegisterRequest, tx: SessionSender) -> Registration {
        let id = self.next_session.fetch_add(1, Ordering::Relaxed);
        let session = Session {
            id,
            client_id: request.client_id.clone(),
            tx,
        };
        let mut state = self.lock();

        match request.role {
            Role::Agent => {
                let registered = registered_message(id, Role::Agent, state.display.is_some());
                session.send(&registered);
                state.agents.insert(id, session);
                tracing::info!(session_id = id, client_id = ?request.client_id, "Agent registered");
            }
            Role::Display => {
                if let Some(current) = state.display.take() {
                    if !request.takeover {
                        let reason = "display already connected";
                        session.close(CLOSE_DISPLAY_BUSY, reason);
                        state.display = Some(current);
                        tracing::info!(session_id = id, "Display rejected: busy");
                        return Registration::Rejected {
                            code: CLOSE_DISPLAY_BUSY,
                            reason: reason.to_string(),
                        };
                    }
                    current.close(CLOSE_DISPLAY_REPLACED, "display replaced");
                    fail_pending(&mut state, "display replaced before answering");
                    tracing::info!(
                        session_id = id,
                        replaced = current.id,
                        "Display taken over"
                    );
                }

                session.send(&registered_message(id, Role::Display, true));
                state.display = Some(session);
                broadcast_agents(&mut state, &Envelope::new("display_connected"));
                self.flush_to_display(&mut state);
                tracing::info!(session_id = id, client_id = ?request.client_id, "Display registered");
            }
        }

        Registration::Accepted(SessionHandle {
            id,
            role: request.role,
        })
    }

    /// Remove a session after its connection closed.
    pub fn unregister(&self, handle: SessionHandle) {
        let mut state = self.lock();
        match handle.role {
            Role::Display => {
                if state.display.as_ref().is_some_and(|d| d.id == handle.id) {
                    state.display = None;
                    fail_pending(&mut state, "display disconnected before answering");
                    broadcast_agents(&mut state, &Envelope::new("display_disconnected"));
                    tracing::info!(session_id = handle.id, "Display disconnected");
                }
            }
            Role::Agent => {
                if state.agents.remove(&handle.id).is_some() {
                    state.pending.retain(|_, agent| *agent != handle.id);
                    tracing::debug!(session_id = handle.id, "Agent disconnected");
                }
            }
        }
    }

    /// Route one message from a registered session.
    pub fn dispatch(&self, handle: SessionHandle, envelope: Envelope) -> Result<Dispatch> {
        if envelope.kind == "register" {
            return Err(Error::Protocol("session is already registered".to_string()));
        }
        match handle.role {
            Role::Display => Ok(self.dispatch_from_display(handle, envelope)),
            Role::Agent => Ok(self.dispatch_from_agent(handle, envelope)),
        }
    }

    fn dispatch_from_display(&self, handle: SessionHandle, envelope: Envelope) -> Dispatch {
        if classify(&envelope.kind) == CommandClass::Server {
            return Dispatch::Server(envelope);
        }

        let mut state = self.lock();
        if state.display.as_ref().map(|d| d.id) != Some(handle.id) {
            tracing::debug!(session_id = handle.id, "Ignoring message from stale display");
            return Dispatch::Done;
        }

        // Answers to agent requests go back to the requester only
        if let Some(agent_id) = envelope
            .request_id
            .as_ref()
            .and_then(|rid| state.pending.remove(rid))
        {
            if let Some(agent) = state.agents.get(&agent_id) {
                agent.send(&envelope);
            }
            return Dispatch::Done;
        }

        broadcast_agents(&mut state, &envelope);
        Dispatch::Done
    }

    fn dispatch_from_agent(&self, handle: SessionHandle, mut envelope: Envelope) -> Dispatch {
        let class = classify(&envelope.kind);
        if class == CommandClass::Server {
            return Dispatch::Server(envelope);
        }

        let mut state = self.lock();
        let Some(agent_tx) = state.agents.get(&handle.id).map(|a| a.tx.clone()) else {
            return Dispatch::Done;
        };
        let reply = |envelope: &Envelope| {
            let _ = agent_tx.send(Outbound::Text(envelope.to_text()));
        };

        match class {
            CommandClass::ResponseRequired => {
                if state.display.is_none() {
                    reply(&Envelope::error(
                        format!("{} requires a connected display", envelope.kind),
                        envelope.request_id.clone(),
                    ));
                    return Dispatch::Done;
                }
                let request_id = envelope
                    .request_id
                    .get_or_insert_with(|| uuid::Uuid::new_v4().to_string())
                    .clone();
                state.pending.insert(request_id.clone(), handle.id);
                if !send_to_display(&mut state, &envelope) {
                    state.pending.remove(&request_id);
                    reply(&Envelope::error(
                        format!("{} requires a connected display", envelope.kind),
                        Some(request_id),
                    ));
                }
            }
            CommandClass::Queueable => {
                let delivered = send_to_display(&mut state, &envelope);
                if !delivered {
                    if let Some(evicted) = state.commands.push(envelope.clone()) {
                        tracing::debug!(command = %evicted.kind, "Command queue full, dropped oldest");
                    }
                }
                reply(&Envelope::ack(&envelope, !delivered));
            }
            CommandClass::CaptureStream => {
                let delivered = self.publish_locked(&mut state, &envelope);
                reply(&Envelope::ack(&envelope, !delivered));
            }
            CommandClass::Unknown => {
                reply(&Envelope::error(
                    format!("unknown message type: {}", envelope.kind),
                    envelope.request_id.clone(),
                ));
            }
            CommandClass::Server => {}
        }
        Dispatch::Done
    }

    /// Send a message to one session (answers to server commands).
    pub fn reply(&self, handle: SessionHandle, envelope: &Envelope) {
        let mut state = self.lock();
        match handle.role {
            Role::Display => {
                let sent = state
                    .display
                    .as_ref()
                    .filter(|d| d.id == handle.id)
                    .map(|d| d.send(envelope));
                if sent == Some(false) {
                    state.display = None;
                }
            }
            Role::Agent => {
                let sent = state.agents.get(&handle.id).map(|a| a.send(envelope));
                if sent == Some(false) {
                    state.agents.remove(&handle.id);
                }
            }
        }
    }

    /// Publish a capture lifecycle message from the server.
    ///
    /// Goes to the display when connected, otherwise into the per-capture
    /// buffer. Agents see everything except bulk appends.
    pub fn publish(&self, envelope: &Envelope) {
        let mut state = self.lock();
        self.publish_locked(&mut state, envelope);
    }

    /// Returns true if the display received the message directly.
    fn publish_locked(&self, state: &mut ChannelState, envelope: &Envelope) -> bool {
        remember_capture(state, envelope);
        let delivered = send_to_display(state, envelope);
        if !delivered {
            seed_buffer(state, envelope);
            state.captures.record(envelope);
        }
        if envelope.kind != "capture_append" {
            broadcast_agents(state, envelope);
        }
        delivered
    }

    /// Forget a removed capture and tell connected sessions.
    pub fn forget_capture(&self, capture_id: &str) {
        let mut state = self.lock();
        state.known.remove(capture_id);
        state.captures.remove(capture_id);
        let removed = capture_removed(capture_id);
        send_to_display(&mut state, &removed);
        broadcast_agents(&mut state, &removed);
    }

    /// Drop all buffered and known capture state and queued commands.
    pub fn clear(&self) {
        let mut state = self.lock();
        state.known.clear();
        state.captures.clear();
        state.commands.clear();
        let cleared = Envelope::new("state_cleared");
        send_to_display(&mut state, &cleared);
        broadcast_agents(&mut state, &cleared);
    }

    pub fn display_connected(&self) -> bool {
        self.lock().display.is_some()
    }

    pub fn status(&self) -> ChannelStatus {
        let state = self.lock();
        ChannelStatus {
            display_connected: state.display.is_some(),
            display_client_id: state.display.as_ref().and_then(|d| d.client_id.clone()),
            agents: state.agents.len(),
            queued_commands: state.commands.len(),
            dropped_commands: state.commands.dropped(),
            buffered_frames: state.captures.frame_count(),
            dropped_frames: state.captures.dropped(),
            known_captures: state.known.len(),
            pending_requests: state.pending.len(),
        }
    }

    /// Replay buffered captures, re-announce the rest, then queued commands.
    fn flush_to_display(&self, state: &mut ChannelState) {
        let (replay, flushed) = state.captures.drain(self.config.replay_batch);
        let mut sent = 0usize;
        for envelope in &replay {
            if send_to_display(state, envelope) {
                sent += 1;
            }
        }

        let mut reannounce: Vec<(&String, &KnownCapture)> = state
            .known
            .iter()
            .filter(|(id, _)| !flushed.contains(*id))
            .collect();
        reannounce.sort_by_key(|(_, k)| k.first_seen);
        let mut messages = Vec::new();
        for (capture_id, known) in reannounce {
            messages.push(known.init.clone());
            messages.extend(known.components.clone());
            if let Some(tick) = known.last_tick {
                messages.push(capture_tick(capture_id, tick));
            }
            messages.extend(known.end.clone());
        }
        for envelope in &messages {
            send_to_display(state, envelope);
        }

        let commands = state.commands.drain();
        let command_count = commands.len();
        for command in &commands {
            send_to_display(state, command);
        }

        tracing::info!(
            replayed = sent,
            reannounced = messages.len(),
            commands = command_count,
            "Flushed buffered state to display"
        );
    }
}

fn registered_message(id: u64, role: Role, display_connected: bool) -> Envelope {
    Envelope::new("registered")
        .with("session_id", id)
        .with("role", role)
        .with("display_connected", display_connected)
}

/// Send to the display; a dead display is dropped and false returned.
fn send_to_display(state: &mut ChannelState, envelope: &Envelope) -> bool {
    let Some(current) = state.display.as_ref() else {
        return false;
    };
    if current.send(envelope) {
        return true;
    }
    tracing::debug!(session_id = current.id, "Display writer gone, dropping session");
    state.display = None;
    fail_pending(state, "display disconnected before answering");
    false
}

/// Start a capture's buffer from what the last display was already sent,
/// so replay always opens with init and components.
fn seed_buffer(state: &mut ChannelState, envelope: &Envelope) {
    if envelope.kind == "capture_init" {
        return;
    }
    let Some(capture_id) = envelope.capture_id() else {
        return;
    };
    if state.captures.contains(capture_id) {
        return;
    }
    if let Some(known) = state.known.get(capture_id) {
        state.captures.record(&known.init);
        if let Some(components) = &known.components {
            state.captures.record(components);
        }
    }
}

fn broadcast_agents(state: &mut ChannelState, envelope: &Envelope) {
    if state.agents.is_empty() {
        return;
    }
    let text = envelope.to_text();
    let dead: Vec<u64> = state
        .agents
        .values()
        .filter(|a| a.tx.send(Outbound::Text(text.clone())).is_err())
        .map(|a| a.id)
        .collect();
    for id in dead {
        state.agents.remove(&id);
        state.pending.retain(|_, agent| *agent != id);
    }
}

/// Tell every agent with an outstanding request that it will not be answered.
fn fail_pending(state: &mut ChannelState, reason: &str) {
    for (request_id, agent_id) in state.pending.drain() {
        if let Some(agent) = state.agents.get(&agent_id) {
            agent.send(&Envelope::error(reason, Some(request_id)));
        }
    }
}

fn remember_capture(state: &mut ChannelState, envelope: &Envelope) {
    let Some(capture_id) = envelope.capture_id().map(str::to_string) else {
        return;
    };
    if envelope.kind == "capture_init" {
        state.known_seq += 1;
        let first_seen = state
            .known
            .get(&capture_id)
            .map_or(state.known_seq, |k| k.first_seen);
        state.known.insert(
            capture_id,
            KnownCapture {
                first_seen,
                init: envelope.clone(),
                components: None,
                last_tick: None,
                end: None,
            },
        );
        return;
    }

    let Some(known) = state.known.get_mut(&capture_id) else {
        return;
    };
    match envelope.kind.as_str() {
        "capture_components" => known.components = Some(envelope.clone()),
        "capture_tick" => {
            if let Some(tick) = envelope.get("tick").and_then(|t| t.as_u64()) {
                known.last_tick = Some(tick);
            }
        }
        "capture_append" => {
            let last = envelope
                .get("frames")
                .and_then(|f| f.as_array())
                .and_then(|frames| frames.iter().filter_map(|f| f["tick"].as_u64()).max());
            if let Some(tick) = last {
                known.last_tick = Some(known.last_tick.map_or(tick, |t| t.max(tick)));
            }
        }
        "capture_end" => {
            if let Some(tick) = envelope.get("last_tick").and_then(|t| t.as_u64()) {
                known.last_tick = Some(tick);
            }
            known.end = Some(envelope.clone());
        }
        _ => {}
    }
}
