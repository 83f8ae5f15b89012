//! The dispatcher: a single consumer that owns all directory and session
//! state and applies one routing step per inbound event.
//!
//! Pumps never touch [`Directory`]. They post [`InboundEvent`]s through a
//! [`ManagerHandle`] and the dispatcher loop drains them strictly in order,
//! so no two routing decisions ever interleave. Replies are appended to the
//! target connection's outbound buffer without waiting.

use std::sync::Arc;

use async_trait::async_trait;
use hotline_core::protocol::{self, Ack, CallRequest, ChatRequest, LoginRequest, SessionBegin};
use hotline_core::{Command, ErrorCode, IceServer};
use hotline_settings::{AuthSettings, HotlineSettings, SelectionPolicy};
use metrics::{counter, gauge};
use tokio::sync::{mpsc, watch};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, trace, warn};

use crate::auth;
use crate::channel::{ChannelHandle, ChannelObserver};
use crate::directory::{Directory, DirectoryStats, Role};
use crate::metrics::{
    FRAMES_DISCARDED_TOTAL, FRAMES_DISPATCHED_TOTAL, REQUESTS_REJECTED_TOTAL, SESSIONS_ACTIVE,
    SESSIONS_BEGUN_TOTAL, SESSIONS_ENDED_TOTAL, STAFFERS_ONLINE, USERS_ONLINE,
};
use crate::routing;

/// One unit of dispatcher work.
#[derive(Debug)]
pub enum InboundEvent {
    /// A text frame read from `channel`.
    Frame {
        /// Originating connection.
        channel: Arc<ChannelHandle>,
        /// Raw frame, decoded by the dispatcher.
        payload: String,
    },
    /// `channel` closed. Only ever produced by the pump, never from the wire.
    ChannelBroken {
        /// The connection that went away.
        channel: Arc<ChannelHandle>,
    },
}

/// Cloneable sender side of the dispatcher queue.
#[derive(Clone, Debug)]
pub struct ManagerHandle {
    tx: mpsc::Sender<InboundEvent>,
}

impl ManagerHandle {
    /// Create a handle and the queue the dispatcher drains.
    pub fn channel(capacity: usize) -> (Self, mpsc::Receiver<InboundEvent>) {
        let (tx, rx) = mpsc::channel(capacity);
        (Self { tx }, rx)
    }

    /// Queue an event. Waits while the queue is full; returns `false` once
    /// the dispatcher has stopped.
    pub async fn post(&self, event: InboundEvent) -> bool {
        self.tx.send(event).await.is_ok()
    }
}

#[async_trait]
impl ChannelObserver for ManagerHandle {
    async fn on_frame(&self, channel: &Arc<ChannelHandle>, payload: String) {
        let event = InboundEvent::Frame {
            channel: Arc::clone(channel),
            payload,
        };
        if !self.post(event).await {
            debug!(connection_id = %channel.id(), "dispatcher gone, frame dropped");
        }
    }

    async fn on_channel_close(&self, channel: &Arc<ChannelHandle>) {
        let event = InboundEvent::ChannelBroken {
            channel: Arc::clone(channel),
        };
        let _ = self.post(event).await;
    }
}

/// Directory, session set, and the policy knobs that drive routing.
pub struct Manager {
    directory: Directory,
    ice_servers: Vec<IceServer>,
    selection: SelectionPolicy,
    auth: AuthSettings,
    stats: watch::Sender<DirectoryStats>,
}

impl Manager {
    /// Build an empty dispatcher state. The receiver observes the counts
    /// published after every step.
    pub fn new(settings: &HotlineSettings) -> (Self, watch::Receiver<DirectoryStats>) {
        let (stats, stats_rx) = watch::channel(DirectoryStats::default());
        let manager = Self {
            directory: Directory::new(),
            ice_servers: settings.ice_servers.clone(),
            selection: settings.dispatcher.selection,
            auth: settings.auth.clone(),
            stats,
        };
        (manager, stats_rx)
    }

    /// Read-only view of the state.
    pub fn directory(&self) -> &Directory {
        &self.directory
    }

    /// Drain `rx` until it closes or `cancel` fires.
    pub async fn run(mut self, mut rx: mpsc::Receiver<InboundEvent>, cancel: CancellationToken) {
        info!("dispatcher started");
        loop {
            tokio::select! {
                () = cancel.cancelled() => break,
                event = rx.recv() => match event {
                    Some(event) => self.handle_event(event),
                    None => break,
                },
            }
        }
        info!(stats = ?self.directory.stats(), "dispatcher stopped");
    }

    /// Apply one event to completion.
    pub fn handle_event(&mut self, event: InboundEvent) {
        match event {
            InboundEvent::Frame { channel, payload } => self.dispatch_frame(&channel, &payload),
            InboundEvent::ChannelBroken { channel } => self.channel_broken(&channel),
        }
        self.publish_stats();
    }

    #[allow(clippy::cast_precision_loss)] // directory sizes stay far below 2^52
    fn publish_stats(&self) {
        let stats = self.directory.stats();
        gauge!(STAFFERS_ONLINE).set(stats.staffers as f64);
        gauge!(USERS_ONLINE).set(stats.users as f64);
        gauge!(SESSIONS_ACTIVE).set(stats.sessions as f64);
        let _ = self.stats.send_if_modified(|current| {
            if *current == stats {
                false
            } else {
                *current = stats;
                true
            }
        });
    }

    fn dispatch_frame(&mut self, channel: &Arc<ChannelHandle>, payload: &str) {
        let cmd = match protocol::decode_command(payload) {
            Ok(cmd) => cmd,
            Err(e) => {
                debug!(connection_id = %channel.id(), error = %e, "discarding frame");
                counter!(FRAMES_DISCARDED_TOTAL).increment(1);
                return;
            }
        };
        counter!(FRAMES_DISPATCHED_TOTAL, "cmd" => cmd.as_str()).increment(1);
        trace!(connection_id = %channel.id(), %cmd, "dispatch");

        match cmd {
            Command::StafferLogin => self.login(Role::Staffer, channel, payload),
            Command::UserLogin => self.login(Role::User, channel, payload),
            Command::Call => self.call(channel, payload),
            Command::Chat => {
                if decode_or_discard::<ChatRequest>(channel, cmd, payload).is_some() {
                    self.relay(channel, payload);
                }
            }
            Command::Webrtc => self.relay(channel, payload),
            Command::Hangup => self.hangup(channel),
            // Server-to-client tags never resolve inbound.
            Command::StafferLoginAck
            | Command::UserLoginAck
            | Command::CallAck
            | Command::SessionBegin
            | Command::SessionEnd => {}
        }
    }

    fn login(&mut self, role: Role, channel: &Arc<ChannelHandle>, payload: &str) {
        let (cmd, ack) = match role {
            Role::Staffer => (Command::StafferLogin, Command::StafferLoginAck),
            Role::User => (Command::UserLogin, Command::UserLoginAck),
        };
        let Some(req) = decode_or_discard::<LoginRequest>(channel, cmd, payload) else {
            return;
        };

        // A taken account always answers already-logged-in, whatever the password.
        let code = if req.username.is_empty() {
            ErrorCode::Username
        } else if self.directory.contains(role, &req.username) {
            ErrorCode::AlreadyLogin
        } else if !auth::verify(&self.auth, role, &req.username, &req.password) {
            ErrorCode::Password
        } else if self
            .directory
            .register(role, Arc::clone(channel), &req.username, &req.agent)
        {
            ErrorCode::Success
        } else {
            ErrorCode::AlreadyLogin
        };

        if code == ErrorCode::Success {
            info!(
                connection_id = %channel.id(),
                role = role.as_str(),
                account = %req.username,
                agent = %req.agent,
                "logged in"
            );
            reply(channel, &Ack::new(ack, code));
        } else {
            reject(channel, ack, code);
        }
    }

    fn call(&mut self, channel: &Arc<ChannelHandle>, payload: &str) {
        let Some(req) = decode_or_discard::<CallRequest>(channel, Command::Call, payload) else {
            return;
        };

        let routed = routing::check_caller(&self.directory, &req.caller, channel.id()).and_then(
            |caller| {
                routing::resolve_callee(&self.directory, caller, req.callee.as_deref(), self.selection)
            },
        );
        let staffer = match routed {
            Ok(staffer) => staffer,
            Err(code) => {
                reject(channel, Command::CallAck, code);
                return;
            }
        };

        let Some(session) = self.directory.begin_session(&staffer, &req.caller) else {
            return;
        };
        let begin = SessionBegin::new(&session.staffer, &session.user, self.ice_servers.clone());
        reply(&session.staffer_channel, &begin);
        reply(&session.user_channel, &begin);
        counter!(SESSIONS_BEGUN_TOTAL).increment(1);
        info!(
            session_id = %session.id,
            staffer = %session.staffer,
            user = %session.user,
            "session begun"
        );
    }

    fn relay(&self, channel: &Arc<ChannelHandle>, payload: &str) {
        let peer = self
            .directory
            .session_for(channel.id())
            .and_then(|s| s.peer_of(channel.id()));
        match peer {
            Some((_, peer)) => {
                let _ = peer.enqueue(payload.to_owned());
            }
            None => trace!(connection_id = %channel.id(), "no session, relay dropped"),
        }
    }

    fn hangup(&mut self, channel: &Arc<ChannelHandle>) {
        let Some(session) = self.directory.take_session_for(channel.id()) else {
            debug!(connection_id = %channel.id(), "hangup outside a session");
            return;
        };
        self.directory.mark_idle(Role::Staffer, &session.staffer);
        self.directory.mark_idle(Role::User, &session.user);

        let end = Ack::session_end(ErrorCode::Success);
        reply(&session.staffer_channel, &end);
        reply(&session.user_channel, &end);
        counter!(SESSIONS_ENDED_TOTAL, "reason" => "hangup").increment(1);
        info!(session_id = %session.id, staffer = %session.staffer, user = %session.user, "session ended");
    }

    fn channel_broken(&mut self, channel: &Arc<ChannelHandle>) {
        let conn = channel.id();

        if let Some(session) = self.directory.take_session_for(conn) {
            if let Some((role, survivor)) = session.peer_of(conn) {
                let account = match role {
                    Role::Staffer => &session.staffer,
                    Role::User => &session.user,
                };
                self.directory.mark_idle(role, account);
                reply(survivor, &Ack::session_end(ErrorCode::PeerOffline));
            }
            counter!(SESSIONS_ENDED_TOTAL, "reason" => "peer_offline").increment(1);
            info!(session_id = %session.id, connection_id = %conn, "session ended by disconnect");
        }

        for (role, record) in self.directory.remove_channel(conn) {
            info!(
                connection_id = %conn,
                role = role.as_str(),
                account = %record.account,
                "logged out"
            );
        }
    }
}

fn decode_or_discard<T: serde::de::DeserializeOwned>(
    channel: &ChannelHandle,
    cmd: Command,
    payload: &str,
) -> Option<T> {
    match protocol::decode::<T>(payload) {
        Ok(body) => Some(body),
        Err(e) => {
            debug!(connection_id = %channel.id(), %cmd, error = %e, "discarding malformed body");
            counter!(FRAMES_DISCARDED_TOTAL).increment(1);
            None
        }
    }
}

fn reply<T: serde::Serialize>(channel: &ChannelHandle, frame: &T) {
    if !channel.enqueue_json(frame) {
        debug!(connection_id = %channel.id(), "reply not queued");
    }
}

fn reject(channel: &ChannelHandle, ack: Command, code: ErrorCode) {
    counter!(REQUESTS_REJECTED_TOTAL, "code" => code.label()).increment(1);
    warn!(connection_id = %channel.id(), %ack, code = code.label(), "request rejected");
    reply(channel, &Ack::new(ack, code));
}
