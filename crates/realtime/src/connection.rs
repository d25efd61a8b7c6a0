//! The connection manager: one task per logical channel.
//!
//! Each task owns its stream, its outbound gate and its reconnect schedule.
//! The session talks to it through [`ConnectionHandle`] and hears back through
//! [`ConnectionEvent`]s tagged with the channel and a generation number, so
//! events from a connection the session has already let go of can be told
//! apart from the live one.

use crate::transport::{ConnectRequest, Connector, Transport};
use bytes::Bytes;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::{Instant, sleep_until};
use tracing::{Instrument, debug, error, info, info_span, warn};
use voice_core::EngineError;
use voice_core::connection::{ConnectionState, Outbound, OutboundGate, ReconnectPolicy};
use voice_protocol::{ClientMessage, InboundEvent, ServerMessage, ServiceKind, WireFrame};

#[derive(Debug)]
pub enum ConnectionCommand {
    Send(ClientMessage),
    SendAudio(Bytes),
    /// Replaces the handshake sent on every (re)open.
    SetHandshake(ClientMessage),
    Close,
}

#[derive(Debug)]
pub enum ConnectionEventKind {
    State(ConnectionState),
    /// The handshake was confirmed and held traffic has been released.
    Confirmed,
    Message(ServerMessage),
    Audio(Bytes),
    Error(EngineError),
    /// The task has exited; nothing more will come from this generation.
    Terminated,
}

#[derive(Debug)]
pub struct ConnectionEvent {
    pub channel: ServiceKind,
    pub generation: u64,
    pub kind: ConnectionEventKind,
}

pub type EventSender = mpsc::UnboundedSender<ConnectionEvent>;

/// Everything needed to open and keep open one channel.
#[derive(Debug, Clone)]
pub struct ConnectionSpec {
    pub request: ConnectRequest,
    pub handshake: Option<ClientMessage>,
    /// Treat the stream as confirmed as soon as it opens.
    pub confirm_on_open: bool,
    /// Zero disables keepalives.
    pub keepalive: Duration,
    pub reconnect: ReconnectPolicy,
    pub audio_limit: usize,
    pub debug: bool,
}

pub struct ConnectionHandle {
    pub channel: ServiceKind,
    pub generation: u64,
    commands: mpsc::UnboundedSender<ConnectionCommand>,
    task: JoinHandle<()>,
}

impl ConnectionHandle {
    /// Returns false if the task has already exited.
    pub fn send(&self, command: ConnectionCommand) -> bool {
        self.commands.send(command).is_ok()
    }

    pub fn close(&self) {
        let _ = self.commands.send(ConnectionCommand::Close);
    }

    pub fn abort(&self) {
        self.task.abort();
    }

    pub fn is_finished(&self) -> bool {
        self.task.is_finished()
    }
}

pub fn spawn_connection(
    spec: ConnectionSpec,
    connector: Arc<dyn Connector>,
    events: EventSender,
    generation: u64,
) -> ConnectionHandle {
    let channel = spec.request.channel;
    let (commands_tx, commands_rx) = mpsc::unbounded_channel();
    let task = ConnectionTask {
        channel,
        generation,
        gate: OutboundGate::new(spec.audio_limit),
        handshake: spec.handshake.clone(),
        spec,
        connector,
        commands: commands_rx,
        events,
        state: ConnectionState::Closed,
    };
    let span = info_span!("connection", %channel, generation);
    let task = tokio::spawn(task.run().instrument(span));
    ConnectionHandle {
        channel,
        generation,
        commands: commands_tx,
        task,
    }
}

enum Opened {
    Open(Transport),
    Failed(String),
    Closed,
}

enum Exit {
    Closed,
    Dropped { reason: String, confirmed: bool },
}

struct ConnectionTask {
    channel: ServiceKind,
    generation: u64,
    spec: ConnectionSpec,
    handshake: Option<ClientMessage>,
    gate: OutboundGate,
    connector: Arc<dyn Connector>,
    commands: mpsc::UnboundedReceiver<ConnectionCommand>,
    events: EventSender,
    state: ConnectionState,
}

impl ConnectionTask {
    async fn run(mut self) {
        let mut attempt: u32 = 0;
        let mut last_failure = String::new();

        loop {
            if attempt > 0 {
                let Some(delay) = self.spec.reconnect.delay_for(attempt) else {
                    error!(attempts = attempt - 1, reason = %last_failure, "Giving up on connection.");
                    self.emit(ConnectionEventKind::Error(EngineError::Transport {
                        channel: self.channel,
                        message: format!(
                            "connection lost after {} reconnect attempts: {}",
                            attempt - 1,
                            last_failure
                        ),
                    }));
                    break;
                };
                info!(attempt, ?delay, "Reconnecting.");
                if !self.wait(delay).await {
                    break;
                }
            }

            self.set_state(ConnectionState::Connecting);
            let transport = match self.open().await {
                Opened::Open(transport) => transport,
                Opened::Failed(reason) => {
                    warn!(attempt, %reason, "Connection attempt failed.");
                    last_failure = reason;
                    attempt += 1;
                    continue;
                }
                Opened::Closed => break,
            };
            self.set_state(ConnectionState::Open);

            match self.drive(transport).await {
                Exit::Closed => break,
                Exit::Dropped { reason, confirmed } => {
                    warn!(%reason, "Connection dropped.");
                    self.gate.reset();
                    self.set_state(ConnectionState::Closed);
                    last_failure = reason;
                    // A connection that got as far as confirmation starts a fresh schedule.
                    attempt = if confirmed { 1 } else { attempt + 1 };
                }
            }
        }

        let discarded = self.gate.clear();
        if discarded > 0 {
            debug!(discarded, "Discarded traffic held for an unconfirmed connection.");
        }
        self.set_state(ConnectionState::Closed);
        self.emit(ConnectionEventKind::Terminated);
    }

    /// Waits out a backoff delay. Returns false if a close arrived meanwhile.
    async fn wait(&mut self, delay: Duration) -> bool {
        let deadline = Instant::now() + delay;
        loop {
            tokio::select! {
                _ = sleep_until(deadline) => return true,
                command = self.commands.recv() => {
                    if !self.hold(command) {
                        self.set_state(ConnectionState::Closing);
                        return false;
                    }
                }
            }
        }
    }

    /// Connects while still accepting commands. A close that arrives mid-connect
    /// is honoured once the attempt completes, and the new stream is dropped unused.
    async fn open(&mut self) -> Opened {
        let connector = self.connector.clone();
        let request = self.spec.request.clone();
        let connect = async move { connector.connect(&request).await };
        tokio::pin!(connect);

        let mut closing = false;
        loop {
            tokio::select! {
                result = &mut connect => {
                    return match result {
                        _ if closing => {
                            debug!("Connect completed after close was requested, discarding stream.");
                            Opened::Closed
                        }
                        Ok(transport) => Opened::Open(transport),
                        Err(e) => Opened::Failed(format!("{e:#}")),
                    };
                }
                command = self.commands.recv(), if !closing => {
                    if !self.hold(command) {
                        closing = true;
                        self.set_state(ConnectionState::Closing);
                    }
                }
            }
        }
    }

    /// Handles a command while no stream is open. Returns false on close.
    fn hold(&mut self, command: Option<ConnectionCommand>) -> bool {
        let item = match command {
            None | Some(ConnectionCommand::Close) => return false,
            Some(ConnectionCommand::SetHandshake(message)) => {
                self.handshake = Some(message);
                return true;
            }
            Some(ConnectionCommand::Send(message)) => Outbound::Message(message),
            Some(ConnectionCommand::SendAudio(data)) => Outbound::Audio(data),
        };
        if self.gate.submit(item).is_some() {
            debug!("Dropping traffic submitted while no stream is open.");
        }
        true
    }

    async fn drive(&mut self, transport: Transport) -> Exit {
        let Transport {
            outgoing,
            mut incoming,
        } = transport;
        let mut confirmed = false;

        if let Some(handshake) = self.handshake.clone() {
            if let Err(reason) = self.transmit(&outgoing, Outbound::Message(handshake)).await {
                return Exit::Dropped { reason, confirmed };
            }
        }
        if self.spec.confirm_on_open {
            if let Err(reason) = self.confirm(&outgoing).await {
                return Exit::Dropped { reason, confirmed };
            }
            confirmed = true;
        }
        let mut last_sent = Instant::now();

        loop {
            let keepalive_due = self.gate.is_confirmed() && !self.spec.keepalive.is_zero();
            let mut outbound = None;

            tokio::select! {
                command = self.commands.recv() => match command {
                    None | Some(ConnectionCommand::Close) => {
                        self.set_state(ConnectionState::Closing);
                        return Exit::Closed;
                    }
                    Some(ConnectionCommand::SetHandshake(message)) => self.handshake = Some(message),
                    Some(ConnectionCommand::Send(message)) => {
                        outbound = self.gate.submit(Outbound::Message(message));
                    }
                    Some(ConnectionCommand::SendAudio(data)) => {
                        outbound = self.gate.submit(Outbound::Audio(data));
                    }
                },
                frame = incoming.recv() => match frame {
                    Some(Ok(frame)) => {
                        if self.handle_frame(frame) && !self.gate.is_confirmed() {
                            if let Err(reason) = self.confirm(&outgoing).await {
                                return Exit::Dropped { reason, confirmed };
                            }
                            confirmed = true;
                            last_sent = Instant::now();
                        }
                    }
                    Some(Err(e)) => {
                        return Exit::Dropped { reason: format!("{e:#}"), confirmed };
                    }
                    None => {
                        return Exit::Dropped { reason: "stream closed by peer".to_string(), confirmed };
                    }
                },
                _ = sleep_until(last_sent + self.spec.keepalive), if keepalive_due => {
                    outbound = Some(Outbound::Message(ClientMessage::KeepAlive));
                }
            }

            if let Some(item) = outbound {
                if let Err(reason) = self.transmit(&outgoing, item).await {
                    return Exit::Dropped { reason, confirmed };
                }
                last_sent = Instant::now();
            }
        }
    }

    /// Decodes one inbound frame. Returns true if it confirmed the handshake.
    fn handle_frame(&self, frame: WireFrame) -> bool {
        if self.spec.debug {
            if let WireFrame::Text(text) = &frame {
                debug!(payload = %text, "Received.");
            }
        }
        match voice_protocol::decode(frame) {
            Ok(InboundEvent::Message(ServerMessage::SettingsApplied)) => {
                info!("Settings applied.");
                true
            }
            Ok(InboundEvent::Message(message)) => {
                self.emit(ConnectionEventKind::Message(message));
                false
            }
            Ok(InboundEvent::Audio(data)) => {
                self.emit(ConnectionEventKind::Audio(data));
                false
            }
            Err(e) => {
                warn!(error = %e, "Dropping undecodable message.");
                self.emit(ConnectionEventKind::Error(EngineError::protocol(self.channel, &e)));
                false
            }
        }
    }

    /// Releases held traffic in submission order, then reports confirmation.
    async fn confirm(&mut self, outgoing: &mpsc::Sender<WireFrame>) -> Result<(), String> {
        let held = self.gate.confirm();
        if !held.is_empty() {
            debug!(count = held.len(), "Flushing traffic held for confirmation.");
        }
        for item in held {
            self.transmit(outgoing, item).await?;
        }
        self.emit(ConnectionEventKind::Confirmed);
        Ok(())
    }

    async fn transmit(&self, outgoing: &mpsc::Sender<WireFrame>, item: Outbound) -> Result<(), String> {
        let frame = match item {
            Outbound::Message(message) => match voice_protocol::encode(&message) {
                Ok(frame) => frame,
                Err(e) => {
                    warn!(error = %e, "Failed to encode outbound message.");
                    self.emit(ConnectionEventKind::Error(EngineError::protocol(self.channel, &e)));
                    return Ok(());
                }
            },
            Outbound::Audio(data) => WireFrame::Binary(data),
        };
        if self.spec.debug {
            if let WireFrame::Text(text) = &frame {
                debug!(payload = %text, "Sending.");
            }
        }
        outgoing
            .send(frame)
            .await
            .map_err(|_| "stream closed while sending".to_string())
    }

    fn set_state(&mut self, state: ConnectionState) {
        if self.state == state {
            return;
        }
        debug!(from = ?self.state, to = ?state, "Connection state changed.");
        self.state = state;
        self.emit(ConnectionEventKind::State(state));
    }

    fn emit(&self, kind: ConnectionEventKind) {
        let _ = self.events.send(ConnectionEvent {
            channel: self.channel,
            generation: self.generation,
            kind,
        });
    }
}
