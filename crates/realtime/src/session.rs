//! The session coordinator.
//!
//! A session is a single tokio task that owns every piece of engine state: the
//! state machine, the VAD reconciler, the idle timer, the audio pipeline, the
//! pending function calls and the connection handles. Hosts talk to it through
//! a cloneable [`SessionHandle`]; every operation is a message to the task, so
//! nothing is shared and nothing needs a lock. Events flow back out through the
//! host's [`EventSink`].

use crate::connection::{
    ConnectionCommand, ConnectionEvent, ConnectionEventKind, ConnectionHandle, ConnectionSpec,
    spawn_connection,
};
use crate::transport::{ConnectRequest, Connector};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, oneshot};
use tokio::time::{Instant as TokioInstant, MissedTickBehavior, sleep_until};
use tracing::{Instrument, debug, error, info, info_span, warn};
use uuid::Uuid;
use voice_core::config::ConnectionTarget;
use voice_core::connection::ConnectionState;
use voice_core::device::{AudioInput, AudioOutput, CaptureSender, NullInput, NullOutput};
use voice_core::function_call::{FunctionCallOutcome, FunctionCallRegistry, PendingFunctionCall};
use voice_core::idle::{IdleExpired, IdleTimer};
use voice_core::pipeline::{AudioPipeline, PlaybackSignal};
use voice_core::playback::{BlockReason, PushOutcome};
use voice_core::state::{AgentState, StateMachine, Trigger};
use voice_core::vad::{VadDecision, VadReconciler, VadSignal, VadSignalKind, VadSource};
use voice_core::wake::WakeWords;
use voice_core::{ConfigError, EngineConfig, EngineError, EventSink, SessionEvent};
use voice_protocol::client::AgentSettings;
use voice_protocol::server::TranscriptResult;
use voice_protocol::{ClientMessage, ServerMessage, ServiceKind};

/// Which upstream channels `start()` should open.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ServiceSelection {
    pub agent: bool,
    pub transcription: bool,
}

impl ServiceSelection {
    pub fn agent() -> Self {
        Self {
            agent: true,
            transcription: false,
        }
    }

    pub fn transcription() -> Self {
        Self {
            agent: false,
            transcription: true,
        }
    }

    pub fn both() -> Self {
        Self {
            agent: true,
            transcription: true,
        }
    }

    fn kinds(&self) -> Vec<ServiceKind> {
        let mut kinds = Vec::with_capacity(2);
        if self.agent {
            kinds.push(ServiceKind::Agent);
        }
        if self.transcription {
            kinds.push(ServiceKind::Transcription);
        }
        kinds
    }
}

impl Default for ServiceSelection {
    fn default() -> Self {
        Self::agent()
    }
}

/// Who authored an injected conversation turn.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    User,
    Agent,
}

/// What `update_instructions` did.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UpdateOutcome {
    /// Deep-equal to the applied configuration; nothing was sent.
    Unchanged,
    /// No agent connection is open; the new settings are used by the next handshake.
    Deferred,
    /// Only the prompt changed; one `UpdateInstructions` was sent.
    InstructionsUpdated,
    /// Other fields changed; the full settings were sent again.
    SettingsResent,
}

#[derive(Debug, Clone, PartialEq)]
pub struct ConnectionSnapshot {
    pub channel: ServiceKind,
    pub state: ConnectionState,
    pub confirmed: bool,
}

/// A point-in-time view of the session, for hosts and tests.
#[derive(Debug, Clone, PartialEq)]
pub struct SessionSnapshot {
    pub started: bool,
    pub agent_state: AgentState,
    pub connections: Vec<ConnectionSnapshot>,
    /// Connections told to close that have not finished yet.
    pub retiring_connections: usize,
    pub playback_buffered: usize,
    pub playback_blocked: bool,
    pub capturing: bool,
    pub idle_armed: bool,
    pub pending_teardown: bool,
    pub pending_function_calls: usize,
}

pub struct AudioDevices {
    pub output: Box<dyn AudioOutput>,
    pub input: Box<dyn AudioInput>,
}

impl AudioDevices {
    /// No sound at all: a text-only session.
    pub fn null() -> Self {
        Self {
            output: Box::new(NullOutput),
            input: Box::new(NullInput::default()),
        }
    }
}

type Reply<T> = oneshot::Sender<Result<T, EngineError>>;

enum Command {
    Start(ServiceSelection, Reply<()>),
    Stop(Reply<()>),
    Interrupt(Reply<usize>),
    Allow(Reply<()>),
    Inject {
        role: Role,
        text: String,
        reply: Reply<()>,
    },
    Sleep(Reply<AgentState>),
    Wake(Reply<AgentState>),
    ToggleSleep(Reply<AgentState>),
    UpdateInstructions(Box<AgentSettings>, Reply<UpdateOutcome>),
    RespondToFunctionCall {
        id: String,
        outcome: FunctionCallOutcome,
        reply: Reply<()>,
    },
    StartCapture(Reply<()>),
    StopCapture(Reply<()>),
    Detach(Reply<()>),
    Attach(Reply<()>),
    RecordActivity(Reply<()>),
    Snapshot(Reply<SessionSnapshot>),
}

/// The host's handle on a running session. Cheap to clone; the session task
/// shuts down when the last handle is dropped.
#[derive(Clone)]
pub struct SessionHandle {
    session_id: Uuid,
    commands: mpsc::UnboundedSender<Command>,
}

impl SessionHandle {
    pub fn session_id(&self) -> Uuid {
        self.session_id
    }

    async fn request<T>(&self, command: impl FnOnce(Reply<T>) -> Command) -> Result<T, EngineError> {
        let (tx, rx) = oneshot::channel();
        self.commands
            .send(command(tx))
            .map_err(|_| EngineError::Shutdown)?;
        rx.await.map_err(|_| EngineError::Shutdown)?
    }

    /// Opens the selected channels. Calling it again only opens what is missing.
    pub async fn start(&self, selection: ServiceSelection) -> Result<(), EngineError> {
        self.request(|reply| Command::Start(selection, reply)).await
    }

    /// Closes every connection, cancels timers and discards all buffered audio.
    pub async fn stop(&self) -> Result<(), EngineError> {
        self.request(Command::Stop).await
    }

    /// Stops playback and discards incoming audio until [`allow`](Self::allow).
    /// Returns the number of buffered frames discarded.
    pub async fn interrupt(&self) -> Result<usize, EngineError> {
        self.request(Command::Interrupt).await
    }

    pub async fn allow(&self) -> Result<(), EngineError> {
        self.request(Command::Allow).await
    }

    /// Sends a conversation turn on the agent channel, opening it if needed.
    /// Resolves once the agent connection has confirmed its settings.
    pub async fn inject_message(&self, role: Role, text: impl Into<String>) -> Result<(), EngineError> {
        let text = text.into();
        self.request(|reply| Command::Inject { role, text, reply })
            .await
    }

    pub async fn sleep(&self) -> Result<AgentState, EngineError> {
        self.request(Command::Sleep).await
    }

    pub async fn wake(&self) -> Result<AgentState, EngineError> {
        self.request(Command::Wake).await
    }

    pub async fn toggle_sleep(&self) -> Result<AgentState, EngineError> {
        self.request(Command::ToggleSleep).await
    }

    pub async fn update_instructions(&self, settings: AgentSettings) -> Result<UpdateOutcome, EngineError> {
        self.request(|reply| Command::UpdateInstructions(Box::new(settings), reply))
            .await
    }

    pub async fn respond_to_function_call(
        &self,
        id: impl Into<String>,
        outcome: FunctionCallOutcome,
    ) -> Result<(), EngineError> {
        let id = id.into();
        self.request(|reply| Command::RespondToFunctionCall { id, outcome, reply })
            .await
    }

    pub async fn start_capture(&self) -> Result<(), EngineError> {
        self.request(Command::StartCapture).await
    }

    pub async fn stop_capture(&self) -> Result<(), EngineError> {
        self.request(Command::StopCapture).await
    }

    /// The host is tearing down. Connections survive if [`attach`](Self::attach)
    /// follows within the re-entry grace window.
    pub async fn detach(&self) -> Result<(), EngineError> {
        self.request(Command::Detach).await
    }

    pub async fn attach(&self) -> Result<(), EngineError> {
        self.request(Command::Attach).await
    }

    /// Explicit host interaction; resets the idle timer.
    pub async fn record_activity(&self) -> Result<(), EngineError> {
        self.request(Command::RecordActivity).await
    }

    pub async fn snapshot(&self) -> Result<SessionSnapshot, EngineError> {
        self.request(Command::Snapshot).await
    }
}

struct Slot {
    handle: ConnectionHandle,
    state: ConnectionState,
    confirmed: bool,
}

struct PendingInject {
    message: ClientMessage,
    reply: Reply<()>,
    attempts: u32,
}

pub struct Session {
    id: Uuid,
    config: EngineConfig,
    /// The agent settings last sent (or to be sent) in a handshake.
    applied: AgentSettings,
    connector: Arc<dyn Connector>,
    sink: Arc<dyn EventSink>,
    machine: StateMachine,
    vad: VadReconciler,
    idle: IdleTimer,
    wake_words: WakeWords,
    pipeline: AudioPipeline,
    calls: FunctionCallRegistry,
    slots: HashMap<ServiceKind, Slot>,
    retiring: HashMap<u64, ConnectionHandle>,
    next_generation: u64,
    connection_events: mpsc::UnboundedSender<ConnectionEvent>,
    capture: CaptureSender,
    pending_injects: Vec<PendingInject>,
    teardown_at: Option<std::time::Instant>,
    started: bool,
}

fn now() -> std::time::Instant {
    TokioInstant::now().into_std()
}

impl Session {
    /// Spawns the session task and returns its handle. Nothing connects until `start()`.
    pub fn spawn(
        config: EngineConfig,
        connector: Arc<dyn Connector>,
        devices: AudioDevices,
        sink: Arc<dyn EventSink>,
    ) -> SessionHandle {
        let (commands_tx, commands_rx) = mpsc::unbounded_channel();
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let (capture_tx, capture_rx) = mpsc::unbounded_channel();
        let id = Uuid::new_v4();

        let session = Session {
            id,
            applied: config.agent.clone(),
            machine: StateMachine::new(),
            vad: VadReconciler::new(config.utterance_end_fallback, config.vad_conflict_window),
            idle: IdleTimer::new(config.idle.timeout, config.idle.enabled),
            wake_words: WakeWords::new(&config.idle.wake_words),
            pipeline: AudioPipeline::new(&config.audio, devices.output, devices.input),
            calls: FunctionCallRegistry::new(),
            slots: HashMap::new(),
            retiring: HashMap::new(),
            next_generation: 0,
            connection_events: events_tx,
            capture: capture_tx,
            pending_injects: Vec::new(),
            teardown_at: None,
            started: false,
            connector,
            sink,
            config,
        };

        let span = info_span!("voice_session", session_id = %id);
        tokio::spawn(session.run(commands_rx, events_rx, capture_rx).instrument(span));

        SessionHandle {
            session_id: id,
            commands: commands_tx,
        }
    }

    async fn run(
        mut self,
        mut commands: mpsc::UnboundedReceiver<Command>,
        mut connection_events: mpsc::UnboundedReceiver<ConnectionEvent>,
        mut capture: mpsc::UnboundedReceiver<Vec<i16>>,
    ) {
        info!("Session started.");
        let mut playback_tick = tokio::time::interval(self.config.audio.frame_duration);
        playback_tick.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            let deadline = self.next_deadline();
            let pumping = self.pipeline.needs_pump();

            tokio::select! {
                command = commands.recv() => match command {
                    Some(command) => self.handle_command(command),
                    None => break,
                },
                Some(event) = connection_events.recv() => self.handle_connection_event(event),
                Some(samples) = capture.recv() => self.handle_capture(samples),
                _ = sleep_until(deadline.unwrap_or_else(far_future)), if deadline.is_some() => {
                    self.handle_deadline();
                }
                _ = playback_tick.tick(), if pumping => self.pump_playback(now()),
            }
        }

        info!(session_id = %self.id, "All handles dropped, shutting down.");
        self.stop_session();
    }

    fn next_deadline(&self) -> Option<TokioInstant> {
        [self.idle.deadline(), self.vad.next_deadline(), self.teardown_at]
            .into_iter()
            .flatten()
            .min()
            .map(TokioInstant::from_std)
    }

    fn handle_command(&mut self, command: Command) {
        let now = now();
        match command {
            Command::Start(selection, reply) => {
                let _ = reply.send(self.start(selection, now));
            }
            Command::Stop(reply) => {
                self.stop_session();
                let _ = reply.send(Ok(()));
            }
            Command::Interrupt(reply) => {
                self.touch(now);
                let discarded = self.pipeline.interrupt(BlockReason::Host);
                self.pump_playback(now);
                let _ = reply.send(Ok(discarded));
            }
            Command::Allow(reply) => {
                self.touch(now);
                self.pipeline.allow();
                info!("Playback allowed.");
                let _ = reply.send(Ok(()));
            }
            Command::Inject { role, text, reply } => self.inject(role, text, reply, now),
            Command::Sleep(reply) => {
                self.request_sleep(now);
                let _ = reply.send(Ok(self.machine.state()));
            }
            Command::Wake(reply) => {
                self.apply(Trigger::Wake, now);
                let _ = reply.send(Ok(self.machine.state()));
            }
            Command::ToggleSleep(reply) => {
                if self.machine.state().is_asleep() {
                    self.apply(Trigger::Wake, now);
                } else {
                    self.request_sleep(now);
                }
                let _ = reply.send(Ok(self.machine.state()));
            }
            Command::UpdateInstructions(settings, reply) => {
                let _ = reply.send(self.update_instructions(*settings));
            }
            Command::RespondToFunctionCall { id, outcome, reply } => {
                let _ = reply.send(self.respond_to_function_call(id, outcome));
            }
            Command::StartCapture(reply) => {
                let result = self
                    .pipeline
                    .start_capture(self.capture.clone())
                    .map_err(EngineError::from);
                if let Err(e) = &result {
                    self.report(e);
                }
                let _ = reply.send(result);
            }
            Command::StopCapture(reply) => {
                self.pipeline.stop_capture();
                let _ = reply.send(Ok(()));
            }
            Command::Detach(reply) => {
                if self.started || !self.slots.is_empty() {
                    info!(grace = ?self.config.reentry_grace, "Host detached, teardown scheduled.");
                    self.teardown_at = Some(now + self.config.reentry_grace);
                }
                let _ = reply.send(Ok(()));
            }
            Command::Attach(reply) => {
                if self.teardown_at.take().is_some() {
                    info!("Host re-attached within the grace window, keeping connections.");
                }
                let _ = reply.send(Ok(()));
            }
            Command::RecordActivity(reply) => {
                self.touch(now);
                let _ = reply.send(Ok(()));
            }
            Command::Snapshot(reply) => {
                let _ = reply.send(Ok(self.snapshot()));
            }
        }
    }

    fn start(&mut self, selection: ServiceSelection, now: std::time::Instant) -> Result<(), EngineError> {
        let target = self.target()?;
        self.teardown_at = None;
        for kind in selection.kinds() {
            self.ensure_connection(kind, &target);
        }
        self.mark_started(now);
        Ok(())
    }

    fn mark_started(&mut self, now: std::time::Instant) {
        if !self.started {
            self.started = true;
            self.idle.arm(now);
            self.sync_idle(now);
        }
    }

    /// Validates the configuration and returns the connection target.
    fn target(&self) -> Result<ConnectionTarget, EngineError> {
        match self.config.validate() {
            Ok(target) => Ok(target.clone()),
            Err(e) => {
                let err = EngineError::Configuration(e);
                self.report(&err);
                Err(err)
            }
        }
    }

    fn ensure_connection(&mut self, kind: ServiceKind, target: &ConnectionTarget) {
        if self.slots.contains_key(&kind) {
            return;
        }
        let spec = self.connection_spec(kind, target);
        self.next_generation += 1;
        let generation = self.next_generation;
        info!(channel = %kind, generation, "Opening connection.");
        let handle = spawn_connection(
            spec,
            self.connector.clone(),
            self.connection_events.clone(),
            generation,
        );
        self.slots.insert(
            kind,
            Slot {
                handle,
                state: ConnectionState::Closed,
                confirmed: false,
            },
        );
    }

    fn connection_spec(&self, kind: ServiceKind, target: &ConnectionTarget) -> ConnectionSpec {
        let (url, handshake, confirm_on_open) = match kind {
            ServiceKind::Agent => (
                target.agent_url(),
                Some(ClientMessage::Settings(self.applied.clone())),
                false,
            ),
            ServiceKind::Transcription => (
                format!(
                    "{}?{}",
                    target.listen_url(),
                    self.config
                        .transcription
                        .query(self.config.audio.input_sample_rate)
                ),
                None,
                true,
            ),
        };
        ConnectionSpec {
            request: ConnectRequest {
                channel: kind,
                url,
                authorization: target.authorization(),
            },
            handshake,
            confirm_on_open,
            keepalive: self.config.keepalive_interval,
            reconnect: self.config.reconnect.clone(),
            audio_limit: self.config.audio.unconfirmed_audio_frames,
            debug: self.config.debug,
        }
    }

    fn stop_session(&mut self) {
        let now = now();
        let was_active = self.started || !self.slots.is_empty();
        self.teardown_at = None;

        for (_, slot) in self.slots.drain() {
            slot.handle.close();
            self.retiring.insert(slot.handle.generation, slot.handle);
        }
        let abandoned = self.calls.abandon_all();
        if abandoned > 0 {
            info!(abandoned, "Abandoned pending function calls.");
        }
        for inject in self.pending_injects.drain(..) {
            let _ = inject.reply.send(Err(EngineError::Transport {
                channel: ServiceKind::Agent,
                message: "session stopped before the message was sent".to_string(),
            }));
        }

        let was_playing = self.pipeline.is_playing();
        self.pipeline.flush();
        if was_playing {
            self.emit(SessionEvent::PlaybackStateChanged { playing: false });
        }

        let from = self.machine.state();
        self.machine = StateMachine::new();
        if from != self.machine.state() {
            self.emit(SessionEvent::AgentStateChanged {
                from,
                to: self.machine.state(),
            });
        }
        self.vad.reset();
        self.started = false;
        self.sync_idle(now);

        if was_active {
            info!("Session stopped.");
        }
    }

    fn inject(&mut self, role: Role, text: String, reply: Reply<()>, now: std::time::Instant) {
        let target = match self.target() {
            Ok(target) => target,
            Err(e) => {
                let _ = reply.send(Err(e));
                return;
            }
        };
        self.teardown_at = None;
        self.ensure_connection(ServiceKind::Agent, &target);
        self.mark_started(now);
        self.touch(now);

        let message = match role {
            Role::User => ClientMessage::InjectUserMessage { content: text },
            Role::Agent => ClientMessage::InjectAgentMessage { message: text },
        };
        self.submit_inject(PendingInject {
            message,
            reply,
            attempts: 0,
        });
    }

    fn submit_inject(&mut self, inject: PendingInject) {
        let Some(slot) = self.slots.get(&ServiceKind::Agent) else {
            self.pending_injects.push(inject);
            return;
        };
        let queued = slot
            .handle
            .send(ConnectionCommand::Send(inject.message.clone()));
        if queued && slot.confirmed {
            let _ = inject.reply.send(Ok(()));
        } else {
            // Resolved on confirmation, or retried if the connection terminates first.
            self.pending_injects.push(inject);
        }
    }

    fn retry_injects(&mut self) {
        if self.pending_injects.is_empty() {
            return;
        }
        let limit = self.config.inject_retry_limit;
        let mut retry = Vec::new();
        for mut inject in std::mem::take(&mut self.pending_injects) {
            inject.attempts += 1;
            if inject.attempts > limit {
                let _ = inject.reply.send(Err(EngineError::Transport {
                    channel: ServiceKind::Agent,
                    message: format!("agent connection not re-established after {limit} attempts"),
                }));
            } else {
                retry.push(inject);
            }
        }
        if retry.is_empty() {
            return;
        }

        let target = match self.config.validate() {
            Ok(target) => target.clone(),
            Err(e) => {
                for inject in retry {
                    let _ = inject.reply.send(Err(EngineError::Configuration(e.clone())));
                }
                return;
            }
        };
        warn!(pending = retry.len(), "Agent connection gone with messages in flight, re-creating it.");
        self.ensure_connection(ServiceKind::Agent, &target);
        for inject in retry {
            self.submit_inject(inject);
        }
    }

    fn update_instructions(&mut self, settings: AgentSettings) -> Result<UpdateOutcome, EngineError> {
        if settings.same_ignoring_context(&self.applied) {
            debug!("Agent settings unchanged, nothing to send.");
            if settings.agent.context != self.applied.agent.context {
                // Not worth a round trip, but a re-created connection must replay it.
                self.applied.agent.context = settings.agent.context;
                if let Some(slot) = self.slots.get(&ServiceKind::Agent) {
                    slot.handle.send(ConnectionCommand::SetHandshake(ClientMessage::Settings(
                        self.applied.clone(),
                    )));
                }
            }
            return Ok(UpdateOutcome::Unchanged);
        }
        if settings.audio != self.applied.audio {
            let err = EngineError::Configuration(ConfigError::Contradictory(
                "audio formats cannot change during a session".to_string(),
            ));
            self.report(&err);
            return Err(err);
        }

        let mut probe = settings.clone();
        probe.agent.think.prompt = self.applied.agent.think.prompt.clone();
        let prompt_only = probe.same_ignoring_context(&self.applied);
        self.applied = settings;

        let Some(slot) = self.slots.get(&ServiceKind::Agent) else {
            return Ok(UpdateOutcome::Deferred);
        };
        slot.handle.send(ConnectionCommand::SetHandshake(ClientMessage::Settings(
            self.applied.clone(),
        )));
        if prompt_only {
            info!("Updating agent instructions.");
            slot.handle.send(ConnectionCommand::Send(ClientMessage::UpdateInstructions {
                instructions: self.applied.instructions().to_string(),
            }));
            Ok(UpdateOutcome::InstructionsUpdated)
        } else {
            info!("Re-sending agent settings.");
            slot.handle
                .send(ConnectionCommand::Send(ClientMessage::Settings(self.applied.clone())));
            Ok(UpdateOutcome::SettingsResent)
        }
    }

    fn respond_to_function_call(
        &mut self,
        id: String,
        outcome: FunctionCallOutcome,
    ) -> Result<(), EngineError> {
        let (call, response) = match self.calls.resolve(&id, outcome.clone()) {
            Ok(resolved) => resolved,
            Err(e) => {
                let err = EngineError::FunctionCall {
                    id,
                    message: e.to_string(),
                };
                self.report(&err);
                return Err(err);
            }
        };

        let sent = self
            .slots
            .get(&ServiceKind::Agent)
            .is_some_and(|slot| slot.handle.send(ConnectionCommand::Send(response)));
        if !sent {
            let err = EngineError::Transport {
                channel: ServiceKind::Agent,
                message: format!("no agent connection to answer function call `{}`", call.id),
            };
            self.report(&err);
            return Err(err);
        }
        if let FunctionCallOutcome::Failure(reason) = outcome {
            self.report(&EngineError::FunctionCall {
                id: call.id,
                message: reason,
            });
        }
        Ok(())
    }

    fn request_sleep(&mut self, now: std::time::Instant) {
        let audio_outstanding = self.pipeline.utterance_pending();
        self.apply(Trigger::SleepRequested { audio_outstanding }, now);
    }

    fn handle_connection_event(&mut self, event: ConnectionEvent) {
        let now = now();
        let channel = event.channel;
        let live = self
            .slots
            .get(&channel)
            .is_some_and(|slot| slot.handle.generation == event.generation);

        if !live {
            match event.kind {
                ConnectionEventKind::State(state) => {
                    self.emit(SessionEvent::ConnectionStateChanged { channel, state });
                }
                ConnectionEventKind::Terminated => {
                    self.retiring.remove(&event.generation);
                }
                other => debug!(%channel, generation = event.generation, event = ?other, "Ignoring event from a retired connection."),
            }
            return;
        }

        match event.kind {
            ConnectionEventKind::State(state) => {
                if let Some(slot) = self.slots.get_mut(&channel) {
                    slot.state = state;
                    if state != ConnectionState::Open {
                        slot.confirmed = false;
                    }
                }
                self.emit(SessionEvent::ConnectionStateChanged { channel, state });
                if channel == ServiceKind::Agent && state == ConnectionState::Closed {
                    let abandoned = self.calls.abandon_all();
                    if abandoned > 0 {
                        info!(abandoned, "Agent connection closed, abandoning pending function calls.");
                    }
                }
            }
            ConnectionEventKind::Confirmed => {
                if let Some(slot) = self.slots.get_mut(&channel) {
                    slot.confirmed = true;
                }
                info!(%channel, "Connection ready.");
                self.emit(SessionEvent::Ready { channel });
                if channel == ServiceKind::Agent {
                    for inject in self.pending_injects.drain(..) {
                        let _ = inject.reply.send(Ok(()));
                    }
                }
            }
            ConnectionEventKind::Message(message) => self.handle_server_message(channel, message, now),
            ConnectionEventKind::Audio(data) => {
                if channel != ServiceKind::Agent {
                    debug!(%channel, bytes = data.len(), "Ignoring audio on a non-agent channel.");
                    return;
                }
                if self.pipeline.receive(&data) == PushOutcome::Discarded {
                    debug!(bytes = data.len(), "Playback blocked, discarding synthesized audio.");
                }
                self.pump_playback(now);
            }
            ConnectionEventKind::Error(err) => self.report(&err),
            ConnectionEventKind::Terminated => {
                self.slots.remove(&channel);
                if channel == ServiceKind::Agent {
                    self.calls.abandon_all();
                    self.retry_injects();
                }
            }
        }
    }

    fn handle_server_message(&mut self, channel: ServiceKind, message: ServerMessage, now: std::time::Instant) {
        let source = match channel {
            ServiceKind::Agent => VadSource::AgentChannel,
            ServiceKind::Transcription => VadSource::TranscriptionChannel,
        };
        debug!(%channel, kind = message.kind(), "Inbound message.");

        match message {
            ServerMessage::SettingsApplied => {}
            ServerMessage::Welcome { request_id } => info!(%channel, ?request_id, "Welcome received."),
            ServerMessage::Metadata { request_id } => debug!(%channel, ?request_id, "Metadata received."),
            ServerMessage::ConversationText { role, content } => {
                if role == "user" {
                    self.touch(now);
                    self.check_wake_phrase(&content, now);
                    self.emit(SessionEvent::UserMessage { text: content });
                } else {
                    self.emit(SessionEvent::AgentUtterance { text: content });
                }
            }
            ServerMessage::UserStartedSpeaking | ServerMessage::SpeechStarted { .. } => {
                self.observe_vad(source, VadSignalKind::SpeechStarted, now);
            }
            ServerMessage::UserStoppedSpeaking => {
                self.observe_vad(source, VadSignalKind::SpeechEnded, now);
            }
            ServerMessage::UtteranceEnd {
                channel: audio_channel,
                last_word_end,
            } => {
                self.emit(SessionEvent::UtteranceEnd {
                    channel: audio_channel,
                    last_word_end,
                });
                self.observe_vad(source, VadSignalKind::UtteranceEnd, now);
            }
            ServerMessage::AgentThinking { .. } => {
                self.settle_user_turn(now);
                self.apply(Trigger::AgentThinking, now);
            }
            ServerMessage::AgentStartedSpeaking { total_latency, .. } => {
                self.settle_user_turn(now);
                let utterance = self.pipeline.begin_utterance();
                info!(utterance, ?total_latency, "Agent started speaking.");
                self.apply(Trigger::AgentSpeechStarted { utterance }, now);
            }
            ServerMessage::AgentAudioDone => {
                self.pipeline.mark_synthesis_complete();
                self.pump_playback(now);
            }
            ServerMessage::FunctionCallRequest { id, name, arguments } => {
                let call = PendingFunctionCall { id, name, arguments };
                match self.calls.register(call.clone()) {
                    Ok(()) => {
                        info!(id = %call.id, name = %call.name, "Function call requested.");
                        self.emit(SessionEvent::FunctionCallRequest(call));
                    }
                    Err(e) => self.report(&EngineError::FunctionCall {
                        id: call.id,
                        message: e.to_string(),
                    }),
                }
            }
            ServerMessage::Error { description, code } => self.report(&EngineError::Protocol {
                channel,
                message: description,
                code,
            }),
            ServerMessage::Warning { description, code } => {
                warn!(%channel, ?code, "{}", description);
                self.emit(SessionEvent::Warning {
                    channel,
                    message: description,
                    code,
                });
            }
            ServerMessage::Results(result) => self.handle_transcript(source, result, now),
        }
    }

    fn handle_transcript(&mut self, source: VadSource, result: TranscriptResult, now: std::time::Instant) {
        let text = result.transcript().trim().to_string();
        if !text.is_empty() {
            self.touch(now);
            if result.is_final {
                self.check_wake_phrase(&text, now);
            }
            self.emit(SessionEvent::Transcript {
                text,
                is_final: result.is_final,
                speech_final: result.speech_final,
            });
        }
        if result.speech_final {
            self.observe_vad(source, VadSignalKind::SpeechEnded, now);
        }
    }

    fn check_wake_phrase(&mut self, text: &str, now: std::time::Instant) {
        if !self.machine.state().is_asleep() {
            return;
        }
        if let Some(phrase) = self.wake_words.find(text) {
            info!(phrase, "Wake phrase heard.");
            self.apply(Trigger::Wake, now);
        }
    }

    fn observe_vad(&mut self, source: VadSource, kind: VadSignalKind, now: std::time::Instant) {
        for decision in self.vad.observe(VadSignal::new(source, kind, now)) {
            self.handle_vad_decision(decision, now);
        }
        self.sync_idle(now);
    }

    /// The agent is replying, so a speech-end still inside its fallback window is final.
    fn settle_user_turn(&mut self, now: std::time::Instant) {
        if let Some(decision) = self.vad.settle() {
            self.handle_vad_decision(decision, now);
        }
    }

    fn handle_vad_decision(&mut self, decision: VadDecision, now: std::time::Instant) {
        match decision {
            VadDecision::UserStartedSpeaking { utterance, source } => {
                debug!(utterance, ?source, "User started speaking.");
                self.emit(SessionEvent::UserStartedSpeaking { source });
                self.touch(now);

                let state = self.machine.state();
                if !state.is_asleep() && (state == AgentState::Speaking || self.pipeline.is_playing()) {
                    info!("User barged in, interrupting playback.");
                    self.pipeline.interrupt(BlockReason::BargeIn);
                    self.pump_playback(now);
                }
                self.apply(Trigger::UserSpeechStarted, now);
            }
            VadDecision::UserStoppedSpeaking {
                utterance,
                source,
                resolution,
            } => {
                debug!(utterance, ?source, ?resolution, "User stopped speaking.");
                self.emit(SessionEvent::UserStoppedSpeaking { source, resolution });
                self.touch(now);
            }
            VadDecision::Conflict { earlier, later } => {
                warn!(
                    earlier = ?(earlier.source, earlier.kind),
                    later = ?(later.source, later.kind),
                    "Contradictory voice-activity signals."
                );
                self.emit(SessionEvent::VoiceActivityConflict {
                    earlier: (earlier.source, earlier.kind),
                    later: (later.source, later.kind),
                });
            }
        }
        self.sync_idle(now);
    }

    fn handle_capture(&mut self, samples: Vec<i16>) {
        if !self.pipeline.is_capturing() {
            return;
        }
        let agent_muted = self.machine.state().is_asleep();
        for frame in self.pipeline.frame_capture(&samples) {
            for (kind, slot) in &self.slots {
                if *kind == ServiceKind::Agent && agent_muted {
                    continue;
                }
                slot.handle
                    .send(ConnectionCommand::SendAudio(frame.pcm.clone()));
            }
        }
    }

    fn handle_deadline(&mut self) {
        let now = now();
        if self.teardown_at.is_some_and(|at| at <= now) {
            info!("Re-entry grace window elapsed, tearing down.");
            self.stop_session();
            return;
        }
        if let Some(decision) = self.vad.poll(now) {
            self.handle_vad_decision(decision, now);
        }
        if let Some(expired) = self.idle.poll(now) {
            self.handle_idle_expired(expired, now);
        }
    }

    fn handle_idle_expired(&mut self, expired: IdleExpired, now: std::time::Instant) {
        info!(timeout = ?expired.timeout, "Idle timeout.");
        self.emit(SessionEvent::IdleTimeout);
        if self.config.idle.auto_sleep {
            self.request_sleep(now);
        } else {
            self.report(&EngineError::Timeout(expired.timeout));
            self.stop_session();
        }
    }

    fn pump_playback(&mut self, now: std::time::Instant) {
        for signal in self.pipeline.pump() {
            match signal {
                PlaybackSignal::Started => {
                    self.emit(SessionEvent::PlaybackStateChanged { playing: true });
                }
                PlaybackSignal::Drained => {
                    self.emit(SessionEvent::PlaybackStateChanged { playing: false });
                }
                PlaybackSignal::Completed(utterance) => {
                    self.apply(Trigger::PlaybackCompleted { utterance }, now);
                }
            }
        }
        if self.machine.state() == AgentState::EnteringSleep && !self.pipeline.utterance_pending() {
            self.apply(Trigger::AudioDrained, now);
        }
    }

    /// Feeds the state machine and publishes whatever transitions it made.
    fn apply(&mut self, trigger: Trigger, now: std::time::Instant) {
        for transition in self.machine.apply(trigger) {
            info!(from = %transition.from, to = %transition.to, "Agent state changed.");
            self.emit(SessionEvent::AgentStateChanged {
                from: transition.from,
                to: transition.to,
            });
        }
        self.sync_idle(now);
    }

    /// Qualifying activity. Only counts while the session is running.
    fn touch(&mut self, now: std::time::Instant) {
        if self.started {
            self.idle.record_activity(now);
        }
    }

    fn sync_idle(&mut self, now: std::time::Instant) {
        let state = self.machine.state();
        let suppressed = state.suppresses_idle_reset() || state.is_asleep() || self.vad.user_speaking();
        self.idle.set_suppressed(suppressed, now);
        if !self.started {
            self.idle.disarm();
        }
    }

    fn snapshot(&self) -> SessionSnapshot {
        let mut connections: Vec<ConnectionSnapshot> = self
            .slots
            .iter()
            .map(|(channel, slot)| ConnectionSnapshot {
                channel: *channel,
                state: slot.state,
                confirmed: slot.confirmed,
            })
            .collect();
        connections.sort_by_key(|c| c.channel.as_str());

        SessionSnapshot {
            started: self.started,
            agent_state: self.machine.state(),
            connections,
            retiring_connections: self.retiring.len(),
            playback_buffered: self.pipeline.buffered_frames(),
            playback_blocked: self.pipeline.is_blocked(),
            capturing: self.pipeline.is_capturing(),
            idle_armed: self.idle.is_armed(),
            pending_teardown: self.teardown_at.is_some(),
            pending_function_calls: self.calls.len(),
        }
    }

    fn report(&self, err: &EngineError) {
        match err {
            EngineError::Configuration(_) | EngineError::FunctionCall { .. } => warn!(error = %err, "Session error."),
            _ => error!(error = %err, "Session error."),
        }
        self.emit(SessionEvent::Error(err.to_event()));
    }

    fn emit(&self, event: SessionEvent) {
        self.sink.emit(event);
    }
}

fn far_future() -> TokioInstant {
    TokioInstant::now() + Duration::from_secs(86_400)
}
