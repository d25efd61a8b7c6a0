#![allow(dead_code)]

use anyhow::{Result, bail};
use async_trait::async_trait;
use serde_json::{Value, json};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::{Semaphore, mpsc};
use voice_core::config::ConnectionTarget;
use voice_core::connection::ReconnectPolicy;
use voice_core::device::{AudioError, AudioInput, AudioOutput, CaptureSender};
use voice_core::{EngineConfig, SessionEvent};
use voice_protocol::WireFrame;
use voice_realtime::{AudioDevices, ConnectRequest, Connector, Session, SessionHandle, Transport};

pub const WAIT: Duration = Duration::from_secs(5);

/// The service side of one accepted connection.
pub struct ServerEnd {
    pub request: ConnectRequest,
    pub from_client: mpsc::Receiver<WireFrame>,
    pub to_client: mpsc::Sender<Result<WireFrame>>,
}

impl ServerEnd {
    pub async fn recv(&mut self) -> Option<WireFrame> {
        tokio::time::timeout(WAIT, self.from_client.recv())
            .await
            .expect("timed out waiting for a client frame")
    }

    /// The next JSON message from the client, skipping audio.
    pub async fn recv_json(&mut self) -> Value {
        loop {
            match self.recv().await {
                Some(WireFrame::Text(text)) => {
                    return serde_json::from_str(&text).expect("client sent invalid json");
                }
                Some(WireFrame::Binary(_)) => continue,
                None => panic!("client closed the stream"),
            }
        }
    }

    pub async fn recv_audio(&mut self) -> Vec<u8> {
        loop {
            match self.recv().await {
                Some(WireFrame::Binary(data)) => return data.to_vec(),
                Some(WireFrame::Text(_)) => continue,
                None => panic!("client closed the stream"),
            }
        }
    }

    pub async fn send_json(&self, value: Value) {
        self.to_client
            .send(Ok(WireFrame::Text(value.to_string())))
            .await
            .expect("client stopped reading");
    }

    pub async fn send_audio(&self, samples: usize) {
        self.to_client
            .send(Ok(WireFrame::Binary(vec![0u8; samples * 2].into())))
            .await
            .expect("client stopped reading");
    }

    pub async fn settings_applied(&self) {
        self.send_json(json!({ "type": "SettingsApplied" })).await;
    }

    /// Waits for the client to let go of the stream.
    pub async fn closed(&mut self) {
        loop {
            if self.recv().await.is_none() {
                return;
            }
        }
    }
}

/// Connector that hands every accepted connection to the test.
pub struct MockConnector {
    servers: mpsc::UnboundedSender<ServerEnd>,
    gate: Option<Arc<Semaphore>>,
    failing: AtomicBool,
    connects: AtomicUsize,
}

impl MockConnector {
    pub fn new(servers: mpsc::UnboundedSender<ServerEnd>) -> Self {
        Self {
            servers,
            gate: None,
            failing: AtomicBool::new(false),
            connects: AtomicUsize::new(0),
        }
    }

    /// Every connect blocks until [`release`](Self::release) is called once for it.
    pub fn gated(mut self) -> Self {
        self.gate = Some(Arc::new(Semaphore::new(0)));
        self
    }

    pub fn release(&self) {
        if let Some(gate) = &self.gate {
            gate.add_permits(1);
        }
    }

    pub fn set_failing(&self, failing: bool) {
        self.failing.store(failing, Ordering::SeqCst);
    }

    pub fn connects(&self) -> usize {
        self.connects.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl Connector for MockConnector {
    async fn connect(&self, request: &ConnectRequest) -> Result<Transport> {
        self.connects.fetch_add(1, Ordering::SeqCst);
        if let Some(gate) = &self.gate {
            gate.acquire().await?.forget();
        }
        if self.failing.load(Ordering::SeqCst) {
            bail!("connection refused");
        }

        let (out_tx, out_rx) = mpsc::channel(64);
        let (in_tx, in_rx) = mpsc::channel(64);
        let _ = self.servers.send(ServerEnd {
            request: request.clone(),
            from_client: out_rx,
            to_client: in_tx,
        });
        Ok(Transport {
            outgoing: out_tx,
            incoming: in_rx,
        })
    }
}

/// Shared state of a [`ManualOutput`].
#[derive(Clone, Default)]
pub struct OutputControl {
    pending: Arc<AtomicUsize>,
    stalled: Arc<AtomicBool>,
}

impl OutputControl {
    /// The device renders everything it was given.
    pub fn render_all(&self) {
        self.pending.store(0, Ordering::SeqCst);
    }

    /// While stalled the device reports itself full and accepts nothing more.
    pub fn set_stalled(&self, stalled: bool) {
        self.stalled.store(stalled, Ordering::SeqCst);
    }
}

/// Playback device that only renders when the test says so.
pub struct ManualOutput(pub OutputControl);

impl AudioOutput for ManualOutput {
    fn pending_samples(&self) -> usize {
        if self.0.stalled.load(Ordering::SeqCst) {
            return usize::MAX / 2;
        }
        self.0.pending.load(Ordering::SeqCst)
    }

    fn write(&mut self, samples: &[i16]) -> usize {
        self.0.pending.fetch_add(samples.len(), Ordering::SeqCst);
        samples.len()
    }

    fn clear(&mut self) {
        self.0.pending.store(0, Ordering::SeqCst);
    }
}

/// Microphone whose samples are pushed by the test.
#[derive(Clone, Default)]
pub struct Microphone {
    sender: Arc<Mutex<Option<CaptureSender>>>,
}

impl Microphone {
    pub fn speak(&self, samples: &[i16]) {
        let sender = self.sender.lock().unwrap();
        sender
            .as_ref()
            .expect("capture not started")
            .send(samples.to_vec())
            .unwrap();
    }
}

pub struct ManualInput(pub Microphone);

impl AudioInput for ManualInput {
    fn start(&mut self, samples: CaptureSender) -> Result<(), AudioError> {
        *self.0.sender.lock().unwrap() = Some(samples);
        Ok(())
    }

    fn stop(&mut self) {
        *self.0.sender.lock().unwrap() = None;
    }

    fn is_running(&self) -> bool {
        self.0.sender.lock().unwrap().is_some()
    }
}

pub fn test_config() -> EngineConfig {
    let mut config = EngineConfig::default().with_target(ConnectionTarget::direct("test-key"));
    config.idle.enabled = false;
    config.keepalive_interval = Duration::ZERO;
    config.reconnect = ReconnectPolicy {
        max_attempts: 3,
        base_delay: Duration::from_millis(10),
        max_delay: Duration::from_millis(40),
    };
    config
}

pub struct Harness {
    pub handle: SessionHandle,
    pub events: mpsc::UnboundedReceiver<SessionEvent>,
    pub servers: mpsc::UnboundedReceiver<ServerEnd>,
    pub connector: Arc<MockConnector>,
    pub output: OutputControl,
    pub microphone: Microphone,
    sync_counter: usize,
}

impl Harness {
    pub fn new(config: EngineConfig) -> Self {
        Self::build(config, |connector| connector)
    }

    pub fn build(config: EngineConfig, customize: impl FnOnce(MockConnector) -> MockConnector) -> Self {
        let (servers_tx, servers) = mpsc::unbounded_channel();
        let connector = Arc::new(customize(MockConnector::new(servers_tx)));
        let (events_tx, events) = mpsc::unbounded_channel();
        let output = OutputControl::default();
        let microphone = Microphone::default();
        let devices = AudioDevices {
            output: Box::new(ManualOutput(output.clone())),
            input: Box::new(ManualInput(microphone.clone())),
        };
        let handle = Session::spawn(config, connector.clone(), devices, Arc::new(events_tx));
        Self {
            handle,
            events,
            servers,
            connector,
            output,
            microphone,
            sync_counter: 0,
        }
    }

    pub async fn next_server(&mut self) -> ServerEnd {
        tokio::time::timeout(WAIT, self.servers.recv())
            .await
            .expect("timed out waiting for a connection")
            .expect("connector dropped")
    }

    /// Starts the agent channel and completes its handshake.
    pub async fn confirmed_agent(&mut self) -> ServerEnd {
        self.handle
            .start(voice_realtime::ServiceSelection::agent())
            .await
            .expect("start failed");
        let mut server = self.next_server().await;
        let handshake = server.recv_json().await;
        assert_eq!(handshake["type"], "Settings");
        server.settings_applied().await;
        self.wait_for(|e| matches!(e, SessionEvent::Ready { .. })).await;
        server
    }

    /// Next event satisfying `predicate`; earlier events are discarded.
    pub async fn wait_for(&mut self, predicate: impl Fn(&SessionEvent) -> bool) -> SessionEvent {
        let wait = async {
            loop {
                let event = self.events.recv().await.expect("session dropped its sink");
                if predicate(&event) {
                    return event;
                }
            }
        };
        tokio::time::timeout(WAIT, wait)
            .await
            .expect("timed out waiting for an event")
    }

    /// Collects events up to (not including) the next marker sent through `server`.
    ///
    /// The session handles one connection's traffic in order, so everything the
    /// server sent before the marker has been processed once it comes back.
    pub async fn sync(&mut self, server: &ServerEnd) -> Vec<SessionEvent> {
        self.sync_counter += 1;
        let code = format!("sync-{}", self.sync_counter);
        server
            .send_json(json!({ "type": "Warning", "description": "sync", "code": code }))
            .await;

        let mut seen = Vec::new();
        let wait = async {
            loop {
                let event = self.events.recv().await.expect("session dropped its sink");
                if let SessionEvent::Warning { code: Some(c), .. } = &event {
                    if *c == code {
                        return;
                    }
                }
                seen.push(event);
            }
        };
        tokio::time::timeout(WAIT, wait)
            .await
            .expect("timed out waiting for sync marker");
        seen
    }

    pub fn drain(&mut self) -> Vec<SessionEvent> {
        let mut events = Vec::new();
        while let Ok(event) = self.events.try_recv() {
            events.push(event);
        }
        events
    }
}
