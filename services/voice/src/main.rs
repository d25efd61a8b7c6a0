//! `voice-agent`: a terminal host for a voice session.
//!
//! Loads configuration from the environment, starts a session against the
//! configured target and prints every session event as a JSON line. Lines typed
//! on stdin are injected as user messages; a few slash commands drive the
//! session directly.

use anyhow::Context;
use clap::{Parser, ValueEnum};
use std::sync::Arc;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::sync::mpsc;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;
use voice_core::EngineConfig;
use voice_core::SessionEvent;
use voice_core::function_call::FunctionCallOutcome;
use voice_realtime::{AudioDevices, Role, ServiceSelection, Session, SessionHandle, WsConnector};

#[derive(Parser, Debug)]
#[command(name = "voice-agent", about = "Talk to a realtime voice agent", version)]
struct Cli {
    /// Which upstream channels to open.
    #[arg(long, value_enum, default_value_t = Channels::Agent)]
    channels: Channels,

    /// Start capturing from the default microphone right away.
    #[arg(long)]
    mic: bool,

    /// Log filter used when `RUST_LOG` is not set.
    #[arg(long, default_value = "info")]
    log: String,
}

#[derive(ValueEnum, Clone, Copy, Debug)]
enum Channels {
    Agent,
    Transcription,
    Both,
}

impl From<Channels> for ServiceSelection {
    fn from(channels: Channels) -> Self {
        match channels {
            Channels::Agent => ServiceSelection::agent(),
            Channels::Transcription => ServiceSelection::transcription(),
            Channels::Both => ServiceSelection::both(),
        }
    }
}

#[cfg(feature = "native-audio")]
fn audio_devices(config: &EngineConfig) -> AudioDevices {
    use voice_realtime::native_audio::{NativeInput, NativeOutput};

    match NativeOutput::open(config.audio.output_sample_rate) {
        Ok(output) => AudioDevices {
            output: Box::new(output),
            input: Box::new(NativeInput::new(config.audio.input_sample_rate)),
        },
        Err(e) => {
            warn!(error = %e, "No usable output device, running without audio.");
            AudioDevices::null()
        }
    }
}

#[cfg(not(feature = "native-audio"))]
fn audio_devices(_config: &EngineConfig) -> AudioDevices {
    AudioDevices::null()
}

/// Prints events and declines function calls, which this host cannot run.
async fn print_events(mut events: mpsc::UnboundedReceiver<SessionEvent>, session: SessionHandle) {
    while let Some(event) = events.recv().await {
        match serde_json::to_string(&event) {
            Ok(line) => println!("{line}"),
            Err(e) => warn!(error = %e, "Failed to serialize event."),
        }
        if let SessionEvent::FunctionCallRequest(call) = event {
            let outcome = FunctionCallOutcome::Failure(format!("`{}` is not available here", call.name));
            if let Err(e) = session.respond_to_function_call(call.id, outcome).await {
                warn!(error = %e, "Failed to answer function call.");
            }
        }
    }
}

/// Handles one line from stdin. Returns false when the user asked to quit.
async fn handle_line(session: &SessionHandle, line: &str) -> anyhow::Result<bool> {
    match line.trim() {
        "" => {}
        "/quit" | "/exit" => return Ok(false),
        "/sleep" => info!(state = %session.sleep().await?, "Sleep requested."),
        "/wake" => info!(state = %session.wake().await?, "Wake requested."),
        "/toggle" => info!(state = %session.toggle_sleep().await?, "Sleep toggled."),
        "/interrupt" => info!(discarded = session.interrupt().await?, "Playback interrupted."),
        "/allow" => session.allow().await?,
        "/mic on" => session.start_capture().await?,
        "/mic off" => session.stop_capture().await?,
        "/status" => println!("{:#?}", session.snapshot().await?),
        text if text.starts_with('/') => warn!(command = text, "Unknown command."),
        text => session.inject_message(Role::User, text).await?,
    }
    Ok(true)
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&cli.log)))
        .with_timer(tracing_subscriber::fmt::time::ChronoLocal::rfc_3339())
        .with_writer(std::io::stderr)
        .init();

    let config = EngineConfig::from_env().context("Failed to load configuration")?;
    info!("Configuration loaded.");

    let devices = audio_devices(&config);
    let (events_tx, events_rx) = mpsc::unbounded_channel();
    let session = Session::spawn(config, Arc::new(WsConnector), devices, Arc::new(events_tx));
    info!(session_id = %session.session_id(), "Session created.");

    let printer = tokio::spawn(print_events(events_rx, session.clone()));

    session
        .start(cli.channels.into())
        .await
        .context("Failed to start session")?;
    if cli.mic {
        if let Err(e) = session.start_capture().await {
            warn!(error = %e, "Microphone unavailable.");
        }
    }

    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    loop {
        tokio::select! {
            line = lines.next_line() => match line? {
                Some(line) => match handle_line(&session, &line).await {
                    Ok(true) => {}
                    Ok(false) => break,
                    Err(e) => warn!(error = %e, "Command failed."),
                },
                None => break,
            },
            _ = tokio::signal::ctrl_c() => {
                info!("Received shutdown signal. Shutting down gracefully...");
                break;
            }
        }
    }

    session.stop().await?;
    drop(session);
    printer.abort();
    Ok(())
}
