use std::path::PathBuf;
use std::process::ExitCode;
use std::time::Duration;

use clap::Parser;
use log::{error, info};
use tokio::sync::broadcast::error::RecvError;

use loopcall::{logger, CallConfig, CallSession, SessionEvent};

/// Start a loopback audio/video call with a text data channel.
#[derive(Parser, Debug)]
#[command(name = "loopcall", version, about)]
struct Args {
    /// TOML configuration file [default: loopcall.toml]
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Message to send once the call is up; repeat for more
    #[arg(short, long = "message")]
    messages: Vec<String>,

    /// Capture the microphone only
    #[arg(long)]
    audio_only: bool,

    /// Seconds to keep the call open before hanging up
    #[arg(long, default_value_t = 3)]
    hold_secs: u64,

    /// Print session events as JSON lines
    #[arg(long)]
    json: bool,
}

#[tokio::main]
async fn main() -> ExitCode {
    let args = Args::parse();

    let path = args.config.clone().unwrap_or_else(CallConfig::default_path);
    let mut config = match CallConfig::load_from_file(&path) {
        Ok(config) => config,
        Err(e) => {
            eprintln!("loopcall: {e}");
            return ExitCode::FAILURE;
        }
    };
    if args.audio_only {
        config.media.video = false;
    }
    logger::init(&config.logging);

    let session = CallSession::loopback(config);
    let printer = tokio::spawn(print_events(session.subscribe(), args.json));

    let outcome = run(&session, &args).await;

    if session.end_call().await.is_err() {
        info!("No call to end");
    }
    printer.abort();

    match outcome {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            error!("{e}");
            eprintln!("loopcall: {e}");
            ExitCode::FAILURE
        }
    }
}

async fn run(session: &CallSession, args: &Args) -> Result<(), loopcall::CallError> {
    session.start_call().await?;

    for message in &args.messages {
        session.send_message(message).await?;
    }

    tokio::select! {
        _ = tokio::time::sleep(Duration::from_secs(args.hold_secs)) => {}
        _ = tokio::signal::ctrl_c() => info!("Interrupted, hanging up"),
    }
    Ok(())
}

async fn print_events(mut events: tokio::sync::broadcast::Receiver<SessionEvent>, json: bool) {
    loop {
        match events.recv().await {
            Ok(event) => {
                if json {
                    match serde_json::to_string(&event) {
                        Ok(line) => println!("{line}"),
                        Err(e) => error!("Could not serialize event: {e}"),
                    }
                } else {
                    println!("{}", describe(&event));
                }
            }
            Err(RecvError::Lagged(missed)) => info!("Skipped {missed} event(s)"),
            Err(RecvError::Closed) => break,
        }
    }
}

fn describe(event: &SessionEvent) -> String {
    match event {
        SessionEvent::StateChanged { state } => format!("call is {state}"),
        SessionEvent::LocalMedia { stream_id, tracks } => {
            format!("local stream {stream_id} with {tracks} track(s)")
        }
        SessionEvent::RemoteTrack(track) => {
            format!("remote {} track {} on stream {}", track.kind, track.id, track.stream_id)
        }
        SessionEvent::DataChannelReceived { label } => format!("remote got data channel '{label}'"),
        SessionEvent::MessageReceived { label, text } => format!("[{label}] {text:?}"),
        SessionEvent::IceCandidateRelayed { from, candidate } => {
            format!("{from} candidate relayed: {candidate}")
        }
        SessionEvent::IceIngestionFailed { to, candidate, reason } => {
            format!("{to} rejected candidate {candidate}: {reason}")
        }
        SessionEvent::NegotiationFailed { step, reason } => {
            format!("negotiation failed ({step}): {reason}")
        }
        SessionEvent::Negotiated { round } => format!("negotiation round {round} complete"),
    }
}
