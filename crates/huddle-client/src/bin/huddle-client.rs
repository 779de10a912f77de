use std::io::{self, BufRead};
use std::path::PathBuf;

use clap::Parser;
use tokio::sync::{broadcast, mpsc};
use tracing::{info, warn};

use huddle_client::{
    Call, CallCommand, CallConfig, CallEvent, CallOutcome, MediaConfig, DEFAULT_ICE_SERVER,
};
use huddle_common::{Error, RoomName};

#[derive(Parser, Debug)]
#[command(name = "huddle-client")]
#[command(about = "Join a two-person room and hold an audio/video call")]
struct Args {
    /// Room to join; the first person in a room hosts the call
    #[arg(long, env = "HUDDLE_ROOM")]
    room: String,
    /// WebSocket URL of the signaling relay
    #[arg(long, env = "HUDDLE_SIGNALING_URL", default_value = "ws://127.0.0.1:3000/signal")]
    signaling_url: String,
    /// STUN/TURN server URL (repeatable)
    #[arg(
        long = "ice-server",
        env = "HUDDLE_ICE_SERVERS",
        value_delimiter = ',',
        default_value = DEFAULT_ICE_SERVER
    )]
    ice_servers: Vec<String>,
    /// Ogg/Opus file to send as microphone audio
    #[arg(long, env = "HUDDLE_AUDIO_FILE")]
    audio_file: Option<PathBuf>,
    /// IVF/VP8 file to send as camera video
    #[arg(long, env = "HUDDLE_VIDEO_FILE")]
    video_file: Option<PathBuf>,
    /// Do not read `mic`, `camera`, `stats`, `leave` commands from stdin
    #[arg(long, default_value_t = false)]
    no_stdin: bool,
}

fn parse_control_line(line: &str) -> Result<CallCommand, String> {
    let mut parts = line.split_whitespace();
    let command = parts.next().ok_or_else(|| "empty command".to_string())?;
    if parts.next().is_some() {
        return Err("commands take no arguments".into());
    }
    match command.to_ascii_lowercase().as_str() {
        "mic" | "m" => Ok(CallCommand::ToggleMic),
        "camera" | "cam" | "c" => Ok(CallCommand::ToggleCamera),
        "stats" | "s" => Ok(CallCommand::Stats),
        "leave" | "quit" | "q" => Ok(CallCommand::Leave),
        other => Err(format!("unknown command `{other}`")),
    }
}

fn spawn_stdin_reader(tx: mpsc::Sender<CallCommand>) {
    std::thread::spawn(move || {
        eprintln!("Commands: mic | camera | stats | leave");
        let stdin = io::stdin();
        for line in stdin.lock().lines() {
            match line {
                Ok(line) if line.trim().is_empty() => {}
                Ok(line) => match parse_control_line(&line) {
                    Ok(cmd) => {
                        if tx.blocking_send(cmd).is_err() {
                            break;
                        }
                        if cmd == CallCommand::Leave {
                            break;
                        }
                    }
                    Err(err) => eprintln!("invalid command `{}`: {}", line.trim(), err),
                },
                Err(err) => {
                    eprintln!("stdin read error: {}", err);
                    break;
                }
            }
        }
    });
}

async fn report_events(mut events: broadcast::Receiver<CallEvent>) {
    loop {
        match events.recv().await {
            Ok(CallEvent::RoleAssigned(role)) => info!("you are the {}", role),
            Ok(CallEvent::MicToggled { active }) => {
                eprintln!("{}", if active { "Mute Mic" } else { "UnMute Mic" })
            }
            Ok(CallEvent::CameraToggled { active }) => {
                eprintln!("{}", if active { "Stop Camera" } else { "Start Camera" })
            }
            Ok(CallEvent::RoomFull) => eprintln!("Room is full"),
            Ok(event) => info!("{:?}", event),
            Err(broadcast::error::RecvError::Lagged(n)) => warn!("missed {} call events", n),
            Err(broadcast::error::RecvError::Closed) => break,
        }
    }
}

async fn run(args: Args) -> anyhow::Result<()> {
    let room = RoomName::parse(&args.room)?;
    let config = CallConfig {
        ice_servers: args
            .ice_servers
            .into_iter()
            .map(|s| s.trim().to_string())
            .filter(|s| !s.is_empty())
            .collect(),
        media: MediaConfig {
            audio_file: args.audio_file,
            video_file: args.video_file,
            ..Default::default()
        },
        ..CallConfig::new(args.signaling_url, room.clone())
    };

    let call = Call::connect(config).await?;
    tokio::spawn(report_events(call.subscribe()));

    let (command_tx, command_rx) = mpsc::channel::<CallCommand>(16);
    if !args.no_stdin {
        spawn_stdin_reader(command_tx.clone());
    }
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            let _ = command_tx.send(CallCommand::Leave).await;
        }
    });

    outcome_result(call.run(command_rx).await?, &room)
}

/// Only leaving on purpose counts as success.
fn outcome_result(outcome: CallOutcome, room: &RoomName) -> anyhow::Result<()> {
    match outcome {
        CallOutcome::Left => Ok(()),
        CallOutcome::RoomFull => Err(Error::RoomFull(room.to_string()).into()),
        CallOutcome::Disconnected => {
            Err(Error::SignalingClosed("relay closed the connection".into()).into())
        }
    }
}

fn main() -> anyhow::Result<()> {
    huddle_common::init_tracing();

    let args = Args::parse();

    tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()?
        .block_on(run(args))
}
