use std::io::{self, BufRead};
use std::net::{SocketAddr, ToSocketAddrs};
use std::path::PathBuf;
use std::sync::mpsc::{self, Receiver, TryRecvError};
use std::thread;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::Parser;

use gibnet::net::handshake::DirectoryResolver;
use gibnet::{ClientConfig, ClientEvent, ClientSession, Message, MessageKind, MessageRegistry};

const CHAT: u8 = MessageKind::FIRST_USER;

#[derive(Parser)]
#[command(name = "gibnet-client")]
#[command(about = "Headless gibnet client: relays stdin lines as chat")]
struct Args {
    #[arg(help = "Server address (e.g., 127.0.0.1:10666)")]
    server: String,

    #[arg(short, long, default_value = "Player")]
    name: String,

    #[arg(short, long, default_value = "")]
    password: String,

    #[arg(long, help = "Divert to the download flow even if the files are present")]
    force_download: bool,

    #[arg(short = 'd', long = "resource-dir", help = "Directory searched for WAD files")]
    resource_dirs: Vec<PathBuf>,
}

fn main() -> Result<()> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let args = Args::parse();
    let server: SocketAddr = args
        .server
        .to_socket_addrs()?
        .next()
        .with_context(|| format!("cannot resolve {}", args.server))?;

    let mut config = ClientConfig {
        name: args.name,
        password: args.password,
        force_download: args.force_download,
        ..Default::default()
    };
    if !args.resource_dirs.is_empty() {
        config.resource_dirs = args.resource_dirs;
    }

    let mut registry = MessageRegistry::new();
    registry.register(CHAT, "chat")?;

    let resolver = DirectoryResolver::new(config.resource_dirs.clone());
    let mut session = ClientSession::new(config, registry, Box::new(resolver))?;
    session.connect(server);

    let lines = spawn_stdin_reader();

    loop {
        session.tick_once();

        for event in session.drain_events().collect::<Vec<_>>() {
            if !handle_event(event) {
                return Ok(());
            }
        }

        match lines.try_recv() {
            Ok(line) => {
                if !session.send(Message::new(MessageKind(CHAT), line.into_bytes())) {
                    log::warn!("Not connected yet, line dropped");
                }
            }
            Err(TryRecvError::Empty) => {}
            Err(TryRecvError::Disconnected) => {
                session.disconnect("Client quit");
                return Ok(());
            }
        }

        thread::sleep(Duration::from_millis(1));
    }
}

/// Returns false once the session is over.
fn handle_event(event: ClientEvent) -> bool {
    match event {
        ClientEvent::ServerInfo(info) => {
            log::info!(
                "{}: {} on {} ({}/{} players)",
                info.hostname,
                gibnet::Version::from_packed(info.version),
                info.map,
                info.players,
                info.max_players
            );
            true
        }
        ClientEvent::Connected { client_id } => {
            log::info!("Connected as client {}", client_id);
            true
        }
        ClientEvent::Message(message) => {
            println!("{}", String::from_utf8_lossy(&message.data));
            true
        }
        ClientEvent::ConnectionFailed { reason } => {
            log::error!("Connection failed: {}", reason);
            false
        }
        ClientEvent::DownloadRequired { files, site } => {
            for file in &files {
                log::info!("Missing {} ({})", file.name, file.hash);
            }
            log::info!("Fetch them from {} and reconnect", site);
            false
        }
        ClientEvent::Disconnected { reason } => {
            log::info!("Disconnected: {}", reason);
            false
        }
    }
}

fn spawn_stdin_reader() -> Receiver<String> {
    let (tx, rx) = mpsc::channel();
    thread::spawn(move || {
        for line in io::stdin().lock().lines() {
            let Ok(line) = line else { break };
            if tx.send(line).is_err() {
                break;
            }
        }
    });
    rx
}
