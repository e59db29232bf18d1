mod config;

use std::path::PathBuf;
use std::sync::atomic::Ordering;
use std::time::Duration;

use anyhow::Result;
use clap::Parser;

use gibnet::{MessageKind, MessageRegistry, ServerEvent, ServerHost};

/// Header of the chat lines relayed between clients.
pub const CHAT: u8 = MessageKind::FIRST_USER;

#[derive(Parser)]
#[command(name = "gibnet-server")]
#[command(about = "gibnet relay server")]
pub struct Args {
    #[arg(short, long, help = "TOML config file")]
    config: Option<PathBuf>,

    #[arg(short, long)]
    bind: Option<String>,

    #[arg(short, long)]
    port: Option<u16>,

    #[arg(short, long)]
    ticrate: Option<u32>,

    #[arg(short, long)]
    max_clients: Option<usize>,

    #[arg(long, help = "Unreliable data limit per client in KB/s")]
    max_rate: Option<u32>,

    #[arg(long)]
    hostname: Option<String>,

    #[arg(long)]
    password: Option<String>,

    #[arg(long)]
    no_compression: bool,
}

fn main() -> Result<()> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let args = Args::parse();
    let mut config = config::load(args.config.as_deref())?;
    config::apply_args(&mut config, &args);

    let mut registry = MessageRegistry::new();
    registry.register(CHAT, "chat")?;

    let mut server = ServerHost::new(config, registry)?;
    log::info!("Server started on {}", server.local_addr());

    let running = server.running();
    while running.load(Ordering::SeqCst) {
        server.tick_once();

        let events: Vec<_> = server.drain_events().collect();
        for event in events {
            handle_event(&mut server, event);
        }

        std::thread::sleep(Duration::from_millis(1));
    }

    server.shutdown_connections();
    log::info!("Server shutting down");
    Ok(())
}

fn handle_event(server: &mut ServerHost, event: ServerEvent) {
    match event {
        ServerEvent::ClientConnected {
            client_id,
            addr,
            name,
        } => {
            log::info!("{} joined as client {} from {}", name, client_id, addr);
        }
        ServerEvent::ClientDisconnected { client_id, reason } => {
            log::info!("Client {} {}", client_id, reason.as_str());
        }
        ServerEvent::ConnectionDenied { addr, reason } => {
            log::warn!("Connection denied to {}: {}", addr, reason);
        }
        ServerEvent::ResyncRequired { client_id } => {
            // Chat has no state to snapshot.
            log::info!("Client {} asked for a resync", client_id);
        }
        ServerEvent::Message { client_id, message } => {
            if message.kind == MessageKind(CHAT) {
                let mut line = format!("{}: ", client_id).into_bytes();
                line.extend_from_slice(&message.data);
                server.broadcast_reliable(gibnet::Message::new(message.kind, line));
            }
        }
        ServerEvent::Error { message } => {
            log::error!("{}", message);
        }
    }
}
