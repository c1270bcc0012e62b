use std::sync::Arc;

use anyhow::Result;
use clap::Parser;
use tokio::io::{AsyncBufReadExt, BufReader};
use tracing_subscriber::EnvFilter;

use bonfire::{ChatConfig, ChatSession, LoopbackBackend, SessionState};

#[derive(Parser, Debug)]
#[command(name = "bonfire", about = "Join a chat broker from the terminal", version)]
struct Cli {
    #[arg(
        long,
        env = "BONFIRE_BROKER_URL",
        default_value = "ws://localhost:8080/ws",
        help = "Websocket URL of the chat broker"
    )]
    server: String,

    #[arg(long, short, help = "Display name to join as")]
    username: String,

    #[arg(
        long,
        env = "BONFIRE_LOG",
        default_value = "warn",
        help = "Log filter (tracing env-filter syntax)"
    )]
    log: String,

    #[arg(long, help = "Skip the broker and run against the local loop-back")]
    offline: bool,

    #[arg(
        long,
        help = "Fail instead of degrading to demo mode when the broker is unreachable"
    )]
    no_fallback: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    dotenvy::dotenv().ok();
    let cli = Cli::parse();

    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::new(&cli.log))
        .with_writer(std::io::stderr)
        .init();

    let config = ChatConfig::new(&cli.server)?.with_fallback(!cli.no_fallback);
    let session = if cli.offline {
        ChatSession::with_backend(config, Arc::new(LoopbackBackend))
    } else {
        ChatSession::new(config)
    };

    let _broadcasts = session.observe_broadcast(|message| {
        println!("[{}] {}", message.sender, message.content);
    });
    let _privates = session.observe_private(|message| {
        println!("[dm {}] {}", message.sender, message.content);
    });
    let _presence = session.observe_presence(|roster| {
        let names: Vec<&str> = roster.iter().map(|p| p.name.as_str()).collect();
        println!("* online: {}", names.join(", "));
    });

    session.connect(&cli.username).await?;
    if session.state() == (SessionState::Connected { demo: true }) {
        println!("* broker unreachable, running in demo mode");
    }
    println!(
        "* connected as {}. /msg <peer> <text> sends privately, /quit leaves",
        cli.username
    );

    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    while let Some(line) = lines.next_line().await? {
        let line = line.trim();
        if line.is_empty() {
            continue;
        }
        if line == "/quit" {
            break;
        }
        if let Some(rest) = line.strip_prefix("/msg ") {
            match rest.split_once(' ') {
                Some((peer, text)) => session.send_private(text, peer).await,
                None => println!("* usage: /msg <peer> <text>"),
            }
            continue;
        }
        session.send_broadcast(line).await;
    }

    session.disconnect().await;
    Ok(())
}
