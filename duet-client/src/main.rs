use std::{sync::Arc, time::Duration};

use clap::{Parser, ValueEnum};
use duet_client::{CoachChat, LoungeSync, Notice, RequestGateway, SessionStore, api};
use duet_core::DEFAULT_POLL_INTERVAL_MS;
use tokio::{
    io::{AsyncBufReadExt, BufReader},
    sync::mpsc,
};
use tracing::info;
use tracing_subscriber::EnvFilter;

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
enum Room {
    /// One-on-one AI coach chat.
    Coach,
    /// Shared lounge with the bound partner.
    Lounge,
}

/// Terminal client for the Duet couples app.
#[derive(Parser, Debug)]
#[command(name = "duet", version, about)]
struct Args {
    /// Base URL of the Duet server.
    #[arg(long, default_value = "http://127.0.0.1:8080")]
    server_url: String,

    /// Phone number to log in with.
    #[arg(long)]
    phone: String,

    /// Account password.
    #[arg(long)]
    password: String,

    /// Which conversation to join.
    #[arg(long, value_enum, default_value_t = Room::Coach)]
    room: Room,

    /// Nickname shown next to lounge messages. Defaults to the profile
    /// nickname, then the phone number.
    #[arg(long)]
    nickname: Option<String>,

    /// Lounge poll interval in milliseconds.
    #[arg(long, default_value_t = DEFAULT_POLL_INTERVAL_MS)]
    poll_interval_ms: u64,
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .init();

    let args = Args::parse();

    let session = Arc::new(SessionStore::open_default());
    let (notice_tx, mut notice_rx) = mpsc::unbounded_channel();
    let gateway = Arc::new(RequestGateway::new(
        &args.server_url,
        Arc::clone(&session),
        notice_tx,
    )?);

    // Surface gateway notices on stderr; expiry redirect ends the process
    // the way the app would bounce the user back to the login screen.
    tokio::spawn(async move {
        while let Some(notice) = notice_rx.recv().await {
            match notice {
                Notice::SessionExpired => eprintln!("! session expired, please log in again"),
                Notice::NetworkError { message } => eprintln!("! {message}"),
                Notice::RedirectToLogin => {
                    eprintln!("! returning to login");
                    std::process::exit(1);
                }
            }
        }
    });

    if session.token().is_none() {
        let envelope = api::login(&gateway, &args.phone, &args.password).await;
        if !envelope.success {
            eprintln!("login failed: {}", envelope.message_or("unknown error"));
            std::process::exit(1);
        }
    }
    let profile = api::refresh_profile(&gateway).await;
    if !profile.success {
        eprintln!(
            "could not load profile: {}",
            profile.message_or("unknown error")
        );
    }

    let nickname = resolve_nickname(args.nickname.clone(), session.profile(), &args.phone);
    info!(%nickname, room = ?args.room, "session ready");

    match args.room {
        Room::Coach => run_coach(gateway).await,
        Room::Lounge => {
            run_lounge(gateway, nickname, Duration::from_millis(args.poll_interval_ms)).await
        }
    }
}

async fn run_coach(gateway: Arc<RequestGateway>) -> Result<(), Box<dyn std::error::Error>> {
    let mut chat = CoachChat::new(gateway);
    if let Err(err) = chat.load().await {
        eprintln!("could not load history: {err}");
    }
    for msg in chat.messages() {
        println!("[{:?}] {}", msg.role, msg.content);
    }
    println!("(type a message, /clear to reset, /quit to exit)");

    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    while let Some(line) = lines.next_line().await? {
        match line.trim() {
            "" => {}
            "/quit" => break,
            "/clear" => match chat.clear().await {
                Ok(()) => println!("(history cleared)"),
                Err(err) => eprintln!("clear failed: {err}"),
            },
            text => match chat.send(text).await {
                Ok(reply) => println!("[Assistant] {reply}"),
                Err(err) => eprintln!("send failed: {err}"),
            },
        }
    }
    Ok(())
}

async fn run_lounge(
    gateway: Arc<RequestGateway>,
    nickname: String,
    poll_interval: Duration,
) -> Result<(), Box<dyn std::error::Error>> {
    let mut sync = LoungeSync::new(gateway);
    if let Err(err) = sync.load().await {
        eprintln!("could not load lounge: {err}");
    }

    let mut last_printed = 0u64;
    last_printed = print_new(&sync, last_printed);
    sync.start_polling(poll_interval);
    println!("(type a message, /quit to exit)");

    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    let mut refresh = tokio::time::interval(Duration::from_millis(500));
    loop {
        tokio::select! {
            line = lines.next_line() => {
                match line? {
                    None => break,
                    Some(line) => match line.trim() {
                        "" => {}
                        "/quit" => break,
                        text => {
                            if let Err(err) = sync.send(text, &nickname).await {
                                eprintln!("send failed: {err}");
                            }
                            last_printed = print_new(&sync, last_printed);
                        }
                    },
                }
            }
            _ = refresh.tick() => {
                last_printed = print_new(&sync, last_printed);
            }
        }
    }

    sync.stop_polling();
    Ok(())
}

/// Display name for lounge sends: explicit override, then the profile's
/// name, then the login phone number.
fn resolve_nickname(
    override_name: Option<String>,
    profile: Option<duet_core::UserProfile>,
    phone: &str,
) -> String {
    override_name
        .or_else(|| profile.map(|p| p.display_name().to_owned()))
        .unwrap_or_else(|| phone.to_owned())
}

/// Prints messages newer than `after`, returning the new high-water mark.
fn print_new(sync: &LoungeSync, after: u64) -> u64 {
    let mut max = after;
    for msg in sync.messages() {
        if msg.id > after {
            let tag = if msg.is_ai { "AI" } else { msg.nickname.as_str() };
            println!("[{tag}] {}", msg.message);
            max = max.max(msg.id);
        }
    }
    max
}
