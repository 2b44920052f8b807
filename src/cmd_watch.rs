use anyhow::Result;
use chrono::Local;
use clap::Args;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};

use crate::config::AppConfig;
use crate::protocol::Notification;
use crate::supervisor;
use crate::transport::live::Session;

#[derive(Args, Debug, Default)]
pub struct WatchArgs {
    /// Room id to join (overrides config)
    #[arg(short, long)]
    pub room: Option<u64>,
    /// User id sent in the auth frame (overrides config)
    #[arg(short, long)]
    pub uid: Option<u64>,
    /// Danmu token from the room's danmu-info lookup (overrides config)
    #[arg(short, long)]
    pub token: Option<String>,
    /// Chat service URL (overrides config)
    #[arg(long)]
    pub endpoint: Option<String>,
    /// Reconnect with backoff when the connection drops
    #[arg(long)]
    pub reconnect: bool,
    /// Print notifications as JSON lines
    #[arg(long)]
    pub json: bool,
}

impl WatchArgs {
    fn apply(&self, mut config: AppConfig) -> AppConfig {
        if let Some(room) = self.room {
            config.live.room_id = Some(room);
        }
        if let Some(uid) = self.uid {
            config.live.uid = uid;
        }
        if let Some(token) = &self.token {
            config.live.token = token.clone();
        }
        if let Some(endpoint) = &self.endpoint {
            config.live.endpoint = endpoint.clone();
        }
        if self.reconnect {
            config.reconnect.enabled = true;
        }
        config
    }
}

pub async fn run(args: &WatchArgs, config: AppConfig) -> Result<()> {
    let config = args.apply(config);
    let session_config = config.session_config()?;
    let credentials = config.credentials()?;

    if config.reconnect.enabled {
        let (tx, mut rx) = mpsc::channel::<Notification>(512);
        let shutdown = CancellationToken::new();
        let supervisor = tokio::spawn(supervisor::run(
            session_config,
            credentials,
            config.reconnect_policy(),
            tx,
            shutdown.clone(),
        ));

        loop {
            tokio::select! {
                n = rx.recv() => {
                    let Some(n) = n else { break };
                    print_notification(&n, args.json);
                }
                _ = tokio::signal::ctrl_c() => {
                    info!("Interrupted, disconnecting");
                    shutdown.cancel();
                    while let Some(n) = rx.recv().await {
                        print_notification(&n, args.json);
                    }
                    break;
                }
            }
        }
        return supervisor.await?;
    }

    let session = Session::new(session_config);
    let mut rx = session.subscribe();
    if let Err(e) = session.connect(&credentials).await {
        error!("{e:#}");
        while let Ok(n) = rx.try_recv() {
            print_notification(&n, args.json);
        }
        return Err(e);
    }
    if let Some(room) = session.room_id() {
        info!("[{}] Watching room {room}", session.id());
    }

    loop {
        tokio::select! {
            n = rx.recv() => {
                let Some(n) = n else { break };
                print_notification(&n, args.json);
                if matches!(n, Notification::Disconnected(_)) {
                    break;
                }
            }
            _ = tokio::signal::ctrl_c() => {
                info!("Interrupted, disconnecting");
                if session.is_connected() {
                    session.disconnect().await?;
                }
                while let Ok(n) = rx.try_recv() {
                    print_notification(&n, args.json);
                }
                break;
            }
        }
    }
    Ok(())
}

fn print_notification(n: &Notification, json: bool) {
    if json {
        match serde_json::to_string(n) {
            Ok(line) => println!("{line}"),
            Err(e) => error!("Failed to serialize notification: {e}"),
        }
        return;
    }
    let now = Local::now().format("%H:%M:%S");
    match n {
        Notification::Connected => println!("[{now}] * connected"),
        Notification::Disconnected(reason) => println!("[{now}] * disconnected ({reason})"),
        Notification::Event(event) => println!("[{now}] {event}"),
        Notification::Error(msg) => println!("[{now}] ! {msg}"),
    }
}
