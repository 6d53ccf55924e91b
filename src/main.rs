//! callrelay - terminal voice and video calls
//!
//! Calls are set up by writing signaling rows to a hosted Postgres backend
//! and media paths are negotiated peer to peer.

mod auth;
mod backend;
mod calling;
mod config;
mod tui;

use std::net::{IpAddr, Ipv4Addr};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use tokio::task::JoinHandle;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use backend::{DataStore, MemoryStore, SupabaseStore};
use calling::loopback::LoopbackNetwork;
use calling::media::{MediaDevices, SyntheticDevices};
use calling::records::{CallRecords, CallStatus};
use calling::transport::{RtcConfig, TransportFactory};
use calling::udp::UdpTransportFactory;
use calling::{CallContext, CallSession, CallSettings, CallView, MediaKind, Role};
use config::Config;
use tui::LogBuffer;

#[derive(Parser)]
#[command(name = "callrelay")]
#[command(about = "Voice and video calls from the terminal", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Enable verbose logging
    #[arg(short, long, global = true)]
    verbose: bool,
}

#[derive(Subcommand)]
enum Commands {
    /// Sign in with email and password
    Login {
        /// Account email (prompted if omitted)
        #[arg(short, long)]
        email: Option<String>,

        /// Sign in again even if a valid token is cached
        #[arg(short, long)]
        force: bool,
    },

    /// Log out and clear cached credentials
    Logout,

    /// Show current authentication status
    Status,

    /// Call another user
    Call {
        /// User id to call
        callee: String,

        /// Video call (voice only by default)
        #[arg(long)]
        video: bool,

        /// Print call events instead of the full-screen call view
        #[arg(long)]
        plain: bool,
    },

    /// Wait for an incoming call and answer it
    Listen {
        /// Answer without asking
        #[arg(short, long)]
        yes: bool,

        /// Print call events instead of the full-screen call view
        #[arg(long)]
        plain: bool,
    },

    /// Call an in-process echo peer (no backend needed)
    Loopback {
        /// Video call (voice only by default)
        #[arg(long)]
        video: bool,

        /// Negotiate over real UDP sockets on 127.0.0.1 instead of in memory
        #[arg(long)]
        udp: bool,

        /// Print call events instead of the full-screen call view
        #[arg(long)]
        plain: bool,
    },
}

impl Commands {
    /// Whether this command takes over the terminal.
    fn uses_call_screen(&self) -> bool {
        match self {
            Commands::Call { plain, .. }
            | Commands::Listen { plain, .. }
            | Commands::Loopback { plain, .. } => !plain,
            _ => false,
        }
    }
}

fn init_logging(verbose: bool, capture: Option<LogBuffer>) {
    let filter = if verbose { "debug" } else { "info" };
    let env_filter =
        tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| filter.into());
    let registry = tracing_subscriber::registry().with(env_filter);

    match capture {
        Some(buffer) => registry
            .with(
                tracing_subscriber::fmt::layer()
                    .with_target(false)
                    .with_ansi(false)
                    .with_writer(buffer),
            )
            .init(),
        None => registry
            .with(
                tracing_subscriber::fmt::layer()
                    .with_target(false)
                    .with_writer(std::io::stderr),
            )
            .init(),
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    // Logs must not draw over the call screen.
    let capture = cli.command.uses_call_screen().then(LogBuffer::new);
    init_logging(cli.verbose, capture.clone());

    match cli.command {
        Commands::Login { email, force } => {
            tracing::info!("Starting sign-in...");
            auth::login(email, force).await?;
        }
        Commands::Logout => {
            tracing::info!("Logging out...");
            auth::logout().await?;
        }
        Commands::Status => {
            auth::status().await?;
        }
        Commands::Call {
            callee,
            video,
            plain: _,
        } => {
            place_call(&callee, media_kind(video), capture).await?;
        }
        Commands::Listen { yes, plain: _ } => {
            listen(yes, capture).await?;
        }
        Commands::Loopback {
            video,
            udp,
            plain: _,
        } => {
            loopback(media_kind(video), udp, capture).await?;
        }
    }

    Ok(())
}

fn media_kind(video: bool) -> MediaKind {
    if video {
        MediaKind::AudioVideo
    } else {
        MediaKind::Audio
    }
}

#[cfg(any(feature = "audio", feature = "video-capture"))]
fn local_devices() -> Arc<dyn MediaDevices> {
    Arc::new(calling::devices::SystemDevices)
}

#[cfg(not(any(feature = "audio", feature = "video-capture")))]
fn local_devices() -> Arc<dyn MediaDevices> {
    tracing::debug!("Built without device support; using synthetic media");
    Arc::new(SyntheticDevices::granted())
}

/// Connect to the configured backend as the signed-in user.
async fn connect() -> Result<(Config, String, Arc<dyn DataStore>)> {
    let (config, session) = auth::active_session().await?;
    let store = SupabaseStore::connect(&config.backend, Some(session.access_token))
        .context("Failed to connect to the backend")?;
    Ok((config, session.user_id, Arc::new(store)))
}

fn call_context(config: &Config, store: Arc<dyn DataStore>, self_id: &str) -> CallContext {
    CallContext {
        store,
        self_id: self_id.to_string(),
        devices: local_devices(),
        transports: Arc::new(UdpTransportFactory::default()),
        settings: config.calling.call_settings(),
    }
}

async fn place_call(callee: &str, media: MediaKind, capture: Option<LogBuffer>) -> Result<()> {
    let (config, user_id, store) = connect().await?;
    let records = CallRecords::new(store.clone(), &user_id);

    let record = records.place(callee, media).await?;
    println!("Ringing {}... (Ctrl+C to cancel)", callee);

    let ring_timeout = Duration::from_secs(config.calling.ring_timeout_secs);
    let status = tokio::select! {
        s = records.wait_for_answer(&record.id, ring_timeout) => s?,
        _ = tokio::signal::ctrl_c() => {
            records.set_status(&record.id, CallStatus::Ended).await?;
            println!("Cancelled.");
            return Ok(());
        }
    };
    if status != CallStatus::Accepted {
        println!("Call {}.", status);
        return Ok(());
    }

    let session = CallSession::new(
        call_context(&config, store, &user_id),
        record.id.clone(),
        Role::Initiator,
        media,
        callee,
    );
    run_call(session, &records, &config, capture).await
}

async fn listen(auto_accept: bool, capture: Option<LogBuffer>) -> Result<()> {
    let (config, user_id, store) = connect().await?;
    let records = CallRecords::new(store.clone(), &user_id);
    let mut incoming = records.watch_incoming().await?;
    println!("Waiting for calls as {}... (Ctrl+C to stop)", user_id);

    let record = loop {
        let next = tokio::select! {
            r = incoming.next() => r,
            _ = tokio::signal::ctrl_c() => None,
        };
        let Some(record) = next else {
            incoming.close().await;
            return Ok(());
        };
        if record.status != CallStatus::Ringing {
            continue;
        }

        let kind = if record.media_kind().has_video() {
            "video"
        } else {
            "voice"
        };
        let accept = auto_accept || {
            let question = format!("Incoming {} call from {}. Answer? [Y/n] ", kind, record.caller_id);
            let answer = tokio::task::spawn_blocking(move || auth::password::prompt(&question))
                .await
                .context("Prompt task failed")??;
            !answer.trim().eq_ignore_ascii_case("n")
        };
        if accept {
            break record;
        }
        records.set_status(&record.id, CallStatus::Declined).await?;
        println!("Declined.");
    };
    incoming.close().await;

    records.set_status(&record.id, CallStatus::Accepted).await?;
    let session = CallSession::new(
        call_context(&config, store, &user_id),
        record.id.clone(),
        Role::Receiver,
        record.media_kind(),
        record.caller_id.clone(),
    );
    run_call(session, &records, &config, capture).await
}

/// Ring an echo peer living in this process and talk to it.
async fn loopback(media: MediaKind, udp: bool, capture: Option<LogBuffer>) -> Result<()> {
    let config = Config::load().unwrap_or_default();
    let store: Arc<dyn DataStore> = Arc::new(MemoryStore::new());
    let (transports, settings): (Arc<dyn TransportFactory>, CallSettings) = if udp {
        let settings = CallSettings {
            rtc: RtcConfig {
                ice_servers: Vec::new(),
            },
            ..config.calling.call_settings()
        };
        (
            Arc::new(UdpTransportFactory::new(IpAddr::V4(Ipv4Addr::LOCALHOST))),
            settings,
        )
    } else {
        (Arc::new(LoopbackNetwork::new()), config.calling.call_settings())
    };
    let context = |user: &str| CallContext {
        store: store.clone(),
        self_id: user.to_string(),
        devices: Arc::new(SyntheticDevices::granted()),
        transports: transports.clone(),
        settings: settings.clone(),
    };

    let echo = spawn_echo_peer(context("echo")).await?;

    let records = CallRecords::new(store.clone(), "you");
    let record = records.place("echo", media).await?;
    let status = records
        .wait_for_answer(&record.id, Duration::from_secs(5))
        .await?;
    if status != CallStatus::Accepted {
        println!("Echo peer did not answer ({}).", status);
        return Ok(());
    }

    let session = CallSession::new(context("you"), record.id.clone(), Role::Initiator, media, "echo");
    let result = run_call(session, &records, &config, capture).await;
    if let Ok(Some(echo)) = echo.await {
        echo.end().await;
    }
    result
}

/// Answer the first call placed to `ctx.self_id` and keep it up until the
/// caller hangs up.
async fn spawn_echo_peer(ctx: CallContext) -> Result<JoinHandle<Option<CallSession>>> {
    let records = CallRecords::new(ctx.store.clone(), ctx.self_id.as_str());
    let mut ringing = records.watch_incoming().await?;
    Ok(tokio::spawn(async move {
        let record = ringing.next().await;
        ringing.close().await;
        let record = record?;
        if let Err(e) = records.set_status(&record.id, CallStatus::Accepted).await {
            tracing::warn!("Echo peer could not answer: {}", e);
            return None;
        }
        let session = CallSession::new(
            ctx,
            record.id.clone(),
            Role::Receiver,
            record.media_kind(),
            record.caller_id,
        );
        if let Err(e) = session.follow_record(&records).await {
            tracing::warn!("Echo peer cannot follow the call record: {}", e);
        }
        if let Err(e) = session.start().await {
            tracing::warn!("Echo peer failed to start: {}", e);
        }
        Some(session)
    }))
}

/// Run a call to completion, then mark its record ended. A final status
/// written by the other side ends the call here too.
async fn run_call(
    session: CallSession,
    records: &CallRecords,
    config: &Config,
    capture: Option<LogBuffer>,
) -> Result<()> {
    if let Err(e) = session.follow_record(records).await {
        tracing::warn!("Cannot follow the call record: {}", e);
    }
    let call_id = session.view().call_id;
    let result = show_call(session, config, capture).await;
    if let Err(e) = records.set_status(&call_id, CallStatus::Ended).await {
        tracing::warn!("Failed to mark call ended: {}", e);
    }
    result
}

/// Show a call on the call screen, or line by line.
async fn show_call(session: CallSession, config: &Config, capture: Option<LogBuffer>) -> Result<()> {
    if capture.is_some() {
        let options = tui::ScreenOptions {
            failure_close_delay: Duration::from_secs(config.calling.failure_close_delay_secs),
        };
        return tui::run(session, capture, options).await;
    }

    if let Err(e) = session.start().await {
        println!("{}", e.user_message());
        session.end().await;
        return Err(e.into());
    }

    let mut views = session.subscribe();
    let mut last = views.borrow_and_update().clone();
    print_view(None, &last);
    loop {
        tokio::select! {
            changed = views.changed() => {
                if changed.is_err() {
                    break;
                }
                let view = views.borrow_and_update().clone();
                print_view(Some(&last), &view);
                last = view;
                if last.ended {
                    break;
                }
            }
            _ = tokio::signal::ctrl_c() => break,
        }
    }
    session.end().await;
    Ok(())
}

/// Print what changed between two views.
fn print_view(before: Option<&CallView>, view: &CallView) {
    let changed = |f: fn(&CallView) -> String| before.map_or(true, |b| f(b) != f(view));

    if changed(|v| v.state.to_string()) {
        println!("[{}] {}", view.duration_label(), view.state);
    }
    if changed(|v| format!("{}{}", v.remote_audio, v.remote_video)) && (view.remote_audio || view.remote_video) {
        println!(
            "Receiving {}",
            if view.remote_video { "audio and video" } else { "audio" }
        );
    }
    if changed(|v| v.notice.clone().unwrap_or_default()) {
        if let Some(notice) = &view.notice {
            println!("{}", notice);
        }
    }
}
