//! tokenkeeper - keeps a bearer-token session alive from the command line.
//!
//! Restores the stored session on startup, renews it ahead of expiry and
//! exposes the lifecycle through a handful of subcommands.

use std::io::{self, Write};
use std::sync::Arc;

use anyhow::{bail, Context, Result};
use tracing::info;
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use tokenkeeper_core::auth::{
    Claims, GateDecision, RotationLedger, SessionEvent, SessionPhase, SessionSnapshot,
};
use tokenkeeper_core::utils::{format_timestamp, mask_token};
use tokenkeeper_core::{ApiClient, AuthApi, Config, SessionManager};

// ============================================================================
// Constants
// ============================================================================

/// Prefix of the rolling log files written by `watch`
const LOG_FILE_PREFIX: &str = "tokenkeeper.log";

const USAGE: &str = "\
Usage: tokenkeeper <command>

Commands:
  login [identifier]     Sign in and store the session
  register <identifier>  Create an account
  status                 Show the current session
  refresh                Renew the session now
  logout                 End the session and revoke it server-side
  history [--clear]      Show (or clear) recent refresh token rotations
  watch                  Keep the session alive until Ctrl-C";

/// Initialize the tracing subscriber for logging.
///
/// With a log directory, events are also written to a daily rolling file;
/// the returned guard must be held until exit so buffered lines get flushed.
fn init_tracing(log_dir: Option<&std::path::Path>) -> Option<WorkerGuard> {
    // Use RUST_LOG env var to control log level (e.g., RUST_LOG=debug)
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn"));
    let stderr_layer = fmt::layer().with_writer(io::stderr);

    match log_dir {
        Some(dir) => {
            let appender = tracing_appender::rolling::daily(dir, LOG_FILE_PREFIX);
            let (writer, guard) = tracing_appender::non_blocking(appender);
            tracing_subscriber::registry()
                .with(stderr_layer)
                .with(fmt::layer().with_ansi(false).with_writer(writer))
                .with(filter)
                .init();
            Some(guard)
        }
        None => {
            tracing_subscriber::registry()
                .with(stderr_layer)
                .with(filter)
                .init();
            None
        }
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    // Load .env file if present (silently ignore if not found)
    let _ = dotenvy::dotenv();

    let args: Vec<String> = std::env::args().collect();
    let Some(command) = args.get(1).map(String::as_str) else {
        eprintln!("{}", USAGE);
        return Ok(());
    };

    let mut config = Config::load()?;
    let data_dir = config.data_dir()?;

    let _log_guard = if command == "watch" {
        std::fs::create_dir_all(&data_dir).context("Failed to create data directory")?;
        init_tracing(Some(&data_dir))
    } else {
        init_tracing(None)
    };
    info!(command, "tokenkeeper starting");

    let api = Arc::new(ApiClient::new(config.api_base())?);

    if command == "register" {
        let identifier = args
            .get(2)
            .context("register needs an identifier")?;
        let secret = prompt_secret("Password: ")?;
        api.register(identifier, &secret).await?;
        println!("Registered {}. You can now log in.", identifier);
        return Ok(());
    }

    let ledger = Arc::new(RotationLedger::open(data_dir)?);
    let session = SessionManager::new(
        api,
        config.token_store()?,
        ledger,
        config.renewal_policy(),
    );

    // Startup restore; a network failure leaves the stored session for later
    if let Err(e) = session.restore().await {
        eprintln!("Warning: could not restore session: {}", e);
    }

    match command {
        "login" => login(&session, &mut config, args.get(2).cloned()).await,
        "status" => status(&session).await,
        "refresh" => {
            session.refresh().await?;
            println!("Session renewed.");
            print_snapshot(&session.snapshot());
            Ok(())
        }
        "logout" => {
            session.logout().await;
            println!("Logged out.");
            Ok(())
        }
        "history" if args.get(2).map(String::as_str) == Some("--clear") => {
            session.clear_rotation_history()?;
            println!("Rotation history cleared.");
            Ok(())
        }
        "history" => history(&session),
        "watch" => watch(&session, &config).await,
        other => bail!("Unknown command '{}'\n\n{}", other, USAGE),
    }
}

async fn login(session: &SessionManager, config: &mut Config, identifier: Option<String>) -> Result<()> {
    let identifier = match identifier.or_else(|| config.last_identifier.clone()) {
        Some(id) => id,
        None => prompt_line("Email: ")?,
    };
    let secret = prompt_secret("Password: ")?;

    session.sign_in(&identifier, &secret).await?;

    config.last_identifier = Some(identifier);
    config.save()?;

    println!("Logged in.");
    print_snapshot(&session.snapshot());
    Ok(())
}

async fn status(session: &SessionManager) -> Result<()> {
    let snapshot = session.snapshot();
    if !snapshot.is_authenticated() {
        println!("Not logged in.");
        return Ok(());
    }
    print_snapshot(&snapshot);
    println!("Server status:    {}", session.remote_status().await);
    Ok(())
}

fn history(session: &SessionManager) -> Result<()> {
    let entries = session.rotation_history();
    if entries.is_empty() {
        println!("No rotations recorded.");
        return Ok(());
    }
    for entry in entries.iter().rev() {
        println!(
            "{}  {} -> {}",
            format_timestamp(entry.timestamp.timestamp()),
            entry.old_masked,
            entry.new_masked
        );
    }
    Ok(())
}

async fn watch(session: &SessionManager, config: &Config) -> Result<()> {
    let mut gate = session.gate().with_login_route(config.login_route.clone());
    if let GateDecision::Redirect(route) = gate.admit().await {
        bail!("Not logged in (login at {})", route);
    }

    let mut events = session.events();
    print_snapshot(&session.snapshot());
    println!("Watching session, press Ctrl-C to stop.");

    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {
                println!();
                break;
            }
            event = events.recv() => match event {
                Ok(event) => {
                    println!("{}", describe_event(&event));
                    if matches!(event, SessionEvent::Ended { .. }) {
                        break;
                    }
                }
                Err(tokio::sync::broadcast::error::RecvError::Lagged(skipped)) => {
                    tracing::warn!(skipped, "Event stream lagged");
                }
                Err(tokio::sync::broadcast::error::RecvError::Closed) => break,
            },
        }
    }
    Ok(())
}

// ============================================================================
// Output helpers
// ============================================================================

fn describe_event(event: &SessionEvent) -> String {
    match event {
        SessionEvent::Authenticated { subject } => {
            format!("Authenticated as {}", subject.as_deref().unwrap_or("unknown"))
        }
        SessionEvent::Rotated { subject } => format!("Refresh token rotated for {}", subject),
        SessionEvent::IntegrityMismatch {
            access_subject,
            refresh_subject,
        } => format!(
            "Token subjects differ: access={} refresh={}",
            access_subject, refresh_subject
        ),
        SessionEvent::RenewalWarning { attempts, message } => {
            format!("Renewal failed after {} attempts: {}", attempts, message)
        }
        SessionEvent::RevocationFailed { message } => {
            format!("Server-side logout failed: {}", message)
        }
        SessionEvent::Ended { reason } => format!("Session ended ({:?})", reason),
    }
}

fn print_snapshot(snapshot: &SessionSnapshot) {
    let phase = match snapshot.phase {
        SessionPhase::Unauthenticated => "Unauthenticated",
        SessionPhase::Restoring => "Restoring",
        SessionPhase::Authenticated => "Authenticated",
        SessionPhase::Refreshing => "Refreshing",
        SessionPhase::Expired => "Expired",
    };
    println!("Session:          {}", phase);
    println!("Subject:          {}", snapshot.subject().unwrap_or("unknown"));
    if let Some(pair) = &snapshot.pair {
        println!("Access token:     {}", mask_token(&pair.access_token));
        println!("Refresh token:    {}", mask_token(&pair.refresh_token));
    }
    print_claims("Access", snapshot.access_claims.as_ref());
    print_claims("Refresh", snapshot.refresh_claims.as_ref());
    match snapshot.integrity_ok {
        Some(true) => println!("Integrity:        subjects match"),
        Some(false) => println!("Integrity:        MISMATCH"),
        None => println!("Integrity:        unknown"),
    }
    if let Some(warning) = &snapshot.renewal_warning {
        println!("Warning:          {}", warning);
    }
}

fn print_claims(label: &str, claims: Option<&Claims>) {
    match claims {
        Some(c) => println!(
            "{:<8} expires: {} ({})",
            label,
            format_timestamp(c.expires_at),
            c.countdown()
        ),
        None => println!("{:<8} expires: unknown", label),
    }
}

// ============================================================================
// Prompts
// ============================================================================

fn prompt_line(prompt: &str) -> Result<String> {
    print!("{}", prompt);
    io::stdout().flush()?;
    let mut line = String::new();
    io::stdin().read_line(&mut line)?;
    let line = line.trim().to_string();
    if line.is_empty() {
        bail!("No input given");
    }
    Ok(line)
}

fn prompt_secret(prompt: &str) -> Result<String> {
    let secret = rpassword::prompt_password(prompt).context("Failed to read password")?;
    if secret.is_empty() {
        bail!("Password must not be empty");
    }
    Ok(secret)
}
