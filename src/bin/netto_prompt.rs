//! Netto Prompt
//!
//! Terminal client for the filter's UI socket. Without a subcommand it
//! registers for permission requests and asks about each one on stdin;
//! the subcommands query or change stored policies and exit.

use std::collections::VecDeque;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use log::{debug, info, warn};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader, Lines, Stdin};
use tokio::net::unix::OwnedWriteHalf;
use tokio::net::UnixStream;

use netto::classifier::AppCategory;
use netto::flow::Direction;
use netto::protocol::{encode_line, DaemonMessage, Decision, PermissionRequest, UiMessage};
use netto::{ConfigManager, Verdict};

const RECONNECT_DELAY: Duration = Duration::from_secs(2);
const REPLY_TIMEOUT: Duration = Duration::from_secs(5);

#[derive(Parser)]
#[command(
    name = "netto-prompt",
    version,
    about = "Answer Netto permission requests and manage policies"
)]
struct Cli {
    /// UI socket of the filter daemon (defaults to the configured path)
    #[arg(long)]
    socket: Option<PathBuf>,

    #[command(subcommand)]
    command: Option<Command>,
}

#[derive(Subcommand)]
enum Command {
    /// Answer permission requests as they arrive (default)
    Watch,
    /// List stored policies
    Policies,
    /// Show recent connection events
    Events,
    /// Always allow an application
    Allow { app_id: String },
    /// Always deny an application
    Deny { app_id: String },
    /// Forget the stored policy for an application
    Remove { app_id: String },
    /// Forget every stored policy
    Reset,
}

enum SessionEnd {
    Quit,
    Disconnected,
}

#[tokio::main]
async fn main() -> Result<()> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let cli = Cli::parse();
    let socket = match cli.socket {
        Some(path) => path,
        None => ConfigManager::new().get().ui_socket,
    };

    match cli.command.unwrap_or(Command::Watch) {
        Command::Watch => watch(&socket).await,
        Command::Policies => {
            let reply = query(&socket, &UiMessage::ListPolicies, |m| {
                matches!(m, DaemonMessage::PoliciesList { .. })
            })
            .await?;
            if let DaemonMessage::PoliciesList { policies } = reply {
                if policies.is_empty() {
                    println!("No stored policies");
                }
                for policy in policies {
                    println!(
                        "{:<6} {:<48} {}",
                        Verdict::from_allowed(policy.allowed),
                        policy.app_id,
                        policy.updated_at.format("%Y-%m-%d %H:%M:%S")
                    );
                }
            }
            Ok(())
        }
        Command::Events => {
            let reply = query(&socket, &UiMessage::ListEvents, |m| {
                matches!(m, DaemonMessage::EventsList { .. })
            })
            .await?;
            if let DaemonMessage::EventsList { events } = reply {
                for event in events {
                    println!(
                        "{} {:<6} {:<40} {}:{} {}{}",
                        event.timestamp.format("%H:%M:%S"),
                        Verdict::from_allowed(event.allowed),
                        display_app(&event.app_id),
                        event.remote_address,
                        event.remote_port,
                        event.protocol,
                        if event.auto_resolved { " (auto)" } else { "" }
                    );
                }
            }
            Ok(())
        }
        Command::Allow { app_id } => set_policy(&socket, app_id, true).await,
        Command::Deny { app_id } => set_policy(&socket, app_id, false).await,
        Command::Remove { app_id } => {
            let msg = UiMessage::RemovePolicy { app_id: app_id.clone() };
            match query(&socket, &msg, |m| is_update_for(m, &app_id)).await? {
                DaemonMessage::PolicyUpdated { success: true, .. } => {
                    println!("Removed policy for {}", app_id)
                }
                _ => println!("No stored policy for {}", app_id),
            }
            Ok(())
        }
        Command::Reset => {
            query(&socket, &UiMessage::ResetPolicies, |m| {
                matches!(m, DaemonMessage::PoliciesList { .. })
            })
            .await?;
            println!("All policies removed");
            Ok(())
        }
    }
}

async fn set_policy(socket: &Path, app_id: String, allowed: bool) -> Result<()> {
    let msg = UiMessage::SetPolicy { app_id: app_id.clone(), allowed };
    match query(socket, &msg, |m| is_update_for(m, &app_id)).await? {
        DaemonMessage::PolicyUpdated { success: true, .. } => {
            println!("{} {}", Verdict::from_allowed(allowed), app_id);
            Ok(())
        }
        _ => bail!("the filter did not store the policy for {:?}", app_id),
    }
}

fn is_update_for(msg: &DaemonMessage, app_id: &str) -> bool {
    matches!(msg, DaemonMessage::PolicyUpdated { app_id: id, .. } if id == app_id)
}

/// Sends one message and waits for the first reply `wanted` accepts,
/// skipping stats and anything else the daemon pushes meanwhile.
async fn query(
    socket: &Path,
    msg: &UiMessage,
    wanted: impl Fn(&DaemonMessage) -> bool,
) -> Result<DaemonMessage> {
    let stream = UnixStream::connect(socket)
        .await
        .with_context(|| format!("connecting to {}", socket.display()))?;
    let (read_half, mut write_half) = stream.into_split();
    write_half.write_all(encode_line(msg)?.as_bytes()).await?;

    let mut lines = BufReader::new(read_half).lines();
    let deadline = tokio::time::Instant::now() + REPLY_TIMEOUT;
    loop {
        let line = match tokio::time::timeout_at(deadline, lines.next_line()).await {
            Ok(line) => line?,
            Err(_) => bail!("no reply from the filter within {}s", REPLY_TIMEOUT.as_secs()),
        };
        let Some(line) = line else {
            bail!("the filter closed the connection");
        };
        match serde_json::from_str::<DaemonMessage>(&line) {
            Ok(reply) if wanted(&reply) => return Ok(reply),
            Ok(_) => continue,
            Err(e) => debug!("Skipping unreadable line: {}", e),
        }
    }
}

async fn watch(socket: &Path) -> Result<()> {
    let mut input = BufReader::new(tokio::io::stdin()).lines();
    loop {
        match UnixStream::connect(socket).await {
            Ok(stream) => {
                info!("Connected to {}", socket.display());
                match session(stream, &mut input).await? {
                    SessionEnd::Quit => return Ok(()),
                    SessionEnd::Disconnected => {
                        warn!("Lost connection to the filter, reconnecting")
                    }
                }
            }
            Err(e) => debug!("Filter not reachable at {}: {}", socket.display(), e),
        }
        tokio::time::sleep(RECONNECT_DELAY).await;
    }
}

async fn session(stream: UnixStream, input: &mut Lines<BufReader<Stdin>>) -> Result<SessionEnd> {
    let (read_half, mut write_half) = stream.into_split();
    if send(&mut write_half, &UiMessage::Register).await.is_err() {
        return Ok(SessionEnd::Disconnected);
    }
    println!("Waiting for permission requests (a/A allow once/always, d/D deny once/always)");

    let mut lines = BufReader::new(read_half).lines();
    let mut queue: VecDeque<PermissionRequest> = VecDeque::new();

    loop {
        tokio::select! {
            incoming = lines.next_line() => {
                let line = match incoming {
                    Ok(Some(line)) => line,
                    Ok(None) | Err(_) => return Ok(SessionEnd::Disconnected),
                };
                match serde_json::from_str::<DaemonMessage>(&line) {
                    Ok(DaemonMessage::PermissionRequest(request)) => {
                        if queue.iter().any(|r| r.correlation_id == request.correlation_id) {
                            continue;
                        }
                        queue.push_back(request);
                        if queue.len() == 1 {
                            show_prompt(&queue[0], 0);
                        }
                    }
                    Ok(DaemonMessage::RequestCancelled { correlation_id }) => {
                        let pos = queue.iter().position(|r| r.correlation_id == correlation_id);
                        let Some(pos) = pos else { continue };
                        if let Some(request) = queue.remove(pos) {
                            if pos == 0 {
                                let app = display_app(&request.app_id);
                                println!("  -> request for {} was withdrawn", app);
                                if let Some(next) = queue.front() {
                                    show_prompt(next, queue.len() - 1);
                                }
                            }
                        }
                    }
                    Ok(DaemonMessage::StatsUpdate { stats }) => debug!(
                        "flows={} allowed={} blocked={} pending={}",
                        stats.total_flows,
                        stats.allowed_flows,
                        stats.blocked_flows,
                        stats.pending_flows
                    ),
                    Ok(other) => debug!("Ignoring {:?}", other),
                    Err(e) => warn!("Malformed message from the filter: {}", e),
                }
            }
            typed = input.next_line() => {
                let Some(typed) = typed? else {
                    return Ok(SessionEnd::Quit);
                };
                let typed = typed.trim();
                let Some(request) = queue.front() else {
                    if !typed.is_empty() {
                        println!("Nothing to answer");
                    }
                    continue;
                };
                let Some((allowed, remember)) = parse_answer(typed) else {
                    println!("Answer with a, A, d or D");
                    continue;
                };
                let correlation_id = request.correlation_id;
                let decision = Decision { correlation_id, allowed, remember };
                if send(&mut write_half, &UiMessage::Decision(decision)).await.is_err() {
                    return Ok(SessionEnd::Disconnected);
                }
                queue.pop_front();
                if let Some(next) = queue.front() {
                    show_prompt(next, queue.len() - 1);
                }
            }
        }
    }
}

async fn send(writer: &mut OwnedWriteHalf, msg: &UiMessage) -> Result<()> {
    writer.write_all(encode_line(msg)?.as_bytes()).await?;
    Ok(())
}

/// `a`/`d` answer once, `A`/`D` also store the answer as the app's policy.
fn parse_answer(typed: &str) -> Option<(bool, bool)> {
    match typed {
        "a" => Some((true, false)),
        "A" => Some((true, true)),
        "d" => Some((false, false)),
        "D" => Some((false, true)),
        _ => None,
    }
}

fn display_app(app_id: &str) -> &str {
    if app_id.is_empty() {
        "<unknown app>"
    } else {
        app_id
    }
}

fn show_prompt(request: &PermissionRequest, waiting: usize) {
    let tag = match request.app_category {
        AppCategory::System => " [system]",
        AppCategory::Proxy => " [vpn/proxy]",
        AppCategory::Unknown => "",
    };
    let arrow = match request.direction {
        Direction::Outbound => "->",
        Direction::Inbound => "<-",
    };
    println!();
    println!(
        "{}{} {} {}:{} {}",
        display_app(&request.app_id),
        tag,
        arrow,
        request.remote_address,
        request.remote_port,
        request.protocol
    );
    if waiting > 0 {
        println!("  ({} more waiting)", waiting);
    }
    println!("  allow? [a/A/d/D] ");
}
