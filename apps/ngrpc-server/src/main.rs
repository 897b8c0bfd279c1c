use std::collections::HashSet;
use std::path::PathBuf;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use ngrpc_bootstrap::{LoggingConfig, init_logging, wait_for_shutdown};
use ngrpc_config::{Config, dial_target, load_config, load_config_from};
use ngrpc_host::{Host, HostEvent, StopOutcome, StopReply, get_socket_path, request_stop};
use tokio::sync::broadcast::error::RecvError;

/// How long joined apps get to leave after being told to stop.
const STOP_GRACE_PERIOD: Duration = Duration::from_secs(10);

/// ngrpc host - supervises ngrpc apps over a local control socket
#[derive(Parser)]
#[command(name = "ngrpc-server")]
#[command(about = "ngrpc host - supervises ngrpc apps over a local control socket")]
#[command(version)]
struct Cli {
    /// Directory holding ngrpc.json (defaults to the current directory)
    #[arg(short, long)]
    config_dir: Option<PathBuf>,

    /// Control socket path (defaults to ~/.ngrpc/ngrpc.sock)
    #[arg(short, long)]
    socket: Option<PathBuf>,

    /// Log verbosity level (-v info, -vv debug, -vvv trace)
    #[arg(short, long, action = clap::ArgAction::Count)]
    verbose: u8,

    /// Emit logs as JSON lines
    #[arg(long)]
    json_logs: bool,

    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the host until interrupted (default)
    Run,
    /// Resolve every app's address and credentials, then exit
    Check,
    /// Ask the running host to stop one app, or every joined app
    Stop {
        /// App to stop (all joined apps when omitted)
        app: Option<String>,

        /// Seconds to wait for the apps to answer
        #[arg(long, default_value_t = 30)]
        timeout: u64,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    init_logging(&LoggingConfig::from_verbosity(cli.verbose, cli.json_logs))?;

    let load = || match &cli.config_dir {
        Some(dir) => load_config_from(dir),
        None => load_config(),
    };

    match cli.command.unwrap_or(Commands::Run) {
        Commands::Check => check(&load()?),
        Commands::Run => run(load()?, cli.socket, cli.verbose > 0).await,
        Commands::Stop { app, timeout } => {
            stop(cli.socket, app.as_deref(), Duration::from_secs(timeout)).await
        }
    }
}

fn check(config: &Config) -> Result<()> {
    let mut failed = 0usize;
    for app in &config.apps {
        match dial_target(app) {
            Ok(target) => println!(
                "{}: {} ({})",
                app.name,
                target.address,
                target.credentials.mode()
            ),
            Err(e) => {
                failed += 1;
                eprintln!("{}: {e}", app.name);
            }
        }
    }

    if failed > 0 {
        anyhow::bail!("{failed} of {} apps are misconfigured", config.apps.len());
    }
    Ok(())
}

async fn run(config: Config, socket: Option<PathBuf>, verbose: bool) -> Result<()> {
    let host = match socket {
        Some(path) => Host::with_socket_path(config, path),
        None => Host::new(config)?,
    };

    host.start(verbose)
        .await
        .context("failed to start ngrpc host")?;
    tracing::info!(
        served_apps = host.config().served_apps().count(),
        "waiting for apps to join"
    );

    wait_for_shutdown().await?;

    stop_guests(&host).await;
    host.stop().await;
    Ok(())
}

/// Tell every joined app to stop and wait for them to leave.
async fn stop_guests(host: &Host) {
    let mut events = host.subscribe();
    let dispatched = host.dispatch_all();
    if dispatched.is_empty() {
        return;
    }

    for (name, id) in &dispatched {
        tracing::info!(app = %name, correlation_id = %id, "stopping app");
    }
    let mut pending: HashSet<String> = dispatched.into_iter().map(|(name, _)| name).collect();

    let drained = tokio::time::timeout(STOP_GRACE_PERIOD, async {
        while !pending.is_empty() {
            match events.recv().await {
                Ok(HostEvent::Left { name, .. } | HostEvent::Disconnected { name }) => {
                    pending.remove(&name);
                }
                Ok(HostEvent::Joined { .. }) => {}
                Err(RecvError::Lagged(_)) => pending.retain(|name| host.is_connected(name)),
                Err(RecvError::Closed) => break,
            }
        }
    })
    .await;

    if drained.is_err() {
        tracing::warn!(remaining = ?pending, "apps did not stop in time");
    }
}

async fn stop(socket: Option<PathBuf>, app: Option<&str>, wait: Duration) -> Result<()> {
    let path = match socket {
        Some(path) => path,
        None => get_socket_path()?,
    };

    let replies = tokio::time::timeout(wait, request_stop(&path, app))
        .await
        .map_err(|_| anyhow::anyhow!("apps did not answer within {}s", wait.as_secs()))?
        .context("failed to reach ngrpc host")?;

    if replies.is_empty() {
        println!("no apps are joined");
        return Ok(());
    }

    let mut missing = 0usize;
    for reply in &replies {
        if reply.outcome == StopOutcome::NotConnected {
            missing += 1;
            eprintln!("{}", describe(reply));
        } else {
            println!("{}", describe(reply));
        }
    }

    if missing > 0 {
        anyhow::bail!("{missing} of {} apps are not connected", replies.len());
    }
    Ok(())
}

fn describe(reply: &StopReply) -> String {
    let id = reply.correlation_id.as_deref().unwrap_or("-");
    match reply.outcome {
        StopOutcome::Left if reply.reason.is_empty() => format!("{}: left [{id}]", reply.app),
        StopOutcome::Left => format!("{}: left ({}) [{id}]", reply.app, reply.reason),
        StopOutcome::Disconnected => format!("{}: disconnected [{id}]", reply.app),
        StopOutcome::NotConnected => format!("{}: not connected", reply.app),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn reply(outcome: StopOutcome, reason: &str) -> StopReply {
        StopReply {
            app: "user-server".to_owned(),
            outcome,
            reason: reason.to_owned(),
            correlation_id: (outcome != StopOutcome::NotConnected).then(|| "c1".to_owned()),
        }
    }

    #[test]
    fn describe_stop_replies() {
        assert_eq!(
            describe(&reply(StopOutcome::Left, "stopped")),
            "user-server: left (stopped) [c1]"
        );
        assert_eq!(
            describe(&reply(StopOutcome::Left, "")),
            "user-server: left [c1]"
        );
        assert_eq!(
            describe(&reply(StopOutcome::Disconnected, "")),
            "user-server: disconnected [c1]"
        );
        assert_eq!(
            describe(&reply(StopOutcome::NotConnected, "")),
            "user-server: not connected"
        );
    }
}
