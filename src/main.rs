//! # vigil
//!
//! Inspect presence nodes in a persisted store, or run a local simulation of
//! agents pinging, stopping, dying and losing their connection.

#![deny(unsafe_code)]

use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use tracing::{info, warn, Level};
use vigil_presence::{alive_w, start_ping, NodeState, Pinger, PresenceConfig};
use vigil_store::{Connection, Coordinator, StoreConfig};
use vigil_telemetry::{init_telemetry, TelemetryConfig};

/// Presence and liveness over a coordination store.
#[derive(Parser, Debug)]
#[command(name = "vigil", about = "Presence and liveness over a coordination store")]
struct Cli {
    /// Emit logs as JSON lines.
    #[arg(long, global = true)]
    json: bool,

    /// Log presence internals at debug level.
    #[arg(short, long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Print how each path is classified in a store file.
    Inspect {
        /// Path to the `SQLite` store file.
        #[arg(long)]
        db: PathBuf,

        /// Node paths to inspect.
        #[arg(required = true)]
        paths: Vec<String>,
    },

    /// Run pingers and watchers against a local store and log transitions.
    Simulate {
        /// Number of pinging agents. The first three are closed, killed and
        /// severed in turn.
        #[arg(long, default_value = "3")]
        agents: usize,

        /// Ping period in milliseconds (defaults to `VIGIL_PING_PERIOD_MS`).
        #[arg(long, value_parser = clap::value_parser!(u64).range(1..))]
        period_ms: Option<u64>,

        /// Session timeout in milliseconds (defaults to
        /// `VIGIL_SESSION_TIMEOUT_MS`).
        #[arg(long, value_parser = clap::value_parser!(u64).range(1..))]
        session_timeout_ms: Option<u64>,

        /// Persist the store to this file instead of keeping it in memory.
        #[arg(long)]
        db: Option<PathBuf>,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let mut telemetry = TelemetryConfig {
        json: cli.json,
        ..TelemetryConfig::default()
    };
    if cli.verbose {
        telemetry
            .module_levels
            .push(("vigil_presence".to_string(), Level::DEBUG));
        telemetry
            .module_levels
            .push(("vigil_store".to_string(), Level::DEBUG));
    }
    let _telemetry = init_telemetry(telemetry).context("Failed to initialize logging")?;

    match cli.command {
        Command::Inspect { db, paths } => inspect(&db, &paths),
        Command::Simulate {
            agents,
            period_ms,
            session_timeout_ms,
            db,
        } => {
            let mut presence = PresenceConfig::from_env();
            if let Some(ms) = period_ms {
                presence.ping_period = Duration::from_millis(ms);
            }
            let store = match session_timeout_ms {
                Some(ms) => StoreConfig::with_session_timeout(Duration::from_millis(ms)),
                None => StoreConfig::from_env(),
            };
            simulate(agents, presence, store, db.as_deref()).await
        }
    }
}

fn inspect(db: &Path, paths: &[String]) -> Result<()> {
    let coordinator = Coordinator::open(db, StoreConfig::from_env())
        .with_context(|| format!("Failed to open store: {}", db.display()))?;

    for path in paths {
        let node = coordinator
            .node(path)
            .with_context(|| format!("Failed to read {path}"))?;
        let state = NodeState::classify(path, node.as_ref().map(|n| n.data.as_slice()));
        println!("{path}\t{state}");
    }
    Ok(())
}

struct Agent {
    path: String,
    conn: Connection,
    pinger: Pinger<Connection>,
}

async fn simulate(
    agents: usize,
    presence: PresenceConfig,
    store: StoreConfig,
    db: Option<&Path>,
) -> Result<()> {
    let period = presence.ping_period;
    let settle = store.session_timeout.saturating_add(period.saturating_mul(4));
    let coordinator = match db {
        Some(path) => Coordinator::open(path, store)
            .with_context(|| format!("Failed to open store: {}", path.display()))?,
        None => Coordinator::in_memory(store).context("Failed to create in-memory store")?,
    };
    info!(
        agents,
        period_ms = millis(period),
        session_timeout_ms = millis(coordinator.config().session_timeout),
        "Starting simulation"
    );

    let observer = coordinator.connect();
    let mut watchers = Vec::with_capacity(agents);
    let mut fleet = Vec::with_capacity(agents);

    for i in 0..agents {
        let path = format!("/agents/agent-{i}");

        let (initial, mut watch) = alive_w(&observer, &path)
            .await
            .with_context(|| format!("Failed to watch {path}"))?;
        info!(path = %path, alive = initial, "Watching");
        watchers.push(tokio::spawn(async move {
            while let Some(alive) = watch.recv().await {
                info!(path = %watch.path(), alive, "Liveness changed");
            }
            info!(path = %watch.path(), "Watch closed");
        }));

        let conn = coordinator.connect();
        let pinger = start_ping(&conn, &path, period)
            .await
            .with_context(|| format!("Failed to start pinger at {path}"))?;
        fleet.push(Agent { path, conn, pinger });
    }

    tokio::time::sleep(period.saturating_mul(3)).await;

    for (i, agent) in fleet.iter().enumerate() {
        match i {
            0 => {
                info!(path = %agent.path, "Closing pinger");
                if let Err(e) = agent.pinger.close().await {
                    warn!(path = %agent.path, error = %e, "Close failed");
                }
            }
            1 => {
                info!(path = %agent.path, "Killing pinger");
                agent.pinger.kill().await;
            }
            2 => {
                info!(path = %agent.path, "Severing connection");
                agent.conn.sever();
            }
            _ => {}
        }
    }

    tokio::time::sleep(settle).await;

    for agent in &fleet {
        let node = coordinator.node(&agent.path)?;
        let state = NodeState::classify(&agent.path, node.as_ref().map(|n| n.data.as_slice()));
        println!("{}\t{}\t{state}", agent.path, agent.pinger.state());
    }

    for agent in &fleet {
        if !agent.conn.state().is_lost() {
            agent.pinger.kill().await;
        }
        agent.conn.close();
    }
    observer.close();
    for watcher in watchers {
        let _ = watcher.await;
    }

    info!("Simulation finished");
    Ok(())
}

fn millis(d: Duration) -> u64 {
    u64::try_from(d.as_millis()).unwrap_or(u64::MAX)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn simulate_rejects_zero_durations() {
        for flag in ["--period-ms", "--session-timeout-ms"] {
            let err = Cli::try_parse_from(["vigil", "simulate", flag, "0"]).unwrap_err();
            assert_eq!(err.kind(), clap::error::ErrorKind::ValueValidation, "{flag}");
        }
    }

    #[test]
    fn simulate_defaults() {
        let cli = Cli::try_parse_from(["vigil", "simulate", "--period-ms", "50"]).unwrap();
        match cli.command {
            Command::Simulate {
                agents,
                period_ms,
                session_timeout_ms,
                db,
            } => {
                assert_eq!(agents, 3);
                assert_eq!(period_ms, Some(50));
                assert_eq!(session_timeout_ms, None);
                assert!(db.is_none());
            }
            other => panic!("parsed {other:?}"),
        }
    }

    #[test]
    fn inspect_requires_a_path() {
        assert!(Cli::try_parse_from(["vigil", "inspect", "--db", "store.db"]).is_err());
    }
}
