use std::path::PathBuf;
use std::sync::Arc;

use canvas_common::telemetry::{self, TelemetryConfig};
use canvas_common::transport::{MemoryChannel, MemoryHub, UserInfo};
use canvas_common::{ActorId, ManualClock, RoomId, SyncConfig};
use canvas_crdt::{ChangeSource, DocumentStore, MemoryStore, Record, ReplicatedDoc, TodoProps};
use canvas_sync::{IndicatorState, LifecycleSignal, Session};
use miette::{IntoDiagnostic, Result};

use clap::{Parser, Subcommand};

#[derive(Parser)]
#[command(version, about = "Canvas - collaborative whiteboard sync core", long_about = None)]
#[command(propagate_version = true)]
struct Cli {
    /// Config file (.json or .toml). CANVAS_* variables override it.
    #[arg(long, global = true, env = "CANVAS_CONFIG")]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run several replicas of one board in-process and check they converge
    Simulate {
        /// Number of replicas
        #[arg(long, default_value_t = 3)]
        replicas: usize,

        /// Edit rounds; every replica edits once per round
        #[arg(long, default_value_t = 10)]
        rounds: usize,

        /// Background (disconnect) one replica every this many rounds
        #[arg(long, default_value_t = 4)]
        drop_every: usize,

        /// Write the converged document snapshot here
        #[arg(long)]
        snapshot: Option<PathBuf>,
    },
    /// List the records in a document snapshot
    Inspect {
        snapshot: PathBuf,
    },
    /// Print the effective configuration as TOML
    Config,
}

fn main() -> Result<()> {
    init_miette();
    telemetry::init(TelemetryConfig::from_env("canvas"));

    let cli = Cli::parse();
    let config = load_config(cli.config.as_ref())?;

    match cli.command {
        Commands::Simulate {
            replicas,
            rounds,
            drop_every,
            snapshot,
        } => simulate(config, replicas.max(1), rounds, drop_every, snapshot),
        Commands::Inspect { snapshot } => inspect(snapshot),
        Commands::Config => {
            println!("{}", toml::to_string_pretty(&config).into_diagnostic()?);
            Ok(())
        }
    }
}

fn load_config(path: Option<&PathBuf>) -> Result<SyncConfig> {
    let config = match path {
        Some(path) => SyncConfig::load(path)?.with_env_overrides()?,
        None => SyncConfig::from_env()?,
    };
    Ok(config)
}

type Replica = Session<MemoryChannel, MemoryStore>;

fn settle(replicas: &mut [Replica]) -> Result<()> {
    for _ in 0..64 {
        let handled: usize = replicas.iter_mut().map(|r| r.pump()).sum();
        if handled == 0 {
            return Ok(());
        }
    }
    Err(miette::miette!("replicas kept exchanging messages"))
}

fn simulate(
    config: SyncConfig,
    count: usize,
    rounds: usize,
    drop_every: usize,
    snapshot: Option<PathBuf>,
) -> Result<()> {
    let hub = MemoryHub::new();
    let room = RoomId::new("simulation");
    let clock = ManualClock::new();

    let mut replicas = Vec::with_capacity(count);
    for i in 0..count {
        let name = format!("user-{i}");
        replicas.push(Session::connect(
            &hub,
            &room,
            "simulation",
            MemoryStore::new(),
            UserInfo::new(name.as_str(), name.as_str()),
            config.clone(),
            Arc::new(clock.clone()),
        )?);
    }
    settle(&mut replicas)?;
    tracing::info!(replicas = count, rounds, "simulation started");

    let mut offline: Option<usize> = None;
    for round in 0..rounds {
        if drop_every > 0 && round > 0 && round % drop_every == 0 {
            if let Some(i) = offline.take() {
                replicas[i].on_lifecycle(LifecycleSignal::Resumed);
            }
            let i = round / drop_every % count;
            replicas[i].channel().drop_connection();
            tracing::info!(replica = i, round, "replica backgrounded");
            offline = Some(i);
        }

        for (i, replica) in replicas.iter().enumerate() {
            let edit = match (round + i) % 3 {
                0 => Record::note(format!("note-{i}-{round}"), format!("round {round}")),
                1 => Record::todo(
                    format!("todo-{i}-{round}"),
                    TodoProps::titled(format!("Task from {i}")),
                ),
                // everyone fights over the same card
                _ => Record::todo("shared", TodoProps::titled(format!("{i} was here"))),
            }
            .at((i * 40) as f64, (round * 40) as f64);
            replica
                .store()
                .put(vec![edit], ChangeSource::User)
                .into_diagnostic()?;
        }
        clock.advance_millis(config.undo_capture_ms + 1);
        settle(&mut replicas)?;
    }

    if let Some(i) = offline.take() {
        replicas[i].on_lifecycle(LifecycleSignal::Foregrounded);
    }
    settle(&mut replicas)?;

    // one last undo so the run exercises history too
    replicas[0].undo()?;
    settle(&mut replicas)?;
    clock.advance(config.reconnected_banner());
    for replica in &mut replicas {
        replica.tick();
    }

    let reference = replicas[0].doc().materialize().records;
    for (i, replica) in replicas.iter().enumerate() {
        let records = replica.doc().materialize().records;
        if records != reference {
            return Err(miette::miette!("replica {i} diverged from replica 0"));
        }
        if replica.indicator() != IndicatorState::Hidden {
            tracing::warn!(replica = i, state = ?replica.indicator(), "banner still showing");
        }
    }
    println!(
        "{count} replicas converged on {} records after {rounds} rounds",
        reference.len()
    );

    if let Some(path) = snapshot {
        let bytes = replicas[0].doc().export_snapshot()?;
        std::fs::write(&path, &bytes).into_diagnostic()?;
        println!("snapshot written to {} ({} bytes)", path.display(), bytes.len());
    }

    for replica in &mut replicas {
        replica.disconnect();
    }
    Ok(())
}

fn inspect(path: PathBuf) -> Result<()> {
    let bytes = std::fs::read(&path).into_diagnostic()?;
    let doc = ReplicatedDoc::from_snapshot(&bytes, ActorId::random())?;
    let materialized = doc.materialize();
    for record in materialized.records.values() {
        match record.as_todo() {
            Some(todo) => println!(
                "{:<20} {:<5} ({:>6.0}, {:>6.0}) {:?}{}",
                record.id,
                record.type_name(),
                record.x,
                record.y,
                todo.title,
                if todo.completed { " [done]" } else { "" }
            ),
            None => println!(
                "{:<20} {:<5} ({:>6.0}, {:>6.0})",
                record.id,
                record.type_name(),
                record.x,
                record.y
            ),
        }
    }
    for (id, e) in &materialized.rejected {
        eprintln!("{id}: invalid record: {e}");
    }
    println!("{} records", materialized.records.len());
    Ok(())
}

fn init_miette() {
    // a hook may already be installed when embedded
    let _ = miette::set_hook(Box::new(|_| {
        Box::new(
            miette::MietteHandlerOpts::new()
                .terminal_links(true)
                .with_cause_chain()
                .color(true)
                .context_lines(5)
                .tab_width(2)
                .break_words(true)
                .build(),
        )
    }));
    miette::set_panic_hook();
}
