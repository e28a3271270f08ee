//! Shelfsync CLI - Command line interface for library sync.
//!
//! Drives sync sessions between a local object store and a simulated
//! remote, both kept as JSON snapshots on disk.

use anyhow::{Context, Result};
use clap::{CommandFactory, Parser, Subcommand, ValueEnum};
use clap_complete::Shell;
use std::path::{Path, PathBuf};
use tracing::{info, warn, Level};
use tracing_subscriber::FmtSubscriber;

use shelfsync_common::{LibraryIdentifier, ObjectKind};
use shelfsync_storage::{MemoryRemote, MemoryStore, ObjectStore, RemovedKeys};
use shelfsync_sync::{
    Conflict, ConflictResolution, PendingConflict, SessionBackoff, SessionHandle, SessionOutcome,
    SyncConfig, SyncController, SyncEvent,
};

#[derive(Parser)]
#[command(name = "shelfsync")]
#[command(about = "Shelfsync - Library sync and conflict resolution")]
#[command(version)]
struct Cli {
    /// Enable verbose logging.
    #[arg(short, long)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Show libraries in the local store and their pending changes.
    Status {
        /// Local store snapshot.
        #[arg(short, long)]
        store: Option<PathBuf>,
    },

    /// Run a sync session.
    Sync {
        /// Local store snapshot.
        #[arg(short, long)]
        store: Option<PathBuf>,

        /// Simulated remote snapshot.
        #[arg(short, long)]
        remote: Option<PathBuf>,

        /// Library to sync: "my" or "group:<id>". Repeatable. Defaults to
        /// every library in the store.
        #[arg(short, long = "library", value_parser = parse_library)]
        libraries: Vec<LibraryIdentifier>,

        /// Sync configuration as JSON.
        #[arg(short, long)]
        config: Option<PathBuf>,

        /// How conflicts are answered.
        #[arg(long, value_enum, default_value = "skip")]
        on_conflict: ConflictPolicy,
    },

    /// Print the default sync configuration.
    Config,

    /// Generate shell completions.
    Completions {
        #[arg(value_enum)]
        shell: Shell,
    },
}

/// Answers given to conflicts during a session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
enum ConflictPolicy {
    /// Leave conflicts unresolved; affected libraries fail.
    Skip,
    /// Accept the server's state.
    Remote,
    /// Keep local data where possible.
    Local,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    // Setup logging
    let level = if cli.verbose {
        Level::DEBUG
    } else {
        Level::INFO
    };

    let subscriber = FmtSubscriber::builder()
        .with_max_level(level)
        .with_target(false)
        .compact()
        .finish();
    tracing::subscriber::set_global_default(subscriber)?;

    match cli.command {
        Commands::Status { store } => cmd_status(&store_path(store)?).await,

        Commands::Sync {
            store,
            remote,
            libraries,
            config,
            on_conflict,
        } => {
            let store = store_path(store)?;
            let remote = remote_path(remote)?;
            cmd_sync(&store, &remote, libraries, config.as_deref(), on_conflict).await
        }

        Commands::Config => cmd_config(),

        Commands::Completions { shell } => {
            clap_complete::generate(
                shell,
                &mut Cli::command(),
                "shelfsync",
                &mut std::io::stdout(),
            );
            Ok(())
        }
    }
}

fn parse_library(value: &str) -> std::result::Result<LibraryIdentifier, String> {
    if value == "my" {
        return Ok(LibraryIdentifier::MY_LIBRARY);
    }
    if let Some(id) = value.strip_prefix("group:") {
        return id
            .parse()
            .map(LibraryIdentifier::Group)
            .map_err(|_| format!("invalid group id: {}", id));
    }
    LibraryIdentifier::from_api_path(value)
        .ok_or_else(|| format!("expected \"my\" or \"group:<id>\", got {}", value))
}

fn data_dir() -> Result<PathBuf> {
    dirs::data_dir()
        .map(|dir| dir.join("shelfsync"))
        .context("Could not determine data directory")
}

fn store_path(path: Option<PathBuf>) -> Result<PathBuf> {
    match path {
        Some(path) => Ok(path),
        None => Ok(data_dir()?.join("store.json")),
    }
}

fn remote_path(path: Option<PathBuf>) -> Result<PathBuf> {
    match path {
        Some(path) => Ok(path),
        None => Ok(data_dir()?.join("remote.json")),
    }
}

/// Session backoff lives next to the store so it holds across runs.
fn backoff_path(store: &Path) -> PathBuf {
    store.with_extension("backoff.json")
}

async fn load_backoff(path: &Path, config: &SyncConfig) -> Result<SessionBackoff> {
    match tokio::fs::read_to_string(path).await {
        Ok(json) => serde_json::from_str(&json).context("Failed to parse session backoff"),
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => {
            Ok(SessionBackoff::new(config.sync_delay_intervals.clone()))
        }
        Err(err) => Err(err).context("Failed to read session backoff"),
    }
}

async fn load_config(path: Option<&Path>) -> Result<SyncConfig> {
    match path {
        Some(path) => {
            let json = tokio::fs::read_to_string(path)
                .await
                .with_context(|| format!("Failed to read config {}", path.display()))?;
            serde_json::from_str(&json).context("Failed to parse sync config")
        }
        None => Ok(SyncConfig::default()),
    }
}

/// Show libraries and pending changes.
async fn cmd_status(store_path: &Path) -> Result<()> {
    let store = MemoryStore::load(store_path)
        .await
        .context("Failed to load store")?;
    let libraries = store.libraries().await?;

    if libraries.is_empty() {
        println!("No libraries in {}.", store_path.display());
        return Ok(());
    }

    for record in libraries {
        println!("{} \"{}\"", record.id, record.name);
        println!("  Version: {}", record.version);
        println!("  State: {:?}", record.sync_state);
        println!(
            "  Editable: metadata={} files={}",
            record.can_edit_metadata, record.can_edit_files
        );
        for kind in ObjectKind::UPLOAD_ORDER {
            let dirty = store.read_dirty(record.id, kind).await?;
            if dirty.is_empty() {
                continue;
            }
            let deleted = dirty.iter().filter(|object| object.deleted).count();
            println!(
                "  Pending {}: {} changed, {} deleted",
                kind,
                dirty.len() - deleted,
                deleted
            );
        }
    }

    let backoff = load_backoff(&backoff_path(store_path), &SyncConfig::default()).await?;
    if let Some(next) = backoff.next_allowed() {
        println!(
            "\nSync paused after {} failed sessions, next allowed at {}",
            backoff.consecutive_failures(),
            next
        );
    }

    Ok(())
}

/// Run one sync session and persist the results.
async fn cmd_sync(
    store_path: &Path,
    remote_path: &Path,
    libraries: Vec<LibraryIdentifier>,
    config: Option<&Path>,
    policy: ConflictPolicy,
) -> Result<()> {
    let config = load_config(config).await?;
    let store = std::sync::Arc::new(
        MemoryStore::load(store_path)
            .await
            .context("Failed to load store")?,
    );
    let remote = std::sync::Arc::new(
        MemoryRemote::load(remote_path)
            .await
            .context("Failed to load remote")?,
    );
    // The personal library always exists on the server.
    remote.create_library(LibraryIdentifier::MY_LIBRARY, "My Library")?;

    let libraries = if libraries.is_empty() {
        let mut known: Vec<LibraryIdentifier> = store
            .libraries()
            .await?
            .into_iter()
            .map(|record| record.id)
            .collect();
        if !known.contains(&LibraryIdentifier::MY_LIBRARY) {
            known.push(LibraryIdentifier::MY_LIBRARY);
        }
        known
    } else {
        libraries
    };

    let backoff_file = backoff_path(store_path);
    let backoff = load_backoff(&backoff_file, &config).await?;
    let controller =
        SyncController::new(store.clone(), remote.clone(), config).with_backoff(backoff);

    info!("Syncing {} libraries", libraries.len());
    let handle = controller
        .start_session(libraries)
        .await
        .context("Failed to start sync session")?;
    let outcome = drive(handle, policy).await;

    store.save(store_path).await.context("Failed to save store")?;
    remote
        .save(remote_path)
        .await
        .context("Failed to save remote")?;
    let backoff = serde_json::to_string_pretty(&controller.backoff().await)?;
    tokio::fs::write(&backoff_file, backoff)
        .await
        .context("Failed to save session backoff")?;

    match outcome {
        SessionOutcome::AllSynced => {
            println!("All libraries synced.");
            Ok(())
        }
        SessionOutcome::Cancelled => {
            println!("Sync cancelled.");
            Ok(())
        }
        SessionOutcome::PartiallyFailed(failures) => {
            for (library, reason) in &failures {
                println!("  {}: {}", library, reason);
            }
            anyhow::bail!("{} libraries failed to sync", failures.len())
        }
    }
}

/// Answer conflicts until the session ends, cancelling on Ctrl-C.
async fn drive(mut handle: SessionHandle, policy: ConflictPolicy) -> SessionOutcome {
    let cancel = handle.cancellation_token();
    loop {
        while let Some(event) = handle.try_next_event() {
            report(&event);
        }
        tokio::select! {
            pending = handle.next_conflict() => match pending {
                Some(pending) => answer(pending, policy),
                None => break,
            },
            _ = tokio::signal::ctrl_c() => {
                warn!("Interrupted, cancelling session");
                cancel.cancel();
            }
        }
    }
    while let Some(event) = handle.next_event().await {
        report(&event);
    }
    handle.outcome().await
}

fn report(event: &SyncEvent) {
    match event {
        SyncEvent::ObjectsDownloaded {
            library,
            kind,
            count,
        } => println!("{}: downloaded {} {}", library, count, kind),
        SyncEvent::BatchUploaded {
            library,
            kind,
            synced,
            failed,
        } => println!(
            "{}: uploaded {} {} ({} rejected)",
            library, synced, kind, failed
        ),
        SyncEvent::DeletionsUploaded {
            library,
            kind,
            count,
        } => println!("{}: deleted {} {} remotely", library, count, kind),
        SyncEvent::LibrarySkipped(library) => println!("{}: skipped", library),
        SyncEvent::LibraryCompleted(library) => println!("{}: done", library),
        _ => {}
    }
}

fn answer(pending: PendingConflict, policy: ConflictPolicy) {
    println!("Conflict: {}", pending.conflict);
    if let Some(previous) = &pending.previous_error {
        println!("  Previous answer failed: {}", previous);
    }

    match choose(&pending, policy) {
        Some(resolution) => {
            println!("  Answering with {:?}", resolution);
            pending.resolve(resolution);
        }
        None => {
            println!("  Skipped");
            pending.skip();
        }
    }
}

fn choose(pending: &PendingConflict, policy: ConflictPolicy) -> Option<ConflictResolution> {
    // A rejected answer would be rejected again.
    if pending.previous_error.is_some() {
        return None;
    }

    let library = pending.library_id;
    match (policy, &pending.conflict) {
        (ConflictPolicy::Skip, _) => None,

        (ConflictPolicy::Remote, Conflict::GroupRemoved { group_id, .. }) => {
            Some(ConflictResolution::DeleteGroup(*group_id))
        }
        (ConflictPolicy::Local, Conflict::GroupRemoved { group_id, .. }) => {
            Some(ConflictResolution::MarkGroupAsLocalOnly(*group_id))
        }

        (
            ConflictPolicy::Remote,
            Conflict::GroupMetadataWriteDenied { .. } | Conflict::GroupFileWriteDenied { .. },
        ) => Some(ConflictResolution::RevertLibraryToOriginal(library)),
        (
            ConflictPolicy::Local,
            Conflict::GroupMetadataWriteDenied { .. } | Conflict::GroupFileWriteDenied { .. },
        ) => Some(ConflictResolution::MarkChangesAsResolved(library)),

        // Keep the edited items; they are uploaded again as new objects.
        (ConflictPolicy::Local, Conflict::RemovedItemsHaveLocalChanges { .. }) => {
            Some(pending.delete_objects(RemovedKeys::default()))
        }
        (
            _,
            Conflict::ObjectsRemovedRemotely { .. } | Conflict::RemovedItemsHaveLocalChanges { .. },
        ) => pending
            .conflict
            .removed_keys()
            .map(|removed| pending.delete_objects(removed)),
    }
}

/// Print the default configuration.
fn cmd_config() -> Result<()> {
    let json = serde_json::to_string_pretty(&SyncConfig::default())?;
    println!("{}", json);
    Ok(())
}
