//! rpmstore CLI - Command line interface for RPM blob storage.
//!
//! Every command except `backends` operates on the backend described by
//! `--storage`, a JSON config such as
//! `{"name": "filesystem", "base_dir": "/var/rpms"}`.

use anyhow::{Context, Result};
use clap::{CommandFactory, FromArgMatches, Parser, Subcommand};
use futures::StreamExt;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tracing::{info, Level};
use tracing_subscriber::FmtSubscriber;

use rpmstore_storage::{
    default_registry, Storage, StorageHandle, StorageIndex, StorageKey, StorageRegistry,
};

const READ_CHUNK: usize = 64 * 1024;

#[derive(Parser)]
#[command(name = "rpmstore")]
#[command(about = "rpmstore - Pluggable blob storage for RPM artifacts")]
#[command(version)]
struct Cli {
    /// Enable verbose logging.
    #[arg(short, long, global = true)]
    verbose: bool,

    /// Storage backend config as JSON.
    #[arg(short, long, global = true)]
    storage: Option<String>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Store a file and print its handle.
    Put {
        /// File to store.
        file: PathBuf,

        /// Key to store under (default: a fresh random key).
        #[arg(short, long)]
        key: Option<String>,

        /// Index file to record the file name and handle in.
        #[arg(short, long)]
        index: Option<PathBuf>,
    },

    /// Write a stored blob to a file or stdout.
    Get {
        /// Handle printed by `put`.
        handle: String,

        /// Destination file (default: stdout).
        #[arg(short, long)]
        output: Option<PathBuf>,
    },

    /// List handles whose key starts with a prefix.
    List {
        /// Key prefix (default: everything).
        #[arg(default_value = "")]
        prefix: String,
    },

    /// Remove a stored blob.
    #[command(alias = "rm")]
    Remove {
        /// Handle to remove.
        handle: String,

        /// Do not fail if the blob is already gone.
        #[arg(short, long)]
        force: bool,
    },

    /// Check that every blob referenced by an index exists.
    Verify {
        /// Index file to check.
        index: PathBuf,
    },

    /// Show available storage backends.
    Backends,
}

#[tokio::main]
async fn main() -> Result<()> {
    let registry = default_registry();
    let matches = Cli::command()
        .mut_arg("storage", |arg| arg.long_help(registry.describe()))
        .get_matches();
    let cli = Cli::from_arg_matches(&matches)?;

    // Setup logging; stdout is reserved for blob data.
    let level = if cli.verbose {
        Level::DEBUG
    } else {
        Level::INFO
    };

    let subscriber = FmtSubscriber::builder()
        .with_max_level(level)
        .with_target(false)
        .with_writer(std::io::stderr)
        .compact()
        .finish();
    tracing::subscriber::set_global_default(subscriber)?;

    let config = cli.storage.as_deref();

    match cli.command {
        Commands::Put { file, key, index } => {
            let storage = open_storage(&registry, config)?;
            let handle = cmd_put(storage.as_ref(), &file, key.as_deref()).await?;
            if let Some(index) = index {
                record_in_index(&index, &file, &handle).await?;
            }
            println!("{}", handle);
            Ok(())
        }

        Commands::Get { handle, output } => {
            let storage = open_storage(&registry, config)?;
            cmd_get(storage.as_ref(), &handle, output.as_deref()).await
        }

        Commands::List { prefix } => {
            let storage = open_storage(&registry, config)?;
            for handle in cmd_list(storage.as_ref(), &prefix).await? {
                println!("{}", handle);
            }
            Ok(())
        }

        Commands::Remove { handle, force } => {
            let storage = open_storage(&registry, config)?;
            cmd_remove(storage.as_ref(), &handle, force).await
        }

        Commands::Verify { index } => {
            let storage = open_storage(&registry, config)?;
            cmd_verify(storage.as_ref(), &index).await
        }

        Commands::Backends => cmd_backends(&registry),
    }
}

/// Build the backend selected by `--storage`.
fn open_storage(registry: &StorageRegistry, config: Option<&str>) -> Result<Arc<dyn Storage>> {
    let config = config.context("--storage is required for this command")?;
    registry
        .from_json(config)
        .context("Failed to open storage backend")
}

fn cmd_backends(registry: &StorageRegistry) -> Result<()> {
    for name in registry.backends() {
        println!("{}", name);
    }
    Ok(())
}

/// Stream a file into storage.
async fn cmd_put(storage: &dyn Storage, file: &Path, key: Option<&str>) -> Result<StorageHandle> {
    let key = match key {
        Some(key) => StorageKey::parse(key).context("Invalid key")?,
        None => StorageKey::generate(),
    };
    info!("Storing {} as {}", file.display(), key);

    let mut source = tokio::fs::File::open(file)
        .await
        .with_context(|| format!("Failed to open {}", file.display()))?;

    // A failure before commit drops the writer, discarding the partial blob.
    let mut writer = storage.writer(&key).await.context("Failed to start write")?;
    let mut buf = vec![0u8; READ_CHUNK];
    loop {
        let n = source
            .read(&mut buf)
            .await
            .context("Failed to read source file")?;
        if n == 0 {
            break;
        }
        writer.write(&buf[..n]).await.context("Failed to write blob")?;
    }

    let written = writer.bytes_written();
    let handle = writer.commit().await.context("Failed to commit blob")?;
    info!("Stored {} bytes", written);
    Ok(handle)
}

/// Add `file`'s name to the index at `index_path`, creating it if needed.
async fn record_in_index(index_path: &Path, file: &Path, handle: &StorageHandle) -> Result<()> {
    let mut index = load_index(index_path, true).await?;

    let name = file
        .file_name()
        .and_then(|n| n.to_str())
        .context("Source file name is not valid UTF-8")?;
    if let Some(previous) = index.insert(name, handle.clone()) {
        info!("Replacing index entry {} (was {})", name, previous);
    }

    tokio::fs::write(index_path, index.to_json()?)
        .await
        .with_context(|| format!("Failed to write index {}", index_path.display()))?;
    Ok(())
}

async fn load_index(path: &Path, allow_missing: bool) -> Result<StorageIndex> {
    match tokio::fs::read_to_string(path).await {
        Ok(json) => StorageIndex::from_json(&json)
            .with_context(|| format!("Malformed index {}", path.display())),
        Err(e) if allow_missing && e.kind() == std::io::ErrorKind::NotFound => Ok(StorageIndex::new()),
        Err(e) => Err(e).with_context(|| format!("Failed to read index {}", path.display())),
    }
}

/// Copy a blob to `output`, or stdout.
async fn cmd_get(storage: &dyn Storage, handle: &str, output: Option<&Path>) -> Result<()> {
    let handle = StorageHandle::parse(handle).context("Invalid handle")?;
    let mut stream = storage
        .get_stream(&handle)
        .await
        .context("Failed to read blob")?;

    let mut out: Box<dyn tokio::io::AsyncWrite + Unpin + Send> = match output {
        Some(path) => Box::new(
            tokio::fs::File::create(path)
                .await
                .with_context(|| format!("Failed to create {}", path.display()))?,
        ),
        None => Box::new(tokio::io::stdout()),
    };

    while let Some(chunk) = stream.next().await {
        let chunk = chunk.context("Failed to read blob")?;
        out.write_all(&chunk).await.context("Failed to write output")?;
    }
    out.flush().await?;
    Ok(())
}

async fn cmd_list(storage: &dyn Storage, prefix: &str) -> Result<Vec<StorageHandle>> {
    let mut handles = Vec::new();
    let mut stream = storage.list(prefix);
    while let Some(handle) = stream.next().await {
        handles.push(handle.context("Failed to list storage")?);
    }
    Ok(handles)
}

async fn cmd_remove(storage: &dyn Storage, handle: &str, force: bool) -> Result<()> {
    let handle = StorageHandle::parse(handle).context("Invalid handle")?;
    if force {
        if !storage.delete_if_exists(&handle).await? {
            info!("{} was already absent", handle);
        }
    } else {
        storage
            .delete(&handle)
            .await
            .with_context(|| format!("Failed to remove {}", handle))?;
    }
    Ok(())
}

async fn cmd_verify(storage: &dyn Storage, index_path: &Path) -> Result<()> {
    let index = load_index(index_path, false).await?;
    let missing = index.missing(storage).await?;

    if missing.is_empty() {
        println!("All {} indexed blobs present.", index.len());
        return Ok(());
    }
    for path in &missing {
        println!("missing: {}", path);
    }
    anyhow::bail!("{} of {} indexed blobs are missing", missing.len(), index.len())
}
