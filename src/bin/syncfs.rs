//! syncfs - maintenance CLI for the encrypted block engine.
//!
//! ```bash
//! syncfs --config folder.json init
//! syncfs --config folder.json index docs/report.pdf
//! syncfs --config folder.json disassemble docs/report.pdf --delete
//! syncfs --config folder.json assemble docs/report.pdf
//! syncfs --config folder.json assemble-pending
//! syncfs --config folder.json locate 3f2a...
//! ```
//!
//! Logging goes through env_logger; set `RUST_LOG=debug` to see every
//! candidate the locator tries.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};

use syncfs::{BlockEngine, BlockHash, BlockWorker, EncryptionKey, EngineConfig};

/// Maintenance CLI for a syncfs folder.
#[derive(Parser)]
#[command(name = "syncfs")]
#[command(version)]
#[command(arg_required_else_help = true)]
struct Cli {
    /// Folder configuration file (JSON).
    #[arg(short, long, env = "SYNCFS_CONFIG", default_value = "syncfs.json")]
    config: PathBuf,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Write a default configuration and a fresh encryption key.
    Init,

    /// Record a file in the open tree as a list of encrypted blocks.
    Index { path: String },

    /// Find a block's plaintext in the open tree and verify it.
    Locate { hash: String },

    /// Rebuild a file from the block cache.
    Assemble { path: String },

    /// Rebuild every file not currently marked as assembled.
    AssemblePending,

    /// Push a file's blocks into the block cache.
    Disassemble {
        path: String,

        /// Remove the plaintext file once its blocks are cached.
        #[arg(long)]
        delete: bool,
    },
}

/// Accept paths either relative to the open root or absolute inside it.
fn relative_to_root(root: &Path, path: &str) -> Result<String> {
    let candidate = Path::new(path);
    if !candidate.is_absolute() {
        return Ok(path.to_string());
    }

    let canonical_root = root
        .canonicalize()
        .with_context(|| format!("resolving {}", root.display()))?;
    let relative = candidate
        .strip_prefix(&canonical_root)
        .or_else(|_| candidate.strip_prefix(root))
        .with_context(|| format!("{} is outside {}", path, canonical_root.display()))?;
    match relative.to_str() {
        Some(relative) => Ok(relative.to_string()),
        None => bail!("{} is not valid UTF-8", relative.display()),
    }
}

fn init(config_path: &Path) -> Result<()> {
    if config_path.exists() {
        bail!("{} already exists", config_path.display());
    }
    let config = EngineConfig::default();
    if config.key_file.exists() {
        bail!("{} already exists", config.key_file.display());
    }
    if let Some(parent) = config.key_file.parent() {
        std::fs::create_dir_all(parent)?;
    }
    std::fs::write(&config.key_file, EncryptionKey::generate().to_hex())
        .with_context(|| format!("writing {}", config.key_file.display()))?;
    config.save(config_path)?;
    println!("Wrote {} and {}", config_path.display(), config.key_file.display());
    Ok(())
}

struct Folder {
    config: EngineConfig,
    engine: Arc<BlockEngine>,
    worker: BlockWorker,
}

impl Folder {
    fn open(config_path: &Path) -> Result<Self> {
        let config = EngineConfig::load(config_path)
            .with_context(|| format!("loading {}", config_path.display()))?;
        let engine = Arc::new(config.open_engine()?);
        let worker = BlockWorker::new(Arc::clone(&engine));
        Ok(Self {
            config,
            engine,
            worker,
        })
    }

    fn relative(&self, path: &str) -> Result<String> {
        relative_to_root(self.engine.open_path(), path)
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();
    let cli = Cli::parse();

    match cli.command {
        Command::Init => init(&cli.config)?,
        Command::Index { path } => {
            let folder = Folder::open(&cli.config)?;
            let path = folder.relative(&path)?;
            let block_size = folder.config.block_size;
            let engine = Arc::clone(&folder.engine);
            let indexed = tokio::task::spawn_blocking(move || engine.index_file(&path, block_size))
                .await??;
            println!(
                "{}: {} blocks, {} bytes",
                indexed.record.path,
                indexed.blocks.len(),
                indexed.size()
            );
        }
        Command::Locate { hash } => {
            let folder = Folder::open(&cli.config)?;
            let hash: BlockHash = hash
                .parse()
                .map_err(|e| anyhow::anyhow!("invalid block hash: {}", e))?;
            let verified = folder.worker.locate_block(hash).await?;
            println!("{}: verified, {} bytes", hash, verified.plaintext.len());
        }
        Command::Assemble { path } => {
            let folder = Folder::open(&cli.config)?;
            let path = folder.relative(&path)?;
            folder.worker.assemble_path(path.clone()).await?;
            println!("{}: assembled", path);
        }
        Command::AssemblePending => {
            let folder = Folder::open(&cli.config)?;
            let report = folder.worker.assemble_pending().await?;
            for path in &report.assembled {
                println!("{}: assembled", path);
            }
            for (path, e) in &report.failed {
                eprintln!("{}: {}", path, e);
            }
            if !report.is_complete() {
                bail!("{} files could not be assembled", report.failed.len());
            }
        }
        Command::Disassemble { path, delete } => {
            let folder = Folder::open(&cli.config)?;
            let path = folder.relative(&path)?;
            let report = folder.worker.disassemble(path.clone(), delete).await?;
            println!(
                "{}: {} blocks stored, {} already cached{}",
                path,
                report.stored,
                report.already_cached,
                if report.deleted { ", removed" } else { "" }
            );
        }
    }
    Ok(())
}
