use clap::{Parser, Subcommand};
use ckptsync::config::Config;
use ckptsync::context::{SettingsCache, SyncContext};
use ckptsync::hash::{zero_checkpoint, TreeHashSink};
use ckptsync::hasher::{ContentHasher, LocalSourceFile, SourceFile};
use ckptsync::index::ChunkHashIndex;
use ckptsync::logging::init_logging;
use std::path::PathBuf;

#[derive(Parser)]
#[command(name = "ckptsync", about = "Checkpointed file hashing with a CBT side index")]
struct Cli {
    /// JSON configuration file
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,
    /// Increase log verbosity (-v warn, -vv info, -vvv debug)
    #[arg(short, long, action = clap::ArgAction::Count, global = true)]
    verbose: u8,
    /// Append logs to this file instead of stderr
    #[arg(long, global = true)]
    log_file: Option<PathBuf>,
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Hash a file and print its digest
    Hash {
        file: PathBuf,
        /// Checkpoint index to reuse and update
        #[arg(short, long)]
        index: Option<PathBuf>,
        /// Use change-block-tracking data when available
        #[arg(long)]
        cbt: bool,
        /// Override the checkpoint size, in KiB
        #[arg(long)]
        checkpoint_kib: Option<u64>,
        /// Write the checkpoint hashes (chunkhashes stream) here
        #[arg(long)]
        chunkhashes: Option<PathBuf>,
    },
    /// List the sparse regions of a file
    Extents {
        file: PathBuf,
    },
    /// Inspect a checkpoint index
    Index {
        path: PathBuf,
        /// Show a single record
        #[arg(short, long)]
        record: Option<u64>,
    },
}

fn main() -> Result<(), Box<dyn std::error::Error>> {
    let cli = Cli::parse();
    init_logging(cli.verbose, cli.log_file.as_deref())?;

    let mut config = match &cli.config {
        Some(path) => Config::load(path)?,
        None       => Config::default(),
    };

    match cli.command {

        // ── Hash ─────────────────────────────────────────────────────────────
        Commands::Hash { file, index, cbt, checkpoint_kib, chunkhashes } => {
            if let Some(kib) = checkpoint_kib {
                config.chunk.checkpoint_size = kib * 1024;
            }
            config.validate()?;
            let ctx = SyncContext::new(SettingsCache::fixed(config.clone()));
            let index = match &index {
                Some(path) => Some(ChunkHashIndex::open(path, config.chunk)?),
                None       => None,
            };
            let mut hasher = ContentHasher::from_context(&ctx, index)?;
            let mut sink = TreeHashSink::new(config.chunk);
            hasher.hash_file(&file, &mut sink, cbt)?;
            let stats = hasher.stats();
            let result = sink.finish();

            println!("{}  {}", result.hex(), file.display());
            println!("  Size           {} B", result.size);
            println!("  Checkpoints    {}", result.checkpoints.len());
            println!("  Sparse runs    {}", result.sparse_runs.len());
            println!("  Blocks read    {}", stats.blocks_read);
            println!("  From index     {}", stats.blocks_cached);
            println!("  Sparse blocks  {}", stats.blocks_sparse);
            if let Some(out) = chunkhashes {
                result.write_chunkhashes(std::io::BufWriter::new(std::fs::File::create(&out)?))?;
                println!("  Chunk hashes → {}", out.display());
            }
        }

        // ── Extents ──────────────────────────────────────────────────────────
        Commands::Extents { file } => {
            let src = LocalSourceFile::open(&file)?;
            let mut extents = src.sparse_extents(config.chunk.small_block_size);
            println!("{:>16} {:>16}", "Offset", "Size");
            let mut total = 0i64;
            while let Some(e) = extents.next_extent()? {
                println!("{:>16} {:>16}", e.offset, e.size);
                total += e.size;
            }
            println!("{} of {} B sparse", total, src.size());
        }

        // ── Index ────────────────────────────────────────────────────────────
        Commands::Index { path, record } => {
            let mut idx = ChunkHashIndex::open(&path, config.chunk)?;
            let zero = zero_checkpoint(&config.chunk);
            let records: Vec<u64> = match record {
                Some(n) => vec![n],
                None    => (0..idx.record_count()?).collect(),
            };
            println!("Index: {} ({} records of {} B)", path.display(), idx.record_count()?, config.chunk.record_size());
            for n in records {
                match idx.read_record(n)? {
                    Some(r) if r.hash == *zero => println!("  {:>8}  sector {:>4}  <zero>", n, r.sector_offset),
                    Some(r) => println!("  {:>8}  sector {:>4}  {}", n, r.sector_offset, hex::encode(r.hash.strong)),
                    None if record.is_some() => println!("  {:>8}  <absent>", n),
                    None => {}
                }
            }
        }
    }

    Ok(())
}
