use clap::{Parser, Subcommand};
use hexcell::archive::{Cell, DecodeOptions, EncodeOptions};
use hexcell::decoder::DEFAULT_QUEUE_CAPACITY;
use std::path::PathBuf;
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "hexcell", about = "Pack and unpack directory trees as hexcell cells")]
struct Cli {
    /// Log every entry as it is packed or unpacked
    #[arg(short, long, global = true)]
    verbose: bool,
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Pack a directory tree (or a single file) into a cell
    Pack {
        input: PathBuf,
        #[arg(short, long)]
        output: PathBuf,
        /// Deflate level, 0-9
        #[arg(short, long, default_value = "9")]
        level: u32,
    },
    /// Unpack a cell
    Unpack {
        input: PathBuf,
        #[arg(short = 'C', long, default_value = ".")]
        output_dir: PathBuf,
        /// Byte offset of the cell inside the input file
        #[arg(long, default_value = "0")]
        offset: u64,
        /// Number of materializer threads
        #[arg(short, long, default_value = "1")]
        jobs: usize,
        /// Entries buffered between the decode thread and the materializers
        #[arg(long, default_value_t = DEFAULT_QUEUE_CAPACITY)]
        queue: usize,
        /// Restore recorded owners (default when running as root)
        #[arg(long, conflicts_with = "no_same_owner")]
        same_owner: bool,
        /// Never restore recorded owners
        #[arg(long)]
        no_same_owner: bool,
    },
    /// List cell contents
    List {
        input: PathBuf,
        #[arg(long, default_value = "0")]
        offset: u64,
        /// Print one JSON object per entry
        #[arg(long)]
        json: bool,
    },
    /// Show the info block
    Info {
        input: PathBuf,
        #[arg(long, default_value = "0")]
        offset: u64,
        #[arg(long)]
        json: bool,
    },
}

fn main() -> Result<(), Box<dyn std::error::Error>> {
    let cli = Cli::parse();
    setup_logging(cli.verbose);

    match cli.command {

        // ── Pack ─────────────────────────────────────────────────────────────
        Commands::Pack { input, output, level } => {
            let info = Cell::pack(&input, &output, EncodeOptions { level })?;
            println!("Created: {} ({} entries)", output.display(), info.entry_count);
        }

        // ── Unpack ───────────────────────────────────────────────────────────
        Commands::Unpack { input, output_dir, offset, jobs, queue, same_owner, no_same_owner } => {
            let mut opts = DecodeOptions { queue_capacity: queue, materializers: jobs, ..DecodeOptions::default() };
            if same_owner { opts.preserve_ownership = true; }
            if no_same_owner { opts.preserve_ownership = false; }
            let report = Cell::open_at(&input, offset)?.extract_with(&output_dir, opts)?;
            println!("Unpacked {} entries to: {}", report.entries_materialized, output_dir.display());
        }

        // ── List ─────────────────────────────────────────────────────────────
        Commands::List { input, offset, json } => {
            let cell = Cell::open_at(&input, offset)?;
            let entries = cell.list()?;
            if json {
                for entry in &entries {
                    println!("{}", serde_json::to_string(entry)?);
                }
                return Ok(());
            }
            println!("Cell: {}", input.display());
            println!("{:<10} {:>6} {:>11} {:>12} {:>12}  Path",
                     "Kind", "Mode", "Owner", "Size", "In cell");
            for e in entries {
                let owner = format!("{}:{}", e.uid, e.gid);
                let path = match &e.link_target {
                    Some(target) => format!("{} -> {}", e.path, target),
                    None         => e.path,
                };
                println!("{:<10} {:>6o} {:>11} {:>12} {:>12}  {}",
                    e.kind.name(), e.mode, owner, e.original_size, e.encoded_size, path);
            }
        }

        // ── Info ─────────────────────────────────────────────────────────────
        Commands::Info { input, offset, json } => {
            let cell = Cell::open_at(&input, offset)?;
            let info = cell.info();
            if json {
                println!("{}", serde_json::to_string_pretty(info)?);
                return Ok(());
            }
            let ratio = if info.total_original_size == 0 {
                0.0
            } else {
                info.total_encoded_size as f64 / info.total_original_size as f64
            };

            println!("── hexcell cell ─────────────────────────────────────────");
            println!("  Path           {}", input.display());
            println!("  Offset         {} B", cell.offset());
            println!("  Entries        {}", info.entry_count);
            println!("  Encoded size   {} B", info.total_encoded_size);
            println!("  Original size  {} B", info.total_original_size);
            println!("  Ratio          {:.3}", ratio);
        }
    }

    Ok(())
}

// ── helpers ──────────────────────────────────────────────────────────────────

fn setup_logging(verbose: bool) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| {
        EnvFilter::new(if verbose { "hexcell=debug,warn" } else { "hexcell=info,warn" })
    });
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .with_target(false)
        .init();
}
