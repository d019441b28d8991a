//! Replay a recorded region-entry trace into basic-block-vector profiles
use anyhow::bail;
use bbprof::{
    DEFAULT_SLICE_SIZE, SamplingSession, ScopePolicy, SessionConfig, TraceReader, get_tqdm_style,
    scan_parallel_entries,
};
use clap::Parser;
use log::warn;
use std::path::{Path, PathBuf};

#[derive(Parser)]
#[command(version, about, long_about = None)]
struct Cli {
    /// Path to trace file
    trace: PathBuf,

    /// Output prefix: profiles go to {output}.T.<n>.bb and, under shared
    /// policies, {output}.global.bb
    #[arg(short, long)]
    output: PathBuf,

    /// Slice size in instructions
    #[arg(short, long, default_value_t = DEFAULT_SLICE_SIZE)]
    slice_size: i64,

    /// Scope policy: single, global or thread-progress:N
    #[arg(short, long, default_value = "single")]
    policy: ScopePolicy,

    /// Emit plain M: marker lines instead of symbolic S: lines
    #[arg(long)]
    no_symbolic: bool,

    /// Track previous-region transition counts
    #[arg(long)]
    track_prev: bool,

    /// Log barrier-entry reaches to this path
    #[arg(long)]
    barrier_log: Option<PathBuf>,

    /// Scan this executable for parallel-region entry routines
    #[arg(short, long)]
    exe: Option<PathBuf>,

    /// Write the session summary as JSON to this path
    #[arg(long)]
    summary_json: Option<PathBuf>,
}

fn file_name_matches(module: &str, exe: &Path) -> bool {
    Path::new(module).file_name() == exe.file_name()
}

fn main() -> anyhow::Result<()> {
    env_logger::init();
    let args = Cli::parse();

    let reader = TraceReader::open(&args.trace)?;
    let meta = reader.meta();
    println!(
        "Got {} regions, {} modules and {} entries",
        meta.regions.len(),
        meta.modules.len(),
        reader.num_entries()
    );

    let mut config = SessionConfig::new(&args.output);
    config.slice_size = args.slice_size;
    config.policy = args.policy;
    config.symbolic_markers = !args.no_symbolic;
    config.track_prev_region = args.track_prev;
    config.command_line = meta.command_line.clone();
    config.barrier_log = args.barrier_log.clone();
    let session = SamplingSession::new(config)?;

    // routines scanned from the executable attach to the module with the
    // same file name
    let scanned = match &args.exe {
        Some(exe) => scan_parallel_entries(exe)?,
        None => vec![],
    };
    let mut attached = scanned.is_empty();
    for module in &meta.modules {
        let mut routines = module.routines.clone();
        if let Some(exe) = &args.exe {
            if !scanned.is_empty() && file_name_matches(&module.name, exe) {
                routines.extend_from_slice(&scanned);
                attached = true;
            }
        }
        session.module_loaded(module.id, &module.name, module.base, &routines)?;
    }
    if !attached {
        warn!("no trace module matches the scanned executable, routines ignored");
    }

    // region ids follow the trace's discovery order
    let mut regions = Vec::with_capacity(meta.regions.len());
    for record in &meta.regions {
        regions.push(session.register_region(
            record.start,
            record.end,
            record.size_bytes,
            record.inst_count,
            record.module,
        ));
    }

    let pbar = indicatif::ProgressBar::new(reader.num_entries());
    pbar.set_style(get_tqdm_style());
    let mut entries = reader.entries()?;
    while let Some(chunk) = entries.next_chunk()? {
        for entry in chunk {
            let thread = entry.thread() as u64;
            if entry.is_parallel_entry() {
                let Some(addr) = meta.barriers.get(entry.index() as usize) else {
                    bail!("unknown barrier index {} in trace", entry.index());
                };
                session.on_parallel_region_entry(*addr, thread)?;
            } else {
                let Some(region) = regions.get(entry.index() as usize) else {
                    bail!("unknown region index {} in trace", entry.index());
                };
                session.on_region_entry(region, thread)?;
            }
        }
        pbar.inc(chunk.len() as u64);
    }
    pbar.finish();

    let summary = session.finish()?;
    println!(
        "Replayed {} instructions over {} regions on {} threads",
        summary.total_instructions, summary.regions, summary.threads
    );
    println!(
        "Emitted {} global and {} thread slices",
        summary.global_slices,
        summary.thread_slices.iter().sum::<u64>()
    );
    if let Some(path) = &args.summary_json {
        std::fs::write(path, serde_json::to_vec_pretty(&summary)?)?;
    }

    Ok(())
}
