use anyhow::bail;
use bbprof::{TRACE_MAX_THREADS, TraceReader, get_tqdm_style};
use clap::Parser;
use cli_table::{Cell, Table, print_stdout};
use size::Size;
use std::path::PathBuf;

#[derive(Parser)]
#[command(version, about, long_about = None)]
struct Cli {
    /// Path to trace file
    trace: PathBuf,
}

fn main() -> anyhow::Result<()> {
    let args = Cli::parse();
    let reader = TraceReader::open(&args.trace)?;
    let meta = reader.meta();
    println!(
        "Got {} regions, {} modules, {} barriers and {} entries",
        meta.regions.len(),
        meta.modules.len(),
        meta.barriers.len(),
        reader.num_entries()
    );
    println!(
        "Entry stream is {} compressed in a {} file",
        Size::from_bytes(reader.compressed_len()),
        Size::from_bytes(reader.file_len())
    );
    println!("Command:{}", meta.command_line);

    let mut modules = vec![];
    for module in &meta.modules {
        modules.push(vec![
            module.id.cell(),
            module.name.clone().cell(),
            format!("0x{:x}", module.base).cell(),
            module.routines.len().cell(),
        ]);
    }
    let modules = modules.table().title(vec![
        "Id".cell(),
        "Module".cell(),
        "Base".cell(),
        "Routines".cell(),
    ]);
    print_stdout(modules)?;

    let mut region_counts = vec![0u64; meta.regions.len()];
    let mut thread_counts = vec![0u64; TRACE_MAX_THREADS as usize];
    let mut parallel_entries = 0u64;
    let pbar = indicatif::ProgressBar::new(reader.num_entries());
    pbar.set_style(get_tqdm_style());
    let mut entries = reader.entries()?;
    while let Some(chunk) = entries.next_chunk()? {
        for entry in chunk {
            thread_counts[entry.thread() as usize] += 1;
            if entry.is_parallel_entry() {
                if entry.index() as usize >= meta.barriers.len() {
                    bail!("unknown barrier index {} in trace", entry.index());
                }
                parallel_entries += 1;
            } else {
                let Some(count) = region_counts.get_mut(entry.index() as usize) else {
                    bail!("unknown region index {} in trace", entry.index());
                };
                *count += 1;
            }
        }
        pbar.inc(chunk.len() as u64);
    }
    pbar.finish();

    let instructions: u64 = region_counts
        .iter()
        .zip(&meta.regions)
        .map(|(count, region)| count * region.inst_count as u64)
        .sum();
    let threads = thread_counts.iter().filter(|count| **count > 0).count();
    println!(
        "{instructions} instructions on {threads} threads, {parallel_entries} parallel-region entries"
    );

    println!("Top regions by executed instructions:");
    let mut items: Vec<(usize, u64)> = region_counts.iter().copied().enumerate().collect();
    items.sort_by_key(|(index, count)| count * meta.regions[*index].inst_count as u64);
    let mut table = vec![];
    for (index, count) in items.iter().rev().take(10) {
        let region = &meta.regions[*index];
        table.push(vec![
            format!("0x{:x}", region.start).cell(),
            format!("0x{:x}", region.end).cell(),
            region.inst_count.cell(),
            count.cell(),
            (count * region.inst_count as u64).cell(),
        ]);
    }
    let table = table.table().title(vec![
        "Start".cell(),
        "End".cell(),
        "Static Insts".cell(),
        "Executions".cell(),
        "Instructions".cell(),
    ]);
    print_stdout(table)?;

    Ok(())
}
