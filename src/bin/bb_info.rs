use bbprof::BbFile;
use clap::Parser;
use cli_table::{Cell, Table, print_stdout};
use std::collections::BTreeMap;
use std::path::PathBuf;

#[derive(Parser)]
#[command(version, about, long_about = None)]
struct Cli {
    /// Paths to .bb profile files
    #[arg(required = true)]
    profiles: Vec<PathBuf>,
}

fn main() -> anyhow::Result<()> {
    let args = Cli::parse();

    let mut summary = vec![];
    // region id -> (start address, cumulative instructions over all inputs)
    let mut totals: BTreeMap<u32, (u64, i64)> = BTreeMap::new();
    for path in &args.profiles {
        let file = BbFile::parse_file(path)?;
        summary.push(vec![
            path.display().cell(),
            file.slices.len().cell(),
            file.total_slice_instructions().cell(),
            file.blocks.len().cell(),
            file.dynamic_inst_count.unwrap_or(0).cell(),
            file.terminated.cell(),
        ]);
        for block in &file.blocks {
            let entry = totals.entry(block.id).or_insert((block.start, 0));
            entry.1 += block.count * block.static_insts as i64;
        }
    }
    let summary = summary.table().title(vec![
        "Profile".cell(),
        "Slices".cell(),
        "Slice Insts".cell(),
        "Blocks".cell(),
        "Dynamic Insts".cell(),
        "Terminated".cell(),
    ]);
    print_stdout(summary)?;

    println!("Top regions by cumulative instructions:");
    let mut items: Vec<(u32, u64, i64)> = totals
        .into_iter()
        .map(|(id, (start, insts))| (id, start, insts))
        .collect();
    items.sort_by_key(|(_, _, insts)| *insts);
    let mut table = vec![];
    for (id, start, insts) in items.iter().rev().take(10) {
        table.push(vec![
            id.cell(),
            format!("0x{start:x}").cell(),
            insts.cell(),
        ]);
    }
    let table = table
        .table()
        .title(vec!["Id".cell(), "Start".cell(), "Instructions".cell()]);
    print_stdout(table)?;

    Ok(())
}
