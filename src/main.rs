//! Command-line node builder.
//!
//! ```bash
//! wadbsp doom2.wad -o doom2.xwa
//! wadbsp epic.wad -o epic.xwa --map MAP07 --split-cost 29
//! ```

use std::path::PathBuf;
use std::sync::atomic::AtomicBool;

use anyhow::{Context, Result, bail};
use clap::Parser;

use wadbsp::bsp::{self, BuildConfig, SPLIT_COST_DEFAULT};
use wadbsp::wad::{Wad, XwaWriter};

#[derive(Parser)]
#[command(name = "wadbsp", version, about = "Build XGL3 BSP nodes for Doom-engine maps")]
struct Args {
    /// Input WAD file
    input: PathBuf,

    /// Output XWA file
    #[arg(short, long)]
    output: PathBuf,

    /// Cost multiplier for seg splits; higher prefers fewer splits
    /// over tree balance
    #[arg(long, default_value_t = SPLIT_COST_DEFAULT)]
    split_cost: i32,

    /// Store node lumps uncompressed (XGL3 instead of ZGL3)
    #[arg(long)]
    no_compress: bool,

    /// Only build the map with this marker name
    #[arg(long)]
    map: Option<String>,
}

fn main() -> Result<()> {
    env_logger::init();
    let args = Args::parse();

    let wad = Wad::from_file(&args.input)
        .with_context(|| format!("opening {}", args.input.display()))?;

    let markers = wad.level_indices();
    if markers.is_empty() {
        bail!("no levels found in {}", args.input.display());
    }

    let config = BuildConfig {
        split_cost: args.split_cost,
        compress_nodes: !args.no_compress,
    };
    let cancel = AtomicBool::new(false);

    let mut out = XwaWriter::new();
    let mut built_any = false;

    for &marker in &markers {
        let name = wad.level_name(marker).to_owned();

        if let Some(filter) = &args.map {
            if !name.eq_ignore_ascii_case(filter) {
                continue;
            }
        }

        let geometry = wad
            .load_level_geometry(marker)
            .with_context(|| format!("reading {name}"))?;

        let built = bsp::build_level(&geometry, &config, &cancel)
            .with_context(|| format!("building nodes for {name}"))?;

        let issues = match (built.stats.warnings, built.stats.minor_issues) {
            (0, 0) => String::new(),
            (w, m) => format!("  ({w} warnings, {m} minor issues)"),
        };
        println!(
            "{name}: {} nodes, {} subsectors, {} segs{issues}",
            built.level.nodes.len(),
            built.level.subsectors.len(),
            built.level.segs.len(),
        );

        out.add_lump(&name, built.lump);
        built_any = true;
    }

    if !built_any {
        bail!("no level matched --map {}", args.map.unwrap_or_default());
    }

    out.write_to(&args.output)
        .with_context(|| format!("writing {}", args.output.display()))?;

    Ok(())
}
