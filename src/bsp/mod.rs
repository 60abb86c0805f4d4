//! BSP node builder core.
//!
//! Consumes the per-level geometry arrays produced by the WAD loader
//! and emits an XGL3 node lump:
//!
//! ```text
//! LevelGeometry ──► Level arenas ──► analysis passes ──► segs
//!      ──► recursive partitioning ──► subsectors + nodes ──► XGL3
//! ```
//!
//! Building is single-threaded and deterministic: the same input with
//! the same [`BuildConfig`] always yields a byte-identical lump.

pub mod analyze;
pub mod level;
pub mod node;
pub mod util;
pub mod xgl3;

use std::io;
use std::sync::atomic::AtomicBool;

use log::debug;
use thiserror::Error;

use crate::wad::level::{LevelGeometry, MapFormat};
use level::{Child, Level};

pub const SPLIT_COST_DEFAULT: i32 = 11;

/// Node building parameters.
#[derive(Clone, Debug)]
pub struct BuildConfig {
    /// Multiplier for split/near-miss penalties in the partition cost
    /// function.  Higher values prefer fewer splits at the expense of
    /// tree balance.
    pub split_cost: i32,

    /// Deflate the lump payload and use the `ZGL3` magic.
    pub compress_nodes: bool,
}

impl Default for BuildConfig {
    fn default() -> Self {
        Self {
            split_cost: SPLIT_COST_DEFAULT,
            compress_nodes: true,
        }
    }
}

/// Things that can go wrong while building nodes.
#[derive(Error, Debug)]
pub enum BuildError {
    #[error("build cancelled")]
    Cancelled,

    #[error("seg with zero length created")]
    ZeroLengthSeg,

    #[error("bad order in intersection list: {0:.3} > {1:.3}")]
    BadIntersectionOrder(f64, f64),

    #[error("partition left an empty {0} side")]
    EmptySide(&'static str),

    #[error("subsector #{0} has no real seg")]
    DegenerateSubsector(usize),

    #[error("node #{0} has neither sub-node nor subsector on a side")]
    MissingChild(usize),

    #[error("illegal {kind} number #{index}")]
    IllegalIndex { kind: &'static str, index: usize },

    #[error("I/O error: {0}")]
    Io(#[from] io::Error),
}

/// Warning counters surfaced alongside the result.  None of these stop
/// the build.
#[derive(Clone, Copy, Debug, Default)]
pub struct BuildStats {
    pub warnings: u32,
    pub minor_issues: u32,
}

/// Everything produced for one level.
#[derive(Debug)]
pub struct BuiltLevel {
    pub level: Level,
    pub root: Child,
    pub stats: BuildStats,

    /// Finished XGL3/ZGL3 lump, empty when the level has no real lines.
    pub lump: Vec<u8>,
}

/// Build the BSP tree for one level and serialize it.
pub fn build_level(
    geometry: &LevelGeometry,
    config: &BuildConfig,
    cancel: &AtomicBool,
) -> Result<BuiltLevel, BuildError> {
    let mut stats = BuildStats::default();

    let mut level = Level::load(geometry)?;

    debug!(
        "{}: loaded {} vertices, {} sectors, {} sides, {} lines, {} things",
        level.name,
        level.vertices.len(),
        level.sectors.len(),
        level.sidedefs.len(),
        level.linedefs.len(),
        level.things.len()
    );

    if geometry.format == MapFormat::Doom {
        // always prune unused vertices at the end of the lump, otherwise
        // vertices from seg splits keep accumulating over repeated builds
        analyze::prune_vertices_at_end(&mut level);
    }

    analyze::detect_overlapping_vertices(&mut level);
    analyze::detect_overlapping_lines(&mut level);
    analyze::calculate_wall_tips(&mut level);

    if geometry.format == MapFormat::Udmf {
        analyze::detect_polyobj_sectors(&mut level);
    }

    let mut root = Child::default();

    if level.num_real_lines > 0 {
        let list = node::create_segs(&mut level, &mut stats)?;

        root = node::build_nodes(&mut level, list, 0, config, cancel)?;

        debug!(
            "{}: built {} nodes, {} subsectors, {} segs, {} vertices",
            level.name,
            level.nodes.len(),
            level.subsectors.len(),
            level.segs.len(),
            level.num_old_vert + level.num_new_vert
        );

        if let Some(nid) = root.node {
            debug!(
                "{}: heights of subtrees: {} / {}",
                level.name,
                node::compute_bsp_height(&level, level.nodes[nid].right.node),
                node::compute_bsp_height(&level, level.nodes[nid].left.node)
            );
        }

        node::clockwise_bsp_tree(&mut level, &mut stats)?;
        analyze::repair_degenerate_segs(&mut level)?;
    }

    let lump = if level.num_real_lines > 0 {
        xgl3::save_xgl3(&mut level, &root, config.compress_nodes)?
    } else {
        Vec::new()
    };

    Ok(BuiltLevel {
        level,
        root,
        stats,
        lump,
    })
}
