//! GL-friendly BSP node builder for Doom-engine maps.
//!
//! Reads classic binary or UDMF levels out of a WAD, partitions the
//! map geometry into a tree of convex subsectors, and writes the
//! result as XGL3 node lumps in an XWA wrapper file.

pub mod bsp;
pub mod wad;
