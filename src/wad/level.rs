//! Doom map-lump parser — builds on [`crate::wad::Wad`].
//!
//! Classic Doom stores each playable map as binary lumps following a
//! zero-length marker (`E1M1`, `MAP01`, …):
//!
//! ```text
//! [marker] THINGS LINEDEFS SIDEDEFS VERTEXES SECTORS ...
//! ```
//!
//! UDMF maps carry a single `TEXTMAP` lump instead.  Both decode into
//! the same [`LevelGeometry`] arrays, the input contract of the node
//! builder: raw indices, unresolved, with `-1` for absent references.

use bitflags::bitflags;
use byteorder::{LittleEndian as LE, ReadBytesExt};
use std::io::{Cursor, Read};
use thiserror::Error;

use crate::wad::udmf;
use crate::wad::wad::{Wad, WadError};

bitflags! {
    /// Raw linedef flags as stored in the LINEDEFS lump.
    #[derive(Debug, Clone, Copy)]
    pub struct LinedefFlags: u16 {
        const IMPASSABLE      = 0x0001;
        const BLOCK_MONSTERS  = 0x0002;
        const TWO_SIDED       = 0x0004;
        const UPPER_UNPEGGED  = 0x0010;
        const LOWER_UNPEGGED  = 0x0020;
        const SECRET          = 0x0040;
        const BLOCK_SOUND     = 0x0080;
        const NOT_ON_MAP      = 0x0200;
    }
}

/// Absent sidedef / sector reference in the binary lumps.
const NO_REF: u16 = 0xFFFF;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum MapFormat {
    Doom,
    Udmf,
}

/*--------------------------- geometry arrays -------------------------*/

#[derive(Clone, Copy, Debug)]
pub struct GeoVertex {
    pub x: f64,
    pub y: f64,
}

#[derive(Clone, Copy, Debug)]
pub struct GeoLinedef {
    pub start: u32,
    pub end: u32,
    pub two_sided: bool,
    pub special: u16,
    pub tag: i16,
    /// Right / left sidedef index, negative when absent.
    pub right: i32,
    pub left: i32,
}

#[derive(Clone, Copy, Debug)]
pub struct GeoSidedef {
    /// Sector index, negative when the sidedef is invalid.
    pub sector: i32,
}

#[derive(Clone, Copy, Debug)]
pub struct GeoThing {
    pub x: i32,
    pub y: i32,
    pub kind: u16,
}

/// Per-level arrays consumed by the node builder, 1:1 with the map
/// lumps.
#[derive(Clone, Debug)]
pub struct LevelGeometry {
    pub name: String,
    pub format: MapFormat,
    pub vertices: Vec<GeoVertex>,
    pub num_sectors: usize,
    pub sidedefs: Vec<GeoSidedef>,
    pub linedefs: Vec<GeoLinedef>,
    pub things: Vec<GeoThing>,
}

/// Things that can go wrong while decoding a map.
#[derive(Error, Debug)]
pub enum LevelError {
    #[error(transparent)]
    Wad(#[from] WadError),

    #[error("required lump {0} missing")]
    Missing(&'static str),

    #[error("truncated lump {0}")]
    Truncated(&'static str),

    #[error("malformed TEXTMAP: {0}")]
    Textmap(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl Wad {
    /// Decode the map at `marker` into geometry arrays, whichever
    /// format it is stored in.
    pub fn load_level_geometry(&self, marker: usize) -> Result<LevelGeometry, LevelError> {
        let name = self.level_name(marker).to_owned();

        match self.level_format(marker) {
            MapFormat::Udmf => {
                let idx = self
                    .level_lookup(marker, "TEXTMAP")
                    .ok_or(LevelError::Missing("TEXTMAP"))?;
                let text = String::from_utf8_lossy(self.lump_bytes(idx));
                udmf::parse_textmap(&text, &name)
            }
            MapFormat::Doom => self.load_binary_level(marker, name),
        }
    }

    fn load_binary_level(&self, marker: usize, name: String) -> Result<LevelGeometry, LevelError> {
        let lump = |lump_name: &'static str| -> Result<&[u8], LevelError> {
            self.level_lookup(marker, lump_name)
                .map(|idx| self.lump_bytes(idx))
                .ok_or(LevelError::Missing(lump_name))
        };

        // parse a lump as an array of fixed-size records
        macro_rules! parse_vec {
            ($buf:expr, $size:expr, $name:expr, $body:expr) => {{
                let buf = $buf;
                if buf.len() % $size != 0 {
                    return Err(LevelError::Truncated($name));
                }
                let mut cur = Cursor::new(buf);
                let mut v = Vec::with_capacity(buf.len() / $size);
                while (cur.position() as usize) < buf.len() {
                    v.push($body(&mut cur)?);
                }
                v
            }};
        }

        // VERTEXES (4 bytes)
        let vertices = parse_vec!(
            lump("VERTEXES")?,
            4,
            "VERTEXES",
            |c: &mut Cursor<&[u8]>| -> std::io::Result<GeoVertex> {
                Ok(GeoVertex {
                    x: f64::from(c.read_i16::<LE>()?),
                    y: f64::from(c.read_i16::<LE>()?),
                })
            }
        );

        // SECTORS (26 bytes) - only the count matters to the builder
        let sectors_buf = lump("SECTORS")?;
        if sectors_buf.len() % 26 != 0 {
            return Err(LevelError::Truncated("SECTORS"));
        }
        let num_sectors = sectors_buf.len() / 26;

        // SIDEDEFS (30 bytes): skip offsets and texture names
        let sidedefs = parse_vec!(
            lump("SIDEDEFS")?,
            30,
            "SIDEDEFS",
            |c: &mut Cursor<&[u8]>| -> std::io::Result<GeoSidedef> {
                let mut skip = [0u8; 28];
                c.read_exact(&mut skip)?;
                let sector = c.read_u16::<LE>()?;
                Ok(GeoSidedef {
                    sector: if sector == NO_REF {
                        -1
                    } else {
                        i32::from(sector)
                    },
                })
            }
        );

        // LINEDEFS (14 bytes)
        let linedefs = parse_vec!(
            lump("LINEDEFS")?,
            14,
            "LINEDEFS",
            |c: &mut Cursor<&[u8]>| -> std::io::Result<GeoLinedef> {
                let start = u32::from(c.read_u16::<LE>()?);
                let end = u32::from(c.read_u16::<LE>()?);
                let flags = LinedefFlags::from_bits_truncate(c.read_u16::<LE>()?);
                let special = c.read_u16::<LE>()?;
                let tag = c.read_i16::<LE>()?;
                let right = c.read_u16::<LE>()?;
                let left = c.read_u16::<LE>()?;

                Ok(GeoLinedef {
                    start,
                    end,
                    two_sided: flags.contains(LinedefFlags::TWO_SIDED),
                    special,
                    tag,
                    right: if right == NO_REF { -1 } else { i32::from(right) },
                    left: if left == NO_REF { -1 } else { i32::from(left) },
                })
            }
        );

        // THINGS (10 bytes)
        let things = parse_vec!(
            lump("THINGS")?,
            10,
            "THINGS",
            |c: &mut Cursor<&[u8]>| -> std::io::Result<GeoThing> {
                let x = i32::from(c.read_i16::<LE>()?);
                let y = i32::from(c.read_i16::<LE>()?);
                let _angle = c.read_u16::<LE>()?;
                let kind = c.read_u16::<LE>()?;
                let _flags = c.read_u16::<LE>()?;
                Ok(GeoThing { x, y, kind })
            }
        );

        Ok(LevelGeometry {
            name,
            format: MapFormat::Doom,
            vertices,
            num_sectors,
            sidedefs,
            linedefs,
            things,
        })
    }
}

/*=======================================================================*/
/*                                Tests                                  */
/*=======================================================================*/
