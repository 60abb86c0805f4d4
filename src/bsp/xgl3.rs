//! XGL3 lump writer.
//!
//! The lump is a sequence of little-endian integers: a four-byte magic,
//! then vertices, subsectors, segs and nodes.  Map coordinates are
//! stored as 16.16 signed fixed point.  With compression enabled the
//! payload after the magic is a zlib deflate stream and the magic
//! changes from `XGL3` to `ZGL3`.

use std::io::{self, Write};

use byteorder::{LittleEndian as LE, WriteBytesExt};
use flate2::Compression;
use flate2::write::ZlibEncoder;

use crate::bsp::BuildError;
use crate::bsp::level::{Child, Level, NodeId};
use crate::bsp::util::to_fixed_16_16;

pub const XGL3_MAGIC: &[u8; 4] = b"XGL3";
pub const ZGL3_MAGIC: &[u8; 4] = b"ZGL3";

/// Written for an absent partner or linedef reference.
const NO_INDEX: u32 = 0xFFFF_FFFF;

/// Top bit of a child reference: set means subsector, clear means node.
const SUBSECTOR_BIT: u32 = 0x8000_0000;

/// Payload sink: plain bytes, or a deflate stream when compressing.
enum LumpSink {
    Raw(Vec<u8>),
    Deflate(ZlibEncoder<Vec<u8>>),
}

struct LumpWriter {
    sink: LumpSink,
}

impl LumpWriter {
    fn new(compress: bool) -> Self {
        let sink = if compress {
            LumpSink::Deflate(ZlibEncoder::new(Vec::new(), Compression::default()))
        } else {
            LumpSink::Raw(Vec::new())
        };
        Self { sink }
    }

    fn finish(self) -> io::Result<Vec<u8>> {
        match self.sink {
            LumpSink::Raw(bytes) => Ok(bytes),
            LumpSink::Deflate(z) => z.finish(),
        }
    }
}

impl Write for LumpWriter {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        match &mut self.sink {
            LumpSink::Raw(bytes) => bytes.write(buf),
            LumpSink::Deflate(z) => z.write(buf),
        }
    }

    fn flush(&mut self) -> io::Result<()> {
        match &mut self.sink {
            LumpSink::Raw(bytes) => bytes.flush(),
            LumpSink::Deflate(z) => z.flush(),
        }
    }
}

fn put_vertices(w: &mut LumpWriter, level: &Level) -> Result<(), BuildError> {
    w.write_u32::<LE>(level.num_old_vert as u32)?;
    w.write_u32::<LE>(level.num_new_vert as u32)?;

    let mut count = 0;
    for vert in &level.vertices {
        if !vert.is_new {
            continue;
        }

        w.write_i32::<LE>(to_fixed_16_16(vert.pos.x))?;
        w.write_i32::<LE>(to_fixed_16_16(vert.pos.y))?;
        count += 1;
    }

    debug_assert_eq!(count, level.num_new_vert, "new-vertex ledger miscount");
    Ok(())
}

fn put_subsectors(w: &mut LumpWriter, level: &Level) -> Result<(), BuildError> {
    w.write_u32::<LE>(level.subsectors.len() as u32)?;

    for sub in &level.subsectors {
        w.write_u32::<LE>(sub.seg_count as u32)?;
    }

    Ok(())
}

fn put_segs(w: &mut LumpWriter, level: &Level) -> Result<(), BuildError> {
    w.write_u32::<LE>(level.segs.len() as u32)?;

    // segs were renumbered in subsector order, so walking the subsector
    // lists yields them in ascending index order
    let mut expect_index = 0;

    for sub in &level.subsectors {
        let mut cur = sub.seg_list;
        while let Some(sid) = cur {
            let seg = &level.segs[sid];
            cur = seg.next;

            debug_assert_eq!(seg.index, Some(expect_index), "seg index out of order");
            expect_index += 1;

            let partner = seg
                .partner
                .and_then(|p| level.segs[p].index)
                .map_or(NO_INDEX, |i| i as u32);
            let linedef = seg.linedef.map_or(NO_INDEX, |ld| ld as u32);

            w.write_u32::<LE>(level.emit_vertex_index(seg.start))?;
            w.write_u32::<LE>(partner)?;
            w.write_u32::<LE>(linedef)?;
            w.write_u8(seg.side)?;
        }
    }

    debug_assert_eq!(expect_index, level.segs.len(), "seg count mismatch");
    Ok(())
}

fn clamp_i16(v: i32) -> i16 {
    v.clamp(i32::from(i16::MIN), i32::from(i16::MAX)) as i16
}

fn put_child_ref(w: &mut LumpWriter, level: &Level, child: &Child, parent: NodeId) -> Result<(), BuildError> {
    if let Some(nid) = child.node {
        let index = level.nodes[nid].index.expect("child node written before parent");
        w.write_u32::<LE>(index as u32)?;
    } else if let Some(ssid) = child.subsec {
        w.write_u32::<LE>(ssid as u32 | SUBSECTOR_BIT)?;
    } else {
        return Err(BuildError::MissingChild(parent));
    }
    Ok(())
}

/// Nodes are written in post-order, so every node's index is assigned
/// after both of its children have been serialized.
fn put_one_node(
    w: &mut LumpWriter,
    level: &mut Level,
    nid: NodeId,
    next_index: &mut usize,
) -> Result<(), BuildError> {
    if let Some(right) = level.nodes[nid].right.node {
        put_one_node(w, level, right, next_index)?;
    }
    if let Some(left) = level.nodes[nid].left.node {
        put_one_node(w, level, left, next_index)?;
    }

    level.nodes[nid].index = Some(*next_index);
    *next_index += 1;

    let node = level.nodes[nid].clone();

    w.write_i32::<LE>(to_fixed_16_16(node.x))?;
    w.write_i32::<LE>(to_fixed_16_16(node.y))?;
    w.write_i32::<LE>(to_fixed_16_16(node.dx))?;
    w.write_i32::<LE>(to_fixed_16_16(node.dy))?;

    for bounds in [&node.right.bounds, &node.left.bounds] {
        w.write_i16::<LE>(clamp_i16(bounds.min_x))?;
        w.write_i16::<LE>(clamp_i16(bounds.min_y))?;
        w.write_i16::<LE>(clamp_i16(bounds.max_x))?;
        w.write_i16::<LE>(clamp_i16(bounds.max_y))?;
    }

    put_child_ref(w, level, &node.right, nid)?;
    put_child_ref(w, level, &node.left, nid)?;

    Ok(())
}

fn put_nodes(w: &mut LumpWriter, level: &mut Level, root: &Child) -> Result<(), BuildError> {
    w.write_u32::<LE>(level.nodes.len() as u32)?;

    let mut next_index = 0;

    if let Some(nid) = root.node {
        put_one_node(w, level, nid, &mut next_index)?;
    }

    debug_assert_eq!(next_index, level.nodes.len(), "node count mismatch");
    Ok(())
}

/// Serialize the whole tree into one lump, compressing the payload
/// when asked.
pub fn save_xgl3(level: &mut Level, root: &Child, compress: bool) -> Result<Vec<u8>, BuildError> {
    let mut lump = Vec::new();
    lump.extend_from_slice(if compress { ZGL3_MAGIC } else { XGL3_MAGIC });

    let mut w = LumpWriter::new(compress);

    put_vertices(&mut w, level)?;
    put_subsectors(&mut w, level)?;
    put_segs(&mut w, level)?;
    put_nodes(&mut w, level, root)?;

    lump.extend_from_slice(&w.finish()?);
    Ok(lump)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Read;

    #[test]
    fn raw_sink_passes_bytes_through() {
        let mut w = LumpWriter::new(false);
        w.write_u32::<LE>(0xDEAD_BEEF).unwrap();
        w.write_u8(7).unwrap();
        assert_eq!(w.finish().unwrap(), vec![0xEF, 0xBE, 0xAD, 0xDE, 7]);
    }

    #[test]
    fn deflate_sink_round_trips() {
        let payload: Vec<u8> = (0..200u8).cycle().take(4096).collect();

        let mut w = LumpWriter::new(true);
        w.write_all(&payload).unwrap();
        let compressed = w.finish().unwrap();
        assert!(compressed.len() < payload.len());

        let mut inflated = Vec::new();
        flate2::read::ZlibDecoder::new(&compressed[..])
            .read_to_end(&mut inflated)
            .unwrap();
        assert_eq!(inflated, payload);
    }

    #[test]
    fn bounds_clamp_to_i16() {
        assert_eq!(clamp_i16(100_000), i16::MAX);
        assert_eq!(clamp_i16(-100_000), i16::MIN);
        assert_eq!(clamp_i16(-321), -321);
    }
}
