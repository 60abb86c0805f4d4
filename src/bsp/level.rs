//! In-memory level representation used while building nodes.
//!
//! Everything lives in index-based arenas owned by [`Level`]: vertices,
//! linedefs, sidedefs, sectors, segs, subsectors and BSP nodes all refer to
//! each other through plain `usize` ids.  Seg groups are threaded through
//! the intrusive `Seg::next` link, so a seg sits on exactly one list at a
//! time (quad-tree node, left group, right group, or subsector).

use glam::DVec2;
use smallvec::SmallVec;

use crate::bsp::BuildError;
use crate::bsp::util::{EPSILON, compute_angle};
use crate::wad::level::LevelGeometry;

pub type VertexId = usize;
pub type LinedefId = usize;
pub type SidedefId = usize;
pub type SectorId = usize;
pub type SegId = usize;
pub type SubsectorId = usize;
pub type NodeId = usize;

/*------------------------- vertices & wall tips ----------------------*/

/// Where one wall meets a vertex: the angle the wall leaves at, and
/// whether each side of it is open (borders a sector) or closed (void).
/// `open_left` is the side of increasing angles, `open_right` the side
/// of decreasing angles.
#[derive(Clone, Copy, Debug)]
pub struct WallTip {
    pub angle: f64,
    pub open_left: bool,
    pub open_right: bool,
}

#[derive(Clone, Debug)]
pub struct Vertex {
    pub pos: DVec2,

    /// Ledger index within the vertex's generation (old or new).
    pub index: usize,

    /// Created by a seg split rather than loaded from the map.
    pub is_new: bool,

    /// Referenced by at least one linedef.
    pub is_used: bool,

    /// Set when this vertex occupies the same location as an earlier one.
    pub overlap: Option<VertexId>,

    /// Wall tips, kept sorted by increasing angle.
    pub tips: SmallVec<[WallTip; 4]>,
}

impl Vertex {
    pub fn overlaps(&self, other: &Vertex) -> bool {
        (other.pos.x - self.pos.x).abs() < EPSILON && (other.pos.y - self.pos.y).abs() < EPSILON
    }

    /// Insert a wall tip for a line leaving this vertex along (dx,dy).
    pub fn add_wall_tip(&mut self, dx: f64, dy: f64, open_left: bool, open_right: bool) {
        debug_assert!(self.overlap.is_none(), "tips belong on canonical vertices");

        let tip = WallTip {
            angle: compute_angle(dx, dy),
            open_left,
            open_right,
        };

        let at = self
            .tips
            .iter()
            .position(|t| tip.angle + EPSILON < t.angle)
            .unwrap_or(self.tips.len());

        self.tips.insert(at, tip);
    }

    /// Whether a line leaving this vertex along (dx,dy) would lie in open
    /// space.  A direction that coincides with an existing wall tip is
    /// closed, as is a direction pointing into void space.
    pub fn check_open(&self, dx: f64, dy: f64) -> bool {
        let angle = compute_angle(dx, dy);

        for tip in &self.tips {
            let diff = (tip.angle - angle).abs();
            if diff < EPSILON || diff > 360.0 - EPSILON {
                return false;
            }
        }

        // Find the first tip with a greater angle: the query direction is
        // on its right side.  Failing that, we are on the left side of the
        // tip with the largest angle.
        for (i, tip) in self.tips.iter().enumerate() {
            if angle + EPSILON < tip.angle {
                return tip.open_right;
            }
            if i + 1 == self.tips.len() {
                return tip.open_left;
            }
        }

        true
    }
}

/*------------------------- static map objects ------------------------*/

#[derive(Clone, Debug)]
pub struct Sector {
    pub index: usize,

    /// Sector contains a polyobject; its linedefs must not be split.
    pub has_polyobject: bool,
}

#[derive(Clone, Debug)]
pub struct Sidedef {
    /// Adjacent sector, absent for invalid sidedefs.
    pub sector: Option<SectorId>,
    pub index: usize,
}

#[derive(Clone, Debug)]
pub struct Linedef {
    pub start: VertexId,
    pub end: VertexId,

    pub right: Option<SidedefId>,
    pub left: Option<SidedefId>,

    pub special: u16,

    /// Marked two-sided in the map flags.
    pub two_sided: bool,

    /// Prefer not to split (tagged 900-999, self-referencing, or polyobj).
    pub is_precious: bool,

    /// Endpoints coincide; the line is ignored entirely.
    pub zero_length: bool,

    /// Same sector on both sides.
    pub self_referencing: bool,

    /// Set when this linedef directly overlaps an earlier one (a rare
    /// trick for higher mid-masked textures).  No segs are created for it.
    pub overlap: Option<LinedefId>,

    pub index: usize,
}

#[derive(Clone, Debug)]
pub struct Thing {
    pub x: i32,
    pub y: i32,
    pub kind: u16,
    pub index: usize,
}

/*------------------------------- segs --------------------------------*/

#[derive(Clone, Debug, Default)]
pub struct Seg {
    /// Intrusive link for whichever list currently holds this seg.
    pub next: Option<SegId>,

    pub start: VertexId,
    pub end: VertexId,

    /// Linedef this seg runs along, `None` for minisegs.
    pub linedef: Option<LinedefId>,

    /// 0 for the right side of the linedef, 1 for the left.
    pub side: u8,

    /// Seg on the other side of a two-sided line (or across a miniseg
    /// gap).  Always one-to-one: splitting one of the pair splits both.
    pub partner: Option<SegId>,

    /// Output index, assigned once the seg lands in a subsector.
    pub index: Option<usize>,

    /// Linedef this seg originally comes from: the linedef itself for
    /// real segs, the partition's linedef for minisegs.
    pub source_line: LinedefId,

    /// Endpoints collapse under output rounding.
    pub is_degenerate: bool,

    // cached line constants, filled in by Level::recompute_seg()
    pub psx: f64,
    pub psy: f64,
    pub pex: f64,
    pub pey: f64,
    pub pdx: f64,
    pub pdy: f64,
    pub p_length: f64,
    pub p_para: f64,
    pub p_perp: f64,

    /// Only meaningful while ordering subsector segs.
    pub cmp_angle: f64,
}

impl Seg {
    /// Signed distance along this seg's line from its start to the
    /// projection of (x,y).
    #[inline]
    pub fn parallel_distance(&self, x: f64, y: f64) -> f64 {
        (x * self.pdx + y * self.pdy + self.p_para) / self.p_length
    }

    /// Signed perpendicular distance from this seg's line to (x,y).
    /// Positive is to the right of the seg's direction.
    #[inline]
    pub fn perpendicular_distance(&self, x: f64, y: f64) -> f64 {
        (x * self.pdy - y * self.pdx + self.p_perp) / self.p_length
    }

    /// -1 for left, +1 for right, 0 when (x,y) lies on the line.
    pub fn point_on_line_side(&self, x: f64, y: f64) -> i32 {
        let perp = self.perpendicular_distance(x, y);

        if perp.abs() <= EPSILON {
            return 0;
        }
        if perp < 0.0 { -1 } else { 1 }
    }
}

/*--------------------------- tree objects ----------------------------*/

#[derive(Clone, Debug)]
pub struct Subsector {
    /// Head of the seg list.
    pub seg_list: Option<SegId>,

    /// Valid only after the segs have been renumbered.
    pub seg_count: usize,

    pub index: usize,

    /// Approximate middle point, used for clockwise ordering.
    pub mid: DVec2,
}

/// Integer bounding box of a seg group.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct Bounds {
    pub min_x: i32,
    pub min_y: i32,
    pub max_x: i32,
    pub max_y: i32,
}

/// One branch of a node: either a sub-node or a subsector, plus the
/// bounding box of everything down that branch.
#[derive(Clone, Copy, Debug, Default)]
pub struct Child {
    pub node: Option<NodeId>,
    pub subsec: Option<SubsectorId>,
    pub bounds: Bounds,
}

#[derive(Clone, Debug)]
pub struct Node {
    // partition line, high precision to support UDMF coordinates
    pub x: f64,
    pub y: f64,
    pub dx: f64,
    pub dy: f64,

    pub right: Child,
    pub left: Child,

    /// Assigned in post-order while the node lump is written.
    pub index: Option<usize>,
}

/*------------------------------- level -------------------------------*/

/// All arenas for one level, plus the vertex ledger counters.
#[derive(Debug, Default)]
pub struct Level {
    pub name: String,

    pub vertices: Vec<Vertex>,
    pub linedefs: Vec<Linedef>,
    pub sidedefs: Vec<Sidedef>,
    pub sectors: Vec<Sector>,
    pub things: Vec<Thing>,

    pub segs: Vec<Seg>,
    pub subsectors: Vec<Subsector>,
    pub nodes: Vec<Node>,

    /// Vertices loaded from the map, numbered `[0, num_old_vert)`.
    pub num_old_vert: usize,

    /// Vertices born from seg splits; their emitted index is
    /// `num_old_vert + index`.
    pub num_new_vert: usize,

    /// Linedefs with at least one sidedef.
    pub num_real_lines: usize,
}

impl Level {
    /// Move the loader's raw arrays into arenas, resolving and
    /// range-checking every cross reference.
    pub fn load(geometry: &LevelGeometry) -> Result<Self, BuildError> {
        let mut level = Self {
            name: geometry.name.clone(),
            ..Self::default()
        };

        for (index, v) in geometry.vertices.iter().enumerate() {
            level.vertices.push(Vertex {
                pos: DVec2::new(v.x, v.y),
                index,
                is_new: false,
                is_used: false,
                overlap: None,
                tips: SmallVec::new(),
            });
        }
        level.num_old_vert = level.vertices.len();

        for index in 0..geometry.num_sectors {
            level.sectors.push(Sector {
                index,
                has_polyobject: false,
            });
        }

        for (index, sd) in geometry.sidedefs.iter().enumerate() {
            let sector = match sd.sector {
                s if s < 0 => None,
                s => {
                    let s = s as usize;
                    if s >= level.sectors.len() {
                        return Err(BuildError::IllegalIndex {
                            kind: "sector",
                            index: s,
                        });
                    }
                    Some(s)
                }
            };
            level.sidedefs.push(Sidedef { sector, index });
        }

        for (index, ld) in geometry.linedefs.iter().enumerate() {
            let start = level.lookup_vertex(ld.start as usize)?;
            let end = level.lookup_vertex(ld.end as usize)?;

            level.vertices[start].is_used = true;
            level.vertices[end].is_used = true;

            // bogus sidedef numbers are silently dropped
            let right = level.lookup_sidedef(ld.right);
            let left = level.lookup_sidedef(ld.left);

            let d = level.vertices[end].pos - level.vertices[start].pos;
            let zero_length = d.x.abs() < EPSILON && d.y.abs() < EPSILON;

            if right.is_some() || left.is_some() {
                level.num_real_lines += 1;
            }

            let self_referencing = match (left, right) {
                (Some(l), Some(r)) => level.sidedefs[l].sector == level.sidedefs[r].sector,
                _ => false,
            };

            level.linedefs.push(Linedef {
                start,
                end,
                right,
                left,
                special: ld.special,
                two_sided: ld.two_sided,
                is_precious: (900..1000).contains(&ld.tag) || self_referencing,
                zero_length,
                self_referencing,
                overlap: None,
                index,
            });
        }

        for (index, t) in geometry.things.iter().enumerate() {
            level.things.push(Thing {
                x: t.x,
                y: t.y,
                kind: t.kind,
                index,
            });
        }

        Ok(level)
    }

    fn lookup_vertex(&self, num: usize) -> Result<VertexId, BuildError> {
        if num >= self.vertices.len() {
            return Err(BuildError::IllegalIndex {
                kind: "vertex",
                index: num,
            });
        }
        Ok(num)
    }

    fn lookup_sidedef(&self, num: i32) -> Option<SidedefId> {
        if num < 0 || num as usize >= self.sidedefs.len() {
            return None;
        }
        Some(num as usize)
    }

    /*----------------------- seg bookkeeping -------------------------*/

    /// Refresh a seg's cached line constants from its endpoints.
    pub fn recompute_seg(&mut self, sid: SegId) -> Result<(), BuildError> {
        let (s, e) = {
            let seg = &self.segs[sid];
            (self.vertices[seg.start].pos, self.vertices[seg.end].pos)
        };

        let seg = &mut self.segs[sid];
        seg.psx = s.x;
        seg.psy = s.y;
        seg.pex = e.x;
        seg.pey = e.y;
        seg.pdx = seg.pex - seg.psx;
        seg.pdy = seg.pey - seg.psy;

        seg.p_length = seg.pdx.hypot(seg.pdy);

        if seg.p_length <= 0.0 {
            return Err(BuildError::ZeroLengthSeg);
        }

        seg.p_perp = seg.psy * seg.pdx - seg.psx * seg.pdy;
        seg.p_para = -seg.psx * seg.pdx - seg.psy * seg.pdy;
        Ok(())
    }

    pub fn vertices_overlap(&self, a: VertexId, b: VertexId) -> bool {
        self.vertices[a].overlaps(&self.vertices[b])
    }

    /// Ledger-mapped output index of a vertex: old vertices keep their
    /// map index, split-born ones follow after `num_old_vert`.
    pub fn emit_vertex_index(&self, vid: VertexId) -> u32 {
        let v = &self.vertices[vid];
        if v.is_new {
            (self.num_old_vert + v.index) as u32
        } else {
            v.index as u32
        }
    }
}

/// Push a seg onto the front of an intrusive list.
pub fn list_add_seg(segs: &mut [Seg], list: &mut Option<SegId>, sid: SegId) {
    segs[sid].next = *list;
    *list = Some(sid);
}

#[cfg(test)]
mod tests {
    use super::*;

    fn bare_vertex(x: f64, y: f64) -> Vertex {
        Vertex {
            pos: DVec2::new(x, y),
            index: 0,
            is_new: false,
            is_used: false,
            overlap: None,
            tips: SmallVec::new(),
        }
    }

    #[test]
    fn wall_tips_stay_sorted() {
        let mut v = bare_vertex(0.0, 0.0);
        v.add_wall_tip(1.0, 0.0, false, true); // 0
        v.add_wall_tip(0.0, -1.0, true, false); // 270
        v.add_wall_tip(0.0, 1.0, true, true); // 90
        v.add_wall_tip(-1.0, 0.0, false, false); // 180

        let angles: Vec<f64> = v.tips.iter().map(|t| t.angle).collect();
        assert_eq!(angles, vec![0.0, 90.0, 180.0, 270.0]);
    }

    #[test]
    fn direction_along_a_wall_is_closed() {
        let mut v = bare_vertex(0.0, 0.0);
        v.add_wall_tip(1.0, 0.0, true, true);
        assert!(!v.check_open(2.0, 0.0));
        // within angular epsilon of the tip
        assert!(!v.check_open(1.0, 0.00001));
    }

    #[test]
    fn open_side_follows_tip_flags() {
        // one-sided wall heading north: east side open, west side void
        let mut v = bare_vertex(0.0, 0.0);
        v.add_wall_tip(0.0, 1.0, false, true); // 90
        v.add_wall_tip(0.0, -1.0, true, false); // 270

        assert!(v.check_open(1.0, 0.0)); // east
        assert!(!v.check_open(-1.0, 0.0)); // west
        assert!(v.check_open(1.0, -1.0)); // south-east
        assert!(!v.check_open(-1.0, 1.0)); // north-west
    }

    #[test]
    fn check_open_above_largest_tip_uses_left_flag() {
        let mut v = bare_vertex(0.0, 0.0);
        v.add_wall_tip(1.0, 0.0, true, false); // only tip at 0 degrees
        // 350 degrees: greater than every tip, so left side of the 0-tip
        assert!(v.check_open(1.0, -0.2));
    }

    #[test]
    fn empty_tip_set_is_open() {
        let v = bare_vertex(0.0, 0.0);
        assert!(v.check_open(1.0, 1.0));
    }

    #[test]
    fn vertex_overlap_uses_epsilon() {
        let a = bare_vertex(10.0, 20.0);
        let b = bare_vertex(10.0 + EPSILON / 2.0, 20.0);
        let c = bare_vertex(10.5, 20.0);
        assert!(a.overlaps(&b));
        assert!(!a.overlaps(&c));
    }
}
