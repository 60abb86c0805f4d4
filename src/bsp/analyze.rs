//! Level analysis passes that run before node building: overlap
//! detection, vertex pruning, wall-tip calculation and polyobj marking.

use std::cmp::Ordering;

use log::{debug, warn};

use crate::bsp::BuildError;
use crate::bsp::level::{Level, LinedefId, SegId, Vertex, VertexId};
use crate::bsp::util::to_fixed_16_16;

/// Position comparison used for overlap detection (looser than EPSILON).
const OVERLAP_TOLERANCE: f64 = 0.0001;

fn cmp_vertex(a: &Vertex, b: &Vertex) -> Ordering {
    let xdiff = a.pos.x - b.pos.x;
    if xdiff.abs() > OVERLAP_TOLERANCE {
        return if xdiff < 0.0 {
            Ordering::Less
        } else {
            Ordering::Greater
        };
    }

    let ydiff = a.pos.y - b.pos.y;
    if ydiff.abs() > OVERLAP_TOLERANCE {
        return if ydiff < 0.0 {
            Ordering::Less
        } else {
            Ordering::Greater
        };
    }

    Ordering::Equal
}

/// Find vertices occupying the same location and point later ones at the
/// first (canonical) occurrence, then rewrite every linedef to use the
/// canonical vertex.
pub fn detect_overlapping_vertices(level: &mut Level) {
    let mut order: Vec<VertexId> = (0..level.vertices.len()).collect();
    order.sort_by(|&a, &b| {
        cmp_vertex(&level.vertices[a], &level.vertices[b]).then(a.cmp(&b))
    });

    for i in 0..order.len().saturating_sub(1) {
        let a = order[i];
        let b = order[i + 1];

        if cmp_vertex(&level.vertices[a], &level.vertices[b]) == Ordering::Equal {
            let canon = level.vertices[a].overlap.or(Some(a));
            level.vertices[b].overlap = canon;
        }
    }

    // only the in-memory linedefs change, mainly to help miniseg creation
    for line in &mut level.linedefs {
        while let Some(canon) = level.vertices[line.start].overlap {
            line.start = canon;
        }
        while let Some(canon) = level.vertices[line.end].overlap {
            line.end = canon;
        }
    }
}

/// The "lowest" vertex of a line: left-most, or bottom-most when the
/// line is vertical.  Returns false for start, true for end.
fn line_vertex_lowest(level: &Level, line: LinedefId) -> bool {
    let s = level.vertices[level.linedefs[line].start].pos;
    let e = level.vertices[level.linedefs[line].end].pos;

    !((s.x as i32) < (e.x as i32) || ((s.x as i32) == (e.x as i32) && (s.y as i32) < (e.y as i32)))
}

fn line_start_cmp(level: &Level, a: LinedefId, b: LinedefId) -> Ordering {
    let c = if line_vertex_lowest(level, a) {
        level.linedefs[a].end
    } else {
        level.linedefs[a].start
    };
    let d = if line_vertex_lowest(level, b) {
        level.linedefs[b].end
    } else {
        level.linedefs[b].start
    };

    cmp_vertex(&level.vertices[c], &level.vertices[d])
}

fn line_end_cmp(level: &Level, a: LinedefId, b: LinedefId) -> Ordering {
    let c = if line_vertex_lowest(level, a) {
        level.linedefs[a].start
    } else {
        level.linedefs[a].end
    };
    let d = if line_vertex_lowest(level, b) {
        level.linedefs[b].start
    } else {
        level.linedefs[b].end
    };

    cmp_vertex(&level.vertices[c], &level.vertices[d])
}

/// Sort lines by their lowest endpoint; lines sharing both endpoints are
/// overlaps and the later ones are marked.  Partial overlaps are not
/// detected.
pub fn detect_overlapping_lines(level: &mut Level) {
    let mut order: Vec<LinedefId> = (0..level.linedefs.len()).collect();
    order.sort_by(|&a, &b| line_start_cmp(level, a, b).then(a.cmp(&b)));

    for i in 0..order.len().saturating_sub(1) {
        for j in i + 1..order.len() {
            if line_start_cmp(level, order[i], order[j]) != Ordering::Equal {
                break;
            }

            if line_end_cmp(level, order[i], order[j]) == Ordering::Equal {
                let a = order[i];
                let b = order[j];
                let canon = level.linedefs[a].overlap.or(Some(a));
                level.linedefs[b].overlap = canon;
            }
        }
    }
}

/// Strip unused vertices from the tail of the array, so that indices of
/// used vertices never shift.  Sets `num_old_vert`.
pub fn prune_vertices_at_end(level: &mut Level) {
    let old_num = level.vertices.len();

    while let Some(v) = level.vertices.last() {
        if v.is_used {
            break;
        }
        level.vertices.pop();
    }

    let unused = old_num - level.vertices.len();
    if unused > 0 {
        debug!("pruned {unused} unused vertices at end");
    }

    level.num_old_vert = level.vertices.len();
}

/// Record a wall tip at both endpoints of every usable linedef.
pub fn calculate_wall_tips(level: &mut Level) {
    for i in 0..level.linedefs.len() {
        let line = &level.linedefs[i];

        if line.overlap.is_some() || line.zero_length {
            continue;
        }

        let (start, end) = (line.start, line.end);
        let p1 = level.vertices[start].pos;
        let p2 = level.vertices[end].pos;

        let left = line
            .left
            .is_some_and(|sd| level.sidedefs[sd].sector.is_some());
        let right = line
            .right
            .is_some_and(|sd| level.sidedefs[sd].sector.is_some());

        // start->overlap and end->overlap are already resolved by
        // detect_overlapping_vertices()

        level.vertices[start].add_wall_tip(p2.x - p1.x, p2.y - p1.y, left, right);
        level.vertices[end].add_wall_tip(p1.x - p2.x, p1.y - p2.y, right, left);
    }
}

/*------------------------- split-born vertices -----------------------*/

/// Create the vertex for a split of `sid` at (x,y), including its
/// wall-tip info derived from the seg's sidedness.
pub fn new_vertex_from_split_seg(level: &mut Level, sid: SegId, x: f64, y: f64) -> VertexId {
    let vid = level.vertices.len();

    level.vertices.push(Vertex {
        pos: glam::DVec2::new(x, y),
        index: level.num_new_vert,
        is_new: true,
        is_used: true,
        overlap: None,
        tips: smallvec::SmallVec::new(),
    });
    level.num_new_vert += 1;

    let seg = level.segs[sid].clone();

    match seg.linedef {
        None => {
            level.vertices[vid].add_wall_tip(seg.pdx, seg.pdy, true, true);
            level.vertices[vid].add_wall_tip(-seg.pdx, -seg.pdy, true, true);
        }
        Some(ld) => {
            let line = &level.linedefs[ld];
            let (front, back) = if seg.side != 0 {
                (line.left, line.right)
            } else {
                (line.right, line.left)
            };

            let left = back.is_some_and(|sd| level.sidedefs[sd].sector.is_some());
            let right = front.is_some_and(|sd| level.sidedefs[sd].sector.is_some());

            level.vertices[vid].add_wall_tip(seg.pdx, seg.pdy, left, right);
            level.vertices[vid].add_wall_tip(-seg.pdx, -seg.pdy, right, left);
        }
    }

    vid
}

/// Create an end vertex to rescue a seg that collapses under output
/// rounding: step away from `start` until the rounded position differs.
/// No wall-tip info is computed, so this must only run after node
/// building.
pub fn new_vertex_degenerate(
    level: &mut Level,
    start: VertexId,
    end: VertexId,
) -> Result<VertexId, BuildError> {
    let s = level.vertices[start].pos;
    let e = level.vertices[end].pos;

    let mut dx = e.x - s.x;
    let mut dy = e.y - s.y;
    let dlen = dx.hypot(dy);

    if dlen == 0.0 {
        return Err(BuildError::ZeroLengthSeg);
    }

    dx /= dlen;
    dy /= dlen;

    let vid = level.vertices.len();
    level.vertices.push(Vertex {
        pos: s,
        index: level.num_new_vert,
        is_new: true,
        is_used: true,
        overlap: None,
        tips: smallvec::SmallVec::new(),
    });
    level.num_new_vert += 1;

    while to_fixed_16_16(level.vertices[vid].pos.x) == to_fixed_16_16(s.x)
        && to_fixed_16_16(level.vertices[vid].pos.y) == to_fixed_16_16(s.y)
    {
        level.vertices[vid].pos.x += dx;
        level.vertices[vid].pos.y += dy;
    }

    Ok(vid)
}

/// Give every seg whose endpoints collapse under 16.16 rounding a
/// compensating end vertex, keeping its partner in sync.
pub fn repair_degenerate_segs(level: &mut Level) -> Result<(), BuildError> {
    for sid in 0..level.segs.len() {
        let (start, end) = {
            let seg = &level.segs[sid];
            (seg.start, seg.end)
        };
        let s = level.vertices[start].pos;
        let e = level.vertices[end].pos;

        if to_fixed_16_16(s.x) != to_fixed_16_16(e.x)
            || to_fixed_16_16(s.y) != to_fixed_16_16(e.y)
        {
            continue;
        }

        level.segs[sid].is_degenerate = true;
        warn!(
            "seg at ({:.1},{:.1}) collapses under rounding, compensating",
            s.x, s.y
        );

        let vid = new_vertex_degenerate(level, start, end)?;

        level.segs[sid].end = vid;
        level.recompute_seg(sid)?;
        level.segs[sid].is_degenerate = false;

        if let Some(pid) = level.segs[sid].partner {
            level.segs[pid].start = vid;
            level.recompute_seg(pid)?;
            level.segs[pid].is_degenerate = false;
        }
    }

    Ok(())
}

/*------------------------------ polyobjs -----------------------------*/

// ZDoom polyobject spawn-spot thing types.
const POLYOBJ_THING_FIRST: u16 = 9300;
const POLYOBJ_THING_LAST: u16 = 9303;

/// Mark sectors containing a polyobject spawn spot, then make every
/// linedef bordering such a sector precious so partitions avoid
/// splitting it.
pub fn detect_polyobj_sectors(level: &mut Level) {
    for t in 0..level.things.len() {
        let thing = &level.things[t];
        if !(POLYOBJ_THING_FIRST..=POLYOBJ_THING_LAST).contains(&thing.kind) {
            continue;
        }

        let (x, y) = (thing.x as f64, thing.y as f64);

        if let Some(sector) = sector_east_of_point(level, x, y) {
            debug!("polyobj spawn at ({x:.0},{y:.0}) marks sector #{sector}");
            level.sectors[sector].has_polyobject = true;
        }
    }

    for line in &mut level.linedefs {
        let polyobj = [line.right, line.left].iter().any(|side| {
            side.and_then(|sd| level.sidedefs[sd].sector)
                .is_some_and(|s| level.sectors[s].has_polyobject)
        });

        if polyobj {
            line.is_precious = true;
        }
    }
}

/// The sector a point sits in, found by casting a ray east and taking
/// the facing side of the nearest crossing linedef.
fn sector_east_of_point(level: &Level, x: f64, y: f64) -> Option<usize> {
    let mut best: Option<(f64, LinedefId, bool)> = None;

    for (i, line) in level.linedefs.iter().enumerate() {
        if line.zero_length || line.overlap.is_some() {
            continue;
        }

        let p1 = level.vertices[line.start].pos;
        let p2 = level.vertices[line.end].pos;

        if (p1.y > y) == (p2.y > y) {
            continue;
        }

        let cross_x = p1.x + (y - p1.y) * (p2.x - p1.x) / (p2.y - p1.y);
        let dist = cross_x - x;

        if dist < 0.0 {
            continue;
        }

        if best.is_none_or(|(d, _, _)| dist < d) {
            // heading north the point is on the line's left side
            let left_facing = p2.y > p1.y;
            best = Some((dist, i, left_facing));
        }
    }

    let (_, line, left_facing) = best?;
    let line = &level.linedefs[line];
    let side = if left_facing { line.left } else { line.right };

    side.and_then(|sd| level.sidedefs[sd].sector)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::wad::level::{GeoLinedef, GeoSidedef, GeoThing, GeoVertex, LevelGeometry, MapFormat};

    fn geometry_with(
        vertices: &[(f64, f64)],
        linedefs: &[(u32, u32)],
    ) -> LevelGeometry {
        LevelGeometry {
            name: "TEST".into(),
            format: MapFormat::Doom,
            vertices: vertices
                .iter()
                .map(|&(x, y)| GeoVertex { x, y })
                .collect(),
            num_sectors: 1,
            sidedefs: vec![GeoSidedef { sector: 0 }],
            linedefs: linedefs
                .iter()
                .map(|&(start, end)| GeoLinedef {
                    start,
                    end,
                    two_sided: false,
                    special: 0,
                    tag: 0,
                    right: 0,
                    left: -1,
                })
                .collect(),
            things: Vec::new(),
        }
    }

    #[test]
    fn coincident_vertices_get_canonical_twin() {
        let geo = geometry_with(
            &[(0.0, 0.0), (64.0, 0.0), (0.0, 0.0), (64.0, 64.0)],
            &[(0, 1), (2, 3)],
        );
        let mut level = Level::load(&geo).unwrap();
        detect_overlapping_vertices(&mut level);

        assert_eq!(level.vertices[2].overlap, Some(0));
        assert_eq!(level.vertices[0].overlap, None);
        // second line now starts at the canonical vertex
        assert_eq!(level.linedefs[1].start, 0);
    }

    #[test]
    fn duplicate_linedefs_are_marked() {
        let geo = geometry_with(&[(0.0, 0.0), (128.0, 0.0)], &[(0, 1), (1, 0), (0, 1)]);
        let mut level = Level::load(&geo).unwrap();
        detect_overlapping_vertices(&mut level);
        detect_overlapping_lines(&mut level);

        assert_eq!(level.linedefs[0].overlap, None);
        // both the reversed and the exact duplicate overlap line 0
        assert_eq!(level.linedefs[1].overlap, Some(0));
        assert_eq!(level.linedefs[2].overlap, Some(0));
    }

    #[test]
    fn prune_only_strips_the_tail() {
        let geo = geometry_with(
            &[(0.0, 0.0), (64.0, 0.0), (99.0, 99.0), (88.0, 88.0)],
            &[(0, 1)],
        );
        let mut level = Level::load(&geo).unwrap();
        prune_vertices_at_end(&mut level);

        assert_eq!(level.vertices.len(), 2);
        assert_eq!(level.num_old_vert, 2);
    }

    #[test]
    fn unused_vertex_before_used_survives_pruning() {
        let geo = geometry_with(&[(99.0, 99.0), (0.0, 0.0), (64.0, 0.0)], &[(1, 2)]);
        let mut level = Level::load(&geo).unwrap();
        prune_vertices_at_end(&mut level);

        // index 0 is unused but sits below used vertices, so it stays
        assert_eq!(level.vertices.len(), 3);
    }

    #[test]
    fn wall_tips_record_both_endpoints() {
        let geo = geometry_with(&[(0.0, 0.0), (128.0, 0.0)], &[(0, 1)]);
        let mut level = Level::load(&geo).unwrap();
        calculate_wall_tips(&mut level);

        assert_eq!(level.vertices[0].tips.len(), 1);
        assert_eq!(level.vertices[0].tips[0].angle, 0.0);
        assert!(level.vertices[0].tips[0].open_right);
        assert!(!level.vertices[0].tips[0].open_left);

        assert_eq!(level.vertices[1].tips.len(), 1);
        assert_eq!(level.vertices[1].tips[0].angle, 180.0);
        assert!(!level.vertices[1].tips[0].open_right);
        assert!(level.vertices[1].tips[0].open_left);
    }

    #[test]
    fn polyobj_spawn_marks_enclosing_sector() {
        // north-going wall east of the spawn spot; its left side faces west
        let mut geo = geometry_with(&[(64.0, -64.0), (64.0, 64.0)], &[(0, 1)]);
        geo.sidedefs.push(GeoSidedef { sector: 0 });
        geo.linedefs[0].left = 1;
        geo.things.push(GeoThing {
            x: 0,
            y: 0,
            kind: 9301,
        });

        let mut level = Level::load(&geo).unwrap();
        detect_polyobj_sectors(&mut level);

        assert!(level.sectors[0].has_polyobject);
        assert!(level.linedefs[0].is_precious);
    }
}
