//! Node building proper: seg creation, partition selection, space
//! division and subsector formation.
//!
//! The partition chooser scores every candidate seg by the number of
//! splits it would cause and the balance of segs on either side, a
//! scheme that goes back to DEU's node picker.  A binary-subdividing
//! spatial tree over each seg group lets whole boxes of segs be
//! classified against a candidate in one test.

use std::sync::atomic::{AtomicBool, Ordering};

use log::{debug, warn};

use crate::bsp::analyze::new_vertex_from_split_seg;
use crate::bsp::level::{
    Bounds, Child, Level, LinedefId, Node, Seg, SegId, Subsector, SubsectorId, VertexId,
    list_add_seg,
};
use crate::bsp::util::{EPSILON, compute_angle};
use crate::bsp::{BuildConfig, BuildError, BuildStats};

const PRECIOUS_COST_MULTIPLIER: f64 = 100.0;

/// Real-seg count at which the axis-aligned fast path kicks in.
const SEG_FAST_MODE_THRESHOLD: usize = 200;

/// Split points closer than this to a seg end are "iffy" (they produce
/// very short segs, one source of slime trails).
const IFFY_SEG_LENGTH: f64 = 4.0;

/// Quad-tree nodes at most this wide/tall are leaves.
const QUAD_LEAF_SIZE: i32 = 320;

/*--------------------------- seg creation ----------------------------*/

fn new_seg(level: &mut Level) -> SegId {
    let sid = level.segs.len();
    level.segs.push(Seg::default());
    sid
}

fn create_one_seg(
    level: &mut Level,
    line: LinedefId,
    mut start: VertexId,
    mut end: VertexId,
    sidedef: usize,
    what_side: u8,
    stats: &mut BuildStats,
) -> Result<SegId, BuildError> {
    if level.sidedefs[sidedef].sector.is_none() {
        warn!("bad sidedef on linedef #{line}");
        stats.warnings += 1;
    }

    // handle overlapping vertices, pick the canonical one
    if let Some(canon) = level.vertices[start].overlap {
        start = canon;
    }
    if let Some(canon) = level.vertices[end].overlap {
        end = canon;
    }

    let sid = new_seg(level);
    let seg = &mut level.segs[sid];

    seg.start = start;
    seg.end = end;
    seg.linedef = Some(line);
    seg.side = what_side;
    seg.partner = None;
    seg.source_line = line;
    seg.index = None;

    level.recompute_seg(sid)?;

    Ok(sid)
}

/// Turn every usable linedef into one seg per sided sidedef, coupling
/// the two sides of a two-sided line as partners.  Returns the list of
/// loose segs.
pub fn create_segs(
    level: &mut Level,
    stats: &mut BuildStats,
) -> Result<Option<SegId>, BuildError> {
    let mut list = None;

    for i in 0..level.linedefs.len() {
        let line = level.linedefs[i].clone();

        if line.zero_length || line.overlap.is_some() {
            continue;
        }

        let s = level.vertices[line.start].pos;
        let e = level.vertices[line.end].pos;
        if (s.x - e.x).hypot(s.y - e.y) >= 32000.0 {
            warn!("linedef #{i} is VERY long, it may cause problems");
            stats.warnings += 1;
        }

        let mut right = None;

        if let Some(sd) = line.right {
            let sid = create_one_seg(level, i, line.start, line.end, sd, 0, stats)?;
            list_add_seg(&mut level.segs, &mut list, sid);
            right = Some(sid);
        } else {
            warn!("linedef #{i} has no right sidedef!");
            stats.warnings += 1;
        }

        if let Some(sd) = line.left {
            let left = create_one_seg(level, i, line.end, line.start, sd, 1, stats)?;
            list_add_seg(&mut level.segs, &mut list, left);

            // the two sides always maintain a one-to-one correspondence,
            // so if one of them gets split the other must be split too
            if let Some(right) = right {
                level.segs[left].partner = Some(right);
                level.segs[right].partner = Some(left);
            }
        } else if line.two_sided {
            warn!("linedef #{i} is 2s but has no left sidedef");
            stats.warnings += 1;
            level.linedefs[i].two_sided = false;
        }
    }

    Ok(list)
}

/// Split `sid` at (x,y).  The old seg keeps its start vertex and is
/// shortened; the returned seg is the cut-off tail keeping the original
/// end vertex.  A partner seg is split at the same spot, its new half
/// linked into the list right after it.
fn split_seg(level: &mut Level, sid: SegId, x: f64, y: f64) -> Result<SegId, BuildError> {
    let new_vert = new_vertex_from_split_seg(level, sid, x, y);

    let new_sid = level.segs.len();
    let mut tail = level.segs[sid].clone();
    tail.next = None;
    level.segs.push(tail);

    level.segs[sid].end = new_vert;
    level.segs[new_sid].start = new_vert;

    level.recompute_seg(sid)?;
    level.recompute_seg(new_sid)?;

    if let Some(pid) = level.segs[sid].partner {
        // the partner's tail keeps the partner's `next` link so it ends
        // up in the same list, right after it
        let new_pid = level.segs.len();
        let partner_tail = level.segs[pid].clone();
        level.segs.push(partner_tail);

        level.segs[new_pid].partner = Some(new_sid);
        level.segs[new_sid].partner = Some(new_pid);

        level.segs[pid].start = new_vert;
        level.segs[new_pid].end = new_vert;

        level.recompute_seg(pid)?;
        level.recompute_seg(new_pid)?;

        level.segs[pid].next = Some(new_pid);
    }

    Ok(new_sid)
}

/// Intersection point between `seg` and the partition, given the
/// partition's perpendicular distances to the seg's endpoints.  Takes
/// advantage of axis-aligned lines to avoid rounding.
fn compute_intersection(seg: &Seg, part: &Seg, perp_c: f64, perp_d: f64) -> (f64, f64) {
    // horizontal partition against vertical seg
    if part.pdy == 0.0 && seg.pdx == 0.0 {
        return (seg.psx, part.psy);
    }

    // vertical partition against horizontal seg
    if part.pdx == 0.0 && seg.pdy == 0.0 {
        return (part.psx, seg.psy);
    }

    // 0 = start, 1 = end
    let ds = perp_c / (perp_c - perp_d);

    let x = if seg.pdx == 0.0 {
        seg.psx
    } else {
        seg.psx + seg.pdx * ds
    };
    let y = if seg.pdy == 0.0 {
        seg.psy
    } else {
        seg.psy + seg.pdy * ds
    };

    (x, y)
}

/*--------------------------- intersections ---------------------------*/

/// A vertex touching the current partition line, with the open/closed
/// state of the space immediately before and after it along the
/// partition direction.
#[derive(Clone, Copy, Debug)]
struct Intersection {
    vertex: VertexId,
    along_dist: f64,
    #[allow(dead_code)]
    self_ref: bool,
    open_before: bool,
    open_after: bool,
}

/// Record an intersection, keeping the list sorted by ascending
/// `along_dist`.  Vertices overlapping an already-recorded one merge.
fn add_intersection(
    level: &Level,
    cuts: &mut Vec<Intersection>,
    vertex: VertexId,
    part: &Seg,
    self_ref: bool,
) {
    if cuts
        .iter()
        .any(|c| level.vertices_overlap(vertex, c.vertex))
    {
        return;
    }

    let pos = level.vertices[vertex].pos;

    let cut = Intersection {
        vertex,
        along_dist: part.parallel_distance(pos.x, pos.y),
        self_ref,
        open_before: level.vertices[vertex].check_open(-part.pdx, -part.pdy),
        open_after: level.vertices[vertex].check_open(part.pdx, part.pdy),
    };

    let at = cuts.partition_point(|c| c.along_dist <= cut.along_dist);
    cuts.insert(at, cut);
}

/*---------------------------- quad tree ------------------------------*/

/// Binary-subdividing spatial index over a seg group.  Each node holds
/// the segs that straddle its split line; everything else filters down
/// to the child that fully contains it.
pub struct QuadTree {
    pub x1: i32,
    pub y1: i32,
    pub x2: i32,
    pub y2: i32,

    /// [0] has the lower coordinates, [1] the higher.  `None` for
    /// leaves.
    subs: Option<Box<[QuadTree; 2]>>,

    /// Seg counts over this node and all children.
    pub real_num: usize,
    pub mini_num: usize,

    /// Segs contained in this node, threaded through `Seg::next`.
    list: Option<SegId>,
}

impl QuadTree {
    pub fn new(x1: i32, y1: i32, x2: i32, y2: i32) -> Self {
        let dx = x2 - x1;
        let dy = y2 - y1;

        let subs = if dx <= QUAD_LEAF_SIZE && dy <= QUAD_LEAF_SIZE {
            None
        } else if dx >= dy {
            Some(Box::new([
                Self::new(x1, y1, x1 + dx / 2, y2),
                Self::new(x1 + dx / 2, y1, x2, y2),
            ]))
        } else {
            Some(Box::new([
                Self::new(x1, y1, x2, y1 + dy / 2),
                Self::new(x1, y1 + dy / 2, x2, y2),
            ]))
        };

        Self {
            x1,
            y1,
            x2,
            y2,
            subs,
            real_num: 0,
            mini_num: 0,
            list: None,
        }
    }

    pub fn empty(&self) -> bool {
        self.real_num + self.mini_num == 0
    }

    /// A seg sinks to the deepest node that strictly contains it along
    /// the split axis.  Counts are bumped at every level it passes.
    pub fn add_seg(&mut self, level: &mut Level, sid: SegId) {
        if level.segs[sid].linedef.is_some() {
            self.real_num += 1;
        } else {
            self.mini_num += 1;
        }

        if let Some(subs) = self.subs.as_mut() {
            let s = level.vertices[level.segs[sid].start].pos;
            let e = level.vertices[level.segs[sid].end].pos;

            let (x_min, x_max) = (s.x.min(e.x), s.x.max(e.x));
            let (y_min, y_max) = (s.y.min(e.y), s.y.max(e.y));

            if (self.x2 - self.x1) >= (self.y2 - self.y1) {
                if x_min > subs[1].x1 as f64 {
                    return subs[1].add_seg(level, sid);
                } else if x_max < subs[0].x2 as f64 {
                    return subs[0].add_seg(level, sid);
                }
            } else if y_min > subs[1].y1 as f64 {
                return subs[1].add_seg(level, sid);
            } else if y_max < subs[0].y2 as f64 {
                return subs[0].add_seg(level, sid);
            }
        }

        level.segs[sid].next = self.list;
        self.list = Some(sid);
    }

    pub fn add_list(&mut self, level: &mut Level, mut list: Option<SegId>) {
        while let Some(sid) = list {
            list = level.segs[sid].next;
            self.add_seg(level, sid);
        }
    }

    /// Drain every seg in this subtree onto the given list.
    fn convert_to_list(&mut self, level: &mut Level, list: &mut Option<SegId>) {
        while let Some(sid) = self.list {
            self.list = level.segs[sid].next;
            list_add_seg(&mut level.segs, list, sid);
        }

        if let Some(subs) = self.subs.as_mut() {
            subs[0].convert_to_list(level, list);
            subs[1].convert_to_list(level, list);
        }
    }

    /// Relationship between this box and the partition line: -1 or +1
    /// when the box lies definitively on one side, 0 when the line
    /// crosses or touches it.
    pub fn on_line_side(&self, part: &Seg) -> i32 {
        // expand bounds a bit, adds some safety and loses nothing
        let tx1 = self.x1 as f64 - 0.4;
        let ty1 = self.y1 as f64 - 0.4;
        let tx2 = self.x2 as f64 + 0.4;
        let ty2 = self.y2 as f64 + 0.4;

        let (mut p1, mut p2);

        if part.pdx == 0.0 {
            p1 = if tx1 > part.psx { 1 } else { -1 };
            p2 = if tx2 > part.psx { 1 } else { -1 };

            if part.pdy < 0.0 {
                p1 = -p1;
                p2 = -p2;
            }
        } else if part.pdy == 0.0 {
            p1 = if ty1 < part.psy { 1 } else { -1 };
            p2 = if ty2 < part.psy { 1 } else { -1 };

            if part.pdx < 0.0 {
                p1 = -p1;
                p2 = -p2;
            }
        } else if part.pdx * part.pdy > 0.0 {
            // positive slope: test the NW and SE corners
            p1 = part.point_on_line_side(tx1, ty2);
            p2 = part.point_on_line_side(tx2, ty1);
        } else {
            // negative slope: test the SW and NE corners
            p1 = part.point_on_line_side(tx1, ty1);
            p2 = part.point_on_line_side(tx2, ty2);
        }

        if p1 != p2 {
            return 0;
        }
        p1
    }
}

/*------------------------- partition chooser -------------------------*/

#[derive(Default)]
struct EvalInfo {
    cost: f64,
    splits: i32,
    iffy: i32,
    near_miss: i32,
    real_left: i32,
    real_right: i32,
    mini_left: i32,
    mini_right: i32,
}

impl EvalInfo {
    fn bump_left(&mut self, real: bool) {
        if real {
            self.real_left += 1;
        } else {
            self.mini_left += 1;
        }
    }

    fn bump_right(&mut self, real: bool) {
        if real {
            self.real_right += 1;
        } else {
            self.mini_right += 1;
        }
    }
}

/// Returns true if a "bad seg" was found early (cost already exceeds
/// the best known partition).
fn eval_partition_worker(
    level: &Level,
    tree: &QuadTree,
    part: &Seg,
    split_cost: f64,
    best_cost: f64,
    info: &mut EvalInfo,
) -> bool {
    // test the whole box against the partition line first, handling all
    // the segs within it at once when it lies clear of the line
    let side = tree.on_line_side(part);

    if side < 0 {
        info.real_left += tree.real_num as i32;
        info.mini_left += tree.mini_num as i32;
        return false;
    } else if side > 0 {
        info.real_right += tree.real_num as i32;
        info.mini_right += tree.mini_num as i32;
        return false;
    }

    /* check partition against all segs in this node */

    let mut cur = tree.list;
    while let Some(sid) = cur {
        let check = &level.segs[sid];
        cur = check.next;

        // catches bad segs early on
        if info.cost > best_cost {
            return true;
        }

        let real = check.linedef.is_some();
        let precious = check
            .linedef
            .is_some_and(|ld| level.linedefs[ld].is_precious);

        let (mut a, mut b) = (0.0, 0.0);
        let (mut fa, mut fb) = (0.0, 0.0);

        if check.source_line != part.source_line {
            a = part.perpendicular_distance(check.psx, check.psy);
            b = part.perpendicular_distance(check.pex, check.pey);
            fa = a.abs();
            fb = b.abs();
        }

        /* check for being on the same line */
        if fa <= EPSILON && fb <= EPSILON {
            // same direction or the opposite?
            if check.pdx * part.pdx + check.pdy * part.pdy < 0.0 {
                info.bump_left(real);
            } else {
                info.bump_right(real);
            }
            continue;
        }

        // a partition passing through a vertex is normally fine (even
        // ideal), but the vertex could sit on a sector that must not be
        // split, which the linedef-based checks below would miss
        if (fa <= EPSILON || fb <= EPSILON) && precious {
            info.cost += 40.0 * split_cost * PRECIOUS_COST_MULTIPLIER;
        }

        /* check for right side */
        if a > -EPSILON && b > -EPSILON {
            info.bump_right(real);

            /* check for a near miss */
            if (a >= IFFY_SEG_LENGTH && b >= IFFY_SEG_LENGTH)
                || (a <= EPSILON && b >= IFFY_SEG_LENGTH)
                || (b <= EPSILON && a >= IFFY_SEG_LENGTH)
            {
                continue;
            }

            info.near_miss += 1;

            // near misses can cause really short minisegs later on, so
            // the closer the miss, the higher the cost
            let qnty = if a <= EPSILON || b <= EPSILON {
                IFFY_SEG_LENGTH / a.max(b)
            } else {
                IFFY_SEG_LENGTH / a.min(b)
            };

            info.cost += 70.0 * split_cost * (qnty * qnty - 1.0);
            continue;
        }

        /* check for left side */
        if a < EPSILON && b < EPSILON {
            info.bump_left(real);

            /* check for a near miss */
            if (a <= -IFFY_SEG_LENGTH && b <= -IFFY_SEG_LENGTH)
                || (a >= -EPSILON && b <= -IFFY_SEG_LENGTH)
                || (b >= -EPSILON && a <= -IFFY_SEG_LENGTH)
            {
                continue;
            }

            info.near_miss += 1;

            let qnty = if a >= -EPSILON || b >= -EPSILON {
                IFFY_SEG_LENGTH / -a.min(b)
            } else {
                IFFY_SEG_LENGTH / -a.max(b)
            };

            info.cost += 70.0 * split_cost * (qnty * qnty - 1.0);
            continue;
        }

        // a and b are non-zero and of opposite sign: this seg will be
        // split by the partition line

        info.splits += 1;

        // lines tagged precious are protected from splits unless all
        // other options are exhausted (deep water, invisible lifts)
        if precious {
            info.cost += 100.0 * split_cost * PRECIOUS_COST_MULTIPLIER;
        } else {
            info.cost += 100.0 * split_cost;
        }

        // a split point very close to one end produces a very short
        // seg, hence a rather hefty surcharge
        if fa < IFFY_SEG_LENGTH || fb < IFFY_SEG_LENGTH {
            info.iffy += 1;

            // the closer to the end, the higher the cost
            let qnty = IFFY_SEG_LENGTH / fa.min(fb);
            info.cost += 140.0 * split_cost * (qnty * qnty - 1.0);
        }
    }

    /* handle sub-blocks recursively */

    if let Some(subs) = tree.subs.as_ref() {
        for sub in subs.iter() {
            if info.cost > best_cost {
                return true;
            }

            if !sub.empty() && eval_partition_worker(level, sub, part, split_cost, best_cost, info)
            {
                return true;
            }
        }
    }

    /* no "bad seg" was found */
    false
}

/// Cost of partitioning the group with `part`, accounting for splits,
/// left/right balance and precious linedefs.  Negative means the seg
/// should be skipped altogether.
fn eval_partition(
    level: &Level,
    tree: &QuadTree,
    part: &Seg,
    split_cost: f64,
    best_cost: f64,
) -> f64 {
    let mut info = EvalInfo::default();

    if eval_partition_worker(level, tree, part, split_cost, best_cost, &mut info) {
        return -1.0;
    }

    /* make sure there is at least one real seg on each side */
    if info.real_left == 0 || info.real_right == 0 {
        return -1.0;
    }

    /* increase cost by the difference between left & right */
    info.cost += 100.0 * (info.real_left - info.real_right).abs() as f64;

    // miniseg counts affect the outcome to a lesser degree
    info.cost += 50.0 * (info.mini_left - info.mini_right).abs() as f64;

    // show a slight preference for purely horizontal or purely
    // vertical partition lines
    if part.pdx != 0.0 && part.pdy != 0.0 {
        info.cost += 25.0;
    }

    info.cost
}

fn evaluate_fast_worker(
    level: &Level,
    tree: &QuadTree,
    best_h: &mut Option<SegId>,
    best_v: &mut Option<SegId>,
    mid_x: i32,
    mid_y: i32,
) {
    let mut cur = tree.list;
    while let Some(sid) = cur {
        let part = &level.segs[sid];
        cur = part.next;

        /* ignore minisegs as partition candidates */
        let Some(linedef) = part.linedef else {
            continue;
        };

        /* ignore self-ref and polyobj stuff as partition candidates */
        if level.linedefs[linedef].is_precious {
            continue;
        }

        if part.pdy == 0.0 {
            // horizontal seg
            let better = match *best_h {
                None => true,
                Some(old) => {
                    (part.psy - mid_y as f64).abs() < (level.segs[old].psy - mid_y as f64).abs()
                }
            };
            if better {
                *best_h = Some(sid);
            }
        } else if part.pdx == 0.0 {
            // vertical seg
            let better = match *best_v {
                None => true,
                Some(old) => {
                    (part.psx - mid_x as f64).abs() < (level.segs[old].psx - mid_x as f64).abs()
                }
            };
            if better {
                *best_v = Some(sid);
            }
        }
    }

    if let Some(subs) = tree.subs.as_ref() {
        for sub in subs.iter() {
            if !sub.empty() {
                evaluate_fast_worker(level, sub, best_h, best_v, mid_x, mid_y);
            }
        }
    }
}

/// Fast-mode shortcut: pick the axis-aligned seg closest to the
/// group's midpoint, which roughly halves it.  Saves heaps of time on
/// large levels.
fn find_fast_seg(level: &Level, tree: &QuadTree, split_cost: f64) -> Option<SegId> {
    let mut best_h = None;
    let mut best_v = None;

    let mid_x = (tree.x1 + tree.x2) / 2;
    let mid_y = (tree.y1 + tree.y2) / 2;

    evaluate_fast_worker(level, tree, &mut best_h, &mut best_v, mid_x, mid_y);

    let h_cost =
        best_h.map_or(-1.0, |sid| eval_partition(level, tree, &level.segs[sid], split_cost, 1.0e99));
    let v_cost =
        best_v.map_or(-1.0, |sid| eval_partition(level, tree, &level.segs[sid], split_cost, 1.0e99));

    if h_cost < 0.0 && v_cost < 0.0 {
        return None;
    }
    if h_cost < 0.0 {
        return best_v;
    }
    if v_cost < 0.0 {
        return best_h;
    }

    if v_cost < h_cost { best_v } else { best_h }
}

fn pick_node_worker(
    level: &Level,
    part_list: &QuadTree,
    tree: &QuadTree,
    split_cost: f64,
    best: &mut Option<SegId>,
    best_cost: &mut f64,
) {
    /* try each seg as partition */
    let mut cur = part_list.list;
    while let Some(sid) = cur {
        cur = level.segs[sid].next;

        /* ignore minisegs as partition candidates */
        if level.segs[sid].linedef.is_none() {
            continue;
        }

        let cost = eval_partition(level, tree, &level.segs[sid], split_cost, *best_cost);

        /* seg unsuitable or too costly? */
        if cost < 0.0 || cost >= *best_cost {
            continue;
        }

        *best_cost = cost;
        *best = Some(sid);
    }

    /* recursively handle sub-blocks */
    if let Some(subs) = part_list.subs.as_ref() {
        for sub in subs.iter() {
            if !sub.empty() {
                pick_node_worker(level, sub, tree, split_cost, best, best_cost);
            }
        }
    }
}

/// Find the best seg in the group to use as a partition line, or `None`
/// when the group is convex.
fn pick_node(level: &Level, tree: &QuadTree, split_cost: f64) -> Option<SegId> {
    if tree.real_num >= SEG_FAST_MODE_THRESHOLD {
        if let Some(best) = find_fast_seg(level, tree, split_cost) {
            return Some(best);
        }
    }

    let mut best = None;
    let mut best_cost = 1.0e99;

    pick_node_worker(level, tree, tree, split_cost, &mut best, &mut best_cost);

    best
}

/*--------------------------- space divider ---------------------------*/

/// Apply the partition line to one seg: move it into the left or right
/// list, or split it.  This must follow the exact same logic as the
/// partition evaluation above.
fn divide_one_seg(
    level: &mut Level,
    sid: SegId,
    part: &Seg,
    lefts: &mut Option<SegId>,
    rights: &mut Option<SegId>,
    cuts: &mut Vec<Intersection>,
) -> Result<(), BuildError> {
    let seg = &level.segs[sid];

    /* get state of lines' relation to each other */
    let mut a = part.perpendicular_distance(seg.psx, seg.psy);
    let mut b = part.perpendicular_distance(seg.pex, seg.pey);

    let self_ref = seg
        .linedef
        .is_some_and(|ld| level.linedefs[ld].self_referencing);

    if seg.source_line == part.source_line {
        a = 0.0;
        b = 0.0;
    }

    let (start, end) = (seg.start, seg.end);
    let (pdx, pdy) = (seg.pdx, seg.pdy);

    /* check for being on the same line */
    if a.abs() <= EPSILON && b.abs() <= EPSILON {
        add_intersection(level, cuts, start, part, self_ref);
        add_intersection(level, cuts, end, part, self_ref);

        // same direction as the partition, or the opposite?
        if pdx * part.pdx + pdy * part.pdy < 0.0 {
            list_add_seg(&mut level.segs, lefts, sid);
        } else {
            list_add_seg(&mut level.segs, rights, sid);
        }
        return Ok(());
    }

    /* check for right side */
    if a > -EPSILON && b > -EPSILON {
        if a < EPSILON {
            add_intersection(level, cuts, start, part, self_ref);
        } else if b < EPSILON {
            add_intersection(level, cuts, end, part, self_ref);
        }

        list_add_seg(&mut level.segs, rights, sid);
        return Ok(());
    }

    /* check for left side */
    if a < EPSILON && b < EPSILON {
        if a > -EPSILON {
            add_intersection(level, cuts, start, part, self_ref);
        } else if b > -EPSILON {
            add_intersection(level, cuts, end, part, self_ref);
        }

        list_add_seg(&mut level.segs, lefts, sid);
        return Ok(());
    }

    // a and b are non-zero and of opposite sign: the seg is split by
    // the partition line

    let (x, y) = compute_intersection(&level.segs[sid], part, a, b);

    let new_sid = split_seg(level, sid, x, y)?;

    let split_vert = level.segs[sid].end;
    add_intersection(level, cuts, split_vert, part, self_ref);

    if a < 0.0 {
        list_add_seg(&mut level.segs, lefts, sid);
        list_add_seg(&mut level.segs, rights, new_sid);
    } else {
        list_add_seg(&mut level.segs, rights, sid);
        list_add_seg(&mut level.segs, lefts, new_sid);
    }

    Ok(())
}

/// Drain the quad tree, routing every seg into the left or right group
/// and collecting the intersections with the partition line.
fn separate_segs(
    level: &mut Level,
    tree: &mut QuadTree,
    part: &Seg,
    lefts: &mut Option<SegId>,
    rights: &mut Option<SegId>,
    cuts: &mut Vec<Intersection>,
) -> Result<(), BuildError> {
    while let Some(sid) = tree.list {
        tree.list = level.segs[sid].next;
        divide_one_seg(level, sid, part, lefts, rights, cuts)?;
    }

    if let Some(subs) = tree.subs.as_mut() {
        separate_segs(level, &mut subs[0], part, lefts, rights, cuts)?;
        separate_segs(level, &mut subs[1], part, lefts, rights, cuts)?;
    }

    // this quad tree is empty now
    Ok(())
}

/// Walk the sorted intersection list and seal every open gap with a
/// pair of minisegs, one per side of the partition.
fn add_minisegs(
    level: &mut Level,
    cuts: &[Intersection],
    part: &Seg,
    lefts: &mut Option<SegId>,
    rights: &mut Option<SegId>,
) -> Result<(), BuildError> {
    for pair in cuts.windows(2) {
        let (cut, next) = (&pair[0], &pair[1]);

        let len = next.along_dist - cut.along_dist;
        if len < -0.001 {
            return Err(BuildError::BadIntersectionOrder(
                cut.along_dist,
                next.along_dist,
            ));
        }

        let a = cut.open_after;
        let b = next.open_before;

        // nothing possible when both ends are closed
        if !(a || b) {
            continue;
        }

        if a != b {
            // a mismatch indicates something wrong with the level
            // geometry, not worth warning about
            debug!(
                "open/closed mismatch on partition at dist {:.2}..{:.2}",
                cut.along_dist, next.along_dist
            );
            continue;
        }

        // definite open space: create a miniseg pair
        let seg = new_seg(level);
        let buddy = new_seg(level);

        {
            let s = &mut level.segs[seg];
            s.partner = Some(buddy);
            s.start = cut.vertex;
            s.end = next.vertex;
            s.linedef = None;
            s.side = 0;
            s.index = None;
            s.source_line = part.source_line;
        }
        {
            let b = &mut level.segs[buddy];
            b.partner = Some(seg);
            b.start = next.vertex;
            b.end = cut.vertex;
            b.linedef = None;
            b.side = 0;
            b.index = None;
            b.source_line = part.source_line;
        }

        level.recompute_seg(seg)?;
        level.recompute_seg(buddy)?;

        list_add_seg(&mut level.segs, rights, seg);
        list_add_seg(&mut level.segs, lefts, buddy);
    }

    Ok(())
}

/*------------------------- recursive builder -------------------------*/

/// Integer bounding box of a seg list, expanded a little on every side.
fn find_limits(level: &Level, mut list: Option<SegId>) -> Bounds {
    if list.is_none() {
        return Bounds {
            min_x: 0,
            min_y: 0,
            max_x: 4,
            max_y: 4,
        };
    }

    let mut bbox = Bounds {
        min_x: i32::from(i16::MAX),
        min_y: i32::from(i16::MAX),
        max_x: i32::from(i16::MIN),
        max_y: i32::from(i16::MIN),
    };

    while let Some(sid) = list {
        let seg = &level.segs[sid];
        list = seg.next;

        let s = level.vertices[seg.start].pos;
        let e = level.vertices[seg.end].pos;

        let lx = (s.x.min(e.x) - 0.2).floor() as i32;
        let ly = (s.y.min(e.y) - 0.2).floor() as i32;
        let hx = (s.x.max(e.x) + 0.2).ceil() as i32;
        let hy = (s.y.max(e.y) + 0.2).ceil() as i32;

        bbox.min_x = bbox.min_x.min(lx);
        bbox.min_y = bbox.min_y.min(ly);
        bbox.max_x = bbox.max_x.max(hx);
        bbox.max_y = bbox.max_y.max(hy);
    }

    bbox
}

/// Copy the partition line into the node, taking it from the seg's
/// linedef so both sides of a two-sided line give the same line.
fn set_partition(level: &mut Level, node_id: usize, part_sid: SegId) {
    let part = &level.segs[part_sid];
    let line = &level.linedefs[part.linedef.expect("partition seg must be real")];

    let s = level.vertices[line.start].pos;
    let e = level.vertices[line.end].pos;

    let (x, y, mut dx, mut dy) = if part.side == 0 {
        (s.x, s.y, e.x - s.x, e.y - s.y)
    } else {
        (e.x, e.y, s.x - e.x, s.y - e.y)
    };

    /* check for very long partition (overflow of dx,dy in the lump) */
    if dx.abs() > 32766.0 || dy.abs() > 32766.0 {
        // output coordinates are 16.16 fixed point, so the delta still
        // needs reducing
        dx /= 2.0;
        dy /= 2.0;
    }

    let node = &mut level.nodes[node_id];
    node.x = x;
    node.y = y;
    node.dx = dx;
    node.dy = dy;
}

fn create_subsec(level: &mut Level, tree: &mut QuadTree) -> SubsectorId {
    let index = level.subsectors.len();
    level.subsectors.push(Subsector {
        seg_list: None,
        seg_count: 0,
        index,
        mid: glam::DVec2::ZERO,
    });

    let mut list = None;
    tree.convert_to_list(level, &mut list);
    level.subsectors[index].seg_list = list;

    determine_middle(level, index);

    index
}

/// Build a BSP subtree from a list of loose segs: a subsector when the
/// group is convex, otherwise a node with two recursively built sides.
pub fn build_nodes(
    level: &mut Level,
    list: Option<SegId>,
    depth: usize,
    config: &BuildConfig,
    cancel: &AtomicBool,
) -> Result<Child, BuildError> {
    if cancel.load(Ordering::Relaxed) {
        return Err(BuildError::Cancelled);
    }

    let bounds = find_limits(level, list);

    let mut tree = QuadTree::new(bounds.min_x, bounds.min_y, bounds.max_x, bounds.max_y);
    tree.add_list(level, list);

    /* pick a partition line; none indicates convexity */
    let Some(part_sid) = pick_node(level, &tree, f64::from(config.split_cost)) else {
        let subsec = create_subsec(level, &mut tree);
        return Ok(Child {
            node: None,
            subsec: Some(subsec),
            bounds,
        });
    };

    let node_id = level.nodes.len();
    level.nodes.push(Node {
        x: 0.0,
        y: 0.0,
        dx: 0.0,
        dy: 0.0,
        right: Child::default(),
        left: Child::default(),
        index: None,
    });
    set_partition(level, node_id, part_sid);

    /* divide the segs into two lists: left & right */
    let part = level.segs[part_sid].clone();

    let mut lefts = None;
    let mut rights = None;
    let mut cuts = Vec::new();

    separate_segs(level, &mut tree, &part, &mut lefts, &mut rights, &mut cuts)?;
    drop(tree);

    if !cuts.is_empty() {
        add_minisegs(level, &cuts, &part, &mut lefts, &mut rights)?;
    }

    if lefts.is_none() {
        return Err(BuildError::EmptySide("left"));
    }
    if rights.is_none() {
        return Err(BuildError::EmptySide("right"));
    }

    let left = build_nodes(level, lefts, depth + 1, config, cancel)?;
    level.nodes[node_id].left = left;

    let right = build_nodes(level, rights, depth + 1, config, cancel)?;
    level.nodes[node_id].right = right;

    Ok(Child {
        node: Some(node_id),
        subsec: None,
        bounds,
    })
}

/// Height of the BSP tree, for reporting only.
pub fn compute_bsp_height(level: &Level, node: Option<usize>) -> usize {
    match node {
        None => 1,
        Some(nid) => {
            let right = compute_bsp_height(level, level.nodes[nid].right.node);
            let left = compute_bsp_height(level, level.nodes[nid].left.node);
            right.max(left) + 1
        }
    }
}

/*------------------------ subsector finalizer ------------------------*/

fn determine_middle(level: &mut Level, ssid: SubsectorId) {
    let mut mid = glam::DVec2::ZERO;
    let mut total = 0;

    let mut cur = level.subsectors[ssid].seg_list;
    while let Some(sid) = cur {
        let seg = &level.segs[sid];
        mid += level.vertices[seg.start].pos + level.vertices[seg.end].pos;
        total += 2;
        cur = seg.next;
    }

    if total > 0 {
        mid /= f64::from(total);
    }

    level.subsectors[ssid].mid = mid;
}

fn clockwise_order(level: &mut Level, ssid: SubsectorId) {
    let mid = level.subsectors[ssid].mid;

    let mut array = Vec::new();
    let mut cur = level.subsectors[ssid].seg_list;
    while let Some(sid) = cur {
        let start = level.vertices[level.segs[sid].start].pos;
        level.segs[sid].cmp_angle = compute_angle(start.x - mid.x, start.y - mid.y);
        array.push(sid);
        cur = level.segs[sid].next;
    }

    // sort by the angle from the middle point to the start vertex;
    // clockwise means descending angles.  Subsectors are small, so a
    // bubble sort is fast enough.
    let mut i = 0;
    while i + 1 < array.len() {
        if level.segs[array[i]].cmp_angle < level.segs[array[i + 1]].cmp_angle {
            array.swap(i, i + 1);
            i = i.saturating_sub(1);
        } else {
            i += 1;
        }
    }

    // choose the seg that will be first: the engine typically uses it
    // to determine the sector, and self-referencing linedefs (often
    // deep-water tricks) make a poor choice
    let mut first = 0;
    let mut score = -1;

    for (i, &sid) in array.iter().enumerate() {
        let cur_score = match level.segs[sid].linedef {
            None => 0,
            Some(ld) if level.linedefs[ld].self_referencing => 2,
            Some(_) => 3,
        };

        if cur_score > score {
            first = i;
            score = cur_score;
        }
    }

    // relink the list in sorted order, rotated so `first` leads
    level.subsectors[ssid].seg_list = None;
    let mut tail: Option<SegId> = None;

    for i in 0..array.len() {
        let sid = array[(first + i) % array.len()];
        level.segs[sid].next = None;

        match tail {
            None => level.subsectors[ssid].seg_list = Some(sid),
            Some(prev) => level.segs[prev].next = Some(sid),
        }
        tail = Some(sid);
    }
}

fn renumber_segs(level: &mut Level, ssid: SubsectorId, next_index: &mut usize) {
    let mut count = 0;

    let mut cur = level.subsectors[ssid].seg_list;
    while let Some(sid) = cur {
        level.segs[sid].index = Some(*next_index);
        *next_index += 1;
        count += 1;
        cur = level.segs[sid].next;
    }

    level.subsectors[ssid].seg_count = count;
}

fn sanity_check_closed(level: &Level, ssid: SubsectorId, stats: &mut BuildStats) {
    let sub = &level.subsectors[ssid];

    let mut gaps = 0;
    let mut total = 0;

    let mut cur = sub.seg_list;
    while let Some(sid) = cur {
        let next = level.segs[sid].next.or(sub.seg_list).unwrap();

        let e = level.vertices[level.segs[sid].end].pos;
        let s = level.vertices[level.segs[next].start].pos;

        if (e.x - s.x).abs() > EPSILON || (e.y - s.y).abs() > EPSILON {
            gaps += 1;
        }

        total += 1;
        cur = level.segs[sid].next;
    }

    if gaps > 0 {
        warn!(
            "subsector #{} near ({:.1},{:.1}) is not closed ({gaps} gaps, {total} segs)",
            sub.index, sub.mid.x, sub.mid.y
        );
        stats.minor_issues += 1;
    }
}

fn sanity_check_has_real_seg(level: &Level, ssid: SubsectorId) -> Result<(), BuildError> {
    let mut cur = level.subsectors[ssid].seg_list;
    while let Some(sid) = cur {
        if level.segs[sid].linedef.is_some() {
            return Ok(());
        }
        cur = level.segs[sid].next;
    }

    Err(BuildError::DegenerateSubsector(ssid))
}

/// Put every subsector's segs into clockwise order and renumber them.
///
/// This cannot happen during `build_nodes`, because splitting a seg
/// with a partner inserts another seg into the partner's list, usually
/// in the wrong place order-wise.
pub fn clockwise_bsp_tree(level: &mut Level, stats: &mut BuildStats) -> Result<(), BuildError> {
    let mut next_index = 0;

    for ssid in 0..level.subsectors.len() {
        clockwise_order(level, ssid);
        renumber_segs(level, ssid, &mut next_index);

        sanity_check_closed(level, ssid, stats);
        sanity_check_has_real_seg(level, ssid)?;
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bsp::analyze;
    use crate::wad::level::{GeoLinedef, GeoSidedef, GeoVertex, LevelGeometry, MapFormat};

    /// Square room, vertices CCW from the origin, one-sided walls.
    fn square_geometry(size: f64) -> LevelGeometry {
        LevelGeometry {
            name: "TEST".into(),
            format: MapFormat::Doom,
            vertices: vec![
                GeoVertex { x: 0.0, y: 0.0 },
                GeoVertex { x: size, y: 0.0 },
                GeoVertex { x: size, y: size },
                GeoVertex { x: 0.0, y: size },
            ],
            num_sectors: 1,
            sidedefs: vec![GeoSidedef { sector: 0 }],
            linedefs: (0..4)
                .map(|i| GeoLinedef {
                    start: i,
                    end: (i + 1) % 4,
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

    fn prepared_level(geo: &LevelGeometry) -> (Level, Option<SegId>) {
        let mut level = Level::load(geo).unwrap();
        analyze::detect_overlapping_vertices(&mut level);
        analyze::detect_overlapping_lines(&mut level);
        analyze::calculate_wall_tips(&mut level);

        let mut stats = BuildStats::default();
        let list = create_segs(&mut level, &mut stats).unwrap();
        (level, list)
    }

    fn collect(level: &Level, mut list: Option<SegId>) -> Vec<SegId> {
        let mut out = Vec::new();
        while let Some(sid) = list {
            out.push(sid);
            list = level.segs[sid].next;
        }
        out
    }

    #[test]
    fn one_sided_lines_make_one_seg_each() {
        let (level, list) = prepared_level(&square_geometry(256.0));
        assert_eq!(collect(&level, list).len(), 4);
        assert!(level.segs.iter().all(|s| s.partner.is_none()));
    }

    #[test]
    fn two_sided_line_couples_partners() {
        let mut geo = square_geometry(256.0);
        geo.sidedefs.push(GeoSidedef { sector: 0 });
        geo.linedefs.push(GeoLinedef {
            start: 0,
            end: 2,
            two_sided: true,
            special: 0,
            tag: 0,
            right: 0,
            left: 1,
        });

        let (level, list) = prepared_level(&geo);
        assert_eq!(collect(&level, list).len(), 6);

        let right = level.segs.iter().position(|s| s.side == 0 && s.partner.is_some());
        let right = right.expect("two-sided seg missing");
        let left = level.segs[right].partner.unwrap();

        assert_eq!(level.segs[left].partner, Some(right));
        assert_eq!(level.segs[right].start, level.segs[left].end);
        assert_eq!(level.segs[right].end, level.segs[left].start);
    }

    #[test]
    fn bogus_two_sided_flag_is_cleared() {
        let mut geo = square_geometry(256.0);
        geo.linedefs[0].two_sided = true; // but no left sidedef

        let (level, _) = prepared_level(&geo);
        assert!(!level.linedefs[0].two_sided);
    }

    #[test]
    fn split_keeps_partner_symmetry() {
        let mut geo = square_geometry(256.0);
        geo.sidedefs.push(GeoSidedef { sector: 0 });
        geo.linedefs.push(GeoLinedef {
            start: 0,
            end: 2,
            two_sided: true,
            special: 0,
            tag: 0,
            right: 0,
            left: 1,
        });

        let (mut level, _) = prepared_level(&geo);

        let sid = level
            .segs
            .iter()
            .position(|s| s.side == 0 && s.partner.is_some())
            .unwrap();
        let pid = level.segs[sid].partner.unwrap();

        let tail = split_seg(&mut level, sid, 128.0, 128.0).unwrap();
        let partner_tail = level.segs[tail].partner.unwrap();

        // old pair still coupled, new pair coupled
        assert_eq!(level.segs[sid].partner, Some(pid));
        assert_eq!(level.segs[pid].partner, Some(sid));
        assert_eq!(level.segs[partner_tail].partner, Some(tail));

        // all four halves share the split vertex
        let v = level.segs[sid].end;
        assert_eq!(level.segs[tail].start, v);
        assert_eq!(level.segs[pid].start, v);
        assert_eq!(level.segs[partner_tail].end, v);

        // the partner's tail was linked right after the partner
        assert_eq!(level.segs[pid].next, Some(partner_tail));

        assert!(level.vertices[v].is_new);
        assert_eq!(level.num_new_vert, 1);

        for s in [sid, tail, pid, partner_tail] {
            assert!(level.segs[s].p_length > 0.0);
        }
    }

    #[test]
    fn quad_tree_classifies_boxes() {
        let (mut level, list) = prepared_level(&square_geometry(256.0));
        let mut tree = QuadTree::new(0, 0, 256, 256);
        tree.add_list(&mut level, list);

        assert_eq!(tree.real_num, 4);
        assert_eq!(tree.mini_num, 0);

        // partition along the bottom wall, pointing east: the box
        // straddles the line only when it reaches y = 0
        let bottom = level
            .segs
            .iter()
            .position(|s| s.psy == 0.0 && s.pey == 0.0)
            .unwrap();
        let part = level.segs[bottom].clone();

        let above = QuadTree::new(0, 64, 256, 256);
        let below = QuadTree::new(0, -256, 256, -64);
        let across = QuadTree::new(0, -64, 256, 64);

        assert_eq!(above.on_line_side(&part), -1);
        assert_eq!(below.on_line_side(&part), 1);
        assert_eq!(across.on_line_side(&part), 0);
    }

    #[test]
    fn convex_group_has_no_partition() {
        let (mut level, list) = prepared_level(&square_geometry(256.0));
        let bounds = find_limits(&level, list);
        let mut tree = QuadTree::new(bounds.min_x, bounds.min_y, bounds.max_x, bounds.max_y);
        tree.add_list(&mut level, list);

        assert_eq!(pick_node(&level, &tree, 11.0), None);
    }

    #[test]
    fn two_sided_diagonal_is_chosen_as_partition() {
        let mut geo = square_geometry(256.0);
        geo.num_sectors = 2;
        geo.sidedefs.push(GeoSidedef { sector: 1 });
        geo.linedefs.push(GeoLinedef {
            start: 0,
            end: 2,
            two_sided: true,
            special: 0,
            tag: 0,
            right: 0,
            left: 1,
        });

        let (mut level, list) = prepared_level(&geo);
        let bounds = find_limits(&level, list);
        let mut tree = QuadTree::new(bounds.min_x, bounds.min_y, bounds.max_x, bounds.max_y);
        tree.add_list(&mut level, list);

        let part = pick_node(&level, &tree, 11.0).expect("partition expected");
        assert_eq!(level.segs[part].linedef, Some(4));
    }

    #[test]
    fn intersections_stay_sorted_and_merge_duplicates() {
        let (mut level, _) = prepared_level(&square_geometry(256.0));
        let bottom = level
            .segs
            .iter()
            .position(|s| s.psy == 0.0 && s.pey == 0.0)
            .unwrap();
        let part = level.segs[bottom].clone();

        // three vertices along the bottom edge, inserted out of order
        let far = analyze::new_vertex_from_split_seg(&mut level, bottom, 200.0, 0.0);
        let near = analyze::new_vertex_from_split_seg(&mut level, bottom, 50.0, 0.0);
        let dup = analyze::new_vertex_from_split_seg(&mut level, bottom, 200.0, 0.0);

        let mut cuts = Vec::new();
        add_intersection(&level, &mut cuts, far, &part, false);
        add_intersection(&level, &mut cuts, near, &part, false);
        add_intersection(&level, &mut cuts, dup, &part, false);

        assert_eq!(cuts.len(), 2);
        assert!(cuts[0].along_dist < cuts[1].along_dist);
        assert_eq!(cuts[0].vertex, near);
        assert_eq!(cuts[1].vertex, far);
    }

    #[test]
    fn bad_intersection_order_is_reported() {
        let (mut level, _) = prepared_level(&square_geometry(256.0));
        let bottom = level
            .segs
            .iter()
            .position(|s| s.psy == 0.0 && s.pey == 0.0)
            .unwrap();
        let part = level.segs[bottom].clone();

        let a = analyze::new_vertex_from_split_seg(&mut level, bottom, 50.0, 0.0);
        let b = analyze::new_vertex_from_split_seg(&mut level, bottom, 200.0, 0.0);

        let cuts = vec![
            Intersection {
                vertex: b,
                along_dist: 200.0,
                self_ref: false,
                open_before: true,
                open_after: true,
            },
            Intersection {
                vertex: a,
                along_dist: 50.0,
                self_ref: false,
                open_before: true,
                open_after: true,
            },
        ];

        let mut lefts = None;
        let mut rights = None;
        let err = add_minisegs(&mut level, &cuts, &part, &mut lefts, &mut rights).unwrap_err();
        assert!(matches!(err, BuildError::BadIntersectionOrder(..)));
    }

    #[test]
    fn axis_intersection_uses_exact_coordinates() {
        let (level, _) = prepared_level(&square_geometry(256.0));

        // vertical partition x=128 against the horizontal bottom wall
        let mut part = level.segs[0].clone();
        part.psx = 128.0;
        part.psy = 0.0;
        part.pdx = 0.0;
        part.pdy = 256.0;

        let bottom = level
            .segs
            .iter()
            .find(|s| s.psy == 0.0 && s.pey == 0.0)
            .unwrap();

        let (x, y) = compute_intersection(bottom, &part, -1.0, 1.0);
        assert_eq!((x, y), (128.0, 0.0));
    }
}
