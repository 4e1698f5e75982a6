//! Stencil bundles
//!
//! A bundle is a group of stencil equations sharing a sub-domain predicate
//! and a step predicate, evaluated together through one kernel table. A
//! bundle with a non-trivial sub-domain predicate is decomposed into a list
//! of solid bounding boxes so it can execute as dense loops.

use crate::expr::PredExpr;
use crate::kernels::{KernelTable, VarRef};
use data::bounds::{BBList, BoundingBox};
use data::dims::DimSet;
use data::indices::Indices;
use rayon::prelude::*;

/// One group of stencil equations
pub struct Bundle {
    pub name: String,

    /// Vars read by the kernels
    pub inputs: Vec<VarRef>,

    /// Vars written by the kernels
    pub outputs: Vec<VarRef>,

    /// Scratch bundles evaluated before this one, in order
    pub scratch_children: Vec<usize>,

    /// Bundles that must be evaluated in an earlier pack position
    pub depends_on: Vec<usize>,

    /// Whether this bundle updates scratch vars
    pub is_scratch: bool,

    /// Where in the domain the equations apply
    pub sub_domain: PredExpr,

    /// Which steps the equations apply at; `None` means every step
    pub step_cond: Option<PredExpr>,

    /// Output step = input step + this shift (normally +1)
    pub output_step_shift: i64,

    /// Inner kernels from the stencil compiler
    pub kernels: KernelTable,

    /// Estimated FP ops per point evaluation
    pub scalar_fp_ops: i64,

    /// Var reads per point evaluation
    pub points_read: i64,

    /// Var writes per point evaluation
    pub points_written: i64,

    /// Overall bounding box; may contain invalid points
    pub bb: BoundingBox,

    /// Non-overlapping solid cover of the valid points
    pub bb_list: BBList,
}
//
impl Bundle {
    /// Whether a domain point satisfies the sub-domain predicate
    #[inline]
    pub fn is_in_valid_domain(&self, point: &Indices) -> bool {
        self.sub_domain.eval(point)
    }

    /// Whether the sub-domain predicate is non-trivial
    pub fn is_sub_domain_expr(&self) -> bool {
        !self.sub_domain.is_all()
    }

    /// Whether the bundle applies at the given step
    #[inline]
    pub fn is_in_valid_step(&self, t: i64) -> bool {
        match &self.step_cond {
            None => true,
            Some(cond) => cond.eval(&Indices::from_slice(&[t])),
        }
    }

    /// Whether a step predicate is present
    pub fn is_step_cond_expr(&self) -> bool {
        self.step_cond.is_some()
    }

    /// Step index written when evaluating input step `t`
    pub fn output_step_index(&self, t: i64) -> i64 {
        t + self.output_step_shift
    }

    /// Human-readable sub-domain description
    pub fn domain_description(&self, dims: &DimSet) -> String {
        self.sub_domain.describe(dims.domain_dims())
    }

    /// Copy the bounding boxes from a bundle with an identical predicate
    pub fn copy_bounding_box(&mut self, src: &Bundle) {
        self.bb = src.bb.clone();
        self.bb_list = src.bb_list.clone();
    }

    /// Find this bundle's bounding boxes within the extended rank box
    ///
    /// Solid bundles take the whole extended box. For a sub-domain
    /// predicate, the box is sliced into per-thread slabs along the outer
    /// dim; each slab greedily grows maximal solid rectangles, and abutting
    /// rectangles are merged across slab boundaries. The resulting list
    /// covers exactly the valid points, with no overlap.
    pub fn find_bounding_box(
        &mut self,
        dims: &DimSet,
        ext_bb: &BoundingBox,
        rank_offsets: &Indices,
        nthreads: usize,
    ) {
        self.bb = ext_bb.clone();
        self.bb_list.clear();
        if self.bb.size == 0 {
            return;
        }

        if !self.is_sub_domain_expr() {
            log::trace!(
                "bundle '{}': solid; using 1 box {}",
                self.name,
                self.bb.make_range_string()
            );
            self.bb_list.push(self.bb.clone());
            return;
        }

        // Slice the outer dim into one slab per thread.
        let outer_len = self.bb.len[0];
        let nthreads = (nthreads as i64).clamp(1, outer_len.max(1));
        let len_per_thr = data::math::ceil_div(outer_len, nthreads);

        let slab_lists: Vec<BBList> = (0..nthreads)
            .into_par_iter()
            .map(|slab| {
                let mut begin = self.bb.begin.clone();
                let mut end = self.bb.end.clone();
                begin[0] = self.bb.begin[0] + slab * len_per_thr;
                end[0] = end[0].min(begin[0] + len_per_thr);
                if end[0] <= begin[0] {
                    return Vec::new();
                }
                self.find_rects_in_slab(dims, &begin, &end, rank_offsets)
            })
            .collect();

        // Merge the per-slab rectangles, fusing boxes that abut in the
        // outer dim and match in every other dim.
        self.bb.num_points = 0;
        let mut have_extent = false;
        for slab_list in slab_lists {
            for bbn in slab_list {
                if bbn.size == 0 {
                    continue;
                }
                if !have_extent {
                    self.bb.begin = bbn.begin.clone();
                    self.bb.end = bbn.end.clone();
                    have_extent = true;
                } else {
                    self.bb.begin = self.bb.begin.min_elements(&bbn.begin);
                    self.bb.end = self.bb.end.max_elements(&bbn.end);
                }
                self.bb.num_points += bbn.size;

                let merged = self.bb_list.iter_mut().any(|bb| {
                    let fits = (0..bb.ndims()).all(|i| {
                        if i == 0 {
                            bb.end[0] == bbn.begin[0]
                        } else {
                            bb.begin[i] == bbn.begin[i] && bb.end[i] == bbn.end[i]
                        }
                    });
                    if fits {
                        bb.end[0] = bbn.end[0];
                        bb.update(dims, rank_offsets, true);
                    }
                    fits
                });
                if !merged {
                    self.bb_list.push(bbn);
                }
            }
        }
        self.bb.update(dims, rank_offsets, false);
        log::trace!(
            "bundle '{}': {} box(es) covering {} point(s)",
            self.name,
            self.bb_list.len(),
            self.bb.num_points
        );
    }

    /// Grow maximal solid rectangles inside one outer-dim slab
    fn find_rects_in_slab(
        &self,
        dims: &DimSet,
        slice_begin: &Indices,
        slice_end: &Indices,
        rank_offsets: &Indices,
    ) -> BBList {
        let nddims = slice_begin.len();
        let mut rects: BBList = Vec::new();

        let covered = |rects: &BBList, pt: &Indices| rects.iter().any(|bb| bb.contains(pt));

        // Scan lexicographically for uncovered valid begin points.
        let mut pt = slice_begin.clone();
        'scan: loop {
            if self.is_in_valid_domain(&pt) && !covered(&rects, &pt) {
                // Grow a maximal rectangle from 'pt' by trial expansion,
                // retreating on the first invalid or covered point.
                let mut scan_len = slice_end.sub(&pt);
                let mut do_scan = true;
                while do_scan {
                    do_scan = false;
                    let mut probe = Indices::new(nddims, 0);
                    'probe: loop {
                        let cand = pt.add(&probe);
                        let ok = self.is_in_valid_domain(&cand) && !covered(&rects, &cand);
                        if !ok {
                            // Retreat: trim the first dim where the probe
                            // has moved past the begin point.
                            for i in 0..nddims {
                                if cand[i] > pt[i] {
                                    scan_len[i] = cand[i] - pt[i];
                                    if i < nddims - 1 {
                                        do_scan = true;
                                    }
                                    break 'probe;
                                }
                            }
                            unreachable!("begin point itself must be valid");
                        }
                        // Advance first dim fastest; the retreat rule above
                        // relies on this order so that a trim in the last
                        // dim never invalidates already-verified points.
                        let mut d = 0;
                        loop {
                            if d == nddims {
                                break 'probe;
                            }
                            probe[d] += 1;
                            if probe[d] < scan_len[d] {
                                break;
                            }
                            probe[d] = 0;
                            d += 1;
                        }
                    }
                }
                let mut bb = BoundingBox::from_begin_end(pt.clone(), pt.add(&scan_len));
                bb.update(dims, rank_offsets, true);
                rects.push(bb);
            }

            // Advance the begin-point scan row-major within the slab.
            let mut d = nddims;
            loop {
                if d == 0 {
                    break 'scan;
                }
                d -= 1;
                pt[d] += 1;
                if pt[d] < slice_end[d] {
                    break;
                }
                pt[d] = slice_begin[d];
            }
        }
        rects
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::expr::{CmpOp, LinearForm, PredExpr};
    use crate::kernels::{KernelTable, ScalarFn};
    use std::sync::Arc;

    fn dims2d() -> DimSet {
        DimSet::new("t", &["x", "y"], &[]).unwrap()
    }

    fn noop_kernel() -> ScalarFn {
        Arc::new(|_, _| {})
    }

    fn bundle(pred: PredExpr) -> Bundle {
        let dims = dims2d();
        Bundle {
            name: "test".to_string(),
            inputs: Vec::new(),
            outputs: Vec::new(),
            scratch_children: Vec::new(),
            depends_on: Vec::new(),
            is_scratch: false,
            sub_domain: pred,
            step_cond: None,
            output_step_shift: 1,
            kernels: KernelTable::from_scalar(&dims, noop_kernel()),
            scalar_fp_ops: 1,
            points_read: 1,
            points_written: 1,
            bb: BoundingBox::new_empty(2),
            bb_list: Vec::new(),
        }
    }

    fn region16(dims: &DimSet) -> (BoundingBox, Indices) {
        let rank_offsets = Indices::from_slice(&[0, 0]);
        let mut bb = BoundingBox::from_begin_end(
            Indices::from_slice(&[0, 0]),
            Indices::from_slice(&[16, 16]),
        );
        bb.update(dims, &rank_offsets, true);
        (bb, rank_offsets)
    }

    #[test]
    fn solid_bundle_uses_one_box() {
        let dims = dims2d();
        let (bb, ofs) = region16(&dims);
        let mut b = bundle(PredExpr::All);
        b.find_bounding_box(&dims, &bb, &ofs, 4);
        assert_eq!(b.bb_list.len(), 1);
        assert_eq!(b.bb.num_points, 256);
    }

    #[test]
    fn checkerboard_predicate_tiles_exactly_half_the_points() {
        // "x + y even" over a 16x16 region: exactly 128 points.
        let dims = dims2d();
        let (bb, ofs) = region16(&dims);
        let mut b = bundle(PredExpr::ModEq {
            form: LinearForm::sum(2),
            modulus: 2,
            remainder: 0,
        });
        b.find_bounding_box(&dims, &bb, &ofs, 4);
        assert!(!b.bb_list.is_empty());
        let total: i64 = b.bb_list.iter().map(|r| r.size).sum();
        assert_eq!(total, 128);
        assert_eq!(b.bb.num_points, 128);

        // The cover contains exactly the valid points, with no overlap.
        for x in 0..16 {
            for y in 0..16 {
                let pt = Indices::from_slice(&[x, y]);
                let hits = b.bb_list.iter().filter(|r| r.contains(&pt)).count();
                assert_eq!(hits, usize::from((x + y) % 2 == 0), "point ({x},{y})");
            }
        }
    }

    #[test]
    fn half_plane_predicate_merges_into_one_box() {
        // x >= 8 over 16x16 is a single solid rectangle.
        let dims = dims2d();
        let (bb, ofs) = region16(&dims);
        let mut b = bundle(PredExpr::Cmp {
            form: LinearForm::dim(2, 0),
            op: CmpOp::Ge,
            rhs: 8,
        });
        b.find_bounding_box(&dims, &bb, &ofs, 4);
        let total: i64 = b.bb_list.iter().map(|r| r.size).sum();
        assert_eq!(total, 8 * 16);
        // Slabs merge across the outer dim into a single box.
        assert_eq!(b.bb_list.len(), 1);
        assert_eq!(b.bb_list[0].begin[0], 8);
        assert_eq!(b.bb_list[0].end[0], 16);
    }
}
