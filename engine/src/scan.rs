//! Scan spans and aligned tile iteration
//!
//! A [`ScanSpan`] carries the loop state of one tile level: the full
//! `begin`/`end` range, the `stride` (tile size), the alignment grid, and
//! the `start`/`stop` of the current tile. The first tile in each dim may
//! be short so that every subsequent tile start lands on the alignment
//! grid, which keeps vector clusters aligned across tiles.

use data::dims::DimSet;
use data::indices::Indices;
use data::math;

/// Loop state over the stencil dims (step dim at position 0)
#[derive(Clone, Debug)]
pub struct ScanSpan {
    /// First index of the full range
    pub begin: Indices,
    /// One past the last index of the full range
    pub end: Indices,
    /// Tile size in each dim
    pub stride: Indices,
    /// Alignment grid for tile starts
    pub align: Indices,
    /// Offset of the alignment grid (rank offsets for vectorized dims)
    pub align_ofs: Indices,
    /// Group size for grouped loop orders
    pub group_size: Indices,
    /// Start of the current tile
    pub start: Indices,
    /// Stop (one past last) of the current tile
    pub stop: Indices,
    /// Sequential tile counter per dim
    pub index: Indices,
}
//
impl ScanSpan {
    /// A unit-stride span of `ndims` dims
    pub fn new(ndims: usize) -> Self {
        Self {
            begin: Indices::new(ndims, 0),
            end: Indices::new(ndims, 0),
            stride: Indices::new(ndims, 1),
            align: Indices::new(ndims, 1),
            align_ofs: Indices::new(ndims, 0),
            group_size: Indices::new(ndims, 1),
            start: Indices::new(ndims, 0),
            stop: Indices::new(ndims, 0),
            index: Indices::new(ndims, 0),
        }
    }

    /// A span over the stencil dims of `dims`, optionally vector-aligned
    ///
    /// With `vec_align`, domain-dim alignment is set to the fold lengths;
    /// `ofs` supplies the alignment offsets (normally the rank offsets).
    pub fn new_for(dims: &DimSet, vec_align: bool, ofs: Option<&Indices>) -> Self {
        let n = dims.num_domain_dims() + 1;
        let mut span = Self::new(n);
        for j in 0..dims.num_domain_dims() {
            let i = j + 1;
            if vec_align {
                span.align[i] = dims.fold_len(j);
            }
            if let Some(o) = ofs {
                span.align_ofs[i] = o[j];
            }
        }
        span
    }

    /// Number of dims
    pub fn ndims(&self) -> usize {
        self.begin.len()
    }

    /// Make this span cover the current tile of an outer span
    pub fn init_from_outer(&mut self, outer: &ScanSpan) {
        self.begin = outer.start.clone();
        self.end = outer.stop.clone();
        self.start = outer.start.clone();
        self.stop = outer.stop.clone();
    }

    /// Whether the current `begin..end` range is empty in any dim
    pub fn is_empty(&self) -> bool {
        (0..self.ndims()).any(|i| self.end[i] <= self.begin[i])
    }

    /// Volume of the `begin..end` range over the given dims
    pub fn volume(&self, posns: std::ops::Range<usize>) -> i64 {
        posns
            .map(|i| (self.end[i] - self.begin[i]).max(0))
            .product()
    }
}

/// Tile boundaries along one dim: every `[start, stop)` chunk of the
/// aligned tiling of `[begin, end)` by `stride`
fn dim_tiles(begin: i64, end: i64, stride: i64, align: i64, align_ofs: i64) -> Vec<(i64, i64)> {
    let stride = stride.max(1);
    let align = align.max(1).min(stride);
    if end <= begin {
        return Vec::new();
    }
    // First tile start is 'begin'; subsequent starts sit on the alignment
    // grid advanced by whole strides.
    let grid0 = math::round_down(begin - align_ofs, align) + align_ofs;
    let mut tiles = Vec::new();
    let mut cur = grid0;
    while cur < end {
        let lo = cur.max(begin);
        let hi = (cur + stride).min(end);
        if hi > lo {
            tiles.push((lo, hi));
        }
        cur += stride;
    }
    tiles
}

/// Collect every tile of `span` across the dims in `posns`, row-major
///
/// The returned spans have `start`/`stop` describing one tile each, with
/// `begin`/`end` (and everything else) copied from the input. Dims outside
/// `posns` keep `start = begin`, `stop = end`.
pub fn collect_tiles(span: &ScanSpan, posns: std::ops::Range<usize>) -> Vec<ScanSpan> {
    let posns: Vec<usize> = posns.collect();
    let mut per_dim: Vec<Vec<(i64, i64)>> = Vec::with_capacity(posns.len());
    for &i in &posns {
        let t = dim_tiles(
            span.begin[i],
            span.end[i],
            span.stride[i],
            span.align[i],
            span.align_ofs[i],
        );
        if t.is_empty() {
            return Vec::new();
        }
        per_dim.push(t);
    }

    let total: usize = per_dim.iter().map(|t| t.len()).product();
    let mut tiles = Vec::with_capacity(total);
    let mut cursor = vec![0usize; posns.len()];
    for _ in 0..total {
        let mut tile = span.clone();
        for (k, &i) in posns.iter().enumerate() {
            let (lo, hi) = per_dim[k][cursor[k]];
            tile.start[i] = lo;
            tile.stop[i] = hi;
            tile.index[i] = cursor[k] as i64;
        }
        tiles.push(tile);
        for k in (0..cursor.len()).rev() {
            cursor[k] += 1;
            if cursor[k] < per_dim[k].len() {
                break;
            }
            cursor[k] = 0;
        }
    }
    tiles
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn unaligned_range_gets_short_first_tile() {
        // begin=3, stride=8, align=4: first tile [3,8), then [8,16), ...
        let tiles = dim_tiles(3, 20, 8, 4, 0);
        assert_eq!(tiles, vec![(3, 8), (8, 16), (16, 20)]);
    }

    #[test]
    fn aligned_range_tiles_evenly() {
        let tiles = dim_tiles(0, 16, 8, 8, 0);
        assert_eq!(tiles, vec![(0, 8), (8, 16)]);
    }

    #[test]
    fn alignment_offset_shifts_the_grid() {
        // Grid anchored at 2 with align 4: starts at 2, 6, 10, ...
        let tiles = dim_tiles(3, 11, 4, 4, 2);
        assert_eq!(tiles, vec![(3, 6), (6, 10), (10, 11)]);
    }

    #[test]
    fn tiles_cover_the_span_exactly_once() {
        let mut span = ScanSpan::new(3);
        span.begin = Indices::from_slice(&[0, 1, 2]);
        span.end = Indices::from_slice(&[1, 17, 13]);
        span.stride = Indices::from_slice(&[1, 8, 4]);
        span.align = Indices::from_slice(&[1, 4, 4]);
        span.start = span.begin.clone();
        span.stop = span.end.clone();

        let tiles = collect_tiles(&span, 1..3);
        let mut count = std::collections::HashMap::new();
        for t in &tiles {
            for a in t.start[1]..t.stop[1] {
                for b in t.start[2]..t.stop[2] {
                    *count.entry((a, b)).or_insert(0) += 1;
                }
            }
        }
        assert_eq!(count.len(), 16 * 11);
        assert!(count.values().all(|&c| c == 1));
    }

    #[test]
    fn empty_dim_yields_no_tiles() {
        let mut span = ScanSpan::new(2);
        span.begin = Indices::from_slice(&[0, 5]);
        span.end = Indices::from_slice(&[1, 5]);
        assert!(collect_tiles(&span, 1..2).is_empty());
    }
}
