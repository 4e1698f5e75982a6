//! Bounding boxes over the domain dims
//!
//! A [`BoundingBox`] is a half-open hyper-rectangle `[begin, end)` in global
//! domain coordinates. A [`BBList`] is a set of non-overlapping solid boxes
//! used to execute a bundle's sub-domain predicate as dense loops.

use crate::dims::DimSet;
use crate::indices::Indices;
use crate::math;

/// A half-open hyper-rectangle over the domain dims
#[derive(Clone, Debug, Default, PartialEq)]
pub struct BoundingBox {
    /// First point in each domain dim
    pub begin: Indices,

    /// One past the last point in each domain dim
    pub end: Indices,

    /// `end - begin`, cached by [`BoundingBox::update`]
    pub len: Indices,

    /// Product of the lengths
    pub size: i64,

    /// Number of valid points inside; equals `size` for a solid box
    pub num_points: i64,

    /// Whether every point inside is valid
    pub is_full: bool,

    /// Whether `begin` sits on vector-fold boundaries in every dim
    pub is_aligned: bool,

    /// Whether every length is a multiple of the cluster length
    pub is_cluster_mult: bool,

    /// Whether [`BoundingBox::update`] has been run since the last edit
    pub valid: bool,
}
//
impl BoundingBox {
    /// An empty box over `ndims` domain dims
    pub fn new_empty(ndims: usize) -> Self {
        Self {
            begin: Indices::new(ndims, 0),
            end: Indices::new(ndims, 0),
            len: Indices::new(ndims, 0),
            ..Self::default()
        }
    }

    /// A box spanning `[begin, end)`; call [`BoundingBox::update`] before
    /// reading the cached fields
    pub fn from_begin_end(begin: Indices, end: Indices) -> Self {
        let n = begin.len();
        Self {
            begin,
            end,
            len: Indices::new(n, 0),
            ..Self::default()
        }
    }

    /// Number of domain dims
    pub fn ndims(&self) -> usize {
        self.begin.len()
    }

    /// Recompute the cached descriptive fields
    ///
    /// `rank_offsets` gives the global index of the first rank-domain point
    /// in each dim, which is what fold alignment is measured against. When
    /// `force_full` is set, `num_points` is reset to the full size.
    pub fn update(&mut self, dims: &DimSet, rank_offsets: &Indices, force_full: bool) {
        self.len = self.end.sub(&self.begin).max_elements(&Indices::new(self.ndims(), 0));
        self.size = self.len.product();
        if force_full {
            self.num_points = self.size;
        }
        self.is_full = self.num_points == self.size;

        self.is_aligned = (0..self.ndims()).all(|j| {
            math::mod_flr(self.begin[j] - rank_offsets[j], dims.fold_len(j)) == 0
        });
        self.is_cluster_mult = (0..self.ndims())
            .all(|j| math::mod_flr(self.len[j], dims.cluster_pts(j)) == 0);
        self.valid = true;
    }

    /// Whether the point lies inside the box
    pub fn contains(&self, point: &Indices) -> bool {
        (0..self.ndims()).all(|j| point[j] >= self.begin[j] && point[j] < self.end[j])
    }

    /// Render as `[b0...e0) * [b1...e1) * ...`
    pub fn make_range_string(&self) -> String {
        (0..self.ndims())
            .map(|j| format!("[{}...{})", self.begin[j], self.end[j]))
            .collect::<Vec<_>>()
            .join(" * ")
    }
}

/// A cover of a sub-domain by non-overlapping solid boxes
pub type BBList = Vec<BoundingBox>;

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dims::DimSet;

    fn dims2d() -> DimSet {
        DimSet::with_layout("t", &["x", "y"], &[], &[1, 4], &[1, 2]).unwrap()
    }

    #[test]
    fn update_computes_descriptive_fields() {
        let dims = dims2d();
        let mut bb = BoundingBox::from_begin_end(
            Indices::from_slice(&[0, 0]),
            Indices::from_slice(&[16, 16]),
        );
        bb.update(&dims, &Indices::from_slice(&[0, 0]), true);
        assert_eq!(bb.size, 256);
        assert_eq!(bb.num_points, 256);
        assert!(bb.is_full);
        assert!(bb.is_aligned);
        assert!(bb.is_cluster_mult);
    }

    #[test]
    fn misaligned_begin_is_detected() {
        let dims = dims2d();
        let mut bb = BoundingBox::from_begin_end(
            Indices::from_slice(&[0, 1]),
            Indices::from_slice(&[8, 9]),
        );
        bb.update(&dims, &Indices::from_slice(&[0, 0]), true);
        assert!(!bb.is_aligned);
        assert!(!bb.is_cluster_mult);
    }

    #[test]
    fn containment_is_half_open() {
        let mut bb = BoundingBox::from_begin_end(
            Indices::from_slice(&[2, 2]),
            Indices::from_slice(&[4, 4]),
        );
        let dims = dims2d();
        bb.update(&dims, &Indices::from_slice(&[0, 0]), true);
        assert!(bb.contains(&Indices::from_slice(&[2, 3])));
        assert!(!bb.contains(&Indices::from_slice(&[4, 3])));
        assert!(!bb.contains(&Indices::from_slice(&[1, 3])));
    }
}
