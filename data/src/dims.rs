//! Named dimension sets
//!
//! A solution's dimensions are partitioned into one step dim (usually time),
//! an ordered list of domain dims, and an unordered set of misc dims. The
//! SIMD fold lengths are attached to the domain dims; their product is the
//! vector length. All of this is fixed when the solution is constructed.

use crate::error::{Error, Result};
use crate::indices::Indices;
use std::collections::HashSet;

/// Which of the three groups a dimension belongs to
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum DimKind {
    /// The single stepping dimension (usually time)
    Step,
    /// An ordered spatial domain dimension
    Domain,
    /// Any other (indexing-only) dimension
    Misc,
}

/// The complete set of dimensions known to a solution
#[derive(Clone, Debug)]
pub struct DimSet {
    step_dim: String,
    domain_dims: Vec<String>,
    misc_dims: Vec<String>,

    /// SIMD fold length per domain dim; product is the vector length
    fold_lens: Vec<i64>,

    /// Vectors per cluster in each domain dim
    cluster_mults: Vec<i64>,
}
//
impl DimSet {
    /// Build a dimension set with unit folds and clusters everywhere
    pub fn new(
        step_dim: impl Into<String>,
        domain_dims: &[&str],
        misc_dims: &[&str],
    ) -> Result<Self> {
        let folds = vec![1; domain_dims.len()];
        let clusters = vec![1; domain_dims.len()];
        Self::with_layout(step_dim, domain_dims, misc_dims, &folds, &clusters)
    }

    /// Build a dimension set with explicit fold lengths and cluster multiples
    ///
    /// Fold lengths and cluster multiples are given per domain dim, in domain
    /// dim order. Dimension names must be unique across all three groups.
    pub fn with_layout(
        step_dim: impl Into<String>,
        domain_dims: &[&str],
        misc_dims: &[&str],
        fold_lens: &[i64],
        cluster_mults: &[i64],
    ) -> Result<Self> {
        let step_dim = step_dim.into();
        if domain_dims.is_empty() {
            return Err(Error::config("at least one domain dimension is required"));
        }
        if fold_lens.len() != domain_dims.len() || cluster_mults.len() != domain_dims.len() {
            return Err(Error::config(
                "fold lengths and cluster multiples must be given per domain dimension",
            ));
        }
        if fold_lens.iter().any(|&f| f < 1) || cluster_mults.iter().any(|&c| c < 1) {
            return Err(Error::config(
                "fold lengths and cluster multiples must be positive",
            ));
        }

        // Dim names must be unique within and across groups.
        let mut seen = HashSet::new();
        for name in std::iter::once(step_dim.as_str())
            .chain(domain_dims.iter().copied())
            .chain(misc_dims.iter().copied())
        {
            if !seen.insert(name.to_string()) {
                return Err(Error::DimMismatch(format!(
                    "dimension name '{name}' is used more than once"
                )));
            }
        }

        Ok(Self {
            step_dim,
            domain_dims: domain_dims.iter().map(|s| s.to_string()).collect(),
            misc_dims: misc_dims.iter().map(|s| s.to_string()).collect(),
            fold_lens: fold_lens.to_vec(),
            cluster_mults: cluster_mults.to_vec(),
        })
    }

    /// Name of the step dimension
    pub fn step_dim(&self) -> &str {
        &self.step_dim
    }

    /// Ordered names of the domain dimensions
    pub fn domain_dims(&self) -> &[String] {
        &self.domain_dims
    }

    /// Names of the misc dimensions
    pub fn misc_dims(&self) -> &[String] {
        &self.misc_dims
    }

    /// Number of domain dimensions
    pub fn num_domain_dims(&self) -> usize {
        self.domain_dims.len()
    }

    /// Position of the inner (last) domain dim, the one scanned by the
    /// innermost loops
    pub fn inner_posn(&self) -> usize {
        self.domain_dims.len() - 1
    }

    /// SIMD fold length in domain dim `j`
    pub fn fold_len(&self, j: usize) -> i64 {
        self.fold_lens[j]
    }

    /// All fold lengths, in domain dim order
    pub fn fold_lens(&self) -> &[i64] {
        &self.fold_lens
    }

    /// Total vector length: the product of all fold lengths
    pub fn vec_len(&self) -> i64 {
        self.fold_lens.iter().product()
    }

    /// Vectors per cluster in domain dim `j`
    pub fn cluster_mult(&self, j: usize) -> i64 {
        self.cluster_mults[j]
    }

    /// Elements per cluster in domain dim `j`
    pub fn cluster_pts(&self, j: usize) -> i64 {
        self.fold_lens[j] * self.cluster_mults[j]
    }

    /// Group of the named dimension, if it exists
    pub fn kind_of(&self, name: &str) -> Option<DimKind> {
        if name == self.step_dim {
            Some(DimKind::Step)
        } else if self.domain_dims.iter().any(|d| d == name) {
            Some(DimKind::Domain)
        } else if self.misc_dims.iter().any(|d| d == name) {
            Some(DimKind::Misc)
        } else {
            None
        }
    }

    /// Position of the named dim in the domain dim order, if it is one
    pub fn domain_posn(&self, name: &str) -> Option<usize> {
        self.domain_dims.iter().position(|d| d == name)
    }

    /// Check that `name` exists and belongs to an allowed group
    ///
    /// Used by per-dim option and size setters to produce uniform errors.
    pub fn check_dim_type(
        &self,
        name: &str,
        fn_name: &str,
        step_ok: bool,
        domain_ok: bool,
        misc_ok: bool,
    ) -> Result<DimKind> {
        match self.kind_of(name) {
            None => Err(Error::Config(format!(
                "{fn_name}: dimension '{name}' does not exist"
            ))),
            Some(DimKind::Step) if !step_ok => Err(Error::Config(format!(
                "{fn_name}: dimension '{name}' is the step dimension, which is not allowed here"
            ))),
            Some(DimKind::Domain) if !domain_ok => Err(Error::Config(format!(
                "{fn_name}: dimension '{name}' is a domain dimension, which is not allowed here"
            ))),
            Some(DimKind::Misc) if !misc_ok => Err(Error::Config(format!(
                "{fn_name}: dimension '{name}' is a misc dimension, which is not allowed here"
            ))),
            Some(kind) => Ok(kind),
        }
    }

    /// A domain-dim-ordered `Indices` filled with one value
    pub fn domain_indices(&self, val: i64) -> Indices {
        Indices::new(self.num_domain_dims(), val)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn dims3d() -> DimSet {
        DimSet::with_layout("t", &["x", "y", "z"], &["m"], &[1, 1, 4], &[1, 1, 2]).unwrap()
    }

    #[test]
    fn groups_and_positions() {
        let d = dims3d();
        assert_eq!(d.kind_of("t"), Some(DimKind::Step));
        assert_eq!(d.kind_of("y"), Some(DimKind::Domain));
        assert_eq!(d.kind_of("m"), Some(DimKind::Misc));
        assert_eq!(d.kind_of("q"), None);
        assert_eq!(d.domain_posn("z"), Some(2));
        assert_eq!(d.inner_posn(), 2);
        assert_eq!(d.vec_len(), 4);
        assert_eq!(d.cluster_pts(2), 8);
    }

    #[test]
    fn duplicate_names_are_rejected() {
        let err = DimSet::new("t", &["x", "x"], &[]).unwrap_err();
        assert!(matches!(err, Error::DimMismatch(_)));
        let err = DimSet::new("x", &["x"], &[]).unwrap_err();
        assert!(matches!(err, Error::DimMismatch(_)));
    }

    #[test]
    fn dim_type_checks() {
        let d = dims3d();
        assert!(d.check_dim_type("x", "test", false, true, false).is_ok());
        assert!(d.check_dim_type("t", "test", false, true, false).is_err());
        assert!(d.check_dim_type("nope", "test", true, true, true).is_err());
    }
}
