//! Index tuples and vectors
//!
//! A [`Tuple`] is an ordered list of (name, value) pairs with unique names;
//! it is the setup-time currency for sizes and options. An [`Indices`] is a
//! bare integer vector aligned with some dim order; it is the run-time
//! currency of the tile scheduler, where name lookups would be too slow.

use crate::error::{Error, Result};
use crate::math;
use std::fmt;
use std::ops::{Index, IndexMut};

/// An ordered name -> value map with unique names
#[derive(Clone, Debug, Default, Eq, PartialEq)]
pub struct Tuple {
    names: Vec<String>,
    vals: Vec<i64>,
}
//
impl Tuple {
    /// An empty tuple
    pub fn new() -> Self {
        Self::default()
    }

    /// Build a tuple from (name, value) pairs
    pub fn from_pairs<'a>(pairs: impl IntoIterator<Item = (&'a str, i64)>) -> Result<Self> {
        let mut t = Self::new();
        for (name, val) in pairs {
            t.add_dim_back(name, val)?;
        }
        Ok(t)
    }

    /// Build a tuple with the given names, all set to `val`
    pub fn with_names(names: &[String], val: i64) -> Self {
        Self {
            names: names.to_vec(),
            vals: vec![val; names.len()],
        }
    }

    /// Append a (name, value) pair; the name must not already be present
    pub fn add_dim_back(&mut self, name: &str, val: i64) -> Result<()> {
        if self.names.iter().any(|n| n == name) {
            return Err(Error::DimMismatch(format!(
                "dimension '{name}' is already in tuple"
            )));
        }
        self.names.push(name.to_string());
        self.vals.push(val);
        Ok(())
    }

    /// Number of dims
    pub fn len(&self) -> usize {
        self.names.len()
    }

    /// Whether the tuple is empty
    pub fn is_empty(&self) -> bool {
        self.names.is_empty()
    }

    /// Dim names in order
    pub fn names(&self) -> &[String] {
        &self.names
    }

    /// Raw values in order
    pub fn vals(&self) -> &[i64] {
        &self.vals
    }

    /// Position of a named dim
    pub fn posn(&self, name: &str) -> Option<usize> {
        self.names.iter().position(|n| n == name)
    }

    /// Value of a named dim, if present
    pub fn get(&self, name: &str) -> Option<i64> {
        self.posn(name).map(|i| self.vals[i])
    }

    /// Set the value of a named dim
    pub fn set(&mut self, name: &str, val: i64) -> Result<()> {
        match self.posn(name) {
            Some(i) => {
                self.vals[i] = val;
                Ok(())
            }
            None => Err(Error::DimMismatch(format!(
                "dimension '{name}' is not in tuple"
            ))),
        }
    }

    /// Set every value to `val`
    pub fn set_vals_same(&mut self, val: i64) {
        self.vals.iter_mut().for_each(|v| *v = val);
    }

    /// Copy values from `other` for every name both tuples share
    pub fn set_vals_from(&mut self, other: &Tuple) {
        for (name, val) in other.names.iter().zip(&other.vals) {
            if let Some(i) = self.posn(name) {
                self.vals[i] = *val;
            }
        }
    }

    /// Product of all values (1 for an empty tuple)
    pub fn product(&self) -> i64 {
        self.vals.iter().product()
    }

    /// Largest value
    pub fn max(&self) -> i64 {
        self.vals.iter().copied().max().unwrap_or(0)
    }

    /// Smallest value
    pub fn min(&self) -> i64 {
        self.vals.iter().copied().min().unwrap_or(0)
    }

    /// Render as `name1=v1, name2=v2, ...`
    pub fn make_dim_val_str(&self, sep: &str) -> String {
        self.names
            .iter()
            .zip(&self.vals)
            .map(|(n, v)| format!("{n}={v}"))
            .collect::<Vec<_>>()
            .join(sep)
    }

    /// Treating the values as sizes, map a multi-dim point to its row-major
    /// linear index
    pub fn layout(&self, point: &[i64]) -> i64 {
        debug_assert_eq!(point.len(), self.vals.len());
        let mut idx = 0;
        for (p, sz) in point.iter().zip(&self.vals) {
            debug_assert!(*p >= 0 && p < sz);
            idx = idx * sz + p;
        }
        idx
    }

    /// Inverse of [`Tuple::layout`]
    pub fn unlayout(&self, mut idx: i64) -> Vec<i64> {
        let mut point = vec![0; self.vals.len()];
        for (slot, sz) in point.iter_mut().zip(&self.vals).rev() {
            *slot = math::mod_flr(idx, *sz);
            idx = math::div_flr(idx, *sz);
        }
        point
    }

    /// Visit every point in the hyper-rectangle described by the values,
    /// in row-major order; the visitor may return `false` to stop early
    pub fn visit_all_points(&self, mut visitor: impl FnMut(&[i64]) -> bool) {
        let total = self.product();
        if self.vals.iter().any(|&v| v <= 0) {
            return;
        }
        let mut point = vec![0i64; self.vals.len()];
        for _ in 0..total {
            if !visitor(&point) {
                return;
            }
            for d in (0..point.len()).rev() {
                point[d] += 1;
                if point[d] < self.vals[d] {
                    break;
                }
                point[d] = 0;
            }
        }
    }
}
//
impl fmt::Display for Tuple {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.make_dim_val_str(", "))
    }
}

/// A fixed-length integer vector aligned with a dim order
#[derive(Clone, Debug, Default, Eq, PartialEq)]
pub struct Indices(Vec<i64>);
//
impl Indices {
    /// A vector of `n` copies of `val`
    pub fn new(n: usize, val: i64) -> Self {
        Self(vec![val; n])
    }

    /// Copy a slice
    pub fn from_slice(vals: &[i64]) -> Self {
        Self(vals.to_vec())
    }

    /// Number of dims
    pub fn len(&self) -> usize {
        self.0.len()
    }

    /// Whether the vector is empty
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// Raw values
    pub fn as_slice(&self) -> &[i64] {
        &self.0
    }

    /// Set every value to `val`
    pub fn set_all(&mut self, val: i64) {
        self.0.iter_mut().for_each(|v| *v = val);
    }

    /// Element-wise sum
    pub fn add(&self, other: &Indices) -> Indices {
        debug_assert_eq!(self.len(), other.len());
        Indices(self.0.iter().zip(&other.0).map(|(a, b)| a + b).collect())
    }

    /// Element-wise difference
    pub fn sub(&self, other: &Indices) -> Indices {
        debug_assert_eq!(self.len(), other.len());
        Indices(self.0.iter().zip(&other.0).map(|(a, b)| a - b).collect())
    }

    /// Add a scalar to every element
    pub fn add_scalar(&self, s: i64) -> Indices {
        Indices(self.0.iter().map(|a| a + s).collect())
    }

    /// Element-wise minimum
    pub fn min_elements(&self, other: &Indices) -> Indices {
        debug_assert_eq!(self.len(), other.len());
        Indices(
            self.0
                .iter()
                .zip(&other.0)
                .map(|(a, b)| (*a).min(*b))
                .collect(),
        )
    }

    /// Element-wise maximum
    pub fn max_elements(&self, other: &Indices) -> Indices {
        debug_assert_eq!(self.len(), other.len());
        Indices(
            self.0
                .iter()
                .zip(&other.0)
                .map(|(a, b)| (*a).max(*b))
                .collect(),
        )
    }

    /// Product of all values
    pub fn product(&self) -> i64 {
        self.0.iter().product()
    }

    /// Smallest value
    pub fn min(&self) -> i64 {
        self.0.iter().copied().min().unwrap_or(0)
    }

    /// Largest value
    pub fn max(&self) -> i64 {
        self.0.iter().copied().max().unwrap_or(0)
    }

    /// Render as `v1, v2, ...`
    pub fn make_val_str(&self) -> String {
        self.0
            .iter()
            .map(|v| v.to_string())
            .collect::<Vec<_>>()
            .join(", ")
    }
}
//
impl Index<usize> for Indices {
    type Output = i64;
    fn index(&self, i: usize) -> &i64 {
        &self.0[i]
    }
}
//
impl IndexMut<usize> for Indices {
    fn index_mut(&mut self, i: usize) -> &mut i64 {
        &mut self.0[i]
    }
}
//
impl fmt::Display for Indices {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.make_val_str())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn tuple_rejects_duplicate_names() {
        let mut t = Tuple::new();
        t.add_dim_back("x", 4).unwrap();
        assert!(t.add_dim_back("x", 5).is_err());
    }

    #[test]
    fn tuple_layout_round_trips() {
        let t = Tuple::from_pairs([("x", 3), ("y", 4), ("z", 5)]).unwrap();
        for i in 0..t.product() {
            let p = t.unlayout(i);
            assert_eq!(t.layout(&p), i);
        }
    }

    #[test]
    fn tuple_visits_points_in_row_major_order() {
        let t = Tuple::from_pairs([("x", 2), ("y", 3)]).unwrap();
        let mut seen = Vec::new();
        t.visit_all_points(|p| {
            seen.push((p[0], p[1]));
            true
        });
        assert_eq!(
            seen,
            vec![(0, 0), (0, 1), (0, 2), (1, 0), (1, 1), (1, 2)]
        );
    }

    #[test]
    fn indices_arithmetic() {
        let a = Indices::from_slice(&[1, 2, 3]);
        let b = Indices::from_slice(&[4, 1, 3]);
        assert_eq!(a.add(&b).as_slice(), &[5, 3, 6]);
        assert_eq!(a.sub(&b).as_slice(), &[-3, 1, 0]);
        assert_eq!(a.min_elements(&b).as_slice(), &[1, 1, 3]);
        assert_eq!(a.max_elements(&b).as_slice(), &[4, 2, 3]);
        assert_eq!(a.product(), 6);
    }
}
