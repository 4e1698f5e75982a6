//! Data plane of the gridwave stencil engine
//!
//! This crate holds everything the runtime kernel stores and indexes:
//! dimension sets, index tuples and vectors, bounding boxes, and the
//! n-dimensional vars with their halo/pad/rotation memory model. The
//! execution engine itself lives in the `engine` crate.

pub mod bounds;
pub mod dims;
pub mod error;
pub mod indices;
pub mod math;
pub mod var;

/// Computation precision
pub type Precision = f64;

/// Number of bytes in one stored element
pub const ELEMENT_BYTES: usize = std::mem::size_of::<Precision>();
