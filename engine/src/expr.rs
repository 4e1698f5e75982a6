//! Predicate expressions
//!
//! Sub-domain and step predicates are small expression values evaluated per
//! point (or per step), never interpreted from text. A [`LinearForm`] is an
//! integer-affine combination of indices; predicates compare such forms or
//! test their parity, and combine with and/or/not.

use data::indices::Indices;
use std::fmt;
use std::sync::Arc;

/// An affine combination of indices: `sum(coeffs[j] * idx[j]) + offset`
#[derive(Clone, Debug, Default, Eq, PartialEq)]
pub struct LinearForm {
    /// One coefficient per index position
    pub coeffs: Vec<i64>,
    pub offset: i64,
}
//
impl LinearForm {
    /// The form that reads a single index position
    pub fn dim(ndims: usize, posn: usize) -> Self {
        let mut coeffs = vec![0; ndims];
        coeffs[posn] = 1;
        Self { coeffs, offset: 0 }
    }

    /// The sum of all index positions
    pub fn sum(ndims: usize) -> Self {
        Self {
            coeffs: vec![1; ndims],
            offset: 0,
        }
    }

    /// Add a constant offset
    pub fn plus(mut self, c: i64) -> Self {
        self.offset += c;
        self
    }

    /// Evaluate at a point
    pub fn eval(&self, point: &Indices) -> i64 {
        debug_assert_eq!(self.coeffs.len(), point.len());
        self.coeffs
            .iter()
            .zip(point.as_slice())
            .map(|(c, v)| c * v)
            .sum::<i64>()
            + self.offset
    }
}

/// Comparison operator for predicate leaves
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum CmpOp {
    Eq,
    Ne,
    Lt,
    Le,
    Gt,
    Ge,
}
//
impl CmpOp {
    fn apply(self, lhs: i64, rhs: i64) -> bool {
        match self {
            CmpOp::Eq => lhs == rhs,
            CmpOp::Ne => lhs != rhs,
            CmpOp::Lt => lhs < rhs,
            CmpOp::Le => lhs <= rhs,
            CmpOp::Gt => lhs > rhs,
            CmpOp::Ge => lhs >= rhs,
        }
    }

    fn symbol(self) -> &'static str {
        match self {
            CmpOp::Eq => "==",
            CmpOp::Ne => "!=",
            CmpOp::Lt => "<",
            CmpOp::Le => "<=",
            CmpOp::Gt => ">",
            CmpOp::Ge => ">=",
        }
    }
}

/// A predicate over a vector of indices
#[derive(Clone)]
pub enum PredExpr {
    /// Always true (a solid sub-domain / unconditional step)
    All,
    /// `form <op> rhs`
    Cmp {
        form: LinearForm,
        op: CmpOp,
        rhs: i64,
    },
    /// `form mod modulus == remainder` (floored modulo)
    ModEq {
        form: LinearForm,
        modulus: i64,
        remainder: i64,
    },
    And(Arc<PredExpr>, Arc<PredExpr>),
    Or(Arc<PredExpr>, Arc<PredExpr>),
    Not(Arc<PredExpr>),
}
//
impl PredExpr {
    /// Evaluate at a point
    pub fn eval(&self, point: &Indices) -> bool {
        match self {
            PredExpr::All => true,
            PredExpr::Cmp { form, op, rhs } => op.apply(form.eval(point), *rhs),
            PredExpr::ModEq {
                form,
                modulus,
                remainder,
            } => data::math::mod_flr(form.eval(point), *modulus) == *remainder,
            PredExpr::And(a, b) => a.eval(point) && b.eval(point),
            PredExpr::Or(a, b) => a.eval(point) || b.eval(point),
            PredExpr::Not(a) => !a.eval(point),
        }
    }

    /// Whether this predicate admits every point
    pub fn is_all(&self) -> bool {
        matches!(self, PredExpr::All)
    }

    /// Conjunction helper
    pub fn and(self, other: PredExpr) -> PredExpr {
        PredExpr::And(Arc::new(self), Arc::new(other))
    }

    /// Disjunction helper
    pub fn or(self, other: PredExpr) -> PredExpr {
        PredExpr::Or(Arc::new(self), Arc::new(other))
    }

    /// Render against dim names, for diagnostics
    pub fn describe(&self, names: &[String]) -> String {
        fn form_str(f: &LinearForm, names: &[String]) -> String {
            let mut parts: Vec<String> = f
                .coeffs
                .iter()
                .zip(names)
                .filter(|(c, _)| **c != 0)
                .map(|(c, n)| {
                    if *c == 1 {
                        n.clone()
                    } else {
                        format!("{c}*{n}")
                    }
                })
                .collect();
            if f.offset != 0 || parts.is_empty() {
                parts.push(f.offset.to_string());
            }
            parts.join("+")
        }
        match self {
            PredExpr::All => "true".to_string(),
            PredExpr::Cmp { form, op, rhs } => {
                format!("{}{}{rhs}", form_str(form, names), op.symbol())
            }
            PredExpr::ModEq {
                form,
                modulus,
                remainder,
            } => format!("{}%{modulus}=={remainder}", form_str(form, names)),
            PredExpr::And(a, b) => {
                format!("({}) && ({})", a.describe(names), b.describe(names))
            }
            PredExpr::Or(a, b) => format!("({}) || ({})", a.describe(names), b.describe(names)),
            PredExpr::Not(a) => format!("!({})", a.describe(names)),
        }
    }
}
//
impl fmt::Debug for PredExpr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PredExpr::All => write!(f, "All"),
            PredExpr::Cmp { form, op, rhs } => {
                write!(f, "Cmp({:?} {} {rhs})", form.coeffs, op.symbol())
            }
            PredExpr::ModEq {
                form,
                modulus,
                remainder,
            } => write!(f, "ModEq({:?} % {modulus} == {remainder})", form.coeffs),
            PredExpr::And(a, b) => write!(f, "And({a:?}, {b:?})"),
            PredExpr::Or(a, b) => write!(f, "Or({a:?}, {b:?})"),
            PredExpr::Not(a) => write!(f, "Not({a:?})"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parity_predicate_matches_even_sums() {
        // "x + y even" over 2 dims.
        let p = PredExpr::ModEq {
            form: LinearForm::sum(2),
            modulus: 2,
            remainder: 0,
        };
        assert!(p.eval(&Indices::from_slice(&[2, 4])));
        assert!(p.eval(&Indices::from_slice(&[3, 5])));
        assert!(!p.eval(&Indices::from_slice(&[3, 4])));
        // Floored modulo keeps negatives consistent.
        assert!(p.eval(&Indices::from_slice(&[-1, 1])));
    }

    #[test]
    fn comparisons_and_combinators() {
        let x = LinearForm::dim(2, 0);
        let left = PredExpr::Cmp {
            form: x.clone(),
            op: CmpOp::Ge,
            rhs: 4,
        };
        let right = PredExpr::Cmp {
            form: x,
            op: CmpOp::Lt,
            rhs: 8,
        };
        let band = left.and(right);
        assert!(band.eval(&Indices::from_slice(&[5, 0])));
        assert!(!band.eval(&Indices::from_slice(&[8, 0])));
        assert!(!band.eval(&Indices::from_slice(&[3, 0])));
    }

    #[test]
    fn describe_is_readable() {
        let names = vec!["x".to_string(), "y".to_string()];
        let p = PredExpr::ModEq {
            form: LinearForm::sum(2),
            modulus: 2,
            remainder: 0,
        };
        assert_eq!(p.describe(&names), "x+y%2==0");
    }
}
