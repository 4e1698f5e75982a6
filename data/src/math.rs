//! Integer index arithmetic
//!
//! All tile geometry is computed with floored division so that negative
//! indices (inside left halos and wavefront extensions) round toward the
//! correct padded cell rather than toward zero.

/// Floored integer division
#[inline]
pub fn div_flr(a: i64, b: i64) -> i64 {
    debug_assert!(b > 0);
    a.div_euclid(b)
}

/// Floored integer modulo; result is always in `[0, b)`
#[inline]
pub fn mod_flr(a: i64, b: i64) -> i64 {
    debug_assert!(b > 0);
    a.rem_euclid(b)
}

/// Round `a` down to a multiple of `mult`
#[inline]
pub fn round_down(a: i64, mult: i64) -> i64 {
    div_flr(a, mult) * mult
}

/// Round `a` up to a multiple of `mult`
#[inline]
pub fn round_up(a: i64, mult: i64) -> i64 {
    div_flr(a + mult - 1, mult) * mult
}

/// Ceiling of `a / b`
#[inline]
pub fn ceil_div(a: i64, b: i64) -> i64 {
    div_flr(a + b - 1, b)
}

/// Binomial coefficient C(n, k), used to count bridge shapes per phase
pub fn choose(n: usize, k: usize) -> usize {
    if k > n {
        return 0;
    }
    let k = k.min(n - k);
    let mut num = 1usize;
    let mut den = 1usize;
    for i in 0..k {
        num *= n - i;
        den *= i + 1;
    }
    num / den
}

/// Fill `out` with the `index`'th combination (1-based, lexicographic) of
/// `out.len()` values drawn from `1..=n`
///
/// This mirrors the classic combination-enumeration routine used to pick
/// which domain dims participate in a given bridge shape.
pub fn combination(out: &mut [i64], n: usize, index: usize) {
    let p = out.len();
    if p == 0 {
        return;
    }
    let mut r = index;
    let mut k = 0usize;
    for i in 0..p {
        let low = if i == 0 { 1 } else { out[i - 1] as usize + 1 };
        for cand in low..=n {
            let remaining = choose(n - cand, p - i - 1);
            if r <= remaining {
                out[i] = cand as i64;
                k = cand;
                break;
            }
            r -= remaining;
        }
        let _ = k;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn floored_division_rounds_toward_negative_infinity() {
        assert_eq!(div_flr(-1, 4), -1);
        assert_eq!(div_flr(-4, 4), -1);
        assert_eq!(div_flr(-5, 4), -2);
        assert_eq!(div_flr(7, 4), 1);
        assert_eq!(mod_flr(-1, 4), 3);
        assert_eq!(mod_flr(9, 4), 1);
    }

    #[test]
    fn rounding_handles_negative_values() {
        assert_eq!(round_down(-1, 4), -4);
        assert_eq!(round_up(-1, 4), 0);
        assert_eq!(round_up(5, 4), 8);
        assert_eq!(round_down(5, 4), 4);
        assert_eq!(round_up(8, 4), 8);
    }

    #[test]
    fn binomials_match_pascal() {
        assert_eq!(choose(3, 0), 1);
        assert_eq!(choose(3, 1), 3);
        assert_eq!(choose(3, 2), 3);
        assert_eq!(choose(3, 3), 1);
        assert_eq!(choose(4, 2), 6);
    }

    #[test]
    fn combinations_enumerate_all_subsets() {
        // C(3, 2) = 3 subsets of {1, 2, 3}.
        let mut buf = [0i64; 2];
        combination(&mut buf, 3, 1);
        assert_eq!(buf, [1, 2]);
        combination(&mut buf, 3, 2);
        assert_eq!(buf, [1, 3]);
        combination(&mut buf, 3, 3);
        assert_eq!(buf, [2, 3]);
    }
}
