//! The multi-component transformation, as specified in Annex G:
//! reversible (RCT) with the 5-3 wavelet, irreversible (ICT) with the
//! 9-7 wavelet, both directions.
//!
//! The per-sample formulas are written once and instantiated for both
//! the scalar path and the eight-wide SIMD path; the SIMD path walks
//! the planes in full chunks and hands the remainder to the scalar
//! loop.

use crate::codestream::WaveletTransform;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum Direction {
    Forward,
    Inverse,
}

/// The G.2/G.3 formulas over one (s0, s1, s2) triple. Works for plain
/// `f32` lanes and for SIMD vectors alike.
macro_rules! component_transform {
    ($transform:expr, $direction:expr, $a:expr, $b:expr, $c:expr) => {{
        let (a, b, c) = ($a, $b, $c);
        match ($transform, $direction) {
            // Reversible transform, G.2: exact integer luma/chroma.
            (WaveletTransform::Reversible53, Direction::Forward) => {
                let luma = ((a + b + b + c) * 0.25).floor();
                (luma, c - b, a - b)
            }
            (WaveletTransform::Reversible53, Direction::Inverse) => {
                let green = a - ((b + c) * 0.25).floor();
                (c + green, green, b + green)
            }
            // Irreversible transform, G.3.
            (WaveletTransform::Irreversible97, Direction::Forward) => (
                a * 0.299 + b * 0.587 + c * 0.114,
                a * -0.16875 + b * -0.33126 + c * 0.5,
                a * 0.5 + b * -0.41869 + c * -0.08131,
            ),
            (WaveletTransform::Irreversible97, Direction::Inverse) => (
                a + c * 1.402,
                a + b * -0.34413 + c * -0.71414,
                a + b * 1.772,
            ),
        }
    }};
}

/// Apply the forward multi-component transform to the first three
/// component planes.
pub(crate) fn apply_forward(
    transform: WaveletTransform,
    s0: &mut [f32],
    s1: &mut [f32],
    s2: &mut [f32],
) {
    debug_assert!(s0.len() == s1.len() && s1.len() == s2.len());
    convert(transform, Direction::Forward, s0, s1, s2);
}

/// Apply the inverse multi-component transform (G.2 and G.3) to the
/// first three component planes.
pub(crate) fn apply_inverse(
    transform: WaveletTransform,
    s0: &mut [f32],
    s1: &mut [f32],
    s2: &mut [f32],
) {
    debug_assert!(s0.len() == s1.len() && s1.len() == s2.len());
    convert(transform, Direction::Inverse, s0, s1, s2);
}

fn convert(
    transform: WaveletTransform,
    direction: Direction,
    s0: &mut [f32],
    s1: &mut [f32],
    s2: &mut [f32],
) {
    #[cfg(feature = "simd")]
    simd::convert(transform, direction, s0, s1, s2);

    #[cfg(not(feature = "simd"))]
    convert_scalar(transform, direction, s0, s1, s2);
}

fn convert_scalar(
    transform: WaveletTransform,
    direction: Direction,
    s0: &mut [f32],
    s1: &mut [f32],
    s2: &mut [f32],
) {
    for ((a, b), c) in s0.iter_mut().zip(s1.iter_mut()).zip(s2.iter_mut()) {
        let (x, y, z) = component_transform!(transform, direction, *a, *b, *c);
        *a = x;
        *b = y;
        *c = z;
    }
}

#[cfg(feature = "simd")]
mod simd {
    use super::{Direction, convert_scalar};
    use crate::codestream::WaveletTransform;
    use fearless_simd::*;

    const LANES: usize = 8;

    pub(super) fn convert(
        transform: WaveletTransform,
        direction: Direction,
        s0: &mut [f32],
        s1: &mut [f32],
        s2: &mut [f32],
    ) {
        dispatch!(Level::new(), simd => chunks(simd, transform, direction, s0, s1, s2));
    }

    #[inline(always)]
    fn chunks<S: Simd>(
        simd: S,
        transform: WaveletTransform,
        direction: Direction,
        s0: &mut [f32],
        s1: &mut [f32],
        s2: &mut [f32],
    ) {
        let mut c0 = s0.chunks_exact_mut(LANES);
        let mut c1 = s1.chunks_exact_mut(LANES);
        let mut c2 = s2.chunks_exact_mut(LANES);

        for ((a, b), c) in (&mut c0).zip(&mut c1).zip(&mut c2) {
            let va = f32x8::from_slice(simd, a);
            let vb = f32x8::from_slice(simd, b);
            let vc = f32x8::from_slice(simd, c);

            let (x, y, z) = component_transform!(transform, direction, va, vb, vc);

            a.copy_from_slice(&<[f32; 8]>::from(x));
            b.copy_from_slice(&<[f32; 8]>::from(y));
            c.copy_from_slice(&<[f32; 8]>::from(z));
        }

        // The planes rarely divide evenly into vectors; finish the
        // tail sample by sample.
        convert_scalar(
            transform,
            direction,
            c0.into_remainder(),
            c1.into_remainder(),
            c2.into_remainder(),
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rct_round_trips_exactly() {
        let r: Vec<f32> = (0..67).map(|i| (i * 3 % 256) as f32 - 128.0).collect();
        let g: Vec<f32> = (0..67).map(|i| (i * 7 % 256) as f32 - 128.0).collect();
        let b: Vec<f32> = (0..67).map(|i| (i * 11 % 256) as f32 - 128.0).collect();

        let (mut s0, mut s1, mut s2) = (r.clone(), g.clone(), b.clone());
        apply_forward(WaveletTransform::Reversible53, &mut s0, &mut s1, &mut s2);
        apply_inverse(WaveletTransform::Reversible53, &mut s0, &mut s1, &mut s2);

        assert_eq!(s0, r);
        assert_eq!(s1, g);
        assert_eq!(s2, b);
    }

    #[test]
    fn ict_round_trips_within_tolerance() {
        let r: Vec<f32> = (0..67).map(|i| (i * 5 % 256) as f32).collect();
        let g: Vec<f32> = (0..67).map(|i| (i * 13 % 256) as f32).collect();
        let b: Vec<f32> = (0..67).map(|i| (i * 29 % 256) as f32).collect();

        let (mut s0, mut s1, mut s2) = (r.clone(), g.clone(), b.clone());
        apply_forward(WaveletTransform::Irreversible97, &mut s0, &mut s1, &mut s2);
        apply_inverse(WaveletTransform::Irreversible97, &mut s0, &mut s1, &mut s2);

        for (out, orig) in [(&s0, &r), (&s1, &g), (&s2, &b)] {
            for (a, b) in out.iter().zip(orig) {
                assert!((a - b).abs() < 1e-2, "{a} vs {b}");
            }
        }
    }
}
