//! Axis-aligned integer rectangles on the reference grid.
//!
//! All coordinates are unsigned 32-bit; `x1` and `y1` are exclusive.
//! Rectangles appear in four reference frames (canvas, tile,
//! resolution, subband); conversions between the frames live here and
//! in the tile-component model.

use crate::math::{ceil_div_pow2, sat_sub};

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct Rect {
    pub x0: u32,
    pub y0: u32,
    pub x1: u32,
    pub y1: u32,
}

impl Rect {
    pub fn from_ltrb(x0: u32, y0: u32, x1: u32, y1: u32) -> Self {
        Self { x0, y0, x1, y1 }
    }

    pub fn from_xywh(x: u32, y: u32, w: u32, h: u32) -> Self {
        Self {
            x0: x,
            y0: y,
            x1: x + w,
            y1: y + h,
        }
    }

    pub fn width(&self) -> u32 {
        // See B-11.
        self.x1 - self.x0
    }

    pub fn height(&self) -> u32 {
        // See B-11.
        self.y1 - self.y0
    }

    pub fn area(&self) -> u64 {
        self.width() as u64 * self.height() as u64
    }

    pub fn is_empty(&self) -> bool {
        self.x0 >= self.x1 || self.y0 >= self.y1
    }

    pub fn intersect(&self, other: Self) -> Self {
        if self.x1 < other.x0 || other.x1 < self.x0 || self.y1 < other.y0 || other.y1 < self.y0 {
            Self::from_xywh(0, 0, 0, 0)
        } else {
            Self::from_ltrb(
                u32::max(self.x0, other.x0),
                u32::max(self.y0, other.y0),
                u32::min(self.x1, other.x1),
                u32::min(self.y1, other.y1),
            )
        }
    }

    pub fn contains(&self, x: u32, y: u32) -> bool {
        x >= self.x0 && x < self.x1 && y >= self.y0 && y < self.y1
    }

    /// Grow by `margin` on every side, clamped to `bounds`.
    pub fn grow(&self, margin: u32, bounds: Self) -> Self {
        Self::from_ltrb(
            u32::max(sat_sub(self.x0, margin), bounds.x0),
            u32::max(sat_sub(self.y0, margin), bounds.y0),
            u32::min(self.x1.saturating_add(margin), bounds.x1),
            u32::min(self.y1.saturating_add(margin), bounds.y1),
        )
    }

    /// Divide all coordinates by `2^n`, rounding up (B-14 for
    /// resolution rectangles).
    pub fn ceil_div_pow2(&self, n: u32) -> Self {
        Self::from_ltrb(
            ceil_div_pow2(self.x0, n),
            ceil_div_pow2(self.y0, n),
            ceil_div_pow2(self.x1, n),
            ceil_div_pow2(self.y1, n),
        )
    }
}

/// Subband orientation. The discriminant encodes the subband offsets:
/// bit 0 is `x0b`, bit 1 is `y0b`.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum BandOrientation {
    LowLow = 0,
    HighLow = 1,
    LowHigh = 2,
    HighHigh = 3,
}

impl BandOrientation {
    pub(crate) fn x0b(self) -> u32 {
        self as u32 & 1
    }

    pub(crate) fn y0b(self) -> u32 {
        self as u32 >> 1
    }

    pub(crate) fn from_band_index(resolution: u16, band_index: usize) -> Self {
        if resolution == 0 {
            Self::LowLow
        } else {
            match band_index {
                0 => Self::HighLow,
                1 => Self::LowHigh,
                _ => Self::HighHigh,
            }
        }
    }
}

/// Map a rectangle in tile-component coordinates to subband
/// coordinates at decomposition level `nb`, per equation B-15.
///
/// For `nb == 0` the subband equals the tile-component rectangle.
pub(crate) fn band_rect(tc: Rect, nb: u32, orientation: BandOrientation) -> Rect {
    if nb == 0 {
        return tc;
    }

    let off_x = (1u32 << (nb - 1)) * orientation.x0b();
    let off_y = (1u32 << (nb - 1)) * orientation.y0b();

    let coord = |c: u32, off: u32| {
        if c <= off {
            0
        } else {
            ceil_div_pow2(c - off, nb)
        }
    };

    Rect::from_ltrb(
        coord(tc.x0, off_x),
        coord(tc.y0, off_y),
        coord(tc.x1, off_x),
        coord(tc.y1, off_y),
    )
}

/// The subband window of resolution `resno` for a window given in
/// tile-component coordinates. For resolution 0 the only band is LL at
/// level `num_resolutions - 1`; for higher resolutions the level is
/// `num_resolutions - resno` (Table F-1).
pub(crate) fn band_window(
    num_resolutions: u8,
    resno: u8,
    orientation: BandOrientation,
    window: Rect,
) -> Rect {
    debug_assert!(resno > 0 || orientation == BandOrientation::LowLow);

    let nb = if resno == 0 {
        num_resolutions as u32 - 1
    } else {
        num_resolutions as u32 - resno as u32
    };

    band_rect(window, nb, orientation)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn intersection() {
        let a = Rect::from_ltrb(0, 0, 10, 10);
        let b = Rect::from_ltrb(5, 5, 15, 15);
        assert_eq!(a.intersect(b), Rect::from_ltrb(5, 5, 10, 10));

        let c = Rect::from_ltrb(20, 20, 30, 30);
        assert!(a.intersect(c).is_empty());
    }

    #[test]
    fn growing_is_clamped() {
        let bounds = Rect::from_ltrb(0, 0, 16, 16);
        let r = Rect::from_ltrb(1, 1, 15, 15);
        assert_eq!(r.grow(4, bounds), bounds);
    }

    #[test]
    fn band_rect_offsets() {
        // A 17x17 tile component at one decomposition level. The low
        // half rounds up, the high half rounds down.
        let tc = Rect::from_ltrb(0, 0, 17, 17);
        assert_eq!(
            band_rect(tc, 1, BandOrientation::LowLow),
            Rect::from_ltrb(0, 0, 9, 9)
        );
        assert_eq!(
            band_rect(tc, 1, BandOrientation::HighLow),
            Rect::from_ltrb(0, 0, 8, 9)
        );
        assert_eq!(
            band_rect(tc, 1, BandOrientation::LowHigh),
            Rect::from_ltrb(0, 0, 9, 8)
        );
        assert_eq!(
            band_rect(tc, 1, BandOrientation::HighHigh),
            Rect::from_ltrb(0, 0, 8, 8)
        );
    }

    #[test]
    fn bands_tile_resolution_exactly() {
        // For r > 0 the four subbands plus the lower resolution must
        // account for every sample of resolution r.
        let tc = Rect::from_ltrb(3, 5, 77, 61);
        for level in 1..5u32 {
            let res = tc.ceil_div_pow2(level - 1);
            let lower = tc.ceil_div_pow2(level);
            let hl = band_rect(tc, level, BandOrientation::HighLow);
            let lh = band_rect(tc, level, BandOrientation::LowHigh);
            let hh = band_rect(tc, level, BandOrientation::HighHigh);

            assert_eq!(lower.width() + hl.width(), res.width());
            assert_eq!(lower.height() + lh.height(), res.height());
            assert_eq!(hl.width(), hh.width());
            assert_eq!(lh.height(), hh.height());
            assert_eq!(
                lower.area() + hl.area() + lh.area() + hh.area(),
                res.area()
            );
        }
    }
}
