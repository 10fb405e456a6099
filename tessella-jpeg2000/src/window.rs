//! The family of 2-D planes a tile-component needs for the DWT.
//!
//! Two modes exist. In whole-tile mode a single backing plane is
//! allocated at the highest decoded resolution and every resolution,
//! subband and split window is a non-owning view into it: at
//! resolution `r + 1` the LL area aliases resolution `r`, and the HL,
//! LH, HH areas sit at offsets `(W_r, 0)`, `(0, H_r)` and
//! `(W_r, H_r)`. The inverse DWT then merges in place. In windowed
//! mode each resolution owns an independently allocated window plane
//! sized to its area of interest plus the lifting support, and two
//! split planes hold the intermediate of the horizontal pass.

use crate::math::sat_sub;
use crate::plane::Plane;
use crate::rect::{BandOrientation, Rect, band_window};

/// The two intermediate windows produced by the horizontal lifting
/// pass: rows feeding the low (even) and high (odd) vertical
/// coefficients.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) enum SplitOrientation {
    Low = 0,
    High = 1,
}

/// Per-resolution window state.
#[derive(Debug)]
pub(crate) struct ResolutionWindows {
    /// Resolution window in resolution-relative coordinates: the area
    /// this resolution must produce. Covers the full resolution in
    /// whole-tile mode.
    pub(crate) res_window: Rect,
    /// Subband areas of interest in band-absolute coordinates, grown
    /// by the lifting support. One entry for resolution 0 (LL), three
    /// otherwise (HL, LH, HH).
    pub(crate) padded_band_windows: Vec<Rect>,
    /// Split window rows in resolution-relative coordinates.
    pub(crate) split_windows: [Rect; 2],
    /// Owned planes, windowed mode only.
    pub(crate) plane: Option<Plane>,
    pub(crate) split_planes: [Option<Plane>; 2],
}

/// The plane family of one tile-component.
#[derive(Debug)]
pub(crate) struct TileWindowBuffer {
    whole_tile: bool,
    /// Band rectangles per resolution, band-absolute coordinates.
    band_rects: Vec<Vec<Rect>>,
    /// Resolution rectangles, absolute coordinates.
    res_rects: Vec<Rect>,
    /// Per-resolution windows.
    pub(crate) res: Vec<ResolutionWindows>,
    /// The backing plane: the whole tile-component at the highest
    /// decoded resolution (whole-tile mode), or the final output
    /// window (windowed mode). Plane coordinates are zero-based.
    top: Plane,
}

impl TileWindowBuffer {
    /// Whole-tile mode: compress, or decompress without a region.
    pub(crate) fn whole_tile(res_rects: Vec<Rect>, band_rects: Vec<Vec<Rect>>) -> Self {
        let highest = *res_rects.last().expect("at least one resolution");
        let top = Plane::new(Rect::from_xywh(0, 0, highest.width(), highest.height()));

        let res = res_rects
            .iter()
            .map(|r| {
                let full = Rect::from_xywh(0, 0, r.width(), r.height());
                ResolutionWindows {
                    res_window: full,
                    padded_band_windows: Vec::new(),
                    split_windows: [full, full],
                    plane: None,
                    split_planes: [None, None],
                }
            })
            .collect();

        Self {
            whole_tile: true,
            band_rects,
            res_rects,
            res,
            top,
        }
    }

    /// Windowed mode. `unreduced_window` is the requested region in
    /// unreduced tile-component coordinates; `num_resolutions` the
    /// unreduced resolution count; `margin` the lifting support in
    /// samples (see [`filter_margin`]).
    pub(crate) fn windowed(
        res_rects: Vec<Rect>,
        band_rects: Vec<Vec<Rect>>,
        unreduced_window: Rect,
        num_resolutions: u8,
        margin: u32,
    ) -> Self {
        // Each level of the synthesis chain consumes samples up to
        // the lifting support beyond its output window, and its LL
        // input is the previous level's output. Growing every
        // per-level window by `2 * margin + 2` absorbs the support of
        // the whole chain.
        let grow_by = 2 * margin + 2;

        let reduced = res_rects.len() as u8;
        let mut res = Vec::with_capacity(res_rects.len());

        for (resno, res_rect) in res_rects.iter().enumerate() {
            let level = num_resolutions as u32 - 1 - resno as u32;
            let aoi = unreduced_window.ceil_div_pow2(level).intersect(*res_rect);

            let full = Rect::from_xywh(0, 0, res_rect.width(), res_rect.height());
            let res_window = Rect::from_ltrb(
                sat_sub(aoi.x0, res_rect.x0),
                sat_sub(aoi.y0, res_rect.y0),
                sat_sub(aoi.x1, res_rect.x0),
                sat_sub(aoi.y1, res_rect.y0),
            )
            .grow(grow_by, full);

            let orientations: &[BandOrientation] = if resno == 0 {
                &[BandOrientation::LowLow]
            } else {
                &[
                    BandOrientation::HighLow,
                    BandOrientation::LowHigh,
                    BandOrientation::HighHigh,
                ]
            };

            let padded_band_windows = orientations
                .iter()
                .zip(&band_rects[resno])
                .map(|(orientation, band)| {
                    band_window(num_resolutions, resno as u8, *orientation, unreduced_window)
                        .grow(grow_by, *band)
                })
                .collect();

            // Rows of the lower resolution feeding the even vertical
            // coefficients, and rows of the high band feeding the odd
            // ones. Exact per-parity ranges are derived during the
            // vertical pass; these rects bound them.
            let lower_height = if resno > 0 {
                res_rects[resno - 1].height()
            } else {
                0
            };
            let split_y0 = sat_sub(res_window.y0 / 2, margin + 1);
            let split_rows = |available: u32| {
                let y1 = u32::min(res_window.y1.div_ceil(2) + margin + 1, available);
                Rect::from_ltrb(res_window.x0, u32::min(split_y0, y1), res_window.x1, y1)
            };

            let split_low = split_rows(lower_height);
            let split_high = split_rows(sat_sub(res_rect.height(), lower_height));

            res.push(ResolutionWindows {
                res_window,
                padded_band_windows,
                split_windows: [split_low, split_high],
                plane: None,
                split_planes: [None, None],
            });
        }

        let top_window = res[reduced as usize - 1].res_window;
        let top = Plane::new(top_window);

        Self {
            whole_tile: false,
            band_rects,
            res_rects,
            res,
            top,
        }
    }

    /// Absolute rectangles of the decoded resolutions.
    pub(crate) fn res_rects(&self) -> &[Rect] {
        &self.res_rects
    }

    /// The backing plane.
    pub(crate) fn top(&self) -> &Plane {
        &self.top
    }

    pub(crate) fn top_mut(&mut self) -> &mut Plane {
        &mut self.top
    }

    /// The resolution window of `resno`, resolution-relative.
    pub(crate) fn window(&self, resno: u8) -> Rect {
        self.res[resno as usize].res_window
    }

    /// The subband area of interest of `resno`, band-absolute, grown
    /// by the lifting support. Whole-tile mode has no band windows;
    /// callers treat every block as inside.
    pub(crate) fn padded_band_window(&self, resno: u8, band_index: usize) -> Option<Rect> {
        self.res[resno as usize]
            .padded_band_windows
            .get(band_index)
            .copied()
    }

    /// The split window of `resno`.
    pub(crate) fn split_window(&self, resno: u8, orientation: SplitOrientation) -> Rect {
        self.res[resno as usize].split_windows[orientation as usize]
    }

    /// Allocate the owned planes of `resno` (windowed mode).
    /// Idempotent.
    pub(crate) fn alloc_windowed(&mut self, resno: u8) {
        debug_assert!(!self.whole_tile);

        let rw = &mut self.res[resno as usize];
        if rw.plane.is_none() {
            rw.plane = Some(Plane::new(rw.res_window));
        }
        for (slot, rect) in rw.split_planes.iter_mut().zip(rw.split_windows) {
            if slot.is_none() {
                *slot = Some(Plane::new(rect));
            }
        }
    }

    /// Map absolute code-block coordinates into the destination
    /// frame: band-relative, with the LL offset of the lower
    /// resolution added back for HL/LH/HH. In whole-tile mode the
    /// result indexes the backing plane; in windowed mode it indexes
    /// the sparse buffer's resolution-relative layout. Both use the
    /// same mapping.
    pub(crate) fn transform(
        &self,
        resno: u8,
        orientation: BandOrientation,
        x: u32,
        y: u32,
    ) -> (u32, u32) {
        let band_index = if resno == 0 { 0 } else { orientation as usize - 1 };
        let band = self.band_rects[resno as usize][band_index];

        let mut x = x - band.x0;
        let mut y = y - band.y0;

        if resno > 0 {
            let lower = self.res_rects[resno as usize - 1];
            if orientation.x0b() == 1 {
                x += lower.width();
            }
            if orientation.y0b() == 1 {
                y += lower.height();
            }
        }

        (x, y)
    }
}

/// The lifting support margin of the wavelet kernel: two rows/columns
/// for 5-3, four for 9-7 (tables F.2 and F.3 bound the extension).
pub(crate) fn filter_margin(reversible: bool) -> u32 {
    if reversible { 2 } else { 4 }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn simple_buffer() -> TileWindowBuffer {
        // Two resolutions over a 16x16 tile component at the origin.
        let res_rects = vec![Rect::from_ltrb(0, 0, 8, 8), Rect::from_ltrb(0, 0, 16, 16)];
        let band_rects = vec![
            vec![Rect::from_ltrb(0, 0, 8, 8)],
            vec![
                Rect::from_ltrb(0, 0, 8, 8),
                Rect::from_ltrb(0, 0, 8, 8),
                Rect::from_ltrb(0, 0, 8, 8),
            ],
        ];
        TileWindowBuffer::whole_tile(res_rects, band_rects)
    }

    #[test]
    fn whole_tile_aliases_one_plane() {
        let buf = simple_buffer();
        assert_eq!(buf.top().rect(), Rect::from_ltrb(0, 0, 16, 16));
        assert_eq!(buf.window(0), Rect::from_ltrb(0, 0, 8, 8));
        assert_eq!(buf.window(1), Rect::from_ltrb(0, 0, 16, 16));
    }

    #[test]
    fn transform_adds_ll_offsets() {
        let buf = simple_buffer();

        // LL block coordinates map straight through.
        assert_eq!(buf.transform(0, BandOrientation::LowLow, 3, 4), (3, 4));
        // HL shifts right by the lower resolution's width.
        assert_eq!(buf.transform(1, BandOrientation::HighLow, 3, 4), (11, 4));
        // LH shifts down by the lower resolution's height.
        assert_eq!(buf.transform(1, BandOrientation::LowHigh, 3, 4), (3, 12));
        // HH shifts both ways.
        assert_eq!(buf.transform(1, BandOrientation::HighHigh, 3, 4), (11, 12));
    }

    #[test]
    fn windowed_mode_clamps_windows() {
        let res_rects = vec![Rect::from_ltrb(0, 0, 32, 32), Rect::from_ltrb(0, 0, 64, 64)];
        let band_rects = vec![
            vec![Rect::from_ltrb(0, 0, 32, 32)],
            vec![
                Rect::from_ltrb(0, 0, 32, 32),
                Rect::from_ltrb(0, 0, 32, 32),
                Rect::from_ltrb(0, 0, 32, 32),
            ],
        ];

        let window = Rect::from_ltrb(16, 16, 32, 32);
        let buf = TileWindowBuffer::windowed(res_rects, band_rects, window, 2, 2);

        // The top window covers the request grown by the chain
        // support, clamped to the resolution.
        let top = buf.window(1);
        assert!(top.x0 <= 16 && top.x1 >= 32);
        assert!(top.x1 <= 64 && top.y1 <= 64);

        // Lower resolution window covers the halved request.
        let lower = buf.window(0);
        assert!(lower.x0 <= 8 && lower.x1 >= 16);
        assert!(lower.x1 <= 32);
    }
}
