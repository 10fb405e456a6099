//! The discrete wavelet transform (Annex F): 5-3 reversible and 9-7
//! irreversible lifting, forward and inverse, in whole-tile and
//! windowed variants.
//!
//! The 1-D unit works on a signal split into its two coefficient
//! lanes: the low-pass samples sitting at even absolute positions and
//! the high-pass samples at odd ones. Each lifting step reads only
//! the opposite lane, so the steps run in place, and neighbors beyond
//! the segment ends are resolved by reflecting the position back into
//! the segment instead of materialising padded copies. The lanes map
//! directly onto the deinterleaved `[low | high]` plane layout, so
//! rows and columns lift where they are.
//!
//! The whole-tile drivers merge the subband quadrants of the single
//! backing plane in place. The windowed inverse reads subband samples
//! through the sparse buffer, runs the horizontal pass into the split
//! windows and the vertical pass into the resolution window, then
//! writes the reconstructed window back for the next level.

use crate::error::Error;
use crate::rect::Rect;
use crate::sparse::SparseBuffer;
use crate::window::{SplitOrientation, TileWindowBuffer};

// Lifting weights of the 9-7 kernel (Table F.4).
const ALPHA: f32 = -1.586_134_3;
const BETA: f32 = -0.052_980_117;
const GAMMA: f32 = 0.882_911_1;
const DELTA: f32 = 0.443_506_87;
const KAPPA: f32 = 1.230_174_1;

/// Reflect an absolute position into the segment `[u0, u1)` by
/// whole-point symmetry around the end samples (F-4). Parity is
/// preserved, so lows reflect onto lows and highs onto highs.
fn mirror_position(u: i64, u0: i64, u1: i64) -> i64 {
    let span = 2 * (u1 - 1 - u0);
    if span <= 0 {
        return u0;
    }

    let folded = (u - u0).rem_euclid(span);
    u0 + folded.min(span - folded)
}

/// The coefficient lanes of one 1-D signal segment.
///
/// `lo[0]` and `hi[0]` sit at absolute positions `lo_pos` and
/// `hi_pos`; the slices may be windows of the full lanes, in which
/// case reads that reflect outside them clamp to the nearest held
/// sample (callers keep enough slack that this never reaches the
/// samples they consume).
struct Lanes<'a> {
    lo: &'a mut [f32],
    hi: &'a mut [f32],
    lo_pos: i64,
    hi_pos: i64,
    u0: i64,
    u1: i64,
}

/// Lanes covering a full segment: the first sample belongs to the low
/// lane on even origins and to the high lane on odd ones.
fn full_lanes<'a>(lo: &'a mut [f32], hi: &'a mut [f32], u0: i64, u1: i64) -> Lanes<'a> {
    let parity = u0 & 1;
    Lanes {
        lo,
        hi,
        lo_pos: u0 + parity,
        hi_pos: u0 + 1 - parity,
        u0,
        u1,
    }
}

impl Lanes<'_> {
    fn low(&self, u: i64) -> f32 {
        if self.lo.is_empty() {
            return 0.0;
        }
        let k = (mirror_position(u, self.u0, self.u1) - self.lo_pos) >> 1;
        self.lo[k.clamp(0, self.lo.len() as i64 - 1) as usize]
    }

    fn high(&self, u: i64) -> f32 {
        if self.hi.is_empty() {
            return 0.0;
        }
        let k = (mirror_position(u, self.u0, self.u1) - self.hi_pos) >> 1;
        self.hi[k.clamp(0, self.hi.len() as i64 - 1) as usize]
    }

    /// `lo[k] += weight * (hi neighbors)` over the held low samples.
    fn step_low(&mut self, weight: f32) {
        for k in 0..self.lo.len() {
            let u = self.lo_pos + 2 * k as i64;
            let around = self.high(u - 1) + self.high(u + 1);
            self.lo[k] += weight * around;
        }
    }

    /// `hi[k] += weight * (lo neighbors)` over the held high samples.
    fn step_high(&mut self, weight: f32) {
        for k in 0..self.hi.len() {
            let u = self.hi_pos + 2 * k as i64;
            let around = self.low(u - 1) + self.low(u + 1);
            self.hi[k] += weight * around;
        }
    }

    fn scale(&mut self, low_gain: f32, high_gain: f32) {
        for v in self.lo.iter_mut() {
            *v *= low_gain;
        }
        for v in self.hi.iter_mut() {
            *v *= high_gain;
        }
    }

    /// 5-3 synthesis (F.3.8.1): undo the integer update on the lows,
    /// then the prediction on the highs against the restored lows.
    fn synthesize_53(&mut self) {
        for k in 0..self.lo.len() {
            let u = self.lo_pos + 2 * k as i64;
            let around = self.high(u - 1) + self.high(u + 1);
            self.lo[k] -= ((around + 2.0) / 4.0).floor();
        }
        for k in 0..self.hi.len() {
            let u = self.hi_pos + 2 * k as i64;
            let around = self.low(u - 1) + self.low(u + 1);
            self.hi[k] += (around / 2.0).floor();
        }
    }

    /// 5-3 analysis: the exact mirror of [`synthesize_53`].
    fn analyze_53(&mut self) {
        for k in 0..self.hi.len() {
            let u = self.hi_pos + 2 * k as i64;
            let around = self.low(u - 1) + self.low(u + 1);
            self.hi[k] -= (around / 2.0).floor();
        }
        for k in 0..self.lo.len() {
            let u = self.lo_pos + 2 * k as i64;
            let around = self.high(u - 1) + self.high(u + 1);
            self.lo[k] += ((around + 2.0) / 4.0).floor();
        }
    }

    /// 9-7 synthesis (F.3.8.2): undo the gains, then the four lifting
    /// steps in reverse.
    fn synthesize_97(&mut self) {
        self.scale(KAPPA, 1.0 / KAPPA);
        self.step_low(-DELTA);
        self.step_high(-GAMMA);
        self.step_low(-BETA);
        self.step_high(-ALPHA);
    }

    /// 9-7 analysis: the four lifting steps, then the gains.
    fn analyze_97(&mut self) {
        self.step_high(ALPHA);
        self.step_low(BETA);
        self.step_high(GAMMA);
        self.step_low(DELTA);
        self.scale(1.0 / KAPPA, KAPPA);
    }
}

fn synthesize(mut lanes: Lanes<'_>, reversible: bool) {
    if lanes.u1 - lanes.u0 == 1 {
        // A lone high sample carries a factor of two.
        if let [sample] = &mut *lanes.hi {
            *sample /= 2.0;
        }
        return;
    }

    if reversible {
        lanes.synthesize_53();
    } else {
        lanes.synthesize_97();
    }
}

fn analyze(mut lanes: Lanes<'_>, reversible: bool) {
    if lanes.u1 - lanes.u0 == 1 {
        if let [sample] = &mut *lanes.hi {
            *sample *= 2.0;
        }
        return;
    }

    if reversible {
        lanes.analyze_53();
    } else {
        lanes.analyze_97();
    }
}

/// Reorder a row from `[low lane | high lane]` into spatial order.
/// `parity` is the absolute parity of the first sample.
fn lanes_to_samples(row: &mut [f32], low_len: usize, parity: u32, scratch: &mut Vec<f32>) {
    scratch.clear();
    scratch.extend_from_slice(row);

    let (lo, hi) = scratch.split_at(low_len);
    let (head, tail) = if parity == 0 { (lo, hi) } else { (hi, lo) };

    for (k, v) in head.iter().enumerate() {
        row[2 * k] = *v;
    }
    for (k, v) in tail.iter().enumerate() {
        row[2 * k + 1] = *v;
    }
}

/// Reorder a row from spatial order into `[low lane | high lane]`.
fn samples_to_lanes(row: &mut [f32], low_len: usize, parity: u32, scratch: &mut Vec<f32>) {
    scratch.clear();
    scratch.extend_from_slice(row);

    let (lo, hi) = row.split_at_mut(low_len);
    let (head, tail) = if parity == 0 { (lo, hi) } else { (hi, lo) };

    for (k, v) in head.iter_mut().enumerate() {
        *v = scratch[2 * k];
    }
    for (k, v) in tail.iter_mut().enumerate() {
        *v = scratch[2 * k + 1];
    }
}

/// Inverse DWT over the whole-tile plane: for each resolution above
/// the lowest, merge the deinterleaved subband quadrants in place.
pub(crate) fn inverse_whole_tile(buf: &mut TileWindowBuffer, reversible: bool) {
    let res_rects = buf.res_rects().to_vec();
    let plane = buf.top_mut();

    let mut scratch = Vec::new();
    let mut column = Vec::new();

    for resno in 1..res_rects.len() {
        let rect = res_rects[resno];
        let lower = res_rects[resno - 1];

        let (width, height) = (rect.width(), rect.height());
        if width == 0 || height == 0 {
            continue;
        }

        let (sn_w, sn_h) = (lower.width(), lower.height());
        let cas_x = rect.x0 & 1;
        let cas_y = rect.y0 & 1;

        // Horizontal synthesis: every row holds `[low | high]`.
        if width > 1 || cas_x == 1 {
            for y in 0..height {
                let row = plane.row_mut(y, 0, width);
                {
                    let (lo, hi) = row.split_at_mut(sn_w as usize);
                    synthesize(
                        full_lanes(lo, hi, rect.x0 as i64, rect.x1 as i64),
                        reversible,
                    );
                }
                lanes_to_samples(row, sn_w as usize, cas_x, &mut scratch);
            }
        }

        // Vertical synthesis: every column splits at the lower
        // resolution's height.
        if height > 1 || cas_y == 1 {
            for x in 0..width {
                column.clear();
                for y in 0..height {
                    column.push(plane.get(x, y));
                }

                {
                    let (lo, hi) = column.split_at_mut(sn_h as usize);
                    synthesize(
                        full_lanes(lo, hi, rect.y0 as i64, rect.y1 as i64),
                        reversible,
                    );
                }
                lanes_to_samples(&mut column, sn_h as usize, cas_y, &mut scratch);

                for (y, v) in column.iter().enumerate() {
                    plane.set(x, y as u32, *v);
                }
            }
        }
    }
}

/// Forward DWT over the whole-tile plane, the exact mirror of
/// [`inverse_whole_tile`]: vertical analysis then horizontal analysis
/// per resolution, from the highest resolution downwards.
pub(crate) fn forward_whole_tile(buf: &mut TileWindowBuffer, reversible: bool) {
    let res_rects = buf.res_rects().to_vec();
    let plane = buf.top_mut();

    let mut scratch = Vec::new();
    let mut column = Vec::new();

    for resno in (1..res_rects.len()).rev() {
        let rect = res_rects[resno];
        let lower = res_rects[resno - 1];

        let (width, height) = (rect.width(), rect.height());
        if width == 0 || height == 0 {
            continue;
        }

        let (sn_w, sn_h) = (lower.width(), lower.height());
        let cas_x = rect.x0 & 1;
        let cas_y = rect.y0 & 1;

        // Vertical analysis.
        if height > 1 || cas_y == 1 {
            for x in 0..width {
                column.clear();
                for y in 0..height {
                    column.push(plane.get(x, y));
                }

                samples_to_lanes(&mut column, sn_h as usize, cas_y, &mut scratch);
                {
                    let (lo, hi) = column.split_at_mut(sn_h as usize);
                    analyze(
                        full_lanes(lo, hi, rect.y0 as i64, rect.y1 as i64),
                        reversible,
                    );
                }

                for (y, v) in column.iter().enumerate() {
                    plane.set(x, y as u32, *v);
                }
            }
        }

        // Horizontal analysis.
        if width > 1 || cas_x == 1 {
            for y in 0..height {
                let row = plane.row_mut(y, 0, width);
                samples_to_lanes(row, sn_w as usize, cas_x, &mut scratch);

                let (lo, hi) = row.split_at_mut(sn_w as usize);
                analyze(
                    full_lanes(lo, hi, rect.x0 as i64, rect.x1 as i64),
                    reversible,
                );
            }
        }
    }
}

/// Windowed inverse DWT: synthesize each resolution's window through
/// the sparse buffer. The horizontal pass fills the split windows, the
/// vertical pass the resolution window, which is then written back to
/// the sparse buffer as the LL input of the next level.
pub(crate) fn inverse_windowed(
    buf: &mut TileWindowBuffer,
    sparse: &mut SparseBuffer<f32, 6, 6>,
    reversible: bool,
) -> Result<(), Error> {
    let res_rects = buf.res_rects().to_vec();

    let mut scratch = Vec::new();
    let mut row_buf = Vec::new();

    for resno in 1..res_rects.len() {
        buf.alloc_windowed(resno as u8);

        let rect = res_rects[resno];
        let lower = res_rects[resno - 1];

        let (width, height) = (rect.width(), rect.height());
        if width == 0 || height == 0 {
            continue;
        }

        let win = buf.window(resno as u8);
        if win.is_empty() {
            continue;
        }

        let (sn_w, sn_h) = (lower.width(), lower.height());
        let cas_x = rect.x0 & 1;
        let cas_y = rect.y0 & 1;

        // Horizontal pass into the split windows: low rows come from
        // the LL|HL half of the layout, high rows from LH|HH.
        for split in [SplitOrientation::Low, SplitOrientation::High] {
            let split_rect = buf.split_window(resno as u8, split);
            let (row_offset, available) = match split {
                SplitOrientation::Low => (0, sn_h),
                SplitOrientation::High => (sn_h, height - sn_h),
            };

            for k in split_rect.y0..u32::min(split_rect.y1, available) {
                row_buf.clear();
                row_buf.resize(width as usize, 0.0);
                sparse.read(
                    Rect::from_ltrb(0, row_offset + k, width, row_offset + k + 1),
                    &mut row_buf,
                    1,
                    width,
                    false,
                )?;

                {
                    let (lo, hi) = row_buf.split_at_mut(sn_w as usize);
                    synthesize(
                        full_lanes(lo, hi, rect.x0 as i64, rect.x1 as i64),
                        reversible,
                    );
                }
                lanes_to_samples(&mut row_buf, sn_w as usize, cas_x, &mut scratch);

                let plane = buf.res[resno].split_planes[split as usize]
                    .as_mut()
                    .expect("split plane allocated");
                plane
                    .row_mut(k, split_rect.x0, split_rect.x1)
                    .copy_from_slice(&row_buf[split_rect.x0 as usize..split_rect.x1 as usize]);
            }
        }

        // Vertical pass into the resolution window, drawing the lanes
        // from the split planes. The lane windows carry enough slack
        // beyond the resolution window that edge inaccuracies never
        // reach it.
        let low_rect = buf.split_window(resno as u8, SplitOrientation::Low);
        let high_rect = buf.split_window(resno as u8, SplitOrientation::High);
        let low_rows = low_rect.y0..u32::min(low_rect.y1, sn_h);
        let high_rows = high_rect.y0..u32::min(high_rect.y1, height - sn_h);

        // Absolute positions of the first low and high sample.
        let low_origin = rect.y0 as i64 + cas_y as i64;
        let high_origin = rect.y0 as i64 + 1 - cas_y as i64;

        let mut low_lane = Vec::new();
        let mut high_lane = Vec::new();

        for x in win.x0..win.x1 {
            low_lane.clear();
            high_lane.clear();
            {
                let low_plane = buf.res[resno].split_planes[SplitOrientation::Low as usize]
                    .as_ref()
                    .expect("split plane allocated");
                for k in low_rows.clone() {
                    low_lane.push(low_plane.get(x, k));
                }
                let high_plane = buf.res[resno].split_planes[SplitOrientation::High as usize]
                    .as_ref()
                    .expect("split plane allocated");
                for k in high_rows.clone() {
                    high_lane.push(high_plane.get(x, k));
                }
            }

            if low_lane.is_empty() && high_lane.is_empty() {
                continue;
            }

            let lanes = Lanes {
                lo: &mut low_lane,
                hi: &mut high_lane,
                lo_pos: low_origin + 2 * low_rows.start as i64,
                hi_pos: high_origin + 2 * high_rows.start as i64,
                u0: rect.y0 as i64,
                u1: rect.y1 as i64,
            };
            synthesize(lanes, reversible);

            let plane = buf.res[resno].plane.as_mut().expect("window plane allocated");
            for j in win.y0..win.y1 {
                let value = if (cas_y + j) & 1 == 0 {
                    let k = (j - cas_y) / 2 - low_rows.start;
                    low_lane[k as usize]
                } else {
                    let k = (j + cas_y - 1) / 2 - high_rows.start;
                    high_lane[k as usize]
                };
                plane.set(x, j, value);
            }
        }

        // Write the reconstructed window back: it is the LL input of
        // the next level, at the same layout coordinates.
        let plane = buf.res[resno].plane.as_ref().expect("window plane allocated");
        for y in win.y0..win.y1 {
            let row = plane.row(y, win.x0, win.x1);
            sparse.write(
                Rect::from_ltrb(win.x0, y, win.x1, y + 1),
                row,
                1,
                win.width(),
                false,
            )?;
        }
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::window::TileWindowBuffer;

    #[test]
    fn mirrored_positions() {
        // Segment [3, 9): reflection around the end samples 3 and 8.
        assert_eq!(mirror_position(3, 3, 9), 3);
        assert_eq!(mirror_position(8, 3, 9), 8);
        assert_eq!(mirror_position(2, 3, 9), 4);
        assert_eq!(mirror_position(1, 3, 9), 5);
        assert_eq!(mirror_position(9, 3, 9), 7);
        assert_eq!(mirror_position(10, 3, 9), 6);
        // Parity is preserved through the fold.
        for u in -4..14 {
            assert_eq!((mirror_position(u, 3, 9) - u) % 2, 0, "u={u}");
        }
        // Degenerate single-sample segment.
        assert_eq!(mirror_position(7, 4, 5), 4);
    }

    fn lift_round_trip(reversible: bool, parity: i64, len: usize, tolerance: f32) {
        let signal: Vec<f32> = (0..len).map(|i| ((i * 37) % 255) as f32 - 127.0).collect();

        let u0 = 10 + parity;
        let u1 = u0 + len as i64;
        let low_len = ((u1 + 1) / 2 - (u0 + 1) / 2) as usize;

        // Forward: spatial order to lanes, analyze.
        let mut data = signal.clone();
        let mut scratch = Vec::new();
        samples_to_lanes(&mut data, low_len, (u0 & 1) as u32, &mut scratch);
        {
            let (lo, hi) = data.split_at_mut(low_len);
            analyze(full_lanes(lo, hi, u0, u1), reversible);
        }

        // Inverse: synthesize, lanes back to spatial order.
        {
            let (lo, hi) = data.split_at_mut(low_len);
            synthesize(full_lanes(lo, hi, u0, u1), reversible);
        }
        lanes_to_samples(&mut data, low_len, (u0 & 1) as u32, &mut scratch);

        for (a, b) in data.iter().zip(&signal) {
            assert!(
                (a - b).abs() <= tolerance,
                "parity {parity} len {len}: {a} vs {b}"
            );
        }
    }

    #[test]
    fn lift_1d_round_trip_53() {
        for parity in [0, 1] {
            for len in [1usize, 2, 3, 5, 8, 13, 64] {
                lift_round_trip(true, parity, len, 0.0);
            }
        }
    }

    #[test]
    fn lift_1d_round_trip_97() {
        for parity in [0, 1] {
            for len in [2usize, 3, 7, 16, 33] {
                lift_round_trip(false, parity, len, 1e-3);
            }
        }
    }

    fn whole_tile_buffer(rect: Rect, levels: u8) -> TileWindowBuffer {
        let res_rects: Vec<Rect> = (0..=levels)
            .map(|r| rect.ceil_div_pow2((levels - r) as u32))
            .collect();
        let band_rects = res_rects.iter().map(|_| vec![]).collect();
        TileWindowBuffer::whole_tile(res_rects, band_rects)
    }

    /// Forward then inverse 5-3 across multiple levels must be the
    /// identity on integer samples, including odd origins and odd
    /// dimensions.
    #[test]
    fn whole_tile_round_trip_53() {
        for rect in [
            Rect::from_ltrb(0, 0, 32, 32),
            Rect::from_ltrb(0, 0, 33, 17),
            Rect::from_ltrb(3, 5, 36, 22),
            Rect::from_ltrb(1, 1, 2, 9),
        ] {
            let mut buf = whole_tile_buffer(rect, 3);
            let (w, h) = (rect.width(), rect.height());

            let samples: Vec<f32> =
                (0..w * h).map(|i| ((i * 7919) % 511) as f32 - 255.0).collect();
            buf.top_mut().data_mut().copy_from_slice(&samples);

            forward_whole_tile(&mut buf, true);
            inverse_whole_tile(&mut buf, true);

            assert_eq!(buf.top().data(), &samples[..], "rect {rect:?}");
        }
    }

    /// The 9-7 path reconstructs within a small tolerance.
    #[test]
    fn whole_tile_round_trip_97() {
        let rect = Rect::from_ltrb(2, 3, 50, 41);
        let mut buf = whole_tile_buffer(rect, 2);
        let (w, h) = (rect.width(), rect.height());

        let samples: Vec<f32> = (0..w * h).map(|i| ((i * 131) % 255) as f32 - 127.0).collect();
        buf.top_mut().data_mut().copy_from_slice(&samples);

        forward_whole_tile(&mut buf, false);
        inverse_whole_tile(&mut buf, false);

        for (a, b) in buf.top().data().iter().zip(&samples) {
            assert!((a - b).abs() < 1e-2, "{a} vs {b}");
        }
    }
}
