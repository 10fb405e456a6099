//! Bit-plane coding of code blocks, described in Annex D.
//!
//! Coefficients are coded one magnitude plane at a time, each plane in
//! up to three passes: significance propagation for samples with a
//! significant neighborhood, magnitude refinement for samples that
//! became significant earlier, and a cleanup sweep for the rest. Every
//! coded bit travels through the MQ coder under a context derived from
//! the 3x3 significance neighborhood, so the decoder can only stay in
//! lockstep by rebuilding the exact same state; encoder and decoder
//! therefore share one state grid and one set of context rules, and
//! differ only in which direction the bits flow.
//!
//! Decoded magnitude bits are placed at their absolute plane position,
//! so truncated streams simply leave the lower planes zero.

use crate::bit_io::BitReader;
use crate::error::{BlockError, Error, bail};
use crate::log::lwarn;
use crate::mq::{ArithmeticDecoder, ArithmeticEncoder, ContextState};
use crate::rect::BandOrientation;

// Magnitudes accumulate in a u32, which caps the plane count.
pub(crate) const MAX_BITPLANES: u32 = 31;

// Context labels: 0..=8 zero coding, 9..=13 sign coding, 14..=16
// magnitude refinement, then the run-length and uniform contexts.
const CTX_RUN_LENGTH: usize = 17;
const CTX_UNIFORM: usize = 18;
const CTX_COUNT: usize = 19;

// Per-sample coding flags.
const SIGNIFICANT: u8 = 1 << 0;
/// Visited by the current plane's significance propagation pass.
const VISITED: u8 = 1 << 1;
const REFINED: u8 = 1 << 2;
const NEGATIVE: u8 = 1 << 3;

/// Per-code-block coding parameters, carried alongside the coded
/// passes (the `ctx` of the block codec interface).
#[derive(Debug, Clone, Copy, Default)]
pub(crate) struct BlockContext {
    /// Number of missing most-significant bit-planes (`P`).
    pub(crate) zero_bitplanes: u8,
    /// Maximum bit-plane count of the subband (`Mb`, equation E-2).
    pub(crate) num_bitplanes: u8,
    /// Stripe columns never take context from the stripe below.
    pub(crate) vertically_causal: bool,
    /// Code the four-symbol segmentation mark after each cleanup.
    pub(crate) segmentation_symbols: bool,
    /// Reset the probability contexts after every coding pass.
    pub(crate) reset_probabilities: bool,
    /// Each coding pass terminates its own codeword segment.
    pub(crate) termination_on_each_pass: bool,
    /// Raw (bypassed) significance and refinement passes from the
    /// eleventh pass onwards.
    pub(crate) selective_bypass: bool,
}

/// The coding state both directions share: one flag byte per sample,
/// plus the neighborhood and context rules of D.3.
struct CodingState {
    width: u32,
    height: u32,
    band: BandOrientation,
    causal: bool,
    flags: Vec<u8>,
}

impl CodingState {
    fn new(width: u32, height: u32, band: BandOrientation, ctx: &BlockContext) -> Self {
        Self {
            width,
            height,
            band,
            causal: ctx.vertically_causal,
            flags: vec![0; width as usize * height as usize],
        }
    }

    #[inline(always)]
    fn index(&self, x: u32, y: u32) -> usize {
        y as usize * self.width as usize + x as usize
    }

    fn end_plane(&mut self) {
        for f in &mut self.flags {
            *f &= !VISITED;
        }
    }

    /// The exclusive row limit context may be drawn from: the block
    /// edge, or the stripe edge in vertically-causal mode.
    #[inline]
    fn context_row_limit(&self, y: u32) -> i64 {
        if self.causal {
            i64::min(self.height as i64, (y as i64 | 3) + 1)
        } else {
            self.height as i64
        }
    }

    /// Count the significant neighbors along each axis: horizontal,
    /// vertical, diagonal.
    fn neighbors(&self, x: u32, y: u32) -> (u8, u8, u8) {
        let limit = self.context_row_limit(y);

        let sig = |nx: i64, ny: i64| -> u8 {
            if nx < 0 || ny < 0 || nx >= self.width as i64 || ny >= limit {
                return 0;
            }
            (self.flags[ny as usize * self.width as usize + nx as usize] & SIGNIFICANT != 0) as u8
        };

        let (x, y) = (x as i64, y as i64);
        let h = sig(x - 1, y) + sig(x + 1, y);
        let v = sig(x, y - 1) + sig(x, y + 1);
        let d = sig(x - 1, y - 1) + sig(x + 1, y - 1) + sig(x - 1, y + 1) + sig(x + 1, y + 1);

        (h, v, d)
    }

    /// The zero-coding context for a neighbor pattern (Table D.1).
    fn zero_coding_context(&self, h: u8, v: u8, d: u8) -> usize {
        match self.band {
            // The HH band weighs the diagonals first.
            BandOrientation::HighHigh => match (d, h + v) {
                (3.., _) => 8,
                (2, 1..) => 7,
                (2, 0) => 6,
                (1, 2..) => 5,
                (1, 1) => 4,
                (1, 0) => 3,
                (0, 2..) => 2,
                (0, 1) => 1,
                _ => 0,
            },
            // HL blocks transpose the axes relative to LL/LH.
            band => {
                let (a, b) = if band == BandOrientation::HighLow {
                    (v, h)
                } else {
                    (h, v)
                };

                match (a, b, d) {
                    (2.., _, _) => 8,
                    (1, 1.., _) => 7,
                    (1, 0, 1..) => 6,
                    (1, 0, 0) => 5,
                    (0, 2.., _) => 4,
                    (0, 1, _) => 3,
                    (0, 0, 2..) => 2,
                    (0, 0, 1) => 1,
                    _ => 0,
                }
            }
        }
    }

    /// The net polarity of the two neighbors along one axis: the sign
    /// sum of the significant ones, clamped to one magnitude.
    fn axis_polarity(&self, first: (i64, i64), second: (i64, i64), limit: i64) -> i32 {
        let polarity = |(nx, ny): (i64, i64)| -> i32 {
            if nx < 0 || ny < 0 || nx >= self.width as i64 || ny >= limit {
                return 0;
            }
            let f = self.flags[ny as usize * self.width as usize + nx as usize];
            if f & SIGNIFICANT == 0 {
                0
            } else if f & NEGATIVE != 0 {
                -1
            } else {
                1
            }
        };

        (polarity(first) + polarity(second)).clamp(-1, 1)
    }

    /// Sign-coding context and the flip applied to the coded bit
    /// (Tables D.2 and D.3). Contexts 9..=13 encode the absolute
    /// neighborhood pattern; the flip restores its sign.
    fn sign_context(&self, x: u32, y: u32) -> (usize, u32) {
        let limit = self.context_row_limit(y);
        let (x, y) = (x as i64, y as i64);

        let h = self.axis_polarity((x - 1, y), (x + 1, y), limit);
        let v = self.axis_polarity((x, y - 1), (x, y + 1), limit);

        if h == 0 {
            (9 + v.unsigned_abs() as usize, (v < 0) as u32)
        } else {
            ((12 + h * v) as usize, (h < 0) as u32)
        }
    }

    /// The magnitude-refinement context (Table D.4).
    fn refinement_context(&self, x: u32, y: u32, f: u8) -> usize {
        if f & REFINED != 0 {
            16
        } else {
            let (h, v, d) = self.neighbors(x, y);
            if h + v + d > 0 { 15 } else { 14 }
        }
    }

    /// Whether a full stripe column qualifies for run-length coding:
    /// four uncoded rows, none with any significant neighbor.
    fn run_length_column(&self, x: u32, top: u32) -> bool {
        (0..4).all(|dy| {
            let (h, v, d) = self.neighbors(x, top + dy);
            h + v + d == 0
        })
    }
}

/// Drive the stripe-oriented scan of D.2 column by column: stripes of
/// four rows, each stripe left to right, the last stripe possibly
/// shorter. The visitor receives the column's x, its top row and its
/// row count.
fn stripe_columns(width: u32, height: u32, mut visit: impl FnMut(u32, u32, u32)) {
    let mut top = 0;
    while top < height {
        let rows = u32::min(4, height - top);
        for x in 0..width {
            visit(x, top, rows);
        }
        top += 4;
    }
}

/// Fresh probability contexts per Table D.7.
fn initial_contexts() -> [ContextState; CTX_COUNT] {
    let mut contexts = [ContextState::default(); CTX_COUNT];
    contexts[0] = ContextState::new(4, 0);
    contexts[CTX_RUN_LENGTH] = ContextState::new(3, 0);
    contexts[CTX_UNIFORM] = ContextState::new(46, 0);
    contexts
}

// The decoder is generic over the bit source so that raw (bypassed)
// segments reuse the pass logic.
trait BitSource {
    /// Raw segments carry bits untouched by the probability model.
    const IS_RAW: bool;

    fn read_bit(&mut self, context: &mut ContextState) -> u32;
}

impl BitSource for ArithmeticDecoder<'_> {
    const IS_RAW: bool = false;

    fn read_bit(&mut self, context: &mut ContextState) -> u32 {
        Self::read_bit(self, context)
    }
}

struct RawSource<'a>(BitReader<'a>);

impl<'a> RawSource<'a> {
    fn new(data: &'a [u8]) -> Self {
        Self(BitReader::new(data))
    }
}

impl BitSource for RawSource<'_> {
    const IS_RAW: bool = true;

    fn read_bit(&mut self, _: &mut ContextState) -> u32 {
        self.0.read(1).unwrap_or_else(|_| {
            lwarn!("exceeded buffer in raw segment");
            1
        })
    }
}

/// One codeword segment handed to [`decode_block`]: a byte slice and
/// the number of coding passes it carries.
#[derive(Debug, Clone, Copy)]
pub(crate) struct CodedSegment<'a> {
    pub(crate) passes: u32,
    pub(crate) data: &'a [u8],
}

/// The decoded output of one code block.
#[derive(Debug, Default)]
pub(crate) struct DecodedBlock {
    pub(crate) magnitudes: Vec<u32>,
    pub(crate) signs: Vec<u8>,
}

/// Decode the coded passes of one code block into magnitudes and
/// signs, row-major over `width x height`.
pub(crate) fn decode_block(
    segments: &[CodedSegment<'_>],
    width: u32,
    height: u32,
    orientation: BandOrientation,
    ctx: &BlockContext,
    scratch: &mut Vec<u8>,
) -> Result<DecodedBlock, Error> {
    let total_passes: u32 = segments.iter().map(|s| s.passes).sum();

    let mut decoder = BlockDecoder::new(width, height, orientation, ctx);

    if total_passes == 0 {
        return Ok(decoder.into_output());
    }

    // Validate the pass structure against the signalled bit-planes.
    let coded_planes = 1 + (total_passes - 1).div_ceil(3);
    if ctx.zero_bitplanes as u32 + coded_planes > ctx.num_bitplanes as u32 {
        bail!(BlockError::InvalidPassStructure);
    }
    if ctx.num_bitplanes as u32 > MAX_BITPLANES {
        bail!(BlockError::TooManyBitplanes);
    }

    // The magnitude plane the first cleanup pass codes.
    let top_plane = (ctx.num_bitplanes - ctx.zero_bitplanes) as u32 - 1;

    let is_normal_mode = !ctx.selective_bypass && !ctx.termination_on_each_pass;

    if is_normal_mode {
        // Only one termination per code block, so all segment bytes
        // form a single codeword.
        scratch.clear();
        for segment in segments {
            scratch.extend_from_slice(segment.data);
        }

        let mut source = ArithmeticDecoder::new(scratch);
        decoder.run_passes(0, total_passes, top_plane, ctx, &mut source)?;
    } else {
        // Otherwise each segment introduces a termination; raw
        // segments appear for bypassed passes (Table D.9).
        let mut start = 0;
        for segment in segments {
            let end = start + segment.passes;

            let use_arithmetic = if ctx.selective_bypass {
                start < 10 || start.is_multiple_of(3)
            } else {
                true
            };

            if use_arithmetic {
                let mut source = ArithmeticDecoder::new(segment.data);
                decoder.run_passes(start, end, top_plane, ctx, &mut source)?;
            } else {
                let mut source = RawSource::new(segment.data);
                decoder.run_passes(start, end, top_plane, ctx, &mut source)?;
            }

            start = end;
        }
    }

    Ok(decoder.into_output())
}

struct BlockDecoder {
    state: CodingState,
    magnitudes: Vec<u32>,
    contexts: [ContextState; CTX_COUNT],
}

impl BlockDecoder {
    fn new(width: u32, height: u32, orientation: BandOrientation, ctx: &BlockContext) -> Self {
        Self {
            state: CodingState::new(width, height, orientation, ctx),
            magnitudes: vec![0; width as usize * height as usize],
            contexts: initial_contexts(),
        }
    }

    fn run_passes(
        &mut self,
        first: u32,
        last: u32,
        top_plane: u32,
        ctx: &BlockContext,
        source: &mut impl BitSource,
    ) -> Result<(), Error> {
        for pass in first..last {
            // The top plane gets a lone cleanup pass; every further
            // plane runs significance, refinement, cleanup.
            let plane = top_plane - (pass + 2) / 3;

            match pass % 3 {
                1 => self.significance_pass(plane, source),
                2 => self.refinement_pass(plane, source),
                _ => {
                    self.cleanup_pass(plane, source);

                    if ctx.segmentation_symbols {
                        let mut mark = 0;
                        for _ in 0..4 {
                            mark = (mark << 1) | source.read_bit(&mut self.contexts[CTX_UNIFORM]);
                        }
                        if mark != 0b1010 {
                            lwarn!("encountered invalid segmentation symbol");
                            bail!(BlockError::CodecFailure);
                        }
                    }

                    self.state.end_plane();
                }
            }

            if ctx.reset_probabilities {
                self.contexts = initial_contexts();
            }
        }

        Ok(())
    }

    /// The significance propagation pass (D.3.1): insignificant
    /// samples with at least one significant neighbor.
    fn significance_pass(&mut self, plane: u32, source: &mut impl BitSource) {
        let (width, height) = (self.state.width, self.state.height);

        stripe_columns(width, height, |x, top, rows| {
            for y in top..top + rows {
                let idx = self.state.index(x, y);
                if self.state.flags[idx] & SIGNIFICANT != 0 {
                    continue;
                }

                let (h, v, d) = self.state.neighbors(x, y);
                if h + v + d == 0 {
                    continue;
                }

                let label = self.state.zero_coding_context(h, v, d);
                if source.read_bit(&mut self.contexts[label]) == 1 {
                    self.magnitudes[idx] |= 1 << plane;
                    self.decode_sign(x, y, source);
                    self.state.flags[idx] |= SIGNIFICANT;
                }
                self.state.flags[idx] |= VISITED;
            }
        });
    }

    /// The magnitude refinement pass (D.3.3): samples significant
    /// before this plane started.
    fn refinement_pass(&mut self, plane: u32, source: &mut impl BitSource) {
        let (width, height) = (self.state.width, self.state.height);

        stripe_columns(width, height, |x, top, rows| {
            for y in top..top + rows {
                let idx = self.state.index(x, y);
                let f = self.state.flags[idx];
                if f & SIGNIFICANT == 0 || f & VISITED != 0 {
                    continue;
                }

                let label = self.state.refinement_context(x, y, f);
                let bit = source.read_bit(&mut self.contexts[label]);
                self.magnitudes[idx] |= bit << plane;
                self.state.flags[idx] |= REFINED;
            }
        });
    }

    /// The cleanup pass (D.3.4): everything the other passes skipped,
    /// with run-length coding of fully quiet stripe columns.
    fn cleanup_pass(&mut self, plane: u32, source: &mut impl BitSource) {
        let (width, height) = (self.state.width, self.state.height);

        stripe_columns(width, height, |x, top, rows| {
            let mut y = top;

            if rows == 4 && self.state.run_length_column(x, top) {
                if source.read_bit(&mut self.contexts[CTX_RUN_LENGTH]) == 0 {
                    // The whole column stays insignificant.
                    return;
                }

                // Two uniform bits locate the first one-bit from the
                // top of the column.
                let upper = source.read_bit(&mut self.contexts[CTX_UNIFORM]);
                let lower = source.read_bit(&mut self.contexts[CTX_UNIFORM]);
                y = top + ((upper << 1) | lower);

                let idx = self.state.index(x, y);
                self.magnitudes[idx] |= 1 << plane;
                self.decode_sign(x, y, source);
                self.state.flags[idx] |= SIGNIFICANT;
                y += 1;
            }

            // Plain coding for whatever run-length mode didn't settle.
            while y < top + rows {
                let idx = self.state.index(x, y);
                if self.state.flags[idx] & (SIGNIFICANT | VISITED) == 0 {
                    let (h, v, d) = self.state.neighbors(x, y);
                    let label = self.state.zero_coding_context(h, v, d);

                    if source.read_bit(&mut self.contexts[label]) == 1 {
                        self.magnitudes[idx] |= 1 << plane;
                        self.decode_sign(x, y, source);
                        self.state.flags[idx] |= SIGNIFICANT;
                    }
                }
                y += 1;
            }
        });
    }

    /// Decode a sign bit (D.3.2).
    fn decode_sign<T: BitSource>(&mut self, x: u32, y: u32, source: &mut T) {
        let (label, flip) = self.state.sign_context(x, y);

        let coded = source.read_bit(&mut self.contexts[label]);
        let negative = if T::IS_RAW { coded } else { coded ^ flip };

        if negative != 0 {
            let idx = self.state.index(x, y);
            self.state.flags[idx] |= NEGATIVE;
        }
    }

    fn into_output(self) -> DecodedBlock {
        let signs = self
            .state
            .flags
            .iter()
            .map(|f| (f & NEGATIVE != 0) as u8)
            .collect();

        DecodedBlock {
            magnitudes: self.magnitudes,
            signs,
        }
    }
}

/// The encoded output of one code block.
#[derive(Debug, Default)]
pub(crate) struct EncodedBlock {
    pub(crate) data: Vec<u8>,
    pub(crate) num_passes: u32,
    /// Number of missing most-significant bit-planes (`P`).
    pub(crate) zero_bitplanes: u8,
}

/// Encode one code block from magnitudes and signs, row-major over
/// `width x height`. Produces a single codeword segment containing
/// every coding pass. The per-pass termination and bypass modes are
/// decode-only.
pub(crate) fn encode_block(
    magnitudes: &[u32],
    signs: &[u8],
    width: u32,
    height: u32,
    orientation: BandOrientation,
    ctx: &BlockContext,
) -> Result<EncodedBlock, Error> {
    if ctx.selective_bypass || ctx.termination_on_each_pass {
        bail!(BlockError::CodecFailure);
    }
    if ctx.num_bitplanes as u32 > MAX_BITPLANES {
        bail!(BlockError::TooManyBitplanes);
    }

    debug_assert_eq!(magnitudes.len(), width as usize * height as usize);

    let top_magnitude = magnitudes.iter().copied().max().unwrap_or(0);
    if top_magnitude == 0 {
        // All-zero blocks contribute no passes; the packet header
        // simply never includes them.
        return Ok(EncodedBlock::default());
    }

    let used_planes = 32 - top_magnitude.leading_zeros();
    if used_planes > ctx.num_bitplanes as u32 {
        bail!(BlockError::InvalidPassStructure);
    }

    let mut encoder = BlockEncoder {
        state: CodingState::new(width, height, orientation, ctx),
        magnitudes,
        contexts: initial_contexts(),
        sink: ArithmeticEncoder::new(),
    };

    // Sign flags are seeded up front; they only influence contexts
    // once a sample turns significant, exactly as on the decode side.
    for (f, sign) in encoder.state.flags.iter_mut().zip(signs) {
        if *sign != 0 {
            *f |= NEGATIVE;
        }
    }

    let num_passes = 3 * used_planes - 2;
    let top_plane = used_planes - 1;

    for pass in 0..num_passes {
        let plane = top_plane - (pass + 2) / 3;

        match pass % 3 {
            1 => encoder.significance_pass(plane),
            2 => encoder.refinement_pass(plane),
            _ => {
                encoder.cleanup_pass(plane);

                if ctx.segmentation_symbols {
                    for bit in [1, 0, 1, 0] {
                        encoder
                            .sink
                            .write_bit(bit, &mut encoder.contexts[CTX_UNIFORM]);
                    }
                }

                encoder.state.end_plane();
            }
        }

        if ctx.reset_probabilities {
            encoder.contexts = initial_contexts();
        }
    }

    Ok(EncodedBlock {
        data: encoder.sink.flush(),
        num_passes,
        zero_bitplanes: (ctx.num_bitplanes as u32 - used_planes) as u8,
    })
}

struct BlockEncoder<'a> {
    state: CodingState,
    magnitudes: &'a [u32],
    contexts: [ContextState; CTX_COUNT],
    sink: ArithmeticEncoder,
}

impl BlockEncoder<'_> {
    #[inline]
    fn bit_at(&self, idx: usize, plane: u32) -> u32 {
        (self.magnitudes[idx] >> plane) & 1
    }

    fn significance_pass(&mut self, plane: u32) {
        let (width, height) = (self.state.width, self.state.height);

        stripe_columns(width, height, |x, top, rows| {
            for y in top..top + rows {
                let idx = self.state.index(x, y);
                if self.state.flags[idx] & SIGNIFICANT != 0 {
                    continue;
                }

                let (h, v, d) = self.state.neighbors(x, y);
                if h + v + d == 0 {
                    continue;
                }

                let label = self.state.zero_coding_context(h, v, d);
                let bit = self.bit_at(idx, plane);
                self.sink.write_bit(bit, &mut self.contexts[label]);

                if bit == 1 {
                    self.encode_sign(x, y);
                    self.state.flags[idx] |= SIGNIFICANT;
                }
                self.state.flags[idx] |= VISITED;
            }
        });
    }

    fn refinement_pass(&mut self, plane: u32) {
        let (width, height) = (self.state.width, self.state.height);

        stripe_columns(width, height, |x, top, rows| {
            for y in top..top + rows {
                let idx = self.state.index(x, y);
                let f = self.state.flags[idx];
                if f & SIGNIFICANT == 0 || f & VISITED != 0 {
                    continue;
                }

                let label = self.state.refinement_context(x, y, f);
                let bit = self.bit_at(idx, plane);
                self.sink.write_bit(bit, &mut self.contexts[label]);
                self.state.flags[idx] |= REFINED;
            }
        });
    }

    fn cleanup_pass(&mut self, plane: u32) {
        let (width, height) = (self.state.width, self.state.height);

        stripe_columns(width, height, |x, top, rows| {
            let mut y = top;

            if rows == 4 && self.state.run_length_column(x, top) {
                let first_one = (0..4u32)
                    .find(|dy| self.bit_at(self.state.index(x, top + dy), plane) == 1);

                let Some(offset) = first_one else {
                    self.sink.write_bit(0, &mut self.contexts[CTX_RUN_LENGTH]);
                    return;
                };

                self.sink.write_bit(1, &mut self.contexts[CTX_RUN_LENGTH]);
                self.sink
                    .write_bit((offset >> 1) & 1, &mut self.contexts[CTX_UNIFORM]);
                self.sink
                    .write_bit(offset & 1, &mut self.contexts[CTX_UNIFORM]);

                y = top + offset;
                let idx = self.state.index(x, y);
                self.encode_sign(x, y);
                self.state.flags[idx] |= SIGNIFICANT;
                y += 1;
            }

            while y < top + rows {
                let idx = self.state.index(x, y);
                if self.state.flags[idx] & (SIGNIFICANT | VISITED) == 0 {
                    let (h, v, d) = self.state.neighbors(x, y);
                    let label = self.state.zero_coding_context(h, v, d);
                    let bit = self.bit_at(idx, plane);
                    self.sink.write_bit(bit, &mut self.contexts[label]);

                    if bit == 1 {
                        self.encode_sign(x, y);
                        self.state.flags[idx] |= SIGNIFICANT;
                    }
                }
                y += 1;
            }
        });
    }

    /// Encode a sign bit (D.3.2).
    fn encode_sign(&mut self, x: u32, y: u32) {
        let (label, flip) = self.state.sign_context(x, y);
        let negative = (self.state.flags[self.state.index(x, y)] & NEGATIVE != 0) as u32;
        self.sink
            .write_bit(negative ^ flip, &mut self.contexts[label]);
    }
}
