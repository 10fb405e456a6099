//! The MQ arithmetic coder, described in Annex C.
//!
//! Encoder and decoder share the probability estimation table and a
//! single state-transition rule: after every coded decision the
//! context steps along its MPS branch when the decision matched the
//! more probable symbol, and along its LPS branch (possibly flipping
//! the symbol sense) when it did not. The conditional-exchange cases
//! of the C.3.2 flow charts reduce to deciding which of the two
//! sub-intervals carries the MPS before applying that rule.

/// Probability estimation table (Table C.2): Qe value, next state on
/// the MPS branch, next state on the LPS branch, and whether the LPS
/// branch flips the MPS sense.
#[rustfmt::skip]
static QE_TABLE: [(u32, u8, u8, bool); 47] = [
    (0x5601,  1,  1, true),
    (0x3401,  2,  6, false),
    (0x1801,  3,  9, false),
    (0x0AC1,  4, 12, false),
    (0x0521,  5, 29, false),
    (0x0221, 38, 33, false),
    (0x5601,  7,  6, true),
    (0x5401,  8, 14, false),
    (0x4801,  9, 14, false),
    (0x3801, 10, 14, false),
    (0x3001, 11, 17, false),
    (0x2401, 12, 18, false),
    (0x1C01, 13, 20, false),
    (0x1601, 29, 21, false),
    (0x5601, 15, 14, true),
    (0x5401, 16, 14, false),
    (0x5101, 17, 15, false),
    (0x4801, 18, 16, false),
    (0x3801, 19, 17, false),
    (0x3401, 20, 18, false),
    (0x3001, 21, 19, false),
    (0x2801, 22, 19, false),
    (0x2401, 23, 20, false),
    (0x2201, 24, 21, false),
    (0x1C01, 25, 22, false),
    (0x1801, 26, 23, false),
    (0x1601, 27, 24, false),
    (0x1401, 28, 25, false),
    (0x1201, 29, 26, false),
    (0x1101, 30, 27, false),
    (0x0AC1, 31, 28, false),
    (0x09C1, 32, 29, false),
    (0x08A1, 33, 30, false),
    (0x0521, 34, 31, false),
    (0x0441, 35, 32, false),
    (0x02A1, 36, 33, false),
    (0x0221, 37, 34, false),
    (0x0141, 38, 35, false),
    (0x0111, 39, 36, false),
    (0x0085, 40, 37, false),
    (0x0049, 41, 38, false),
    (0x0025, 42, 39, false),
    (0x0015, 43, 40, false),
    (0x0009, 44, 41, false),
    (0x0005, 45, 42, false),
    (0x0001, 46, 43, false),
    (0x5601, 46, 46, false),
];

/// Adaptive probability state of one coding context.
#[derive(Copy, Clone, Debug, Default)]
pub(crate) struct ContextState {
    index: u8,
    mps: u8,
}

impl ContextState {
    pub(crate) fn new(index: u8, mps: u8) -> Self {
        Self { index, mps }
    }

    #[inline(always)]
    fn qe(&self) -> u32 {
        QE_TABLE[self.index as usize].0
    }

    #[inline(always)]
    fn mps_bit(&self) -> u32 {
        self.mps as u32
    }

    #[inline(always)]
    fn lps_bit(&self) -> u32 {
        1 - self.mps as u32
    }

    /// Step the estimator after a coded decision.
    #[inline(always)]
    fn step(&mut self, was_mps: bool) {
        let (_, next_mps, next_lps, flip) = QE_TABLE[self.index as usize];

        if was_mps {
            self.index = next_mps;
        } else {
            if flip {
                self.mps ^= 1;
            }
            self.index = next_lps;
        }
    }
}

/// The decoder side: INITDEC, BYTEIN, RENORMD and DECODE from C.3, in
/// the software-convention form of ITU-T T.88 Annex G.
pub(crate) struct ArithmeticDecoder<'a> {
    data: &'a [u8],
    /// The C register (code bits above, spacer and count bits below).
    c: u32,
    /// The A register (current interval size).
    a: u32,
    /// Index of the byte feeding the register.
    position: usize,
    /// Code bits left before the next byte is needed.
    pending: u32,
}

impl<'a> ArithmeticDecoder<'a> {
    pub(crate) fn new(data: &'a [u8]) -> Self {
        let mut decoder = Self {
            data,
            c: 0,
            a: 0,
            position: 0,
            pending: 0,
        };

        // INITDEC (C.3.5).
        decoder.c = ((decoder.byte_at(0) as u32) ^ 0xFF) << 16;
        decoder.refill();
        decoder.c <<= 7;
        decoder.pending -= 7;
        decoder.a = 0x8000;

        decoder
    }

    pub(crate) fn read_bit(&mut self, context: &mut ContextState) -> u32 {
        self.decode(context)
    }

    /// The byte at `idx`; past the end the decoder feeds itself 0xFF,
    /// which the marker guard below turns into 1-bits (C.3.4).
    #[inline]
    fn byte_at(&self, idx: usize) -> u8 {
        self.data.get(idx).copied().unwrap_or(0xFF)
    }

    /// BYTEIN (C.3.4): move one byte into the register, honoring the
    /// bit-stuffing rule after 0xFF bytes.
    fn refill(&mut self) {
        if self.byte_at(self.position) == 0xFF {
            if self.byte_at(self.position + 1) > 0x8F {
                // A marker follows: stop consuming and run on 1-bits.
                self.pending = 8;
                return;
            }
            self.position += 1;
            self.c += 0xFE00 - ((self.byte_at(self.position) as u32) << 9);
            self.pending = 7;
        } else {
            self.position += 1;
            self.c += 0xFF00 - ((self.byte_at(self.position) as u32) << 8);
            self.pending = 8;
        }
    }

    /// RENORMD (C.3.3): shift until the interval regains its top bit.
    fn renormalize(&mut self) {
        loop {
            if self.pending == 0 {
                self.refill();
            }

            self.a <<= 1;
            self.c <<= 1;
            self.pending -= 1;

            if self.a & 0x8000 != 0 {
                return;
            }
        }
    }

    /// DECODE (C.3.2). The conditional exchanges collapse into one
    /// question: does the chosen sub-interval carry the MPS?
    fn decode(&mut self, context: &mut ContextState) -> u32 {
        let qe = context.qe();
        self.a -= qe;

        if (self.c >> 16) < self.a {
            // Upper sub-interval.
            if self.a & 0x8000 != 0 {
                // No renormalisation, no state change.
                return context.mps_bit();
            }

            // The shrunken upper interval carries the MPS only while
            // it is still the larger of the two.
            let was_mps = self.a >= qe;
            let bit = if was_mps {
                context.mps_bit()
            } else {
                context.lps_bit()
            };
            context.step(was_mps);
            self.renormalize();
            bit
        } else {
            // Lower sub-interval, of size Qe.
            self.c -= self.a << 16;

            let was_mps = self.a < qe;
            let bit = if was_mps {
                context.mps_bit()
            } else {
                context.lps_bit()
            };
            self.a = qe;
            context.step(was_mps);
            self.renormalize();
            bit
        }
    }
}

/// The encoder side: INITENC, BYTEOUT and FLUSH from C.3.
pub(crate) struct ArithmeticEncoder {
    out: Vec<u8>,
    /// The last produced byte; carries may still propagate into it.
    staged: Option<u8>,
    c: u32,
    a: u32,
    countdown: u32,
}

impl ArithmeticEncoder {
    pub(crate) fn new() -> Self {
        // INITENC (C.3.6).
        Self {
            out: Vec::new(),
            staged: None,
            c: 0,
            a: 0x8000,
            countdown: 12,
        }
    }

    pub(crate) fn write_bit(&mut self, d: u32, context: &mut ContextState) {
        let qe = context.qe();
        self.a -= qe;

        if d == context.mps_bit() {
            // CODEMPS.
            if self.a & 0x8000 != 0 {
                self.c += qe;
                return;
            }

            if self.a < qe {
                self.a = qe;
            } else {
                self.c += qe;
            }
            context.step(true);
        } else {
            // CODELPS.
            if self.a < qe {
                self.c += qe;
            } else {
                self.a = qe;
            }
            context.step(false);
        }

        self.renormalize();
    }

    /// RENORME (C.3.3).
    fn renormalize(&mut self) {
        loop {
            self.a <<= 1;
            self.c <<= 1;
            self.countdown -= 1;

            if self.countdown == 0 {
                self.emit();
            }

            if self.a & 0x8000 != 0 {
                return;
            }
        }
    }

    fn push_staged(&mut self) {
        if let Some(byte) = self.staged.take() {
            self.out.push(byte);
        }
    }

    /// BYTEOUT (C.3.7), with the bit-stuffing rule after 0xFF bytes.
    fn emit(&mut self) {
        if self.staged == Some(0xFF) {
            self.push_staged();
            self.staged = Some((self.c >> 20) as u8);
            self.c &= 0xF_FFFF;
            self.countdown = 7;
            return;
        }

        if self.c >= 0x800_0000 {
            // Propagate the carry into the staged byte. A carry with
            // nothing staged cannot occur: the interval never leaves
            // the unit range before the first byte is produced.
            match &mut self.staged {
                Some(byte) => *byte += 1,
                None => {
                    debug_assert!(false, "carry before first output byte");
                    self.c &= 0x7FF_FFFF;
                }
            }

            if self.staged == Some(0xFF) {
                self.c &= 0x7FF_FFFF;
                self.push_staged();
                self.staged = Some((self.c >> 20) as u8);
                self.c &= 0xF_FFFF;
                self.countdown = 7;
                return;
            }
        }

        self.push_staged();
        self.staged = Some((self.c >> 19) as u8);
        self.c &= 0x7_FFFF;
        self.countdown = 8;
    }

    /// FLUSH (C.3.9). A trailing 0xFF is dropped; the decoder
    /// reconstitutes it.
    pub(crate) fn flush(mut self) -> Vec<u8> {
        // SETBITS: load C with as many 1-bits as the interval allows.
        let ceiling = self.c + self.a;
        self.c |= 0xFFFF;
        if self.c >= ceiling {
            self.c -= 0x8000;
        }

        self.c <<= self.countdown;
        self.emit();
        self.c <<= self.countdown;
        self.emit();

        if self.staged != Some(0xFF) {
            self.push_staged();
        }

        self.out
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    // Adapted from the Serenity decoder, which in turn took the
    // example from https://www.itu.int/rec/T-REC-T.88-201808-I
    // H.2 Test sequence for arithmetic coder.
    #[test]
    fn decode_reference_sequence() {
        let input = [
            0x84, 0xC7, 0x3B, 0xFC, 0xE1, 0xA1, 0x43, 0x04, 0x02, 0x20, 0x00, 0x00, 0x41, 0x0D,
            0xBB, 0x86, 0xF4, 0x31, 0x7F, 0xFF, 0x88, 0xFF, 0x37, 0x47, 0x1A, 0xDB, 0x6A, 0xDF,
            0xFF, 0xAC,
        ];

        let expected_output = [
            0x00, 0x02, 0x00, 0x51, 0x00, 0x00, 0x00, 0xC0, 0x03, 0x52, 0x87, 0x2A, 0xAA, 0xAA,
            0xAA, 0xAA, 0x82, 0xC0, 0x20, 0x00, 0xFC, 0xD7, 0x9E, 0xF6, 0xBF, 0x7F, 0xED, 0x90,
            0x4F, 0x46, 0xA3, 0xBF,
        ];

        let mut decoder = ArithmeticDecoder::new(&input[..]);
        let mut ctx = ContextState::default();
        let mut out = Vec::new();

        for _ in 0..expected_output.len() {
            let mut byte = 0u8;
            for _ in 0..8 {
                byte = (byte << 1) | decoder.read_bit(&mut ctx) as u8;
            }
            out.push(byte);
        }

        assert_eq!(out, expected_output);
    }

    #[test]
    fn encode_decode_round_trip() {
        // A bit pattern with long MPS runs, alternations and enough
        // length to cross several byte boundaries and renorms.
        let mut bits = Vec::new();
        let mut state = 0x2F1E_D40Bu32;
        for i in 0..4096u32 {
            state = state.wrapping_mul(1_664_525).wrapping_add(1_013_904_223);
            let bit = if i % 97 < 60 { 0 } else { (state >> 17) & 1 };
            bits.push(bit);
        }

        // Spread the bits over several contexts like the bit-plane
        // coder does.
        let mut encoder = ArithmeticEncoder::new();
        let mut enc_contexts = [ContextState::default(); 4];
        for (i, bit) in bits.iter().enumerate() {
            encoder.write_bit(*bit, &mut enc_contexts[i % 4]);
        }
        let data = encoder.flush();

        let mut decoder = ArithmeticDecoder::new(&data);
        let mut dec_contexts = [ContextState::default(); 4];
        for (i, bit) in bits.iter().enumerate() {
            assert_eq!(
                decoder.read_bit(&mut dec_contexts[i % 4]),
                *bit,
                "bit {i} mismatched"
            );
        }
    }

    #[test]
    fn all_mps_stream_is_short() {
        let mut encoder = ArithmeticEncoder::new();
        let mut ctx = ContextState::default();
        for _ in 0..1000 {
            encoder.write_bit(0, &mut ctx);
        }
        let data = encoder.flush();
        assert!(data.len() < 32);

        let mut decoder = ArithmeticDecoder::new(&data);
        let mut ctx = ContextState::default();
        for _ in 0..1000 {
            assert_eq!(decoder.read_bit(&mut ctx), 0);
        }
    }
}
