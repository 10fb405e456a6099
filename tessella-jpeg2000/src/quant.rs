//! Quantization and dequantization of subband coefficients (Annex E).

use crate::codestream::{ComponentInfo, QuantizationStyle};
use crate::rect::BandOrientation;

/// The log2 gain of a subband (Table E.1).
pub(crate) fn log_gain(orientation: BandOrientation) -> u16 {
    match orientation {
        BandOrientation::LowLow => 0,
        BandOrientation::LowHigh => 1,
        BandOrientation::HighLow => 1,
        BandOrientation::HighHigh => 2,
    }
}

/// The maximum number of bit-planes of a subband, `Mb` from equation
/// E-2: the guard bits plus the subband exponent, minus one.
pub(crate) fn num_bitplanes(
    component_info: &ComponentInfo,
    orientation: BandOrientation,
    resolution: u16,
) -> u8 {
    let (exponent, _) = component_info.exponent_mantissa(orientation, resolution);
    (component_info.quantization.guard_bits as u16 + exponent).saturating_sub(1) as u8
}

/// The quantization step size of a subband, equation E-3, expressed
/// relative to the nominal dynamic range `Rb = precision + gain`.
/// `None` for reversible coding where coefficients pass through
/// unscaled.
pub(crate) fn step_size(
    component_info: &ComponentInfo,
    orientation: BandOrientation,
    resolution: u16,
) -> Option<f32> {
    if component_info.quantization.quantization_style == QuantizationStyle::NoQuantization {
        return None;
    }

    let (exponent, mantissa) = component_info.exponent_mantissa(orientation, resolution);

    let r_b = component_info.size_info.precision as u16 + log_gain(orientation);
    let delta_b = 2.0f32.powi(r_b as i32 - exponent as i32)
        * (1.0 + (mantissa as f32) / (2u32.pow(11) as f32));

    Some(delta_b)
}

/// Dequantize a decoded magnitude/sign pair into a coefficient.
#[inline]
pub(crate) fn dequantize(magnitude: u32, sign: u8, delta: Option<f32>) -> f32 {
    let mut value = magnitude as f32;
    if sign != 0 {
        value = -value;
    }
    if let Some(delta) = delta {
        value *= delta;
    }

    value
}

/// Quantize a coefficient into a magnitude/sign pair (E-1: sign
/// magnitude with deadzone).
#[inline]
pub(crate) fn quantize(value: f32, delta: Option<f32>) -> (u32, u8) {
    let sign = (value < 0.0) as u8;
    let magnitude = match delta {
        Some(delta) => (value.abs() / delta) as u32,
        None => value.abs() as u32,
    };

    (magnitude, sign)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn quantize_round_trips_reversible() {
        for v in [-300.0, -1.0, 0.0, 1.0, 17.0, 4095.0] {
            let (magnitude, sign) = quantize(v, None);
            assert_eq!(dequantize(magnitude, sign, None), v);
        }
    }

    #[test]
    fn quantize_truncates_towards_zero() {
        let delta = Some(0.5);
        let (magnitude, sign) = quantize(-3.3, delta);
        assert_eq!((magnitude, sign), (6, 1));
        assert_eq!(dequantize(magnitude, sign, delta), -3.0);
    }
}
