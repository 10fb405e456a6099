//! The codestream marker state machine: parsing and emitting the main
//! header (Annex A).

use crate::byte_io::{Reader, Writer};
use crate::error::{MarkerError, Result, ValidationError, bail, err};
use crate::log::{ldebug, lwarn};
use crate::rect::{BandOrientation, Rect};

/// Parsed main header state.
#[derive(Debug)]
pub(crate) struct Header {
    pub(crate) size_data: SizeData,
    pub(crate) global_coding_style: CodingStyleDefault,
    pub(crate) component_infos: Vec<ComponentInfo>,
    /// Progression order changes from the POC marker, in codestream
    /// order.
    pub(crate) progression_changes: Vec<ProgressionChange>,
    /// Packed packet headers collected from PPM markers, concatenated
    /// in Zppm order.
    pub(crate) packed_headers: Option<Vec<u8>>,
}

/// Read the main header: SIZ, then functional markers until SOT.
pub(crate) fn read_header(reader: &mut Reader<'_>) -> Result<Header> {
    if reader.read_marker()? != markers::SIZ {
        bail!(MarkerError::OutOfOrder);
    }

    let size_data = size_marker(reader)?;

    let mut cod = None;
    let mut qcd = None;
    let mut progression_changes = Vec::new();
    let mut packed_headers: Option<Vec<u8>> = None;

    let num_components = size_data.component_sizes.len() as u16;
    let mut cod_components = vec![None; num_components as usize];
    let mut qcd_components = vec![None; num_components as usize];

    loop {
        let marker = reader.peek_marker().ok_or(MarkerError::Missing("SOT"))?;
        match marker {
            markers::SOT => break,
            markers::COD => {
                reader.read_marker()?;
                cod = Some(cod_marker(reader).ok_or(MarkerError::ParseFailure("COD"))?);
            }
            markers::COC => {
                reader.read_marker()?;
                let (component_index, coc) = coc_marker(reader, num_components)
                    .ok_or(MarkerError::ParseFailure("COC"))?;
                cod_components[component_index as usize] = Some(coc);
            }
            markers::QCD => {
                reader.read_marker()?;
                qcd = Some(qcd_marker(reader).ok_or(MarkerError::ParseFailure("QCD"))?);
            }
            markers::QCC => {
                reader.read_marker()?;
                let (component_index, qcc) = qcc_marker(reader, num_components)
                    .ok_or(MarkerError::ParseFailure("QCC"))?;
                qcd_components[component_index as usize] = Some(qcc);
            }
            markers::POC => {
                reader.read_marker()?;
                progression_changes = poc_marker(reader, num_components)
                    .ok_or(MarkerError::ParseFailure("POC"))?;
            }
            markers::PPM => {
                reader.read_marker()?;
                let segment = ppm_marker(reader).ok_or(MarkerError::ParseFailure("PPM"))?;
                packed_headers.get_or_insert_with(Vec::new).extend(segment);
            }
            markers::RGN => {
                reader.read_marker()?;
                lwarn!("RGN marker present, region-of-interest shift is ignored");
                skip_marker_segment(reader).ok_or(MarkerError::ParseFailure("RGN"))?;
            }
            markers::TLM | markers::PLM | markers::CRG | markers::COM => {
                reader.read_marker()?;
                skip_marker_segment(reader).ok_or(MarkerError::ParseFailure("TLM/PLM/CRG/COM"))?;
            }
            markers::SOD | markers::EOC | markers::SOC => {
                bail!(MarkerError::OutOfOrder);
            }
            other => {
                reader.read_marker()?;
                if (0x30..=0x3F).contains(&other) {
                    // Markers 0xFF30..0xFF3F carry no segment.
                    continue;
                }
                ldebug!("skipping unknown marker 0x{:02X} in main header", other);
                skip_marker_segment(reader).ok_or(MarkerError::Invalid(markers::word(other)))?;
            }
        }
    }

    let cod = cod.ok_or(MarkerError::Missing("COD"))?;
    let qcd = qcd.ok_or(MarkerError::Missing("QCD"))?;

    let component_infos: Vec<ComponentInfo> = size_data
        .component_sizes
        .iter()
        .enumerate()
        .map(|(idx, csi)| ComponentInfo {
            size_info: *csi,
            coding_style: cod_components[idx]
                .clone()
                .unwrap_or(cod.component_parameters.clone()),
            quantization: qcd_components[idx].clone().unwrap_or(qcd.clone()),
        })
        .collect();

    for ci in &component_infos {
        ci.coding_style.parameters.validate()?;
    }

    Ok(Header {
        size_data,
        global_coding_style: cod,
        component_infos,
        progression_changes,
        packed_headers,
    })
}

/// Per-component header state: sizes, coding style, quantization.
#[derive(Debug, Clone)]
pub(crate) struct ComponentInfo {
    pub(crate) size_info: ComponentSizeInfo,
    pub(crate) coding_style: CodingStyleComponent,
    pub(crate) quantization: QuantizationInfo,
}

impl ComponentInfo {
    /// The exponent/mantissa pair of a subband (E-3 to E-5).
    pub(crate) fn exponent_mantissa(
        &self,
        orientation: BandOrientation,
        resolution: u16,
    ) -> (u16, u16) {
        let n_ll = self.coding_style.parameters.num_decomposition_levels;

        let sb_index = match orientation {
            BandOrientation::LowLow => 0,
            BandOrientation::HighLow => 0,
            BandOrientation::LowHigh => 1,
            BandOrientation::HighHigh => 2,
        };

        let step_sizes = &self.quantization.step_sizes;
        match self.quantization.quantization_style {
            QuantizationStyle::NoQuantization | QuantizationStyle::ScalarExpounded => {
                let idx = if resolution == 0 {
                    0
                } else {
                    (1 + (resolution - 1) * 3 + sb_index) as usize
                };
                let entry = step_sizes.get(idx).copied().unwrap_or(StepSize {
                    mantissa: 0,
                    exponent: 0,
                });

                (entry.exponent, entry.mantissa)
            }
            QuantizationStyle::ScalarDerived => {
                let e_0 = step_sizes[0].exponent;
                let mantissa = step_sizes[0].mantissa;
                let n_b = if resolution == 0 {
                    n_ll
                } else {
                    n_ll + 1 - resolution
                };

                (e_0 + n_b - n_ll, mantissa)
            }
        }
    }

    pub(crate) fn wavelet_transform(&self) -> WaveletTransform {
        self.coding_style.parameters.transformation
    }

    pub(crate) fn code_block_style(&self) -> CodeBlockStyle {
        self.coding_style.parameters.code_block_style
    }
}

/// Progression order (Table A.16).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProgressionOrder {
    LayerResolutionComponentPosition,
    ResolutionLayerComponentPosition,
    ResolutionPositionComponentLayer,
    PositionComponentResolutionLayer,
    ComponentPositionResolutionLayer,
}

impl ProgressionOrder {
    fn from_u8(value: u8) -> Result<Self> {
        match value {
            0 => Ok(Self::LayerResolutionComponentPosition),
            1 => Ok(Self::ResolutionLayerComponentPosition),
            2 => Ok(Self::ResolutionPositionComponentLayer),
            3 => Ok(Self::PositionComponentResolutionLayer),
            4 => Ok(Self::ComponentPositionResolutionLayer),
            _ => err!(ValidationError::InvalidProgressionOrder),
        }
    }

    pub(crate) fn to_u8(self) -> u8 {
        match self {
            Self::LayerResolutionComponentPosition => 0,
            Self::ResolutionLayerComponentPosition => 1,
            Self::ResolutionPositionComponentLayer => 2,
            Self::PositionComponentResolutionLayer => 3,
            Self::ComponentPositionResolutionLayer => 4,
        }
    }
}

/// One progression order change from the POC marker (A.6.6).
#[derive(Debug, Clone, Copy)]
pub(crate) struct ProgressionChange {
    pub(crate) resolution_start: u8,
    pub(crate) component_start: u16,
    pub(crate) layer_end: u16,
    pub(crate) resolution_end: u8,
    pub(crate) component_end: u16,
    pub(crate) order: ProgressionOrder,
}

/// Wavelet transformation type (Table A.20).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WaveletTransform {
    Irreversible97,
    Reversible53,
}

impl WaveletTransform {
    fn from_u8(value: u8) -> Result<Self> {
        match value {
            0 => Ok(Self::Irreversible97),
            1 => Ok(Self::Reversible53),
            _ => err!(ValidationError::InvalidParameter("transformation type")),
        }
    }

    pub(crate) fn to_u8(self) -> u8 {
        match self {
            Self::Irreversible97 => 0,
            Self::Reversible53 => 1,
        }
    }

    pub(crate) fn is_reversible(self) -> bool {
        self == Self::Reversible53
    }
}

/// Coding style flags (Table A.13).
#[derive(Debug, Clone, Copy, Default)]
pub(crate) struct CodingStyleFlags {
    raw: u8,
}

impl CodingStyleFlags {
    pub(crate) fn from_u8(value: u8) -> Self {
        Self { raw: value }
    }

    pub(crate) fn to_u8(self) -> u8 {
        self.raw
    }

    pub(crate) fn has_precincts(&self) -> bool {
        (self.raw & 0x01) != 0
    }

    pub(crate) fn may_use_sop_markers(&self) -> bool {
        (self.raw & 0x02) != 0
    }

    pub(crate) fn uses_eph_marker(&self) -> bool {
        (self.raw & 0x04) != 0
    }
}

/// Code-block style flags (Table A.19).
#[derive(Debug, Clone, Copy, Default)]
pub(crate) struct CodeBlockStyle {
    pub(crate) selective_arithmetic_coding_bypass: bool,
    pub(crate) reset_context_probabilities: bool,
    pub(crate) termination_on_each_pass: bool,
    pub(crate) vertically_causal_context: bool,
    pub(crate) predictable_termination: bool,
    pub(crate) segmentation_symbols: bool,
}

impl CodeBlockStyle {
    fn from_u8(value: u8) -> Self {
        Self {
            selective_arithmetic_coding_bypass: (value & 0x01) != 0,
            reset_context_probabilities: (value & 0x02) != 0,
            termination_on_each_pass: (value & 0x04) != 0,
            vertically_causal_context: (value & 0x08) != 0,
            predictable_termination: (value & 0x10) != 0,
            segmentation_symbols: (value & 0x20) != 0,
        }
    }

    pub(crate) fn to_u8(self) -> u8 {
        (self.selective_arithmetic_coding_bypass as u8)
            | (self.reset_context_probabilities as u8) << 1
            | (self.termination_on_each_pass as u8) << 2
            | (self.vertically_causal_context as u8) << 3
            | (self.predictable_termination as u8) << 4
            | (self.segmentation_symbols as u8) << 5
    }
}

/// Quantization style (Table A.28).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum QuantizationStyle {
    NoQuantization,
    ScalarDerived,
    ScalarExpounded,
}

impl QuantizationStyle {
    fn from_u8(value: u8) -> Result<Self> {
        match value & 0x1F {
            0 => Ok(Self::NoQuantization),
            1 => Ok(Self::ScalarDerived),
            2 => Ok(Self::ScalarExpounded),
            _ => err!(ValidationError::InvalidQuantizationStyle),
        }
    }

    fn to_u8(self) -> u8 {
        match self {
            Self::NoQuantization => 0,
            Self::ScalarDerived => 1,
            Self::ScalarExpounded => 2,
        }
    }
}

#[derive(Clone, Copy, Debug)]
pub(crate) struct StepSize {
    pub(crate) mantissa: u16,
    pub(crate) exponent: u16,
}

/// Quantization properties, from the QCD and QCC markers (A.6.4 and
/// A.6.5).
#[derive(Clone, Debug)]
pub(crate) struct QuantizationInfo {
    pub(crate) quantization_style: QuantizationStyle,
    pub(crate) guard_bits: u8,
    pub(crate) step_sizes: Vec<StepSize>,
}

/// Default values for coding style, from the COD marker (A.6.1).
#[derive(Debug, Clone)]
pub(crate) struct CodingStyleDefault {
    pub(crate) progression_order: ProgressionOrder,
    pub(crate) num_layers: u16,
    pub(crate) mct: bool,
    // The default used for all components, unless overridden by COC.
    pub(crate) component_parameters: CodingStyleComponent,
}

/// Coding style of one component, from the COC marker (A.6.2).
#[derive(Clone, Debug)]
pub(crate) struct CodingStyleComponent {
    pub(crate) flags: CodingStyleFlags,
    pub(crate) parameters: CodingStyleParameters,
}

/// Shared parameters between the COC and COD marker (A.6.1 and A.6.2).
#[derive(Clone, Debug)]
pub(crate) struct CodingStyleParameters {
    pub(crate) num_decomposition_levels: u16,
    pub(crate) num_resolution_levels: u16,
    /// Code-block width exponent (already offset by two).
    pub(crate) code_block_width: u8,
    /// Code-block height exponent (already offset by two).
    pub(crate) code_block_height: u8,
    pub(crate) code_block_style: CodeBlockStyle,
    pub(crate) transformation: WaveletTransform,
    pub(crate) precinct_exponents: Vec<(u8, u8)>,
}

impl CodingStyleParameters {
    pub(crate) fn validate(&self) -> Result<()> {
        if self.num_resolution_levels > 33 {
            bail!(ValidationError::InvalidParameter("resolution count"));
        }
        if !(2..=10).contains(&self.code_block_width) || !(2..=10).contains(&self.code_block_height)
        {
            bail!(ValidationError::InvalidParameter("code-block exponent"));
        }
        // The nominal code-block area may not exceed 4096 samples.
        if self.code_block_width + self.code_block_height > 12 {
            bail!(ValidationError::InvalidParameter("code-block area"));
        }
        if self.precinct_exponents.len() < self.num_resolution_levels as usize {
            bail!(ValidationError::InvalidParameter("precinct exponents"));
        }
        for (ppx, ppy) in &self.precinct_exponents {
            if *ppx > 15 || *ppy > 15 {
                bail!(ValidationError::InvalidParameter("precinct exponent"));
            }
        }

        Ok(())
    }
}

#[derive(Debug)]
pub(crate) struct SizeData {
    /// Width of the reference grid (Xsiz).
    pub(crate) reference_grid_width: u32,
    /// Height of the reference grid (Ysiz).
    pub(crate) reference_grid_height: u32,
    /// Horizontal offset from the origin of the reference grid to the
    /// left side of the image area (XOsiz).
    pub(crate) image_area_x_offset: u32,
    /// Vertical offset from the origin of the reference grid to the
    /// top side of the image area (YOsiz).
    pub(crate) image_area_y_offset: u32,
    /// Width of one reference tile with respect to the reference grid
    /// (XTsiz).
    pub(crate) tile_width: u32,
    /// Height of one reference tile with respect to the reference
    /// grid (YTsiz).
    pub(crate) tile_height: u32,
    /// Horizontal offset from the origin of the reference grid to the
    /// left side of the first tile (XTOsiz).
    pub(crate) tile_x_offset: u32,
    /// Vertical offset from the origin of the reference grid to the
    /// top side of the first tile (YTOsiz).
    pub(crate) tile_y_offset: u32,
    /// Component information (Ssiz/XRsiz/YRsiz).
    pub(crate) component_sizes: Vec<ComponentSizeInfo>,
}

impl SizeData {
    pub(crate) fn tile_x_coord(&self, idx: u32) -> u32 {
        // See B-6.
        idx % self.num_x_tiles()
    }

    pub(crate) fn tile_y_coord(&self, idx: u32) -> u32 {
        // See B-6.
        idx / self.num_x_tiles()
    }

    /// The number of tiles in the x direction.
    pub(crate) fn num_x_tiles(&self) -> u32 {
        // See formula B-5.
        (self.reference_grid_width - self.tile_x_offset).div_ceil(self.tile_width)
    }

    /// The number of tiles in the y direction.
    pub(crate) fn num_y_tiles(&self) -> u32 {
        // See formula B-5.
        (self.reference_grid_height - self.tile_y_offset).div_ceil(self.tile_height)
    }

    /// The total number of tiles.
    pub(crate) fn num_tiles(&self) -> u32 {
        self.num_x_tiles() * self.num_y_tiles()
    }

    /// The image area on the reference grid.
    pub(crate) fn image_area(&self) -> Rect {
        Rect::from_ltrb(
            self.image_area_x_offset,
            self.image_area_y_offset,
            self.reference_grid_width,
            self.reference_grid_height,
        )
    }

    /// The overall width of the image.
    pub(crate) fn image_width(&self) -> u32 {
        self.reference_grid_width - self.image_area_x_offset
    }

    /// The overall height of the image.
    pub(crate) fn image_height(&self) -> u32 {
        self.reference_grid_height - self.image_area_y_offset
    }
}

/// Component information (A.5.1 and Table A.11).
#[derive(Debug, Clone, Copy)]
pub(crate) struct ComponentSizeInfo {
    pub(crate) precision: u8,
    pub(crate) is_signed: bool,
    pub(crate) horizontal_resolution: u8,
    pub(crate) vertical_resolution: u8,
}

/// SIZ marker (A.5.1).
fn size_marker(reader: &mut Reader<'_>) -> Result<SizeData> {
    let size_data = size_marker_inner(reader).ok_or(MarkerError::ParseFailure("SIZ"))?;

    if size_data.tile_width == 0
        || size_data.tile_height == 0
        || size_data.reference_grid_width == 0
        || size_data.reference_grid_height == 0
    {
        bail!(ValidationError::InvalidDimensions);
    }

    if size_data.tile_x_offset >= size_data.reference_grid_width
        || size_data.tile_y_offset >= size_data.reference_grid_height
    {
        bail!(ValidationError::InvalidDimensions);
    }

    // The tile grid offsets (XTOsiz, YTOsiz) are constrained to be no
    // greater than the image area offsets (B-3).
    if size_data.tile_x_offset > size_data.image_area_x_offset
        || size_data.tile_y_offset > size_data.image_area_y_offset
    {
        bail!(ValidationError::InvalidOffsets);
    }

    // Also, the tile size plus the tile offset shall be greater than
    // the image area offset, so tile 0 contains at least one reference
    // grid point of the image area (B-4).
    if size_data.tile_x_offset + size_data.tile_width <= size_data.image_area_x_offset
        || size_data.tile_y_offset + size_data.tile_height <= size_data.image_area_y_offset
    {
        bail!(ValidationError::InvalidOffsets);
    }

    for comp in &size_data.component_sizes {
        if comp.precision == 0 || comp.vertical_resolution == 0 || comp.horizontal_resolution == 0 {
            bail!(ValidationError::InvalidParameter("component metadata"));
        }

        if comp.precision > 16 {
            bail!(ValidationError::Unsupported(
                "component precision above 16 bits"
            ));
        }
    }

    Ok(size_data)
}

fn size_marker_inner(reader: &mut Reader<'_>) -> Option<SizeData> {
    // Length.
    let _ = reader.read_u16()?;
    // Decoder capabilities.
    let _ = reader.read_u16()?;

    let xsiz = reader.read_u32()?;
    let ysiz = reader.read_u32()?;
    let x_osiz = reader.read_u32()?;
    let y_osiz = reader.read_u32()?;
    let xt_siz = reader.read_u32()?;
    let yt_siz = reader.read_u32()?;
    let xto_siz = reader.read_u32()?;
    let yto_siz = reader.read_u32()?;
    let csiz = reader.read_u16()?;

    let mut components = Vec::with_capacity(csiz as usize);
    for _ in 0..csiz {
        let ssiz = reader.read_byte()?;
        let x_rsiz = reader.read_byte()?;
        let y_rsiz = reader.read_byte()?;

        components.push(ComponentSizeInfo {
            precision: (ssiz & 0x7F) + 1,
            is_signed: (ssiz & 0x80) != 0,
            horizontal_resolution: x_rsiz,
            vertical_resolution: y_rsiz,
        });
    }

    Some(SizeData {
        reference_grid_width: xsiz,
        reference_grid_height: ysiz,
        image_area_x_offset: x_osiz,
        image_area_y_offset: y_osiz,
        tile_width: xt_siz,
        tile_height: yt_siz,
        tile_x_offset: xto_siz,
        tile_y_offset: yto_siz,
        component_sizes: components,
    })
}

fn coding_style_parameters(
    reader: &mut Reader<'_>,
    coding_style: &CodingStyleFlags,
) -> Option<CodingStyleParameters> {
    let num_decomposition_levels = reader.read_byte()? as u16;
    let num_resolution_levels = num_decomposition_levels.checked_add(1)?;
    let code_block_width = reader.read_byte()?.checked_add(2)?;
    let code_block_height = reader.read_byte()?.checked_add(2)?;
    let code_block_style = CodeBlockStyle::from_u8(reader.read_byte()?);
    let transformation = WaveletTransform::from_u8(reader.read_byte()?).ok()?;

    let mut precinct_exponents = Vec::new();
    if coding_style.has_precincts() {
        // "Entropy coder with precincts defined below."
        for _ in 0..num_resolution_levels {
            // Table A.21.
            let precinct_size = reader.read_byte()?;
            let width_exp = precinct_size & 0xF;
            let height_exp = precinct_size >> 4;
            precinct_exponents.push((width_exp, height_exp));
        }
    } else {
        // "Entropy coder, precincts with PPx = 15 and PPy = 15"
        for _ in 0..num_resolution_levels {
            precinct_exponents.push((15, 15));
        }
    }

    Some(CodingStyleParameters {
        num_decomposition_levels,
        num_resolution_levels,
        code_block_width,
        code_block_height,
        code_block_style,
        transformation,
        precinct_exponents,
    })
}

pub(crate) fn skip_marker_segment(reader: &mut Reader<'_>) -> Option<()> {
    let length = reader.read_u16()?.checked_sub(2)?;
    reader.skip_bytes(length as usize)?;

    Some(())
}

/// COD marker (A.6.1).
pub(crate) fn cod_marker(reader: &mut Reader<'_>) -> Option<CodingStyleDefault> {
    // Length.
    let _ = reader.read_u16()?;

    let coding_style_flags = CodingStyleFlags::from_u8(reader.read_byte()?);
    let progression_order = ProgressionOrder::from_u8(reader.read_byte()?).ok()?;

    let num_layers = reader.read_u16()?;
    if num_layers == 0 {
        return None;
    }
    let mct = reader.read_byte()? == 1;

    let parameters = coding_style_parameters(reader, &coding_style_flags)?;

    Some(CodingStyleDefault {
        progression_order,
        num_layers,
        mct,
        component_parameters: CodingStyleComponent {
            flags: coding_style_flags,
            parameters,
        },
    })
}

/// COC marker (A.6.2).
pub(crate) fn coc_marker(
    reader: &mut Reader<'_>,
    csiz: u16,
) -> Option<(u16, CodingStyleComponent)> {
    // Length.
    let _ = reader.read_u16()?;

    let component_index = if csiz < 257 {
        reader.read_byte()? as u16
    } else {
        reader.read_u16()?
    };
    let coding_style = CodingStyleFlags::from_u8(reader.read_byte()?);

    // SPcoc shares the structure of SPcod from COD.
    let parameters = coding_style_parameters(reader, &coding_style)?;

    Some((
        component_index,
        CodingStyleComponent {
            flags: coding_style,
            parameters,
        },
    ))
}

/// QCD marker (A.6.4).
pub(crate) fn qcd_marker(reader: &mut Reader<'_>) -> Option<QuantizationInfo> {
    let length = reader.read_u16()?;

    let sqcd_val = reader.read_byte()?;
    let quantization_style = QuantizationStyle::from_u8(sqcd_val & 0x1F).ok()?;
    let guard_bits = (sqcd_val >> 5) & 0x07;

    let remaining_bytes = length.checked_sub(3)? as usize;

    let mut parameters = quantization_parameters(reader, quantization_style, remaining_bytes)?;
    parameters.guard_bits = guard_bits;

    Some(parameters)
}

/// QCC marker (A.6.5).
pub(crate) fn qcc_marker(reader: &mut Reader<'_>, csiz: u16) -> Option<(u16, QuantizationInfo)> {
    let length = reader.read_u16()?;

    let component_index = if csiz < 257 {
        reader.read_byte()? as u16
    } else {
        reader.read_u16()?
    };

    let sqcc_val = reader.read_byte()?;
    let quantization_style = QuantizationStyle::from_u8(sqcc_val & 0x1F).ok()?;
    let guard_bits = (sqcc_val >> 5) & 0x07;

    let component_index_size = if csiz < 257 { 1 } else { 2 };
    let remaining_bytes = length.checked_sub(2 + component_index_size + 1)? as usize;

    let mut parameters = quantization_parameters(reader, quantization_style, remaining_bytes)?;
    parameters.guard_bits = guard_bits;

    Some((component_index, parameters))
}

fn quantization_parameters(
    reader: &mut Reader<'_>,
    quantization_style: QuantizationStyle,
    remaining_bytes: usize,
) -> Option<QuantizationInfo> {
    let mut step_sizes = Vec::new();

    let irreversible = |val: u16| {
        let exponent = val >> 11;
        let mantissa = val & ((1 << 11) - 1);

        StepSize { exponent, mantissa }
    };

    match quantization_style {
        QuantizationStyle::NoQuantization => {
            // 8 bits per band (5 bits exponent, 3 bits reserved).
            for _ in 0..remaining_bytes {
                let value = reader.read_byte()? as u16;
                step_sizes.push(StepSize {
                    // Unused.
                    mantissa: 0,
                    exponent: value >> 3,
                });
            }
        }
        QuantizationStyle::ScalarDerived => {
            let value = reader.read_u16()?;
            step_sizes.push(irreversible(value));
        }
        QuantizationStyle::ScalarExpounded => {
            let num_bands = remaining_bytes / 2;
            for _ in 0..num_bands {
                let value = reader.read_u16()?;
                step_sizes.push(irreversible(value));
            }
        }
    }

    Some(QuantizationInfo {
        quantization_style,
        guard_bits: 0, // Set by the caller.
        step_sizes,
    })
}

/// POC marker (A.6.6).
fn poc_marker(reader: &mut Reader<'_>, csiz: u16) -> Option<Vec<ProgressionChange>> {
    let length = reader.read_u16()?.checked_sub(2)?;

    let comp_size = if csiz < 257 { 1 } else { 2 };
    let entry_size = 1 + comp_size + 2 + 1 + comp_size + 1;
    let num_entries = length as usize / entry_size;

    let mut changes = Vec::with_capacity(num_entries);
    for _ in 0..num_entries {
        let resolution_start = reader.read_byte()?;
        let component_start = if csiz < 257 {
            reader.read_byte()? as u16
        } else {
            reader.read_u16()?
        };
        let layer_end = reader.read_u16()?;
        let resolution_end = reader.read_byte()?;
        let component_end = if csiz < 257 {
            reader.read_byte()? as u16
        } else {
            reader.read_u16()?
        };
        let order = ProgressionOrder::from_u8(reader.read_byte()?).ok()?;

        changes.push(ProgressionChange {
            resolution_start,
            component_start,
            layer_end,
            resolution_end,
            component_end,
            order,
        });
    }

    Some(changes)
}

/// PPM marker (A.7.4): packed packet headers in the main header.
/// The Zppm index orders segments; segments arrive in order in a
/// conforming stream, so concatenation suffices.
fn ppm_marker<'a>(reader: &mut Reader<'a>) -> Option<&'a [u8]> {
    let length = reader.read_u16()?.checked_sub(3)?;
    let _zppm = reader.read_byte()?;

    reader.read_bytes(length as usize)
}

/// Marker writers, the duals of the parsers above.
pub(crate) mod write {
    use super::*;

    pub(crate) fn marker(w: &mut Writer, m: u8) {
        w.write_byte(0xFF);
        w.write_byte(m);
    }

    /// SOC + SIZ (A.5.1).
    pub(crate) fn siz(w: &mut Writer, size: &SizeData) {
        marker(w, markers::SIZ);
        w.write_u16(38 + 3 * size.component_sizes.len() as u16);
        // Decoder capabilities: profile 2 (no restrictions).
        w.write_u16(0);
        w.write_u32(size.reference_grid_width);
        w.write_u32(size.reference_grid_height);
        w.write_u32(size.image_area_x_offset);
        w.write_u32(size.image_area_y_offset);
        w.write_u32(size.tile_width);
        w.write_u32(size.tile_height);
        w.write_u32(size.tile_x_offset);
        w.write_u32(size.tile_y_offset);
        w.write_u16(size.component_sizes.len() as u16);

        for comp in &size.component_sizes {
            let ssiz = (comp.precision - 1) | if comp.is_signed { 0x80 } else { 0 };
            w.write_byte(ssiz);
            w.write_byte(comp.horizontal_resolution);
            w.write_byte(comp.vertical_resolution);
        }
    }

    /// COD (A.6.1).
    pub(crate) fn cod(w: &mut Writer, style: &CodingStyleDefault) {
        let parameters = &style.component_parameters.parameters;
        let flags = style.component_parameters.flags;

        let precinct_bytes = if flags.has_precincts() {
            parameters.num_resolution_levels
        } else {
            0
        };

        marker(w, markers::COD);
        w.write_u16(12 + precinct_bytes);
        w.write_byte(flags.to_u8());
        w.write_byte(style.progression_order.to_u8());
        w.write_u16(style.num_layers);
        w.write_byte(style.mct as u8);
        w.write_byte(parameters.num_decomposition_levels as u8);
        w.write_byte(parameters.code_block_width - 2);
        w.write_byte(parameters.code_block_height - 2);
        w.write_byte(parameters.code_block_style.to_u8());
        w.write_byte(parameters.transformation.to_u8());

        if flags.has_precincts() {
            for (ppx, ppy) in parameters
                .precinct_exponents
                .iter()
                .take(parameters.num_resolution_levels as usize)
            {
                w.write_byte(*ppx | (*ppy << 4));
            }
        }
    }

    /// QCD (A.6.4).
    pub(crate) fn qcd(w: &mut Writer, info: &QuantizationInfo) {
        let step_bytes: u16 = match info.quantization_style {
            QuantizationStyle::NoQuantization => info.step_sizes.len() as u16,
            QuantizationStyle::ScalarDerived => 2,
            QuantizationStyle::ScalarExpounded => 2 * info.step_sizes.len() as u16,
        };

        marker(w, markers::QCD);
        w.write_u16(3 + step_bytes);
        w.write_byte(info.quantization_style.to_u8() | (info.guard_bits << 5));

        match info.quantization_style {
            QuantizationStyle::NoQuantization => {
                for step in &info.step_sizes {
                    w.write_byte((step.exponent << 3) as u8);
                }
            }
            QuantizationStyle::ScalarDerived => {
                let step = info.step_sizes[0];
                w.write_u16((step.exponent << 11) | step.mantissa);
            }
            QuantizationStyle::ScalarExpounded => {
                for step in &info.step_sizes {
                    w.write_u16((step.exponent << 11) | step.mantissa);
                }
            }
        }
    }

    /// COM (A.9.2), latin-1 registration.
    pub(crate) fn com(w: &mut Writer, text: &str) {
        marker(w, markers::COM);
        w.write_u16(4 + text.len() as u16);
        w.write_u16(1);
        w.write_bytes(text.as_bytes());
    }
}

/// Extensions for reading marker words from a byte reader.
pub(crate) trait ReaderExt {
    fn read_marker(&mut self) -> Result<u8>;
    fn peek_marker(&self) -> Option<u8>;
}

impl ReaderExt for Reader<'_> {
    fn read_marker(&mut self) -> Result<u8> {
        let lead = self.peek_byte().ok_or(MarkerError::Missing("marker"))?;
        if lead != 0xFF {
            bail!(MarkerError::Invalid((lead as u16) << 8));
        }

        let _ = self.read_byte();
        self.read_byte()
            .ok_or_else(|| MarkerError::Missing("marker").into())
    }

    fn peek_marker(&self) -> Option<u8> {
        let bytes = self.peek_bytes(2)?;
        (bytes[0] == 0xFF).then_some(bytes[1])
    }
}

/// Marker codes (Table A.2).
#[allow(unused)]
pub(crate) mod markers {
    /// Start of codestream - 'SOC'.
    pub(crate) const SOC: u8 = 0x4F;
    /// Start of tile-part - 'SOT'.
    pub(crate) const SOT: u8 = 0x90;
    /// Start of data - 'SOD'.
    pub(crate) const SOD: u8 = 0x93;
    /// End of codestream - 'EOC'.
    pub(crate) const EOC: u8 = 0xD9;

    /// Image and tile size - 'SIZ'.
    pub(crate) const SIZ: u8 = 0x51;

    /// Coding style default - 'COD'.
    pub(crate) const COD: u8 = 0x52;
    /// Coding component - 'COC'.
    pub(crate) const COC: u8 = 0x53;
    /// Region-of-interest - 'RGN'.
    pub(crate) const RGN: u8 = 0x5E;
    /// Quantization default - 'QCD'.
    pub(crate) const QCD: u8 = 0x5C;
    /// Quantization component - 'QCC'.
    pub(crate) const QCC: u8 = 0x5D;
    /// Progression order change - 'POC'.
    pub(crate) const POC: u8 = 0x5F;

    /// Tile-part lengths - 'TLM'.
    pub(crate) const TLM: u8 = 0x55;
    /// Packet length, main header - 'PLM'.
    pub(crate) const PLM: u8 = 0x57;
    /// Packet length, tile-part header - 'PLT'.
    pub(crate) const PLT: u8 = 0x58;
    /// Packed packet headers, main header - 'PPM'.
    pub(crate) const PPM: u8 = 0x60;
    /// Packed packet headers, tile-part header - 'PPT'.
    pub(crate) const PPT: u8 = 0x61;

    /// Start of packet - 'SOP'.
    pub(crate) const SOP: u8 = 0x91;
    /// End of packet header - 'EPH'.
    pub(crate) const EPH: u8 = 0x92;

    /// Component registration - 'CRG'.
    pub(crate) const CRG: u8 = 0x63;
    /// Comment - 'COM'.
    pub(crate) const COM: u8 = 0x64;

    /// The full 16-bit marker word.
    pub(crate) const fn word(marker: u8) -> u16 {
        0xFF00 | marker as u16
    }

    pub(crate) fn to_string(marker: u8) -> &'static str {
        match marker {
            // Delimiting markers.
            SOC => "SOC",
            SOT => "SOT",
            SOD => "SOD",
            EOC => "EOC",

            // Fixed information.
            SIZ => "SIZ",

            // Functional markers.
            COD => "COD",
            COC => "COC",
            RGN => "RGN",
            QCD => "QCD",
            QCC => "QCC",
            POC => "POC",

            // Pointer markers.
            TLM => "TLM",
            PLM => "PLM",
            PLT => "PLT",
            PPM => "PPM",
            PPT => "PPT",

            // In-bit-stream markers.
            SOP => "SOP",
            EPH => "EPH",

            // Informational markers.
            CRG => "CRG",
            COM => "COM",

            _ => "UNKNOWN",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn size_marker_round_trip() {
        let size = SizeData {
            reference_grid_width: 640,
            reference_grid_height: 480,
            image_area_x_offset: 0,
            image_area_y_offset: 0,
            tile_width: 128,
            tile_height: 128,
            tile_x_offset: 0,
            tile_y_offset: 0,
            component_sizes: vec![ComponentSizeInfo {
                precision: 8,
                is_signed: false,
                horizontal_resolution: 1,
                vertical_resolution: 1,
            }],
        };

        let mut w = Writer::new();
        write::siz(&mut w, &size);
        let bytes = w.finish();

        let mut reader = Reader::new(&bytes);
        assert_eq!(reader.read_marker().unwrap(), markers::SIZ);
        let parsed = size_marker(&mut reader).unwrap();

        assert_eq!(parsed.reference_grid_width, 640);
        assert_eq!(parsed.image_width(), 640);
        assert_eq!(parsed.image_height(), 480);
        assert_eq!(parsed.tile_width, 128);
        assert_eq!(parsed.num_tiles(), 20);
        assert_eq!(parsed.component_sizes.len(), 1);
        assert_eq!(parsed.component_sizes[0].precision, 8);
    }

    #[test]
    fn cod_marker_round_trip() {
        let style = CodingStyleDefault {
            progression_order: ProgressionOrder::ResolutionPositionComponentLayer,
            num_layers: 1,
            mct: true,
            component_parameters: CodingStyleComponent {
                flags: CodingStyleFlags::from_u8(0),
                parameters: CodingStyleParameters {
                    num_decomposition_levels: 4,
                    num_resolution_levels: 5,
                    code_block_width: 6,
                    code_block_height: 6,
                    code_block_style: CodeBlockStyle::default(),
                    transformation: WaveletTransform::Reversible53,
                    precinct_exponents: vec![(15, 15); 5],
                },
            },
        };

        let mut w = Writer::new();
        write::cod(&mut w, &style);
        let bytes = w.finish();

        let mut reader = Reader::new(&bytes);
        assert_eq!(reader.read_marker().unwrap(), markers::COD);
        let parsed = cod_marker(&mut reader).unwrap();

        assert_eq!(parsed.num_layers, 1);
        assert!(parsed.mct);
        assert_eq!(
            parsed.progression_order,
            ProgressionOrder::ResolutionPositionComponentLayer
        );
        assert_eq!(parsed.component_parameters.parameters.code_block_width, 6);
        assert_eq!(
            parsed
                .component_parameters
                .parameters
                .num_decomposition_levels,
            4
        );
        assert_eq!(
            parsed.component_parameters.parameters.precinct_exponents,
            vec![(15, 15); 5]
        );
    }

    #[test]
    fn qcd_marker_round_trip() {
        let info = QuantizationInfo {
            quantization_style: QuantizationStyle::NoQuantization,
            guard_bits: 2,
            step_sizes: (0..13)
                .map(|i| StepSize {
                    mantissa: 0,
                    exponent: 8 + (i % 3),
                })
                .collect(),
        };

        let mut w = Writer::new();
        write::qcd(&mut w, &info);
        let bytes = w.finish();

        let mut reader = Reader::new(&bytes);
        assert_eq!(reader.read_marker().unwrap(), markers::QCD);
        let parsed = qcd_marker(&mut reader).unwrap();

        assert_eq!(parsed.guard_bits, 2);
        assert_eq!(parsed.step_sizes.len(), 13);
        assert_eq!(parsed.step_sizes[1].exponent, 9);
    }
}
