//! Encoding images into codestreams: the decompression pipeline run in
//! reverse, with a single quality layer carrying every coding pass.

use crate::bitplane::{BlockContext, encode_block};
use crate::byte_io::Writer;
use crate::codestream::{
    CodeBlockStyle, CodingStyleComponent, CodingStyleDefault, CodingStyleFlags,
    CodingStyleParameters, ComponentInfo, ComponentSizeInfo, Header, ProgressionOrder,
    QuantizationInfo, QuantizationStyle, SizeData, StepSize, WaveletTransform, markers, write,
};
use crate::error::{Result, ValidationError, bail};
use crate::image::Image;
use crate::progression::{self, IteratorInput};
use crate::quant;
use crate::rect::BandOrientation;
use crate::tile::{Tile, write_sot};
use crate::tile_component::TileComponent;
use crate::window::TileWindowBuffer;
use crate::{dwt, mct, packet};

/// Encode configuration.
#[derive(Debug, Clone)]
pub struct EncodeSettings {
    /// Reversible 5-3 coding; `false` selects the irreversible 9-7
    /// path.
    pub lossless: bool,
    /// Number of resolution levels (decomposition levels plus one).
    pub num_resolutions: u8,
    /// Packet progression order.
    pub progression_order: ProgressionOrder,
    /// Tile width and height on the reference grid; `None` encodes a
    /// single tile covering the image.
    pub tile_size: Option<(u32, u32)>,
    /// Nominal code-block width/height exponents, each in `2..=10`
    /// with a sum of at most 12.
    pub code_block_exponents: (u8, u8),
    /// Per-resolution precinct exponents; `None` uses maximal
    /// precincts.
    pub precinct_exponents: Option<Vec<(u8, u8)>>,
    /// Apply the multi-component transform to the first three
    /// components.
    pub mct: bool,
    /// Number of guard bits signalled in the quantization marker.
    pub guard_bits: u8,
    /// An optional COM marker payload.
    pub comment: Option<String>,
}

impl Default for EncodeSettings {
    fn default() -> Self {
        Self {
            lossless: true,
            num_resolutions: 6,
            progression_order: ProgressionOrder::LayerResolutionComponentPosition,
            tile_size: None,
            code_block_exponents: (6, 6),
            precinct_exponents: None,
            mct: true,
            guard_bits: 2,
            comment: Some(concat!("tessella-jpeg2000 ", env!("CARGO_PKG_VERSION")).to_string()),
        }
    }
}

/// Encode an image into a raw codestream. Identical inputs yield
/// byte-identical output.
pub fn encode(image: &Image, settings: &EncodeSettings) -> Result<Vec<u8>> {
    let header = build_header(image, settings)?;

    let mut out = Writer::new();
    write::marker(&mut out, markers::SOC);
    write::siz(&mut out, &header.size_data);
    write::cod(&mut out, &header.global_coding_style);
    write::qcd(&mut out, &header.component_infos[0].quantization);
    if let Some(comment) = &settings.comment {
        write::com(&mut out, comment);
    }

    for tile_idx in 0..header.size_data.num_tiles() {
        encode_tile(&mut out, image, &header, tile_idx)?;
    }

    write::marker(&mut out, markers::EOC);

    Ok(out.finish())
}

fn build_header(image: &Image, settings: &EncodeSettings) -> Result<Header> {
    if image.components.is_empty() {
        bail!(ValidationError::InvalidParameter("no components"));
    }
    if image.canvas.is_empty() {
        bail!(ValidationError::InvalidDimensions);
    }
    if settings.num_resolutions == 0 || settings.num_resolutions > 33 {
        bail!(ValidationError::InvalidParameter("resolution count"));
    }
    if settings.guard_bits > 7 {
        bail!(ValidationError::InvalidParameter("guard bits"));
    }

    for component in &image.components {
        if component.precision == 0 || component.precision > 16 {
            bail!(ValidationError::InvalidParameter("component precision"));
        }
        let expected = Image::component_rect(image.canvas, component.dx, component.dy);
        if component.rect != expected || component.data.len() != expected.area() as usize {
            bail!(ValidationError::InvalidParameter("component geometry"));
        }
    }

    let (tile_width, tile_height) = match settings.tile_size {
        Some((w, h)) => {
            if w == 0 || h == 0 {
                bail!(ValidationError::InvalidDimensions);
            }
            (w, h)
        }
        None => (image.canvas.x1, image.canvas.y1),
    };

    let size_data = SizeData {
        reference_grid_width: image.canvas.x1,
        reference_grid_height: image.canvas.y1,
        image_area_x_offset: image.canvas.x0,
        image_area_y_offset: image.canvas.y0,
        tile_width,
        tile_height,
        tile_x_offset: 0,
        tile_y_offset: 0,
        component_sizes: image
            .components
            .iter()
            .map(|c| ComponentSizeInfo {
                precision: c.precision,
                is_signed: c.is_signed,
                horizontal_resolution: c.dx,
                vertical_resolution: c.dy,
            })
            .collect(),
    };

    let transformation = if settings.lossless {
        WaveletTransform::Reversible53
    } else {
        WaveletTransform::Irreversible97
    };

    let num_resolutions = settings.num_resolutions as u16;
    let precinct_exponents = match &settings.precinct_exponents {
        Some(exponents) => {
            if exponents.len() < num_resolutions as usize {
                bail!(ValidationError::InvalidParameter("precinct exponents"));
            }
            exponents.clone()
        }
        None => vec![(15, 15); num_resolutions as usize],
    };

    let parameters = CodingStyleParameters {
        num_decomposition_levels: num_resolutions - 1,
        num_resolution_levels: num_resolutions,
        code_block_width: settings.code_block_exponents.0,
        code_block_height: settings.code_block_exponents.1,
        code_block_style: CodeBlockStyle::default(),
        transformation,
        precinct_exponents,
    };
    parameters.validate()?;

    let flags = CodingStyleFlags::from_u8(if settings.precinct_exponents.is_some() {
        0x01
    } else {
        0x00
    });

    let mct = settings.mct
        && image.components.len() >= 3
        && image.components[..3]
            .iter()
            .all(|c| c.dx == image.components[0].dx && c.dy == image.components[0].dy);

    let global_coding_style = CodingStyleDefault {
        progression_order: settings.progression_order,
        num_layers: 1,
        mct,
        component_parameters: CodingStyleComponent {
            flags,
            parameters: parameters.clone(),
        },
    };

    // All components share the quantization table: reversible coding
    // signals exponents only, irreversible coding signals unit steps
    // relative to the nominal band range.
    let component_infos = image
        .components
        .iter()
        .map(|component| {
            let precision = component.precision as u16;
            let mut step_sizes = vec![StepSize {
                mantissa: 0,
                exponent: precision,
            }];
            for _ in 1..num_resolutions {
                for gain in [1u16, 1, 2] {
                    step_sizes.push(StepSize {
                        mantissa: 0,
                        exponent: precision + gain,
                    });
                }
            }

            ComponentInfo {
                size_info: ComponentSizeInfo {
                    precision: component.precision,
                    is_signed: component.is_signed,
                    horizontal_resolution: component.dx,
                    vertical_resolution: component.dy,
                },
                coding_style: CodingStyleComponent {
                    flags,
                    parameters: parameters.clone(),
                },
                quantization: QuantizationInfo {
                    quantization_style: if settings.lossless {
                        QuantizationStyle::NoQuantization
                    } else {
                        QuantizationStyle::ScalarExpounded
                    },
                    guard_bits: settings.guard_bits,
                    step_sizes,
                },
            }
        })
        .collect();

    Ok(Header {
        size_data,
        global_coding_style,
        component_infos,
        progression_changes: Vec::new(),
        packed_headers: None,
    })
}

fn encode_tile(out: &mut Writer, image: &Image, header: &Header, tile_idx: u32) -> Result<()> {
    let tile = Tile::new(tile_idx, header);

    // 1. Geometry and whole-tile planes.
    let mut components = Vec::with_capacity(header.component_infos.len());
    for info in &header.component_infos {
        components.push(TileComponent::build(tile.rect, info, 0)?);
    }

    let mut planes: Vec<Vec<f32>> = Vec::with_capacity(components.len());
    let mut buffers = Vec::with_capacity(components.len());

    for (tc, (info, component)) in components
        .iter()
        .zip(header.component_infos.iter().zip(&image.components))
    {
        let (res_rects, band_rects) = tc.reduced_geometry();
        let buffer = TileWindowBuffer::whole_tile(res_rects, band_rects);

        // DC level shift into the plane.
        let shift = if info.size_info.is_signed {
            0.0
        } else {
            (1i64 << (info.size_info.precision - 1)) as f32
        };

        let tc_rect = tc.rect;
        let img_rect = component.rect;
        let mut plane = vec![0.0f32; tc_rect.area() as usize];

        for y in tc_rect.y0..tc_rect.y1 {
            for x in tc_rect.x0..tc_rect.x1 {
                let src = (y - img_rect.y0) as usize * img_rect.width() as usize
                    + (x - img_rect.x0) as usize;
                let dst =
                    (y - tc_rect.y0) as usize * tc_rect.width() as usize + (x - tc_rect.x0) as usize;
                plane[dst] = component.data[src] as f32 - shift;
            }
        }

        planes.push(plane);
        buffers.push(buffer);
    }

    // 2. Forward multi-component transform.
    if tile.mct && planes.len() >= 3 && planes[0].len() == planes[1].len()
        && planes[1].len() == planes[2].len()
    {
        let transform = header.component_infos[0].wavelet_transform();
        let [s0, s1, s2, ..] = &mut planes[..] else {
            unreachable!()
        };
        mct::apply_forward(transform, s0, s1, s2);
    }

    // 3. Forward wavelet transform.
    for ((buffer, plane), info) in buffers
        .iter_mut()
        .zip(&planes)
        .zip(&header.component_infos)
    {
        buffer.top_mut().data_mut().copy_from_slice(plane);
        dwt::forward_whole_tile(buffer, info.wavelet_transform().is_reversible());
    }

    // 4. Quantize and entropy-code every code block.
    for (tc, buffer) in components.iter_mut().zip(&buffers) {
        encode_component_blocks(tc, buffer)?;
    }

    // 5. Tile-part header and packets in progression order.
    let psot_offset = write_sot(out, tile_idx as u16);
    write::marker(out, markers::SOD);

    let input = IteratorInput::new(
        tile.num_layers,
        tile.rect,
        &components,
        &header.component_infos,
    );
    let sequence = progression::build_sequence(&input, tile.progression_order, &[]);

    for progression in sequence {
        packet::encode_packet(
            out,
            &mut components[progression.component as usize],
            progression,
            tile.num_layers,
        )?;
    }

    let tile_start = psot_offset - 6;
    out.patch_u32(psot_offset, (out.len() - tile_start) as u32);

    Ok(())
}

fn encode_component_blocks(tc: &mut TileComponent, buffer: &TileWindowBuffer) -> Result<()> {
    let plane = buffer.top();

    for resno in 0..tc.num_resolutions {
        let band_count = tc.resolutions[resno as usize].bands.len();

        for band_index in 0..band_count {
            let orientation = BandOrientation::from_band_index(resno as u16, band_index);

            let (num_bitplanes, step_size) = {
                let band = &tc.resolutions[resno as usize].bands[band_index];
                (band.num_bitplanes, band.step_size)
            };

            let ctx = BlockContext {
                zero_bitplanes: 0,
                num_bitplanes,
                ..Default::default()
            };

            let band = &mut tc.resolutions[resno as usize].bands[band_index];
            for precinct in &mut band.precincts {
                for block in &mut precinct.code_blocks {
                    if block.rect.is_empty() {
                        continue;
                    }

                    let (dx, dy) =
                        buffer.transform(resno, orientation, block.rect.x0, block.rect.y0);

                    let count = block.rect.area() as usize;
                    let mut magnitudes = Vec::with_capacity(count);
                    let mut signs = Vec::with_capacity(count);

                    for y in 0..block.rect.height() {
                        let row = plane.row(dy + y, dx, dx + block.rect.width());
                        for value in row {
                            let (magnitude, sign) = quant::quantize(*value, step_size);
                            magnitudes.push(magnitude);
                            signs.push(sign);
                        }
                    }

                    let encoded = encode_block(
                        &magnitudes,
                        &signs,
                        block.rect.width(),
                        block.rect.height(),
                        orientation,
                        &ctx,
                    )?;

                    block.encoded = Some(encoded);
                }
            }
        }
    }

    Ok(())
}
