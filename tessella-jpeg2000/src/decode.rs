//! Decoding codestreams into images.
//!
//! This is the driver that orchestrates all stages: marker parsing,
//! per-tile geometry, packet header decoding, selective code-block
//! decoding, dequantization, the inverse wavelet transform and
//! composition of the output image through the tile cache. A requested
//! region turns the pipeline into its windowed variant: per-tile areas
//! of interest derive per-resolution subband windows, a sparse buffer
//! replaces the whole-tile plane, and only code blocks whose area
//! intersects the window are entropy-decoded.

use crate::bitplane::{BlockContext, CodedSegment, decode_block};
use crate::byte_io::Reader;
use crate::cache::{TileCache, TileCacheEntry, TileCacheStrategy};
use crate::codestream::{self, Header, ReaderExt, markers};
use crate::error::{MarkerError, Result, ValidationError, bail};
use crate::image::{ColorSpace, Image, ImageComponent};
use crate::log::lwarn;
use crate::progression::{self, IteratorInput};
use crate::quant;
use crate::rect::{BandOrientation, Rect};
use crate::sparse::SparseBuffer;
use crate::tile::{self, Tile};
use crate::tile_component::TileComponent;
use crate::window::{TileWindowBuffer, filter_margin};
use crate::{dwt, mct, packet};

#[cfg(feature = "std")]
use std::sync::Arc;
#[cfg(feature = "std")]
use std::sync::atomic::{AtomicBool, Ordering};

/// Decode configuration.
#[derive(Debug, Clone, Default)]
pub struct DecodeSettings {
    /// Decode only this canvas region; `None` decodes everything.
    pub region: Option<Rect>,
    /// Number of highest resolutions to discard.
    pub resolution_reduction: u8,
    /// Turn a failing tile into a warning and a missing region
    /// instead of failing the whole decode.
    pub continue_on_tile_error: bool,
    /// Retention policy for decoded tiles.
    pub cache_strategy: TileCacheStrategy,
    /// Checked between tiles; when set, decoding stops after the
    /// current tile and the partial composite is returned.
    #[cfg(feature = "std")]
    pub cancel: Option<Arc<AtomicBool>>,
}

/// Transient per-tile compute state: the materialised geometry after
/// packet decoding. Retained in the tile cache alongside the decoded
/// image.
#[derive(Debug)]
pub(crate) struct TileProcessor {
    pub(crate) components: Vec<TileComponent>,
}

/// Decode a codestream pulled from a host byte source. The source is
/// drained synchronously before parsing starts; no operation blocks
/// on I/O afterwards.
pub fn decode_source(
    source: &mut impl crate::stream::Source,
    settings: &DecodeSettings,
) -> Result<Image> {
    let data = source.read_to_end()?;
    decode(&data, settings)
}

/// Decode a codestream.
pub fn decode(data: &[u8], settings: &DecodeSettings) -> Result<Image> {
    let mut reader = Reader::new(data);

    if reader.read_marker()? != markers::SOC {
        bail!(MarkerError::Missing("SOC"));
    }

    let header = codestream::read_header(&mut reader)?;

    if header.packed_headers.is_some() {
        bail!(ValidationError::Unsupported("PPM packed packet headers"));
    }

    let tiles = tile::parse(&mut reader, &header)?;
    if tiles.is_empty() {
        bail!(ValidationError::InvalidDimensions);
    }

    let reduce = settings.resolution_reduction;
    let canvas = header.size_data.image_area();
    let output_area = match settings.region {
        Some(region) => {
            let clipped = region.intersect(canvas);
            if clipped.is_empty() {
                bail!(ValidationError::InvalidParameter("region outside canvas"));
            }
            clipped
        }
        None => canvas,
    };

    let mut cache = TileCache::new(settings.cache_strategy);
    cache.set_composite(composite_image(&header, output_area, reduce));

    for tile in &tiles {
        #[cfg(feature = "std")]
        if let Some(cancel) = &settings.cancel {
            if cancel.load(Ordering::Relaxed) {
                lwarn!("decode cancelled after tile {}", tile.idx);
                break;
            }
        }

        if tile.rect.intersect(output_area).is_empty() {
            continue;
        }

        match decode_tile(tile, settings) {
            Ok((processor, image)) => {
                cache.put(
                    tile.idx as u16,
                    TileCacheEntry {
                        processor: Some(processor),
                        image: Some(image),
                    },
                );
            }
            Err(e) if settings.continue_on_tile_error => {
                lwarn!("tile {} failed to decode: {}; continuing", tile.idx, e);
            }
            Err(e) => return Err(e),
        }
    }

    cache
        .take_composite()
        .ok_or_else(|| ValidationError::InvalidDimensions.into())
}

/// The composite output image covering `area` after reduction.
fn composite_image(header: &Header, area: Rect, reduce: u8) -> Image {
    let components = header
        .size_data
        .component_sizes
        .iter()
        .map(|size| {
            let rect = Image::component_rect(
                area,
                size.horizontal_resolution,
                size.vertical_resolution,
            )
            .ceil_div_pow2(reduce as u32);

            ImageComponent {
                precision: size.precision,
                is_signed: size.is_signed,
                dx: size.horizontal_resolution,
                dy: size.vertical_resolution,
                rect,
                data: vec![0; rect.area() as usize],
            }
        })
        .collect();

    let color_space = if header.size_data.component_sizes.len() < 3 {
        ColorSpace::Gray
    } else {
        ColorSpace::Srgb
    };

    Image {
        canvas: area.ceil_div_pow2(reduce as u32),
        color_space,
        components,
    }
}

fn decode_tile(tile: &Tile<'_>, settings: &DecodeSettings) -> Result<(TileProcessor, Image)> {
    let reduce = settings.resolution_reduction;

    // 1. Geometry: materialise the full pyramid of every component.
    let mut components = Vec::with_capacity(tile.component_infos.len());
    for info in &tile.component_infos {
        components.push(TileComponent::build(tile.rect, info, reduce)?);
    }

    // 2. Window buffers and, for a windowed decode, the sparse buffer
    // and block marks.
    let mut buffers = Vec::with_capacity(components.len());
    let mut sparse_buffers: Vec<Option<SparseBuffer<f32, 6, 6>>> = Vec::new();

    for (tc, info) in components.iter_mut().zip(&tile.component_infos) {
        let (res_rects, band_rects) = tc.reduced_geometry();
        let reversible = info.wavelet_transform().is_reversible();

        match settings.region {
            None => {
                buffers.push(TileWindowBuffer::whole_tile(res_rects, band_rects));
                sparse_buffers.push(None);

                // Whole-tile mode still skips resolutions beyond the
                // reduction.
                mark_blocks_beyond(tc);
            }
            Some(region) => {
                let window =
                    TileComponent::component_rect(region.intersect(tile.rect), info);
                let margin = filter_margin(reversible);
                let buffer = TileWindowBuffer::windowed(
                    res_rects,
                    band_rects,
                    window,
                    tc.num_resolutions,
                    margin,
                );

                let top = tc.reduced_rect();
                let mut sparse =
                    SparseBuffer::new(top.width().max(1), top.height().max(1))?;

                schedule_blocks(tc, &buffer, &mut sparse)?;

                buffers.push(buffer);
                sparse_buffers.push(Some(sparse));
            }
        }
    }

    // 3. Packet headers and bodies, in progression order.
    let input = IteratorInput::new(
        tile.num_layers,
        tile.rect,
        &components,
        &tile.component_infos,
    );
    let sequence = progression::build_sequence(
        &input,
        tile.progression_order,
        &tile.progression_changes,
    );

    packet::decode_tile_packets(
        &tile.tile_parts,
        tile.packed_headers.as_deref(),
        &sequence,
        &mut components,
        &tile.component_infos,
    )?;

    // 4. Entropy decode marked blocks, dequantize, run the inverse
    // wavelet transform.
    let mut planes = Vec::with_capacity(components.len());

    for ((tc, info), (buffer, sparse)) in components
        .iter_mut()
        .zip(&tile.component_infos)
        .zip(buffers.iter_mut().zip(sparse_buffers.iter_mut()))
    {
        decode_component_blocks(tc, info, buffer, sparse.as_mut())?;

        let reversible = info.wavelet_transform().is_reversible();

        match sparse {
            None => dwt::inverse_whole_tile(buffer, reversible),
            Some(sparse) => {
                dwt::inverse_windowed(buffer, sparse, reversible)?;

                // The final window is read back from the sparse plane.
                let rect = buffer.top().rect();
                if !rect.is_empty() {
                    let mut samples = vec![0.0; rect.area() as usize];
                    sparse.read(rect, &mut samples, 1, rect.width(), false)?;
                    buffer.top_mut().data_mut().copy_from_slice(&samples);
                }
            }
        }

        planes.push(buffer.top().data().to_vec());
    }

    // 5. Inverse multi-component transform.
    if tile.mct {
        apply_inverse_mct(tile, &buffers, &mut planes);
    }

    // 6. DC level shift and storage into the tile image.
    let image = store_tile_image(tile, &components, &buffers, planes);

    Ok((TileProcessor { components }, image))
}

/// Unmark every block of the resolutions that the reduction drops.
fn mark_blocks_beyond(tc: &mut TileComponent) {
    let keep = tc.resolutions_to_decode as usize;
    for res in tc.resolutions.iter_mut().skip(keep) {
        for band in &mut res.bands {
            for precinct in &mut band.precincts {
                for block in &mut precinct.code_blocks {
                    block.needs_decode = false;
                }
            }
        }
    }
}

/// The windowed-decode scheduler: mark the code blocks whose area
/// intersects the subband area of interest, and pre-allocate their
/// sparse-buffer tiles.
fn schedule_blocks(
    tc: &mut TileComponent,
    buffer: &TileWindowBuffer,
    sparse: &mut SparseBuffer<f32, 6, 6>,
) -> Result<()> {
    let keep = tc.resolutions_to_decode;

    for resno in 0..tc.num_resolutions {
        let beyond_reduction = resno >= keep;

        let band_count = tc.resolutions[resno as usize].bands.len();
        for band_index in 0..band_count {
            // The window buffer only describes the decoded pyramid.
            let aoi = if beyond_reduction {
                None
            } else {
                buffer.padded_band_window(resno, band_index)
            };
            let orientation = BandOrientation::from_band_index(resno as u16, band_index);

            let res = &mut tc.resolutions[resno as usize];
            let band = &mut res.bands[band_index];

            for precinct in &mut band.precincts {
                for block in &mut precinct.code_blocks {
                    let wanted = !beyond_reduction
                        && aoi.is_some_and(|aoi| !block.rect.intersect(aoi).is_empty())
                        && !block.rect.is_empty();
                    block.needs_decode = wanted;

                    if wanted {
                        let (x, y) = buffer.transform(
                            resno,
                            orientation,
                            block.rect.x0,
                            block.rect.y0,
                        );
                        sparse.alloc(Rect::from_xywh(
                            x,
                            y,
                            block.rect.width(),
                            block.rect.height(),
                        ))?;
                    }
                }
            }
        }
    }

    Ok(())
}

/// Entropy-decode and dequantize the marked code blocks of one
/// component, writing the coefficients into the whole-tile plane or
/// the sparse buffer.
fn decode_component_blocks(
    tc: &mut TileComponent,
    info: &codestream::ComponentInfo,
    buffer: &mut TileWindowBuffer,
    mut sparse: Option<&mut SparseBuffer<f32, 6, 6>>,
) -> Result<()> {
    let style = info.code_block_style();
    let mut scratch = Vec::new();

    for resno in 0..tc.resolutions_to_decode {
        let band_count = tc.resolutions[resno as usize].bands.len();

        for band_index in 0..band_count {
            let orientation = BandOrientation::from_band_index(resno as u16, band_index);

            let (num_bitplanes, step_size) = {
                let band = &tc.resolutions[resno as usize].bands[band_index];
                (band.num_bitplanes, band.step_size)
            };

            let precinct_count =
                tc.resolutions[resno as usize].bands[band_index].precincts.len();

            for precinct_index in 0..precinct_count {
                let block_count = tc.resolutions[resno as usize].bands[band_index].precincts
                    [precinct_index]
                    .code_blocks
                    .len();

                for block_index in 0..block_count {
                    let block = &tc.resolutions[resno as usize].bands[band_index].precincts
                        [precinct_index]
                        .code_blocks[block_index];

                    if !block.needs_decode || block.num_passes == 0 || block.rect.is_empty() {
                        continue;
                    }

                    let ctx = BlockContext {
                        zero_bitplanes: block.missing_bit_planes,
                        num_bitplanes,
                        vertically_causal: style.vertically_causal_context,
                        segmentation_symbols: style.segmentation_symbols,
                        reset_probabilities: style.reset_context_probabilities,
                        termination_on_each_pass: style.termination_on_each_pass,
                        selective_bypass: style.selective_arithmetic_coding_bypass,
                    };

                    let segments: Vec<CodedSegment<'_>> = block
                        .chunks
                        .iter()
                        .map(|c| CodedSegment {
                            passes: c.passes,
                            data: &c.data,
                        })
                        .collect();

                    let rect = block.rect;
                    let decoded = decode_block(
                        &segments,
                        rect.width(),
                        rect.height(),
                        orientation,
                        &ctx,
                        &mut scratch,
                    )?;

                    // Dequantize into the destination frame.
                    let (dx, dy) = buffer.transform(resno, orientation, rect.x0, rect.y0);
                    let width = rect.width() as usize;

                    let mut row = vec![0.0f32; width];
                    for y in 0..rect.height() {
                        for (x, v) in row.iter_mut().enumerate() {
                            let idx = y as usize * width + x;
                            *v = quant::dequantize(
                                decoded.magnitudes[idx],
                                decoded.signs[idx],
                                step_size,
                            );
                        }

                        match sparse.as_mut() {
                            Some(sparse) => {
                                sparse.write(
                                    Rect::from_xywh(dx, dy + y, rect.width(), 1),
                                    &row,
                                    1,
                                    rect.width(),
                                    false,
                                )?;
                            }
                            None => {
                                let plane = buffer.top_mut();
                                plane
                                    .row_mut(dy + y, dx, dx + rect.width())
                                    .copy_from_slice(&row);
                            }
                        }
                    }
                }
            }
        }
    }

    Ok(())
}

fn apply_inverse_mct(tile: &Tile<'_>, buffers: &[TileWindowBuffer], planes: &mut [Vec<f32>]) {
    if planes.len() < 3 {
        lwarn!("tried to apply MCT to image with {} components", planes.len());
        return;
    }

    let transform = tile.component_infos[0].wavelet_transform();
    if transform != tile.component_infos[1].wavelet_transform()
        || tile.component_infos[1].wavelet_transform()
            != tile.component_infos[2].wavelet_transform()
    {
        lwarn!("tried to apply MCT with differing wavelet transforms per component");
        return;
    }

    if buffers[0].top().rect() != buffers[1].top().rect()
        || buffers[1].top().rect() != buffers[2].top().rect()
    {
        lwarn!("tried to apply MCT with differing component geometries");
        return;
    }

    let [s0, s1, s2, ..] = planes else {
        return;
    };
    mct::apply_inverse(transform, s0, s1, s2);
}

/// DC level shift, clamping, and assembly of the tile image in
/// absolute reduced component coordinates.
fn store_tile_image(
    tile: &Tile<'_>,
    components: &[TileComponent],
    buffers: &[TileWindowBuffer],
    planes: Vec<Vec<f32>>,
) -> Image {
    let mut out_components = Vec::with_capacity(components.len());

    for ((tc, info), (buffer, mut plane)) in components
        .iter()
        .zip(&tile.component_infos)
        .zip(buffers.iter().zip(planes))
    {
        let precision = info.size_info.precision;
        let is_signed = info.size_info.is_signed;

        let (lo, hi) = if is_signed {
            (-(1i64 << (precision - 1)), (1i64 << (precision - 1)) - 1)
        } else {
            (0, (1i64 << precision) - 1)
        };
        let shift = if is_signed {
            0.0
        } else {
            (1i64 << (precision - 1)) as f32
        };

        for sample in &mut plane {
            *sample += shift;
        }

        // The backing plane is in coordinates relative to the reduced
        // tile-component origin.
        let reduced = tc.reduced_rect();
        let plane_rect = buffer.top().rect();
        let rect = Rect::from_ltrb(
            reduced.x0 + plane_rect.x0,
            reduced.y0 + plane_rect.y0,
            reduced.x0 + plane_rect.x1,
            reduced.y0 + plane_rect.y1,
        );

        let data = plane
            .iter()
            .map(|v| (v.round() as i64).clamp(lo, hi) as i32)
            .collect();

        out_components.push(ImageComponent {
            precision,
            is_signed,
            dx: info.size_info.horizontal_resolution,
            dy: info.size_info.vertical_resolution,
            rect,
            data,
        });
    }

    Image {
        canvas: tile.rect,
        color_space: if out_components.len() < 3 {
            ColorSpace::Gray
        } else {
            ColorSpace::Srgb
        },
        components: out_components,
    }
}
