//! The tile-component geometry model: the recursive subdivision of a
//! tile component into resolutions, subbands, precincts and code
//! blocks (B.5 to B.7), materialised with all rectangles in absolute
//! coordinates.

use crate::codestream::ComponentInfo;
use crate::error::{GeometryError, Result, bail};
use crate::math::{ceil_div_pow2, floor_div_pow2};
use crate::quant;
use crate::rect::{BandOrientation, Rect, band_rect};
use crate::tag_tree::TagTree;

/// One coded contribution to a code block: a codeword segment carrying
/// a number of coding passes.
#[derive(Debug, Clone)]
pub(crate) struct CodedChunk {
    pub(crate) passes: u32,
    pub(crate) data: Vec<u8>,
}

/// The atomic entropy-coding unit.
#[derive(Debug)]
pub(crate) struct CodeBlock {
    /// The block area, clipped to its precinct, in band-absolute
    /// coordinates.
    pub(crate) rect: Rect,
    /// Position within the precinct's code-block grid.
    pub(crate) x_idx: u32,
    pub(crate) y_idx: u32,

    // Decoder state, accumulated across packets.
    pub(crate) has_been_included: bool,
    pub(crate) missing_bit_planes: u8,
    pub(crate) num_passes: u32,
    pub(crate) l_block: u32,
    pub(crate) chunks: Vec<CodedChunk>,
    /// Set by the windowed-decode scheduler; unmarked blocks skip
    /// entropy decoding.
    pub(crate) needs_decode: bool,

    // Encoder state.
    pub(crate) encoded: Option<crate::bitplane::EncodedBlock>,
}

impl CodeBlock {
    fn new(rect: Rect, x_idx: u32, y_idx: u32) -> Self {
        Self {
            rect,
            x_idx,
            y_idx,
            has_been_included: false,
            missing_bit_planes: 0,
            num_passes: 0,
            l_block: 3,
            chunks: Vec::new(),
            needs_decode: true,
            encoded: None,
        }
    }
}

/// The intersection of a precinct grid cell with its subband,
/// carrying the code-block grid and the two packet-header tag trees.
#[derive(Debug)]
pub(crate) struct Precinct {
    pub(crate) rect: Rect,
    /// Code-block grid dimensions.
    pub(crate) grid_width: u32,
    pub(crate) grid_height: u32,
    pub(crate) code_blocks: Vec<CodeBlock>,
    pub(crate) inclusion_tree: TagTree,
    pub(crate) zero_bitplane_tree: TagTree,
}

/// A subband of one resolution.
#[derive(Debug)]
pub(crate) struct Subband {
    pub(crate) orientation: BandOrientation,
    pub(crate) rect: Rect,
    pub(crate) precincts: Vec<Precinct>,
    /// `Mb`, the maximum bit-plane count of the band (E-2).
    pub(crate) num_bitplanes: u8,
    /// Dequantization step; `None` for reversible coding.
    pub(crate) step_size: Option<f32>,
}

/// One level of the wavelet pyramid.
#[derive(Debug)]
pub(crate) struct Resolution {
    pub(crate) rect: Rect,
    /// Precinct grid dimensions (B-16).
    pub(crate) precincts_wide: u32,
    pub(crate) precincts_high: u32,
    /// Precinct size exponents at this resolution.
    pub(crate) ppx: u8,
    pub(crate) ppy: u8,
    /// One LL band at resolution zero, HL/LH/HH otherwise.
    pub(crate) bands: Vec<Subband>,
}

impl Resolution {
    pub(crate) fn num_precincts(&self) -> u32 {
        self.precincts_wide * self.precincts_high
    }
}

/// One color component of one tile.
#[derive(Debug)]
pub(crate) struct TileComponent {
    /// Tile-component rectangle (B-12): the tile rectangle divided by
    /// the component sub-sampling.
    pub(crate) rect: Rect,
    /// `resolutions[0]` is the lowest (LL-only) resolution.
    pub(crate) resolutions: Vec<Resolution>,
    pub(crate) num_resolutions: u8,
    /// Number of resolutions actually decoded after reduction.
    pub(crate) resolutions_to_decode: u8,
}

impl TileComponent {
    /// The tile-component rectangle per B-12.
    pub(crate) fn component_rect(tile_rect: Rect, component_info: &ComponentInfo) -> Rect {
        let dx = component_info.size_info.horizontal_resolution as u32;
        let dy = component_info.size_info.vertical_resolution as u32;

        if dx == 1 && dy == 1 {
            tile_rect
        } else {
            Rect::from_ltrb(
                tile_rect.x0.div_ceil(dx),
                tile_rect.y0.div_ceil(dy),
                tile_rect.x1.div_ceil(dx),
                tile_rect.y1.div_ceil(dy),
            )
        }
    }

    /// Compute the resolution, subband, precinct and code-block grids
    /// of one tile-component from its coding parameters.
    pub(crate) fn build(
        tile_rect: Rect,
        component_info: &ComponentInfo,
        reduce: u8,
    ) -> Result<Self> {
        let parameters = &component_info.coding_style.parameters;
        let num_resolutions = parameters.num_resolution_levels as u8;
        let rect = Self::component_rect(tile_rect, component_info);

        let resolutions_to_decode = if num_resolutions <= reduce {
            1
        } else {
            num_resolutions - reduce
        };

        let mut resolutions = Vec::with_capacity(num_resolutions as usize);

        for resno in 0..num_resolutions {
            let level = (num_resolutions - 1 - resno) as u32;

            // Resolution rectangle, B-14.
            let res_rect = rect.ceil_div_pow2(level);

            let (pdx, pdy) = parameters.precinct_exponents[resno as usize];
            if resno > 0 && (pdx == 0 || pdy == 0) {
                bail!(crate::error::ValidationError::InvalidParameter(
                    "precinct exponent of zero above resolution zero"
                ));
            }
            let (pdx, pdy) = (pdx as u32, pdy as u32);

            // Precinct grid, B-16. The precinct-aligned right/bottom
            // edges can exceed the coordinate space.
            let grid_x_start = floor_div_pow2(res_rect.x0, pdx) << pdx;
            let grid_y_start = floor_div_pow2(res_rect.y0, pdy) << pdy;
            let grid_x_end = (ceil_div_pow2(res_rect.x1, pdx) as u64) << pdx;
            let grid_y_end = (ceil_div_pow2(res_rect.y1, pdy) as u64) << pdy;
            if grid_x_end > u32::MAX as u64 || grid_y_end > u32::MAX as u64 {
                bail!(GeometryError::Overflow);
            }

            let precincts_wide = if res_rect.x0 == res_rect.x1 {
                0
            } else {
                (grid_x_end as u32 - grid_x_start) >> pdx
            };
            let precincts_high = if res_rect.y0 == res_rect.y1 {
                0
            } else {
                (grid_y_end as u32 - grid_y_start) >> pdy
            };

            // Code-block grid cell exponents, B-17/B-18: at higher
            // resolutions the precinct is halved before it constrains
            // the code-block size.
            let (cbg_width_exp, cbg_height_exp, cbg_x_start, cbg_y_start) = if resno == 0 {
                (pdx, pdy, grid_x_start, grid_y_start)
            } else {
                (
                    pdx - 1,
                    pdy - 1,
                    ceil_div_pow2(grid_x_start, 1),
                    ceil_div_pow2(grid_y_start, 1),
                )
            };

            let cblk_width_exp = u32::min(parameters.code_block_width as u32, cbg_width_exp);
            let cblk_height_exp = u32::min(parameters.code_block_height as u32, cbg_height_exp);

            let orientations: &[BandOrientation] = if resno == 0 {
                &[BandOrientation::LowLow]
            } else {
                &[
                    BandOrientation::HighLow,
                    BandOrientation::LowHigh,
                    BandOrientation::HighHigh,
                ]
            };

            let mut bands = Vec::with_capacity(orientations.len());
            for orientation in orientations {
                // Subband rectangle, B-15.
                let nb = if resno == 0 { level } else { level + 1 };
                let band = band_rect(rect, nb, *orientation);

                let resolution = resno as u16;
                let num_bitplanes = quant::num_bitplanes(component_info, *orientation, resolution);
                let step_size = quant::step_size(component_info, *orientation, resolution);

                let mut precincts =
                    Vec::with_capacity((precincts_wide * precincts_high) as usize);

                for precno in 0..precincts_wide * precincts_high {
                    let cell_x = cbg_x_start + (precno % precincts_wide) * (1 << cbg_width_exp);
                    let cell_y = cbg_y_start + (precno / precincts_wide) * (1 << cbg_height_exp);
                    let cell = Rect::from_xywh(
                        cell_x,
                        cell_y,
                        1 << cbg_width_exp,
                        1 << cbg_height_exp,
                    );

                    let precinct_rect = cell.intersect(band);

                    let (grid_width, grid_height, blocks) = if precinct_rect.is_empty() {
                        (0, 0, Vec::new())
                    } else {
                        let block_x_start =
                            floor_div_pow2(precinct_rect.x0, cblk_width_exp) << cblk_width_exp;
                        let block_y_start =
                            floor_div_pow2(precinct_rect.y0, cblk_height_exp) << cblk_height_exp;
                        let block_x_end =
                            ceil_div_pow2(precinct_rect.x1, cblk_width_exp) << cblk_width_exp;
                        let block_y_end =
                            ceil_div_pow2(precinct_rect.y1, cblk_height_exp) << cblk_height_exp;

                        let grid_width = (block_x_end - block_x_start) >> cblk_width_exp;
                        let grid_height = (block_y_end - block_y_start) >> cblk_height_exp;

                        let mut blocks =
                            Vec::with_capacity((grid_width * grid_height) as usize);
                        for y_idx in 0..grid_height {
                            for x_idx in 0..grid_width {
                                let block = Rect::from_xywh(
                                    block_x_start + (x_idx << cblk_width_exp),
                                    block_y_start + (y_idx << cblk_height_exp),
                                    1 << cblk_width_exp,
                                    1 << cblk_height_exp,
                                )
                                .intersect(precinct_rect);

                                blocks.push(CodeBlock::new(block, x_idx, y_idx));
                            }
                        }

                        (grid_width, grid_height, blocks)
                    };

                    precincts.push(Precinct {
                        rect: precinct_rect,
                        grid_width,
                        grid_height,
                        code_blocks: blocks,
                        inclusion_tree: TagTree::new(grid_width, grid_height),
                        zero_bitplane_tree: TagTree::new(grid_width, grid_height),
                    });
                }

                bands.push(Subband {
                    orientation: *orientation,
                    rect: band,
                    precincts,
                    num_bitplanes,
                    step_size,
                });
            }

            resolutions.push(Resolution {
                rect: res_rect,
                precincts_wide,
                precincts_high,
                ppx: pdx as u8,
                ppy: pdy as u8,
                bands,
            });
        }

        Ok(Self {
            rect,
            resolutions,
            num_resolutions,
            resolutions_to_decode,
        })
    }

    /// The rectangle of the highest decoded resolution.
    pub(crate) fn reduced_rect(&self) -> Rect {
        self.resolutions[self.resolutions_to_decode as usize - 1].rect
    }

    /// Resolution and band rectangles for the decoded pyramid, in the
    /// shape the window buffer consumes.
    pub(crate) fn reduced_geometry(&self) -> (Vec<Rect>, Vec<Vec<Rect>>) {
        let reduced = self.resolutions_to_decode as usize;
        let res_rects = self.resolutions[..reduced].iter().map(|r| r.rect).collect();
        let band_rects = self.resolutions[..reduced]
            .iter()
            .map(|r| r.bands.iter().map(|b| b.rect).collect())
            .collect();

        (res_rects, band_rects)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codestream::{
        CodeBlockStyle, CodingStyleComponent, CodingStyleFlags, CodingStyleParameters,
        ComponentSizeInfo, QuantizationInfo, QuantizationStyle, StepSize, WaveletTransform,
    };

    fn component_info(num_decompositions: u16, subsampling: (u8, u8)) -> ComponentInfo {
        let num_bands = 1 + 3 * num_decompositions as usize;
        ComponentInfo {
            size_info: ComponentSizeInfo {
                precision: 8,
                is_signed: false,
                horizontal_resolution: subsampling.0,
                vertical_resolution: subsampling.1,
            },
            coding_style: CodingStyleComponent {
                flags: CodingStyleFlags::from_u8(0),
                parameters: CodingStyleParameters {
                    num_decomposition_levels: num_decompositions,
                    num_resolution_levels: num_decompositions + 1,
                    code_block_width: 6,
                    code_block_height: 6,
                    code_block_style: CodeBlockStyle::default(),
                    transformation: WaveletTransform::Reversible53,
                    precinct_exponents: vec![(15, 15); num_decompositions as usize + 1],
                },
            },
            quantization: QuantizationInfo {
                quantization_style: QuantizationStyle::NoQuantization,
                guard_bits: 2,
                step_sizes: (0..num_bands)
                    .map(|_| StepSize {
                        mantissa: 0,
                        exponent: 9,
                    })
                    .collect(),
            },
        }
    }

    /// Component tile rectangles for the example in B.4.
    #[test]
    fn component_rect_standard_example_b4() {
        let full = component_info(0, (1, 1));
        let halved = component_info(0, (2, 2));

        let tile_0_0 = Rect::from_ltrb(152, 234, 396, 297);
        let coords = TileComponent::component_rect(tile_0_0, &full);
        assert_eq!(coords, tile_0_0);
        assert_eq!(coords.width(), 244);
        assert_eq!(coords.height(), 63);

        let coords = TileComponent::component_rect(tile_0_0, &halved);
        assert_eq!(coords, Rect::from_ltrb(76, 117, 198, 149));
        assert_eq!(coords.width(), 122);
        assert_eq!(coords.height(), 32);

        let tile_1_1 = Rect::from_ltrb(396, 297, 792, 594);
        let coords = TileComponent::component_rect(tile_1_1, &halved);
        assert_eq!(coords, Rect::from_ltrb(198, 149, 396, 297));
        assert_eq!(coords.width(), 198);
        assert_eq!(coords.height(), 148);
    }

    /// Every resolution rectangle must equal the tile-component
    /// rectangle rounded up by the matching number of halvings.
    #[test]
    fn resolution_rects_round_up() {
        let info = component_info(4, (1, 1));
        let tile_rect = Rect::from_ltrb(13, 27, 531, 401);
        let tc = TileComponent::build(tile_rect, &info, 0).unwrap();

        assert_eq!(tc.resolutions.len(), 5);
        for (resno, res) in tc.resolutions.iter().enumerate() {
            let level = (tc.num_resolutions - 1) as u32 - resno as u32;
            assert_eq!(res.rect, tc.rect.ceil_div_pow2(level), "resolution {resno}");
        }
    }

    /// The three high bands plus the lower resolution tile resolution
    /// `r` exactly.
    #[test]
    fn subbands_partition_each_resolution() {
        let info = component_info(3, (1, 1));
        let tile_rect = Rect::from_ltrb(5, 3, 357, 299);
        let tc = TileComponent::build(tile_rect, &info, 0).unwrap();

        for resno in 1..tc.resolutions.len() {
            let res = &tc.resolutions[resno];
            let lower = &tc.resolutions[resno - 1];
            let hl = &res.bands[0].rect;
            let lh = &res.bands[1].rect;
            let hh = &res.bands[2].rect;

            assert_eq!(lower.rect.width() + hl.width(), res.rect.width());
            assert_eq!(lower.rect.height() + lh.height(), res.rect.height());
            assert_eq!(hl.height(), lower.rect.height());
            assert_eq!(lh.width(), lower.rect.width());
            assert_eq!(
                lower.rect.area() + hl.area() + lh.area() + hh.area(),
                res.rect.area()
            );
        }
    }

    /// Code blocks tile each precinct and never leave it.
    #[test]
    fn code_blocks_stay_inside_precincts() {
        let mut info = component_info(2, (1, 1));
        info.coding_style.parameters.precinct_exponents = vec![(6, 6); 3];
        let tile_rect = Rect::from_ltrb(0, 0, 200, 120);
        let tc = TileComponent::build(tile_rect, &info, 0).unwrap();

        for res in &tc.resolutions {
            for band in &res.bands {
                let mut covered = 0u64;
                for precinct in &band.precincts {
                    for block in &precinct.code_blocks {
                        assert_eq!(block.rect, block.rect.intersect(precinct.rect));
                        covered += block.rect.area();
                    }
                }
                let total: u64 = band.precincts.iter().map(|p| p.rect.area()).sum();
                assert_eq!(covered, total);
                assert_eq!(total, band.rect.area());
            }
        }
    }

    /// Nominal code-block dimensions are clamped by the precinct size.
    #[test]
    fn code_block_size_clamped_by_precinct() {
        let mut info = component_info(2, (1, 1));
        info.coding_style.parameters.precinct_exponents = vec![(5, 5); 3];
        let tile_rect = Rect::from_ltrb(0, 0, 128, 128);
        let tc = TileComponent::build(tile_rect, &info, 0).unwrap();

        // At resolutions above zero the grid cell is half the
        // precinct, so blocks are at most 16x16 here despite the
        // nominal 64x64.
        let res = &tc.resolutions[1];
        for band in &res.bands {
            for precinct in &band.precincts {
                for block in &precinct.code_blocks {
                    assert!(block.rect.width() <= 16);
                    assert!(block.rect.height() <= 16);
                }
            }
        }
    }
}
