//! Packet progression iteration, defined in Section B.12.
//!
//! A progression sequence yields tuples of (layer, resolution,
//! component, precinct) in the order packet data appears in the
//! codestream. Five built-in orders exist; the POC marker splices
//! segments of different orders over bounded layer, resolution and
//! component ranges.

use crate::codestream::{ComponentInfo, ProgressionChange, ProgressionOrder};
use crate::rect::Rect;
use crate::tile_component::TileComponent;
use std::collections::HashSet;

#[derive(Default, Copy, Clone, Debug, PartialEq, Eq, Hash)]
pub(crate) struct ProgressionData {
    pub(crate) layer_num: u16,
    pub(crate) resolution: u16,
    pub(crate) component: u16,
    pub(crate) precinct: u32,
}

/// The geometry a progression sequence iterates over.
pub(crate) struct IteratorInput<'a> {
    layers: u16,
    tile_rect: Rect,
    components: &'a [TileComponent],
    component_infos: &'a [ComponentInfo],
    max_resolutions: u16,
}

impl<'a> IteratorInput<'a> {
    pub(crate) fn new(
        layers: u16,
        tile_rect: Rect,
        components: &'a [TileComponent],
        component_infos: &'a [ComponentInfo],
    ) -> Self {
        let max_resolutions = components
            .iter()
            .map(|c| c.num_resolutions as u16)
            .max()
            .unwrap_or(0);

        Self {
            layers,
            tile_rect,
            components,
            component_infos,
            max_resolutions,
        }
    }

    fn resolution(&self, component: usize, resolution: u16) -> Option<&TileComponent> {
        let tc = &self.components[component];
        (resolution < tc.num_resolutions as u16).then_some(tc)
    }
}

/// Bounds a POC segment imposes on a sequence; the default covers
/// everything.
#[derive(Clone, Copy, Debug)]
struct Bounds {
    layer_end: u16,
    resolution_start: u16,
    resolution_end: u16,
    component_start: u16,
    component_end: u16,
}

impl Bounds {
    fn full(input: &IteratorInput<'_>) -> Self {
        Self {
            layer_end: input.layers,
            resolution_start: 0,
            resolution_end: input.max_resolutions,
            component_start: 0,
            component_end: input.components.len() as u16,
        }
    }

    fn layers(&self) -> core::ops::Range<u16> {
        0..self.layer_end
    }

    fn resolutions(&self) -> core::ops::Range<u16> {
        self.resolution_start..self.resolution_end
    }

    fn components(&self) -> core::ops::Range<u16> {
        self.component_start..self.component_end
    }
}

/// Build the packet sequence for a tile, honoring progression order
/// changes when present.
pub(crate) fn build_sequence(
    input: &IteratorInput<'_>,
    default_order: ProgressionOrder,
    changes: &[ProgressionChange],
) -> Vec<ProgressionData> {
    if changes.is_empty() {
        return build_with_bounds(input, default_order, Bounds::full(input));
    }

    // Packets already emitted by an earlier segment are not repeated
    // by later ones.
    let mut emitted = HashSet::new();
    let mut sequence = Vec::new();

    for change in changes {
        let bounds = Bounds {
            layer_end: change.layer_end.min(input.layers),
            resolution_start: change.resolution_start as u16,
            resolution_end: (change.resolution_end as u16).min(input.max_resolutions),
            component_start: change.component_start,
            component_end: change.component_end.min(input.components.len() as u16),
        };

        for data in build_with_bounds(input, change.order, bounds) {
            if emitted.insert(data) {
                sequence.push(data);
            }
        }
    }

    sequence
}

fn build_with_bounds(
    input: &IteratorInput<'_>,
    order: ProgressionOrder,
    bounds: Bounds,
) -> Vec<ProgressionData> {
    match order {
        ProgressionOrder::LayerResolutionComponentPosition => {
            build_layer_resolution_component_position(input, bounds)
        }
        ProgressionOrder::ResolutionLayerComponentPosition => {
            build_resolution_layer_component_position(input, bounds)
        }
        ProgressionOrder::ResolutionPositionComponentLayer => {
            build_resolution_position_component_layer(input, bounds)
        }
        ProgressionOrder::PositionComponentResolutionLayer => {
            build_position_component_resolution_layer(input, bounds)
        }
        ProgressionOrder::ComponentPositionResolutionLayer => {
            build_component_position_resolution_layer(input, bounds)
        }
    }
}

fn build_layer_resolution_component_position(
    input: &IteratorInput<'_>,
    bounds: Bounds,
) -> Vec<ProgressionData> {
    let mut sequence = Vec::new();

    for layer in bounds.layers() {
        for resolution in bounds.resolutions() {
            for component in bounds.components() {
                let Some(tc) = input.resolution(component as usize, resolution) else {
                    continue;
                };

                let precinct_count = tc.resolutions[resolution as usize].num_precincts();
                for precinct in 0..precinct_count {
                    sequence.push(ProgressionData {
                        layer_num: layer,
                        resolution,
                        component,
                        precinct,
                    });
                }
            }
        }
    }

    sequence
}

fn build_resolution_layer_component_position(
    input: &IteratorInput<'_>,
    bounds: Bounds,
) -> Vec<ProgressionData> {
    let mut sequence = Vec::new();

    for resolution in bounds.resolutions() {
        for layer in bounds.layers() {
            for component in bounds.components() {
                let Some(tc) = input.resolution(component as usize, resolution) else {
                    continue;
                };

                let precinct_count = tc.resolutions[resolution as usize].num_precincts();
                for precinct in 0..precinct_count {
                    sequence.push(ProgressionData {
                        layer_num: layer,
                        resolution,
                        component,
                        precinct,
                    });
                }
            }
        }
    }

    sequence
}

fn build_resolution_position_component_layer(
    input: &IteratorInput<'_>,
    bounds: Bounds,
) -> Vec<ProgressionData> {
    let mut sequence = Vec::new();
    let tile_rect = input.tile_rect;

    for resolution in bounds.resolutions() {
        for y in tile_rect.y0..tile_rect.y1 {
            for x in tile_rect.x0..tile_rect.x1 {
                for component in bounds.components() {
                    if input.resolution(component as usize, resolution).is_none() {
                        continue;
                    }

                    if let Some(precinct) = precinct_at_anchor(input, component, resolution, x, y)
                    {
                        for layer in bounds.layers() {
                            sequence.push(ProgressionData {
                                layer_num: layer,
                                resolution,
                                component,
                                precinct,
                            });
                        }
                    }
                }
            }
        }
    }

    sequence
}

fn build_position_component_resolution_layer(
    input: &IteratorInput<'_>,
    bounds: Bounds,
) -> Vec<ProgressionData> {
    let mut sequence = Vec::new();
    let tile_rect = input.tile_rect;

    for y in tile_rect.y0..tile_rect.y1 {
        for x in tile_rect.x0..tile_rect.x1 {
            for component in bounds.components() {
                for resolution in bounds.resolutions() {
                    if input.resolution(component as usize, resolution).is_none() {
                        continue;
                    }

                    if let Some(precinct) = precinct_at_anchor(input, component, resolution, x, y)
                    {
                        for layer in bounds.layers() {
                            sequence.push(ProgressionData {
                                layer_num: layer,
                                resolution,
                                component,
                                precinct,
                            });
                        }
                    }
                }
            }
        }
    }

    sequence
}

fn build_component_position_resolution_layer(
    input: &IteratorInput<'_>,
    bounds: Bounds,
) -> Vec<ProgressionData> {
    let mut sequence = Vec::new();
    let tile_rect = input.tile_rect;

    for component in bounds.components() {
        for y in tile_rect.y0..tile_rect.y1 {
            for x in tile_rect.x0..tile_rect.x1 {
                for resolution in bounds.resolutions() {
                    if input.resolution(component as usize, resolution).is_none() {
                        continue;
                    }

                    if let Some(precinct) = precinct_at_anchor(input, component, resolution, x, y)
                    {
                        for layer in bounds.layers() {
                            sequence.push(ProgressionData {
                                layer_num: layer,
                                resolution,
                                component,
                                precinct,
                            });
                        }
                    }
                }
            }
        }
    }

    sequence
}

/// The precinct whose packets are announced at reference-grid point
/// `(x, y)`, if any (B.12.1.3 to B.12.1.5).
///
/// Position-driven orders visit every grid point of the tile and emit
/// a precinct's packets at its anchor: the precinct's own top-left
/// grid point, or the tile edge where the precinct grid begins
/// outside the tile.
fn precinct_at_anchor(
    input: &IteratorInput<'_>,
    component: u16,
    resolution: u16,
    x: u32,
    y: u32,
) -> Option<u32> {
    let tc = &input.components[component as usize];
    let size = &input.component_infos[component as usize].size_info;
    let res = &tc.resolutions[resolution as usize];

    if res.num_precincts() == 0 || res.precincts_wide == 0 {
        return None;
    }

    let level = (tc.num_resolutions as u32).checked_sub(1 + resolution as u32)?;

    // Reference-grid distance between neighboring samples of this
    // resolution, per axis.
    let step_x = (size.horizontal_resolution as u64) << level;
    let step_y = (size.vertical_resolution as u64) << level;

    let anchored = |grid_coord: u32, tile_edge: u32, res_origin: u32, step: u64, exp: u8| {
        if (grid_coord as u64).is_multiple_of(step << exp) {
            return true;
        }
        // A precinct clipped by the tile edge is announced there.
        grid_coord == tile_edge && !res_origin.is_multiple_of(1 << exp)
    };

    if !anchored(y, input.tile_rect.y0, res.rect.y0, step_y, res.ppy)
        || !anchored(x, input.tile_rect.x0, res.rect.x0, step_x, res.ppx)
    {
        return None;
    }

    // Map the grid point into the resolution's precinct grid, relative
    // to the tile's first precinct.
    let column = ((x as u64).div_ceil(step_x) >> res.ppx)
        .checked_sub((res.rect.x0 >> res.ppx) as u64)?;
    let row = ((y as u64).div_ceil(step_y) >> res.ppy)
        .checked_sub((res.rect.y0 >> res.ppy) as u64)?;

    let index = row * res.precincts_wide as u64 + column;
    (index < res.num_precincts() as u64).then_some(index as u32)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codestream::{
        CodeBlockStyle, CodingStyleComponent, CodingStyleFlags, CodingStyleParameters,
        ComponentSizeInfo, QuantizationInfo, QuantizationStyle, StepSize, WaveletTransform,
    };

    fn test_setup(num_decompositions: u16) -> (Vec<TileComponent>, Vec<ComponentInfo>, Rect) {
        let num_bands = 1 + 3 * num_decompositions as usize;
        let info = ComponentInfo {
            size_info: ComponentSizeInfo {
                precision: 8,
                is_signed: false,
                horizontal_resolution: 1,
                vertical_resolution: 1,
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
                    precinct_exponents: vec![(6, 6); num_decompositions as usize + 1],
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
        };

        let tile_rect = Rect::from_ltrb(0, 0, 256, 128);
        let tc = TileComponent::build(tile_rect, &info, 0).unwrap();

        (vec![tc], vec![info], tile_rect)
    }

    fn total_packets(components: &[TileComponent], layers: u16) -> usize {
        let mut count = 0;
        for tc in components {
            for res in &tc.resolutions {
                count += res.num_precincts() as usize * layers as usize;
            }
        }
        count
    }

    #[test]
    fn every_order_emits_every_packet_once() {
        let (components, infos, tile_rect) = test_setup(2);
        let layers = 3;
        let input = IteratorInput::new(layers, tile_rect, &components, &infos);

        let expected = total_packets(&components, layers);

        for order in [
            ProgressionOrder::LayerResolutionComponentPosition,
            ProgressionOrder::ResolutionLayerComponentPosition,
            ProgressionOrder::ResolutionPositionComponentLayer,
            ProgressionOrder::PositionComponentResolutionLayer,
            ProgressionOrder::ComponentPositionResolutionLayer,
        ] {
            let sequence = build_sequence(&input, order, &[]);
            assert_eq!(sequence.len(), expected, "{order:?}");

            let unique: HashSet<_> = sequence.iter().collect();
            assert_eq!(unique.len(), expected, "{order:?} has duplicates");
        }
    }

    #[test]
    fn lrcp_iterates_layers_outermost() {
        let (components, infos, tile_rect) = test_setup(1);
        let input = IteratorInput::new(2, tile_rect, &components, &infos);

        let sequence =
            build_sequence(&input, ProgressionOrder::LayerResolutionComponentPosition, &[]);

        let half = sequence.len() / 2;
        assert!(sequence[..half].iter().all(|d| d.layer_num == 0));
        assert!(sequence[half..].iter().all(|d| d.layer_num == 1));
    }

    #[test]
    fn rlcp_iterates_resolutions_outermost() {
        let (components, infos, tile_rect) = test_setup(1);
        let input = IteratorInput::new(2, tile_rect, &components, &infos);

        let sequence =
            build_sequence(&input, ProgressionOrder::ResolutionLayerComponentPosition, &[]);

        let first_res_count = components[0].resolutions[0].num_precincts() as usize * 2;
        assert!(sequence[..first_res_count].iter().all(|d| d.resolution == 0));
        assert!(sequence[first_res_count..].iter().all(|d| d.resolution == 1));
    }

    #[test]
    fn poc_segments_cover_everything_without_duplicates() {
        let (components, infos, tile_rect) = test_setup(2);
        let layers = 2;
        let input = IteratorInput::new(layers, tile_rect, &components, &infos);

        // First the lowest resolution in LRCP, then everything in
        // RLCP; the second segment must not repeat the first.
        let changes = [
            ProgressionChange {
                resolution_start: 0,
                component_start: 0,
                layer_end: layers,
                resolution_end: 1,
                component_end: 1,
                order: ProgressionOrder::LayerResolutionComponentPosition,
            },
            ProgressionChange {
                resolution_start: 0,
                component_start: 0,
                layer_end: layers,
                resolution_end: 3,
                component_end: 1,
                order: ProgressionOrder::ResolutionLayerComponentPosition,
            },
        ];

        let sequence = build_sequence(
            &input,
            ProgressionOrder::LayerResolutionComponentPosition,
            &changes,
        );

        let expected = total_packets(&components, layers);
        assert_eq!(sequence.len(), expected);

        let unique: HashSet<_> = sequence.iter().collect();
        assert_eq!(unique.len(), expected);

        // The first packets all belong to resolution zero.
        let res0_count = components[0].resolutions[0].num_precincts() as usize * layers as usize;
        assert!(sequence[..res0_count].iter().all(|d| d.resolution == 0));
    }
}
