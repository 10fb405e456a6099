//! Creating tiles and parsing their constituent tile parts.

use crate::byte_io::{Reader, Writer};
use crate::codestream::{
    ComponentInfo, Header, ProgressionChange, ProgressionOrder, ReaderExt, markers,
    skip_marker_segment,
};
use crate::error::{Error, MarkerError, Result, ValidationError, bail};
use crate::log::lwarn;
use crate::rect::Rect;

/// A single tile in the image.
#[derive(Clone, Debug)]
pub(crate) struct Tile<'a> {
    pub(crate) idx: u32,
    /// The concatenated tile parts that contain the packet data for
    /// all constituent code blocks.
    pub(crate) tile_parts: Vec<&'a [u8]>,
    /// Parameters for each component. In most cases these are
    /// inherited from the main header, but the first tile-part header
    /// may override them per tile.
    pub(crate) component_infos: Vec<ComponentInfo>,
    /// The area of the tile on the reference grid. `x1` and `y1` are
    /// exclusive.
    pub(crate) rect: Rect,
    pub(crate) progression_order: ProgressionOrder,
    pub(crate) num_layers: u16,
    pub(crate) mct: bool,
    /// Progression order changes in effect for this tile.
    pub(crate) progression_changes: Vec<ProgressionChange>,
    /// Packet headers reassembled from PPT markers, if present.
    pub(crate) packed_headers: Option<Vec<u8>>,
}

impl<'a> Tile<'a> {
    pub(crate) fn new(idx: u32, header: &Header) -> Tile<'a> {
        let rect = {
            let size_data = &header.size_data;

            let x_coord = size_data.tile_x_coord(idx);
            let y_coord = size_data.tile_y_coord(idx);

            // See B-7, B-8, B-9 and B-10.
            let x0 = u32::max(
                size_data.tile_x_offset + x_coord * size_data.tile_width,
                size_data.image_area_x_offset,
            );
            let y0 = u32::max(
                size_data.tile_y_offset + y_coord * size_data.tile_height,
                size_data.image_area_y_offset,
            );

            // Note that `x1` and `y1` are exclusive.
            let x1 = u32::min(
                size_data.tile_x_offset + (x_coord + 1) * size_data.tile_width,
                size_data.reference_grid_width,
            );
            let y1 = u32::min(
                size_data.tile_y_offset + (y_coord + 1) * size_data.tile_height,
                size_data.reference_grid_height,
            );

            Rect::from_ltrb(x0, y0, x1, y1)
        };

        Tile {
            idx,
            // Filled while parsing.
            tile_parts: vec![],
            rect,
            // Each tile inherits the settings from the main header;
            // the first tile-part header may override some of them.
            component_infos: header.component_infos.clone(),
            progression_order: header.global_coding_style.progression_order,
            mct: header.global_coding_style.mct,
            num_layers: header.global_coding_style.num_layers,
            progression_changes: header.progression_changes.clone(),
            packed_headers: None,
        }
    }
}

/// Create the tiles and parse their constituent tile parts.
pub(crate) fn parse<'a>(reader: &mut Reader<'a>, main_header: &Header) -> Result<Vec<Tile<'a>>> {
    let mut tiles = (0..main_header.size_data.num_tiles())
        .map(|idx| Tile::new(idx, main_header))
        .collect::<Vec<_>>();

    parse_tile_part(reader, main_header, &mut tiles)?;

    while reader.peek_marker() == Some(markers::SOT) {
        parse_tile_part(reader, main_header, &mut tiles)?;
    }

    if reader.peek_marker() != Some(markers::EOC) {
        lwarn!("codestream does not end with an EOC marker");
    }

    Ok(tiles)
}

fn parse_tile_part<'a>(
    reader: &mut Reader<'a>,
    main_header: &Header,
    tiles: &mut [Tile<'a>],
) -> Result<()> {
    if reader.read_marker()? != markers::SOT {
        bail!(MarkerError::Missing("SOT"));
    }

    let tile_part_header = sot_marker(reader).ok_or(MarkerError::ParseFailure("SOT"))?;

    if tile_part_header.tile_index as u32 >= main_header.size_data.num_tiles() {
        bail!(ValidationError::InvalidTileIndex);
    }

    let first = tile_part_header.tile_part_index == 0;

    let data_len = if tile_part_header.tile_part_length == 0 {
        reader.tail().map(|d| d.len()).unwrap_or(0)
    } else {
        // Subtract 12 to account for the SOT marker segment itself.
        (tile_part_header.tile_part_length as usize)
            .checked_sub(12)
            .ok_or(MarkerError::ParseFailure("SOT"))?
    };

    let start = reader.offset();

    let tile = &mut tiles[tile_part_header.tile_index as usize];
    let num_components = tile.component_infos.len();

    loop {
        let Some(marker) = reader.peek_marker() else {
            lwarn!("expected marker in tile-part, but didn't find one. tile part will be ignored.");

            return Ok(());
        };

        match marker {
            markers::SOD => {
                reader.read_marker()?;
                break;
            }
            // COD, COC, QCD and QCC may only appear in the first
            // tile-part header, if they appear at all.
            markers::COD => {
                reader.read_marker()?;
                let cod = crate::codestream::cod_marker(reader)
                    .ok_or(MarkerError::ParseFailure("COD"))?;

                if first {
                    tile.mct = cod.mct;
                    tile.num_layers = cod.num_layers;
                    tile.progression_order = cod.progression_order;

                    for component in &mut tile.component_infos {
                        component.coding_style = cod.component_parameters.clone();
                    }
                } else {
                    lwarn!("encountered unexpected COD marker in tile-part header");
                }
            }
            markers::COC => {
                reader.read_marker()?;

                let (component_index, coc) =
                    crate::codestream::coc_marker(reader, num_components as u16)
                        .ok_or(MarkerError::ParseFailure("COC"))?;

                if first {
                    tile.component_infos
                        .get_mut(component_index as usize)
                        .ok_or(ValidationError::InvalidParameter("COC component index"))?
                        .coding_style = coc;
                } else {
                    lwarn!("encountered unexpected COC marker in tile-part header");
                }
            }
            markers::QCD => {
                reader.read_marker()?;
                let qcd = crate::codestream::qcd_marker(reader)
                    .ok_or(MarkerError::ParseFailure("QCD"))?;

                if first {
                    for component_info in &mut tile.component_infos {
                        component_info.quantization = qcd.clone();
                    }
                } else {
                    lwarn!("encountered unexpected QCD marker in tile-part header");
                }
            }
            markers::QCC => {
                reader.read_marker()?;
                let (component_index, qcc) =
                    crate::codestream::qcc_marker(reader, num_components as u16)
                        .ok_or(MarkerError::ParseFailure("QCC"))?;

                if first {
                    tile.component_infos
                        .get_mut(component_index as usize)
                        .ok_or(ValidationError::InvalidParameter("QCC component index"))?
                        .quantization = qcc;
                } else {
                    lwarn!("encountered unexpected QCC marker in tile-part header");
                }
            }
            markers::POC => {
                reader.read_marker()?;
                skip_marker_segment(reader).ok_or(MarkerError::ParseFailure("POC"))?;
                lwarn!("POC in tile-part header is ignored; main-header POC applies");
            }
            markers::PPT => {
                reader.read_marker()?;

                if main_header.packed_headers.is_some() {
                    bail!(ValidationError::PpmPptConflict);
                }

                let length = reader
                    .read_u16()
                    .and_then(|l| l.checked_sub(3))
                    .ok_or(MarkerError::ParseFailure("PPT"))?;
                let _zppt = reader.read_byte();
                let segment = reader
                    .read_bytes(length as usize)
                    .ok_or(MarkerError::ParseFailure("PPT"))?;

                tile.packed_headers
                    .get_or_insert_with(Vec::new)
                    .extend(segment);
            }
            markers::EOC => break,
            _ => {
                reader.read_marker()?;
                skip_marker_segment(reader).ok_or(MarkerError::ParseFailure("tile-part"))?;
            }
        }
    }

    let remaining_bytes = if let Some(len) = data_len.checked_sub(reader.offset() - start) {
        len
    } else {
        lwarn!("didn't find sufficient data in tile part");

        return Ok(());
    };

    tile.tile_parts.push(
        reader
            .read_bytes(remaining_bytes)
            .ok_or(Error::Io(crate::error::IoError::UnexpectedEof))?,
    );

    Ok(())
}

struct TilePartHeader {
    tile_index: u16,
    tile_part_length: u32,
    tile_part_index: u8,
}

/// SOT marker (A.4.2).
fn sot_marker(reader: &mut Reader<'_>) -> Option<TilePartHeader> {
    // Length.
    let _ = reader.read_u16()?;

    let tile_index = reader.read_u16()?;
    let tile_part_length = reader.read_u32()?;
    let tile_part_index = reader.read_byte()?;
    // The number of tile parts; we infer it ourselves.
    let _num_tile_parts = reader.read_byte()?;

    Some(TilePartHeader {
        tile_index,
        tile_part_length,
        tile_part_index,
    })
}

/// Emit a SOT marker segment. Returns the byte offset of the Psot
/// field so the caller can backpatch the tile-part length once the
/// body is written.
pub(crate) fn write_sot(w: &mut Writer, tile_index: u16) -> usize {
    crate::codestream::write::marker(w, markers::SOT);
    w.write_u16(10);
    w.write_u16(tile_index);
    let psot_offset = w.len();
    w.write_u32(0);
    // Single tile part per tile.
    w.write_byte(0);
    w.write_byte(1);

    psot_offset
}
