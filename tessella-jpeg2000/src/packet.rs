//! Packet header coding (B.9/B.10): inclusion and zero-bit-plane tag
//! trees, pass counts, code-block contribution lengths, and the
//! surrounding SOP/EPH markers.
//!
//! A packet carries the contributions of one layer x resolution x
//! component x precinct, in subband scan order HL, LH, HH (just LL at
//! resolution zero).

use crate::bit_io::{BitReader, BitWriter};
use crate::byte_io::{Reader, Writer};
use crate::codestream::{ComponentInfo, markers};
use crate::error::{PacketError, Result, bail};
use crate::log::ltrace;
use crate::math::floor_log2;
use crate::progression::ProgressionData;
use crate::tile_component::{CodedChunk, TileComponent};

/// One code-block body to read after the packet header: its location
/// and the byte length of each codeword segment.
struct BodyEntry {
    band_index: usize,
    block_index: usize,
    segments: Vec<(u32, u32)>,
}

/// Decode every packet of a tile, in progression order, consuming the
/// tile parts back to back.
pub(crate) fn decode_tile_packets(
    tile_parts: &[&[u8]],
    packed_headers: Option<&[u8]>,
    sequence: &[ProgressionData],
    components: &mut [TileComponent],
    infos: &[ComponentInfo],
) -> Result<()> {
    let mut cursor = 0usize;
    let mut packed_pos = 0usize;

    for tile_part in tile_parts {
        let mut data = *tile_part;

        while !data.is_empty() {
            let Some(progression) = sequence.get(cursor) else {
                // Trailing bytes with no packet left to describe them.
                bail!(PacketError::TruncatedBody);
            };
            cursor += 1;

            data = decode_packet(
                data,
                packed_headers,
                &mut packed_pos,
                *progression,
                components,
                infos,
            )?;
        }
    }

    Ok(())
}

fn decode_packet<'a>(
    data: &'a [u8],
    packed_headers: Option<&[u8]>,
    packed_pos: &mut usize,
    progression: ProgressionData,
    components: &mut [TileComponent],
    infos: &[ComponentInfo],
) -> Result<&'a [u8]> {
    let info = &infos[progression.component as usize];
    let mut data = data;

    // B.10.1: an SOP marker segment may precede each packet in the
    // body stream.
    if info.coding_style.flags.may_use_sop_markers()
        && data.len() >= 6
        && data[0] == 0xFF
        && data[1] == markers::SOP
    {
        data = &data[6..];
    }

    let tc = &mut components[progression.component as usize];
    let resolution = progression.resolution;

    ltrace!(
        "packet l={} r={} c={} p={}",
        progression.layer_num,
        progression.resolution,
        progression.component,
        progression.precinct
    );

    let mut entries = Vec::new();

    let header_bytes = match packed_headers {
        Some(packed) => &packed[*packed_pos..],
        None => data,
    };
    let mut reader = BitReader::new(header_bytes);

    // B.10.3 Zero length packet: the first header bit denotes whether
    // any code-block contributes at all.
    let zero_length = reader.read(1)? == 0;

    if !zero_length {
        let style = info.code_block_style();
        let band_count = tc.resolutions[resolution as usize].bands.len();
        for band_index in 0..band_count {
            decode_band_header(
                tc,
                resolution,
                band_index,
                progression,
                style,
                &mut reader,
                &mut entries,
            )?;
        }
    }

    reader.align()?;
    let header_len = reader.bytes_consumed();

    let mut body = match packed_headers {
        Some(_) => {
            *packed_pos += header_len;
            Reader::new(data)
        }
        None => {
            let mut r = Reader::new(data);
            let _ = r.read_bytes(header_len);
            r
        }
    };

    // The EPH marker terminates the packet header stream.
    if info.coding_style.flags.uses_eph_marker() {
        match packed_headers {
            Some(packed) => {
                let tail = &packed[*packed_pos..];
                if tail.len() < 2 || tail[0] != 0xFF || tail[1] != markers::EPH {
                    bail!(crate::error::MarkerError::Missing("EPH"));
                }
                *packed_pos += 2;
            }
            None => {
                let Some(word) = body.peek_bytes(2) else {
                    bail!(crate::error::MarkerError::Missing("EPH"));
                };
                if word != [0xFF, markers::EPH] {
                    bail!(crate::error::MarkerError::Missing("EPH"));
                }
                let _ = body.read_bytes(2);
            }
        }
    }

    // Read the signalled bodies, in header order.
    for entry in entries {
        let band = &mut tc.resolutions[resolution as usize].bands[entry.band_index];
        let precinct = &mut band.precincts[progression.precinct as usize];
        let block = &mut precinct.code_blocks[entry.block_index];

        for (passes, length) in entry.segments {
            let bytes = body
                .read_bytes(length as usize)
                .ok_or(PacketError::TruncatedBody)?;

            if block.needs_decode {
                block.chunks.push(CodedChunk {
                    passes,
                    data: bytes.to_vec(),
                });
            }
        }
    }

    Ok(body.tail().unwrap_or(&[]))
}

fn decode_band_header(
    tc: &mut TileComponent,
    resolution: u16,
    band_index: usize,
    progression: ProgressionData,
    style: crate::codestream::CodeBlockStyle,
    reader: &mut BitReader<'_>,
    entries: &mut Vec<BodyEntry>,
) -> Result<()> {
    let band = &mut tc.resolutions[resolution as usize].bands[band_index];
    let precinct = &mut band.precincts[progression.precinct as usize];

    for block_index in 0..precinct.code_blocks.len() {
        let (x_idx, y_idx, was_included, l_block, previous_passes) = {
            let block = &precinct.code_blocks[block_index];
            (
                block.x_idx,
                block.y_idx,
                block.has_been_included,
                block.l_block,
                block.num_passes,
            )
        };

        // B.10.4 Code-block inclusion: one bit for previously included
        // blocks, a partial tag-tree walk otherwise.
        let is_included = if was_included {
            reader.read(1)? == 1
        } else {
            precinct.inclusion_tree.read(
                x_idx,
                y_idx,
                reader,
                progression.layer_num as u32 + 1,
            )? <= progression.layer_num as u32
        };

        if !is_included {
            continue;
        }

        // B.10.5 Zero bit-plane information, on first inclusion.
        if !was_included {
            let missing = precinct
                .zero_bitplane_tree
                .read(x_idx, y_idx, reader, u32::MAX)?;
            precinct.code_blocks[block_index].missing_bit_planes = missing as u8;
        }

        // B.10.6 Number of coding passes (Table B.4).
        let added_passes = reader.get_num_passes()?;

        // B.10.7 Length signalling: the comma code raises Lblock, then
        // each codeword segment's byte count follows with
        // `Lblock + floor(log2(passes))` bits.
        let l_block = l_block + reader.get_comma_code()?;

        let mut segments = Vec::new();
        for passes in split_into_segments(previous_passes, added_passes, style) {
            let length_bits = l_block + floor_log2(passes);
            let length = reader.read(length_bits)?;
            segments.push((passes, length));
        }

        let block = &mut precinct.code_blocks[block_index];
        block.has_been_included = true;
        block.l_block = l_block;
        block.num_passes += added_passes;

        entries.push(BodyEntry {
            band_index,
            block_index,
            segments,
        });
    }

    Ok(())
}

/// Split the coding passes a packet adds to one code block into
/// codeword segments (B.10.7). With one termination per code block
/// this is a single segment; the per-pass-termination style terminates
/// every pass, and the bypass style terminates at the boundaries of
/// Table D.9.
fn split_into_segments(
    previous_passes: u32,
    added_passes: u32,
    style: crate::codestream::CodeBlockStyle,
) -> Vec<u32> {
    let segment_of = |pass_idx: u32| {
        if style.termination_on_each_pass {
            pass_idx
        } else if style.selective_arithmetic_coding_bypass {
            segment_idx_for_bypass(pass_idx)
        } else {
            0
        }
    };

    let mut out = Vec::new();
    let mut current = segment_of(previous_passes);
    let mut count = 0;

    for pass in previous_passes..previous_passes + added_passes {
        let segment = segment_of(pass);
        if segment != current {
            out.push(count);
            current = segment;
            count = 0;
        }
        count += 1;
    }

    if count > 0 {
        out.push(count);
    }

    out
}

/// Codeword segment index of a coding pass under the selective
/// arithmetic bypass style (Table D.9): the first ten passes share one
/// segment, then terminations follow each bypassed pair and each
/// cleanup pass.
fn segment_idx_for_bypass(pass_idx: u32) -> u32 {
    if pass_idx < 10 {
        0
    } else {
        1 + (2 * ((pass_idx - 10) / 3))
            + (if ((pass_idx - 10) % 3) == 2 { 1 } else { 0 })
    }
}

/// Encode one packet. `contributing` lists, per band, the block
/// indices contributing to this layer.
pub(crate) fn encode_packet(
    out: &mut Writer,
    tc: &mut TileComponent,
    progression: ProgressionData,
    num_layers: u16,
) -> Result<()> {
    let resolution = progression.resolution as usize;
    let precinct_index = progression.precinct as usize;

    // Does any block contribute?
    let any_contribution = tc.resolutions[resolution].bands.iter().any(|band| {
        band.precincts[precinct_index]
            .code_blocks
            .iter()
            .any(|b| b.encoded.as_ref().is_some_and(|e| e.num_passes > 0))
    });

    let mut writer = BitWriter::new();

    if !any_contribution {
        // B.10.3: a zero first bit marks an empty packet.
        writer.write(0, 1);
        out.write_bytes(&writer.flush());
        return Ok(());
    }

    writer.write(1, 1);

    let band_count = tc.resolutions[resolution].bands.len();
    let mut bodies: Vec<(usize, usize)> = Vec::new();

    for band_index in 0..band_count {
        let band = &mut tc.resolutions[resolution].bands[band_index];
        let precinct = &mut band.precincts[precinct_index];

        // Populate the tag trees on the first packet of the precinct.
        if progression.layer_num == 0 {
            precinct.inclusion_tree.reset_for_encoding();
            precinct.zero_bitplane_tree.reset_for_encoding();

            for block in &precinct.code_blocks {
                let (first_layer, zero_planes) = match &block.encoded {
                    Some(e) if e.num_passes > 0 => (0, e.zero_bitplanes as u32),
                    _ => (num_layers as u32, 0),
                };
                precinct
                    .inclusion_tree
                    .set_value(block.x_idx, block.y_idx, first_layer);
                precinct
                    .zero_bitplane_tree
                    .set_value(block.x_idx, block.y_idx, zero_planes);
            }
        }

        for block_index in 0..precinct.code_blocks.len() {
            let block = &precinct.code_blocks[block_index];
            let contributes = block.encoded.as_ref().is_some_and(|e| e.num_passes > 0)
                && !block.has_been_included;

            if block.has_been_included {
                // Previously included blocks signal continuation with
                // a single bit; the single-layer writer never
                // revisits them.
                writer.write(0, 1);
                continue;
            }

            let (x_idx, y_idx) = (block.x_idx, block.y_idx);
            precinct.inclusion_tree.encode(
                x_idx,
                y_idx,
                progression.layer_num as u32 + 1,
                &mut writer,
            );

            if !contributes {
                continue;
            }

            let (zero_planes, num_passes, byte_len) = {
                let encoded = precinct.code_blocks[block_index].encoded.as_ref().unwrap();
                (
                    encoded.zero_bitplanes as u32,
                    encoded.num_passes,
                    encoded.data.len() as u32,
                )
            };

            precinct
                .zero_bitplane_tree
                .encode(x_idx, y_idx, zero_planes + 1, &mut writer);

            writer.put_num_passes(num_passes);

            // Raise Lblock until the byte count fits.
            let block = &mut precinct.code_blocks[block_index];
            let length_bits_for = |l_block: u32| l_block + floor_log2(num_passes);
            let mut k = 0;
            while byte_len >= (1u32 << length_bits_for(block.l_block + k)) {
                k += 1;
            }
            writer.put_comma_code(k);
            block.l_block += k;

            writer.write(byte_len, length_bits_for(block.l_block));

            block.has_been_included = true;
            bodies.push((band_index, block_index));
        }
    }

    out.write_bytes(&writer.flush());

    for (band_index, block_index) in bodies {
        let band = &tc.resolutions[resolution].bands[band_index];
        let block = &band.precincts[precinct_index].code_blocks[block_index];
        out.write_bytes(&block.encoded.as_ref().unwrap().data);
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codestream::{
        CodeBlockStyle, CodingStyleComponent, CodingStyleFlags, CodingStyleParameters,
        ComponentSizeInfo, QuantizationInfo, QuantizationStyle, StepSize, WaveletTransform,
    };
    use crate::bitplane::EncodedBlock;
    use crate::rect::Rect;

    fn component_info() -> ComponentInfo {
        ComponentInfo {
            size_info: ComponentSizeInfo {
                precision: 8,
                is_signed: false,
                horizontal_resolution: 1,
                vertical_resolution: 1,
            },
            coding_style: CodingStyleComponent {
                flags: CodingStyleFlags::from_u8(0),
                parameters: CodingStyleParameters {
                    num_decomposition_levels: 1,
                    num_resolution_levels: 2,
                    code_block_width: 5,
                    code_block_height: 5,
                    code_block_style: CodeBlockStyle::default(),
                    transformation: WaveletTransform::Reversible53,
                    precinct_exponents: vec![(15, 15); 2],
                },
            },
            quantization: QuantizationInfo {
                quantization_style: QuantizationStyle::NoQuantization,
                guard_bits: 2,
                step_sizes: (0..4)
                    .map(|_| StepSize {
                        mantissa: 0,
                        exponent: 9,
                    })
                    .collect(),
            },
        }
    }

    /// Encode a packet with two contributing blocks, decode it back
    /// and compare the recovered lengths and pass counts.
    #[test]
    fn packet_header_round_trip() {
        let info = component_info();
        let tile_rect = Rect::from_ltrb(0, 0, 128, 64);

        let build = || TileComponent::build(tile_rect, &info, 0).unwrap();

        let mut encoder_tc = build();

        // Attach encoded data to two blocks of the LL band.
        let payload_a: Vec<u8> = (0..47).map(|i| i as u8).collect();
        let payload_b: Vec<u8> = (0..260).map(|i| (i * 3) as u8).collect();

        {
            let blocks = &mut encoder_tc.resolutions[0].bands[0].precincts[0].code_blocks;
            assert!(blocks.len() >= 2);
            blocks[0].encoded = Some(EncodedBlock {
                data: payload_a.clone(),
                num_passes: 4,
                zero_bitplanes: 3,
            });
            blocks[1].encoded = Some(EncodedBlock {
                data: payload_b.clone(),
                num_passes: 10,
                zero_bitplanes: 0,
            });
        }

        let progression = ProgressionData {
            layer_num: 0,
            resolution: 0,
            component: 0,
            precinct: 0,
        };

        let mut out = Writer::new();
        encode_packet(&mut out, &mut encoder_tc, progression, 1).unwrap();
        let packet = out.finish();

        let mut decoder_tc = vec![build()];
        let infos = vec![info];

        decode_tile_packets(&[packet.as_slice()], None, &[progression], &mut decoder_tc, &infos).unwrap();

        let blocks = &decoder_tc[0].resolutions[0].bands[0].precincts[0].code_blocks;

        assert!(blocks[0].has_been_included);
        assert_eq!(blocks[0].missing_bit_planes, 3);
        assert_eq!(blocks[0].num_passes, 4);
        assert_eq!(blocks[0].chunks.len(), 1);
        assert_eq!(blocks[0].chunks[0].passes, 4);
        assert_eq!(blocks[0].chunks[0].data, payload_a);

        assert!(blocks[1].has_been_included);
        assert_eq!(blocks[1].missing_bit_planes, 0);
        assert_eq!(blocks[1].num_passes, 10);
        assert_eq!(blocks[1].chunks[0].data, payload_b);

        // The remaining blocks stayed untouched.
        for block in &blocks[2..] {
            assert!(!block.has_been_included);
            assert!(block.chunks.is_empty());
        }
    }

    /// An empty packet is a single zero bit padded to one byte.
    #[test]
    fn empty_packet() {
        let info = component_info();
        let tile_rect = Rect::from_ltrb(0, 0, 32, 32);
        let mut tc = TileComponent::build(tile_rect, &info, 0).unwrap();

        let progression = ProgressionData {
            layer_num: 0,
            resolution: 1,
            component: 0,
            precinct: 0,
        };

        let mut out = Writer::new();
        encode_packet(&mut out, &mut tc, progression, 1).unwrap();
        let packet = out.finish();
        assert_eq!(packet, vec![0x00]);

        let mut decoder_tc = vec![TileComponent::build(tile_rect, &info, 0).unwrap()];
        let infos = vec![info];
        decode_tile_packets(&[packet.as_slice()], None, &[progression], &mut decoder_tc, &infos).unwrap();

        for band in &decoder_tc[0].resolutions[1].bands {
            for block in &band.precincts[0].code_blocks {
                assert!(!block.has_been_included);
            }
        }
    }
}
