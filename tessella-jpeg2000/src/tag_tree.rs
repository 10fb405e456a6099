//! The tag tree, described in Section B.10.2.
//!
//! A tag tree represents a grid of small integers as a pyramid of
//! reduced-resolution minima: level 0 is a single root, and each
//! further level doubles the grid (rounding up) until the leaf grid is
//! reached, every node holding the minimum of the leaves it covers.
//! Packet headers use two per precinct, for the first-inclusion layer
//! and the missing-bit-plane count of each code block. Both sides
//! evaluate the pyramid lazily: a node only costs bits the first time
//! a walk crosses it, and only up to the threshold the current packet
//! needs.
//!
//! The pyramid is stored as flat per-level grids; the ancestor of a
//! leaf at any level is found by shifting its coordinates, so no
//! child or parent links are materialised.

use crate::bit_io::{BitReader, BitWriter};
use crate::error::{Error, PacketError, bail};
use crate::log::lwarn;

#[derive(Debug, Clone, Copy)]
struct TagNode {
    /// Decoder: the running threshold counter, the true value once
    /// `known`. Encoder: the minimum over the covered leaves.
    value: u32,
    /// Encoder: the threshold this node has been signalled up to.
    low: u32,
    /// Whether the value is fully signalled.
    known: bool,
}

const FRESH: TagNode = TagNode {
    value: 0,
    low: 0,
    known: false,
};

/// One reduced-resolution grid of the pyramid.
#[derive(Debug, Clone)]
struct TagLevel {
    width: u32,
    nodes: Vec<TagNode>,
}

impl TagLevel {
    fn node_mut(&mut self, x: u32, y: u32) -> &mut TagNode {
        &mut self.nodes[(y * self.width + x) as usize]
    }
}

#[derive(Debug, Clone)]
pub(crate) struct TagTree {
    width: u32,
    height: u32,
    /// `levels[0]` is the root; the last level is the leaf grid.
    levels: Vec<TagLevel>,
}

impl TagTree {
    pub(crate) fn new(width: u32, height: u32) -> Self {
        let mut levels = Vec::new();

        if width > 0 && height > 0 {
            let depth = 1 + u32::max(
                width.next_power_of_two().ilog2(),
                height.next_power_of_two().ilog2(),
            );

            for k in 0..depth {
                let shift = depth - 1 - k;
                let w = width.div_ceil(1 << shift);
                let h = height.div_ceil(1 << shift);
                levels.push(TagLevel {
                    width: w,
                    nodes: vec![FRESH; (w * h) as usize],
                });
            }
        }

        Self {
            width,
            height,
            levels,
        }
    }

    /// Reset to the pristine encoder state. Every leaf must be set via
    /// [`set_value`](Self::set_value) before encoding.
    pub(crate) fn reset_for_encoding(&mut self) {
        for level in &mut self.levels {
            for node in &mut level.nodes {
                node.value = u32::MAX;
                node.low = 0;
                node.known = false;
            }
        }
    }

    /// Record the true value of leaf `(x, y)`. Every ancestor keeps
    /// the minimum of the leaves below it.
    pub(crate) fn set_value(&mut self, x: u32, y: u32, value: u32) {
        debug_assert!(x < self.width && y < self.height);

        let depth = self.levels.len();
        for (k, level) in self.levels.iter_mut().enumerate() {
            let shift = depth - 1 - k;
            let node = level.node_mut(x >> shift, y >> shift);
            node.value = u32::min(node.value, value);
        }
    }

    /// Emit the bits that let a decoder conclude whether the value of
    /// leaf `(x, y)` is below `threshold`. Bits already implied by
    /// earlier walks are not repeated.
    pub(crate) fn encode(&mut self, x: u32, y: u32, threshold: u32, writer: &mut BitWriter) {
        debug_assert!(x < self.width && y < self.height);

        let depth = self.levels.len();
        // The threshold ancestors have already established; a node
        // never signals below it.
        let mut floor = 0;

        for (k, level) in self.levels.iter_mut().enumerate() {
            let shift = depth - 1 - k;
            let node = level.node_mut(x >> shift, y >> shift);

            node.low = u32::max(node.low, floor);
            while node.low < threshold {
                if node.low >= node.value {
                    if !node.known {
                        writer.write(1, 1);
                        node.known = true;
                    }
                    break;
                }
                writer.write(0, 1);
                node.low += 1;
            }
            floor = node.low;
        }
    }

    /// Walk from the root towards leaf `(x, y)`, consuming bits until
    /// the leaf value is known or provably at least `threshold`.
    /// Returns the deepest value established.
    pub(crate) fn read(
        &mut self,
        x: u32,
        y: u32,
        reader: &mut BitReader<'_>,
        threshold: u32,
    ) -> Result<u32, Error> {
        if x >= self.width || y >= self.height {
            lwarn!(
                "attempted to read invalid index x: {}, y: {} in tag tree with dimensions {}x{}",
                x,
                y,
                self.width,
                self.height
            );

            bail!(PacketError::InvalidTagTreeIndex);
        }

        let depth = self.levels.len();
        let mut floor = 0;

        for (k, level) in self.levels.iter_mut().enumerate() {
            let shift = depth - 1 - k;
            let node = level.node_mut(x >> shift, y >> shift);

            // Resume counting from whatever the ancestors established.
            node.value = u32::max(node.value, floor);

            // A 0 bit raises the minimum by one; a 1 bit pins it.
            while !node.known && node.value < threshold {
                if reader.read(1)? == 1 {
                    node.known = true;
                } else {
                    node.value += 1;
                }
            }

            if node.value >= threshold {
                // Nothing below this node can be smaller.
                return Ok(node.value);
            }
            floor = node.value;
        }

        Ok(floor)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    /// The example from B.10.2, in its extended form as shown in the
    /// "JPEG2000 Standard for Image compression" book.
    #[test]
    fn decode_standard_example() {
        let mut tree = TagTree::new(6, 3);

        let mut writer = BitWriter::new();
        for bit in [
            0, 1, 1, 1, 1, // q3(0, 0)
            0, 0, 1, // q3(1, 0)
            1, 0, 1, // q3(2, 0)
            0, 0, 1, // q3(3, 0)
            1, 0, 1, 1, // q3(4, 0)
        ] {
            writer.write(bit, 1);
        }
        let buf = writer.flush();

        let mut reader = BitReader::new(&buf);

        assert_eq!(tree.read(0, 0, &mut reader, u32::MAX).unwrap(), 1);
        assert_eq!(tree.read(1, 0, &mut reader, u32::MAX).unwrap(), 3);
        assert_eq!(tree.read(2, 0, &mut reader, u32::MAX).unwrap(), 2);
        assert_eq!(tree.read(3, 0, &mut reader, u32::MAX).unwrap(), 3);
        assert_eq!(tree.read(4, 0, &mut reader, u32::MAX).unwrap(), 2);
    }

    /// Inclusion tag tree from Table B.5.
    #[test]
    fn decode_partial_inclusion() {
        let mut tree = TagTree::new(3, 2);

        let mut writer = BitWriter::new();
        for bit in [
            1, 1, 1, // code-block (0, 0) included for the first time
            1, // code-block (1, 0) included for the first time
            0, // code-block (2, 0) not yet included
            0, // code-block (0, 1) not yet included
            0, // code-block (1, 1) not yet included
               // code-block (2, 1): no data needed, already conveyed
               // by the partial walk for code-block (2, 0)
        ] {
            writer.write(bit, 1);
        }
        let buf = writer.flush();

        let mut reader = BitReader::new(&buf);
        let next_layer = 1;

        assert_eq!(tree.read(0, 0, &mut reader, next_layer).unwrap(), 0);
        assert_eq!(tree.read(1, 0, &mut reader, next_layer).unwrap(), 0);
        assert_eq!(tree.read(2, 0, &mut reader, next_layer).unwrap(), 1);
        assert_eq!(tree.read(0, 1, &mut reader, next_layer).unwrap(), 1);
        assert_eq!(tree.read(1, 1, &mut reader, next_layer).unwrap(), 1);
        assert_eq!(tree.read(2, 1, &mut reader, next_layer).unwrap(), 1);
    }

    /// The pyramid grids shrink by ceil-halving up to a single root.
    #[test]
    fn level_dimensions() {
        let tree = TagTree::new(6, 3);

        let dims: Vec<(u32, u32)> = tree
            .levels
            .iter()
            .map(|l| (l.width, l.nodes.len() as u32 / l.width))
            .collect();

        assert_eq!(dims, vec![(1, 1), (2, 1), (3, 2), (6, 3)]);
    }

    /// Encoding then decoding with layer-style threshold sweeps must
    /// reproduce the leaf values.
    #[test]
    fn encode_decode_round_trip() {
        let width = 6;
        let height = 3;
        let values = [
            1u32, 3, 2, 3, 2, 1, //
            0, 4, 1, 2, 5, 3, //
            2, 2, 0, 1, 3, 2,
        ];
        let max = 6;

        let mut encoder = TagTree::new(width, height);
        encoder.reset_for_encoding();
        for y in 0..height {
            for x in 0..width {
                encoder.set_value(x, y, values[(y * width + x) as usize]);
            }
        }

        let mut writer = BitWriter::new();
        for threshold in 1..=max {
            for y in 0..height {
                for x in 0..width {
                    encoder.encode(x, y, threshold, &mut writer);
                }
            }
        }
        let buf = writer.flush();

        let mut decoder = TagTree::new(width, height);
        let mut reader = BitReader::new(&buf);
        let mut decoded = [u32::MAX; 18];

        for threshold in 1..=max {
            for y in 0..height {
                for x in 0..width {
                    let idx = (y * width + x) as usize;
                    let val = decoder.read(x, y, &mut reader, threshold).unwrap();
                    if val < threshold {
                        decoded[idx] = u32::min(decoded[idx], val);
                    }
                }
            }
        }

        assert_eq!(&decoded[..], &values[..]);
    }
}
