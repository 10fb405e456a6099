//! The tile cache: decoded tiles keyed by tile index, composed into a
//! single output image under a retention strategy.

use crate::image::Image;
use std::collections::BTreeMap;

/// Which decoded tiles stay resident after their samples have been
/// composed into the output image.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum TileCacheStrategy {
    /// Evict immediately after composition; suited to streaming
    /// consumption.
    None,
    /// Retain only the most recently decoded tile.
    LastTile,
    /// Retain every tile. Required when the composite is rebuilt
    /// incrementally across several decode calls.
    #[default]
    AllTiles,
}

/// One cache slot: the tile's transient compute state and its decoded
/// image, if retained.
#[derive(Debug)]
pub(crate) struct TileCacheEntry {
    pub(crate) processor: Option<crate::decode::TileProcessor>,
    pub(crate) image: Option<Image>,
}

/// Maps tile index to entry and owns the composite output image.
#[derive(Debug)]
pub(crate) struct TileCache {
    strategy: TileCacheStrategy,
    entries: BTreeMap<u16, TileCacheEntry>,
    composite: Option<Image>,
}

impl TileCache {
    pub(crate) fn new(strategy: TileCacheStrategy) -> Self {
        Self {
            strategy,
            entries: BTreeMap::new(),
            composite: None,
        }
    }

    pub(crate) fn set_composite(&mut self, image: Image) {
        self.composite = Some(image);
    }

    pub(crate) fn composite(&self) -> Option<&Image> {
        self.composite.as_ref()
    }

    pub(crate) fn take_composite(&mut self) -> Option<Image> {
        self.composite.take()
    }

    pub(crate) fn get(&self, tile_index: u16) -> Option<&TileCacheEntry> {
        self.entries.get(&tile_index)
    }

    /// Compose a decoded tile into the composite image and retain its
    /// entry according to the strategy.
    pub(crate) fn put(&mut self, tile_index: u16, entry: TileCacheEntry) {
        if let (Some(composite), Some(tile_image)) = (&mut self.composite, &entry.image) {
            compose(composite, tile_image);
        }

        match self.strategy {
            TileCacheStrategy::None => {}
            TileCacheStrategy::LastTile => {
                self.entries.clear();
                self.entries.insert(tile_index, entry);
            }
            TileCacheStrategy::AllTiles => {
                self.entries.insert(tile_index, entry);
            }
        }
    }

    /// Drop one entry.
    pub(crate) fn flush(&mut self, tile_index: u16) {
        self.entries.remove(&tile_index);
    }
}

/// Copy the component rectangles of `tile` into `composite` at their
/// absolute positions; areas outside the composite are clipped.
fn compose(composite: &mut Image, tile: &Image) {
    for (dst, src) in composite.components.iter_mut().zip(&tile.components) {
        let overlap = dst.rect.intersect(src.rect);
        if overlap.is_empty() {
            continue;
        }

        let (dst_rect, dst_width) = (dst.rect, dst.rect.width() as usize);
        let src_width = src.rect.width() as usize;

        for y in overlap.y0..overlap.y1 {
            let dst_base =
                (y - dst_rect.y0) as usize * dst_width + (overlap.x0 - dst_rect.x0) as usize;
            let src_base =
                (y - src.rect.y0) as usize * src_width + (overlap.x0 - src.rect.x0) as usize;
            let count = overlap.width() as usize;

            dst.data[dst_base..dst_base + count]
                .copy_from_slice(&src.data[src_base..src_base + count]);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::image::{ColorSpace, Image, ImageComponent};
    use crate::rect::Rect;

    fn tile_image(rect: Rect, value: i32) -> Image {
        Image {
            canvas: rect,
            color_space: ColorSpace::Gray,
            components: vec![ImageComponent {
                precision: 8,
                is_signed: false,
                dx: 1,
                dy: 1,
                rect,
                data: vec![value; rect.area() as usize],
            }],
        }
    }

    fn entry(image: Image) -> TileCacheEntry {
        TileCacheEntry {
            processor: None,
            image: Some(image),
        }
    }

    #[test]
    fn strategies_govern_retention() {
        for (strategy, expect_first, expect_second) in [
            (TileCacheStrategy::None, false, false),
            (TileCacheStrategy::LastTile, false, true),
            (TileCacheStrategy::AllTiles, true, true),
        ] {
            let mut cache = TileCache::new(strategy);
            cache.set_composite(tile_image(Rect::from_ltrb(0, 0, 16, 8), 0));

            cache.put(0, entry(tile_image(Rect::from_ltrb(0, 0, 8, 8), 1)));
            cache.put(1, entry(tile_image(Rect::from_ltrb(8, 0, 16, 8), 2)));

            assert_eq!(cache.get(0).is_some(), expect_first, "{strategy:?}");
            assert_eq!(cache.get(1).is_some(), expect_second, "{strategy:?}");
        }
    }

    #[test]
    fn tiles_compose_at_their_canvas_position() {
        let mut cache = TileCache::new(TileCacheStrategy::None);
        cache.set_composite(tile_image(Rect::from_ltrb(0, 0, 16, 8), 0));

        cache.put(0, entry(tile_image(Rect::from_ltrb(0, 0, 8, 8), 1)));
        cache.put(1, entry(tile_image(Rect::from_ltrb(8, 0, 16, 8), 2)));

        let composite = cache.composite().unwrap();
        let data = &composite.components[0].data;

        for y in 0..8 {
            for x in 0..16 {
                let expected = if x < 8 { 1 } else { 2 };
                assert_eq!(data[y * 16 + x], expected, "({x}, {y})");
            }
        }
    }

    #[test]
    fn flush_drops_a_single_entry() {
        let mut cache = TileCache::new(TileCacheStrategy::AllTiles);
        cache.set_composite(tile_image(Rect::from_ltrb(0, 0, 16, 8), 0));
        cache.put(0, entry(tile_image(Rect::from_ltrb(0, 0, 8, 8), 1)));
        cache.put(1, entry(tile_image(Rect::from_ltrb(8, 0, 16, 8), 2)));

        cache.flush(0);
        assert!(cache.get(0).is_none());
        assert!(cache.get(1).is_some());
    }
}
