//! Block-backed sparse 2-D buffers.
//!
//! A sparse buffer models a large logical plane of which only a few
//! regions are ever touched: storage is allocated per block of
//! `2^BX x 2^BY` elements on first write. Regions never written read
//! back as zero. Windowed decoding uses one such plane per
//! tile-component, sized to the top resolution, so that only code
//! blocks intersecting the requested window cost memory.
//!
//! Strides are in elements and non-negative; transposed access is done
//! with explicit per-column reads.

use crate::error::{Error, GeometryError, bail};
use crate::rect::Rect;

/// Element type stored by a [`SparseBuffer`].
pub(crate) trait Sample: Copy + Default {}

impl Sample for i32 {}
impl Sample for f32 {}

#[derive(Debug)]
pub(crate) struct SparseBuffer<T, const BX: u32, const BY: u32> {
    width: u32,
    height: u32,
    grid_width: u32,
    grid_height: u32,
    blocks: Vec<Option<Box<[T]>>>,
}

impl<T: Sample, const BX: u32, const BY: u32> SparseBuffer<T, BX, BY> {
    const BLOCK_WIDTH: u32 = 1 << BX;
    const BLOCK_HEIGHT: u32 = 1 << BY;

    pub(crate) fn new(width: u32, height: u32) -> Result<Self, Error> {
        if width == 0 || height == 0 {
            bail!(GeometryError::InvalidRegion);
        }

        let grid_width = width.div_ceil(Self::BLOCK_WIDTH);
        let grid_height = height.div_ceil(Self::BLOCK_HEIGHT);

        let Some(total) = (grid_width as u64).checked_mul(grid_height as u64) else {
            bail!(GeometryError::Overflow);
        };
        if total > u32::MAX as u64 {
            bail!(GeometryError::OutOfMemory);
        }

        let mut blocks = Vec::new();
        if blocks.try_reserve_exact(total as usize).is_err() {
            bail!(GeometryError::OutOfMemory);
        }
        blocks.resize_with(total as usize, || None);

        Ok(Self {
            width,
            height,
            grid_width,
            grid_height,
            blocks,
        })
    }

    fn is_region_valid(&self, r: Rect) -> bool {
        r.x0 < r.x1 && r.y0 < r.y1 && r.x1 <= self.width && r.y1 <= self.height
    }

    fn block_index(&self, bx: u32, by: u32) -> usize {
        (by * self.grid_width + bx) as usize
    }

    #[cfg(test)]
    pub(crate) fn block_is_allocated(&self, bx: u32, by: u32) -> bool {
        self.blocks[self.block_index(bx, by)].is_some()
    }

    /// Ensure every block intersecting `region` is allocated.
    /// Idempotent.
    pub(crate) fn alloc(&mut self, region: Rect) -> Result<(), Error> {
        if !self.is_region_valid(region) {
            bail!(GeometryError::InvalidRegion);
        }

        for by in region.y0 >> BY..=(region.y1 - 1) >> BY {
            for bx in region.x0 >> BX..=(region.x1 - 1) >> BX {
                let idx = self.block_index(bx, by);
                if self.blocks[idx].is_none() {
                    self.blocks[idx] = Some(Self::zeroed_block()?);
                }
            }
        }

        Ok(())
    }

    fn zeroed_block() -> Result<Box<[T]>, Error> {
        let len = (Self::BLOCK_WIDTH * Self::BLOCK_HEIGHT) as usize;
        let mut block = Vec::new();
        if block.try_reserve_exact(len).is_err() {
            bail!(GeometryError::OutOfMemory);
        }
        block.resize(len, T::default());

        Ok(block.into_boxed_slice())
    }

    /// Visit the intersection of `region` with each block it touches.
    /// The callback receives the sub-rectangle and the matching block
    /// coordinates.
    fn for_each_block(region: Rect, mut visit: impl FnMut(Rect, u32, u32) -> Result<(), Error>) -> Result<(), Error> {
        let mut y = region.y0;
        while y < region.y1 {
            let by = y >> BY;
            let y_end = u32::min((by + 1) << BY, region.y1);

            let mut x = region.x0;
            while x < region.x1 {
                let bx = x >> BX;
                let x_end = u32::min((bx + 1) << BX, region.x1);

                visit(Rect::from_ltrb(x, y, x_end, y_end), bx, by)?;

                x = x_end;
            }

            y = y_end;
        }

        Ok(())
    }

    /// Read `region` into `dest`. Elements of untouched blocks read as
    /// zero. `dest[(y - y0) * line_stride + (x - x0) * col_stride]`
    /// receives the element at `(x, y)`.
    ///
    /// An invalid region fails with `InvalidRegion` unless `forgiving`
    /// is set, in which case the call is a no-op.
    pub(crate) fn read(
        &self,
        region: Rect,
        dest: &mut [T],
        col_stride: u32,
        line_stride: u32,
        forgiving: bool,
    ) -> Result<(), Error> {
        if !self.is_region_valid(region) {
            if forgiving {
                return Ok(());
            }
            bail!(GeometryError::InvalidRegion);
        }

        Self::for_each_block(region, |part, bx, by| {
            let block = &self.blocks[self.block_index(bx, by)];

            for y in part.y0..part.y1 {
                let dest_base =
                    ((y - region.y0) * line_stride + (part.x0 - region.x0) * col_stride) as usize;

                match block {
                    Some(block) => {
                        let row_base = ((y - (by << BY)) * Self::BLOCK_WIDTH
                            + (part.x0 - (bx << BX))) as usize;
                        let src = &block[row_base..row_base + part.width() as usize];

                        if col_stride == 1 {
                            dest[dest_base..dest_base + src.len()].copy_from_slice(src);
                        } else {
                            for (k, v) in src.iter().enumerate() {
                                dest[dest_base + k * col_stride as usize] = *v;
                            }
                        }
                    }
                    None => {
                        for k in 0..part.width() as usize {
                            dest[dest_base + k * col_stride as usize] = T::default();
                        }
                    }
                }
            }

            Ok(())
        })
    }

    /// Write `region` from `src`, allocating missing blocks first.
    /// Stride semantics mirror [`read`](Self::read).
    pub(crate) fn write(
        &mut self,
        region: Rect,
        src: &[T],
        col_stride: u32,
        line_stride: u32,
        forgiving: bool,
    ) -> Result<(), Error> {
        if !self.is_region_valid(region) {
            if forgiving {
                return Ok(());
            }
            bail!(GeometryError::InvalidRegion);
        }

        Self::for_each_block(region, |part, bx, by| {
            let idx = self.block_index(bx, by);
            if self.blocks[idx].is_none() {
                self.blocks[idx] = Some(Self::zeroed_block()?);
            }
            let block = self.blocks[idx].as_mut().unwrap();

            for y in part.y0..part.y1 {
                let src_base =
                    ((y - region.y0) * line_stride + (part.x0 - region.x0) * col_stride) as usize;
                let row_base =
                    ((y - (by << BY)) * Self::BLOCK_WIDTH + (part.x0 - (bx << BX))) as usize;
                let dest = &mut block[row_base..row_base + part.width() as usize];

                if col_stride == 1 {
                    dest.copy_from_slice(&src[src_base..src_base + dest.len()]);
                } else {
                    for (k, v) in dest.iter_mut().enumerate() {
                        *v = src[src_base + k * col_stride as usize];
                    }
                }
            }

            Ok(())
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    type Buffer = SparseBuffer<i32, 6, 6>;

    #[test]
    fn untouched_regions_read_zero() {
        let sa = Buffer::new(256, 256).unwrap();

        // A region spanning two adjacent blocks, never written.
        let region = Rect::from_ltrb(32, 0, 96, 16);
        let mut dest = vec![7; region.area() as usize];
        sa.read(region, &mut dest, 1, region.width(), false).unwrap();

        assert!(dest.iter().all(|&v| v == 0));
        // Reading must not allocate.
        assert!(!sa.block_is_allocated(0, 0));
        assert!(!sa.block_is_allocated(1, 0));
    }

    #[test]
    fn write_then_read_round_trip() {
        let mut sa = Buffer::new(200, 150).unwrap();

        // A region crossing block boundaries in both directions.
        let region = Rect::from_ltrb(60, 60, 140, 70);
        let src: Vec<i32> = (0..region.area() as i32).collect();
        sa.write(region, &src, 1, region.width(), false).unwrap();

        let mut dest = vec![0; region.area() as usize];
        sa.read(region, &mut dest, 1, region.width(), false).unwrap();
        assert_eq!(src, dest);

        // Samples outside the written region are still zero.
        let outside = Rect::from_ltrb(0, 0, 60, 60);
        let mut dest = vec![1; outside.area() as usize];
        sa.read(outside, &mut dest, 1, outside.width(), false)
            .unwrap();
        assert!(dest.iter().all(|&v| v == 0));
    }

    #[test]
    fn writes_are_idempotent() {
        let mut sa = Buffer::new(128, 128).unwrap();
        let region = Rect::from_ltrb(10, 10, 90, 40);
        let src: Vec<i32> = (0..region.area() as i32).map(|v| v * 3).collect();

        sa.write(region, &src, 1, region.width(), false).unwrap();
        let mut first = vec![0; region.area() as usize];
        sa.read(region, &mut first, 1, region.width(), false)
            .unwrap();

        sa.write(region, &src, 1, region.width(), false).unwrap();
        let mut second = vec![0; region.area() as usize];
        sa.read(region, &mut second, 1, region.width(), false)
            .unwrap();

        assert_eq!(first, second);
    }

    #[test]
    fn alloc_is_idempotent() {
        let mut sa = Buffer::new(128, 128).unwrap();
        let region = Rect::from_ltrb(0, 0, 65, 65);

        sa.alloc(region).unwrap();
        sa.alloc(region).unwrap();

        assert!(sa.block_is_allocated(0, 0));
        assert!(sa.block_is_allocated(1, 1));
    }

    #[test]
    fn invalid_regions() {
        let mut sa = Buffer::new(64, 64).unwrap();
        let empty = Rect::from_ltrb(10, 10, 10, 20);
        let outside = Rect::from_ltrb(0, 0, 65, 10);

        let mut dest = vec![0; 128];
        for region in [empty, outside] {
            assert_eq!(
                sa.read(region, &mut dest, 1, 64, false),
                Err(Error::Geometry(GeometryError::InvalidRegion))
            );
            // Forgiving mode turns the failure into a no-op.
            sa.read(region, &mut dest, 1, 64, true).unwrap();
            sa.write(region, &dest, 1, 64, true).unwrap();
        }
    }

    #[test]
    fn column_strides() {
        let mut sa = Buffer::new(64, 64).unwrap();
        let region = Rect::from_ltrb(0, 0, 4, 4);
        let src: Vec<i32> = (0..16).collect();
        sa.write(region, &src, 1, 4, false).unwrap();

        // Read a single column with a line stride of 1, giving a
        // transposed view of the column.
        let column = Rect::from_ltrb(2, 0, 3, 4);
        let mut dest = vec![0; 4];
        sa.read(column, &mut dest, 1, 1, false).unwrap();
        assert_eq!(dest, vec![2, 6, 10, 14]);
    }
}
