//! The sample image interface: the plain raster the codec consumes
//! and produces.

use crate::error::{Result, ValidationError, bail};
use crate::rect::Rect;

/// Colour interpretation of the components.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ColorSpace {
    Srgb,
    Sycc,
    Eycc,
    Gray,
    Cmyk,
    /// An application-defined colour space tag.
    Custom(u32),
}

/// One image component: a row-major `i32` sample plane over the
/// component's rectangle.
#[derive(Debug, Clone)]
pub struct ImageComponent {
    /// Bit depth of the samples.
    pub precision: u8,
    /// Whether samples are signed.
    pub is_signed: bool,
    /// Horizontal sub-sampling with respect to the canvas.
    pub dx: u8,
    /// Vertical sub-sampling with respect to the canvas.
    pub dy: u8,
    /// The component rectangle: the canvas bounds divided by the
    /// sub-sampling, rounding the origin up.
    pub rect: Rect,
    /// Row-major samples covering `rect`.
    pub data: Vec<i32>,
}

impl ImageComponent {
    pub fn width(&self) -> u32 {
        self.rect.width()
    }

    pub fn height(&self) -> u32 {
        self.rect.height()
    }
}

/// A decoded or to-be-encoded image.
#[derive(Debug, Clone)]
pub struct Image {
    /// The image area on the reference grid; the origin need not be
    /// zero.
    pub canvas: Rect,
    pub color_space: ColorSpace,
    pub components: Vec<ImageComponent>,
}

impl Image {
    /// Create an image whose components all share the canvas size,
    /// precision and signedness, with samples zeroed.
    pub fn new(
        canvas: Rect,
        color_space: ColorSpace,
        num_components: u16,
        precision: u8,
        is_signed: bool,
    ) -> Result<Self> {
        if canvas.is_empty() {
            bail!(ValidationError::InvalidDimensions);
        }
        if num_components == 0 || precision == 0 || precision > 16 {
            bail!(ValidationError::InvalidParameter("component layout"));
        }

        let components = (0..num_components)
            .map(|_| ImageComponent {
                precision,
                is_signed,
                dx: 1,
                dy: 1,
                rect: canvas,
                data: vec![0; canvas.area() as usize],
            })
            .collect();

        Ok(Self {
            canvas,
            color_space,
            components,
        })
    }

    /// The component rectangle for the given sub-sampling over a
    /// canvas region.
    pub(crate) fn component_rect(canvas: Rect, dx: u8, dy: u8) -> Rect {
        Rect::from_ltrb(
            canvas.x0.div_ceil(dx as u32),
            canvas.y0.div_ceil(dy as u32),
            canvas.x1.div_ceil(dx as u32),
            canvas.y1.div_ceil(dy as u32),
        )
    }

    pub fn width(&self) -> u32 {
        self.canvas.width()
    }

    pub fn height(&self) -> u32 {
        self.canvas.height()
    }
}
