//! Error types for JPEG 2000 encoding and decoding.

use core::fmt;

/// The main error type for codec operations.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Error {
    /// Errors related to the byte-level stream abstraction.
    Io(IoError),
    /// Errors related to codestream markers.
    Marker(MarkerError),
    /// Errors related to packet headers and bodies.
    Packet(PacketError),
    /// Errors related to parameter validation.
    Validation(ValidationError),
    /// Errors related to geometry and buffer arithmetic.
    Geometry(GeometryError),
    /// Errors related to the code-block entropy codec.
    Block(BlockError),
}

/// Errors related to the byte-level stream abstraction.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IoError {
    /// Read past the end of the underlying stream.
    UnexpectedEof,
    /// A seek target outside the stream bounds.
    InvalidSeek,
    /// The underlying host stream reported a failure.
    Host,
}

/// Errors related to codestream markers.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MarkerError {
    /// An invalid marker word was encountered. Carries the full 16-bit
    /// marker, e.g. `0xFFA0`.
    Invalid(u16),
    /// A syntactically valid marker appeared where it is not allowed.
    Unexpected(u16),
    /// Markers appeared in an order the codestream grammar forbids.
    OutOfOrder,
    /// A required marker is missing.
    Missing(&'static str),
    /// A marker segment could not be parsed.
    ParseFailure(&'static str),
}

/// Errors related to packet headers and bodies.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PacketError {
    /// The packet header ended before all expected bits were read.
    TruncatedHeader,
    /// The packet body ended before all signalled bytes were read.
    TruncatedBody,
    /// A tag-tree walk addressed a leaf outside the tree.
    InvalidTagTreeIndex,
    /// The signalled number of coding passes is outside 1..=164.
    InvalidPassCount,
}

/// Errors related to parameter validation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ValidationError {
    /// A coding or image parameter is outside its legal range.
    InvalidParameter(&'static str),
    /// A legal but unimplemented codestream feature was requested.
    Unsupported(&'static str),
    /// Invalid image dimensions.
    InvalidDimensions,
    /// Invalid tile or image offsets.
    InvalidOffsets,
    /// Invalid tile index in a tile-part header.
    InvalidTileIndex,
    /// PPT marker present when a PPM marker exists in the main header.
    PpmPptConflict,
    /// Invalid progression order.
    InvalidProgressionOrder,
    /// Invalid quantization style.
    InvalidQuantizationStyle,
    /// Not enough quantization step sizes provided in the header.
    InsufficientStepSizes,
}

/// Errors related to geometry and buffer arithmetic.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GeometryError {
    /// Precinct-aligned resolution bounds exceed the 32-bit coordinate
    /// space.
    Overflow,
    /// A buffer allocation would exceed the configured memory limits.
    OutOfMemory,
    /// A sparse-buffer region is empty or outside the plane.
    InvalidRegion,
}

/// Errors related to the code-block entropy codec.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BlockError {
    /// The block codec failed to encode or decode a code-block.
    CodecFailure,
    /// Number of bit-planes in a code-block is too large.
    TooManyBitplanes,
    /// Mismatch between the signalled pass count and bit-plane count.
    InvalidPassStructure,
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Io(e) => write!(f, "{e}"),
            Self::Marker(e) => write!(f, "{e}"),
            Self::Packet(e) => write!(f, "{e}"),
            Self::Validation(e) => write!(f, "{e}"),
            Self::Geometry(e) => write!(f, "{e}"),
            Self::Block(e) => write!(f, "{e}"),
        }
    }
}

impl fmt::Display for IoError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::UnexpectedEof => write!(f, "unexpected end of stream"),
            Self::InvalidSeek => write!(f, "seek outside stream bounds"),
            Self::Host => write!(f, "host stream failure"),
        }
    }
}

impl fmt::Display for MarkerError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Invalid(m) => write!(f, "invalid marker 0x{m:04X}"),
            Self::Unexpected(m) => write!(f, "unexpected marker 0x{m:04X}"),
            Self::OutOfOrder => write!(f, "codestream markers out of order"),
            Self::Missing(marker) => write!(f, "missing {marker} marker"),
            Self::ParseFailure(marker) => write!(f, "failed to parse {marker} marker"),
        }
    }
}

impl fmt::Display for PacketError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::TruncatedHeader => write!(f, "truncated packet header"),
            Self::TruncatedBody => write!(f, "truncated packet body"),
            Self::InvalidTagTreeIndex => write!(f, "tag-tree index out of bounds"),
            Self::InvalidPassCount => write!(f, "invalid number of coding passes"),
        }
    }
}

impl fmt::Display for ValidationError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::InvalidParameter(what) => write!(f, "invalid parameter: {what}"),
            Self::Unsupported(what) => write!(f, "unsupported feature: {what}"),
            Self::InvalidDimensions => write!(f, "invalid image dimensions"),
            Self::InvalidOffsets => write!(f, "invalid tile or image offsets"),
            Self::InvalidTileIndex => write!(f, "invalid tile index in tile-part header"),
            Self::PpmPptConflict => {
                write!(
                    f,
                    "PPT marker present when PPM marker exists in main header"
                )
            }
            Self::InvalidProgressionOrder => write!(f, "invalid progression order"),
            Self::InvalidQuantizationStyle => write!(f, "invalid quantization style"),
            Self::InsufficientStepSizes => {
                write!(f, "not enough quantization step sizes in header")
            }
        }
    }
}

impl fmt::Display for GeometryError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Overflow => write!(f, "coordinate arithmetic overflowed 32 bits"),
            Self::OutOfMemory => write!(f, "buffer allocation exceeds memory limits"),
            Self::InvalidRegion => write!(f, "region is empty or outside the plane"),
        }
    }
}

impl fmt::Display for BlockError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::CodecFailure => write!(f, "code-block codec failure"),
            Self::TooManyBitplanes => write!(f, "number of bit-planes is too large"),
            Self::InvalidPassStructure => {
                write!(f, "mismatch between coding passes and bit-planes")
            }
        }
    }
}

impl std::error::Error for Error {}
impl std::error::Error for IoError {}
impl std::error::Error for MarkerError {}
impl std::error::Error for PacketError {}
impl std::error::Error for ValidationError {}
impl std::error::Error for GeometryError {}
impl std::error::Error for BlockError {}

impl From<IoError> for Error {
    fn from(e: IoError) -> Self {
        Self::Io(e)
    }
}

impl From<MarkerError> for Error {
    fn from(e: MarkerError) -> Self {
        Self::Marker(e)
    }
}

impl From<PacketError> for Error {
    fn from(e: PacketError) -> Self {
        Self::Packet(e)
    }
}

impl From<ValidationError> for Error {
    fn from(e: ValidationError) -> Self {
        Self::Validation(e)
    }
}

impl From<GeometryError> for Error {
    fn from(e: GeometryError) -> Self {
        Self::Geometry(e)
    }
}

impl From<BlockError> for Error {
    fn from(e: BlockError) -> Self {
        Self::Block(e)
    }
}

/// Result type for codec operations.
pub type Result<T> = core::result::Result<T, Error>;

macro_rules! bail {
    ($err:expr) => {
        return Err($err.into())
    };
}

macro_rules! err {
    ($err:expr) => {
        Err($err.into())
    };
}

pub(crate) use bail;
pub(crate) use err;
