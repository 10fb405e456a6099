//! The byte-level host I/O abstraction.
//!
//! The codec itself operates on in-memory buffers; this module adapts
//! pull-based host streams (files, sockets already drained to a
//! buffer, memory) to that model. Reads are bounded and synchronous;
//! reading past the end surfaces [`IoError::UnexpectedEof`].

use crate::error::{IoError, Result, bail};

/// A bounded, seekable byte source.
pub trait Source {
    /// Read exactly `buf.len()` bytes into `buf`.
    fn read(&mut self, buf: &mut [u8]) -> Result<()>;
    /// Seek to an absolute byte position.
    fn seek(&mut self, pos: u64) -> Result<()>;
    /// The current byte position.
    fn tell(&self) -> u64;
    /// Total length of the source in bytes.
    fn len(&self) -> u64;

    /// Whether the source is empty.
    fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Drain the remaining bytes into a single buffer.
    fn read_to_end(&mut self) -> Result<Vec<u8>> {
        let remaining = (self.len() - self.tell()) as usize;
        let mut buf = vec![0; remaining];
        self.read(&mut buf)?;
        Ok(buf)
    }
}

/// A source over an in-memory byte slice.
#[derive(Debug)]
pub struct MemorySource<'a> {
    data: &'a [u8],
    pos: u64,
}

impl<'a> MemorySource<'a> {
    pub fn new(data: &'a [u8]) -> Self {
        Self { data, pos: 0 }
    }
}

impl Source for MemorySource<'_> {
    fn read(&mut self, buf: &mut [u8]) -> Result<()> {
        let start = self.pos as usize;
        let Some(src) = self.data.get(start..start + buf.len()) else {
            bail!(IoError::UnexpectedEof);
        };

        buf.copy_from_slice(src);
        self.pos += buf.len() as u64;
        Ok(())
    }

    fn seek(&mut self, pos: u64) -> Result<()> {
        if pos > self.data.len() as u64 {
            bail!(IoError::InvalidSeek);
        }

        self.pos = pos;
        Ok(())
    }

    fn tell(&self) -> u64 {
        self.pos
    }

    fn len(&self) -> u64 {
        self.data.len() as u64
    }
}

/// A source over any `std` read + seek stream, e.g. a file.
#[cfg(feature = "std")]
#[derive(Debug)]
pub struct HostSource<R> {
    inner: R,
    pos: u64,
    len: u64,
}

#[cfg(feature = "std")]
impl<R: std::io::Read + std::io::Seek> HostSource<R> {
    pub fn new(mut inner: R) -> Result<Self> {
        use std::io::SeekFrom;

        let len = inner.seek(SeekFrom::End(0)).map_err(|_| IoError::Host)?;
        inner.seek(SeekFrom::Start(0)).map_err(|_| IoError::Host)?;

        Ok(Self { inner, pos: 0, len })
    }
}

#[cfg(feature = "std")]
impl<R: std::io::Read + std::io::Seek> Source for HostSource<R> {
    fn read(&mut self, buf: &mut [u8]) -> Result<()> {
        if self.pos + buf.len() as u64 > self.len {
            bail!(IoError::UnexpectedEof);
        }

        self.inner
            .read_exact(buf)
            .map_err(|_| IoError::UnexpectedEof)?;
        self.pos += buf.len() as u64;
        Ok(())
    }

    fn seek(&mut self, pos: u64) -> Result<()> {
        if pos > self.len {
            bail!(IoError::InvalidSeek);
        }

        self.inner
            .seek(std::io::SeekFrom::Start(pos))
            .map_err(|_| IoError::Host)?;
        self.pos = pos;
        Ok(())
    }

    fn tell(&self) -> u64 {
        self.pos
    }

    fn len(&self) -> u64 {
        self.len
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::Error;

    #[test]
    fn memory_source_bounds() {
        let data = [1u8, 2, 3, 4];
        let mut source = MemorySource::new(&data);

        let mut buf = [0u8; 2];
        source.read(&mut buf).unwrap();
        assert_eq!(buf, [1, 2]);
        assert_eq!(source.tell(), 2);

        let mut too_much = [0u8; 3];
        assert_eq!(
            source.read(&mut too_much),
            Err(Error::Io(IoError::UnexpectedEof))
        );

        source.seek(3).unwrap();
        assert_eq!(source.read_to_end().unwrap(), vec![4]);
    }
}
