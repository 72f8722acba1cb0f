//! The classic capture file format.
//!
//! A file consists of a 24-byte global header followed by records, each a 16-byte record header
//! and the captured bytes. Only the microsecond resolution, little-endian flavour with Ethernet
//! link layer is accepted.
use byteorder::{ByteOrder, LittleEndian};
use thiserror::Error;

/// The magic number of the global header, as read little-endian.
pub const MAGIC: u32 = 0xa1b2_c3d4;

/// The only accepted format version, `(major, minor)`.
pub const VERSION: (u16, u16) = (2, 4);

/// The smallest snap length accepted.
pub const MIN_SNAP_LEN: u32 = 64;

/// The link type of Ethernet frames.
pub const LINKTYPE_ETHERNET: u32 = 1;

/// Length of the global header.
pub const HEADER_LEN: usize = field::NETWORK.end;

/// Length of each record header.
pub const RECORD_HEADER_LEN: usize = record::ORIG_LEN.end;

mod field {
    use crate::wire::field::*;

    pub(crate) const MAGIC: Field = 0..4;
    pub(crate) const VERSION_MAJOR: Field = 4..6;
    pub(crate) const VERSION_MINOR: Field = 6..8;
    pub(crate) const THISZONE: Field = 8..12;
    pub(crate) const SIGFIGS: Field = 12..16;
    pub(crate) const SNAPLEN: Field = 16..20;
    pub(crate) const NETWORK: Field = 20..24;
}

mod record {
    use crate::wire::field::*;

    pub(crate) const TS_SEC: Field = 0..4;
    pub(crate) const TS_USEC: Field = 4..8;
    pub(crate) const INCL_LEN: Field = 8..12;
    pub(crate) const ORIG_LEN: Field = 12..16;
}

/// A malformed capture.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum Error {
    /// Shorter than a global header.
    #[error("file of {0} bytes is shorter than the capture header")]
    TruncatedHeader(usize),
    /// Not a little-endian, microsecond resolution capture.
    #[error("bad magic number {0:#010x}")]
    BadMagic(u32),
    /// Not format version 2.4.
    #[error("unsupported format version {0}.{1}")]
    BadVersion(u16, u16),
    /// Timestamps are not in UTC.
    #[error("non-zero timezone offset {0}")]
    TimeZone(i32),
    /// Timestamp accuracy is set.
    #[error("non-zero timestamp accuracy {0}")]
    Sigfigs(u32),
    /// Frames may have been cut shorter than a minimum Ethernet frame.
    #[error("snap length {0} is below 64")]
    SnapLength(u32),
    /// Not an Ethernet capture.
    #[error("link type {0} is not Ethernet")]
    LinkType(u32),
    /// A record claims more bytes than the file holds.
    #[error("record {index} at offset {offset} claims {captured} bytes but only {available} remain")]
    TruncatedRecord {
        /// The zero-based number of the record.
        index: usize,
        /// File offset of its record header.
        offset: usize,
        /// The captured length it claims.
        captured: u32,
        /// Bytes remaining after its record header.
        available: usize,
    },
    /// The file contains no record.
    #[error("capture contains no packets")]
    Empty,
}

/// A validated global header.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Header {
    /// The maximum number of bytes captured per packet.
    pub snap_len: u32,
    /// The link type, always Ethernet after validation.
    pub link_type: u32,
}

/// One record of a capture.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Record {
    /// Offset of the captured bytes in the file.
    pub offset: usize,
    /// Number of captured bytes.
    pub captured: u32,
    /// Length of the packet on the wire.
    pub original: u32,
    /// Timestamp, seconds.
    pub ts_sec: u32,
    /// Timestamp, microseconds.
    pub ts_usec: u32,
}

/// Iterates the records following a global header.
///
/// Stops once fewer bytes than a record header remain. A record whose payload runs past the end
/// yields an error and ends the iteration.
#[derive(Clone, Debug)]
pub struct Records<'a> {
    data: &'a [u8],
    offset: usize,
    index: usize,
}

impl Header {
    /// Validate the global header at the start of `data`.
    ///
    /// Every field is checked before any record is looked at.
    pub fn parse(data: &[u8]) -> Result<Header, Error> {
        if data.len() < HEADER_LEN {
            return Err(Error::TruncatedHeader(data.len()));
        }

        let magic = LittleEndian::read_u32(&data[field::MAGIC]);
        if magic != MAGIC {
            return Err(Error::BadMagic(magic));
        }

        let major = LittleEndian::read_u16(&data[field::VERSION_MAJOR]);
        let minor = LittleEndian::read_u16(&data[field::VERSION_MINOR]);
        if (major, minor) != VERSION {
            return Err(Error::BadVersion(major, minor));
        }

        let zone = LittleEndian::read_i32(&data[field::THISZONE]);
        if zone != 0 {
            return Err(Error::TimeZone(zone));
        }

        let sigfigs = LittleEndian::read_u32(&data[field::SIGFIGS]);
        if sigfigs != 0 {
            return Err(Error::Sigfigs(sigfigs));
        }

        let snap_len = LittleEndian::read_u32(&data[field::SNAPLEN]);
        if snap_len < MIN_SNAP_LEN {
            return Err(Error::SnapLength(snap_len));
        }

        let link_type = LittleEndian::read_u32(&data[field::NETWORK]);
        if link_type != LINKTYPE_ETHERNET {
            return Err(Error::LinkType(link_type));
        }

        Ok(Header { snap_len, link_type })
    }

    /// Emit a header with the given snap length and link type.
    pub fn emit(&self, out: &mut [u8; HEADER_LEN]) {
        LittleEndian::write_u32(&mut out[field::MAGIC], MAGIC);
        LittleEndian::write_u16(&mut out[field::VERSION_MAJOR], VERSION.0);
        LittleEndian::write_u16(&mut out[field::VERSION_MINOR], VERSION.1);
        LittleEndian::write_i32(&mut out[field::THISZONE], 0);
        LittleEndian::write_u32(&mut out[field::SIGFIGS], 0);
        LittleEndian::write_u32(&mut out[field::SNAPLEN], self.snap_len);
        LittleEndian::write_u32(&mut out[field::NETWORK], self.link_type);
    }
}

impl Default for Header {
    fn default() -> Self {
        Header {
            snap_len: 65535,
            link_type: LINKTYPE_ETHERNET,
        }
    }
}

impl Record {
    /// Emit the record header describing `captured` bytes.
    pub fn emit_header(&self, out: &mut [u8; RECORD_HEADER_LEN]) {
        LittleEndian::write_u32(&mut out[record::TS_SEC], self.ts_sec);
        LittleEndian::write_u32(&mut out[record::TS_USEC], self.ts_usec);
        LittleEndian::write_u32(&mut out[record::INCL_LEN], self.captured);
        LittleEndian::write_u32(&mut out[record::ORIG_LEN], self.original);
    }

    /// The byte range of the captured bytes in the file.
    pub fn range(&self) -> core::ops::Range<usize> {
        self.offset..self.offset + self.captured as usize
    }
}

impl<'a> Records<'a> {
    /// Validate the global header and iterate the records after it.
    pub fn new(data: &'a [u8]) -> Result<(Header, Self), Error> {
        let header = Header::parse(data)?;
        Ok((header, Records {
            data,
            offset: HEADER_LEN,
            index: 0,
        }))
    }
}

impl Iterator for Records<'_> {
    type Item = Result<Record, Error>;

    fn next(&mut self) -> Option<Self::Item> {
        let remaining = self.data.len().checked_sub(self.offset)?;
        if remaining < RECORD_HEADER_LEN {
            return None;
        }

        let header = &self.data[self.offset..][..RECORD_HEADER_LEN];
        let captured = LittleEndian::read_u32(&header[record::INCL_LEN]);
        let available = remaining - RECORD_HEADER_LEN;

        if captured as usize > available {
            let err = Error::TruncatedRecord {
                index: self.index,
                offset: self.offset,
                captured,
                available,
            };
            // Nothing after a broken record can be trusted.
            self.offset = self.data.len();
            return Some(Err(err));
        }

        let record = Record {
            offset: self.offset + RECORD_HEADER_LEN,
            captured,
            original: LittleEndian::read_u32(&header[record::ORIG_LEN]),
            ts_sec: LittleEndian::read_u32(&header[record::TS_SEC]),
            ts_usec: LittleEndian::read_u32(&header[record::TS_USEC]),
        };

        self.offset = record.offset + captured as usize;
        self.index += 1;
        Some(Ok(record))
    }
}
