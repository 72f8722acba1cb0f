//! The packets a transmit pipeline cycles through.
//!
//! A corpus is an ordered, non-empty sequence of [`Descriptor`]s, each naming the bytes of one
//! frame by address and length. All frames lie in a single contiguous backing range that is
//! registered with the device as one memory region, see [`Corpus::span`]. The backing never
//! moves for the lifetime of the corpus.
//!
//! Without a capture file the corpus is a single built-in frame: a DNS query for
//! `us.pool.ntp.org` from 192.168.50.50:1026 to 192.168.0.1:53. It is opaque bytes here.
//!
//! [`Descriptor`]: struct.Descriptor.html
//! [`Corpus::span`]: struct.Corpus.html#method.span
use std::fs::File;
use std::path::Path;

use crate::error::{CaptureError, Error, Result};
use crate::setup::Span;
use crate::sys::Mapping;
use crate::wire::pcap;

/// One frame of the corpus.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct Descriptor {
    /// Address of the first byte.
    pub addr: u64,
    /// Length in bytes.
    pub len: u32,
}

/// An ordered sequence of frames over one backing range.
#[derive(Debug)]
pub struct Corpus {
    descriptors: Vec<Descriptor>,
    backing: Backing,
}

#[derive(Debug)]
enum Backing {
    Builtin,
    Mapped(Mapping),
    Owned(Box<[u8]>),
}

#[repr(C, align(64))]
struct Aligned<T>(T);

static BUILTIN: Aligned<[u8; 75]> = Aligned([
    // ethernet: dst 00:0c:41:82:b2:53, src 00:d0:59:6c:40:4e, IPv4
    0x00, 0x0c, 0x41, 0x82, 0xb2, 0x53, 0x00, 0xd0, 0x59, 0x6c, 0x40, 0x4e, 0x08, 0x00,
    // ipv4: 192.168.50.50 to 192.168.0.1, UDP
    0x45, 0x00, 0x00, 0x3d, 0x0a, 0x41, 0x00, 0x00, 0x80, 0x11, 0x7c, 0xeb,
    0xc0, 0xa8, 0x32, 0x32, 0xc0, 0xa8, 0x00, 0x01,
    // udp: 1026 to 53
    0x04, 0x02, 0x00, 0x35, 0x00, 0x29, 0x01, 0xab,
    // dns: standard query 0x002b, A us.pool.ntp.org
    0x00, 0x2b, 0x01, 0x00, 0x00, 0x01, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00,
    0x02, 0x75, 0x73, 0x04, 0x70, 0x6f, 0x6f, 0x6c, 0x03, 0x6e, 0x74, 0x70,
    0x03, 0x6f, 0x72, 0x67, 0x00, 0x00, 0x01, 0x00, 0x01,
]);

/// The frame sent when no capture file is given.
pub fn builtin_packet() -> &'static [u8] {
    &BUILTIN.0
}

fn addr_of(data: &[u8]) -> u64 {
    data.as_ptr() as usize as u64
}

/// Collect the records of a capture into descriptors relative to where `data` lies.
fn scan(data: &[u8]) -> core::result::Result<Vec<Descriptor>, pcap::Error> {
    let (_, records) = pcap::Records::new(data)?;
    let base = addr_of(data);

    let mut descriptors = Vec::new();
    for record in records {
        let record = record?;
        descriptors.push(Descriptor {
            addr: base + record.offset as u64,
            len: record.captured,
        });
    }

    if descriptors.is_empty() {
        return Err(pcap::Error::Empty);
    }

    Ok(descriptors)
}

impl Corpus {
    /// The corpus of the single built-in frame.
    pub fn builtin() -> Self {
        let packet = builtin_packet();
        Corpus {
            descriptors: vec![Descriptor {
                addr: addr_of(packet),
                len: packet.len() as u32,
            }],
            backing: Backing::Builtin,
        }
    }

    /// Map a capture file and describe each of its records.
    ///
    /// The file is validated completely before the corpus is returned.
    pub fn load(path: &Path) -> Result<Self> {
        Corpus::map(path).map_err(|source| Error::Capture {
            path: path.to_owned(),
            source,
        })
    }

    /// The built-in corpus, or the capture at `path` if one is given.
    pub fn open(path: Option<&Path>) -> Result<Self> {
        match path {
            None => Ok(Corpus::builtin()),
            Some(path) => Corpus::load(path),
        }
    }

    /// Describe the records of a capture held in memory.
    pub fn from_bytes(bytes: Vec<u8>) -> core::result::Result<Self, CaptureError> {
        let bytes = bytes.into_boxed_slice();
        let descriptors = scan(&bytes)?;
        Ok(Corpus {
            descriptors,
            backing: Backing::Owned(bytes),
        })
    }

    fn map(path: &Path) -> core::result::Result<Self, CaptureError> {
        let file = File::open(path).map_err(CaptureError::Open)?;
        let len = file.metadata().map_err(CaptureError::Open)?.len() as usize;
        if len < pcap::HEADER_LEN {
            return Err(pcap::Error::TruncatedHeader(len).into());
        }

        let mapping = Mapping::map(&file, len)
            .map_err(|errno| CaptureError::Map(errno.into()))?;
        let descriptors = scan(mapping.as_slice())?;

        tracing::info!(
            path = %path.display(),
            packets = descriptors.len(),
            bytes = len,
            "loaded capture");

        Ok(Corpus {
            descriptors,
            backing: Backing::Mapped(mapping),
        })
    }

    /// The number of frames, at least one.
    pub fn len(&self) -> usize {
        self.descriptors.len()
    }

    /// Always `false`, a corpus is never empty.
    pub fn is_empty(&self) -> bool {
        self.descriptors.is_empty()
    }

    /// The frame at `idx`.
    pub fn get(&self, idx: usize) -> Option<&Descriptor> {
        self.descriptors.get(idx)
    }

    /// The frame at `idx` modulo the corpus length.
    pub fn cycle(&self, idx: usize) -> &Descriptor {
        &self.descriptors[idx % self.descriptors.len()]
    }

    /// All frames, in order.
    pub fn descriptors(&self) -> &[Descriptor] {
        &self.descriptors
    }

    /// The backing range, to be registered as a memory region.
    pub fn span(&self) -> Span {
        let bytes = self.bytes();
        Span {
            addr: addr_of(bytes),
            len: bytes.len(),
        }
    }

    /// The bytes of one frame of this corpus.
    ///
    /// Returns `None` for a descriptor pointing outside the backing range.
    pub fn payload(&self, descriptor: &Descriptor) -> Option<&[u8]> {
        let bytes = self.bytes();
        let start = descriptor.addr.checked_sub(addr_of(bytes))? as usize;
        bytes.get(start..start.checked_add(descriptor.len as usize)?)
    }

    fn bytes(&self) -> &[u8] {
        match &self.backing {
            Backing::Builtin => builtin_packet(),
            Backing::Mapped(mapping) => mapping.as_slice(),
            Backing::Owned(bytes) => &bytes[..],
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::wire::pcap::{Header, Record, HEADER_LEN, RECORD_HEADER_LEN};

    fn capture(lens: &[u32]) -> Vec<u8> {
        let mut header = [0; HEADER_LEN];
        Header::default().emit(&mut header);
        let mut out = header.to_vec();
        for (i, &len) in lens.iter().enumerate() {
            let mut rec = [0; RECORD_HEADER_LEN];
            Record { offset: 0, captured: len, original: len, ts_sec: 0, ts_usec: 0 }
                .emit_header(&mut rec);
            out.extend_from_slice(&rec);
            out.extend(core::iter::repeat(i as u8).take(len as usize));
        }
        out
    }

    #[test]
    fn builtin() {
        let corpus = Corpus::builtin();
        assert_eq!(corpus.len(), 1);
        let span = corpus.span();
        assert_eq!(span.len, 75);
        assert_eq!(span.addr % 64, 0);
        assert_eq!(corpus.payload(corpus.cycle(5)), Some(builtin_packet()));
        // EtherType IPv4, UDP destination port 53.
        assert_eq!(&builtin_packet()[12..14], &[0x08, 0x00]);
        assert_eq!(&builtin_packet()[36..38], &[0x00, 0x35]);
    }

    #[test]
    fn descriptors_in_file_order() {
        let corpus = Corpus::from_bytes(capture(&[64, 0, 1514])).unwrap();
        assert_eq!(corpus.len(), 3);
        let span = corpus.span();

        let first = corpus.get(0).unwrap();
        assert_eq!(first.addr, span.addr + 40);
        assert_eq!(first.len, 64);
        assert_eq!(corpus.payload(corpus.get(1).unwrap()), Some(&[][..]));
        let last = corpus.payload(corpus.get(2).unwrap()).unwrap();
        assert_eq!(last.len(), 1514);
        assert!(last.iter().all(|&b| b == 2));
        assert_eq!(corpus.cycle(3), first);
    }

    #[test]
    fn empty_capture() {
        let err = Corpus::from_bytes(capture(&[])).unwrap_err();
        assert!(matches!(err, CaptureError::Format(pcap::Error::Empty)));
    }

    #[test]
    fn foreign_payload() {
        let corpus = Corpus::builtin();
        let outside = Descriptor { addr: 0, len: 1 };
        assert_eq!(corpus.payload(&outside), None);
    }
}
