/*! Low-level access to the file formats consumed.

The only format read is the classic capture file, see [`pcap`]. Parsing works on plain octet
slices: the headers are decoded field by field from fixed byte ranges and never copied, the
records are handed out as offsets into the original slice so that the caller can keep pointing
at the payload bytes where they lie.

[`pcap`]: pcap/index.html
*/

mod field {
    pub(crate) type Field = ::core::ops::Range<usize>;
}

pub mod pcap;
