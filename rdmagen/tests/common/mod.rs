#![allow(dead_code)]
use rdmagen::wire::pcap::{Header, Record, HEADER_LEN, RECORD_HEADER_LEN};

/// A capture file with one record per frame.
pub fn capture(header: Header, frames: &[&[u8]]) -> Vec<u8> {
    let mut global = [0; HEADER_LEN];
    header.emit(&mut global);
    let mut data = global.to_vec();

    for (idx, frame) in frames.iter().enumerate() {
        let mut record = [0; RECORD_HEADER_LEN];
        Record {
            offset: 0,
            captured: frame.len() as u32,
            original: frame.len() as u32,
            ts_sec: 1_600_000_000,
            ts_usec: idx as u32,
        }.emit_header(&mut record);
        data.extend_from_slice(&record);
        data.extend_from_slice(frame);
    }
    data
}

/// Distinct frames of increasing length.
pub fn frames(count: usize) -> Vec<Vec<u8>> {
    (0..count).map(|idx| vec![idx as u8; 60 + idx]).collect()
}
