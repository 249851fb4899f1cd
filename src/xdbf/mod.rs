use byteorder::{BigEndian, ByteOrder};
use log::debug;

use crate::errors::{Error, Result};

pub const XDBF_MAGIC: [u8; 4] = *b"XDBF";

const HEADER_SIZE: usize = 24;
const ENTRY_SIZE: usize = 18;
const FREE_ENTRY_SIZE: usize = 8;

// Title string: namespace 1 ("string"), resource id 0x8000 (English).
const NAMESPACE_STRING: u16 = 1;
const TITLE_RESOURCE_ID: u64 = 0x8000;

#[derive(Debug, Clone)]
pub struct XdbfEntry {
    pub namespace: u16,
    pub id: u64,
    // Relative to the data region.
    pub offset: u32,
    pub length: u32,
}

// An Xbox Dashboard File blob: a 24-byte header, an entry table, a free
// table and a data region. The free table takes part in the offset
// arithmetic only; its entries are never interpreted.
pub struct Xdbf<'a> {
    data: &'a [u8],
    pub version: u32,
    pub entries: Vec<XdbfEntry>,
    data_start: usize,
}

impl<'a> Xdbf<'a> {
    pub fn parse(data: &'a [u8]) -> Result<Xdbf<'a>> {
        if data.len() < HEADER_SIZE {
            return Err(Error::Truncated);
        }
        if data[..4] != XDBF_MAGIC {
            return Err(Error::BadMagic);
        }

        let version = BigEndian::read_u32(&data[4..]);
        // Table capacities size the layout; used counts bound iteration.
        let entry_table_len = BigEndian::read_u32(&data[8..]) as usize;
        let entry_used = BigEndian::read_u32(&data[12..]) as usize;
        let free_table_len = BigEndian::read_u32(&data[16..]) as usize;
        let _free_used = BigEndian::read_u32(&data[20..]) as usize;

        let data_start = HEADER_SIZE + ENTRY_SIZE * entry_table_len + FREE_ENTRY_SIZE * free_table_len;

        let count = entry_used.min(entry_table_len);
        let mut entries = Vec::with_capacity(count);

        for i in 0..count {
            let at = HEADER_SIZE + i * ENTRY_SIZE;
            if at + ENTRY_SIZE > data.len() {
                return Err(Error::Truncated);
            }

            entries.push(XdbfEntry {
                namespace: BigEndian::read_u16(&data[at..]),
                id: BigEndian::read_u64(&data[at + 2..]),
                offset: BigEndian::read_u32(&data[at + 10..]),
                length: BigEndian::read_u32(&data[at + 14..]),
            });
        }

        debug!(
            "XDBF v{}: {} entries, data region at {:#x}",
            version, count, data_start
        );

        Ok(Xdbf {
            data,
            version,
            entries,
            data_start,
        })
    }

    pub fn title(&self) -> Option<String> {
        let entry = self
            .entries
            .iter()
            .find(|e| e.namespace == NAMESPACE_STRING && e.id == TITLE_RESOURCE_ID)?;

        let start = self.data_start.checked_add(entry.offset as usize)?;
        if start > self.data.len() {
            return None;
        }

        let end = (start + entry.length as usize).min(self.data.len());
        let title = utf16be_string(&self.data[start..end]);

        match title {
            Some(ref t) if !t.is_empty() => title,
            _ => None,
        }
    }
}

// Decodes UTF-16BE up to a NUL unit or the end of the slice.
fn utf16be_string(data: &[u8]) -> Option<String> {
    let mut units = Vec::with_capacity(data.len() / 2);

    for pair in data.chunks_exact(2) {
        let unit = BigEndian::read_u16(pair);
        if unit == 0 {
            break;
        }
        units.push(unit);
    }

    String::from_utf16(&units).ok()
}

// Best effort: the title entry itself plus a raw fallback over the blob.
pub fn extract_title(data: &[u8]) -> Option<String> {
    if let Ok(xdbf) = Xdbf::parse(data) {
        if let Some(title) = xdbf.title() {
            return Some(title);
        }
    }

    xstc_scan(data)
}

// Fallback: hunt for an XSTC string-table config record and pull the first
// usable string out of its UTF-16BE pool.
fn xstc_scan(data: &[u8]) -> Option<String> {
    let at = data.windows(4).position(|w| w == b"XSTC")?;
    let body = &data[at..];

    if body.len() < 16 {
        return None;
    }

    // magic, version, record size, entry count; then (id, offset) pairs
    // pointing into the pool that follows them.
    let count = BigEndian::read_u32(&body[12..]) as usize;
    let pool_start = 16usize.checked_add(count.checked_mul(8)?)?;
    if pool_start > body.len() {
        return None;
    }
    let pool = &body[pool_start..];

    for i in 0..count {
        let offset = BigEndian::read_u32(&body[16 + i * 8 + 4..]) as usize;
        if offset >= pool.len() {
            continue;
        }

        if let Some(s) = utf16be_string(&pool[offset..]) {
            if sensible_title(&s) {
                return Some(s);
            }
        }
    }

    None
}

fn sensible_title(s: &str) -> bool {
    !s.is_empty() && s.len() <= 256 && !s.chars().any(|c| c.is_control())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn build_xdbf(entries: &[(u16, u64, u32, u32)], data_region: &[u8]) -> Vec<u8> {
        let mut blob = Vec::new();
        blob.extend_from_slice(&XDBF_MAGIC);
        blob.extend_from_slice(&1u32.to_be_bytes()); // version
        blob.extend_from_slice(&(entries.len() as u32).to_be_bytes());
        blob.extend_from_slice(&(entries.len() as u32).to_be_bytes());
        blob.extend_from_slice(&0u32.to_be_bytes()); // free table length
        blob.extend_from_slice(&0u32.to_be_bytes()); // free entries used

        for &(namespace, id, offset, length) in entries {
            blob.extend_from_slice(&namespace.to_be_bytes());
            blob.extend_from_slice(&id.to_be_bytes());
            blob.extend_from_slice(&offset.to_be_bytes());
            blob.extend_from_slice(&length.to_be_bytes());
        }

        blob.extend_from_slice(data_region);
        blob
    }

    #[test]
    fn title_entry_resolves() {
        // "Halo" in UTF-16BE with a trailing NUL.
        let text = [0x00, 0x48, 0x00, 0x61, 0x00, 0x6C, 0x00, 0x6F, 0x00, 0x00];
        let blob = build_xdbf(&[(1, 0x8000, 0, 10)], &text);

        let xdbf = Xdbf::parse(&blob).unwrap();
        assert_eq!(xdbf.title().as_deref(), Some("Halo"));
        assert_eq!(extract_title(&blob).as_deref(), Some("Halo"));
    }

    #[test]
    fn non_title_entries_are_skipped() {
        let text = [0x00, 0x48, 0x00, 0x69, 0x00, 0x00];
        let blob = build_xdbf(&[(2, 0x8000, 0, 6), (1, 0x8001, 0, 6)], &text);

        let xdbf = Xdbf::parse(&blob).unwrap();
        assert!(xdbf.title().is_none());
    }

    #[test]
    fn bad_magic_is_rejected() {
        match Xdbf::parse(b"XDBQ\x00\x00\x00\x01aaaaaaaaaaaaaaaaaaaaaaaa") {
            Err(Error::BadMagic) => (),
            other => panic!("expected BadMagic, got {:?}", other.map(|_| ())),
        }
    }

    #[test]
    fn xstc_fallback_finds_a_string() {
        let mut blob = vec![0xEE; 32];
        blob.extend_from_slice(b"XSTC");
        blob.extend_from_slice(&1u32.to_be_bytes()); // version
        blob.extend_from_slice(&0u32.to_be_bytes()); // record size
        blob.extend_from_slice(&1u32.to_be_bytes()); // entry count
        blob.extend_from_slice(&0x8000u32.to_be_bytes()); // id
        blob.extend_from_slice(&0u32.to_be_bytes()); // offset into pool
        blob.extend_from_slice(&[0x00, 0x50, 0x00, 0x47, 0x00, 0x52, 0x00, 0x00]); // "PGR"

        assert_eq!(extract_title(&blob).as_deref(), Some("PGR"));
    }
}
