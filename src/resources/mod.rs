use byteorder::{BigEndian, ByteOrder, LittleEndian};
use log::debug;

// The scan walks at most this much of an input.
pub const SCAN_LIMIT: usize = 50 * 1024 * 1024;

// XPR sizes come from the file; anything past this is treated as garbage.
const XPR_SIZE_CAP: u32 = 10 * 1024 * 1024;

const PNG_SIGNATURE: [u8; 8] = [0x89, 0x50, 0x4E, 0x47, 0x0D, 0x0A, 0x1A, 0x0A];
const DDS_HEADER_SIZE: u32 = 124;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ContentType {
    Png,
    Jpeg,
    Dds,
    Bmp,
    Gif,
    Xpr2,
    Xpr0,
    // Lives inside the PE image; bytes resolved after extraction.
    PeEmbedded,
    Unknown,
}

// First-bytes classification of an already-extracted blob.
pub fn classify_data(data: &[u8]) -> ContentType {
    if data.starts_with(&PNG_SIGNATURE) {
        ContentType::Png
    } else if data.starts_with(&[0xFF, 0xD8, 0xFF]) {
        ContentType::Jpeg
    } else if data.starts_with(b"DDS ") {
        ContentType::Dds
    } else if data.starts_with(b"BM") {
        ContentType::Bmp
    } else if data.starts_with(b"GIF8") {
        ContentType::Gif
    } else if data.starts_with(b"XPR2") {
        ContentType::Xpr2
    } else if data.starts_with(b"XPR0") {
        ContentType::Xpr0
    } else {
        ContentType::Unknown
    }
}

#[derive(Debug, Clone)]
pub struct FoundImage {
    pub offset: usize,
    pub size: usize,
    pub content_type: ContentType,
}

// Signature-driven hunt for embedded images. Every hit satisfies
// `offset + size <= data.len()` and starts with its format's magic.
pub fn scan_images(data: &[u8]) -> Vec<FoundImage> {
    let data = &data[..data.len().min(SCAN_LIMIT)];

    let mut found = Vec::new();
    let mut pos = 0usize;

    while pos < data.len() {
        match image_at(data, pos) {
            Some(image) => {
                debug!(
                    "{:?} at {:#x}, {} bytes",
                    image.content_type, image.offset, image.size
                );
                pos = image.offset + image.size;
                found.push(image);
            }
            None => pos += 1,
        }
    }

    found
}

fn image_at(data: &[u8], pos: usize) -> Option<FoundImage> {
    let tail = &data[pos..];

    let (content_type, end) = if tail.starts_with(&PNG_SIGNATURE) {
        (ContentType::Png, png_end(data, pos)?)
    } else if tail.starts_with(&[0xFF, 0xD8, 0xFF]) {
        (ContentType::Jpeg, jpeg_end(data, pos)?)
    } else if tail.starts_with(b"DDS ") {
        (ContentType::Dds, dds_end(data, pos)?)
    } else if tail.starts_with(b"XPR2") {
        (ContentType::Xpr2, xpr_end(data, pos)?)
    } else if tail.starts_with(b"XPR0") {
        (ContentType::Xpr0, xpr_end(data, pos)?)
    } else {
        return None;
    };

    debug_assert!(end <= data.len());

    Some(FoundImage {
        offset: pos,
        size: end - pos,
        content_type,
    })
}

// The stream ends at the IEND chunk id plus its trailing CRC.
fn png_end(data: &[u8], start: usize) -> Option<usize> {
    let mut i = start + PNG_SIGNATURE.len();

    while i + 8 <= data.len() {
        if &data[i..i + 4] == b"IEND" {
            return Some(i + 8);
        }
        i += 1;
    }

    None
}

// Structural walk of JPEG markers. Length-prefixed segments up to the scan
// header; entropy-coded data runs to the EOI marker.
fn jpeg_end(data: &[u8], start: usize) -> Option<usize> {
    // The first real marker rules out stray FF D8 FF runs: only APPn, DQT
    // and SOFn can open a file.
    match data.get(start + 3)? {
        0xE0..=0xEF | 0xDB | 0xC0..=0xC3 => (),
        _ => return None,
    }

    let mut pos = start + 2;
    loop {
        if pos + 4 > data.len() {
            return None;
        }
        if data[pos] != 0xFF {
            return None;
        }

        match data[pos + 1] {
            0xD9 => return Some(pos + 2),
            0xDA => {
                // Entropy-coded data; stuffed FF 00 and restart markers
                // never match FF D9.
                let mut i = pos + 2;
                while i + 2 <= data.len() {
                    if data[i] == 0xFF && data[i + 1] == 0xD9 {
                        return Some(i + 2);
                    }
                    i += 1;
                }
                return None;
            }
            // Standalone markers carry no length word.
            0x01 | 0xD0..=0xD8 => pos += 2,
            _ => {
                let length = BigEndian::read_u16(&data[pos + 2..pos + 4]) as usize;
                if length < 2 {
                    return None;
                }
                pos += 2 + length;
            }
        }
    }
}

fn dds_end(data: &[u8], start: usize) -> Option<usize> {
    if start + 128 > data.len() {
        return None;
    }

    if LittleEndian::read_u32(&data[start + 4..]) != DDS_HEADER_SIZE {
        return None;
    }

    let height = LittleEndian::read_u32(&data[start + 12..]);
    let width = LittleEndian::read_u32(&data[start + 16..]);
    if !(1..=4096).contains(&width) || !(1..=4096).contains(&height) {
        return None;
    }

    let pitch_or_linear_size = LittleEndian::read_u32(&data[start + 20..]);
    let end = start
        .checked_add(128)?
        .checked_add(pitch_or_linear_size as usize)?;

    if end > data.len() {
        return None;
    }

    Some(end)
}

// XPR containers carry their own total size; trusted within a sanity cap.
fn xpr_end(data: &[u8], start: usize) -> Option<usize> {
    if start + 8 > data.len() {
        return None;
    }

    let total = BigEndian::read_u32(&data[start + 4..]);
    if total == 0 || total > XPR_SIZE_CAP {
        return None;
    }

    let end = start.checked_add(total as usize)?;
    if end > data.len() {
        return None;
    }

    Some(end)
}
