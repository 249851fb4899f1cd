#![allow(dead_code)]

use aes::cipher::generic_array::GenericArray;
use aes::cipher::{BlockEncrypt, KeyInit};
use aes::Aes128;

// Synthetic container layout used across the integration tests:
//   0x000 fixed header, 0x018 optional header entries,
//   0x100 heap for offset-valued payloads,
//   0x400 security info (0x184 bytes), 0x600 data segment.
pub const HEAP_BASE: u32 = 0x100;
pub const SECURITY_BASE: u32 = 0x400;
pub const DATA_BASE: u32 = 0x600;

pub const SECURITY_SIZE: usize = 0x184;

pub struct TestXex {
    pub module_flags: u32,
    pub entries: Vec<(u32, u32)>,
    pub heap: Vec<u8>,
    pub security: Vec<u8>,
    pub payload: Vec<u8>,
}

impl TestXex {
    pub fn new() -> Self {
        Self {
            module_flags: 0x01,
            entries: Vec::new(),
            heap: Vec::new(),
            security: vec![0u8; SECURITY_SIZE],
            payload: Vec::new(),
        }
    }

    pub fn entry(&mut self, id: u32, datum: u32) -> &mut Self {
        self.entries.push((id, datum));
        self
    }

    // Appends an offset-valued payload to the heap and records the entry
    // pointing at it. Returns the absolute offset.
    pub fn entry_with_blob(&mut self, id: u32, blob: &[u8]) -> u32 {
        let at = self.blob(blob);
        self.entries.push((id, at));
        at
    }

    // Heap placement without an entry; returns the absolute offset.
    pub fn blob(&mut self, data: &[u8]) -> u32 {
        let at = HEAP_BASE + self.heap.len() as u32;
        self.heap.extend_from_slice(data);
        at
    }

    pub fn security_field(&mut self, sub_offset: usize, value: u32) -> &mut Self {
        self.security[sub_offset..sub_offset + 4].copy_from_slice(&value.to_be_bytes());
        self
    }

    pub fn image_size(&mut self, size: u32) -> &mut Self {
        self.security_field(0x004, size)
    }

    // Stores `key` the way a retail image does: AES-ECB encrypted under the
    // all-zero key at security info + 0x150.
    pub fn session_key(&mut self, key: &[u8; 16]) -> &mut Self {
        let stored = ecb_encrypt(&[0u8; 16], key);
        self.security[0x150..0x160].copy_from_slice(&stored);
        self
    }

    pub fn build(&self) -> Vec<u8> {
        assert!(24 + self.entries.len() * 8 <= HEAP_BASE as usize);
        assert!(HEAP_BASE as usize + self.heap.len() <= SECURITY_BASE as usize);

        let mut out = Vec::new();
        out.extend_from_slice(b"XEX2");
        out.extend_from_slice(&self.module_flags.to_be_bytes());
        out.extend_from_slice(&DATA_BASE.to_be_bytes());
        out.extend_from_slice(&0u32.to_be_bytes());
        out.extend_from_slice(&SECURITY_BASE.to_be_bytes());
        out.extend_from_slice(&(self.entries.len() as u32).to_be_bytes());

        for &(id, datum) in &self.entries {
            out.extend_from_slice(&id.to_be_bytes());
            out.extend_from_slice(&datum.to_be_bytes());
        }

        out.resize(HEAP_BASE as usize, 0);
        out.extend_from_slice(&self.heap);
        out.resize(SECURITY_BASE as usize, 0);
        out.extend_from_slice(&self.security);
        out.resize(DATA_BASE as usize, 0);
        out.extend_from_slice(&self.payload);
        out
    }
}

// Optional header identifiers used by the tests.
pub const ID_RESOURCE_INFO: u32 = 0x000002FF;
pub const ID_BASE_FILE_FORMAT: u32 = 0x000003FF;
pub const ID_BOUNDING_PATH: u32 = 0x000080FF;
pub const ID_ENTRY_POINT: u32 = 0x00010100;
pub const ID_IMAGE_BASE: u32 = 0x00010201;
pub const ID_STATIC_LIBRARIES: u32 = 0x000200FF;
pub const ID_EXECUTION_ID: u32 = 0x00040006;

pub fn ecb_encrypt(key: &[u8; 16], block: &[u8; 16]) -> [u8; 16] {
    let cipher = Aes128::new(GenericArray::from_slice(key));
    let mut buf = GenericArray::clone_from_slice(block);
    cipher.encrypt_block(&mut buf);

    let mut out = [0u8; 16];
    out.copy_from_slice(&buf);
    out
}

// AES-128-CBC with a zero IV, matching the extraction chain.
pub fn cbc_encrypt(key: &[u8; 16], data: &mut [u8]) {
    assert_eq!(data.len() % 16, 0);

    let cipher = Aes128::new(GenericArray::from_slice(key));
    let mut iv = [0u8; 16];

    for chunk in data.chunks_exact_mut(16) {
        for (b, v) in chunk.iter_mut().zip(iv.iter()) {
            *b ^= v;
        }
        let block = GenericArray::from_mut_slice(chunk);
        cipher.encrypt_block(block);
        iv.copy_from_slice(chunk);
    }
}

// Compression-record payload, prefixed by its length word as stored on disk.
pub fn compression_blob(encryption: u16, compression: u16, extra: &[u8]) -> Vec<u8> {
    let mut body = Vec::new();
    body.extend_from_slice(&encryption.to_be_bytes());
    body.extend_from_slice(&compression.to_be_bytes());
    body.extend_from_slice(extra);

    let mut blob = (body.len() as u32).to_be_bytes().to_vec();
    blob.extend_from_slice(&body);
    blob
}

pub fn compressed_record(
    encryption: u16,
    window: u32,
    first_block_size: u32,
    hash: &[u8; 20],
) -> Vec<u8> {
    let mut extra = Vec::new();
    extra.extend_from_slice(&window.to_be_bytes());
    extra.extend_from_slice(&first_block_size.to_be_bytes());
    extra.extend_from_slice(hash);
    compression_blob(encryption, 2, &extra)
}

// A minimal dashboard-file blob whose only entry is the English title.
pub fn xdbf_title_blob(title: &str) -> Vec<u8> {
    let mut text = Vec::new();
    for unit in title.encode_utf16() {
        text.extend_from_slice(&unit.to_be_bytes());
    }
    text.extend_from_slice(&[0x00, 0x00]);

    let mut blob = Vec::new();
    blob.extend_from_slice(b"XDBF");
    blob.extend_from_slice(&1u32.to_be_bytes());
    blob.extend_from_slice(&1u32.to_be_bytes()); // entry table length
    blob.extend_from_slice(&1u32.to_be_bytes()); // entries used
    blob.extend_from_slice(&0u32.to_be_bytes());
    blob.extend_from_slice(&0u32.to_be_bytes());

    blob.extend_from_slice(&1u16.to_be_bytes()); // namespace: string
    blob.extend_from_slice(&0x8000u64.to_be_bytes()); // title, English
    blob.extend_from_slice(&0u32.to_be_bytes()); // offset
    blob.extend_from_slice(&(text.len() as u32).to_be_bytes());

    blob.extend_from_slice(&text);
    blob
}

pub fn tiny_png() -> Vec<u8> {
    let mut png = vec![0x89, 0x50, 0x4E, 0x47, 0x0D, 0x0A, 0x1A, 0x0A];
    png.extend_from_slice(&[0x00, 0x00, 0x00, 0x00]);
    png.extend_from_slice(b"IHDR");
    png.extend_from_slice(&[0x00, 0x00, 0x00, 0x00]);
    png.extend_from_slice(b"IEND");
    png.extend_from_slice(&[0xAE, 0x42, 0x60, 0x82]);
    png
}

// An LZX stream holding one uncompressed block of exactly `literals` bytes:
// frame-header bit, block type 3, 24-bit length, padding to the word
// boundary, R0=1/R1=2/R2=3, then the literals.
pub fn lzx_uncompressed_stream(literals: &[u8]) -> Vec<u8> {
    let len = literals.len() as u32;
    assert!(len <= 0x00FF_FFFF);

    // 28 header bits packed MSB-first into two little-endian words.
    let bits: u32 = (0b0011 << 24) | len;
    let word0 = (bits >> 12) as u16;
    let word1 = ((bits << 4) & 0xFFFF) as u16;

    let mut stream = Vec::new();
    stream.extend_from_slice(&word0.to_le_bytes());
    stream.extend_from_slice(&word1.to_le_bytes());
    for r in &[1u32, 2, 3] {
        stream.extend_from_slice(&r.to_le_bytes());
    }
    stream.extend_from_slice(literals);
    stream
}

// One destreamer block: next-size word, optional next-hash, a single chunk
// holding `stream`, and the terminator.
pub fn destreamer_block(stream: &[u8], next_size: u32, next_hash: Option<&[u8; 20]>) -> Vec<u8> {
    assert!(stream.len() <= 0xFFFF);

    let mut block = Vec::new();
    block.extend_from_slice(&next_size.to_be_bytes());
    if let Some(hash) = next_hash {
        block.extend_from_slice(hash);
    }
    block.extend_from_slice(&(stream.len() as u16).to_be_bytes());
    block.extend_from_slice(stream);
    block.extend_from_slice(&[0x00, 0x00]);
    block
}

pub fn pad_to_block(data: &mut Vec<u8>) {
    while data.len() % 16 != 0 {
        data.push(0);
    }
}
