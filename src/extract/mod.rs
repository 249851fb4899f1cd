use std::io::{Read, Seek, SeekFrom, Write};

use byteorder::{BigEndian, ByteOrder};
use log::{debug, warn};

use crate::bytes::ReadAscii;
use crate::crypto::{sha1_digest, CbcDecryptor};
use crate::errors::{Error, Result};
use crate::headers::{CompressionType, EncryptionType, XexHeader};
use crate::lzx::LzxDecoder;

const RAW_CHUNK_SIZE: usize = 0x8000;

// The destreamed block header: next-block size word plus, when hashes are
// verified, the next block's SHA-1.
const BLOCK_SIZE_WORD: usize = 4;
const BLOCK_HASH_LEN: usize = 20;

// Streams the decrypted, decompressed PE image into `sink` and returns the
// number of bytes written. Reported-only conditions (hash mismatches,
// unsupported delta compression) land in `warnings`.
pub fn extract_image<R: Read + Seek, W: Write>(
    reader: &mut R,
    sink: &mut W,
    header: &XexHeader,
    warnings: &mut Vec<String>,
) -> Result<u64> {
    match header.compression {
        // No compression record at all: the payload is plain PE bytes.
        None => extract_raw(reader, sink, header, false),
        Some(ref info) => {
            let encrypted = info.encryption == EncryptionType::Encrypted;

            match info.compression {
                CompressionType::Zeroed | CompressionType::Raw => {
                    extract_raw(reader, sink, header, encrypted)
                }
                CompressionType::Compressed => {
                    extract_compressed(reader, sink, header, warnings)
                }
                CompressionType::DeltaCompressed => {
                    let msg = "delta-compressed image; no data produced".to_string();
                    warn!("{}", msg);
                    warnings.push(msg);
                    Ok(0)
                }
            }
        }
    }
}

// Length-bounded copy of the data segment. When the image is encrypted,
// every complete 16-byte run is CBC-decrypted under one continuous chain;
// trailing sub-block bytes pass through unchanged.
fn extract_raw<R: Read + Seek, W: Write>(
    reader: &mut R,
    sink: &mut W,
    header: &XexHeader,
    encrypted: bool,
) -> Result<u64> {
    let file_len = reader.seek(SeekFrom::End(0))?;
    let data_offset = header.data_offset as u64;

    if data_offset > file_len {
        return Err(Error::Truncated);
    }

    let total = (file_len - data_offset).min(header.image_size as u64);
    reader.seek(SeekFrom::Start(data_offset))?;

    let mut cipher = if encrypted {
        let key = header.session_key.ok_or(Error::Truncated)?;
        Some(CbcDecryptor::new(&key))
    } else {
        None
    };

    debug!("raw extraction of {} bytes (encrypted: {})", total, encrypted);

    let mut buf = vec![0u8; RAW_CHUNK_SIZE];
    let mut remaining = total;

    while remaining > 0 {
        let n = remaining.min(RAW_CHUNK_SIZE as u64) as usize;
        reader.read_exact(&mut buf[..n])?;

        if let Some(cipher) = cipher.as_mut() {
            cipher.decrypt_blocks(&mut buf[..n]);
        }

        sink.write_all(&buf[..n])?;
        remaining -= n as u64;
    }

    Ok(total)
}

// Walks the chained compressed-block format, reassembles the contained LZX
// bitstream and inflates it.
//
// Each block, once decrypted, lays out as
//   [ next_block_size : u32 BE ]
//   [ next_block_hash : 20 bytes, only when verification is enabled ]
//   [ (chunk_len : u16 BE, chunk_bytes)* terminated by 0x0000 ]
// with the CBC chain running uninterrupted across blocks.
fn extract_compressed<R: Read + Seek, W: Write>(
    reader: &mut R,
    sink: &mut W,
    header: &XexHeader,
    warnings: &mut Vec<String>,
) -> Result<u64> {
    let info = match header.compression {
        Some(ref info) => info,
        None => return Err(Error::UnsupportedCompression("missing compression record")),
    };

    let mut decoder = LzxDecoder::with_window_size(info.window_size, 0)?;

    let mut cipher = if info.encryption == EncryptionType::Encrypted {
        let key = header.session_key.ok_or(Error::Truncated)?;
        Some(CbcDecryptor::new(&key))
    } else {
        None
    };

    let verify = info.verify_hashes();
    let header_len = if verify {
        BLOCK_SIZE_WORD + BLOCK_HASH_LEN
    } else {
        BLOCK_SIZE_WORD
    };

    reader.seek(SeekFrom::Start(header.data_offset as u64))?;

    let mut block_size = info.first_block_size;
    let mut expected_hash = info.first_block_hash;
    let mut bitstream: Vec<u8> = Vec::new();
    let mut block_index = 0u32;

    while block_size != 0 {
        let mut block = reader.read_exact_vec(block_size as usize)?;

        if let Some(cipher) = cipher.as_mut() {
            cipher.decrypt_blocks(&mut block);
        }

        // The digest spans the whole decrypted block, leading size and hash
        // words included. A mismatch is reported, never fatal, so tampered
        // images stay inspectable.
        if verify {
            let digest = sha1_digest(&block);
            if digest != expected_hash {
                let msg = format!("block {} failed SHA-1 verification", block_index);
                warn!("{}", msg);
                warnings.push(msg);
            }
        }

        if block.len() < header_len {
            return Err(Error::Truncated);
        }

        let next_size = BigEndian::read_u32(&block[..BLOCK_SIZE_WORD]);
        if verify {
            expected_hash.copy_from_slice(&block[BLOCK_SIZE_WORD..header_len]);
        }

        let mut pos = header_len;
        while pos + 2 <= block.len() {
            let chunk_len = BigEndian::read_u16(&block[pos..]) as usize;
            pos += 2;

            if chunk_len == 0 {
                break;
            }
            if pos + chunk_len > block.len() {
                return Err(Error::Truncated);
            }

            bitstream.extend_from_slice(&block[pos..pos + chunk_len]);
            pos += chunk_len;
        }

        debug!(
            "block {}: {} bytes, next block {} bytes",
            block_index, block_size, next_size
        );

        block_size = next_size;
        block_index += 1;
    }

    let image = decoder.decompress(&bitstream, header.image_size as usize)?;
    sink.write_all(&image)?;

    Ok(image.len() as u64)
}
