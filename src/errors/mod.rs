use std::fmt::{Display, Formatter};

use std::error::Error as StdError;
use std::io::Error as IoError;
use std::io::ErrorKind;

pub type Result<T> = std::result::Result<T, Error>;

#[derive(Debug)]
pub enum Error {
    Io(IoError),

    // Header magic is not "XEX2".
    BadMagic,

    // A read ran past the end of the input.
    Truncated,

    // LZX block type outside {1, 2, 3}.
    BadBlockType(u8),

    // Huffman code space over- or underflows with non-zero lengths left over.
    BadHuffmanTable,

    // An LZ77 copy would run past the end of the window.
    MatchOverflowsWindow,

    // Compression window is not a power of two in [32 KiB, 2 MiB].
    BadWindowSize(u32),

    UnsupportedCompression(&'static str),
}

impl From<IoError> for Error {
    fn from(err: IoError) -> Error {
        match err.kind() {
            ErrorKind::UnexpectedEof => Error::Truncated,
            _ => Error::Io(err),
        }
    }
}

impl Display for Error {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match *self {
            Error::Io(ref inner) => inner.fmt(f),
            Error::BadMagic => f.write_str("missing 'XEX2' magic bytes"),
            Error::Truncated => f.write_str("input ended before the structure did"),
            Error::BadBlockType(t) => write!(f, "invalid LZX block type {}", t),
            Error::BadHuffmanTable => f.write_str("corrupt Huffman code lengths"),
            Error::MatchOverflowsWindow => f.write_str("LZX match runs past the window"),
            Error::BadWindowSize(w) => write!(f, "invalid LZX window size {:#x}", w),
            Error::UnsupportedCompression(what) => write!(f, "unsupported compression: {}", what),
        }
    }
}

impl StdError for Error {
    fn source(&self) -> Option<&(dyn StdError + 'static)> {
        match *self {
            Error::Io(ref inner) => Some(inner),
            _ => None,
        }
    }
}
