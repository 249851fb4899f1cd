#[macro_use]
extern crate lazy_static;

pub mod bytes;
pub mod crypto;
pub mod errors;
pub mod extract;
pub mod file;
pub mod headers;
pub mod lzx;
pub mod resources;
pub mod xdbf;
