use std::io::{Cursor, Read, Seek, SeekFrom};

use log::debug;

use crate::errors::Result;
use crate::extract::extract_image;
use crate::headers::XexHeader;
use crate::resources::{classify_data, scan_images, ContentType, FoundImage, SCAN_LIMIT};
use crate::xdbf;

// A fully processed container: the descriptor, the recovered PE image and
// the post-hoc enrichments (resource bytes, title string, image hunt).
pub struct XexFile {
    pub header: XexHeader,

    // Decrypted, decompressed PE image. Byte-exact; no trailers added.
    pub pe_data: Vec<u8>,

    // Signature-scan results over the raw container and the extracted PE.
    pub container_images: Vec<FoundImage>,
    pub pe_images: Vec<FoundImage>,

    // Ordered log of reported-only conditions.
    pub warnings: Vec<String>,
}

impl XexFile {
    pub fn new(data: Vec<u8>) -> Result<XexFile> {
        XexFile::parse(&mut Cursor::new(data))
    }

    pub fn parse<R: Read + Seek>(reader: &mut R) -> Result<XexFile> {
        let mut warnings = Vec::new();
        let mut header = XexHeader::read(reader, &mut warnings)?;

        let mut pe_data = Vec::new();
        let written = extract_image(reader, &mut pe_data, &header, &mut warnings)?;
        debug!("extracted {} bytes of PE image", written);

        resolve_embedded_resources(&mut header, &pe_data);
        header.title = resolve_title(&header, &pe_data);

        let container_images = {
            reader.seek(SeekFrom::Start(0))?;
            let mut raw = Vec::new();
            reader.by_ref().take(SCAN_LIMIT as u64).read_to_end(&mut raw)?;
            scan_images(&raw)
        };
        let pe_images = scan_images(&pe_data);

        Ok(XexFile {
            header,
            pe_data,
            container_images,
            pe_images,
            warnings,
        })
    }
}

// Resources tagged as living inside the PE image get their bytes from the
// decrypted image at `virtual_address - image_base`.
fn resolve_embedded_resources(header: &mut XexHeader, pe_data: &[u8]) {
    let image_base = header.image_base;

    for resource in header.resources.iter_mut() {
        if resource.content_type != ContentType::PeEmbedded || resource.data.is_some() {
            continue;
        }
        if resource.virtual_address < image_base {
            continue;
        }

        let offset = (resource.virtual_address - image_base) as usize;
        let end = match offset.checked_add(resource.size as usize) {
            Some(end) if end <= pe_data.len() => end,
            _ => continue,
        };

        let data = pe_data[offset..end].to_vec();
        match classify_data(&data) {
            // Keep the embedded tag when the content says nothing.
            ContentType::Unknown => (),
            known => resource.content_type = known,
        }
        resource.data = Some(data);
    }
}

// Every resource blob that leads with XDBF is offered to the dashboard-file
// parser; the decrypted image is the fallback haystack.
fn resolve_title(header: &XexHeader, pe_data: &[u8]) -> Option<String> {
    for resource in &header.resources {
        if let Some(ref data) = resource.data {
            if data.starts_with(&xdbf::XDBF_MAGIC) {
                if let Some(title) = xdbf::extract_title(data) {
                    return Some(title);
                }
            }
        }
    }

    let at = pe_data
        .windows(4)
        .position(|w| w == &xdbf::XDBF_MAGIC[..])?;

    xdbf::extract_title(&pe_data[at..])
}
