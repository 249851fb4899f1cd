extern crate xexract;

mod common;

use common::*;

use xexract::file::XexFile;
use xexract::resources::ContentType;

// A descriptor-complete container: execution id, libraries, a resource
// directory with an XDBF title blob, and an embedded image in the payload.
fn full_container() -> (Vec<u8>, u32) {
    let image_base = 0x8200_0000u32;

    let mut xex = TestXex::new();

    let xdbf = xdbf_title_blob("Halo");
    let xdbf_at = xex.blob(&xdbf);

    let mut dir = Vec::new();
    dir.extend_from_slice(&36u32.to_be_bytes()); // 4 + 2 * 16
    dir.extend_from_slice(b"4D530855");
    dir.extend_from_slice(&(image_base + xdbf_at).to_be_bytes());
    dir.extend_from_slice(&(xdbf.len() as u32).to_be_bytes());
    // Second resource far past the container: only the PE holds it.
    dir.extend_from_slice(b"deferred");
    dir.extend_from_slice(&(image_base + 0x0100_0000).to_be_bytes());
    dir.extend_from_slice(&0x20u32.to_be_bytes());

    let mut exec = Vec::new();
    exec.extend_from_slice(&0x11223344u32.to_be_bytes());
    exec.extend_from_slice(&0x01000000u32.to_be_bytes());
    exec.extend_from_slice(&0x01000000u32.to_be_bytes());
    exec.extend_from_slice(&0x4D530855u32.to_be_bytes());
    exec.extend_from_slice(&[2, 1, 1, 1]);
    exec.extend_from_slice(&0u32.to_be_bytes());

    xex.entry_with_blob(ID_RESOURCE_INFO, &dir);
    xex.entry_with_blob(ID_EXECUTION_ID, &exec);
    xex.entry(ID_IMAGE_BASE, image_base);

    // Payload: PE-looking bytes with a PNG buried in the middle.
    let mut payload = vec![0x4D; 0x200];
    payload.extend_from_slice(&tiny_png());
    payload.resize(0x400, 0x00);

    xex.image_size(payload.len() as u32);
    xex.payload = payload;

    (xex.build(), image_base)
}

#[test]
fn title_resolves_from_resource_xdbf() {
    let (data, _) = full_container();
    let file = XexFile::new(data).unwrap();

    assert_eq!(file.header.title.as_deref(), Some("Halo"));
}

#[test]
fn resources_classify_and_tag() {
    let (data, image_base) = full_container();
    let file = XexFile::new(data).unwrap();

    let resources = &file.header.resources;
    assert_eq!(resources.len(), 2);

    assert_eq!(resources[0].name, "4D530855");
    assert!(resources[0].virtual_address > image_base);
    assert!(resources[0].data.is_some());
    // XDBF is not an image format; the tag stays unknown.
    assert_eq!(resources[0].content_type, ContentType::Unknown);

    assert_eq!(resources[1].name, "deferred");
    assert_eq!(resources[1].content_type, ContentType::PeEmbedded);
    assert!(resources[1].data.is_none());
}

#[test]
fn embedded_images_are_found_in_payload_and_container() {
    let (data, _) = full_container();
    let file = XexFile::new(data).unwrap();

    // The PNG sits at 0x200 in the PE image.
    assert_eq!(file.pe_images.len(), 1);
    assert_eq!(file.pe_images[0].content_type, ContentType::Png);
    assert_eq!(file.pe_images[0].offset, 0x200);

    // The same bytes are visible to the container-wide scan too.
    assert!(file
        .container_images
        .iter()
        .any(|img| img.content_type == ContentType::Png));

    for img in file.pe_images.iter() {
        assert!(img.offset + img.size <= file.pe_data.len());
        assert_eq!(
            &file.pe_data[img.offset..img.offset + 8],
            &[0x89, 0x50, 0x4E, 0x47, 0x0D, 0x0A, 0x1A, 0x0A]
        );
    }
}

#[test]
fn descriptor_is_complete() {
    let (data, image_base) = full_container();
    let file = XexFile::new(data).unwrap();

    let header = &file.header;
    assert_eq!(header.image_base, image_base);
    assert_eq!(header.optional_header_count, 3);
    assert!(header.execution_id.is_some());
    assert_eq!(header.execution_id.as_ref().unwrap().title_id, 0x4D530855);
    assert!(header.session_key.is_some());
    assert!(header.compression.is_none());
}

#[test]
fn title_falls_back_to_pe_scan() {
    // No resource directory at all; the XDBF blob lives in the payload.
    let mut payload = vec![0x00; 0x80];
    payload.extend_from_slice(&xdbf_title_blob("Crackdown"));
    payload.resize(0x200, 0x00);

    let mut xex = TestXex::new();
    xex.image_size(payload.len() as u32);
    xex.payload = payload;

    let file = XexFile::new(xex.build()).unwrap();
    assert_eq!(file.header.title.as_deref(), Some("Crackdown"));
}
