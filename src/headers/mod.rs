use std::convert::TryFrom;
use std::io::{Read, Seek, SeekFrom};

use bitflags::bitflags;
use byteorder::{BigEndian, ReadBytesExt};
use log::{debug, warn};
use num_enum::TryFromPrimitive;

use crate::bytes::{swap_u32_words, ReadAscii};
use crate::crypto;
use crate::errors::{Error, Result};
use crate::resources::{classify_data, ContentType};

pub const XEX2_MAGIC: [u8; 4] = *b"XEX2";

// Fixed container header: magic plus five big-endian words.
pub const HEADER_SIZE: u64 = 24;

// Security-info sub-offsets, in the order the walker visits them. The order
// is not monotonic; each field is seek-addressed.
const FIELD_HEADER_SIZE: u64 = 0x000;
const FIELD_LOAD_ADDRESS: u64 = 0x110;
const FIELD_IMAGE_SIZE: u64 = 0x004;
const FIELD_GAME_REGIONS: u64 = 0x178;
const FIELD_IMAGE_FLAGS: u64 = 0x10C;
const FIELD_ALLOWED_MEDIA: u64 = 0x17C;

const SESSION_KEY_OFFSET: u64 = 0x150;

bitflags! {
    // https://free60.org/System-Software/Formats/XEX/#xex-header
    pub struct ModuleFlags: u32 {
        const TITLE_MODULE = 0x01;
        const EXPORTS_TO_TITLE = 0x02;
        const SYSTEM_DEBUGGER = 0x04;
        const DLL_MODULE = 0x08;
        const MODULE_PATCH = 0x10;
        const FULL_PATCH = 0x20;
        const DELTA_PATCH = 0x40;
        const USER_MODE = 0x80;
    }
}

bitflags! {
    pub struct AllowedMediaTypes: u32 {
        const HARD_DISK = 0x0000_0001;
        const DVD_X2 = 0x0000_0002;
        const DVD_CD = 0x0000_0004;
        const DVD_5 = 0x0000_0008;
        const DVD_9 = 0x0000_0010;
        const SYSTEM_FLASH = 0x0000_0020;
        const MEMORY_UNIT = 0x0000_0080;
        const MASS_STORAGE_DEVICE = 0x0000_0100;
        const SMB_FILESYSTEM = 0x0000_0200;
        const DIRECT_FROM_RAM = 0x0000_0400;
        const INSECURE_PACKAGE = 0x0100_0000;
        const SAVEGAME_PACKAGE = 0x0200_0000;
        const LOCALLY_SIGNED_PACKAGE = 0x0400_0000;
        const LIVE_SIGNED_PACKAGE = 0x0800_0000;
        const XBOX_PLATFORM_PACKAGE = 0x1000_0000;
    }
}

// https://free60.org/System-Software/Formats/XEX/#header-ids
#[repr(u32)]
#[derive(Clone, Copy, Debug, PartialEq, Eq, TryFromPrimitive)]
pub enum OptionalHeaderId {
    ResourceInfo = 0x_00_00_02_ff,
    BaseFileFormat = 0x_00_00_03_ff,
    BoundingPath = 0x_00_00_80_ff,
    OriginalBaseAddress = 0x_00_01_00_01,
    EntryPoint = 0x_00_01_01_00,
    ImageBaseAddress = 0x_00_01_02_01,
    ImportLibraries = 0x_00_01_03_ff,
    ChecksumTimestamp = 0x_00_01_80_02,
    EnabledForCallcap = 0x_00_01_81_02,
    EnabledForFastcap = 0x_00_01_82_00,
    OriginalPeName = 0x_00_01_83_ff,
    StaticLibraries = 0x_00_02_00_ff,
    TlsInfo = 0x_00_02_01_04,
    DefaultStackSize = 0x_00_02_02_00,
    DefaultFilesystemCacheSize = 0x_00_02_03_01,
    DefaultHeapSize = 0x_00_02_04_01,
    SystemFlags = 0x_00_03_00_00,
    ExecutionId = 0x_00_04_00_06,
    TitleWorkspaceSize = 0x_00_04_02_01,
    GameRatings = 0x_00_04_03_10,
    LanKey = 0x_00_04_04_04,
    Xbox360Logo = 0x_00_04_05_ff,
    ExportsByName = 0x_00_e1_04_02,
}

impl OptionalHeaderId {
    // Whether the datum points at a payload this parser decodes. A property
    // of the identifier, not of the value.
    pub fn has_decoder(&self) -> bool {
        match self {
            OptionalHeaderId::ExecutionId
            | OptionalHeaderId::ImageBaseAddress
            | OptionalHeaderId::StaticLibraries
            | OptionalHeaderId::ResourceInfo
            | OptionalHeaderId::BaseFileFormat
            | OptionalHeaderId::BoundingPath => true,
            _ => false,
        }
    }
}

// One (id, datum) record. The datum is either an inline value or an absolute
// file offset, depending on the identifier; unknown identifiers are kept
// undecoded.
#[derive(Debug, Clone)]
pub struct OptionalHeader {
    pub id: u32,
    pub datum: u32,
}

impl OptionalHeader {
    pub fn known_id(&self) -> Option<OptionalHeaderId> {
        OptionalHeaderId::try_from(self.id).ok()
    }
}

#[derive(Debug, Clone, Default)]
pub struct ExecutionId {
    pub media_id: u32,
    pub version: u32,
    pub base_version: u32,
    pub title_id: u32,
    pub platform: u8,
    pub executable_type: u8,
    pub disc_number: u8,
    pub disc_count: u8,
    pub save_game_id: u32,
}

#[derive(Debug, Clone)]
pub struct LibraryRef {
    // NUL-padded 8-byte ASCII name.
    pub name: String,
    pub major: u16,
    pub minor: u16,
    pub build: u16,
    pub qfe: u16,
}

impl LibraryRef {
    pub fn unapproved(&self) -> bool {
        self.qfe & 0x8000 != 0
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, TryFromPrimitive)]
#[repr(u16)]
pub enum EncryptionType {
    Unencrypted = 0,
    Encrypted = 1,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, TryFromPrimitive)]
#[repr(u16)]
pub enum CompressionType {
    Zeroed = 0,
    Raw = 1,
    Compressed = 2,
    DeltaCompressed = 3,
}

#[derive(Debug, Clone)]
pub struct CompressionInfo {
    pub encryption: EncryptionType,
    pub compression: CompressionType,

    // Power of two, 32 KiB..2 MiB. Zero unless `Compressed`.
    pub window_size: u32,
    pub first_block_size: u32,
    // All zero means no verification.
    pub first_block_hash: [u8; 20],

    // Undigested payload, kept for observability.
    pub raw: Vec<u8>,
}

impl CompressionInfo {
    pub fn verify_hashes(&self) -> bool {
        self.first_block_hash.iter().any(|&b| b != 0)
    }

    fn parse(raw: Vec<u8>) -> Result<Self> {
        if raw.len() < 4 {
            return Err(Error::Truncated);
        }

        let encryption_raw = u16::from_be_bytes([raw[0], raw[1]]);
        let compression_raw = u16::from_be_bytes([raw[2], raw[3]]);

        let encryption = EncryptionType::try_from(encryption_raw)
            .map_err(|_| Error::UnsupportedCompression("unknown encryption type"))?;
        let compression = CompressionType::try_from(compression_raw)
            .map_err(|_| Error::UnsupportedCompression("unknown compression type"))?;

        let mut info = CompressionInfo {
            encryption,
            compression,
            window_size: 0,
            first_block_size: 0,
            first_block_hash: [0u8; 20],
            raw,
        };

        if info.compression == CompressionType::Compressed {
            if info.raw.len() < 32 {
                return Err(Error::Truncated);
            }
            info.window_size =
                u32::from_be_bytes([info.raw[4], info.raw[5], info.raw[6], info.raw[7]]);
            info.first_block_size =
                u32::from_be_bytes([info.raw[8], info.raw[9], info.raw[10], info.raw[11]]);
            info.first_block_hash.copy_from_slice(&info.raw[12..32]);
        }

        Ok(info)
    }
}

#[derive(Debug, Clone)]
pub struct ResourceEntry {
    // NUL-padded 8-byte ASCII name, usually the hex title id.
    pub name: String,
    // Relative to the image base once loaded.
    pub virtual_address: u32,
    pub size: u32,

    pub data: Option<Vec<u8>>,
    pub content_type: ContentType,
}

// Everything the container header pass produces. Immutable once built; the
// post-extraction passes only fill `title` and resource data.
#[derive(Debug)]
pub struct XexHeader {
    pub magic: [u8; 4],
    pub module_flags: u32,
    // Absolute offset where the encrypted/compressed payload begins.
    pub data_offset: u32,
    pub file_header_offset: u32,
    pub optional_header_count: u32,

    // Fixed security-info fields.
    pub header_size: u32,
    pub load_address: u32,
    pub image_size: u32,
    pub game_regions: u32,
    pub image_flags: u32,
    pub allowed_media: u32,

    pub optional_headers: Vec<OptionalHeader>,
    pub libraries: Vec<LibraryRef>,
    pub bound_path: Option<String>,
    pub compression: Option<CompressionInfo>,
    pub session_key: Option<[u8; 16]>,

    pub image_base: u32,
    pub resource_dir_offset: u32,
    pub resources: Vec<ResourceEntry>,
    pub execution_id: Option<ExecutionId>,

    pub title: Option<String>,
}

impl XexHeader {
    pub fn module_flag_bits(&self) -> ModuleFlags {
        ModuleFlags::from_bits_truncate(self.module_flags)
    }

    pub fn allowed_media_bits(&self) -> AllowedMediaTypes {
        AllowedMediaTypes::from_bits_truncate(self.allowed_media)
    }

    pub fn read<R: Read + Seek>(reader: &mut R, warnings: &mut Vec<String>) -> Result<XexHeader> {
        reader.seek(SeekFrom::Start(0))?;

        let mut magic = [0u8; 4];
        reader.read_exact(&mut magic)?;

        if magic != XEX2_MAGIC {
            return Err(Error::BadMagic);
        }

        let module_flags = reader.read_u32::<BigEndian>()?;
        let data_offset = reader.read_u32::<BigEndian>()?;
        let _reserved = reader.read_u32::<BigEndian>()?;
        let file_header_offset = reader.read_u32::<BigEndian>()?;
        let optional_header_count = reader.read_u32::<BigEndian>()?;

        debug!(
            "XEX2 header: flags {:#010x}, data at {:#x}, file header at {:#x}, {} optional headers",
            module_flags, data_offset, file_header_offset, optional_header_count
        );

        let mut optional_headers = Vec::with_capacity(optional_header_count as usize);
        for _ in 0..optional_header_count {
            optional_headers.push(OptionalHeader {
                id: reader.read_u32::<BigEndian>()?,
                datum: reader.read_u32::<BigEndian>()?,
            });
        }

        let mut header = XexHeader {
            magic,
            module_flags,
            data_offset,
            file_header_offset,
            optional_header_count,
            header_size: 0,
            load_address: 0,
            image_size: 0,
            game_regions: 0,
            image_flags: 0,
            allowed_media: 0,
            optional_headers,
            libraries: Vec::new(),
            bound_path: None,
            compression: None,
            session_key: None,
            image_base: 0,
            resource_dir_offset: 0,
            resources: Vec::new(),
            execution_id: None,
            title: None,
        };

        header.read_file_header_fields(reader)?;
        header.read_session_key(reader, warnings);

        // Pass 1: everything except the resource directory, which needs the
        // image base address that may appear later in the list.
        header.walk_optional_headers(reader, warnings)?;

        // Pass 2: resource directory only.
        if header.resource_dir_offset != 0 {
            let offset = header.resource_dir_offset;
            if let Err(e) = header.decode_resource_directory(reader, offset) {
                let msg = format!("resource directory at {:#x} skipped: {}", offset, e);
                warn!("{}", msg);
                warnings.push(msg);
            }
        }

        Ok(header)
    }

    // The six fixed fields live at scattered sub-offsets of the file header
    // region; each is addressed individually.
    fn read_file_header_fields<R: Read + Seek>(&mut self, reader: &mut R) -> Result<()> {
        let base = self.file_header_offset as u64;

        let field = |reader: &mut R, sub: u64| -> Result<u32> {
            reader.seek(SeekFrom::Start(base + sub))?;
            Ok(reader.read_u32::<BigEndian>()?)
        };

        self.header_size = field(reader, FIELD_HEADER_SIZE)?;
        self.load_address = field(reader, FIELD_LOAD_ADDRESS)?;
        self.image_size = field(reader, FIELD_IMAGE_SIZE)?;
        self.game_regions = field(reader, FIELD_GAME_REGIONS)?;
        self.image_flags = field(reader, FIELD_IMAGE_FLAGS)?;
        self.allowed_media = field(reader, FIELD_ALLOWED_MEDIA)?;

        Ok(())
    }

    fn read_session_key<R: Read + Seek>(&mut self, reader: &mut R, warnings: &mut Vec<String>) {
        let result = (|| -> Result<[u8; 16]> {
            reader.seek(SeekFrom::Start(
                self.file_header_offset as u64 + SESSION_KEY_OFFSET,
            ))?;

            // The key is stored as four big-endian words. Materialize them
            // native-endian, then swap each word back to its on-disk byte
            // order before handing the block to AES.
            let mut encrypted = [0u8; 16];
            for word in encrypted.chunks_exact_mut(4) {
                let w = reader.read_u32::<BigEndian>()?;
                word.copy_from_slice(&w.to_le_bytes());
            }
            swap_u32_words(&mut encrypted);

            Ok(crypto::decrypt_session_key(&encrypted))
        })();

        match result {
            Ok(key) => self.session_key = Some(key),
            Err(e) => {
                let msg = format!("session key unavailable: {}", e);
                warn!("{}", msg);
                warnings.push(msg);
            }
        }
    }

    fn walk_optional_headers<R: Read + Seek>(
        &mut self,
        reader: &mut R,
        warnings: &mut Vec<String>,
    ) -> Result<()> {
        for i in 0..self.optional_headers.len() {
            let entry = self.optional_headers[i].clone();
            let id = match entry.known_id() {
                Some(id) => id,
                None => {
                    debug!(
                        "unknown optional header {:#010x} = {:#010x}, kept undecoded",
                        entry.id, entry.datum
                    );
                    continue;
                }
            };

            // A bad entry is isolated: it stays in the list with no decoded
            // payload and the walk continues.
            if let Err(e) = self.decode_optional_header(reader, id, entry.datum) {
                let msg = format!("optional header {:#010x} skipped: {}", entry.id, e);
                warn!("{}", msg);
                warnings.push(msg);
            }
        }

        Ok(())
    }

    fn decode_optional_header<R: Read + Seek>(
        &mut self,
        reader: &mut R,
        id: OptionalHeaderId,
        datum: u32,
    ) -> Result<()> {
        match id {
            OptionalHeaderId::ImageBaseAddress => {
                self.image_base = datum;
            }
            OptionalHeaderId::ResourceInfo => {
                // Deferred to pass 2.
                self.resource_dir_offset = datum;
            }
            OptionalHeaderId::ExecutionId => {
                reader.seek(SeekFrom::Start(datum as u64))?;
                self.execution_id = Some(ExecutionId {
                    media_id: reader.read_u32::<BigEndian>()?,
                    version: reader.read_u32::<BigEndian>()?,
                    base_version: reader.read_u32::<BigEndian>()?,
                    title_id: reader.read_u32::<BigEndian>()?,
                    platform: reader.read_u8()?,
                    executable_type: reader.read_u8()?,
                    disc_number: reader.read_u8()?,
                    disc_count: reader.read_u8()?,
                    save_game_id: reader.read_u32::<BigEndian>()?,
                });
            }
            OptionalHeaderId::StaticLibraries => {
                reader.seek(SeekFrom::Start(datum as u64))?;
                let total = reader.read_u32::<BigEndian>()?;
                let count = total.saturating_sub(4) / 16;

                for _ in 0..count {
                    let name = reader.read_ascii(8)?;
                    self.libraries.push(LibraryRef {
                        name,
                        major: reader.read_u16::<BigEndian>()?,
                        minor: reader.read_u16::<BigEndian>()?,
                        build: reader.read_u16::<BigEndian>()?,
                        qfe: reader.read_u16::<BigEndian>()?,
                    });
                }
            }
            OptionalHeaderId::BaseFileFormat => {
                reader.seek(SeekFrom::Start(datum as u64))?;
                let length = reader.read_u32::<BigEndian>()?;
                let raw = reader.read_exact_vec(length as usize)?;
                self.compression = Some(CompressionInfo::parse(raw)?);
            }
            OptionalHeaderId::BoundingPath => {
                reader.seek(SeekFrom::Start(datum as u64))?;
                let length = reader.read_u32::<BigEndian>()?;
                self.bound_path = Some(reader.read_ascii(length as usize)?);
            }
            _ => {
                // Inline value; recorded in the entry list only.
            }
        }

        Ok(())
    }

    fn decode_resource_directory<R: Read + Seek>(
        &mut self,
        reader: &mut R,
        offset: u32,
    ) -> Result<()> {
        let file_len = reader.seek(SeekFrom::End(0))?;

        reader.seek(SeekFrom::Start(offset as u64))?;
        let total = reader.read_u32::<BigEndian>()?;
        let count = total.saturating_sub(4) / 16;

        for _ in 0..count {
            let name = reader.read_ascii(8)?;
            let virtual_address = reader.read_u32::<BigEndian>()?;
            let size = reader.read_u32::<BigEndian>()?;

            self.resources.push(ResourceEntry {
                name,
                virtual_address,
                size,
                data: None,
                content_type: ContentType::Unknown,
            });
        }

        // Resolve the bytes that are reachable inside the container itself;
        // the rest live in the PE image and are filled in post-extraction.
        for i in 0..self.resources.len() {
            let (virtual_address, size) = {
                let r = &self.resources[i];
                (r.virtual_address, r.size)
            };

            if virtual_address < self.image_base {
                continue;
            }

            let file_offset = (virtual_address - self.image_base) as u64;
            if file_offset + size as u64 > file_len {
                self.resources[i].content_type = ContentType::PeEmbedded;
                continue;
            }

            reader.seek(SeekFrom::Start(file_offset))?;
            let data = reader.read_exact_vec(size as usize)?;

            self.resources[i].content_type = classify_data(&data);
            self.resources[i].data = Some(data);
        }

        Ok(())
    }
}
