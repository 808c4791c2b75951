//! On-disk constants of the MoPaQ format.

pub const HEADER_BOUNDARY: u64 = 0x200;
pub const HEADER_MPQ_MAGIC: u32 = 0x1A51_504D;
pub const HEADER_USER_MAGIC: u32 = 0x1B51_504D;
pub const STRONG_SIGNATURE_MAGIC: &[u8; 4] = b"NGIS";

pub const HEADER_SIZE_V1: u32 = 0x20;
pub const HEADER_SIZE_V2: u32 = 0x2C;
pub const HEADER_SIZE_V3: u32 = 0x44;
pub const HEADER_SIZE_V4: u32 = 0xD0;

pub const HASH_TABLE_ENTRY_SIZE: u64 = 16;
pub const BLOCK_TABLE_ENTRY_SIZE: u64 = 16;
pub const MIN_HASH_TABLE_SIZE: usize = 4;

pub const DEFAULT_SECTOR_SIZE_SHIFT: u16 = 3;

// hash types, as offsets into the crypto table
pub const MPQ_HASH_TABLE_INDEX: u32 = 0x000;
pub const MPQ_HASH_NAME_A: u32 = 0x100;
pub const MPQ_HASH_NAME_B: u32 = 0x200;
pub const MPQ_HASH_FILE_KEY: u32 = 0x300;
pub const MPQ_HASH_KEY2_MIX: u32 = 0x400;

// hash table sentinels, stored in the block index field
pub const HASH_TABLE_EMPTY_ENTRY: u32 = 0xFFFF_FFFF;
pub const HASH_TABLE_DELETED_ENTRY: u32 = 0xFFFF_FFFE;

// encryption keys of the two tables, hash_string("(hash table)") and
// hash_string("(block table)") with MPQ_HASH_FILE_KEY
pub const HASH_TABLE_KEY: u32 = 0xC3AF_3770;
pub const BLOCK_TABLE_KEY: u32 = 0xEC83_B3A3;

/// Block flags.
pub const MPQ_FILE_IMPLODE: u32 = 0x0000_0100;
pub const MPQ_FILE_COMPRESS: u32 = 0x0000_0200;
pub const MPQ_FILE_ENCRYPTED: u32 = 0x0001_0000;
pub const MPQ_FILE_FIX_KEY: u32 = 0x0002_0000;
pub const MPQ_FILE_PATCH_FILE: u32 = 0x0010_0000;
pub const MPQ_FILE_SINGLE_UNIT: u32 = 0x0100_0000;
pub const MPQ_FILE_DELETE_MARKER: u32 = 0x0200_0000;
pub const MPQ_FILE_SECTOR_CRC: u32 = 0x0400_0000;
pub const MPQ_FILE_SIGNATURE: u32 = 0x1000_0000;
pub const MPQ_FILE_EXISTS: u32 = 0x8000_0000;

pub const MPQ_FILE_COMPRESS_MASK: u32 = MPQ_FILE_IMPLODE | MPQ_FILE_COMPRESS;
pub const MPQ_FILE_VALID_FLAGS: u32 = MPQ_FILE_IMPLODE
    | MPQ_FILE_COMPRESS
    | MPQ_FILE_ENCRYPTED
    | MPQ_FILE_FIX_KEY
    | MPQ_FILE_PATCH_FILE
    | MPQ_FILE_SINGLE_UNIT
    | MPQ_FILE_DELETE_MARKER
    | MPQ_FILE_SECTOR_CRC
    | MPQ_FILE_SIGNATURE
    | MPQ_FILE_EXISTS;

/// Compression method tags, stored in the first byte of a compressed sector.
pub const COMPRESSION_HUFFMAN: u8 = 0x01;
pub const COMPRESSION_ZLIB: u8 = 0x02;
pub const COMPRESSION_PKWARE: u8 = 0x08;
pub const COMPRESSION_BZIP2: u8 = 0x10;
pub const COMPRESSION_SPARSE: u8 = 0x20;
pub const COMPRESSION_IMA_ADPCM_MONO: u8 = 0x40;
pub const COMPRESSION_IMA_ADPCM_STEREO: u8 = 0x80;

/// Locale identifier as stored in the hash table.
pub type Locale = u16;
pub const LOCALE_NEUTRAL: Locale = 0;
pub const PLATFORM_DEFAULT: u16 = 0;

pub const LISTFILE_NAME: &str = "(listfile)";
pub const ATTRIBUTES_NAME: &str = "(attributes)";
pub const SIGNATURE_NAME: &str = "(signature)";
pub const PATCH_METADATA_NAME: &str = "(patch_metadata)";

pub const INTERNAL_FILES: [&str; 4] = [
    LISTFILE_NAME,
    ATTRIBUTES_NAME,
    SIGNATURE_NAME,
    PATCH_METADATA_NAME,
];

pub const ATTRIBUTES_VERSION: u32 = 100;
pub const ATTRIBUTES_CRC32: u32 = 0x01;
pub const ATTRIBUTES_FILETIME: u32 = 0x02;
pub const ATTRIBUTES_MD5: u32 = 0x04;
pub const ATTRIBUTES_PATCH_BIT: u32 = 0x08;

pub const WEAK_SIGNATURE_FILE_SIZE: u64 = 72;
pub const WEAK_SIGNATURE_SIZE: usize = 64;

pub const PATCH_INFO_SIZE: u32 = 0x1C;
pub const PATCH_INFO_FLAGS: u32 = 0x8000_0000;
pub const PATCH_SIGNATURE_PTCH: u32 = 0x4843_5450;
pub const PATCH_SIGNATURE_MD5: u32 = 0x5F35_444D;
pub const PATCH_SIGNATURE_XFRM: u32 = 0x4D52_4658;
pub const PATCH_TYPE_COPY: u32 = 0x5950_4F43;
pub const PATCH_TYPE_BSD0: u32 = 0x3044_5342;
pub const BSDIFF40_SIGNATURE: u64 = 0x3034_4646_4944_5342;
