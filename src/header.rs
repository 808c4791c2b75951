use std::io::Error as IoError;
use std::io::{Read, Write};

use byteorder::{ReadBytesExt, WriteBytesExt, LE};

use super::consts::*;
use super::error::Error;

/// Format revision of an archive, `format_version` 0..=3 in the header.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum FormatVersion {
    V1,
    V2,
    V3,
    V4,
}

impl FormatVersion {
    pub(crate) fn from_raw(raw: u16) -> Result<FormatVersion, Error> {
        match raw {
            0 => Ok(FormatVersion::V1),
            1 => Ok(FormatVersion::V2),
            2 => Ok(FormatVersion::V3),
            3 => Ok(FormatVersion::V4),
            version => Err(Error::UnsupportedVersion { version }),
        }
    }

    pub(crate) fn raw(self) -> u16 {
        match self {
            FormatVersion::V1 => 0,
            FormatVersion::V2 => 1,
            FormatVersion::V3 => 2,
            FormatVersion::V4 => 3,
        }
    }

    pub(crate) fn header_size(self) -> u32 {
        match self {
            FormatVersion::V1 => HEADER_SIZE_V1,
            FormatVersion::V2 => HEADER_SIZE_V2,
            FormatVersion::V3 => HEADER_SIZE_V3,
            FormatVersion::V4 => HEADER_SIZE_V4,
        }
    }
}

#[derive(Debug, Clone)]
pub(crate) struct FileHeader {
    pub header_size: u32,
    pub archive_size: u64,
    pub version: FormatVersion,
    pub sector_size_shift: u16,
    pub hash_table_offset: u64,
    pub block_table_offset: u64,
    pub hash_table_entries: u32,
    pub block_table_entries: u32,
    pub hi_block_table_offset: u64,
    // v4 stores the (possibly compressed) table sizes explicitly
    pub hash_table_size_64: Option<u64>,
    pub block_table_size_64: Option<u64>,
}

impl FileHeader {
    pub fn new(version: FormatVersion, sector_size_shift: u16) -> FileHeader {
        FileHeader {
            header_size: version.header_size(),
            archive_size: u64::from(version.header_size()),
            version,
            sector_size_shift,
            hash_table_offset: 0,
            block_table_offset: 0,
            hash_table_entries: 0,
            block_table_entries: 0,
            hi_block_table_offset: 0,
            hash_table_size_64: None,
            block_table_size_64: None,
        }
    }

    pub fn sector_size(&self) -> u64 {
        512u64 << self.sector_size_shift
    }

    /// Reads the header following the `MPQ\x1A` magic, which the caller has
    /// already consumed.
    pub fn from_reader<R: Read>(mut reader: R, force_v1: bool) -> Result<FileHeader, Error> {
        let header_size = reader.read_u32::<LE>()?;
        let archive_size = reader.read_u32::<LE>()?;
        let format_version = reader.read_u16::<LE>()?;
        let sector_size_shift = reader.read_u16::<LE>()?;
        let hash_table_offset = reader.read_u32::<LE>()?;
        let block_table_offset = reader.read_u32::<LE>()?;
        let hash_table_entries = reader.read_u32::<LE>()?;
        let block_table_entries = reader.read_u32::<LE>()?;

        let version = if force_v1 {
            FormatVersion::V1
        } else {
            FormatVersion::from_raw(format_version)?
        };

        if sector_size_shift > 23 {
            return Err(Error::corrupted("sector size out of range"));
        }

        let mut header = FileHeader {
            header_size,
            archive_size: u64::from(archive_size),
            version,
            sector_size_shift,
            hash_table_offset: u64::from(hash_table_offset),
            block_table_offset: u64::from(block_table_offset),
            hash_table_entries,
            block_table_entries,
            hi_block_table_offset: 0,
            hash_table_size_64: None,
            block_table_size_64: None,
        };

        if version >= FormatVersion::V2 && header_size >= HEADER_SIZE_V2 {
            header.hi_block_table_offset = reader.read_u64::<LE>()?;
            header.hash_table_offset |= u64::from(reader.read_u16::<LE>()?) << 32;
            header.block_table_offset |= u64::from(reader.read_u16::<LE>()?) << 32;
        }

        if version >= FormatVersion::V3 && header_size >= HEADER_SIZE_V3 {
            header.archive_size = reader.read_u64::<LE>()?;
            let _bet_table_offset = reader.read_u64::<LE>()?;
            let _het_table_offset = reader.read_u64::<LE>()?;
        }

        if version >= FormatVersion::V4 && header_size >= HEADER_SIZE_V4 {
            header.hash_table_size_64 = Some(reader.read_u64::<LE>()?);
            header.block_table_size_64 = Some(reader.read_u64::<LE>()?);
        }

        Ok(header)
    }

    /// Writes a v1 or v2 header. Later revisions are only ever read.
    pub fn write<W: Write>(&self, mut writer: W) -> Result<(), IoError> {
        writer.write_u32::<LE>(HEADER_MPQ_MAGIC)?;
        writer.write_u32::<LE>(self.header_size)?;
        writer.write_u32::<LE>(self.archive_size as u32)?;
        writer.write_u16::<LE>(self.version.raw())?;
        writer.write_u16::<LE>(self.sector_size_shift)?;
        writer.write_u32::<LE>(self.hash_table_offset as u32)?;
        writer.write_u32::<LE>(self.block_table_offset as u32)?;
        writer.write_u32::<LE>(self.hash_table_entries)?;
        writer.write_u32::<LE>(self.block_table_entries)?;

        if self.version >= FormatVersion::V2 {
            writer.write_u64::<LE>(self.hi_block_table_offset)?;
            writer.write_u16::<LE>((self.hash_table_offset >> 32) as u16)?;
            writer.write_u16::<LE>((self.block_table_offset >> 32) as u16)?;
        }

        Ok(())
    }
}

#[derive(Debug)]
pub(crate) struct UserHeader {
    pub user_data_size: u32,
    pub file_header_offset: u32,
}

impl UserHeader {
    pub fn from_reader<R: Read>(mut reader: R) -> Result<UserHeader, Error> {
        let user_data_size = reader.read_u32::<LE>()?;
        let file_header_offset = reader.read_u32::<LE>()?;

        Ok(UserHeader {
            user_data_size,
            file_header_offset,
        })
    }
}
