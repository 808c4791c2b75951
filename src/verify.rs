use bitflags::bitflags;
use log::debug;
use md5::{Digest, Md5};

use super::archive::Archive;
use super::error::Error;
use super::seeker::Storage;

bitflags! {
    /// Checks requested from [`Archive::verify_file`](struct.Archive.html#method.verify_file).
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct VerifyFlags: u32 {
        const SECTOR_CRC = 0x01;
        const FILE_CRC = 0x02;
        const FILE_MD5 = 0x04;
        const ALL = Self::SECTOR_CRC.bits() | Self::FILE_CRC.bits() | Self::FILE_MD5.bits();
    }
}

bitflags! {
    /// Findings of a file verification. `HAS_*` bits say what could be
    /// checked, the matching `*_ERROR` bits what failed.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct FileVerification: u32 {
        const READ_ERROR = 0x0002;
        const HAS_SECTOR_CRC = 0x0004;
        const SECTOR_CRC_ERROR = 0x0008;
        const HAS_CHECKSUM = 0x0010;
        const CHECKSUM_ERROR = 0x0020;
        const HAS_MD5 = 0x0040;
        const MD5_ERROR = 0x0080;
    }
}

impl FileVerification {
    pub fn is_ok(self) -> bool {
        !self.intersects(
            FileVerification::READ_ERROR
                | FileVerification::SECTOR_CRC_ERROR
                | FileVerification::CHECKSUM_ERROR
                | FileVerification::MD5_ERROR,
        )
    }
}

impl<S: Storage> Archive<S> {
    /// Reads a file through and checks it against its sector checksums and
    /// the CRC32 and MD5 recorded in `(attributes)`.
    ///
    /// Only failing to open the file is an error; everything found while
    /// checking is reported in the returned bits.
    pub fn verify_file(&self, name: &str, flags: VerifyFlags) -> Result<FileVerification, Error> {
        let mut stream = self.open_file(name)?;
        let mut result = FileVerification::empty();

        if flags.contains(VerifyFlags::SECTOR_CRC) && stream.has_sector_crc() {
            result |= FileVerification::HAS_SECTOR_CRC;
            stream.check_sector_crc(true);
        }

        let data = match stream.read_all() {
            Ok(data) => data,
            Err(Error::CorruptSector { sector }) => {
                debug!("{} failed verification at sector {}", name, sector);
                return Ok(result | FileVerification::SECTOR_CRC_ERROR);
            }
            Err(error) => {
                debug!("{} could not be read for verification: {}", name, error);
                return Ok(result | FileVerification::READ_ERROR);
            }
        };

        let recorded = match (stream.block(), &self.attributes) {
            (Some(block), Some(attributes)) => attributes
                .get(block)
                .map(|entry| (attributes.has_crc32(), attributes.has_md5(), *entry)),
            _ => None,
        };

        if let Some((has_crc32, has_md5, entry)) = recorded {
            if flags.contains(VerifyFlags::FILE_CRC) && has_crc32 && entry.crc32 != 0 {
                result |= FileVerification::HAS_CHECKSUM;
                if crc32fast::hash(&data) != entry.crc32 {
                    result |= FileVerification::CHECKSUM_ERROR;
                }
            }

            if flags.contains(VerifyFlags::FILE_MD5) && has_md5 && entry.md5 != [0; 16] {
                result |= FileVerification::HAS_MD5;
                let md5: [u8; 16] = Md5::digest(&data).into();
                if md5 != entry.md5 {
                    result |= FileVerification::MD5_ERROR;
                }
            }
        }

        Ok(result)
    }
}

#[cfg(test)]
mod tests {
    use std::io::Cursor;

    use super::*;
    use crate::archive::{CreateOptions, OpenOptions};
    use crate::consts::HEADER_SIZE_V1;
    use crate::writer::FileOptions;

    #[test]
    fn attributes_back_file_checks() {
        let mut buf = Cursor::new(Vec::new());
        let mut archive = CreateOptions::new()
            .attributes(true)
            .create(&mut buf)
            .unwrap();
        let options = FileOptions {
            compress: true,
            sector_crc: true,
            ..FileOptions::default()
        };
        archive
            .add_file("war3map.j", &[b'x'; 6000], options)
            .unwrap();

        let result = archive.verify_file("war3map.j", VerifyFlags::ALL).unwrap();
        assert_eq!(
            result,
            FileVerification::HAS_SECTOR_CRC
                | FileVerification::HAS_CHECKSUM
                | FileVerification::HAS_MD5
        );
        assert!(result.is_ok());

        assert!(archive.verify_file("missing.j", VerifyFlags::ALL).is_err());
    }

    #[test]
    fn undecodable_sectors_are_read_errors() {
        let mut buf = Cursor::new(Vec::new());
        {
            let mut archive = CreateOptions::new()
                .listfile(false)
                .create(&mut buf)
                .unwrap();
            let options = FileOptions {
                compress: true,
                ..FileOptions::default()
            };
            archive
                .add_file("war3map.j", &[b'x'; 6000], options)
                .unwrap();
            archive.close().unwrap();
        }

        // two sectors, three offsets, then the first sector's method byte
        let zlib_header = HEADER_SIZE_V1 as usize + 3 * 4 + 1;
        buf.get_mut()[zlib_header] ^= 0xFF;

        let archive = OpenOptions::new().read_only(true).open(&mut buf).unwrap();
        assert!(matches!(
            archive.read_file("war3map.j"),
            Err(Error::Corrupted { .. })
        ));

        let result = archive.verify_file("war3map.j", VerifyFlags::ALL).unwrap();
        assert_eq!(result, FileVerification::READ_ERROR);
        assert!(!result.is_ok());
    }
}
