use std::cmp::min;
use std::io;

use byteorder::{WriteBytesExt, LE};
use log::debug;
use md5::{Digest, Md5};

use super::archive::Archive;
use super::attributes::FileAttributes;
use super::codec::*;
use super::consts::*;
use super::crypto::*;
use super::error::Error;
use super::seeker::Storage;
use super::table::*;
use super::util::*;

#[derive(Debug, Clone, Copy)]
/// Represents various options that can be used when adding a file to an archive.
pub struct FileOptions {
    /// Whether to compress the file sector by sector.
    pub compress: bool,
    /// Compression methods to chain, as a mask of `COMPRESSION_*` bits.
    /// Zero means zlib.
    pub compression: u8,
    /// Use the older PKWARE DCL implosion instead. Requires a codec
    /// registered for `COMPRESSION_PKWARE`.
    pub implode: bool,
    /// Whether to encrypt the file using MPQ's encryption scheme.
    /// The encryption key is derived from the file name, so in practice
    /// this is pretty useless.
    pub encrypt: bool,
    /// If the file is encrypted, this will bind the key to the position
    /// and size of the file as well. By default, this is used for
    /// "technical" files such as `(listfile)`.
    pub fix_key: bool,
    /// Store the file as one unit instead of splitting it into sectors.
    pub single_unit: bool,
    /// Record a checksum table after the sectors. Each entry is the CRC32 of
    /// a sector as stored, that is after compression and before encryption,
    /// so a reader can reject a damaged sector without decompressing it.
    /// Only compressed or imploded files that are split into sectors get one.
    pub sector_crc: bool,
    /// Replace a file of the same name and locale instead of failing.
    pub replace_existing: bool,
    /// The data is a patch blob for the file of the same name in a
    /// lower archive of a patch chain.
    pub patch_file: bool,
    pub locale: Locale,
    /// Timestamp for `(attributes)`, as a Windows FILETIME. Defaults to now.
    pub file_time: Option<u64>,
}

impl Default for FileOptions {
    fn default() -> FileOptions {
        FileOptions {
            compress: false,
            compression: 0,
            implode: false,
            encrypt: false,
            fix_key: false,
            single_unit: false,
            sector_crc: false,
            replace_existing: false,
            patch_file: false,
            locale: LOCALE_NEUTRAL,
            file_time: None,
        }
    }
}

impl FileOptions {
    pub(crate) fn flags(self) -> u32 {
        let mut flags = MPQ_FILE_EXISTS;

        if self.implode {
            flags |= MPQ_FILE_IMPLODE;
        } else if self.compress {
            flags |= MPQ_FILE_COMPRESS;
        }

        if self.encrypt {
            flags |= MPQ_FILE_ENCRYPTED;

            if self.fix_key {
                flags |= MPQ_FILE_FIX_KEY;
            }
        }

        if self.single_unit {
            flags |= MPQ_FILE_SINGLE_UNIT;
        } else if self.sector_crc && (self.compress || self.implode) {
            flags |= MPQ_FILE_SECTOR_CRC;
        }

        if self.patch_file {
            flags |= MPQ_FILE_PATCH_FILE;
        }

        flags
    }

    fn sector_compression(self) -> SectorCompression {
        if self.implode {
            SectorCompression::Imploded
        } else if self.compress {
            match self.compression {
                0 => SectorCompression::Compressed(COMPRESSION_ZLIB),
                mask => SectorCompression::Compressed(mask),
            }
        } else {
            SectorCompression::Stored
        }
    }
}

/// Streams a new file into an archive.
///
/// The size is fixed up front and every byte must be written before
/// [`finish`](#method.finish) commits the file. A writer dropped before
/// that leaves the archive as it was.
pub struct FileWriter<'a, S: Storage> {
    archive: &'a mut Archive<S>,
    name: String,
    options: FileOptions,
    file_size: u64,
    written: u64,
    pending: Vec<u8>,
    sectors: Vec<Vec<u8>>,
    crc: crc32fast::Hasher,
    md5: Md5,
}

impl<'a, S: Storage> FileWriter<'a, S> {
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Appends data to the file.
    pub fn write(&mut self, data: &[u8]) -> Result<(), Error> {
        let compression = self.options.sector_compression();

        self.write_with(data, compression)
    }

    /// Appends data whose sectors are compressed with `mask` instead of the
    /// file's default methods. Ignored for files that are not compressed.
    pub fn write_compressed(&mut self, data: &[u8], mask: u8) -> Result<(), Error> {
        let compression = match self.options.sector_compression() {
            SectorCompression::Compressed(_) if mask != 0 => SectorCompression::Compressed(mask),
            other => other,
        };

        self.write_with(data, compression)
    }

    fn write_with(&mut self, data: &[u8], compression: SectorCompression) -> Result<(), Error> {
        let written = self.written + data.len() as u64;
        if written > self.file_size {
            return Err(Error::SizeMismatch {
                expected: self.file_size,
                written,
            });
        }

        self.crc.update(data);
        self.md5.update(data);
        self.written = written;

        if self.options.single_unit {
            self.pending.extend_from_slice(data);
            return Ok(());
        }

        let sector_size = self.archive.sector_size() as usize;
        let mut data = data;
        while !data.is_empty() {
            let take = min(sector_size - self.pending.len(), data.len());
            self.pending.extend_from_slice(&data[..take]);
            data = &data[take..];

            if self.pending.len() == sector_size {
                self.seal_sector(compression)?;
            }
        }

        if self.written == self.file_size && !self.pending.is_empty() {
            self.seal_sector(compression)?;
        }

        Ok(())
    }

    fn seal_sector(&mut self, compression: SectorCompression) -> Result<(), Error> {
        let sector = encode_sector(&self.pending, compression, &self.archive.codecs)?;
        self.sectors.push(sector);
        self.pending.clear();

        Ok(())
    }

    /// Encodes the file body: the sector offset table, the sectors and the
    /// sector checksums, each as it will be stored but still unencrypted.
    fn layout(&mut self, flags: u32) -> Result<(Option<SectorOffsets>, Vec<Vec<u8>>, Vec<u8>), Error> {
        if self.file_size == 0 {
            return Ok((None, Vec::new(), Vec::new()));
        }

        if flags & MPQ_FILE_SINGLE_UNIT != 0 {
            let unit = encode_sector(
                &self.pending,
                self.options.sector_compression(),
                &self.archive.codecs,
            )?;
            return Ok((None, vec![unit], Vec::new()));
        }

        let sectors = std::mem::replace(&mut self.sectors, Vec::new());
        if flags & MPQ_FILE_COMPRESS_MASK == 0 {
            return Ok((None, sectors, Vec::new()));
        }

        let with_crc = flags & MPQ_FILE_SECTOR_CRC != 0;
        let entries = sectors.len() + 1 + if with_crc { 1 } else { 0 };

        let mut checksums = Vec::new();
        if with_crc {
            for sector in &sectors {
                checksums.write_u32::<LE>(crc32fast::hash(sector))?;
            }
        }

        let mut offsets = Vec::with_capacity(entries);
        let mut offset = SectorOffsets::table_size(entries as u64);
        offsets.push(offset as u32);
        for sector in &sectors {
            offset += sector.len() as u64;
            offsets.push(offset as u32);
        }
        if with_crc {
            offset += checksums.len() as u64;
            offsets.push(offset as u32);
        }

        Ok((Some(SectorOffsets::new(offsets)), sectors, checksums))
    }

    /// Writes the file to the archive and records it in the tables.
    pub fn finish(mut self) -> Result<(), Error> {
        if self.written != self.file_size {
            return Err(Error::SizeMismatch {
                expected: self.file_size,
                written: self.written,
            });
        }

        let flags = self.options.flags();
        let (offsets, mut units, checksums) = self.layout(flags)?;
        let md5: [u8; 16] = self.md5.clone().finalize().into();
        let crc32 = self.crc.clone().finalize();

        let mut patch_info = Vec::new();
        if self.options.patch_file {
            patch_info.write_u32::<LE>(PATCH_INFO_SIZE)?;
            patch_info.write_u32::<LE>(PATCH_INFO_FLAGS)?;
            patch_info.write_u32::<LE>(self.file_size as u32)?;
            patch_info.extend_from_slice(&md5);
        }

        let table_size = offsets.as_ref().map_or(0, |offsets| offsets.len() * 4);
        let body_size = table_size
            + units.iter().map(Vec::len).sum::<usize>()
            + checksums.len();
        let compressed_size = (patch_info.len() + body_size) as u64;

        if compressed_size > u64::from(u32::MAX) {
            return Err(Error::InvalidParameter {
                reason: "file does not fit in an archive",
            });
        }

        let archive = &mut *self.archive;
        let locale = self.options.locale;
        let hash = NameHash::new(&self.name);
        // the replaced file keeps its slot, block and bytes until the new
        // data is on disk
        let replaced = archive
            .hash_table
            .lookup_exact(&hash, locale, PLATFORM_DEFAULT);

        let hash_table = &archive.hash_table;
        let block = archive
            .block_table
            .allocate(self.file_size, |index| hash_table.references(index));
        let header_size = archive.header_size();
        let file_pos = archive
            .block_table
            .find_space(header_size, compressed_size, Some(block));

        let key = if self.options.encrypt {
            Some(calculate_file_key(
                &self.name,
                file_pos,
                self.file_size,
                self.options.fix_key,
            ))
        } else {
            None
        };

        let mut buf = patch_info;
        buf.reserve(body_size);
        if let Some(offsets) = &offsets {
            buf.extend_from_slice(&offsets.to_raw(key)?);
        }
        for (index, unit) in units.iter_mut().enumerate() {
            if let Some(key) = key {
                encrypt_mpq_block(unit, key.wrapping_add(index as u32));
            }
            buf.extend_from_slice(unit);
        }
        buf.extend_from_slice(&checksums);

        if let Err(error) = archive.write_raw(file_pos, &buf) {
            archive.block_table.update(block, BlockEntry::default());
            return Err(error);
        }

        archive.block_table.update(
            block,
            BlockEntry::new(file_pos, compressed_size, self.file_size, flags),
        );

        match replaced {
            Some(slot) => {
                let old_block = archive.hash_table.set_block(slot, block);
                archive.release_block(old_block);
            }
            None => {
                if let Err(error) = archive
                    .hash_table
                    .insert(&hash, locale, PLATFORM_DEFAULT, block)
                {
                    archive.block_table.update(block, BlockEntry::default());
                    return Err(error);
                }
            }
        }

        archive.remember_name(&self.name);
        if !self.name.eq_ignore_ascii_case(ATTRIBUTES_NAME) {
            if let Some(attributes) = &mut archive.attributes {
                attributes.set(
                    block,
                    FileAttributes {
                        crc32,
                        file_time: self.options.file_time.unwrap_or_else(filetime_now),
                        md5,
                    },
                );
            }
        }
        archive.dirty = true;

        debug!(
            "added {} as block {}: {} bytes stored in {} at {:#x}",
            self.name, block, self.file_size, compressed_size, file_pos
        );

        Ok(())
    }
}

impl<'a, S: Storage> io::Write for FileWriter<'a, S> {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        FileWriter::write(self, buf)?;

        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

impl<S: Storage> Archive<S> {
    /// Starts a new file of exactly `size` bytes.
    ///
    /// Fails with `AlreadyExists` when a file of that name and locale is
    /// present, unless `options.replace_existing` is set. The old file is
    /// only replaced once the new one is finished.
    pub fn create_file(
        &mut self,
        name: &str,
        size: u64,
        options: FileOptions,
    ) -> Result<FileWriter<'_, S>, Error> {
        self.ensure_writable()?;

        if name.is_empty() {
            return Err(Error::InvalidParameter {
                reason: "file name is empty",
            });
        }

        if size > u64::from(u32::MAX) {
            return Err(Error::InvalidParameter {
                reason: "file does not fit in an archive",
            });
        }

        let name = normalize_name(name);
        let hash = NameHash::new(&name);
        let existing = self
            .hash_table
            .lookup_exact(&hash, options.locale, PLATFORM_DEFAULT)
            .and_then(|slot| self.hash_table.get(slot))
            .and_then(|entry| self.block_table.get(entry.block_index))
            .map_or(false, |entry| entry.exists());

        if existing && !options.replace_existing {
            return Err(Error::AlreadyExists);
        }

        Ok(FileWriter {
            archive: self,
            name,
            options,
            file_size: size,
            written: 0,
            pending: Vec::new(),
            sectors: Vec::new(),
            crc: crc32fast::Hasher::new(),
            md5: Md5::new(),
        })
    }

    /// Adds a file held in memory in one go.
    pub fn add_file(&mut self, name: &str, data: &[u8], options: FileOptions) -> Result<(), Error> {
        let mut writer = self.create_file(name, data.len() as u64, options)?;
        writer.write(data)?;
        writer.finish()
    }

    pub(crate) fn write_internal_file(&mut self, name: &str, data: &[u8]) -> Result<(), Error> {
        let options = FileOptions {
            compress: true,
            encrypt: true,
            fix_key: true,
            replace_existing: true,
            ..FileOptions::default()
        };

        self.add_file(name, data, options)
    }
}

#[cfg(test)]
mod tests {
    use std::cell::Cell;
    use std::io::{Cursor, Read, Seek, SeekFrom};
    use std::rc::Rc;

    use super::*;
    use crate::archive::CreateOptions;

    /// In-memory storage whose writes can be made to fail.
    struct Flaky {
        inner: Cursor<Vec<u8>>,
        failing: Rc<Cell<bool>>,
    }

    impl Read for Flaky {
        fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
            self.inner.read(buf)
        }
    }

    impl io::Write for Flaky {
        fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
            if self.failing.get() {
                return Err(io::Error::new(io::ErrorKind::Other, "disk full"));
            }
            io::Write::write(&mut self.inner, buf)
        }

        fn flush(&mut self) -> io::Result<()> {
            Ok(())
        }
    }

    impl Seek for Flaky {
        fn seek(&mut self, pos: SeekFrom) -> io::Result<u64> {
            self.inner.seek(pos)
        }
    }

    impl Storage for Flaky {
        fn set_len(&mut self, size: u64) -> io::Result<()> {
            self.inner.set_len(size)
        }
    }

    #[test]
    fn flags_follow_options() {
        let options = FileOptions {
            compress: true,
            encrypt: true,
            fix_key: true,
            sector_crc: true,
            ..FileOptions::default()
        };
        assert_eq!(
            options.flags(),
            MPQ_FILE_EXISTS
                | MPQ_FILE_COMPRESS
                | MPQ_FILE_ENCRYPTED
                | MPQ_FILE_FIX_KEY
                | MPQ_FILE_SECTOR_CRC
        );

        // checksums only exist for compressed multi-sector files
        let options = FileOptions {
            sector_crc: true,
            fix_key: true,
            ..FileOptions::default()
        };
        assert_eq!(options.flags(), MPQ_FILE_EXISTS);
    }

    #[test]
    fn size_must_match_exactly() {
        let mut buf = Cursor::new(Vec::new());
        let mut archive = Archive::create(&mut buf).unwrap();

        let mut writer = archive
            .create_file("a.txt", 4, FileOptions::default())
            .unwrap();
        assert!(matches!(
            writer.write(b"hello"),
            Err(Error::SizeMismatch { .. })
        ));
        writer.write(b"hel").unwrap();
        assert!(matches!(writer.finish(), Err(Error::SizeMismatch { .. })));

        assert!(!archive.has_file("a.txt").unwrap());
    }

    #[test]
    fn streamed_writes_span_sectors() {
        let mut buf = Cursor::new(Vec::new());
        let mut archive = Archive::create(&mut buf).unwrap();
        let data: Vec<u8> = (0..10_000u32).map(|i| (i % 251) as u8).collect();

        let options = FileOptions {
            compress: true,
            sector_crc: true,
            ..FileOptions::default()
        };
        let mut writer = archive
            .create_file("data.bin", data.len() as u64, options)
            .unwrap();
        for chunk in data.chunks(777) {
            writer.write(chunk).unwrap();
        }
        writer.finish().unwrap();

        assert_eq!(archive.read_file("data.bin").unwrap(), data);
    }

    #[test]
    fn existing_files_need_replace() {
        let mut buf = Cursor::new(Vec::new());
        let mut archive = Archive::create(&mut buf).unwrap();

        archive
            .add_file("a.txt", b"one", FileOptions::default())
            .unwrap();
        assert!(matches!(
            archive.add_file("A.TXT", b"two", FileOptions::default()),
            Err(Error::AlreadyExists)
        ));

        let options = FileOptions {
            replace_existing: true,
            ..FileOptions::default()
        };
        archive.add_file("a.txt", b"two", options).unwrap();
        assert_eq!(archive.read_file("a.txt").unwrap(), b"two");
    }

    #[test]
    fn failed_replace_keeps_the_old_file() {
        let failing = Rc::new(Cell::new(false));
        let storage = Flaky {
            inner: Cursor::new(Vec::new()),
            failing: failing.clone(),
        };
        let mut archive = Archive::create(storage).unwrap();
        archive
            .add_file("a.txt", b"original", FileOptions::default())
            .unwrap();

        let options = FileOptions {
            replace_existing: true,
            ..FileOptions::default()
        };
        failing.set(true);
        assert!(archive.add_file("a.txt", b"replacement", options).is_err());
        failing.set(false);

        assert_eq!(archive.read_file("a.txt").unwrap(), b"original");
        assert_eq!(archive.files(), vec!["a.txt"]);

        archive.add_file("a.txt", b"replacement", options).unwrap();
        assert_eq!(archive.read_file("a.txt").unwrap(), b"replacement");
    }

    #[test]
    fn replacing_does_not_reuse_the_old_bytes() {
        let mut buf = Cursor::new(Vec::new());
        let mut archive = CreateOptions::new()
            .listfile(false)
            .create(&mut buf)
            .unwrap();
        archive
            .add_file("a.txt", b"original", FileOptions::default())
            .unwrap();

        let options = FileOptions {
            replace_existing: true,
            ..FileOptions::default()
        };
        archive.add_file("a.txt", b"replacement", options).unwrap();
        archive.close().unwrap();

        // the new copy lands after the old one, which is left as a gap
        let start = HEADER_SIZE_V1 as usize;
        assert_eq!(&buf.get_ref()[start..start + 8], b"original");
        assert_eq!(&buf.get_ref()[start + 8..start + 19], b"replacement");
    }

    #[test]
    fn sector_checksums_cover_stored_bytes() {
        let mut buf = Cursor::new(Vec::new());
        let data = [b'x'; 6000];
        {
            let mut archive = CreateOptions::new()
                .listfile(false)
                .create(&mut buf)
                .unwrap();
            let options = FileOptions {
                compress: true,
                sector_crc: true,
                ..FileOptions::default()
            };
            archive.add_file("war3map.j", &data, options).unwrap();
            archive.close().unwrap();
        }

        // two sectors and the checksum table: four offsets
        let raw = &buf.get_ref()[HEADER_SIZE_V1 as usize..];
        let offsets: Vec<usize> = raw[..16]
            .chunks(4)
            .map(|word| u32::from_le_bytes([word[0], word[1], word[2], word[3]]) as usize)
            .collect();
        let checksums = &raw[offsets[2]..offsets[3]];

        for sector in 0..2 {
            let stored = &raw[offsets[sector]..offsets[sector + 1]];
            let recorded = &checksums[sector * 4..sector * 4 + 4];
            assert_eq!(recorded, &crc32fast::hash(stored).to_le_bytes()[..]);
        }
    }
}
