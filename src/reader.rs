use std::cmp::min;
use std::fs::{self, File};
use std::io::{self, ErrorKind as IoErrorKind, Read, Seek, SeekFrom};
use std::path::Path;

use byteorder::{ByteOrder, LE};

use super::archive::{Archive, Located};
use super::codec::*;
use super::consts::*;
use super::crypto::*;
use super::error::Error;
use super::patch::{self, Resolved};
use super::seeker::Storage;
use super::table::BlockEntry;
use super::util::*;

/// Where a name passed to [`open_file_with`](struct.Archive.html#method.open_file_with)
/// is looked up.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SearchScope {
    /// The archive, including its patch chain.
    Archive,
    /// The local filesystem, bypassing the archive.
    Local,
}

impl Default for SearchScope {
    fn default() -> SearchScope {
        SearchScope::Archive
    }
}

enum Layout {
    /// The whole file is one unit.
    Single,
    /// Uncompressed sectors laid out back to back.
    Plain,
    Table(SectorOffsets),
}

/// Lazily decodes the sectors of one stored file, keeping the last one.
pub(crate) struct SectorReader<'a, S: Storage> {
    archive: &'a Archive<S>,
    entry: BlockEntry,
    key: Option<u32>,
    data_offset: u64,
    stored_size: u64,
    sector_size: u64,
    layout: Layout,
    check_crc: bool,
    checksums: Option<Vec<u32>>,
    cache: Option<(u64, Vec<u8>)>,
}

impl<'a, S: Storage> SectorReader<'a, S> {
    pub fn new(
        archive: &'a Archive<S>,
        name: &str,
        located: &Located,
    ) -> Result<SectorReader<'a, S>, Error> {
        let entry = located.entry;
        let sector_size = archive.sector_size();
        let key = file_key(name, &entry);

        let mut data_offset = entry.file_pos;
        let mut stored_size = entry.compressed_size;
        if entry.is_patch_file() && stored_size > 0 {
            let info_size = u64::from(LE::read_u32(&archive.read_raw(data_offset, 4)?));
            if info_size > stored_size {
                return Err(Error::corrupted("patch info is larger than the file"));
            }

            data_offset += info_size;
            stored_size -= info_size;
        }

        let layout = if entry.is_single_unit() {
            Layout::Single
        } else if entry.has_compression() && entry.file_size > 0 {
            let sectors = sector_count_from_size(entry.file_size, sector_size);
            let entries = sectors + 1 + if entry.has_sector_crc() { 1 } else { 0 };
            let size = SectorOffsets::table_size(entries);
            if size > stored_size {
                return Err(Error::corrupted("sector offset table is larger than the file"));
            }

            let offsets = SectorOffsets::from_raw(archive.read_raw(data_offset, size)?, key)?;
            if u64::from(offsets.first()) < size || u64::from(offsets.last()) > stored_size {
                return Err(Error::corrupted("sector offsets point outside the file"));
            }

            Layout::Table(offsets)
        } else {
            Layout::Plain
        };

        Ok(SectorReader {
            archive,
            entry,
            key,
            data_offset,
            stored_size,
            sector_size,
            layout,
            check_crc: archive.check_sector_crc,
            checksums: None,
            cache: None,
        })
    }

    pub fn has_sector_crc(&self) -> bool {
        match self.layout {
            Layout::Table(_) => self.entry.has_sector_crc(),
            _ => false,
        }
    }

    pub fn check_crc(&mut self, check_crc: bool) {
        self.check_crc = check_crc;
    }

    /// Sector index and offset within it for a byte position.
    fn locate(&self, position: u64) -> (u64, usize) {
        match self.layout {
            Layout::Single => (0, position as usize),
            _ => (
                position / self.sector_size,
                (position % self.sector_size) as usize,
            ),
        }
    }

    fn sector(&mut self, index: u64) -> Result<&[u8], Error> {
        let cached = match &self.cache {
            Some((cached, _)) => *cached == index,
            None => false,
        };

        if !cached {
            let data = self.load_sector(index)?;
            self.cache = Some((index, data));
        }

        Ok(self
            .cache
            .as_ref()
            .map(|(_, data)| data.as_slice())
            .unwrap_or_default())
    }

    fn load_sector(&mut self, index: u64) -> Result<Vec<u8>, Error> {
        let file_size = self.entry.file_size;
        let raw_len = match self.layout {
            Layout::Single => file_size,
            _ => min(self.sector_size, file_size - index * self.sector_size),
        };

        let (offset, stored_len) = match &self.layout {
            Layout::Single => (0, self.stored_size),
            Layout::Plain => (index * self.sector_size, raw_len),
            Layout::Table(offsets) => {
                let (start, len) = offsets
                    .sector(index as usize)
                    .ok_or_else(|| Error::corrupted("sector missing from the offset table"))?;
                (u64::from(start), u64::from(len))
            }
        };

        if offset + stored_len > self.stored_size {
            return Err(Error::corrupted("sector extends past the file"));
        }

        let mut data = self
            .archive
            .read_raw(self.data_offset + offset, stored_len)?;

        if let Some(key) = self.key {
            decrypt_mpq_block(&mut data, key.wrapping_add(index as u32));
        }

        if self.check_crc {
            self.verify_checksum(index, &data)?;
        }

        let compression = match self.layout {
            Layout::Plain => SectorCompression::Stored,
            _ => SectorCompression::for_block(&self.entry),
        };

        decode_sector(&data, raw_len as usize, compression, &self.archive.codecs)
    }

    fn verify_checksum(&mut self, index: u64, data: &[u8]) -> Result<(), Error> {
        if self.checksums.is_none() {
            self.checksums = Some(self.load_checksums()?);
        }

        let stored = self
            .checksums
            .as_ref()
            .and_then(|checksums| checksums.get(index as usize))
            .copied()
            .unwrap_or(0);

        // zero means the writer did not record a checksum for the sector
        if stored != 0 && stored != crc32fast::hash(data) {
            return Err(Error::CorruptSector {
                sector: index as u32,
            });
        }

        Ok(())
    }

    fn load_checksums(&self) -> Result<Vec<u32>, Error> {
        let offsets = match &self.layout {
            Layout::Table(offsets) if self.entry.has_sector_crc() => offsets,
            _ => return Ok(Vec::new()),
        };

        let sectors = sector_count_from_size(self.entry.file_size, self.sector_size);
        let (start, len) = match offsets.sector(sectors as usize) {
            Some(extent) => extent,
            None => return Ok(Vec::new()),
        };

        let raw = self
            .archive
            .read_raw(self.data_offset + u64::from(start), u64::from(len))?;

        // some writers compress the checksum block like a sector
        let table_size = (sectors * 4) as usize;
        let raw = if raw.len() < table_size {
            decode_sector(
                &raw,
                table_size,
                SectorCompression::Compressed(0),
                &self.archive.codecs,
            )?
        } else {
            raw
        };

        Ok(raw.chunks_exact(4).map(LE::read_u32).collect())
    }
}

enum Source<'a, S: Storage> {
    Sectors(SectorReader<'a, S>),
    /// Content rebuilt from a patch chain.
    Memory(Vec<u8>),
    Local(File),
}

/// A read cursor over the decompressed content of one file.
///
/// Sectors are decoded on demand, so seeking around a large file only pays
/// for the sectors actually read.
pub struct FileStream<'a, S: Storage> {
    name: String,
    size: u64,
    position: u64,
    block: Option<u32>,
    source: Source<'a, S>,
}

impl<'a, S: Storage> FileStream<'a, S> {
    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn size(&self) -> u64 {
        self.size
    }

    pub fn position(&self) -> u64 {
        self.position
    }

    /// Moves the cursor. Positions past the end are allowed and read as
    /// end of file; positions before the start are `InvalidSeek`.
    pub fn set_position(&mut self, position: SeekFrom) -> Result<u64, Error> {
        let (base, delta) = match position {
            SeekFrom::Start(offset) => {
                self.position = offset;
                return Ok(offset);
            }
            SeekFrom::Current(delta) => (self.position, delta),
            SeekFrom::End(delta) => (self.size, delta),
        };

        let position = if delta >= 0 {
            base.checked_add(delta as u64)
        } else {
            base.checked_sub(delta.unsigned_abs())
        };

        self.position = position.ok_or(Error::InvalidSeek)?;

        Ok(self.position)
    }

    /// Reads from the cursor into `buf`, returning the number of bytes read.
    /// Zero means end of file.
    pub fn read_into(&mut self, buf: &mut [u8]) -> Result<usize, Error> {
        if self.position >= self.size || buf.is_empty() {
            return Ok(0);
        }

        let wanted = min(buf.len() as u64, self.size - self.position) as usize;
        let position = self.position;

        let read = match &mut self.source {
            Source::Memory(data) => {
                let start = position as usize;
                buf[..wanted].copy_from_slice(&data[start..start + wanted]);
                wanted
            }
            Source::Local(file) => {
                file.seek(SeekFrom::Start(position))?;
                file.read(&mut buf[..wanted])?
            }
            Source::Sectors(reader) => {
                let mut done = 0;
                while done < wanted {
                    let (index, within) = reader.locate(position + done as u64);
                    let sector = reader.sector(index)?;
                    if within >= sector.len() {
                        return Err(Error::corrupted("sector is shorter than the file claims"));
                    }

                    let count = min(sector.len() - within, wanted - done);
                    buf[done..done + count].copy_from_slice(&sector[within..within + count]);
                    done += count;
                }
                done
            }
        };

        self.position += read as u64;

        Ok(read)
    }

    /// Reads everything from the cursor to the end of the file.
    pub fn read_all(&mut self) -> Result<Vec<u8>, Error> {
        let remaining = self.size.saturating_sub(self.position);
        let mut out = vec![0u8; remaining as usize];

        let mut filled = 0;
        while filled < out.len() {
            match self.read_into(&mut out[filled..])? {
                0 => break,
                read => filled += read,
            }
        }
        out.truncate(filled);

        Ok(out)
    }

    /// Block index backing this stream, for files read straight out of
    /// one archive.
    pub(crate) fn block(&self) -> Option<u32> {
        self.block
    }

    pub(crate) fn has_sector_crc(&self) -> bool {
        match &self.source {
            Source::Sectors(reader) => reader.has_sector_crc(),
            _ => false,
        }
    }

    pub(crate) fn check_sector_crc(&mut self, check: bool) {
        if let Source::Sectors(reader) = &mut self.source {
            reader.check_crc(check);
        }
    }
}

/// Reads one file exactly as stored in `archive`, without patch resolution.
pub(crate) fn read_stored<S: Storage>(
    archive: &Archive<S>,
    name: &str,
    located: &Located,
) -> Result<Vec<u8>, Error> {
    let mut stream = FileStream {
        name: name.to_string(),
        size: located.entry.file_size,
        position: 0,
        block: Some(located.block),
        source: Source::Sectors(SectorReader::new(archive, name, located)?),
    };

    stream.read_all()
}

impl<'a, S: Storage> Read for FileStream<'a, S> {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        Ok(self.read_into(buf)?)
    }
}

impl<'a, S: Storage> Seek for FileStream<'a, S> {
    fn seek(&mut self, pos: SeekFrom) -> io::Result<u64> {
        Ok(self.set_position(pos)?)
    }
}

impl<S: Storage> Archive<S> {
    /// Opens a file of the neutral locale, resolved through the patch chain.
    pub fn open_file(&self, name: &str) -> Result<FileStream<'_, S>, Error> {
        self.open_file_with(name, SearchScope::Archive, LOCALE_NEUTRAL)
    }

    pub fn open_file_with(
        &self,
        name: &str,
        scope: SearchScope,
        locale: Locale,
    ) -> Result<FileStream<'_, S>, Error> {
        if name.is_empty() {
            return Err(Error::InvalidParameter {
                reason: "file name is empty",
            });
        }

        if scope == SearchScope::Local {
            let file = File::open(name).map_err(|error| match error.kind() {
                IoErrorKind::NotFound => Error::FileNotFound,
                _ => Error::from(error),
            })?;
            let size = file.metadata()?.len();

            return Ok(FileStream {
                name: name.to_string(),
                size,
                position: 0,
                block: None,
                source: Source::Local(file),
            });
        }

        let name = normalize_name(name);
        let stream = match patch::resolve(self, &name, locale)? {
            Resolved::Stored {
                archive,
                name: stored_name,
                located,
            } => FileStream {
                size: located.entry.file_size,
                position: 0,
                block: if std::ptr::eq(archive, self) {
                    Some(located.block)
                } else {
                    None
                },
                source: Source::Sectors(SectorReader::new(archive, &stored_name, &located)?),
                name,
            },
            Resolved::Patched(data) => FileStream {
                size: data.len() as u64,
                position: 0,
                block: None,
                source: Source::Memory(data),
                name,
            },
        };

        Ok(stream)
    }

    /// Reads a whole file into memory.
    pub fn read_file(&self, name: &str) -> Result<Vec<u8>, Error> {
        self.open_file(name)?.read_all()
    }

    /// Reads a whole file into `buf`, which must be large enough to hold it.
    pub fn read_file_into(&self, name: &str, buf: &mut [u8]) -> Result<usize, Error> {
        let mut stream = self.open_file(name)?;
        let size = stream.size();

        if (buf.len() as u64) < size {
            return Err(Error::InsufficientBuffer { needed: size });
        }

        let mut filled = 0;
        while (filled as u64) < size {
            match stream.read_into(&mut buf[filled..size as usize])? {
                0 => break,
                read => filled += read,
            }
        }

        Ok(filled)
    }

    /// Copies a file to `dest` on disk, returning the number of bytes written.
    pub fn extract_file<P: AsRef<Path>>(
        &self,
        name: &str,
        dest: P,
        scope: SearchScope,
    ) -> Result<u64, Error> {
        let mut stream = self.open_file_with(name, scope, LOCALE_NEUTRAL)?;

        if let Some(parent) = dest.as_ref().parent() {
            fs::create_dir_all(parent)?;
        }

        let mut out = File::create(dest)?;
        let written = io::copy(&mut stream, &mut out)?;

        Ok(written)
    }
}

#[cfg(test)]
mod tests {
    use std::io::Cursor;

    use super::*;
    use crate::archive::OpenOptions;
    use crate::writer::FileOptions;

    fn sample() -> Vec<u8> {
        (0..9000u32).map(|i| (i * 7 % 256) as u8).collect()
    }

    fn archive_with(options: FileOptions) -> Cursor<Vec<u8>> {
        let mut buf = Cursor::new(Vec::new());
        {
            let mut archive = Archive::create(&mut buf).unwrap();
            archive.add_file("data.bin", &sample(), options).unwrap();
        }
        buf
    }

    #[test]
    fn every_layout_reads_back() {
        let layouts = [
            FileOptions::default(),
            FileOptions {
                compress: true,
                ..FileOptions::default()
            },
            FileOptions {
                single_unit: true,
                compress: true,
                ..FileOptions::default()
            },
            FileOptions {
                encrypt: true,
                fix_key: true,
                compress: true,
                sector_crc: true,
                ..FileOptions::default()
            },
            FileOptions {
                encrypt: true,
                single_unit: true,
                ..FileOptions::default()
            },
        ];

        for options in layouts.iter() {
            let mut buf = archive_with(*options);
            let archive = OpenOptions::new()
                .check_sector_crc(true)
                .open(&mut buf)
                .unwrap();
            assert_eq!(archive.read_file("data.bin").unwrap(), sample(), "{:?}", options);
        }
    }

    #[test]
    fn seeking_and_partial_reads() {
        let mut buf = archive_with(FileOptions {
            compress: true,
            ..FileOptions::default()
        });
        let archive = Archive::open(&mut buf).unwrap();
        let mut stream = archive.open_file("data.bin").unwrap();
        let data = sample();

        assert_eq!(stream.set_position(SeekFrom::Start(4090)).unwrap(), 4090);
        let mut chunk = [0u8; 12];
        assert_eq!(stream.read_into(&mut chunk).unwrap(), 12);
        assert_eq!(&chunk[..], &data[4090..4102]);

        assert_eq!(stream.set_position(SeekFrom::End(-4)).unwrap(), 8996);
        assert_eq!(stream.read_all().unwrap(), &data[8996..]);

        assert!(matches!(
            stream.set_position(SeekFrom::Current(-10_000)),
            Err(Error::InvalidSeek)
        ));

        stream.set_position(SeekFrom::Start(20_000)).unwrap();
        assert_eq!(stream.read_into(&mut chunk).unwrap(), 0);
    }

    #[test]
    fn buffers_must_fit_the_file() {
        let mut buf = archive_with(FileOptions::default());
        let archive = Archive::open(&mut buf).unwrap();

        let mut small = [0u8; 16];
        assert!(matches!(
            archive.read_file_into("data.bin", &mut small),
            Err(Error::InsufficientBuffer { needed: 9000 })
        ));

        let mut large = vec![0u8; 10_000];
        assert_eq!(archive.read_file_into("data.bin", &mut large).unwrap(), 9000);
        assert_eq!(&large[..9000], &sample()[..]);
    }

    #[test]
    fn local_scope_bypasses_the_archive() {
        let mut buf = archive_with(FileOptions::default());
        let archive = Archive::open(&mut buf).unwrap();

        let result = archive.open_file_with(
            "definitely/not/here.txt",
            SearchScope::Local,
            LOCALE_NEUTRAL,
        );
        assert!(matches!(result, Err(Error::FileNotFound)));
    }
}
