use std::cell::RefCell;
use std::fmt;
use std::fs::{self, File};
use std::path::Path;

use indexmap::IndexMap;
use log::{debug, warn};

use super::attributes::Attributes;
use super::codec::Codecs;
use super::consts::*;
use super::error::Error;
use super::header::*;
use super::listfile;
use super::patch::PatchLayer;
use super::seeker::*;
use super::table::*;
use super::util::*;

/// Options for opening an existing archive.
///
/// Every option is off by default, which opens the archive for reading and
/// writing, loads its listfile and attributes, and searches for the header
/// at any 512-byte boundary.
#[derive(Debug, Clone, Default)]
pub struct OpenOptions {
    read_only: bool,
    write_share: bool,
    no_listfile: bool,
    no_attributes: bool,
    no_header_search: bool,
    force_v1: bool,
    check_sector_crc: bool,
    probing: Probing,
}

impl OpenOptions {
    pub fn new() -> OpenOptions {
        OpenOptions::default()
    }

    pub fn read_only(&mut self, read_only: bool) -> &mut OpenOptions {
        self.read_only = read_only;
        self
    }

    /// Opens the file without denying writes to other processes.
    ///
    /// This is an acknowledgement, not a lock: two writers on the same
    /// archive will corrupt it.
    pub fn write_share(&mut self, write_share: bool) -> &mut OpenOptions {
        self.write_share = write_share;
        self
    }

    pub fn no_listfile(&mut self, no_listfile: bool) -> &mut OpenOptions {
        self.no_listfile = no_listfile;
        self
    }

    pub fn no_attributes(&mut self, no_attributes: bool) -> &mut OpenOptions {
        self.no_attributes = no_attributes;
        self
    }

    pub fn no_header_search(&mut self, no_header_search: bool) -> &mut OpenOptions {
        self.no_header_search = no_header_search;
        self
    }

    /// Treats the archive as format v1 whatever its header claims.
    pub fn force_v1(&mut self, force_v1: bool) -> &mut OpenOptions {
        self.force_v1 = force_v1;
        self
    }

    /// Checks sector checksums on every read of files that carry them.
    pub fn check_sector_crc(&mut self, check_sector_crc: bool) -> &mut OpenOptions {
        self.check_sector_crc = check_sector_crc;
        self
    }

    pub fn probing(&mut self, probing: Probing) -> &mut OpenOptions {
        self.probing = probing;
        self
    }

    pub fn open<S: Storage>(&self, mut storage: S) -> Result<Archive<S>, Error> {
        let (header_offset, header) =
            find_headers(&mut storage, !self.no_header_search, self.force_v1)?;
        let mut seeker = Seeker::new(storage, header_offset)?;

        let mut read_only = self.read_only;
        if header.version >= FormatVersion::V3 {
            if header.hash_table_entries == 0 {
                return Err(Error::Unsupported {
                    feature: "archives without a classic hash table",
                });
            }

            debug!("format {:?} is only opened for reading", header.version);
            read_only = true;
        }

        let hash_table_size = u64::from(header.hash_table_entries) * HASH_TABLE_ENTRY_SIZE;
        let block_table_size = u64::from(header.block_table_entries) * BLOCK_TABLE_ENTRY_SIZE;

        let compressed_tables = header
            .hash_table_size_64
            .map_or(false, |size| size < hash_table_size)
            || header
                .block_table_size_64
                .map_or(false, |size| size < block_table_size);
        if compressed_tables {
            return Err(Error::Unsupported {
                feature: "compressed hash and block tables",
            });
        }

        let hash_raw = seeker.read(header.hash_table_offset, hash_table_size)?;
        let block_raw = seeker.read(header.block_table_offset, block_table_size)?;
        let hi_block_raw = if header.hi_block_table_offset != 0 {
            let size = u64::from(header.block_table_entries) * 2;
            Some(seeker.read(header.hi_block_table_offset, size)?)
        } else {
            None
        };

        let hash_table = HashTable::from_raw(hash_raw, header.hash_table_entries, self.probing)?;
        let block_table = BlockTable::from_raw(
            block_raw,
            header.block_table_entries,
            hi_block_raw.as_deref(),
        )?;

        if self.write_share && !read_only {
            warn!("archive opened for shared writing, concurrent writers are not arbitrated");
        }

        let mut archive = Archive {
            seeker: RefCell::new(seeker),
            header,
            hash_table,
            block_table,
            names: IndexMap::new(),
            attributes: None,
            codecs: Codecs::default(),
            patches: Vec::new(),
            read_only,
            check_sector_crc: self.check_sector_crc,
            maintain_listfile: false,
            dirty: false,
            names_dirty: false,
        };

        for name in INTERNAL_FILES.iter() {
            archive.remember_name(name);
        }

        if !self.no_listfile {
            match archive.read_file(LISTFILE_NAME) {
                Ok(data) => {
                    for name in listfile::parse(&data) {
                        archive.remember_name(&name);
                    }
                    archive.maintain_listfile = true;
                }
                Err(error) if error.is_not_found() => {}
                Err(error) => warn!("could not read {}: {}", LISTFILE_NAME, error),
            }
        }

        if !self.no_attributes {
            match archive.read_file(ATTRIBUTES_NAME) {
                Ok(data) => match Attributes::parse(&data, archive.block_table.len()) {
                    Ok(attributes) => archive.attributes = Some(attributes),
                    Err(error) => warn!("ignoring malformed {}: {}", ATTRIBUTES_NAME, error),
                },
                Err(error) if error.is_not_found() => {}
                Err(error) => warn!("could not read {}: {}", ATTRIBUTES_NAME, error),
            }
        }

        archive.names_dirty = false;

        debug!(
            "opened {:?} archive at {:#x}: {} hash slots, {} blocks, {} known names",
            archive.header.version,
            header_offset,
            archive.hash_table.len(),
            archive.block_table.len(),
            archive.names.len()
        );

        Ok(archive)
    }

    pub fn open_path<P: AsRef<Path>>(&self, path: P) -> Result<Archive<File>, Error> {
        let file = if self.read_only {
            File::open(path)?
        } else {
            fs::OpenOptions::new().read(true).write(true).open(path)?
        };

        self.open(file)
    }
}

/// Options for creating a new archive.
#[derive(Debug, Clone)]
pub struct CreateOptions {
    version: FormatVersion,
    max_file_count: usize,
    sector_size_shift: u16,
    listfile: bool,
    attributes: bool,
    signature: bool,
    probing: Probing,
}

impl Default for CreateOptions {
    fn default() -> CreateOptions {
        CreateOptions {
            version: FormatVersion::V1,
            max_file_count: 1024,
            sector_size_shift: DEFAULT_SECTOR_SIZE_SHIFT,
            listfile: true,
            attributes: false,
            signature: false,
            probing: Probing::default(),
        }
    }
}

impl CreateOptions {
    pub fn new() -> CreateOptions {
        CreateOptions::default()
    }

    /// Only v1 and v2 archives can be created.
    pub fn version(&mut self, version: FormatVersion) -> &mut CreateOptions {
        self.version = version;
        self
    }

    pub fn max_file_count(&mut self, max_file_count: usize) -> &mut CreateOptions {
        self.max_file_count = max_file_count;
        self
    }

    /// Sectors are `512 << shift` bytes long.
    pub fn sector_size_shift(&mut self, sector_size_shift: u16) -> &mut CreateOptions {
        self.sector_size_shift = sector_size_shift;
        self
    }

    pub fn listfile(&mut self, listfile: bool) -> &mut CreateOptions {
        self.listfile = listfile;
        self
    }

    pub fn attributes(&mut self, attributes: bool) -> &mut CreateOptions {
        self.attributes = attributes;
        self
    }

    /// Reserves a `(signature)` file for a later weak signature.
    pub fn signature(&mut self, signature: bool) -> &mut CreateOptions {
        self.signature = signature;
        self
    }

    pub fn probing(&mut self, probing: Probing) -> &mut CreateOptions {
        self.probing = probing;
        self
    }

    fn reserved_files(&self) -> usize {
        [self.listfile, self.attributes, self.signature]
            .iter()
            .filter(|enabled| **enabled)
            .count()
    }

    pub fn create<S: Storage>(&self, mut storage: S) -> Result<Archive<S>, Error> {
        if self.version > FormatVersion::V2 {
            return Err(Error::Unsupported {
                feature: "creating v3 and v4 archives",
            });
        }

        if self.sector_size_shift > 23 {
            return Err(Error::InvalidParameter {
                reason: "sector size shift out of range",
            });
        }

        storage.set_len(0)?;
        let seeker = Seeker::new(storage, 0)?;
        let hash_table_size = hash_table_size_for(self.max_file_count + self.reserved_files());

        let mut archive = Archive {
            seeker: RefCell::new(seeker),
            header: FileHeader::new(self.version, self.sector_size_shift),
            hash_table: HashTable::new(hash_table_size, self.probing),
            block_table: BlockTable::new(),
            names: IndexMap::new(),
            attributes: if self.attributes {
                Some(Attributes::default())
            } else {
                None
            },
            codecs: Codecs::default(),
            patches: Vec::new(),
            read_only: false,
            check_sector_crc: false,
            maintain_listfile: self.listfile,
            dirty: true,
            names_dirty: true,
        };

        for name in INTERNAL_FILES.iter() {
            archive.remember_name(name);
        }

        if self.signature {
            archive.reserve_weak_signature()?;
        }

        archive.flush()?;

        debug!(
            "created {:?} archive with {} hash slots",
            self.version,
            archive.hash_table.len()
        );

        Ok(archive)
    }

    pub fn create_path<P: AsRef<Path>>(&self, path: P) -> Result<Archive<File>, Error> {
        let file = fs::OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(true)
            .open(path)?;

        self.create(file)
    }
}

pub(crate) fn hash_table_size_for(file_count: usize) -> usize {
    file_count.max(MIN_HASH_TABLE_SIZE).next_power_of_two()
}

/// A file located in the tables of one archive.
#[derive(Debug, Clone, Copy)]
pub(crate) struct Located {
    pub slot: usize,
    pub block: u32,
    pub entry: BlockEntry,
}

/// A MoPaQ archive open for reading and, unless opened read-only, writing.
///
/// Works on any [`Storage`](trait.Storage.html). Changes are kept in memory
/// until [`flush`](#method.flush) writes the tables back; dropping the
/// archive flushes too, but only [`close`](#method.close) reports failures.
///
/// File streams and writers borrow the archive, so it cannot be closed
/// while any of them is still alive.
pub struct Archive<S: Storage> {
    pub(crate) seeker: RefCell<Seeker<S>>,
    pub(crate) header: FileHeader,
    pub(crate) hash_table: HashTable,
    pub(crate) block_table: BlockTable,
    // (name1, name2) to the archived name
    pub(crate) names: IndexMap<(u32, u32), String>,
    pub(crate) attributes: Option<Attributes>,
    pub(crate) codecs: Codecs,
    pub(crate) patches: Vec<PatchLayer<S>>,
    pub(crate) read_only: bool,
    pub(crate) check_sector_crc: bool,
    pub(crate) maintain_listfile: bool,
    pub(crate) dirty: bool,
    pub(crate) names_dirty: bool,
}

impl<S: Storage> fmt::Debug for Archive<S> {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.debug_struct("Archive")
            .field("version", &self.header.version)
            .field("archive_size", &self.header.archive_size)
            .field("hash_table", &self.hash_table.len())
            .field("block_table", &self.block_table.len())
            .field("patches", &self.patches.len())
            .field("read_only", &self.read_only)
            .finish()
    }
}

impl<S: Storage> Archive<S> {
    /// Opens an archive with default [`OpenOptions`](struct.OpenOptions.html).
    pub fn open(storage: S) -> Result<Archive<S>, Error> {
        OpenOptions::new().open(storage)
    }

    /// Creates an archive with default [`CreateOptions`](struct.CreateOptions.html),
    /// discarding whatever `storage` held before.
    pub fn create(storage: S) -> Result<Archive<S>, Error> {
        CreateOptions::new().create(storage)
    }

    pub fn format_version(&self) -> FormatVersion {
        self.header.version
    }

    pub fn sector_size(&self) -> u64 {
        self.header.sector_size()
    }

    /// Size of the archive as recorded in its header.
    pub fn archive_size(&self) -> u64 {
        self.header.archive_size
    }

    pub fn max_file_count(&self) -> usize {
        self.hash_table.len()
    }

    pub fn is_read_only(&self) -> bool {
        self.read_only
    }

    /// Compression methods available to this archive.
    pub fn codecs_mut(&mut self) -> &mut Codecs {
        &mut self.codecs
    }

    /// Teaches the archive the names in a listfile on disk. Returns how many
    /// names were new.
    pub fn add_listfile<P: AsRef<Path>>(&mut self, path: P) -> Result<usize, Error> {
        let data = fs::read(path)?;

        Ok(self.add_listfile_names(&data))
    }

    /// Like [`add_listfile`](#method.add_listfile), for listfile contents
    /// already in memory.
    pub fn add_listfile_names(&mut self, data: &[u8]) -> usize {
        listfile::parse(data)
            .iter()
            .filter(|name| self.remember_name(name))
            .count()
    }

    pub fn has_file(&self, name: &str) -> Result<bool, Error> {
        match self.open_file(name) {
            Ok(_) => Ok(true),
            Err(error) if error.is_not_found() => Ok(false),
            Err(error) => Err(error),
        }
    }

    /// Known names of all live files, internal files excluded.
    pub fn files(&self) -> Vec<String> {
        let mut files: Vec<String> = self
            .live_entries()
            .filter(|(_, entry)| !entry.is_delete_marker())
            .filter_map(|(hash_entry, _)| self.name_of(hash_entry))
            .filter(|name| !is_internal_name(name))
            .map(str::to_string)
            .collect();

        files.sort();
        files.dedup();
        files
    }

    /// Removes a file. Its bytes stay in place until the archive is
    /// compacted.
    pub fn remove_file(&mut self, name: &str, locale: Locale) -> Result<(), Error> {
        self.ensure_writable()?;

        let name = normalize_name(name);
        let block = self
            .hash_table
            .remove(&NameHash::new(&name), locale, PLATFORM_DEFAULT)?;
        self.release_block(block);

        self.names_dirty = true;
        self.dirty = true;

        debug!("removed {} (block {})", name, block);

        Ok(())
    }

    /// Records that `name` no longer exists, shadowing it in every archive
    /// below this one in a patch chain.
    pub fn add_delete_marker(&mut self, name: &str, locale: Locale) -> Result<(), Error> {
        self.ensure_writable()?;

        let name = normalize_name(name);
        let hash = NameHash::new(&name);

        if let Some(slot) = self.hash_table.lookup_exact(&hash, locale, PLATFORM_DEFAULT) {
            let block = self.hash_table.remove_slot(slot);
            self.release_block(block);
        }

        let data_end = self.block_table.data_end(self.header_size());
        let hash_table = &self.hash_table;
        let block = self
            .block_table
            .allocate(0, |index| hash_table.references(index));
        self.block_table.update(
            block,
            BlockEntry::new(data_end, 0, 0, MPQ_FILE_EXISTS | MPQ_FILE_DELETE_MARKER),
        );

        if let Err(error) = self
            .hash_table
            .insert(&hash, locale, PLATFORM_DEFAULT, block)
        {
            self.block_table.update(block, BlockEntry::default());
            return Err(error);
        }

        self.remember_name(&name);
        self.dirty = true;

        Ok(())
    }

    /// Writes pending changes: the internal files, both tables and the
    /// header. The storage is cut right after the tables.
    pub fn flush(&mut self) -> Result<(), Error> {
        let listfile_pending = self.names_dirty && self.maintain_listfile;
        if self.read_only || !(self.dirty || listfile_pending) {
            return Ok(());
        }

        self.update_internal_files()?;
        self.write_tables()?;

        self.dirty = false;
        self.names_dirty = false;

        Ok(())
    }

    /// Flushes and closes the archive.
    pub fn close(mut self) -> Result<(), Error> {
        self.flush()
    }

    pub(crate) fn header_size(&self) -> u64 {
        u64::from(self.header.header_size)
    }

    pub(crate) fn read_raw(&self, offset: u64, size: u64) -> Result<Vec<u8>, Error> {
        self.seeker.borrow_mut().read(offset, size)
    }

    pub(crate) fn write_raw(&self, offset: u64, data: &[u8]) -> Result<(), Error> {
        self.seeker.borrow_mut().write(offset, data)
    }

    pub(crate) fn ensure_writable(&self) -> Result<(), Error> {
        if self.read_only {
            Err(Error::AccessDenied)
        } else {
            Ok(())
        }
    }

    /// Adds `name` to the name registry, returning whether it was new.
    pub(crate) fn remember_name(&mut self, name: &str) -> bool {
        let name = normalize_name(name);
        let hash = NameHash::new(&name);

        if self.names.contains_key(&hash.key()) {
            return false;
        }

        let named_live_entry = self.hash_table.lookup(&hash, LOCALE_NEUTRAL, 0).is_ok();
        self.names.insert(hash.key(), name);
        if named_live_entry {
            self.names_dirty = true;
        }

        true
    }

    pub(crate) fn name_of(&self, entry: &HashEntry) -> Option<&str> {
        self.names
            .get(&(entry.name1, entry.name2))
            .map(String::as_str)
    }

    /// Used hash slots paired with their existing block entries.
    pub(crate) fn live_entries(&self) -> impl Iterator<Item = (&HashEntry, &BlockEntry)> {
        let block_table = &self.block_table;

        self.hash_table
            .entries()
            .filter(|(_, entry)| entry.is_used())
            .filter_map(move |(_, entry)| {
                block_table
                    .get(entry.block_index)
                    .filter(|block| block.exists())
                    .map(|block| (entry, block))
            })
    }

    /// Finds a file by name in this archive alone, delete markers included.
    pub(crate) fn locate(&self, name: &str, locale: Locale) -> Result<Located, Error> {
        let slot = self
            .hash_table
            .lookup(&NameHash::new(name), locale, PLATFORM_DEFAULT)?;
        let block = self
            .hash_table
            .get(slot)
            .map(|entry| entry.block_index)
            .ok_or(Error::FileNotFound)?;
        let entry = *self
            .block_table
            .get(block)
            .ok_or_else(|| Error::corrupted("hash entry points past the block table"))?;

        if !entry.exists() {
            return Err(Error::FileNotFound);
        }

        Ok(Located { slot, block, entry })
    }

    /// Marks a block free once no hash slot refers to it anymore.
    pub(crate) fn release_block(&mut self, block: u32) {
        if self.hash_table.references(block) {
            return;
        }

        if let Some(entry) = self.block_table.get(block).copied() {
            let flags = (entry.flags & !MPQ_FILE_EXISTS) | MPQ_FILE_DELETE_MARKER;
            self.block_table
                .update(block, BlockEntry { flags, ..entry });
        }

        if let Some(attributes) = &mut self.attributes {
            attributes.clear(block);
        }
    }

    fn update_internal_files(&mut self) -> Result<(), Error> {
        if self.maintain_listfile && self.names_dirty {
            let listfile = {
                let names: Vec<&str> = self
                    .live_entries()
                    .filter_map(|(hash_entry, _)| self.name_of(hash_entry))
                    .filter(|name| !is_internal_name(name))
                    .collect();
                listfile::render(names)
            };

            let current = match self.read_file(LISTFILE_NAME) {
                Ok(current) => Some(current),
                Err(error) if error.is_not_found() => None,
                Err(error) => return Err(error),
            };

            if current.as_deref() != Some(&listfile[..]) {
                self.write_internal_file(LISTFILE_NAME, &listfile)?;
            }
        }

        if self.attributes.is_some() {
            match self.remove_file(ATTRIBUTES_NAME, LOCALE_NEUTRAL) {
                Ok(()) => {}
                Err(error) if error.is_not_found() => {}
                Err(error) => return Err(error),
            }

            // the attributes file may claim one more block for itself
            let hash_table = &self.hash_table;
            let has_free_block = self
                .block_table
                .entries()
                .any(|(index, entry)| !entry.exists() && !hash_table.references(index));
            let block_count = self.block_table.len() + if has_free_block { 0 } else { 1 };

            let block_table = &self.block_table;
            let data = match &self.attributes {
                Some(attributes) => attributes.to_bytes(block_count, |index| {
                    block_table
                        .get(index as u32)
                        .map_or(false, |entry| entry.exists() && entry.is_patch_file())
                })?,
                None => return Ok(()),
            };

            self.write_internal_file(ATTRIBUTES_NAME, &data)?;
        }

        Ok(())
    }

    fn write_tables(&mut self) -> Result<(), Error> {
        let data_end = self.block_table.data_end(self.header_size());
        self.block_table.clamp_empty(data_end);

        let hash_raw = self.hash_table.to_raw()?;
        let block_raw = self.block_table.to_raw()?;
        let hi_block_raw = if self.header.version >= FormatVersion::V2 {
            self.block_table.hi_block_raw()?
        } else {
            None
        };

        let hash_table_offset = data_end;
        let block_table_offset = hash_table_offset + hash_raw.len() as u64;
        let mut archive_end = block_table_offset + block_raw.len() as u64;

        let hi_block_table_offset = match &hi_block_raw {
            Some(raw) => {
                let offset = archive_end;
                archive_end += raw.len() as u64;
                offset
            }
            None => 0,
        };

        if self.header.version == FormatVersion::V1 && archive_end > u64::from(u32::MAX) {
            return Err(Error::Unsupported {
                feature: "v1 archives larger than 4 GiB",
            });
        }

        let header = &mut self.header;
        header.hash_table_offset = hash_table_offset;
        header.block_table_offset = block_table_offset;
        header.hi_block_table_offset = hi_block_table_offset;
        header.hash_table_entries = self.hash_table.len() as u32;
        header.block_table_entries = self.block_table.len() as u32;
        header.archive_size = archive_end;

        let mut header_raw = Vec::with_capacity(header.header_size as usize);
        header.write(&mut header_raw)?;

        let seeker = self.seeker.get_mut();
        seeker.write(hash_table_offset, &hash_raw)?;
        seeker.write(block_table_offset, &block_raw)?;
        if let Some(raw) = &hi_block_raw {
            seeker.write(hi_block_table_offset, raw)?;
        }
        seeker.write(0, &header_raw)?;
        seeker.truncate(archive_end)?;
        seeker.sync()?;

        debug!(
            "wrote tables at {:#x}, archive is {} bytes",
            hash_table_offset, archive_end
        );

        Ok(())
    }
}

impl<S: Storage> Drop for Archive<S> {
    fn drop(&mut self) {
        if let Err(error) = self.flush() {
            warn!("failed to flush archive on drop: {}", error);
        }
    }
}

#[cfg(test)]
mod tests {
    use std::io::Cursor;

    use super::*;
    use crate::writer::FileOptions;

    #[test]
    fn created_archive_reopens_empty() {
        let mut buf = Cursor::new(Vec::new());
        Archive::create(&mut buf).unwrap().close().unwrap();

        let archive = Archive::open(&mut buf).unwrap();
        assert_eq!(archive.format_version(), FormatVersion::V1);
        assert_eq!(archive.sector_size(), 4096);
        assert!(archive.files().is_empty());
        assert!(archive.has_file(LISTFILE_NAME).unwrap());
    }

    #[test]
    fn hash_table_is_sized_for_internal_files() {
        let mut buf = Cursor::new(Vec::new());
        let archive = CreateOptions::new()
            .max_file_count(128)
            .create(&mut buf)
            .unwrap();

        assert_eq!(archive.max_file_count(), 256);
        assert_eq!(hash_table_size_for(0), 4);
    }

    #[test]
    fn read_only_archives_refuse_changes() {
        let mut buf = Cursor::new(Vec::new());
        Archive::create(&mut buf).unwrap().close().unwrap();

        let mut archive = OpenOptions::new().read_only(true).open(&mut buf).unwrap();
        let result = archive.add_file("a.txt", b"a", FileOptions::default());
        assert!(matches!(result, Err(Error::AccessDenied)));
        assert!(matches!(
            archive.remove_file("a.txt", LOCALE_NEUTRAL),
            Err(Error::AccessDenied)
        ));
    }

    #[test]
    fn v3_headers_open_read_only() {
        let mut buf = Cursor::new(Vec::new());
        {
            let mut archive = Archive::create(&mut buf).unwrap();
            archive
                .add_file("a.txt", b"hello", FileOptions::default())
                .unwrap();
        }

        // bump format_version to v3 with a header size that stops short of
        // the v3 fields, so the rest of the layout stays valid
        buf.get_mut()[12] = 2;
        let archive = Archive::open(&mut buf).unwrap();
        assert_eq!(archive.format_version(), FormatVersion::V3);
        assert!(archive.is_read_only());
        assert_eq!(archive.read_file("a.txt").unwrap(), b"hello");
    }
}
