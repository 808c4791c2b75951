use std::io::Error as IoError;
use std::io::{Read, Write};

use byteorder::{ReadBytesExt, WriteBytesExt, LE};
use log::debug;

use super::consts::*;
use super::crypto::*;
use super::error::Error;

/// Collision resolution used by the hash table.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Probing {
    /// Each name steps through the table by its own odd stride, derived from
    /// an independent hash of the name.
    Double,
    /// Step of one slot, as produced by linear-probing writers.
    Linear,
}

impl Default for Probing {
    fn default() -> Probing {
        Probing::Double
    }
}

/// The three hashes identifying a name in the hash table.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub(crate) struct NameHash {
    pub index: u32,
    pub name1: u32,
    pub name2: u32,
    pub step: u32,
}

impl NameHash {
    pub fn new(name: &str) -> NameHash {
        let name = name.as_bytes();

        NameHash {
            index: hash_string(name, MPQ_HASH_TABLE_INDEX),
            name1: hash_string(name, MPQ_HASH_NAME_A),
            name2: hash_string(name, MPQ_HASH_NAME_B),
            step: hash_string(name, MPQ_HASH_FILE_KEY) | 1,
        }
    }

    pub fn key(&self) -> (u32, u32) {
        (self.name1, self.name2)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct HashEntry {
    pub name1: u32,
    pub name2: u32,
    pub locale: u16,
    pub platform: u16,
    pub block_index: u32,
}

impl HashEntry {
    pub fn empty() -> HashEntry {
        HashEntry {
            name1: 0xFFFF_FFFF,
            name2: 0xFFFF_FFFF,
            locale: 0xFFFF,
            platform: 0xFFFF,
            block_index: HASH_TABLE_EMPTY_ENTRY,
        }
    }

    pub fn from_reader<R: Read>(mut reader: R) -> Result<HashEntry, Error> {
        let name1 = reader.read_u32::<LE>()?;
        let name2 = reader.read_u32::<LE>()?;
        let locale = reader.read_u16::<LE>()?;
        let platform = reader.read_u16::<LE>()?;
        let block_index = reader.read_u32::<LE>()?;

        Ok(HashEntry {
            name1,
            name2,
            locale,
            platform,
            block_index,
        })
    }

    pub fn write<W: Write>(&self, mut writer: W) -> Result<(), IoError> {
        writer.write_u32::<LE>(self.name1)?;
        writer.write_u32::<LE>(self.name2)?;
        writer.write_u16::<LE>(self.locale)?;
        writer.write_u16::<LE>(self.platform)?;
        writer.write_u32::<LE>(self.block_index)?;

        Ok(())
    }

    pub fn is_empty(&self) -> bool {
        self.block_index == HASH_TABLE_EMPTY_ENTRY
    }

    pub fn is_deleted(&self) -> bool {
        self.block_index == HASH_TABLE_DELETED_ENTRY
    }

    /// Holds a block index rather than a sentinel.
    pub fn is_used(&self) -> bool {
        !self.is_empty() && !self.is_deleted()
    }

    fn matches(&self, hash: &NameHash) -> bool {
        self.is_used() && self.name1 == hash.name1 && self.name2 == hash.name2
    }
}

/// Open-addressed name to block mapping.
#[derive(Debug, Clone)]
pub(crate) struct HashTable {
    entries: Vec<HashEntry>,
    probing: Probing,
}

impl HashTable {
    pub fn new(size: usize, probing: Probing) -> HashTable {
        let size = size.max(MIN_HASH_TABLE_SIZE).next_power_of_two();

        HashTable {
            entries: vec![HashEntry::empty(); size],
            probing,
        }
    }

    /// Parses the table out of its encrypted on-disk form.
    pub fn from_raw(
        mut raw: Vec<u8>,
        entries: u32,
        probing: Probing,
    ) -> Result<HashTable, Error> {
        if !entries.is_power_of_two() {
            return Err(Error::corrupted("hash table size is not a power of two"));
        }

        decrypt_mpq_block(&mut raw, HASH_TABLE_KEY);

        let mut slice = &raw[..];
        let entries = (0..entries)
            .map(|_| HashEntry::from_reader(&mut slice))
            .collect::<Result<Vec<_>, _>>()?;

        debug!("loaded hash table with {} slots", entries.len());

        Ok(HashTable { entries, probing })
    }

    pub fn to_raw(&self) -> Result<Vec<u8>, Error> {
        let mut buf = Vec::with_capacity(self.entries.len() * HASH_TABLE_ENTRY_SIZE as usize);
        for entry in &self.entries {
            entry.write(&mut buf)?;
        }
        encrypt_mpq_block(&mut buf, HASH_TABLE_KEY);

        Ok(buf)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn probing(&self) -> Probing {
        self.probing
    }

    pub fn get(&self, slot: usize) -> Option<&HashEntry> {
        self.entries.get(slot)
    }

    pub fn entries(&self) -> impl Iterator<Item = (usize, &HashEntry)> {
        self.entries.iter().enumerate()
    }

    /// Slot sequence visited for `hash`. Every slot is visited exactly once,
    /// since the stride is odd and the table size a power of two.
    fn probe(&self, hash: &NameHash) -> impl Iterator<Item = usize> {
        let mask = self.entries.len() - 1;
        let start = hash.index as usize & mask;
        let step = match self.probing {
            Probing::Double => hash.step as usize & mask | 1,
            Probing::Linear => 1,
        };

        (0..self.entries.len()).map(move |i| (start + i.wrapping_mul(step)) & mask)
    }

    /// All used slots along the probe chain of `hash` whose names match.
    fn matching(&self, hash: &NameHash) -> Vec<usize> {
        let mut found = Vec::new();

        for slot in self.probe(hash) {
            let entry = &self.entries[slot];
            if entry.is_empty() {
                break;
            }
            if entry.matches(hash) {
                found.push(slot);
            }
        }

        found
    }

    /// Finds the slot for a name, preferring an exact locale and platform
    /// match, then the neutral locale, then any entry of that name.
    pub fn lookup(&self, hash: &NameHash, locale: u16, platform: u16) -> Result<usize, Error> {
        let found = self.matching(hash);

        let exact = found.iter().find(|&&slot| {
            let entry = &self.entries[slot];
            entry.locale == locale && entry.platform == platform
        });
        let neutral = found
            .iter()
            .find(|&&slot| self.entries[slot].locale == LOCALE_NEUTRAL);

        exact
            .or(neutral)
            .or_else(|| found.first())
            .copied()
            .ok_or(Error::FileNotFound)
    }

    pub fn lookup_exact(&self, hash: &NameHash, locale: u16, platform: u16) -> Option<usize> {
        self.matching(hash).into_iter().find(|&slot| {
            let entry = &self.entries[slot];
            entry.locale == locale && entry.platform == platform
        })
    }

    /// Claims the first free slot on the probe chain of `hash`.
    ///
    /// An entry with the same name, locale and platform is an error; the
    /// caller removes it first when replacing.
    pub fn insert(
        &mut self,
        hash: &NameHash,
        locale: u16,
        platform: u16,
        block_index: u32,
    ) -> Result<usize, Error> {
        if self.lookup_exact(hash, locale, platform).is_some() {
            return Err(Error::AlreadyExists);
        }

        let slot = self
            .probe(hash)
            .find(|&slot| !self.entries[slot].is_used())
            .ok_or(Error::TableFull)?;

        self.entries[slot] = HashEntry {
            name1: hash.name1,
            name2: hash.name2,
            locale,
            platform,
            block_index,
        };

        Ok(slot)
    }

    /// Turns the slot into a tombstone and returns the block it pointed at.
    pub fn remove(&mut self, hash: &NameHash, locale: u16, platform: u16) -> Result<u32, Error> {
        let slot = self
            .lookup_exact(hash, locale, platform)
            .ok_or(Error::FileNotFound)?;

        Ok(self.remove_slot(slot))
    }

    pub fn remove_slot(&mut self, slot: usize) -> u32 {
        let entry = &mut self.entries[slot];
        let block_index = entry.block_index;

        *entry = HashEntry::empty();
        entry.block_index = HASH_TABLE_DELETED_ENTRY;

        block_index
    }

    /// Points a used slot at another block and returns the one it replaced.
    pub fn set_block(&mut self, slot: usize, block_index: u32) -> u32 {
        std::mem::replace(&mut self.entries[slot].block_index, block_index)
    }

    pub fn references(&self, block_index: u32) -> bool {
        self.entries
            .iter()
            .any(|entry| entry.is_used() && entry.block_index == block_index)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub(crate) struct BlockEntry {
    pub file_pos: u64,
    pub compressed_size: u64,
    pub file_size: u64,
    pub flags: u32,
}

impl BlockEntry {
    pub fn new(file_pos: u64, compressed_size: u64, file_size: u64, flags: u32) -> BlockEntry {
        BlockEntry {
            file_pos,
            compressed_size,
            file_size,
            flags,
        }
    }

    pub fn from_reader<R: Read>(mut reader: R) -> Result<BlockEntry, Error> {
        let file_pos = u64::from(reader.read_u32::<LE>()?);
        let compressed_size = u64::from(reader.read_u32::<LE>()?);
        let file_size = u64::from(reader.read_u32::<LE>()?);
        let flags = reader.read_u32::<LE>()?;

        Ok(BlockEntry {
            file_pos,
            compressed_size,
            file_size,
            flags,
        })
    }

    pub fn write<W: Write>(&self, mut writer: W) -> Result<(), IoError> {
        writer.write_u32::<LE>(self.file_pos as u32)?;
        writer.write_u32::<LE>(self.compressed_size as u32)?;
        writer.write_u32::<LE>(self.file_size as u32)?;
        writer.write_u32::<LE>(self.flags)?;

        Ok(())
    }

    pub fn exists(&self) -> bool {
        (self.flags & MPQ_FILE_EXISTS) != 0
    }

    pub fn is_imploded(&self) -> bool {
        (self.flags & MPQ_FILE_IMPLODE) != 0
    }

    pub fn is_compressed(&self) -> bool {
        (self.flags & MPQ_FILE_COMPRESS) != 0
    }

    /// Compressed by either method, so sectors carry a compression tag.
    pub fn has_compression(&self) -> bool {
        (self.flags & MPQ_FILE_COMPRESS_MASK) != 0
    }

    pub fn is_encrypted(&self) -> bool {
        (self.flags & MPQ_FILE_ENCRYPTED) != 0
    }

    pub fn is_key_fixed(&self) -> bool {
        (self.flags & MPQ_FILE_FIX_KEY) != 0
    }

    pub fn is_single_unit(&self) -> bool {
        (self.flags & MPQ_FILE_SINGLE_UNIT) != 0
    }

    pub fn is_patch_file(&self) -> bool {
        (self.flags & MPQ_FILE_PATCH_FILE) != 0
    }

    pub fn is_delete_marker(&self) -> bool {
        (self.flags & MPQ_FILE_DELETE_MARKER) != 0
    }

    pub fn has_sector_crc(&self) -> bool {
        (self.flags & MPQ_FILE_SECTOR_CRC) != 0
    }

    /// Live entry that occupies bytes in the archive.
    pub fn occupies_space(&self) -> bool {
        self.exists() && self.compressed_size > 0
    }

    pub fn end(&self) -> u64 {
        self.file_pos + self.compressed_size
    }
}

/// Per-file layout records, indexed by the hash table.
#[derive(Debug, Clone, Default)]
pub(crate) struct BlockTable {
    entries: Vec<BlockEntry>,
}

impl BlockTable {
    pub fn new() -> BlockTable {
        BlockTable::default()
    }

    /// Parses the table out of its encrypted on-disk form, merging in the
    /// upper offset bits of the hi-block table when there is one.
    pub fn from_raw(
        mut raw: Vec<u8>,
        entries: u32,
        hi_block: Option<&[u8]>,
    ) -> Result<BlockTable, Error> {
        decrypt_mpq_block(&mut raw, BLOCK_TABLE_KEY);

        let mut slice = &raw[..];
        let mut entries = (0..entries)
            .map(|_| BlockEntry::from_reader(&mut slice))
            .collect::<Result<Vec<_>, _>>()?;

        if let Some(mut hi_block) = hi_block {
            for entry in &mut entries {
                entry.file_pos |= u64::from(hi_block.read_u16::<LE>()?) << 32;
            }
        }

        debug!("loaded block table with {} entries", entries.len());

        Ok(BlockTable { entries })
    }

    pub fn to_raw(&self) -> Result<Vec<u8>, Error> {
        let mut buf = Vec::with_capacity(self.entries.len() * BLOCK_TABLE_ENTRY_SIZE as usize);
        for entry in &self.entries {
            entry.write(&mut buf)?;
        }
        encrypt_mpq_block(&mut buf, BLOCK_TABLE_KEY);

        Ok(buf)
    }

    /// The unencrypted hi-block table, only needed once some file lies
    /// beyond the 4 GiB mark.
    pub fn hi_block_raw(&self) -> Result<Option<Vec<u8>>, Error> {
        if self.entries.iter().all(|entry| entry.file_pos >> 32 == 0) {
            return Ok(None);
        }

        let mut buf = Vec::with_capacity(self.entries.len() * 2);
        for entry in &self.entries {
            buf.write_u16::<LE>((entry.file_pos >> 32) as u16)?;
        }

        Ok(Some(buf))
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn get(&self, index: u32) -> Option<&BlockEntry> {
        self.entries.get(index as usize)
    }

    pub fn update(&mut self, index: u32, entry: BlockEntry) {
        let index = index as usize;
        if index >= self.entries.len() {
            self.entries.resize(index + 1, BlockEntry::default());
        }

        self.entries[index] = entry;
    }

    pub fn entries(&self) -> impl Iterator<Item = (u32, &BlockEntry)> {
        self.entries
            .iter()
            .enumerate()
            .map(|(index, entry)| (index as u32, entry))
    }

    /// Reserves a block index for a new file of `file_size` bytes.
    ///
    /// Indices of entries that no longer exist and that no hash slot refers
    /// to are reused before the table grows.
    pub fn allocate<F>(&mut self, file_size: u64, referenced: F) -> u32
    where
        F: Fn(u32) -> bool,
    {
        let free = self
            .entries()
            .find(|(index, entry)| !entry.exists() && !referenced(*index))
            .map(|(index, _)| index);

        let index = free.unwrap_or(self.entries.len() as u32);
        self.update(index, BlockEntry::new(0, 0, file_size, 0));

        debug!("allocated block {} for {} bytes", index, file_size);

        index
    }

    /// End of the furthest live file, never lower than `data_start`.
    pub fn data_end(&self, data_start: u64) -> u64 {
        self.entries
            .iter()
            .filter(|entry| entry.occupies_space())
            .map(BlockEntry::end)
            .fold(data_start, u64::max)
    }

    /// Pulls entries that hold no bytes, such as delete markers, back to
    /// `data_end` when they point past it.
    pub fn clamp_empty(&mut self, data_end: u64) {
        for entry in &mut self.entries {
            if entry.compressed_size == 0 && entry.file_pos > data_end {
                entry.file_pos = data_end;
            }
        }
    }

    /// First-fit search for `size` bytes between live files, falling back
    /// to the end of data. `exclude` is left out of the occupancy map.
    pub fn find_space(&self, data_start: u64, size: u64, exclude: Option<u32>) -> u64 {
        let mut extents: Vec<(u64, u64)> = self
            .entries()
            .filter(|(index, entry)| entry.occupies_space() && Some(*index) != exclude)
            .map(|(_, entry)| (entry.file_pos, entry.end()))
            .collect();
        extents.sort_unstable();

        let mut cursor = data_start;
        for (start, end) in extents {
            if start >= cursor && start - cursor >= size {
                return cursor;
            }
            cursor = cursor.max(end);
        }

        cursor
    }
}
