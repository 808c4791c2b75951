use std::io::{Read, Seek, SeekFrom, Write};
use std::path::Path;

use byteorder::{ByteOrder, LE};
use log::{debug, info, warn};

use super::archive::{hash_table_size_for, Archive};
use super::codec::SectorOffsets;
use super::consts::*;
use super::crypto::*;
use super::error::Error;
use super::seeker::Storage;
use super::table::*;
use super::util::*;

const COPY_CHUNK_SIZE: usize = 0x10000;

/// A named entry carried over into the rebuilt tables.
struct Survivor {
    name: String,
    locale: u16,
    platform: u16,
    block: u32,
}

impl<S: Storage> Archive<S> {
    /// Rewrites the archive without the holes left by removed and replaced
    /// files. Names in `listfile` are learned first; live entries whose
    /// name is still unknown cannot be rehashed and are dropped.
    ///
    /// File data is copied as stored, never recompressed. The new layout is
    /// assembled in a scratch file, so a failure leaves the archive as it was.
    pub fn compact(&mut self, listfile: Option<&Path>) -> Result<(), Error> {
        self.ensure_writable()?;

        if let Some(path) = listfile {
            self.add_listfile(path)?;
        }

        let size = self.hash_table.len();
        self.rebuild(size, false)
    }

    /// Rebuilds the hash table with room for `count` files. Every live
    /// entry must have a known name.
    pub fn set_max_file_count(&mut self, count: usize) -> Result<(), Error> {
        self.ensure_writable()?;

        let reserved = INTERNAL_FILES
            .iter()
            .filter(|name| self.has_file(name).unwrap_or(false))
            .count();

        self.rebuild(hash_table_size_for(count + reserved), true)
    }

    fn survivors(&self, strict: bool) -> Result<Vec<Survivor>, Error> {
        let mut survivors = Vec::new();

        for (hash_entry, _) in self.live_entries() {
            let name = match self.name_of(hash_entry) {
                Some(name) => name,
                None if strict => {
                    return Err(Error::Unsupported {
                        feature: "rehashing files whose names are unknown",
                    })
                }
                None => {
                    warn!(
                        "dropping block {}: its name is unknown",
                        hash_entry.block_index
                    );
                    continue;
                }
            };

            // regenerated from the rebuilt tables
            if name.eq_ignore_ascii_case(LISTFILE_NAME) || name.eq_ignore_ascii_case(ATTRIBUTES_NAME)
            {
                continue;
            }

            survivors.push(Survivor {
                name: name.to_string(),
                locale: hash_entry.locale,
                platform: hash_entry.platform,
                block: hash_entry.block_index,
            });
        }

        Ok(survivors)
    }

    fn rebuild(&mut self, hash_table_size: usize, strict: bool) -> Result<(), Error> {
        let size_before = self.header.archive_size;
        let survivors = self.survivors(strict)?;

        // blocks in on-disk order, each listed once
        let mut blocks: Vec<(u32, BlockEntry, &str)> = Vec::new();
        for survivor in &survivors {
            if blocks.iter().any(|(block, _, _)| *block == survivor.block) {
                continue;
            }
            if let Some(entry) = self.block_table.get(survivor.block) {
                blocks.push((survivor.block, *entry, &survivor.name));
            }
        }
        blocks.sort_by_key(|(_, entry, _)| entry.file_pos);

        let header_size = self.header_size();
        let sector_size = self.sector_size();
        let mut mapping = vec![None; self.block_table.len()];
        let mut block_table = BlockTable::new();
        let mut scratch = tempfile::tempfile()?;
        let mut cursor = header_size;

        for (new_index, (old_index, entry, name)) in blocks.iter().enumerate() {
            let new_index = new_index as u32;
            let mut data = if entry.compressed_size == 0 {
                Vec::new()
            } else {
                self.read_raw(entry.file_pos, entry.compressed_size)?
            };

            if entry.is_encrypted() && entry.is_key_fixed() && entry.file_pos != cursor {
                let old_key = calculate_file_key(name, entry.file_pos, entry.file_size, true);
                let new_key = calculate_file_key(name, cursor, entry.file_size, true);
                rekey(&mut data, entry, old_key, new_key, sector_size)?;
            }

            scratch.write_all(&data)?;
            block_table.update(new_index, BlockEntry { file_pos: cursor, ..*entry });
            mapping[*old_index as usize] = Some(new_index);
            cursor += entry.compressed_size;
        }

        let mut hash_table = HashTable::new(hash_table_size, self.hash_table.probing());
        for survivor in &survivors {
            let block = match mapping.get(survivor.block as usize).copied().flatten() {
                Some(block) => block,
                None => continue,
            };

            hash_table.insert(
                &NameHash::new(&survivor.name),
                survivor.locale,
                survivor.platform,
                block,
            )?;
        }

        // nothing has touched the storage up to here
        scratch.seek(SeekFrom::Start(0))?;
        let mut offset = header_size;
        let mut chunk = vec![0u8; COPY_CHUNK_SIZE];
        loop {
            let read = scratch.read(&mut chunk)?;
            if read == 0 {
                break;
            }
            self.write_raw(offset, &chunk[..read])?;
            offset += read as u64;
        }

        debug!(
            "relocated {} blocks into {} bytes",
            block_table.len(),
            cursor - header_size
        );

        self.hash_table = hash_table;
        self.block_table = block_table;
        if let Some(attributes) = &mut self.attributes {
            attributes.remap(&mapping);
        }
        self.names_dirty = true;
        self.dirty = true;
        self.flush()?;

        info!(
            "compacted archive from {} to {} bytes, {} hash slots",
            size_before,
            self.header.archive_size,
            self.hash_table.len()
        );

        Ok(())
    }
}

/// Re-encrypts a stored file whose key depends on its position.
fn rekey(
    data: &mut [u8],
    entry: &BlockEntry,
    old_key: u32,
    new_key: u32,
    sector_size: u64,
) -> Result<(), Error> {
    let start = if entry.is_patch_file() && data.len() >= 4 {
        LE::read_u32(data) as usize
    } else {
        0
    };
    let body = data
        .get_mut(start..)
        .ok_or_else(|| Error::corrupted("patch info is larger than the file"))?;

    let recrypt = |unit: &mut [u8], index: u32| {
        decrypt_mpq_block(unit, old_key.wrapping_add(index));
        encrypt_mpq_block(unit, new_key.wrapping_add(index));
    };

    if entry.is_single_unit() {
        recrypt(body, 0);
        return Ok(());
    }

    if !entry.has_compression() {
        for (index, sector) in body.chunks_mut(sector_size as usize).enumerate() {
            recrypt(sector, index as u32);
        }
        return Ok(());
    }

    if entry.file_size == 0 {
        return Ok(());
    }

    let sectors = sector_count_from_size(entry.file_size, sector_size);
    let entries = sectors + 1 + if entry.has_sector_crc() { 1 } else { 0 };
    let table_size = SectorOffsets::table_size(entries) as usize;
    let raw_table = body
        .get(..table_size)
        .ok_or_else(|| Error::corrupted("sector offset table is truncated"))?
        .to_vec();

    let offsets = SectorOffsets::from_raw(raw_table, Some(old_key))?;
    body[..table_size].copy_from_slice(&offsets.to_raw(Some(new_key))?);

    for index in 0..sectors as usize {
        let (offset, len) = offsets
            .sector(index)
            .ok_or_else(|| Error::corrupted("sector missing from the offset table"))?;
        let end = u64::from(offset) + u64::from(len);
        let sector = body
            .get_mut(offset as usize..end as usize)
            .ok_or_else(|| Error::corrupted("sector extends past the file"))?;
        recrypt(sector, index as u32);
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use std::io::Cursor;

    use super::*;
    use crate::writer::FileOptions;

    #[test]
    fn fixed_key_files_survive_relocation() {
        let mut buf = Cursor::new(Vec::new());
        let data: Vec<u8> = (0..10_000u32).map(|i| (i % 13) as u8).collect();
        let options = FileOptions {
            compress: true,
            encrypt: true,
            fix_key: true,
            sector_crc: true,
            ..FileOptions::default()
        };

        {
            let mut archive = Archive::create(&mut buf).unwrap();
            archive
                .add_file("first.bin", &[1; 5000], FileOptions::default())
                .unwrap();
            archive.add_file("moved.bin", &data, options).unwrap();
            archive.remove_file("first.bin", LOCALE_NEUTRAL).unwrap();
            archive.compact(None).unwrap();
        }

        let archive = crate::archive::OpenOptions::new()
            .check_sector_crc(true)
            .open(&mut buf)
            .unwrap();
        assert_eq!(archive.read_file("moved.bin").unwrap(), data);
        assert!(!archive.has_file("first.bin").unwrap());
    }

    #[test]
    fn hash_table_can_grow_when_names_are_known() {
        let mut buf = Cursor::new(Vec::new());
        let mut archive = crate::archive::CreateOptions::new()
            .max_file_count(2)
            .create(&mut buf)
            .unwrap();

        for i in 0..3 {
            archive
                .add_file(&format!("{}.txt", i), b"x", FileOptions::default())
                .unwrap();
        }
        assert_eq!(archive.max_file_count(), 4);
        assert!(matches!(
            archive.add_file("3.txt", b"x", FileOptions::default()),
            Err(Error::TableFull)
        ));

        archive.set_max_file_count(100).unwrap();
        assert_eq!(archive.max_file_count(), 128);
        archive
            .add_file("3.txt", b"x", FileOptions::default())
            .unwrap();
        assert_eq!(archive.files().len(), 4);
    }

    #[test]
    fn unknown_names_block_resizing() {
        let mut buf = Cursor::new(Vec::new());
        {
            let mut archive = Archive::create(&mut buf).unwrap();
            archive
                .add_file("a.txt", b"a", FileOptions::default())
                .unwrap();
        }

        let mut archive = crate::archive::OpenOptions::new()
            .no_listfile(true)
            .open(&mut buf)
            .unwrap();
        assert!(matches!(
            archive.set_max_file_count(64),
            Err(Error::Unsupported { .. })
        ));
    }

    #[test]
    fn delete_markers_survive_shrinking_and_compaction() {
        let mut buf = Cursor::new(Vec::new());
        {
            let mut archive = Archive::create(&mut buf).unwrap();
            archive
                .add_file("kept.txt", b"kept", FileOptions::default())
                .unwrap();
            archive
                .add_file("big.bin", &[7; 30_000], FileOptions::default())
                .unwrap();
            archive
                .add_delete_marker("gone.txt", LOCALE_NEUTRAL)
                .unwrap();
            archive.remove_file("big.bin", LOCALE_NEUTRAL).unwrap();
            archive.close().unwrap();
        }

        let mut archive = crate::archive::OpenOptions::new()
            .open(&mut buf)
            .unwrap();
        let archive_size = archive.archive_size();
        assert!(archive
            .block_table
            .entries()
            .filter(|(_, entry)| entry.compressed_size == 0)
            .all(|(_, entry)| entry.file_pos <= archive_size));

        archive.compact(None).unwrap();
        assert!(!archive.has_file("gone.txt").unwrap());
        assert!(!archive.has_file("big.bin").unwrap());
        assert_eq!(archive.read_file("kept.txt").unwrap(), b"kept");
    }

    #[test]
    fn undersized_tables_leave_the_archive_untouched() {
        let mut buf = Cursor::new(Vec::new());
        {
            let mut archive = Archive::create(&mut buf).unwrap();
            for i in 0..6 {
                archive
                    .add_file(&format!("{}.txt", i), b"x", FileOptions::default())
                    .unwrap();
            }
            archive.close().unwrap();
        }
        let before = buf.get_ref().clone();

        {
            let mut archive = crate::archive::OpenOptions::new()
                .open(&mut buf)
                .unwrap();
            assert!(matches!(
                archive.set_max_file_count(1),
                Err(Error::TableFull)
            ));
            assert_eq!(archive.files().len(), 6);
        }

        assert!(buf.get_ref() == &before);
    }

    #[test]
    fn corruption_found_while_compacting_aborts_it() {
        let mut buf = Cursor::new(Vec::new());
        let data: Vec<u8> = (0..10_000u32).map(|i| (i % 13) as u8).collect();
        let options = FileOptions {
            compress: true,
            encrypt: true,
            fix_key: true,
            sector_crc: true,
            ..FileOptions::default()
        };

        {
            let mut archive = crate::archive::CreateOptions::new()
                .listfile(false)
                .create(&mut buf)
                .unwrap();
            archive
                .add_file("first.bin", &[1; 5000], FileOptions::default())
                .unwrap();
            archive.add_file("moved.bin", &data, options).unwrap();
            archive
                .add_file("kept.txt", b"kept", FileOptions::default())
                .unwrap();
            archive.remove_file("first.bin", LOCALE_NEUTRAL).unwrap();
            archive.close().unwrap();
        }

        // three sectors and a checksum table, with the third sector running
        // far past the end of the file
        let file_pos = u64::from(HEADER_SIZE_V1) + 5000;
        let key = calculate_file_key("moved.bin", file_pos, data.len() as u64, true);
        let garbage = SectorOffsets::new(vec![20, 20, 20, 0xFFFF_FFF0, 0xFFFF_FFF4])
            .to_raw(Some(key))
            .unwrap();
        let start = file_pos as usize;
        buf.get_mut()[start..start + garbage.len()].copy_from_slice(&garbage);
        let before = buf.get_ref().clone();

        {
            let mut archive = crate::archive::OpenOptions::new()
                .open(&mut buf)
                .unwrap();
            assert!(matches!(
                archive.compact(None),
                Err(Error::Corrupted { .. })
            ));
            assert_eq!(archive.read_file("kept.txt").unwrap(), b"kept");
        }

        assert!(buf.get_ref() == &before);
        let archive = crate::archive::OpenOptions::new()
            .read_only(true)
            .open(&mut buf)
            .unwrap();
        assert_eq!(archive.read_file("kept.txt").unwrap(), b"kept");
        assert!(!archive.has_file("first.bin").unwrap());
    }
}
