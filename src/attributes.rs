use std::io::Read;

use byteorder::{ReadBytesExt, WriteBytesExt, LE};

use super::consts::*;
use super::error::Error;

/// Extended attributes of a single block.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub(crate) struct FileAttributes {
    pub crc32: u32,
    pub file_time: u64,
    pub md5: [u8; 16],
}

/// Contents of the `(attributes)` file: checksums and timestamps indexed
/// by block.
#[derive(Debug, Clone)]
pub(crate) struct Attributes {
    flags: u32,
    entries: Vec<FileAttributes>,
}

impl Default for Attributes {
    fn default() -> Attributes {
        Attributes {
            flags: ATTRIBUTES_CRC32 | ATTRIBUTES_FILETIME | ATTRIBUTES_MD5,
            entries: Vec::new(),
        }
    }
}

impl Attributes {
    pub fn parse(data: &[u8], block_count: usize) -> Result<Attributes, Error> {
        let mut reader = data;

        let version = reader.read_u32::<LE>()?;
        if version != ATTRIBUTES_VERSION {
            return Err(Error::corrupted("unknown attributes version"));
        }

        let flags = reader.read_u32::<LE>()?;
        let mut entries = vec![FileAttributes::default(); block_count];

        if flags & ATTRIBUTES_CRC32 != 0 {
            for entry in &mut entries {
                entry.crc32 = reader.read_u32::<LE>()?;
            }
        }

        if flags & ATTRIBUTES_FILETIME != 0 {
            for entry in &mut entries {
                entry.file_time = reader.read_u64::<LE>()?;
            }
        }

        if flags & ATTRIBUTES_MD5 != 0 {
            for entry in &mut entries {
                reader.read_exact(&mut entry.md5)?;
            }
        }

        // the patch bit array is derived from block flags when written back
        Ok(Attributes {
            flags: flags & !ATTRIBUTES_PATCH_BIT,
            entries,
        })
    }

    /// Serializes attributes for `block_count` blocks. `is_patch` selects
    /// the blocks recorded in the trailing patch bit array.
    pub fn to_bytes<F>(&self, block_count: usize, is_patch: F) -> Result<Vec<u8>, Error>
    where
        F: Fn(usize) -> bool,
    {
        let entry = |index: usize| self.entries.get(index).copied().unwrap_or_default();
        let patch_bits = (0..block_count).any(&is_patch);

        let mut flags = self.flags;
        if patch_bits {
            flags |= ATTRIBUTES_PATCH_BIT;
        }

        let mut out = Vec::new();
        out.write_u32::<LE>(ATTRIBUTES_VERSION)?;
        out.write_u32::<LE>(flags)?;

        if flags & ATTRIBUTES_CRC32 != 0 {
            for index in 0..block_count {
                out.write_u32::<LE>(entry(index).crc32)?;
            }
        }

        if flags & ATTRIBUTES_FILETIME != 0 {
            for index in 0..block_count {
                out.write_u64::<LE>(entry(index).file_time)?;
            }
        }

        if flags & ATTRIBUTES_MD5 != 0 {
            for index in 0..block_count {
                out.extend_from_slice(&entry(index).md5);
            }
        }

        if patch_bits {
            let mut bits = vec![0u8; (block_count + 7) / 8];
            for index in (0..block_count).filter(|index| is_patch(*index)) {
                bits[index / 8] |= 0x80 >> (index % 8);
            }
            out.extend_from_slice(&bits);
        }

        Ok(out)
    }

    pub fn has_crc32(&self) -> bool {
        self.flags & ATTRIBUTES_CRC32 != 0
    }

    pub fn has_md5(&self) -> bool {
        self.flags & ATTRIBUTES_MD5 != 0
    }

    pub fn get(&self, index: u32) -> Option<&FileAttributes> {
        self.entries.get(index as usize)
    }

    pub fn set(&mut self, index: u32, attributes: FileAttributes) {
        let index = index as usize;
        if index >= self.entries.len() {
            self.entries.resize(index + 1, FileAttributes::default());
        }

        self.entries[index] = attributes;
    }

    pub fn clear(&mut self, index: u32) {
        if let Some(entry) = self.entries.get_mut(index as usize) {
            *entry = FileAttributes::default();
        }
    }

    /// Moves entries to new block indices; `mapping[old] = Some(new)`.
    pub fn remap(&mut self, mapping: &[Option<u32>]) {
        let mut entries = Vec::new();
        for (old, new) in mapping.iter().enumerate() {
            if let (Some(new), Some(entry)) = (new, self.entries.get(old)) {
                let new = *new as usize;
                if new >= entries.len() {
                    entries.resize(new + 1, FileAttributes::default());
                }
                entries[new] = *entry;
            }
        }

        self.entries = entries;
    }
}
