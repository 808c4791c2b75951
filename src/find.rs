use std::fs;
use std::path::Path;

use indexmap::IndexMap;

use super::archive::Archive;
use super::consts::*;
use super::error::Error;
use super::listfile;
use super::seeker::Storage;
use super::table::*;
use super::util::*;

/// One entry found by a [`Finder`](struct.Finder.html).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FileFindData {
    /// Full archived name, or a `File00000012.xxx` placeholder when the
    /// name is not known.
    pub name: String,
    pub plain_name: String,
    pub hash_index: u32,
    pub block_index: u32,
    pub file_size: u64,
    pub compressed_size: u64,
    pub flags: u32,
    /// FILETIME from `(attributes)`, zero when not recorded.
    pub file_time: u64,
    pub locale: Locale,
}

/// Walks the hash table in slot order, yielding live entries whose name
/// matches a wildcard mask.
pub struct Finder<'a, S: Storage> {
    archive: &'a Archive<S>,
    mask: String,
    // names from an external listfile, on top of the archive's own
    extra_names: IndexMap<(u32, u32), String>,
    slot: usize,
}

impl<'a, S: Storage> Finder<'a, S> {
    /// The next matching entry, or `NoMoreFiles`.
    pub fn find_next(&mut self) -> Result<FileFindData, Error> {
        while self.slot < self.archive.hash_table.len() {
            let slot = self.slot;
            self.slot += 1;

            if let Some(found) = self.entry_at(slot) {
                return Ok(found);
            }
        }

        Err(Error::NoMoreFiles)
    }

    fn entry_at(&self, slot: usize) -> Option<FileFindData> {
        let hash_entry = self.archive.hash_table.get(slot).filter(|entry| entry.is_used())?;
        let block = self
            .archive
            .block_table
            .get(hash_entry.block_index)
            .filter(|block| block.exists() && !block.is_delete_marker())?;

        let name = self
            .archive
            .name_of(hash_entry)
            .or_else(|| {
                self.extra_names
                    .get(&(hash_entry.name1, hash_entry.name2))
                    .map(String::as_str)
            })
            .map(str::to_string)
            .unwrap_or_else(|| format!("File{:08}.xxx", hash_entry.block_index));

        if !matches_mask(&self.mask, &name) {
            return None;
        }

        let file_time = self
            .archive
            .attributes
            .as_ref()
            .and_then(|attributes| attributes.get(hash_entry.block_index))
            .map_or(0, |attributes| attributes.file_time);

        Some(FileFindData {
            plain_name: plain_name(&name).to_string(),
            name,
            hash_index: slot as u32,
            block_index: hash_entry.block_index,
            file_size: block.file_size,
            compressed_size: block.compressed_size,
            flags: block.flags,
            file_time,
            locale: hash_entry.locale,
        })
    }
}

impl<'a, S: Storage> Iterator for Finder<'a, S> {
    type Item = FileFindData;

    fn next(&mut self) -> Option<FileFindData> {
        self.find_next().ok()
    }
}

impl<S: Storage> Archive<S> {
    /// Starts enumerating entries whose names match `mask` (`*` and `?`
    /// wildcards, case-insensitive). Names in `listfile`, if given, are used
    /// for entries the archive cannot name itself.
    ///
    /// Returns `NoMoreFiles` when nothing matches.
    pub fn find_first(
        &self,
        mask: &str,
        listfile: Option<&Path>,
    ) -> Result<(Finder<'_, S>, FileFindData), Error> {
        let mut extra_names = IndexMap::new();
        if let Some(path) = listfile {
            for name in listfile::parse(&fs::read(path)?) {
                let name = normalize_name(&name);
                extra_names.insert(NameHash::new(&name).key(), name);
            }
        }

        let mut finder = Finder {
            archive: self,
            mask: normalize_name(mask),
            extra_names,
            slot: 0,
        };
        let first = finder.find_next()?;

        Ok((finder, first))
    }
}

/// Matches `name` against a mask where `*` is any run of characters and
/// `?` is exactly one, ignoring ASCII case.
pub(crate) fn matches_mask(mask: &str, name: &str) -> bool {
    let mask = mask.as_bytes();
    let name = name.as_bytes();

    let (mut m, mut n) = (0, 0);
    // position after the last star, and the name position it was tried at
    let mut backtrack: Option<(usize, usize)> = None;

    while n < name.len() {
        match mask.get(m) {
            Some(b'*') => {
                m += 1;
                backtrack = Some((m, n));
            }
            Some(&c) if c == b'?' || c.eq_ignore_ascii_case(&name[n]) => {
                m += 1;
                n += 1;
            }
            _ => match backtrack {
                Some((star_m, star_n)) => {
                    m = star_m;
                    n = star_n + 1;
                    backtrack = Some((star_m, star_n + 1));
                }
                None => return false,
            },
        }
    }

    mask[m..].iter().all(|&c| c == b'*')
}
