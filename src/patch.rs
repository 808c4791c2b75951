//! Patch chains: archives stacked over a base archive, where newer layers
//! shadow, delete or binary-patch the files of older ones.

use std::fs::File;
use std::io::Read;
use std::path::Path;

use byteorder::{ReadBytesExt, LE};
use log::{debug, info};
use md5::{Digest, Md5};

use super::archive::{Archive, Located, OpenOptions};
use super::consts::*;
use super::error::Error;
use super::reader::read_stored;
use super::seeker::Storage;
use super::util::*;

const PATCH_HEADER_SIZE: usize = 0x44;
const XFRM_HEADER_SIZE: u32 = 0x0C;
const MD5_BLOCK_SIZE: u32 = 0x28;
const BSDIFF_HEADER_SIZE: usize = 32;

pub(crate) struct PatchLayer<S: Storage> {
    pub archive: Archive<S>,
    /// Prepended to names looked up in this layer, ends with a backslash
    /// unless empty.
    pub prefix: String,
}

/// Outcome of resolving a name through the patch chain.
pub(crate) enum Resolved<'a, S: Storage> {
    /// Read the file as stored in one layer.
    Stored {
        archive: &'a Archive<S>,
        name: String,
        located: Located,
    },
    /// Content assembled by applying patches.
    Patched(Vec<u8>),
}

impl<S: Storage> Archive<S> {
    /// Stacks `patch` over this archive. Layers added later take precedence;
    /// `prefix` is prepended to every name looked up in the new layer.
    pub fn open_patch(&mut self, patch: Archive<S>, prefix: &str) -> Result<(), Error> {
        let mut prefix = normalize_name(prefix);
        if !prefix.is_empty() && !prefix.ends_with('\\') {
            prefix.push('\\');
        }

        info!(
            "patch layer {} added with prefix {:?}",
            self.patches.len() + 1,
            prefix
        );

        self.patches.push(PatchLayer {
            archive: patch,
            prefix,
        });

        Ok(())
    }

    pub fn is_patched(&self) -> bool {
        !self.patches.is_empty()
    }
}

impl Archive<File> {
    /// Opens the archive at `path` read-only and stacks it over this one.
    pub fn open_patch_path<P: AsRef<Path>>(&mut self, path: P, prefix: &str) -> Result<(), Error> {
        let patch = OpenOptions::new().read_only(true).open_path(path)?;

        self.open_patch(patch, prefix)
    }
}

/// Finds the authoritative content for `name`, newest layer first.
pub(crate) fn resolve<'a, S: Storage>(
    base: &'a Archive<S>,
    name: &str,
    locale: Locale,
) -> Result<Resolved<'a, S>, Error> {
    let mut layers: Vec<(&'a Archive<S>, String)> = vec![(base, name.to_string())];
    layers.extend(
        base.patches
            .iter()
            .map(|layer| (&layer.archive, format!("{}{}", layer.prefix, name))),
    );

    // patch blobs collected on the way down, newest first
    let mut deltas = Vec::new();

    for (archive, layer_name) in layers.into_iter().rev() {
        let located = match archive.locate(&layer_name, locale) {
            Ok(located) => located,
            Err(error) if error.is_not_found() => continue,
            Err(error) => return Err(error),
        };

        if located.entry.is_delete_marker() {
            if deltas.is_empty() {
                return Err(Error::FileNotFound);
            }
            break;
        }

        if located.entry.is_patch_file() && base.is_patched() {
            debug!("{} is patched by {}", name, layer_name);
            deltas.push(read_stored(archive, &layer_name, &located)?);
            continue;
        }

        if deltas.is_empty() {
            return Ok(Resolved::Stored {
                archive,
                name: layer_name,
                located,
            });
        }

        let data = read_stored(archive, &layer_name, &located)?;
        return apply_all(data, &deltas).map(Resolved::Patched);
    }

    if deltas.is_empty() {
        Err(Error::FileNotFound)
    } else {
        apply_all(Vec::new(), &deltas).map(Resolved::Patched)
    }
}

fn apply_all(mut data: Vec<u8>, deltas: &[Vec<u8>]) -> Result<Vec<u8>, Error> {
    for delta in deltas.iter().rev() {
        data = apply_patch(&data, delta)?;
    }

    Ok(data)
}

fn md5_of(data: &[u8]) -> [u8; 16] {
    Md5::digest(data).into()
}

#[derive(Debug)]
struct PatchHeader {
    patch_data_size: u32,
    size_after: u32,
    md5_before: [u8; 16],
    md5_after: [u8; 16],
    xfrm_block_size: u32,
    patch_type: u32,
}

impl PatchHeader {
    fn from_reader<R: Read>(mut reader: R) -> Result<PatchHeader, Error> {
        if reader.read_u32::<LE>()? != PATCH_SIGNATURE_PTCH {
            return Err(Error::corrupted("patch does not start with PTCH"));
        }
        let patch_data_size = reader.read_u32::<LE>()?;
        let _size_before = reader.read_u32::<LE>()?;
        let size_after = reader.read_u32::<LE>()?;

        if reader.read_u32::<LE>()? != PATCH_SIGNATURE_MD5 {
            return Err(Error::corrupted("patch is missing its MD5_ block"));
        }
        let _md5_block_size = reader.read_u32::<LE>()?;
        let mut md5_before = [0u8; 16];
        let mut md5_after = [0u8; 16];
        reader.read_exact(&mut md5_before)?;
        reader.read_exact(&mut md5_after)?;

        if reader.read_u32::<LE>()? != PATCH_SIGNATURE_XFRM {
            return Err(Error::corrupted("patch is missing its XFRM block"));
        }
        let xfrm_block_size = reader.read_u32::<LE>()?;
        let patch_type = reader.read_u32::<LE>()?;

        if xfrm_block_size < XFRM_HEADER_SIZE {
            return Err(Error::corrupted("XFRM block is too small"));
        }

        Ok(PatchHeader {
            patch_data_size,
            size_after,
            md5_before,
            md5_after,
            xfrm_block_size,
            patch_type,
        })
    }
}

/// Applies a `PTCH` blob to `old`, checking the MD5 of the result.
pub(crate) fn apply_patch(old: &[u8], blob: &[u8]) -> Result<Vec<u8>, Error> {
    let header = PatchHeader::from_reader(blob)?;
    let data_len = (header.xfrm_block_size - XFRM_HEADER_SIZE) as usize;
    let data = blob
        .get(PATCH_HEADER_SIZE..PATCH_HEADER_SIZE + data_len)
        .ok_or_else(|| Error::corrupted("patch data is truncated"))?;

    let new = match header.patch_type {
        PATCH_TYPE_COPY => data.to_vec(),
        PATCH_TYPE_BSD0 => {
            if md5_of(old) != header.md5_before {
                return Err(Error::corrupted("patch does not apply to this file"));
            }

            let size_after = header.size_after as usize;
            let unpacked_size = (header.patch_data_size as usize).saturating_sub(PATCH_HEADER_SIZE);
            if data.len() < unpacked_size {
                apply_bsdiff40(old, &rle_decode(data, unpacked_size)?, size_after)?
            } else {
                apply_bsdiff40(old, data, size_after)?
            }
        }
        _ => {
            return Err(Error::Unsupported {
                feature: "patch transforms other than COPY and BSD0",
            })
        }
    };

    if new.len() != header.size_after as usize || md5_of(&new) != header.md5_after {
        return Err(Error::corrupted("patched file failed its MD5 check"));
    }

    Ok(new)
}

/// Unpacks the run-length coding Blizzard wraps around BSD0 data: after a
/// leading u32, a byte with the high bit set is followed by that many (plus
/// one) literal bytes; any other byte skips that many (plus one) zeros.
fn rle_decode(data: &[u8], size: usize) -> Result<Vec<u8>, Error> {
    let packed = data
        .get(4..)
        .ok_or_else(|| Error::corrupted("RLE data is truncated"))?;
    // one control byte never stands for more than 128 output bytes
    if size > packed.len().saturating_mul(128) {
        return Err(Error::corrupted("RLE size exceeds what the data can hold"));
    }

    let mut out = vec![0u8; size];
    let mut input = packed.iter();
    let mut position = 0;

    while position < size {
        let control = match input.next() {
            Some(control) => *control,
            None => break,
        };

        if control & 0x80 != 0 {
            for _ in 0..=(control & 0x7F) {
                if position >= size {
                    break;
                }
                out[position] = *input
                    .next()
                    .ok_or_else(|| Error::corrupted("RLE literal run is truncated"))?;
                position += 1;
            }
        } else {
            position += usize::from(control) + 1;
        }
    }

    Ok(out)
}

/// Applies a little-endian bsdiff40 patch. Control triples are u32 values;
/// the old-file move is in sign-magnitude form. The result must be
/// `expected_size` bytes long.
fn apply_bsdiff40(old: &[u8], patch: &[u8], expected_size: usize) -> Result<Vec<u8>, Error> {
    let mut header = patch;
    if header.read_u64::<LE>()? != BSDIFF40_SIGNATURE {
        return Err(Error::corrupted("patch data is not BSDIFF40"));
    }
    let ctrl_size = header.read_u64::<LE>()? as usize;
    let data_size = header.read_u64::<LE>()? as usize;
    let new_size = header.read_u64::<LE>()?;
    if new_size != expected_size as u64 {
        return Err(Error::corrupted("bsdiff output size does not match the patch"));
    }
    let new_size = expected_size;

    let body = &patch[BSDIFF_HEADER_SIZE..];
    if ctrl_size.saturating_add(data_size) > body.len() {
        return Err(Error::corrupted("bsdiff blocks are truncated"));
    }
    let (mut ctrl, rest) = body.split_at(ctrl_size);
    let (mut diff, mut extra) = rest.split_at(data_size);

    let mut new = vec![0u8; new_size];
    let mut new_offset = 0usize;
    let mut old_offset = 0u32;

    while new_offset < new_size {
        let add = ctrl.read_u32::<LE>()? as usize;
        let copy = ctrl.read_u32::<LE>()? as usize;
        let mut old_move = ctrl.read_u32::<LE>()?;

        if new_offset + add > new_size || add > diff.len() {
            return Err(Error::corrupted("bsdiff add block overruns"));
        }
        for i in 0..add {
            let mut byte = diff[i];
            if let Some(old_byte) = old.get(old_offset as usize + i) {
                byte = byte.wrapping_add(*old_byte);
            }
            new[new_offset + i] = byte;
        }
        diff = &diff[add..];
        new_offset += add;
        old_offset = old_offset.wrapping_add(add as u32);

        if new_offset + copy > new_size || copy > extra.len() {
            return Err(Error::corrupted("bsdiff extra block overruns"));
        }
        new[new_offset..new_offset + copy].copy_from_slice(&extra[..copy]);
        extra = &extra[copy..];
        new_offset += copy;

        if old_move & 0x8000_0000 != 0 {
            old_move = 0x8000_0000u32.wrapping_sub(old_move);
        }
        old_offset = old_offset.wrapping_add(old_move);
    }

    Ok(new)
}

fn write_patch(before: &[u8], after: &[u8], patch_type: u32, data: &[u8]) -> Vec<u8> {
    let mut out = Vec::with_capacity(PATCH_HEADER_SIZE + data.len());
    let words = |out: &mut Vec<u8>, values: &[u32]| {
        for word in values {
            out.extend_from_slice(&word.to_le_bytes());
        }
    };

    words(
        &mut out,
        &[
            PATCH_SIGNATURE_PTCH,
            (PATCH_HEADER_SIZE + data.len()) as u32,
            before.len() as u32,
            after.len() as u32,
            PATCH_SIGNATURE_MD5,
            MD5_BLOCK_SIZE,
        ],
    );
    out.extend_from_slice(&md5_of(before));
    out.extend_from_slice(&md5_of(after));
    words(
        &mut out,
        &[
            PATCH_SIGNATURE_XFRM,
            XFRM_HEADER_SIZE + data.len() as u32,
            patch_type,
        ],
    );

    out.extend_from_slice(data);
    out
}

/// Builds a `PTCH` blob that replaces `before` with `after` wholesale. Store
/// it with `FileOptions::patch_file` under the patched file's name.
pub fn copy_patch(before: &[u8], after: &[u8]) -> Vec<u8> {
    write_patch(before, after, PATCH_TYPE_COPY, after)
}

#[cfg(test)]
mod tests {
    use byteorder::WriteBytesExt;

    use super::*;

    fn bsdiff(ctrl: &[(u32, u32, u32)], diff: &[u8], extra: &[u8], new_size: u64) -> Vec<u8> {
        let mut out = Vec::new();
        out.write_u64::<LE>(BSDIFF40_SIGNATURE).unwrap();
        out.write_u64::<LE>(ctrl.len() as u64 * 12).unwrap();
        out.write_u64::<LE>(diff.len() as u64).unwrap();
        out.write_u64::<LE>(new_size).unwrap();
        for (add, copy, seek) in ctrl {
            out.write_u32::<LE>(*add).unwrap();
            out.write_u32::<LE>(*copy).unwrap();
            out.write_u32::<LE>(*seek).unwrap();
        }
        out.extend_from_slice(diff);
        out.extend_from_slice(extra);
        out
    }

    #[test]
    fn copy_patch_replaces_content() {
        let blob = copy_patch(b"old", b"brand new");
        assert_eq!(apply_patch(b"old", &blob).unwrap(), b"brand new");

        let mut broken = blob.clone();
        let last = broken.len() - 1;
        broken[last] ^= 1;
        assert!(apply_patch(b"old", &broken).is_err());
    }

    #[test]
    fn bsdiff_adds_copies_and_seeks_backwards() {
        let old = b"abcdef";
        // add 3 bytes onto "abc", insert "XY", jump back 3, add 2 onto "ab"
        let diff = [1u8, 1, 1, 0, 0];
        let ctrl = [(3, 2, 0x8000_0003), (2, 0, 0)];
        let patch = bsdiff(&ctrl, &diff, b"XY", 7);

        assert_eq!(apply_bsdiff40(old, &patch, 7).unwrap(), b"bcdXYab");
    }

    #[test]
    fn bsdiff_rejects_overruns() {
        let patch = bsdiff(&[(10, 0, 0)], &[0; 4], b"", 10);
        assert!(apply_bsdiff40(b"0123456789", &patch, 10).is_err());
    }

    #[test]
    fn bsdiff_sizes_must_match_the_patch_header() {
        let patch = bsdiff(&[(2, 0, 0)], &[0, 0], b"", u64::from(u32::MAX) * 4);
        assert!(matches!(
            apply_bsdiff40(b"ab", &patch, 2),
            Err(Error::Corrupted { .. })
        ));
    }

    #[test]
    fn oversized_patches_are_rejected_before_allocating() {
        let old = b"abcdef".to_vec();
        let new = b"bcdXYab".to_vec();
        let diff = bsdiff(&[(3, 2, 0x8000_0003), (2, 0, 0)], &[1, 1, 1, 0, 0], b"XY", 7);
        let mut blob = write_patch(&old, &new, PATCH_TYPE_BSD0, &diff);

        // claim an RLE-packed payload of almost 4 GiB
        blob[4..8].copy_from_slice(&0xFFFF_FFF0u32.to_le_bytes());
        assert!(matches!(
            apply_patch(&old, &blob),
            Err(Error::Corrupted { .. })
        ));

        assert!(rle_decode(&[0, 0, 0, 0, 0x7F], 1 << 30).is_err());
    }

    #[test]
    fn rle_expands_literals_and_zero_runs() {
        // leading u32, 2 literals, 3 zeros, 1 literal
        let packed = [0, 0, 0, 0, 0x81, 7, 8, 0x02, 0x80, 9];
        assert_eq!(rle_decode(&packed, 7).unwrap(), vec![7, 8, 0, 0, 0, 9, 0]);
    }

    #[test]
    fn bsd0_patches_check_their_base() {
        let old = b"abcdef".to_vec();
        let new = b"bcdXYab".to_vec();
        let diff = bsdiff(&[(3, 2, 0x8000_0003), (2, 0, 0)], &[1, 1, 1, 0, 0], b"XY", 7);
        let blob = write_patch(&old, &new, PATCH_TYPE_BSD0, &diff);

        assert_eq!(apply_patch(&old, &blob).unwrap(), new);
        assert!(matches!(
            apply_patch(b"abcdeg", &blob),
            Err(Error::Corrupted { .. })
        ));
    }
}
