//! Per-sector compression and encryption.
//!
//! zlib and bzip2 are built in. PKWARE DCL, Huffman, IMA ADPCM and sparse
//! coding are looked up in a [`Codecs`](struct.Codecs.html) registry, so
//! callers can plug in implementations of their own.

use std::fmt;
use std::io::{Read, Write};

use byteorder::{ReadBytesExt, WriteBytesExt, LE};

use super::consts::*;
use super::crypto::*;
use super::error::Error;
use super::table::BlockEntry;

/// A compression method for the sector pipeline.
pub trait Codec: Send + Sync {
    fn compress(&self, data: &[u8]) -> Result<Vec<u8>, Error>;

    /// `size_hint` is the size of the fully decoded sector, which for a
    /// stage in the middle of a chain is only an upper estimate.
    fn decompress(&self, data: &[u8], size_hint: usize) -> Result<Vec<u8>, Error>;
}

struct Zlib;

impl Codec for Zlib {
    fn compress(&self, data: &[u8]) -> Result<Vec<u8>, Error> {
        let mut encoder =
            flate2::write::ZlibEncoder::new(Vec::new(), flate2::Compression::default());
        encoder.write_all(data)?;

        Ok(encoder.finish()?)
    }

    fn decompress(&self, data: &[u8], size_hint: usize) -> Result<Vec<u8>, Error> {
        let mut decompressed = Vec::with_capacity(size_hint);
        flate2::read::ZlibDecoder::new(data)
            .read_to_end(&mut decompressed)
            .map_err(|_| Error::corrupted("bad zlib stream"))?;

        Ok(decompressed)
    }
}

struct Bzip2;

impl Codec for Bzip2 {
    fn compress(&self, data: &[u8]) -> Result<Vec<u8>, Error> {
        let mut encoder = bzip2::write::BzEncoder::new(Vec::new(), bzip2::Compression::best());
        encoder.write_all(data)?;

        Ok(encoder.finish()?)
    }

    fn decompress(&self, data: &[u8], size_hint: usize) -> Result<Vec<u8>, Error> {
        let mut decompressed = Vec::with_capacity(size_hint);
        bzip2::read::BzDecoder::new(data)
            .read_to_end(&mut decompressed)
            .map_err(|_| Error::corrupted("bad bzip2 stream"))?;

        Ok(decompressed)
    }
}

// compression applies stages in this order, decompression in reverse
const PIPELINE: [u8; 7] = [
    COMPRESSION_SPARSE,
    COMPRESSION_IMA_ADPCM_MONO,
    COMPRESSION_IMA_ADPCM_STEREO,
    COMPRESSION_HUFFMAN,
    COMPRESSION_ZLIB,
    COMPRESSION_PKWARE,
    COMPRESSION_BZIP2,
];

const KNOWN_COMPRESSION: u8 = COMPRESSION_SPARSE
    | COMPRESSION_IMA_ADPCM_MONO
    | COMPRESSION_IMA_ADPCM_STEREO
    | COMPRESSION_HUFFMAN
    | COMPRESSION_ZLIB
    | COMPRESSION_PKWARE
    | COMPRESSION_BZIP2;

pub(crate) fn compression_name(tag: u8) -> &'static str {
    match tag {
        COMPRESSION_HUFFMAN => "Huffman",
        COMPRESSION_ZLIB => "zlib",
        COMPRESSION_PKWARE => "PKWare DCL",
        COMPRESSION_BZIP2 => "bzip2",
        COMPRESSION_SPARSE => "sparse",
        COMPRESSION_IMA_ADPCM_MONO => "IMA ADPCM Mono",
        COMPRESSION_IMA_ADPCM_STEREO => "IMA ADPCM Stereo",
        _ => "unknown",
    }
}

/// Registry of the compression methods available to an archive.
pub struct Codecs {
    codecs: Vec<(u8, Box<dyn Codec>)>,
}

impl Default for Codecs {
    fn default() -> Codecs {
        Codecs {
            codecs: vec![
                (COMPRESSION_ZLIB, Box::new(Zlib)),
                (COMPRESSION_BZIP2, Box::new(Bzip2)),
            ],
        }
    }
}

impl fmt::Debug for Codecs {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        let tags: Vec<_> = self
            .codecs
            .iter()
            .map(|(tag, _)| compression_name(*tag))
            .collect();

        f.debug_struct("Codecs").field("registered", &tags).finish()
    }
}

impl Codecs {
    /// Installs `codec` for the single-bit compression `tag`, replacing any
    /// codec previously registered for it.
    pub fn register<C: Codec + 'static>(&mut self, tag: u8, codec: C) -> Result<(), Error> {
        if tag.count_ones() != 1 || tag & KNOWN_COMPRESSION == 0 {
            return Err(Error::InvalidParameter {
                reason: "compression tag must be a single known method",
            });
        }

        self.codecs.retain(|(known, _)| *known != tag);
        self.codecs.push((tag, Box::new(codec)));

        Ok(())
    }

    pub fn supports(&self, tag: u8) -> bool {
        self.codecs.iter().any(|(known, _)| *known == tag)
    }

    fn get(&self, tag: u8) -> Result<&dyn Codec, Error> {
        self.codecs
            .iter()
            .find(|(known, _)| *known == tag)
            .map(|(_, codec)| codec.as_ref())
            .ok_or_else(|| Error::UnsupportedCompression {
                kind: compression_name(tag).to_string(),
            })
    }
}

/// How the sectors of one file are packed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum SectorCompression {
    Stored,
    /// PKWARE DCL without a leading method byte.
    Imploded,
    /// Leading method byte followed by the output of the masked pipeline.
    Compressed(u8),
}

impl SectorCompression {
    pub fn for_block(entry: &BlockEntry) -> SectorCompression {
        if entry.is_imploded() {
            SectorCompression::Imploded
        } else if entry.is_compressed() {
            // the mask is read from each sector on decode
            SectorCompression::Compressed(0)
        } else {
            SectorCompression::Stored
        }
    }
}

/// Compresses one sector. The raw bytes are returned unchanged whenever
/// compression would not make them strictly smaller, which the reader
/// recognizes by the compressed size matching the raw size.
pub(crate) fn encode_sector(
    raw: &[u8],
    compression: SectorCompression,
    codecs: &Codecs,
) -> Result<Vec<u8>, Error> {
    let encoded = match compression {
        SectorCompression::Stored => return Ok(raw.to_vec()),
        SectorCompression::Imploded => codecs.get(COMPRESSION_PKWARE)?.compress(raw)?,
        SectorCompression::Compressed(mask) => {
            if mask & !KNOWN_COMPRESSION != 0 {
                return Err(Error::UnsupportedCompression {
                    kind: format!("mask {:#04x}", mask),
                });
            }

            let mut data = raw.to_vec();
            for stage in PIPELINE.iter().filter(|&&stage| mask & stage != 0) {
                data = codecs.get(*stage)?.compress(&data)?;
            }

            let mut encoded = Vec::with_capacity(data.len() + 1);
            encoded.push(mask);
            encoded.extend_from_slice(&data);
            encoded
        }
    };

    if encoded.len() >= raw.len() {
        Ok(raw.to_vec())
    } else {
        Ok(encoded)
    }
}

/// Reverses [`encode_sector`] for a decrypted sector of `raw_len` bytes.
pub(crate) fn decode_sector(
    data: &[u8],
    raw_len: usize,
    compression: SectorCompression,
    codecs: &Codecs,
) -> Result<Vec<u8>, Error> {
    if data.len() == raw_len {
        return Ok(data.to_vec());
    }

    let decoded = match compression {
        SectorCompression::Stored => {
            return Err(Error::corrupted("stored sector has the wrong size"));
        }
        SectorCompression::Imploded => codecs.get(COMPRESSION_PKWARE)?.decompress(data, raw_len)?,
        SectorCompression::Compressed(_) => {
            let (&mask, mut payload) = data
                .split_first()
                .ok_or_else(|| Error::corrupted("empty compressed sector"))?;

            if mask & !KNOWN_COMPRESSION != 0 {
                return Err(Error::UnsupportedCompression {
                    kind: format!("mask {:#04x}", mask),
                });
            }

            let mut owned;
            for stage in PIPELINE.iter().rev().filter(|&&stage| mask & stage != 0) {
                owned = codecs.get(*stage)?.decompress(payload, raw_len)?;
                payload = &owned;
            }

            payload.to_vec()
        }
    };

    if decoded.len() != raw_len {
        return Err(Error::corrupted("sector decompressed to the wrong size"));
    }

    Ok(decoded)
}

/// Encryption key of a file, or `None` when it is stored in the clear.
pub(crate) fn file_key(name: &str, entry: &BlockEntry) -> Option<u32> {
    if entry.is_encrypted() {
        Some(calculate_file_key(
            name,
            entry.file_pos,
            entry.file_size,
            entry.is_key_fixed(),
        ))
    } else {
        None
    }
}

/// Byte offsets, relative to the file start, delimiting each compressed
/// sector. With sector checksums there is one extra offset at the end,
/// bounding the checksum block.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct SectorOffsets {
    offsets: Vec<u32>,
}

impl SectorOffsets {
    pub fn new(offsets: Vec<u32>) -> SectorOffsets {
        SectorOffsets { offsets }
    }

    pub fn table_size(entries: u64) -> u64 {
        entries * 4
    }

    pub fn from_raw(mut raw: Vec<u8>, key: Option<u32>) -> Result<SectorOffsets, Error> {
        if let Some(key) = key {
            decrypt_mpq_block(&mut raw, key.wrapping_sub(1));
        }

        let mut slice = &raw[..];
        let mut offsets = Vec::with_capacity(raw.len() / 4);
        while !slice.is_empty() {
            offsets.push(slice.read_u32::<LE>()?);
        }

        if offsets.windows(2).any(|pair| pair[0] > pair[1]) {
            return Err(Error::corrupted("sector offsets are not ascending"));
        }

        Ok(SectorOffsets { offsets })
    }

    pub fn to_raw(&self, key: Option<u32>) -> Result<Vec<u8>, Error> {
        let mut buf = Vec::with_capacity(self.offsets.len() * 4);
        for offset in &self.offsets {
            buf.write_u32::<LE>(*offset)?;
        }

        if let Some(key) = key {
            encrypt_mpq_block(&mut buf, key.wrapping_sub(1));
        }

        Ok(buf)
    }

    /// Start and length of sector `index`.
    pub fn sector(&self, index: usize) -> Option<(u32, u32)> {
        let start = *self.offsets.get(index)?;
        let end = *self.offsets.get(index + 1)?;

        Some((start, end.checked_sub(start)?))
    }

    pub fn first(&self) -> u32 {
        self.offsets.first().copied().unwrap_or(0)
    }

    pub fn last(&self) -> u32 {
        self.offsets.last().copied().unwrap_or(0)
    }

    pub fn len(&self) -> usize {
        self.offsets.len()
    }
}
