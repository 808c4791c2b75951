//! Weak and strong archive signatures.
//!
//! A weak signature is a 512-bit RSA signature over the MD5 of the archive,
//! stored in the `(signature)` file with that file's own bytes zeroed for
//! hashing. A strong signature signs the SHA-1 of the whole archive and is
//! appended right after it, behind an `NGIS` marker. Signatures are stored
//! little-endian, so both are byte-reversed relative to RSA's output.

use std::cmp::min;

use bitflags::bitflags;
use log::info;
use md5::Md5;
use rsa::traits::PublicKeyParts;
use rsa::{Pkcs1v15Sign, RsaPrivateKey, RsaPublicKey};
use sha1::{Digest, Sha1};

use super::archive::Archive;
use super::consts::*;
use super::error::Error;
use super::seeker::Storage;
use super::writer::FileOptions;

const DIGEST_CHUNK_SIZE: u64 = 0x10000;
const WEAK_SIGNATURE_KEY_BYTES: usize = 64;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SignatureKind {
    Weak,
    Strong,
}

/// Public keys to check signatures against. A signature whose key is
/// missing reports `VERIFY_FAILED`.
#[derive(Debug, Clone, Default)]
pub struct SignatureKeys {
    pub weak: Option<RsaPublicKey>,
    pub strong: Option<RsaPublicKey>,
}

bitflags! {
    /// Outcome of [`Archive::verify`](struct.Archive.html#method.verify).
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct SignatureCheck: u32 {
        const NO_SIGNATURE = 0x01;
        /// A signature is present but there was no key to check it with.
        const VERIFY_FAILED = 0x02;
        const WEAK_OK = 0x04;
        const WEAK_ERROR = 0x08;
        const STRONG_OK = 0x10;
        const STRONG_ERROR = 0x20;
    }
}

impl<S: Storage> Archive<S> {
    pub(crate) fn reserve_weak_signature(&mut self) -> Result<(), Error> {
        let options = FileOptions {
            replace_existing: true,
            ..FileOptions::default()
        };

        self.add_file(
            SIGNATURE_NAME,
            &[0u8; WEAK_SIGNATURE_FILE_SIZE as usize],
            options,
        )
    }

    /// Signs the archive. Pending changes are flushed first, and any later
    /// change invalidates the signature.
    pub fn sign(&mut self, kind: SignatureKind, key: &RsaPrivateKey) -> Result<(), Error> {
        self.ensure_writable()?;

        match kind {
            SignatureKind::Weak => self.sign_weak(key),
            SignatureKind::Strong => self.sign_strong(key),
        }
    }

    fn sign_weak(&mut self, key: &RsaPrivateKey) -> Result<(), Error> {
        if key.size() != WEAK_SIGNATURE_KEY_BYTES {
            return Err(Error::InvalidParameter {
                reason: "weak signatures need a 512-bit key",
            });
        }

        let reserved = self
            .locate(SIGNATURE_NAME, LOCALE_NEUTRAL)
            .map(|located| {
                located.entry.flags & (MPQ_FILE_COMPRESS_MASK | MPQ_FILE_ENCRYPTED) == 0
                    && located.entry.compressed_size == WEAK_SIGNATURE_FILE_SIZE
            })
            .unwrap_or(false);
        if !reserved {
            self.reserve_weak_signature()?;
        }
        self.flush()?;

        let located = self.locate(SIGNATURE_NAME, LOCALE_NEUTRAL)?;
        let extent = (located.entry.file_pos, located.entry.end());
        let digest = self.weak_digest(extent)?;

        let mut signature = key
            .sign(Pkcs1v15Sign::new::<Md5>(), &digest)
            .map_err(|_| Error::InvalidParameter {
                reason: "the key could not sign the archive",
            })?;
        signature.reverse();

        let mut content = vec![0u8; 8];
        content.extend_from_slice(&signature);
        self.write_raw(located.entry.file_pos, &content)?;
        self.seeker.get_mut().sync()?;

        info!("weak signature written over {} bytes", self.archive_size());

        Ok(())
    }

    fn sign_strong(&mut self, key: &RsaPrivateKey) -> Result<(), Error> {
        self.flush()?;

        let archive_size = self.archive_size();
        let digest = self.strong_digest()?;

        let mut signature = key
            .sign(Pkcs1v15Sign::new::<Sha1>(), &digest)
            .map_err(|_| Error::InvalidParameter {
                reason: "the key could not sign the archive",
            })?;
        signature.reverse();

        let mut tail = STRONG_SIGNATURE_MAGIC.to_vec();
        tail.extend_from_slice(&signature);

        let seeker = self.seeker.get_mut();
        seeker.write(archive_size, &tail)?;
        seeker.truncate(archive_size + tail.len() as u64)?;
        seeker.sync()?;

        info!(
            "strong signature of {} bytes appended after {} bytes",
            signature.len(),
            archive_size
        );

        Ok(())
    }

    /// Checks the weak and strong signatures. Failed checks are reported in
    /// the result, not as errors.
    pub fn verify(&self, keys: &SignatureKeys) -> Result<SignatureCheck, Error> {
        let mut check = SignatureCheck::empty();
        let mut signed = false;

        if let Some((extent, signature)) = self.weak_signature()? {
            signed = true;
            check |= match &keys.weak {
                None => SignatureCheck::VERIFY_FAILED,
                Some(key) => {
                    let digest = self.weak_digest(extent)?;
                    if key.verify(Pkcs1v15Sign::new::<Md5>(), &digest, &signature).is_ok() {
                        SignatureCheck::WEAK_OK
                    } else {
                        SignatureCheck::WEAK_ERROR
                    }
                }
            };
        }

        if let Some(signature) = self.strong_signature()? {
            signed = true;
            check |= match &keys.strong {
                None => SignatureCheck::VERIFY_FAILED,
                Some(key) => {
                    let digest = self.strong_digest()?;
                    if key.verify(Pkcs1v15Sign::new::<Sha1>(), &digest, &signature).is_ok() {
                        SignatureCheck::STRONG_OK
                    } else {
                        SignatureCheck::STRONG_ERROR
                    }
                }
            };
        }

        if !signed {
            check |= SignatureCheck::NO_SIGNATURE;
        }

        Ok(check)
    }

    /// Extent of `(signature)` and the big-endian signature it holds, if the
    /// file exists and is not just a zeroed reservation.
    fn weak_signature(&self) -> Result<Option<((u64, u64), Vec<u8>)>, Error> {
        let located = match self.locate(SIGNATURE_NAME, LOCALE_NEUTRAL) {
            Ok(located) => located,
            Err(error) if error.is_not_found() => return Ok(None),
            Err(error) => return Err(error),
        };

        if located.entry.compressed_size != WEAK_SIGNATURE_FILE_SIZE {
            return Ok(None);
        }

        let raw = self.read_raw(located.entry.file_pos, WEAK_SIGNATURE_FILE_SIZE)?;
        let mut signature = raw[8..8 + WEAK_SIGNATURE_SIZE].to_vec();
        if signature.iter().all(|byte| *byte == 0) {
            return Ok(None);
        }
        signature.reverse();

        Ok(Some(((located.entry.file_pos, located.entry.end()), signature)))
    }

    fn strong_signature(&self) -> Result<Option<Vec<u8>>, Error> {
        let archive_size = self.archive_size();
        let available = self.seeker.borrow().available();
        if available <= archive_size + STRONG_SIGNATURE_MAGIC.len() as u64 {
            return Ok(None);
        }

        let tail = self.read_raw(archive_size, available - archive_size)?;
        if &tail[..4] != STRONG_SIGNATURE_MAGIC {
            return Ok(None);
        }

        let mut signature = tail[4..].to_vec();
        signature.reverse();

        Ok(Some(signature))
    }

    /// MD5 of the archive with the `(signature)` extent read as zeros.
    fn weak_digest(&self, (zero_start, zero_end): (u64, u64)) -> Result<Vec<u8>, Error> {
        let mut hasher = Md5::new();
        let size = self.archive_size();

        let mut offset = 0;
        while offset < size {
            let len = min(DIGEST_CHUNK_SIZE, size - offset);
            let mut chunk = self.read_raw(offset, len)?;

            let start = zero_start.max(offset);
            let end = zero_end.min(offset + len);
            if start < end {
                for byte in &mut chunk[(start - offset) as usize..(end - offset) as usize] {
                    *byte = 0;
                }
            }

            hasher.update(&chunk);
            offset += len;
        }

        Ok(hasher.finalize().to_vec())
    }

    fn strong_digest(&self) -> Result<Vec<u8>, Error> {
        let mut hasher = Sha1::new();
        let size = self.archive_size();

        let mut offset = 0;
        while offset < size {
            let len = min(DIGEST_CHUNK_SIZE, size - offset);
            hasher.update(&self.read_raw(offset, len)?);
            offset += len;
        }

        Ok(hasher.finalize().to_vec())
    }
}
