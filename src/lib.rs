//! A library for reading, writing and maintaining Blizzard's MoPaQ archives.
//!
//! `mpqkit` opens v1 through v4 archives for reading, and creates and edits
//! v1 and v2 archives in place: files can be added, replaced and removed,
//! and the space they leave behind reclaimed by compaction. Archives can be
//! stacked into patch chains, signed, and verified.
//!
//! Any byte store implementing [`Storage`](trait.Storage.html) can hold an
//! archive; files and in-memory `Cursor<Vec<u8>>` buffers work out of the box.
//!
//! # Supported features
//!
//! * zlib and bzip2 compression are built in. PKWare DCL, Huffman coding,
//!   IMA ADPCM and sparse compression can be plugged in through
//!   [`Codecs`](struct.Codecs.html); files that use them fail with
//!   `UnsupportedCompression` otherwise.
//! * Encrypted, single-unit and sector-checksummed files are read and written.
//! * `(listfile)` and `(attributes)` are kept up to date on every flush.
//! * Patch archives are resolved through `COPY` and `BSD0` transforms.
//! * Weak (512-bit RSA over MD5) and strong (RSA over SHA-1) signatures.
//!
//! Archives of format v3 and v4 are only opened for reading, and only
//! through their classic hash and block tables.
//!
//! # Protected MPQs
//!
//! Warcraft III maps are often "protected" with hacks that WC3's built-in
//! MPQ implementation tolerates but others do not. **No effort is made to
//! work around those "protections"**; such archives may fail to open.
//!
//! # Example
//!
//! ```
//! # use mpqkit::{Archive, FileOptions};
//! # use std::io::Cursor;
//! # use std::error::Error;
//! # fn main() -> Result<(), Box<dyn Error>> {
//! let mut cursor = Cursor::new(Vec::new());
//!
//! // creating an archive
//! let mut archive = Archive::create(&mut cursor)?;
//! archive.add_file(
//!     "hello.txt",
//!     b"hello world!",
//!     FileOptions {
//!         compress: true,
//!         ..FileOptions::default()
//!     },
//! )?;
//! archive.close()?;
//!
//! // reading an archive
//! let archive = Archive::open(&mut cursor)?;
//! let file = archive.read_file("hello.txt")?;
//!
//! assert_eq!(file.as_slice(), b"hello world!");
//! # Ok(())
//! # }
//! ```

pub(crate) mod attributes;
pub(crate) mod codec;
pub(crate) mod compact;
pub(crate) mod crypto;
pub(crate) mod find;
pub(crate) mod header;
pub(crate) mod listfile;
pub(crate) mod patch;
pub(crate) mod reader;
pub(crate) mod seeker;
pub(crate) mod signature;
pub(crate) mod table;
pub(crate) mod util;
pub(crate) mod verify;
pub(crate) mod writer;

pub mod archive;
pub mod consts;
pub mod error;

pub use archive::{Archive, CreateOptions, OpenOptions};
pub use codec::{Codec, Codecs};
pub use consts::Locale;
pub use error::{Error, ErrorKind};
pub use find::{FileFindData, Finder};
pub use header::FormatVersion;
pub use patch::copy_patch;
pub use reader::{FileStream, SearchScope};
pub use rsa::{RsaPrivateKey, RsaPublicKey};
pub use seeker::Storage;
pub use signature::{SignatureCheck, SignatureKeys, SignatureKind};
pub use table::Probing;
pub use verify::{FileVerification, VerifyFlags};
pub use writer::{FileOptions, FileWriter};
