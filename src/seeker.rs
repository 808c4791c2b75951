use std::fs::File;
use std::io::{Cursor, Read, Seek, SeekFrom, Write};

use byteorder::{ReadBytesExt, LE};
use log::debug;

use super::consts::*;
use super::error::Error;
use super::header::*;

/// Byte-addressable backing store of an archive.
///
/// Anything that can be read, written, seeked and truncated works;
/// implementations are provided for files and in-memory buffers.
pub trait Storage: Read + Write + Seek {
    fn set_len(&mut self, size: u64) -> std::io::Result<()>;

    fn sync(&mut self) -> std::io::Result<()> {
        Ok(())
    }
}

impl Storage for File {
    fn set_len(&mut self, size: u64) -> std::io::Result<()> {
        File::set_len(self, size)
    }

    fn sync(&mut self) -> std::io::Result<()> {
        self.sync_all()
    }
}

impl Storage for Cursor<Vec<u8>> {
    fn set_len(&mut self, size: u64) -> std::io::Result<()> {
        self.get_mut().resize(size as usize, 0);
        Ok(())
    }
}

impl<T: Storage + ?Sized> Storage for &mut T {
    fn set_len(&mut self, size: u64) -> std::io::Result<()> {
        (**self).set_len(size)
    }

    fn sync(&mut self) -> std::io::Result<()> {
        (**self).sync()
    }
}

impl<T: Storage + ?Sized> Storage for Box<T> {
    fn set_len(&mut self, size: u64) -> std::io::Result<()> {
        (**self).set_len(size)
    }

    fn sync(&mut self) -> std::io::Result<()> {
        (**self).sync()
    }
}

/// Positioned access to the archive region of a storage.
///
/// All offsets handed to the seeker are relative to the archive header.
#[derive(Debug)]
pub(crate) struct Seeker<S> {
    storage: S,
    header_offset: u64,
    file_size: u64,
}

impl<S: Storage> Seeker<S> {
    pub fn new(mut storage: S, header_offset: u64) -> Result<Seeker<S>, Error> {
        let file_size = storage.seek(SeekFrom::End(0))?;

        Ok(Seeker {
            storage,
            header_offset,
            file_size,
        })
    }

    /// Size of everything that lies past the archive start.
    pub fn available(&self) -> u64 {
        self.file_size.saturating_sub(self.header_offset)
    }

    pub fn read(&mut self, offset: u64, size: u64) -> Result<Vec<u8>, Error> {
        let offset = offset + self.header_offset;

        if offset + size > self.file_size {
            return Err(Error::corrupted("read past the end of the archive"));
        }

        self.storage.seek(SeekFrom::Start(offset))?;
        let mut buf = vec![0u8; size as usize];
        self.storage.read_exact(&mut buf)?;

        Ok(buf)
    }

    pub fn write(&mut self, offset: u64, data: &[u8]) -> Result<(), Error> {
        let offset = offset + self.header_offset;

        self.storage.seek(SeekFrom::Start(offset))?;
        self.storage.write_all(data)?;
        self.file_size = self.file_size.max(offset + data.len() as u64);

        Ok(())
    }

    /// Cuts the storage right after `archive_end`.
    pub fn truncate(&mut self, archive_end: u64) -> Result<(), Error> {
        let size = self.header_offset + archive_end;
        self.storage.set_len(size)?;
        self.file_size = size;

        Ok(())
    }

    pub fn sync(&mut self) -> Result<(), Error> {
        self.storage.flush()?;
        self.storage.sync()?;

        Ok(())
    }
}

/// Scans the storage for an archive header at 512-byte boundaries,
/// following a user data header if one comes first.
pub(crate) fn find_headers<R: Read + Seek>(
    mut reader: R,
    search: bool,
    force_v1: bool,
) -> Result<(u64, FileHeader), Error> {
    let file_size = reader.seek(SeekFrom::End(0))?;

    let mut position = 0;
    while position + u64::from(HEADER_SIZE_V1) <= file_size {
        reader.seek(SeekFrom::Start(position))?;
        let magic = reader.read_u32::<LE>()?;

        if magic == HEADER_USER_MAGIC {
            let user_header = UserHeader::from_reader(&mut reader)?;
            let file_header_offset = u64::from(user_header.file_header_offset) + position;
            debug!(
                "user data header at {:#x} ({} bytes of user data)",
                position, user_header.user_data_size
            );

            if file_header_offset + 4 > file_size {
                return Err(Error::corrupted("user data header points past the end"));
            }

            reader.seek(SeekFrom::Start(file_header_offset))?;
            if reader.read_u32::<LE>()? != HEADER_MPQ_MAGIC {
                return Err(Error::corrupted("user data header points at no archive"));
            }

            let header = FileHeader::from_reader(&mut reader, force_v1)?;
            return Ok((file_header_offset, header));
        } else if magic == HEADER_MPQ_MAGIC {
            let header = FileHeader::from_reader(&mut reader, force_v1)?;
            debug!("archive header at {:#x}, {:?}", position, header.version);
            return Ok((position, header));
        }

        if !search {
            break;
        }

        position += HEADER_BOUNDARY;
    }

    Err(Error::NoHeader)
}
