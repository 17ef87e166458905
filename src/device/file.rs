use std::fs::{File, OpenOptions};
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::Path;

use memmap2::MmapMut;

use super::{align_up, Device};
use crate::error::Result;

/// File-backed device. Reads go through an optional memory map; writes
/// always go through the file handle and invalidate the map.
pub struct FileDevice {
    file: File,
    pagesize: usize,
    file_len: u64,
    mmap: Option<MmapMut>,
    use_mmap: bool,
}

impl FileDevice {
    pub fn open(path: &Path, pagesize: usize, use_mmap: bool) -> Result<Self> {
        debug_assert!(pagesize.is_power_of_two());
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .open(path)?;

        let file_len = file.metadata()?.len();

        let mmap = if use_mmap && file_len > 0 {
            unsafe { MmapMut::map_mut(&file).ok() }
        } else {
            None
        };

        Ok(Self {
            file,
            pagesize,
            file_len,
            mmap,
            use_mmap,
        })
    }

    fn invalidate_mmap(&mut self) {
        if self.mmap.is_some() {
            self.mmap = None;
        }
    }

    fn ensure_mmap(&mut self) -> Result<()> {
        if self.use_mmap && self.mmap.is_none() && self.physical_len()? > 0 {
            self.file.sync_data()?;
            self.mmap = unsafe { MmapMut::map_mut(&self.file).ok() };
        }
        Ok(())
    }

    fn physical_len(&self) -> Result<u64> {
        Ok(self.file.metadata()?.len())
    }
}

impl Device for FileDevice {
    fn pagesize(&self) -> usize {
        self.pagesize
    }

    fn filesize(&self) -> u64 {
        self.file_len
    }

    fn read_page(&mut self, address: u64, buf: &mut [u8]) -> Result<()> {
        let offset = address as usize;
        buf.fill(0);

        if address >= self.file_len {
            return Ok(());
        }

        self.ensure_mmap()?;
        if let Some(ref mmap) = self.mmap {
            if offset < mmap.len() {
                let end = (offset + buf.len()).min(mmap.len());
                let copy_len = end - offset;
                buf[..copy_len].copy_from_slice(&mmap[offset..end]);
            }
        } else {
            self.file.seek(SeekFrom::Start(address))?;
            let mut total = 0;
            while total < buf.len() {
                let n = self.file.read(&mut buf[total..])?;
                if n == 0 {
                    break;
                }
                total += n;
            }
        }
        Ok(())
    }

    fn write_page(&mut self, address: u64, buf: &[u8], write_through: bool) -> Result<()> {
        self.file.seek(SeekFrom::Start(address))?;
        self.file.write_all(buf)?;
        self.invalidate_mmap();

        let end = address + buf.len() as u64;
        if end > self.file_len {
            self.file_len = end;
        }

        if write_through {
            self.file.sync_data()?;
        }
        Ok(())
    }

    fn alloc_page(&mut self) -> Result<u64> {
        let address = align_up(self.file_len, self.pagesize as u64);
        self.file_len = address + self.pagesize as u64;
        Ok(address)
    }

    fn alloc_area(&mut self, size: usize) -> Result<u64> {
        let address = self.file_len;
        self.file_len += size as u64;
        Ok(address)
    }
}
