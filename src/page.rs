use bitflags::bitflags;

use crate::device::Device;
use crate::error::{BurrowError, Result};
use crate::types::{DbId, Lsn, PageAddress};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PageType {
    Undefined,
    Header,
    Index,
    Blob,
    Freelist,
}

bitflags! {
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct PageFlags: u32 {
        /// Scheduled to be returned to the freelist when the owning
        /// transaction commits.
        const DELETE_PENDING = 1;
        /// Raw page without the usual page header (freelist pages, blob
        /// continuation pages).
        const NO_HEADER = 2;
        /// The index rooted at this page has unflushed changes.
        const INDEX_DIRTY = 4;
    }
}

/// In-memory handle for one fixed-size disk page. Owned by the Cache while
/// live; transactions and callers hold counted references via `refcount`.
#[derive(Debug)]
pub struct Page {
    address: PageAddress,
    kind: PageType,
    buf: Vec<u8>,
    dirty: bool,
    refcount: u32,
    flags: PageFlags,
    before_image_lsn: Lsn,
    owner: Option<DbId>,
}

impl Page {
    /// Constructs an uninitialized page: no buffer, no address, clean.
    pub fn new(owner: Option<DbId>, flags: PageFlags) -> Self {
        Self {
            address: PageAddress(0),
            kind: PageType::Undefined,
            buf: Vec::new(),
            dirty: false,
            refcount: 0,
            flags,
            before_image_lsn: Lsn(0),
            owner,
        }
    }

    /// Allocates the page buffer. Allocation failure surfaces as
    /// `OutOfMemory` rather than aborting.
    pub fn allocate_buffer(&mut self, pagesize: usize) -> Result<()> {
        if self.buf.len() == pagesize {
            return Ok(());
        }
        let mut buf = Vec::new();
        buf.try_reserve_exact(pagesize)
            .map_err(|_| BurrowError::OutOfMemory)?;
        buf.resize(pagesize, 0);
        self.buf = buf;
        Ok(())
    }

    /// Extends the file by one page and takes ownership of the new address.
    pub fn alloc(&mut self, dev: &mut dyn Device) -> Result<()> {
        self.address = PageAddress(dev.alloc_page()?);
        self.allocate_buffer(dev.pagesize())
    }

    /// Reads the page contents from the device at the current address.
    pub fn fetch(&mut self, dev: &mut dyn Device) -> Result<()> {
        self.allocate_buffer(dev.pagesize())?;
        dev.read_page(self.address.0, &mut self.buf)
    }

    /// Writes the page if dirty; a clean page is a no-op.
    pub fn flush(&mut self, dev: &mut dyn Device, write_through: bool) -> Result<()> {
        if !self.dirty {
            return Ok(());
        }
        dev.write_page(self.address.0, &self.buf, write_through)?;
        self.dirty = false;
        Ok(())
    }

    /// Releases the in-memory buffer. On-disk space is untouched.
    pub fn free_buffer(&mut self) {
        self.buf = Vec::new();
    }

    pub fn add_ref(&mut self) {
        self.refcount += 1;
    }

    pub fn release_ref(&mut self) {
        assert!(self.refcount > 0, "page {} refcount underflow", self.address);
        self.refcount -= 1;
    }

    pub fn refcount(&self) -> u32 {
        self.refcount
    }

    pub fn is_pinned(&self) -> bool {
        self.refcount > 0
    }

    pub fn address(&self) -> PageAddress {
        self.address
    }

    pub fn set_address(&mut self, address: PageAddress) {
        self.address = address;
    }

    pub fn kind(&self) -> PageType {
        self.kind
    }

    pub fn set_kind(&mut self, kind: PageType) {
        self.kind = kind;
    }

    pub fn is_dirty(&self) -> bool {
        self.dirty
    }

    pub fn set_dirty(&mut self, dirty: bool) {
        self.dirty = dirty;
    }

    pub fn flags(&self) -> PageFlags {
        self.flags
    }

    pub fn set_flags(&mut self, flags: PageFlags) {
        self.flags = flags;
    }

    pub fn insert_flags(&mut self, flags: PageFlags) {
        self.flags.insert(flags);
    }

    pub fn before_image_lsn(&self) -> Lsn {
        self.before_image_lsn
    }

    pub fn set_before_image_lsn(&mut self, lsn: Lsn) {
        self.before_image_lsn = lsn;
    }

    pub fn owner(&self) -> Option<DbId> {
        self.owner
    }

    pub fn bytes(&self) -> &[u8] {
        &self.buf
    }

    pub fn bytes_mut(&mut self) -> &mut [u8] {
        &mut self.buf
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::device::MemoryDevice;

    #[test]
    fn alloc_assigns_address_and_zeroed_buffer() {
        let mut dev = MemoryDevice::new(1024);
        let mut page = Page::new(None, PageFlags::empty());
        page.alloc(&mut dev).expect("alloc");

        assert_eq!(page.address(), PageAddress(0));
        assert_eq!(page.bytes().len(), 1024);
        assert!(page.bytes().iter().all(|&b| b == 0));
        assert!(!page.is_dirty());
    }

    #[test]
    fn flush_clears_dirty_and_clean_flush_is_noop() {
        let mut dev = MemoryDevice::new(1024);
        let mut page = Page::new(None, PageFlags::empty());
        page.alloc(&mut dev).expect("alloc");

        page.bytes_mut()[0] = 0x7E;
        page.set_dirty(true);
        page.flush(&mut dev, false).expect("flush");
        assert!(!page.is_dirty());

        let mut back = vec![0u8; 1024];
        dev.read_page(0, &mut back).expect("read");
        assert_eq!(back[0], 0x7E);

        // clean flush writes nothing
        page.bytes_mut()[0] = 0x11;
        page.flush(&mut dev, false).expect("flush clean");
        dev.read_page(0, &mut back).expect("read");
        assert_eq!(back[0], 0x7E);
    }

    #[test]
    fn fetch_reads_back_written_bytes() {
        let mut dev = MemoryDevice::new(1024);
        let mut page = Page::new(None, PageFlags::empty());
        page.alloc(&mut dev).expect("alloc");
        page.bytes_mut().fill(0xC3);
        page.set_dirty(true);
        page.flush(&mut dev, false).expect("flush");

        let mut other = Page::new(None, PageFlags::empty());
        other.set_address(page.address());
        other.fetch(&mut dev).expect("fetch");
        assert_eq!(other.bytes(), page.bytes());
    }

    #[test]
    fn refcount_pairs() {
        let mut page = Page::new(None, PageFlags::empty());
        assert!(!page.is_pinned());
        page.add_ref();
        page.add_ref();
        assert_eq!(page.refcount(), 2);
        page.release_ref();
        page.release_ref();
        assert!(!page.is_pinned());
    }

    #[test]
    #[should_panic(expected = "refcount underflow")]
    fn release_without_ref_panics() {
        let mut page = Page::new(None, PageFlags::empty());
        page.release_ref();
    }

    #[test]
    fn free_buffer_releases_memory_only() {
        let mut dev = MemoryDevice::new(1024);
        let mut page = Page::new(None, PageFlags::empty());
        page.alloc(&mut dev).expect("alloc");
        assert_eq!(page.bytes().len(), 1024);

        page.free_buffer();
        assert!(page.bytes().is_empty());
        // the address survives; the on-disk space is untouched
        assert_eq!(page.address(), PageAddress(0));
        assert_eq!(dev.filesize(), 1024);
    }

    #[test]
    fn lsn_is_stored_and_returned() {
        let mut page = Page::new(None, PageFlags::empty());
        page.set_before_image_lsn(Lsn(99));
        assert_eq!(page.before_image_lsn(), Lsn(99));
    }
}
