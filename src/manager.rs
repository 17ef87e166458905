use std::collections::HashMap;

use bitflags::bitflags;
use tracing::{debug, warn};

use crate::cache::Cache;
use crate::config::{Config, EnvFlags};
use crate::db::{Database, DatabaseOptions};
use crate::device::Device;
use crate::error::{BurrowError, Result};
use crate::freelist::{
    extend_aligned, Freelist, FullFreelist, ReducedFreelist, DEFAULT_BLOB_ALIGNMENT,
};
use crate::header::EnvHeader;
use crate::page::{Page, PageFlags, PageType};
use crate::types::{DbId, PageAddress};

/// The environment header always lives in the first page of the file.
pub const HEADER_PAGE_ADDRESS: PageAddress = PageAddress(0);

bitflags! {
    /// Flags for `PageManager::alloc_page`.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct AllocFlags: u32 {
        /// Do not consult the freelist; always extend the file.
        const IGNORE_FREELIST = 8;
        /// Zero the page buffer after allocation.
        const CLEAR_WITH_ZERO = 16;
    }
}

/// Allocates, fetches, caches and frees pages. All access is serialized by
/// the enclosing environment; nothing here locks.
pub struct PageManager {
    device: Box<dyn Device>,
    flags: EnvFlags,
    cache: Cache,
    header: EnvHeader,
    databases: HashMap<DbId, Database>,
    full_freelist: Option<FullFreelist>,
    next_db_id: u32,
}

impl PageManager {
    /// Formats a fresh environment: writes the header page at address 0 and
    /// pins it for the life of the manager.
    pub fn create(mut device: Box<dyn Device>, flags: EnvFlags, config: Config) -> Result<Self> {
        if flags.contains(EnvFlags::READ_ONLY) {
            return Err(BurrowError::InvalidState(
                "cannot create a read-only environment",
            ));
        }
        if device.filesize() != 0 {
            return Err(BurrowError::InvalidState(
                "cannot create over a non-empty device",
            ));
        }

        let pagesize = device.pagesize();
        let header = EnvHeader::new(pagesize)?;

        let mut page = Page::new(None, PageFlags::empty());
        page.alloc(&mut *device)?;
        debug_assert_eq!(page.address(), HEADER_PAGE_ADDRESS);
        page.set_kind(PageType::Header);
        header.write(page.bytes_mut())?;
        page.set_dirty(true);
        page.add_ref();

        let mut cache = Cache::new(config.cache_capacity);
        cache.put(page)?;

        debug!(pagesize, "environment created");
        Ok(Self {
            device,
            flags,
            cache,
            header,
            databases: HashMap::new(),
            full_freelist: None,
            next_db_id: 1,
        })
    }

    /// Opens an existing environment: validates the header page and loads
    /// the persisted freelist chain if one is recorded.
    pub fn open(mut device: Box<dyn Device>, flags: EnvFlags, config: Config) -> Result<Self> {
        let pagesize = device.pagesize();

        let mut page = Page::new(None, PageFlags::empty());
        page.set_address(HEADER_PAGE_ADDRESS);
        page.fetch(&mut *device)?;
        let header = EnvHeader::read(page.bytes())?
            .ok_or_else(|| BurrowError::Corrupt("missing environment header".into()))?;
        if header.pagesize as usize != pagesize {
            return Err(BurrowError::Corrupt(format!(
                "device pagesize {pagesize} does not match header pagesize {}",
                header.pagesize
            )));
        }
        page.set_kind(PageType::Header);
        page.add_ref();

        let mut cache = Cache::new(config.cache_capacity);
        cache.put(page)?;

        let full_freelist = if header.freelist_root.0 != 0
            && !flags.intersects(EnvFlags::IN_MEMORY.union(EnvFlags::READ_ONLY))
        {
            Some(FullFreelist::load(&mut *device, header.freelist_root)?)
        } else {
            None
        };

        debug!(pagesize, "environment opened");
        Ok(Self {
            device,
            flags,
            cache,
            header,
            databases: HashMap::new(),
            full_freelist,
            next_db_id: 1,
        })
    }

    pub fn flags(&self) -> EnvFlags {
        self.flags
    }

    pub fn pagesize(&self) -> usize {
        self.device.pagesize()
    }

    pub fn filesize(&self) -> u64 {
        self.device.filesize()
    }

    pub fn cache(&self) -> &Cache {
        &self.cache
    }

    pub fn open_database(&mut self, options: DatabaseOptions) -> DbId {
        let id = DbId(self.next_db_id);
        self.next_db_id += 1;

        let reduced = if options.reduced_freelist
            && !self
                .flags
                .intersects(EnvFlags::IN_MEMORY.union(EnvFlags::READ_ONLY))
        {
            Some(ReducedFreelist::new(self.device.pagesize()))
        } else {
            None
        };

        self.databases.insert(id, Database::new(id, options.name, reduced));
        id
    }

    pub fn database(&self, db: DbId) -> Option<&Database> {
        self.databases.get(&db)
    }

    /// Returns a pinned page. Pair every successful call with
    /// `release_page`.
    pub fn fetch_page(
        &mut self,
        db: Option<DbId>,
        address: PageAddress,
        only_from_cache: bool,
    ) -> Result<&mut Page> {
        if self.cache.contains(address) {
            let page = self.cache.get(address).expect("cached page");
            page.add_ref();
            return Ok(page);
        }

        if only_from_cache {
            return Err(BurrowError::NotFound);
        }

        let mut page = Page::new(db, PageFlags::empty());
        page.set_address(address);
        page.fetch(&mut *self.device)?;
        page.add_ref();
        self.cache.put(page)?;
        Ok(self.cache.get(address).expect("just inserted"))
    }

    /// Allocates a new page, preferring tracked free space unless
    /// `IGNORE_FREELIST` is set. The page is dirty and pinned on return;
    /// pair with `release_page`.
    pub fn alloc_page(
        &mut self,
        db: Option<DbId>,
        kind: PageType,
        flags: AllocFlags,
    ) -> Result<&mut Page> {
        if self.flags.contains(EnvFlags::READ_ONLY) {
            return Err(BurrowError::InvalidState(
                "allocation in a read-only environment",
            ));
        }

        let pagesize = self.device.pagesize();
        let address = if flags.contains(AllocFlags::IGNORE_FREELIST) {
            PageAddress(self.device.alloc_page()?)
        } else {
            let Self {
                databases,
                full_freelist,
                device,
                flags: env_flags,
                ..
            } = self;
            match select_freelist(databases, full_freelist, *env_flags, pagesize, db) {
                Some(freelist) => freelist.alloc(&mut **device, pagesize)?.0,
                None => PageAddress(device.alloc_page()?),
            }
        };

        let mut page = Page::new(db, PageFlags::empty());
        page.set_address(address);
        page.allocate_buffer(pagesize)?;
        if flags.contains(AllocFlags::CLEAR_WITH_ZERO) {
            page.bytes_mut().fill(0);
        }
        page.set_kind(kind);
        page.set_dirty(true);
        page.add_ref();
        self.cache.put(page)?;
        Ok(self.cache.get(address).expect("just inserted"))
    }

    /// Allocates space for a blob. The bool is true when the file was
    /// extended, false when the space came from a freelist.
    pub fn alloc_blob(&mut self, db: Option<DbId>, size: usize) -> Result<(PageAddress, bool)> {
        if self.flags.contains(EnvFlags::READ_ONLY) {
            return Err(BurrowError::InvalidState(
                "allocation in a read-only environment",
            ));
        }

        let pagesize = self.device.pagesize();
        let Self {
            databases,
            full_freelist,
            device,
            flags: env_flags,
            ..
        } = self;
        match select_freelist(databases, full_freelist, *env_flags, pagesize, db) {
            Some(freelist) => freelist.alloc(&mut **device, size),
            None => {
                // in-memory environments have no freelist; just extend
                let address = extend_aligned(&mut **device, size, DEFAULT_BLOB_ALIGNMENT)?;
                Ok((address, true))
            }
        }
    }

    pub fn blob_alignment(&mut self, db: Option<DbId>) -> usize {
        let pagesize = self.device.pagesize();
        let Self {
            databases,
            full_freelist,
            flags: env_flags,
            ..
        } = self;
        select_freelist(databases, full_freelist, *env_flags, pagesize, db)
            .map_or(DEFAULT_BLOB_ALIGNMENT, |freelist| freelist.blob_alignment())
    }

    pub fn page(&self, address: PageAddress) -> Result<&Page> {
        self.cache.peek(address).ok_or(BurrowError::NotFound)
    }

    pub fn page_mut(&mut self, address: PageAddress) -> Result<&mut Page> {
        self.cache.get(address).ok_or(BurrowError::NotFound)
    }

    /// Drops one reference taken by `fetch_page`/`alloc_page`.
    pub fn release_page(&mut self, address: PageAddress) -> Result<()> {
        self.page_mut(address)?.release_ref();
        Ok(())
    }

    /// Returns a page's address range to the owning database's freelist (or
    /// the environment bitmap). In-memory environments simply release the
    /// space.
    pub fn add_to_freelist(&mut self, address: PageAddress) -> Result<()> {
        let owner = self.cache.peek(address).and_then(Page::owner);
        let pagesize = self.device.pagesize();
        self.free_region(owner, address, pagesize)
    }

    /// Returns an arbitrary region to a freelist; blob callers include the
    /// blob header in `size`.
    pub fn add_to_freelist_area(
        &mut self,
        db: Option<DbId>,
        address: PageAddress,
        size: usize,
    ) -> Result<()> {
        self.free_region(db, address, size)
    }

    fn free_region(&mut self, db: Option<DbId>, address: PageAddress, size: usize) -> Result<()> {
        if self.flags.contains(EnvFlags::IN_MEMORY) {
            return Ok(());
        }
        let pagesize = self.device.pagesize();

        let mut region = (address, size);
        if let Some(id) = db {
            if let Some(reduced) = self
                .databases
                .get_mut(&id)
                .and_then(|database| database.reduced.as_mut())
            {
                let spill = if size == pagesize {
                    reduced.free_page(address)?
                } else {
                    reduced.free_area(address, size)?
                };
                match spill {
                    None => return Ok(()),
                    Some(overflow) => region = overflow,
                }
            }
        }

        let Self {
            full_freelist,
            flags: env_flags,
            ..
        } = self;
        if let Some(full) = ensure_full_freelist(full_freelist, *env_flags, pagesize) {
            let (region_address, region_size) = region;
            if region_size == pagesize {
                full.free_page(region_address)?;
            } else {
                full.free_area(region_address, region_size)?;
            }
        }
        Ok(())
    }

    /// Frees a delete-pending page at commit: space goes back to the
    /// freelist, the page leaves the cache.
    pub(crate) fn discard_page(&mut self, address: PageAddress) -> Result<()> {
        let owner = self.cache.peek(address).and_then(Page::owner);
        let pagesize = self.device.pagesize();
        self.free_region(owner, address, pagesize)?;
        self.cache.remove(address);
        Ok(())
    }

    pub(crate) fn flush_page(&mut self, address: PageAddress, write_through: bool) -> Result<()> {
        let Self { cache, device, .. } = self;
        let page = cache.peek_mut(address).ok_or(BurrowError::NotFound)?;
        page.flush(&mut **device, write_through)
    }

    /// Flushes every dirty page (and the freelist chain). With
    /// `clear_cache`, unpinned pages leave the cache afterwards; pinned
    /// pages are flushed but retained.
    pub fn flush_all_pages(&mut self, clear_cache: bool) -> Result<()> {
        self.persist_freelist()?;

        let write_through = self.flags.contains(EnvFlags::WRITE_THROUGH);
        for address in self.cache.addresses() {
            {
                let Self { cache, device, .. } = self;
                let page = cache.peek_mut(address).expect("snapshot address");
                page.flush(&mut **device, write_through)?;
            }
            if clear_cache {
                let pinned = self
                    .cache
                    .peek(address)
                    .map(Page::is_pinned)
                    .unwrap_or(false);
                if !pinned {
                    self.cache.remove(address);
                }
            }
        }
        Ok(())
    }

    /// Brings the cache back under its capacity by evicting unpinned pages,
    /// least-recently-used first. Dirty victims are flushed first.
    pub fn purge_cache(&mut self) -> Result<()> {
        let capacity = self.cache.capacity();
        if self.cache.len() <= capacity {
            return Ok(());
        }
        let write_through = self.flags.contains(EnvFlags::WRITE_THROUGH);
        let Self { cache, device, .. } = self;
        let evicted = cache.purge(capacity, |page| page.flush(&mut **device, write_through))?;
        debug!(evicted, remaining = cache.len(), "cache purged");
        Ok(())
    }

    /// Flushes and drains the database's pages (the environment header page
    /// is exempt and stays cached) and spills its reduced freelist into the
    /// environment bitmap. Flush errors do not stop the drain; the first
    /// one is returned.
    pub fn close_database(&mut self, db: DbId) -> Result<()> {
        let mut database = self.databases.remove(&db).ok_or(BurrowError::NotFound)?;

        if let Some(mut reduced) = database.reduced.take() {
            for (address, size) in reduced.drain() {
                self.free_region(None, address, size)?;
            }
        }

        let mut first_error = None;
        for address in self.cache.addresses() {
            let owner = self.cache.peek(address).and_then(Page::owner);
            if owner != Some(db) {
                continue;
            }
            {
                let Self { cache, device, .. } = self;
                let page = cache.peek_mut(address).expect("snapshot address");
                if let Err(error) = page.flush(&mut **device, false) {
                    warn!(page = %address, error = %error, "flush failed while closing database");
                    first_error.get_or_insert(error);
                    continue;
                }
            }
            self.cache.remove(address);
        }

        match first_error {
            Some(error) => Err(error),
            None => Ok(()),
        }
    }

    /// Verifies the cache and every freelist, then cross-checks that no
    /// cached page overlaps tracked free space.
    pub fn check_integrity(&self) -> Result<()> {
        self.cache.check_integrity()?;
        if let Some(full) = self.full_freelist.as_ref() {
            full.check_integrity()?;
        }
        for database in self.databases.values() {
            if let Some(reduced) = database.reduced.as_ref() {
                reduced.check_integrity()?;
            }
        }

        let pagesize = self.device.pagesize();
        let mut conflict = None;
        self.cache.for_each(|page| {
            let address = page.address();
            let on_full = self
                .full_freelist
                .as_ref()
                .is_some_and(|full| full.overlaps(address, pagesize));
            let on_reduced = self.databases.values().any(|database| {
                database
                    .reduced
                    .as_ref()
                    .is_some_and(|reduced| reduced.overlaps(address, pagesize))
            });
            if conflict.is_none() && (on_full || on_reduced) {
                conflict = Some(address);
            }
        });
        if let Some(address) = conflict {
            return Err(BurrowError::Corrupt(format!(
                "page {address} is both cached and on a freelist"
            )));
        }
        Ok(())
    }

    fn persist_freelist(&mut self) -> Result<()> {
        if self
            .flags
            .intersects(EnvFlags::IN_MEMORY.union(EnvFlags::READ_ONLY))
        {
            return Ok(());
        }
        let Some(full) = self.full_freelist.as_mut() else {
            return Ok(());
        };
        if !full.is_dirty() && full.root() == self.header.freelist_root {
            return Ok(());
        }

        full.store(&mut *self.device)?;
        let root = full.root();
        if root != self.header.freelist_root {
            self.header.freelist_root = root;
            let Self { cache, header, .. } = self;
            let page = cache
                .get(HEADER_PAGE_ADDRESS)
                .ok_or(BurrowError::NotFound)?;
            header.write(page.bytes_mut())?;
            page.set_dirty(true);
        }
        Ok(())
    }
}

fn ensure_full_freelist(
    full_freelist: &mut Option<FullFreelist>,
    flags: EnvFlags,
    pagesize: usize,
) -> Option<&mut FullFreelist> {
    if full_freelist.is_none()
        && !flags.contains(EnvFlags::IN_MEMORY)
        && !flags.contains(EnvFlags::READ_ONLY)
    {
        *full_freelist = Some(FullFreelist::new(pagesize));
    }
    full_freelist.as_mut()
}

/// Picks the freelist for a database: its own reduced freelist when it has
/// one, otherwise the environment bitmap (created lazily where the flags
/// allow it).
fn select_freelist<'a>(
    databases: &'a mut HashMap<DbId, Database>,
    full_freelist: &'a mut Option<FullFreelist>,
    flags: EnvFlags,
    pagesize: usize,
    db: Option<DbId>,
) -> Option<&'a mut dyn Freelist> {
    if let Some(id) = db {
        if let Some(database) = databases.get_mut(&id) {
            if let Some(reduced) = database.reduced.as_mut() {
                return Some(reduced);
            }
        }
    }
    ensure_full_freelist(full_freelist, flags, pagesize).map(|full| full as &mut dyn Freelist)
}
