use lru::LruCache;

use crate::error::{BurrowError, Result};
use crate::page::Page;
use crate::types::PageAddress;

/// Bounded associative store of live pages keyed by address. Recency is
/// tracked by the underlying LRU list; eviction only ever considers
/// unpinned pages, strictly least-recently-used first.
pub struct Cache {
    pages: LruCache<PageAddress, Page>,
    capacity: usize,
}

impl Cache {
    /// `capacity` is a soft bound in pages; `purge` brings the cache back
    /// under it.
    pub fn new(capacity: usize) -> Self {
        Self {
            pages: LruCache::unbounded(),
            capacity,
        }
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn len(&self) -> usize {
        self.pages.len()
    }

    pub fn is_empty(&self) -> bool {
        self.pages.is_empty()
    }

    pub fn contains(&self, address: PageAddress) -> bool {
        self.pages.contains(&address)
    }

    /// Looks up a page and promotes it to most-recently-used.
    pub fn get(&mut self, address: PageAddress) -> Option<&mut Page> {
        self.pages.get_mut(&address)
    }

    /// Looks up a page without touching the eviction order.
    pub fn peek(&self, address: PageAddress) -> Option<&Page> {
        self.pages.peek(&address)
    }

    pub fn peek_mut(&mut self, address: PageAddress) -> Option<&mut Page> {
        self.pages.peek_mut(&address)
    }

    /// Inserts a page under its address. Address collisions are a caller
    /// bug and reported, never silently replaced.
    pub fn put(&mut self, page: Page) -> Result<()> {
        let address = page.address();
        if self.pages.contains(&address) {
            return Err(BurrowError::AlreadyPresent(address));
        }
        self.pages.push(address, page);
        Ok(())
    }

    pub fn remove(&mut self, address: PageAddress) -> Option<Page> {
        self.pages.pop(&address)
    }

    /// Evicts unpinned pages, least-recently-used first, until at most
    /// `target` pages remain. Dirty victims are flushed through `flush`
    /// before leaving the cache; a flush failure keeps the page cached and
    /// dirty and propagates the error. Returns the number of evictions.
    pub fn purge<F>(&mut self, target: usize, mut flush: F) -> Result<usize>
    where
        F: FnMut(&mut Page) -> Result<()>,
    {
        if self.pages.len() <= target {
            return Ok(0);
        }
        let wanted = self.pages.len() - target;

        // lru iterates most-recent first; walk it backwards for LRU order.
        let victims: Vec<PageAddress> = self
            .pages
            .iter()
            .rev()
            .filter(|(_, page)| !page.is_pinned())
            .map(|(&address, _)| address)
            .take(wanted)
            .collect();

        let mut evicted = 0;
        for address in victims {
            let page = self
                .pages
                .peek_mut(&address)
                .expect("victim still cached");
            if page.is_dirty() {
                flush(page)?;
            }
            self.pages.pop(&address);
            evicted += 1;
        }
        Ok(evicted)
    }

    /// Visits every live page. Order is unspecified.
    pub fn for_each<F>(&self, mut f: F)
    where
        F: FnMut(&Page),
    {
        for (_, page) in self.pages.iter() {
            f(page);
        }
    }

    /// Snapshot of all cached addresses, for iteration that mutates the
    /// cache as it goes.
    pub fn addresses(&self) -> Vec<PageAddress> {
        self.pages.iter().map(|(&address, _)| address).collect()
    }

    pub fn check_integrity(&self) -> Result<()> {
        for (&address, page) in self.pages.iter() {
            if page.address() != address {
                return Err(BurrowError::Corrupt(format!(
                    "cache key {address} does not match page address {}",
                    page.address()
                )));
            }
        }
        Ok(())
    }
}
