use std::collections::VecDeque;
use std::mem;

use bitflags::bitflags;
use tracing::{debug, info, warn};

use crate::config::EnvFlags;
use crate::error::{BurrowError, Result};
use crate::manager::PageManager;
use crate::page::PageFlags;
use crate::types::{DbId, PageAddress, TxnId};

bitflags! {
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct TxnFlags: u32 {
        /// Commit flushes become synchronous write-through writes.
        const FORCE_WRITE = 1;
        /// The transaction never carries dirty pages.
        const READ_ONLY = 2;
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TxnState {
    Active,
    Committed,
    Aborted,
}

/// One transaction's view of the pages it touched. The pagelist holds
/// addresses, newest first, so commit processes pages in the reverse of the
/// order they were added.
pub struct Transaction {
    id: TxnId,
    db: DbId,
    name: Option<String>,
    flags: TxnFlags,
    state: TxnState,
    pagelist: VecDeque<PageAddress>,
}

impl Transaction {
    pub fn id(&self) -> TxnId {
        self.id
    }

    pub fn db(&self) -> DbId {
        self.db
    }

    pub fn name(&self) -> Option<&str> {
        self.name.as_deref()
    }

    pub fn flags(&self) -> TxnFlags {
        self.flags
    }

    pub fn state(&self) -> TxnState {
        self.state
    }

    pub fn is_terminal(&self) -> bool {
        self.state != TxnState::Active
    }

    pub fn page_count(&self) -> usize {
        self.pagelist.len()
    }

    pub fn contains(&self, address: PageAddress) -> bool {
        self.pagelist.contains(&address)
    }
}

/// Tail-ordered list of live transactions. Terminal transactions stay in
/// the list, preserving submission order, until `flush_committed_txns`
/// reclaims them from the head.
pub struct TransactionManager {
    txns: VecDeque<Transaction>,
    next_id: u64,
}

impl Default for TransactionManager {
    fn default() -> Self {
        Self::new()
    }
}

impl TransactionManager {
    pub fn new() -> Self {
        Self {
            txns: VecDeque::new(),
            next_id: 1,
        }
    }

    pub fn len(&self) -> usize {
        self.txns.len()
    }

    pub fn is_empty(&self) -> bool {
        self.txns.is_empty()
    }

    pub fn get(&self, id: TxnId) -> Option<&Transaction> {
        self.txns.iter().find(|txn| txn.id == id)
    }

    fn txn_mut(&mut self, id: TxnId) -> Result<&mut Transaction> {
        self.txns
            .iter_mut()
            .find(|txn| txn.id == id)
            .ok_or(BurrowError::NotFound)
    }

    fn ensure_active(txn: &Transaction) -> Result<()> {
        if txn.state != TxnState::Active {
            return Err(BurrowError::InvalidState(
                "operation on a terminal transaction",
            ));
        }
        Ok(())
    }

    /// Starts a transaction and appends it to the tail of the list.
    pub fn begin(&mut self, db: DbId, name: Option<&str>, flags: TxnFlags) -> TxnId {
        let id = TxnId(self.next_id);
        self.next_id += 1;

        self.txns.push_back(Transaction {
            id,
            db,
            name: name.map(str::to_owned),
            flags,
            state: TxnState::Active,
            pagelist: VecDeque::new(),
        });
        debug!(txn = id.0, db = db.0, "transaction started");
        id
    }

    /// Records a page in the transaction's page set and takes a reference
    /// on it. Adding the same page twice is a caller bug unless
    /// `ignore_if_present` is set.
    pub fn add_page(
        &mut self,
        manager: &mut PageManager,
        id: TxnId,
        address: PageAddress,
        ignore_if_present: bool,
    ) -> Result<()> {
        let txn = self.txn_mut(id)?;
        Self::ensure_active(txn)?;

        if txn.pagelist.contains(&address) {
            if ignore_if_present {
                return Ok(());
            }
            return Err(BurrowError::AlreadyPresent(address));
        }

        let read_only = txn.flags.contains(TxnFlags::READ_ONLY);
        let page = manager.page_mut(address)?;
        if read_only && page.is_dirty() {
            return Err(BurrowError::InvalidState(
                "dirty page added to a read-only transaction",
            ));
        }

        page.add_ref();
        txn.pagelist.push_front(address);
        Ok(())
    }

    /// Schedules a page for deletion at commit. The page joins the
    /// transaction's page set if it was not in it already.
    pub fn free_page(
        &mut self,
        manager: &mut PageManager,
        id: TxnId,
        address: PageAddress,
    ) -> Result<()> {
        self.add_page(manager, id, address, true)?;

        let page = manager.page_mut(address)?;
        if page.flags().contains(PageFlags::DELETE_PENDING) {
            return Err(BurrowError::InvalidState(
                "page already scheduled for deletion",
            ));
        }
        page.insert_flags(PageFlags::DELETE_PENDING);
        Ok(())
    }

    /// Unlinks a page from the transaction's page set and drops the
    /// reference taken by `add_page`.
    pub fn remove_page(
        &mut self,
        manager: &mut PageManager,
        id: TxnId,
        address: PageAddress,
    ) -> Result<()> {
        let txn = self.txn_mut(id)?;
        Self::ensure_active(txn)?;

        let position = txn
            .pagelist
            .iter()
            .position(|&a| a == address)
            .ok_or(BurrowError::NotFound)?;
        txn.pagelist.remove(position);
        manager.page_mut(address)?.release_ref();
        Ok(())
    }

    pub fn page_in_txn(&self, id: TxnId, address: PageAddress) -> bool {
        self.get(id).is_some_and(|txn| txn.contains(address))
    }

    /// Commits: flushes the page set (newest first), returns delete-pending
    /// pages to the freelist, and releases every reference. A flush failure
    /// restores the unprocessed remainder onto the transaction, aborts it,
    /// and propagates the original error.
    pub fn commit(&mut self, manager: &mut PageManager, id: TxnId, flags: TxnFlags) -> Result<()> {
        let txn = self.txn_mut(id)?;
        Self::ensure_active(txn)?;

        let write_through = flags.contains(TxnFlags::FORCE_WRITE)
            || txn.flags.contains(TxnFlags::FORCE_WRITE)
            || manager.flags().contains(EnvFlags::WRITE_THROUGH);

        let mut pages = mem::take(&mut txn.pagelist);
        let page_count = pages.len();

        while let Some(address) = pages.pop_front() {
            if let Err(error) = Self::commit_page(manager, address, write_through) {
                warn!(
                    txn = id.0,
                    page = %address,
                    error = %error,
                    "commit failed"
                );
                pages.push_front(address);
                self.txn_mut(id)?.pagelist = pages;
                self.abort(manager, id)?;
                return Err(error);
            }
        }

        let txn = self.txn_mut(id)?;
        txn.state = TxnState::Committed;
        info!(txn = id.0, pages = page_count, "transaction committed");
        Ok(())
    }

    fn commit_page(
        manager: &mut PageManager,
        address: PageAddress,
        write_through: bool,
    ) -> Result<()> {
        let page = manager.page_mut(address)?;
        if page.flags().contains(PageFlags::DELETE_PENDING) {
            // the on-disk space outlives the handle; nothing to flush
            page.set_dirty(false);
            manager.discard_page(address)?;
        } else {
            manager.flush_page(address, write_through)?;
            manager.page_mut(address)?.release_ref();
        }
        Ok(())
    }

    /// Discards the page set without writing anything. Dirty bytes linger
    /// in the cache; the log layer is responsible for pre-image
    /// restoration. Aborting an already-terminal transaction is a no-op.
    pub fn abort(&mut self, manager: &mut PageManager, id: TxnId) -> Result<()> {
        let txn = self.txn_mut(id)?;
        if txn.state != TxnState::Active {
            return Ok(());
        }

        let pages = mem::take(&mut txn.pagelist);
        let page_count = pages.len();
        for address in pages {
            // errors are swallowed; abort must succeed observably
            if let Ok(page) = manager.page_mut(address) {
                page.release_ref();
            }
        }

        let txn = self.txn_mut(id)?;
        txn.state = TxnState::Aborted;
        warn!(txn = id.0, pages = page_count, "transaction aborted");
        Ok(())
    }

    /// Reclaims terminal transactions from the head of the list, stopping
    /// at the first active one. Returns how many were reclaimed.
    pub fn flush_committed_txns(&mut self) -> usize {
        let mut reclaimed = 0;
        while self
            .txns
            .front()
            .is_some_and(Transaction::is_terminal)
        {
            self.txns.pop_front();
            reclaimed += 1;
        }
        reclaimed
    }
}
