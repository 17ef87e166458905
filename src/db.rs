use crate::freelist::ReducedFreelist;
use crate::types::DbId;

#[derive(Debug, Clone, Default)]
pub struct DatabaseOptions {
    pub name: Option<String>,
    /// Give this database its own compact freelist instead of the
    /// environment-wide bitmap.
    pub reduced_freelist: bool,
}

/// Per-database state held by the PageManager. Pages carry the database id
/// as a weak back-edge; the id is only used to locate this record's
/// freelist when a page is freed.
pub struct Database {
    id: DbId,
    name: Option<String>,
    pub(crate) reduced: Option<ReducedFreelist>,
}

impl Database {
    pub(crate) fn new(id: DbId, name: Option<String>, reduced: Option<ReducedFreelist>) -> Self {
        Self { id, name, reduced }
    }

    pub fn id(&self) -> DbId {
        self.id
    }

    pub fn name(&self) -> Option<&str> {
        self.name.as_deref()
    }

    pub fn has_reduced_freelist(&self) -> bool {
        self.reduced.is_some()
    }
}
