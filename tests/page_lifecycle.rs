use burrow::{
    AllocFlags, Config, EnvFlags, FileDevice, MemoryDevice, PageAddress, PageManager, PageType,
    HEADER_PAGE_ADDRESS,
};

const PAGESIZE: usize = 1024;

fn tiny_cache() -> Config {
    Config {
        cache_capacity: 0,
        use_mmap: false,
    }
}

fn memory_manager(config: Config) -> PageManager {
    let device = Box::new(MemoryDevice::new(PAGESIZE));
    PageManager::create(device, EnvFlags::empty(), config).expect("create environment")
}

#[test]
fn fresh_environment_allocates_after_header() {
    let mut manager = memory_manager(tiny_cache());

    let address = {
        let page = manager
            .alloc_page(None, PageType::Index, AllocFlags::CLEAR_WITH_ZERO)
            .expect("alloc page");
        assert!(page.bytes().iter().all(|&b| b == 0), "page must be zeroed");
        page.address()
    };
    assert_eq!(address, PageAddress(PAGESIZE as u64));

    manager.flush_all_pages(false).expect("flush all");
    manager.release_page(address).expect("release");
    manager.purge_cache().expect("purge");
    assert!(!manager.cache().contains(address));

    let page = manager
        .fetch_page(None, address, false)
        .expect("refetch page");
    assert!(page.bytes().iter().all(|&b| b == 0));
}

#[test]
fn purge_evicts_least_recently_used_page() {
    let config = Config {
        cache_capacity: 2,
        use_mmap: false,
    };
    let mut manager = memory_manager(config);

    let mut addresses = Vec::new();
    for _ in 0..3 {
        let address = manager
            .alloc_page(None, PageType::Index, AllocFlags::empty())
            .expect("alloc page")
            .address();
        manager.release_page(address).expect("release");
        addresses.push(address);
    }
    manager.flush_all_pages(false).expect("flush all");

    // header + 3 pages cached, capacity 2: the two oldest unpinned pages go
    manager.purge_cache().expect("purge");
    assert_eq!(manager.cache().len(), 2);
    assert!(!manager.cache().contains(addresses[0]));
    assert!(!manager.cache().contains(addresses[1]));
    assert!(manager.cache().contains(addresses[2]));
    assert!(manager.cache().contains(HEADER_PAGE_ADDRESS));
}

#[test]
fn purge_with_everything_pinned_evicts_nothing() {
    let mut manager = memory_manager(tiny_cache());

    for _ in 0..3 {
        manager
            .alloc_page(None, PageType::Index, AllocFlags::empty())
            .expect("alloc page");
        // pins are deliberately not released
    }
    let before = manager.cache().len();
    manager.purge_cache().expect("purge succeeds");
    assert_eq!(manager.cache().len(), before);
}

#[test]
fn flush_all_with_clear_cache_drops_unpinned_pages() {
    let mut manager = memory_manager(Config::default());

    let pinned = manager
        .alloc_page(None, PageType::Index, AllocFlags::empty())
        .expect("alloc page")
        .address();
    let released = manager
        .alloc_page(None, PageType::Index, AllocFlags::empty())
        .expect("alloc page")
        .address();
    manager.release_page(released).expect("release");

    manager.flush_all_pages(true).expect("flush all");

    assert!(manager.cache().contains(pinned), "pinned page is retained");
    assert!(manager.cache().contains(HEADER_PAGE_ADDRESS));
    assert!(!manager.cache().contains(released));
}

#[test]
fn flushed_contents_survive_eviction() {
    let mut manager = memory_manager(tiny_cache());

    let address = {
        let page = manager
            .alloc_page(None, PageType::Blob, AllocFlags::CLEAR_WITH_ZERO)
            .expect("alloc page");
        page.bytes_mut()[..4].copy_from_slice(&[0xDE, 0xAD, 0xBE, 0xEF]);
        page.set_dirty(true);
        page.address()
    };

    manager.flush_all_pages(false).expect("flush all");
    manager.release_page(address).expect("release");
    manager.purge_cache().expect("purge");

    let page = manager.fetch_page(None, address, false).expect("refetch");
    assert_eq!(&page.bytes()[..4], &[0xDE, 0xAD, 0xBE, 0xEF]);
}

#[test]
fn environment_reopens_from_disk() {
    let dir = tempfile::TempDir::new().expect("temp dir");
    let path = dir.path().join("pages.burrow");

    let address = {
        let device = Box::new(FileDevice::open(&path, PAGESIZE, false).expect("open device"));
        let mut manager =
            PageManager::create(device, EnvFlags::empty(), Config::default()).expect("create");
        let address = {
            let page = manager
                .alloc_page(None, PageType::Index, AllocFlags::CLEAR_WITH_ZERO)
                .expect("alloc page");
            page.bytes_mut()[..8].copy_from_slice(b"persists");
            page.set_dirty(true);
            page.address()
        };
        manager.flush_all_pages(false).expect("flush all");
        address
    };

    let device = Box::new(FileDevice::open(&path, PAGESIZE, false).expect("reopen device"));
    let mut manager = PageManager::open(device, EnvFlags::empty(), Config::default()).expect("open");
    let page = manager.fetch_page(None, address, false).expect("fetch");
    assert_eq!(&page.bytes()[..8], b"persists");
}

#[test]
fn open_rejects_mismatched_pagesize() {
    let dir = tempfile::TempDir::new().expect("temp dir");
    let path = dir.path().join("pages.burrow");

    {
        let device = Box::new(FileDevice::open(&path, PAGESIZE, false).expect("open device"));
        let mut manager =
            PageManager::create(device, EnvFlags::empty(), Config::default()).expect("create");
        manager.flush_all_pages(false).expect("flush all");
    }

    let device = Box::new(FileDevice::open(&path, 4096, false).expect("reopen device"));
    let result = PageManager::open(device, EnvFlags::empty(), Config::default());
    assert!(matches!(result, Err(burrow::BurrowError::Corrupt(_))));
}

#[test]
fn freelist_survives_reopen() {
    let dir = tempfile::TempDir::new().expect("temp dir");
    let path = dir.path().join("pages.burrow");

    let freed = {
        let device = Box::new(FileDevice::open(&path, PAGESIZE, false).expect("open device"));
        let mut manager =
            PageManager::create(device, EnvFlags::empty(), Config::default()).expect("create");
        let mut txns = burrow::TransactionManager::new();
        let db = manager.open_database(Default::default());

        let txn = txns.begin(db, None, burrow::TxnFlags::empty());
        let address = manager
            .alloc_page(Some(db), PageType::Index, AllocFlags::empty())
            .expect("alloc page")
            .address();
        txns.free_page(&mut manager, txn, address).expect("free page");
        txns.commit(&mut manager, txn, burrow::TxnFlags::empty())
            .expect("commit");

        manager.flush_all_pages(false).expect("flush all");
        address
    };

    let device = Box::new(FileDevice::open(&path, PAGESIZE, false).expect("reopen device"));
    let mut manager = PageManager::open(device, EnvFlags::empty(), Config::default()).expect("open");
    let reused = manager
        .alloc_page(None, PageType::Index, AllocFlags::empty())
        .expect("alloc page")
        .address();
    assert_eq!(reused, freed, "persisted freelist must hand the page back");
}
