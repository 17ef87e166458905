use crate::error::{BurrowError, Result};
use crate::types::PageAddress;

const MAGIC: &[u8; 8] = b"BURROW\0\0";
const HEADER_REGION_SIZE: usize = 24;
const VERSION_MAJOR: u16 = 1;
const VERSION_MINOR: u16 = 0;

/// Environment header persisted at the start of page 0: magic, format
/// version, pagesize, and the address of the first freelist page.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EnvHeader {
    pub pagesize: u32,
    pub freelist_root: PageAddress,
}

impl EnvHeader {
    pub fn new(pagesize: usize) -> Result<Self> {
        let pagesize = u32::try_from(pagesize)
            .map_err(|_| BurrowError::Corrupt("pagesize exceeds u32::MAX".into()))?;
        Ok(Self {
            pagesize,
            freelist_root: PageAddress(0),
        })
    }

    /// Reads a header from a page buffer. Returns `Ok(None)` when the region
    /// is all zero (fresh file).
    pub fn read(data: &[u8]) -> Result<Option<Self>> {
        if data.len() < HEADER_REGION_SIZE {
            return Err(BurrowError::Corrupt(
                "header page shorter than expected".into(),
            ));
        }

        if data[..MAGIC.len()].iter().all(|&b| b == 0) {
            return Ok(None);
        }

        if &data[..MAGIC.len()] != MAGIC {
            return Err(BurrowError::Corrupt("invalid environment magic".into()));
        }

        let major = u16::from_le_bytes([data[8], data[9]]);
        let minor = u16::from_le_bytes([data[10], data[11]]);
        if major != VERSION_MAJOR || minor != VERSION_MINOR {
            return Err(BurrowError::Corrupt(format!(
                "unsupported format version {major}.{minor}"
            )));
        }

        let pagesize = u32::from_le_bytes(data[12..16].try_into().expect("fixed slice"));
        if pagesize == 0 || !pagesize.is_power_of_two() {
            return Err(BurrowError::Corrupt("pagesize is not a power of two".into()));
        }

        let freelist_root = u64::from_le_bytes(data[16..24].try_into().expect("fixed slice"));

        Ok(Some(Self {
            pagesize,
            freelist_root: PageAddress(freelist_root),
        }))
    }

    pub fn write(&self, data: &mut [u8]) -> Result<()> {
        if data.len() < HEADER_REGION_SIZE {
            return Err(BurrowError::Corrupt(
                "header page shorter than expected".into(),
            ));
        }

        data[..MAGIC.len()].copy_from_slice(MAGIC);
        data[8..10].copy_from_slice(&VERSION_MAJOR.to_le_bytes());
        data[10..12].copy_from_slice(&VERSION_MINOR.to_le_bytes());
        data[12..16].copy_from_slice(&self.pagesize.to_le_bytes());
        data[16..24].copy_from_slice(&self.freelist_root.0.to_le_bytes());
        Ok(())
    }
}
