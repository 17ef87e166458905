use super::{align_up, extend_aligned, Freelist, DEFAULT_BLOB_ALIGNMENT};
use crate::device::Device;
use crate::error::{BurrowError, Result};
use crate::types::PageAddress;

/// Per-page header of a persisted freelist page: covered start offset,
/// valid bit count, address of the next freelist page in the chain.
const SEGMENT_HEADER: usize = 20;

/// One bitmap segment, persisted as exactly one freelist page. Bit set
/// means the unit is allocated; offsets not covered by any segment are
/// implicitly allocated.
struct Segment {
    /// First byte offset covered by bit 0.
    start: u64,
    bits: Vec<u8>,
    bit_count: usize,
    /// Address of the freelist page backing this segment; 0 until the
    /// segment has been persisted.
    page_address: PageAddress,
}

impl Segment {
    fn new(start: u64, bit_count: usize) -> Self {
        // all-set: unknown space is allocated until explicitly freed
        Self {
            start,
            bits: vec![0xFF; bit_count.div_ceil(8)],
            bit_count,
            page_address: PageAddress(0),
        }
    }

    fn bit(&self, index: usize) -> bool {
        self.bits[index / 8] & (1 << (index % 8)) != 0
    }

    fn set_bit(&mut self, index: usize) {
        self.bits[index / 8] |= 1 << (index % 8);
    }

    fn clear_bit(&mut self, index: usize) {
        self.bits[index / 8] &= !(1 << (index % 8));
    }
}

/// Environment-wide bitmap freelist. Each bit tracks one alignment-sized
/// unit of the file; segments are created lazily the first time a region
/// inside their window is freed, and persist as a chain of dedicated
/// freelist pages rooted in the environment header.
pub struct FullFreelist {
    pagesize: usize,
    alignment: usize,
    /// Sorted by `start`, windows disjoint.
    segments: Vec<Segment>,
    root: PageAddress,
    dirty: bool,
}

impl FullFreelist {
    pub fn new(pagesize: usize) -> Self {
        Self {
            pagesize,
            alignment: DEFAULT_BLOB_ALIGNMENT,
            segments: Vec::new(),
            root: PageAddress(0),
            dirty: false,
        }
    }

    /// Bits one persisted freelist page can hold.
    fn bits_per_segment(&self) -> usize {
        (self.pagesize - SEGMENT_HEADER) * 8
    }

    /// Bytes one segment window covers.
    fn window_bytes(&self) -> u64 {
        (self.bits_per_segment() * self.alignment) as u64
    }

    pub fn root(&self) -> PageAddress {
        self.root
    }

    pub fn is_dirty(&self) -> bool {
        self.dirty
    }

    fn segment_for(&mut self, offset: u64) -> &mut Segment {
        let window = self.window_bytes();
        let start = offset / window * window;
        let pos = match self.segments.binary_search_by_key(&start, |s| s.start) {
            Ok(pos) => pos,
            Err(pos) => {
                let bits = self.bits_per_segment();
                self.segments.insert(pos, Segment::new(start, bits));
                pos
            }
        };
        &mut self.segments[pos]
    }

    fn free_region(&mut self, address: u64, size: usize) -> Result<()> {
        let alignment = self.alignment;
        debug_assert_eq!(address % alignment as u64, 0);
        let end = address + align_up(size, alignment) as u64;

        let mut offset = address;
        while offset < end {
            let segment = self.segment_for(offset);
            let segment_end = segment.start + (segment.bit_count * alignment) as u64;
            let chunk_end = end.min(segment_end);
            let mut unit = offset;
            while unit < chunk_end {
                let index = ((unit - segment.start) / alignment as u64) as usize;
                segment.clear_bit(index);
                unit += alignment as u64;
            }
            offset = chunk_end;
        }
        self.dirty = true;
        Ok(())
    }

    /// Loads the persisted chain rooted at `root`.
    pub fn load(dev: &mut dyn Device, root: PageAddress) -> Result<Self> {
        let pagesize = dev.pagesize();
        let mut freelist = Self::new(pagesize);
        freelist.root = root;

        let max_pages = (dev.filesize() / pagesize as u64) as usize + 1;
        let mut buf = vec![0u8; pagesize];
        let mut next = root;
        let mut visited = 0;

        while next.0 != 0 {
            visited += 1;
            if visited > max_pages {
                return Err(BurrowError::Corrupt("freelist page chain cycles".into()));
            }
            dev.read_page(next.0, &mut buf)?;

            let start = u64::from_le_bytes(buf[0..8].try_into().expect("fixed slice"));
            let bit_count =
                u32::from_le_bytes(buf[8..12].try_into().expect("fixed slice")) as usize;
            let chain = u64::from_le_bytes(buf[12..20].try_into().expect("fixed slice"));

            if bit_count > freelist.bits_per_segment() {
                return Err(BurrowError::Corrupt(
                    "freelist segment bit count exceeds page capacity".into(),
                ));
            }

            let byte_len = bit_count.div_ceil(8);
            let mut segment = Segment::new(start, bit_count);
            segment
                .bits
                .copy_from_slice(&buf[SEGMENT_HEADER..SEGMENT_HEADER + byte_len]);
            segment.page_address = next;
            freelist.segments.push(segment);

            next = PageAddress(chain);
        }

        freelist.segments.sort_by_key(|s| s.start);
        freelist.check_integrity()?;
        Ok(freelist)
    }

    /// Persists every segment as one freelist page, chaining them in
    /// address-window order. New segments get pages by extending the file;
    /// those pages never appear in the bitmap itself.
    pub fn store(&mut self, dev: &mut dyn Device) -> Result<()> {
        for segment in &mut self.segments {
            if segment.page_address.0 == 0 {
                segment.page_address = PageAddress(dev.alloc_page()?);
            }
        }

        let mut buf = vec![0u8; self.pagesize];
        for index in 0..self.segments.len() {
            let next = self
                .segments
                .get(index + 1)
                .map_or(0, |s| s.page_address.0);
            let segment = &self.segments[index];

            buf.fill(0);
            buf[0..8].copy_from_slice(&segment.start.to_le_bytes());
            buf[8..12].copy_from_slice(&(segment.bit_count as u32).to_le_bytes());
            buf[12..20].copy_from_slice(&next.to_le_bytes());
            buf[SEGMENT_HEADER..SEGMENT_HEADER + segment.bits.len()]
                .copy_from_slice(&segment.bits);

            dev.write_page(segment.page_address.0, &buf, false)?;
        }

        self.root = self
            .segments
            .first()
            .map_or(PageAddress(0), |s| s.page_address);
        self.dirty = false;
        Ok(())
    }
}

impl Freelist for FullFreelist {
    fn alloc(&mut self, dev: &mut dyn Device, size: usize) -> Result<(PageAddress, bool)> {
        let rounded = align_up(size, self.alignment);
        let units = rounded / self.alignment;
        let page_multiple = size > 0 && size % self.pagesize == 0;
        let required_alignment = if page_multiple {
            self.pagesize
        } else {
            self.alignment
        };

        for segment in &mut self.segments {
            if units > segment.bit_count {
                continue;
            }
            // first bit index whose absolute address satisfies the alignment
            let aligned_start =
                crate::device::align_up(segment.start, required_alignment as u64);
            let first = ((aligned_start - segment.start) / self.alignment as u64) as usize;
            let step = required_alignment / self.alignment;

            let mut index = first;
            while index + units <= segment.bit_count {
                if (index..index + units).all(|i| !segment.bit(i)) {
                    for i in index..index + units {
                        segment.set_bit(i);
                    }
                    self.dirty = true;
                    let address = segment.start + (index * self.alignment) as u64;
                    return Ok((PageAddress(address), false));
                }
                index += step;
            }
        }

        // nothing tracked fits; extend the file
        let address = if page_multiple && size == self.pagesize {
            PageAddress(dev.alloc_page()?)
        } else {
            extend_aligned(dev, rounded, required_alignment)?
        };
        Ok((address, true))
    }

    fn free_page(&mut self, address: PageAddress) -> Result<Option<(PageAddress, usize)>> {
        self.free_region(address.0, self.pagesize)?;
        Ok(None)
    }

    fn free_area(
        &mut self,
        address: PageAddress,
        size: usize,
    ) -> Result<Option<(PageAddress, usize)>> {
        self.free_region(address.0, size)?;
        Ok(None)
    }

    fn blob_alignment(&self) -> usize {
        self.alignment
    }

    fn overlaps(&self, address: PageAddress, size: usize) -> bool {
        let alignment = self.alignment as u64;
        let end = address.0 + align_up(size, self.alignment) as u64;
        for segment in &self.segments {
            let seg_end = segment.start + (segment.bit_count * self.alignment) as u64;
            let from = address.0.max(segment.start);
            let to = end.min(seg_end);
            let mut unit = crate::device::align_up(from, alignment);
            while unit < to {
                let index = ((unit - segment.start) / alignment) as usize;
                if !segment.bit(index) {
                    return true;
                }
                unit += alignment;
            }
        }
        false
    }

    fn check_integrity(&self) -> Result<()> {
        let capacity = self.bits_per_segment();
        let mut previous_end = 0u64;
        for segment in &self.segments {
            if segment.bit_count == 0 || segment.bit_count > capacity {
                return Err(BurrowError::Corrupt(
                    "freelist segment bit count out of range".into(),
                ));
            }
            if segment.bits.len() != segment.bit_count.div_ceil(8) {
                return Err(BurrowError::Corrupt(
                    "freelist segment bitmap length mismatch".into(),
                ));
            }
            if segment.start % self.alignment as u64 != 0 {
                return Err(BurrowError::Corrupt(
                    "freelist segment start is misaligned".into(),
                ));
            }
            if segment.start < previous_end {
                return Err(BurrowError::Corrupt("freelist segments overlap".into()));
            }
            previous_end = segment.start + (segment.bit_count * self.alignment) as u64;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::device::MemoryDevice;

    const PAGESIZE: usize = 1024;

    fn device() -> MemoryDevice {
        MemoryDevice::new(PAGESIZE)
    }

    #[test]
    fn empty_freelist_extends_file() {
        let mut dev = device();
        let mut freelist = FullFreelist::new(PAGESIZE);

        let (address, allocated_new) = freelist.alloc(&mut dev, PAGESIZE).expect("alloc");
        assert_eq!(address, PageAddress(0));
        assert!(allocated_new);
    }

    #[test]
    fn freed_page_is_reused_at_same_address() {
        let mut dev = device();
        let mut freelist = FullFreelist::new(PAGESIZE);

        let (first, _) = freelist.alloc(&mut dev, PAGESIZE).expect("alloc");
        let (second, _) = freelist.alloc(&mut dev, PAGESIZE).expect("alloc");
        assert_ne!(first, second);

        freelist.free_page(first).expect("free");
        let (reused, allocated_new) = freelist.alloc(&mut dev, PAGESIZE).expect("alloc");
        assert_eq!(reused, first);
        assert!(!allocated_new);
    }

    #[test]
    fn page_allocations_stay_page_aligned_after_blob_churn() {
        let mut dev = device();
        let mut freelist = FullFreelist::new(PAGESIZE);

        let (blob, _) = freelist.alloc(&mut dev, 100).expect("alloc blob");
        freelist.free_area(blob, 100).expect("free blob");

        let (page, _) = freelist.alloc(&mut dev, PAGESIZE).expect("alloc page");
        assert_eq!(page.0 % PAGESIZE as u64, 0);
    }

    #[test]
    fn blob_region_reclaims_exact_aligned_bytes() {
        let mut dev = device();
        let mut freelist = FullFreelist::new(PAGESIZE);

        let (blob, _) = freelist.alloc(&mut dev, 64).expect("alloc blob");
        freelist.free_area(blob, 64).expect("free blob");

        let (again, allocated_new) = freelist.alloc(&mut dev, 64).expect("alloc blob");
        assert_eq!(again, blob);
        assert!(!allocated_new);
    }

    #[test]
    fn oversized_blob_extends_file() {
        let mut dev = device();
        let mut freelist = FullFreelist::new(PAGESIZE);

        let (_, allocated_new) = freelist
            .alloc(&mut dev, PAGESIZE * 2 + 100)
            .expect("alloc blob");
        assert!(allocated_new);
    }

    #[test]
    fn overlaps_reports_freed_regions_only() {
        let mut dev = device();
        let mut freelist = FullFreelist::new(PAGESIZE);

        let (page, _) = freelist.alloc(&mut dev, PAGESIZE).expect("alloc");
        assert!(!freelist.overlaps(page, PAGESIZE));

        freelist.free_page(page).expect("free");
        assert!(freelist.overlaps(page, PAGESIZE));
    }

    #[test]
    fn store_load_roundtrip() {
        let mut dev = device();
        let mut freelist = FullFreelist::new(PAGESIZE);

        let (first, _) = freelist.alloc(&mut dev, PAGESIZE).expect("alloc");
        let (second, _) = freelist.alloc(&mut dev, PAGESIZE).expect("alloc");
        freelist.free_page(first).expect("free");
        freelist.free_page(second).expect("free");

        freelist.store(&mut dev).expect("store");
        assert_ne!(freelist.root(), PageAddress(0));
        assert!(!freelist.is_dirty());

        let mut loaded = FullFreelist::load(&mut dev, freelist.root()).expect("load");
        assert!(loaded.overlaps(first, PAGESIZE));
        assert!(loaded.overlaps(second, PAGESIZE));

        let (reused, allocated_new) = loaded.alloc(&mut dev, PAGESIZE).expect("alloc");
        assert_eq!(reused, first);
        assert!(!allocated_new);
    }

    #[test]
    fn check_integrity_accepts_live_state() {
        let mut dev = device();
        let mut freelist = FullFreelist::new(PAGESIZE);
        for _ in 0..4 {
            let (address, _) = freelist.alloc(&mut dev, PAGESIZE).expect("alloc");
            freelist.free_page(address).expect("free");
        }
        freelist.check_integrity().expect("integrity");
    }
}
