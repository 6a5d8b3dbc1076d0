//! Allocator for executable memory.
//!
//! Chunks of pages come from a [`PageAllocator`] and are carved into
//! allocations. Blocks are kept in an address-ordered map, so the neighbours
//! of a block are its map predecessor and successor inside the same chunk.
//! Free blocks are also indexed by size for best-fit lookup. After every
//! [`ExecutableAllocator::free`] no two adjacent blocks of a chunk are both
//! free.
//!
//! Code is not executed by the host CPU; the bytes stored here are read back
//! by the machine simulator in `jit::machine`.

use std::collections::{BTreeMap, BTreeSet};

use parking_lot::Mutex;
use thiserror::Error;

/// Every allocation is a multiple of this many bytes.
pub const ALLOCATION_GRANULE: usize = 16;

/// First address handed out by [`HeapPageAllocator`]. Below 4 GiB so 32-bit
/// targets can address generated code directly.
pub const EXECUTABLE_BASE: u64 = 0x1000_0000;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum AllocatorError {
    #[error("page allocator refused {size} bytes of executable memory")]
    OutOfPages { size: usize },
    #[error("address {address:#x} (+{len}) is not inside a live allocation")]
    BadAddress { address: u64, len: usize },
}

/// A range of pages obtained from the OS-level page provider.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PageRange {
    pub base: u64,
    pub size: usize,
}

/// OS-level page provider.
pub trait PageAllocator: Send {
    fn allocate_pages(&mut self, size: usize) -> Result<PageRange, AllocatorError>;
    fn release_pages(&mut self, range: PageRange);
}

/// Hands out address ranges from a simulated address space starting at
/// [`EXECUTABLE_BASE`], leaving one unmapped page between ranges.
#[derive(Debug, Clone)]
pub struct HeapPageAllocator {
    next: u64,
    limit: Option<usize>,
    in_use: usize,
}

impl Default for HeapPageAllocator {
    fn default() -> Self {
        HeapPageAllocator {
            next: EXECUTABLE_BASE,
            limit: None,
            in_use: 0,
        }
    }
}

impl HeapPageAllocator {
    /// Refuses requests once `bytes` are outstanding.
    pub fn with_limit(bytes: usize) -> Self {
        HeapPageAllocator {
            limit: Some(bytes),
            ..HeapPageAllocator::default()
        }
    }
}

impl PageAllocator for HeapPageAllocator {
    fn allocate_pages(&mut self, size: usize) -> Result<PageRange, AllocatorError> {
        if let Some(limit) = self.limit {
            if self.in_use + size > limit {
                return Err(AllocatorError::OutOfPages { size });
            }
        }
        let range = PageRange { base: self.next, size };
        self.next += size as u64 + 4096;
        self.in_use += size;
        Ok(range)
    }

    fn release_pages(&mut self, range: PageRange) {
        self.in_use = self.in_use.saturating_sub(range.size);
    }
}

/// A block handed out by [`ExecutableAllocator::allocate`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Allocation {
    pub start: u64,
    pub size: usize,
}

impl Allocation {
    pub fn end(&self) -> u64 {
        self.start + self.size as u64
    }
}

#[derive(Debug, Clone, Copy)]
struct Block {
    size: usize,
    free: bool,
    chunk: u64,
}

struct ChunkOfPages {
    range: PageRange,
    bytes: Vec<u8>,
}

struct State {
    pages: Box<dyn PageAllocator>,
    page_size: usize,
    chunks: BTreeMap<u64, ChunkOfPages>,
    blocks: BTreeMap<u64, Block>,
    free_by_size: BTreeMap<usize, BTreeSet<u64>>,
}

impl State {
    fn index_free(&mut self, start: u64, size: usize) {
        self.free_by_size.entry(size).or_default().insert(start);
    }

    fn unindex_free(&mut self, start: u64, size: usize) {
        if let Some(set) = self.free_by_size.get_mut(&size) {
            set.remove(&start);
            if set.is_empty() {
                self.free_by_size.remove(&size);
            }
        }
    }

    fn best_fit(&self, size: usize) -> Option<(u64, usize)> {
        self.free_by_size
            .range(size..)
            .next()
            .and_then(|(s, set)| set.iter().next().map(|start| (*start, *s)))
    }

    fn add_chunk(&mut self, size: usize) -> Result<(), AllocatorError> {
        let size = round_up(size, self.page_size);
        let range = self.pages.allocate_pages(size)?;
        tracing::debug!(target: "jsv4::alloc", base = range.base, size, "new chunk of pages");
        self.chunks.insert(
            range.base,
            ChunkOfPages {
                range,
                bytes: vec![0; size],
            },
        );
        self.blocks.insert(
            range.base,
            Block {
                size,
                free: true,
                chunk: range.base,
            },
        );
        self.index_free(range.base, size);
        Ok(())
    }

    /// Carves `size` bytes off the front of the free block at `start`.
    fn split(&mut self, start: u64, size: usize) {
        let block = self.blocks[&start];
        let rest = block.size - size;
        if rest < ALLOCATION_GRANULE {
            return;
        }
        self.unindex_free(start, block.size);
        self.blocks.insert(start, Block { size, ..block });
        let tail = start + size as u64;
        self.blocks.insert(
            tail,
            Block {
                size: rest,
                free: true,
                chunk: block.chunk,
            },
        );
        self.index_free(start, size);
        self.index_free(tail, rest);
    }

    /// Folds the free successor of `start` into it.
    fn merge_next(&mut self, start: u64) -> bool {
        let block = self.blocks[&start];
        let next_start = start + block.size as u64;
        match self.blocks.get(&next_start).copied() {
            Some(next) if next.free && next.chunk == block.chunk => {
                self.unindex_free(next_start, next.size);
                self.blocks.remove(&next_start);
                self.blocks.insert(
                    start,
                    Block {
                        size: block.size + next.size,
                        ..block
                    },
                );
                true
            }
            _ => false,
        }
    }

    /// Folds the block at `start` into its free predecessor, returning the
    /// merged block's start.
    fn merge_previous(&mut self, start: u64) -> u64 {
        let block = self.blocks[&start];
        let prev = self
            .blocks
            .range(..start)
            .next_back()
            .map(|(s, b)| (*s, *b));
        match prev {
            Some((prev_start, prev))
                if prev.free && prev.chunk == block.chunk && prev_start + prev.size as u64 == start =>
            {
                self.unindex_free(prev_start, prev.size);
                self.blocks.remove(&start);
                self.blocks.insert(
                    prev_start,
                    Block {
                        size: prev.size + block.size,
                        ..prev
                    },
                );
                prev_start
            }
            _ => start,
        }
    }

    fn chunk_for(&mut self, address: u64, len: usize) -> Result<&mut ChunkOfPages, AllocatorError> {
        let bad = AllocatorError::BadAddress { address, len };
        let (base, block) = match self.blocks.range(..=address).next_back() {
            Some((base, block)) => (*base, *block),
            None => return Err(bad),
        };
        if block.free || address + len as u64 > base + block.size as u64 {
            return Err(bad);
        }
        self.chunks.get_mut(&block.chunk).ok_or(bad)
    }
}

fn round_up(n: usize, to: usize) -> usize {
    let to = to.max(1);
    ((n + to - 1) / to).max(1) * to
}

/// Thread-safe allocator for generated code. Shared between engines through
/// an `Arc`.
pub struct ExecutableAllocator {
    state: Mutex<State>,
}

impl ExecutableAllocator {
    pub fn new<P: PageAllocator + 'static>(pages: P, page_size: usize) -> Self {
        ExecutableAllocator {
            state: Mutex::new(State {
                pages: Box::new(pages),
                page_size: round_up(page_size, ALLOCATION_GRANULE),
                chunks: BTreeMap::new(),
                blocks: BTreeMap::new(),
                free_by_size: BTreeMap::new(),
            }),
        }
    }

    /// Returns a block of at least `size` bytes, requesting a new chunk of
    /// pages when no free block is big enough.
    pub fn allocate(&self, size: usize) -> Result<Allocation, AllocatorError> {
        let size = round_up(size, ALLOCATION_GRANULE);
        let mut state = self.state.lock();
        let (start, _) = match state.best_fit(size) {
            Some(fit) => fit,
            None => {
                state.add_chunk(size)?;
                state
                    .best_fit(size)
                    .ok_or(AllocatorError::OutOfPages { size })?
            }
        };
        state.split(start, size);
        let block_size = state.blocks[&start].size;
        state.unindex_free(start, block_size);
        if let Some(b) = state.blocks.get_mut(&start) {
            b.free = false;
        }
        tracing::trace!(target: "jsv4::alloc", start, size = block_size, "allocate");
        Ok(Allocation {
            start,
            size: block_size,
        })
    }

    /// Returns `allocation` to the free list, coalescing it with free
    /// neighbours. Chunks that become entirely free go back to the page
    /// allocator.
    pub fn free(&self, allocation: Allocation) {
        let mut state = self.state.lock();
        match state.blocks.get_mut(&allocation.start) {
            Some(b) if !b.free => b.free = true,
            _ => {
                tracing::warn!(target: "jsv4::alloc", start = allocation.start, "free of unknown allocation");
                return;
            }
        }
        state.merge_next(allocation.start);
        let start = state.merge_previous(allocation.start);
        let block = state.blocks[&start];
        let chunk_size = state.chunks.get(&block.chunk).map(|c| c.range.size);
        if start == block.chunk && Some(block.size) == chunk_size {
            state.blocks.remove(&start);
            if let Some(chunk) = state.chunks.remove(&block.chunk) {
                tracing::debug!(target: "jsv4::alloc", base = chunk.range.base, "releasing chunk");
                state.pages.release_pages(chunk.range);
            }
            return;
        }
        state.index_free(start, block.size);
        tracing::trace!(target: "jsv4::alloc", start, size = block.size, "free");
    }

    /// Copies `bytes` into a live allocation.
    pub fn write(&self, address: u64, bytes: &[u8]) -> Result<(), AllocatorError> {
        let mut state = self.state.lock();
        let chunk = state.chunk_for(address, bytes.len())?;
        let offset = (address - chunk.range.base) as usize;
        chunk.bytes[offset..offset + bytes.len()].copy_from_slice(bytes);
        Ok(())
    }

    pub fn read(&self, address: u64, len: usize) -> Result<Vec<u8>, AllocatorError> {
        let mut state = self.state.lock();
        let chunk = state.chunk_for(address, len)?;
        let offset = (address - chunk.range.base) as usize;
        Ok(chunk.bytes[offset..offset + len].to_vec())
    }

    /// Every block in address order as `(start, size, free)`.
    pub fn blocks(&self) -> Vec<(u64, usize, bool)> {
        self.state
            .lock()
            .blocks
            .iter()
            .map(|(s, b)| (*s, b.size, b.free))
            .collect()
    }

    pub fn chunk_count(&self) -> usize {
        self.state.lock().chunks.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    fn assert_coalesced(a: &ExecutableAllocator) {
        let blocks = a.blocks();
        for w in blocks.windows(2) {
            let (s0, z0, f0) = w[0];
            let (s1, _, f1) = w[1];
            if s0 + z0 as u64 == s1 {
                assert!(!(f0 && f1), "adjacent free blocks at {:#x} and {:#x}", s0, s1);
            }
        }
    }

    #[test]
    fn test_split_and_merge() {
        let a = ExecutableAllocator::new(HeapPageAllocator::default(), 4096);
        let x = a.allocate(100).unwrap();
        assert_eq!(x.start, EXECUTABLE_BASE);
        assert_eq!(x.size, 112);
        let y = a.allocate(32).unwrap();
        assert_eq!(y.start, x.end());
        let z = a.allocate(32).unwrap();
        a.free(y);
        assert_coalesced(&a);
        a.free(x);
        assert_coalesced(&a);
        let blocks = a.blocks();
        assert_eq!(blocks[0], (EXECUTABLE_BASE, 144, true));
        a.free(z);
        assert_eq!(a.chunk_count(), 0);
    }

    #[test]
    fn test_large_request_gets_own_chunk() {
        let a = ExecutableAllocator::new(HeapPageAllocator::default(), 4096);
        let small = a.allocate(16).unwrap();
        let big = a.allocate(10_000).unwrap();
        assert_eq!(a.chunk_count(), 2);
        assert!(big.start > small.end());
        assert!(big.size >= 10_000);
    }

    #[test]
    fn test_page_exhaustion() {
        let a = ExecutableAllocator::new(HeapPageAllocator::with_limit(4096), 4096);
        a.allocate(4000).unwrap();
        assert_eq!(a.allocate(4000), Err(AllocatorError::OutOfPages { size: 4096 }));
    }

    #[test]
    fn test_read_write() {
        let a = ExecutableAllocator::new(HeapPageAllocator::default(), 4096);
        let x = a.allocate(16).unwrap();
        a.write(x.start + 4, &[1, 2, 3]).unwrap();
        assert_eq!(a.read(x.start + 4, 3).unwrap(), vec![1, 2, 3]);
        assert!(a.write(x.start + 10, &[0; 10]).is_err());
        a.free(x);
        assert!(a.read(x.start, 1).is_err());
    }

    proptest! {
        #[test]
        fn prop_free_list_stays_coalesced(ops in prop::collection::vec((1usize..600, any::<bool>(), any::<prop::sample::Index>()), 1..80)) {
            let a = ExecutableAllocator::new(HeapPageAllocator::default(), 1024);
            let mut live: Vec<Allocation> = Vec::new();
            for (size, alloc, pick) in ops {
                if alloc || live.is_empty() {
                    live.push(a.allocate(size).unwrap());
                } else {
                    let x = live.swap_remove(pick.index(live.len()));
                    a.free(x);
                    assert_coalesced(&a);
                }
            }
            let total: usize = a.blocks().iter().map(|b| b.1).sum();
            let used: usize = live.iter().map(|x| x.size).sum();
            let free: usize = a.blocks().iter().filter(|b| b.2).map(|b| b.1).sum();
            prop_assert_eq!(total, used + free);
        }
    }
}
