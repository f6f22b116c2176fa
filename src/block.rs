//! Payload memory blocks and the allocators handing them out
//!
//! A [`Block`] owns one buffer and, optionally, the rest of a chain of blocks
//! through `next`. Blocks are moved, never shared: whoever holds the head of a
//! chain owns the whole chain, and dropping the head returns every buffer of
//! the chain to the allocator it came from.
//!
//! Two strategies are provided. [`HeapAllocator`] allocates on the global
//! heap, optionally bounded by a byte budget. [`PoolAllocator`] hands out
//! fixed-size buffers from a preallocated pool.

use alloc::{boxed::Box, sync::Arc, vec::Vec};
use core::{
    fmt, mem,
    ops::{BitOr, BitOrAssign},
    sync::atomic::{AtomicUsize, Ordering},
};

#[cfg(feature = "defmt")]
use defmt::Format;

use crate::{packet::HEADER_LEN, Error};

/// Block attribute flags
#[derive(Copy, Clone, Debug, Default, Eq, PartialEq)]
#[cfg_attr(feature = "defmt", derive(Format))]
pub struct BlockFlags(u8);

impl BlockFlags {
    /// No flag set
    pub const NONE: BlockFlags = BlockFlags(0);
    /// The buffer is not owned by an allocator
    pub const STATIC: BlockFlags = BlockFlags(1 << 0);
    /// The holder may release the buffer early
    pub const DESTRUCTIBLE: BlockFlags = BlockFlags(1 << 1);
    /// Room for a packet header is reserved in front of the data
    pub const HEADER_RESERVED: BlockFlags = BlockFlags(1 << 2);
    /// The block carries a ranging report and counts against its quota
    pub const REPORT_QUOTA: BlockFlags = BlockFlags(1 << 3);

    /// Returns `true` if every flag of `other` is set
    pub fn contains(self, other: BlockFlags) -> bool {
        self.0 & other.0 == other.0
    }

    /// Raw flag bits
    pub fn bits(self) -> u8 {
        self.0
    }
}

impl BitOr for BlockFlags {
    type Output = BlockFlags;

    fn bitor(self, rhs: BlockFlags) -> BlockFlags {
        BlockFlags(self.0 | rhs.0)
    }
}

impl BitOrAssign for BlockFlags {
    fn bitor_assign(&mut self, rhs: BlockFlags) {
        self.0 |= rhs.0;
    }
}

/// Gives a buffer back to the allocator that produced it
trait Release: Send + Sync {
    fn release(&self, buf: Box<[u8]>);
}

/// A buffer unit, possibly the head of a chain
pub struct Block {
    next: Option<Box<Block>>,
    buf: Box<[u8]>,
    start: usize,
    len: usize,
    total_len: usize,
    flags: BlockFlags,
    home: Option<Arc<dyn Release>>,
}

impl Block {
    fn with_home(buf: Box<[u8]>, flags: BlockFlags, home: Option<Arc<dyn Release>>) -> Self {
        let start = if flags.contains(BlockFlags::HEADER_RESERVED) {
            HEADER_LEN.min(buf.len())
        } else {
            0
        };
        Block {
            next: None,
            buf,
            start,
            len: 0,
            total_len: 0,
            flags,
            home,
        }
    }

    /// Wraps a buffer that is not owned by any allocator
    pub fn new(buf: Box<[u8]>, flags: BlockFlags) -> Self {
        Block::with_home(buf, flags | BlockFlags::STATIC, None)
    }

    /// Creates an unmanaged block holding a copy of `bytes`
    pub fn from_slice(bytes: &[u8]) -> Self {
        let mut block = Block::new(bytes.into(), BlockFlags::NONE);
        block.len = bytes.len();
        block.total_len = bytes.len();
        block
    }

    /// Valid data of this block only
    pub fn data(&self) -> &[u8] {
        &self.buf[self.start..self.start + self.len]
    }

    /// Mutable valid data of this block only
    pub fn data_mut(&mut self) -> &mut [u8] {
        &mut self.buf[self.start..self.start + self.len]
    }

    /// Length of the valid data of this block only
    pub fn len(&self) -> usize {
        self.len
    }

    /// `true` if this block holds no data
    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Allocation size of the buffer
    pub fn size(&self) -> usize {
        self.buf.len()
    }

    /// Free bytes in front of the data
    pub fn headroom(&self) -> usize {
        self.start
    }

    /// Free bytes after the data
    pub fn tailroom(&self) -> usize {
        self.buf.len() - self.start - self.len
    }

    /// Block flags
    pub fn flags(&self) -> BlockFlags {
        self.flags
    }

    /// Total length of the chain, only meaningful on the head block
    pub fn total_len(&self) -> usize {
        self.total_len
    }

    /// Appends `bytes` after the data
    pub fn put(&mut self, bytes: &[u8]) -> Result<(), Error> {
        if bytes.len() > self.tailroom() {
            return Err(Error::NoMemory);
        }
        let end = self.start + self.len;
        self.buf[end..end + bytes.len()].copy_from_slice(bytes);
        self.len += bytes.len();
        Ok(())
    }

    /// Grows the data by `n` zeroed bytes at the back and returns them
    pub fn push_back(&mut self, n: usize) -> Option<&mut [u8]> {
        if n > self.tailroom() {
            return None;
        }
        let end = self.start + self.len;
        self.len += n;
        let room = &mut self.buf[end..end + n];
        room.fill(0);
        Some(room)
    }

    /// Grows the data by `n` bytes at the front and returns the new bytes
    pub fn push_front(&mut self, n: usize) -> Option<&mut [u8]> {
        if n > self.start {
            return None;
        }
        self.start -= n;
        self.len += n;
        Some(&mut self.buf[self.start..self.start + n])
    }

    /// Drops `n` bytes from the front of the data
    pub fn pull_front(&mut self, n: usize) -> Result<(), Error> {
        if n > self.len {
            return Err(Error::InvalidArgument);
        }
        self.start += n;
        self.len -= n;
        Ok(())
    }

    /// Shortens the data to `len` bytes
    pub fn truncate(&mut self, len: usize) {
        self.len = self.len.min(len);
    }

    /// Next block of the chain
    pub fn next(&self) -> Option<&Block> {
        self.next.as_deref()
    }

    /// Detaches and returns the rest of the chain
    pub fn take_next(&mut self) -> Option<Block> {
        self.next.take().map(|next| *next)
    }

    /// Links `block` (and its own chain) at the end of this chain
    pub fn append(&mut self, block: Block) {
        let mut slot = &mut self.next;
        while let Some(node) = slot {
            slot = &mut node.next;
        }
        *slot = Some(Box::new(block));
    }

    /// Iterates over the blocks of the chain, starting with this one
    pub fn iter(&self) -> Chain<'_> {
        Chain { cur: Some(self) }
    }

    /// Sum of the data lengths of the whole chain
    pub fn chain_len(&self) -> usize {
        self.iter().map(Block::len).sum()
    }

    /// Number of blocks in the chain
    pub fn chain_count(&self) -> usize {
        self.iter().count()
    }

    /// Records the chain length on the head block and clears it on the others
    pub fn update_total_len(&mut self) {
        self.total_len = self.chain_len();
        let mut cur = self.next.as_deref_mut();
        while let Some(block) = cur {
            block.total_len = 0;
            cur = block.next.as_deref_mut();
        }
    }

    /// Copies the data of the whole chain
    pub fn to_vec(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(self.chain_len());
        for block in self.iter() {
            out.extend_from_slice(block.data());
        }
        out
    }
}

impl Drop for Block {
    fn drop(&mut self) {
        // Unlink iteratively, long chains must not recurse.
        let mut next = self.next.take();
        while let Some(mut block) = next {
            next = block.next.take();
        }
        if let Some(home) = self.home.take() {
            home.release(mem::take(&mut self.buf));
        }
    }
}

impl fmt::Debug for Block {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(
            f,
            "Block {{ len: {}, size: {}, total_len: {}, chained: {} }}",
            self.len,
            self.buf.len(),
            self.total_len,
            self.next.is_some(),
        )
    }
}

/// Iterator over the blocks of a chain
pub struct Chain<'a> {
    cur: Option<&'a Block>,
}

impl<'a> Iterator for Chain<'a> {
    type Item = &'a Block;

    fn next(&mut self) -> Option<Self::Item> {
        let block = self.cur?;
        self.cur = block.next.as_deref();
        Some(block)
    }
}

/// Source of payload blocks
///
/// The returned block may be larger than `size_hint`. When `flags` contains
/// [`BlockFlags::HEADER_RESERVED`], the block additionally has room for a
/// packet header in front of `size_hint` bytes of data.
pub trait Allocator: Send + Sync {
    /// Allocates a block, or `None` on exhaustion
    fn alloc(&self, size_hint: usize, flags: BlockFlags) -> Option<Block>;

    /// Releases a block and the rest of its chain
    fn free(&self, block: Block) {
        drop(block);
    }
}

impl<A: Allocator + ?Sized> Allocator for Arc<A> {
    fn alloc(&self, size_hint: usize, flags: BlockFlags) -> Option<Block> {
        (**self).alloc(size_hint, flags)
    }

    fn free(&self, block: Block) {
        (**self).free(block)
    }
}

/// Frees a chain that may be absent
pub fn free_chain(allocator: &dyn Allocator, chain: Option<Block>) {
    if let Some(block) = chain {
        allocator.free(block);
    }
}

fn reserved(flags: BlockFlags) -> usize {
    if flags.contains(BlockFlags::HEADER_RESERVED) {
        HEADER_LEN
    } else {
        0
    }
}

struct HeapBudget {
    in_use: AtomicUsize,
}

impl Release for HeapBudget {
    fn release(&self, buf: Box<[u8]>) {
        self.in_use.fetch_sub(buf.len(), Ordering::AcqRel);
    }
}

/// Allocates blocks on the global heap
pub struct HeapAllocator {
    limit: Option<usize>,
    budget: Arc<HeapBudget>,
}

impl HeapAllocator {
    /// Unbounded heap allocator
    pub fn new() -> Self {
        HeapAllocator {
            limit: None,
            budget: Arc::new(HeapBudget {
                in_use: AtomicUsize::new(0),
            }),
        }
    }

    /// Heap allocator that refuses to hold more than `limit` bytes at once
    pub fn with_limit(limit: usize) -> Self {
        HeapAllocator {
            limit: Some(limit),
            ..HeapAllocator::new()
        }
    }

    /// Bytes currently allocated and not yet released
    pub fn in_use(&self) -> usize {
        self.budget.in_use.load(Ordering::Acquire)
    }
}

impl Default for HeapAllocator {
    fn default() -> Self {
        HeapAllocator::new()
    }
}

impl Allocator for HeapAllocator {
    fn alloc(&self, size_hint: usize, flags: BlockFlags) -> Option<Block> {
        let size = size_hint + reserved(flags);

        let claimed = self
            .budget
            .in_use
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |in_use| {
                let next = in_use.checked_add(size)?;
                match self.limit {
                    Some(limit) if next > limit => None,
                    _ => Some(next),
                }
            });
        if claimed.is_err() {
            debug!("heap budget exhausted, {} bytes requested", size);
            return None;
        }

        let mut buf = Vec::new();
        if buf.try_reserve_exact(size).is_err() {
            self.budget.in_use.fetch_sub(size, Ordering::AcqRel);
            warn!("heap allocation of {} bytes failed", size);
            return None;
        }
        buf.resize(size, 0);

        let home: Arc<dyn Release> = self.budget.clone();
        Some(Block::with_home(buf.into_boxed_slice(), flags, Some(home)))
    }
}

struct PoolFree {
    free: spin::Mutex<Vec<Box<[u8]>>>,
}

impl Release for PoolFree {
    fn release(&self, buf: Box<[u8]>) {
        self.free.lock().push(buf);
    }
}

/// Hands out fixed-size blocks from a preallocated pool
pub struct PoolAllocator {
    block_size: usize,
    count: usize,
    pool: Arc<PoolFree>,
}

impl PoolAllocator {
    /// Preallocates `count` buffers of `block_size` bytes each
    pub fn new(block_size: usize, count: usize) -> Self {
        let free = (0..count)
            .map(|_| alloc::vec![0u8; block_size].into_boxed_slice())
            .collect();
        PoolAllocator {
            block_size,
            count,
            pool: Arc::new(PoolFree {
                free: spin::Mutex::new(free),
            }),
        }
    }

    /// Size of every block of the pool
    pub fn block_size(&self) -> usize {
        self.block_size
    }

    /// Blocks ready to be handed out
    pub fn available(&self) -> usize {
        self.pool.free.lock().len()
    }

    /// Blocks currently handed out
    pub fn in_use(&self) -> usize {
        self.count - self.available()
    }
}

impl Allocator for PoolAllocator {
    fn alloc(&self, size_hint: usize, flags: BlockFlags) -> Option<Block> {
        if size_hint + reserved(flags) > self.block_size {
            debug!(
                "pool block of {} bytes too small for {} bytes",
                self.block_size,
                size_hint
            );
            return None;
        }
        let buf = self.pool.free.lock().pop()?;
        let home: Arc<dyn Release> = self.pool.clone();
        Some(Block::with_home(buf, flags, Some(home)))
    }
}

#[cfg(test)]
mod test {
    use super::*;

    fn filled(allocator: &dyn Allocator, bytes: &[u8]) -> Block {
        let mut block = allocator.alloc(bytes.len(), BlockFlags::NONE).unwrap();
        block.put(bytes).unwrap();
        block
    }

    #[test]
    fn header_reserved_block_has_headroom() {
        let heap = HeapAllocator::new();
        let mut block = heap.alloc(10, BlockFlags::HEADER_RESERVED).unwrap();
        assert_eq!(block.headroom(), HEADER_LEN);
        assert_eq!(block.tailroom(), 10);

        block.put(&[1, 2, 3]).unwrap();
        block.push_front(HEADER_LEN).unwrap().copy_from_slice(&[9; 4]);
        assert_eq!(block.data(), &[9, 9, 9, 9, 1, 2, 3]);
        assert!(block.push_front(1).is_none());

        block.pull_front(HEADER_LEN).unwrap();
        assert_eq!(block.data(), &[1, 2, 3]);
        assert!(matches!(block.put(&[0; 8]), Err(Error::NoMemory)));

        block.push_back(2).unwrap().copy_from_slice(&[4, 5]);
        assert_eq!(block.data(), &[1, 2, 3, 4, 5]);
        assert_eq!(block.push_back(5).map(|b| b.len()), Some(5));
        assert!(block.push_back(1).is_none());
    }

    #[test]
    fn chain_total_len_only_on_head() {
        let heap = HeapAllocator::new();
        let mut head = filled(&heap, &[1, 2]);
        head.append(filled(&heap, &[3, 4, 5]));
        head.append(filled(&heap, &[6]));
        head.update_total_len();

        assert_eq!(head.chain_count(), 3);
        assert_eq!(head.total_len(), 6);
        assert!(head.iter().skip(1).all(|b| b.total_len() == 0));
        assert_eq!(head.to_vec(), [1, 2, 3, 4, 5, 6]);
    }

    #[test]
    fn heap_budget_released_on_drop() {
        let heap = HeapAllocator::with_limit(64);
        let mut head = heap.alloc(32, BlockFlags::NONE).unwrap();
        head.append(heap.alloc(32, BlockFlags::NONE).unwrap());
        assert_eq!(heap.in_use(), 64);
        assert!(heap.alloc(1, BlockFlags::NONE).is_none());

        heap.free(head);
        assert_eq!(heap.in_use(), 0);
        assert!(heap.alloc(1, BlockFlags::NONE).is_some());
    }

    #[test]
    fn pool_exhaustion_and_return() {
        let pool = PoolAllocator::new(16, 2);
        assert!(pool.alloc(17, BlockFlags::NONE).is_none());
        assert!(pool.alloc(13, BlockFlags::HEADER_RESERVED).is_none());

        let a = pool.alloc(8, BlockFlags::NONE).unwrap();
        let b = pool.alloc(8, BlockFlags::NONE).unwrap();
        assert_eq!(a.size(), 16);
        assert!(pool.alloc(8, BlockFlags::NONE).is_none());
        assert_eq!(pool.in_use(), 2);

        let mut chain = a;
        chain.append(b);
        drop(chain);
        assert_eq!(pool.available(), 2);
    }

    #[test]
    fn long_chain_drop_does_not_recurse() {
        let mut head = Block::from_slice(&[0]);
        for _ in 0..100_000 {
            let mut block = Block::from_slice(&[1]);
            block.next = head.next.take();
            head.next = Some(Box::new(block));
        }
        drop(head);
    }

    #[test]
    fn take_next_splits_chain() {
        let mut head = Block::from_slice(&[1]);
        head.append(Block::from_slice(&[2]));
        let tail = head.take_next().unwrap();
        assert_eq!(head.chain_count(), 1);
        assert_eq!(tail.data(), &[2]);
        assert!(head.flags().contains(BlockFlags::STATIC));
    }
}
