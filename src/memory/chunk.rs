//! Chunk layout, size classes and word-level arena access.
//!
//! Every chunk lives at an 8-aligned offset from the arena base:
//!
//! ```text
//!  chunk+0   prev_size   size of the previous chunk, valid only while it is free
//!  chunk+8   head        size | IN_USE | PREV_IN_USE
//!  chunk+16  fd          payload starts here for in-use chunks
//!  chunk+24  bk
//!  chunk+32  child[0]    tree chunks only
//!  chunk+40  child[1]
//!  chunk+48  parent
//!  chunk+56  index
//! ```
//!
//! An in-use chunk's payload runs to the end of the chunk and also covers the
//! next chunk's `prev_size` word, which is only meaningful while this chunk is
//! free. Links between chunks are arena offsets, with [`NIL`] for "none".

use std::ptr::NonNull;

pub(crate) type Offset = usize;

/// Absent link.
pub(crate) const NIL: Offset = usize::MAX;
/// Parent marker of a tree-bin root.
pub(crate) const TREE_ROOT: Offset = usize::MAX - 1;

pub(crate) const WORD: usize = std::mem::size_of::<usize>();

/// Alignment of every payload and chunk boundary.
pub const ALIGNMENT: usize = 8;
pub(crate) const FLAG_MASK: usize = ALIGNMENT - 1;

pub(crate) const PREV_IN_USE: usize = 0b01;
pub(crate) const IN_USE: usize = 0b10;

pub(crate) const CHUNK_OVERHEAD: usize = WORD;
pub(crate) const PAYLOAD_OFFSET: usize = 2 * WORD;

/// Smallest chunk: header plus two free-list links.
pub const MIN_CHUNK_SIZE: usize = 4 * WORD;

pub(crate) const NSMALLBINS: usize = 32;
pub(crate) const NTREEBINS: usize = 32;
pub(crate) const SMALLBIN_SHIFT: u32 = 3;
pub(crate) const TREEBIN_SHIFT: u32 = 8;

/// Chunks of this size and above are kept in tree bins.
pub const MIN_LARGE_SIZE: usize = 1 << TREEBIN_SHIFT;

/// Requests above this are refused without consulting the provider.
pub(crate) const MAX_REQUEST: usize = (isize::MAX as usize) >> 1;

// Field offsets inside a chunk.
const PREV_SIZE_AT: usize = 0;
const HEAD_AT: usize = WORD;
const FD_AT: usize = 2 * WORD;
const BK_AT: usize = 3 * WORD;
const CHILD_AT: usize = 4 * WORD;
const PARENT_AT: usize = 6 * WORD;
const INDEX_AT: usize = 7 * WORD;

/// Chunk size for a request of `req` bytes. `req` must not exceed `MAX_REQUEST`.
#[inline]
pub(crate) const fn pad_request(req: usize) -> usize {
    let padded = (req + CHUNK_OVERHEAD + FLAG_MASK) & !FLAG_MASK;
    if padded < MIN_CHUNK_SIZE { MIN_CHUNK_SIZE } else { padded }
}

#[inline]
pub(crate) const fn is_small(size: usize) -> bool {
    (size >> SMALLBIN_SHIFT) < NSMALLBINS
}

#[inline]
pub(crate) const fn small_index(size: usize) -> usize {
    size >> SMALLBIN_SHIFT
}

#[inline]
pub(crate) const fn small_index_to_size(idx: usize) -> usize {
    idx << SMALLBIN_SHIFT
}

/// Tree bin of a chunk of `size` bytes. Bins split each power of two in half.
#[inline]
pub(crate) const fn tree_index(size: usize) -> usize {
    let x = size >> TREEBIN_SHIFT;
    if x == 0 {
        0
    } else if x > 0xFFFF {
        NTREEBINS - 1
    } else {
        let k = (usize::BITS - 1 - x.leading_zeros()) as usize;
        (k << 1) + ((size >> (k + TREEBIN_SHIFT as usize - 1)) & 1)
    }
}

/// Shift that brings the first size bit below a bin's range to the top word bit.
#[inline]
pub(crate) const fn leftshift_for_tree_index(idx: usize) -> u32 {
    if idx == NTREEBINS - 1 {
        0
    } else {
        usize::BITS - 1 - ((idx as u32 >> 1) + TREEBIN_SHIFT - 2)
    }
}

/// Smallest chunk size that lands in tree bin `idx`.
#[inline]
pub(crate) const fn minsize_for_tree_index(idx: usize) -> usize {
    (1 << ((idx >> 1) + TREEBIN_SHIFT as usize))
        | ((idx & 1) << ((idx >> 1) + TREEBIN_SHIFT as usize - 1))
}

#[inline]
pub(crate) const fn least_bit(x: u32) -> u32 {
    x & x.wrapping_neg()
}

/// Mask of all bits strictly above the lowest set bit of `x`.
#[inline]
pub(crate) const fn left_bits(x: u32) -> u32 {
    (x << 1) | (x << 1).wrapping_neg()
}

#[inline]
pub(crate) const fn bit_index(bit: u32) -> usize {
    bit.trailing_zeros() as usize
}

/// Word-level view of the arena.
///
/// Holds the base pointer and current length; copied freely. Every offset
/// passed in must lie inside the arena. The heap only follows links it has
/// validated with [`contains_chunk`](Self::contains_chunk).
#[derive(Clone, Copy, Debug)]
pub(crate) struct Arena {
    base: NonNull<u8>,
    len: usize,
}

impl Arena {
    pub(crate) const fn empty() -> Self {
        Self {
            base: NonNull::dangling(),
            len: 0,
        }
    }

    pub(crate) const fn new(base: NonNull<u8>, len: usize) -> Self {
        Self { base, len }
    }

    #[inline]
    pub(crate) fn base(self) -> NonNull<u8> {
        self.base
    }

    #[inline]
    pub(crate) fn base_addr(self) -> usize {
        self.base.as_ptr() as usize
    }

    #[inline]
    pub(crate) fn len(self) -> usize {
        self.len
    }

    #[inline]
    pub(crate) fn is_empty(self) -> bool {
        self.len == 0
    }

    /// True if `c` could be the offset of a chunk header in this arena.
    #[inline]
    pub(crate) fn contains_chunk(self, c: Offset) -> bool {
        c.is_multiple_of(ALIGNMENT) && c < self.len && self.len - c >= MIN_CHUNK_SIZE
    }

    #[inline]
    fn read(self, at: usize) -> usize {
        debug_assert!(
            at.is_multiple_of(WORD) && at + WORD <= self.len,
            "arena read at {at:#x} outside {:#x}",
            self.len
        );
        // Safety: `at` is word-aligned and inside the committed arena.
        unsafe { self.base.as_ptr().add(at).cast::<usize>().read() }
    }

    #[inline]
    fn write(self, at: usize, val: usize) {
        debug_assert!(
            at.is_multiple_of(WORD) && at + WORD <= self.len,
            "arena write at {at:#x} outside {:#x}",
            self.len
        );
        // Safety: `at` is word-aligned and inside the committed arena.
        unsafe { self.base.as_ptr().add(at).cast::<usize>().write(val) }
    }

    #[inline]
    pub(crate) fn ptr_at(self, at: usize) -> NonNull<u8> {
        // Safety: offsets handed out are inside the arena, so the result is
        // derived from a non-null base without wrapping.
        unsafe { NonNull::new_unchecked(self.base.as_ptr().add(at)) }
    }

    // ---- header ---------------------------------------------------------

    #[inline]
    pub(crate) fn head(self, c: Offset) -> usize {
        self.read(c + HEAD_AT)
    }

    #[inline]
    pub(crate) fn set_head(self, c: Offset, head: usize) {
        self.write(c + HEAD_AT, head);
    }

    #[inline]
    pub(crate) fn prev_size(self, c: Offset) -> usize {
        self.read(c + PREV_SIZE_AT)
    }

    #[inline]
    pub(crate) fn size(self, c: Offset) -> usize {
        self.head(c) & !FLAG_MASK
    }

    #[inline]
    pub(crate) fn in_use(self, c: Offset) -> bool {
        self.head(c) & IN_USE != 0
    }

    #[inline]
    pub(crate) fn prev_in_use(self, c: Offset) -> bool {
        self.head(c) & PREV_IN_USE != 0
    }

    /// Marks `c` free with `size`, previous chunk in use, and writes the footer.
    #[inline]
    pub(crate) fn set_free(self, c: Offset, size: usize) {
        self.set_head(c, size | PREV_IN_USE);
        self.write(c + size + PREV_SIZE_AT, size);
    }

    #[inline]
    pub(crate) fn clear_prev_in_use(self, c: Offset) {
        self.set_head(c, self.head(c) & !PREV_IN_USE);
    }

    #[inline]
    pub(crate) fn set_prev_in_use(self, c: Offset) {
        self.set_head(c, self.head(c) | PREV_IN_USE);
    }

    /// Marks `c` in use with `size`, keeping its own `PREV_IN_USE` bit, and
    /// tells the following chunk.
    #[inline]
    pub(crate) fn set_in_use(self, c: Offset, size: usize) {
        self.set_head(c, (self.head(c) & PREV_IN_USE) | size | IN_USE);
        self.set_prev_in_use(c + size);
    }

    /// Marks `c` in use with `size` and the previous chunk in use, and tells
    /// the following chunk.
    #[inline]
    pub(crate) fn set_in_use_and_prev_in_use(self, c: Offset, size: usize) {
        self.set_head(c, size | PREV_IN_USE | IN_USE);
        self.set_prev_in_use(c + size);
    }

    /// Header-only variant of [`set_in_use_and_prev_in_use`](Self::set_in_use_and_prev_in_use)
    /// for splits, where the following chunk is rewritten by the caller.
    #[inline]
    pub(crate) fn set_in_use_head(self, c: Offset, size: usize) {
        self.set_head(c, size | PREV_IN_USE | IN_USE);
    }

    // ---- links ----------------------------------------------------------

    #[inline]
    pub(crate) fn fd(self, c: Offset) -> Offset {
        self.read(c + FD_AT)
    }

    #[inline]
    pub(crate) fn set_fd(self, c: Offset, v: Offset) {
        self.write(c + FD_AT, v);
    }

    #[inline]
    pub(crate) fn bk(self, c: Offset) -> Offset {
        self.read(c + BK_AT)
    }

    #[inline]
    pub(crate) fn set_bk(self, c: Offset, v: Offset) {
        self.write(c + BK_AT, v);
    }

    #[inline]
    pub(crate) fn child(self, c: Offset, dir: usize) -> Offset {
        debug_assert!(dir < 2);
        self.read(c + CHILD_AT + dir * WORD)
    }

    #[inline]
    pub(crate) fn set_child(self, c: Offset, dir: usize, v: Offset) {
        debug_assert!(dir < 2);
        self.write(c + CHILD_AT + dir * WORD, v);
    }

    #[inline]
    pub(crate) fn parent(self, c: Offset) -> Offset {
        self.read(c + PARENT_AT)
    }

    #[inline]
    pub(crate) fn set_parent(self, c: Offset, v: Offset) {
        self.write(c + PARENT_AT, v);
    }

    #[inline]
    pub(crate) fn bin_index(self, c: Offset) -> usize {
        self.read(c + INDEX_AT)
    }

    #[inline]
    pub(crate) fn set_bin_index(self, c: Offset, idx: usize) {
        self.write(c + INDEX_AT, idx);
    }
}


#[cfg(all(test, not(loom)))]
mod tests {
    use super::test_support::Scratch;
    use super::*;

    #[test]
    fn test_pad_request() {
        assert_eq!(pad_request(0), MIN_CHUNK_SIZE);
        assert_eq!(pad_request(1), MIN_CHUNK_SIZE);
        assert_eq!(pad_request(24), 32);
        assert_eq!(pad_request(25), 40);
        assert_eq!(pad_request(40), 48);
        assert_eq!(pad_request(50), 64);
        assert_eq!(pad_request(100), 112);
        assert_eq!(pad_request(200), 208);
        assert_eq!(pad_request(1000), 1008);
    }

    #[test]
    fn test_small_classes() {
        assert!(is_small(MIN_CHUNK_SIZE));
        assert!(is_small(248));
        assert!(!is_small(256));
        assert_eq!(small_index(32), 4);
        assert_eq!(small_index(248), 31);
        assert_eq!(small_index_to_size(small_index(120)), 120);
    }

    #[test]
    fn test_tree_index_boundaries() {
        assert_eq!(tree_index(256), 0);
        assert_eq!(tree_index(383), 0);
        assert_eq!(tree_index(384), 1);
        assert_eq!(tree_index(512), 2);
        assert_eq!(tree_index(768), 3);
        assert_eq!(tree_index(1024), 4);
        assert_eq!(tree_index(usize::MAX & !FLAG_MASK), NTREEBINS - 1);

        // Every bin's minimum size maps back to that bin, and the byte
        // before it to the previous one.
        for idx in 0..NTREEBINS {
            let min = minsize_for_tree_index(idx);
            assert_eq!(tree_index(min), idx, "bin {idx}");
            if idx > 0 {
                assert_eq!(tree_index(min - ALIGNMENT), idx - 1, "bin {idx}");
            }
        }
    }

    #[test]
    fn test_leftshift_exposes_first_varying_bit() {
        // Bin 2 holds 512..768: bits 9 and 8 are fixed, bit 7 is the first
        // one that varies and must land on the top of the word.
        let shift = leftshift_for_tree_index(2);
        assert_eq!((0x200usize | 0x80) << shift >> (usize::BITS - 1), 1);
        assert_eq!(0x200usize << shift >> (usize::BITS - 1), 0);
        assert_eq!(leftshift_for_tree_index(NTREEBINS - 1), 0);
    }

    #[test]
    fn test_bitmap_helpers() {
        assert_eq!(least_bit(0b1011_0000), 0b1_0000);
        assert_eq!(bit_index(least_bit(0b1011_0000)), 4);
        assert_eq!(left_bits(1 << 4) & 0xFF, 0b1110_0000);
        assert_eq!(left_bits(1 << 31), 0);
    }

    #[test]
    fn test_header_updates() {
        let mut scratch = Scratch::new(256);
        let a = scratch.arena();

        a.set_in_use_and_prev_in_use(0, 64);
        a.set_free(64, 96);
        assert!(a.in_use(0));
        assert!(a.prev_in_use(0));
        assert_eq!(a.size(0), 64);
        assert!(!a.in_use(64));
        assert!(a.prev_in_use(64));
        assert_eq!(a.prev_size(160), 96);

        a.clear_prev_in_use(160);
        assert!(!a.prev_in_use(160));
        a.set_in_use(64, 96);
        assert!(a.in_use(64));
        assert!(a.prev_in_use(64));
        assert!(a.prev_in_use(160));
    }

    #[test]
    fn test_contains_chunk() {
        let mut scratch = Scratch::new(128);
        let a = scratch.arena();
        assert!(a.contains_chunk(0));
        assert!(a.contains_chunk(96));
        assert!(!a.contains_chunk(104));
        assert!(!a.contains_chunk(12));
        assert!(!a.contains_chunk(NIL));
        assert!(!Arena::empty().contains_chunk(0));
    }
}
