use super::chunk::{
    Arena, MIN_CHUNK_SIZE, NIL, NSMALLBINS, Offset, small_index, small_index_to_size,
};
use super::error::HeapError;

/// Exact-size free lists for chunks below `MIN_LARGE_SIZE`.
///
/// Bin `i` holds chunks of exactly `i * 8` bytes as a doubly linked list
/// threaded through `fd`/`bk`; the head's `bk` and the tail's `fd` are `NIL`.
/// Bit `i` of `map` is set iff bin `i` is non-empty.
pub(crate) struct SmallBins {
    heads: [Offset; NSMALLBINS],
    map: u32,
}

impl SmallBins {
    pub(crate) const fn new() -> Self {
        Self {
            heads: [NIL; NSMALLBINS],
            map: 0,
        }
    }

    #[inline]
    pub(crate) fn map(&self) -> u32 {
        self.map
    }

    #[inline]
    pub(crate) fn is_marked(&self, idx: usize) -> bool {
        self.map & (1 << idx) != 0
    }

    /// Pushes free chunk `c` of `size` bytes on the front of its bin.
    pub(crate) fn push(&mut self, a: Arena, c: Offset, size: usize) {
        let idx = small_index(size);
        let head = self.heads[idx];
        a.set_fd(c, head);
        a.set_bk(c, NIL);
        if head != NIL {
            a.set_bk(head, c);
        }
        self.heads[idx] = c;
        self.map |= 1 << idx;
    }

    /// Removes `c` of `size` bytes from its bin after checking both neighbours
    /// point back at it.
    pub(crate) fn unlink(&mut self, a: Arena, c: Offset, size: usize) -> Result<(), HeapError> {
        let idx = small_index(size);
        let f = a.fd(c);
        let b = a.bk(c);

        if f != NIL && (!a.contains_chunk(f) || a.bk(f) != c) {
            return Err(HeapError::corruption(c, "small bin fd.bk does not point back"));
        }
        if b == NIL {
            if self.heads[idx] != c {
                return Err(HeapError::corruption(c, "small bin head mismatch"));
            }
            self.heads[idx] = f;
        } else {
            if !a.contains_chunk(b) || a.fd(b) != c {
                return Err(HeapError::corruption(c, "small bin bk.fd does not point back"));
            }
            a.set_fd(b, f);
        }
        if f != NIL {
            a.set_bk(f, b);
        }
        if self.heads[idx] == NIL {
            self.map &= !(1 << idx);
        }
        Ok(())
    }

    /// Takes the most recently freed chunk of bin `idx`, which must be non-empty.
    pub(crate) fn pop(&mut self, a: Arena, idx: usize) -> Result<Offset, HeapError> {
        let c = self.heads[idx];
        if !a.contains_chunk(c) {
            return Err(HeapError::corruption(
                c,
                "small bin head lies outside the arena",
            ));
        }
        let size = small_index_to_size(idx);
        if a.size(c) != size || a.in_use(c) {
            return Err(HeapError::corruption(c, "small bin chunk has a bad header"));
        }
        self.unlink(a, c, size)?;
        Ok(c)
    }

    /// Walks every list checking links, sizes and free bits.
    /// Returns the number of chunks held and their total size.
    pub(crate) fn verify(&self, a: Arena) -> Result<(usize, usize), HeapError> {
        let mut budget = a.len() / MIN_CHUNK_SIZE + 1;
        let mut count = 0;
        let mut bytes = 0;
        for idx in 0..NSMALLBINS {
            let head = self.heads[idx];
            if (head != NIL) != self.is_marked(idx) {
                return Err(HeapError::corruption(head, "small map disagrees with bin"));
            }
            let size = small_index_to_size(idx);
            let mut prev = NIL;
            let mut c = head;
            while c != NIL {
                budget = budget
                    .checked_sub(1)
                    .ok_or(HeapError::corruption(c, "small bin contains a cycle"))?;
                if !a.contains_chunk(c) {
                    return Err(HeapError::corruption(c, "small bin link lies outside the arena"));
                }
                if a.bk(c) != prev {
                    return Err(HeapError::corruption(c, "small bin bk does not point back"));
                }
                if a.size(c) != size || a.in_use(c) {
                    return Err(HeapError::corruption(c, "small bin chunk has a bad header"));
                }
                count += 1;
                bytes += size;
                prev = c;
                c = a.fd(c);
            }
        }
        Ok((count, bytes))
    }
}
