//! Best-fit bins for chunks of `MIN_LARGE_SIZE` bytes and above.
//!
//! Each of the 32 bins covers half a power of two and is a bitwise trie keyed
//! on the chunk size: at depth `d` a node's children split on the `d`-th size
//! bit below the bin's fixed prefix. Chunks of a size already present hang off
//! the tree node in a circular `fd`/`bk` ring and carry a `NIL` parent; tree
//! nodes carry their parent's offset, or `TREE_ROOT` for a bin root.

use super::chunk::{
    Arena, MIN_CHUNK_SIZE, NIL, NTREEBINS, Offset, TREE_ROOT, bit_index, least_bit, left_bits,
    leftshift_for_tree_index, minsize_for_tree_index, tree_index,
};
use super::error::HeapError;

pub(crate) struct TreeBins {
    roots: [Offset; NTREEBINS],
    map: u32,
}

#[inline]
fn leftmost_child(a: Arena, t: Offset) -> Offset {
    let c = a.child(t, 0);
    if c != NIL { c } else { a.child(t, 1) }
}

#[inline]
fn checked(a: Arena, t: Offset, detail: &'static str) -> Result<Offset, HeapError> {
    if a.contains_chunk(t) {
        Ok(t)
    } else {
        Err(HeapError::corruption(t, detail))
    }
}

impl TreeBins {
    pub(crate) const fn new() -> Self {
        Self {
            roots: [NIL; NTREEBINS],
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

    /// Adds free chunk `x` of `size` bytes to its bin.
    pub(crate) fn insert(&mut self, a: Arena, x: Offset, size: usize) -> Result<(), HeapError> {
        let idx = tree_index(size);
        a.set_bin_index(x, idx);
        a.set_child(x, 0, NIL);
        a.set_child(x, 1, NIL);

        if !self.is_marked(idx) {
            self.map |= 1 << idx;
            self.roots[idx] = x;
            a.set_parent(x, TREE_ROOT);
            a.set_fd(x, x);
            a.set_bk(x, x);
            return Ok(());
        }

        let mut t = checked(a, self.roots[idx], "tree root lies outside the arena")?;
        let mut key = size << leftshift_for_tree_index(idx);
        loop {
            if a.size(t) != size {
                let dir = key >> (usize::BITS - 1);
                key <<= 1;
                let c = a.child(t, dir);
                if c == NIL {
                    a.set_child(t, dir, x);
                    a.set_parent(x, t);
                    a.set_fd(x, x);
                    a.set_bk(x, x);
                    return Ok(());
                }
                t = checked(a, c, "tree child lies outside the arena")?;
            } else {
                let f = checked(a, a.fd(t), "tree sibling lies outside the arena")?;
                a.set_bk(f, x);
                a.set_fd(t, x);
                a.set_fd(x, f);
                a.set_bk(x, t);
                a.set_parent(x, NIL);
                return Ok(());
            }
        }
    }

    /// Removes `x` from its bin, promoting a sibling or the rightmost leaf of
    /// its subtree into its place.
    pub(crate) fn unlink(&mut self, a: Arena, x: Offset) -> Result<(), HeapError> {
        let xp = a.parent(x);
        let mut r;

        if a.bk(x) != x {
            let f = a.fd(x);
            r = a.bk(x);
            if !a.contains_chunk(f) || !a.contains_chunk(r) || a.bk(f) != x || a.fd(r) != x {
                return Err(HeapError::corruption(x, "tree sibling ring is broken"));
            }
            a.set_bk(f, r);
            a.set_fd(r, f);
        } else {
            r = NIL;
            let mut slot = None;
            if a.child(x, 1) != NIL {
                r = a.child(x, 1);
                slot = Some((x, 1));
            } else if a.child(x, 0) != NIL {
                r = a.child(x, 0);
                slot = Some((x, 0));
            }
            if let Some(mut rp) = slot {
                loop {
                    checked(a, r, "tree child lies outside the arena")?;
                    if a.child(r, 1) != NIL {
                        rp = (r, 1);
                        r = a.child(r, 1);
                    } else if a.child(r, 0) != NIL {
                        rp = (r, 0);
                        r = a.child(r, 0);
                    } else {
                        break;
                    }
                }
                a.set_child(rp.0, rp.1, NIL);
            }
        }

        if xp == NIL {
            // x was a sibling; the tree itself is untouched.
            return Ok(());
        }

        let idx = a.bin_index(x);
        if idx >= NTREEBINS {
            return Err(HeapError::corruption(x, "tree chunk has a bad bin index"));
        }
        if xp == TREE_ROOT {
            if self.roots[idx] != x {
                return Err(HeapError::corruption(x, "tree root mismatch"));
            }
            self.roots[idx] = r;
            if r == NIL {
                self.map &= !(1 << idx);
            }
        } else {
            checked(a, xp, "tree parent lies outside the arena")?;
            if a.child(xp, 0) == x {
                a.set_child(xp, 0, r);
            } else if a.child(xp, 1) == x {
                a.set_child(xp, 1, r);
            } else {
                return Err(HeapError::corruption(x, "tree parent does not link to chunk"));
            }
        }

        if r != NIL {
            a.set_parent(r, xp);
            let c0 = a.child(x, 0);
            if c0 != NIL {
                a.set_child(r, 0, c0);
                a.set_parent(c0, r);
            }
            let c1 = a.child(x, 1);
            if c1 != NIL {
                a.set_child(r, 1, c1);
                a.set_parent(c1, r);
            }
        }
        Ok(())
    }

    /// Unlinks and returns the smallest chunk of at least `nb` bytes, if any.
    pub(crate) fn take_best_fit(&mut self, a: Arena, nb: usize) -> Result<Option<Offset>, HeapError> {
        let idx = tree_index(nb);
        let mut v = NIL;
        let mut rsize = usize::MAX;
        let mut t = self.roots[idx];

        if t != NIL {
            // Walk down the path of nb, remembering the deepest untaken right
            // subtree: everything in it is larger than nb.
            let mut sizebits = nb << leftshift_for_tree_index(idx);
            let mut rst = NIL;
            loop {
                checked(a, t, "tree node lies outside the arena")?;
                let tsize = a.size(t);
                if tsize >= nb && tsize - nb < rsize {
                    v = t;
                    rsize = tsize - nb;
                    if rsize == 0 {
                        break;
                    }
                }
                let rt = a.child(t, 1);
                t = a.child(t, sizebits >> (usize::BITS - 1));
                if rt != NIL && rt != t {
                    rst = rt;
                }
                if t == NIL {
                    t = rst;
                    break;
                }
                sizebits <<= 1;
            }
        }

        if t == NIL && v == NIL {
            let larger = left_bits(1 << idx) & self.map;
            if larger != 0 {
                t = self.roots[bit_index(least_bit(larger))];
            }
        }

        // Smallest chunk of the chosen subtree lies along its leftmost path.
        while t != NIL {
            checked(a, t, "tree node lies outside the arena")?;
            let tsize = a.size(t);
            if tsize >= nb && tsize - nb < rsize {
                rsize = tsize - nb;
                v = t;
            }
            t = leftmost_child(a, t);
        }

        if v == NIL {
            return Ok(None);
        }
        self.unlink(a, v)?;
        Ok(Some(v))
    }

    /// Unlinks and returns the smallest chunk held in any tree bin.
    pub(crate) fn take_smallest(&mut self, a: Arena) -> Result<Option<Offset>, HeapError> {
        if self.map == 0 {
            return Ok(None);
        }
        let idx = bit_index(least_bit(self.map));
        let mut v = checked(a, self.roots[idx], "tree root lies outside the arena")?;
        let mut best = a.size(v);
        let mut t = leftmost_child(a, v);
        while t != NIL {
            checked(a, t, "tree node lies outside the arena")?;
            let tsize = a.size(t);
            if tsize < best {
                best = tsize;
                v = t;
            }
            t = leftmost_child(a, t);
        }
        self.unlink(a, v)?;
        Ok(Some(v))
    }

    /// Walks every bin checking links, bin ranges and free bits.
    /// Returns the number of chunks held and their total size.
    pub(crate) fn verify(&self, a: Arena) -> Result<(usize, usize), HeapError> {
        let mut budget = a.len() / MIN_CHUNK_SIZE + 1;
        let mut count = 0;
        let mut bytes = 0;
        let mut stack = Vec::new();

        for idx in 0..NTREEBINS {
            let root = self.roots[idx];
            if (root != NIL) != self.is_marked(idx) {
                return Err(HeapError::corruption(root, "tree map disagrees with bin"));
            }
            if root == NIL {
                continue;
            }
            checked(a, root, "tree root lies outside the arena")?;
            if a.parent(root) != TREE_ROOT {
                return Err(HeapError::corruption(root, "tree root has a parent"));
            }
            let min = minsize_for_tree_index(idx);
            let max = if idx + 1 < NTREEBINS {
                minsize_for_tree_index(idx + 1)
            } else {
                usize::MAX
            };

            stack.push(root);
            while let Some(t) = stack.pop() {
                let size = a.size(t);
                if a.bin_index(t) != idx || size < min || size >= max {
                    return Err(HeapError::corruption(t, "tree chunk in the wrong bin"));
                }
                if a.in_use(t) {
                    return Err(HeapError::corruption(t, "in-use chunk in a tree bin"));
                }

                let mut s = t;
                loop {
                    budget = budget
                        .checked_sub(1)
                        .ok_or(HeapError::corruption(t, "tree bin contains a cycle"))?;
                    count += 1;
                    bytes += size;
                    let next = checked(a, a.fd(s), "tree sibling lies outside the arena")?;
                    if a.bk(next) != s {
                        return Err(HeapError::corruption(s, "tree sibling ring is broken"));
                    }
                    if next == t {
                        break;
                    }
                    if a.size(next) != size || a.parent(next) != NIL || a.in_use(next) {
                        return Err(HeapError::corruption(next, "tree sibling differs from node"));
                    }
                    s = next;
                }

                for dir in 0..2 {
                    let c = a.child(t, dir);
                    if c != NIL {
                        checked(a, c, "tree child lies outside the arena")?;
                        if a.parent(c) != t {
                            return Err(HeapError::corruption(c, "tree child has a wrong parent"));
                        }
                        stack.push(c);
                    }
                }
            }
        }
        Ok((count, bytes))
    }
}
