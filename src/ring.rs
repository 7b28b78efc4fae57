//! Circular doubly-linked lists threaded through an arena
//!
//! Nodes live in a slice owned by the caller and are addressed by index. A node
//! may sit on several rings at once as long as each ring uses its own chain
//! marker, so the cache tables can keep an entry on a hash bucket and on a pool
//! ring without aliasing.

use core::marker::PhantomData;

/// Forward and backward index of one chain
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub(crate) struct Link {
    pub(crate) next: usize,
    pub(crate) prev: usize,
}

/// Access to the link a node uses for chain `C`
pub(crate) trait Chained<C> {
    fn link(&self) -> &Link;
    fn link_mut(&mut self) -> &mut Link;
}

/// Head of a circular list over an arena
pub(crate) struct Ring<C> {
    head: Option<usize>,
    len: usize,
    _chain: PhantomData<C>,
}

impl<C> Default for Ring<C> {
    fn default() -> Self {
        Self::new()
    }
}

impl<C> core::fmt::Debug for Ring<C> {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("Ring")
            .field("head", &self.head)
            .field("len", &self.len)
            .finish()
    }
}

impl<C> Ring<C> {
    pub(crate) const fn new() -> Self {
        Ring {
            head: None,
            len: 0,
            _chain: PhantomData,
        }
    }

    pub(crate) fn head(&self) -> Option<usize> {
        self.head
    }

    pub(crate) fn len(&self) -> usize {
        self.len
    }

    pub(crate) fn is_empty(&self) -> bool {
        self.head.is_none()
    }

    /// Append `idx` at the tail (the node before the head)
    pub(crate) fn push_back<T: Chained<C>>(&mut self, nodes: &mut [T], idx: usize) {
        match self.head {
            None => {
                let link = <T as Chained<C>>::link_mut(&mut nodes[idx]);
                link.next = idx;
                link.prev = idx;
                self.head = Some(idx);
            }
            Some(head) => {
                let tail = <T as Chained<C>>::link(&nodes[head]).prev;
                {
                    let link = <T as Chained<C>>::link_mut(&mut nodes[idx]);
                    link.next = head;
                    link.prev = tail;
                }
                <T as Chained<C>>::link_mut(&mut nodes[tail]).next = idx;
                <T as Chained<C>>::link_mut(&mut nodes[head]).prev = idx;
            }
        }
        self.len += 1;
    }

    /// Splice `idx` out. The node must currently be on this ring.
    pub(crate) fn unlink<T: Chained<C>>(&mut self, nodes: &mut [T], idx: usize) {
        let Link { next, prev } = *<T as Chained<C>>::link(&nodes[idx]);
        if next == idx {
            self.head = None;
        } else {
            <T as Chained<C>>::link_mut(&mut nodes[next]).prev = prev;
            <T as Chained<C>>::link_mut(&mut nodes[prev]).next = next;
            if self.head == Some(idx) {
                self.head = Some(next);
            }
        }
        *<T as Chained<C>>::link_mut(&mut nodes[idx]) = Link { next: idx, prev: idx };
        self.len -= 1;
    }

    pub(crate) fn pop_front<T: Chained<C>>(&mut self, nodes: &mut [T]) -> Option<usize> {
        let head = self.head?;
        self.unlink(nodes, head);
        Some(head)
    }

    /// Walk the ring from the head, yielding indices in insertion order
    pub(crate) fn iter<'a, T: Chained<C>>(&self, nodes: &'a [T]) -> RingIter<'a, T, C> {
        RingIter {
            nodes,
            next: self.head,
            remaining: self.len,
            _chain: PhantomData,
        }
    }

    /// Collect the indices, for callers that mutate while walking
    pub(crate) fn indices<T: Chained<C>>(&self, nodes: &[T]) -> Vec<usize> {
        self.iter(nodes).collect()
    }
}

pub(crate) struct RingIter<'a, T, C> {
    nodes: &'a [T],
    next: Option<usize>,
    remaining: usize,
    _chain: PhantomData<C>,
}

impl<'a, T: Chained<C>, C> Iterator for RingIter<'a, T, C> {
    type Item = usize;

    fn next(&mut self) -> Option<usize> {
        if self.remaining == 0 {
            return None;
        }
        let idx = self.next?;
        self.remaining -= 1;
        self.next = Some(<T as Chained<C>>::link(&self.nodes[idx]).next);
        Some(idx)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct A;
    struct B;

    #[derive(Default)]
    struct Node {
        a: Link,
        b: Link,
    }

    impl Chained<A> for Node {
        fn link(&self) -> &Link {
            &self.a
        }
        fn link_mut(&mut self) -> &mut Link {
            &mut self.a
        }
    }

    impl Chained<B> for Node {
        fn link(&self) -> &Link {
            &self.b
        }
        fn link_mut(&mut self) -> &mut Link {
            &mut self.b
        }
    }

    fn nodes(n: usize) -> Vec<Node> {
        (0..n).map(|_| Node::default()).collect()
    }

    #[test]
    fn test_push_and_iterate_in_order() {
        let mut arena = nodes(4);
        let mut ring: Ring<A> = Ring::new();
        for i in [2, 0, 3] {
            ring.push_back(&mut arena, i);
        }
        assert_eq!(ring.indices(&arena), vec![2, 0, 3]);
        assert_eq!(ring.len(), 3);
    }

    #[test]
    fn test_unlink_head_middle_and_last() {
        let mut arena = nodes(4);
        let mut ring: Ring<A> = Ring::new();
        for i in 0..4 {
            ring.push_back(&mut arena, i);
        }
        ring.unlink(&mut arena, 0);
        assert_eq!(ring.head(), Some(1));
        ring.unlink(&mut arena, 2);
        assert_eq!(ring.indices(&arena), vec![1, 3]);
        ring.unlink(&mut arena, 1);
        ring.unlink(&mut arena, 3);
        assert!(ring.is_empty());
        assert_eq!(ring.len(), 0);
    }

    #[test]
    fn test_two_chains_are_independent() {
        let mut arena = nodes(3);
        let mut a: Ring<A> = Ring::new();
        let mut b: Ring<B> = Ring::new();
        a.push_back(&mut arena, 0);
        a.push_back(&mut arena, 1);
        b.push_back(&mut arena, 1);
        b.push_back(&mut arena, 2);
        a.unlink(&mut arena, 1);
        assert_eq!(a.indices(&arena), vec![0]);
        assert_eq!(b.indices(&arena), vec![1, 2]);
        assert_eq!(b.pop_front(&mut arena), Some(1));
        assert_eq!(b.indices(&arena), vec![2]);
    }
}
