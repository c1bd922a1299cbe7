//! Ownership chains
//!
//! Every engine keeps an ordered chain of its live contexts and every
//! context keeps one of its live values, so teardown can cascade to
//! children the host forgot about. The chain holds strong references; a
//! child records where it sits via a [`Membership`] so it can splice
//! itself out exactly once. Taking the membership is the idempotence
//! point: whichever of explicit close, parent cascade or drop gets there
//! first does the unlink, everyone else sees `None` and walks away.
//!
//! Nodes live in a slab with index links rather than pointers, so a chain
//! mutation is a couple of integer writes under the parent's lock.

use std::sync::{Arc, Weak};

/// One child's receipt for its place in a parent chain.
pub(crate) struct Membership<P> {
    pub parent: Weak<P>,
    pub node: u32,
}

struct Node<T> {
    item: Option<Arc<T>>,
    prev: Option<u32>,
    next: Option<u32>,
}

pub(crate) struct Chain<T> {
    nodes: Vec<Node<T>>,
    free: Vec<u32>,
    head: Option<u32>,
    tail: Option<u32>,
    count: usize,
}

impl<T> Chain<T> {
    pub fn new() -> Self {
        Self {
            nodes: Vec::new(),
            free: Vec::new(),
            head: None,
            tail: None,
            count: 0,
        }
    }

    /// Link `item` at the tail, returning the node index for the child's
    /// membership receipt.
    pub fn append(&mut self, item: Arc<T>) -> u32 {
        let node = Node {
            item: Some(item),
            prev: self.tail,
            next: None,
        };
        let id = match self.free.pop() {
            Some(id) => {
                self.nodes[id as usize] = node;
                id
            }
            None => {
                self.nodes.push(node);
                (self.nodes.len() - 1) as u32
            }
        };
        match self.tail {
            Some(tail) => self.nodes[tail as usize].next = Some(id),
            None => self.head = Some(id),
        }
        self.tail = Some(id);
        self.count += 1;
        id
    }

    /// Unlink the node and hand back its strong reference.
    pub fn splice(&mut self, id: u32) -> Arc<T> {
        let node = &mut self.nodes[id as usize];
        let item = match node.item.take() {
            Some(item) => item,
            None => panic!("chain node {id} spliced twice"),
        };
        let (prev, next) = (node.prev, node.next);
        node.prev = None;
        node.next = None;
        match prev {
            Some(p) => self.nodes[p as usize].next = next,
            None => self.head = next,
        }
        match next {
            Some(n) => self.nodes[n as usize].prev = prev,
            None => self.tail = prev,
        }
        self.free.push(id);
        self.count -= 1;
        item
    }

    pub fn count(&self) -> usize {
        self.count
    }

    /// Strong references to every chained child, head to tail. Teardown
    /// iterates the snapshot rather than the live chain, since closing a
    /// child splices it out from under any cursor.
    pub fn snapshot(&self) -> Vec<Arc<T>> {
        let mut out = Vec::with_capacity(self.count);
        let mut cursor = self.head;
        while let Some(id) = cursor {
            let node = &self.nodes[id as usize];
            if let Some(item) = &node.item {
                out.push(item.clone());
            }
            cursor = node.next;
        }
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn items(chain: &Chain<u32>) -> Vec<u32> {
        chain.snapshot().iter().map(|a| **a).collect()
    }

    #[test]
    fn append_links_in_arrival_order() {
        let mut chain = Chain::new();
        for v in [10, 20, 30] {
            chain.append(Arc::new(v));
        }
        assert_eq!(items(&chain), vec![10, 20, 30]);
        assert_eq!(chain.count(), 3);
    }

    #[test]
    fn splicing_the_middle_relinks_neighbours() {
        let mut chain = Chain::new();
        let _a = chain.append(Arc::new(1));
        let b = chain.append(Arc::new(2));
        let _c = chain.append(Arc::new(3));
        assert_eq!(*chain.splice(b), 2);
        assert_eq!(items(&chain), vec![1, 3]);
        assert_eq!(chain.count(), 2);
    }

    #[test]
    fn splicing_head_and_tail_keeps_the_ends_consistent() {
        let mut chain = Chain::new();
        let a = chain.append(Arc::new(1));
        let b = chain.append(Arc::new(2));
        let c = chain.append(Arc::new(3));
        chain.splice(a);
        chain.splice(c);
        assert_eq!(items(&chain), vec![2]);
        chain.splice(b);
        assert_eq!(chain.count(), 0);
        assert!(items(&chain).is_empty());

        // Ends reset; appending again starts a fresh list.
        chain.append(Arc::new(9));
        assert_eq!(items(&chain), vec![9]);
    }

    #[test]
    fn freed_nodes_are_reused() {
        let mut chain = Chain::new();
        let a = chain.append(Arc::new(1));
        chain.splice(a);
        let b = chain.append(Arc::new(2));
        assert_eq!(a, b);
    }

    #[test]
    #[should_panic(expected = "spliced twice")]
    fn double_splice_is_an_invariant_violation() {
        let mut chain = Chain::new();
        let a = chain.append(Arc::new(1));
        chain.splice(a);
        chain.splice(a);
    }
}
