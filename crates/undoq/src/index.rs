//! Ordered indexes over the live request set.
//!
//! Each [`RequestIndex`] is an AVL tree whose nodes live in the shared
//! [`NodePool`] and whose payload is a [`RequestIdx`]; comparisons read the
//! key fields out of the [`RequestArena`]. Three orderings exist, one per
//! scheduling priority:
//!
//! - ascending fxid (oldest transaction first),
//! - descending undo size (largest transaction first, fxid tiebreak),
//! - ascending retry time (soonest retry first, fxid tiebreak).
//!
//! Every ordering falls back to the fxid, and fxids are unique across live
//! requests, so no two distinct requests ever compare equal. A duplicate
//! key on insert therefore means the same request was listed twice and is
//! treated as a fatal bug rather than a merge.
//!
//! Iteration is allocation-free: the in-order walk carries an explicit
//! stack sized for the worst-case AVL height of a `u32`-indexed pool.

use std::cmp::Ordering;

use undoq_types::FullXid;

use crate::arena::{IndexNode, NodeIdx, NodePool, RequestArena, RequestIdx};

/// Upper bound on the depth of any tree in a [`NodePool`].
///
/// An AVL tree of height `h` holds at least `F(h+2) - 1` nodes, so a pool
/// of at most `2^32` nodes can never exceed height 47.
pub const MAX_TREE_DEPTH: usize = 48;

/// Key ordering of one [`RequestIndex`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SortOrder {
    /// Ascending fxid. No ties.
    Fxid,
    /// Descending undo size, tiebreak ascending fxid.
    SizeDesc,
    /// Ascending retry time, tiebreak ascending fxid.
    RetryTime,
}

fn compare(order: SortOrder, requests: &RequestArena, a: RequestIdx, b: RequestIdx) -> Ordering {
    if a == b {
        return Ordering::Equal;
    }
    let slot_a = requests.get(a);
    let slot_b = requests.get(b);
    let fxid_a = slot_a.fxid.expect("request in an index must have a valid fxid");
    let fxid_b = slot_b.fxid.expect("request in an index must have a valid fxid");
    match order {
        SortOrder::Fxid => fxid_a.cmp(&fxid_b),
        SortOrder::SizeDesc => slot_b
            .size
            .cmp(&slot_a.size)
            .then_with(|| fxid_a.cmp(&fxid_b)),
        SortOrder::RetryTime => slot_a
            .retry_time
            .cmp(&slot_b.retry_time)
            .then_with(|| fxid_a.cmp(&fxid_b)),
    }
}

/// One ordered multiway map over request handles.
#[derive(Debug)]
pub struct RequestIndex {
    order: SortOrder,
    root: Option<NodeIdx>,
    len: usize,
}

impl RequestIndex {
    #[must_use]
    pub fn new(order: SortOrder) -> Self {
        Self {
            order,
            root: None,
            len: 0,
        }
    }

    /// Number of requests in this index.
    #[must_use]
    pub fn len(&self) -> usize {
        self.len
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Insert a request.
    ///
    /// # Panics
    ///
    /// Panics if the request (or another request comparing equal, which the
    /// fxid tiebreak rules out) is already present.
    pub fn insert(&mut self, nodes: &mut NodePool, requests: &RequestArena, req: RequestIdx) {
        let root = self.root.take();
        self.root = Some(Self::insert_at(self.order, nodes, requests, root, req));
        self.len += 1;
    }

    /// Remove a request that is present in this index.
    ///
    /// # Panics
    ///
    /// Panics if the request is not present.
    pub fn remove(&mut self, nodes: &mut NodePool, requests: &RequestArena, req: RequestIdx) {
        let root = self.root.take();
        self.root = Self::remove_at(self.order, nodes, requests, root, req);
        self.len = self
            .len
            .checked_sub(1)
            .expect("removed a request from an empty index");
    }

    /// The highest-priority request: minimum under this index's ordering.
    #[must_use]
    pub fn leftmost(&self, nodes: &NodePool) -> Option<RequestIdx> {
        let mut n = self.root?;
        while let Some(left) = nodes.get(n).left {
            n = left;
        }
        Some(nodes.get(n).req)
    }

    /// Look up a request by fxid.
    ///
    /// Only meaningful on the fxid-ordered index, where the fxid alone is
    /// the full key.
    #[must_use]
    pub fn find_fxid(
        &self,
        nodes: &NodePool,
        requests: &RequestArena,
        fxid: FullXid,
    ) -> Option<RequestIdx> {
        debug_assert_eq!(self.order, SortOrder::Fxid);
        let mut node = self.root;
        while let Some(n) = node {
            let req = nodes.get(n).req;
            let req_fxid = requests
                .get(req)
                .fxid
                .expect("request in an index must have a valid fxid");
            node = match fxid.cmp(&req_fxid) {
                Ordering::Less => nodes.get(n).left,
                Ordering::Greater => nodes.get(n).right,
                Ordering::Equal => return Some(req),
            };
        }
        None
    }

    /// In-order (highest-priority-first) iteration.
    #[must_use]
    pub fn iter<'p>(&self, nodes: &'p NodePool) -> InorderIter<'p> {
        let mut iter = InorderIter {
            nodes,
            stack: [NodeIdx::new(0); MAX_TREE_DEPTH],
            depth: 0,
        };
        iter.push_left_spine(self.root);
        iter
    }

    // -- AVL internals ------------------------------------------------------

    fn insert_at(
        order: SortOrder,
        nodes: &mut NodePool,
        requests: &RequestArena,
        node: Option<NodeIdx>,
        req: RequestIdx,
    ) -> NodeIdx {
        let Some(n) = node else {
            return nodes.alloc(req);
        };
        match compare(order, requests, req, nodes.get(n).req) {
            Ordering::Less => {
                let left = nodes.get(n).left;
                let new_left = Self::insert_at(order, nodes, requests, left, req);
                nodes.get_mut(n).left = Some(new_left);
            }
            Ordering::Greater => {
                let right = nodes.get(n).right;
                let new_right = Self::insert_at(order, nodes, requests, right, req);
                nodes.get_mut(n).right = Some(new_right);
            }
            Ordering::Equal => {
                panic!("two undo requests compared equal in an index; requests are never combined")
            }
        }
        Self::rebalance(nodes, n)
    }

    fn remove_at(
        order: SortOrder,
        nodes: &mut NodePool,
        requests: &RequestArena,
        node: Option<NodeIdx>,
        req: RequestIdx,
    ) -> Option<NodeIdx> {
        let n = node.expect("request to remove is not present in the index");
        match compare(order, requests, req, nodes.get(n).req) {
            Ordering::Less => {
                let left = nodes.get(n).left;
                nodes.get_mut(n).left = Self::remove_at(order, nodes, requests, left, req);
                Some(Self::rebalance(nodes, n))
            }
            Ordering::Greater => {
                let right = nodes.get(n).right;
                nodes.get_mut(n).right = Self::remove_at(order, nodes, requests, right, req);
                Some(Self::rebalance(nodes, n))
            }
            Ordering::Equal => {
                let IndexNode { left, right, .. } = *nodes.get(n);
                match (left, right) {
                    (None, None) => {
                        nodes.free(n);
                        None
                    }
                    (Some(child), None) | (None, Some(child)) => {
                        nodes.free(n);
                        Some(child)
                    }
                    (Some(_), Some(right)) => {
                        // Replace this node's payload with its in-order
                        // successor and drop the successor's node.
                        let (new_right, successor) = Self::detach_leftmost(nodes, right);
                        let successor_req = nodes.get(successor).req;
                        nodes.free(successor);
                        let node_mut = nodes.get_mut(n);
                        node_mut.req = successor_req;
                        node_mut.right = new_right;
                        Some(Self::rebalance(nodes, n))
                    }
                }
            }
        }
    }

    /// Unlink the leftmost node of the subtree rooted at `n`.
    ///
    /// Returns the rebalanced subtree root and the detached node, which the
    /// caller owns (it is no longer linked anywhere).
    fn detach_leftmost(nodes: &mut NodePool, n: NodeIdx) -> (Option<NodeIdx>, NodeIdx) {
        match nodes.get(n).left {
            None => (nodes.get(n).right, n),
            Some(left) => {
                let (new_left, detached) = Self::detach_leftmost(nodes, left);
                nodes.get_mut(n).left = new_left;
                (Some(Self::rebalance(nodes, n)), detached)
            }
        }
    }

    fn height(nodes: &NodePool, node: Option<NodeIdx>) -> i16 {
        node.map_or(0, |n| i16::from(nodes.get(n).height))
    }

    fn update_height(nodes: &mut NodePool, n: NodeIdx) {
        let node = nodes.get(n);
        let h = 1 + Self::height(nodes, node.left).max(Self::height(nodes, node.right));
        nodes.get_mut(n).height = u8::try_from(h).expect("AVL height exceeds u8");
    }

    fn balance_factor(nodes: &NodePool, n: NodeIdx) -> i16 {
        let node = nodes.get(n);
        Self::height(nodes, node.left) - Self::height(nodes, node.right)
    }

    fn rotate_right(nodes: &mut NodePool, n: NodeIdx) -> NodeIdx {
        let pivot = nodes.get(n).left.expect("rotate_right requires a left child");
        let moved = nodes.get(pivot).right;
        nodes.get_mut(n).left = moved;
        nodes.get_mut(pivot).right = Some(n);
        Self::update_height(nodes, n);
        Self::update_height(nodes, pivot);
        pivot
    }

    fn rotate_left(nodes: &mut NodePool, n: NodeIdx) -> NodeIdx {
        let pivot = nodes.get(n).right.expect("rotate_left requires a right child");
        let moved = nodes.get(pivot).left;
        nodes.get_mut(n).right = moved;
        nodes.get_mut(pivot).left = Some(n);
        Self::update_height(nodes, n);
        Self::update_height(nodes, pivot);
        pivot
    }

    fn rebalance(nodes: &mut NodePool, n: NodeIdx) -> NodeIdx {
        Self::update_height(nodes, n);
        let balance = Self::balance_factor(nodes, n);
        if balance > 1 {
            let left = nodes.get(n).left.expect("left-heavy node has a left child");
            if Self::balance_factor(nodes, left) < 0 {
                let new_left = Self::rotate_left(nodes, left);
                nodes.get_mut(n).left = Some(new_left);
            }
            Self::rotate_right(nodes, n)
        } else if balance < -1 {
            let right = nodes.get(n).right.expect("right-heavy node has a right child");
            if Self::balance_factor(nodes, right) > 0 {
                let new_right = Self::rotate_right(nodes, right);
                nodes.get_mut(n).right = Some(new_right);
            }
            Self::rotate_left(nodes, n)
        } else {
            n
        }
    }
}

/// In-order iterator over one index.
///
/// Yields request handles highest-priority first. Holds no heap storage;
/// the traversal stack is a fixed array sized by [`MAX_TREE_DEPTH`].
pub struct InorderIter<'p> {
    nodes: &'p NodePool,
    stack: [NodeIdx; MAX_TREE_DEPTH],
    depth: usize,
}

impl InorderIter<'_> {
    fn push_left_spine(&mut self, mut node: Option<NodeIdx>) {
        while let Some(n) = node {
            self.stack[self.depth] = n;
            self.depth += 1;
            node = self.nodes.get(n).left;
        }
    }
}

impl Iterator for InorderIter<'_> {
    type Item = RequestIdx;

    fn next(&mut self) -> Option<RequestIdx> {
        if self.depth == 0 {
            return None;
        }
        self.depth -= 1;
        let n = self.stack[self.depth];
        let node = self.nodes.get(n);
        let req = node.req;
        self.push_left_spine(node.right);
        Some(req)
    }
}
