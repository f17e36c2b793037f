//! Fixed-size pools for request records and index nodes.
//!
//! Both pools are allocated once at manager initialization and never grow.
//! Free records are threaded onto intrusive singly-linked free lists of
//! slot indices; all references between the pools are `u32` indices, never
//! pointers, so the arenas can live anywhere the manager does.
//!
//! Exhaustion is asymmetric. Running out of request slots is an expected
//! soft condition ([`RequestArena::alloc`] returns `None`; the caller falls
//! back to foreground undo). Running out of index nodes is impossible when
//! the node pool holds twice the request capacity, because a listed request
//! occupies at most two indexes; [`NodePool::alloc`] therefore panics.

use undoq_types::{DatabaseId, FullXid, Timestamp, UndoSpan};

// ---------------------------------------------------------------------------
// Handles
// ---------------------------------------------------------------------------

/// Index of a request slot in a [`RequestArena`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(transparent)]
pub struct RequestIdx(u32);

impl RequestIdx {
    pub(crate) const fn new(raw: u32) -> Self {
        Self(raw)
    }

    #[inline]
    pub(crate) const fn index(self) -> usize {
        self.0 as usize
    }
}

/// Index of a node in a [`NodePool`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(transparent)]
pub struct NodeIdx(u32);

impl NodeIdx {
    pub(crate) const fn new(raw: u32) -> Self {
        Self(raw)
    }

    #[inline]
    pub(crate) const fn index(self) -> usize {
        self.0 as usize
    }
}

// ---------------------------------------------------------------------------
// Request slots
// ---------------------------------------------------------------------------

/// Which ordered indexes currently contain a request.
///
/// A request that has never failed is listed in the fxid and size indexes
/// together; a failed request is listed in the retry-time index only. The
/// two sets are exclusive.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum IndexMembership {
    /// In no index: the request is FREE or is privately held by a caller.
    #[default]
    None,
    /// In the by-fxid and by-size indexes.
    FxidAndSize,
    /// In the by-retry-time index.
    RetryTime,
}

/// One request record.
///
/// `fxid == None` means the slot is FREE and threaded on the free list.
/// A non-FREE slot whose `membership` is [`IndexMembership::None`] is
/// UNLISTED: some caller holds the only handle to it.
#[derive(Debug)]
pub struct RequestSlot {
    pub fxid: Option<FullXid>,
    pub dbid: DatabaseId,
    /// Total bytes of durable undo; zero until finalized.
    pub size: u64,
    pub logged: Option<UndoSpan>,
    pub unlogged: Option<UndoSpan>,
    /// Earliest instant a failed request may be retried; `None` means the
    /// request has never failed.
    pub retry_time: Option<Timestamp>,
    pub membership: IndexMembership,
    next_free: Option<RequestIdx>,
}

impl RequestSlot {
    fn free_slot(next_free: Option<RequestIdx>) -> Self {
        Self {
            fxid: None,
            dbid: DatabaseId::new(0),
            size: 0,
            logged: None,
            unlogged: None,
            retry_time: None,
            membership: IndexMembership::None,
            next_free,
        }
    }
}

/// Fixed pool of request records with an intrusive free list.
pub struct RequestArena {
    slots: Vec<RequestSlot>,
    free_head: Option<RequestIdx>,
    free_len: usize,
}

impl RequestArena {
    /// Allocate a pool of `capacity` FREE slots.
    #[must_use]
    pub fn new(capacity: usize) -> Self {
        assert!(capacity > 0, "request arena capacity must be non-zero");
        u32::try_from(capacity).expect("request arena capacity overflows u32");
        let slots = (0..capacity)
            .map(|i| {
                let next = (i + 1 < capacity).then(|| RequestIdx::new((i + 1) as u32));
                RequestSlot::free_slot(next)
            })
            .collect();
        Self {
            slots,
            free_head: Some(RequestIdx::new(0)),
            free_len: capacity,
        }
    }

    /// Pop a FREE slot, or `None` when the pool is exhausted.
    ///
    /// The returned slot is zeroed; the caller initializes it.
    pub fn alloc(&mut self) -> Option<RequestIdx> {
        let idx = self.free_head?;
        let slot = &mut self.slots[idx.index()];
        self.free_head = slot.next_free.take();
        self.free_len -= 1;
        Some(idx)
    }

    /// Return a slot to the free list, resetting it to the FREE state.
    ///
    /// # Panics
    ///
    /// Panics if the slot is already FREE (double free).
    pub fn free(&mut self, idx: RequestIdx) {
        let slot = &mut self.slots[idx.index()];
        assert!(
            slot.fxid.is_some(),
            "double free of request slot {idx:?}"
        );
        *slot = RequestSlot::free_slot(self.free_head);
        self.free_head = Some(idx);
        self.free_len += 1;
    }

    #[inline]
    #[must_use]
    pub fn get(&self, idx: RequestIdx) -> &RequestSlot {
        &self.slots[idx.index()]
    }

    #[inline]
    pub fn get_mut(&mut self, idx: RequestIdx) -> &mut RequestSlot {
        &mut self.slots[idx.index()]
    }

    /// Total slots in the pool.
    #[must_use]
    pub fn capacity(&self) -> usize {
        self.slots.len()
    }

    /// Slots currently on the free list.
    #[must_use]
    pub fn free_count(&self) -> usize {
        self.free_len
    }

    /// Iterate over the non-FREE slots.
    pub fn iter_occupied(&self) -> impl Iterator<Item = (RequestIdx, &RequestSlot)> {
        self.slots
            .iter()
            .enumerate()
            .filter(|(_, slot)| slot.fxid.is_some())
            .map(|(i, slot)| (RequestIdx::new(i as u32), slot))
    }
}

#[allow(clippy::missing_fields_in_debug)]
impl std::fmt::Debug for RequestArena {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RequestArena")
            .field("capacity", &self.slots.len())
            .field("free_count", &self.free_len)
            .finish_non_exhaustive()
    }
}

// ---------------------------------------------------------------------------
// Index nodes
// ---------------------------------------------------------------------------

/// One node of an ordered request index.
///
/// Nodes never own request data; they point into the [`RequestArena`] so a
/// single request can be a member of two indexes at once.
#[derive(Debug, Clone, Copy)]
pub struct IndexNode {
    pub req: RequestIdx,
    pub left: Option<NodeIdx>,
    pub right: Option<NodeIdx>,
    pub height: u8,
}

/// Fixed pool of index nodes shared by all three request indexes.
///
/// The free list is threaded through the `left` field of free nodes.
pub struct NodePool {
    nodes: Vec<IndexNode>,
    free_head: Option<NodeIdx>,
    free_len: usize,
}

impl NodePool {
    /// Allocate a pool of `capacity` free nodes.
    #[must_use]
    pub fn new(capacity: usize) -> Self {
        assert!(capacity > 0, "node pool capacity must be non-zero");
        u32::try_from(capacity).expect("node pool capacity overflows u32");
        let nodes = (0..capacity)
            .map(|i| IndexNode {
                req: RequestIdx::new(0),
                left: (i + 1 < capacity).then(|| NodeIdx::new((i + 1) as u32)),
                right: None,
                height: 0,
            })
            .collect();
        Self {
            nodes,
            free_head: Some(NodeIdx::new(0)),
            free_len: capacity,
        }
    }

    /// Pop a free node and initialize it as a leaf for `req`.
    ///
    /// # Panics
    ///
    /// Panics when the pool is exhausted. The manager sizes the pool at
    /// twice the request capacity and a request occupies at most two
    /// indexes, so exhaustion means a bookkeeping bug, not load.
    pub fn alloc(&mut self, req: RequestIdx) -> NodeIdx {
        let idx = self
            .free_head
            .expect("index node pool exhausted: a request is listed in more indexes than it can be");
        let node = &mut self.nodes[idx.index()];
        self.free_head = node.left;
        self.free_len -= 1;
        *node = IndexNode {
            req,
            left: None,
            right: None,
            height: 1,
        };
        idx
    }

    /// Return a node to the free list.
    pub fn free(&mut self, idx: NodeIdx) {
        let node = &mut self.nodes[idx.index()];
        node.left = self.free_head;
        node.right = None;
        node.height = 0;
        self.free_head = Some(idx);
        self.free_len += 1;
    }

    #[inline]
    #[must_use]
    pub fn get(&self, idx: NodeIdx) -> &IndexNode {
        &self.nodes[idx.index()]
    }

    #[inline]
    pub fn get_mut(&mut self, idx: NodeIdx) -> &mut IndexNode {
        &mut self.nodes[idx.index()]
    }

    /// Total nodes in the pool.
    #[must_use]
    pub fn capacity(&self) -> usize {
        self.nodes.len()
    }

    /// Nodes currently on the free list.
    #[must_use]
    pub fn free_count(&self) -> usize {
        self.free_len
    }
}

#[allow(clippy::missing_fields_in_debug)]
impl std::fmt::Debug for NodePool {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("NodePool")
            .field("capacity", &self.nodes.len())
            .field("free_count", &self.free_len)
            .finish_non_exhaustive()
    }
}
