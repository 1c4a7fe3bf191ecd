//! Generic singly-linked list
//!
//! Links are node indices stored by whoever owns the nodes (the arena's slot
//! table, a queue's message block), so the list itself owns nothing. A
//! [`Cursor`] names a `next`-link location, either the list head or some
//! node's `next` field, which lets insert and extract splice in O(1)
//! without re-walking from the head.

/// Index of a node in its owner's table
pub type NodeId = u32;

/// Access to the `next` links of a node table
pub trait Links {
    fn next(&self, node: NodeId) -> Option<NodeId>;
    fn set_next(&mut self, node: NodeId, next: Option<NodeId>);
}

/// A link location within a list
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Cursor {
    /// The list header's head link
    Head,
    /// The `next` link of this node
    After(NodeId),
}

/// List header: head, tail and length
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Glist {
    head: Option<NodeId>,
    tail: Option<NodeId>,
    len: usize,
}

impl Glist {
    pub const fn new() -> Self {
        Self {
            head: None,
            tail: None,
            len: 0,
        }
    }

    pub fn is_empty(&self) -> bool {
        self.head.is_none()
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn head(&self) -> Option<NodeId> {
        self.head
    }

    pub fn tail(&self) -> Option<NodeId> {
        self.tail
    }

    pub fn push_front<L: Links + ?Sized>(&mut self, links: &mut L, node: NodeId) {
        self.insert(links, Cursor::Head, node);
    }

    pub fn push_back<L: Links + ?Sized>(&mut self, links: &mut L, node: NodeId) {
        let end = self.cursor_end();
        self.insert(links, end, node);
    }

    /// Remove and return the head
    pub fn pop<L: Links + ?Sized>(&mut self, links: &mut L) -> Option<NodeId> {
        self.extract(links, Cursor::Head)
    }

    pub fn cursor_begin(&self) -> Cursor {
        Cursor::Head
    }

    /// The link past the last node
    pub fn cursor_end(&self) -> Cursor {
        match self.tail {
            Some(tail) => Cursor::After(tail),
            None => Cursor::Head,
        }
    }

    /// Node the cursor's link points at, `None` at the end
    pub fn node_at<L: Links + ?Sized>(&self, links: &L, cursor: Cursor) -> Option<NodeId> {
        match cursor {
            Cursor::Head => self.head,
            Cursor::After(node) => links.next(node),
        }
    }

    /// Advance past the node under the cursor
    pub fn cursor_next<L: Links + ?Sized>(&self, links: &L, cursor: Cursor) -> Option<Cursor> {
        self.node_at(links, cursor).map(Cursor::After)
    }

    /// Insert `node` before the node under the cursor (at the end if none)
    pub fn insert<L: Links + ?Sized>(&mut self, links: &mut L, cursor: Cursor, node: NodeId) {
        let next = self.node_at(links, cursor);
        links.set_next(node, next);
        self.set_link(links, cursor, Some(node));
        if next.is_none() {
            self.tail = Some(node);
        }
        self.len += 1;
    }

    /// Insert `node` after the node under the cursor (at the end if none)
    pub fn insert_after<L: Links + ?Sized>(&mut self, links: &mut L, cursor: Cursor, node: NodeId) {
        match self.node_at(links, cursor) {
            Some(at) => self.insert(links, Cursor::After(at), node),
            None => self.push_back(links, node),
        }
    }

    /// Splice out the node under the cursor
    pub fn extract<L: Links + ?Sized>(&mut self, links: &mut L, cursor: Cursor) -> Option<NodeId> {
        let node = self.node_at(links, cursor)?;
        let next = links.next(node);
        self.set_link(links, cursor, next);
        links.set_next(node, None);
        if next.is_none() {
            self.tail = match cursor {
                Cursor::Head => None,
                Cursor::After(prev) => Some(prev),
            };
        }
        self.len -= 1;
        Some(node)
    }

    /// Cursor whose link points at `node`
    pub fn find<L: Links + ?Sized>(&self, links: &L, node: NodeId) -> Option<Cursor> {
        let mut cursor = Cursor::Head;
        while let Some(at) = self.node_at(links, cursor) {
            if at == node {
                return Some(cursor);
            }
            cursor = Cursor::After(at);
        }
        None
    }

    pub fn contains<L: Links + ?Sized>(&self, links: &L, node: NodeId) -> bool {
        self.find(links, node).is_some()
    }

    pub fn iter<'a, L: Links + ?Sized>(&self, links: &'a L) -> Iter<'a, L> {
        Iter {
            links,
            next: self.head,
        }
    }

    fn set_link<L: Links + ?Sized>(&mut self, links: &mut L, cursor: Cursor, value: Option<NodeId>) {
        match cursor {
            Cursor::Head => self.head = value,
            Cursor::After(node) => links.set_next(node, value),
        }
    }
}

/// Iterator over node ids, head to tail
pub struct Iter<'a, L: ?Sized> {
    links: &'a L,
    next: Option<NodeId>,
}

impl<L: Links + ?Sized> Iterator for Iter<'_, L> {
    type Item = NodeId;

    fn next(&mut self) -> Option<NodeId> {
        let node = self.next?;
        self.next = self.links.next(node);
        Some(node)
    }
}
