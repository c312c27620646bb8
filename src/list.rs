use std::{
    marker::PhantomData,
    mem,
    ops::{Index, IndexMut},
};

/// Index of a node inside its [`Nodes`] storage.
pub(crate) type NodeId = usize;

/// Link to another node of the same [`Nodes`] storage.
pub(crate) type Link = Option<NodeId>;

pub(crate) struct Node<T> {
    /// Index of the next node of the list
    pub next: Link,
    /// Index of the previous node of the list
    pub prev: Link,
    /// Element of the node
    pub data: T,
}

impl<T> Node<T> {
    pub fn new(data: T) -> Self {
        Self { next: None, prev: None, data }
    }
}

/// Slot table the nodes of one or more [`List`] live in.
///
/// The links are plain indices into this table instead of pointers into the
/// arena, so the allocator metadata never aliases the memory it hands out.
/// Removed slots are recycled by later insertions.
pub(crate) struct Nodes<T> {
    slots: Vec<Option<Node<T>>>,
    vacant: Vec<NodeId>,
}

impl<T> Nodes<T> {
    pub const fn new() -> Self {
        Self {
            slots: Vec::new(),
            vacant: Vec::new(),
        }
    }

    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            slots: Vec::with_capacity(capacity),
            vacant: Vec::new(),
        }
    }

    /// Stores `data` in a detached node and returns its index.
    pub fn insert(&mut self, data: T) -> NodeId {
        let node = Some(Node::new(data));

        match self.vacant.pop() {
            Some(id) => {
                self.slots[id] = node;
                id
            }
            None => {
                self.slots.push(node);
                self.slots.len() - 1
            }
        }
    }

    /// Removes the node `id` from the table. The node must already be
    /// detached from any [`List`].
    pub fn remove(&mut self, id: NodeId) -> T {
        match self.slots.get_mut(id).and_then(Option::take) {
            Some(node) => {
                self.vacant.push(id);
                node.data
            }
            None => vacant_slot(id),
        }
    }

    #[inline]
    pub fn get(&self, id: NodeId) -> Option<&T> {
        self.slots.get(id)?.as_ref().map(|node| &node.data)
    }

    #[inline]
    pub fn node(&self, id: NodeId) -> &Node<T> {
        match self.slots.get(id) {
            Some(Some(node)) => node,
            _ => vacant_slot(id),
        }
    }

    #[inline]
    pub fn node_mut(&mut self, id: NodeId) -> &mut Node<T> {
        match self.slots.get_mut(id) {
            Some(Some(node)) => node,
            _ => vacant_slot(id),
        }
    }

    /// Number of occupied slots.
    #[inline]
    pub fn len(&self) -> usize {
        self.slots.len() - self.vacant.len()
    }

}

impl<T> Index<NodeId> for Nodes<T> {
    type Output = T;

    fn index(&self, id: NodeId) -> &T {
        &self.node(id).data
    }
}

impl<T> IndexMut<NodeId> for Nodes<T> {
    fn index_mut(&mut self, id: NodeId) -> &mut T {
        &mut self.node_mut(id).data
    }
}

#[cold]
#[track_caller]
fn vacant_slot(id: NodeId) -> ! {
    panic!("list node {id} is not allocated")
}

/// Elements that cover a contiguous address range. Lists of spans can be
/// kept in address order and coalesced, see [`List::priority_insert`] and
/// [`List::merge`].
pub(crate) trait Span {
    /// First byte covered by the span.
    fn start(&self) -> u64;

    /// Number of bytes covered by the span.
    fn size(&self) -> u64;

    /// Grows `self` so that it also covers `next`, which starts right where
    /// `self` ends.
    fn absorb(&mut self, next: Self);

    #[inline]
    fn end(&self) -> u64 {
        self.start() + self.size()
    }
}

/// Doubly linked list whose nodes live in an external [`Nodes`] table.
///
/// Several lists can share one table (a pool's used and free lists share
/// its block table), every node belongs to at most one of them at a time.
#[derive(Default)]
pub(crate) struct List {
    head: Link,
    tail: Link,
    len: usize,
}

pub(crate) struct Iter<'a, T> {
    nodes: &'a Nodes<T>,
    current: Link,
    remaining: usize,
    marker: PhantomData<&'a T>,
}

impl List {
    pub const fn new() -> Self {
        Self {
            head: None,
            tail: None,
            len: 0,
        }
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.len
    }

    #[inline]
    pub fn first(&self) -> Link {
        self.head
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Appends the detached node `id` to the end of the list.
    pub fn push_back<T>(&mut self, nodes: &mut Nodes<T>, id: NodeId) {
        let node = nodes.node_mut(id);
        node.prev = self.tail;
        node.next = None;

        match self.tail {
            Some(tail) => nodes.node_mut(tail).next = Some(id),
            None => self.head = Some(id),
        }

        self.tail = Some(id);
        self.len += 1;
    }

    /// Prepends the detached node `id` to the start of the list.
    pub fn push_front<T>(&mut self, nodes: &mut Nodes<T>, id: NodeId) {
        match self.head {
            Some(head) => self.insert_before(nodes, head, id),
            None => self.push_back(nodes, id),
        }
    }

    /// Links the detached node `id` right in front of `at`.
    fn insert_before<T>(&mut self, nodes: &mut Nodes<T>, at: NodeId, id: NodeId) {
        let prev = nodes.node(at).prev;

        let node = nodes.node_mut(id);
        node.prev = prev;
        node.next = Some(at);
        nodes.node_mut(at).prev = Some(id);

        match prev {
            Some(prev) => nodes.node_mut(prev).next = Some(id),
            None => self.head = Some(id),
        }

        self.len += 1;
    }

    /// Unlinks `id` from the list and returns the node that followed it.
    pub fn remove<T>(&mut self, nodes: &mut Nodes<T>, id: NodeId) -> Link {
        let node = nodes.node_mut(id);
        let (prev, next) = (node.prev.take(), node.next.take());

        match prev {
            Some(prev) => nodes.node_mut(prev).next = next,
            None => self.head = next,
        }
        match next {
            Some(next) => nodes.node_mut(next).prev = prev,
            None => self.tail = prev,
        }

        self.len -= 1;
        next
    }

    pub fn pop_front<T>(&mut self, nodes: &mut Nodes<T>) -> Option<NodeId> {
        let head = self.head?;
        self.remove(nodes, head);
        Some(head)
    }

    /// Moves every node of `other` to the end of this list in O(1).
    pub fn append<T>(&mut self, nodes: &mut Nodes<T>, other: &mut List) {
        let other = mem::take(other);
        let (Some(other_head), Some(other_tail)) = (other.head, other.tail) else {
            return;
        };

        match self.tail {
            Some(tail) => {
                nodes.node_mut(tail).next = Some(other_head);
                nodes.node_mut(other_head).prev = Some(tail);
            }
            None => self.head = Some(other_head),
        }

        self.tail = Some(other_tail);
        self.len += other.len;
    }

    pub fn iter<'a, T>(&self, nodes: &'a Nodes<T>) -> Iter<'a, T> {
        Iter {
            nodes,
            current: self.head,
            remaining: self.len,
            marker: PhantomData,
        }
    }
}

impl List {
    /// Inserts the detached node `id` keeping the list sorted by start
    /// address.
    pub fn priority_insert<T: Span>(&mut self, nodes: &mut Nodes<T>, id: NodeId) {
        let start = nodes[id].start();
        let mut current = self.head;

        while let Some(candidate) = current {
            if start < nodes[candidate].start() {
                self.insert_before(nodes, candidate, id);
                return;
            }
            current = nodes.node(candidate).next;
        }

        self.push_back(nodes, id);
    }

    /// Walks the list once and coalesces every node whose end touches the
    /// start of the node that follows it. Absorbed nodes are removed from
    /// `nodes`. Returns how many nodes were absorbed.
    ///
    /// The list must be in address order for this to reach a fixed point.
    pub fn merge<T: Span>(&mut self, nodes: &mut Nodes<T>) -> usize {
        let mut merged = 0;
        let mut current = self.head;

        while let Some(id) = current {
            let Some(next) = nodes.node(id).next else {
                break;
            };

            if nodes[id].end() == nodes[next].start() {
                self.remove(nodes, next);
                let absorbed = nodes.remove(next);
                nodes[id].absorb(absorbed);
                merged += 1;

                continue;
            }

            current = Some(next);
        }

        merged
    }
}

impl<'a, T> Iterator for Iter<'a, T> {
    type Item = (NodeId, &'a T);

    fn next(&mut self) -> Option<Self::Item> {
        let id = self.current?;
        let node = self.nodes.node(id);

        self.current = node.next;
        self.remaining -= 1;

        Some((id, &node.data))
    }

    fn size_hint(&self) -> (usize, Option<usize>) {
        (self.remaining, Some(self.remaining))
    }
}
