//! A persistent map from `u64` keys to reference-counted values.
//!
//! Keys are split into 5-bit chunks which select a slot on each level of a
//! 32-way trie. Cloning an [Arena] only clones the root pointer. Mutating a
//! clone copies the trie nodes on the path from the root to the touched slot
//! (via [Arc::make_mut]), everything else stays shared with the original.
use std::{fmt, sync::Arc};

const BITS: u32 = 5;
const WIDTH: usize = 1 << BITS;
const MASK: u64 = (WIDTH - 1) as u64;

enum Node<T> {
    Leaf([Option<Arc<T>>; WIDTH]),
    Branch([Option<Arc<Node<T>>>; WIDTH]),
}

// Not derived, that would require T: Clone. Cloning a node is shallow.
impl<T> Clone for Node<T> {
    fn clone(&self) -> Self {
        match self {
            Node::Leaf(slots) => Node::Leaf(slots.clone()),
            Node::Branch(children) => Node::Branch(children.clone()),
        }
    }
}

impl<T> Node<T> {
    fn empty(level: u32) -> Self {
        if level == 0 {
            Node::Leaf(std::array::from_fn(|_| None))
        } else {
            Node::Branch(std::array::from_fn(|_| None))
        }
    }

    fn is_empty(&self) -> bool {
        match self {
            Node::Leaf(slots) => slots.iter().all(Option::is_none),
            Node::Branch(children) => children.iter().all(Option::is_none),
        }
    }
}

fn slot(key: u64, level: u32) -> usize {
    ((key >> (BITS * level)) & MASK) as usize
}

pub struct Arena<T> {
    root: Option<Arc<Node<T>>>,
    /// Number of trie levels, the leaves being level 0.
    levels: u32,
    len: usize,
}

impl<T> Clone for Arena<T> {
    fn clone(&self) -> Self {
        Self {
            root: self.root.clone(),
            levels: self.levels,
            len: self.len,
        }
    }
}

impl<T> Default for Arena<T> {
    fn default() -> Self {
        Self {
            root: None,
            levels: 1,
            len: 0,
        }
    }
}

impl<T> Arena<T> {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    fn fits(&self, key: u64) -> bool {
        key.checked_shr(BITS * self.levels).unwrap_or(0) == 0
    }

    pub fn get(&self, key: u64) -> Option<&Arc<T>> {
        if !self.fits(key) {
            return None;
        }

        let mut node = self.root.as_deref()?;
        let mut level = self.levels - 1;
        loop {
            match node {
                Node::Leaf(slots) => return slots[slot(key, level)].as_ref(),
                Node::Branch(children) => {
                    node = children[slot(key, level)].as_deref()?;
                    level -= 1;
                }
            }
        }
    }

    pub fn contains_key(&self, key: u64) -> bool {
        self.get(key).is_some()
    }

    /// Inserts a value, returning the previous one.
    pub fn insert(&mut self, key: u64, value: Arc<T>) -> Option<Arc<T>> {
        while !self.fits(key) {
            if let Some(root) = self.root.take() {
                let mut children: [Option<Arc<Node<T>>>; WIDTH] = std::array::from_fn(|_| None);
                children[0] = Some(root);
                self.root = Some(Arc::new(Node::Branch(children)));
            }
            self.levels += 1;
        }

        let top = self.levels - 1;
        let root = self
            .root
            .get_or_insert_with(|| Arc::new(Node::empty(top)));

        let prev = insert_rec(root, top, key, value);
        if prev.is_none() {
            self.len += 1;
        }
        prev
    }

    /// Removes a value, returning it.
    pub fn remove(&mut self, key: u64) -> Option<Arc<T>> {
        // Don't copy any nodes for keys that aren't there.
        if !self.contains_key(key) {
            return None;
        }

        let top = self.levels - 1;
        let root = self.root.as_mut()?;
        let prev = remove_rec(root, top, key);

        if root.is_empty() {
            self.root = None;
        }
        if prev.is_some() {
            self.len -= 1;
        }
        prev
    }

    /// Iterates over all values in ascending key order.
    pub fn iter(&self) -> Iter<'_, T> {
        Iter {
            stack: self
                .root
                .as_deref()
                .map(|node| {
                    vec![Frame {
                        node,
                        prefix: 0,
                        level: self.levels - 1,
                        idx: 0,
                    }]
                })
                .unwrap_or_default(),
        }
    }

    /// Whether both arenas share the same root node.
    pub fn ptr_eq(&self, other: &Self) -> bool {
        match (&self.root, &other.root) {
            (Some(a), Some(b)) => Arc::ptr_eq(a, b),
            (None, None) => true,
            _ => false,
        }
    }
}

impl<T: Clone> Arena<T> {
    /// Returns a mutable reference to a value, copying shared trie nodes and
    /// the value itself if they are shared with another arena.
    pub fn get_mut(&mut self, key: u64) -> Option<&mut T> {
        if !self.contains_key(key) {
            return None;
        }

        let mut level = self.levels - 1;
        let mut node = Arc::make_mut(self.root.as_mut()?);
        loop {
            match node {
                Node::Leaf(slots) => return slots[slot(key, level)].as_mut().map(Arc::make_mut),
                Node::Branch(children) => {
                    node = Arc::make_mut(children[slot(key, level)].as_mut()?);
                    level -= 1;
                }
            }
        }
    }
}

fn insert_rec<T>(node: &mut Arc<Node<T>>, level: u32, key: u64, value: Arc<T>) -> Option<Arc<T>> {
    let idx = slot(key, level);
    match Arc::make_mut(node) {
        Node::Leaf(slots) => slots[idx].replace(value),
        Node::Branch(children) => {
            let child = children[idx].get_or_insert_with(|| Arc::new(Node::empty(level - 1)));
            insert_rec(child, level - 1, key, value)
        }
    }
}

fn remove_rec<T>(node: &mut Arc<Node<T>>, level: u32, key: u64) -> Option<Arc<T>> {
    let idx = slot(key, level);
    match Arc::make_mut(node) {
        Node::Leaf(slots) => slots[idx].take(),
        Node::Branch(children) => {
            let child = children[idx].as_mut()?;
            let prev = remove_rec(child, level - 1, key);
            if child.is_empty() {
                children[idx] = None;
            }
            prev
        }
    }
}

struct Frame<'a, T> {
    node: &'a Node<T>,
    prefix: u64,
    level: u32,
    idx: usize,
}

pub struct Iter<'a, T> {
    stack: Vec<Frame<'a, T>>,
}

impl<'a, T> Iterator for Iter<'a, T> {
    type Item = (u64, &'a Arc<T>);

    fn next(&mut self) -> Option<Self::Item> {
        while let Some(frame) = self.stack.last_mut() {
            if frame.idx == WIDTH {
                self.stack.pop();
                continue;
            }

            let idx = frame.idx;
            frame.idx += 1;

            let (node, level) = (frame.node, frame.level);
            let key = frame.prefix | ((idx as u64) << (BITS * level));

            match node {
                Node::Leaf(slots) => {
                    if let Some(value) = &slots[idx] {
                        return Some((key, value));
                    }
                }
                Node::Branch(children) => {
                    if let Some(child) = children[idx].as_deref() {
                        self.stack.push(Frame {
                            node: child,
                            prefix: key,
                            level: level - 1,
                            idx: 0,
                        });
                    }
                }
            }
        }

        None
    }
}

impl<T: PartialEq> PartialEq for Arena<T> {
    fn eq(&self, other: &Self) -> bool {
        if self.ptr_eq(other) {
            return true;
        }

        self.len == other.len
            && self
                .iter()
                .zip(other.iter())
                .all(|((ka, va), (kb, vb))| ka == kb && (Arc::ptr_eq(va, vb) || va == vb))
    }
}

impl<T: Eq> Eq for Arena<T> {}

impl<T: fmt::Debug> fmt::Debug for Arena<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_map().entries(self.iter()).finish()
    }
}
