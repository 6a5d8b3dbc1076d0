//! Storage index for holey arrays.
//!
//! A red-black tree whose nodes do not store their key. Each node keeps
//! `size_left`, the distance between its key and the key of the nearest
//! ancestor it hangs to the right of (or zero at the left edge). The key of a
//! node is therefore the sum of `size_left` over its right-turn ancestors plus
//! its own, and shifting every key by one only touches the leftmost path.
//!
//! Nodes live in an arena; slot 0 is the header whose left child is the root
//! and which doubles as `end()`.

use std::fmt;

pub type NodeId = u32;

const NIL: NodeId = u32::MAX;
const HEADER: NodeId = 0;

#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum Color {
    Red,
    Black,
}

#[derive(Clone, Copy, Debug)]
struct SparseArrayNode {
    parent: NodeId,
    left: NodeId,
    right: NodeId,
    color: Color,
    size_left: u32,
    value: u32,
}

impl SparseArrayNode {
    fn vacant() -> Self {
        SparseArrayNode {
            parent: NIL,
            left: NIL,
            right: NIL,
            color: Color::Black,
            size_left: 0,
            value: u32::MAX,
        }
    }
}

#[derive(Clone)]
pub struct SparseArray {
    nodes: Vec<SparseArrayNode>,
    free: Vec<NodeId>,
    num_entries: u32,
    most_left: NodeId,
}

impl Default for SparseArray {
    fn default() -> Self {
        SparseArray::new()
    }
}

impl SparseArray {
    pub fn new() -> Self {
        SparseArray {
            nodes: vec![SparseArrayNode::vacant()],
            free: vec![],
            num_entries: 0,
            most_left: HEADER,
        }
    }

    fn root(&self) -> NodeId {
        self.nodes[HEADER as usize].left
    }

    fn node(&self, n: NodeId) -> &SparseArrayNode {
        &self.nodes[n as usize]
    }

    fn node_mut(&mut self, n: NodeId) -> &mut SparseArrayNode {
        &mut self.nodes[n as usize]
    }

    pub fn n_entries(&self) -> u32 {
        self.num_entries
    }

    pub fn end(&self) -> NodeId {
        HEADER
    }

    pub fn begin(&self) -> NodeId {
        if self.root() == NIL {
            HEADER
        } else {
            self.most_left
        }
    }

    pub fn value(&self, n: NodeId) -> u32 {
        self.node(n).value
    }

    pub fn set_value(&mut self, n: NodeId, value: u32) {
        self.node_mut(n).value = value;
    }

    /// Effective key of `n`, summing offsets along the path to the root.
    pub fn key(&self, n: NodeId) -> u32 {
        let mut k = self.node(n).size_left;
        let mut cur = n;
        loop {
            let p = self.node(cur).parent;
            if p == NIL || p == HEADER {
                break;
            }
            if self.node(p).right == cur {
                k += self.node(p).size_left;
            }
            cur = p;
        }
        k
    }

    pub fn next_node(&self, n: NodeId) -> NodeId {
        let mut n = n;
        if self.node(n).right != NIL {
            n = self.node(n).right;
            while self.node(n).left != NIL {
                n = self.node(n).left;
            }
            return n;
        }
        let mut y = self.node(n).parent;
        while y != NIL && n == self.node(y).right {
            n = y;
            y = self.node(y).parent;
        }
        if y == NIL {
            HEADER
        } else {
            y
        }
    }

    pub fn previous_node(&self, n: NodeId) -> NodeId {
        let mut n = n;
        if n == HEADER {
            // predecessor of end() is the rightmost node
            let mut r = self.root();
            if r == NIL {
                return HEADER;
            }
            while self.node(r).right != NIL {
                r = self.node(r).right;
            }
            return r;
        }
        if self.node(n).left != NIL {
            n = self.node(n).left;
            while self.node(n).right != NIL {
                n = self.node(n).right;
            }
            return n;
        }
        let mut y = self.node(n).parent;
        while y != NIL && y != HEADER && n == self.node(y).left {
            n = y;
            y = self.node(y).parent;
        }
        if y == NIL || y == HEADER {
            HEADER
        } else {
            y
        }
    }

    pub fn find_node(&self, akey: u32) -> Option<NodeId> {
        let mut n = self.root();
        let mut akey = akey;
        while n != NIL {
            let sl = self.node(n).size_left;
            if akey == sl {
                return Some(n);
            } else if akey < sl {
                n = self.node(n).left;
            } else {
                akey -= sl;
                n = self.node(n).right;
            }
        }
        None
    }

    /// First node with key >= `akey`, or `end()`.
    pub fn lower_bound(&self, akey: u32) -> NodeId {
        let mut n = self.root();
        let mut akey = akey;
        let mut last = HEADER;
        while n != NIL {
            let sl = self.node(n).size_left;
            if akey <= sl {
                last = n;
                n = self.node(n).left;
            } else {
                akey -= sl;
                n = self.node(n).right;
            }
        }
        last
    }

    /// First node with key > `akey`, or `end()`.
    pub fn upper_bound(&self, akey: u32) -> NodeId {
        let mut n = self.root();
        let mut akey = akey;
        let mut last = HEADER;
        while n != NIL {
            let sl = self.node(n).size_left;
            if akey < sl {
                last = n;
                n = self.node(n).left;
            } else {
                akey -= sl;
                n = self.node(n).right;
            }
        }
        last
    }

    /// Node at `akey`, created with value `u32::MAX` when absent.
    pub fn insert(&mut self, akey: u32) -> NodeId {
        let mut n = self.root();
        let mut y = HEADER;
        let mut left = true;
        let mut s = akey;
        while n != NIL {
            y = n;
            let sl = self.node(n).size_left;
            if s == sl {
                return n;
            } else if s < sl {
                left = true;
                n = self.node(n).left;
            } else {
                left = false;
                s -= sl;
                n = self.node(n).right;
            }
        }
        self.create_node(s, y, left)
    }

    fn create_node(&mut self, size_left: u32, parent: NodeId, left: bool) -> NodeId {
        let node = SparseArrayNode {
            parent,
            left: NIL,
            right: NIL,
            color: Color::Red,
            size_left,
            value: u32::MAX,
        };
        let id = match self.free.pop() {
            Some(id) => {
                self.nodes[id as usize] = node;
                id
            }
            None => {
                self.nodes.push(node);
                (self.nodes.len() - 1) as NodeId
            }
        };
        self.num_entries += 1;
        if left {
            self.node_mut(parent).left = id;
            if parent == self.most_left || parent == HEADER {
                self.most_left = id;
            }
        } else {
            self.node_mut(parent).right = id;
        }
        self.rebalance(id);
        id
    }

    fn is_root(&self, n: NodeId) -> bool {
        self.node(n).parent == HEADER
    }

    fn rotate_left(&mut self, x: NodeId) {
        let y = self.node(x).right;
        let y_left = self.node(y).left;
        self.node_mut(x).right = y_left;
        if y_left != NIL {
            self.node_mut(y_left).parent = x;
        }
        let xp = self.node(x).parent;
        self.node_mut(y).parent = xp;
        if self.is_root(x) || self.node(xp).left == x {
            self.node_mut(xp).left = y;
        } else {
            self.node_mut(xp).right = y;
        }
        self.node_mut(y).left = x;
        self.node_mut(x).parent = y;
        let x_sl = self.node(x).size_left;
        self.node_mut(y).size_left += x_sl;
    }

    fn rotate_right(&mut self, x: NodeId) {
        let y = self.node(x).left;
        let y_right = self.node(y).right;
        self.node_mut(x).left = y_right;
        if y_right != NIL {
            self.node_mut(y_right).parent = x;
        }
        let xp = self.node(x).parent;
        self.node_mut(y).parent = xp;
        if self.is_root(x) || self.node(xp).left == x {
            self.node_mut(xp).left = y;
        } else {
            self.node_mut(xp).right = y;
        }
        self.node_mut(y).right = x;
        self.node_mut(x).parent = y;
        let y_sl = self.node(y).size_left;
        self.node_mut(x).size_left -= y_sl;
    }

    fn color_of(&self, n: NodeId) -> Color {
        if n == NIL {
            Color::Black
        } else {
            self.node(n).color
        }
    }

    fn rebalance(&mut self, x: NodeId) {
        let mut x = x;
        self.node_mut(x).color = Color::Red;
        while !self.is_root(x) && self.color_of(self.node(x).parent) == Color::Red {
            let p = self.node(x).parent;
            let g = self.node(p).parent;
            if p == self.node(g).left {
                let y = self.node(g).right;
                if self.color_of(y) == Color::Red {
                    self.node_mut(p).color = Color::Black;
                    self.node_mut(y).color = Color::Black;
                    self.node_mut(g).color = Color::Red;
                    x = g;
                } else {
                    if x == self.node(p).right {
                        x = p;
                        self.rotate_left(x);
                    }
                    let p = self.node(x).parent;
                    let g = self.node(p).parent;
                    self.node_mut(p).color = Color::Black;
                    self.node_mut(g).color = Color::Red;
                    self.rotate_right(g);
                }
            } else {
                let y = self.node(g).left;
                if self.color_of(y) == Color::Red {
                    self.node_mut(p).color = Color::Black;
                    self.node_mut(y).color = Color::Black;
                    self.node_mut(g).color = Color::Red;
                    x = g;
                } else {
                    if x == self.node(p).left {
                        x = p;
                        self.rotate_right(x);
                    }
                    let p = self.node(x).parent;
                    let g = self.node(p).parent;
                    self.node_mut(p).color = Color::Black;
                    self.node_mut(g).color = Color::Red;
                    self.rotate_left(g);
                }
            }
        }
        let root = self.root();
        self.node_mut(root).color = Color::Black;
    }

    fn replace_child(&mut self, parent: NodeId, old: NodeId, new: NodeId) {
        if parent == HEADER || self.node(parent).left == old {
            self.node_mut(parent).left = new;
        } else {
            self.node_mut(parent).right = new;
        }
    }

    /// Removes `n` and returns the node that followed it.
    pub fn erase(&mut self, n: NodeId) -> NodeId {
        if n == HEADER {
            return n;
        }
        let next = self.next_node(n);
        self.delete_node(n);
        next
    }

    fn delete_node(&mut self, z: NodeId) {
        let z_left = self.node(z).left;
        let z_right = self.node(z).right;
        let z_sl = self.node(z).size_left;
        let x;
        let x_parent;
        let removed_color;

        if z_left == NIL || z_right == NIL {
            x = if z_left == NIL { z_right } else { z_left };
            if z_left == NIL {
                // x rises past a right turn, its left spine absorbs z's offset
                let mut s = x;
                while s != NIL {
                    self.node_mut(s).size_left += z_sl;
                    s = self.node(s).left;
                }
            }
            x_parent = self.node(z).parent;
            if x != NIL {
                self.node_mut(x).parent = x_parent;
            }
            self.replace_child(x_parent, z, x);
            removed_color = self.node(z).color;
        } else {
            let mut y = z_right;
            while self.node(y).left != NIL {
                y = self.node(y).left;
            }
            let y_sl = self.node(y).size_left;
            x = self.node(y).right;
            removed_color = self.node(y).color;
            if y == z_right {
                x_parent = y;
            } else {
                // the left spine from z.right down to y's parent now sits under y
                let mut s = z_right;
                while s != y {
                    self.node_mut(s).size_left -= y_sl;
                    s = self.node(s).left;
                }
                x_parent = self.node(y).parent;
                if x != NIL {
                    self.node_mut(x).parent = x_parent;
                }
                self.node_mut(x_parent).left = x;
                self.node_mut(y).right = z_right;
                self.node_mut(z_right).parent = y;
            }
            let zp = self.node(z).parent;
            self.replace_child(zp, z, y);
            self.node_mut(y).parent = zp;
            self.node_mut(y).left = z_left;
            self.node_mut(z_left).parent = y;
            let z_color = self.node(z).color;
            self.node_mut(y).color = z_color;
            self.node_mut(y).size_left = z_sl + y_sl;
        }

        if removed_color == Color::Black {
            self.delete_fixup(x, x_parent);
        }

        self.nodes[z as usize] = SparseArrayNode::vacant();
        self.free.push(z);
        self.num_entries -= 1;
        self.recalc_most_left();
    }

    fn delete_fixup(&mut self, x: NodeId, x_parent: NodeId) {
        let mut x = x;
        let mut xp = x_parent;
        while xp != HEADER && self.color_of(x) == Color::Black {
            if x == self.node(xp).left {
                let mut w = self.node(xp).right;
                if self.color_of(w) == Color::Red {
                    self.node_mut(w).color = Color::Black;
                    self.node_mut(xp).color = Color::Red;
                    self.rotate_left(xp);
                    w = self.node(xp).right;
                }
                if self.color_of(self.node(w).left) == Color::Black
                    && self.color_of(self.node(w).right) == Color::Black
                {
                    self.node_mut(w).color = Color::Red;
                    x = xp;
                    xp = self.node(xp).parent;
                } else {
                    if self.color_of(self.node(w).right) == Color::Black {
                        let wl = self.node(w).left;
                        self.node_mut(wl).color = Color::Black;
                        self.node_mut(w).color = Color::Red;
                        self.rotate_right(w);
                        w = self.node(xp).right;
                    }
                    let c = self.node(xp).color;
                    self.node_mut(w).color = c;
                    self.node_mut(xp).color = Color::Black;
                    let wr = self.node(w).right;
                    if wr != NIL {
                        self.node_mut(wr).color = Color::Black;
                    }
                    self.rotate_left(xp);
                    break;
                }
            } else {
                let mut w = self.node(xp).left;
                if self.color_of(w) == Color::Red {
                    self.node_mut(w).color = Color::Black;
                    self.node_mut(xp).color = Color::Red;
                    self.rotate_right(xp);
                    w = self.node(xp).left;
                }
                if self.color_of(self.node(w).right) == Color::Black
                    && self.color_of(self.node(w).left) == Color::Black
                {
                    self.node_mut(w).color = Color::Red;
                    x = xp;
                    xp = self.node(xp).parent;
                } else {
                    if self.color_of(self.node(w).left) == Color::Black {
                        let wr = self.node(w).right;
                        self.node_mut(wr).color = Color::Black;
                        self.node_mut(w).color = Color::Red;
                        self.rotate_left(w);
                        w = self.node(xp).left;
                    }
                    let c = self.node(xp).color;
                    self.node_mut(w).color = c;
                    self.node_mut(xp).color = Color::Black;
                    let wl = self.node(w).left;
                    if wl != NIL {
                        self.node_mut(wl).color = Color::Black;
                    }
                    self.rotate_right(xp);
                    break;
                }
            }
        }
        if x != NIL {
            self.node_mut(x).color = Color::Black;
        }
    }

    fn recalc_most_left(&mut self) {
        let mut n = self.root();
        if n == NIL {
            self.most_left = HEADER;
            return;
        }
        while self.node(n).left != NIL {
            n = self.node(n).left;
        }
        self.most_left = n;
    }

    /// Removes the entry at key 0 and shifts every remaining key down by one.
    /// Returns the removed value, `u32::MAX` when key 0 is a hole.
    pub fn pop_front(&mut self) -> u32 {
        let n = match self.find_node(0) {
            Some(n) => n,
            None => return u32::MAX,
        };
        let idx = self.node(n).value;
        self.delete_node(n);
        let mut s = self.root();
        while s != NIL {
            self.node_mut(s).size_left -= 1;
            s = self.node(s).left;
        }
        idx
    }

    /// Shifts every key up by one and stores `value` at key 0.
    pub fn push_front(&mut self, value: u32) {
        let mut s = self.root();
        while s != NIL {
            self.node_mut(s).size_left += 1;
            s = self.node(s).left;
        }
        let n = self.insert(0);
        self.node_mut(n).value = value;
    }

    pub fn pop_back(&mut self, len: u32) -> u32 {
        if len == 0 {
            return u32::MAX;
        }
        match self.find_node(len - 1) {
            Some(n) => {
                let idx = self.node(n).value;
                self.delete_node(n);
                idx
            }
            None => u32::MAX,
        }
    }

    pub fn push_back(&mut self, value: u32, len: u32) {
        let n = self.insert(len);
        self.node_mut(n).value = value;
    }

    pub fn keys(&self) -> Vec<u32> {
        self.iter().map(|(k, _)| k).collect()
    }

    pub fn iter(&self) -> SparseArrayIter<'_> {
        SparseArrayIter {
            array: self,
            cur: self.begin(),
        }
    }

    /// Checks the colouring rules, parent links and cached leftmost node.
    /// Returns the black height.
    pub fn validate(&self) -> Result<u32, String> {
        let root = self.root();
        if root != NIL {
            if self.node(root).color != Color::Black {
                return Err("red root".into());
            }
            let mut leftmost = root;
            while self.node(leftmost).left != NIL {
                leftmost = self.node(leftmost).left;
            }
            if self.most_left != leftmost {
                return Err("stale leftmost node".into());
            }
        }
        self.validate_subtree(root, HEADER)
    }

    fn validate_subtree(&self, n: NodeId, parent: NodeId) -> Result<u32, String> {
        if n == NIL {
            return Ok(1);
        }
        let node = self.node(n);
        if node.parent != parent {
            return Err(format!("node {} has a broken parent link", n));
        }
        if node.color == Color::Red
            && (self.color_of(node.left) == Color::Red || self.color_of(node.right) == Color::Red)
        {
            return Err(format!("red node {} has a red child", n));
        }
        let l = self.validate_subtree(node.left, n)?;
        let r = self.validate_subtree(node.right, n)?;
        if l != r {
            return Err(format!("black height mismatch under node {}", n));
        }
        Ok(l + if node.color == Color::Black { 1 } else { 0 })
    }
}

pub struct SparseArrayIter<'a> {
    array: &'a SparseArray,
    cur: NodeId,
}

impl<'a> Iterator for SparseArrayIter<'a> {
    type Item = (u32, u32);

    fn next(&mut self) -> Option<(u32, u32)> {
        if self.cur == HEADER {
            return None;
        }
        let n = self.cur;
        self.cur = self.array.next_node(n);
        Some((self.array.key(n), self.array.value(n)))
    }
}

impl fmt::Debug for SparseArray {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_map().entries(self.iter()).finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_insert_and_find() {
        let mut a = SparseArray::new();
        for (i, k) in [10u32, 3, 7, 1000, 0, 5].iter().enumerate() {
            let n = a.insert(*k);
            a.set_value(n, i as u32);
        }
        assert_eq!(a.keys(), vec![0, 3, 5, 7, 10, 1000]);
        assert_eq!(a.find_node(7).map(|n| a.value(n)), Some(2));
        assert_eq!(a.find_node(8), None);
        assert_eq!(a.n_entries(), 6);
        assert!(a.validate().is_ok());
    }

    #[test]
    fn test_bounds() {
        let mut a = SparseArray::new();
        for k in [2u32, 4, 8] {
            a.insert(k);
        }
        assert_eq!(a.key(a.lower_bound(4)), 4);
        assert_eq!(a.key(a.upper_bound(4)), 8);
        assert_eq!(a.key(a.lower_bound(5)), 8);
        assert_eq!(a.upper_bound(8), a.end());
        assert_eq!(a.key(a.lower_bound(0)), 2);
    }

    #[test]
    fn test_erase_keeps_other_keys() {
        let mut a = SparseArray::new();
        for k in 0..64u32 {
            let n = a.insert(k * 3);
            a.set_value(n, k);
        }
        for k in (0..64u32).filter(|k| k % 2 == 0) {
            let n = a.find_node(k * 3).unwrap();
            a.erase(n);
            assert!(a.validate().is_ok());
        }
        let expected: Vec<u32> = (0..64u32).filter(|k| k % 2 == 1).map(|k| k * 3).collect();
        assert_eq!(a.keys(), expected);
        for k in expected {
            assert_eq!(a.value(a.find_node(k).unwrap()), k / 3);
        }
    }

    #[test]
    fn test_push_and_pop_front_shift_keys() {
        let mut a = SparseArray::new();
        a.push_back(100, 0);
        a.push_back(101, 5);
        a.push_front(99);
        assert_eq!(a.keys(), vec![0, 1, 6]);
        assert_eq!(a.pop_front(), 99);
        assert_eq!(a.keys(), vec![0, 5]);
        assert_eq!(a.pop_back(6), 101);
        assert_eq!(a.pop_back(6), u32::MAX);
        assert_eq!(a.keys(), vec![0]);
    }

    #[test]
    fn test_previous_node_walks_backwards() {
        let mut a = SparseArray::new();
        for k in [1u32, 9, 4] {
            a.insert(k);
        }
        let last = a.previous_node(a.end());
        assert_eq!(a.key(last), 9);
        assert_eq!(a.key(a.previous_node(last)), 4);
        assert_eq!(a.previous_node(a.begin()), a.end());
    }
}
