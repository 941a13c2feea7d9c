//! Slab-backed doubly-linked list with stable tokens.
//!
//! The cache keeps several orderings over item hashes (LRU order, per-stage
//! processing order) where items must be removable from the middle and
//! movable to the back in O(1). Nodes live in a contiguous slab; a token is
//! an index plus a generation counter, so a token held across the removal and
//! reuse of its slot is detected as stale instead of silently aliasing a new
//! node.

const NIL: u32 = u32::MAX;

/// Handle to a node in an [`OrderList`]. Stays valid until that node is
/// removed; `move_to_back` does not invalidate it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct OrderToken {
    index: u32,
    generation: u32,
}

#[derive(Debug)]
struct Node {
    value: u64,
    prev: u32,
    next: u32,
    generation: u32,
    occupied: bool,
}

/// Ordered list of `u64` values (cache item hashes) with O(1) middle removal.
#[derive(Debug)]
pub struct OrderList {
    nodes: Vec<Node>,
    head: u32,
    tail: u32,
    free: Vec<u32>,
    len: usize,
}

impl Default for OrderList {
    fn default() -> Self {
        Self::new()
    }
}

impl OrderList {
    pub fn new() -> Self {
        Self {
            nodes: Vec::new(),
            head: NIL,
            tail: NIL,
            free: Vec::new(),
            len: 0,
        }
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    fn alloc(&mut self, value: u64) -> u32 {
        if let Some(index) = self.free.pop() {
            let node = &mut self.nodes[index as usize];
            node.value = value;
            node.prev = NIL;
            node.next = NIL;
            node.occupied = true;
            index
        } else {
            self.nodes.push(Node {
                value,
                prev: NIL,
                next: NIL,
                generation: 0,
                occupied: true,
            });
            (self.nodes.len() - 1) as u32
        }
    }

    fn live_index(&self, token: OrderToken) -> Option<usize> {
        let index = token.index as usize;
        let node = self.nodes.get(index)?;
        if node.occupied && node.generation == token.generation {
            Some(index)
        } else {
            None
        }
    }

    /// Appends `value` and returns its token.
    pub fn push_back(&mut self, value: u64) -> OrderToken {
        let index = self.alloc(value);
        self.nodes[index as usize].prev = self.tail;
        if self.tail != NIL {
            self.nodes[self.tail as usize].next = index;
        } else {
            self.head = index;
        }
        self.tail = index;
        self.len += 1;
        OrderToken {
            index,
            generation: self.nodes[index as usize].generation,
        }
    }

    /// Inserts `value` immediately before the node `before` points at.
    /// Falls back to `push_back` if the token is stale.
    pub fn insert_before(&mut self, before: OrderToken, value: u64) -> OrderToken {
        let Some(at) = self.live_index(before) else {
            debug_assert!(false, "insert_before on a stale token");
            return self.push_back(value);
        };
        let index = self.alloc(value);
        let prev = self.nodes[at].prev;
        self.nodes[index as usize].prev = prev;
        self.nodes[index as usize].next = at as u32;
        self.nodes[at].prev = index;
        if prev != NIL {
            self.nodes[prev as usize].next = index;
        } else {
            self.head = index;
        }
        self.len += 1;
        OrderToken {
            index,
            generation: self.nodes[index as usize].generation,
        }
    }

    fn unlink(&mut self, index: usize) {
        let (prev, next) = (self.nodes[index].prev, self.nodes[index].next);
        if prev != NIL {
            self.nodes[prev as usize].next = next;
        } else {
            self.head = next;
        }
        if next != NIL {
            self.nodes[next as usize].prev = prev;
        } else {
            self.tail = prev;
        }
        self.nodes[index].prev = NIL;
        self.nodes[index].next = NIL;
    }

    /// Removes the node the token points at and returns its value.
    /// Returns `None` for a stale token.
    pub fn remove(&mut self, token: OrderToken) -> Option<u64> {
        let index = self.live_index(token)?;
        self.unlink(index);
        let node = &mut self.nodes[index];
        node.occupied = false;
        node.generation = node.generation.wrapping_add(1);
        self.free.push(index as u32);
        self.len -= 1;
        Some(node.value)
    }

    /// Removes and returns the front value.
    pub fn pop_front(&mut self) -> Option<u64> {
        let token = self.front_token()?;
        self.remove(token)
    }

    /// Moves the node to the back of the list. The token stays valid.
    pub fn move_to_back(&mut self, token: OrderToken) {
        let Some(index) = self.live_index(token) else {
            debug_assert!(false, "move_to_back on a stale token");
            return;
        };
        if self.tail == index as u32 {
            return;
        }
        self.unlink(index);
        self.nodes[index].prev = self.tail;
        if self.tail != NIL {
            self.nodes[self.tail as usize].next = index as u32;
        } else {
            self.head = index as u32;
        }
        self.tail = index as u32;
    }

    pub fn front_token(&self) -> Option<OrderToken> {
        if self.head == NIL {
            return None;
        }
        Some(OrderToken {
            index: self.head,
            generation: self.nodes[self.head as usize].generation,
        })
    }

    /// Token of the node after this one, or `None` at the back or for a
    /// stale token.
    pub fn next_token(&self, token: OrderToken) -> Option<OrderToken> {
        let index = self.live_index(token)?;
        let next = self.nodes[index].next;
        if next == NIL {
            return None;
        }
        Some(OrderToken {
            index: next,
            generation: self.nodes[next as usize].generation,
        })
    }

    /// Value at the token, or `None` if stale.
    pub fn value(&self, token: OrderToken) -> Option<u64> {
        self.live_index(token).map(|i| self.nodes[i].value)
    }

    pub fn iter(&self) -> Iter<'_> {
        Iter {
            list: self,
            cursor: self.head,
        }
    }

    /// Empties the list. Slots are kept with their generations bumped, so
    /// tokens issued before the clear stay detectably stale even after their
    /// slots are reused.
    pub fn clear(&mut self) {
        for node in &mut self.nodes {
            if node.occupied {
                node.occupied = false;
                node.generation = node.generation.wrapping_add(1);
            }
            node.prev = NIL;
            node.next = NIL;
        }
        self.free.clear();
        self.free.extend((0..self.nodes.len() as u32).rev());
        self.head = NIL;
        self.tail = NIL;
        self.len = 0;
    }
}

pub struct Iter<'a> {
    list: &'a OrderList,
    cursor: u32,
}

impl Iterator for Iter<'_> {
    type Item = u64;

    fn next(&mut self) -> Option<u64> {
        if self.cursor == NIL {
            return None;
        }
        let node = &self.list.nodes[self.cursor as usize];
        self.cursor = node.next;
        Some(node.value)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn collect(list: &OrderList) -> Vec<u64> {
        list.iter().collect()
    }

    #[test]
    fn push_back_preserves_order() {
        let mut list = OrderList::new();
        list.push_back(1);
        list.push_back(2);
        list.push_back(3);
        assert_eq!(collect(&list), vec![1, 2, 3]);
        assert_eq!(list.len(), 3);
    }

    #[test]
    fn remove_from_middle() {
        let mut list = OrderList::new();
        let _a = list.push_back(1);
        let b = list.push_back(2);
        let _c = list.push_back(3);
        assert_eq!(list.remove(b), Some(2));
        assert_eq!(collect(&list), vec![1, 3]);
        assert_eq!(list.len(), 2);
    }

    #[test]
    fn stale_token_after_slot_reuse_is_rejected() {
        let mut list = OrderList::new();
        let a = list.push_back(1);
        assert_eq!(list.remove(a), Some(1));
        // Reuses the freed slot.
        let b = list.push_back(2);
        assert_eq!(list.remove(a), None);
        assert_eq!(list.value(b), Some(2));
    }

    #[test]
    fn move_to_back_keeps_token_valid() {
        let mut list = OrderList::new();
        let a = list.push_back(1);
        list.push_back(2);
        list.push_back(3);
        list.move_to_back(a);
        assert_eq!(collect(&list), vec![2, 3, 1]);
        assert_eq!(list.value(a), Some(1));
        // Already at the back, no-op.
        list.move_to_back(a);
        assert_eq!(collect(&list), vec![2, 3, 1]);
    }

    #[test]
    fn insert_before_head_and_middle() {
        let mut list = OrderList::new();
        let a = list.push_back(10);
        let c = list.push_back(30);
        list.insert_before(c, 20);
        list.insert_before(a, 5);
        assert_eq!(collect(&list), vec![5, 10, 20, 30]);
    }

    #[test]
    fn cursor_walk_with_next_token() {
        let mut list = OrderList::new();
        list.push_back(1);
        list.push_back(2);
        list.push_back(3);
        let mut values = Vec::new();
        let mut cursor = list.front_token();
        while let Some(token) = cursor {
            let next = list.next_token(token);
            values.push(list.value(token).expect("live token"));
            // Removing the current node must not disturb the walk.
            if values.last() == Some(&2) {
                list.remove(token);
            }
            cursor = next;
        }
        assert_eq!(values, vec![1, 2, 3]);
        assert_eq!(collect(&list), vec![1, 3]);
    }

    #[test]
    fn pop_front_drains_in_order() {
        let mut list = OrderList::new();
        list.push_back(7);
        list.push_back(8);
        assert_eq!(list.pop_front(), Some(7));
        assert_eq!(list.pop_front(), Some(8));
        assert_eq!(list.pop_front(), None);
        assert!(list.is_empty());
    }

    #[test]
    fn clear_resets_everything() {
        let mut list = OrderList::new();
        let a = list.push_back(1);
        list.clear();
        assert!(list.is_empty());
        assert_eq!(list.value(a), None);
        list.push_back(9);
        assert_eq!(collect(&list), vec![9]);
    }

    #[test]
    fn tokens_issued_before_clear_stay_stale_after_slot_reuse() {
        let mut list = OrderList::new();
        let a = list.push_back(1);
        list.clear();
        // Reuses the same slot the pre-clear token points at.
        let b = list.push_back(2);
        assert_eq!(list.value(a), None);
        assert_eq!(list.remove(a), None);
        assert_eq!(list.value(b), Some(2));
        assert_eq!(collect(&list), vec![2]);
    }

    #[test]
    fn randomized_against_vec_model() {
        use rand::rngs::StdRng;
        use rand::{Rng, SeedableRng};

        let mut rng = StdRng::seed_from_u64(0x5eed);
        let mut list = OrderList::new();
        let mut model: Vec<u64> = Vec::new();
        let mut tokens: Vec<(OrderToken, u64)> = Vec::new();

        for i in 0..1000u64 {
            match rng.gen_range(0..4) {
                0 => {
                    let token = list.push_back(i);
                    model.push(i);
                    tokens.push((token, i));
                }
                1 if !tokens.is_empty() => {
                    let at = rng.gen_range(0..tokens.len());
                    let (token, value) = tokens.swap_remove(at);
                    assert_eq!(list.remove(token), Some(value));
                    let pos = model.iter().position(|&v| v == value).expect("in model");
                    model.remove(pos);
                }
                2 if !tokens.is_empty() => {
                    let at = rng.gen_range(0..tokens.len());
                    let (token, value) = tokens[at];
                    list.move_to_back(token);
                    let pos = model.iter().position(|&v| v == value).expect("in model");
                    model.remove(pos);
                    model.push(value);
                }
                _ => {}
            }
            assert_eq!(list.len(), model.len());
        }
        assert_eq!(collect(&list), model);
    }
}
