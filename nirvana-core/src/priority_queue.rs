// Copyright 2025-Present the Nirvana project contributors.
// SPDX-License-Identifier: Apache-2.0

//! Deadline-ordered priority queue, Fibonacci-heap based.
//!
//! Amortized O(1) insert and decrease, O(log N) extract-min, arbitrary
//! removal for cancellation. Nodes live in an index arena; handles carry a
//! generation so a stale handle can never touch a recycled slot.

use crate::deadline::Deadline;

const RANK_LIMIT: usize = usize::BITS as usize;

/// Stable reference to a queued item.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub struct ItemHandle {
    idx: usize,
    gen: u64,
}

struct Node<T> {
    deadline: Deadline,
    value: Option<T>,
    left: usize,
    right: usize,
    parent: Option<usize>,
    child: Option<usize>,
    rank: usize,
    mark: bool,
    gen: u64,
    live: bool,
}

pub struct PriorityQueue<T> {
    nodes: Vec<Node<T>>,
    free: Vec<usize>,
    /// Minimum root; entry point of the circular root list.
    first: Option<usize>,
    len: usize,
}

impl<T> Default for PriorityQueue<T> {
    fn default() -> Self {
        PriorityQueue::new()
    }
}

impl<T> PriorityQueue<T> {
    pub fn new() -> PriorityQueue<T> {
        PriorityQueue {
            nodes: Vec::new(),
            free: Vec::new(),
            first: None,
            len: 0,
        }
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    pub fn peek(&self) -> Option<(Deadline, &T)> {
        let idx = self.first?;
        let n = &self.nodes[idx];
        Some((n.deadline, n.value.as_ref()?))
    }

    pub fn insert(&mut self, deadline: Deadline, value: T) -> ItemHandle {
        let idx = self.alloc(deadline, value);
        self.splice_root(idx);
        if let Some(first) = self.first {
            if self.nodes[idx].deadline < self.nodes[first].deadline {
                self.first = Some(idx);
            }
        } else {
            self.first = Some(idx);
        }
        self.len += 1;
        ItemHandle {
            idx,
            gen: self.nodes[idx].gen,
        }
    }

    /// Extracts the earliest-deadline item, consolidating roots by rank.
    pub fn remove_first(&mut self) -> Option<(Deadline, T)> {
        let min = self.first?;

        // Promote the children to roots.
        if let Some(child0) = self.nodes[min].child {
            let mut c = child0;
            loop {
                self.nodes[c].parent = None;
                self.nodes[c].mark = false;
                c = self.nodes[c].right;
                if c == child0 {
                    break;
                }
            }
            // Splice the child ring in after `min`.
            let sib = self.nodes[min].right;
            let cl = self.nodes[child0].left;
            self.nodes[cl].right = sib;
            self.nodes[min].right = child0;
            self.nodes[sib].left = cl;
            self.nodes[child0].left = min;
            self.nodes[min].child = None;
            self.nodes[min].rank = 0;
        } else if self.nodes[min].right == min {
            // Sole root, no children.
            self.first = None;
            self.len -= 1;
            return Some(self.dealloc(min));
        }

        // Pairwise-merge equal ranks over the remaining roots.
        let mut rank_array: [Option<usize>; RANK_LIMIT] = [None; RANK_LIMIT];
        let mut lauf = self.nodes[min].right;
        let mut new_first = lauf;
        while lauf != min {
            let mut r1 = lauf;
            let mut rank = self.nodes[r1].rank;
            lauf = self.nodes[lauf].right;
            while let Some(r2) = rank_array[rank] {
                rank_array[rank] = None;
                if self.nodes[r1].deadline <= self.nodes[r2].deadline {
                    self.link(r1, r2);
                } else {
                    self.link(r2, r1);
                    r1 = r2;
                }
                rank += 1;
            }
            debug_assert!(self.nodes[r1].parent.is_none());
            rank_array[rank] = Some(r1);
            if self.nodes[r1].deadline <= self.nodes[new_first].deadline {
                new_first = r1;
            }
        }

        // Unlink the minimum from the root list.
        let (l, r) = (self.nodes[min].left, self.nodes[min].right);
        self.nodes[l].right = r;
        self.nodes[r].left = l;
        self.first = Some(new_first);
        self.len -= 1;
        Some(self.dealloc(min))
    }

    /// Re-keys an item to an earlier deadline.
    pub fn decrease(&mut self, handle: ItemHandle, deadline: Deadline) -> bool {
        if !self.is_live(handle) || deadline >= self.nodes[handle.idx].deadline {
            return false;
        }
        let idx = handle.idx;
        self.nodes[idx].deadline = deadline;

        if let Some(parent) = self.nodes[idx].parent {
            if deadline < self.nodes[parent].deadline {
                self.cut(idx);
                // Cascading cuts along marked ancestors.
                let mut p = parent;
                while self.nodes[p].mark {
                    match self.nodes[p].parent {
                        Some(gp) => {
                            self.cut(p);
                            p = gp;
                        }
                        None => break,
                    }
                }
                self.nodes[p].mark = true;
            }
        }
        if let Some(first) = self.first {
            if deadline < self.nodes[first].deadline {
                self.first = Some(idx);
            }
        }
        true
    }

    /// Removes an arbitrary item (cancellation).
    pub fn remove(&mut self, handle: ItemHandle) -> Option<(Deadline, T)> {
        if !self.is_live(handle) {
            return None;
        }
        let idx = handle.idx;
        if self.first == Some(idx) {
            return self.remove_first();
        }
        if let Some(parent) = self.nodes[idx].parent {
            self.cut(idx);
            let mut p = parent;
            while self.nodes[p].mark {
                match self.nodes[p].parent {
                    Some(gp) => {
                        self.cut(p);
                        p = gp;
                    }
                    None => break,
                }
            }
            self.nodes[p].mark = true;
        }
        // A root now; take it out of the root list.
        let (l, r) = (self.nodes[idx].left, self.nodes[idx].right);
        self.nodes[l].right = r;
        self.nodes[r].left = l;

        // Its children become roots. Their deadlines are no smaller than
        // the removed item's, so the minimum does not move.
        if let Some(child0) = self.nodes[idx].child {
            let mut c = child0;
            loop {
                self.nodes[c].parent = None;
                self.nodes[c].mark = false;
                c = self.nodes[c].right;
                if c == child0 {
                    break;
                }
            }
            // The removed node is already out; splice next to `first`.
            let first = self.first.unwrap_or_else(|| unreachable!());
            let fr = self.nodes[first].right;
            let cl = self.nodes[child0].left;
            self.nodes[first].right = child0;
            self.nodes[child0].left = first;
            self.nodes[cl].right = fr;
            self.nodes[fr].left = cl;
            self.nodes[idx].child = None;
        }
        self.len -= 1;
        Some(self.dealloc(idx))
    }

    pub fn deadline_of(&self, handle: ItemHandle) -> Option<Deadline> {
        self.is_live(handle).then(|| self.nodes[handle.idx].deadline)
    }

    fn is_live(&self, handle: ItemHandle) -> bool {
        self.nodes
            .get(handle.idx)
            .is_some_and(|n| n.live && n.gen == handle.gen)
    }

    /// Makes `child` a child of `parent`; both were roots.
    fn link(&mut self, parent: usize, child: usize) {
        let (l, r) = (self.nodes[child].left, self.nodes[child].right);
        self.nodes[l].right = r;
        self.nodes[r].left = l;

        match self.nodes[parent].child {
            Some(c0) => {
                let cr = self.nodes[c0].right;
                self.nodes[child].left = c0;
                self.nodes[child].right = cr;
                self.nodes[cr].left = child;
                self.nodes[c0].right = child;
            }
            None => {
                self.nodes[parent].child = Some(child);
                self.nodes[child].left = child;
                self.nodes[child].right = child;
            }
        }
        self.nodes[child].parent = Some(parent);
        self.nodes[child].mark = false;
        self.nodes[parent].rank += 1;
    }

    /// Detaches `idx` from its parent and reinserts it as a root.
    fn cut(&mut self, idx: usize) {
        let parent = match self.nodes[idx].parent {
            Some(p) => p,
            None => return,
        };
        debug_assert!(self.nodes[parent].rank >= 1);
        if self.nodes[parent].rank == 1 {
            self.nodes[parent].child = None;
        } else {
            if self.nodes[parent].child == Some(idx) {
                self.nodes[parent].child = Some(self.nodes[idx].right);
            }
            let (l, r) = (self.nodes[idx].left, self.nodes[idx].right);
            self.nodes[l].right = r;
            self.nodes[r].left = l;
        }
        self.nodes[parent].rank -= 1;
        self.nodes[idx].parent = None;
        self.nodes[idx].mark = false;
        self.splice_root(idx);
    }

    /// Inserts `idx` into the root ring next to `first` (or as the sole
    /// root). Does not update the minimum.
    fn splice_root(&mut self, idx: usize) {
        match self.first {
            Some(first) => {
                let fr = self.nodes[first].right;
                self.nodes[idx].left = first;
                self.nodes[idx].right = fr;
                self.nodes[fr].left = idx;
                self.nodes[first].right = idx;
            }
            None => {
                self.nodes[idx].left = idx;
                self.nodes[idx].right = idx;
            }
        }
    }

    fn alloc(&mut self, deadline: Deadline, value: T) -> usize {
        match self.free.pop() {
            Some(idx) => {
                let n = &mut self.nodes[idx];
                n.deadline = deadline;
                n.value = Some(value);
                n.parent = None;
                n.child = None;
                n.rank = 0;
                n.mark = false;
                n.live = true;
                idx
            }
            None => {
                self.nodes.push(Node {
                    deadline,
                    value: Some(value),
                    left: 0,
                    right: 0,
                    parent: None,
                    child: None,
                    rank: 0,
                    mark: false,
                    gen: 0,
                    live: true,
                });
                self.nodes.len() - 1
            }
        }
    }

    fn dealloc(&mut self, idx: usize) -> (Deadline, T) {
        let n = &mut self.nodes[idx];
        debug_assert!(n.live);
        n.live = false;
        n.gen += 1;
        let value = n.value.take().unwrap_or_else(|| unreachable!());
        let deadline = n.deadline;
        self.free.push(idx);
        (deadline, value)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::prelude::*;

    fn d(v: u64) -> Deadline {
        Deadline::from_raw(v)
    }

    #[test]
    fn pops_in_deadline_order() {
        let mut q = PriorityQueue::new();
        for v in [100u64, 10, 50, 70, 30] {
            q.insert(d(v), v);
        }
        let mut out = Vec::new();
        while let Some((_, v)) = q.remove_first() {
            out.push(v);
        }
        assert_eq!(out, vec![10, 30, 50, 70, 100]);
        assert!(q.is_empty());
    }

    #[test]
    fn decrease_moves_an_item_forward() {
        let mut q = PriorityQueue::new();
        q.insert(d(10), "a");
        let h = q.insert(d(100), "b");
        q.insert(d(50), "c");
        // Force some structure so the decrease has a parent to cut from.
        q.insert(d(5), "head");
        assert_eq!(q.remove_first().unwrap().1, "head");

        assert!(q.decrease(h, d(1)));
        assert_eq!(q.remove_first().unwrap().1, "b");
        assert_eq!(q.remove_first().unwrap().1, "a");
        assert_eq!(q.remove_first().unwrap().1, "c");
    }

    #[test]
    fn decrease_rejects_stale_handles_and_later_deadlines() {
        let mut q = PriorityQueue::new();
        let h = q.insert(d(10), ());
        assert!(!q.decrease(h, d(20)));
        q.remove_first().unwrap();
        assert!(!q.decrease(h, d(1)));
        let h2 = q.insert(d(30), ());
        // The slot was recycled; the old handle must stay dead.
        assert!(!q.decrease(h, d(1)));
        assert!(q.decrease(h2, d(2)));
    }

    #[test]
    fn remove_cancels_a_waiter() {
        let mut q = PriorityQueue::new();
        q.insert(d(10), 10u64);
        let h = q.insert(d(20), 20);
        q.insert(d(30), 30);
        assert_eq!(q.remove(h).unwrap().1, 20);
        assert_eq!(q.remove(h), None);
        let mut out = Vec::new();
        while let Some((_, v)) = q.remove_first() {
            out.push(v);
        }
        assert_eq!(out, vec![10, 30]);
    }

    #[test]
    fn randomized_against_a_sorted_model() {
        let mut rng = StdRng::seed_from_u64(0x71756575);
        let mut q = PriorityQueue::new();
        let mut model: Vec<(u64, u64)> = Vec::new(); // (deadline, id)
        let mut handles: Vec<(u64, ItemHandle)> = Vec::new();
        let mut next_deadline = 0u64;
        let mut next_id = 0u64;

        for _ in 0..5000 {
            match rng.gen_range(0..10) {
                0..=4 => {
                    // Unique deadlines make the model's order total.
                    next_deadline += rng.gen_range(1..10);
                    let id = next_id;
                    next_id += 1;
                    let h = q.insert(d(next_deadline), id);
                    model.push((next_deadline, id));
                    handles.push((id, h));
                }
                5..=7 => {
                    let got = q.remove_first();
                    if model.is_empty() {
                        assert!(got.is_none());
                    } else {
                        let min = *model
                            .iter()
                            .min_by_key(|(dl, _)| *dl)
                            .unwrap();
                        model.retain(|e| *e != min);
                        let (dl, id) = got.unwrap();
                        assert_eq!((dl.raw(), id), min);
                        handles.retain(|(hid, _)| *hid != id);
                    }
                }
                8 => {
                    if !handles.is_empty() {
                        let i = rng.gen_range(0..handles.len());
                        let (id, h) = handles.swap_remove(i);
                        let got = q.remove(h).unwrap();
                        assert_eq!(got.1, id);
                        model.retain(|(_, mid)| *mid != id);
                    }
                }
                _ => {
                    if !handles.is_empty() {
                        let i = rng.gen_range(0..handles.len());
                        let (id, h) = handles[i];
                        let cur = q.deadline_of(h).unwrap().raw();
                        if cur > 1 {
                            let nd = rng.gen_range(0..cur);
                            // Keep deadlines unique so the model's order
                            // stays total.
                            if model.iter().any(|(dl, _)| *dl == nd) {
                                continue;
                            }
                            if q.decrease(h, d(nd)) {
                                for e in model.iter_mut() {
                                    if e.1 == id {
                                        e.0 = nd;
                                    }
                                }
                            }
                        }
                    }
                }
            }
            assert_eq!(q.len(), model.len());
        }

        model.sort();
        for (dl, id) in model {
            let (got_dl, got_id) = q.remove_first().unwrap();
            assert_eq!((got_dl.raw(), got_id), (dl, id));
        }
        assert!(q.is_empty());
    }
}
