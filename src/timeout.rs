use std::cmp::Ordering;
use std::collections::BinaryHeap;
use std::time::Instant;

use crate::conn::ConnId;


/// A weak, generation-checked reference to a node in a [`TimerQueue`].
///
/// A [`Connection`](crate::Connection) holds at most one of these. The handle
/// does not keep the node alive: once the queue harvests the node, the handle
/// goes stale and every operation on it becomes a no-op.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct TimerHandle {
    slot: u32,
    generation: u32,
}


#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct HeapEntry {
    deadline: Instant,
    slot: u32,
    generation: u32,
}

impl Ord for HeapEntry {
    fn cmp(&self, other: &Self) -> Ordering {
        // Reversed for a min-heap: earliest deadline first, then oldest slot
        other.deadline.cmp(&self.deadline)
            .then_with(|| other.slot.cmp(&self.slot))
            .then_with(|| other.generation.cmp(&self.generation))
    }
}

impl PartialOrd for HeapEntry {
    #[inline]
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}


#[derive(Debug, Clone, Copy)]
struct Node {
    deadline: Instant,
    data: Option<ConnId>,
}

#[derive(Debug, Clone, Default)]
struct Slot {
    generation: u32,
    node: Option<Node>,
}


/// A deadline-ordered queue of idle-timeout nodes.
///
/// Each node carries an optional [`ConnId`] payload. Connections never remove
/// their node; closing a connection only clears the payload via
/// `TimerQueue::clear_data`. The node itself stays queued until its deadline
/// passes and `TimerQueue::expire` harvests it, at which point a cleared
/// payload tells the scheduler there is nothing left to time out.
#[derive(Debug, Default)]
pub struct TimerQueue {
    heap: BinaryHeap<HeapEntry>,
    slots: Vec<Slot>,
    free: Vec<u32>,
}

impl TimerQueue {
    /// Creates an empty [`TimerQueue`].
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns the number of queued nodes, including cleared ones.
    #[inline]
    #[must_use]
    pub fn len(&self) -> usize {
        self.heap.len()
    }

    /// Tests whether no nodes are queued.
    #[inline]
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.heap.is_empty()
    }

    /// Queues a node for `conn` which expires at `deadline`.
    ///
    /// # Panics
    /// Panics if more than `u32::MAX` nodes are queued at once.
    pub fn insert(&mut self, deadline: Instant, conn: ConnId) -> TimerHandle {
        let slot = match self.free.pop() {
            Some(s) => s,
            None => {
                self.slots.push(Slot::default());
                u32::try_from(self.slots.len() - 1).expect("timer queue exceeds u32::MAX nodes")
            },
        };
        let entry = &mut self.slots[slot as usize];
        debug_assert!(entry.node.is_none(), "free list contains an occupied slot");
        entry.node = Some(Node { deadline, data: Some(conn) });

        let generation = entry.generation;
        self.heap.push(HeapEntry { deadline, slot, generation });
        crate::macros::trace!(?conn, slot, generation, "timeout node queued");
        TimerHandle { slot, generation }
    }

    #[inline]
    fn node(&self, handle: TimerHandle) -> Option<&Node> {
        let slot = self.slots.get(handle.slot as usize)?;
        if slot.generation != handle.generation {
            return None;
        }
        slot.node.as_ref()
    }

    /// Tests whether the node behind `handle` is still queued.
    #[inline]
    #[must_use]
    pub fn contains(&self, handle: TimerHandle) -> bool {
        self.node(handle).is_some()
    }

    /// Returns the payload of the node behind `handle`.
    ///
    /// [`None`] means the payload was cleared or the node was harvested.
    #[inline]
    #[must_use]
    pub fn data(&self, handle: TimerHandle) -> Option<ConnId> {
        self.node(handle)?.data
    }

    /// Returns the deadline of the node behind `handle`, if still queued.
    #[inline]
    #[must_use]
    pub fn deadline(&self, handle: TimerHandle) -> Option<Instant> {
        self.node(handle).map(|n| n.deadline)
    }

    /// Clears the payload of the node behind `handle`, leaving the node queued.
    ///
    /// Returns `false` if the handle is stale, i.e. the node was already
    /// harvested. Nothing is modified in that case.
    pub fn clear_data(&mut self, handle: TimerHandle) -> bool {
        let Some(slot) = self.slots.get_mut(handle.slot as usize) else { return false; };
        match &mut slot.node {
            Some(node) if slot.generation == handle.generation => {
                node.data = None;
                true
            },
            _ => false,
        }
    }

    /// Returns the earliest deadline of any queued node.
    #[inline]
    #[must_use]
    pub fn next_deadline(&self) -> Option<Instant> {
        self.heap.peek().map(|e| e.deadline)
    }

    /// Harvests every node whose deadline is at or before `now`.
    ///
    /// Returns the payloads of harvested nodes in deadline order, skipping
    /// cleared ones. Handles to harvested nodes become stale.
    pub fn expire(&mut self, now: Instant) -> Vec<ConnId> {
        let mut expired = Vec::new();
        while let Some(&entry) = self.heap.peek() {
            if entry.deadline > now {
                break;
            }
            self.heap.pop();

            let slot = &mut self.slots[entry.slot as usize];
            debug_assert_eq!(slot.generation, entry.generation, "heap entry outlived its node");
            let node = slot.node.take();
            slot.generation = slot.generation.wrapping_add(1);
            self.free.push(entry.slot);

            match node.and_then(|n| n.data) {
                Some(conn) => expired.push(conn),
                None => {
                    crate::macros::trace!(slot = entry.slot, "cleared timeout node harvested");
                },
            }
        }
        expired
    }
}
