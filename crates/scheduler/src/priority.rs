//! Priority lanes for ready tasks
//!
//! Each priority level owns a FIFO [`PriorityLane`]. [`Lanes`] maps priority
//! values to lanes, creating them lazily, and answers the one question the
//! run loop asks on every dispatch decision: which non-empty lane is the
//! most urgent? Higher numeric values are more urgent.

use crate::task::TaskId;
use std::collections::{BTreeMap, VecDeque};

/// FIFO holding area for tasks ready to run at one priority level.
///
/// No duplicate detection is done here; the task lifecycle guarantees a task
/// sits in at most one lane at a time.
#[derive(Debug, Clone, Default)]
pub struct PriorityLane {
    queue: VecDeque<TaskId>,
}

impl PriorityLane {
    /// Create an empty lane
    pub fn new() -> Self {
        Self::default()
    }

    /// Append a task at the tail
    pub fn enqueue(&mut self, id: TaskId) {
        self.queue.push_back(id);
    }

    /// Put a task back at the head.
    ///
    /// Only used when a task that already held the scheduler's current slot
    /// is displaced by more urgent work and must keep its place in line.
    pub fn enqueue_front(&mut self, id: TaskId) {
        self.queue.push_front(id);
    }

    /// Remove and return the head of the lane
    pub fn dequeue_front(&mut self) -> Option<TaskId> {
        self.queue.pop_front()
    }

    /// Remove a specific task, wherever it sits.
    ///
    /// Returns `true` if the task was present.
    pub fn remove(&mut self, id: TaskId) -> bool {
        match self.queue.iter().position(|queued| *queued == id) {
            Some(index) => {
                self.queue.remove(index);
                true
            }
            None => false,
        }
    }

    /// Number of queued tasks
    pub fn len(&self) -> usize {
        self.queue.len()
    }

    /// Check if the lane is empty
    pub fn is_empty(&self) -> bool {
        self.queue.is_empty()
    }

    /// Queued tasks in dispatch order
    pub fn iter(&self) -> impl Iterator<Item = TaskId> + '_ {
        self.queue.iter().copied()
    }
}

/// All priority lanes of one scheduler.
#[derive(Debug, Clone, Default)]
pub struct Lanes {
    lanes: BTreeMap<u32, PriorityLane>,
}

impl Lanes {
    /// Create an empty lane set
    pub fn new() -> Self {
        Self::default()
    }

    /// Append a task to the tail of the lane for `priority`
    pub fn enqueue(&mut self, priority: u32, id: TaskId) {
        self.lanes.entry(priority).or_default().enqueue(id);
    }

    /// Put a task at the head of the lane for `priority`
    pub fn enqueue_front(&mut self, priority: u32, id: TaskId) {
        self.lanes.entry(priority).or_default().enqueue_front(id);
    }

    /// The greatest priority whose lane is non-empty
    pub fn peek_highest_non_empty(&self) -> Option<u32> {
        self.lanes
            .iter()
            .rev()
            .find(|(_, lane)| !lane.is_empty())
            .map(|(priority, _)| *priority)
    }

    /// Remove and return the head of the most urgent non-empty lane
    pub fn dequeue_highest(&mut self) -> Option<(u32, TaskId)> {
        let priority = self.peek_highest_non_empty()?;
        let id = self.lanes.get_mut(&priority)?.dequeue_front()?;
        Some((priority, id))
    }

    /// Remove a task from the lane for `priority`.
    ///
    /// Returns `true` if the task was queued there.
    pub fn remove(&mut self, priority: u32, id: TaskId) -> bool {
        self.lanes
            .get_mut(&priority)
            .is_some_and(|lane| lane.remove(id))
    }

    /// Total number of queued tasks across all lanes
    pub fn len(&self) -> usize {
        self.lanes.values().map(PriorityLane::len).sum()
    }

    /// Check if every lane is empty
    pub fn is_empty(&self) -> bool {
        self.lanes.values().all(PriorityLane::is_empty)
    }

    /// Queued tasks in dispatch order (most urgent lane first, FIFO within)
    pub fn dispatch_order(&self) -> Vec<TaskId> {
        self.lanes
            .values()
            .rev()
            .flat_map(PriorityLane::iter)
            .collect()
    }
}
