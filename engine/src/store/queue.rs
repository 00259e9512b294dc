//! Fixed-capacity per-conversation message queues.

use std::collections::HashMap;

/// Which end of the queue gives way when capacity is exceeded.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum TrimDirection {
    /// Keep the head, drop overflow from the tail.
    LeftToRight,
    /// Keep the tail, drop overflow from the head (oldest first).
    #[default]
    RightToLeft,
}

/// Insertion-ordered sequence bounded to `capacity` items.
///
/// The queue never sorts; callers hand it data in the order it should keep.
#[derive(Debug, Clone)]
pub struct BoundedQueue<T> {
    items: Vec<T>,
    capacity: usize,
    direction: TrimDirection,
}

impl<T> BoundedQueue<T> {
    pub fn new(capacity: usize, direction: TrimDirection) -> Self {
        Self {
            items: Vec::new(),
            capacity,
            direction,
        }
    }

    /// Replace the contents, trimming unless `no_limit` is set. Returns the
    /// items trimmed away.
    pub fn set(&mut self, items: Vec<T>, no_limit: bool) -> Vec<T> {
        self.items = items;
        self.trim(no_limit)
    }

    pub fn push(&mut self, item: T, no_limit: bool) -> Vec<T> {
        self.items.push(item);
        self.trim(no_limit)
    }

    pub fn unshift(&mut self, item: T, no_limit: bool) -> Vec<T> {
        self.items.insert(0, item);
        self.trim(no_limit)
    }

    pub fn pop(&mut self) -> Option<T> {
        self.items.pop()
    }

    pub fn shift(&mut self) -> Option<T> {
        if self.items.is_empty() {
            None
        } else {
            Some(self.items.remove(0))
        }
    }

    /// Live view of the stored items.
    pub fn get(&self) -> &[T] {
        &self.items
    }

    pub fn get_mut(&mut self) -> &mut Vec<T> {
        &mut self.items
    }

    /// Re-apply the capacity bound to the current contents.
    pub fn reset_limit_state(&mut self) -> Vec<T> {
        self.trim(false)
    }

    pub fn clear(&mut self) {
        self.items.clear();
    }

    pub fn len(&self) -> usize {
        self.items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    /// Drain everything, returning the removed items.
    pub fn take(&mut self) -> Vec<T> {
        std::mem::take(&mut self.items)
    }

    fn trim(&mut self, no_limit: bool) -> Vec<T> {
        if no_limit || self.items.len() <= self.capacity {
            return Vec::new();
        }
        let overflow = self.items.len() - self.capacity;
        match self.direction {
            TrimDirection::LeftToRight => self.items.split_off(self.capacity),
            TrimDirection::RightToLeft => self.items.drain(..overflow).collect(),
        }
    }
}

/// Conversation id to queue, every queue sharing one capacity and direction.
#[derive(Debug, Clone)]
pub struct QueueMap<T> {
    queues: HashMap<String, BoundedQueue<T>>,
    capacity: usize,
    direction: TrimDirection,
}

impl<T> QueueMap<T> {
    pub fn new(capacity: usize, direction: TrimDirection) -> Self {
        Self {
            queues: HashMap::new(),
            capacity,
            direction,
        }
    }

    pub fn get(&self, conversation_id: &str) -> Option<&[T]> {
        self.queues.get(conversation_id).map(BoundedQueue::get)
    }

    pub fn get_mut(&mut self, conversation_id: &str) -> Option<&mut Vec<T>> {
        self.queues.get_mut(conversation_id).map(BoundedQueue::get_mut)
    }

    /// Replace or create the queue for a conversation, returning whatever
    /// the capacity bound evicted.
    pub fn set(&mut self, conversation_id: &str, items: Vec<T>, no_limit: bool) -> Vec<T> {
        let mut queue = BoundedQueue::new(self.capacity, self.direction);
        let evicted = queue.set(items, no_limit);
        self.queues.insert(conversation_id.to_string(), queue);
        evicted
    }

    /// Remove a conversation's queue, returning what it held.
    pub fn delete(&mut self, conversation_id: &str) -> Option<Vec<T>> {
        self.queues
            .remove(conversation_id)
            .map(|mut queue| queue.take())
    }

    pub fn contains(&self, conversation_id: &str) -> bool {
        self.queues.contains_key(conversation_id)
    }

    /// Re-apply trimming to one conversation's queue.
    pub fn reset_limit_state_for(&mut self, conversation_id: &str) -> Vec<T> {
        self.queues
            .get_mut(conversation_id)
            .map(BoundedQueue::reset_limit_state)
            .unwrap_or_default()
    }

    /// Re-apply trimming to every queue.
    pub fn reset_limit_state(&mut self) -> Vec<T> {
        self.queues
            .values_mut()
            .flat_map(BoundedQueue::reset_limit_state)
            .collect()
    }

    /// Every item across every conversation.
    pub fn values(&self) -> impl Iterator<Item = &T> {
        self.queues.values().flat_map(|queue| queue.get().iter())
    }

    /// Empty every queue, returning the removed items.
    pub fn clear(&mut self) -> Vec<T> {
        self.queues
            .drain()
            .flat_map(|(_, mut queue)| queue.take())
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn right_to_left_keeps_newest() {
        let mut queue = BoundedQueue::new(3, TrimDirection::RightToLeft);
        let evicted = queue.set(vec![1, 2, 3, 4, 5], false);
        assert_eq!(queue.get(), &[3, 4, 5]);
        assert_eq!(evicted, vec![1, 2]);

        assert_eq!(queue.push(6, false), vec![3]);
        assert_eq!(queue.get(), &[4, 5, 6]);
    }

    #[test]
    fn left_to_right_keeps_head() {
        let mut queue = BoundedQueue::new(2, TrimDirection::LeftToRight);
        queue.set(vec![1, 2, 3], false);
        assert_eq!(queue.get(), &[1, 2]);

        assert_eq!(queue.unshift(0, false), vec![2]);
        assert_eq!(queue.get(), &[0, 1]);
    }

    #[test]
    fn no_limit_skips_trim_until_reset() {
        let mut queue = BoundedQueue::new(2, TrimDirection::RightToLeft);
        queue.set(vec![1, 2, 3, 4], true);
        assert_eq!(queue.len(), 4);

        queue.reset_limit_state();
        assert_eq!(queue.get(), &[3, 4]);
    }

    #[test]
    fn shift_and_pop() {
        let mut queue = BoundedQueue::new(5, TrimDirection::RightToLeft);
        queue.set(vec![1, 2, 3], false);
        assert_eq!(queue.shift(), Some(1));
        assert_eq!(queue.pop(), Some(3));
        assert_eq!(queue.get(), &[2]);
        queue.clear();
        assert_eq!(queue.shift(), None);
    }

    #[test]
    fn queue_map_shares_capacity() {
        let mut map = QueueMap::new(2, TrimDirection::RightToLeft);
        map.set("a", vec![1, 2, 3], false);
        map.set("b", vec![7, 8, 9], true);

        assert_eq!(map.get("a"), Some(&[2, 3][..]));
        assert_eq!(map.get("b").map(<[i32]>::len), Some(3));
        assert_eq!(map.get("missing"), None);

        assert_eq!(map.reset_limit_state(), vec![7]);
        assert_eq!(map.get("b"), Some(&[8, 9][..]));

        let mut all: Vec<i32> = map.values().copied().collect();
        all.sort();
        assert_eq!(all, vec![2, 3, 8, 9]);
    }

    #[test]
    fn queue_map_delete_and_clear_return_items() {
        let mut map = QueueMap::new(10, TrimDirection::RightToLeft);
        map.set("a", vec![1, 2], false);
        map.set("b", vec![3], false);

        assert_eq!(map.delete("a"), Some(vec![1, 2]));
        assert!(!map.contains("a"));
        assert_eq!(map.delete("a"), None);

        assert_eq!(map.clear(), vec![3]);
        assert_eq!(map.values().count(), 0);
    }
}
