//! [A] Bounded buffers and statistics.
//!
//! A fixed-size ring buffer with O(1) `add`, O(k) `recent(k)`, O(n) `all`,
//! and a rolling-average container with maintained sum for O(1) `avg`.
//! Generalizes the cap-and-evict-from-front idea already used by the
//! teacher's `TaskContext::push_hint_bounded` into a reusable structure
//! with no reallocation after construction.

/// A fixed-capacity ring buffer. Once full, `add` overwrites the oldest
/// element. Never reallocates after construction.
#[derive(Debug, Clone)]
pub struct RingBuffer<T> {
    slots: Vec<Option<T>>,
    capacity: usize,
    /// Index the next `add` will write to.
    head: usize,
    len: usize,
}

impl<T: Clone> RingBuffer<T> {
    /// Create a ring buffer with room for `capacity` elements.
    ///
    /// # Panics
    /// Panics if `capacity` is zero.
    pub fn new(capacity: usize) -> Self {
        assert!(capacity > 0, "RingBuffer capacity must be > 0");
        Self {
            slots: vec![None; capacity],
            capacity,
            head: 0,
            len: 0,
        }
    }

    /// Append an element, overwriting the oldest if at capacity. O(1).
    pub fn add(&mut self, item: T) {
        self.slots[self.head] = Some(item);
        self.head = (self.head + 1) % self.capacity;
        if self.len < self.capacity {
            self.len += 1;
        }
    }

    /// Number of elements currently stored.
    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// The most recent `min(k, len)` elements, oldest-to-newest. O(k).
    pub fn recent(&self, k: usize) -> Vec<T> {
        let take = k.min(self.len);
        let mut out = Vec::with_capacity(take);
        // Oldest stored index, walking forward from there.
        let start = if self.len < self.capacity {
            0
        } else {
            self.head
        };
        // Collect all, then take the tail `take` to preserve insertion order.
        let mut all = Vec::with_capacity(self.len);
        for i in 0..self.len {
            let idx = (start + i) % self.capacity;
            if let Some(v) = &self.slots[idx] {
                all.push(v.clone());
            }
        }
        if take < all.len() {
            out.extend_from_slice(&all[all.len() - take..]);
        } else {
            out = all;
        }
        out
    }

    /// All stored elements, oldest-to-newest. O(n).
    pub fn all(&self) -> Vec<T> {
        self.recent(self.len)
    }

    /// Clear all stored elements without shrinking capacity.
    pub fn clear(&mut self) {
        for slot in &mut self.slots {
            *slot = None;
        }
        self.head = 0;
        self.len = 0;
    }
}

/// A fixed-size numeric window with a maintained running sum, giving O(1)
/// `avg`/`min`/`max` tracking and an on-demand `p95` over the populated
/// slice only.
#[derive(Debug, Clone)]
pub struct RollingStats {
    window: RingBuffer<f64>,
    sum: f64,
}

impl RollingStats {
    pub fn new(capacity: usize) -> Self {
        Self {
            window: RingBuffer::new(capacity),
            sum: 0.0,
        }
    }

    /// Record a sample, evicting the oldest if the window is full and
    /// keeping `sum` consistent with the surviving set.
    pub fn record(&mut self, value: f64) {
        if self.window.len() == self.window.capacity() {
            if let Some(&v) = self.window.all().first() {
                self.sum -= v;
            }
        }
        self.window.add(value);
        self.sum += value;
    }

    /// Arithmetic mean of the populated window. 0.0 if empty.
    pub fn avg(&self) -> f64 {
        if self.window.is_empty() {
            0.0
        } else {
            self.sum / self.window.len() as f64
        }
    }

    pub fn min(&self) -> f64 {
        let all = self.window.all();
        if all.is_empty() {
            0.0
        } else {
            all.into_iter().fold(f64::INFINITY, f64::min)
        }
    }

    pub fn max(&self) -> f64 {
        let all = self.window.all();
        if all.is_empty() {
            0.0
        } else {
            all.into_iter().fold(f64::NEG_INFINITY, f64::max)
        }
    }

    /// 95th percentile, sorting only the populated slice on demand.
    /// Returns 0.0 on an empty window (spec section 8 boundary behavior).
    pub fn p95(&self) -> f64 {
        let mut all = self.window.all();
        if all.is_empty() {
            return 0.0;
        }
        all.sort_by(|a, b| a.partial_cmp(b).unwrap());
        let idx = ((all.len() as f64) * 0.95).ceil() as usize;
        let idx = idx.saturating_sub(1).min(all.len() - 1);
        all[idx]
    }

    pub fn len(&self) -> usize {
        self.window.len()
    }

    pub fn is_empty(&self) -> bool {
        self.window.is_empty()
    }
}
