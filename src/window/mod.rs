//! Windowing operators (§4.11, component C11).
//!
//! Grounded on `harborgrid-justin-rusty-db`'s `event_processing::windows`
//! for the window-id-from-timestamp idiom (`WindowId::from_timestamp`),
//! adapted to the event-time semantics §4.11 specifies: tumbling windows
//! bucket by `floor(t / W)` and emit only once their watermark has passed
//! the bucket's end, dropping late elements rather than reopening a closed
//! bucket.

use std::collections::BTreeMap;
use std::time::{Duration, Instant};

use crate::error::Result;
use crate::operators::Operator;

/// Anything a window operator can extract an event timestamp from.
pub trait EventTime {
    fn event_time(&self) -> i64;
}

impl EventTime for crate::record::Record {
    fn event_time(&self) -> i64 {
        self.timestamp
    }
}

/// Pure assigner: every window a timestamp belongs to under tumbling
/// semantics of size `size`. Always exactly one window.
pub fn tumbling_windows(timestamp: i64, size: i64) -> Vec<(i64, i64)> {
    let start = timestamp.div_euclid(size) * size;
    vec![(start, start + size)]
}

/// Pure assigner: every window a timestamp belongs to under sliding
/// semantics of size `size` and hop `slide`. `slide` must divide evenly into
/// window placement; windows are every multiple of `slide` whose range
/// contains `timestamp`.
pub fn sliding_windows(timestamp: i64, size: i64, slide: i64) -> Vec<(i64, i64)> {
    let last_start = timestamp.div_euclid(slide) * slide;
    let mut windows = Vec::new();
    let mut start = last_start;
    while start > timestamp - size {
        if timestamp >= start && timestamp < start + size {
            windows.push((start, start + size));
        }
        start -= slide;
    }
    windows.reverse();
    windows
}

/// Accumulates exactly `size` elements, then emits them as one batch.
pub struct CountWindow<T> {
    size: usize,
    buffer: Vec<T>,
}

impl<T> CountWindow<T> {
    pub fn new(size: usize) -> Self {
        assert!(size > 0, "count window size must be positive");
        Self { size, buffer: Vec::with_capacity(size) }
    }
}

impl<T: Send> Operator<T, Vec<T>> for CountWindow<T> {
    fn process(&mut self, input: T) -> Result<Vec<Vec<T>>> {
        self.buffer.push(input);
        if self.buffer.len() == self.size {
            Ok(vec![std::mem::replace(&mut self.buffer, Vec::with_capacity(self.size))])
        } else {
            Ok(vec![])
        }
    }

    fn snapshot_state(&self) -> serde_json::Value {
        serde_json::json!({ "buffered": self.buffer.len() })
    }
}

/// Buffers elements; on the first element after an empty buffer, starts a
/// `size`-second deadline. Emits everything buffered once the deadline
/// passes, driven by the operator runtime's periodic timer poll rather than
/// new input arriving.
pub struct SlidingWindow<T> {
    size: Duration,
    buffer: Vec<T>,
    deadline: Option<Instant>,
}

impl<T> SlidingWindow<T> {
    pub fn new(size: Duration) -> Self {
        Self { size, buffer: Vec::new(), deadline: None }
    }
}

impl<T: Send> Operator<T, Vec<T>> for SlidingWindow<T> {
    fn process(&mut self, input: T) -> Result<Vec<Vec<T>>> {
        if self.buffer.is_empty() {
            self.deadline = Some(Instant::now() + self.size);
        }
        self.buffer.push(input);
        Ok(vec![])
    }

    fn poll_timer(&mut self) -> Result<Vec<Vec<T>>> {
        match self.deadline {
            Some(deadline) if Instant::now() >= deadline && !self.buffer.is_empty() => {
                self.deadline = None;
                Ok(vec![std::mem::take(&mut self.buffer)])
            }
            _ => Ok(vec![]),
        }
    }

    fn snapshot_state(&self) -> serde_json::Value {
        serde_json::json!({ "buffered": self.buffer.len() })
    }
}

/// Buckets elements by `floor(event_time / size)`. On a watermark, every
/// bucket whose end is at or before the watermark is emitted exactly once;
/// elements that arrive for an already-emitted bucket are dropped as late.
pub struct TumblingWindow<T> {
    size: i64,
    buckets: BTreeMap<i64, Vec<T>>,
    high_watermark_emitted: i64,
}

impl<T> TumblingWindow<T> {
    pub fn new(size: i64) -> Self {
        assert!(size > 0, "tumbling window size must be positive");
        Self {
            size,
            buckets: BTreeMap::new(),
            high_watermark_emitted: i64::MIN,
        }
    }

    fn bucket_start(&self, timestamp: i64) -> i64 {
        timestamp.div_euclid(self.size) * self.size
    }
}

impl<T: Send + EventTime> Operator<T, Vec<T>> for TumblingWindow<T> {
    fn process(&mut self, input: T) -> Result<Vec<Vec<T>>> {
        let start = self.bucket_start(input.event_time());
        if start + self.size <= self.high_watermark_emitted {
            tracing::debug!(bucket_start = start, "dropping late element, window already emitted");
            return Ok(vec![]);
        }
        self.buckets.entry(start).or_default().push(input);
        Ok(vec![])
    }

    fn on_watermark(&mut self, watermark: i64) -> Result<Vec<Vec<T>>> {
        let ready: Vec<i64> = self.buckets.keys().copied().filter(|&start| start + self.size <= watermark).collect();
        let mut emitted = Vec::with_capacity(ready.len());
        for start in ready {
            if let Some(elements) = self.buckets.remove(&start) {
                emitted.push(elements);
            }
        }
        self.high_watermark_emitted = self.high_watermark_emitted.max(watermark);
        Ok(emitted)
    }

    fn snapshot_state(&self) -> serde_json::Value {
        serde_json::json!({
            "open_buckets": self.buckets.keys().copied().collect::<Vec<_>>(),
            "high_watermark_emitted": self.high_watermark_emitted,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Debug, Clone, PartialEq)]
    struct Tagged(i64, char);
    impl EventTime for Tagged {
        fn event_time(&self) -> i64 {
            self.0
        }
    }

    #[test]
    fn count_window_emits_exactly_on_size() {
        let mut w = CountWindow::new(3);
        assert_eq!(w.process(1).unwrap(), Vec::<Vec<i32>>::new());
        assert_eq!(w.process(2).unwrap(), Vec::<Vec<i32>>::new());
        assert_eq!(w.process(3).unwrap(), vec![vec![1, 2, 3]]);
        assert_eq!(w.process(4).unwrap(), Vec::<Vec<i32>>::new());
    }

    #[test]
    fn tumbling_windows_assigner_buckets_by_floor_division() {
        assert_eq!(tumbling_windows(12, 10), vec![(10, 20)]);
        assert_eq!(tumbling_windows(9, 10), vec![(0, 10)]);
    }

    /// Scenario S5: window size 10, watermarks 10,15,15,21,25,31.
    #[test]
    fn s5_event_time_tumbling_window_emits_on_watermark_crossing_end() {
        let mut w: TumblingWindow<Tagged> = TumblingWindow::new(10);
        let events = [(10, 'a'), (15, 'b'), (12, 'c'), (21, 'd'), (25, 'e'), (31, 'f')];
        let watermarks = [10, 15, 15, 21, 25, 31];

        for ((t, tag), wm) in events.into_iter().zip(watermarks) {
            w.process(Tagged(t, tag)).unwrap();
            let emitted = w.on_watermark(wm).unwrap();
            match wm {
                21 => {
                    assert_eq!(emitted.len(), 1);
                    let tags: Vec<char> = emitted[0].iter().map(|e| e.1).collect();
                    assert_eq!(tags, vec!['a', 'b', 'c']);
                }
                25 => assert!(emitted.is_empty(), "[20,30) not yet closed at Wm=25"),
                31 => {
                    assert_eq!(emitted.len(), 1);
                    let tags: Vec<char> = emitted[0].iter().map(|e| e.1).collect();
                    assert_eq!(tags, vec!['d', 'e']);
                }
                _ => {}
            }
        }
    }

    #[test]
    fn late_elements_for_an_emitted_window_are_dropped() {
        let mut w: TumblingWindow<Tagged> = TumblingWindow::new(10);
        w.process(Tagged(5, 'a')).unwrap();
        w.on_watermark(10).unwrap();
        let emitted = w.on_watermark(10).unwrap();
        assert!(emitted.is_empty(), "window already closed, re-emit would violate exactly-once");

        w.process(Tagged(3, 'z')).unwrap();
        let late_emit = w.on_watermark(100).unwrap();
        assert!(late_emit.is_empty(), "late element for a closed window must not reopen it");
    }
}
