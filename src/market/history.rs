//! Usage History
//!
//! Fixed-capacity ring of usage samples with a least-squares trend classifier.

use std::collections::VecDeque;

/// Default number of samples kept per instance
pub const DEFAULT_HISTORY_SIZE: usize = 10;

/// Direction of the usage curve
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Trend {
    Increasing,
    Decreasing,
    Steady,
}

impl std::fmt::Display for Trend {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Trend::Increasing => write!(f, "increasing"),
            Trend::Decreasing => write!(f, "decreasing"),
            Trend::Steady => write!(f, "steady"),
        }
    }
}

/// Ring of byte-size samples, oldest first
#[derive(Debug, Clone)]
pub struct History {
    samples: VecDeque<u64>,
    capacity: usize,
}

impl Default for History {
    fn default() -> Self {
        Self::new(DEFAULT_HISTORY_SIZE)
    }
}

impl History {
    /// Create an empty history holding at most `capacity` samples
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            samples: VecDeque::with_capacity(capacity),
            capacity,
        }
    }

    /// Append a sample, dropping the oldest one when full
    pub fn add(&mut self, sample: u64) {
        if self.samples.len() == self.capacity {
            self.samples.pop_front();
        }
        self.samples.push_back(sample);
    }

    /// Most recent sample, 0 if empty
    pub fn current(&self) -> u64 {
        self.samples.back().copied().unwrap_or(0)
    }

    /// Sample preceding the most recent one, 0 if there is none
    pub fn previous(&self) -> u64 {
        let len = self.samples.len();
        if len < 2 {
            return 0;
        }
        self.samples[len - 2]
    }

    pub fn len(&self) -> usize {
        self.samples.len()
    }

    pub fn is_empty(&self) -> bool {
        self.samples.is_empty()
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Samples oldest first
    pub fn iter(&self) -> impl Iterator<Item = u64> + '_ {
        self.samples.iter().copied()
    }

    /// Slope of the ordinary least-squares fit over `(index, sample)`
    ///
    /// `None` when fewer than two points are available.
    pub fn slope(&self) -> Option<f64> {
        let n = self.samples.len() as f64;
        let (mut sx, mut sy, mut sxy, mut sxx) = (0.0, 0.0, 0.0, 0.0);
        for (i, y) in self.samples.iter().enumerate() {
            let x = i as f64;
            let y = *y as f64;
            sx += x;
            sy += y;
            sxy += x * y;
            sxx += x * x;
        }

        let denom = n * sxx - sx * sx;
        if denom == 0.0 {
            return None;
        }
        Some((n * sxy - sx * sy) / denom)
    }

    /// Classify the usage curve against `min_slope` bytes per sample
    pub fn trend(&self, min_slope: f64) -> Trend {
        match self.slope() {
            Some(slope) if slope >= min_slope => Trend::Increasing,
            Some(slope) if slope <= -min_slope => Trend::Decreasing,
            _ => Trend::Steady,
        }
    }
}
