// Per-second sliding window of request completions
//
// A fixed ring of RTW + 1 buckets indexed by `second % (RTW + 1)`, so the
// current second never shares a slot with the oldest second of the window.
// A bucket belongs to exactly one second at a time; writing a newer second into it resets it, and
// readers ignore any bucket whose stamp does not match the second they ask for.

use parking_lot::Mutex;

use crate::clock::SharedClock;

#[derive(Debug, Default, Clone, Copy)]
struct BucketCounts {
    last_written_second: Option<u64>,
    total: u64,
    over_threshold: u64,
}

/// One second's aggregate. Both counters change together under the lock.
#[derive(Debug, Default)]
pub struct Bucket {
    counts: Mutex<BucketCounts>,
}

impl Bucket {
    fn record(&self, second: u64, over_threshold: bool) {
        let mut c = self.counts.lock();
        if c.last_written_second != Some(second) {
            *c = BucketCounts {
                last_written_second: Some(second),
                total: 0,
                over_threshold: 0,
            };
        }
        c.total += 1;
        if over_threshold {
            c.over_threshold += 1;
        }
    }

    fn read_if_match(&self, second: u64) -> Option<(u64, u64)> {
        let c = self.counts.lock();
        (c.last_written_second == Some(second)).then_some((c.total, c.over_threshold))
    }
}

/// Totals over the window.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct WindowSum {
    pub total: u64,
    pub over_threshold: u64,
}

pub struct SlidingWindow {
    buckets: Box<[Bucket]>,
    rtw_seconds: u64,
    response_time_threshold_ms: u64,
    clock: SharedClock,
}

impl SlidingWindow {
    pub fn new(rtw_seconds: u32, response_time_threshold_ms: u64, clock: SharedClock) -> Self {
        let rtw = rtw_seconds.max(1) as u64;
        Self {
            buckets: (0..=rtw).map(|_| Bucket::default()).collect(),
            rtw_seconds: rtw,
            response_time_threshold_ms,
            clock,
        }
    }

    pub fn rtw_seconds(&self) -> u64 {
        self.rtw_seconds
    }

    /// Record one completion into the bucket of the current second.
    pub fn record_completion(&self, duration_ms: u64) {
        let second = self.clock.now_ms() / 1000;
        self.record_at(second, duration_ms);
    }

    pub fn record_at(&self, second: u64, duration_ms: u64) {
        let over = duration_ms >= self.response_time_threshold_ms;
        self.bucket_for(second).record(second, over);
    }

    /// `(total, over_threshold)` for one second; zero if that second's bucket
    /// has since been reused or was never written.
    pub fn counts_for_second(&self, second: u64) -> (u64, u64) {
        self.bucket_for(second).read_if_match(second).unwrap_or((0, 0))
    }

    /// Sum over the RTW complete seconds before the current one.
    pub fn sum(&self) -> WindowSum {
        let now_second = self.clock.now_ms() / 1000;
        self.sum_before(now_second)
    }

    /// Sum over seconds `[now_second - RTW, now_second)`.
    pub fn sum_before(&self, now_second: u64) -> WindowSum {
        let mut sum = WindowSum::default();
        for back in 1..=self.rtw_seconds {
            let Some(second) = now_second.checked_sub(back) else {
                break;
            };
            if let Some((total, over)) = self.bucket_for(second).read_if_match(second) {
                sum.total += total;
                sum.over_threshold += over;
            }
        }
        sum
    }

    fn bucket_for(&self, second: u64) -> &Bucket {
        &self.buckets[(second % self.buckets.len() as u64) as usize]
    }
}
