//! 64-bit message ids: 41 bits of milliseconds since `EPOCH_MS`, 10 bits of
//! worker id, 12 bits of per-millisecond sequence.

use std::sync::{Mutex, PoisonError};

use crate::error::ConfigError;

pub const EPOCH_MS: i64 = 1_288_834_974_657;
pub const WORKER_ID_BITS: u32 = 10;
pub const SEQUENCE_BITS: u32 = 12;
pub const MAX_WORKER_ID: i64 = (1 << WORKER_ID_BITS) - 1;
const SEQUENCE_MASK: i64 = (1 << SEQUENCE_BITS) - 1;
const WORKER_SHIFT: u32 = SEQUENCE_BITS;
const TIMESTAMP_SHIFT: u32 = SEQUENCE_BITS + WORKER_ID_BITS;

struct Clock {
    last_ms: i64,
    sequence: i64,
}

pub struct IdWorker {
    worker_id: i64,
    clock: Mutex<Clock>,
}

impl IdWorker {
    pub fn new(worker_id: i64) -> Result<Self, ConfigError> {
        if !(0..=MAX_WORKER_ID).contains(&worker_id) {
            return Err(ConfigError::InvalidWorkerId(worker_id));
        }
        Ok(Self {
            worker_id,
            clock: Mutex::new(Clock {
                last_ms: 0,
                sequence: 0,
            }),
        })
    }

    pub fn worker_id(&self) -> i64 {
        self.worker_id
    }

    /// Strictly greater than every id previously returned by this worker.
    ///
    /// If the wall clock steps backwards the last timestamp is reused; when a
    /// millisecond's sequence space runs out the timestamp is advanced by one
    /// instead of sleeping.
    pub fn next_id(&self) -> i64 {
        let now = now_ms();
        let mut clock = self.clock.lock().unwrap_or_else(PoisonError::into_inner);

        let mut ts = now.max(clock.last_ms);
        if ts == clock.last_ms {
            clock.sequence = (clock.sequence + 1) & SEQUENCE_MASK;
            if clock.sequence == 0 {
                ts = clock.last_ms + 1;
            }
        } else {
            clock.sequence = 0;
        }
        clock.last_ms = ts;

        ((ts - EPOCH_MS) << TIMESTAMP_SHIFT) | (self.worker_id << WORKER_SHIFT) | clock.sequence
    }
}

/// Splits an id into (unix millis, worker id, sequence).
pub fn decompose(id: i64) -> (i64, i64, i64) {
    let ts = (id >> TIMESTAMP_SHIFT) + EPOCH_MS;
    let worker = (id >> WORKER_SHIFT) & MAX_WORKER_ID;
    let seq = id & SEQUENCE_MASK;
    (ts, worker, seq)
}

fn now_ms() -> i64 {
    chrono::Utc::now().timestamp_millis()
}
