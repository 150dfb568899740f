use crate::error::{MirrorError, MirrorResult};
use serde::{Deserialize, Serialize};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

// 2022-03-31 00:00:00 UTC
pub const DEFAULT_EPOCH_MILLIS: u64 = 1648684800000;
const ID_PAYLOAD_BITS: u8 = 63;
const EXHAUSTED_WAIT_MICROS: u64 = 100;

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SnowflakeConfig {
    pub start_time: u64,
    pub worker_id_bits: u8,
    pub sequence_bits: u8,
    pub worker_id: u64,
    pub max_backward_wait_ms: u64,
}

impl Default for SnowflakeConfig {
    fn default() -> Self {
        Self {
            start_time: DEFAULT_EPOCH_MILLIS,
            worker_id_bits: 5,
            sequence_bits: 12,
            worker_id: 0,
            max_backward_wait_ms: 5,
        }
    }
}

impl SnowflakeConfig {
    pub fn validate(&self) -> MirrorResult<()> {
        let used = self.worker_id_bits as u32 + self.sequence_bits as u32;
        if self.sequence_bits == 0 || used >= ID_PAYLOAD_BITS as u32 {
            return Err(MirrorError::InvalidConfig(format!(
                "invalid snowflake layout: worker bits {}, sequence bits {}",
                self.worker_id_bits, self.sequence_bits
            )));
        }

        if self.worker_id > self.max_worker_id() {
            return Err(MirrorError::InvalidConfig(format!(
                "worker id {} does not fit in {} bits",
                self.worker_id, self.worker_id_bits
            )));
        }

        Ok(())
    }

    pub fn max_worker_id(&self) -> u64 {
        (1u64 << self.worker_id_bits) - 1
    }

    pub fn max_sequence(&self) -> u64 {
        (1u64 << self.sequence_bits) - 1
    }

    fn timestamp_bits(&self) -> u8 {
        ID_PAYLOAD_BITS - self.worker_id_bits - self.sequence_bits
    }
}

pub trait Clock: Send + Sync {
    fn now_millis(&self) -> u64;
}

#[derive(Debug, Default, Clone, Copy)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now_millis(&self) -> u64 {
        crate::def::now_millis()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct IdParts {
    pub timestamp: u64,
    pub worker_id: u64,
    pub sequence: u64,
}

struct AssignerState {
    last_timestamp: u64,
    sequence: u64,
}

/// Snowflake style id generator.
///
/// Layout from the high bit down: a zero sign bit, milliseconds since
/// `start_time`, the worker id, the per-millisecond sequence. When the
/// sequence runs out the caller sleeps until the next millisecond. When the
/// clock goes backwards the caller waits at most `max_backward_wait_ms`,
/// then gets `ClockRegression`; the last timestamp is never lowered.
pub struct IdAssigner {
    config: SnowflakeConfig,
    clock: Arc<dyn Clock>,
    state: Mutex<AssignerState>,
}

impl IdAssigner {
    pub fn new(config: SnowflakeConfig) -> MirrorResult<Self> {
        Self::new_with_clock(config, Arc::new(SystemClock))
    }

    pub fn new_with_clock(config: SnowflakeConfig, clock: Arc<dyn Clock>) -> MirrorResult<Self> {
        config.validate()?;

        info!(
            "id assigner created: worker_id={}, worker_bits={}, sequence_bits={}, epoch={}",
            config.worker_id, config.worker_id_bits, config.sequence_bits, config.start_time
        );

        Ok(Self {
            config,
            clock,
            state: Mutex::new(AssignerState {
                last_timestamp: 0,
                sequence: 0,
            }),
        })
    }

    pub fn worker_id(&self) -> u64 {
        self.config.worker_id
    }

    pub fn next_id(&self) -> MirrorResult<u64> {
        let mut regression_since: Option<Instant> = None;

        loop {
            let now = self.clock.now_millis();
            let mut state = self
                .state
                .lock()
                .map_err(|_| MirrorError::Internal("id assigner state poisoned".to_string()))?;

            if now < state.last_timestamp {
                let last = state.last_timestamp;
                drop(state);

                let since = *regression_since.get_or_insert_with(Instant::now);
                if since.elapsed() >= Duration::from_millis(self.config.max_backward_wait_ms) {
                    warn!(
                        "clock moved backwards by {} ms, halting id issuance",
                        last - now
                    );
                    return Err(MirrorError::ClockRegression { last, now });
                }

                std::thread::sleep(Duration::from_micros(EXHAUSTED_WAIT_MICROS));
                continue;
            }

            if now == state.last_timestamp {
                if state.sequence >= self.config.max_sequence() {
                    drop(state);
                    std::thread::sleep(Duration::from_micros(EXHAUSTED_WAIT_MICROS));
                    continue;
                }
                state.sequence += 1;
            } else {
                state.last_timestamp = now;
                state.sequence = 0;
            }

            return self.compose(state.last_timestamp, state.sequence);
        }
    }

    fn compose(&self, timestamp: u64, sequence: u64) -> MirrorResult<u64> {
        if timestamp < self.config.start_time {
            return Err(MirrorError::ClockRegression {
                last: self.config.start_time,
                now: timestamp,
            });
        }

        let offset = timestamp - self.config.start_time;
        if offset >> self.config.timestamp_bits() != 0 {
            return Err(MirrorError::Internal(format!(
                "timestamp offset {} overflows {} bits",
                offset,
                self.config.timestamp_bits()
            )));
        }

        let worker_shift = self.config.sequence_bits;
        let timestamp_shift = self.config.sequence_bits + self.config.worker_id_bits;
        Ok((offset << timestamp_shift) | (self.config.worker_id << worker_shift) | sequence)
    }

    pub fn decompose(&self, id: u64) -> IdParts {
        let worker_shift = self.config.sequence_bits;
        let timestamp_shift = self.config.sequence_bits + self.config.worker_id_bits;
        IdParts {
            timestamp: (id >> timestamp_shift) + self.config.start_time,
            worker_id: (id >> worker_shift) & self.config.max_worker_id(),
            sequence: id & self.config.max_sequence(),
        }
    }
}
