//! Append-only record of the events emitted by the processor and the bridges.

use std::sync::{Mutex, MutexGuard};

use alloy::primitives::{Address, Log};
use alloy::sol_types::SolEvent;

#[derive(Debug, Default)]
pub struct EventLog {
    logs: Mutex<Vec<Log>>,
}

impl EventLog {
    pub fn new() -> Self {
        Self::default()
    }

    fn guard(&self) -> MutexGuard<'_, Vec<Log>> {
        self.logs.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// ABI-encode `event` and append it under `emitter`.
    pub fn emit<E: SolEvent>(&self, emitter: Address, event: &E) {
        let log = Log {
            address: emitter,
            data: event.encode_log_data(),
        };
        self.guard().push(log);
    }

    pub fn logs(&self) -> Vec<Log> {
        self.guard().clone()
    }

    pub fn len(&self) -> usize {
        self.guard().len()
    }

    pub fn is_empty(&self) -> bool {
        self.guard().is_empty()
    }

    /// Decode every recorded log whose signature matches `E`.
    pub fn decoded<E: SolEvent>(&self) -> Vec<E> {
        self.guard()
            .iter()
            .filter(|log| log.data.topics().first() == Some(&E::SIGNATURE_HASH))
            .filter_map(|log| E::decode_log_data(&log.data).ok())
            .collect()
    }
}
