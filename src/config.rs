use std::time::Duration;

use crate::constants::{DIE_FACES, ROOM_CODE_ATTEMPTS, STORE_TIMEOUT_MS};

/// Tunables shared by the registry, the coordinators and the binaries.
#[derive(Clone, Debug)]
pub struct EngineConfig {
    /// Square every participant occupies when a game starts. `0` means
    /// "off the board", so the first roll of 1 lands on square 1.
    pub start_square: u32,
    pub die_faces: u32,
    pub store_timeout: Duration,
    pub code_attempts: usize,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            start_square: 0,
            die_faces: DIE_FACES,
            store_timeout: Duration::from_millis(STORE_TIMEOUT_MS),
            code_attempts: ROOM_CODE_ATTEMPTS,
        }
    }
}

impl EngineConfig {
    pub fn with_start_square(mut self, start_square: u32) -> Self {
        self.start_square = start_square;
        self
    }

    pub fn with_store_timeout_ms(mut self, timeout_ms: u64) -> Self {
        self.store_timeout = Duration::from_millis(timeout_ms.max(1));
        self
    }
}
