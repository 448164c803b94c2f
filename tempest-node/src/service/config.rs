use localtime::LocalDuration;

/// Service configuration.
#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct Config {
    /// Lookup endpoints to dial on startup. Connections to these are
    /// maintained: failures back off and reconnect.
    pub connect: Vec<String>,
    /// First reconnection delay after a failed dial.
    pub retry_delay_initial: LocalDuration,
    /// Cap on the reconnection delay.
    pub retry_delay_max: LocalDuration,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            connect: Vec::new(),
            retry_delay_initial: LocalDuration::from_millis(500),
            retry_delay_max: LocalDuration::from_secs(60),
        }
    }
}

impl Config {
    /// Reconnection delay before attempt `n + 1`, after `n` failures:
    /// exponential from the initial delay, capped at the maximum.
    pub fn retry_delay(&self, attempts: usize) -> LocalDuration {
        let base = self.retry_delay_initial.as_millis() as u64;
        let factor = 2u64.saturating_pow(attempts.min(32) as u32);

        LocalDuration::from_millis(base.saturating_mul(factor) as u128)
            .clamp(self.retry_delay_initial, self.retry_delay_max)
    }
}
