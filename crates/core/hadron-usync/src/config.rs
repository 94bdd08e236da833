//! Tunables for a [`SyncDomain`](crate::SyncDomain).

/// Default number of chains in the chain table.
pub const DEFAULT_CHAINS: usize = 512;

/// Default spin iterations in [`Chain::busy`](crate::chain::Chain::busy)
/// before the caller sleeps.
pub const DEFAULT_BUSY_SPINS: u32 = 200;

/// Default CAS failures tolerated before a retry loop yields.
pub const DEFAULT_CAS_RETRIES: u32 = 16;

/// Construction-time configuration of a synchronization domain.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SyncConfig {
    /// Number of chains. Rounded up to a power of two.
    pub chains: usize,
    /// Bounded spin phase of the busy flag.
    pub busy_spins: u32,
    /// CAS retry budget between yields.
    pub cas_retries: u32,
}

impl SyncConfig {
    /// Returns the chain count actually used: `chains` rounded up to a
    /// power of two, never zero.
    pub const fn chain_count(&self) -> usize {
        if self.chains <= 1 {
            1
        } else {
            self.chains.next_power_of_two()
        }
    }

    /// Sets the chain count.
    #[must_use]
    pub const fn with_chains(mut self, chains: usize) -> Self {
        self.chains = chains;
        self
    }

    /// Sets the busy spin budget.
    #[must_use]
    pub const fn with_busy_spins(mut self, spins: u32) -> Self {
        self.busy_spins = spins;
        self
    }
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            chains: DEFAULT_CHAINS,
            busy_spins: DEFAULT_BUSY_SPINS,
            cas_retries: DEFAULT_CAS_RETRIES,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_is_power_of_two() {
        let cfg = SyncConfig::default();
        assert_eq!(cfg.chain_count(), DEFAULT_CHAINS);
        assert!(cfg.chain_count().is_power_of_two());
    }

    #[test]
    fn chain_count_rounds_up() {
        assert_eq!(SyncConfig::default().with_chains(100).chain_count(), 128);
        assert_eq!(SyncConfig::default().with_chains(0).chain_count(), 1);
        assert_eq!(SyncConfig::default().with_chains(1).chain_count(), 1);
    }
}
