/// Monetary constants for the assurance contract
///
/// Amounts are satoshis throughout. The ceiling [`MAX_SAFE_SATOSHIS`] is a
/// precision bound shared with contributor-facing JSON, not a protocol rule.
///
/// Number of satoshis in one coin
pub const SATOSHIS_PER_COIN: u64 = 100_000_000;

/// Smallest output the network relays as standard
pub const DUST_THRESHOLD: u64 = 546;

/// Largest amount a single recipient output may request
pub const MAX_OUTPUT_SATOSHIS: u64 = 2_099_999_997_690_000;

/// 2^53 - 1
pub const MAX_SAFE_SATOSHIS: u64 = 9_007_199_254_740_991;

/// Pledges at or below this amount count as small contributions
pub const MINIMUM_CONTRIBUTION: u64 = 100_000;

/// Below this many small contributions the floor stays at [`MINIMUM_CONTRIBUTION`]
pub const SMALL_CONTRIBUTION_LIMIT: usize = 250;

/// Most inputs the fulfillment transaction may safely carry
pub const MAX_CONTRACT_INPUTS: usize = 650;

pub const TRANSACTION_VERSION: u32 = 2;
pub const TRANSACTION_LOCKTIME: u32 = 0;
pub const FINAL_SEQUENCE: u32 = 0xffff_ffff;

/// Utility functions for monetary conversions
pub mod conversions {
    use super::*;

    /// Format satoshis as a decimal coin amount
    ///
    /// # Examples
    /// ```
    /// use assurance_engine::core::monetary::conversions::format_coins;
    /// assert_eq!(format_coins(150_000_000), "1.50000000");
    /// assert_eq!(format_coins(546), "0.00000546");
    /// ```
    pub fn format_coins(satoshis: u64) -> String {
        format!(
            "{}.{:08}",
            satoshis / SATOSHIS_PER_COIN,
            satoshis % SATOSHIS_PER_COIN
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_ceilings_are_ordered() {
        assert!(DUST_THRESHOLD < MINIMUM_CONTRIBUTION);
        assert!(MAX_OUTPUT_SATOSHIS < MAX_SAFE_SATOSHIS);
        assert_eq!(MAX_SAFE_SATOSHIS, (1u64 << 53) - 1);
    }
}
