//! Fee and contribution sizing for the contract transaction
//!
//! The fee model prices the fulfillment transaction as if every future input
//! were a full P2PKH spend, at two satoshis per byte. The floor keeps the
//! number of inputs below what a standard transaction can carry.

use crate::core::monetary::{MAX_CONTRACT_INPUTS, MINIMUM_CONTRIBUTION, SMALL_CONTRIBUTION_LIMIT};

const BASE_SIZE: u64 = 10;
const OUTPUT_SIZE: u64 = 69;
const INPUT_SIZE: u64 = 296;
const FEE_RATE: u64 = 2;

/// Fee calculation utilities
pub struct FeeCalculator;

impl FeeCalculator {
    /// Size in bytes the fee model assumes for a contract with one more input
    /// than it currently holds.
    pub fn estimate_transaction_size(recipient_count: usize, commitment_count: usize) -> u64 {
        BASE_SIZE + OUTPUT_SIZE * recipient_count as u64 + INPUT_SIZE * (commitment_count as u64 + 1)
    }

    pub fn miner_fee(recipient_count: usize, commitment_count: usize) -> u64 {
        Self::estimate_transaction_size(recipient_count, commitment_count) * FEE_RATE
    }

    /// Smallest pledge the campaign accepts right now.
    ///
    /// `remaining` already includes the current miner fee. Once the small
    /// contribution budget is used up, the rest of the input slots must be
    /// able to cover `remaining` between them.
    pub fn minimum_contribution(
        remaining: u64,
        small_contribution_count: usize,
        commitment_count: usize,
    ) -> u64 {
        if small_contribution_count < SMALL_CONTRIBUTION_LIMIT {
            return remaining.min(MINIMUM_CONTRIBUTION);
        }

        let free_slots = MAX_CONTRACT_INPUTS.saturating_sub(commitment_count) as u64;
        if free_slots <= 1 {
            return remaining;
        }
        // a pledge equal to the fractional share still falls short of it
        let share = remaining / free_slots + u64::from(remaining % free_slots != 0);
        remaining.min(share)
    }

    /// How far a pledge would push the committed total past outputs plus
    /// fee. Zero when it fits.
    pub fn overcommitment(
        committed: u64,
        pledge: u64,
        total_output_value: u64,
        miner_fee: u64,
    ) -> u64 {
        committed
            .saturating_add(pledge)
            .saturating_sub(total_output_value.saturating_add(miner_fee))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_miner_fee_grows_per_commitment() {
        assert_eq!(FeeCalculator::miner_fee(1, 0), 750);
        assert_eq!(FeeCalculator::miner_fee(1, 1), 1342);
        assert_eq!(FeeCalculator::miner_fee(3, 0), (10 + 69 * 3 + 296) * 2);
    }

    #[test]
    fn test_floor_below_small_limit() {
        assert_eq!(FeeCalculator::minimum_contribution(500_000_750, 0, 0), 100_000);
        assert_eq!(FeeCalculator::minimum_contribution(40_000, 10, 10), 40_000);
    }

    #[test]
    fn test_floor_after_small_limit() {
        // 400 slots left for 4,000,000 satoshis
        assert_eq!(FeeCalculator::minimum_contribution(4_000_000, 250, 250), 10_000);
        // uneven split rounds up
        assert_eq!(FeeCalculator::minimum_contribution(4_000_001, 250, 250), 10_001);
        assert_eq!(FeeCalculator::minimum_contribution(100, 300, 649), 100);
        assert_eq!(FeeCalculator::minimum_contribution(100, 300, 700), 100);
    }

    #[test]
    fn test_overcommitment() {
        assert_eq!(FeeCalculator::overcommitment(400_000_000, 100_001_343, 500_000_000, 1342), 1);
        assert_eq!(FeeCalculator::overcommitment(400_000_000, 100_001_342, 500_000_000, 1342), 0);
        assert_eq!(FeeCalculator::overcommitment(0, 1, 500_000_000, 750), 0);
    }
}
