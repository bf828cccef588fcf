use serde::{Deserialize, Serialize};

const BPS_DENOMINATOR: i128 = 10_000;

/// Split of a single order amount between the platform, the processor and
/// the seller, in minor units.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Payout {
    pub platform_fee_minor_units: i64,
    pub processor_fee_minor_units: i64,
    pub seller_earnings_minor_units: i64,
}

/// Seller payout policy.
///
/// The default is the flat 80/20 split (`platform_fee_bps = 2000`, no
/// processor fee). Setting `processor_fee_bps = 290` and
/// `processor_fee_fixed_minor_units = 30` additionally withholds card
/// processing at 2.9% + 30 per order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct FeePolicy {
    pub platform_fee_bps: u32,
    pub processor_fee_bps: u32,
    pub processor_fee_fixed_minor_units: i64,
}

impl Default for FeePolicy {
    fn default() -> Self {
        Self {
            platform_fee_bps: 2_000,
            processor_fee_bps: 0,
            processor_fee_fixed_minor_units: 0,
        }
    }
}

impl FeePolicy {
    pub fn flat_split(platform_fee_bps: u32) -> Self {
        Self {
            platform_fee_bps,
            ..Self::default()
        }
    }

    /// Fees round down; the seller keeps any fractional minor unit and never
    /// goes negative.
    pub fn payout(&self, amount_minor_units: i64) -> Payout {
        let amount = amount_minor_units.max(0);
        let platform_fee = bps_of(amount, self.platform_fee_bps);
        let processor_fee = if amount == 0 {
            0
        } else {
            bps_of(amount, self.processor_fee_bps)
                .saturating_add(self.processor_fee_fixed_minor_units.max(0))
        };
        let seller_earnings = amount
            .saturating_sub(platform_fee)
            .saturating_sub(processor_fee)
            .max(0);

        Payout {
            platform_fee_minor_units: platform_fee,
            processor_fee_minor_units: processor_fee.min(amount - platform_fee),
            seller_earnings_minor_units: seller_earnings,
        }
    }

    pub fn seller_earnings(&self, amount_minor_units: i64) -> i64 {
        self.payout(amount_minor_units).seller_earnings_minor_units
    }
}

fn bps_of(amount: i64, bps: u32) -> i64 {
    let fee = i128::from(amount) * i128::from(bps) / BPS_DENOMINATOR;
    i64::try_from(fee).unwrap_or(i64::MAX)
}
