use serde::{Deserialize, Serialize};

use crate::types::{AccountId, Micros, TimestampMs};

/// Coarse account tier, set at allocation time and used for default pool
/// routing and rate-limit defaults. Distinct from the `ServiceTier` carried
/// on a request's JWT claims (`claims::Tier`) — an account's tier reflects
/// its standing in the credit program, the claim's tier reflects what the
/// caller is paying for on this particular call.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum AccountTier {
    /// Original-generation allocation; most generous defaults.
    Og,
    Contributor,
    Community,
    Partner,
}

impl AccountTier {
    pub fn as_str(&self) -> &'static str {
        match self {
            AccountTier::Og => "og",
            AccountTier::Contributor => "contributor",
            AccountTier::Community => "community",
            AccountTier::Partner => "partner",
        }
    }
}

/// The five-bucket credit ledger for one account.
///
/// `allocated + unlocked + reserved + consumed + expired` must equal
/// `initial_allocation` at every observed instant (the conservation
/// invariant). The ledger crate is the only thing permitted to mutate these
/// fields; everything else treats `Account` as a read-only snapshot.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Account {
    /// Primary key.
    pub account_id: AccountId,
    /// Fixed at creation; the conservation target for this account forever.
    pub initial_allocation: Micros,
    /// Credits granted but not yet released for spending.
    pub allocated: Micros,
    /// Credits released for spending but not yet reserved against a request.
    pub unlocked: Micros,
    /// Credits held against an in-flight billing entry.
    pub reserved: Micros,
    /// Credits permanently spent.
    pub consumed: Micros,
    /// Credits that lapsed without being spent.
    pub expired: Micros,
    pub tier: AccountTier,
    pub expires_at: TimestampMs,
    pub created_at: TimestampMs,
    pub updated_at: TimestampMs,

    /// Frozen credits under reorg-divergence investigation. These are a
    /// marked subset of `reserved`, not a sixth bucket — they still count
    /// toward the conservation sum via `reserved`.
    #[serde(default)]
    pub frozen: Micros,
}

impl Account {
    pub fn new(
        account_id: AccountId,
        initial_allocation: Micros,
        tier: AccountTier,
        expires_at: TimestampMs,
        now: TimestampMs,
    ) -> Self {
        Self {
            account_id,
            initial_allocation,
            allocated: initial_allocation,
            unlocked: 0,
            reserved: 0,
            consumed: 0,
            expired: 0,
            tier,
            expires_at,
            created_at: now,
            updated_at: now,
            frozen: 0,
        }
    }

    /// Sum of all five buckets. Should always equal `initial_allocation`;
    /// callers that need to assert the conservation invariant compare this
    /// against `initial_allocation` directly rather than trusting a cached
    /// value.
    pub fn bucket_sum(&self) -> Micros {
        self.allocated + self.unlocked + self.reserved + self.consumed + self.expired
    }

    pub fn conserves(&self) -> bool {
        self.bucket_sum() == self.initial_allocation
    }

    /// Credits currently usable to open a new reservation.
    pub fn spendable(&self) -> Micros {
        self.unlocked
    }

    pub fn is_expired(&self, now: TimestampMs) -> bool {
        now > self.expires_at
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn new_account_conserves() {
        let acct = Account::new(AccountId::new("0xabc"), 1_000_000, AccountTier::Community, 0, 0);
        assert!(acct.conserves());
        assert_eq!(acct.spendable(), 0);
    }
}
