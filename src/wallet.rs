// =============================================================================
// Wallet ledger — spec.md §3 supplemental (REAL/DEMO balances)
// =============================================================================
//
// A minimal ledger: two independent balances per user, one for REAL stakes
// and one for DEMO stakes. All mutation goes through `debit`/`credit`, which
// serialize per-user so concurrent trade placement and settlement on the
// same account can never interleave into a torn balance.
// =============================================================================

use std::collections::HashMap;

use parking_lot::Mutex;

use crate::error::CoreError;
use crate::types::{AccountKind, Wallet};

const DEFAULT_DEMO_BALANCE: f64 = 10_000.0;

#[derive(Default)]
pub struct WalletLedger {
    // One lock per (user, account_kind) pair would be more concurrent, but
    // wallet mutation is already rare relative to tick/settlement traffic,
    // so a single map lock keeps this simple.
    balances: Mutex<HashMap<(String, AccountKind), f64>>,
}

impl WalletLedger {
    pub fn new() -> Self {
        Self::default()
    }

    /// Seed a wallet balance recovered from persistence, or create a fresh
    /// DEMO balance for a user seen for the first time.
    pub fn restore(&self, wallet: Wallet) {
        self.balances.lock().insert((wallet.user_id, wallet.account_kind), wallet.balance);
    }

    pub fn balance(&self, user_id: &str, account_kind: AccountKind) -> f64 {
        let mut balances = self.balances.lock();
        *balances
            .entry((user_id.to_string(), account_kind))
            .or_insert_with(|| default_balance(account_kind))
    }

    pub fn snapshot(&self, user_id: &str) -> Wallet {
        let balance = self.balance(user_id, AccountKind::Real);
        Wallet { user_id: user_id.to_string(), account_kind: AccountKind::Real, balance }
    }

    /// Snapshot a specific (user, account_kind) balance, for write-through
    /// persistence after a debit/credit.
    pub fn wallet_of(&self, user_id: &str, account_kind: AccountKind) -> Wallet {
        Wallet { user_id: user_id.to_string(), account_kind, balance: self.balance(user_id, account_kind) }
    }

    /// Deduct `amount` from the user's balance, failing with
    /// `CoreError::Validation` if it would go negative.
    pub fn debit(&self, user_id: &str, account_kind: AccountKind, amount: f64) -> Result<f64, CoreError> {
        let mut balances = self.balances.lock();
        let entry = balances.entry((user_id.to_string(), account_kind)).or_insert_with(|| default_balance(account_kind));
        if *entry < amount {
            return Err(CoreError::validation(format!(
                "insufficient {account_kind} balance: have {entry}, need {amount}"
            )));
        }
        *entry -= amount;
        Ok(*entry)
    }

    pub fn credit(&self, user_id: &str, account_kind: AccountKind, amount: f64) -> f64 {
        let mut balances = self.balances.lock();
        let entry = balances.entry((user_id.to_string(), account_kind)).or_insert_with(|| default_balance(account_kind));
        *entry += amount;
        *entry
    }

    pub fn all(&self) -> Vec<Wallet> {
        self.balances
            .lock()
            .iter()
            .map(|((user_id, account_kind), balance)| Wallet {
                user_id: user_id.clone(),
                account_kind: *account_kind,
                balance: *balance,
            })
            .collect()
    }
}

fn default_balance(account_kind: AccountKind) -> f64 {
    match account_kind {
        AccountKind::Demo => DEFAULT_DEMO_BALANCE,
        AccountKind::Real => 0.0,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn new_demo_wallet_starts_funded() {
        let ledger = WalletLedger::new();
        assert_eq!(ledger.balance("alice", AccountKind::Demo), DEFAULT_DEMO_BALANCE);
    }

    #[test]
    fn new_real_wallet_starts_empty() {
        let ledger = WalletLedger::new();
        assert_eq!(ledger.balance("alice", AccountKind::Real), 0.0);
    }

    #[test]
    fn debit_rejects_insufficient_balance() {
        let ledger = WalletLedger::new();
        assert!(ledger.debit("alice", AccountKind::Real, 10.0).is_err());
    }

    #[test]
    fn credit_then_debit_roundtrips() {
        let ledger = WalletLedger::new();
        ledger.credit("alice", AccountKind::Real, 100.0);
        let remaining = ledger.debit("alice", AccountKind::Real, 40.0).unwrap();
        assert_eq!(remaining, 60.0);
    }
}
