//! Per-account credit balances with reserve/commit/release semantics.
//!
//! Admission reserves the job's cost before any remote work starts. A
//! successful pipeline commits the reservation into a permanent deduction; a
//! failed one releases it. Every mutation appends an immutable
//! [`LedgerEntry`].
//!
//! All state sits behind one lock, so the availability check and the
//! reservation increment happen as a single step. Two concurrent reserves
//! against the same account can never both observe the same headroom.

use std::collections::HashMap;

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::credits::Credits;
use crate::error::EngineError;

pub type ReservationId = Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EntryKind {
    Reserve,
    Commit,
    Release,
    Grant,
}

/// Append-only audit record of a ledger mutation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LedgerEntry {
    pub account_id: String,
    pub kind: EntryKind,
    pub amount: Credits,
    pub job_id: Option<Uuid>,
    pub reservation_id: Option<ReservationId>,
    /// Where granted credits came from (purchase, bonus, ...).
    pub source: Option<String>,
    pub timestamp: DateTime<Utc>,
}

/// Point-in-time view of an account.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct AccountSnapshot {
    pub balance: Credits,
    pub reserved: Credits,
    pub available: Credits,
    pub unlimited: bool,
}

#[derive(Debug, Default)]
struct Account {
    balance: Credits,
    reserved: Credits,
    unlimited: bool,
}

impl Account {
    fn available(&self) -> Credits {
        self.balance.saturating_sub(self.reserved)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ReservationState {
    Open,
    Committed,
    Released,
}

#[derive(Debug)]
struct Reservation {
    account_id: String,
    amount: Credits,
    job_id: Option<Uuid>,
    state: ReservationState,
    /// Unlimited accounts never hold funds; their reservations only log.
    holds_funds: bool,
}

#[derive(Debug, Default)]
struct LedgerState {
    accounts: HashMap<String, Account>,
    reservations: HashMap<ReservationId, Reservation>,
    entries: Vec<LedgerEntry>,
}

impl LedgerState {
    fn record(
        &mut self,
        account_id: &str,
        kind: EntryKind,
        amount: Credits,
        job_id: Option<Uuid>,
        reservation_id: Option<ReservationId>,
        source: Option<String>,
    ) {
        self.entries.push(LedgerEntry {
            account_id: account_id.to_string(),
            kind,
            amount,
            job_id,
            reservation_id,
            source,
            timestamp: Utc::now(),
        });
    }
}

#[derive(Debug, Default)]
pub struct CreditLedger {
    state: Mutex<LedgerState>,
}

impl CreditLedger {
    pub fn new() -> Self {
        Self::default()
    }

    /// Creates an account if it does not exist yet. Existing accounts keep
    /// their balance; only the unlimited flag is updated.
    pub fn open_account(&self, account_id: &str, unlimited: bool) {
        let mut state = self.state.lock();
        state
            .accounts
            .entry(account_id.to_string())
            .or_default()
            .unlimited = unlimited;
    }

    /// Adds credits to an account, creating it when needed.
    pub fn grant(&self, account_id: &str, amount: Credits, source: &str) {
        let mut state = self.state.lock();
        let account = state.accounts.entry(account_id.to_string()).or_default();
        account.balance = account.balance + amount;
        let balance = account.balance;
        state.record(
            account_id,
            EntryKind::Grant,
            amount,
            None,
            None,
            Some(source.to_string()),
        );
        info!(account_id, %amount, %balance, source, "credits granted");
    }

    /// Holds `amount` against the account's available balance.
    ///
    /// Fails with [`EngineError::InsufficientBalance`] without mutating
    /// anything when the account cannot cover it.
    pub fn reserve(
        &self,
        account_id: &str,
        amount: Credits,
        job_id: Option<Uuid>,
    ) -> Result<ReservationId, EngineError> {
        let mut state = self.state.lock();
        let account = state
            .accounts
            .get_mut(account_id)
            .ok_or_else(|| EngineError::AccountNotFound(account_id.to_string()))?;

        let holds_funds = !account.unlimited;
        if holds_funds {
            let available = account.available();
            if available < amount {
                debug!(account_id, %amount, %available, "reservation rejected");
                return Err(EngineError::InsufficientBalance {
                    account_id: account_id.to_string(),
                    requested: amount,
                    available,
                });
            }
            account.reserved = account.reserved + amount;
        }

        let id = Uuid::new_v4();
        state.reservations.insert(
            id,
            Reservation {
                account_id: account_id.to_string(),
                amount,
                job_id,
                state: ReservationState::Open,
                holds_funds,
            },
        );
        state.record(account_id, EntryKind::Reserve, amount, job_id, Some(id), None);
        debug!(account_id, %amount, reservation = %id, "credits reserved");
        Ok(id)
    }

    /// Turns a reservation into a permanent deduction.
    ///
    /// Returns `Ok(false)` when the reservation was already settled;
    /// committing twice is a no-op.
    pub fn commit(&self, reservation_id: ReservationId) -> Result<bool, EngineError> {
        self.settle(reservation_id, ReservationState::Committed)
    }

    /// Returns a reservation's amount to the available balance.
    ///
    /// Returns `Ok(false)` when the reservation was already settled.
    pub fn release(&self, reservation_id: ReservationId) -> Result<bool, EngineError> {
        self.settle(reservation_id, ReservationState::Released)
    }

    /// True while a reservation is neither committed nor released.
    pub fn is_open(&self, reservation_id: ReservationId) -> bool {
        self.state
            .lock()
            .reservations
            .get(&reservation_id)
            .is_some_and(|r| r.state == ReservationState::Open)
    }

    fn settle(
        &self,
        reservation_id: ReservationId,
        target: ReservationState,
    ) -> Result<bool, EngineError> {
        let mut state = self.state.lock();
        let reservation = state
            .reservations
            .get_mut(&reservation_id)
            .ok_or(EngineError::ReservationNotFound(reservation_id))?;

        if reservation.state != ReservationState::Open {
            if reservation.state != target {
                warn!(
                    reservation = %reservation_id,
                    state = ?reservation.state,
                    requested = ?target,
                    "reservation already settled the other way"
                );
            }
            return Ok(false);
        }
        reservation.state = target;
        let account_id = reservation.account_id.clone();
        let amount = reservation.amount;
        let job_id = reservation.job_id;
        let holds_funds = reservation.holds_funds;

        if holds_funds && let Some(account) = state.accounts.get_mut(&account_id) {
            account.reserved = account.reserved.saturating_sub(amount);
            if target == ReservationState::Committed {
                account.balance = account.balance.saturating_sub(amount);
            }
        }

        let kind = match target {
            ReservationState::Committed => EntryKind::Commit,
            _ => EntryKind::Release,
        };
        state.record(&account_id, kind, amount, job_id, Some(reservation_id), None);
        debug!(account_id, %amount, reservation = %reservation_id, ?kind, "reservation settled");
        Ok(true)
    }

    pub fn account(&self, account_id: &str) -> Option<AccountSnapshot> {
        let state = self.state.lock();
        state.accounts.get(account_id).map(|a| AccountSnapshot {
            balance: a.balance,
            reserved: a.reserved,
            available: a.available(),
            unlimited: a.unlimited,
        })
    }

    /// Audit trail for one account, oldest first.
    pub fn entries(&self, account_id: &str) -> Vec<LedgerEntry> {
        let state = self.state.lock();
        state
            .entries
            .iter()
            .filter(|e| e.account_id == account_id)
            .cloned()
            .collect()
    }
}
