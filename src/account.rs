// SPDX-License-Identifier: AGPL-3.0-or-later
//
// Copyright (C) 2025 Daniel Negri
//
// This program is free software: you can redistribute it and/or modify
// it under the terms of the GNU Affero General Public License as published by
// the Free Software Foundation, either version 3 of the License, or
// (at your option) any later version.
//
// This program is distributed in the hope that it will be useful,
// but WITHOUT ANY WARRANTY; without even the implied warranty of
// MERCHANTABILITY or FITNESS FOR A PARTICULAR PURPOSE. See the
// GNU Affero General Public License for more details.
//
// You should have received a copy of the GNU Affero General Public License
// along with this program. If not, see <https://www.gnu.org/licenses/>.

//! Account management.
//!
//! An account holds a signed credit balance and a bounded history of the
//! transactions applied to it. A balance of exactly zero marks the account
//! as deleted; it stays resident and can be revived by a deposit.
//!
//! # Example
//!
//! ```
//! use teller_bank_rs::{Account, BankId, Response, Transaction};
//!
//! let id = BankId::numbered(1).unwrap();
//! let mut account = Account::new(id.clone());
//! assert_eq!(account.apply(&Transaction::deposit(id.clone(), 30)), Response::Success);
//! assert_eq!(account.apply(&Transaction::withdraw(id, 30)), Response::AccountDeleted);
//! assert!(account.is_deleted());
//! ```

use crate::base::{BankId, Response};
use crate::transaction::{Operation, Transaction};
use std::collections::VecDeque;

/// Ledger account.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Account {
    bank_id: BankId,
    credits: i64,
    /// Most recent transactions, oldest first.
    transactions: VecDeque<Transaction>,
    transaction_count: usize,
}

impl Account {
    /// Number of transactions kept in the history.
    pub const HISTORY_LIMIT: usize = 1024;

    pub fn new(bank_id: BankId) -> Self {
        Self {
            bank_id,
            credits: 0,
            transactions: VecDeque::new(),
            transaction_count: 0,
        }
    }

    /// Rebuilds an account from a ledger line.
    ///
    /// `credits` is taken as-is; it is not recomputed from `history`.
    pub fn from_ledger(
        bank_id: BankId,
        history: impl IntoIterator<Item = Transaction>,
        credits: i64,
    ) -> Self {
        let mut account = Self::new(bank_id);
        for transaction in history {
            account.record(transaction);
        }
        account.credits = credits;
        account
    }

    pub fn bank_id(&self) -> &BankId {
        &self.bank_id
    }

    pub fn credits(&self) -> i64 {
        self.credits
    }

    /// Zero-balance accounts are soft-deleted.
    pub fn is_deleted(&self) -> bool {
        self.credits == 0
    }

    pub fn transactions(&self) -> impl Iterator<Item = &Transaction> {
        self.transactions.iter()
    }

    /// Total number of transactions recorded, including those evicted from
    /// the history.
    pub fn transaction_count(&self) -> usize {
        self.transaction_count
    }

    /// Applies a transaction to the balance.
    ///
    /// | Operation | Outcome |
    /// |-----------|---------|
    /// | Deposit | `Success`, or `AccountDeleted` when the balance lands on zero |
    /// | Withdraw | `InsufficientCredits` without mutation when `amount > credits` |
    ///
    /// The recorded copy carries this account's id, so a transaction submitted
    /// under the new-account sentinel is filed under the minted id.
    pub fn apply(&mut self, transaction: &Transaction) -> Response {
        let outcome = match transaction.op {
            Operation::Deposit => self.deposit(transaction.amount),
            Operation::Withdraw => self.withdraw(transaction.amount),
        };
        if outcome != Response::Success {
            return outcome;
        }

        self.record(Transaction::new(
            self.bank_id.clone(),
            transaction.op,
            transaction.amount,
        ));

        if self.credits == 0 {
            Response::AccountDeleted
        } else {
            Response::Success
        }
    }

    fn deposit(&mut self, amount: u32) -> Response {
        match self.credits.checked_add(i64::from(amount)) {
            Some(credits) => {
                self.credits = credits;
                Response::Success
            }
            None => Response::Failure,
        }
    }

    fn withdraw(&mut self, amount: u32) -> Response {
        let amount = i64::from(amount);
        if amount > self.credits {
            return Response::InsufficientCredits;
        }
        self.credits -= amount;
        Response::Success
    }

    fn record(&mut self, transaction: Transaction) {
        if self.transactions.len() == Self::HISTORY_LIMIT {
            self.transactions.pop_front();
        }
        self.transactions.push_back(transaction);
        self.transaction_count += 1;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn id() -> BankId {
        BankId::numbered(1).unwrap()
    }

    #[test]
    fn history_is_bounded_but_count_is_not() {
        let mut account = Account::new(id());
        for _ in 0..Account::HISTORY_LIMIT + 5 {
            account.apply(&Transaction::deposit(id(), 1));
        }
        assert_eq!(account.transactions().count(), Account::HISTORY_LIMIT);
        assert_eq!(account.transaction_count(), Account::HISTORY_LIMIT + 5);
        assert_eq!(account.credits(), (Account::HISTORY_LIMIT + 5) as i64);
    }

    #[test]
    fn deposit_overflow_is_a_failure() {
        let mut account = Account::from_ledger(id(), Vec::new(), i64::MAX);
        let result = account.apply(&Transaction::deposit(id(), 1));
        assert_eq!(result, Response::Failure);
        assert_eq!(account.credits(), i64::MAX);
        assert_eq!(account.transaction_count(), 0);
    }

    #[test]
    fn sentinel_transactions_are_filed_under_own_id() {
        let mut account = Account::new(id());
        let sentinel = BankId::new("N").unwrap();
        account.apply(&Transaction::deposit(sentinel, 5));
        let recorded = account.transactions().next().unwrap();
        assert_eq!(recorded.bank_id, id());
    }

    #[test]
    fn from_ledger_trusts_trailing_credits() {
        let history = vec![Transaction::deposit(id(), 10), Transaction::withdraw(id(), 5)];
        let account = Account::from_ledger(id(), history, 7);
        assert_eq!(account.credits(), 7);
        assert_eq!(account.transaction_count(), 2);
    }

    #[test]
    fn failed_withdraw_records_nothing() {
        let mut account = Account::new(id());
        account.apply(&Transaction::deposit(id(), 50));
        assert_eq!(
            account.apply(&Transaction::withdraw(id(), 80)),
            Response::InsufficientCredits
        );
        assert_eq!(account.transaction_count(), 1);
    }
}
