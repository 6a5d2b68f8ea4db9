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

//! In-memory account registry.
//!
//! The [`AccountTable`] is the canonical set of accounts owned by the server.
//! Accounts are kept in creation order, which is also the order they are
//! written back to the ledger.
//!
//! # Account Creation
//!
//! - **Ledger load**: every parsed line becomes an account via [`AccountTable::insert_loaded`].
//! - **New client**: the [`NEW_ACCOUNT_SENTINEL`] token mints `BankID_<n>`.
//! - **Returning client**: must present an id already in the table.

use crate::account::Account;
use crate::base::{BankId, NEW_ACCOUNT_SENTINEL, Response};
use crate::error::TransactionError;
use crate::transaction::Transaction;
use std::collections::HashMap;

/// Registry of accounts indexed by bank id.
///
/// # Invariants
///
/// - Accounts are never removed; zero-balance accounts stay resident.
/// - Every index handed out stays valid for the lifetime of the table.
#[derive(Debug, Default, Clone)]
pub struct AccountTable {
    accounts: Vec<Account>,
    index: HashMap<BankId, usize>,
}

impl AccountTable {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.accounts.len()
    }

    pub fn is_empty(&self) -> bool {
        self.accounts.is_empty()
    }

    pub fn find(&self, bank_id: &BankId) -> Option<usize> {
        self.index.get(bank_id).copied()
    }

    pub fn get(&self, index: usize) -> Option<&Account> {
        self.accounts.get(index)
    }

    pub fn get_by_id(&self, bank_id: &BankId) -> Option<&Account> {
        self.find(bank_id).and_then(|index| self.get(index))
    }

    /// Returns an iterator over all accounts in creation order.
    pub fn iter(&self) -> impl Iterator<Item = &Account> {
        self.accounts.iter()
    }

    /// Resolves the account a client token refers to.
    ///
    /// # Errors
    ///
    /// - [`TransactionError::InvalidBankId`] - Token is not a usable id.
    /// - [`TransactionError::UnknownAccount`] - Token names an account the bank never issued.
    /// - [`TransactionError::CapacityExhausted`] - The table could not grow.
    pub fn get_or_create(&mut self, token: &str) -> Result<usize, TransactionError> {
        if token == NEW_ACCOUNT_SENTINEL {
            let bank_id = self.next_free_id()?;
            return self.insert(Account::new(bank_id));
        }

        let bank_id = BankId::new(token)?;
        self.find(&bank_id)
            .ok_or(TransactionError::UnknownAccount(bank_id))
    }

    /// Adds an account read from the ledger.
    ///
    /// Returns `None` when the id is already present; the first occurrence wins.
    pub fn insert_loaded(&mut self, account: Account) -> Option<usize> {
        if self.index.contains_key(account.bank_id()) {
            return None;
        }
        self.insert(account).ok()
    }

    /// Applies a transaction to the account at `index`.
    ///
    /// Returns [`Response::Failure`] for an index this table never handed out.
    pub fn apply(&mut self, index: usize, transaction: &Transaction) -> Response {
        match self.accounts.get_mut(index) {
            Some(account) => account.apply(transaction),
            None => Response::Failure,
        }
    }

    fn insert(&mut self, account: Account) -> Result<usize, TransactionError> {
        // Doubling growth; a failed reservation is reported instead of aborting.
        if self.accounts.len() == self.accounts.capacity() {
            let additional = self.accounts.capacity().max(4);
            self.accounts
                .try_reserve_exact(additional)
                .map_err(|_| TransactionError::CapacityExhausted)?;
        }
        self.index
            .try_reserve(1)
            .map_err(|_| TransactionError::CapacityExhausted)?;

        let position = self.accounts.len();
        self.index.insert(account.bank_id().clone(), position);
        self.accounts.push(account);
        Ok(position)
    }

    fn next_free_id(&self) -> Result<BankId, TransactionError> {
        let mut n = self.accounts.len() + 1;
        loop {
            let candidate = BankId::numbered(n)?;
            if !self.index.contains_key(&candidate) {
                return Ok(candidate);
            }
            n += 1;
        }
    }
}
