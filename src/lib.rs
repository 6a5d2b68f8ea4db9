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

//! # Teller Bank
//!
//! A bank server that serves each client transaction with its own short-lived
//! teller process. Tellers hand their transaction to the server through a
//! single-slot shared-memory [`Mailbox`] guarded by a process-shared
//! semaphore; the server applies it to the [`AccountTable`], rewrites the
//! [`Ledger`] and publishes the [`Response`] the teller relays to its client.
//!
//! ## Core Components
//!
//! - [`LedgerCodec`]: reads and writes the flat-text `.bankLog` file
//! - [`AccountTable`]: in-memory accounts, including sentinel-driven creation
//! - [`Mailbox`]: the teller/server handoff and the per-teller response table
//! - [`Teller`]: the per-transaction worker
//! - [`Server`]: ledger, mailbox and teller lifecycle
//!
//! ## Example
//!
//! ```
//! use teller_bank_rs::{AccountTable, NEW_ACCOUNT_SENTINEL, Response, Transaction};
//!
//! let mut table = AccountTable::new();
//! let index = table.get_or_create(NEW_ACCOUNT_SENTINEL).unwrap();
//! let id = table.get(index).unwrap().bank_id().clone();
//!
//! assert_eq!(table.apply(index, &Transaction::deposit(id.clone(), 100)), Response::Success);
//! assert_eq!(table.get_by_id(&id).unwrap().credits(), 100);
//! ```
//!
//! ## Processes
//!
//! Tellers are real OS processes created with `fork`; the server itself is
//! single-threaded. Only the mailbox mapping is shared between them. This
//! crate therefore targets Unix platforms with process-shared POSIX
//! semaphores (Linux).

pub mod account;
mod account_table;
mod base;
pub mod batch;
pub mod bootstrap;
pub mod config;
pub mod error;
pub mod ledger;
pub mod mailbox;
pub mod server;
pub mod sys;
pub mod teller;
mod transaction;

pub use account::Account;
pub use account_table::AccountTable;
pub use base::{BankId, NEW_ACCOUNT_SENTINEL, Pid, Response, TellerId};
pub use batch::{Batch, TellerAssignment, TellerClientMap};
pub use bootstrap::{EnrollmentSource, FifoChannels, FifoEnrollment, TellerChannels};
pub use config::{ServerConfig, TellerConfig};
pub use error::{IpcError, LedgerError, ServerError, TellerError, TransactionError};
pub use ledger::{Ledger, LedgerCodec};
pub use mailbox::{Envelope, Mailbox, Receipt, Retraction};
pub use server::{BatchReport, Server};
pub use teller::Teller;
pub use transaction::{Operation, Transaction};
