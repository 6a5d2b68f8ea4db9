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

//! Error types for the bank server, its tellers and the ledger.

use crate::base::{BankId, TellerId};
use std::io;
use std::path::PathBuf;
use std::time::Duration;
use thiserror::Error;

/// Account lookup and creation errors.
///
/// Insufficient credits is not an error: it is an ordinary
/// [`Response`](crate::Response).
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum TransactionError {
    /// Id is empty, too long, or contains characters the ledger cannot hold
    #[error("invalid bank id '{0}'")]
    InvalidBankId(String),

    /// Returning client presented an id the bank has never issued
    #[error("unknown account '{0}'")]
    UnknownAccount(BankId),

    /// Account table could not grow
    #[error("account table capacity exhausted")]
    CapacityExhausted,
}

/// Ledger file errors.
#[derive(Error, Debug)]
pub enum LedgerError {
    #[error("failed to open ledger {}: {source}", path.display())]
    Open {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("ledger i/o error: {0}")]
    Io(#[from] io::Error),
}

/// Shared-memory mailbox and OS primitive errors.
#[derive(Error, Debug)]
pub enum IpcError {
    #[error("{op} failed: {source}")]
    Os {
        op: &'static str,
        #[source]
        source: io::Error,
    },

    #[error("batch of {requested} tellers exceeds mailbox capacity of {capacity}")]
    BatchTooLarge { requested: usize, capacity: usize },

    #[error("teller {0} has no response slot")]
    NoSuchSlot(TellerId),

    #[error("corrupt mailbox payload: {0}")]
    CorruptPayload(String),
}

impl IpcError {
    /// Captures `errno` for a failed libc call.
    pub(crate) fn last_os_error(op: &'static str) -> Self {
        IpcError::Os {
            op,
            source: io::Error::last_os_error(),
        }
    }
}

/// Errors ending a teller process early.
#[derive(Error, Debug)]
pub enum TellerError {
    #[error("teller channel error: {0}")]
    Channel(#[from] io::Error),

    #[error("malformed message on teller channel: {0}")]
    Codec(#[from] serde_json::Error),

    #[error(transparent)]
    Ipc(#[from] IpcError),

    #[error("request channel closed before a transaction arrived")]
    EmptyRequest,

    #[error("teller {teller} gave up after {waited:?} without a response")]
    Timeout { teller: TellerId, waited: Duration },
}

/// Errors that stop the server.
#[derive(Error, Debug)]
pub enum ServerError {
    #[error(transparent)]
    Ledger(#[from] LedgerError),

    #[error(transparent)]
    Ipc(#[from] IpcError),

    #[error("bootstrap channel error: {0}")]
    Bootstrap(#[from] io::Error),
}
