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

//! Core identifier types for accounts, tellers and responses.

use crate::error::TransactionError;
use serde::{Deserialize, Serialize};
use std::fmt;

/// Client token that asks the server to open a brand-new account.
///
/// A returning client whose account happens to be named `N` cannot be told
/// apart from a new one: the token always mints a fresh account.
pub const NEW_ACCOUNT_SENTINEL: &str = "N";

/// Process identifier as handed out by the operating system.
pub type Pid = libc::pid_t;

/// Identifier of a bank account.
///
/// At most [`BankId::MAX_LEN`] bytes, non-empty, without whitespace and not
/// starting with `#` (which marks zero-balance lines in the ledger).
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct BankId(String);

impl BankId {
    pub const MAX_LEN: usize = 19;

    pub fn new(id: impl Into<String>) -> Result<Self, TransactionError> {
        let id = id.into();
        let valid = !id.is_empty()
            && id.len() <= Self::MAX_LEN
            && !id.starts_with('#')
            && !id.chars().any(char::is_whitespace);
        if valid {
            Ok(Self(id))
        } else {
            Err(TransactionError::InvalidBankId(id))
        }
    }

    /// Server-assigned id for the `n`-th account.
    pub fn numbered(n: usize) -> Result<Self, TransactionError> {
        Self::new(format!("BankID_{n}"))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn is_new_account_sentinel(&self) -> bool {
        self.0 == NEW_ACCOUNT_SENTINEL
    }
}

impl TryFrom<String> for BankId {
    type Error = TransactionError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        Self::new(value)
    }
}

impl From<BankId> for String {
    fn from(id: BankId) -> Self {
        id.0
    }
}

impl fmt::Display for BankId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Index of a teller within the active batch.
///
/// Also selects the teller's response slot and private channel pair.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Deserialize, Serialize)]
#[serde(transparent)]
pub struct TellerId(pub u32);

impl TellerId {
    pub fn index(self) -> usize {
        self.0 as usize
    }
}

impl fmt::Display for TellerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Verdict the server publishes for one teller.
///
/// `Initialize` only ever appears while a teller is still waiting.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[repr(u8)]
pub enum Response {
    Initialize = 0,
    Success = 1,
    Failure = 2,
    AccountDeleted = 3,
    InsufficientCredits = 4,
}

impl Response {
    pub fn is_final(self) -> bool {
        self != Response::Initialize
    }
}

impl TryFrom<u8> for Response {
    type Error = u8;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        match value {
            0 => Ok(Response::Initialize),
            1 => Ok(Response::Success),
            2 => Ok(Response::Failure),
            3 => Ok(Response::AccountDeleted),
            4 => Ok(Response::InsufficientCredits),
            other => Err(other),
        }
    }
}

impl fmt::Display for Response {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let text = match self {
            Response::Initialize => "pending",
            Response::Success => "success",
            Response::Failure => "failure",
            Response::AccountDeleted => "account deleted",
            Response::InsufficientCredits => "insufficient credits",
        };
        f.write_str(text)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn bank_id_rejects_long_and_blank_ids() {
        assert!(BankId::new("BankID_1").is_ok());
        assert!(BankId::new("a".repeat(BankId::MAX_LEN)).is_ok());
        assert!(BankId::new("a".repeat(BankId::MAX_LEN + 1)).is_err());
        assert!(BankId::new("").is_err());
        assert!(BankId::new("Bank ID").is_err());
        assert!(BankId::new("#BankID_1").is_err());
    }

    #[test]
    fn sentinel_is_recognized() {
        assert!(BankId::new("N").unwrap().is_new_account_sentinel());
        assert!(!BankId::numbered(1).unwrap().is_new_account_sentinel());
    }

    #[test]
    fn response_survives_byte_conversion() {
        for response in [
            Response::Initialize,
            Response::Success,
            Response::Failure,
            Response::AccountDeleted,
            Response::InsufficientCredits,
        ] {
            assert_eq!(Response::try_from(response as u8), Ok(response));
        }
        assert_eq!(Response::try_from(9), Err(9));
    }
}
