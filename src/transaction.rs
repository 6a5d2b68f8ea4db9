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

//! Transactions carried from a client, through its teller, to the server.

use crate::base::BankId;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "lowercase")]
pub enum Operation {
    Deposit,
    Withdraw,
}

impl Operation {
    /// Single-letter token used in the ledger file.
    pub fn ledger_token(self) -> &'static str {
        match self {
            Operation::Deposit => "D",
            Operation::Withdraw => "W",
        }
    }

    pub fn from_ledger_token(token: &str) -> Option<Self> {
        match token {
            "D" => Some(Operation::Deposit),
            "W" => Some(Operation::Withdraw),
            _ => None,
        }
    }
}

impl FromStr for Operation {
    type Err = String;

    /// Parses the words used in client files (`deposit` / `withdraw`).
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "deposit" => Ok(Operation::Deposit),
            "withdraw" | "withdrawal" => Ok(Operation::Withdraw),
            other => Err(format!("unknown operation '{other}'")),
        }
    }
}

impl fmt::Display for Operation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Operation::Deposit => f.write_str("deposit"),
            Operation::Withdraw => f.write_str("withdraw"),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Transaction {
    pub bank_id: BankId,
    pub op: Operation,
    pub amount: u32,
}

impl Transaction {
    pub fn new(bank_id: BankId, op: Operation, amount: u32) -> Self {
        Self { bank_id, op, amount }
    }

    pub fn deposit(bank_id: BankId, amount: u32) -> Self {
        Self::new(bank_id, Operation::Deposit, amount)
    }

    pub fn withdraw(bank_id: BankId, amount: u32) -> Self {
        Self::new(bank_id, Operation::Withdraw, amount)
    }

    /// Effect on the balance: `+amount` for deposits, `-amount` for withdrawals.
    pub fn signed_amount(&self) -> i64 {
        match self.op {
            Operation::Deposit => i64::from(self.amount),
            Operation::Withdraw => -i64::from(self.amount),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn client_file_words_parse() {
        assert_eq!("deposit".parse::<Operation>(), Ok(Operation::Deposit));
        assert_eq!("Withdraw".parse::<Operation>(), Ok(Operation::Withdraw));
        assert!("transfer".parse::<Operation>().is_err());
    }

    #[test]
    fn signed_amount_follows_operation() {
        let id = BankId::numbered(1).unwrap();
        assert_eq!(Transaction::deposit(id.clone(), 40).signed_amount(), 40);
        assert_eq!(Transaction::withdraw(id, 40).signed_amount(), -40);
    }

    #[test]
    fn json_shape_is_stable() {
        let tx = Transaction::deposit(BankId::new("N").unwrap(), 100);
        let json = serde_json::to_string(&tx).unwrap();
        assert_eq!(json, r#"{"bank_id":"N","op":"deposit","amount":100}"#);
    }
}
