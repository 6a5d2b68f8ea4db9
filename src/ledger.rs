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

//! Flat-text ledger persistence.
//!
//! One file per bank, `<bank_name>.bankLog`, rewritten wholesale on every
//! flush:
//!
//! ```text
//! # AdaBank log file updated @14:05 March 02 2025
//! BankID_1 D 300 W 100 200
//! # BankID_2 D 30 W 30 0
//! ## end of log.
//! ```
//!
//! Lines starting with a single `#` hold zero-balance accounts. The last
//! integer on a line is the account's credits and wins over the sum of the
//! listed transactions.

use crate::account::Account;
use crate::account_table::AccountTable;
use crate::base::BankId;
use crate::error::LedgerError;
use crate::transaction::{Operation, Transaction};
use std::fmt::Write as _;
use std::fs::{File, OpenOptions};
use std::io::{self, BufRead, BufReader, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};
use tracing::{debug, info, warn};

pub const LEDGER_EXTENSION: &str = "bankLog";

/// Last line of every ledger file.
pub const FOOTER: &str = "## end of log.";

/// Stops a transaction-pair run when it appears in operation position.
const PAIR_SENTINEL: &str = "0";

/// `strftime` pattern of the header timestamp.
const HEADER_TIME_FORMAT: &str = "%H:%M %B %d %Y";

/// Separates the bank name from the timestamp in the header line.
const HEADER_MARKER: &str = " log file updated @";

/// `# <bank_name> log file updated @<timestamp>`, wherever it appears.
fn is_header(line: &str) -> bool {
    line.strip_prefix('#')
        .and_then(|rest| rest.trim_start().split_once(HEADER_MARKER))
        .is_some_and(|(bank_name, _)| !bank_name.is_empty())
}

/// Reads and writes the textual ledger format.
pub struct LedgerCodec;

impl LedgerCodec {
    /// Streams a ledger into a fresh [`AccountTable`].
    ///
    /// Malformed lines are logged and skipped; only I/O failures are errors.
    pub fn read<R: BufRead>(reader: R) -> Result<AccountTable, LedgerError> {
        let mut table = AccountTable::new();

        for (number, line) in reader.split(b'\n').enumerate() {
            let line = line?;
            let text = String::from_utf8_lossy(&line);
            let text = text.trim();

            if text.is_empty() || text.starts_with("##") || is_header(text) {
                continue;
            }
            let body = text.strip_prefix('#').map(str::trim_start).unwrap_or(text);
            if body.is_empty() {
                continue;
            }

            match Self::parse_account(body) {
                Ok(account) => {
                    let bank_id = account.bank_id().clone();
                    if table.insert_loaded(account).is_none() {
                        warn!(line = number + 1, %bank_id, "Skipping duplicate ledger entry");
                    }
                }
                Err(reason) => {
                    warn!(line = number + 1, %reason, "Skipping malformed ledger line");
                }
            }
        }

        Ok(table)
    }

    /// Parses one destuffed line: `<bank_id> (<D|W> <amount>)* <credits>`.
    pub fn parse_account(line: &str) -> Result<Account, String> {
        let tokens: Vec<&str> = line.split_whitespace().collect();
        let (first, rest) = tokens.split_first().ok_or("empty line")?;
        let bank_id = BankId::new(*first).map_err(|e| e.to_string())?;
        let (last, pairs) = rest
            .split_last()
            .ok_or_else(|| format!("{bank_id}: missing credits"))?;
        let credits: i64 = last
            .parse()
            .map_err(|_| format!("{bank_id}: credits '{last}' is not an integer"))?;

        let mut history = Vec::new();
        let mut running: i64 = 0;
        let mut tokens = pairs.iter();
        while let Some(token) = tokens.next() {
            if *token == PAIR_SENTINEL {
                break;
            }
            let Some(op) = Operation::from_ledger_token(token) else {
                continue;
            };
            let Some(amount) = tokens.next() else {
                break;
            };
            let amount: u32 = amount
                .parse()
                .map_err(|_| format!("{bank_id}: amount '{amount}' is not a non-negative integer"))?;
            let transaction = Transaction::new(bank_id.clone(), op, amount);
            running = running.saturating_add(transaction.signed_amount());
            history.push(transaction);
        }

        if running != credits && !history.is_empty() {
            debug!(%bank_id, running, credits, "Ledger balance differs from its history, keeping recorded credits");
        }

        Ok(Account::from_ledger(bank_id, history, credits))
    }

    /// Formats one account line; zero-balance accounts get the leading `#`.
    pub fn format_account(account: &Account) -> String {
        let mut line = String::new();
        if account.is_deleted() {
            line.push_str("# ");
        }
        line.push_str(account.bank_id().as_str());
        for transaction in account.transactions() {
            let _ = write!(
                line,
                " {} {}",
                transaction.op.ledger_token(),
                transaction.amount
            );
        }
        let _ = write!(line, " {}", account.credits());
        line
    }

    /// Writes the whole ledger: header, one line per account, footer.
    pub fn write<W: Write>(
        table: &AccountTable,
        bank_name: &str,
        timestamp: &str,
        mut writer: W,
    ) -> io::Result<()> {
        writeln!(writer, "# {bank_name}{HEADER_MARKER}{timestamp}")?;
        for account in table.iter() {
            writeln!(writer, "{}", Self::format_account(account))?;
        }
        writeln!(writer, "{FOOTER}")?;
        writer.flush()
    }
}

/// The ledger file of one bank instance.
///
/// Owned exclusively by the server process.
#[derive(Debug)]
pub struct Ledger {
    path: PathBuf,
    bank_name: String,
    file: File,
}

impl Ledger {
    pub fn path_for(dir: &Path, bank_name: &str) -> PathBuf {
        dir.join(format!("{bank_name}.{LEDGER_EXTENSION}"))
    }

    /// Opens (or creates) the ledger and loads its accounts.
    ///
    /// # Errors
    ///
    /// Any failure other than a missing file is returned as
    /// [`LedgerError::Open`].
    pub fn open(dir: &Path, bank_name: &str) -> Result<(Self, AccountTable), LedgerError> {
        let path = Self::path_for(dir, bank_name);
        let open_error = |source| LedgerError::Open {
            path: path.clone(),
            source,
        };

        let (file, table) = match OpenOptions::new().read(true).write(true).open(&path) {
            Ok(file) => {
                info!(path = %path.display(), "Previous logs found, loading");
                let table = LedgerCodec::read(BufReader::new(&file))?;
                info!(accounts = table.len(), "Previous log loaded");
                (file, table)
            }
            Err(e) if e.kind() == io::ErrorKind::NotFound => {
                info!(path = %path.display(), "No previous logs, creating the bank database");
                let file = OpenOptions::new()
                    .read(true)
                    .write(true)
                    .create(true)
                    .truncate(false)
                    .open(&path)
                    .map_err(open_error)?;
                (file, AccountTable::new())
            }
            Err(e) => return Err(open_error(e)),
        };

        let ledger = Self {
            path,
            bank_name: bank_name.to_string(),
            file,
        };
        Ok((ledger, table))
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Truncates the file and rewrites every account.
    ///
    /// The content is rendered in memory first, so the file is only touched
    /// by a single truncate followed by one `write_all`.
    pub fn flush(&mut self, table: &AccountTable) -> Result<(), LedgerError> {
        let timestamp = chrono::Local::now().format(HEADER_TIME_FORMAT).to_string();
        let mut buffer = Vec::new();
        LedgerCodec::write(table, &self.bank_name, &timestamp, &mut buffer)?;

        self.file.set_len(0)?;
        self.file.seek(SeekFrom::Start(0))?;
        self.file.write_all(&buffer)?;
        self.file.flush()?;
        debug!(accounts = table.len(), bytes = buffer.len(), "Ledger flushed");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn pair_run_stops_at_sentinel() {
        let account = LedgerCodec::parse_account("BankID_1 D 10 0 W 5 42").unwrap();
        assert_eq!(account.transaction_count(), 1);
        assert_eq!(account.credits(), 42);
    }

    #[test]
    fn unknown_op_tokens_are_skipped() {
        let account = LedgerCodec::parse_account("BankID_1 X D 10 T W 4 6").unwrap();
        let ops: Vec<_> = account.transactions().map(|tx| tx.op).collect();
        assert_eq!(ops, vec![Operation::Deposit, Operation::Withdraw]);
        assert_eq!(account.credits(), 6);
    }

    #[test]
    fn missing_credits_is_malformed() {
        assert!(LedgerCodec::parse_account("BankID_1").is_err());
        assert!(LedgerCodec::parse_account("BankID_1 D 10 W").is_err());
        assert!(LedgerCodec::parse_account("BankID_1 D ten 10").is_err());
    }

    #[test]
    fn header_is_recognized_by_content() {
        assert!(is_header("# AdaBank log file updated @09:00 March 01 2025"));
        assert!(is_header("#Ada Bank log file updated @09:00 March 01 2025"));
        assert!(!is_header("# BankID_2 D 10 W 5 5"));
        assert!(!is_header("BankID_2 D 10 10"));
        assert!(!is_header("# log file updated @09:00"));
    }

    #[test]
    fn deleted_accounts_are_commented() {
        let account = LedgerCodec::parse_account("BankID_7 D 30 W 30 0").unwrap();
        assert_eq!(
            LedgerCodec::format_account(&account),
            "# BankID_7 D 30 W 30 0"
        );
    }
}
