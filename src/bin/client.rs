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

use anyhow::{Context, Result, anyhow, bail};
use clap::Parser;
use csv::{ReaderBuilder, Trim};
use serde::Deserialize;
use std::fs::{self, File, OpenOptions};
use std::io::{BufRead, BufReader, Read, Write};
use std::path::{Path, PathBuf};
use teller_bank_rs::bootstrap::{client_fifo, fifo_dir, request_fifo, response_fifo};
use teller_bank_rs::{
    BankId, Batch, Operation, Pid, Response, TellerClientMap, TellerId, Transaction, sys,
};
use tracing::{debug, warn};
use tracing_subscriber::EnvFilter;

/// Bank Client - enroll a batch of clients with a bank server
///
/// Each line of the client file is one client and its transaction.
#[derive(Parser, Debug)]
#[command(name = "bank-client")]
#[command(about = "Sends a file of client transactions to a bank server", long_about = None)]
struct Args {
    /// Path to the client file
    ///
    /// Expected format: <id> <deposit|withdraw> <amount>, where id is `N` for
    /// a new account or a bank id such as BankID_3.
    #[arg(value_name = "CLIENT_FILE")]
    client_file: PathBuf,

    /// Named pipe of the bank server
    #[arg(value_name = "SERVER_FIFO")]
    server_fifo: PathBuf,
}

/// Raw client file record.
///
/// Fields: `id operation amount`
#[derive(Debug, Deserialize)]
struct ClientRecord {
    id: String,
    operation: String,
    amount: u32,
}

impl ClientRecord {
    fn into_transaction(self) -> Result<Transaction> {
        let op: Operation = self.operation.parse().map_err(|e: String| anyhow!(e))?;
        Ok(Transaction::new(BankId::new(self.id)?, op, self.amount))
    }
}

fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn")),
        )
        .init();

    let args = Args::parse();

    println!("Reading {}...", args.client_file.display());
    let file = File::open(&args.client_file)
        .with_context(|| format!("failed to open client file '{}'", args.client_file.display()))?;
    let transactions = read_clients(BufReader::new(file))?;
    if transactions.is_empty() {
        bail!("no clients in '{}'", args.client_file.display());
    }
    println!("{} clients to connect.. creating clients..", transactions.len());

    let pid = sys::current_pid();
    let dir = fifo_dir(&args.server_fifo);
    let fifos = create_fifos(&dir, pid, transactions.len())?;

    let outcome = run_session(&args.server_fifo, &dir, pid, &transactions);

    for path in fifos {
        let _ = fs::remove_file(path);
    }
    outcome?;
    println!("exiting..");
    Ok(())
}

/// Parses a space-separated client file; bad lines are skipped.
fn read_clients<R: Read>(reader: R) -> Result<Vec<Transaction>> {
    let mut rdr = ReaderBuilder::new()
        .delimiter(b' ')
        .trim(Trim::All)
        .flexible(true)
        .has_headers(false)
        .from_reader(reader);

    let mut transactions = Vec::new();
    for (line, record) in rdr.deserialize::<ClientRecord>().enumerate() {
        match record
            .map_err(anyhow::Error::from)
            .and_then(ClientRecord::into_transaction)
        {
            Ok(tx) => transactions.push(tx),
            Err(e) => warn!(line = line + 1, error = %e, "Skipping client line"),
        }
    }
    Ok(transactions)
}

fn create_fifos(dir: &Path, pid: Pid, count: usize) -> Result<Vec<PathBuf>> {
    let mut paths = vec![client_fifo(dir, pid)];
    for index in 0..count {
        let teller_id = TellerId(index as u32);
        paths.push(request_fifo(dir, pid, teller_id));
        paths.push(response_fifo(dir, pid, teller_id));
    }
    for path in &paths {
        sys::make_fifo(path).with_context(|| format!("failed to create {}", path.display()))?;
    }
    Ok(paths)
}

fn run_session(server_fifo: &Path, dir: &Path, pid: Pid, transactions: &[Transaction]) -> Result<()> {
    let batch = Batch::new(
        pid,
        transactions
            .iter()
            .map(|tx| tx.bank_id.to_string())
            .collect(),
    );

    let mut server = OpenOptions::new()
        .write(true)
        .open(server_fifo)
        .with_context(|| format!("cannot connect to {}", server_fifo.display()))?;
    let mut enrollment = serde_json::to_vec(&batch)?;
    enrollment.push(b'\n');
    server.write_all(&enrollment)?;
    drop(server);
    println!("Connected to {}..", server_fifo.display());

    let mut reply = String::new();
    BufReader::new(File::open(client_fifo(dir, pid))?).read_line(&mut reply)?;
    let map: TellerClientMap = serde_json::from_str(reply.trim())
        .context("server sent a malformed teller map")?;
    debug!(tellers = map.len(), "Teller map received");

    for (index, transaction) in transactions.iter().enumerate() {
        let teller_id = TellerId(index as u32);
        let label = format!("Client{:02}", index + 1);

        if map.by_teller(teller_id).is_none() {
            println!("{label} was not assigned a teller");
            continue;
        }

        let mut request = OpenOptions::new()
            .write(true)
            .open(request_fifo(dir, pid, teller_id))?;
        let mut line = serde_json::to_vec(transaction)?;
        line.push(b'\n');
        request.write_all(&line)?;
        drop(request);

        let mut answer = String::new();
        BufReader::new(File::open(response_fifo(dir, pid, teller_id))?).read_line(&mut answer)?;
        match serde_json::from_str::<Response>(answer.trim()) {
            Ok(response) => println!(
                "{label} connected..{} {} credits.. {response}",
                transaction.op, transaction.amount
            ),
            Err(_) => println!("{label} lost its teller before an answer arrived"),
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Cursor;

    #[test]
    fn parse_client_file() {
        let input = "N deposit 300\nBankID_1 withdraw 30\n";
        let transactions = read_clients(Cursor::new(input)).unwrap();
        assert_eq!(transactions.len(), 2);
        assert!(transactions[0].bank_id.is_new_account_sentinel());
        assert_eq!(transactions[1].op, Operation::Withdraw);
        assert_eq!(transactions[1].amount, 30);
    }

    #[test]
    fn skip_malformed_client_lines() {
        let input = "N deposit 300\nN transfer 10\nN deposit lots\nBankID_2 deposit 5\n";
        let transactions = read_clients(Cursor::new(input)).unwrap();
        assert_eq!(transactions.len(), 2);
        assert_eq!(transactions[1].bank_id.as_str(), "BankID_2");
    }
}
