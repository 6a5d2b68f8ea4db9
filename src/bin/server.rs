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

use anyhow::{Context, Result};
use clap::Parser;
use std::path::PathBuf;
use std::sync::atomic::Ordering;
use std::time::Duration;
use teller_bank_rs::{FifoEnrollment, Server, ServerConfig, TellerConfig};
use tracing_subscriber::EnvFilter;

/// Bank Server - serve client transactions with one teller process each
///
/// Loads `<BANK_NAME>.bankLog`, then accepts client batches on a named pipe
/// until interrupted.
#[derive(Parser, Debug)]
#[command(name = "bank-server")]
#[command(about = "A bank server that forks a teller per client transaction", long_about = None)]
struct Args {
    /// Name of the bank
    #[arg(value_name = "BANK_NAME")]
    bank_name: String,

    /// Named pipe clients enroll through
    ///
    /// Example: cargo run --bin bank-server -- AdaBank /tmp/adabank.fifo
    #[arg(value_name = "SERVER_FIFO")]
    server_fifo: PathBuf,

    /// Directory holding the ledger file
    #[arg(long, default_value = ".")]
    ledger_dir: PathBuf,

    /// Largest number of clients accepted in one batch
    #[arg(long, default_value_t = 64)]
    max_batch: usize,

    /// Idle sleep between mailbox polls, in milliseconds
    #[arg(long, default_value_t = 10)]
    poll_ms: u64,

    /// Seconds a teller waits for the server before answering failure
    #[arg(long, default_value_t = 30)]
    teller_timeout_secs: u64,
}

impl Args {
    fn config(&self) -> ServerConfig {
        let poll_interval = Duration::from_millis(self.poll_ms);
        ServerConfig {
            bank_name: self.bank_name.clone(),
            ledger_dir: self.ledger_dir.clone(),
            max_batch: self.max_batch,
            poll_interval,
            teller: TellerConfig {
                poll_interval,
                response_timeout: Duration::from_secs(self.teller_timeout_secs),
            },
        }
    }
}

fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let args = Args::parse();

    let mut server = Server::open(args.config())
        .with_context(|| format!("failed to start bank '{}'", args.bank_name))?;

    let shutdown = server.shutdown_flag();
    ctrlc::set_handler(move || shutdown.store(true, Ordering::SeqCst))
        .context("failed to install signal handler")?;

    let mut enrollment = FifoEnrollment::create(&args.server_fifo)
        .with_context(|| format!("failed to create {}", args.server_fifo.display()))?;
    let channels = enrollment.channels();

    server.serve(&mut enrollment, &channels)?;
    Ok(())
}
