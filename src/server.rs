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

//! Bank server orchestration.
//!
//! The [`Server`] owns the account table, the ledger file and the mailbox.
//! For every enrollment batch it forks one teller per client, drains the
//! mailbox until each teller has been answered or has exited, and reaps the
//! tellers before accepting the next batch.
//!
//! # Shutdown
//!
//! The interrupt handler only raises the flag returned by
//! [`Server::shutdown_flag`]. The main loop notices it between mailbox
//! polls, kills the remaining tellers, flushes the ledger and removes the
//! bootstrap channels.

use crate::account_table::AccountTable;
use crate::base::{Pid, Response, TellerId};
use crate::batch::{Batch, TellerClientMap};
use crate::bootstrap::{EnrollmentSource, TellerChannels};
use crate::config::ServerConfig;
use crate::error::ServerError;
use crate::ledger::Ledger;
use crate::mailbox::{Envelope, Mailbox, Receipt};
use crate::sys::{self, ExitStatus, Fork};
use crate::teller::{self, EXIT_FAILED, Teller};
use crossbeam::utils::Backoff;
use std::path::Path;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread;
use tracing::{debug, error, info, warn};

/// Summary of one batch.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct BatchReport {
    pub enrolled: usize,
    /// Tellers whose request was applied and answered.
    pub served: usize,
    /// Tellers that exited without being served.
    pub abandoned: usize,
    /// Batch refused because it exceeds the mailbox capacity.
    pub rejected: bool,
    /// Draining stopped because shutdown was requested.
    pub interrupted: bool,
}

#[derive(Debug)]
struct TellerProcess {
    teller_id: TellerId,
    pid: Pid,
    served: bool,
    exit: Option<ExitStatus>,
}

impl TellerProcess {
    fn awaiting_service(&self) -> bool {
        !self.served && self.exit.is_none()
    }
}

/// The bank server context.
pub struct Server {
    config: ServerConfig,
    ledger: Ledger,
    table: AccountTable,
    mailbox: Mailbox,
    /// Tellers of the active batch.
    tellers: Vec<TellerProcess>,
    shutdown: Arc<AtomicBool>,
}

impl Server {
    /// Loads the ledger and maps the mailbox.
    ///
    /// # Errors
    ///
    /// Fails when the ledger cannot be opened or read, or the mailbox cannot
    /// be created.
    pub fn open(config: ServerConfig) -> Result<Self, ServerError> {
        let (ledger, table) = Ledger::open(&config.ledger_dir, &config.bank_name)?;
        let mailbox = Mailbox::create(config.max_batch)?;
        info!(
            bank = %config.bank_name,
            accounts = table.len(),
            ledger = %ledger.path().display(),
            "Bank is active"
        );
        Ok(Self {
            config,
            ledger,
            table,
            mailbox,
            tellers: Vec::new(),
            shutdown: Arc::new(AtomicBool::new(false)),
        })
    }

    /// Flag that stops the server once raised.
    pub fn shutdown_flag(&self) -> Arc<AtomicBool> {
        Arc::clone(&self.shutdown)
    }

    pub fn table(&self) -> &AccountTable {
        &self.table
    }

    pub fn ledger_path(&self) -> &Path {
        self.ledger.path()
    }

    pub fn mailbox(&self) -> &Mailbox {
        &self.mailbox
    }

    /// Serves batches until shutdown is requested, then stops.
    ///
    /// [`stop`](Self::stop) runs even when serving fails; the serving error
    /// takes precedence over a failure while stopping.
    pub fn serve<E, C>(&mut self, enrollment: &mut E, channels: &C) -> Result<(), ServerError>
    where
        E: EnrollmentSource,
        C: TellerChannels,
    {
        let served = self.serve_batches(enrollment, channels);
        if let Err(e) = &served {
            error!(error = %e, "Serving stopped on error");
        }
        let stopped = self.stop(enrollment);
        served.and(stopped)
    }

    fn serve_batches<E, C>(&mut self, enrollment: &mut E, channels: &C) -> Result<(), ServerError>
    where
        E: EnrollmentSource,
        C: TellerChannels,
    {
        while !self.shutdown.load(Ordering::SeqCst) {
            let Some(batch) = enrollment.next_batch(&self.shutdown)? else {
                break;
            };
            self.run_batch(&batch, enrollment, channels)?;
        }
        Ok(())
    }

    /// Runs one batch from fork to reap.
    ///
    /// Tellers still alive after an interrupted batch are left for
    /// [`stop`](Self::stop).
    pub fn run_batch<E, C>(
        &mut self,
        batch: &Batch,
        enrollment: &mut E,
        channels: &C,
    ) -> Result<BatchReport, ServerError>
    where
        E: EnrollmentSource,
        C: TellerChannels,
    {
        let mut report = BatchReport {
            enrolled: batch.len(),
            ..BatchReport::default()
        };
        if batch.is_empty() {
            return Ok(report);
        }
        if batch.len() > self.mailbox.capacity() {
            warn!(
                clients = batch.len(),
                capacity = self.mailbox.capacity(),
                "Batch exceeds mailbox capacity, rejected"
            );
            report.rejected = true;
            return Ok(report);
        }

        self.mailbox.begin_batch(batch.len())?;
        let map = self.spawn_tellers(batch, channels);
        if let Err(e) = enrollment.publish(batch, &map) {
            warn!(client_pid = batch.pid, error = %e, "Failed to publish teller map");
        }

        self.drain(&map, &mut report)?;

        if !report.interrupted {
            for teller in self.tellers.iter_mut().filter(|t| t.exit.is_none()) {
                teller.exit = Some(sys::wait(teller.pid)?);
            }
            self.tellers.clear();
        }

        info!(
            enrolled = report.enrolled,
            served = report.served,
            abandoned = report.abandoned,
            interrupted = report.interrupted,
            "Batch finished"
        );
        Ok(report)
    }

    /// Kills live tellers, flushes the ledger and removes bootstrap channels.
    pub fn stop<E: EnrollmentSource>(&mut self, enrollment: &mut E) -> Result<(), ServerError> {
        info!("Stopping, closing active tellers");
        for teller in self.tellers.drain(..).filter(|t| t.exit.is_none()) {
            match sys::force_kill(teller.pid) {
                Ok(true) => debug!(pid = teller.pid, "Teller killed"),
                Ok(false) => debug!(pid = teller.pid, "Teller already gone"),
                Err(e) => warn!(pid = teller.pid, error = %e, "Failed to kill teller"),
            }
            if let Err(e) = sys::wait(teller.pid) {
                warn!(pid = teller.pid, error = %e, "Failed to reap teller");
            }
        }

        info!("Updating log file");
        let flushed = self.ledger.flush(&self.table);
        if let Err(e) = enrollment.cleanup() {
            warn!(error = %e, "Failed to remove bootstrap channels");
        }
        flushed?;

        info!(bank = %self.config.bank_name, "says Bye");
        Ok(())
    }

    fn spawn_tellers<C: TellerChannels>(&mut self, batch: &Batch, channels: &C) -> TellerClientMap {
        let mut map = TellerClientMap::new();
        for (index, client) in batch.clients.iter().enumerate() {
            let teller_id = TellerId(index as u32);
            match sys::fork() {
                Ok(Fork::Child) => {
                    let code = self.teller_body(batch, teller_id, client, channels);
                    sys::exit_immediately(code);
                }
                Ok(Fork::Parent { child }) => {
                    debug!(%teller_id, pid = child, client = %client, "Teller spawned");
                    map.insert(teller_id, client.clone(), child);
                    self.tellers.push(TellerProcess {
                        teller_id,
                        pid: child,
                        served: false,
                        exit: None,
                    });
                }
                Err(e) => {
                    error!(%teller_id, client = %client, error = %e, "Failed to fork teller");
                }
            }
        }
        map
    }

    fn teller_body<C: TellerChannels>(
        &self,
        batch: &Batch,
        teller_id: TellerId,
        client: &str,
        channels: &C,
    ) -> i32 {
        match channels.open(batch, teller_id) {
            Ok((request, response)) => {
                let teller = Teller::new(teller_id, client, &self.mailbox, self.config.teller);
                teller::run(&teller, request, response)
            }
            Err(e) => {
                warn!(%teller_id, client, error = %e, "Teller could not open its channels");
                EXIT_FAILED
            }
        }
    }

    /// Consumes mailbox payloads until no teller is waiting for service.
    fn drain(&mut self, map: &TellerClientMap, report: &mut BatchReport) -> Result<(), ServerError> {
        let backoff = Backoff::new();
        while self.tellers.iter().any(TellerProcess::awaiting_service) {
            if self.shutdown.load(Ordering::SeqCst) {
                report.interrupted = true;
                return Ok(());
            }

            let Self {
                mailbox,
                table,
                ledger,
                ..
            } = self;
            let taken = mailbox.try_take(|envelope| process_envelope(table, ledger, map, envelope))?;

            if let Some(receipt) = taken {
                self.record_receipt(&receipt, report);
                backoff.reset();
                continue;
            }

            self.reap_finished(report)?;
            if backoff.is_completed() {
                thread::sleep(self.config.poll_interval);
            } else {
                backoff.snooze();
            }
        }
        Ok(())
    }

    fn record_receipt(&mut self, receipt: &Receipt, report: &mut BatchReport) {
        if receipt.response.is_none() {
            return;
        }
        if let Some(teller) = self
            .tellers
            .iter_mut()
            .find(|t| t.pid == receipt.teller_pid && t.teller_id == receipt.teller_id)
        {
            teller.served = true;
            report.served += 1;
        }
    }

    fn reap_finished(&mut self, report: &mut BatchReport) -> Result<(), ServerError> {
        for teller in self.tellers.iter_mut().filter(|t| t.exit.is_none()) {
            if let Some(status) = sys::try_wait(teller.pid)? {
                teller.exit = Some(status);
                if !teller.served {
                    warn!(teller_id = %teller.teller_id, pid = teller.pid, ?status, "Teller exited without being served");
                    report.abandoned += 1;
                }
            }
        }
        Ok(())
    }
}

/// Applies one mailbox payload; runs inside the mailbox critical section.
fn process_envelope(
    table: &mut AccountTable,
    ledger: &mut Ledger,
    map: &TellerClientMap,
    envelope: &Envelope,
) -> Option<Response> {
    let Some(assignment) = map
        .by_pid(envelope.teller_pid)
        .filter(|a| a.teller_id == envelope.teller_id)
    else {
        warn!(
            teller_id = %envelope.teller_id,
            pid = envelope.teller_pid,
            "Discarding payload from a teller outside the active batch"
        );
        return None;
    };

    let transaction = &envelope.transaction;
    // The enrolled client name decides the account; the request must agree.
    if transaction.bank_id.as_str() != assignment.client {
        warn!(
            client = %assignment.client,
            bank_id = %transaction.bank_id,
            "Request does not match the enrolled client, rejected"
        );
        return Some(Response::Failure);
    }

    let response = match table.get_or_create(&assignment.client) {
        Ok(index) => {
            let response = table.apply(index, transaction);
            if let Some(account) = table.get(index) {
                info!(
                    client = %assignment.client,
                    bank_id = %account.bank_id(),
                    op = %transaction.op,
                    amount = transaction.amount,
                    credits = account.credits(),
                    %response,
                    "Transaction processed"
                );
            }
            response
        }
        Err(e) => {
            warn!(client = %assignment.client, error = %e, "Transaction rejected");
            Response::Failure
        }
    };

    if let Err(e) = ledger.flush(table) {
        error!(error = %e, "Failed to persist ledger");
    }
    Some(response)
}
