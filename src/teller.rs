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

//! One-shot teller worker.
//!
//! A teller bridges its client's private request channel to the mailbox and
//! the server's verdict back to the client's private response channel. Both
//! channels carry a single JSON document followed by a newline.

use crate::base::{Response, TellerId};
use crate::config::TellerConfig;
use crate::error::TellerError;
use crate::mailbox::{Envelope, Mailbox, Retraction};
use crate::sys;
use crate::transaction::Transaction;
use std::io::{BufRead, BufReader, Read, Write};
use std::time::Instant;
use tracing::{debug, info, warn};

/// Exit code of a teller that delivered a final response.
pub const EXIT_SERVED: i32 = 0;
/// Exit code of a teller that failed before delivering one.
pub const EXIT_FAILED: i32 = 1;

pub struct Teller<'a> {
    id: TellerId,
    client: &'a str,
    mailbox: &'a Mailbox,
    config: TellerConfig,
}

impl<'a> Teller<'a> {
    pub fn new(id: TellerId, client: &'a str, mailbox: &'a Mailbox, config: TellerConfig) -> Self {
        Self {
            id,
            client,
            mailbox,
            config,
        }
    }

    pub fn id(&self) -> TellerId {
        self.id
    }

    /// Reads one transaction, hands it to the server and relays the verdict.
    ///
    /// A teller that gives up relays [`Response::Failure`] before returning
    /// the timeout error, so the client is never left without an answer.
    pub fn serve<R: Read, W: Write>(
        &self,
        request: R,
        mut response: W,
    ) -> Result<Response, TellerError> {
        let transaction = read_request(request)?;
        debug!(teller = %self.id, client = self.client, ?transaction, "Request received");

        match self.submit(transaction) {
            Ok(verdict) => {
                write_response(&mut response, verdict)?;
                Ok(verdict)
            }
            Err(e @ TellerError::Timeout { .. }) => {
                write_response(&mut response, Response::Failure)?;
                Err(e)
            }
            Err(e) => Err(e),
        }
    }

    /// Posts `transaction` to the mailbox and waits for its response.
    ///
    /// # Errors
    ///
    /// [`TellerError::Timeout`] when the deadline passes and the request could
    /// be withdrawn unprocessed.
    pub fn submit(&self, transaction: Transaction) -> Result<Response, TellerError> {
        let started = Instant::now();
        let deadline = started + self.config.response_timeout;
        let envelope = Envelope {
            teller_id: self.id,
            teller_pid: sys::current_pid(),
            transaction,
        };

        if self
            .mailbox
            .post(&envelope, deadline, self.config.poll_interval)?
        {
            if let Some(verdict) =
                self.mailbox
                    .wait_response(self.id, deadline, self.config.poll_interval)?
            {
                return Ok(verdict);
            }
        }

        match self.mailbox.retract(self.id, envelope.teller_pid)? {
            Retraction::Answered(verdict) => Ok(verdict),
            Retraction::Withdrawn | Retraction::NotPosted => {
                warn!(teller = %self.id, client = self.client, "No response from server, request withdrawn");
                Err(TellerError::Timeout {
                    teller: self.id,
                    waited: started.elapsed(),
                })
            }
        }
    }
}

/// Body of a forked teller; returns the process exit code.
pub fn run<R: Read, W: Write>(teller: &Teller<'_>, request: R, response: W) -> i32 {
    info!(teller = %teller.id, client = teller.client, pid = sys::current_pid(), "Teller active");
    match teller.serve(request, response) {
        Ok(verdict) => {
            info!(teller = %teller.id, client = teller.client, %verdict, "Client served");
            EXIT_SERVED
        }
        Err(e) => {
            warn!(teller = %teller.id, client = teller.client, error = %e, "Teller failed");
            EXIT_FAILED
        }
    }
}

fn read_request<R: Read>(request: R) -> Result<Transaction, TellerError> {
    let mut line = String::new();
    if BufReader::new(request).read_line(&mut line)? == 0 {
        return Err(TellerError::EmptyRequest);
    }
    Ok(serde_json::from_str(line.trim())?)
}

fn write_response<W: Write>(response: &mut W, verdict: Response) -> Result<(), TellerError> {
    serde_json::to_writer(&mut *response, &verdict)?;
    response.write_all(b"\n")?;
    response.flush()?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::base::BankId;
    use std::io::Cursor;
    use std::time::Duration;

    fn quick_config() -> TellerConfig {
        TellerConfig {
            poll_interval: Duration::from_millis(1),
            response_timeout: Duration::from_millis(50),
        }
    }

    #[test]
    fn empty_request_channel_is_an_error() {
        let mailbox = Mailbox::create(1).unwrap();
        let teller = Teller::new(TellerId(0), "client", &mailbox, quick_config());
        let mut out = Vec::new();
        let result = teller.serve(Cursor::new(""), &mut out);
        assert!(matches!(result, Err(TellerError::EmptyRequest)));
        assert!(out.is_empty());
    }

    #[test]
    fn unanswered_request_is_withdrawn_and_reported_as_failure() {
        let mailbox = Mailbox::create(1).unwrap();
        mailbox.begin_batch(1).unwrap();
        let teller = Teller::new(TellerId(0), "client", &mailbox, quick_config());
        let request = serde_json::to_string(&Transaction::deposit(BankId::new("N").unwrap(), 7))
            .unwrap();
        let mut out = Vec::new();

        let result = teller.serve(Cursor::new(request), &mut out);

        assert!(matches!(result, Err(TellerError::Timeout { .. })));
        assert_eq!(String::from_utf8(out).unwrap(), "\"Failure\"\n");
        // The withdrawn payload never reaches the server.
        assert!(mailbox.try_take(|_| Some(Response::Success)).unwrap().is_none());
    }
}
