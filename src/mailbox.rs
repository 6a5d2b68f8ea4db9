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

//! Single-slot shared-memory handoff between tellers and the server.
//!
//! The mailbox lives in one anonymous `MAP_SHARED` mapping created by the
//! server before it forks any teller:
//!
//! ```text
//! ┌──────────────────────────── Header ─────────────────────────────┐┌── responses ──┐
//! │ sem_t (pshared, 1) │ Slot {server_read, teller, pid, tx} │ stats ││ u8 × capacity │
//! └─────────────────────────────────────────────────────────────────┘└───────────────┘
//! ```
//!
//! Every access to the slot or a response slot write happens while holding the
//! semaphore. Tellers read their own response without it.
//!
//! # Protocol
//!
//! ```text
//!  Teller                                   Server
//!  ──────                                   ──────
//!  acquire                                  acquire
//!  slot empty? write payload, mark full     slot full? handle payload,
//!  release                                             write response, mark empty
//!  not written? back off, retry             release
//!  poll own response until final            nothing read? back off, retry
//! ```
//!
//! Waiting is busy-polling with [`Backoff`] followed by a fixed sleep; no
//! cross-process blocking primitive other than the semaphore is used.

use crate::base::{BankId, Pid, Response, TellerId};
use crate::error::IpcError;
use crate::sys::{self, Semaphore, SharedRegion};
use crate::transaction::{Operation, Transaction};
use crossbeam::utils::Backoff;
use std::cell::UnsafeCell;
use std::mem::size_of;
use std::sync::atomic::{AtomicU8, AtomicU32, Ordering};
use std::thread;
use std::time::{Duration, Instant};
use tracing::warn;

/// A transaction handed to the server, tagged with its teller.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Envelope {
    pub teller_id: TellerId,
    pub teller_pid: Pid,
    pub transaction: Transaction,
}

/// What the server did with one consumed payload.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Receipt {
    pub teller_id: TellerId,
    pub teller_pid: Pid,
    /// `None` when the payload was discarded without answering.
    pub response: Option<Response>,
}

/// Outcome of [`Mailbox::retract`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Retraction {
    /// The payload was still in the slot and has been removed unprocessed.
    Withdrawn,
    /// The server already consumed the payload and answered.
    Answered(Response),
    /// Nothing of this teller's is in the slot and no answer was written.
    NotPosted,
}

const OP_DEPOSIT: u8 = 1;
const OP_WITHDRAW: u8 = 2;

/// Fixed-size encoding of a [`Transaction`].
#[repr(C)]
#[derive(Clone, Copy)]
struct RawTransaction {
    bank_id: [u8; BankId::MAX_LEN],
    bank_id_len: u8,
    op: u8,
    amount: u32,
}

impl RawTransaction {
    const EMPTY: Self = Self {
        bank_id: [0; BankId::MAX_LEN],
        bank_id_len: 0,
        op: 0,
        amount: 0,
    };

    fn encode(transaction: &Transaction) -> Self {
        let bytes = transaction.bank_id.as_str().as_bytes();
        let mut raw = Self::EMPTY;
        raw.bank_id[..bytes.len()].copy_from_slice(bytes);
        raw.bank_id_len = bytes.len() as u8;
        raw.op = match transaction.op {
            Operation::Deposit => OP_DEPOSIT,
            Operation::Withdraw => OP_WITHDRAW,
        };
        raw.amount = transaction.amount;
        raw
    }

    fn decode(&self) -> Result<Transaction, IpcError> {
        let len = usize::from(self.bank_id_len).min(BankId::MAX_LEN);
        let id = std::str::from_utf8(&self.bank_id[..len])
            .map_err(|e| IpcError::CorruptPayload(e.to_string()))?;
        let bank_id = BankId::new(id).map_err(|e| IpcError::CorruptPayload(e.to_string()))?;
        let op = match self.op {
            OP_DEPOSIT => Operation::Deposit,
            OP_WITHDRAW => Operation::Withdraw,
            other => return Err(IpcError::CorruptPayload(format!("operation byte {other}"))),
        };
        Ok(Transaction::new(bank_id, op, self.amount))
    }
}

#[repr(C)]
struct Slot {
    /// `true` while the slot is empty.
    server_read: bool,
    teller_id: u32,
    teller_pid: Pid,
    transaction: RawTransaction,
}

#[repr(C)]
struct Header {
    semaphore: Semaphore,
    slot: UnsafeCell<Slot>,
    /// Processes currently inside the critical section.
    occupancy: AtomicU32,
    peak_occupancy: AtomicU32,
    /// Tellers in the active batch; response slots beyond it are unused.
    active: AtomicU32,
}

impl Header {
    fn enter(&self) -> Result<CriticalSection<'_>, IpcError> {
        self.semaphore.wait()?;
        let inside = self.occupancy.fetch_add(1, Ordering::SeqCst) + 1;
        self.peak_occupancy.fetch_max(inside, Ordering::SeqCst);
        Ok(CriticalSection { header: self })
    }
}

/// Holds the mailbox semaphore; released on drop.
struct CriticalSection<'a> {
    header: &'a Header,
}

impl CriticalSection<'_> {
    fn slot(&mut self) -> &mut Slot {
        // SAFETY: holding the semaphore grants exclusive access to the slot,
        // and `&mut self` prevents aliasing within this process.
        unsafe { &mut *self.header.slot.get() }
    }
}

impl Drop for CriticalSection<'_> {
    fn drop(&mut self) {
        self.header.occupancy.fetch_sub(1, Ordering::SeqCst);
        // Posting only fails for an invalid semaphore, which `enter` rules out.
        let _ = self.header.semaphore.post();
    }
}

/// The teller/server mailbox plus the per-teller response table.
///
/// Create it in the server before forking; children inherit the mapping.
pub struct Mailbox {
    region: SharedRegion,
    capacity: usize,
    owner: Pid,
}

// SAFETY: all shared state is either atomic or only touched while holding the
// process-shared semaphore.
unsafe impl Send for Mailbox {}
unsafe impl Sync for Mailbox {}

impl Mailbox {
    /// Maps a mailbox with room for `capacity` tellers per batch.
    pub fn create(capacity: usize) -> Result<Self, IpcError> {
        let capacity = capacity.max(1);
        let region = SharedRegion::anonymous(size_of::<Header>() + capacity)?;
        let header = region.as_ptr().cast::<Header>();

        // SAFETY: the region is large enough, page aligned and zeroed; nothing
        // else references it yet.
        unsafe {
            header.write(Header {
                semaphore: std::mem::zeroed(),
                slot: UnsafeCell::new(Slot {
                    server_read: true,
                    teller_id: 0,
                    teller_pid: 0,
                    transaction: RawTransaction::EMPTY,
                }),
                occupancy: AtomicU32::new(0),
                peak_occupancy: AtomicU32::new(0),
                active: AtomicU32::new(0),
            });
            Semaphore::init_shared(&raw mut (*header).semaphore, 1)?;
        }

        Ok(Self {
            region,
            capacity,
            owner: sys::current_pid(),
        })
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Highest number of processes ever seen inside the critical section.
    pub fn peak_occupancy(&self) -> u32 {
        self.header().peak_occupancy.load(Ordering::SeqCst)
    }

    /// Resets the response table for a batch of `tellers`.
    pub fn begin_batch(&self, tellers: usize) -> Result<(), IpcError> {
        if tellers > self.capacity {
            return Err(IpcError::BatchTooLarge {
                requested: tellers,
                capacity: self.capacity,
            });
        }
        let _section = self.header().enter()?;
        for slot in self.responses() {
            slot.store(Response::Initialize as u8, Ordering::Release);
        }
        self.header().active.store(tellers as u32, Ordering::Release);
        Ok(())
    }

    /// One teller attempt: writes the payload if the slot is empty.
    ///
    /// Returns `true` when the payload was handed off.
    pub fn try_post(&self, envelope: &Envelope) -> Result<bool, IpcError> {
        let mut section = self.header().enter()?;
        let slot = section.slot();
        if !slot.server_read {
            return Ok(false);
        }
        slot.teller_id = envelope.teller_id.0;
        slot.teller_pid = envelope.teller_pid;
        slot.transaction = RawTransaction::encode(&envelope.transaction);
        slot.server_read = false;
        Ok(true)
    }

    /// Retries [`try_post`](Self::try_post) until it succeeds or `deadline`
    /// passes.
    pub fn post(
        &self,
        envelope: &Envelope,
        deadline: Instant,
        poll_interval: Duration,
    ) -> Result<bool, IpcError> {
        let backoff = Backoff::new();
        loop {
            if self.try_post(envelope)? {
                return Ok(true);
            }
            if Instant::now() >= deadline {
                return Ok(false);
            }
            pause(&backoff, poll_interval);
        }
    }

    /// One server attempt: consumes the payload if the slot is full.
    ///
    /// `handler` runs inside the critical section and returns the response
    /// for the payload's teller, or `None` to discard it unanswered. A payload
    /// that cannot be decoded is answered with [`Response::Failure`].
    pub fn try_take<F>(&self, handler: F) -> Result<Option<Receipt>, IpcError>
    where
        F: FnOnce(&Envelope) -> Option<Response>,
    {
        let mut section = self.header().enter()?;
        let slot = section.slot();
        if slot.server_read {
            return Ok(None);
        }

        let teller_id = TellerId(slot.teller_id);
        let teller_pid = slot.teller_pid;
        let response = match slot.transaction.decode() {
            Ok(transaction) => handler(&Envelope {
                teller_id,
                teller_pid,
                transaction,
            }),
            Err(e) => {
                warn!(%teller_id, teller_pid, error = %e, "Undecodable mailbox payload");
                Some(Response::Failure)
            }
        };

        if let Some(response) = response {
            self.publish(teller_id, response);
        }
        slot.server_read = true;

        Ok(Some(Receipt {
            teller_id,
            teller_pid,
            response,
        }))
    }

    /// Reads a teller's response slot.
    pub fn response(&self, teller_id: TellerId) -> Result<Response, IpcError> {
        let slot = self
            .responses()
            .get(teller_id.index())
            .ok_or(IpcError::NoSuchSlot(teller_id))?;
        let raw = slot.load(Ordering::Acquire);
        Response::try_from(raw)
            .map_err(|byte| IpcError::CorruptPayload(format!("response byte {byte}")))
    }

    /// Polls a teller's response slot until it is final or `deadline` passes.
    pub fn wait_response(
        &self,
        teller_id: TellerId,
        deadline: Instant,
        poll_interval: Duration,
    ) -> Result<Option<Response>, IpcError> {
        let backoff = Backoff::new();
        loop {
            let response = self.response(teller_id)?;
            if response.is_final() {
                return Ok(Some(response));
            }
            if Instant::now() >= deadline {
                return Ok(None);
            }
            pause(&backoff, poll_interval);
        }
    }

    /// Takes back a payload the server has not consumed yet.
    ///
    /// Consumption and the response write share one critical section, so the
    /// result is exact: the payload is either withdrawn or already answered.
    pub fn retract(&self, teller_id: TellerId, teller_pid: Pid) -> Result<Retraction, IpcError> {
        let mut section = self.header().enter()?;
        let slot = section.slot();
        if !slot.server_read && slot.teller_id == teller_id.0 && slot.teller_pid == teller_pid {
            slot.server_read = true;
            return Ok(Retraction::Withdrawn);
        }
        drop(section);

        let response = self.response(teller_id)?;
        if response.is_final() {
            Ok(Retraction::Answered(response))
        } else {
            Ok(Retraction::NotPosted)
        }
    }

    /// Writes a response; caller holds the semaphore.
    fn publish(&self, teller_id: TellerId, response: Response) {
        let active = self.header().active.load(Ordering::Acquire) as usize;
        match self.responses().get(teller_id.index()) {
            Some(slot) if teller_id.index() < active => {
                slot.store(response as u8, Ordering::Release);
            }
            _ => warn!(%teller_id, active, "Response for a teller outside the active batch dropped"),
        }
    }

    fn header(&self) -> &Header {
        // SAFETY: the mapping starts with a Header initialized in `create`.
        unsafe { &*self.region.as_ptr().cast::<Header>() }
    }

    fn responses(&self) -> &[AtomicU8] {
        // SAFETY: `capacity` response bytes follow the header inside the
        // mapping; AtomicU8 has the layout of u8.
        unsafe {
            std::slice::from_raw_parts(
                self.region.as_ptr().add(size_of::<Header>()).cast::<AtomicU8>(),
                self.capacity,
            )
        }
    }
}

impl Drop for Mailbox {
    fn drop(&mut self) {
        if sys::current_pid() == self.owner {
            // SAFETY: the creating process destroys the semaphore once; the
            // mapping is unmapped afterwards by SharedRegion.
            unsafe { self.header().semaphore.destroy() };
        }
    }
}

fn pause(backoff: &Backoff, poll_interval: Duration) {
    if backoff.is_completed() {
        thread::sleep(poll_interval);
    } else {
        backoff.snooze();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn envelope(teller: u32, amount: u32) -> Envelope {
        Envelope {
            teller_id: TellerId(teller),
            teller_pid: 1000 + teller as Pid,
            transaction: Transaction::deposit(BankId::new("N").unwrap(), amount),
        }
    }

    #[test]
    fn slot_holds_one_payload_at_a_time() {
        let mailbox = Mailbox::create(2).unwrap();
        mailbox.begin_batch(2).unwrap();
        assert!(mailbox.try_post(&envelope(0, 10)).unwrap());
        assert!(!mailbox.try_post(&envelope(1, 20)).unwrap());

        let receipt = mailbox
            .try_take(|env| {
                assert_eq!(env, &envelope(0, 10));
                Some(Response::Success)
            })
            .unwrap()
            .unwrap();
        assert_eq!(receipt.teller_id, TellerId(0));
        assert_eq!(mailbox.response(TellerId(0)).unwrap(), Response::Success);
        assert_eq!(mailbox.response(TellerId(1)).unwrap(), Response::Initialize);
        assert!(mailbox.try_post(&envelope(1, 20)).unwrap());
    }

    #[test]
    fn empty_slot_yields_nothing() {
        let mailbox = Mailbox::create(1).unwrap();
        let taken = mailbox.try_take(|_| panic!("handler must not run")).unwrap();
        assert!(taken.is_none());
    }

    #[test]
    fn oversized_batch_is_rejected() {
        let mailbox = Mailbox::create(2).unwrap();
        assert!(matches!(
            mailbox.begin_batch(3),
            Err(IpcError::BatchTooLarge {
                requested: 3,
                capacity: 2
            })
        ));
    }

    #[test]
    fn retract_withdraws_unconsumed_payload() {
        let mailbox = Mailbox::create(1).unwrap();
        mailbox.begin_batch(1).unwrap();
        let env = envelope(0, 5);
        mailbox.try_post(&env).unwrap();
        assert_eq!(
            mailbox.retract(env.teller_id, env.teller_pid).unwrap(),
            Retraction::Withdrawn
        );
        assert!(mailbox.try_take(|_| Some(Response::Success)).unwrap().is_none());
    }

    #[test]
    fn retract_after_consumption_returns_answer() {
        let mailbox = Mailbox::create(1).unwrap();
        mailbox.begin_batch(1).unwrap();
        let env = envelope(0, 5);
        mailbox.try_post(&env).unwrap();
        mailbox
            .try_take(|_| Some(Response::InsufficientCredits))
            .unwrap();
        assert_eq!(
            mailbox.retract(env.teller_id, env.teller_pid).unwrap(),
            Retraction::Answered(Response::InsufficientCredits)
        );
    }

    #[test]
    fn discarded_payload_frees_slot_without_answer() {
        let mailbox = Mailbox::create(1).unwrap();
        mailbox.begin_batch(1).unwrap();
        mailbox.try_post(&envelope(0, 5)).unwrap();
        let receipt = mailbox.try_take(|_| None).unwrap().unwrap();
        assert_eq!(receipt.response, None);
        assert_eq!(mailbox.response(TellerId(0)).unwrap(), Response::Initialize);
        assert!(mailbox.try_post(&envelope(0, 5)).unwrap());
    }

    #[test]
    fn wait_response_times_out() {
        let mailbox = Mailbox::create(1).unwrap();
        mailbox.begin_batch(1).unwrap();
        let deadline = Instant::now() + Duration::from_millis(20);
        let waited = mailbox
            .wait_response(TellerId(0), deadline, Duration::from_millis(1))
            .unwrap();
        assert_eq!(waited, None);
    }
}
