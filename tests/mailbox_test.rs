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

//! Mailbox handoff tests with concurrent tellers.
//!
//! Threads share the mapping directly; the forked test exercises the same
//! code path across real process boundaries.

use std::io::Cursor;
use std::sync::Mutex;
use std::thread;
use std::time::{Duration, Instant};
use teller_bank_rs::sys::{self, Fork};
use teller_bank_rs::{
    BankId, Envelope, Mailbox, Response, Teller, TellerConfig, TellerId, Transaction,
};

const TELLERS: usize = 16;

fn envelope(teller: usize, amount: u32) -> Envelope {
    Envelope {
        teller_id: TellerId(teller as u32),
        teller_pid: 1000 + teller as i32,
        transaction: Transaction::deposit(BankId::new("BankID_1").unwrap(), amount),
    }
}

fn far_deadline() -> Instant {
    Instant::now() + Duration::from_secs(20)
}

/// Takes payloads until `expected` have been answered or the deadline passes.
fn serve(mailbox: &Mailbox, expected: usize, respond: impl Fn(&Envelope) -> Response) -> Vec<Envelope> {
    let deadline = far_deadline();
    let mut seen = Vec::new();
    while seen.len() < expected && Instant::now() < deadline {
        let taken = mailbox
            .try_take(|env| {
                seen.push(env.clone());
                Some(respond(env))
            })
            .unwrap();
        if taken.is_none() {
            thread::yield_now();
        }
    }
    seen
}

#[test]
fn concurrent_tellers_are_served_exactly_once() {
    let mailbox = Mailbox::create(TELLERS).unwrap();
    mailbox.begin_batch(TELLERS).unwrap();
    let answers = Mutex::new(Vec::new());

    let seen = thread::scope(|s| {
        for teller in 0..TELLERS {
            let mailbox = &mailbox;
            let answers = &answers;
            s.spawn(move || {
                let env = envelope(teller, teller as u32 + 1);
                assert!(mailbox.post(&env, far_deadline(), Duration::from_millis(1)).unwrap());
                let response = mailbox
                    .wait_response(env.teller_id, far_deadline(), Duration::from_millis(1))
                    .unwrap();
                answers.lock().unwrap().push((teller, response));
            });
        }
        serve(&mailbox, TELLERS, |_| Response::Success)
    });

    let mut amounts: Vec<u32> = seen.iter().map(|e| e.transaction.amount).collect();
    amounts.sort_unstable();
    assert_eq!(amounts, (1..=TELLERS as u32).collect::<Vec<_>>());

    let answers = answers.into_inner().unwrap();
    assert_eq!(answers.len(), TELLERS);
    assert!(answers.iter().all(|(_, r)| *r == Some(Response::Success)));
    assert_eq!(mailbox.peak_occupancy(), 1);
}

#[test]
fn responses_reach_the_right_teller() {
    let mailbox = Mailbox::create(4).unwrap();
    mailbox.begin_batch(4).unwrap();

    thread::scope(|s| {
        let handles: Vec<_> = (0..4)
            .map(|teller| {
                let mailbox = &mailbox;
                s.spawn(move || {
                    let env = envelope(teller, 10 * (teller as u32 + 1));
                    mailbox.post(&env, far_deadline(), Duration::from_millis(1)).unwrap();
                    mailbox
                        .wait_response(env.teller_id, far_deadline(), Duration::from_millis(1))
                        .unwrap()
                })
            })
            .collect();

        // Odd tellers are refused so a crossed response would show.
        serve(&mailbox, 4, |env| {
            if env.teller_id.0 % 2 == 1 {
                Response::InsufficientCredits
            } else {
                Response::Success
            }
        });

        for (teller, handle) in handles.into_iter().enumerate() {
            let expected = if teller % 2 == 1 {
                Response::InsufficientCredits
            } else {
                Response::Success
            };
            assert_eq!(handle.join().unwrap(), Some(expected));
        }
    });
}

#[test]
fn teller_relays_server_verdict() {
    let mailbox = Mailbox::create(1).unwrap();
    mailbox.begin_batch(1).unwrap();
    let config = TellerConfig {
        poll_interval: Duration::from_millis(1),
        response_timeout: Duration::from_secs(20),
    };

    let (verdict, written) = thread::scope(|s| {
        let teller = s.spawn(|| {
            let teller = Teller::new(TellerId(0), "N", &mailbox, config);
            let mut out = Vec::new();
            let request = Cursor::new(b"{\"bank_id\":\"N\",\"op\":\"deposit\",\"amount\":100}\n".to_vec());
            let verdict = teller.serve(request, &mut out).unwrap();
            (verdict, out)
        });
        let seen = serve(&mailbox, 1, |_| Response::Success);
        assert_eq!(seen[0].transaction.amount, 100);
        assert!(seen[0].transaction.bank_id.is_new_account_sentinel());
        teller.join().unwrap()
    });

    assert_eq!(verdict, Response::Success);
    assert_eq!(written, b"\"Success\"\n");
}

#[test]
fn forked_tellers_share_the_mailbox() {
    let mailbox = Mailbox::create(3).unwrap();
    mailbox.begin_batch(3).unwrap();

    let mut children = Vec::new();
    for teller in 0..3 {
        match sys::fork().unwrap() {
            Fork::Child => {
                let env = Envelope {
                    teller_pid: sys::current_pid(),
                    ..envelope(teller, 5)
                };
                let code = match mailbox.post(&env, far_deadline(), Duration::from_millis(1)) {
                    Ok(true) => match mailbox.wait_response(
                        env.teller_id,
                        far_deadline(),
                        Duration::from_millis(1),
                    ) {
                        Ok(Some(Response::Success)) => 0,
                        _ => 2,
                    },
                    _ => 3,
                };
                sys::exit_immediately(code);
            }
            Fork::Parent { child } => children.push(child),
        }
    }

    let seen = serve(&mailbox, 3, |_| Response::Success);
    let mut pids: Vec<_> = seen.iter().map(|e| e.teller_pid).collect();
    pids.sort_unstable();
    let mut expected = children.clone();
    expected.sort_unstable();
    assert_eq!(pids, expected);

    for child in children {
        assert!(sys::wait(child).unwrap().success());
    }
    assert_eq!(mailbox.peak_occupancy(), 1);
}
