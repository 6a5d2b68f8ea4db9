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

//! Benchmarks for the account table and the ledger codec.
//!
//! Run with: cargo bench
//!
//! Benchmarks include:
//! - Applying transactions to the account table
//! - Rendering a ledger, as done after every processed transaction
//! - Loading a ledger at startup
//! - One mailbox handoff inside a single process

use criterion::{BenchmarkId, Criterion, Throughput, criterion_group, criterion_main};
use std::hint::black_box;
use std::io::Cursor;
use std::time::{Duration, Instant};
use teller_bank_rs::{
    AccountTable, BankId, Envelope, LedgerCodec, Mailbox, NEW_ACCOUNT_SENTINEL, Response,
    TellerId, Transaction,
};

// =============================================================================
// Helper Functions
// =============================================================================

fn sentinel() -> BankId {
    BankId::new(NEW_ACCOUNT_SENTINEL).unwrap()
}

/// A table of `accounts` accounts with `history` transactions each.
fn populated(accounts: usize, history: usize) -> AccountTable {
    let mut table = AccountTable::new();
    for _ in 0..accounts {
        let index = table.get_or_create(NEW_ACCOUNT_SENTINEL).unwrap();
        for i in 0..history {
            let tx = if i % 3 == 2 {
                Transaction::withdraw(sentinel(), 5)
            } else {
                Transaction::deposit(sentinel(), 10)
            };
            table.apply(index, &tx);
        }
    }
    table
}

fn render(table: &AccountTable) -> Vec<u8> {
    let mut out = Vec::new();
    LedgerCodec::write(table, "BenchBank", "12:00 June 01 2025", &mut out).unwrap();
    out
}

// =============================================================================
// Account Table Benchmarks
// =============================================================================

fn bench_create_accounts(c: &mut Criterion) {
    let mut group = c.benchmark_group("create_accounts");

    for count in [100, 1_000, 10_000].iter() {
        group.throughput(Throughput::Elements(*count as u64));
        group.bench_with_input(BenchmarkId::from_parameter(count), count, |b, &count| {
            b.iter(|| {
                let mut table = AccountTable::new();
                for _ in 0..count {
                    let index = table.get_or_create(NEW_ACCOUNT_SENTINEL).unwrap();
                    table.apply(index, &Transaction::deposit(sentinel(), 100));
                }
                black_box(&table);
            })
        });
    }
    group.finish();
}

fn bench_mixed_transactions(c: &mut Criterion) {
    c.bench_function("mixed_transactions", |b| {
        let mut table = populated(100, 0);
        let id = BankId::numbered(42).unwrap();
        let index = table.find(&id).unwrap();
        b.iter(|| {
            table.apply(index, &Transaction::deposit(id.clone(), 10));
            black_box(table.apply(index, &Transaction::withdraw(id.clone(), 7)));
        })
    });
}

// =============================================================================
// Ledger Codec Benchmarks
// =============================================================================

fn bench_ledger_write(c: &mut Criterion) {
    let mut group = c.benchmark_group("ledger_write");

    for accounts in [10, 100, 1_000].iter() {
        let table = populated(*accounts, 20);
        group.throughput(Throughput::Elements(*accounts as u64));
        group.bench_with_input(BenchmarkId::from_parameter(accounts), &table, |b, table| {
            b.iter(|| black_box(render(table)))
        });
    }
    group.finish();
}

fn bench_ledger_read(c: &mut Criterion) {
    let mut group = c.benchmark_group("ledger_read");

    for accounts in [10, 100, 1_000].iter() {
        let text = render(&populated(*accounts, 20));
        group.throughput(Throughput::Bytes(text.len() as u64));
        group.bench_with_input(BenchmarkId::from_parameter(accounts), &text, |b, text| {
            b.iter(|| black_box(LedgerCodec::read(Cursor::new(text.as_slice())).unwrap()))
        });
    }
    group.finish();
}

// =============================================================================
// Mailbox Benchmarks
// =============================================================================

fn bench_mailbox_handoff(c: &mut Criterion) {
    let mailbox = Mailbox::create(1).unwrap();
    mailbox.begin_batch(1).unwrap();
    let envelope = Envelope {
        teller_id: TellerId(0),
        teller_pid: 1,
        transaction: Transaction::deposit(sentinel(), 1),
    };

    c.bench_function("mailbox_handoff", |b| {
        b.iter(|| {
            let deadline = Instant::now() + Duration::from_secs(1);
            mailbox.post(&envelope, deadline, Duration::ZERO).unwrap();
            mailbox.try_take(|_| Some(Response::Success)).unwrap();
            black_box(mailbox.response(TellerId(0)).unwrap());
        })
    });
}

criterion_group!(
    benches,
    bench_create_accounts,
    bench_mixed_transactions,
    bench_ledger_write,
    bench_ledger_read,
    bench_mailbox_handoff,
);
criterion_main!(benches);
