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

//! Server and teller configuration.

use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;

/// Bank server configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    /// Name of the bank; the ledger is `<ledger_dir>/<bank_name>.bankLog`.
    pub bank_name: String,

    /// Directory holding the ledger file.
    pub ledger_dir: PathBuf,

    /// Largest batch the mailbox response table can hold.
    pub max_batch: usize,

    /// Idle sleep between mailbox polls once spinning is exhausted.
    pub poll_interval: Duration,

    /// Settings handed to every forked teller.
    pub teller: TellerConfig,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bank_name: "AdaBank".to_string(),
            ledger_dir: PathBuf::from("."),
            max_batch: 64,
            poll_interval: Duration::from_millis(10),
            teller: TellerConfig::default(),
        }
    }
}

/// Teller process configuration.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct TellerConfig {
    /// Idle sleep between mailbox attempts once spinning is exhausted.
    pub poll_interval: Duration,

    /// How long a teller waits for the server, handoff included, before it
    /// retracts its request and answers `Failure`.
    pub response_timeout: Duration,
}

impl Default for TellerConfig {
    fn default() -> Self {
        Self {
            poll_interval: Duration::from_millis(10),
            response_timeout: Duration::from_secs(30),
        }
    }
}
