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

//! Enrollment batches and teller/client correlation.

use crate::base::{Pid, TellerId};
use serde::{Deserialize, Serialize};

/// One enrollment round: the clients a single originator wants served.
///
/// Client names are opaque except for the new-account sentinel `N`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Batch {
    /// Process id of the enrolling client program.
    pub pid: Pid,
    pub clients: Vec<String>,
}

impl Batch {
    pub fn new(pid: Pid, clients: Vec<String>) -> Self {
        Self { pid, clients }
    }

    pub fn len(&self) -> usize {
        self.clients.len()
    }

    pub fn is_empty(&self) -> bool {
        self.clients.is_empty()
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TellerAssignment {
    pub teller_id: TellerId,
    pub client: String,
    pub pid: Pid,
}

/// Which teller process serves which client in the active batch.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct TellerClientMap {
    assignments: Vec<TellerAssignment>,
}

impl TellerClientMap {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, teller_id: TellerId, client: impl Into<String>, pid: Pid) {
        self.assignments.push(TellerAssignment {
            teller_id,
            client: client.into(),
            pid,
        });
    }

    pub fn by_pid(&self, pid: Pid) -> Option<&TellerAssignment> {
        self.assignments.iter().find(|a| a.pid == pid)
    }

    pub fn by_teller(&self, teller_id: TellerId) -> Option<&TellerAssignment> {
        self.assignments.iter().find(|a| a.teller_id == teller_id)
    }

    pub fn iter(&self) -> impl Iterator<Item = &TellerAssignment> {
        self.assignments.iter()
    }

    pub fn len(&self) -> usize {
        self.assignments.len()
    }

    pub fn is_empty(&self) -> bool {
        self.assignments.is_empty()
    }
}
