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

//! Enrollment and per-teller channels.
//!
//! The server only depends on the two traits here. [`FifoEnrollment`] and
//! [`FifoChannels`] are the named-pipe implementations used by the
//! `bank-server` and `bank-client` binaries:
//!
//! | Path | Direction | Payload |
//! |------|-----------|---------|
//! | `<server_fifo>` | client → server | [`Batch`] as a JSON line |
//! | `client_<pid>.fifo` | server → client | [`TellerClientMap`] as a JSON line |
//! | `teller_<pid>_<i>.req` | client → teller | one `Transaction` |
//! | `teller_<pid>_<i>.res` | teller → client | one `Response` |
//!
//! All paths except the server FIFO live next to it and are created by the
//! client.

use crate::base::{Pid, TellerId};
use crate::batch::{Batch, TellerClientMap};
use crate::sys;
use std::fs::{self, File, OpenOptions};
use std::io::{self, Read, Write};
use std::os::fd::AsRawFd;
use std::os::unix::fs::OpenOptionsExt;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread;
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};

/// How often a blocked enrollment wait looks at the shutdown flag.
const SHUTDOWN_POLL_MS: i32 = 100;

/// How long the server waits for an enrolling client to open its reply pipe.
const PUBLISH_TIMEOUT: Duration = Duration::from_secs(5);

/// Source of enrollment batches.
pub trait EnrollmentSource {
    /// Waits for the next batch.
    ///
    /// Returns `Ok(None)` once `shutdown` is raised or the source is exhausted.
    fn next_batch(&mut self, shutdown: &AtomicBool) -> io::Result<Option<Batch>>;

    /// Tells the batch originator which teller serves which client.
    fn publish(&mut self, batch: &Batch, map: &TellerClientMap) -> io::Result<()>;

    /// Removes whatever the source created.
    fn cleanup(&mut self) -> io::Result<()>;
}

/// Opens a teller's private request/response pair.
///
/// Called inside the forked teller process.
pub trait TellerChannels {
    type Request: Read;
    type Response: Write;

    fn open(&self, batch: &Batch, teller_id: TellerId)
    -> io::Result<(Self::Request, Self::Response)>;
}

pub fn request_fifo(dir: &Path, client_pid: Pid, teller_id: TellerId) -> PathBuf {
    dir.join(format!("teller_{client_pid}_{teller_id}.req"))
}

pub fn response_fifo(dir: &Path, client_pid: Pid, teller_id: TellerId) -> PathBuf {
    dir.join(format!("teller_{client_pid}_{teller_id}.res"))
}

pub fn client_fifo(dir: &Path, client_pid: Pid) -> PathBuf {
    dir.join(format!("client_{client_pid}.fifo"))
}

/// Directory holding the per-client pipes of a server FIFO.
pub fn fifo_dir(server_fifo: &Path) -> PathBuf {
    match server_fifo.parent() {
        Some(parent) if !parent.as_os_str().is_empty() => parent.to_path_buf(),
        _ => PathBuf::from("."),
    }
}

/// Named-pipe enrollment.
pub struct FifoEnrollment {
    server_fifo: PathBuf,
    dir: PathBuf,
    fifo: File,
    /// Bytes read past the last complete line.
    pending: Vec<u8>,
}

impl FifoEnrollment {
    /// Creates the server FIFO and opens it for reading.
    ///
    /// The FIFO is opened read-write so it never reports end-of-file between
    /// clients, and non-blocking so a writer that stalls mid-line cannot hold
    /// up shutdown.
    pub fn create(server_fifo: impl Into<PathBuf>) -> io::Result<Self> {
        let server_fifo = server_fifo.into();
        sys::make_fifo(&server_fifo)?;
        let fifo = OpenOptions::new()
            .read(true)
            .write(true)
            .custom_flags(libc::O_NONBLOCK)
            .open(&server_fifo)?;
        let dir = fifo_dir(&server_fifo);
        info!(fifo = %server_fifo.display(), "Waiting for clients");
        Ok(Self {
            server_fifo,
            dir,
            fifo,
            pending: Vec::new(),
        })
    }

    pub fn server_fifo(&self) -> &Path {
        &self.server_fifo
    }

    /// Teller channels for the clients of this FIFO.
    pub fn channels(&self) -> FifoChannels {
        FifoChannels {
            dir: self.dir.clone(),
        }
    }

    /// Splits the next complete line off the pending bytes.
    fn take_line(&mut self) -> Option<Vec<u8>> {
        let end = self.pending.iter().position(|&b| b == b'\n')?;
        let mut line: Vec<u8> = self.pending.drain(..=end).collect();
        line.pop();
        Some(line)
    }

    /// Appends whatever the FIFO holds right now, without blocking.
    fn fill(&mut self) -> io::Result<()> {
        let mut chunk = [0u8; 4096];
        loop {
            match self.fifo.read(&mut chunk) {
                Ok(0) => return Ok(()),
                Ok(n) => self.pending.extend_from_slice(&chunk[..n]),
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => return Ok(()),
                Err(e) if e.kind() == io::ErrorKind::Interrupted => {}
                Err(e) => return Err(e),
            }
        }
    }
}

/// Decodes one enrollment line; blank lines yield `Ok(None)`.
fn decode_enrollment(line: &[u8]) -> Result<Option<Batch>, String> {
    let text = std::str::from_utf8(line).map_err(|e| e.to_string())?;
    let text = text.trim();
    if text.is_empty() {
        return Ok(None);
    }
    serde_json::from_str(text)
        .map(Some)
        .map_err(|e| e.to_string())
}

impl EnrollmentSource for FifoEnrollment {
    fn next_batch(&mut self, shutdown: &AtomicBool) -> io::Result<Option<Batch>> {
        loop {
            if shutdown.load(Ordering::SeqCst) {
                return Ok(None);
            }

            let Some(line) = self.take_line() else {
                // Only what poll reports is read, so a stalled writer never blocks us.
                if sys::poll_readable(self.fifo.as_raw_fd(), SHUTDOWN_POLL_MS)? {
                    self.fill()?;
                }
                continue;
            };
            match decode_enrollment(&line) {
                Ok(Some(batch)) => {
                    info!(client_pid = batch.pid, clients = batch.len(), "Received clients");
                    return Ok(Some(batch));
                }
                Ok(None) => {}
                Err(reason) => warn!(%reason, "Ignoring malformed enrollment"),
            }
        }
    }

    fn publish(&mut self, batch: &Batch, map: &TellerClientMap) -> io::Result<()> {
        let path = client_fifo(&self.dir, batch.pid);
        let deadline = Instant::now() + PUBLISH_TIMEOUT;

        // A non-blocking open fails with ENXIO until the client opens its end.
        let mut file = loop {
            match OpenOptions::new()
                .write(true)
                .custom_flags(libc::O_NONBLOCK)
                .open(&path)
            {
                Ok(file) => break file,
                Err(e) if e.raw_os_error() == Some(libc::ENXIO) && Instant::now() < deadline => {
                    thread::sleep(Duration::from_millis(10));
                }
                Err(e) => return Err(e),
            }
        };

        let mut payload = serde_json::to_vec(map)?;
        payload.push(b'\n');
        file.write_all(&payload)?;
        debug!(client_pid = batch.pid, tellers = map.len(), "Teller map published");
        Ok(())
    }

    fn cleanup(&mut self) -> io::Result<()> {
        match fs::remove_file(&self.server_fifo) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e),
        }
    }
}

/// Named-pipe teller channels, created by the enrolling client.
#[derive(Debug, Clone)]
pub struct FifoChannels {
    dir: PathBuf,
}

impl FifoChannels {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }
}

impl TellerChannels for FifoChannels {
    type Request = File;
    type Response = File;

    fn open(&self, batch: &Batch, teller_id: TellerId) -> io::Result<(File, File)> {
        let request = File::open(request_fifo(&self.dir, batch.pid, teller_id))?;
        let response = OpenOptions::new()
            .write(true)
            .open(response_fifo(&self.dir, batch.pid, teller_id))?;
        Ok((request, response))
    }
}
