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

//! Process and shared-memory primitives.
//!
//! Thin wrappers over the libc calls the server and its tellers need. All
//! `unsafe` outside the mailbox layout lives here.

use crate::base::Pid;
use crate::error::IpcError;
use std::cell::UnsafeCell;
use std::ffi::CString;
use std::io;
use std::os::unix::ffi::OsStrExt;
use std::path::Path;
use std::ptr::NonNull;

/// Result of [`fork`], seen from each side.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Fork {
    Parent { child: Pid },
    Child,
}

/// Forks the calling process.
///
/// The child should restrict itself to its task and leave through
/// [`exit_immediately`], so destructors owned by the parent never run twice.
pub fn fork() -> Result<Fork, IpcError> {
    // SAFETY: fork has no memory-safety preconditions; the caller is
    // responsible for what the child does afterwards.
    match unsafe { libc::fork() } {
        -1 => Err(IpcError::last_os_error("fork")),
        0 => Ok(Fork::Child),
        child => Ok(Fork::Parent { child }),
    }
}

pub fn current_pid() -> Pid {
    // SAFETY: getpid cannot fail.
    unsafe { libc::getpid() }
}

/// Terminates the process without unwinding or running exit handlers.
pub fn exit_immediately(code: i32) -> ! {
    // SAFETY: _exit never returns and touches no Rust state.
    unsafe { libc::_exit(code) }
}

/// How a reaped child ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExitStatus {
    Exited(i32),
    Signaled(i32),
}

impl ExitStatus {
    fn from_raw(status: libc::c_int) -> Self {
        if libc::WIFEXITED(status) {
            ExitStatus::Exited(libc::WEXITSTATUS(status))
        } else {
            ExitStatus::Signaled(libc::WTERMSIG(status))
        }
    }

    pub fn success(self) -> bool {
        self == ExitStatus::Exited(0)
    }
}

/// Blocks until `pid` exits.
pub fn wait(pid: Pid) -> Result<ExitStatus, IpcError> {
    loop {
        match waitpid(pid, 0)? {
            Some(status) => return Ok(status),
            None => continue,
        }
    }
}

/// Reaps `pid` if it has already exited.
pub fn try_wait(pid: Pid) -> Result<Option<ExitStatus>, IpcError> {
    waitpid(pid, libc::WNOHANG)
}

fn waitpid(pid: Pid, flags: libc::c_int) -> Result<Option<ExitStatus>, IpcError> {
    let mut status: libc::c_int = 0;
    loop {
        // SAFETY: status points to a live c_int.
        let rc = unsafe { libc::waitpid(pid, &mut status, flags) };
        match rc {
            0 => return Ok(None),
            -1 => {
                let err = io::Error::last_os_error();
                if err.kind() == io::ErrorKind::Interrupted {
                    continue;
                }
                return Err(IpcError::Os {
                    op: "waitpid",
                    source: err,
                });
            }
            _ => return Ok(Some(ExitStatus::from_raw(status))),
        }
    }
}

/// Sends SIGKILL to `pid`.
///
/// Returns `false` when the process no longer exists.
pub fn force_kill(pid: Pid) -> Result<bool, IpcError> {
    // SAFETY: kill has no memory-safety preconditions.
    if unsafe { libc::kill(pid, libc::SIGKILL) } == 0 {
        return Ok(true);
    }
    let err = io::Error::last_os_error();
    if err.raw_os_error() == Some(libc::ESRCH) {
        Ok(false)
    } else {
        Err(IpcError::Os {
            op: "kill",
            source: err,
        })
    }
}

/// Creates a named pipe; an existing one is reused.
pub fn make_fifo(path: &Path) -> io::Result<()> {
    let c_path = CString::new(path.as_os_str().as_bytes())
        .map_err(|e| io::Error::new(io::ErrorKind::InvalidInput, e))?;
    // SAFETY: c_path is a valid NUL-terminated string.
    if unsafe { libc::mkfifo(c_path.as_ptr(), 0o666) } == 0 {
        return Ok(());
    }
    let err = io::Error::last_os_error();
    if err.kind() == io::ErrorKind::AlreadyExists {
        Ok(())
    } else {
        Err(err)
    }
}

/// Waits up to `timeout_ms` for `fd` to become readable.
pub fn poll_readable(fd: libc::c_int, timeout_ms: i32) -> io::Result<bool> {
    let mut pollfd = libc::pollfd {
        fd,
        events: libc::POLLIN,
        revents: 0,
    };
    // SAFETY: pollfd is a single valid entry.
    let rc = unsafe { libc::poll(&mut pollfd, 1, timeout_ms) };
    match rc {
        -1 => {
            let err = io::Error::last_os_error();
            if err.kind() == io::ErrorKind::Interrupted {
                Ok(false)
            } else {
                Err(err)
            }
        }
        0 => Ok(false),
        _ => Ok(pollfd.revents & libc::POLLIN != 0),
    }
}

/// Unnamed POSIX semaphore placed inside a [`SharedRegion`].
///
/// Zeroed memory is a valid, uninitialized semaphore; call
/// [`init_shared`](Self::init_shared) before any other method.
#[repr(transparent)]
pub struct Semaphore(UnsafeCell<libc::sem_t>);

// SAFETY: sem_wait/sem_post are safe to call concurrently from any thread or
// process sharing the mapping.
unsafe impl Sync for Semaphore {}

impl Semaphore {
    /// Initializes a process-shared semaphore in place.
    ///
    /// # Safety
    ///
    /// `sem` must point into a `MAP_SHARED` mapping that outlives every use,
    /// and no process may be using the semaphore yet.
    pub unsafe fn init_shared(sem: *mut Semaphore, value: u32) -> Result<(), IpcError> {
        // SAFETY: guaranteed by the caller; the layout is that of sem_t.
        if unsafe { libc::sem_init(sem.cast::<libc::sem_t>(), 1, value) } == -1 {
            return Err(IpcError::last_os_error("sem_init"));
        }
        Ok(())
    }

    /// Decrements, blocking while the count is zero. Retries on `EINTR`.
    pub fn wait(&self) -> Result<(), IpcError> {
        loop {
            // SAFETY: initialized by `init_shared` per the type contract.
            if unsafe { libc::sem_wait(self.0.get()) } == 0 {
                return Ok(());
            }
            let err = io::Error::last_os_error();
            if err.kind() != io::ErrorKind::Interrupted {
                return Err(IpcError::Os {
                    op: "sem_wait",
                    source: err,
                });
            }
        }
    }

    pub fn post(&self) -> Result<(), IpcError> {
        // SAFETY: initialized by `init_shared` per the type contract.
        if unsafe { libc::sem_post(self.0.get()) } == -1 {
            return Err(IpcError::last_os_error("sem_post"));
        }
        Ok(())
    }

    /// Destroys the semaphore.
    ///
    /// # Safety
    ///
    /// No process may wait on or post the semaphore afterwards.
    pub unsafe fn destroy(&self) {
        // SAFETY: guaranteed by the caller.
        unsafe {
            libc::sem_destroy(self.0.get());
        }
    }
}

/// Anonymous memory shared with every process forked after its creation.
#[derive(Debug)]
pub struct SharedRegion {
    ptr: NonNull<u8>,
    len: usize,
}

impl SharedRegion {
    /// Maps `len` zeroed bytes with `MAP_SHARED | MAP_ANONYMOUS`.
    pub fn anonymous(len: usize) -> Result<Self, IpcError> {
        // SAFETY: a fresh anonymous mapping aliases no existing memory.
        let ptr = unsafe {
            libc::mmap(
                std::ptr::null_mut(),
                len,
                libc::PROT_READ | libc::PROT_WRITE,
                libc::MAP_SHARED | libc::MAP_ANONYMOUS,
                -1,
                0,
            )
        };
        if ptr == libc::MAP_FAILED {
            return Err(IpcError::last_os_error("mmap"));
        }
        let ptr = NonNull::new(ptr.cast::<u8>())
            .ok_or_else(|| IpcError::CorruptPayload("mmap returned null".into()))?;
        Ok(Self { ptr, len })
    }

    pub fn as_ptr(&self) -> *mut u8 {
        self.ptr.as_ptr()
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }
}

impl Drop for SharedRegion {
    fn drop(&mut self) {
        // SAFETY: ptr/len describe the mapping created in `anonymous`.
        unsafe {
            libc::munmap(self.ptr.as_ptr().cast(), self.len);
        }
    }
}
