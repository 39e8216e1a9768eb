//! The disk I/O subsystem: an actor that owns every open file handle in
//! the process and exposes a cheap, cloneable [`DiskHandle`] to callers
//! (peer sessions, torrent sessions) that need to read or write blocks.
//!
//! Addressing is by plain filesystem path, offset and length rather than
//! by torrent id and piece index; splitting a piece across the file(s) it
//! spans is the caller's job (see `torrent::session`, which uses
//! [`crate::storage_info`] and [`crate::iovecs`] to turn one verified
//! piece into one or more single-file writes).

mod cache;
mod io;

use std::path::PathBuf;

use tokio::sync::{mpsc, oneshot};

use crate::error::DiskError;
pub(crate) use io::Disk;

/// The channel depth for the top-level command queue. Deep enough to
/// absorb a burst of block completions across many torrents without
/// back-pressuring peer sessions under normal load.
const CMD_CHANNEL_CAPACITY: usize = 256;

type Reply<T> = oneshot::Sender<Result<T, DiskError>>;

/// A request sent to the disk actor. Each variant carries its own
/// one-shot reply channel so callers can simply `.await` the result.
pub(crate) enum Command {
    WriteBlock {
        path: PathBuf,
        offset: u64,
        data: Vec<u8>,
        reply: Reply<()>,
    },
    ReadBlock {
        path: PathBuf,
        offset: u64,
        len: u32,
        reply: Reply<Vec<u8>>,
    },
    /// Grows (never shrinks) the file at `path` to `len` bytes, used to
    /// lay out a torrent's files ahead of receiving any data so later
    /// writes never need to extend the file themselves.
    Preallocate {
        path: PathBuf,
        len: u64,
        reply: Reply<()>,
    },
    /// Compares each `(path, expected length)` pair against what's
    /// actually on disk, used when resuming a torrent from a checkpoint.
    VerifyFiles {
        files: Vec<(PathBuf, u64)>,
        reply: Reply<VerifyReport>,
    },
    /// Drains every per-path worker (syncing its file to disk) and stops
    /// the actor's event loop. Used during a clean engine shutdown.
    Stop { reply: Reply<()> },
}

/// The result of a [`DiskHandle::verify_files`] call: which expected
/// files are missing entirely, and which are present but shorter than
/// expected.
#[derive(Debug, Default, PartialEq, Eq)]
pub(crate) struct VerifyReport {
    pub missing: Vec<PathBuf>,
    pub truncated: Vec<(PathBuf, u64, u64)>,
}

impl VerifyReport {
    /// Whether every expected file was present and at least as long as
    /// expected.
    pub fn is_ok(&self) -> bool {
        self.missing.is_empty() && self.truncated.is_empty()
    }
}

/// A cheap, cloneable handle to the disk actor. Every peer session and
/// torrent session that needs file I/O holds one of these rather than
/// talking to files directly, so that writes to the same path are always
/// ordered and open file handles are shared rather than duplicated.
#[derive(Clone)]
pub(crate) struct DiskHandle {
    cmd_chan: mpsc::Sender<Command>,
}

impl DiskHandle {
    pub async fn write_block(
        &self,
        path: PathBuf,
        offset: u64,
        data: Vec<u8>,
    ) -> Result<(), DiskError> {
        let (reply, recv) = oneshot::channel();
        self.send(Command::WriteBlock {
            path,
            offset,
            data,
            reply,
        })
        .await?;
        recv.await.map_err(|_| DiskError::ChannelClosed)?
    }

    pub async fn read_block(
        &self,
        path: PathBuf,
        offset: u64,
        len: u32,
    ) -> Result<Vec<u8>, DiskError> {
        let (reply, recv) = oneshot::channel();
        self.send(Command::ReadBlock {
            path,
            offset,
            len,
            reply,
        })
        .await?;
        recv.await.map_err(|_| DiskError::ChannelClosed)?
    }

    pub async fn preallocate(&self, path: PathBuf, len: u64) -> Result<(), DiskError> {
        let (reply, recv) = oneshot::channel();
        self.send(Command::Preallocate { path, len, reply }).await?;
        recv.await.map_err(|_| DiskError::ChannelClosed)?
    }

    pub async fn verify_files(
        &self,
        files: Vec<(PathBuf, u64)>,
    ) -> Result<VerifyReport, DiskError> {
        let (reply, recv) = oneshot::channel();
        self.send(Command::VerifyFiles { files, reply }).await?;
        recv.await.map_err(|_| DiskError::ChannelClosed)?
    }

    pub async fn stop(&self) -> Result<(), DiskError> {
        let (reply, recv) = oneshot::channel();
        self.send(Command::Stop { reply }).await?;
        recv.await.map_err(|_| DiskError::ChannelClosed)?
    }

    async fn send(&self, cmd: Command) -> Result<(), DiskError> {
        self.cmd_chan
            .send(cmd)
            .await
            .map_err(|_| DiskError::ChannelClosed)
    }
}

/// Spawns the disk actor on the current tokio runtime and returns a
/// handle to it. Every torrent and peer session in the process shares
/// the single actor spawned here, cloning the returned handle.
pub(crate) fn spawn() -> DiskHandle {
    let (cmd_chan, cmd_port) = mpsc::channel(CMD_CHANNEL_CAPACITY);
    let disk = Disk::new(cmd_port);
    tokio::spawn(disk.run());
    DiskHandle { cmd_chan }
}
