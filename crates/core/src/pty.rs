// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Native PTY backend used to front `tmux attach-session`.
//!
//! The attach process runs on a forkpty'd PTY sized by the caller; output
//! bytes stream to an mpsc channel and input/resize arrive on channels of
//! their own. Resizing the PTY propagates into tmux, which reflows the
//! attached session.

use std::ffi::CString;
use std::io;
use std::os::fd::{AsRawFd, OwnedFd};

use anyhow::{bail, Context};
use bytes::Bytes;
use nix::fcntl::{fcntl, FcntlArg, OFlag};
use nix::libc;
use nix::pty::{forkpty, ForkptyResult, Winsize};
use nix::sys::signal::{kill, Signal};
use nix::sys::wait::{waitpid, WaitPidFlag, WaitStatus};
use nix::unistd::{execvp, Pid};
use tokio::io::unix::AsyncFd;
use tokio::sync::mpsc;

/// Exit status of the attach process.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ExitStatus {
    pub code: Option<i32>,
    pub signal: Option<i32>,
}

/// Newtype wrapper around `OwnedFd` for use with `AsyncFd`.
#[derive(Debug)]
struct MasterFd(OwnedFd);

impl AsRawFd for MasterFd {
    fn as_raw_fd(&self) -> std::os::fd::RawFd {
        self.0.as_raw_fd()
    }
}

/// A child process running on a freshly allocated PTY.
pub struct NativePty {
    master: AsyncFd<MasterFd>,
    child_pid: Pid,
}

impl NativePty {
    /// Spawn `argv` on a new PTY with the given initial size.
    // forkpty requires unsafe: post-fork child is partially initialized
    #[allow(unsafe_code)]
    pub fn spawn(argv: &[String], cols: u16, rows: u16) -> anyhow::Result<Self> {
        anyhow::ensure!(!argv.is_empty(), "empty argv");
        let winsize = Winsize {
            ws_col: cols.max(1),
            ws_row: rows.max(1),
            ws_xpixel: 0,
            ws_ypixel: 0,
        };

        // SAFETY: forkpty is unsafe because the child is in a
        // partially-initialized state after fork. We immediately exec.
        let result = unsafe { forkpty(&winsize, None) }.context("forkpty failed")?;

        match result {
            ForkptyResult::Child => {
                std::env::set_var("TERM", "xterm-256color");

                let c_args: Vec<CString> = argv
                    .iter()
                    .map(|s| CString::new(s.as_bytes()))
                    .collect::<Result<_, _>>()
                    .context("invalid command argument")?;

                execvp(&c_args[0], &c_args).context("execvp failed")?;
                unreachable!();
            }
            ForkptyResult::Parent { child, master } => {
                set_nonblocking(&master)?;
                let afd = AsyncFd::new(MasterFd(master)).context("AsyncFd::new failed")?;
                Ok(Self { master: afd, child_pid: child })
            }
        }
    }

    pub fn child_pid(&self) -> u32 {
        self.child_pid.as_raw() as u32
    }

    /// Pump the PTY until the child exits or all channels close.
    ///
    /// Input bytes are written in arrival order. Resize arrives on a watch
    /// channel so intermediate sizes coalesce; only the latest is applied
    /// via `TIOCSWINSZ`. Closing `input_rx` switches the loop to drain-only
    /// until EOF.
    pub async fn run(
        &mut self,
        output_tx: mpsc::Sender<Bytes>,
        mut input_rx: mpsc::Receiver<Bytes>,
        mut resize_rx: tokio::sync::watch::Receiver<(u16, u16)>,
    ) -> anyhow::Result<ExitStatus> {
        let pid = self.child_pid;
        let mut buf = vec![0u8; 8192];
        let mut input_closed = false;
        let mut resize_open = true;

        loop {
            tokio::select! {
                result = read_chunk(&self.master, &mut buf) => {
                    match result {
                        Ok(0) => break,
                        Ok(n) => {
                            let data = Bytes::copy_from_slice(&buf[..n]);
                            if output_tx.send(data).await.is_err() {
                                break;
                            }
                        }
                        // EIO means the slave side closed (child exited).
                        Err(e) if e.raw_os_error() == Some(libc::EIO) => break,
                        Err(e) => return Err(e.into()),
                    }
                }
                input = input_rx.recv(), if !input_closed => {
                    match input {
                        Some(data) => write_all(&self.master, &data).await?,
                        None => input_closed = true,
                    }
                }
                changed = resize_rx.changed(), if resize_open => {
                    match changed {
                        Ok(()) => {
                            let (cols, rows) = *resize_rx.borrow_and_update();
                            let _ = self.set_winsize(cols, rows);
                        }
                        Err(_) => resize_open = false,
                    }
                }
            }
        }

        // Reap on a blocking thread to avoid stalling the runtime.
        let status =
            tokio::task::spawn_blocking(move || wait_for_exit(pid)).await.context("join wait thread")??;
        Ok(status)
    }

    // TIOCSWINSZ ioctl requires unsafe for the libc::ioctl call
    #[allow(unsafe_code)]
    pub fn set_winsize(&self, cols: u16, rows: u16) -> anyhow::Result<()> {
        let ws = Winsize {
            ws_col: cols.max(1),
            ws_row: rows.max(1),
            ws_xpixel: 0,
            ws_ypixel: 0,
        };

        // SAFETY: TIOCSWINSZ is a well-defined ioctl that sets the window
        // size on the PTY master fd. The Winsize struct is fully
        // initialized.
        let ret = unsafe { libc::ioctl(self.master.as_raw_fd(), libc::TIOCSWINSZ, &ws) };
        if ret < 0 {
            bail!("TIOCSWINSZ ioctl failed: {}", io::Error::last_os_error());
        }
        Ok(())
    }
}

impl Drop for NativePty {
    fn drop(&mut self) {
        // Detach cleanly if possible, then make sure the attach process is gone.
        let _ = kill(self.child_pid, Signal::SIGHUP);
        std::thread::sleep(std::time::Duration::from_millis(50));
        let _ = kill(self.child_pid, Signal::SIGKILL);
        let _ = waitpid(self.child_pid, Some(WaitPidFlag::WNOHANG));
    }
}

fn set_nonblocking(fd: &impl std::os::fd::AsFd) -> io::Result<()> {
    let flags = fcntl(fd, FcntlArg::F_GETFL).map_err(io_err)?;
    let flags = OFlag::from_bits_truncate(flags);
    fcntl(fd, FcntlArg::F_SETFL(flags | OFlag::O_NONBLOCK)).map_err(io_err)?;
    Ok(())
}

async fn read_chunk(afd: &AsyncFd<MasterFd>, buf: &mut [u8]) -> io::Result<usize> {
    loop {
        let mut guard = afd.readable().await?;
        match guard.try_io(|inner| nix::unistd::read(inner, buf).map_err(io_err)) {
            Ok(result) => return result,
            Err(_would_block) => continue,
        }
    }
}

async fn write_all(afd: &AsyncFd<MasterFd>, data: &[u8]) -> io::Result<()> {
    let mut offset = 0;
    while offset < data.len() {
        let mut guard = afd.writable().await?;
        match guard.try_io(|inner| nix::unistd::write(inner, &data[offset..]).map_err(io_err)) {
            Ok(Ok(n)) => offset += n,
            Ok(Err(e)) => return Err(e),
            Err(_would_block) => continue,
        }
    }
    Ok(())
}

fn io_err(e: nix::errno::Errno) -> io::Error {
    io::Error::from_raw_os_error(e as i32)
}

/// Block until the child exits and convert to our `ExitStatus`.
fn wait_for_exit(pid: Pid) -> anyhow::Result<ExitStatus> {
    loop {
        match waitpid(pid, None) {
            Ok(WaitStatus::Exited(_, code)) => return Ok(ExitStatus { code: Some(code), signal: None }),
            Ok(WaitStatus::Signaled(_, sig, _)) => {
                return Ok(ExitStatus { code: None, signal: Some(sig as i32) })
            }
            Ok(_) => continue,
            Err(nix::errno::Errno::EINTR) => continue,
            Err(e) => bail!("waitpid failed: {e}"),
        }
    }
}
