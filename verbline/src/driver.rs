//! Single-threaded io_uring driver.
//!
//! Streams never block. They report a [`WakeAction`] and the caller decides
//! how to wait. `Driver` is a minimal caller: it waits on completion-channel
//! descriptors with `IORING_OP_POLL_ADD` and sleeps out rate limiting with
//! `IORING_OP_TIMEOUT`, both on one ring.

use std::io;
use std::os::fd::RawFd;
use std::time::{Duration, Instant};

use io_uring::types::{Fd, SubmitArgs, Timespec};
use io_uring::{IoUring, opcode};

use crate::error::{Error, Result};
use crate::recv::{MprqReader, PacketSink};
use crate::send::queue::HeapQueue;
use crate::send::{PacketSource, UdpIbvWriter, WakeAction};
use crate::verbs::Provider;

const POLL_TOKEN: u64 = 1;
const TIMER_TOKEN: u64 = 2;
const CANCEL_TOKEN: u64 = 3;

fn timespec(d: Duration) -> Timespec {
    Timespec::new().sec(d.as_secs()).nsec(d.subsec_nanos())
}

fn is_timeout(e: &io::Error) -> bool {
    matches!(e.raw_os_error(), Some(libc::ETIME) | Some(libc::EINTR))
}

/// Drives streams on the calling thread.
pub struct Driver {
    ring: IoUring,
}

impl Driver {
    pub fn new(entries: u32) -> Result<Self> {
        let ring = IoUring::new(entries)?;
        Ok(Driver { ring })
    }

    /// Push an entry, submitting first if the queue is full.
    fn push(&mut self, entry: io_uring::squeue::Entry) -> io::Result<()> {
        // Safety: entries only reference the fd and timespecs kept alive
        // until their completion is reaped.
        unsafe {
            if self.ring.submission().push(&entry).is_err() {
                self.ring.submit()?;
                if self.ring.submission().push(&entry).is_err() {
                    return Err(io::Error::other("SQ still full after submit"));
                }
            }
        }
        Ok(())
    }

    /// Reap completions until one carries `token`. Returns its result.
    fn reap(&mut self, token: u64) -> Option<i32> {
        let mut found = None;
        for cqe in self.ring.completion() {
            if cqe.user_data() == token {
                found = Some(cqe.result());
            }
        }
        found
    }

    /// Wait until `fd` is readable or `deadline` passes. Returns whether the
    /// descriptor became readable.
    pub fn wait_readable(&mut self, fd: RawFd, deadline: Option<Instant>) -> Result<bool> {
        let entry = opcode::PollAdd::new(Fd(fd), libc::POLLIN as u32)
            .build()
            .user_data(POLL_TOKEN);
        self.push(entry)?;
        loop {
            let submitted = match deadline {
                None => self.ring.submit_and_wait(1),
                Some(deadline) => {
                    let ts = timespec(deadline.saturating_duration_since(Instant::now()));
                    let args = SubmitArgs::new().timespec(&ts);
                    self.ring.submitter().submit_with_args(1, &args)
                }
            };
            match submitted {
                Ok(_) => {}
                Err(e) if is_timeout(&e) => {}
                Err(e) => return Err(Error::Io(e)),
            }
            if let Some(res) = self.reap(POLL_TOKEN) {
                if res < 0 {
                    return Err(Error::Io(io::Error::from_raw_os_error(-res)));
                }
                return Ok(true);
            }
            if deadline.is_some_and(|d| Instant::now() >= d) {
                self.cancel_poll()?;
                return Ok(false);
            }
        }
    }

    /// Withdraw the outstanding poll and wait for it to retire.
    fn cancel_poll(&mut self) -> Result<()> {
        let entry = opcode::AsyncCancel::new(POLL_TOKEN)
            .build()
            .user_data(CANCEL_TOKEN);
        self.push(entry)?;
        loop {
            match self.ring.submit_and_wait(1) {
                Ok(_) => {}
                Err(e) if is_timeout(&e) => continue,
                Err(e) => return Err(Error::Io(e)),
            }
            if self.reap(POLL_TOKEN).is_some() {
                return Ok(());
            }
        }
    }

    /// Block until `deadline`.
    pub fn sleep_until(&mut self, deadline: Instant) -> Result<()> {
        let ts = timespec(deadline.saturating_duration_since(Instant::now()));
        let entry = opcode::Timeout::new(&ts as *const Timespec)
            .build()
            .user_data(TIMER_TOKEN);
        self.push(entry)?;
        loop {
            match self.ring.submit_and_wait(1) {
                Ok(_) => {}
                Err(e) if is_timeout(&e) => continue,
                Err(e) => return Err(Error::Io(e)),
            }
            if self.reap(TIMER_TOKEN).is_some() {
                return Ok(());
            }
        }
    }

    /// Run `writer` until it needs something only the caller can provide:
    /// more packets ([`WakeAction::NewPackets`]) or time
    /// ([`WakeAction::Sleep`]).
    pub fn run_writer<P: Provider>(
        &mut self,
        writer: &mut UdpIbvWriter<P>,
        source: &mut impl PacketSource,
    ) -> Result<WakeAction> {
        let mut action = writer.wakeup(source)?;
        loop {
            action = match action {
                WakeAction::Immediate => writer.wakeup(source)?,
                WakeAction::CompletionEvent => match writer.completion_fd() {
                    Some(fd) => {
                        self.wait_readable(fd, None)?;
                        writer.handle_completion_event(source)?
                    }
                    None => writer.wakeup(source)?,
                },
                other => return Ok(other),
            };
        }
    }

    /// Send everything queued in `queue`, sleeping through rate limiting,
    /// and wait for every heap to complete.
    pub fn flush<P: Provider>(
        &mut self,
        writer: &mut UdpIbvWriter<P>,
        queue: &mut HeapQueue,
    ) -> Result<()> {
        loop {
            match self.run_writer(writer, queue)? {
                WakeAction::Sleep => {
                    if let Some(deadline) = queue.sleep_deadline() {
                        self.sleep_until(deadline)?;
                    }
                }
                _ if queue.is_idle() => return Ok(()),
                _ => {}
            }
        }
    }

    /// Run `reader` until the sink stops, or until `deadline` passes while
    /// waiting for traffic. Returns [`WakeAction::Stopped`] in the first case
    /// and [`WakeAction::CompletionEvent`] in the second.
    pub fn run_reader<P: Provider>(
        &mut self,
        reader: &mut MprqReader<P>,
        sink: &mut impl PacketSink,
        deadline: Option<Instant>,
    ) -> Result<WakeAction> {
        let mut action = reader.read(sink)?;
        loop {
            action = match action {
                WakeAction::Stopped => return Ok(WakeAction::Stopped),
                WakeAction::CompletionEvent => match reader.completion_fd() {
                    Some(fd) => {
                        if !self.wait_readable(fd, deadline)? {
                            return Ok(WakeAction::CompletionEvent);
                        }
                        reader.handle_completion_event(sink)?
                    }
                    None => reader.read(sink)?,
                },
                _ if deadline.is_some_and(|d| Instant::now() >= d) => {
                    return Ok(WakeAction::CompletionEvent);
                }
                _ => reader.read(sink)?,
            };
        }
    }
}
