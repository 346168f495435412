use std::io;
use std::net::{SocketAddr, TcpListener};
use std::os::fd::{AsRawFd, FromRawFd, OwnedFd, RawFd};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc;
use std::time::Duration;

use tracing::{debug, info, warn};

use crate::core::buffer_pool::BufferPool;
use crate::core::channel::{ChannelHandle, ChannelRole, Readiness};
use crate::core::socket::{ReadOutcome, read_nonblocking};
use crate::error::{Error, Result};
use crate::poll::{PollStrategyKind, Poller, ReadyEvent};
use crate::util::fd::{close_fd_quiet, set_nonblocking};

use super::acceptor::Acceptor;
use super::channel_pool::ChannelArena;
use super::config::LoopConfig;
use super::handler::{Disposition, TaskHandler};
use super::task::{Priority, PriorityMarker, Task, TaskQueue};

struct Handoff {
    fd: RawFd,
    peer: Option<SocketAddr>,
}

/// Cross-thread entry point for handing accepted descriptors to a loop.
///
/// Ownership of the descriptor passes to the loop on a successful call.
#[derive(Clone)]
pub struct ConnectionInbox {
    tx: mpsc::Sender<Handoff>,
    waker: Arc<OwnedFd>,
}

impl ConnectionInbox {
    pub fn hand_over(&self, fd: RawFd, peer: Option<SocketAddr>) -> Result<()> {
        if let Err(mpsc::SendError(h)) = self.tx.send(Handoff { fd, peer }) {
            close_fd_quiet(h.fd);
            return Err(Error::Io(io::Error::new(
                io::ErrorKind::BrokenPipe,
                "event loop has stopped",
            )));
        }
        let one: u64 = 1;
        let ret = unsafe {
            libc::write(
                self.waker.as_raw_fd(),
                &one as *const u64 as *const libc::c_void,
                std::mem::size_of::<u64>(),
            )
        };
        if ret < 0 {
            // counter saturated means a wakeup is already pending
            debug!(error = %io::Error::last_os_error(), "waker write failed");
        }
        Ok(())
    }
}

#[derive(Debug, Default, Clone, Copy)]
pub struct LoopStats {
    pub iterations: u64,
    pub reads: u64,
    pub elevated_tasks: u64,
    pub normal_tasks: u64,
    pub tasks_processed: u64,
    pub channels_opened: u64,
    pub channels_closed: u64,
    pub stale_events: u64,
}

/// Single-threaded readiness loop
///
/// Each iteration waits on the poller, performs one bounded read per ready
/// channel (turning data into tasks), then drains the task queue completely,
/// elevated tasks first, before waiting again.
pub struct EventLoop<H: TaskHandler> {
    id: usize,
    config: LoopConfig,
    poller: Poller,
    channels: ChannelArena,
    queue: Arc<TaskQueue>,
    pool: BufferPool,
    marker: PriorityMarker,
    handler: H,
    shutdown: Arc<AtomicBool>,

    acceptor: Option<Acceptor>,
    waker: Arc<OwnedFd>,
    inbox_tx: mpsc::Sender<Handoff>,
    inbox_rx: mpsc::Receiver<Handoff>,

    ready: Vec<ReadyEvent>,
    /// Channels with unread bytes or an unobserved close after their last
    /// read. Edge-triggered backends will not report them again, so they are
    /// read on the next turn.
    carry: Vec<ChannelHandle>,
    stats: LoopStats,
}

impl<H: TaskHandler> EventLoop<H> {
    pub fn new(id: usize, config: LoopConfig, handler: H, shutdown: Arc<AtomicBool>) -> Result<Self> {
        let mut poller = Poller::new(config.poll_strategy, config.ring_entries)?;
        let mut channels = ChannelArena::new(config.max_channels);

        let raw = unsafe { libc::eventfd(0, libc::EFD_NONBLOCK | libc::EFD_CLOEXEC) };
        if raw < 0 {
            return Err(Error::Io(io::Error::last_os_error()));
        }
        let waker = Arc::new(unsafe { OwnedFd::from_raw_fd(raw) });
        let waker_handle = channels.insert(raw, ChannelRole::Waker)?;
        if let Some(ch) = channels.get(waker_handle) {
            poller.register(ch)?;
        }

        let (inbox_tx, inbox_rx) = mpsc::channel();
        let pool = BufferPool::new(config.read_buffer_size, config.idle_buffers);
        let marker = PriorityMarker::new(&config.priority_marker);

        Ok(Self {
            id,
            config,
            poller,
            channels,
            queue: Arc::new(TaskQueue::new()),
            pool,
            marker,
            handler,
            shutdown,
            acceptor: None,
            waker,
            inbox_tx,
            inbox_rx,
            ready: Vec::new(),
            carry: Vec::new(),
            stats: LoopStats::default(),
        })
    }

    pub fn id(&self) -> usize {
        self.id
    }

    pub fn poll_strategy(&self) -> PollStrategyKind {
        self.poller.kind()
    }

    pub fn stats(&self) -> LoopStats {
        self.stats
    }

    pub fn handler(&self) -> &H {
        &self.handler
    }

    pub fn handler_mut(&mut self) -> &mut H {
        &mut self.handler
    }

    /// The loop's queue; other loops may push into it.
    pub fn queue(&self) -> Arc<TaskQueue> {
        Arc::clone(&self.queue)
    }

    pub fn inbox(&self) -> ConnectionInbox {
        ConnectionInbox {
            tx: self.inbox_tx.clone(),
            waker: Arc::clone(&self.waker),
        }
    }

    /// Number of live client channels.
    pub fn client_count(&self) -> usize {
        self.channels
            .handles()
            .into_iter()
            .filter(|&h| {
                self.channels
                    .get(h)
                    .is_some_and(|c| c.role == ChannelRole::Client)
            })
            .count()
    }

    /// Watch a listening socket; readiness on it accepts until would-block.
    pub fn attach_listener(&mut self, listener: TcpListener) -> Result<ChannelHandle> {
        let acceptor = Acceptor::new(listener)?;
        let handle = self.channels.insert(acceptor.fd(), ChannelRole::Listener)?;
        let registered = match self.channels.get(handle) {
            Some(ch) => self.poller.register(ch),
            None => Ok(()),
        };
        if let Err(e) = registered {
            self.channels.remove(handle);
            return Err(e);
        }
        self.acceptor = Some(acceptor);
        Ok(handle)
    }

    /// Take ownership of an accepted descriptor and start watching it.
    ///
    /// On error the descriptor has already been closed.
    pub fn add_connection(&mut self, fd: RawFd, peer: Option<SocketAddr>) -> Result<ChannelHandle> {
        if let Err(e) = set_nonblocking(fd) {
            close_fd_quiet(fd);
            return Err(e.into());
        }
        let handle = match self.channels.insert(fd, ChannelRole::Client) {
            Ok(h) => h,
            Err(e) => {
                close_fd_quiet(fd);
                return Err(e);
            }
        };
        if let Some(ch) = self.channels.get_mut(handle) {
            ch.peer = peer;
        }
        let registered = match self.channels.get(handle) {
            Some(ch) => self.poller.register(ch),
            None => Ok(()),
        };
        if let Err(e) = registered {
            self.channels.remove(handle);
            close_fd_quiet(fd);
            return Err(e);
        }

        self.stats.channels_opened += 1;
        debug!(worker = self.id, fd, handle = %handle, "channel registered");
        Ok(handle)
    }

    /// Run until the shutdown flag is observed.
    ///
    /// The flag is checked once per iteration, so stopping can take up to one
    /// poll timeout.
    pub fn run(&mut self) -> Result<()> {
        info!(
            worker = self.id,
            strategy = %self.poller.kind(),
            timeout_ms = self.config.poll_timeout.as_millis() as u64,
            "event loop started"
        );

        let mut result = Ok(());
        while !self.shutdown.load(Ordering::Acquire) {
            if let Err(e) = self.turn() {
                result = Err(e);
                break;
            }
        }

        self.close_all();
        info!(worker = self.id, tasks = self.stats.tasks_processed, "event loop stopped");
        result
    }

    /// One wait → read → drain iteration. Returns the number of tasks drained.
    pub fn turn(&mut self) -> Result<usize> {
        self.stats.iterations += 1;
        if self.stats.iterations % 10_000 == 0 {
            debug!(
                worker = self.id,
                iterations = self.stats.iterations,
                channels = self.channels.len(),
                idle_buffers = self.pool.idle(),
                buffer_kb = self.pool.usage_kb(),
                "loop heartbeat"
            );
        }

        self.drain_inbox();

        let carried = std::mem::take(&mut self.carry);
        let timeout = if carried.is_empty() {
            self.config.poll_timeout
        } else {
            Duration::ZERO
        };

        let mut ready = std::mem::take(&mut self.ready);
        ready.clear();
        if let Err(e) = self.poller.wait(timeout, &mut ready) {
            self.ready = ready;
            return Err(e);
        }
        for handle in carried {
            if !ready.iter().any(|e| e.handle == handle) {
                ready.push(ReadyEvent {
                    handle,
                    readiness: Readiness::READABLE,
                });
            }
        }

        // readiness pass: produce tasks only
        for event in &ready {
            self.dispatch(*event);
        }
        self.ready = ready;

        // drain pass: consume everything produced
        Ok(self.drain())
    }

    fn dispatch(&mut self, event: ReadyEvent) {
        let Some(ch) = self.channels.get_mut(event.handle) else {
            self.stats.stale_events += 1;
            debug!(worker = self.id, handle = %event.handle, "event for torn-down channel");
            return;
        };
        ch.observed = event.readiness;
        let role = ch.role;

        match role {
            ChannelRole::Listener => self.accept_pending(),
            ChannelRole::Waker => {
                self.clear_waker();
                self.drain_inbox();
            }
            ChannelRole::Client => {
                if event.readiness.wants_read() {
                    self.read_channel(event.handle, event.readiness);
                }
            }
        }
    }

    /// One bounded read. A read that fills the buffer, or that returns data
    /// alongside a hangup or error, is re-read next turn: an edge-triggered
    /// backend reports neither again.
    fn read_channel(&mut self, handle: ChannelHandle, readiness: Readiness) {
        let Some(fd) = self.channels.get(handle).map(|c| c.fd) else {
            return;
        };

        let mut buf = self.pool.acquire();
        match read_nonblocking(fd, &mut buf) {
            ReadOutcome::Data(n) => {
                let filled = n == buf.len();
                buf.truncate(n);
                self.stats.reads += 1;

                let Some(ch) = self.channels.get_mut(handle) else {
                    self.pool.release(buf);
                    return;
                };
                let priority = self.marker.classify(&mut ch.marker_tail, &buf);
                let peer = ch.peer;

                let closing =
                    readiness.contains(Readiness::HANGUP) || readiness.contains(Readiness::ERROR);
                if filled || closing {
                    self.carry.push(handle);
                }
                match priority {
                    Priority::Elevated => {
                        self.stats.elevated_tasks += 1;
                        debug!(worker = self.id, fd, "elevated request, jumping the queue");
                    }
                    Priority::Normal => self.stats.normal_tasks += 1,
                }

                self.queue.push(Task {
                    priority,
                    worker: self.id,
                    origin: handle,
                    peer,
                    payload: buf,
                });
            }
            ReadOutcome::WouldBlock => self.pool.release(buf),
            ReadOutcome::Closed => {
                self.pool.release(buf);
                debug!(worker = self.id, fd, "peer closed");
                self.teardown(handle);
            }
            ReadOutcome::Failed(e) => {
                self.pool.release(buf);
                warn!(worker = self.id, fd, error = %e, "read failed, dropping channel");
                self.teardown(handle);
            }
        }
    }

    fn drain(&mut self) -> usize {
        let mut processed = 0;
        while let Some(task) = self.queue.pop() {
            let origin = if task.worker == self.id {
                self.channels
                    .get(task.origin)
                    .filter(|c| c.role == ChannelRole::Client)
                    .map(|c| c.fd)
            } else {
                None
            };

            let disposition = self.handler.handle(&task, origin);
            processed += 1;
            if disposition == Disposition::Close && origin.is_some() {
                self.teardown(task.origin);
            }
            self.pool.release(task.payload);
        }
        self.stats.tasks_processed += processed as u64;
        processed
    }

    fn teardown(&mut self, handle: ChannelHandle) {
        let Some(ch) = self.channels.remove(handle) else {
            debug!(worker = self.id, handle = %handle, "teardown of unknown channel ignored");
            return;
        };
        self.poller.deregister(&ch);

        match ch.role {
            ChannelRole::Client => {
                self.handler.on_close(&ch);
                close_fd_quiet(ch.fd);
                self.stats.channels_closed += 1;
            }
            // dropping the listener closes it
            ChannelRole::Listener => self.acceptor = None,
            // shared with inboxes; closed with the last reference
            ChannelRole::Waker => {}
        }
    }

    fn accept_pending(&mut self) {
        let accepted = match &self.acceptor {
            Some(acceptor) => acceptor.accept_pending(),
            None => return,
        };
        for (fd, peer) in accepted {
            if let Err(e) = self.add_connection(fd, Some(peer)) {
                warn!(worker = self.id, %peer, error = %e, "could not register accepted connection");
            }
        }
    }

    fn clear_waker(&mut self) {
        let mut counter: u64 = 0;
        loop {
            let n = unsafe {
                libc::read(
                    self.waker.as_raw_fd(),
                    &mut counter as *mut u64 as *mut libc::c_void,
                    std::mem::size_of::<u64>(),
                )
            };
            if n <= 0 {
                break;
            }
        }
    }

    fn drain_inbox(&mut self) {
        while let Ok(h) = self.inbox_rx.try_recv() {
            if let Err(e) = self.add_connection(h.fd, h.peer) {
                warn!(worker = self.id, fd = h.fd, error = %e, "handed-over connection rejected");
            }
        }
    }

    fn close_all(&mut self) {
        for handle in self.channels.handles() {
            self.teardown(handle);
        }
    }
}

impl<H: TaskHandler> Drop for EventLoop<H> {
    fn drop(&mut self) {
        self.close_all();
    }
}
