//! Per-connection state and the blocking reader loop.
//!
//! Each upgraded connection is owned by one OS thread running [`run_loop`].
//! The wire (frame stream plus the protocol instance that interprets it)
//! lives behind the connection's acquire lock: whoever holds the lock has
//! exclusive rights to read and write the socket. The reader loop acquires
//! with a 5 ms budget; the callback dispatcher acquires with its configured
//! timeout, drains pending inbound work, then injects its own request.
//!
//! [`run_loop`]: Connection::run_loop

use crate::frame::{Frame, FrameStream, Opcode, WireIo};
use crate::protocol::{ProtocolContext, WsProtocol};
use crate::rest::RestHandler;
use bytes::Bytes;
use parking_lot::{Mutex, MutexGuard};
use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::time::{Duration, Instant};

/// Reader-loop budget for grabbing the acquire lock.
pub const ACQUIRE_BUDGET: Duration = Duration::from_millis(5);
/// Reader-loop budget for one frame read.
pub const READ_BUDGET: Duration = Duration::from_millis(5);
/// Idle time after which the loop emits a keepalive ping.
pub const IDLE_PING_MILLIS: u64 = 5000;
/// Loop sleep when nothing happened.
const IDLE_SLEEP: Duration = Duration::from_millis(5);
/// Loop back-off after a swallowed error.
const ERROR_BACKOFF: Duration = Duration::from_millis(10);

/// Identity of an upgraded connection, unique per server.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ConnectionId(pub u64);

impl fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// Process-monotonic millisecond clock shared by a server's connections.
#[derive(Debug)]
pub struct EngineClock {
    epoch: Instant,
}

impl Default for EngineClock {
    fn default() -> Self {
        Self::new()
    }
}

impl EngineClock {
    /// Start the clock.
    #[must_use]
    pub fn new() -> Self {
        Self {
            epoch: Instant::now(),
        }
    }

    /// Milliseconds since the clock started.
    #[must_use]
    pub fn now_millis(&self) -> u64 {
        u64::try_from(self.epoch.elapsed().as_millis()).unwrap_or(u64::MAX)
    }

    /// A clock that has already been running for `by`, so idle intervals
    /// can be rewound without sleeping through them.
    #[cfg(test)]
    pub(crate) fn backdated(by: Duration) -> Self {
        Self {
            epoch: Instant::now() - by,
        }
    }
}

/// Outcome of one reader-loop iteration.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProcessResult {
    /// Nothing happened: lock busy or no data within the read budget.
    Idle,
    /// One frame was processed.
    Done,
    /// Something failed; the failure was swallowed.
    Error,
    /// The peer closed; the loop must exit.
    Closed,
}

/// Everything that only the acquire-lock holder may touch.
pub(crate) struct WireCore {
    pub(crate) stream: FrameStream<Box<dyn WireIo + Send>>,
    pub(crate) protocol: Box<dyn WsProtocol>,
}

/// One upgraded connection.
///
/// Holds exactly one protocol instance, cloned from its prototype at
/// upgrade; it is never reassigned.
pub struct Connection {
    id: ConnectionId,
    protocol_name: String,
    core: Mutex<WireCore>,
    last_ping_tick: AtomicU64,
    try_acquire_count: AtomicUsize,
    terminated: AtomicBool,
}

impl Connection {
    /// Build a connection from an upgraded wire and its protocol instance.
    pub(crate) fn new(
        id: ConnectionId,
        protocol: Box<dyn WsProtocol>,
        stream: FrameStream<Box<dyn WireIo + Send>>,
        clock: &EngineClock,
    ) -> Self {
        let protocol_name = protocol.name().to_string();
        Self {
            id,
            protocol_name,
            core: Mutex::new(WireCore { stream, protocol }),
            last_ping_tick: AtomicU64::new(clock.now_millis()),
            try_acquire_count: AtomicUsize::new(0),
            terminated: AtomicBool::new(false),
        }
    }

    /// This connection's identity.
    #[must_use]
    pub fn id(&self) -> ConnectionId {
        self.id
    }

    /// Name of the negotiated subprotocol.
    #[must_use]
    pub fn protocol_name(&self) -> &str {
        &self.protocol_name
    }

    /// Whether the connection has been told to stop.
    #[must_use]
    pub fn is_terminated(&self) -> bool {
        self.terminated.load(Ordering::SeqCst)
    }

    /// Ask the reader loop to exit at its next iteration.
    pub fn terminate(&self) {
        self.terminated.store(true, Ordering::SeqCst);
    }

    /// Millisecond tick of the last wire activity.
    #[must_use]
    pub fn last_ping_tick(&self) -> u64 {
        self.last_ping_tick.load(Ordering::Relaxed)
    }

    pub(crate) fn touch(&self, clock: &EngineClock) {
        self.last_ping_tick
            .store(clock.now_millis(), Ordering::Relaxed);
    }

    /// Try to seize the wire within `timeout`.
    ///
    /// The in-flight attempt counter lets teardown fence on stragglers: the
    /// connection's index entry is dropped only once the counter returns to
    /// zero.
    pub(crate) fn try_acquire(&self, timeout: Duration) -> Option<MutexGuard<'_, WireCore>> {
        self.try_acquire_count.fetch_add(1, Ordering::SeqCst);
        let guard = self.core.try_lock_for(timeout);
        self.try_acquire_count.fetch_sub(1, Ordering::SeqCst);
        guard
    }

    /// Spin until no acquisition attempt is in flight.
    pub(crate) fn drain_acquirers(&self) {
        while self.try_acquire_count.load(Ordering::SeqCst) != 0 {
            std::thread::yield_now();
        }
    }

    /// One reader-loop iteration: seize the wire briefly, process at most
    /// one inbound frame, release.
    pub fn process_one(&self, handler: &dyn RestHandler, clock: &EngineClock) -> ProcessResult {
        let Some(mut core) = self.try_acquire(ACQUIRE_BUDGET) else {
            return ProcessResult::Idle;
        };
        self.process_locked(&mut core, handler, clock)
    }

    /// The body of [`process_one`], for callers already holding the lock
    /// (the callback dispatcher drains with this before injecting).
    ///
    /// [`process_one`]: Connection::process_one
    pub(crate) fn process_locked(
        &self,
        core: &mut WireCore,
        handler: &dyn RestHandler,
        clock: &EngineClock,
    ) -> ProcessResult {
        match core.stream.get_frame(READ_BUDGET) {
            Ok(None) => {
                let now = clock.now_millis();
                if now.saturating_sub(self.last_ping_tick.load(Ordering::Relaxed))
                    > IDLE_PING_MILLIS
                {
                    tracing::trace!(connection = %self.id, "idle, sending keepalive ping");
                    if core.stream.send_frame(&Frame::ping(Bytes::new())).is_err() {
                        self.terminate();
                        return ProcessResult::Error;
                    }
                    // One ping per idle interval.
                    self.last_ping_tick.store(now, Ordering::Relaxed);
                }
                ProcessResult::Idle
            }
            Ok(Some(frame)) => {
                self.touch(clock);
                self.dispatch_frame(core, handler, frame)
            }
            Err(error) => {
                tracing::debug!(connection = %self.id, %error, "frame read failed");
                self.terminate();
                ProcessResult::Error
            }
        }
    }

    fn dispatch_frame(
        &self,
        core: &mut WireCore,
        handler: &dyn RestHandler,
        frame: Frame,
    ) -> ProcessResult {
        match frame.opcode {
            Opcode::Ping => {
                let pong = Frame::pong(frame.payload);
                if core.stream.send_frame(&pong).is_err() {
                    self.terminate();
                    return ProcessResult::Error;
                }
                ProcessResult::Done
            }
            Opcode::Text | Opcode::Binary => {
                let WireCore { stream, protocol } = core;
                let ctx = ProtocolContext {
                    handler,
                    connection_id: self.id,
                };
                match protocol.process_frame(&ctx, &frame) {
                    Ok(Some(answer)) => {
                        if stream.send_frame(&answer).is_err() {
                            self.terminate();
                            return ProcessResult::Error;
                        }
                        ProcessResult::Done
                    }
                    Ok(None) => ProcessResult::Done,
                    Err(error) => {
                        // Per-request fatal: drop the frame, keep the wire.
                        tracing::debug!(connection = %self.id, %error, "frame decode failed");
                        ProcessResult::Error
                    }
                }
            }
            Opcode::ConnectionClose => {
                tracing::debug!(connection = %self.id, "peer sent close, echoing");
                let _ = core.stream.send_frame(&Frame::close(frame.payload));
                self.terminate();
                ProcessResult::Closed
            }
            // Pong refreshes the tick (done above); reserved opcodes and
            // stray continuations are ignored without an answer.
            _ => ProcessResult::Done,
        }
    }

    /// Drive the connection until close or termination. Runs on the thread
    /// that owns the connection; this is the thread-per-connection loop.
    pub fn run_loop(
        &self,
        handler: &dyn RestHandler,
        clock: &EngineClock,
        server_terminated: &AtomicBool,
    ) {
        while !self.is_terminated() && !server_terminated.load(Ordering::SeqCst) {
            match self.process_one(handler, clock) {
                ProcessResult::Idle => std::thread::sleep(IDLE_SLEEP),
                ProcessResult::Done => std::thread::yield_now(),
                ProcessResult::Error => std::thread::sleep(ERROR_BACKOFF),
                ProcessResult::Closed => break,
            }
        }
    }
}
