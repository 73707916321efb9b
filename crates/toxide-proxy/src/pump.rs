//! One direction of a link: read, run the toxic chain, write on schedule.
//!
//! A pump owns a reader, a writer and a receiver for its chain. Each chunk read
//! is run through the snapshot current at arrival time and the resulting
//! segments are queued with absolute due times. Reading, writing, chain
//! updates and connection-level timers are multiplexed in one `select!` loop,
//! so a held or delayed segment never blocks reaction to a removed toxic or a
//! cancelled link.

use std::collections::VecDeque;
use std::time::Duration;

use bytes::Bytes;
use rand::rngs::StdRng;
use rand::SeedableRng;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::TcpStream;
use tokio::sync::watch;
use tokio::time::{sleep, sleep_until, Instant};
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace};

use toxide_core::{apply, Direction, Snapshot, ToxicStates};

use crate::config::{MAX_QUEUED_BYTES, READ_BUFFER_SIZE};

/// Why a pump stopped.
#[derive(Debug)]
pub enum PumpEnd {
    /// The source closed and everything queued was written.
    Eof,
    /// A `limit_data` toxic closed the stream.
    LimitReached,
    /// A `timeout` toxic expired.
    TimedOut,
    /// A `reset_peer` toxic fired.
    Reset,
    /// The link was torn down from outside.
    Cancelled,
    /// Reading or writing failed.
    Failed(std::io::Error),
}

impl PumpEnd {
    /// Returns true if the connection should be aborted with a reset.
    pub fn is_reset(&self) -> bool {
        matches!(self, PumpEnd::Reset)
    }
}

#[derive(Debug)]
struct Scheduled {
    data: Bytes,
    due: Instant,
}

/// Forwards one direction of a connection through a toxic chain.
pub struct Pump<R, W> {
    direction: Direction,
    reader: R,
    writer: W,
    chain: watch::Receiver<Snapshot>,
    cancel: CancellationToken,
    states: ToxicStates,
    rng: StdRng,
    queue: VecDeque<Scheduled>,
    queued_bytes: usize,
    last_due: Instant,
    written: u64,
}

impl<R, W> Pump<R, W>
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
{
    /// Creates a pump for `direction`.
    pub fn new(
        direction: Direction,
        reader: R,
        writer: W,
        chain: watch::Receiver<Snapshot>,
        cancel: CancellationToken,
    ) -> Self {
        Self {
            direction,
            reader,
            writer,
            chain,
            cancel,
            states: ToxicStates::new(),
            rng: StdRng::from_entropy(),
            queue: VecDeque::new(),
            queued_bytes: 0,
            last_due: Instant::now(),
            written: 0,
        }
    }

    /// Direction this pump forwards.
    pub fn direction(&self) -> Direction {
        self.direction
    }

    /// Bytes written to the destination so far.
    pub fn written(&self) -> u64 {
        self.written
    }

    /// Runs the pump and hands it back with the reason it stopped.
    pub async fn run_to_end(mut self) -> (PumpEnd, Self) {
        let end = self.run().await;
        (end, self)
    }

    /// Runs until the stream ends, a toxic closes it, or the link is cancelled.
    pub async fn run(&mut self) -> PumpEnd {
        let mut buf = vec![0u8; READ_BUFFER_SIZE];
        let mut snapshot = self.chain.borrow_and_update().clone();
        let mut chain_open = true;
        let mut eof = false;
        let mut closing = false;

        self.states
            .sync(&snapshot, Instant::now().into_std(), &mut self.rng);

        loop {
            let effects = self.states.effects(&snapshot);
            let reset_at = effects.reset_at.map(Instant::from_std);
            let close_at = effects.close_at.map(Instant::from_std);

            if reset_at.is_some_and(|at| at <= Instant::now()) {
                return PumpEnd::Reset;
            }

            if (eof || closing) && self.queue.is_empty() && !effects.blocked {
                return self.finish(effects.slow_close, closing).await;
            }

            let can_read = !eof
                && !closing
                && !effects.blocked
                && self.queued_bytes < MAX_QUEUED_BYTES;
            let next_due = if effects.blocked {
                None
            } else {
                self.queue.front().map(|s| s.due)
            };
            let now = Instant::now();

            tokio::select! {
                biased;

                _ = self.cancel.cancelled() => return PumpEnd::Cancelled,

                _ = sleep_until(reset_at.unwrap_or(now)), if reset_at.is_some() => {
                    return PumpEnd::Reset;
                }

                _ = sleep_until(close_at.unwrap_or(now)), if close_at.is_some() => {
                    return PumpEnd::TimedOut;
                }

                changed = self.chain.changed(), if chain_open => {
                    if changed.is_ok() {
                        snapshot = self.chain.borrow_and_update().clone();
                        self.states
                            .sync(&snapshot, Instant::now().into_std(), &mut self.rng);
                        trace!(direction = %self.direction, toxics = snapshot.len(), "Chain updated");
                    } else {
                        chain_open = false;
                    }
                }

                _ = sleep_until(next_due.unwrap_or(now)), if next_due.is_some() => {
                    if let Some(segment) = self.queue.pop_front() {
                        self.queued_bytes -= segment.data.len();
                        if let Err(end) = self.write(&segment.data, reset_at).await {
                            return end;
                        }
                    }
                }

                read = self.reader.read(&mut buf), if can_read => match read {
                    Ok(0) => eof = true,
                    Ok(n) => {
                        let data = Bytes::copy_from_slice(&buf[..n]);
                        closing = self.schedule(data, &snapshot);
                    }
                    Err(e) => return PumpEnd::Failed(e),
                },
            }
        }
    }

    /// Runs a chunk through the chain and queues its segments.
    ///
    /// Returns true if a toxic asked for the stream to close.
    fn schedule(&mut self, data: Bytes, snapshot: &Snapshot) -> bool {
        let arrived = Instant::now();
        let batch = apply(
            snapshot,
            data,
            &mut self.states,
            arrived.into_std(),
            &mut self.rng,
        );

        for segment in batch.segments {
            let due = (arrived + segment.hold).max(self.last_due) + segment.pause;
            self.last_due = due;
            if segment.data.is_empty() {
                continue;
            }
            self.queued_bytes += segment.data.len();
            self.queue.push_back(Scheduled {
                data: segment.data,
                due,
            });
        }
        batch.close
    }

    async fn write(&mut self, data: &[u8], reset_at: Option<Instant>) -> Result<(), PumpEnd> {
        let now = Instant::now();
        let result = tokio::select! {
            biased;
            _ = self.cancel.cancelled() => return Err(PumpEnd::Cancelled),
            _ = sleep_until(reset_at.unwrap_or(now)), if reset_at.is_some() => {
                return Err(PumpEnd::Reset);
            }
            result = self.writer.write_all(data) => result,
        };

        match result {
            Ok(()) => {
                self.written += data.len() as u64;
                Ok(())
            }
            Err(e) => Err(PumpEnd::Failed(e)),
        }
    }

    async fn finish(&mut self, slow_close: Duration, limited: bool) -> PumpEnd {
        if !slow_close.is_zero() {
            debug!(direction = %self.direction, delay_ms = slow_close.as_millis() as u64, "Delaying close");
            tokio::select! {
                biased;
                _ = self.cancel.cancelled() => return PumpEnd::Cancelled,
                _ = sleep(slow_close) => {}
            }
        }

        if let Err(e) = self.writer.shutdown().await {
            trace!(direction = %self.direction, error = %e, "Shutdown of destination failed");
        }

        if limited {
            PumpEnd::LimitReached
        } else {
            PumpEnd::Eof
        }
    }
}

impl Pump<OwnedReadHalf, OwnedWriteHalf> {
    /// Sets SO_LINGER to zero on both sockets so dropping them sends RST.
    pub(crate) fn abort_on_drop(&self) {
        let streams: [&TcpStream; 2] = [self.reader.as_ref(), self.writer.as_ref()];
        for stream in streams {
            if let Err(e) = socket2::SockRef::from(stream).set_linger(Some(Duration::ZERO)) {
                debug!(direction = %self.direction, error = %e, "Failed to set SO_LINGER");
            }
        }
    }
}
