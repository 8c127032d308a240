use crate::{check_buffer_count, CollectiveContext, CommError, Exchangeable};
use crossbeam::channel::{unbounded, Receiver, RecvTimeoutError, Sender};
use log::trace;
use std::any::Any;
use std::panic::resume_unwind;
use std::thread;
use std::time::Duration;

type Payload = Box<dyn Any + Send>;

/// One rank of a group of ranks living in the same process.
///
/// Each ordered pair of ranks is connected by its own FIFO channel, so messages between two
/// ranks arrive in the order they were sent. Since every rank issues collectives in the same
/// order, no message tags are needed.
///
/// Dropping a context disconnects all of its channels. A peer that is blocked waiting on a rank
/// that has dropped out fails with [`CommError::Disconnected`] instead of hanging.
#[derive(Debug)]
pub struct ThreadedContext {
    rank: usize,
    senders: Vec<Sender<Payload>>,
    receivers: Vec<Receiver<Payload>>,
    timeout: Option<Duration>,
}

impl ThreadedContext {
    /// Create the contexts for a group of `size` ranks. Context `r` has rank `r`.
    ///
    /// # Panics
    ///
    /// Panics if `size` is zero.
    pub fn create_group(size: usize) -> Vec<ThreadedContext> {
        assert!(size > 0, "A group must contain at least one rank.");

        // channels[src][dst]
        let mut senders: Vec<Vec<Sender<Payload>>> = (0..size).map(|_| Vec::with_capacity(size)).collect();
        let mut receivers: Vec<Vec<Receiver<Payload>>> = (0..size).map(|_| Vec::with_capacity(size)).collect();
        for src in 0..size {
            for dst in 0..size {
                let (sender, receiver) = unbounded();
                senders[src].push(sender);
                // Receivers are stored by destination, indexed by source
                receivers[dst].push(receiver);
            }
        }

        senders
            .into_iter()
            .zip(receivers)
            .enumerate()
            .map(|(rank, (senders, receivers))| ThreadedContext {
                rank,
                senders,
                receivers,
                timeout: None,
            })
            .collect()
    }

    /// Fail receives that take longer than `timeout` instead of blocking indefinitely.
    pub fn with_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn timeout(&self) -> Option<Duration> {
        self.timeout
    }

    fn send_to(&self, dst: usize, payload: Payload) -> Result<(), CommError> {
        self.senders[dst]
            .send(payload)
            .map_err(|_| CommError::Disconnected { peer: dst })
    }

    fn receive_from<T: 'static>(&self, src: usize) -> Result<T, CommError> {
        let receiver = &self.receivers[src];
        let payload = match self.timeout {
            None => receiver.recv().map_err(|_| CommError::Disconnected { peer: src })?,
            Some(timeout) => receiver.recv_timeout(timeout).map_err(|err| match err {
                RecvTimeoutError::Timeout => CommError::Timeout { peer: src, timeout },
                RecvTimeoutError::Disconnected => CommError::Disconnected { peer: src },
            })?,
        };
        payload
            .downcast::<T>()
            .map(|boxed| *boxed)
            .map_err(|_| CommError::UnexpectedPayload { peer: src })
    }
}

impl CollectiveContext for ThreadedContext {
    fn rank(&self) -> usize {
        self.rank
    }

    fn size(&self) -> usize {
        self.senders.len()
    }

    fn barrier(&self) -> Result<(), CommError> {
        trace!("[{}] barrier", self.rank);
        self.all_gather(0u8).map(|_| ())
    }

    fn all_gather<T: Exchangeable>(&self, value: T) -> Result<Vec<T>, CommError> {
        for dst in (0..self.size()).filter(|&dst| dst != self.rank) {
            self.send_to(dst, Box::new(value))?;
        }

        (0..self.size())
            .map(|src| {
                if src == self.rank {
                    Ok(value)
                } else {
                    self.receive_from::<T>(src)
                }
            })
            .collect()
    }

    fn exchange<T: Exchangeable>(&self, outgoing: Vec<Vec<T>>) -> Result<Vec<Vec<T>>, CommError> {
        check_buffer_count(&outgoing, self.size())?;

        let mut own_buffer = Vec::new();
        for (dst, buffer) in outgoing.into_iter().enumerate() {
            if dst == self.rank {
                own_buffer = buffer;
            } else {
                self.send_to(dst, Box::new(buffer))?;
            }
        }

        let mut incoming = Vec::with_capacity(self.size());
        for src in 0..self.size() {
            if src == self.rank {
                incoming.push(std::mem::take(&mut own_buffer));
            } else {
                incoming.push(self.receive_from::<Vec<T>>(src)?);
            }
        }
        Ok(incoming)
    }
}

/// Runs a function on a group of in-process ranks, one thread per rank.
///
/// ```
/// use parfem_comm::{CollectiveContext, ThreadedUniverse};
///
/// let sums = ThreadedUniverse::new(3).run(|ctx| ctx.all_reduce_sum(ctx.rank()).unwrap());
/// assert_eq!(sums, vec![3, 3, 3]);
/// ```
#[derive(Debug, Clone)]
pub struct ThreadedUniverse {
    size: usize,
    timeout: Option<Duration>,
}

impl ThreadedUniverse {
    /// # Panics
    ///
    /// Panics if `size` is zero.
    pub fn new(size: usize) -> Self {
        assert!(size > 0, "A universe must contain at least one rank.");
        Self { size, timeout: None }
    }

    pub fn with_timeout(self, timeout: Option<Duration>) -> Self {
        Self { timeout, ..self }
    }

    pub fn size(&self) -> usize {
        self.size
    }

    /// Run `f` on every rank and collect the results in rank order.
    ///
    /// The context is moved into `f`, so it is dropped (and its channels disconnected) as soon
    /// as the rank returns. If any rank panics, the panic is propagated after all ranks have
    /// finished.
    pub fn run<F, R>(&self, f: F) -> Vec<R>
    where
        F: Fn(ThreadedContext) -> R + Sync,
        R: Send,
    {
        let contexts: Vec<_> = ThreadedContext::create_group(self.size)
            .into_iter()
            .map(|ctx| ctx.with_timeout(self.timeout))
            .collect();

        let f = &f;
        thread::scope(|scope| {
            let handles: Vec<_> = contexts
                .into_iter()
                .map(|ctx| {
                    thread::Builder::new()
                        .name(format!("rank-{}", ctx.rank()))
                        .spawn_scoped(scope, move || f(ctx))
                        .expect("Failed to spawn rank thread")
                })
                .collect();

            handles
                .into_iter()
                .map(|handle| handle.join().unwrap_or_else(|payload| resume_unwind(payload)))
                .collect()
        })
    }
}
