use crate::{check_buffer_count, CollectiveContext, CommError, Exchangeable};
use mpi::point_to_point::{Destination, Source};
use mpi::request::WaitGuard;
use mpi::traits::{Communicator, CommunicatorCollectives};
use mpi::Tag;

const EXCHANGE_TAG: Tag = 7411;

/// Context backed by an MPI communicator.
///
/// MPI reports communication failures by aborting the job, so the operations of this context
/// never return [`CommError`] for transport problems.
pub struct MpiContext<C: Communicator> {
    comm: C,
}

impl<C: Communicator> MpiContext<C> {
    pub fn new(comm: C) -> Self {
        Self { comm }
    }

    pub fn comm(&self) -> &C {
        &self.comm
    }
}

impl<C: Communicator> CollectiveContext for MpiContext<C> {
    fn rank(&self) -> usize {
        self.comm.rank() as usize
    }

    fn size(&self) -> usize {
        self.comm.size() as usize
    }

    fn barrier(&self) -> Result<(), CommError> {
        self.comm.barrier();
        Ok(())
    }

    fn all_gather<T: Exchangeable>(&self, value: T) -> Result<Vec<T>, CommError> {
        let mut values = vec![T::default(); self.size()];
        self.comm.all_gather_into(&value, &mut values[..]);
        Ok(values)
    }

    fn exchange<T: Exchangeable>(&self, outgoing: Vec<Vec<T>>) -> Result<Vec<Vec<T>>, CommError> {
        let size = self.size();
        let rank = self.comm.rank();
        check_buffer_count(&outgoing, size)?;

        let mut outgoing = outgoing;
        let mut incoming = vec![Vec::new(); size];

        mpi::request::scope(|scope| {
            // Keep all sends in flight while receiving, so that large messages cannot deadlock
            let guards: Vec<_> = (0..self.comm.size())
                .filter(|&p| p != rank)
                .map(|p| {
                    let process = self.comm.process_at_rank(p);
                    WaitGuard::from(process.immediate_send_with_tag(scope, &outgoing[p as usize][..], EXCHANGE_TAG))
                })
                .collect();

            for p in (0..self.comm.size()).filter(|&p| p != rank) {
                let process = self.comm.process_at_rank(p);
                let (data, _status) = process.receive_vec_with_tag::<T>(EXCHANGE_TAG);
                incoming[p as usize] = data;
            }

            drop(guards);
        });

        incoming[rank as usize] = std::mem::take(&mut outgoing[rank as usize]);
        Ok(incoming)
    }
}
