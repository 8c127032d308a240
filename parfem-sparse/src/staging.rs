use crate::MatrixError;
use parfem_comm::{CollectiveContext, CommError, Exchangeable};
use std::mem::take;

/// Contributions to rows owned by other ranks, bucketed by destination rank.
///
/// Stored in triplet-like form: every contribution consists of `stride` global indices
/// (row and column for matrices, only the row for vectors) and one value.
/// Duplicates are kept; they are summed by the owner when the contributions arrive.
#[derive(Debug, Clone)]
pub(crate) struct StagingBuffers<T> {
    stride: usize,
    indices: Vec<Vec<usize>>,
    values: Vec<Vec<T>>,
}

impl<T> StagingBuffers<T> {
    pub fn new(num_ranks: usize, stride: usize) -> Self {
        assert!(stride > 0);
        Self {
            stride,
            indices: (0..num_ranks).map(|_| Vec::new()).collect(),
            values: (0..num_ranks).map(|_| Vec::new()).collect(),
        }
    }

    #[inline(always)]
    pub fn push(&mut self, destination: usize, indices: &[usize], value: T) {
        debug_assert_eq!(indices.len(), self.stride);
        self.indices[destination].extend_from_slice(indices);
        self.values[destination].push(value);
    }

    /// Total number of staged contributions.
    pub fn len(&self) -> usize {
        self.values.iter().map(Vec::len).sum()
    }

    pub fn clear(&mut self) {
        self.indices.iter_mut().for_each(Vec::clear);
        self.values.iter_mut().for_each(Vec::clear);
    }

    /// Move the staged buffers out, leaving empty buckets behind.
    pub fn take(&mut self) -> (Vec<Vec<usize>>, Vec<Vec<T>>) {
        let num_ranks = self.values.len();
        let indices = take(&mut self.indices);
        let values = take(&mut self.values);
        self.indices = (0..num_ranks).map(|_| Vec::new()).collect();
        self.values = (0..num_ranks).map(|_| Vec::new()).collect();
        (indices, values)
    }
}

/// Contributions received from every rank in a finalize exchange.
pub(crate) struct Incoming<T> {
    pub stride: usize,
    pub indices: Vec<Vec<usize>>,
    pub values: Vec<Vec<T>>,
    pub sent: usize,
}

impl<T: Exchangeable> StagingBuffers<T> {
    /// Send every staged contribution to its destination, emptying the buffers.
    ///
    /// Collective. Indices and values travel in two batched exchanges.
    pub fn exchange<C: CollectiveContext>(&mut self, ctx: &C) -> Result<Incoming<T>, MatrixError> {
        let sent = self.len();
        let (indices, values) = self.take();
        let indices = ctx.exchange(indices)?;
        let values = ctx.exchange(values)?;

        for (source, (idx, vals)) in indices.iter().zip(&values).enumerate() {
            if idx.len() != self.stride * vals.len() {
                return Err(CommError::Mismatch(format!(
                    "rank {source} sent {} indices for {} values with stride {}",
                    idx.len(),
                    vals.len(),
                    self.stride
                ))
                .into());
            }
        }

        Ok(Incoming {
            stride: self.stride,
            indices,
            values,
            sent,
        })
    }
}

impl<T: Copy> Incoming<T> {
    /// Iterate over `(source_rank, indices, value)` of all received contributions.
    pub fn iter(&self) -> impl Iterator<Item = (usize, &[usize], T)> + '_ {
        let stride = self.stride;
        self.indices
            .iter()
            .zip(&self.values)
            .enumerate()
            .flat_map(move |(source, (idx, vals))| {
                idx.chunks_exact(stride)
                    .zip(vals)
                    .map(move |(entry_indices, &value)| (source, entry_indices, value))
            })
    }

    pub fn num_received(&self) -> usize {
        self.values.iter().map(Vec::len).sum()
    }
}
