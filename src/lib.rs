//! Distributed assembly of finite element matrices and vectors.
//!
//! The mesh is partitioned by cells across ranks, and the degrees of freedom on partition
//! boundaries are shared between ranks but owned by exactly one of them. Assembly evaluates an
//! element kernel on every local cell, adds the local tensors into a row-partitioned
//! [`DistributedCsrMatrix`](sparse::DistributedCsrMatrix), and delivers contributions to rows
//! owned by other ranks in a single collective exchange.
//!
//! Every collective operation takes an explicit [`CollectiveContext`](comm::CollectiveContext).
pub mod assembly;
pub mod config;
pub mod dofmap;
pub mod element;
pub mod error;
pub mod kernel;
pub mod mesh;
pub mod partition;
pub mod poisson;
pub mod timing;

pub extern crate nalgebra;
pub extern crate nalgebra_sparse;

pub use parfem_comm as comm;
pub use parfem_sparse as sparse;
pub use parfem_sparse::Real;
