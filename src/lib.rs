//! In place sorting of `i32` device buffers with a bitonic merge network.
//!
//! [`Sorter`] drives the five sort stages over any [`ComputeBackend`]: [`WgpuBackend`] runs them as
//! wgpu compute pipelines, [`HostEmulator`] runs the same kernels on the CPU.

pub mod backend;
pub mod error;
pub mod options;
pub mod sorter;
pub mod wgpu_utils;

pub use bitonic_merge_sorting as network;

pub use backend::{
    gpu::{WgpuBackend, WgpuBackendConfig},
    host::{HostBuffer, HostEmulator},
    ComputeBackend, HostTransfer, Kernel,
};
pub use error::{Result, SortError};
pub use options::SortOptions;
pub use sorter::Sorter;
