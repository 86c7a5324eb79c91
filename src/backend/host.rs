//! Host emulation of the sorter kernels.
//!
//! Every dispatch runs the kernel body once per logical thread of its grid, sequentially and
//! immediately, on buffers living in host memory. Threads of one dispatch never touch the same
//! element twice, so sequential execution matches the parallel semantics of the shader.
//! Used to exercise the sorter without an adapter, it is not meant to be fast.

use std::cell::{Ref, RefCell, RefMut};

use bitonic_merge_sorting::{should_swap, RankedKey, WorkSize};
use log::trace;

use super::{Bindings, ComputeBackend, Dispatch, HostTransfer, Kernel, KernelParams};
use crate::error::{Result, SortError};

/// Host memory standing in for a device buffer of 32-bit elements.
#[derive(Debug, Default)]
pub struct HostBuffer {
    data: RefCell<Vec<i32>>,
}

impl HostBuffer {
    pub fn new(data: Vec<i32>) -> Self {
        Self { data: RefCell::new(data) }
    }

    pub fn len(&self) -> usize {
        self.data.borrow().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn to_vec(&self) -> Vec<i32> {
        self.data.borrow().clone()
    }

    fn read(&self) -> Result<Ref<'_, Vec<i32>>> {
        self.data.try_borrow().map_err(|_| SortError::Backend("buffer is bound twice in one dispatch".into()))
    }

    fn write(&self) -> Result<RefMut<'_, Vec<i32>>> {
        self.data.try_borrow_mut().map_err(|_| SortError::Backend("buffer is bound twice in one dispatch".into()))
    }
}

/// Record of an executed dispatch.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct DispatchRecord {
    pub kernel: Kernel,
    pub params: KernelParams,
    pub work_size: WorkSize,
}

#[derive(Debug, Default)]
pub struct HostEmulator {
    /// Largest buffer, in elements, that can be allocated.
    max_buffer_len: Option<usize>,
    /// Index of the dispatch that reports a kernel failure.
    failing_dispatch: Option<usize>,
    live_buffers: usize,
    allocated_elements: Vec<usize>,
    dispatches: Vec<DispatchRecord>,
    submissions: usize,
}

impl HostEmulator {
    pub fn new() -> Self {
        Self::default()
    }

    /// Fail allocations above `len` elements, the way a device runs out of memory.
    pub fn with_buffer_limit(len: usize) -> Self {
        Self { max_buffer_len: Some(len), ..Self::default() }
    }

    /// Fail the `index`-th dispatch (counting from zero over the emulator lifetime) instead of running it.
    pub fn with_failing_dispatch(index: usize) -> Self {
        Self { failing_dispatch: Some(index), ..Self::default() }
    }

    /// Buffers created through the backend and not released yet.
    pub fn live_buffers(&self) -> usize {
        self.live_buffers
    }

    /// Sizes of every buffer allocated through the backend, in allocation order.
    pub fn allocations(&self) -> &[usize] {
        &self.allocated_elements
    }

    pub fn dispatches(&self) -> &[DispatchRecord] {
        &self.dispatches
    }

    pub fn submissions(&self) -> usize {
        self.submissions
    }

    fn allocate(&mut self, label: &'static str, data: Vec<i32>) -> Result<HostBuffer> {
        if let Some(max) = self.max_buffer_len {
            if data.len() > max {
                return Err(SortError::Allocation {
                    label,
                    bytes: (data.len() * std::mem::size_of::<i32>()) as u64,
                    reason: format!("emulator limit is {max} elements"),
                });
            }
        }

        self.live_buffers += 1;
        self.allocated_elements.push(data.len());
        Ok(HostBuffer::new(data))
    }
}

/// Element indices handled by the threads of a grid.
fn thread_indices(work_size: WorkSize) -> impl Iterator<Item = usize> {
    work_size.invocations().map(move |invocation| work_size.global_index(invocation) as usize)
}

fn out_of_bounds(kernel: Kernel, index: usize) -> SortError {
    SortError::Backend(format!("{} read out of bounds at element {index}", kernel.entry_point()))
}

fn extremum(source: &HostBuffer, padding_value: &HostBuffer, reverse: bool, params: KernelParams, work_size: WorkSize) -> Result<()> {
    let kernel = Kernel::extremum(reverse);
    let source = source.read()?;
    let mut padding_value = padding_value.write()?;
    let count = params.count as usize;

    for i in thread_indices(work_size).filter(|i| *i < count) {
        let value = *source.get(i).ok_or_else(|| out_of_bounds(kernel, i))?;
        let current = padding_value.get_mut(0).ok_or_else(|| out_of_bounds(kernel, 0))?;
        *current = if reverse { (*current).min(value) } else { (*current).max(value) };
    }
    Ok(())
}

fn pad(source: &HostBuffer, padding_value: &HostBuffer, padded: &HostBuffer, params: KernelParams, work_size: WorkSize) -> Result<()> {
    let source = source.read()?;
    let padding_value = *padding_value.read()?.first().ok_or_else(|| out_of_bounds(Kernel::PadBuffer, 0))?;
    let mut padded = padded.write()?;
    let (count, padded_count) = (params.count as usize, params.padded_count as usize);

    for i in thread_indices(work_size).filter(|i| *i < padded_count) {
        let value = if i < count { *source.get(i).ok_or_else(|| out_of_bounds(Kernel::PadBuffer, i))? } else { padding_value };
        *padded.get_mut(i).ok_or_else(|| out_of_bounds(Kernel::PadBuffer, i))? = value;
    }
    Ok(())
}

fn init_keys(indices: &HostBuffer, params: KernelParams, work_size: WorkSize) -> Result<()> {
    let mut indices = indices.write()?;
    let padded_count = params.padded_count as usize;

    for i in thread_indices(work_size).filter(|i| *i < padded_count) {
        *indices.get_mut(i).ok_or_else(|| out_of_bounds(Kernel::InitKeys, i))? = i as i32;
    }
    Ok(())
}

fn bitonic_sort(indices: &HostBuffer, keys: &HostBuffer, params: KernelParams, work_size: WorkSize) -> Result<()> {
    let keys = keys.read()?;
    let mut indices = indices.write()?;
    let padded_count = params.padded_count as usize;
    let reverse = params.is_reverse();

    if indices.len() < padded_count {
        return Err(out_of_bounds(Kernel::BitonicSort, indices.len()));
    }

    // keys as seen through the index buffer, kept in step with it while swapping
    let mut ranked = indices[..padded_count]
        .iter()
        .map(|index| {
            let key = *keys.get(*index as usize).ok_or_else(|| out_of_bounds(Kernel::BitonicSort, *index as usize))?;
            Ok(RankedKey::new(key, *index as u32 >= params.count, reverse))
        })
        .collect::<Result<Vec<_>>>()?;

    let (dimension, block) = (params.dimension, params.block);
    for i in thread_indices(work_size).filter(|i| *i < padded_count) {
        let i = i as u32;
        let partner = i ^ block;
        if should_swap(i, partner, dimension, block, reverse, &ranked) {
            indices.swap(i as usize, partner as usize);
            ranked.swap(i as usize, partner as usize);
        }
    }
    Ok(())
}

fn overwrite_and_truncate(indices: &HostBuffer, values: &HostBuffer, destination: &HostBuffer, params: KernelParams, work_size: WorkSize) -> Result<()> {
    let indices = indices.read()?;
    let values = values.read()?;
    let mut destination = destination.write()?;
    let count = params.count as usize;
    let kernel = Kernel::OverwriteAndTruncate;

    for i in thread_indices(work_size).filter(|i| *i < count) {
        let index = *indices.get(i).ok_or_else(|| out_of_bounds(kernel, i))? as usize;
        let value = *values.get(index).ok_or_else(|| out_of_bounds(kernel, index))?;
        *destination.get_mut(i).ok_or_else(|| out_of_bounds(kernel, i))? = value;
    }
    Ok(())
}

impl ComputeBackend for HostEmulator {
    type Buffer = HostBuffer;

    fn element_count(&self, buffer: &HostBuffer) -> usize {
        buffer.len()
    }

    fn create_buffer(&mut self, label: &'static str, len: usize) -> Result<HostBuffer> {
        self.allocate(label, vec![0; len])
    }

    fn create_buffer_init(&mut self, label: &'static str, contents: &[i32]) -> Result<HostBuffer> {
        self.allocate(label, contents.to_vec())
    }

    fn release_buffer(&mut self, buffer: HostBuffer) {
        self.live_buffers = self.live_buffers.saturating_sub(1);
        drop(buffer);
    }

    fn dispatch(&mut self, dispatch: Dispatch<'_, HostBuffer>) -> Result<()> {
        let Dispatch { bindings, params, work_size } = dispatch;
        let kernel = bindings.kernel();
        trace!("{} {:?} over {:?}", kernel.entry_point(), params, work_size);

        if self.failing_dispatch == Some(self.dispatches.len()) {
            return Err(SortError::Backend(format!("{} failed on dispatch {}", kernel.entry_point(), self.dispatches.len())));
        }

        match bindings {
            Bindings::Extremum { reverse, source, padding_value } => extremum(source, padding_value, reverse, params, work_size)?,
            Bindings::Pad { source, padding_value, padded } => pad(source, padding_value, padded, params, work_size)?,
            Bindings::InitKeys { indices } => init_keys(indices, params, work_size)?,
            Bindings::BitonicSort { indices, keys } => bitonic_sort(indices, keys, params, work_size)?,
            Bindings::OverwriteAndTruncate { indices, values, destination } => {
                overwrite_and_truncate(indices, values, destination, params, work_size)?
            }
        }

        self.dispatches.push(DispatchRecord { kernel, params, work_size });
        Ok(())
    }

    fn submit(&mut self) -> Result<()> {
        self.submissions += 1;
        Ok(())
    }

    // dispatches already ran, nothing is pending
    fn discard(&mut self) {}
}

impl HostTransfer for HostEmulator {
    fn upload(&mut self, _label: &'static str, data: &[i32]) -> Result<HostBuffer> {
        Ok(HostBuffer::new(data.to_vec()))
    }

    fn download(&mut self, buffer: &HostBuffer) -> Result<Vec<i32>> {
        Ok(buffer.to_vec())
    }
}
