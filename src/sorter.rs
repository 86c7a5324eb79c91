use bitonic_merge_sorting::{dispatch_count, Schedule, WorkSize};
use log::debug;

use crate::{
    backend::{Bindings, ComputeBackend, Dispatch, KernelParams},
    error::Result,
    options::{SortOptions, SortPlan},
};

/// Sorts device buffers of `i32` in place with a bitonic merge network.
///
/// The sorter keeps nothing between calls but the backend: scratch buffers belong to the
/// job of a single call and are released when it ends, on success or failure.
pub struct Sorter<B: ComputeBackend> {
    backend: B,
}

impl<B: ComputeBackend> Sorter<B> {
    pub fn new(backend: B) -> Self {
        Self { backend }
    }

    pub fn backend(&self) -> &B {
        &self.backend
    }

    pub fn backend_mut(&mut self) -> &mut B {
        &mut self.backend
    }

    /// Sort `values` by their own contents.
    pub fn sort(&mut self, values: &B::Buffer, options: SortOptions) -> Result<()> {
        let buffer_count = self.backend.element_count(values);
        match SortPlan::new(buffer_count, None, options)? {
            Some(plan) => SortJob::new(&mut self.backend, plan).run(values, None),
            None => {
                debug!("Nothing to sort in {buffer_count} elements with {options:?}");
                Ok(())
            }
        }
    }

    /// Sort `values` by the parallel contents of `keys`. The caller's `keys` are left untouched.
    pub fn sort_by_keys(&mut self, values: &B::Buffer, keys: &B::Buffer, options: SortOptions) -> Result<()> {
        let buffer_count = self.backend.element_count(values);
        let key_count = self.backend.element_count(keys);
        match SortPlan::new(buffer_count, Some(key_count), options)? {
            Some(plan) => SortJob::new(&mut self.backend, plan).run(values, Some(keys)),
            None => {
                debug!("Nothing to sort in {buffer_count} elements with {options:?}");
                Ok(())
            }
        }
    }
}

/// Index of a scratch buffer owned by a job.
#[derive(Clone, Copy, Debug)]
struct ScratchId(usize);

struct StreamLabels {
    padded: &'static str,
    padding_value: &'static str,
}

const VALUE_LABELS: StreamLabels = StreamLabels { padded: "Padded values", padding_value: "Values padding value" };
const KEY_LABELS: StreamLabels = StreamLabels { padded: "Padded keys", padding_value: "Keys padding value" };

/// One sort call: its plan and the scratch buffers it allocated.
struct SortJob<'b, B: ComputeBackend> {
    backend: &'b mut B,
    plan: SortPlan,
    scratch: Vec<B::Buffer>,
    submitted: bool,
}

impl<'b, B: ComputeBackend> SortJob<'b, B> {
    fn new(backend: &'b mut B, plan: SortPlan) -> Self {
        Self {
            backend,
            plan,
            scratch: Vec::new(),
            submitted: false,
        }
    }

    fn run(mut self, values: &B::Buffer, keys: Option<&B::Buffer>) -> Result<()> {
        let SortPlan { effective_length, padded_count, reverse, buffer_count, keyed } = self.plan;
        debug!(
            "Sorting {effective_length} of {buffer_count} elements (padded to {padded_count}, {} network dispatches, reverse: {reverse}, keyed: {keyed})",
            dispatch_count(padded_count),
        );

        let padded_values = self.pad(values, &VALUE_LABELS)?;
        let padded_keys = match keys {
            Some(keys) => self.pad(keys, &KEY_LABELS)?,
            None => padded_values,
        };
        let indices = self.init_keys()?;
        self.run_network(indices, padded_keys)?;
        self.overwrite_and_truncate(values, indices, padded_values)?;

        self.backend.submit()?;
        self.submitted = true;
        Ok(())
    }

    fn allocate(&mut self, label: &'static str, len: usize) -> Result<ScratchId> {
        let buffer = self.backend.create_buffer(label, len)?;
        self.scratch.push(buffer);
        Ok(ScratchId(self.scratch.len() - 1))
    }

    fn allocate_init(&mut self, label: &'static str, contents: &[i32]) -> Result<ScratchId> {
        let buffer = self.backend.create_buffer_init(label, contents)?;
        self.scratch.push(buffer);
        Ok(ScratchId(self.scratch.len() - 1))
    }

    /// Extremum then padding: copy the sorted region of `source` into a power of two buffer,
    /// filling the tail with the largest value (smallest when reversed).
    fn pad(&mut self, source: &B::Buffer, labels: &StreamLabels) -> Result<ScratchId> {
        let SortPlan { effective_length, padded_count, reverse, .. } = self.plan;

        // identity of the reduction, replaced by the first element seen
        let identity = if reverse { i32::MAX } else { i32::MIN };
        let padding_value = self.allocate_init(labels.padding_value, &[identity])?;
        let padded = self.allocate(labels.padded, padded_count as usize)?;

        let params = KernelParams::new(effective_length, padded_count);

        self.backend.dispatch(Dispatch {
            bindings: Bindings::Extremum { reverse, source, padding_value: &self.scratch[padding_value.0] },
            params,
            work_size: WorkSize::for_count(effective_length),
        })?;

        self.backend.dispatch(Dispatch {
            bindings: Bindings::Pad {
                source,
                padding_value: &self.scratch[padding_value.0],
                padded: &self.scratch[padded.0],
            },
            params,
            work_size: WorkSize::for_count(padded_count),
        })?;

        Ok(padded)
    }

    /// Index buffer travelling through the network in place of the values.
    fn init_keys(&mut self) -> Result<ScratchId> {
        let SortPlan { effective_length, padded_count, .. } = self.plan;
        let indices = self.allocate("Indices", padded_count as usize)?;

        self.backend.dispatch(Dispatch {
            bindings: Bindings::InitKeys { indices: &self.scratch[indices.0] },
            params: KernelParams::new(effective_length, padded_count),
            work_size: WorkSize::for_count(padded_count),
        })?;

        Ok(indices)
    }

    fn run_network(&mut self, indices: ScratchId, keys: ScratchId) -> Result<()> {
        let SortPlan { effective_length, padded_count, reverse, .. } = self.plan;
        let params = KernelParams::new(effective_length, padded_count);
        let work_size = WorkSize::for_count(padded_count);

        for step in Schedule::new(padded_count) {
            self.backend.dispatch(Dispatch {
                bindings: Bindings::BitonicSort { indices: &self.scratch[indices.0], keys: &self.scratch[keys.0] },
                params: params.with_step(step, reverse),
                work_size,
            })?;
        }
        Ok(())
    }

    /// Gather the sorted values back into the caller buffer, only over the sorted region.
    fn overwrite_and_truncate(&mut self, destination: &B::Buffer, indices: ScratchId, values: ScratchId) -> Result<()> {
        let SortPlan { effective_length, padded_count, .. } = self.plan;

        self.backend.dispatch(Dispatch {
            bindings: Bindings::OverwriteAndTruncate {
                indices: &self.scratch[indices.0],
                values: &self.scratch[values.0],
                destination,
            },
            params: KernelParams::new(effective_length, padded_count),
            work_size: WorkSize::for_count(effective_length),
        })
    }
}

impl<B: ComputeBackend> Drop for SortJob<'_, B> {
    fn drop(&mut self) {
        if !self.submitted {
            self.backend.discard();
        }
        for buffer in self.scratch.drain(..) {
            self.backend.release_buffer(buffer);
        }
    }
}

#[cfg(test)]
mod tests {
    use rand::{rngs::StdRng, Rng, SeedableRng};

    use super::*;
    use crate::{
        backend::{
            host::{HostBuffer, HostEmulator},
            Kernel,
        },
        error::SortError,
    };

    fn sorter() -> Sorter<HostEmulator> {
        Sorter::new(HostEmulator::new())
    }

    fn sorted(data: &[i32], options: SortOptions) -> Vec<i32> {
        let values = HostBuffer::new(data.to_vec());
        sorter().sort(&values, options).unwrap();
        values.to_vec()
    }

    /// What the sort should produce: the sorted prefix followed by the untouched tail.
    fn expected(data: &[i32], options: SortOptions) -> Vec<i32> {
        let length = options.effective_length(data.len());
        let mut head = data[..length].to_vec();
        head.sort_unstable();
        if options.reverse {
            head.reverse();
        }
        head.extend_from_slice(&data[length..]);
        head
    }

    fn random_data(rng: &mut StdRng, count: usize, negatives: bool, range: i32) -> Vec<i32> {
        (0..count).map(|_| rng.gen_range(if negatives { -range } else { 0 }..range)).collect()
    }

    #[test]
    fn sorts_example_ascending() {
        assert_eq!(sorted(&[5, -3, 5, 0, 9], SortOptions::ascending()), vec![-3, 0, 5, 5, 9]);
    }

    #[test]
    fn sorts_example_descending() {
        assert_eq!(sorted(&[5, -3, 5, 0, 9], SortOptions::descending()), vec![9, 5, 5, 0, -3]);
    }

    #[test]
    fn sorts_example_first_three() {
        assert_eq!(sorted(&[5, -3, 5, 0, 9], SortOptions::ascending().first(3)), vec![-3, 5, 5, 0, 9]);
    }

    #[test]
    fn sorts_first_three_descending() {
        assert_eq!(sorted(&[5, -3, 5, 0, 9], SortOptions::descending().first(3)), vec![5, 5, -3, 0, 9]);
    }

    #[test]
    fn extreme_values_survive_padding() {
        let data = [i32::MAX, 0, i32::MIN, i32::MAX, -1, i32::MIN];
        for options in [SortOptions::ascending(), SortOptions::descending()] {
            assert_eq!(sorted(&data, options), expected(&data, options));
        }
    }

    #[test]
    fn randomized_matrix_matches_reference() {
        let mut rng = StdRng::seed_from_u64(7);
        let mut sorter = sorter();

        for count in 1..70usize {
            for power_of_two in [false, true] {
                let count = if power_of_two { count.next_power_of_two() } else { count };
                for reverse in [false, true] {
                    for negatives in [false, true] {
                        for length in [None, Some(20)] {
                            let options = SortOptions { reverse, length };
                            let data = random_data(&mut rng, count, negatives, 100);
                            let values = HostBuffer::new(data.clone());
                            sorter.sort(&values, options).unwrap();
                            assert_eq!(values.to_vec(), expected(&data, options), "count {count}, {options:?}");
                        }
                    }
                }
            }
        }
    }

    #[test]
    fn duplicate_heavy_data() {
        let mut rng = StdRng::seed_from_u64(11);
        let data = random_data(&mut rng, 1000, true, 3);
        for options in [SortOptions::ascending(), SortOptions::descending(), SortOptions::ascending().first(513)] {
            assert_eq!(sorted(&data, options), expected(&data, options));
        }
    }

    #[test]
    fn sorting_is_idempotent() {
        let mut rng = StdRng::seed_from_u64(3);
        for count in [1, 7, 16, 33, 100] {
            let data = random_data(&mut rng, count, true, 50);
            let once = sorted(&data, SortOptions::ascending());
            assert_eq!(sorted(&once, SortOptions::ascending()), once);
        }
    }

    #[test]
    fn reverse_is_symmetric_for_distinct_values() {
        let data: Vec<i32> = vec![12, -4, 99, 0, 7, -31, 55, 3, 18, -2, 41];
        let mut ascending = sorted(&data, SortOptions::ascending());
        ascending.reverse();
        assert_eq!(ascending, sorted(&data, SortOptions::descending()));
    }

    #[test]
    fn zero_length_leaves_buffer_alone() {
        let mut sorter = sorter();
        let values = HostBuffer::new(vec![3, 2, 1]);
        sorter.sort(&values, SortOptions::ascending().first(0)).unwrap();
        assert_eq!(values.to_vec(), vec![3, 2, 1]);
        assert!(sorter.backend().dispatches().is_empty());
        assert!(sorter.backend().allocations().is_empty());
    }

    #[test]
    fn length_past_the_end_sorts_everything() {
        let data = [4, 8, 1, 9, 0, 3];
        assert_eq!(sorted(&data, SortOptions::ascending().first(600)), sorted(&data, SortOptions::ascending()));
    }

    #[test]
    fn empty_buffer_is_rejected_before_any_dispatch() {
        let mut sorter = sorter();
        let values = HostBuffer::new(Vec::new());
        assert!(matches!(sorter.sort(&values, SortOptions::ascending()), Err(SortError::EmptyBuffer)));
        assert!(sorter.backend().dispatches().is_empty());
    }

    #[test]
    fn dispatch_sequence_of_a_sort() {
        let mut sorter = sorter();
        let values = HostBuffer::new(vec![9, 3, 7, 1, 5]);
        sorter.sort(&values, SortOptions::descending()).unwrap();

        let kernels: Vec<Kernel> = sorter.backend().dispatches().iter().map(|d| d.kernel).collect();
        let mut expected = vec![Kernel::SetMin, Kernel::PadBuffer, Kernel::InitKeys];
        expected.extend(std::iter::repeat(Kernel::BitonicSort).take(dispatch_count(8) as usize));
        expected.push(Kernel::OverwriteAndTruncate);
        assert_eq!(kernels, expected);
        assert_eq!(sorter.backend().submissions(), 1);

        let steps: Vec<(u32, u32)> = sorter
            .backend()
            .dispatches()
            .iter()
            .filter(|d| d.kernel == Kernel::BitonicSort)
            .map(|d| (d.params.dimension, d.params.block))
            .collect();
        assert_eq!(steps, vec![(2, 1), (4, 2), (4, 1), (8, 4), (8, 2), (8, 1)]);

        let overwrite = sorter.backend().dispatches().last().unwrap();
        assert_eq!(overwrite.params.count, 5);
        assert_eq!(overwrite.work_size, WorkSize::for_count(5));
    }

    #[test]
    fn ascending_pads_with_maximum() {
        let mut sorter = sorter();
        let values = HostBuffer::new(vec![1, 2, 3]);
        sorter.sort(&values, SortOptions::ascending()).unwrap();
        assert_eq!(sorter.backend().dispatches()[0].kernel, Kernel::SetMax);
    }

    #[test]
    fn scratch_is_sized_from_the_sorted_prefix() {
        let mut sorter = sorter();
        let values = HostBuffer::new(vec![0; 5000]);
        sorter.sort(&values, SortOptions::ascending().first(5)).unwrap();

        // padding value, padded values, indices
        assert_eq!(sorter.backend().allocations(), &[1, 8, 8]);
        assert!(sorter.backend().dispatches().iter().all(|d| d.params.padded_count == 8));
    }

    #[test]
    fn scratch_is_released_after_each_call() {
        let mut sorter = sorter();
        let values = HostBuffer::new(vec![4, 2, 7]);
        let keys = HostBuffer::new(vec![1, 3, 2]);
        sorter.sort(&values, SortOptions::ascending()).unwrap();
        assert_eq!(sorter.backend().live_buffers(), 0);
        sorter.sort_by_keys(&values, &keys, SortOptions::ascending()).unwrap();
        assert_eq!(sorter.backend().live_buffers(), 0);
    }

    #[test]
    fn failed_allocation_releases_what_was_allocated() {
        let mut sorter = Sorter::new(HostEmulator::with_buffer_limit(4));
        let values = HostBuffer::new(vec![5, 4, 3, 2, 1]);

        let result = sorter.sort(&values, SortOptions::ascending());
        assert!(matches!(result, Err(SortError::Allocation { label: "Padded values", .. })));
        assert_eq!(sorter.backend().live_buffers(), 0);
        assert_eq!(sorter.backend().submissions(), 0);
        assert_eq!(values.to_vec(), vec![5, 4, 3, 2, 1]);
    }

    #[test]
    fn failed_dispatch_mid_job_returns_error_and_releases_scratch() {
        // extremum, padding, key init, then the first network steps
        for failing in [0, 2, 4] {
            let mut sorter = Sorter::new(HostEmulator::with_failing_dispatch(failing));
            let values = HostBuffer::new(vec![5, 4, 3, 2, 1]);

            let result = sorter.sort(&values, SortOptions::ascending());
            assert!(matches!(result, Err(SortError::Backend(_))), "dispatch {failing}: {result:?}");
            assert_eq!(sorter.backend().dispatches().len(), failing);
            assert_eq!(sorter.backend().submissions(), 0);
            assert_eq!(sorter.backend().live_buffers(), 0);
            assert_eq!(values.to_vec(), vec![5, 4, 3, 2, 1]);
        }
    }

    #[test]
    fn keyed_sort_orders_values_by_keys() {
        let mut sorter = sorter();
        let values = HostBuffer::new(vec![10, 20, 30, 40, 50]);
        let keys = HostBuffer::new(vec![3, -1, 4, 0, 2]);

        sorter.sort_by_keys(&values, &keys, SortOptions::ascending()).unwrap();
        assert_eq!(values.to_vec(), vec![20, 40, 50, 10, 30]);
        assert_eq!(keys.to_vec(), vec![3, -1, 4, 0, 2], "caller keys must not be written");

        sorter.sort_by_keys(&values, &keys, SortOptions::descending()).unwrap();
        // values were permuted by the previous call, keys were not
        assert_eq!(values.to_vec(), vec![50, 20, 30, 10, 40]);
    }

    #[test]
    fn keyed_sort_keeps_values_whose_key_equals_the_padding() {
        let mut sorter = sorter();
        // the largest key appears in real data: padding must still be the one truncated
        let values = HostBuffer::new(vec![1, 2, 3, 4, 5]);
        let keys = HostBuffer::new(vec![7, 7, 0, 7, 7]);
        sorter.sort_by_keys(&values, &keys, SortOptions::ascending()).unwrap();

        let result = values.to_vec();
        assert_eq!(result[0], 3);
        let mut rest = result[1..].to_vec();
        rest.sort_unstable();
        assert_eq!(rest, vec![1, 2, 4, 5]);
    }

    #[test]
    fn keyed_sort_matches_reference_pairs() {
        let mut rng = StdRng::seed_from_u64(21);
        let mut sorter = sorter();

        for count in [10usize, 16] {
            for negatives in [false, true] {
                for reverse in [false, true] {
                    for length in [None, Some(6), Some(40)] {
                        let options = SortOptions { reverse, length };
                        // distinct keys so the order is fully determined
                        let mut keys: Vec<i32> = (0..count as i32).map(|k| if negatives { k * 7 - 50 } else { k * 7 }).collect();
                        for i in (1..keys.len()).rev() {
                            keys.swap(i, rng.gen_range(0..=i));
                        }
                        let data = random_data(&mut rng, count, negatives, 1000);

                        let values = HostBuffer::new(data.clone());
                        let key_buffer = HostBuffer::new(keys.clone());
                        sorter.sort_by_keys(&values, &key_buffer, options).unwrap();

                        let length = options.effective_length(count);
                        let mut pairs: Vec<(i32, i32)> = keys[..length].iter().copied().zip(data[..length].iter().copied()).collect();
                        pairs.sort_unstable_by_key(|(k, _)| *k);
                        if reverse {
                            pairs.reverse();
                        }
                        let mut reference: Vec<i32> = pairs.into_iter().map(|(_, v)| v).collect();
                        reference.extend_from_slice(&data[length..]);

                        assert_eq!(values.to_vec(), reference, "count {count}, {options:?}");
                        assert_eq!(key_buffer.to_vec(), keys);
                    }
                }
            }
        }
    }

    #[test]
    fn keyed_sort_rejects_short_keys() {
        let mut sorter = sorter();
        let values = HostBuffer::new(vec![1, 2, 3, 4]);
        let keys = HostBuffer::new(vec![1, 2]);
        let result = sorter.sort_by_keys(&values, &keys, SortOptions::ascending());
        assert!(matches!(result, Err(SortError::KeyBufferTooShort { keys: 2, required: 4 })));
        assert!(sorter.backend().dispatches().is_empty());

        sorter.sort_by_keys(&values, &keys, SortOptions::descending().first(2)).unwrap();
        assert_eq!(values.to_vec(), vec![2, 1, 3, 4]);
    }
}
