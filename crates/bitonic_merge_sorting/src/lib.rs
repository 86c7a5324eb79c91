// Host side description of the bitonic merge sort network dispatched by the GPU sorter.

// Inspired from implementation well described in this article https://poniesandlight.co.uk/reflect/bitonic_merge_sort/

mod work_size;

pub use work_size::*;

/// Largest padded count the 32-bit kernels can address.
pub const MAX_PADDED_COUNT: u32 = 1 << 31;

/// Smallest power of two >= `count`.
/// `None` if `count` is zero or would not fit the kernels index space.
pub fn padded_count(count: usize) -> Option<u32> {
	if count == 0 || count > MAX_PADDED_COUNT as usize {
		return None;
	}
	Some((count as u32).next_power_of_two())
}

/// Number of compare-and-swap dispatches needed for a padded count.
pub fn dispatch_count(padded_count: u32) -> u32 {
	let stages = padded_count.trailing_zeros();
	stages * (stages + 1) / 2
}

/// One compare-and-swap round of the network.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Step {
	/// Size of the bitonic sequences being merged.
	pub dimension: u32,
	/// Compare distance inside the sequence.
	pub block: u32,
}

/// Iterates the `(dimension, block)` rounds in dispatch order:
/// dimension from 2 up to the padded count, block from dimension / 2 down to 1.
#[derive(Clone, Debug)]
pub struct Schedule {
	padded_count: u64,
	dimension: u64,
	block: u64,
}

impl Schedule {
	pub fn new(padded_count: u32) -> Self {
		assert!(padded_count.is_power_of_two(), "bitonic network needs a power of two count, got {padded_count}");
		Self { padded_count: padded_count as u64, dimension: 2, block: 1 }
	}
}

impl Iterator for Schedule {
	type Item = Step;

	fn next(&mut self) -> Option<Step> {
		if self.dimension > self.padded_count {
			return None;
		}

		let step = Step { dimension: self.dimension as u32, block: self.block as u32 };

		if self.block > 1 {
			self.block >>= 1;
		} else {
			self.dimension <<= 1;
			self.block = self.dimension >> 1;
		}

		Some(step)
	}
}

/// Comparison key of one slot: the sort key, then a rank pushing padding behind real data.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord)]
pub struct RankedKey {
	pub key: i32,
	pub rank: u32,
}

impl RankedKey {
	/// Padding ranks above real elements when sorting ascending and below them when sorting
	/// descending, so it always ends at the tail with equal keys.
	pub fn new(key: i32, is_padding: bool, reverse: bool) -> Self {
		Self { key, rank: (is_padding != reverse) as u32 }
	}
}

/// Partner of element `i` for a given compare distance.
pub fn partner(i: u32, block: u32) -> u32 {
	i ^ block
}

/// Per-thread decision of the compare-and-swap kernel.
///
/// Only the lower element of a pair acts. The pair direction is ascending when bit
/// `log2(dimension)` of `i` is clear, flipped by `reverse`.
pub fn should_swap(i: u32, partner: u32, dimension: u32, block: u32, reverse: bool, keys: &[RankedKey]) -> bool {
	if i & block != 0 {
		return false;
	}
	debug_assert_eq!(partner, i ^ block);

	let ascending = (i & dimension == 0) != reverse;
	let (current, other) = (keys[i as usize], keys[partner as usize]);

	if ascending { current > other } else { current < other }
}

/// Runs the whole network sequentially, permuting `values` alongside `keys`.
pub fn apply_network<T>(keys: &mut [RankedKey], values: &mut [T], reverse: bool) {
	let n = keys.len() as u32;
	assert_eq!(keys.len(), values.len());

	for Step { dimension, block } in Schedule::new(n) {
		// this loop normally would be a dispatch
		for i in 0..n {
			let p = partner(i, block);
			if should_swap(i, p, dimension, block, reverse, keys) {
				keys.swap(i as usize, p as usize);
				values.swap(i as usize, p as usize);
			}
		}
	}
}
