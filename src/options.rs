use bitonic_merge_sorting::{padded_count, MAX_PADDED_COUNT};

use crate::error::{Result, SortError};

/// Caller facing parameters of one sort.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct SortOptions {
    /// Sort in descending order.
    pub reverse: bool,
    /// Only sort the first `length` elements, leaving the rest of the buffer untouched.
    /// `None` sorts the whole buffer.
    pub length: Option<usize>,
}

impl SortOptions {
    pub fn ascending() -> Self {
        Self::default()
    }

    pub fn descending() -> Self {
        Self { reverse: true, ..Self::default() }
    }

    pub fn first(self, length: usize) -> Self {
        Self { length: Some(length), ..self }
    }

    pub fn effective_length(&self, buffer_count: usize) -> usize {
        match self.length {
            Some(length) => length.min(buffer_count),
            None => buffer_count,
        }
    }
}

/// Immutable description of a sort job, validated before anything touches the device.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct SortPlan {
    pub reverse: bool,
    /// Element count of the caller's value buffer.
    pub buffer_count: usize,
    /// Number of leading elements actually sorted.
    pub effective_length: u32,
    /// Size of every scratch buffer, always a power of two.
    pub padded_count: u32,
    /// Whether a separate key buffer drives the order.
    pub keyed: bool,
}

impl SortPlan {
    /// Returns `Ok(None)` when there is nothing to sort.
    pub fn new(buffer_count: usize, key_count: Option<usize>, options: SortOptions) -> Result<Option<Self>> {
        if buffer_count == 0 {
            return Err(SortError::EmptyBuffer);
        }

        let effective_length = options.effective_length(buffer_count);
        if effective_length == 0 {
            return Ok(None);
        }

        if let Some(keys) = key_count {
            if keys < effective_length {
                return Err(SortError::KeyBufferTooShort { keys, required: effective_length });
            }
        }

        let padded_count = padded_count(effective_length).ok_or(SortError::TooManyElements {
            count: effective_length,
            max: MAX_PADDED_COUNT as usize,
        })?;

        Ok(Some(Self {
            reverse: options.reverse,
            buffer_count,
            effective_length: effective_length as u32,
            padded_count,
            keyed: key_count.is_some(),
        }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn effective_length_clamps_to_buffer() {
        assert_eq!(SortOptions::ascending().effective_length(10), 10);
        assert_eq!(SortOptions::ascending().first(3).effective_length(10), 3);
        assert_eq!(SortOptions::ascending().first(30).effective_length(10), 10);
        assert_eq!(SortOptions::descending().first(0).effective_length(10), 0);
    }

    #[test]
    fn plan_is_sized_from_effective_length() {
        let plan = SortPlan::new(1 << 20, None, SortOptions::ascending().first(5)).unwrap().unwrap();
        assert_eq!(plan.effective_length, 5);
        assert_eq!(plan.padded_count, 8);
        assert!(!plan.keyed);

        let plan = SortPlan::new(16, Some(16), SortOptions::descending()).unwrap().unwrap();
        assert_eq!(plan.padded_count, 16);
        assert!(plan.keyed);
        assert!(plan.reverse);
    }

    #[test]
    fn empty_buffer_is_rejected() {
        assert!(matches!(SortPlan::new(0, None, SortOptions::default()), Err(SortError::EmptyBuffer)));
    }

    #[test]
    fn zero_length_is_a_no_op() {
        assert_eq!(SortPlan::new(8, None, SortOptions::ascending().first(0)).unwrap(), None);
    }

    #[test]
    fn short_key_buffer_is_rejected() {
        let result = SortPlan::new(10, Some(6), SortOptions::ascending());
        assert!(matches!(result, Err(SortError::KeyBufferTooShort { keys: 6, required: 10 })));

        // only the sorted prefix needs keys
        assert!(SortPlan::new(10, Some(6), SortOptions::ascending().first(6)).unwrap().is_some());
    }
}
