pub mod gpu;
pub mod host;

use bitonic_merge_sorting::{Step, WorkSize};

use crate::error::Result;

/// Entry points of the sorter shader.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum Kernel {
    SetMin,
    SetMax,
    PadBuffer,
    InitKeys,
    BitonicSort,
    OverwriteAndTruncate,
}

impl Kernel {
    pub const ALL: [Kernel; 6] = [
        Kernel::SetMin,
        Kernel::SetMax,
        Kernel::PadBuffer,
        Kernel::InitKeys,
        Kernel::BitonicSort,
        Kernel::OverwriteAndTruncate,
    ];

    pub fn index(self) -> usize {
        self as usize
    }

    /// Reduction giving the padding value: the minimum for a descending sort, the maximum otherwise.
    pub fn extremum(reverse: bool) -> Self {
        if reverse {
            Kernel::SetMin
        } else {
            Kernel::SetMax
        }
    }

    pub fn entry_point(self) -> &'static str {
        match self {
            Kernel::SetMin => "set_min",
            Kernel::SetMax => "set_max",
            Kernel::PadBuffer => "pad_buffer",
            Kernel::InitKeys => "init_keys",
            Kernel::BitonicSort => "bitonic_sort",
            Kernel::OverwriteAndTruncate => "overwrite_and_truncate",
        }
    }

    /// Storage slots the entry point reads or writes, in binding order.
    pub fn slots(self) -> &'static [Slot] {
        match self {
            Kernel::SetMin | Kernel::SetMax => &[Slot::Source, Slot::PaddingValue],
            Kernel::PadBuffer => &[Slot::Source, Slot::PaddingValue, Slot::Padded],
            Kernel::InitKeys => &[Slot::Indices],
            Kernel::BitonicSort => &[Slot::Indices, Slot::Keys],
            Kernel::OverwriteAndTruncate => &[Slot::Indices, Slot::Values, Slot::Destination],
        }
    }

    /// Stage of the sort the kernel belongs to, used for profiling scopes and logs.
    pub fn stage(self) -> &'static str {
        match self {
            Kernel::SetMin | Kernel::SetMax => "Extremum",
            Kernel::PadBuffer => "Padding",
            Kernel::InitKeys => "Key Init",
            Kernel::BitonicSort => "Bitonic Network",
            Kernel::OverwriteAndTruncate => "Overwrite And Truncate",
        }
    }
}

/// Storage binding of the sorter shader, bound in group 1.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum Slot {
    Source,
    PaddingValue,
    Padded,
    Indices,
    Keys,
    Values,
    Destination,
}

impl Slot {
    pub fn binding(self) -> u32 {
        match self {
            Slot::Source => 0,
            Slot::PaddingValue => 1,
            Slot::Padded => 2,
            Slot::Indices => 3,
            Slot::Keys => 4,
            Slot::Values => 5,
            Slot::Destination => 6,
        }
    }

    pub fn read_only(self) -> bool {
        matches!(self, Slot::Source | Slot::Keys | Slot::Values)
    }
}

/// Buffers bound for one dispatch. The variant decides the kernel.
#[derive(Debug)]
pub enum Bindings<'a, B> {
    Extremum { reverse: bool, source: &'a B, padding_value: &'a B },
    Pad { source: &'a B, padding_value: &'a B, padded: &'a B },
    InitKeys { indices: &'a B },
    BitonicSort { indices: &'a B, keys: &'a B },
    OverwriteAndTruncate { indices: &'a B, values: &'a B, destination: &'a B },
}

impl<'a, B> Bindings<'a, B> {
    pub fn kernel(&self) -> Kernel {
        match self {
            Bindings::Extremum { reverse, .. } => Kernel::extremum(*reverse),
            Bindings::Pad { .. } => Kernel::PadBuffer,
            Bindings::InitKeys { .. } => Kernel::InitKeys,
            Bindings::BitonicSort { .. } => Kernel::BitonicSort,
            Bindings::OverwriteAndTruncate { .. } => Kernel::OverwriteAndTruncate,
        }
    }

    /// Bound buffers, in the order of `Kernel::slots`.
    pub fn resources(&self) -> Vec<(Slot, &'a B)> {
        match *self {
            Bindings::Extremum { source, padding_value, .. } => vec![(Slot::Source, source), (Slot::PaddingValue, padding_value)],
            Bindings::Pad { source, padding_value, padded } => {
                vec![(Slot::Source, source), (Slot::PaddingValue, padding_value), (Slot::Padded, padded)]
            }
            Bindings::InitKeys { indices } => vec![(Slot::Indices, indices)],
            Bindings::BitonicSort { indices, keys } => vec![(Slot::Indices, indices), (Slot::Keys, keys)],
            Bindings::OverwriteAndTruncate { indices, values, destination } => {
                vec![(Slot::Indices, indices), (Slot::Values, values), (Slot::Destination, destination)]
            }
        }
    }
}

/// Scalar parameters of a dispatch, laid out like the shader's `Params` uniform.
#[repr(C)]
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, bytemuck::Pod, bytemuck::Zeroable)]
pub struct KernelParams {
    pub count: u32,
    pub padded_count: u32,
    pub dimension: u32,
    pub block: u32,
    pub reverse: u32,
    _padding: [u32; 3],
}

impl KernelParams {
    pub fn new(count: u32, padded_count: u32) -> Self {
        Self { count, padded_count, ..Self::default() }
    }

    pub fn with_step(self, step: Step, reverse: bool) -> Self {
        Self {
            dimension: step.dimension,
            block: step.block,
            reverse: reverse as u32,
            ..self
        }
    }

    pub fn is_reverse(&self) -> bool {
        self.reverse != 0
    }
}

#[derive(Debug)]
pub struct Dispatch<'a, B> {
    pub bindings: Bindings<'a, B>,
    pub params: KernelParams,
    pub work_size: WorkSize,
}

/// Device side of the sorter: buffer lifetime and in-order kernel dispatch.
///
/// Buffers hold 32-bit elements. Dispatches recorded before a `submit` execute in recording
/// order and each one observes the writes of the previous ones.
pub trait ComputeBackend {
    type Buffer;

    fn element_count(&self, buffer: &Self::Buffer) -> usize;

    fn create_buffer(&mut self, label: &'static str, len: usize) -> Result<Self::Buffer>;

    fn create_buffer_init(&mut self, label: &'static str, contents: &[i32]) -> Result<Self::Buffer>;

    fn release_buffer(&mut self, buffer: Self::Buffer);

    fn dispatch(&mut self, dispatch: Dispatch<'_, Self::Buffer>) -> Result<()>;

    fn submit(&mut self) -> Result<()>;

    /// Forget dispatches recorded since the last submit.
    fn discard(&mut self);
}

/// Moving data between host memory and caller owned device buffers.
/// Not used by the sorter itself.
pub trait HostTransfer: ComputeBackend {
    fn upload(&mut self, label: &'static str, data: &[i32]) -> Result<Self::Buffer>;

    fn download(&mut self, buffer: &Self::Buffer) -> Result<Vec<i32>>;
}
