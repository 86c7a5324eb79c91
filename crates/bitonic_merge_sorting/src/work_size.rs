/// Threads per workgroup, must match `@workgroup_size` in the sorter shader.
pub const GROUP_SIZE: u32 = 256;
/// Maximum number of workgroups dispatched along one dimension.
pub const MAX_DIM_GROUPS: u32 = 1024;
pub const MAX_DIM_THREADS: u32 = GROUP_SIZE * MAX_DIM_GROUPS;

/// Number of workgroups to dispatch on each axis.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct WorkSize {
    pub x: u32,
    pub y: u32,
    pub z: u32,
}

impl WorkSize {
    /// Grid covering `count` elements, spilling into `y` once `x` is saturated.
    pub fn for_count(count: u32) -> Self {
        if count <= MAX_DIM_THREADS {
            Self { x: count.div_ceil(GROUP_SIZE), y: 1, z: 1 }
        } else {
            Self { x: MAX_DIM_GROUPS, y: count.div_ceil(MAX_DIM_THREADS), z: 1 }
        }
    }

    pub fn group_count(&self) -> u32 {
        self.x * self.y * self.z
    }

    pub fn thread_count(&self) -> u64 {
        self.group_count() as u64 * GROUP_SIZE as u64
    }

    /// Flattened element index of a global invocation id, computed the same way as the shader.
    pub fn global_index(&self, invocation: [u32; 3]) -> u64 {
        let row_width = self.x as u64 * GROUP_SIZE as u64;
        (invocation[2] as u64 * self.y as u64 + invocation[1] as u64) * row_width + invocation[0] as u64
    }

    /// Every global invocation id of the grid, in dispatch order.
    pub fn invocations(&self) -> impl Iterator<Item = [u32; 3]> {
        let Self { x, y, z } = *self;
        (0..z).flat_map(move |gz| (0..y).flat_map(move |gy| (0..x * GROUP_SIZE).map(move |gx| [gx, gy, gz])))
    }
}
