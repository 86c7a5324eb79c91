use std::marker::PhantomData;

use wgpu::util::DeviceExt;

use super::binding_builder::{BindGroupBuilder, BindGroupLayoutBuilder, BindGroupLayoutWithDesc};

/// Array of uniform blocks selected per draw or dispatch through a dynamic offset.
pub struct DynamicUniformBuffer<T> {
    bind_group: wgpu::BindGroup,
    stride: u32,
    len: usize,
    _content: PhantomData<T>,
}

impl<T: bytemuck::Pod> DynamicUniformBuffer<T> {
    fn content_size() -> u64 {
        std::mem::size_of::<T>() as u64
    }

    /// Layout with a single dynamic offset uniform binding holding one `T`.
    pub fn create_layout(device: &wgpu::Device, visibility: wgpu::ShaderStages, label: Option<&str>) -> BindGroupLayoutWithDesc {
        BindGroupLayoutBuilder::new()
            .add_binding(
                0,
                visibility,
                wgpu::BindingType::Buffer {
                    ty: wgpu::BufferBindingType::Uniform,
                    has_dynamic_offset: true,
                    min_binding_size: wgpu::BufferSize::new(Self::content_size()),
                },
            )
            .create(device, label)
    }

    pub fn new(device: &wgpu::Device, layout: &BindGroupLayoutWithDesc, contents: &[T], label: Option<&str>) -> Self {
        let alignment = device.limits().min_uniform_buffer_offset_alignment as u64;
        let stride = Self::content_size().div_ceil(alignment) * alignment;

        // at least one block so the binding is never empty
        let mut bytes = vec![0u8; stride as usize * contents.len().max(1)];
        for (i, content) in contents.iter().enumerate() {
            let start = i * stride as usize;
            bytes[start..start + Self::content_size() as usize].copy_from_slice(bytemuck::bytes_of(content));
        }

        let buffer = device.create_buffer_init(&wgpu::util::BufferInitDescriptor {
            label,
            contents: &bytes,
            usage: wgpu::BufferUsages::UNIFORM,
        });

        let bind_group = BindGroupBuilder::new(layout)
            .resource(wgpu::BindingResource::Buffer(wgpu::BufferBinding {
                buffer: &buffer,
                offset: 0,
                size: wgpu::BufferSize::new(Self::content_size()),
            }))
            .create(device, label);

        Self {
            bind_group,
            stride: stride as u32,
            len: contents.len(),
            _content: PhantomData,
        }
    }

    pub fn offset(&self, index: usize) -> u32 {
        assert!(index < self.len, "uniform block {index} out of {}", self.len);
        index as u32 * self.stride
    }

    pub fn bind_group(&self) -> &wgpu::BindGroup {
        &self.bind_group
    }
}
