pub mod binding_builder;
pub mod buffers;
pub mod uniform_buffer;
