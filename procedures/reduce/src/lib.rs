pub mod reduce_buffer;

pub use reduce_buffer::{reduce_layer_counts, ReduceBuffer, ReduceBufferParams, ReduceShape};
