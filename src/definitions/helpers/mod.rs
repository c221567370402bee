pub mod byte_handle;

pub use byte_handle::ByteHandle;
