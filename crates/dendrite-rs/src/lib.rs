pub mod backend;
pub mod buffer;
pub mod config;
pub mod hlir;
pub mod indexing;
pub mod llir;
pub mod lower;
pub mod ops;
pub mod optimize;
pub mod precision;
pub mod scheduler;
pub mod shape;
pub mod tensor;
pub mod train;

pub use backend::{
    backend_from_config, lookup_backend, register_backend, Backend, Context, Device, Routine,
    Work,
};
pub use precision::Precision;
pub use tensor::{MemoryMode, Tensor};
