//! Frame synchronization state

pub mod sync;

pub use sync::{Fence, FrameSync, Semaphore};
