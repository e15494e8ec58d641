//! GPU resources and their deferred destruction

/// Frame-indexed deferred destruction
pub mod garbage;

/// Growable descriptor pools and the sets allocated from them
pub mod descriptor_pool;

/// Growable typed buffers
pub mod buffer;

/// Sampled 2D textures
pub mod image;

/// Per-frame transform storage
pub mod global_transform;

/// Descriptor set and pipeline layouts derived from shader reflection
pub mod layout_cache;
