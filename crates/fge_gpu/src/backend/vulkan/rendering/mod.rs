//! Command recording

pub mod command_buffer;
