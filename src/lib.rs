//! Roger Output Library
//!
//! Realtime PCM output pipeline: decoder thread → ring buffer → device thread,
//! with prebuffering, clock accounting, format conversion and resampling.

pub mod audio;
pub mod decode;
pub mod engine;
pub mod resample;
pub mod sink;
