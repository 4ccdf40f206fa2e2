//! Deterministic voxel terrain generation by recursive fractal refinement.
//!
//! Re-exports modules for use by binaries and concrete generators.

pub mod buffer;
pub mod export;
pub mod fragment;
pub mod heightfield;
pub mod mapgen;
pub mod pass;
pub mod passes;
