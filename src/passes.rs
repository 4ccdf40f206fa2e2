//! Illustrative refinement passes.
//!
//! The core contract treats concrete passes as pluggable; these two exist
//! for the reference heightfield generator and the test suite. Both refine
//! a single `f32` field by blending each parent cell with its −X / +X
//! neighbor into the two child cells (¼ neighbor, ¾ own value), the
//! noise variant adding level-scaled Perlin detail on top.

use noise::{NoiseFn, Perlin};

use crate::buffer::BufferKind;
use crate::pass::{PassIo, PortSpec, RecursionPass};

fn refine_ports() -> Vec<PortSpec> {
    vec![
        // One cell is scanned in the -X and +X directions.
        PortSpec::input(BufferKind::Float).with_scan((1, 0), (1, 0)),
        PortSpec::split_output(BufferKind::Float),
    ]
}

/// Pure interpolating refinement. A constant field stays exactly constant
/// through any number of refinement steps, which makes this pass the
/// bookkeeping oracle of the test suite.
pub struct InterpolationPass;

impl RecursionPass for InterpolationPass {
    fn ports(&self) -> Vec<PortSpec> {
        refine_ports()
    }

    fn do_split(
        &self,
        io: &mut PassIo<'_>,
        min_x: i32,
        max_x: i32,
        min_z: i32,
        max_z: i32,
        _level: u32,
    ) {
        let mut dst = io.take_split_output::<f32>(1);
        let src = io.input::<f32>(0);
        for z in min_z..max_z {
            for x in min_x..max_x {
                let own = src.get(x, z);
                dst.set_left(x, z, (src.get(x - 1, z) + own * 3.0) / 4.0);
                dst.set_right(x, z, (src.get(x + 1, z) + own * 3.0) / 4.0);
            }
        }
    }
}

/// Interpolating refinement plus seeded Perlin detail whose amplitude
/// grows with the level, so coarse steps shape mountains and fine steps
/// add surface roughness.
pub struct NoiseRefinePass {
    noise: Perlin,
}

impl NoiseRefinePass {
    pub fn new(seed: u32) -> NoiseRefinePass {
        NoiseRefinePass {
            noise: Perlin::new(seed),
        }
    }

    fn detail(&self, x: i32, z: i32, level: u32) -> f32 {
        // Sample off the integer lattice; gradient noise vanishes on it.
        let nx = x as f64 * 0.137 + 0.31;
        let nz = z as f64 * 0.119 + 0.17;
        self.noise.get([nx, nz, level as f64 * 0.711]) as f32
    }
}

impl RecursionPass for NoiseRefinePass {
    fn ports(&self) -> Vec<PortSpec> {
        refine_ports()
    }

    fn do_split(
        &self,
        io: &mut PassIo<'_>,
        min_x: i32,
        max_x: i32,
        min_z: i32,
        max_z: i32,
        level: u32,
    ) {
        let mut dst = io.take_split_output::<f32>(1);
        let src = io.input::<f32>(0);
        let amplitude = 0.2 * 2.1f32.powi(level as i32);
        for z in min_z..max_z {
            for x in min_x..max_x {
                let own = src.get(x, z);
                let left = (src.get(x - 1, z) + own * 3.0) / 4.0;
                let right = (src.get(x + 1, z) + own * 3.0) / 4.0;
                dst.set_left(x, z, left + amplitude * self.detail(2 * x, z, level));
                dst.set_right(x, z, right + amplitude * self.detail(2 * x + 1, z, level));
            }
        }
    }
}
