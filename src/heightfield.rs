//! Reference heightfield generator on top of the refinement core.
//!
//! Seeds the coarsest lattice with a flat base level and lets a single
//! noise refinement pass shape everything below it. The content hook
//! records ground levels into a plain grid instead of a voxel store, so
//! the whole stack can be driven and inspected without an engine attached.

use rand::{Rng, SeedableRng};
use rand_chacha::ChaCha8Rng;

use crate::buffer::{BufferId, BufferKind};
use crate::mapgen::{
    GeneratorHooks, MapgenParams, MapgenStats, PlanReport, RecursiveMapgen, RootPatch,
    TerrainPatch,
};
use crate::passes::NoiseRefinePass;

/// Ground levels for a generated region, row-major, inclusive bounds.
pub struct HeightGrid {
    pub min: (i32, i32),
    pub max: (i32, i32),
    values: Vec<f32>,
}

impl HeightGrid {
    pub fn new(min: (i32, i32), max: (i32, i32)) -> HeightGrid {
        let len = (max.0 - min.0 + 1) as usize * (max.1 - min.1 + 1) as usize;
        HeightGrid {
            min,
            max,
            values: vec![0.0; len],
        }
    }

    pub fn width(&self) -> usize {
        (self.max.0 - self.min.0 + 1) as usize
    }

    pub fn height(&self) -> usize {
        (self.max.1 - self.min.1 + 1) as usize
    }

    fn index(&self, x: i32, z: i32) -> usize {
        debug_assert!(x >= self.min.0 && x <= self.max.0 && z >= self.min.1 && z <= self.max.1);
        (z - self.min.1) as usize * self.width() + (x - self.min.0) as usize
    }

    pub fn get(&self, x: i32, z: i32) -> f32 {
        self.values[self.index(x, z)]
    }

    pub fn set(&mut self, x: i32, z: i32, value: f32) {
        let idx = self.index(x, z);
        self.values[idx] = value;
    }

    /// Smallest and largest recorded ground level.
    pub fn range(&self) -> (f32, f32) {
        let mut min_h = f32::MAX;
        let mut max_h = f32::MIN;
        for &h in &self.values {
            if h < min_h {
                min_h = h;
            }
            if h > max_h {
                max_h = h;
            }
        }
        (min_h, max_h)
    }
}

/// Generator hooks of the reference heightfield.
struct HeightfieldHooks {
    ground: BufferId,
    base_level: f32,
    grid: HeightGrid,
}

impl GeneratorHooks for HeightfieldHooks {
    fn generate_root_fragment(&mut self, patch: &mut RootPatch<'_>) {
        // Root lattice coordinates do not correspond to node coordinates;
        // the field is flat here and gains relief on the way down.
        let mut ground = patch.take_buffer::<f32>(self.ground);
        for z in patch.min.1..=patch.max.1 {
            for x in patch.min.0..=patch.max.0 {
                ground.set(x, z, self.base_level);
            }
        }
    }

    fn generate_terrain_patch(&mut self, patch: &TerrainPatch<'_>) {
        let ground = patch.buffer::<f32>(self.ground);
        for z in patch.min.2..=patch.max.2 {
            for x in patch.min.0..=patch.max.0 {
                self.grid.set(x, z, ground.get(x, z));
            }
        }
    }
}

/// The reference generator: one cached ground-level field refined by
/// [`NoiseRefinePass`], with the pass seed derived from a world seed.
pub struct Heightfield {
    mapgen: RecursiveMapgen,
    ground: BufferId,
    base_level: f32,
}

impl Heightfield {
    pub fn new(seed: u64, params: MapgenParams) -> Heightfield {
        let mut mapgen = RecursiveMapgen::new(params);
        let ground = mapgen.add_buffer(BufferKind::Float);

        let mut rng = ChaCha8Rng::seed_from_u64(seed);
        let pass = NoiseRefinePass::new(rng.gen());
        // The pass reads the field from the previous step and writes the
        // refined field for this one.
        mapgen
            .add_pass(Box::new(pass), &[ground, ground])
            .expect("reference pipeline is valid");
        mapgen.finalize().expect("reference pipeline is valid");

        Heightfield {
            mapgen,
            ground,
            base_level: 0.0,
        }
    }

    fn hooks(&self, min: (i32, i32), max: (i32, i32)) -> HeightfieldHooks {
        HeightfieldHooks {
            ground: self.ground,
            base_level: self.base_level,
            grid: HeightGrid::new(min, max),
        }
    }

    /// Generate ground levels for an inclusive world rectangle.
    pub fn generate_region(&mut self, min: (i32, i32), max: (i32, i32)) -> HeightGrid {
        let mut hooks = self.hooks(min, max);
        self.mapgen
            .generate_terrain((min.0, 0, min.1), (max.0, 0, max.1), &mut hooks);
        hooks.grid
    }

    /// Ground level of a single column.
    pub fn ground_level_at(&mut self, x: i32, z: i32) -> f32 {
        let mut hooks = self.hooks((0, 0), (0, 0));
        let ground = self.ground;
        let column = self.mapgen.generate_and_bind_position(x, z, &mut hooks);
        column.buffer::<f32>(ground).get(x, z)
    }

    /// First free level above ground, for placing a spawn point.
    pub fn spawn_level_at(&mut self, x: i32, z: i32) -> i32 {
        self.ground_level_at(x, z) as i32 + 1
    }

    pub fn frag_size(&self) -> i32 {
        self.mapgen.frag_size()
    }

    pub fn stats(&self) -> &MapgenStats {
        self.mapgen.stats()
    }

    pub fn plan_report(&self) -> PlanReport {
        self.mapgen.plan_report()
    }
}
