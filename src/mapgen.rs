//! Recursive terrain refinement orchestration.
//!
//! Terrain is produced coarse-to-fine: a requested area is mapped to
//! fixed-size grid cells ("fragments"), and each fragment is resolved by
//! recursively refining its ancestors from the root level down to the
//! leaf lattice. One descent step doubles resolution along one axis; the
//! two split phases of a level together double both axes.
//!
//! # Hierarchy
//!
//! | Level        | Split | Meaning                                    |
//! |--------------|-------|--------------------------------------------|
//! | `root_level` | 0     | Coarsest lattice, seeded directly by the generator |
//! | `n`          | 1     | First half-step below level `n + 1`        |
//! | `n`          | 0     | Second half-step, completing level `n`     |
//! | 0            | 0     | Leaf lattice, hydrated into voxel data     |
//!
//! Setup happens once: register buffers and passes, then [`finalize`]
//! (`RecursiveMapgen::finalize`) runs a backward reach analysis over the
//! pass list to compute how much border every buffer must carry so that a
//! whole fragment can be refined in one go. Resolution is then driven by
//! [`generate_terrain`](RecursiveMapgen::generate_terrain) or
//! [`generate_and_bind_position`](RecursiveMapgen::generate_and_bind_position),
//! with every resolved fragment memoized forever: terrain is
//! deterministic, so the cache never needs invalidation, and working sets
//! stay geographically bounded.

use std::collections::HashMap;

use serde::Serialize;
use thiserror::Error;

use crate::buffer::{
    Borders, BufferElem, BufferId, BufferKind, BufferView, BufferViewMut, RecursionBuffer,
};
use crate::fragment::RecursionFragment;
use crate::pass::{PassIo, PortSpec, RecursionPass, Slot};

/// Construction-time configuration.
#[derive(Clone, Copy, Debug)]
pub struct MapgenParams {
    /// Coarsening depth: how many levels separate the leaf lattice from
    /// the directly generated root lattice.
    pub root_level: u32,
    /// World position of fragment index 0; fragments tile the world from
    /// this alignment point.
    pub grid_origin: (i32, i32),
}

impl Default for MapgenParams {
    fn default() -> Self {
        MapgenParams {
            root_level: 8,
            grid_origin: (0, 0),
        }
    }
}

/// Resolution counters, in the spirit of a cache's hit/miss statistics.
#[derive(Clone, Copy, Debug, Default, Serialize)]
pub struct MapgenStats {
    /// Fragment requests answered from the cache
    pub cache_hits: usize,
    /// Fragments materialized (cache misses)
    pub fragments_created: usize,
    /// Root fragments seeded by the generator hook
    pub root_fragments: usize,
    /// Individual pass invocations across all descent steps
    pub pass_runs: usize,
    /// Clipped patches handed to the content hook
    pub patches_emitted: usize,
}

impl MapgenStats {
    /// Calculate hit rate (0.0 to 1.0)
    pub fn hit_rate(&self) -> f32 {
        let total = self.cache_hits + self.fragments_created;
        if total == 0 {
            0.0
        } else {
            self.cache_hits as f32 / total as f32
        }
    }

    /// Format as human-readable string
    pub fn summary(&self) -> String {
        format!(
            "Hits: {} | Fragments: {} | Rate: {:.1}% | Roots: {} | Passes: {} | Patches: {}",
            self.cache_hits,
            self.fragments_created,
            self.hit_rate() * 100.0,
            self.root_fragments,
            self.pass_runs,
            self.patches_emitted,
        )
    }
}

/// Configuration errors, all fatal: the pass graph is validated once at
/// setup and never expected to fail afterwards.
#[derive(Debug, Error)]
pub enum SetupError {
    #[error("pass declares {ports} ports but binds {bindings} buffers")]
    BindingCountMismatch { ports: usize, bindings: usize },
    #[error("unknown buffer id {0:?}")]
    UnknownBuffer(BufferId),
    #[error("port kind does not match buffer {0:?}")]
    KindMismatch(BufferId),
    #[error("pass reads {0:?} before any pass writes it")]
    ReadBeforeWrite(BufferId),
    #[error("pass writes cached buffer {0:?} without splitting, which would overwrite parent-level data")]
    OverwriteParentData(BufferId),
    #[error("port split mode does not match temporary buffer {0:?}")]
    SplitModeMismatch(BufferId),
    #[error("buffer {0:?} is bound more than once in one pass through the same storage")]
    AliasedBinding(BufferId),
    #[error("buffer {0:?} is never written")]
    NeverWritten(BufferId),
    #[error("buffer {0:?} is never read")]
    NeverRead(BufferId),
    #[error("no refinement passes registered")]
    NoPasses,
    #[error("setup is already finalized")]
    AlreadyFinalized,
}

/// Registration record for one buffer.
#[derive(Clone, Copy, Debug)]
struct BufferInfo {
    kind: BufferKind,
    splitted: bool,
    written: bool,
    read: bool,
    border: Borders,
    width: usize,
    height: usize,
}

impl BufferInfo {
    fn new(kind: BufferKind, splitted: bool) -> BufferInfo {
        BufferInfo {
            kind,
            splitted,
            written: false,
            read: false,
            border: Borders::default(),
            width: 0,
            height: 0,
        }
    }
}

struct PassEntry {
    pass: Box<dyn RecursionPass>,
    ports: Vec<PortSpec>,
    bindings: Vec<BufferId>,
    border: Borders,
}

/// The hooks a concrete generator implements.
///
/// The refinement core stays agnostic of terrain content: it hands the
/// generator bound buffer windows and rectangles, and the generator
/// decides what the fields mean and what becomes of them.
pub trait GeneratorHooks {
    /// Populate the coarsest-level buffers over the given patch. The
    /// patch rectangle is in root-lattice coordinates, which do not
    /// correspond to node coordinates.
    fn generate_root_fragment(&mut self, patch: &mut RootPatch<'_>);

    /// Write terrain content for one clipped patch of a resolved leaf
    /// fragment into the external voxel store. Buffers address world
    /// coordinates here.
    fn generate_terrain_patch(&mut self, patch: &TerrainPatch<'_>);
}

/// Bound buffers plus the rectangle to fill when seeding a root fragment.
/// Bounds are inclusive.
pub struct RootPatch<'a> {
    pub min: (i32, i32),
    pub max: (i32, i32),
    slots: Vec<Option<&'a mut RecursionBuffer>>,
}

impl<'a> RootPatch<'a> {
    /// Claim write access to one cached buffer. Each buffer can be taken
    /// once per root invocation.
    pub fn take_buffer<T: BufferElem>(&mut self, id: BufferId) -> BufferViewMut<'a, T> {
        match id {
            BufferId::Cached(index) => self.slots[index]
                .take()
                .expect("buffer already taken for this root patch")
                .view_mut(),
            BufferId::Temp(_) => panic!("temporary buffers are not bound at the root"),
        }
    }
}

/// Bound buffers plus the clipped world-space rectangle of one leaf
/// fragment intersected with the requested area. Bounds are inclusive;
/// Y passes through from the request untouched.
pub struct TerrainPatch<'a> {
    pub min: (i32, i32, i32),
    pub max: (i32, i32, i32),
    buffers: &'a [RecursionBuffer],
    origin: (i32, i32),
}

impl TerrainPatch<'_> {
    /// Read a cached buffer, addressed in world coordinates.
    pub fn buffer<T: BufferElem>(&self, id: BufferId) -> BufferView<'_, T> {
        world_view(self.buffers, self.origin, id)
    }
}

/// Leaf-fragment buffers bound for a single-column query.
pub struct BoundColumn<'a> {
    buffers: &'a [RecursionBuffer],
    origin: (i32, i32),
}

impl BoundColumn<'_> {
    /// Read a cached buffer, addressed in world coordinates.
    pub fn buffer<T: BufferElem>(&self, id: BufferId) -> BufferView<'_, T> {
        world_view(self.buffers, self.origin, id)
    }
}

fn world_view<'a, T: BufferElem>(
    buffers: &'a [RecursionBuffer],
    origin: (i32, i32),
    id: BufferId,
) -> BufferView<'a, T> {
    match id {
        BufferId::Cached(index) => {
            let buffer = &buffers[index];
            buffer.view_at(buffer.window().shifted(origin.0, origin.1))
        }
        BufferId::Temp(_) => panic!("temporary buffers are not bound to fragments"),
    }
}

/// Serializable snapshot of the inferred refinement plan.
#[derive(Debug, Serialize)]
pub struct PlanReport {
    pub frag_size: i32,
    pub root_border: Borders,
    pub cached_buffers: Vec<BufferPlan>,
    pub temporary_buffers: Vec<BufferPlan>,
    pub passes: Vec<PassPlan>,
}

#[derive(Debug, Serialize)]
pub struct BufferPlan {
    pub kind: BufferKind,
    pub splitted: bool,
    pub border: Borders,
    pub width: usize,
    pub height: usize,
}

#[derive(Debug, Serialize)]
pub struct PassPlan {
    pub border: Borders,
}

/// Deterministic, cached, coarse-to-fine terrain generation core.
///
/// One instance owns one fragment cache and one temporary-buffer pool;
/// generation workers wanting parallelism run independent instances.
pub struct RecursiveMapgen {
    params: MapgenParams,
    cached: Vec<BufferInfo>,
    temps: Vec<BufferInfo>,
    passes: Vec<PassEntry>,
    temp_pool: Vec<RecursionBuffer>,
    fragments: Vec<RecursionFragment>,
    cache: HashMap<(u32, u8, i32, i32), usize>,
    frag_size: i32,
    root_border: Borders,
    finalized: bool,
    stats: MapgenStats,
}

impl RecursiveMapgen {
    pub fn new(params: MapgenParams) -> RecursiveMapgen {
        RecursiveMapgen {
            params,
            cached: Vec::new(),
            temps: Vec::new(),
            passes: Vec::new(),
            temp_pool: Vec::new(),
            fragments: Vec::new(),
            cache: HashMap::new(),
            frag_size: 0,
            root_border: Borders::default(),
            finalized: false,
            stats: MapgenStats::default(),
        }
    }

    pub fn params(&self) -> MapgenParams {
        self.params
    }

    /// Fragment edge length in cells. Valid after `finalize()`.
    pub fn frag_size(&self) -> i32 {
        assert!(self.finalized, "frag_size is computed by finalize()");
        self.frag_size
    }

    pub fn stats(&self) -> &MapgenStats {
        &self.stats
    }

    /// Register a persistent cache-backed buffer.
    pub fn add_buffer(&mut self, kind: BufferKind) -> BufferId {
        assert!(!self.finalized, "buffers must be registered before finalize()");
        let id = BufferId::Cached(self.cached.len());
        self.cached.push(BufferInfo::new(kind, false));
        id
    }

    /// Register scratch storage reused per descent step, never cached.
    pub fn add_temporary_buffer(&mut self, kind: BufferKind, split: bool) -> BufferId {
        assert!(!self.finalized, "buffers must be registered before finalize()");
        let id = BufferId::Temp(self.temps.len());
        self.temps.push(BufferInfo::new(kind, split));
        id
    }

    /// Append a pass to the refinement pipeline, binding its ports to
    /// registered buffers in declaration order. Passes execute in
    /// registration order on every descent step.
    pub fn add_pass(
        &mut self,
        pass: Box<dyn RecursionPass>,
        bindings: &[BufferId],
    ) -> Result<(), SetupError> {
        if self.finalized {
            return Err(SetupError::AlreadyFinalized);
        }
        let ports = pass.ports();
        if ports.len() != bindings.len() {
            return Err(SetupError::BindingCountMismatch {
                ports: ports.len(),
                bindings: bindings.len(),
            });
        }

        for (i, (port, &binding)) in ports.iter().zip(bindings).enumerate() {
            // Reject bindings that would hand one storage object to two
            // ports of this pass with a mutable view in the mix. The
            // canonical plain-cached-read + split-cached-write pair is
            // fine: those address the parent's and the child's copy.
            for (other_port, &other) in ports[..i].iter().zip(&bindings[..i]) {
                if other != binding {
                    continue;
                }
                let aliases = match binding {
                    BufferId::Temp(_) => true,
                    BufferId::Cached(_) => port.splitted && other_port.splitted,
                };
                if aliases {
                    return Err(SetupError::AliasedBinding(binding));
                }
            }

            match binding {
                BufferId::Cached(index) => {
                    let info = self
                        .cached
                        .get_mut(index)
                        .ok_or(SetupError::UnknownBuffer(binding))?;
                    if port.kind != info.kind {
                        return Err(SetupError::KindMismatch(binding));
                    }
                    if port.input && port.splitted && !info.written {
                        return Err(SetupError::ReadBeforeWrite(binding));
                    }
                    if port.output && !port.splitted {
                        return Err(SetupError::OverwriteParentData(binding));
                    }
                    info.written |= port.output;
                    // Split reads see data refined within the same step,
                    // so they do not count as consumption.
                    info.read |= port.input && !port.splitted;
                }
                BufferId::Temp(index) => {
                    let info = self
                        .temps
                        .get_mut(index)
                        .ok_or(SetupError::UnknownBuffer(binding))?;
                    if port.kind != info.kind {
                        return Err(SetupError::KindMismatch(binding));
                    }
                    if port.splitted != info.splitted {
                        return Err(SetupError::SplitModeMismatch(binding));
                    }
                    if port.input && !info.written {
                        return Err(SetupError::ReadBeforeWrite(binding));
                    }
                    info.written |= port.output;
                    info.read |= port.input;
                }
            }
        }

        self.passes.push(PassEntry {
            pass,
            ports,
            bindings: bindings.to_vec(),
            border: Borders::default(),
        });
        Ok(())
    }

    /// Infer every border and buffer size from the declared pass graph.
    ///
    /// Walks the passes in reverse registration order, propagating
    /// "output border needed" backward into "pass must compute this much"
    /// and "inputs must supply this much". Split ports fold border into
    /// the complementary axis at half resolution: N cells of
    /// splitted-parent border become ⌈N/2⌉ cells on the perpendicular
    /// axis. Runs exactly once, before any resolution call.
    pub fn finalize(&mut self) -> Result<(), SetupError> {
        if self.finalized {
            return Err(SetupError::AlreadyFinalized);
        }
        for (i, info) in self.cached.iter().enumerate() {
            if !info.written {
                return Err(SetupError::NeverWritten(BufferId::Cached(i)));
            }
            if !info.read {
                return Err(SetupError::NeverRead(BufferId::Cached(i)));
            }
        }
        for (i, info) in self.temps.iter().enumerate() {
            if !info.written {
                return Err(SetupError::NeverWritten(BufferId::Temp(i)));
            }
            if !info.read {
                return Err(SetupError::NeverRead(BufferId::Temp(i)));
            }
        }
        if self.passes.is_empty() {
            return Err(SetupError::NoPasses);
        }

        let RecursiveMapgen {
            passes,
            cached,
            temps,
            ..
        } = self;

        // Backward reach analysis: the whole range that would be scanned
        // when one borderless fragment is created in one go.
        let mut reach = Borders::default();
        for entry in passes.iter_mut().rev() {
            // The pass must compute at least the border its outputs need.
            let mut b = Borders::default();
            for (port, &binding) in entry.ports.iter().zip(&entry.bindings) {
                if !port.output {
                    continue;
                }
                let info = buffer_info(cached, temps, binding);
                if port.splitted {
                    b.nx = b.nx.max((info.border.nz + 1) / 2);
                    b.px = b.px.max((info.border.pz + 1) / 2);
                    b.nz = b.nz.max(info.border.nx);
                    b.pz = b.pz.max(info.border.px);
                } else {
                    b = b.max(info.border);
                }
            }
            entry.border = b;

            // Its inputs must then supply that border plus the scan range.
            for (port, &binding) in entry.ports.iter().zip(&entry.bindings) {
                if !port.input {
                    continue;
                }
                let info = buffer_info_mut(cached, temps, binding);
                if port.splitted {
                    info.border.nz = info.border.nz.max((b.nx + port.scan_neg.0) * 2);
                    info.border.pz = info.border.pz.max((b.px + port.scan_pos.0) * 2);
                    info.border.nx = info.border.nx.max(b.nz + port.scan_neg.1);
                    info.border.px = info.border.px.max(b.pz + port.scan_pos.1);
                } else {
                    info.border.nx = info.border.nx.max(b.nx + port.scan_neg.0);
                    info.border.px = info.border.px.max(b.px + port.scan_pos.0);
                    info.border.nz = info.border.nz.max(b.nz + port.scan_neg.1);
                    info.border.pz = info.border.pz.max(b.pz + port.scan_pos.1);
                }
                reach.nx = reach.nx.max(b.nx + port.scan_neg.0);
                reach.px = reach.px.max(b.px + port.scan_pos.0);
                reach.nz = reach.nz.max(b.nz + port.scan_neg.1);
                reach.pz = reach.pz.max(b.pz + port.scan_pos.1);
            }
        }

        // Double the reach as a safety margin; the backward analysis
        // alone has proven too tight in practice. Covered by the
        // bounds-sufficiency tests rather than re-derived.
        reach.nx *= 2;
        reach.px *= 2;
        reach.nz *= 2;
        reach.pz *= 2;

        // Size fragments so the border overhead stays amortized.
        let reserve_n = reach.nx + reach.nz;
        let reserve_p = reach.px + reach.pz;
        let frag_size = (((reserve_n + reserve_p) as u32) * 6)
            .next_power_of_two()
            .max(8) as i32;
        self.frag_size = frag_size;

        // Grow passes and buffers to contain the reserve and the border
        // needed by later refinement, until the next axis doubling. After
        // this, buffers are large enough to hold every pass's output and
        // to supply every pass that reads from them.
        for entry in passes.iter_mut() {
            entry.border.nx += reserve_n;
            entry.border.px += reserve_p;
            entry.border.nz += reserve_n + reach.nx;
            entry.border.pz += reserve_p + reach.px;

            for (port, &binding) in entry.ports.iter().zip(&entry.bindings) {
                if !port.output {
                    continue;
                }
                let info = buffer_info_mut(cached, temps, binding);
                if port.splitted {
                    info.border.nz = info.border.nz.max(entry.border.nx * 2);
                    info.border.pz = info.border.pz.max(entry.border.px * 2);
                    info.border.nx = info.border.nx.max(entry.border.nz);
                    info.border.px = info.border.px.max(entry.border.pz);
                } else {
                    info.border = info.border.max(entry.border);
                }
            }
        }

        // All cached buffers share one window, so a fragment presents a
        // single rectangle to the root hook and every cell a refinement
        // step may read is part of that filled rectangle.
        let mut shared = Borders::default();
        for info in cached.iter() {
            shared = shared.max(info.border);
        }
        for info in cached.iter_mut() {
            info.border = shared;
        }
        self.root_border = shared;

        for info in self.cached.iter_mut().chain(self.temps.iter_mut()) {
            info.width = (info.border.nx + frag_size + info.border.px) as usize;
            info.height = (info.border.nz + frag_size + info.border.pz) as usize;
        }
        self.temp_pool = self
            .temps
            .iter()
            .map(|info| RecursionBuffer::new(info.kind, info.width, info.height))
            .collect();

        self.finalized = true;
        log::debug!(
            "refinement plan ready: frag_size={}, {} cached buffers ({}x{} cells), {} temporaries, {} passes",
            self.frag_size,
            self.cached.len(),
            shared.nx + frag_size + shared.px,
            shared.nz + frag_size + shared.pz,
            self.temps.len(),
            self.passes.len(),
        );
        Ok(())
    }

    /// Snapshot of the inferred plan for debugging and regression tests.
    pub fn plan_report(&self) -> PlanReport {
        assert!(self.finalized, "the plan exists after finalize()");
        let buffer_plan = |info: &BufferInfo| BufferPlan {
            kind: info.kind,
            splitted: info.splitted,
            border: info.border,
            width: info.width,
            height: info.height,
        };
        PlanReport {
            frag_size: self.frag_size,
            root_border: self.root_border,
            cached_buffers: self.cached.iter().map(buffer_plan).collect(),
            temporary_buffers: self.temps.iter().map(buffer_plan).collect(),
            passes: self
                .passes
                .iter()
                .map(|entry| PassPlan {
                    border: entry.border,
                })
                .collect(),
        }
    }

    /// Materialize one fragment, recursively resolving its ancestors.
    /// Identical keys return the identical, immutable fragment.
    ///
    /// Panics on a level beyond `root_level`, a nonzero split at the
    /// root, or an unaligned position: those are caller programming
    /// errors, not runtime conditions.
    pub fn get_fragment(
        &mut self,
        x: i32,
        z: i32,
        level: u32,
        split: u8,
        hooks: &mut dyn GeneratorHooks,
    ) -> &RecursionFragment {
        let index = self.fragment_index(x, z, level, split, hooks);
        &self.fragments[index]
    }

    fn fragment_index(
        &mut self,
        x: i32,
        z: i32,
        level: u32,
        split: u8,
        hooks: &mut dyn GeneratorHooks,
    ) -> usize {
        assert!(self.finalized, "finalize() must run before resolution");
        let size = self.frag_size;
        assert!(
            x.rem_euclid(size) == 0 && z.rem_euclid(size) == 0,
            "fragment position ({x}, {z}) is not aligned to frag_size {size}"
        );
        assert!(split <= 1, "split phase must be 0 or 1");

        if let Some(&index) = self.cache.get(&(level, split, x, z)) {
            self.stats.cache_hits += 1;
            return index;
        }

        let root_level = self.params.root_level;
        assert!(
            level < root_level || (level == root_level && split == 0),
            "invalid fragment request: level {level} split {split} with root level {root_level}"
        );

        if level == root_level {
            let index = self.create_fragment(x, z, level, split);
            self.stats.root_fragments += 1;
            let border = self.root_border;
            let min = (x - border.nx, z - border.nz);
            let max = (x + size + border.px - 1, z + size + border.pz - 1);
            log::trace!("seeding root fragment at ({x}, {z})");
            let slots = self.fragments[index]
                .buffers
                .iter_mut()
                .map(Some)
                .collect();
            let mut patch = RootPatch { min, max, slots };
            hooks.generate_root_fragment(&mut patch);
            return index;
        }

        // One refinement step works in the parent's coordinate system:
        // parent X runs along the child Z axis at half resolution, parent
        // Z along the child X axis.
        let parent_x = z.div_euclid(2);
        let parent_z = x;
        let (parent_level, parent_split) = if split == 0 {
            (level, 1)
        } else {
            (level + 1, 0)
        };
        let parent_index = self.fragment_index(
            parent_x.div_euclid(size) * size,
            parent_z,
            parent_level,
            parent_split,
            hooks,
        );
        let child_index = self.create_fragment(x, z, level, split);
        log::trace!("refining fragment ({x}, {z}) level {level} split {split}");

        let RecursiveMapgen {
            passes,
            temps,
            temp_pool,
            fragments,
            stats,
            ..
        } = self;

        // Split temporaries live in the child frame, plain ones in the
        // parent frame the passes address.
        for (info, buffer) in temps.iter().zip(temp_pool.iter_mut()) {
            if info.splitted {
                buffer.place(x, z, info.border);
            } else {
                buffer.place(parent_x, parent_z, info.border);
            }
        }

        let (head, tail) = fragments.split_at_mut(child_index);
        let parent = &head[parent_index];
        let child = &mut tail[0];

        for entry in passes.iter() {
            let mut child_refs: Vec<Option<&mut RecursionBuffer>> =
                child.buffers.iter_mut().map(Some).collect();
            let mut temp_refs: Vec<Option<&mut RecursionBuffer>> =
                temp_pool.iter_mut().map(Some).collect();

            let mut slots = Vec::with_capacity(entry.bindings.len());
            for (port, &binding) in entry.ports.iter().zip(&entry.bindings) {
                let slot = match binding {
                    BufferId::Temp(index) => {
                        let buffer = temp_refs[index].take().expect("aliased temporary binding");
                        if port.output {
                            Slot::Write(buffer)
                        } else {
                            Slot::Read(&*buffer)
                        }
                    }
                    BufferId::Cached(index) => {
                        if port.splitted {
                            let buffer = child_refs[index].take().expect("aliased split binding");
                            if port.output {
                                Slot::Write(buffer)
                            } else {
                                Slot::Read(&*buffer)
                            }
                        } else {
                            Slot::Read(&parent.buffers[index])
                        }
                    }
                };
                slots.push(Some(slot));
            }

            let mut io = PassIo::new(slots);
            let min_x = parent_x - entry.border.nx;
            let max_x = parent_x + size / 2 + entry.border.px;
            let min_z = parent_z - entry.border.nz;
            let max_z = parent_z + size + entry.border.pz;
            entry.pass.do_split(&mut io, min_x, max_x, min_z, max_z, level);
            stats.pass_runs += 1;
        }

        child_index
    }

    fn create_fragment(&mut self, x: i32, z: i32, level: u32, split: u8) -> usize {
        let mut buffers = Vec::with_capacity(self.cached.len());
        for info in &self.cached {
            let mut buffer = RecursionBuffer::new(info.kind, info.width, info.height);
            buffer.place(x, z, info.border);
            buffers.push(buffer);
        }
        let index = self.fragments.len();
        self.fragments.push(RecursionFragment {
            level,
            split,
            pos_x: x,
            pos_z: z,
            buffers,
        });
        self.cache.insert((level, split, x, z), index);
        self.stats.fragments_created += 1;
        index
    }

    /// Generate terrain for a requested world volume: resolve every
    /// covering leaf fragment and hand the content hook one clipped patch
    /// per fragment. The clipped patches tile the request exactly.
    pub fn generate_terrain(
        &mut self,
        node_min: (i32, i32, i32),
        node_max: (i32, i32, i32),
        hooks: &mut dyn GeneratorHooks,
    ) {
        assert!(self.finalized, "finalize() must run before resolution");
        let size = self.frag_size;
        let (origin_x, origin_z) = self.params.grid_origin;

        let fx_min = (node_min.0 - origin_x).div_euclid(size);
        let fx_max = (node_max.0 - origin_x).div_euclid(size);
        let fz_min = (node_min.2 - origin_z).div_euclid(size);
        let fz_max = (node_max.2 - origin_z).div_euclid(size);
        log::debug!(
            "generating terrain ({:?}..{:?}) across {} fragment(s)",
            node_min,
            node_max,
            (fx_max - fx_min + 1) * (fz_max - fz_min + 1),
        );

        for fx in fx_min..=fx_max {
            for fz in fz_min..=fz_max {
                let index = self.fragment_index(fx * size, fz * size, 0, 0, hooks);

                let x_min = fx * size + origin_x;
                let x_max = (fx + 1) * size - 1 + origin_x;
                let z_min = fz * size + origin_z;
                let z_max = (fz + 1) * size - 1 + origin_z;
                let patch = TerrainPatch {
                    min: (
                        x_min.max(node_min.0),
                        node_min.1,
                        z_min.max(node_min.2),
                    ),
                    max: (
                        x_max.min(node_max.0),
                        node_max.1,
                        z_max.min(node_max.2),
                    ),
                    buffers: &self.fragments[index].buffers,
                    origin: (origin_x, origin_z),
                };
                hooks.generate_terrain_patch(&patch);
                self.stats.patches_emitted += 1;
            }
        }
    }

    /// Resolve the leaf fragment owning one column and bind its buffers
    /// for a point query (ground level, spawn height).
    pub fn generate_and_bind_position(
        &mut self,
        x: i32,
        z: i32,
        hooks: &mut dyn GeneratorHooks,
    ) -> BoundColumn<'_> {
        assert!(self.finalized, "finalize() must run before resolution");
        let size = self.frag_size;
        let (origin_x, origin_z) = self.params.grid_origin;
        let frag_x = (x - origin_x).div_euclid(size) * size;
        let frag_z = (z - origin_z).div_euclid(size) * size;
        let index = self.fragment_index(frag_x, frag_z, 0, 0, hooks);
        BoundColumn {
            buffers: &self.fragments[index].buffers,
            origin: (origin_x, origin_z),
        }
    }
}

fn buffer_info<'a>(
    cached: &'a [BufferInfo],
    temps: &'a [BufferInfo],
    id: BufferId,
) -> &'a BufferInfo {
    match id {
        BufferId::Cached(index) => &cached[index],
        BufferId::Temp(index) => &temps[index],
    }
}

fn buffer_info_mut<'a>(
    cached: &'a mut [BufferInfo],
    temps: &'a mut [BufferInfo],
    id: BufferId,
) -> &'a mut BufferInfo {
    match id {
        BufferId::Cached(index) => &mut cached[index],
        BufferId::Temp(index) => &mut temps[index],
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::passes::InterpolationPass;
    use std::collections::HashMap;

    /// Test generator: seeds a constant root field and records every
    /// emitted patch cell.
    struct ConstantField {
        id: BufferId,
        value: f32,
        heights: HashMap<(i32, i32), f32>,
        cell_writes: HashMap<(i32, i32), usize>,
        patches: Vec<((i32, i32, i32), (i32, i32, i32))>,
    }

    impl ConstantField {
        fn new(id: BufferId, value: f32) -> ConstantField {
            ConstantField {
                id,
                value,
                heights: HashMap::new(),
                cell_writes: HashMap::new(),
                patches: Vec::new(),
            }
        }
    }

    impl GeneratorHooks for ConstantField {
        fn generate_root_fragment(&mut self, patch: &mut RootPatch<'_>) {
            let mut field = patch.take_buffer::<f32>(self.id);
            for z in patch.min.1..=patch.max.1 {
                for x in patch.min.0..=patch.max.0 {
                    field.set(x, z, self.value);
                }
            }
        }

        fn generate_terrain_patch(&mut self, patch: &TerrainPatch<'_>) {
            self.patches.push((patch.min, patch.max));
            let field = patch.buffer::<f32>(self.id);
            for z in patch.min.2..=patch.max.2 {
                for x in patch.min.0..=patch.max.0 {
                    self.heights.insert((x, z), field.get(x, z));
                    *self.cell_writes.entry((x, z)).or_insert(0) += 1;
                }
            }
        }
    }

    fn interpolating_mapgen(params: MapgenParams) -> (RecursiveMapgen, BufferId) {
        let mut mapgen = RecursiveMapgen::new(params);
        let id = mapgen.add_buffer(BufferKind::Float);
        mapgen
            .add_pass(Box::new(InterpolationPass), &[id, id])
            .unwrap();
        mapgen.finalize().unwrap();
        (mapgen, id)
    }

    /// Pass stub with arbitrary port declarations, for validation tests.
    struct DeclaredPass(Vec<PortSpec>);

    impl RecursionPass for DeclaredPass {
        fn ports(&self) -> Vec<PortSpec> {
            self.0.clone()
        }

        fn do_split(&self, _: &mut PassIo<'_>, _: i32, _: i32, _: i32, _: i32, _: u32) {}
    }

    /// Averages each cell with its X neighbors into a scratch buffer.
    struct SmoothPass;

    impl RecursionPass for SmoothPass {
        fn ports(&self) -> Vec<PortSpec> {
            vec![
                PortSpec::input(BufferKind::Float).with_scan((1, 0), (1, 0)),
                PortSpec::output(BufferKind::Float),
            ]
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
            let mut out = io.take_output::<f32>(1);
            let src = io.input::<f32>(0);
            for z in min_z..max_z {
                for x in min_x..max_x {
                    let avg = (src.get(x - 1, z) + src.get(x, z) + src.get(x + 1, z)) / 3.0;
                    out.set(x, z, avg);
                }
            }
        }
    }

    /// Interpolating refinement reading the smoothed scratch buffer.
    struct InterpolateSmoothedPass;

    impl RecursionPass for InterpolateSmoothedPass {
        fn ports(&self) -> Vec<PortSpec> {
            vec![
                PortSpec::input(BufferKind::Float).with_scan((1, 0), (1, 0)),
                PortSpec::split_output(BufferKind::Float),
            ]
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

    #[test]
    fn test_reference_plan_inference() {
        let (mapgen, _) = interpolating_mapgen(MapgenParams::default());
        let plan = mapgen.plan_report();

        // One ±1 X scan: reach (1,1,0,0) doubled to (2,2,0,0),
        // reserve 2 on each side, frag_size = next_pow2(4 * 6).
        assert_eq!(plan.frag_size, 32);
        assert_eq!(
            plan.passes[0].border,
            Borders {
                nx: 2,
                px: 2,
                nz: 4,
                pz: 4
            }
        );
        let expected = Borders {
            nx: 4,
            px: 4,
            nz: 4,
            pz: 4,
        };
        assert_eq!(plan.cached_buffers[0].border, expected);
        assert_eq!(plan.root_border, expected);
        assert_eq!(plan.cached_buffers[0].width, 40);
        assert_eq!(plan.cached_buffers[0].height, 40);
    }

    #[test]
    fn test_constant_field_round_trip() {
        let (mut mapgen, id) = interpolating_mapgen(MapgenParams {
            root_level: 4,
            grid_origin: (0, 0),
        });
        let mut hooks = ConstantField::new(id, 8.0);
        mapgen.generate_terrain((-20, 0, -20), (20, 0, 20), &mut hooks);

        for z in -20..=20 {
            for x in -20..=20 {
                assert_eq!(
                    hooks.heights.get(&(x, z)).copied(),
                    Some(8.0),
                    "column ({x}, {z})"
                );
            }
        }
    }

    #[test]
    fn test_round_trip_with_offset_origin() {
        let (mut mapgen, id) = interpolating_mapgen(MapgenParams {
            root_level: 3,
            grid_origin: (-7, 13),
        });
        let mut hooks = ConstantField::new(id, 16.0);
        mapgen.generate_terrain((-40, 0, -10), (-10, 0, 25), &mut hooks);

        for z in -10..=25 {
            for x in -40..=-10 {
                assert_eq!(hooks.heights.get(&(x, z)).copied(), Some(16.0));
            }
        }
    }

    #[test]
    fn test_area_coverage_is_exact() {
        let (mut mapgen, id) = interpolating_mapgen(MapgenParams {
            root_level: 3,
            grid_origin: (0, 0),
        });
        let mut hooks = ConstantField::new(id, 1.0);
        let (min, max) = ((-50, -8, 10), (13, 40, 75));
        mapgen.generate_terrain(min, max, &mut hooks);

        // Every requested column generated exactly once, none outside.
        for z in min.2..=max.2 {
            for x in min.0..=max.0 {
                assert_eq!(hooks.cell_writes.get(&(x, z)).copied(), Some(1));
            }
        }
        assert_eq!(
            hooks.cell_writes.len(),
            ((max.0 - min.0 + 1) * (max.2 - min.2 + 1)) as usize
        );
        // Y bounds pass through untouched.
        for &(patch_min, patch_max) in &hooks.patches {
            assert_eq!(patch_min.1, min.1);
            assert_eq!(patch_max.1, max.1);
        }
    }

    #[test]
    fn test_temp_pipeline_plan_and_round_trip() {
        let mut mapgen = RecursiveMapgen::new(MapgenParams {
            root_level: 3,
            grid_origin: (0, 0),
        });
        let ground = mapgen.add_buffer(BufferKind::Float);
        let smoothed = mapgen.add_temporary_buffer(BufferKind::Float, false);
        mapgen
            .add_pass(Box::new(SmoothPass), &[ground, smoothed])
            .unwrap();
        mapgen
            .add_pass(Box::new(InterpolateSmoothedPass), &[smoothed, ground])
            .unwrap();
        mapgen.finalize().unwrap();

        let plan = mapgen.plan_report();
        assert_eq!(plan.frag_size, 64);
        assert_eq!(
            plan.cached_buffers[0].border,
            Borders {
                nx: 8,
                px: 8,
                nz: 8,
                pz: 8
            }
        );
        assert_eq!(
            plan.temporary_buffers[0].border,
            Borders {
                nx: 5,
                px: 5,
                nz: 8,
                pz: 8
            }
        );

        // Both passes preserve a constant, so the refined field must too.
        let mut hooks = ConstantField::new(ground, 8.0);
        mapgen.generate_terrain((0, 0, 0), (70, 0, 70), &mut hooks);
        for z in 0..=70 {
            for x in 0..=70 {
                assert_eq!(hooks.heights.get(&(x, z)).copied(), Some(8.0));
            }
        }
    }

    #[test]
    fn test_fragment_caching_is_idempotent() {
        let (mut mapgen, id) = interpolating_mapgen(MapgenParams {
            root_level: 4,
            grid_origin: (0, 0),
        });
        let mut hooks = ConstantField::new(id, 2.0);

        let first = mapgen
            .generate_and_bind_position(5, 5, &mut hooks)
            .buffer::<f32>(id)
            .get(5, 5);
        let created = mapgen.stats().fragments_created;
        let roots = mapgen.stats().root_fragments;
        let pass_runs = mapgen.stats().pass_runs;

        let second = mapgen
            .generate_and_bind_position(5, 5, &mut hooks)
            .buffer::<f32>(id)
            .get(5, 5);

        assert_eq!(first, second);
        assert_eq!(mapgen.stats().fragments_created, created);
        assert_eq!(mapgen.stats().root_fragments, roots);
        assert_eq!(mapgen.stats().pass_runs, pass_runs);
        assert!(mapgen.stats().cache_hits > 0);
    }

    #[test]
    fn test_identical_keys_share_the_fragment_instance() {
        let (mut mapgen, id) = interpolating_mapgen(MapgenParams {
            root_level: 2,
            grid_origin: (0, 0),
        });
        let mut hooks = ConstantField::new(id, 0.0);
        let first = mapgen.get_fragment(0, 0, 0, 0, &mut hooks) as *const RecursionFragment;
        let second = mapgen.get_fragment(0, 0, 0, 0, &mut hooks) as *const RecursionFragment;
        assert_eq!(first, second);
    }

    #[test]
    fn test_seam_columns_agree_across_fragments() {
        let (mut mapgen, id) = interpolating_mapgen(MapgenParams {
            root_level: 4,
            grid_origin: (0, 0),
        });
        let size = mapgen.frag_size();
        let mut hooks = ConstantField::new(id, 4.0);

        // The boundary columns of two adjacent fragments.
        let left = mapgen
            .generate_and_bind_position(size - 1, 7, &mut hooks)
            .buffer::<f32>(id)
            .get(size - 1, 7);
        let right = mapgen
            .generate_and_bind_position(size, 7, &mut hooks)
            .buffer::<f32>(id)
            .get(size, 7);
        assert_eq!(left, 4.0);
        assert_eq!(right, 4.0);
    }

    #[test]
    #[should_panic(expected = "invalid fragment request")]
    fn test_level_beyond_root_panics() {
        let (mut mapgen, id) = interpolating_mapgen(MapgenParams {
            root_level: 2,
            grid_origin: (0, 0),
        });
        let mut hooks = ConstantField::new(id, 0.0);
        mapgen.get_fragment(0, 0, 3, 0, &mut hooks);
    }

    #[test]
    #[should_panic(expected = "invalid fragment request")]
    fn test_split_at_root_panics() {
        let (mut mapgen, id) = interpolating_mapgen(MapgenParams {
            root_level: 2,
            grid_origin: (0, 0),
        });
        let mut hooks = ConstantField::new(id, 0.0);
        mapgen.get_fragment(0, 0, 2, 1, &mut hooks);
    }

    #[test]
    #[should_panic(expected = "not aligned")]
    fn test_unaligned_position_panics() {
        let (mut mapgen, id) = interpolating_mapgen(MapgenParams::default());
        let mut hooks = ConstantField::new(id, 0.0);
        mapgen.get_fragment(3, 0, 0, 0, &mut hooks);
    }

    #[test]
    fn test_binding_count_mismatch() {
        let mut mapgen = RecursiveMapgen::new(MapgenParams::default());
        let id = mapgen.add_buffer(BufferKind::Float);
        let err = mapgen
            .add_pass(Box::new(InterpolationPass), &[id])
            .unwrap_err();
        assert!(matches!(err, SetupError::BindingCountMismatch { .. }));
    }

    #[test]
    fn test_read_before_write_is_rejected() {
        let mut mapgen = RecursiveMapgen::new(MapgenParams::default());
        let id = mapgen.add_buffer(BufferKind::Float);
        // Split-reading refined data nothing has produced yet.
        let err = mapgen
            .add_pass(
                Box::new(DeclaredPass(vec![PortSpec::split_input(BufferKind::Float)])),
                &[id],
            )
            .unwrap_err();
        assert!(matches!(err, SetupError::ReadBeforeWrite(_)));

        let temp = mapgen.add_temporary_buffer(BufferKind::Float, false);
        let err = mapgen
            .add_pass(
                Box::new(DeclaredPass(vec![PortSpec::input(BufferKind::Float)])),
                &[temp],
            )
            .unwrap_err();
        assert!(matches!(err, SetupError::ReadBeforeWrite(_)));
    }

    #[test]
    fn test_plain_write_to_cached_buffer_is_rejected() {
        let mut mapgen = RecursiveMapgen::new(MapgenParams::default());
        let id = mapgen.add_buffer(BufferKind::Float);
        let err = mapgen
            .add_pass(
                Box::new(DeclaredPass(vec![PortSpec::output(BufferKind::Float)])),
                &[id],
            )
            .unwrap_err();
        assert!(matches!(err, SetupError::OverwriteParentData(_)));
    }

    #[test]
    fn test_temp_split_mode_mismatch_is_rejected() {
        let mut mapgen = RecursiveMapgen::new(MapgenParams::default());
        let temp = mapgen.add_temporary_buffer(BufferKind::Float, false);
        let err = mapgen
            .add_pass(
                Box::new(DeclaredPass(vec![PortSpec::split_output(BufferKind::Float)])),
                &[temp],
            )
            .unwrap_err();
        assert!(matches!(err, SetupError::SplitModeMismatch(_)));
    }

    #[test]
    fn test_kind_mismatch_is_rejected() {
        let mut mapgen = RecursiveMapgen::new(MapgenParams::default());
        let id = mapgen.add_buffer(BufferKind::Int);
        let err = mapgen
            .add_pass(Box::new(InterpolationPass), &[id, id])
            .unwrap_err();
        assert!(matches!(err, SetupError::KindMismatch(_)));
    }

    #[test]
    fn test_aliased_split_bindings_are_rejected() {
        let mut mapgen = RecursiveMapgen::new(MapgenParams::default());
        let id = mapgen.add_buffer(BufferKind::Float);
        // Writing and split-reading the same refined storage in one pass.
        let err = mapgen
            .add_pass(
                Box::new(DeclaredPass(vec![
                    PortSpec::split_output(BufferKind::Float),
                    PortSpec::split_input(BufferKind::Float),
                ])),
                &[id, id],
            )
            .unwrap_err();
        assert!(matches!(err, SetupError::AliasedBinding(_)));

        let temp = mapgen.add_temporary_buffer(BufferKind::Float, false);
        let err = mapgen
            .add_pass(
                Box::new(DeclaredPass(vec![
                    PortSpec::output(BufferKind::Float),
                    PortSpec::input(BufferKind::Float),
                ])),
                &[temp, temp],
            )
            .unwrap_err();
        assert!(matches!(err, SetupError::AliasedBinding(_)));
    }

    #[test]
    fn test_unused_buffers_fail_finalize() {
        let mut mapgen = RecursiveMapgen::new(MapgenParams::default());
        let id = mapgen.add_buffer(BufferKind::Float);
        let unused = mapgen.add_buffer(BufferKind::Float);
        mapgen
            .add_pass(Box::new(InterpolationPass), &[id, id])
            .unwrap();
        let err = mapgen.finalize().unwrap_err();
        assert!(matches!(err, SetupError::NeverWritten(b) if b == unused));

        // Written but never consumed at the parent level.
        let mut mapgen = RecursiveMapgen::new(MapgenParams::default());
        let id = mapgen.add_buffer(BufferKind::Float);
        mapgen
            .add_pass(
                Box::new(DeclaredPass(vec![PortSpec::split_output(BufferKind::Float)])),
                &[id],
            )
            .unwrap();
        let err = mapgen.finalize().unwrap_err();
        assert!(matches!(err, SetupError::NeverRead(b) if b == id));
    }

    #[test]
    fn test_empty_pipeline_fails_finalize() {
        let mut mapgen = RecursiveMapgen::new(MapgenParams::default());
        let err = mapgen.finalize().unwrap_err();
        assert!(matches!(err, SetupError::NoPasses));
    }

    #[test]
    fn test_finalize_twice_fails() {
        let (mut mapgen, _) = interpolating_mapgen(MapgenParams::default());
        let err = mapgen.finalize().unwrap_err();
        assert!(matches!(err, SetupError::AlreadyFinalized));
    }

    #[test]
    fn test_plan_report_serializes() {
        let (mapgen, _) = interpolating_mapgen(MapgenParams::default());
        let json = serde_json::to_string(&mapgen.plan_report()).unwrap();
        assert!(json.contains("\"frag_size\":32"));
    }
}
