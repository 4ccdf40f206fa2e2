//! Cache entries of the refinement hierarchy.

use crate::buffer::{BufferElem, BufferId, BufferView, RecursionBuffer};

/// A cached, fixed-size grid cell's refinement data at one level and
/// split phase.
///
/// Owns one placed [`RecursionBuffer`] per registered cached buffer.
/// Fragments are created lazily, memoized by (level, split, position),
/// and never invalidated: terrain is deterministic, so resolved data
/// stays valid for the generator's lifetime.
pub struct RecursionFragment {
    pub level: u32,
    pub split: u8,
    pub pos_x: i32,
    pub pos_z: i32,
    pub(crate) buffers: Vec<RecursionBuffer>,
}

impl RecursionFragment {
    /// Read a cached buffer in this fragment's own frame.
    pub fn buffer<T: BufferElem>(&self, id: BufferId) -> BufferView<'_, T> {
        match id {
            BufferId::Cached(index) => self.buffers[index].view(),
            BufferId::Temp(_) => panic!("temporary buffers are not owned by fragments"),
        }
    }
}
