//! Refinement passes: the capability declaration for each buffer a pass
//! touches, the pass trait itself, and the per-invocation binding context.

use crate::buffer::{
    BufferElem, BufferKind, BufferView, BufferViewMut, RecursionBuffer, SplitView, SplitViewMut,
};

/// Declares how a pass uses one bound buffer: direction, split mode, and
/// the scan range (how far beyond the pass rectangle a *reader* looks).
///
/// This declaration drives border inference and must be accurate; an
/// understated scan range surfaces later as a window assertion inside
/// [`do_split`](RecursionPass::do_split).
#[derive(Clone, Copy, Debug)]
pub struct PortSpec {
    pub kind: BufferKind,
    pub input: bool,
    pub output: bool,
    pub splitted: bool,
    /// Extra cells read in the −X / −Z directions.
    pub scan_neg: (i32, i32),
    /// Extra cells read in the +X / +Z directions.
    pub scan_pos: (i32, i32),
}

impl PortSpec {
    fn new(kind: BufferKind, input: bool, output: bool, splitted: bool) -> PortSpec {
        PortSpec {
            kind,
            input,
            output,
            splitted,
            scan_neg: (0, 0),
            scan_pos: (0, 0),
        }
    }

    /// A plain read port. At refinement time this addresses the parent
    /// fragment's copy of a cached buffer.
    pub fn input(kind: BufferKind) -> PortSpec {
        PortSpec::new(kind, true, false, false)
    }

    /// A split read port: reads same-step refined data written earlier in
    /// the pass list.
    pub fn split_input(kind: BufferKind) -> PortSpec {
        PortSpec::new(kind, true, false, true)
    }

    /// A plain write port (temporaries only; cached buffers may only be
    /// written split, one resolution step at a time).
    pub fn output(kind: BufferKind) -> PortSpec {
        PortSpec::new(kind, false, true, false)
    }

    /// A split write port producing the refined (child-level) data.
    pub fn split_output(kind: BufferKind) -> PortSpec {
        PortSpec::new(kind, false, true, true)
    }

    /// A read-modify-write port on a temporary.
    pub fn in_place(kind: BufferKind) -> PortSpec {
        PortSpec::new(kind, true, true, false)
    }

    pub fn with_scan(mut self, neg: (i32, i32), pos: (i32, i32)) -> PortSpec {
        self.scan_neg = neg;
        self.scan_pos = pos;
        self
    }
}

/// One refinement operator: a pure function of parent / same-level buffer
/// windows producing child-level windows, invoked once per (rectangle,
/// level) during descent.
pub trait RecursionPass {
    /// Ordered port declarations; the order must match the binding order
    /// given to `add_pass`.
    fn ports(&self) -> Vec<PortSpec>;

    /// Refine every cell of the half-open rectangle, given in parent
    /// coordinates. Reads must stay within each input's declared scan
    /// range and writes within the rectangle; the result must depend only
    /// on the coordinates, the level, and the bound inputs.
    fn do_split(
        &self,
        io: &mut PassIo<'_>,
        min_x: i32,
        max_x: i32,
        min_z: i32,
        max_z: i32,
        level: u32,
    );
}

pub(crate) enum Slot<'a> {
    Read(&'a RecursionBuffer),
    Write(&'a mut RecursionBuffer),
}

/// Buffer bindings for one `do_split` invocation, indexed by port
/// position. Read ports can be viewed repeatedly; write ports are taken
/// by value so a pass can hold several output views at once.
pub struct PassIo<'a> {
    slots: Vec<Option<Slot<'a>>>,
}

impl<'a> PassIo<'a> {
    pub(crate) fn new(slots: Vec<Option<Slot<'a>>>) -> PassIo<'a> {
        PassIo { slots }
    }

    pub fn input<T: BufferElem>(&self, port: usize) -> BufferView<'_, T> {
        match self.slots[port].as_ref().expect("output port already taken") {
            Slot::Read(buffer) => buffer.view(),
            Slot::Write(buffer) => buffer.view(),
        }
    }

    pub fn split_input<T: BufferElem>(&self, port: usize) -> SplitView<'_, T> {
        SplitView::new(self.input(port))
    }

    pub fn take_output<T: BufferElem>(&mut self, port: usize) -> BufferViewMut<'a, T> {
        match self.slots[port].take().expect("output port already taken") {
            Slot::Write(buffer) => buffer.view_mut(),
            Slot::Read(_) => panic!("port {port} was not bound writable"),
        }
    }

    pub fn take_split_output<T: BufferElem>(&mut self, port: usize) -> SplitViewMut<'a, T> {
        self.take_output(port).split()
    }
}
