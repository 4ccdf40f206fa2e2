//! Raw 2D storage for refinement data: tagged value arrays, placed windows,
//! and the typed views that passes and hooks read and write through.

use serde::Serialize;

/// Identifier of a registered buffer.
///
/// `Cached` buffers persist per fragment and index a fixed table kept by
/// every fragment; `Temp` buffers are scratch storage reused per descent
/// step and never cached. Identifiers are assigned once at registration.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum BufferId {
    Cached(usize),
    Temp(usize),
}

/// Value type stored in a buffer.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
pub enum BufferKind {
    Int,
    Float,
    Double,
    Vec2,
}

/// Border extents on the four sides of a rectangle (−X, +X, −Z, +Z).
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize)]
pub struct Borders {
    pub nx: i32,
    pub px: i32,
    pub nz: i32,
    pub pz: i32,
}

impl Borders {
    /// Componentwise maximum of two border sets.
    pub fn max(self, other: Borders) -> Borders {
        Borders {
            nx: self.nx.max(other.nx),
            px: self.px.max(other.px),
            nz: self.nz.max(other.nz),
            pz: self.pz.max(other.pz),
        }
    }
}

/// Backing storage, tagged by value type.
pub enum BufferData {
    Int(Vec<i32>),
    Float(Vec<f32>),
    Double(Vec<f64>),
    Vec2(Vec<(f32, f32)>),
}

impl BufferData {
    fn new(kind: BufferKind, len: usize) -> BufferData {
        match kind {
            BufferKind::Int => BufferData::Int(vec![0; len]),
            BufferKind::Float => BufferData::Float(vec![0.0; len]),
            BufferKind::Double => BufferData::Double(vec![0.0; len]),
            BufferKind::Vec2 => BufferData::Vec2(vec![(0.0, 0.0); len]),
        }
    }

    fn kind(&self) -> BufferKind {
        match self {
            BufferData::Int(_) => BufferKind::Int,
            BufferData::Float(_) => BufferKind::Float,
            BufferData::Double(_) => BufferKind::Double,
            BufferData::Vec2(_) => BufferKind::Vec2,
        }
    }
}

/// Cell types that can live in a [`BufferData`] array.
pub trait BufferElem: Copy + Default + 'static {
    const KIND: BufferKind;

    fn cells(data: &BufferData) -> Option<&[Self]>;
    fn cells_mut(data: &mut BufferData) -> Option<&mut [Self]>;
}

macro_rules! impl_buffer_elem {
    ($ty:ty, $kind:expr, $variant:ident) => {
        impl BufferElem for $ty {
            const KIND: BufferKind = $kind;

            fn cells(data: &BufferData) -> Option<&[Self]> {
                match data {
                    BufferData::$variant(v) => Some(v),
                    _ => None,
                }
            }

            fn cells_mut(data: &mut BufferData) -> Option<&mut [Self]> {
                match data {
                    BufferData::$variant(v) => Some(v),
                    _ => None,
                }
            }
        }
    };
}

impl_buffer_elem!(i32, BufferKind::Int, Int);
impl_buffer_elem!(f32, BufferKind::Float, Float);
impl_buffer_elem!(f64, BufferKind::Double, Double);
impl_buffer_elem!((f32, f32), BufferKind::Vec2, Vec2);

/// Placement of a buffer's rectangle within its owning fragment's frame:
/// the coordinate of the first cell plus row dimensions. Passed by value;
/// all cell addressing goes through [`Window::index`].
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
pub struct Window {
    pub origin_x: i32,
    pub origin_z: i32,
    pub width: usize,
    pub height: usize,
}

impl Window {
    pub fn contains(&self, x: i32, z: i32) -> bool {
        x >= self.origin_x
            && z >= self.origin_z
            && ((x - self.origin_x) as usize) < self.width
            && ((z - self.origin_z) as usize) < self.height
    }

    /// Linear index of a cell. Out-of-window access is a logic error that
    /// border inference exists to prevent, so it asserts instead of
    /// addressing a neighboring cell.
    fn index(&self, x: i32, z: i32) -> usize {
        assert!(
            self.contains(x, z),
            "buffer access ({}, {}) outside window [{}..{}) x [{}..{})",
            x,
            z,
            self.origin_x,
            self.origin_x + self.width as i32,
            self.origin_z,
            self.origin_z + self.height as i32,
        );
        (z - self.origin_z) as usize * self.width + (x - self.origin_x) as usize
    }

    /// The same window with its origin translated, used when leaf-level
    /// data is addressed in world coordinates.
    pub fn shifted(&self, dx: i32, dz: i32) -> Window {
        Window {
            origin_x: self.origin_x + dx,
            origin_z: self.origin_z + dz,
            ..*self
        }
    }
}

/// One allocated 2D window of refinement data.
///
/// The array is owned and contiguous; the window descriptor records where
/// the rectangle currently sits in its owning fragment's frame. Fragments
/// re-place their buffers when created; temporaries are re-placed per
/// descent step.
pub struct RecursionBuffer {
    data: BufferData,
    window: Window,
}

impl RecursionBuffer {
    pub fn new(kind: BufferKind, width: usize, height: usize) -> RecursionBuffer {
        RecursionBuffer {
            data: BufferData::new(kind, width * height),
            window: Window {
                origin_x: 0,
                origin_z: 0,
                width,
                height,
            },
        }
    }

    pub fn kind(&self) -> BufferKind {
        self.data.kind()
    }

    pub fn window(&self) -> Window {
        self.window
    }

    /// Position the window so that cell (x − border.nx, z − border.nz) is
    /// the first stored cell, for a fragment or step at position (x, z).
    pub fn place(&mut self, x: i32, z: i32, border: Borders) {
        self.window.origin_x = x - border.nx;
        self.window.origin_z = z - border.nz;
    }

    pub fn view<T: BufferElem>(&self) -> BufferView<'_, T> {
        self.view_at(self.window)
    }

    pub fn view_mut<T: BufferElem>(&mut self) -> BufferViewMut<'_, T> {
        let window = self.window;
        let kind = self.data.kind();
        BufferViewMut {
            cells: T::cells_mut(&mut self.data)
                .unwrap_or_else(move || panic!("buffer holds {:?}, not {:?}", kind, T::KIND)),
            window,
        }
    }

    /// A read view with an overriding window placement (world-coordinate
    /// addressing at leaf level).
    pub fn view_at<T: BufferElem>(&self, window: Window) -> BufferView<'_, T> {
        BufferView {
            cells: T::cells(&self.data)
                .unwrap_or_else(|| panic!("buffer holds {:?}, not {:?}", self.data.kind(), T::KIND)),
            window,
        }
    }
}

/// Read access to a placed buffer window.
pub struct BufferView<'a, T: BufferElem> {
    cells: &'a [T],
    window: Window,
}

impl<'a, T: BufferElem> BufferView<'a, T> {
    pub fn get(&self, x: i32, z: i32) -> T {
        self.cells[self.window.index(x, z)]
    }

    pub fn window(&self) -> Window {
        self.window
    }
}

/// Write access to a placed buffer window.
pub struct BufferViewMut<'a, T: BufferElem> {
    cells: &'a mut [T],
    window: Window,
}

impl<'a, T: BufferElem> BufferViewMut<'a, T> {
    pub fn get(&self, x: i32, z: i32) -> T {
        self.cells[self.window.index(x, z)]
    }

    pub fn set(&mut self, x: i32, z: i32, value: T) {
        let idx = self.window.index(x, z);
        self.cells[idx] = value;
    }

    pub fn window(&self) -> Window {
        self.window
    }

    /// Reinterpret as a split view addressing parent-coordinate cells.
    pub fn split(self) -> SplitViewMut<'a, T> {
        SplitViewMut { base: self }
    }
}

/// Split read access: each parent cell (x, z) addresses its two children.
///
/// The children of one refinement step land in the child frame at
/// (z, 2x) and (z, 2x + 1): resolution doubles along one axis while the
/// axes swap, so the next step's doubling hits the other axis without an
/// explicit transpose.
pub struct SplitView<'a, T: BufferElem> {
    base: BufferView<'a, T>,
}

impl<'a, T: BufferElem> SplitView<'a, T> {
    pub fn new(base: BufferView<'a, T>) -> SplitView<'a, T> {
        SplitView { base }
    }

    pub fn left(&self, x: i32, z: i32) -> T {
        self.base.get(z, 2 * x)
    }

    pub fn right(&self, x: i32, z: i32) -> T {
        self.base.get(z, 2 * x + 1)
    }
}

/// Split write access; see [`SplitView`] for the cell mapping.
pub struct SplitViewMut<'a, T: BufferElem> {
    base: BufferViewMut<'a, T>,
}

impl<'a, T: BufferElem> SplitViewMut<'a, T> {
    pub fn left(&self, x: i32, z: i32) -> T {
        self.base.get(z, 2 * x)
    }

    pub fn right(&self, x: i32, z: i32) -> T {
        self.base.get(z, 2 * x + 1)
    }

    pub fn set_left(&mut self, x: i32, z: i32, value: T) {
        self.base.set(z, 2 * x, value);
    }

    pub fn set_right(&mut self, x: i32, z: i32, value: T) {
        self.base.set(z, 2 * x + 1, value);
    }
}
