use std::cell::Cell;

use crate::objects::HeapObject;
use crate::types::TypeId;

/// Layout family of a heap object.
///
/// Fixed at allocation; never changes for the lifetime of the object.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum ObjectTag {
    /// Fixed field array described by the object's type.
    Plain = 0,
    /// Homogeneous `Value` elements plus an element type.
    Array,
    /// Raw byte storage.
    Buffer,
    /// A plain object of type `string` (`length` + `.intern_data` fields).
    Str,
}

impl ObjectTag {
    pub const COUNT: usize = Self::Str as usize + 1;
}

impl TryFrom<u8> for ObjectTag {
    type Error = u8;

    fn try_from(byte: u8) -> Result<Self, u8> {
        if byte < Self::COUNT as u8 {
            // SAFETY: ObjectTag is repr(u8) with contiguous variants from 0.
            Ok(unsafe { core::mem::transmute::<u8, ObjectTag>(byte) })
        } else {
            Err(byte)
        }
    }
}

/// Tricolor marking state.
///
/// Outside a collection every live object is `White`. During marking,
/// `Gray` objects are on the worklist and `Black` objects have had all
/// their children visited. `Free` marks an object that sweep has already
/// torn down (only ever observed transiently during teardown).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum GcColor {
    White = 0,
    Gray,
    Black,
    Free,
}

/// The header at the start of every heap object.
///
/// `color` and `next` use `Cell` so the collector can mark and relink
/// through shared references; the VM is single-threaded per the runtime's
/// cooperative scheduling model, so no atomics are needed.
pub struct Header {
    type_id: TypeId,
    tag: ObjectTag,
    color: Cell<GcColor>,
    /// Intrusive link chaining every object the collector owns.
    next: Cell<*mut HeapObject>,
}

impl Header {
    pub fn new(type_id: TypeId, tag: ObjectTag) -> Self {
        Self {
            type_id,
            tag,
            color: Cell::new(GcColor::White),
            next: Cell::new(std::ptr::null_mut()),
        }
    }

    #[inline(always)]
    pub fn type_id(&self) -> TypeId {
        self.type_id
    }

    #[inline(always)]
    pub fn tag(&self) -> ObjectTag {
        self.tag
    }

    #[inline(always)]
    pub fn color(&self) -> GcColor {
        self.color.get()
    }

    #[inline(always)]
    pub fn set_color(&self, color: GcColor) {
        self.color.set(color);
    }

    #[inline(always)]
    pub fn next(&self) -> *mut HeapObject {
        self.next.get()
    }

    #[inline(always)]
    pub fn set_next(&self, next: *mut HeapObject) {
        self.next.set(next);
    }
}

impl core::fmt::Debug for Header {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("Header")
            .field("type", &self.type_id)
            .field("tag", &self.tag)
            .field("color", &self.color.get())
            .finish()
    }
}
