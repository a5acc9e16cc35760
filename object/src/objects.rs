use std::ptr::NonNull;

use crate::header::{Header, ObjectTag};
use crate::types::TypeId;
use crate::value::Value;

/// One garbage-collected heap object: a header plus a tag-specific body.
pub struct HeapObject {
    pub header: Header,
    pub body: Body,
}

/// Body layouts, one per [`ObjectTag`] family.
///
/// A string is a `Plain` body whose type is `string`; its two fields hold
/// the byte length (fixnum) and a pointer into the intern table.
pub enum Body {
    Plain {
        fields: Box<[Value]>,
    },
    Array {
        element_type: TypeId,
        elements: Vec<Value>,
    },
    Buffer {
        data: Box<[u8]>,
    },
}

impl HeapObject {
    pub fn new_plain(type_id: TypeId, tag: ObjectTag, num_fields: usize) -> Self {
        debug_assert!(matches!(tag, ObjectTag::Plain | ObjectTag::Str));
        Self {
            header: Header::new(type_id, tag),
            body: Body::Plain {
                fields: vec![Value::nothing(); num_fields].into_boxed_slice(),
            },
        }
    }

    pub fn new_array(
        array_type: TypeId,
        element_type: TypeId,
        length: usize,
        fill: Value,
    ) -> Self {
        Self {
            header: Header::new(array_type, ObjectTag::Array),
            body: Body::Array {
                element_type,
                elements: vec![fill; length],
            },
        }
    }

    pub fn new_buffer(buffer_type: TypeId, size: usize) -> Self {
        Self {
            header: Header::new(buffer_type, ObjectTag::Buffer),
            body: Body::Buffer {
                data: vec![0u8; size].into_boxed_slice(),
            },
        }
    }

    /// Total bytes this object accounts for against the GC threshold:
    /// the object itself plus its out-of-line body storage.
    pub fn byte_size(&self) -> usize {
        let body = match &self.body {
            Body::Plain { fields } => fields.len() * size_of::<Value>(),
            Body::Array { elements, .. } => {
                elements.capacity() * size_of::<Value>()
            }
            Body::Buffer { data } => data.len(),
        };
        size_of::<HeapObject>() + body
    }
}

/// A copyable, non-owning reference to a heap object.
///
/// All access goes through methods that read or write via the raw pointer,
/// so no long-lived `&mut HeapObject` ever exists; the garbage collector
/// retains ownership and frees the object during sweep.
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
#[repr(transparent)]
pub struct GcRef(NonNull<HeapObject>);

impl GcRef {
    /// # Safety
    ///
    /// `ptr` must point to a live object owned by the garbage collector.
    #[inline(always)]
    pub unsafe fn from_ptr(ptr: *mut HeapObject) -> Self {
        debug_assert!(!ptr.is_null());
        Self(NonNull::new_unchecked(ptr))
    }

    #[inline(always)]
    pub fn as_ptr(self) -> *mut HeapObject {
        self.0.as_ptr()
    }

    /// # Safety
    ///
    /// The referent must be alive. The returned borrow must not outlive
    /// a collection that frees the object.
    #[inline(always)]
    pub unsafe fn get(&self) -> &HeapObject {
        self.0.as_ref()
    }

    #[inline(always)]
    pub fn type_id(self) -> TypeId {
        // SAFETY: GcRef invariant — referent is alive.
        unsafe { self.get() }.header.type_id()
    }

    #[inline(always)]
    pub fn tag(self) -> ObjectTag {
        // SAFETY: GcRef invariant — referent is alive.
        unsafe { self.get() }.header.tag()
    }

    // ── Plain / Str field access ───────────────────────────────────

    pub fn num_fields(self) -> usize {
        // SAFETY: GcRef invariant — referent is alive.
        match &unsafe { self.get() }.body {
            Body::Plain { fields } => fields.len(),
            _ => 0,
        }
    }

    /// Read field `index`. Returns `None` when out of range or when the
    /// object is not a plain object.
    pub fn field(self, index: usize) -> Option<Value> {
        // SAFETY: GcRef invariant — referent is alive.
        match &unsafe { self.get() }.body {
            Body::Plain { fields } => fields.get(index).copied(),
            _ => None,
        }
    }

    /// Write field `index`. Returns `false` when out of range.
    pub fn set_field(self, index: usize, value: Value) -> bool {
        // SAFETY: GcRef invariant; single-threaded mutator, no aliasing
        // borrow is live across this store.
        match unsafe { &mut (*self.as_ptr()).body } {
            Body::Plain { fields } => match fields.get_mut(index) {
                Some(slot) => {
                    *slot = value;
                    true
                }
                None => false,
            },
            _ => false,
        }
    }

    // ── Array access ───────────────────────────────────────────────

    pub fn array_len(self) -> usize {
        // SAFETY: GcRef invariant — referent is alive.
        match &unsafe { self.get() }.body {
            Body::Array { elements, .. } => elements.len(),
            Body::Buffer { data } => data.len(),
            Body::Plain { .. } => 0,
        }
    }

    pub fn element_type(self) -> Option<TypeId> {
        // SAFETY: GcRef invariant — referent is alive.
        match &unsafe { self.get() }.body {
            Body::Array { element_type, .. } => Some(*element_type),
            _ => None,
        }
    }

    pub fn element(self, index: usize) -> Option<Value> {
        // SAFETY: GcRef invariant — referent is alive.
        match &unsafe { self.get() }.body {
            Body::Array { elements, .. } => elements.get(index).copied(),
            _ => None,
        }
    }

    pub fn set_element(self, index: usize, value: Value) -> bool {
        // SAFETY: GcRef invariant; single-threaded mutator.
        match unsafe { &mut (*self.as_ptr()).body } {
            Body::Array { elements, .. } => match elements.get_mut(index) {
                Some(slot) => {
                    *slot = value;
                    true
                }
                None => false,
            },
            _ => false,
        }
    }

    // ── Buffer access ──────────────────────────────────────────────

    pub fn buffer_byte(self, index: usize) -> Option<u8> {
        // SAFETY: GcRef invariant — referent is alive.
        match &unsafe { self.get() }.body {
            Body::Buffer { data } => data.get(index).copied(),
            _ => None,
        }
    }

    pub fn set_buffer_byte(self, index: usize, byte: u8) -> bool {
        // SAFETY: GcRef invariant; single-threaded mutator.
        match unsafe { &mut (*self.as_ptr()).body } {
            Body::Buffer { data } => match data.get_mut(index) {
                Some(slot) => {
                    *slot = byte;
                    true
                }
                None => false,
            },
            _ => false,
        }
    }
}

impl core::fmt::Debug for GcRef {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        write!(f, "GcRef(0x{:x}, {:?})", self.as_ptr() as usize, self.tag())
    }
}
