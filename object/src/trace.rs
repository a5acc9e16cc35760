use crate::objects::{Body, GcRef};

/// Call `visitor` for every heap object `obj` references.
///
/// Which slots to walk is determined purely by the object's body layout;
/// values are self-describing, so non-reference fields (fixnums, intern
/// pointers) are skipped by their tags.
pub fn trace_object(obj: GcRef, visitor: &mut dyn FnMut(GcRef)) {
    // SAFETY: the collector only traces objects it still owns.
    match &unsafe { obj.get() }.body {
        Body::Plain { fields } => {
            for value in fields.iter() {
                if let Some(child) = value.object() {
                    visitor(child);
                }
            }
        }
        Body::Array { elements, .. } => {
            for value in elements.iter() {
                if let Some(child) = value.object() {
                    visitor(child);
                }
            }
        }
        Body::Buffer { .. } => {}
    }
}
