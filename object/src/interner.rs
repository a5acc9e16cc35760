use std::collections::HashMap;

use parking_lot::RwLock;

/// Interned string storage backing `string` objects.
///
/// Each distinct string is stored once as a boxed byte blob; the blob's
/// address is stable for the lifetime of the interner (boxed slices never
/// reallocate), so `string` objects store it raw in their `.intern_data`
/// field and the collector can ignore it.
pub struct Interner {
    inner: RwLock<InternerInner>,
}

struct InternerInner {
    map: HashMap<String, usize>,
    blobs: Vec<Box<[u8]>>,
}

/// A stable view of one interned blob.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct InternedStr {
    pub data: *const u8,
    pub len: usize,
}

impl Interner {
    pub fn new() -> Self {
        Self {
            inner: RwLock::new(InternerInner {
                map: HashMap::new(),
                blobs: Vec::new(),
            }),
        }
    }

    /// Intern `text`, returning the shared blob. Repeated calls with equal
    /// text return the same address.
    pub fn intern(&self, text: &str) -> InternedStr {
        {
            let inner = self.inner.read();
            if let Some(&idx) = inner.map.get(text) {
                let blob = &inner.blobs[idx];
                return InternedStr {
                    data: blob.as_ptr(),
                    len: blob.len(),
                };
            }
        }
        let mut inner = self.inner.write();
        // Raced writers intern identical text only once.
        if let Some(&idx) = inner.map.get(text) {
            let blob = &inner.blobs[idx];
            return InternedStr {
                data: blob.as_ptr(),
                len: blob.len(),
            };
        }
        let blob: Box<[u8]> = text.as_bytes().into();
        let interned = InternedStr {
            data: blob.as_ptr(),
            len: blob.len(),
        };
        let idx = inner.blobs.len();
        inner.blobs.push(blob);
        inner.map.insert(text.to_string(), idx);
        interned
    }

    pub fn len(&self) -> usize {
        self.inner.read().blobs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.read().blobs.is_empty()
    }
}

impl Default for Interner {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn equal_text_interns_once() {
        let interner = Interner::new();
        let a = interner.intern("hello");
        let b = interner.intern("hello");
        assert_eq!(a, b);
        assert_eq!(interner.len(), 1);
    }

    #[test]
    fn distinct_text_gets_distinct_blobs() {
        let interner = Interner::new();
        let a = interner.intern("hello");
        let b = interner.intern("world");
        assert_ne!(a.data, b.data);
        assert_eq!(interner.len(), 2);
    }

    #[test]
    fn blob_addresses_survive_growth() {
        let interner = Interner::new();
        let first = interner.intern("first");
        for i in 0..1000 {
            interner.intern(&format!("s{i}"));
        }
        let again = interner.intern("first");
        assert_eq!(first, again);
        let bytes = unsafe {
            std::slice::from_raw_parts(first.data, first.len)
        };
        assert_eq!(bytes, b"first");
    }
}
