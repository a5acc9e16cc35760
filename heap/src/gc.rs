use std::ptr;

use malang_object::{
    GcColor, GcRef, HeapObject, Interner, ObjectTag, TypeId, TypeStore, Value,
};

/// Function that enumerates the heap references held by one object.
///
/// The visitor is called once per outgoing reference; which slots to walk
/// is determined by the object's tag and body layout.
pub type TraceFn = fn(obj: GcRef, visitor: &mut dyn FnMut(GcRef));

/// Consumers implement this to provide GC roots.
///
/// Called at safepoints (allocation opcodes and manual runs) to discover
/// live roots from VM state: the data stack, the locals region, and any
/// scratch values a native holds across an allocation.
pub trait RootProvider {
    fn visit_roots(&mut self, visitor: &mut dyn FnMut(Value));
}

/// Trigger policy knobs.
#[derive(Debug, Clone)]
pub struct GcConfig {
    /// The threshold never recomputes below this many bytes.
    pub min_threshold: usize,
    /// After a collection, `threshold = max(min, live_bytes × growth)`.
    pub growth_factor: f64,
    /// Whether allocation may trigger a collection.
    pub auto_enabled: bool,
}

impl Default for GcConfig {
    fn default() -> Self {
        Self {
            min_threshold: 64 * 1024,
            growth_factor: 2.0,
            auto_enabled: true,
        }
    }
}

/// Allocation and collection counters.
#[derive(Debug, Clone, Copy, Default)]
pub struct GcStats {
    pub collections: u64,
    pub total_allocated: u64,
    pub bytes_since_collect: usize,
    pub live_bytes: usize,
    pub live_objects: usize,
}

/// Outcome of one collection cycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CollectionReport {
    pub collected_objects: usize,
    pub live_objects: usize,
    pub live_bytes: usize,
}

/// The garbage collector. Owns every heap object for the lifetime of a
/// program run; the VM holds non-owning [`GcRef`]s.
pub struct Gc {
    /// Head of the intrusive all-objects list (chained via header links).
    head: *mut HeapObject,
    trace_fn: TraceFn,
    interner: Interner,
    /// Objects that are roots in every cycle (string constants and other
    /// constant-pool objects stay permanently marked).
    permanent: Vec<GcRef>,
    threshold: usize,
    config: GcConfig,
    stats: GcStats,
}

impl Gc {
    pub fn new(config: GcConfig, trace_fn: TraceFn) -> Self {
        let threshold = config.min_threshold;
        Self {
            head: ptr::null_mut(),
            trace_fn,
            interner: Interner::new(),
            permanent: Vec::new(),
            threshold,
            config,
            stats: GcStats::default(),
        }
    }

    pub fn stats(&self) -> GcStats {
        let mut stats = self.stats;
        stats.live_objects = self.count_objects();
        stats
    }

    pub fn threshold(&self) -> usize {
        self.threshold
    }

    pub fn interner(&self) -> &Interner {
        &self.interner
    }

    // ── Automatic-collection controls (gc_pause / gc_resume) ───────

    pub fn disable_automatic(&mut self) {
        self.config.auto_enabled = false;
    }

    pub fn enable_automatic(&mut self) {
        self.config.auto_enabled = true;
    }

    pub fn automatic_enabled(&self) -> bool {
        self.config.auto_enabled
    }

    /// Root `obj` in every future cycle. Used for constant-pool objects.
    pub fn add_permanent(&mut self, obj: GcRef) {
        self.permanent.push(obj);
    }

    // ── Allocation ─────────────────────────────────────────────────

    pub fn alloc_plain(
        &mut self,
        type_id: TypeId,
        num_fields: usize,
        roots: &mut dyn RootProvider,
    ) -> GcRef {
        self.maybe_collect(roots);
        self.adopt(HeapObject::new_plain(type_id, ObjectTag::Plain, num_fields))
    }

    pub fn alloc_array(
        &mut self,
        array_type: TypeId,
        element_type: TypeId,
        length: usize,
        fill: Value,
        roots: &mut dyn RootProvider,
    ) -> GcRef {
        self.maybe_collect(roots);
        self.adopt(HeapObject::new_array(array_type, element_type, length, fill))
    }

    pub fn alloc_buffer(
        &mut self,
        size: usize,
        roots: &mut dyn RootProvider,
    ) -> GcRef {
        self.maybe_collect(roots);
        self.adopt(HeapObject::new_buffer(TypeStore::BUFFER, size))
    }

    /// Allocate a `string` object over the interned copy of `text`.
    pub fn alloc_string(
        &mut self,
        text: &str,
        roots: &mut dyn RootProvider,
    ) -> GcRef {
        self.maybe_collect(roots);
        let interned = self.interner.intern(text);
        let obj = self.adopt(HeapObject::new_plain(
            TypeStore::STRING,
            ObjectTag::Str,
            2,
        ));
        obj.set_field(
            TypeStore::STRING_LENGTH_FIELD,
            Value::from_fixnum(interned.len as i32),
        );
        obj.set_field(
            TypeStore::STRING_INTERN_FIELD,
            Value::from_pointer(interned.data),
        );
        obj
    }

    /// Read the text of a `string` object back out of the intern table.
    pub fn string_text(&self, obj: GcRef) -> Option<String> {
        if obj.tag() != ObjectTag::Str {
            return None;
        }
        let len = obj.field(TypeStore::STRING_LENGTH_FIELD)?;
        let data = obj.field(TypeStore::STRING_INTERN_FIELD)?;
        if !len.is_fixnum() || !data.is_pointer() {
            return None;
        }
        // SAFETY: tags checked above; the intern blob lives as long as the
        // interner, which the Gc owns.
        let bytes = unsafe {
            std::slice::from_raw_parts(data.as_pointer(), len.as_fixnum() as usize)
        };
        String::from_utf8(bytes.to_vec()).ok()
    }

    fn adopt(&mut self, obj: HeapObject) -> GcRef {
        let size = obj.byte_size();
        let raw = Box::into_raw(Box::new(obj));
        // SAFETY: freshly boxed, non-null.
        let obj = unsafe { GcRef::from_ptr(raw) };
        unsafe { obj.get() }.header.set_next(self.head);
        self.head = raw;
        self.stats.total_allocated += size as u64;
        self.stats.bytes_since_collect += size;
        obj
    }

    fn maybe_collect(&mut self, roots: &mut dyn RootProvider) {
        if !self.config.auto_enabled {
            return;
        }
        if self.stats.bytes_since_collect < self.threshold {
            return;
        }
        self.collect(roots);
    }

    // ── Collection ─────────────────────────────────────────────────

    /// Run one full mark-and-sweep cycle.
    pub fn collect(&mut self, roots: &mut dyn RootProvider) -> CollectionReport {
        self.mark(roots);
        let report = self.sweep();
        self.stats.collections += 1;
        self.stats.bytes_since_collect = 0;
        self.stats.live_bytes = report.live_bytes;
        self.threshold = ((report.live_bytes as f64 * self.config.growth_factor)
            as usize)
            .max(self.config.min_threshold);
        tracing::debug!(
            target: "gc",
            collected = report.collected_objects,
            live = report.live_objects,
            live_bytes = report.live_bytes,
            threshold = self.threshold,
            "collection finished"
        );
        report
    }

    fn mark(&mut self, roots: &mut dyn RootProvider) {
        // Whiten everything.
        let mut cursor = self.head;
        while !cursor.is_null() {
            // SAFETY: the all-objects list only holds objects we own.
            let header = unsafe { &(*cursor).header };
            header.set_color(GcColor::White);
            cursor = header.next();
        }

        let mut worklist: Vec<GcRef> = Vec::new();
        for &obj in &self.permanent {
            worklist.push(obj);
        }
        roots.visit_roots(&mut |value| {
            if let Some(obj) = value.object() {
                worklist.push(obj);
            }
        });

        let trace_fn = self.trace_fn;
        while let Some(obj) = worklist.pop() {
            // SAFETY: worklist entries come from live roots or traced edges.
            let header = &unsafe { obj.get() }.header;
            if header.color() == GcColor::Black {
                continue;
            }
            header.set_color(GcColor::Gray);
            trace_fn(obj, &mut |child| {
                // SAFETY: traced edge of a live object.
                if unsafe { child.get() }.header.color() != GcColor::Black {
                    worklist.push(child);
                }
            });
            header.set_color(GcColor::Black);
        }
    }

    fn sweep(&mut self) -> CollectionReport {
        let mut collected = 0usize;
        let mut live_objects = 0usize;
        let mut live_bytes = 0usize;

        let mut prev: *mut HeapObject = ptr::null_mut();
        let mut cursor = self.head;
        while !cursor.is_null() {
            // SAFETY: list invariant — every node is owned by this Gc.
            let header = unsafe { &(*cursor).header };
            let next = header.next();
            if header.color() == GcColor::White {
                if prev.is_null() {
                    self.head = next;
                } else {
                    unsafe { &(*prev).header }.set_next(next);
                }
                header.set_color(GcColor::Free);
                // SAFETY: unlinked, unreachable, allocated via Box in adopt.
                // Dropping the box finalizes the body (arrays free their
                // element storage, buffers their bytes).
                drop(unsafe { Box::from_raw(cursor) });
                collected += 1;
            } else {
                debug_assert_eq!(header.color(), GcColor::Black);
                live_objects += 1;
                live_bytes += unsafe { &*cursor }.byte_size();
                prev = cursor;
            }
            cursor = next;
        }

        CollectionReport {
            collected_objects: collected,
            live_objects,
            live_bytes,
        }
    }

    fn count_objects(&self) -> usize {
        let mut count = 0;
        let mut cursor = self.head;
        while !cursor.is_null() {
            count += 1;
            // SAFETY: list invariant.
            cursor = unsafe { &(*cursor).header }.next();
        }
        count
    }
}

impl Drop for Gc {
    fn drop(&mut self) {
        let mut cursor = self.head;
        while !cursor.is_null() {
            // SAFETY: teardown owns the whole list; nothing observes the
            // objects afterwards.
            let next = unsafe { &(*cursor).header }.next();
            drop(unsafe { Box::from_raw(cursor) });
            cursor = next;
        }
        self.head = ptr::null_mut();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use malang_object::trace_object;

    /// Roots held in a plain vector, standing in for VM stacks.
    struct VecRoots(Vec<Value>);

    impl RootProvider for VecRoots {
        fn visit_roots(&mut self, visitor: &mut dyn FnMut(Value)) {
            for &v in &self.0 {
                visitor(v);
            }
        }
    }

    fn test_gc() -> Gc {
        Gc::new(GcConfig::default(), trace_object)
    }

    #[test]
    fn unreferenced_objects_are_swept() {
        let mut gc = test_gc();
        let mut roots = VecRoots(Vec::new());
        for _ in 0..10 {
            gc.alloc_plain(TypeStore::OBJECT, 2, &mut roots);
        }
        assert_eq!(gc.stats().live_objects, 10);
        let report = gc.collect(&mut roots);
        assert_eq!(report.collected_objects, 10);
        assert_eq!(report.live_objects, 0);
        assert_eq!(gc.stats().live_objects, 0);
    }

    #[test]
    fn rooted_objects_survive() {
        let mut gc = test_gc();
        let mut roots = VecRoots(Vec::new());
        let keep = gc.alloc_plain(TypeStore::OBJECT, 1, &mut roots);
        roots.0.push(Value::from_object(keep));
        gc.alloc_plain(TypeStore::OBJECT, 1, &mut roots);

        let report = gc.collect(&mut roots);
        assert_eq!(report.collected_objects, 1);
        assert_eq!(report.live_objects, 1);
        assert_eq!(keep.num_fields(), 1);
    }

    #[test]
    fn reachability_is_transitive() {
        let mut gc = test_gc();
        let mut roots = VecRoots(Vec::new());
        let inner = gc.alloc_plain(TypeStore::OBJECT, 0, &mut roots);
        let outer = gc.alloc_plain(TypeStore::OBJECT, 1, &mut roots);
        outer.set_field(0, Value::from_object(inner));
        roots.0.push(Value::from_object(outer));

        let report = gc.collect(&mut roots);
        assert_eq!(report.live_objects, 2);
    }

    #[test]
    fn cycles_do_not_leak_or_loop() {
        let mut gc = test_gc();
        let mut roots = VecRoots(Vec::new());
        let a = gc.alloc_plain(TypeStore::OBJECT, 1, &mut roots);
        let b = gc.alloc_plain(TypeStore::OBJECT, 1, &mut roots);
        a.set_field(0, Value::from_object(b));
        b.set_field(0, Value::from_object(a));

        roots.0.push(Value::from_object(a));
        assert_eq!(gc.collect(&mut roots).live_objects, 2);

        roots.0.clear();
        let report = gc.collect(&mut roots);
        assert_eq!(report.collected_objects, 2);
        assert_eq!(report.live_objects, 0);
    }

    #[test]
    fn arrays_keep_their_elements_alive() {
        let mut gc = test_gc();
        let mut roots = VecRoots(Vec::new());
        let elem = gc.alloc_plain(TypeStore::OBJECT, 0, &mut roots);
        let arr = gc.alloc_array(
            TypeStore::OBJECT,
            TypeStore::OBJECT,
            4,
            Value::nothing(),
            &mut roots,
        );
        arr.set_element(2, Value::from_object(elem));
        roots.0.push(Value::from_object(arr));

        assert_eq!(gc.collect(&mut roots).live_objects, 2);
    }

    #[test]
    fn permanent_objects_never_die() {
        let mut gc = test_gc();
        let mut roots = VecRoots(Vec::new());
        let s = gc.alloc_string("const", &mut roots);
        gc.add_permanent(s);
        let report = gc.collect(&mut roots);
        assert_eq!(report.live_objects, 1);
        assert_eq!(gc.string_text(s).as_deref(), Some("const"));
    }

    #[test]
    fn two_consecutive_collections_agree() {
        let mut gc = test_gc();
        let mut roots = VecRoots(Vec::new());
        let keep = gc.alloc_plain(TypeStore::OBJECT, 3, &mut roots);
        roots.0.push(Value::from_object(keep));
        for _ in 0..100 {
            gc.alloc_plain(TypeStore::OBJECT, 3, &mut roots);
        }
        let first = gc.collect(&mut roots);
        let second = gc.collect(&mut roots);
        assert_eq!(first.live_objects, second.live_objects);
        assert_eq!(first.live_bytes, second.live_bytes);
        assert_eq!(second.collected_objects, 0);
    }

    #[test]
    fn ten_thousand_transient_objects_return_to_baseline() {
        let mut gc = test_gc();
        let mut roots = VecRoots(Vec::new());
        let baseline = gc.stats().live_objects;
        for _ in 0..10_000 {
            gc.alloc_plain(TypeStore::OBJECT, 2, &mut roots);
        }
        gc.collect(&mut roots);
        assert_eq!(gc.stats().live_objects, baseline);
    }

    #[test]
    fn automatic_trigger_respects_threshold_and_pause() {
        let mut gc = Gc::new(
            GcConfig {
                min_threshold: 1024,
                growth_factor: 2.0,
                auto_enabled: true,
            },
            trace_object,
        );
        let mut roots = VecRoots(Vec::new());
        for _ in 0..200 {
            gc.alloc_plain(TypeStore::OBJECT, 8, &mut roots);
        }
        assert!(gc.stats().collections > 0);

        gc.disable_automatic();
        let runs = gc.stats().collections;
        for _ in 0..200 {
            gc.alloc_plain(TypeStore::OBJECT, 8, &mut roots);
        }
        assert_eq!(gc.stats().collections, runs);

        gc.enable_automatic();
        for _ in 0..200 {
            gc.alloc_plain(TypeStore::OBJECT, 8, &mut roots);
        }
        assert!(gc.stats().collections > runs);
    }

    #[test]
    fn threshold_grows_with_live_set() {
        let mut gc = Gc::new(
            GcConfig {
                min_threshold: 256,
                growth_factor: 2.0,
                auto_enabled: false,
            },
            trace_object,
        );
        let mut roots = VecRoots(Vec::new());
        for _ in 0..100 {
            let obj = gc.alloc_plain(TypeStore::OBJECT, 16, &mut roots);
            roots.0.push(Value::from_object(obj));
        }
        let report = gc.collect(&mut roots);
        assert_eq!(gc.threshold(), report.live_bytes * 2);
    }

    #[test]
    fn string_allocation_round_trips() {
        let mut gc = test_gc();
        let mut roots = VecRoots(Vec::new());
        let a = gc.alloc_string("hello", &mut roots);
        let b = gc.alloc_string("hello", &mut roots);
        assert_eq!(gc.string_text(a).as_deref(), Some("hello"));
        // Distinct objects, shared intern data.
        assert_ne!(a, b);
        assert_eq!(
            a.field(TypeStore::STRING_INTERN_FIELD),
            b.field(TypeStore::STRING_INTERN_FIELD),
        );
    }
}
