use std::collections::HashMap;

use bitflags::bitflags;

/// Index of a type in the [`TypeStore`].
///
/// Inter-type edges (parent links, element types, field types) are always
/// IDs, never owning references, so the type graph may contain cycles.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[repr(transparent)]
pub struct TypeId(pub u32);

/// Index of a callable in the bound-function map.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(transparent)]
pub struct FunctionId(pub u32);

bitflags! {
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct TypeFlags: u8 {
        /// Built-in scalar type (int, double, bool, char, void).
        const PRIMITIVE = 1 << 0;
        /// Function signature type.
        const FUNCTION = 1 << 1;
        /// Array-of-element type.
        const ARRAY = 1 << 2;
        /// Values of this type are heap references.
        const REFERENCE = 1 << 3;
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FieldInfo {
    pub name: String,
    pub ty: TypeId,
}

/// One vtable entry. `methods` on a [`TypeInfo`] preserves registration
/// order, and inherited entries are linked parent-first, so an entry's
/// position is its stable virtual-dispatch slot.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MethodInfo {
    pub name: String,
    /// Full parameter list; `params[0]` is the receiver.
    pub params: Vec<TypeId>,
    pub ret: TypeId,
    pub function: FunctionId,
}

impl MethodInfo {
    /// Parameters after the receiver. An override names the subclass as
    /// its receiver, so signature identity ignores `params[0]`.
    fn tail(&self) -> &[TypeId] {
        self.params.get(1..).unwrap_or(&[])
    }

    fn matches(&self, name: &str, args: &[TypeId]) -> bool {
        self.name == name && self.tail() == args.get(1..).unwrap_or(&[])
    }
}

/// Runtime type descriptor. Immutable once the program starts: the
/// lowering pass builds and links the store, the VM and GC only read it.
#[derive(Debug, Clone)]
pub struct TypeInfo {
    pub name: String,
    pub id: TypeId,
    pub parent: Option<TypeId>,
    pub fields: Vec<FieldInfo>,
    pub methods: Vec<MethodInfo>,
    pub flags: TypeFlags,
    /// Set when `flags` contains [`TypeFlags::ARRAY`].
    pub element_type: Option<TypeId>,
}

impl TypeInfo {
    pub fn num_fields(&self) -> usize {
        self.fields.len()
    }

    pub fn is_primitive(&self) -> bool {
        self.flags.contains(TypeFlags::PRIMITIVE)
    }

    pub fn is_array(&self) -> bool {
        self.flags.contains(TypeFlags::ARRAY)
    }

    pub fn is_reference(&self) -> bool {
        self.flags.contains(TypeFlags::REFERENCE)
    }

    pub fn field_index(&self, name: &str) -> Option<usize> {
        self.fields.iter().position(|f| f.name == name)
    }
}

/// All runtime types, keyed by stable [`TypeId`].
#[derive(Debug, Clone)]
pub struct TypeStore {
    types: Vec<TypeInfo>,
    by_name: HashMap<String, TypeId>,
    array_types: HashMap<TypeId, TypeId>,
}

impl TypeStore {
    pub const VOID: TypeId = TypeId(0);
    pub const INT: TypeId = TypeId(1);
    pub const DOUBLE: TypeId = TypeId(2);
    pub const BOOL: TypeId = TypeId(3);
    pub const CHAR: TypeId = TypeId(4);
    pub const OBJECT: TypeId = TypeId(5);
    pub const STRING: TypeId = TypeId(6);
    pub const BUFFER: TypeId = TypeId(7);

    pub fn new() -> Self {
        let mut store = Self {
            types: Vec::new(),
            by_name: HashMap::new(),
            array_types: HashMap::new(),
        };
        let prim = TypeFlags::PRIMITIVE;
        let obj = TypeFlags::REFERENCE;
        store.register("void", None, prim);
        store.register("int", None, prim);
        store.register("double", None, prim);
        store.register("bool", None, prim);
        store.register("char", None, prim);
        store.register("object", None, obj);
        let string = store.register("string", None, obj);
        store.register("buffer", None, obj);

        // The string layout the runtime relies on: byte length plus a
        // pointer into the intern table. The leading dot keeps the intern
        // field unnameable from source.
        debug_assert_eq!(string, Self::STRING);
        store.types[string.0 as usize].fields = vec![
            FieldInfo {
                name: "length".to_string(),
                ty: Self::INT,
            },
            FieldInfo {
                name: ".intern_data".to_string(),
                ty: Self::INT,
            },
        ];

        store
    }

    pub const STRING_LENGTH_FIELD: usize = 0;
    pub const STRING_INTERN_FIELD: usize = 1;

    fn register(
        &mut self,
        name: &str,
        parent: Option<TypeId>,
        flags: TypeFlags,
    ) -> TypeId {
        let id = TypeId(self.types.len() as u32);
        self.types.push(TypeInfo {
            name: name.to_string(),
            id,
            parent,
            fields: Vec::new(),
            methods: Vec::new(),
            flags,
            element_type: None,
        });
        self.by_name.insert(name.to_string(), id);
        id
    }

    /// Declare a class type. Returns `None` when the name is taken.
    pub fn declare_class(
        &mut self,
        name: &str,
        parent: Option<TypeId>,
    ) -> Option<TypeId> {
        if self.by_name.contains_key(name) {
            return None;
        }
        let parent = Some(parent.unwrap_or(Self::OBJECT));
        Some(self.register(name, parent, TypeFlags::REFERENCE))
    }

    /// Get or intern the array-of-`element` type.
    pub fn array_of(&mut self, element: TypeId) -> TypeId {
        if let Some(&id) = self.array_types.get(&element) {
            return id;
        }
        let name = format!("[]{}", self.get(element).name);
        let id = TypeId(self.types.len() as u32);
        self.types.push(TypeInfo {
            name: name.clone(),
            id,
            parent: None,
            fields: Vec::new(),
            methods: Vec::new(),
            flags: TypeFlags::ARRAY | TypeFlags::REFERENCE,
            element_type: Some(element),
        });
        self.by_name.insert(name, id);
        self.array_types.insert(element, id);
        id
    }

    /// Read-only lookup of an already-interned array type. The lowering
    /// pass interns every array type a program mentions, so the runtime
    /// never needs to mutate the store.
    pub fn array_type_of(&self, element: TypeId) -> Option<TypeId> {
        self.array_types.get(&element).copied()
    }

    #[inline]
    pub fn get(&self, id: TypeId) -> &TypeInfo {
        &self.types[id.0 as usize]
    }

    pub fn get_mut(&mut self, id: TypeId) -> &mut TypeInfo {
        &mut self.types[id.0 as usize]
    }

    pub fn lookup(&self, name: &str) -> Option<TypeId> {
        self.by_name.get(name).copied()
    }

    pub fn len(&self) -> usize {
        self.types.len()
    }

    pub fn is_empty(&self) -> bool {
        self.types.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &TypeInfo> {
        self.types.iter()
    }

    /// Append a field to a class under construction.
    /// Returns the field's stable index, or `None` on a duplicate name.
    pub fn add_field(
        &mut self,
        class: TypeId,
        name: &str,
        ty: TypeId,
    ) -> Option<usize> {
        let info = self.get_mut(class);
        if info.field_index(name).is_some() {
            return None;
        }
        info.fields.push(FieldInfo {
            name: name.to_string(),
            ty,
        });
        Some(info.fields.len() - 1)
    }

    /// Register a method on `owner`. Inherited entries are merged later
    /// by [`link_inherited_methods`](Self::link_inherited_methods), so a
    /// signature clash here is always a duplicate definition: returns
    /// `None`. On success returns the method's slot in `owner`'s own
    /// table.
    pub fn add_method(
        &mut self,
        owner: TypeId,
        name: &str,
        params: Vec<TypeId>,
        ret: TypeId,
        function: FunctionId,
    ) -> Option<usize> {
        let info = self.get_mut(owner);
        if info.methods.iter().any(|m| m.matches(name, &params)) {
            return None;
        }
        info.methods.push(MethodInfo {
            name: name.to_string(),
            params,
            ret,
            function,
        });
        Some(info.methods.len() - 1)
    }

    /// Copy each parent's vtable into its children, parent entries first,
    /// so inherited methods keep their slots and overrides replace them.
    ///
    /// `declared` must list class ids in declaration order (parents are
    /// declared before children in a well-formed program).
    pub fn link_inherited_methods(&mut self, declared: &[TypeId]) {
        for &id in declared {
            let Some(parent) = self.get(id).parent else {
                continue;
            };
            let parent_methods = self.get(parent).methods.clone();
            let own = std::mem::take(&mut self.get_mut(id).methods);
            let mut linked = parent_methods;
            for method in own {
                if let Some(slot) = linked
                    .iter()
                    .position(|m| m.matches(&method.name, &method.params))
                {
                    linked[slot] = method;
                } else {
                    linked.push(method);
                }
            }
            self.get_mut(id).methods = linked;
        }
    }

    /// Exact-signature method lookup on `owner`, then up the parent chain.
    /// Returns the vtable slot and entry.
    pub fn find_method(
        &self,
        owner: TypeId,
        name: &str,
        args: &[TypeId],
    ) -> Option<(usize, &MethodInfo)> {
        let mut current = Some(owner);
        while let Some(id) = current {
            let info = self.get(id);
            if let Some(slot) =
                info.methods.iter().position(|m| m.matches(name, args))
            {
                return Some((slot, &info.methods[slot]));
            }
            current = info.parent;
        }
        None
    }

    /// Whether `sub` is `sup` or a nominal subtype of it.
    pub fn is_subtype(&self, sub: TypeId, sup: TypeId) -> bool {
        self.subtype_distance(sub, sup).is_some()
    }

    /// Number of parent-chain steps from `sub` up to `sup`: 0 when the
    /// types are equal, `None` when `sup` is not an ancestor. Overload
    /// resolution ranks candidates by this distance.
    pub fn subtype_distance(&self, sub: TypeId, sup: TypeId) -> Option<u32> {
        let mut current = Some(sub);
        let mut distance = 0;
        while let Some(id) = current {
            if id == sup {
                return Some(distance);
            }
            current = self.get(id).parent;
            distance += 1;
        }
        None
    }
}

impl Default for TypeStore {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn builtins_are_registered() {
        let store = TypeStore::new();
        assert_eq!(store.lookup("int"), Some(TypeStore::INT));
        assert_eq!(store.lookup("double"), Some(TypeStore::DOUBLE));
        assert_eq!(store.lookup("string"), Some(TypeStore::STRING));
        assert!(store.get(TypeStore::INT).is_primitive());
        assert!(store.get(TypeStore::STRING).is_reference());
    }

    #[test]
    fn string_layout() {
        let store = TypeStore::new();
        let string = store.get(TypeStore::STRING);
        assert_eq!(
            string.field_index("length"),
            Some(TypeStore::STRING_LENGTH_FIELD)
        );
        assert_eq!(
            string.field_index(".intern_data"),
            Some(TypeStore::STRING_INTERN_FIELD)
        );
    }

    #[test]
    fn array_types_are_interned() {
        let mut store = TypeStore::new();
        let a = store.array_of(TypeStore::INT);
        let b = store.array_of(TypeStore::INT);
        assert_eq!(a, b);
        assert_eq!(store.get(a).name, "[]int");
        assert_eq!(store.get(a).element_type, Some(TypeStore::INT));
        let nested = store.array_of(a);
        assert_eq!(store.get(nested).name, "[][]int");
    }

    #[test]
    fn duplicate_class_rejected() {
        let mut store = TypeStore::new();
        assert!(store.declare_class("Point", None).is_some());
        assert!(store.declare_class("Point", None).is_none());
    }

    #[test]
    fn classes_default_parent_is_object() {
        let mut store = TypeStore::new();
        let point = store.declare_class("Point", None).unwrap();
        assert_eq!(store.get(point).parent, Some(TypeStore::OBJECT));
        assert!(store.is_subtype(point, TypeStore::OBJECT));
        assert!(!store.is_subtype(TypeStore::OBJECT, point));
    }

    #[test]
    fn subtype_distance_counts_parent_steps() {
        let mut store = TypeStore::new();
        let animal = store.declare_class("Animal", None).unwrap();
        let dog = store.declare_class("Dog", Some(animal)).unwrap();
        let puppy = store.declare_class("Puppy", Some(dog)).unwrap();

        assert_eq!(store.subtype_distance(puppy, puppy), Some(0));
        assert_eq!(store.subtype_distance(puppy, dog), Some(1));
        assert_eq!(store.subtype_distance(puppy, animal), Some(2));
        assert_eq!(store.subtype_distance(puppy, TypeStore::OBJECT), Some(3));
        assert_eq!(store.subtype_distance(animal, dog), None);
        assert_eq!(store.subtype_distance(TypeStore::INT, animal), None);
    }

    #[test]
    fn field_indices_are_stable() {
        let mut store = TypeStore::new();
        let point = store.declare_class("Point", None).unwrap();
        assert_eq!(store.add_field(point, "x", TypeStore::INT), Some(0));
        assert_eq!(store.add_field(point, "y", TypeStore::INT), Some(1));
        assert_eq!(store.add_field(point, "x", TypeStore::INT), None);
        assert_eq!(store.get(point).field_index("y"), Some(1));
    }

    #[test]
    fn inherited_methods_keep_slots_and_overrides_replace() {
        let mut store = TypeStore::new();
        let base = store.declare_class("Base", None).unwrap();
        let derived = store.declare_class("Derived", Some(base)).unwrap();

        store
            .add_method(base, "area", vec![base], TypeStore::INT, FunctionId(0))
            .unwrap();
        store
            .add_method(base, "name", vec![base], TypeStore::STRING, FunctionId(1))
            .unwrap();
        // Override of `area` on the derived class names itself as the
        // receiver; the vtable slot must not change.
        store
            .add_method(derived, "area", vec![derived], TypeStore::INT, FunctionId(2))
            .unwrap();

        store.link_inherited_methods(&[base, derived]);

        let (slot, entry) = store.find_method(derived, "area", &[derived]).unwrap();
        assert_eq!(slot, 0);
        assert_eq!(entry.function, FunctionId(2));
        let (slot, entry) = store.find_method(derived, "name", &[derived]).unwrap();
        assert_eq!(slot, 1);
        assert_eq!(entry.function, FunctionId(1));
        // The base keeps its own entries.
        let (_, entry) = store.find_method(base, "area", &[base]).unwrap();
        assert_eq!(entry.function, FunctionId(0));
    }

    #[test]
    fn method_lookup_is_exact_on_parameters() {
        let mut store = TypeStore::new();
        let int = TypeStore::INT;
        store
            .add_method(int, "clamp", vec![int, int], int, FunctionId(7))
            .unwrap();
        assert!(store.find_method(int, "clamp", &[int, int]).is_some());
        assert!(store.find_method(int, "clamp", &[int]).is_none());
        assert!(store
            .find_method(int, "clamp", &[int, TypeStore::DOUBLE])
            .is_none());
    }
}
