//! Native functions and their registration.
//!
//! Natives receive the VM handle, consume their arguments from the data
//! stack in reverse declaration order, and push at most one result.
//! Registration order is fixed: a native's position in this order is
//! its stable id in persisted images.

use malang_object::{TypeId, TypeStore, Value};

use crate::{
    BoundFunctionMap, FunctionKind, NativeFn, Trap, TrapKind, Vm,
};

/// Register a native of the given signature. Returns `false` when a
/// callable with the same name and parameter list already exists.
pub fn make_builtin(
    functions: &mut BoundFunctionMap,
    name: &str,
    native: NativeFn,
    params: Vec<TypeId>,
    ret: TypeId,
) -> bool {
    let native_id = next_native_id(functions);
    functions
        .add(name, params, ret, FunctionKind::Native { native, native_id })
        .is_some()
}

/// Register a binary operator method `owner <token> rhs -> ret` backed
/// by a native.
fn add_bin_op_method(
    functions: &mut BoundFunctionMap,
    types: &mut TypeStore,
    owner: TypeId,
    token: &str,
    rhs: TypeId,
    ret: TypeId,
    native: NativeFn,
) {
    let native_id = next_native_id(functions);
    let id = functions
        .add(
            token,
            vec![owner, rhs],
            ret,
            FunctionKind::Native { native, native_id },
        )
        .expect("operator registered twice");
    types
        .add_method(owner, token, vec![owner, rhs], ret, id)
        .expect("operator registered twice");
}

fn next_native_id(functions: &BoundFunctionMap) -> u32 {
    functions.iter().filter(|f| f.is_native()).count() as u32
}

/// Install every builtin. Called once before user code is declared, so
/// native ids and function ids stay deterministic.
pub fn register_all(functions: &mut BoundFunctionMap, types: &mut TypeStore) {
    let int = TypeStore::INT;
    let double = TypeStore::DOUBLE;
    let boolean = TypeStore::BOOL;
    let void = TypeStore::VOID;

    make_builtin(functions, "println", println_int, vec![int], void);
    make_builtin(functions, "println", println_bool, vec![boolean], void);
    make_builtin(functions, "println", println_double, vec![double], void);
    make_builtin(
        functions,
        "println",
        println_char,
        vec![TypeStore::CHAR],
        void,
    );
    make_builtin(
        functions,
        "println",
        println_string,
        vec![TypeStore::STRING],
        void,
    );
    make_builtin(
        functions,
        "println",
        println_object,
        vec![TypeStore::OBJECT],
        void,
    );
    make_builtin(
        functions,
        "println",
        println_buffer,
        vec![TypeStore::BUFFER],
        void,
    );

    make_builtin(functions, "stack_trace", stack_trace, vec![], void);
    make_builtin(functions, "gc_pause", gc_pause, vec![], void);
    make_builtin(functions, "gc_resume", gc_resume, vec![], void);
    make_builtin(functions, "gc_run", gc_run, vec![], void);
    make_builtin(
        functions,
        "buffer",
        make_buffer,
        vec![int],
        TypeStore::BUFFER,
    );

    // Mixed-operand arithmetic is method dispatch, not specialized
    // opcodes; both orientations promote the int to a double.
    add_bin_op_method(functions, types, double, "+", int, double, di_add);
    add_bin_op_method(functions, types, double, "-", int, double, di_sub);
    add_bin_op_method(functions, types, double, "*", int, double, di_mul);
    add_bin_op_method(functions, types, double, "/", int, double, di_div);
    add_bin_op_method(functions, types, double, "%", int, double, di_mod);
    add_bin_op_method(functions, types, double, "<", int, boolean, di_less);
    add_bin_op_method(functions, types, double, ">", int, boolean, di_greater);
    add_bin_op_method(functions, types, double, "<=", int, boolean, di_less_eq);
    add_bin_op_method(
        functions, types, double, ">=", int, boolean, di_greater_eq,
    );
    add_bin_op_method(functions, types, double, "==", int, boolean, di_eql);
    add_bin_op_method(functions, types, double, "!=", int, boolean, di_neql);

    add_bin_op_method(functions, types, int, "+", double, double, id_add);
    add_bin_op_method(functions, types, int, "-", double, double, id_sub);
    add_bin_op_method(functions, types, int, "*", double, double, id_mul);
    add_bin_op_method(functions, types, int, "/", double, double, id_div);
    add_bin_op_method(functions, types, int, "%", double, double, id_mod);
    add_bin_op_method(functions, types, int, "<", double, boolean, id_less);
    add_bin_op_method(functions, types, int, ">", double, boolean, id_greater);
    add_bin_op_method(functions, types, int, "<=", double, boolean, id_less_eq);
    add_bin_op_method(
        functions, types, int, ">=", double, boolean, id_greater_eq,
    );
    add_bin_op_method(functions, types, int, "==", double, boolean, id_eql);
    add_bin_op_method(functions, types, int, "!=", double, boolean, id_neql);
}

/// Resolve a native's fn pointer from its stable id. Used when an image
/// is loaded: the file stores ids, this table re-attaches code.
pub fn native_by_id(id: u32) -> Option<NativeFn> {
    let mut functions = BoundFunctionMap::new();
    let mut types = TypeStore::new();
    register_all(&mut functions, &mut types);
    let result = functions.iter().find_map(|f| match f.kind {
        FunctionKind::Native { native, native_id } if native_id == id => {
            Some(native)
        }
        _ => None,
    });
    result
}

// ── printing ──────────────────────────────────────────────────────────

fn println_int(vm: &mut Vm) -> Result<(), Trap> {
    let value = vm.pop_data()?;
    // SAFETY: signature-checked to int.
    let n = unsafe { value.as_fixnum() };
    vm.write_out(&format!("{n}\n"))
}

fn println_bool(vm: &mut Vm) -> Result<(), Trap> {
    let value = vm.pop_data()?;
    // SAFETY: signature-checked to bool.
    let b = unsafe { value.as_boolean() };
    vm.write_out(if b { "true\n" } else { "false\n" })
}

fn println_double(vm: &mut Vm) -> Result<(), Trap> {
    let value = vm.pop_data()?;
    // SAFETY: signature-checked to double.
    let d = unsafe { value.as_double() };
    vm.write_out(&format!("{d}\n"))
}

fn println_char(vm: &mut Vm) -> Result<(), Trap> {
    let value = vm.pop_data()?;
    // SAFETY: signature-checked to char.
    let c = unsafe { value.as_char() };
    vm.write_out(&format!("{c}\n"))
}

fn println_string(vm: &mut Vm) -> Result<(), Trap> {
    let value = vm.pop_data()?;
    let Some(obj) = value.object() else {
        return Err(vm.trap(TrapKind::NullReceiver));
    };
    let text = vm.gc().string_text(obj).ok_or_else(|| {
        vm.trap(TrapKind::NativeError("malformed string object".to_string()))
    })?;
    vm.write_out(&format!("{text}\n"))
}

fn println_object(vm: &mut Vm) -> Result<(), Trap> {
    let value = vm.pop_data()?;
    let text = match value.object() {
        Some(obj) => vm.program().types.get(obj.type_id()).name.clone(),
        None => "nothing".to_string(),
    };
    vm.write_out(&format!("{text}\n"))
}

fn println_buffer(vm: &mut Vm) -> Result<(), Trap> {
    let value = vm.pop_data()?;
    let Some(obj) = value.object() else {
        return Err(vm.trap(TrapKind::NullReceiver));
    };
    let mut bytes = Vec::with_capacity(obj.array_len());
    for index in 0..obj.array_len() {
        bytes.push(obj.buffer_byte(index).unwrap_or(0));
    }
    let text = String::from_utf8_lossy(&bytes).into_owned();
    vm.write_out(&format!("{text}\n"))
}

// ── runtime controls ──────────────────────────────────────────────────

fn stack_trace(vm: &mut Vm) -> Result<(), Trap> {
    let trace = vm.capture_trace();
    let mut text = String::new();
    for frame in &trace {
        text.push_str(&format!(
            "  at {} ({}:{})",
            frame.function, frame.line, frame.column
        ));
        if !frame.args.is_empty() {
            text.push_str(&format!("  args: [{}]", frame.args.join(", ")));
        }
        text.push('\n');
    }
    vm.write_out(&text)
}

fn gc_pause(vm: &mut Vm) -> Result<(), Trap> {
    vm.gc_mut().disable_automatic();
    Ok(())
}

fn gc_resume(vm: &mut Vm) -> Result<(), Trap> {
    vm.gc_mut().enable_automatic();
    Ok(())
}

fn gc_run(vm: &mut Vm) -> Result<(), Trap> {
    vm.collect_garbage();
    Ok(())
}

fn make_buffer(vm: &mut Vm) -> Result<(), Trap> {
    let value = vm.pop_data()?;
    // SAFETY: signature-checked to int.
    let size = unsafe { value.as_fixnum() };
    if size < 0 {
        return Err(vm.trap(TrapKind::InvalidArrayLength {
            length: size as i64,
        }));
    }
    let obj = vm.alloc_buffer(size as usize);
    vm.push_data(Value::from_object(obj))
}

// ── mixed double/int arithmetic ───────────────────────────────────────

fn double_int_arith(
    vm: &mut Vm,
    f: impl Fn(f64, f64) -> f64,
) -> Result<(), Trap> {
    let b = vm.pop_data()?;
    let a = vm.pop_data()?;
    // SAFETY: signature-checked to (double, int).
    let (a, b) = unsafe { (a.as_double(), b.as_fixnum() as f64) };
    vm.push_data(Value::from_double(f(a, b)))
}

fn double_int_compare(
    vm: &mut Vm,
    f: impl Fn(f64, f64) -> bool,
) -> Result<(), Trap> {
    let b = vm.pop_data()?;
    let a = vm.pop_data()?;
    // SAFETY: signature-checked to (double, int).
    let (a, b) = unsafe { (a.as_double(), b.as_fixnum() as f64) };
    vm.push_data(Value::from_boolean(f(a, b)))
}

fn int_double_arith(
    vm: &mut Vm,
    f: impl Fn(f64, f64) -> f64,
) -> Result<(), Trap> {
    let b = vm.pop_data()?;
    let a = vm.pop_data()?;
    // SAFETY: signature-checked to (int, double).
    let (a, b) = unsafe { (a.as_fixnum() as f64, b.as_double()) };
    vm.push_data(Value::from_double(f(a, b)))
}

fn int_double_compare(
    vm: &mut Vm,
    f: impl Fn(f64, f64) -> bool,
) -> Result<(), Trap> {
    let b = vm.pop_data()?;
    let a = vm.pop_data()?;
    // SAFETY: signature-checked to (int, double).
    let (a, b) = unsafe { (a.as_fixnum() as f64, b.as_double()) };
    vm.push_data(Value::from_boolean(f(a, b)))
}

fn di_add(vm: &mut Vm) -> Result<(), Trap> {
    double_int_arith(vm, |a, b| a + b)
}

fn di_sub(vm: &mut Vm) -> Result<(), Trap> {
    double_int_arith(vm, |a, b| a - b)
}

fn di_mul(vm: &mut Vm) -> Result<(), Trap> {
    double_int_arith(vm, |a, b| a * b)
}

fn di_div(vm: &mut Vm) -> Result<(), Trap> {
    double_int_arith(vm, |a, b| a / b)
}

fn di_mod(vm: &mut Vm) -> Result<(), Trap> {
    double_int_arith(vm, |a, b| a % b)
}

fn di_less(vm: &mut Vm) -> Result<(), Trap> {
    double_int_compare(vm, |a, b| a < b)
}

fn di_greater(vm: &mut Vm) -> Result<(), Trap> {
    double_int_compare(vm, |a, b| a > b)
}

fn di_less_eq(vm: &mut Vm) -> Result<(), Trap> {
    double_int_compare(vm, |a, b| a <= b)
}

fn di_greater_eq(vm: &mut Vm) -> Result<(), Trap> {
    double_int_compare(vm, |a, b| a >= b)
}

fn di_eql(vm: &mut Vm) -> Result<(), Trap> {
    double_int_compare(vm, |a, b| a == b)
}

fn di_neql(vm: &mut Vm) -> Result<(), Trap> {
    double_int_compare(vm, |a, b| a != b)
}

fn id_add(vm: &mut Vm) -> Result<(), Trap> {
    int_double_arith(vm, |a, b| a + b)
}

fn id_sub(vm: &mut Vm) -> Result<(), Trap> {
    int_double_arith(vm, |a, b| a - b)
}

fn id_mul(vm: &mut Vm) -> Result<(), Trap> {
    int_double_arith(vm, |a, b| a * b)
}

fn id_div(vm: &mut Vm) -> Result<(), Trap> {
    int_double_arith(vm, |a, b| a / b)
}

fn id_mod(vm: &mut Vm) -> Result<(), Trap> {
    int_double_arith(vm, |a, b| a % b)
}

fn id_less(vm: &mut Vm) -> Result<(), Trap> {
    int_double_compare(vm, |a, b| a < b)
}

fn id_greater(vm: &mut Vm) -> Result<(), Trap> {
    int_double_compare(vm, |a, b| a > b)
}

fn id_less_eq(vm: &mut Vm) -> Result<(), Trap> {
    int_double_compare(vm, |a, b| a <= b)
}

fn id_greater_eq(vm: &mut Vm) -> Result<(), Trap> {
    int_double_compare(vm, |a, b| a >= b)
}

fn id_eql(vm: &mut Vm) -> Result<(), Trap> {
    int_double_compare(vm, |a, b| a == b)
}

fn id_neql(vm: &mut Vm) -> Result<(), Trap> {
    int_double_compare(vm, |a, b| a != b)
}
