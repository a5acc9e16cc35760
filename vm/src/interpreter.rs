//! The fetch-decode-dispatch loop.
//!
//! Arithmetic opcodes are type-specialized: codegen only emits them for
//! operands it proved, so accessors go through the unchecked (debug
//! asserted) `Value` conversions and a mis-tagged value is a fatal
//! inconsistency, not a user error. The only GC safepoints are the
//! allocation opcodes; no other instruction can observe a collection.

use malang_bytecode::{decode_at, Instruction};
use malang_object::{FunctionId, ObjectTag, TypeId, TypeStore, Value};

use crate::{Frame, FunctionKind, Trap, TrapKind, Vm, MAX_FRAMES};

/// Execute the program's entry function to completion.
pub fn run(vm: &mut Vm) -> Result<Value, Trap> {
    let entry = vm.program.entry;
    call_function(vm, entry)?;

    while !vm.frames.is_empty() {
        vm.current_pc = vm.pc;
        let (instr, next_pc) = decode_at(&vm.program.code, vm.pc);
        vm.pc = next_pc;
        if vm.breaking {
            tracing::trace!(target: "interpreter", pc = vm.current_pc, depth = vm.frames.len(), "{instr}");
        }
        step(vm, instr)?;
    }

    let ret = vm.program.functions.get(entry).ret;
    if ret == TypeStore::VOID {
        Ok(Value::nothing())
    } else {
        vm.pop_data()
    }
}

fn step(vm: &mut Vm, instr: Instruction) -> Result<(), Trap> {
    match instr {
        // ── constants / loads ──────────────────────────────────────
        Instruction::LoadConst { idx } => {
            let value = match vm.constants.get(idx as usize) {
                Some(&value) => value,
                None => {
                    return Err(
                        vm.trap(TrapKind::Inconsistency("bad constant index"))
                    )
                }
            };
            vm.push_data(value)?;
        }
        Instruction::LoadTrue => vm.push_data(Value::from_boolean(true))?,
        Instruction::LoadFalse => vm.push_data(Value::from_boolean(false))?,
        Instruction::LoadNothing => vm.push_data(Value::nothing())?,

        // ── locals ─────────────────────────────────────────────────
        Instruction::LoadLocal { slot } => {
            let base = current_locals_base(vm)?;
            let value = match vm.locals.get(base + slot as usize) {
                Some(&value) => value,
                None => {
                    return Err(
                        vm.trap(TrapKind::Inconsistency("bad local slot"))
                    )
                }
            };
            vm.push_data(value)?;
        }
        Instruction::StoreLocal { slot } => {
            let value = vm.pop_data()?;
            let base = current_locals_base(vm)?;
            match vm.locals.get_mut(base + slot as usize) {
                Some(target) => *target = value,
                None => {
                    return Err(
                        vm.trap(TrapKind::Inconsistency("bad local slot"))
                    )
                }
            }
        }
        Instruction::AllocLocals { count } => {
            vm.locals
                .extend(std::iter::repeat(Value::nothing()).take(count as usize));
        }

        // ── stack ──────────────────────────────────────────────────
        Instruction::Dup => {
            let top = match vm.data.last() {
                Some(&top) => top,
                None => {
                    return Err(vm
                        .trap(TrapKind::Inconsistency("data stack underflow")))
                }
            };
            vm.push_data(top)?;
        }
        Instruction::Drop => {
            vm.pop_data()?;
        }
        Instruction::DropN { count } => {
            for _ in 0..count {
                vm.pop_data()?;
            }
        }

        // ── integer arithmetic ─────────────────────────────────────
        Instruction::IAdd => int_binary(vm, i32::wrapping_add)?,
        Instruction::ISub => int_binary(vm, i32::wrapping_sub)?,
        Instruction::IMul => int_binary(vm, i32::wrapping_mul)?,
        Instruction::IDiv => {
            let (a, b) = pop_int_pair(vm)?;
            if b == 0 {
                return Err(vm.trap(TrapKind::DivisionByZero));
            }
            vm.push_data(Value::from_fixnum(a.wrapping_div(b)))?;
        }
        Instruction::IMod => {
            let (a, b) = pop_int_pair(vm)?;
            if b == 0 {
                return Err(vm.trap(TrapKind::DivisionByZero));
            }
            vm.push_data(Value::from_fixnum(a.wrapping_rem(b)))?;
        }
        Instruction::IShl => {
            int_binary(vm, |a, b| a.wrapping_shl(b as u32))?
        }
        Instruction::IShr => {
            int_binary(vm, |a, b| a.wrapping_shr(b as u32))?
        }
        Instruction::IAnd => int_binary(vm, |a, b| a & b)?,
        Instruction::IOr => int_binary(vm, |a, b| a | b)?,
        Instruction::IXor => int_binary(vm, |a, b| a ^ b)?,
        Instruction::IEq => int_compare(vm, |a, b| a == b)?,
        Instruction::INe => int_compare(vm, |a, b| a != b)?,
        Instruction::ILt => int_compare(vm, |a, b| a < b)?,
        Instruction::ILe => int_compare(vm, |a, b| a <= b)?,
        Instruction::IGt => int_compare(vm, |a, b| a > b)?,
        Instruction::IGe => int_compare(vm, |a, b| a >= b)?,
        Instruction::INeg => {
            let value = vm.pop_data()?;
            // SAFETY: codegen emits INeg for int operands only.
            let n = unsafe { value.as_fixnum() };
            vm.push_data(Value::from_fixnum(n.wrapping_neg()))?;
        }
        Instruction::IInvert => {
            let value = vm.pop_data()?;
            // SAFETY: codegen emits IInvert for int operands only.
            let n = unsafe { value.as_fixnum() };
            vm.push_data(Value::from_fixnum(!n))?;
        }
        Instruction::Not => {
            let value = vm.pop_data()?;
            // SAFETY: codegen emits Not for bool operands only.
            let b = unsafe { value.as_boolean() };
            vm.push_data(Value::from_boolean(!b))?;
        }

        // ── double arithmetic ──────────────────────────────────────
        Instruction::DAdd => double_binary(vm, |a, b| a + b)?,
        Instruction::DSub => double_binary(vm, |a, b| a - b)?,
        Instruction::DMul => double_binary(vm, |a, b| a * b)?,
        Instruction::DDiv => double_binary(vm, |a, b| a / b)?,
        Instruction::DMod => double_binary(vm, |a, b| a % b)?,
        Instruction::DEq => double_compare(vm, |a, b| a == b)?,
        Instruction::DNe => double_compare(vm, |a, b| a != b)?,
        Instruction::DLt => double_compare(vm, |a, b| a < b)?,
        Instruction::DLe => double_compare(vm, |a, b| a <= b)?,
        Instruction::DGt => double_compare(vm, |a, b| a > b)?,
        Instruction::DGe => double_compare(vm, |a, b| a >= b)?,
        Instruction::DNeg => {
            let value = vm.pop_data()?;
            // SAFETY: codegen emits DNeg for double operands only.
            let d = unsafe { value.as_double() };
            vm.push_data(Value::from_double(-d))?;
        }

        // ── control ────────────────────────────────────────────────
        Instruction::Branch { offset } => {
            vm.pc = (vm.pc as i64 + offset as i64) as usize;
        }
        Instruction::BranchIfTrue { offset } => {
            let value = vm.pop_data()?;
            // SAFETY: codegen emits conditional branches for bools only.
            if unsafe { value.as_boolean() } {
                vm.pc = (vm.pc as i64 + offset as i64) as usize;
            }
        }
        Instruction::BranchIfFalse { offset } => {
            let value = vm.pop_data()?;
            // SAFETY: codegen emits conditional branches for bools only.
            if !unsafe { value.as_boolean() } {
                vm.pc = (vm.pc as i64 + offset as i64) as usize;
            }
        }
        Instruction::Return => {
            let frame = match vm.frames.pop() {
                Some(frame) => frame,
                None => {
                    return Err(
                        vm.trap(TrapKind::Inconsistency("return without frame"))
                    )
                }
            };
            // A non-void result is already on the data stack, above
            // anything the caller had pushed.
            vm.locals.truncate(frame.locals_base);
            vm.pc = frame.return_pc;
        }

        // ── calls ──────────────────────────────────────────────────
        Instruction::Call { id } => {
            call_function(vm, FunctionId(id as u32))?;
        }
        Instruction::CallMethod { id } => {
            call_function(vm, FunctionId(id as u32))?;
        }
        Instruction::CallVirtual { slot, argc } => {
            let receiver_at = match vm.data.len().checked_sub(argc as usize) {
                Some(idx) => idx,
                None => {
                    return Err(vm
                        .trap(TrapKind::Inconsistency("data stack underflow")))
                }
            };
            let receiver = vm.data[receiver_at];
            if receiver.is_nothing() {
                return Err(vm.trap(TrapKind::NullReceiver));
            }
            if !receiver.is_object() {
                return Err(vm.trap(TrapKind::Inconsistency(
                    "virtual dispatch on a non-object",
                )));
            }
            // SAFETY: tag checked above.
            let type_id = unsafe { receiver.as_object() }.type_id();
            let target = vm
                .program
                .types
                .get(type_id)
                .methods
                .get(slot as usize)
                .map(|m| m.function);
            match target {
                Some(function) => call_function(vm, function)?,
                None => {
                    return Err(
                        vm.trap(TrapKind::Inconsistency("bad vtable slot"))
                    )
                }
            }
        }
        Instruction::CallNative { id } => {
            call_function(vm, FunctionId(id as u32))?;
        }

        // ── objects ────────────────────────────────────────────────
        Instruction::AllocObject { type_id } => {
            let type_id = TypeId(type_id as u32);
            let defaults: Vec<Value> = vm
                .program
                .types
                .get(type_id)
                .fields
                .iter()
                .map(|field| default_for(field.ty))
                .collect();
            let obj = vm.alloc_plain(type_id);
            for (index, value) in defaults.into_iter().enumerate() {
                obj.set_field(index, value);
            }
            vm.push_data(Value::from_object(obj))?;
        }
        Instruction::DeallocObject => {
            // Advisory: dropping the reference is all it takes; sweep
            // reclaims the object once it is unreachable.
            vm.pop_data()?;
        }
        Instruction::LoadField { index } => {
            let obj = pop_object(vm)?;
            match obj.field(index as usize) {
                Some(value) => vm.push_data(value)?,
                None => {
                    return Err(vm.trap(TrapKind::FieldOutOfBounds {
                        index: index as usize,
                        count: obj.num_fields(),
                    }))
                }
            }
        }
        Instruction::StoreField { index } => {
            let value = vm.pop_data()?;
            let obj = pop_object(vm)?;
            if !obj.set_field(index as usize, value) {
                return Err(vm.trap(TrapKind::FieldOutOfBounds {
                    index: index as usize,
                    count: obj.num_fields(),
                }));
            }
        }
        Instruction::AllocArray { elem_type_id } => {
            let length = vm.pop_data()?;
            // SAFETY: codegen type-checks array lengths to ints.
            let length = unsafe { length.as_fixnum() };
            if length < 0 {
                return Err(vm.trap(TrapKind::InvalidArrayLength {
                    length: length as i64,
                }));
            }
            let element = TypeId(elem_type_id as u32);
            let array_type = match vm.program.types.array_type_of(element) {
                Some(id) => id,
                None => {
                    return Err(vm
                        .trap(TrapKind::Inconsistency("unknown array type")))
                }
            };
            let fill = default_for(element);
            let obj =
                vm.alloc_array(array_type, element, length as usize, fill);
            vm.push_data(Value::from_object(obj))?;
        }
        Instruction::LoadIndex => {
            let index = vm.pop_data()?;
            let base = pop_object(vm)?;
            // SAFETY: codegen type-checks indexes to ints.
            let index = unsafe { index.as_fixnum() } as i64;
            let length = base.array_len();
            if index < 0 || index as usize >= length {
                return Err(
                    vm.trap(TrapKind::IndexOutOfBounds { index, length })
                );
            }
            let value = match base.tag() {
                ObjectTag::Array => base.element(index as usize),
                ObjectTag::Buffer => base
                    .buffer_byte(index as usize)
                    .map(|byte| Value::from_fixnum(byte as i32)),
                _ => None,
            };
            match value {
                Some(value) => vm.push_data(value)?,
                None => {
                    return Err(vm
                        .trap(TrapKind::Inconsistency("indexed a plain object")))
                }
            }
        }
        Instruction::StoreIndex => {
            let value = vm.pop_data()?;
            let index = vm.pop_data()?;
            let base = pop_object(vm)?;
            // SAFETY: codegen type-checks indexes to ints.
            let index = unsafe { index.as_fixnum() } as i64;
            let length = base.array_len();
            if index < 0 || index as usize >= length {
                return Err(
                    vm.trap(TrapKind::IndexOutOfBounds { index, length })
                );
            }
            let stored = match base.tag() {
                ObjectTag::Array => base.set_element(index as usize, value),
                ObjectTag::Buffer => {
                    // SAFETY: codegen type-checks buffer stores to ints.
                    let byte = unsafe { value.as_fixnum() };
                    base.set_buffer_byte(index as usize, (byte & 0xff) as u8)
                }
                _ => false,
            };
            if !stored {
                return Err(vm
                    .trap(TrapKind::Inconsistency("indexed a plain object")));
            }
        }
        Instruction::ArrayLen => {
            let base = pop_object(vm)?;
            if !matches!(base.tag(), ObjectTag::Array | ObjectTag::Buffer) {
                return Err(
                    vm.trap(TrapKind::Inconsistency("length of a plain object"))
                );
            }
            vm.push_data(Value::from_fixnum(base.array_len() as i32))?;
        }

        // ── debug ──────────────────────────────────────────────────
        Instruction::Breakpoint => {
            vm.breaking = true;
            tracing::debug!(target: "interpreter", pc = vm.current_pc, "breakpoint");
        }
    }
    Ok(())
}

/// Invoke a bound function: a native thunk runs in place; a bytecode
/// callee gets a frame whose bottom `arity` locals are the arguments
/// already sitting on the data stack.
pub(crate) fn call_function(vm: &mut Vm, id: FunctionId) -> Result<(), Trap> {
    let (kind, arity) = {
        let function = vm.program.functions.get(id);
        (function.kind, function.arity())
    };
    match kind {
        FunctionKind::Native { native, .. } => native(vm),
        FunctionKind::Bytecode { entry, num_locals } => {
            if vm.frames.len() >= MAX_FRAMES {
                return Err(vm.trap(TrapKind::CallDepthExceeded));
            }
            let split = match vm.data.len().checked_sub(arity) {
                Some(split) => split,
                None => {
                    return Err(vm
                        .trap(TrapKind::Inconsistency("data stack underflow")))
                }
            };
            debug_assert!(num_locals as usize >= arity);
            let locals_base = vm.locals.len();
            vm.locals.extend(vm.data.drain(split..));
            vm.frames.push(Frame {
                return_pc: vm.pc,
                locals_base,
                num_locals,
                function: id,
            });
            vm.pc = entry;
            Ok(())
        }
    }
}

fn current_locals_base(vm: &Vm) -> Result<usize, Trap> {
    match vm.frames.last() {
        Some(frame) => Ok(frame.locals_base),
        None => Err(vm.trap(TrapKind::Inconsistency("no active frame"))),
    }
}

fn pop_object(vm: &mut Vm) -> Result<malang_object::GcRef, Trap> {
    let value = vm.pop_data()?;
    if value.is_nothing() {
        return Err(vm.trap(TrapKind::NullReceiver));
    }
    if !value.is_object() {
        return Err(vm.trap(TrapKind::Inconsistency("expected an object")));
    }
    // SAFETY: tag checked above.
    Ok(unsafe { value.as_object() })
}

fn pop_int_pair(vm: &mut Vm) -> Result<(i32, i32), Trap> {
    let b = vm.pop_data()?;
    let a = vm.pop_data()?;
    // SAFETY: integer opcodes are only emitted for int operands.
    Ok(unsafe { (a.as_fixnum(), b.as_fixnum()) })
}

fn int_binary(vm: &mut Vm, f: impl Fn(i32, i32) -> i32) -> Result<(), Trap> {
    let (a, b) = pop_int_pair(vm)?;
    vm.push_data(Value::from_fixnum(f(a, b)))
}

fn int_compare(vm: &mut Vm, f: impl Fn(i32, i32) -> bool) -> Result<(), Trap> {
    let (a, b) = pop_int_pair(vm)?;
    vm.push_data(Value::from_boolean(f(a, b)))
}

fn pop_double_pair(vm: &mut Vm) -> Result<(f64, f64), Trap> {
    let b = vm.pop_data()?;
    let a = vm.pop_data()?;
    // SAFETY: double opcodes are only emitted for double operands.
    Ok(unsafe { (a.as_double(), b.as_double()) })
}

fn double_binary(vm: &mut Vm, f: impl Fn(f64, f64) -> f64) -> Result<(), Trap> {
    let (a, b) = pop_double_pair(vm)?;
    vm.push_data(Value::from_double(f(a, b)))
}

fn double_compare(
    vm: &mut Vm,
    f: impl Fn(f64, f64) -> bool,
) -> Result<(), Trap> {
    let (a, b) = pop_double_pair(vm)?;
    vm.push_data(Value::from_boolean(f(a, b)))
}

fn default_for(ty: TypeId) -> Value {
    if ty == TypeStore::INT {
        Value::from_fixnum(0)
    } else if ty == TypeStore::DOUBLE {
        Value::from_double(0.0)
    } else if ty == TypeStore::BOOL {
        Value::from_boolean(false)
    } else if ty == TypeStore::CHAR {
        Value::from_char('\0')
    } else {
        Value::nothing()
    }
}
