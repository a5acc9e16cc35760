//! IR → bytecode emission.
//!
//! Walks the typed IR and drives the [`BytecodeBuilder`]: forward
//! branches are emitted as placeholder labels and patched on bind,
//! literals de-duplicate into the constant pool by value equality, and
//! each function opens with an `AllocLocals` prologue. The emitter
//! tracks the stack height it produces; any statement that does not
//! return the stack to its entry height is a stack-discipline bug and
//! aborts translation.

use std::collections::HashMap;

use malang_bytecode::{BytecodeBuilder, Op, SourceMapBuilder};
use malang_object::TypeId;
use malang_parser::{Pos, Span};

use crate::ir::{Ir, IrFunction, IrKind};
use crate::lower::LoweredUnit;
use crate::{
    BoundFunctionMap, CodegenError, Constant, FunctionKind, Program,
};

pub fn generate(
    unit: LoweredUnit,
    source_name: &str,
) -> Result<Program, CodegenError> {
    let LoweredUnit {
        ir,
        types,
        mut functions,
    } = unit;

    let mut cg = Codegen {
        b: BytecodeBuilder::with_capacity(1024),
        constants: Vec::new(),
        const_index: HashMap::new(),
        map: SourceMapBuilder::new(),
        functions: &mut functions,
        height: 0,
    };

    for function in &ir.functions {
        cg.emit_function(function)?;
    }

    let Codegen {
        b,
        constants,
        map,
        ..
    } = cg;

    Ok(Program {
        types,
        functions,
        constants,
        code: b.into_bytes(),
        entry: ir.entry,
        source_map: map.finish(),
        source_name: source_name.to_string(),
    })
}

/// Constant-pool key: doubles dedupe by bit pattern so `-0.0` and `0.0`
/// stay distinct and NaNs intern stably.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
enum ConstKey {
    Fixnum(i32),
    Double(u64),
    Char(char),
    Str(String),
}

struct Codegen<'a> {
    b: BytecodeBuilder,
    constants: Vec<Constant>,
    const_index: HashMap<ConstKey, u16>,
    map: SourceMapBuilder,
    functions: &'a mut BoundFunctionMap,
    height: i32,
}

impl Codegen<'_> {
    fn emit_function(
        &mut self,
        function: &IrFunction,
    ) -> Result<(), CodegenError> {
        let entry = self.b.current_offset();
        self.functions.get_mut(function.id).kind = FunctionKind::Bytecode {
            entry,
            num_locals: function.num_slots,
        };
        self.note_loc(function.loc);
        let extra = function.num_slots - function.arity;
        if extra > 0 {
            self.b.alloc_locals(extra);
        }
        self.height = 0;
        for statement in &function.body {
            self.emit_statement(statement)?;
        }
        // Void functions may fall off the end; non-void bodies were
        // verified to return on every path.
        if function.ret == malang_object::TypeStore::VOID {
            self.b.ret();
        }
        Ok(())
    }

    fn note_loc(&mut self, loc: Pos) {
        self.map
            .add(self.b.current_offset() as u32, loc.line as u32, loc.column as u32);
    }

    fn bump(&mut self, delta: i32) {
        self.height += delta;
    }

    fn simple(&mut self, op: Op) -> Result<(), CodegenError> {
        let delta = op.stack_delta().ok_or_else(|| {
            CodegenError::new(
                "opcode with dynamic stack effect emitted as simple",
                Span::point(Pos::origin()),
            )
        })?;
        self.b.simple(op);
        self.bump(delta as i32);
        Ok(())
    }

    fn discipline(
        &self,
        expected: i32,
        loc: Pos,
    ) -> Result<(), CodegenError> {
        if self.height != expected {
            return Err(CodegenError::new(
                format!(
                    "stack discipline violation: height {} where {} expected",
                    self.height, expected
                ),
                Span::point(loc),
            ));
        }
        Ok(())
    }

    // ── constants ──────────────────────────────────────────────────

    fn intern(
        &mut self,
        key: ConstKey,
        constant: Constant,
        loc: Pos,
    ) -> Result<u16, CodegenError> {
        if let Some(&idx) = self.const_index.get(&key) {
            return Ok(idx);
        }
        let idx = u16::try_from(self.constants.len()).map_err(|_| {
            CodegenError::new("constant pool overflow", Span::point(loc))
        })?;
        self.constants.push(constant);
        self.const_index.insert(key, idx);
        Ok(idx)
    }

    fn load_fixnum(&mut self, value: i32, loc: Pos) -> Result<(), CodegenError> {
        let idx =
            self.intern(ConstKey::Fixnum(value), Constant::Fixnum(value), loc)?;
        self.b.load_const(idx);
        self.bump(1);
        Ok(())
    }

    // ── statements ─────────────────────────────────────────────────

    fn emit_statement(&mut self, ir: &Ir) -> Result<(), CodegenError> {
        let before = self.height;
        self.note_loc(ir.loc);
        match &ir.kind {
            IrKind::StoreLocal { slot, value } => {
                self.emit_expr(value)?;
                self.b.store_local(*slot);
                self.bump(-1);
            }
            IrKind::StoreField {
                object,
                index,
                value,
            } => {
                self.emit_expr(object)?;
                self.emit_expr(value)?;
                self.note_loc(ir.loc);
                self.b.store_field(*index);
                self.bump(-2);
            }
            IrKind::StoreIndex { base, index, value } => {
                self.emit_expr(base)?;
                self.emit_expr(index)?;
                self.emit_expr(value)?;
                self.note_loc(ir.loc);
                self.b.store_index();
                self.bump(-3);
            }
            IrKind::If {
                condition,
                consequence,
                alternative,
            } => {
                self.emit_expr(condition)?;
                let to_else = self.b.branch_if_false();
                self.bump(-1);
                for statement in consequence {
                    self.emit_statement(statement)?;
                }
                if alternative.is_empty() {
                    self.b.bind(to_else);
                } else {
                    let to_end = self.b.branch();
                    self.b.bind(to_else);
                    for statement in alternative {
                        self.emit_statement(statement)?;
                    }
                    self.b.bind(to_end);
                }
            }
            IrKind::While { condition, body } => {
                let top = self.b.current_offset();
                self.emit_expr(condition)?;
                let to_end = self.b.branch_if_false();
                self.bump(-1);
                for statement in body {
                    self.emit_statement(statement)?;
                }
                self.b.branch_back(top);
                self.b.bind(to_end);
            }
            IrKind::Return { value } => {
                if let Some(value) = value {
                    self.emit_expr(value)?;
                    self.discipline(before + 1, ir.loc)?;
                    self.bump(-1);
                }
                self.b.ret();
            }
            IrKind::Discard { value, count } => {
                self.emit_expr(value)?;
                match count {
                    0 => {}
                    1 => {
                        self.b.drop_top();
                        self.bump(-1);
                    }
                    n => {
                        self.b.drop_n(*n);
                        self.bump(-(*n as i32));
                    }
                }
            }
            IrKind::Breakpoint => {
                self.simple(Op::Breakpoint)?;
            }
            // Void expressions (calls, mostly) stand as statements on
            // their own; the discipline check below proves they leave
            // the stack untouched.
            _ => {
                self.emit_expr(ir)?;
            }
        }
        self.discipline(before, ir.loc)
    }

    // ── expressions ────────────────────────────────────────────────

    fn emit_expr(&mut self, ir: &Ir) -> Result<(), CodegenError> {
        match &ir.kind {
            IrKind::ConstFixnum(value) => self.load_fixnum(*value, ir.loc)?,
            IrKind::ConstDouble(value) => {
                let idx = self.intern(
                    ConstKey::Double(value.to_bits()),
                    Constant::Double(*value),
                    ir.loc,
                )?;
                self.b.load_const(idx);
                self.bump(1);
            }
            IrKind::ConstChar(value) => {
                let idx = self.intern(
                    ConstKey::Char(*value),
                    Constant::Char(*value),
                    ir.loc,
                )?;
                self.b.load_const(idx);
                self.bump(1);
            }
            IrKind::ConstString(value) => {
                let idx = self.intern(
                    ConstKey::Str(value.clone()),
                    Constant::Str(value.clone()),
                    ir.loc,
                )?;
                self.b.load_const(idx);
                self.bump(1);
            }
            IrKind::ConstBool(value) => {
                if *value {
                    self.b.load_true();
                } else {
                    self.b.load_false();
                }
                self.bump(1);
            }
            IrKind::Nothing => {
                self.b.load_nothing();
                self.bump(1);
            }
            IrKind::LoadLocal(slot) => {
                self.b.load_local(*slot);
                self.bump(1);
            }
            IrKind::Binary { op, lhs, rhs } => {
                self.emit_expr(lhs)?;
                self.emit_expr(rhs)?;
                if matches!(*op, Op::IDiv | Op::IMod) {
                    self.note_loc(ir.loc);
                }
                self.simple(*op)?;
            }
            IrKind::Unary { op, operand } => {
                self.emit_expr(operand)?;
                self.simple(*op)?;
            }
            IrKind::LogicalAnd { lhs, rhs } => {
                self.emit_expr(lhs)?;
                self.b.dup();
                self.bump(1);
                let done = self.b.branch_if_false();
                self.bump(-1);
                self.b.drop_top();
                self.bump(-1);
                self.emit_expr(rhs)?;
                self.b.bind(done);
            }
            IrKind::LogicalOr { lhs, rhs } => {
                self.emit_expr(lhs)?;
                self.b.dup();
                self.bump(1);
                let done = self.b.branch_if_true();
                self.bump(-1);
                self.b.drop_top();
                self.bump(-1);
                self.emit_expr(rhs)?;
                self.b.bind(done);
            }
            IrKind::Call { id, args } => {
                for arg in args {
                    self.emit_expr(arg)?;
                }
                self.note_loc(ir.loc);
                self.b.call(self.function_operand(*id, ir.loc)?);
                self.bump(self.call_delta(args.len(), ir.ty));
            }
            IrKind::CallMethod { id, args } => {
                for arg in args {
                    self.emit_expr(arg)?;
                }
                self.note_loc(ir.loc);
                self.b.call_method(self.function_operand(*id, ir.loc)?);
                self.bump(self.call_delta(args.len(), ir.ty));
            }
            IrKind::CallVirtual { slot, args } => {
                for arg in args {
                    self.emit_expr(arg)?;
                }
                self.note_loc(ir.loc);
                let argc = u8::try_from(args.len()).map_err(|_| {
                    CodegenError::new(
                        "too many arguments",
                        Span::point(ir.loc),
                    )
                })?;
                self.b.call_virtual(*slot, argc);
                self.bump(self.call_delta(args.len(), ir.ty));
            }
            IrKind::CallNative { id, args } => {
                for arg in args {
                    self.emit_expr(arg)?;
                }
                self.note_loc(ir.loc);
                self.b.call_native(self.function_operand(*id, ir.loc)?);
                self.bump(self.call_delta(args.len(), ir.ty));
            }
            IrKind::Construct {
                type_id,
                init,
                args,
            } => {
                self.note_loc(ir.loc);
                self.b.alloc_object(self.type_operand(*type_id, ir.loc)?);
                self.bump(1);
                if let Some(init) = init {
                    self.b.dup();
                    self.bump(1);
                    for arg in args {
                        self.emit_expr(arg)?;
                    }
                    self.b.call_method(self.function_operand(*init, ir.loc)?);
                    // init is void and consumes receiver + args.
                    self.bump(-(args.len() as i32 + 1));
                }
            }
            IrKind::LoadField { object, index } => {
                self.emit_expr(object)?;
                self.note_loc(ir.loc);
                self.b.load_field(*index);
            }
            IrKind::AllocArray { element, length } => {
                self.emit_expr(length)?;
                self.note_loc(ir.loc);
                self.b.alloc_array(self.type_operand(*element, ir.loc)?);
            }
            IrKind::ArrayLit { element, elements } => {
                self.load_fixnum(elements.len() as i32, ir.loc)?;
                self.b.alloc_array(self.type_operand(*element, ir.loc)?);
                for (index, element_ir) in elements.iter().enumerate() {
                    self.b.dup();
                    self.bump(1);
                    self.load_fixnum(index as i32, element_ir.loc)?;
                    self.emit_expr(element_ir)?;
                    self.b.store_index();
                    self.bump(-3);
                }
            }
            IrKind::LoadIndex { base, index } => {
                self.emit_expr(base)?;
                self.emit_expr(index)?;
                self.note_loc(ir.loc);
                self.b.load_index();
                self.bump(-1);
            }
            IrKind::ArrayLen { base } => {
                self.emit_expr(base)?;
                self.b.array_len();
            }
            IrKind::DeallocObject { object } => {
                self.emit_expr(object)?;
                self.b.dealloc_object();
                self.bump(-1);
            }
            _ => {
                return Err(CodegenError::new(
                    "statement used where a value is required",
                    Span::point(ir.loc),
                ));
            }
        }
        Ok(())
    }

    fn call_delta(&self, argc: usize, ret: TypeId) -> i32 {
        let pushes = i32::from(ret != malang_object::TypeStore::VOID);
        pushes - argc as i32
    }

    fn function_operand(
        &self,
        id: malang_object::FunctionId,
        loc: Pos,
    ) -> Result<u16, CodegenError> {
        u16::try_from(id.0).map_err(|_| {
            CodegenError::new("too many bound functions", Span::point(loc))
        })
    }

    fn type_operand(
        &self,
        id: TypeId,
        loc: Pos,
    ) -> Result<u16, CodegenError> {
        u16::try_from(id.0).map_err(|_| {
            CodegenError::new("too many types", Span::point(loc))
        })
    }
}
