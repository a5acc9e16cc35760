//! The Malang virtual machine: bound functions, the compiled program
//! image, the interpreter, and the compilation pipeline that feeds it.

pub mod builtins;
pub mod codegen;
pub mod image;
pub mod interpreter;
pub mod ir;
pub mod lower;

use std::collections::HashMap;
use std::io::Write;
use std::sync::Arc;

use malang_bytecode::source_map_lookup;
use malang_heap::{Gc, GcConfig, RootProvider};
use malang_object::{
    trace_object, FunctionId, GcRef, ObjectTag, TypeId, TypeStore, Value,
};
use malang_parser::{ParseError, Span};
use parking_lot::Mutex;

/// Hard cap on the data stack; overflow is fatal.
pub const DATA_STACK_MAX: usize = 64 * 1024;
/// Hard cap on call depth.
pub const MAX_FRAMES: usize = 1024;

// ── Errors ────────────────────────────────────────────────────────────

/// A translation-time failure: unresolved symbol, type disagreement,
/// duplicate definition, stack-discipline violation. These are reported
/// with a source location and never reach the interpreter.
#[derive(Debug, Clone, PartialEq)]
pub struct CodegenError {
    pub message: String,
    pub span: Span,
}

impl CodegenError {
    pub fn new(message: impl Into<String>, span: Span) -> Self {
        Self {
            message: message.into(),
            span,
        }
    }
}

impl std::fmt::Display for CodegenError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{} at {}", self.message, self.span)
    }
}

impl std::error::Error for CodegenError {}

#[derive(Debug, Clone, PartialEq)]
pub enum CompileError {
    Parse(ParseError),
    Codegen(CodegenError),
}

impl std::fmt::Display for CompileError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Parse(err) => write!(f, "parse error: {err}"),
            Self::Codegen(err) => write!(f, "error: {err}"),
        }
    }
}

impl std::error::Error for CompileError {}

impl From<ParseError> for CompileError {
    fn from(err: ParseError) -> Self {
        Self::Parse(err)
    }
}

impl From<CodegenError> for CompileError {
    fn from(err: CodegenError) -> Self {
        Self::Codegen(err)
    }
}

// ── Traps ─────────────────────────────────────────────────────────────

/// A fatal runtime error. Unwinds no frames; the VM terminates after
/// capturing a stack trace.
#[derive(Debug, Clone, PartialEq)]
pub struct Trap {
    pub kind: TrapKind,
    pub trace: Vec<TraceFrame>,
}

#[derive(Debug, Clone, PartialEq)]
pub enum TrapKind {
    DivisionByZero,
    IndexOutOfBounds { index: i64, length: usize },
    FieldOutOfBounds { index: usize, count: usize },
    InvalidArrayLength { length: i64 },
    StackOverflow,
    CallDepthExceeded,
    NullReceiver,
    NativeError(String),
    /// A mis-tagged value or malformed id: a codegen bug, not
    /// user-program misbehavior.
    Inconsistency(&'static str),
}

impl std::fmt::Display for TrapKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::DivisionByZero => write!(f, "division by zero"),
            Self::IndexOutOfBounds { index, length } => {
                write!(f, "index {index} out of bounds (length {length})")
            }
            Self::FieldOutOfBounds { index, count } => {
                write!(f, "field {index} out of bounds (object has {count})")
            }
            Self::InvalidArrayLength { length } => {
                write!(f, "invalid array length {length}")
            }
            Self::StackOverflow => write!(f, "data stack overflow"),
            Self::CallDepthExceeded => write!(f, "call stack overflow"),
            Self::NullReceiver => {
                write!(f, "method dispatch on a null receiver")
            }
            Self::NativeError(message) => write!(f, "{message}"),
            Self::Inconsistency(what) => {
                write!(f, "runtime inconsistency: {what}")
            }
        }
    }
}

/// One entry of a captured stack trace: the callee's name, the source
/// position of the executing instruction, and its argument snapshot.
#[derive(Debug, Clone, PartialEq)]
pub struct TraceFrame {
    pub function: String,
    pub line: u32,
    pub column: u32,
    pub args: Vec<String>,
}

impl std::fmt::Display for Trap {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        writeln!(f, "trap: {}", self.kind)?;
        for frame in &self.trace {
            write!(f, "  at {} ({}:{})", frame.function, frame.line, frame.column)?;
            if !frame.args.is_empty() {
                write!(f, "  args: [{}]", frame.args.join(", "))?;
            }
            writeln!(f)?;
        }
        Ok(())
    }
}

impl std::error::Error for Trap {}

// ── Bound functions ───────────────────────────────────────────────────

/// A native thunk. Consumes its arguments from the data stack in
/// reverse declaration order and pushes at most one result; the VM
/// performs no marshaling.
pub type NativeFn = fn(&mut Vm) -> Result<(), Trap>;

#[derive(Clone, Copy)]
pub enum FunctionKind {
    Bytecode {
        /// Offset of the function's first instruction in the code array.
        entry: usize,
        /// Total local slots, parameters included.
        num_locals: u16,
    },
    Native {
        native: NativeFn,
        /// Stable index in registration order; the image format refers
        /// to natives by this id.
        native_id: u32,
    },
}

impl std::fmt::Debug for FunctionKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Bytecode { entry, num_locals } => f
                .debug_struct("Bytecode")
                .field("entry", entry)
                .field("num_locals", num_locals)
                .finish(),
            Self::Native { native_id, .. } => {
                f.debug_struct("Native").field("id", native_id).finish()
            }
        }
    }
}

/// A named, signature-keyed callable.
#[derive(Debug, Clone)]
pub struct BoundFunction {
    pub name: String,
    pub params: Vec<TypeId>,
    pub ret: TypeId,
    pub kind: FunctionKind,
}

impl BoundFunction {
    pub fn arity(&self) -> usize {
        self.params.len()
    }

    pub fn is_native(&self) -> bool {
        matches!(self.kind, FunctionKind::Native { .. })
    }
}

/// Name + signature → callable. Preserves insertion order so the
/// dispatch table layout (and every [`FunctionId`]) is deterministic.
#[derive(Debug, Clone, Default)]
pub struct BoundFunctionMap {
    functions: Vec<BoundFunction>,
    by_name: HashMap<String, Vec<FunctionId>>,
}

impl BoundFunctionMap {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a callable. Returns `None` when a function with the
    /// same name and parameter list already exists.
    pub fn add(
        &mut self,
        name: &str,
        params: Vec<TypeId>,
        ret: TypeId,
        kind: FunctionKind,
    ) -> Option<FunctionId> {
        let ids = self.by_name.entry(name.to_string()).or_default();
        if ids
            .iter()
            .any(|&id| self.functions[id.0 as usize].params == params)
        {
            return None;
        }
        let id = FunctionId(self.functions.len() as u32);
        ids.push(id);
        self.functions.push(BoundFunction {
            name: name.to_string(),
            params,
            ret,
            kind,
        });
        Some(id)
    }

    #[inline]
    pub fn get(&self, id: FunctionId) -> &BoundFunction {
        &self.functions[id.0 as usize]
    }

    pub fn get_mut(&mut self, id: FunctionId) -> &mut BoundFunction {
        &mut self.functions[id.0 as usize]
    }

    pub fn len(&self) -> usize {
        self.functions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.functions.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &BoundFunction> {
        self.functions.iter()
    }

    /// Resolve `(name, argument types)`. Tries an exact signature match
    /// first; failing that, a widening pass lets each class-typed
    /// argument step up its nominal parent chain, and the candidate
    /// with the fewest total steps wins. Two candidates at the same
    /// specificity are ambiguous and resolve to `None`.
    pub fn resolve(
        &self,
        types: &TypeStore,
        name: &str,
        args: &[TypeId],
    ) -> Option<FunctionId> {
        let ids = self.by_name.get(name)?;
        if let Some(&id) = ids
            .iter()
            .find(|&&id| self.functions[id.0 as usize].params == args)
        {
            return Some(id);
        }

        let mut best: Option<(u32, FunctionId)> = None;
        let mut ambiguous = false;
        for &id in ids {
            let params = &self.functions[id.0 as usize].params;
            if params.len() != args.len() {
                continue;
            }
            let mut cost = 0u32;
            let mut applicable = true;
            for (&param, &arg) in params.iter().zip(args) {
                match types.subtype_distance(arg, param) {
                    Some(distance) => cost += distance,
                    None => {
                        applicable = false;
                        break;
                    }
                }
            }
            if !applicable {
                continue;
            }
            match best {
                Some((best_cost, _)) if cost > best_cost => {}
                Some((best_cost, _)) if cost == best_cost => ambiguous = true,
                _ => {
                    best = Some((cost, id));
                    ambiguous = false;
                }
            }
        }
        if ambiguous {
            return None;
        }
        best.map(|(_, id)| id)
    }
}

// ── Program ───────────────────────────────────────────────────────────

/// A pooled literal. Materialized into a [`Value`] when a VM is
/// constructed (strings allocate on that VM's heap and stay permanently
/// marked).
#[derive(Debug, Clone, PartialEq)]
pub enum Constant {
    Fixnum(i32),
    Double(f64),
    Char(char),
    Str(String),
}

/// The code image codegen produces: everything the VM needs to run.
#[derive(Debug, Clone)]
pub struct Program {
    pub types: TypeStore,
    pub functions: BoundFunctionMap,
    pub constants: Vec<Constant>,
    pub code: Vec<u8>,
    pub entry: FunctionId,
    /// Delta/VLQ-encoded pc → (line, column) side table.
    pub source_map: Vec<u8>,
    pub source_name: String,
}

/// Compile Malang source text into a [`Program`].
pub fn compile(source: &str, source_name: &str) -> Result<Program, CompileError> {
    let ast = malang_parser::parse(source)?;
    let unit = lower::lower(&ast)?;
    let program = codegen::generate(unit, source_name)?;
    Ok(program)
}

// ── VM ────────────────────────────────────────────────────────────────

/// One active bytecode invocation.
#[derive(Debug, Clone, Copy)]
pub struct Frame {
    pub return_pc: usize,
    pub locals_base: usize,
    pub num_locals: u16,
    pub function: FunctionId,
}

/// The virtual machine. Constructed with a finalized [`Program`]; runs
/// to completion or until a trap. The GC it owns outlives the run for
/// teardown-time finalization.
pub struct Vm {
    pub(crate) program: Program,
    pub(crate) gc: Gc,
    pub(crate) constants: Vec<Value>,
    pub(crate) data: Vec<Value>,
    pub(crate) frames: Vec<Frame>,
    pub(crate) locals: Vec<Value>,
    pub(crate) pc: usize,
    /// pc of the instruction currently executing (for traces).
    pub(crate) current_pc: usize,
    /// Set by the `Breakpoint` opcode; traces each instruction.
    pub(crate) breaking: bool,
    out: Box<dyn Write>,
}

/// Roots for a collection: every value on the data stack and in the
/// locals region. Constant-pool objects are registered as permanent
/// with the GC and need no re-scanning here.
struct StackRoots<'a> {
    data: &'a Vec<Value>,
    locals: &'a Vec<Value>,
}

impl RootProvider for StackRoots<'_> {
    fn visit_roots(&mut self, visitor: &mut dyn FnMut(Value)) {
        for &value in self.data.iter() {
            visitor(value);
        }
        for &value in self.locals.iter() {
            visitor(value);
        }
    }
}

struct NoRoots;

impl RootProvider for NoRoots {
    fn visit_roots(&mut self, _visitor: &mut dyn FnMut(Value)) {}
}

impl Vm {
    pub fn new(program: Program) -> Self {
        Self::with_output(program, Box::new(std::io::stdout()))
    }

    pub fn with_output(program: Program, out: Box<dyn Write>) -> Self {
        Self::with_gc_config(program, out, GcConfig::default())
    }

    pub fn with_gc_config(
        program: Program,
        out: Box<dyn Write>,
        gc_config: GcConfig,
    ) -> Self {
        let mut gc = Gc::new(gc_config, trace_object);
        let constants = program
            .constants
            .iter()
            .map(|constant| match constant {
                Constant::Fixnum(n) => Value::from_fixnum(*n),
                Constant::Double(d) => Value::from_double(*d),
                Constant::Char(c) => Value::from_char(*c),
                Constant::Str(text) => {
                    let obj = gc.alloc_string(text, &mut NoRoots);
                    gc.add_permanent(obj);
                    Value::from_object(obj)
                }
            })
            .collect();
        Self {
            program,
            gc,
            constants,
            data: Vec::with_capacity(256),
            frames: Vec::with_capacity(64),
            locals: Vec::with_capacity(256),
            pc: 0,
            current_pc: 0,
            breaking: false,
            out,
        }
    }

    pub fn program(&self) -> &Program {
        &self.program
    }

    pub fn gc(&self) -> &Gc {
        &self.gc
    }

    pub fn gc_mut(&mut self) -> &mut Gc {
        &mut self.gc
    }

    pub fn call_depth(&self) -> usize {
        self.frames.len()
    }

    // ── data stack (native-call surface) ───────────────────────────

    pub fn push_data(&mut self, value: Value) -> Result<(), Trap> {
        if self.data.len() >= DATA_STACK_MAX {
            return Err(self.trap(TrapKind::StackOverflow));
        }
        self.data.push(value);
        Ok(())
    }

    pub fn pop_data(&mut self) -> Result<Value, Trap> {
        match self.data.pop() {
            Some(value) => Ok(value),
            None => Err(self.trap(TrapKind::Inconsistency("data stack underflow"))),
        }
    }

    pub fn write_out(&mut self, text: &str) -> Result<(), Trap> {
        if self.out.write_all(text.as_bytes()).is_err() {
            return Err(self.trap(TrapKind::NativeError(
                "write to output failed".to_string(),
            )));
        }
        Ok(())
    }

    pub fn set_breaking(&mut self, breaking: bool) {
        self.breaking = breaking;
    }

    pub fn breaking(&self) -> bool {
        self.breaking
    }

    // ── allocation (GC safepoints) ─────────────────────────────────

    pub(crate) fn alloc_plain(&mut self, type_id: TypeId) -> GcRef {
        let num_fields = self.program.types.get(type_id).num_fields();
        let Vm {
            gc, data, locals, ..
        } = self;
        gc.alloc_plain(
            type_id,
            num_fields,
            &mut StackRoots { data, locals },
        )
    }

    pub(crate) fn alloc_array(
        &mut self,
        array_type: TypeId,
        element_type: TypeId,
        length: usize,
        fill: Value,
    ) -> GcRef {
        let Vm {
            gc, data, locals, ..
        } = self;
        gc.alloc_array(
            array_type,
            element_type,
            length,
            fill,
            &mut StackRoots { data, locals },
        )
    }

    pub(crate) fn alloc_buffer(&mut self, size: usize) -> GcRef {
        let Vm {
            gc, data, locals, ..
        } = self;
        gc.alloc_buffer(size, &mut StackRoots { data, locals })
    }

    /// Force a collection with the VM's live stacks as roots.
    pub fn collect_garbage(&mut self) -> malang_heap::CollectionReport {
        let Vm {
            gc, data, locals, ..
        } = self;
        gc.collect(&mut StackRoots { data, locals })
    }

    // ── traps and traces ───────────────────────────────────────────

    pub(crate) fn trap(&self, kind: TrapKind) -> Trap {
        Trap {
            kind,
            trace: self.capture_trace(),
        }
    }

    /// Walk the call stack top to bottom: callee name, source position
    /// of the executing instruction, and an argument snapshot.
    pub fn capture_trace(&self) -> Vec<TraceFrame> {
        let mut trace = Vec::with_capacity(self.frames.len());
        let mut pc = self.current_pc;
        for frame in self.frames.iter().rev() {
            let function = self.program.functions.get(frame.function);
            let (line, column) =
                source_map_lookup(&self.program.source_map, pc as u32)
                    .unwrap_or((0, 0));
            let args = (0..function.arity())
                .map(|i| {
                    self.locals
                        .get(frame.locals_base + i)
                        .map(|&v| self.format_value(v))
                        .unwrap_or_else(|| "?".to_string())
                })
                .collect();
            trace.push(TraceFrame {
                function: function.name.clone(),
                line,
                column,
                args,
            });
            // The caller resumes right after its call instruction; back
            // up one byte so the lookup lands inside that instruction.
            pc = frame.return_pc.saturating_sub(1);
        }
        trace
    }

    /// Render one value for traces and diagnostics.
    pub fn format_value(&self, value: Value) -> String {
        if value.is_double() {
            // SAFETY: tag checked.
            return format!("{}", unsafe { value.as_double() });
        }
        if value.is_fixnum() {
            // SAFETY: tag checked.
            return format!("{}", unsafe { value.as_fixnum() });
        }
        if value.is_boolean() {
            // SAFETY: tag checked.
            return format!("{}", unsafe { value.as_boolean() });
        }
        if value.is_char() {
            // SAFETY: tag checked.
            return format!("{:?}", unsafe { value.as_char() });
        }
        if value.is_nothing() {
            return "nothing".to_string();
        }
        if let Some(obj) = value.object() {
            if obj.tag() == ObjectTag::Str {
                if let Some(text) = self.gc.string_text(obj) {
                    return format!("{text:?}");
                }
            }
            return format!("<{}>", self.program.types.get(obj.type_id()).name);
        }
        format!("{value:?}")
    }
}

// ── Test / tooling helpers ────────────────────────────────────────────

/// A `Write` sink that can be read back after the VM is done with it.
#[derive(Clone, Default)]
pub struct SharedOutput(Arc<Mutex<Vec<u8>>>);

impl SharedOutput {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn take_string(&self) -> String {
        String::from_utf8_lossy(&self.0.lock()).into_owned()
    }
}

impl Write for SharedOutput {
    fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
        self.0.lock().extend_from_slice(buf);
        Ok(buf.len())
    }

    fn flush(&mut self) -> std::io::Result<()> {
        Ok(())
    }
}

/// Compile and run `source`, capturing everything it prints.
pub fn run_capture(source: &str) -> Result<(Result<Value, Trap>, String), CompileError> {
    let program = compile(source, "<test>")?;
    let output = SharedOutput::new();
    let mut vm = Vm::with_output(program, Box::new(output.clone()));
    let result = interpreter::run(&mut vm);
    Ok((result, output.take_string()))
}
