//! AST → typed IR lowering.
//!
//! Two passes over the tree. The declare pass registers every class,
//! field, method, extension, and bound function so bodies may refer to
//! definitions in any order; the lower pass type-checks each body and
//! produces IR with names resolved to slots, field indices, and
//! function ids. Every failure here is a codegen error with a source
//! location; nothing unresolved survives into the interpreter.

use std::collections::HashMap;

use malang_bytecode::Op;
use malang_object::{FunctionId, TypeFlags, TypeId, TypeStore};
use malang_parser::ast::{
    Ast, BinaryOp, ClassDef, ExtendDef, FnDef, Node, NodeKind, TypeExpr,
    TypeExprKind, UnaryOp,
};
use malang_parser::{Pos, Span};

use crate::builtins;
use crate::ir::{Ir, IrFunction, IrKind, IrProgram};
use crate::{BoundFunctionMap, CodegenError, FunctionKind};

/// Everything codegen needs: the IR plus the finalized type store and
/// function map it indexes into.
#[derive(Debug)]
pub struct LoweredUnit {
    pub ir: IrProgram,
    pub types: TypeStore,
    pub functions: BoundFunctionMap,
}

pub fn lower(ast: &Ast) -> Result<LoweredUnit, CodegenError> {
    let mut lowering = Lowering::new();
    let pending = lowering.declare(ast)?;

    let mut functions = Vec::with_capacity(pending.len() + 1);
    for item in &pending {
        functions.push(lowering.lower_function(item)?);
    }

    // Top-level statements become the entry function's body.
    let entry = lowering
        .functions
        .add("<main>", Vec::new(), TypeStore::VOID, PLACEHOLDER)
        .expect("entry name is reserved");
    let body: Vec<&Node> = ast
        .roots
        .iter()
        .filter(|node| {
            !matches!(
                node.kind,
                NodeKind::Fn(_) | NodeKind::Class(_) | NodeKind::Extend(_)
            )
        })
        .collect();
    let entry_loc = body.first().map(|n| n.span.start).unwrap_or(Pos::origin());
    let mut ctx = FunctionLowerer::new(&mut lowering, None, TypeStore::VOID);
    ctx.is_entry = true;
    ctx.push_scope();
    let mut ir_body = Vec::with_capacity(body.len());
    for node in body {
        if let Some(ir) = ctx.lower_statement(node)? {
            ir_body.push(ir);
        }
    }
    let num_slots = ctx.next_slot;
    functions.push(IrFunction {
        id: entry,
        name: "<main>".to_string(),
        arity: 0,
        num_slots,
        ret: TypeStore::VOID,
        body: ir_body,
        loc: entry_loc,
    });

    Ok(LoweredUnit {
        ir: IrProgram {
            functions,
            entry,
        },
        types: lowering.types,
        functions: lowering.functions,
    })
}

/// Entry offsets are patched by codegen once layout is known.
const PLACEHOLDER: FunctionKind = FunctionKind::Bytecode {
    entry: 0,
    num_locals: 0,
};

/// One function body waiting to be lowered.
struct PendingFn<'a> {
    id: FunctionId,
    name: String,
    receiver: Option<TypeId>,
    params: Vec<(String, TypeId, Span)>,
    ret: TypeId,
    body: &'a [Node],
    loc: Pos,
}

struct Lowering {
    types: TypeStore,
    functions: BoundFunctionMap,
}

impl Lowering {
    fn new() -> Self {
        let mut types = TypeStore::new();
        let mut functions = BoundFunctionMap::new();
        builtins::register_all(&mut functions, &mut types);
        Self { types, functions }
    }

    fn resolve_type(&mut self, expr: &TypeExpr) -> Result<TypeId, CodegenError> {
        match &expr.kind {
            TypeExprKind::Named(name) => {
                self.types.lookup(name).ok_or_else(|| {
                    CodegenError::new(format!("unknown type `{name}`"), expr.span)
                })
            }
            TypeExprKind::Array(element) => {
                let element = self.resolve_type(element)?;
                Ok(self.types.array_of(element))
            }
        }
    }

    fn is_user_class(&self, id: TypeId) -> bool {
        let info = self.types.get(id);
        info.flags == TypeFlags::REFERENCE
            && id != TypeStore::OBJECT
            && id != TypeStore::STRING
            && id != TypeStore::BUFFER
    }

    // ── declare pass ───────────────────────────────────────────────

    fn declare<'a>(
        &mut self,
        ast: &'a Ast,
    ) -> Result<Vec<PendingFn<'a>>, CodegenError> {
        let mut classes: Vec<(&ClassDef, TypeId)> = Vec::new();
        let mut extends: Vec<&ExtendDef> = Vec::new();
        let mut free_fns: Vec<&FnDef> = Vec::new();

        // Class names first so fields and parents may forward-reference.
        for node in &ast.roots {
            match &node.kind {
                NodeKind::Class(def) => {
                    let id = self
                        .types
                        .declare_class(&def.name, None)
                        .ok_or_else(|| {
                            CodegenError::new(
                                format!("duplicate type `{}`", def.name),
                                def.span,
                            )
                        })?;
                    classes.push((def, id));
                }
                NodeKind::Extend(def) => extends.push(def),
                NodeKind::Fn(def) => free_fns.push(def),
                _ => {}
            }
        }

        // Parent links.
        for (def, id) in &classes {
            if let Some(parent_name) = &def.parent {
                let parent =
                    self.types.lookup(parent_name).ok_or_else(|| {
                        CodegenError::new(
                            format!("unknown parent type `{parent_name}`"),
                            def.span,
                        )
                    })?;
                if !self.is_user_class(parent) {
                    return Err(CodegenError::new(
                        format!("`{parent_name}` cannot be extended from"),
                        def.span,
                    ));
                }
                self.types.get_mut(*id).parent = Some(parent);
            }
        }

        // Fields, parent-first so children inherit parent layout as a
        // stable prefix.
        let order = self.class_topo_order(&classes)?;
        for &idx in &order {
            let (def, id) = classes[idx];
            if let Some(parent) = self.types.get(id).parent {
                let inherited = self.types.get(parent).fields.clone();
                self.types.get_mut(id).fields = inherited;
            }
            for field in &def.fields {
                let ty = self.resolve_type(&field.ty)?;
                if self.types.add_field(id, &field.name, ty).is_none() {
                    return Err(CodegenError::new(
                        format!("duplicate field `{}`", field.name),
                        field.span,
                    ));
                }
            }
        }

        // Methods and free functions.
        let mut pending = Vec::new();
        for &idx in &order {
            let (def, id) = classes[idx];
            for method in &def.methods {
                pending.push(self.declare_method(id, method)?);
            }
        }
        for def in extends {
            let target = self.resolve_type(&def.target)?;
            for method in &def.methods {
                pending.push(self.declare_method(target, method)?);
            }
        }
        for def in free_fns {
            pending.push(self.declare_free_fn(def)?);
        }

        // Inherited entries get stable vtable slots after every class's
        // own methods are known.
        let declared: Vec<TypeId> = order.iter().map(|&i| classes[i].1).collect();
        self.types.link_inherited_methods(&declared);

        Ok(pending)
    }

    /// Indices of `classes` ordered so parents precede children.
    fn class_topo_order(
        &self,
        classes: &[(&ClassDef, TypeId)],
    ) -> Result<Vec<usize>, CodegenError> {
        let index_of: HashMap<TypeId, usize> = classes
            .iter()
            .enumerate()
            .map(|(i, (_, id))| (*id, i))
            .collect();
        let mut order = Vec::with_capacity(classes.len());
        let mut state = vec![0u8; classes.len()]; // 0 new, 1 visiting, 2 done
        fn visit(
            i: usize,
            classes: &[(&ClassDef, TypeId)],
            index_of: &HashMap<TypeId, usize>,
            types: &TypeStore,
            state: &mut [u8],
            order: &mut Vec<usize>,
        ) -> Result<(), CodegenError> {
            match state[i] {
                2 => return Ok(()),
                1 => {
                    return Err(CodegenError::new(
                        format!(
                            "cyclic inheritance involving `{}`",
                            classes[i].0.name
                        ),
                        classes[i].0.span,
                    ));
                }
                _ => {}
            }
            state[i] = 1;
            if let Some(parent) = types.get(classes[i].1).parent {
                if let Some(&p) = index_of.get(&parent) {
                    visit(p, classes, index_of, types, state, order)?;
                }
            }
            state[i] = 2;
            order.push(i);
            Ok(())
        }
        for i in 0..classes.len() {
            visit(i, classes, &index_of, &self.types, &mut state, &mut order)?;
        }
        Ok(order)
    }

    fn declare_method<'a>(
        &mut self,
        owner: TypeId,
        def: &'a FnDef,
    ) -> Result<PendingFn<'a>, CodegenError> {
        let mut params = vec![owner];
        let mut named = Vec::with_capacity(def.params.len());
        for param in &def.params {
            let ty = self.resolve_type(&param.ty)?;
            params.push(ty);
            named.push((param.name.clone(), ty, param.span));
        }
        let ret = match &def.ret {
            Some(expr) => self.resolve_type(expr)?,
            None => TypeStore::VOID,
        };
        let id = self
            .functions
            .add(&def.name, params.clone(), ret, PLACEHOLDER)
            .ok_or_else(|| {
                CodegenError::new(
                    format!("duplicate method `{}`", def.name),
                    def.span,
                )
            })?;
        if self
            .types
            .add_method(owner, &def.name, params, ret, id)
            .is_none()
        {
            return Err(CodegenError::new(
                format!("duplicate method `{}`", def.name),
                def.span,
            ));
        }
        Ok(PendingFn {
            id,
            name: def.name.clone(),
            receiver: Some(owner),
            params: named,
            ret,
            body: &def.body,
            loc: def.span.start,
        })
    }

    fn declare_free_fn<'a>(
        &mut self,
        def: &'a FnDef,
    ) -> Result<PendingFn<'a>, CodegenError> {
        let mut params = Vec::with_capacity(def.params.len());
        let mut named = Vec::with_capacity(def.params.len());
        for param in &def.params {
            let ty = self.resolve_type(&param.ty)?;
            params.push(ty);
            named.push((param.name.clone(), ty, param.span));
        }
        let ret = match &def.ret {
            Some(expr) => self.resolve_type(expr)?,
            None => TypeStore::VOID,
        };
        let id = self
            .functions
            .add(&def.name, params, ret, PLACEHOLDER)
            .ok_or_else(|| {
                CodegenError::new(
                    format!(
                        "duplicate function `{}` with identical parameters",
                        def.name
                    ),
                    def.span,
                )
            })?;
        Ok(PendingFn {
            id,
            name: def.name.clone(),
            receiver: None,
            params: named,
            ret,
            body: &def.body,
            loc: def.span.start,
        })
    }

    // ── per-function lowering ──────────────────────────────────────

    fn lower_function(
        &mut self,
        item: &PendingFn<'_>,
    ) -> Result<IrFunction, CodegenError> {
        let ret = item.ret;
        let receiver = item.receiver;
        let mut ctx = FunctionLowerer::new(self, receiver, ret);
        ctx.push_scope();
        if receiver.is_some() {
            // Slot 0 is the receiver, reachable through `@` only.
            ctx.next_slot = 1;
        }
        for (name, ty, span) in &item.params {
            ctx.declare_local(name, *ty, false, *span)?;
        }
        let arity = ctx.next_slot;
        let mut body = Vec::with_capacity(item.body.len());
        for node in item.body {
            if let Some(ir) = ctx.lower_statement(node)? {
                body.push(ir);
            }
        }
        let num_slots = ctx.next_slot;
        if ret != TypeStore::VOID && !always_returns(&body) {
            return Err(CodegenError::new(
                format!(
                    "function `{}` may finish without returning a value",
                    item.name
                ),
                Span::point(item.loc),
            ));
        }
        Ok(IrFunction {
            id: item.id,
            name: item.name.clone(),
            arity,
            num_slots,
            ret,
            body,
            loc: item.loc,
        })
    }
}

/// Whether every control path through `body` hits a `return`.
fn always_returns(body: &[Ir]) -> bool {
    body.iter().any(|ir| match &ir.kind {
        IrKind::Return { .. } => true,
        IrKind::If {
            consequence,
            alternative,
            ..
        } => {
            !alternative.is_empty()
                && always_returns(consequence)
                && always_returns(alternative)
        }
        _ => false,
    })
}

#[derive(Debug, Clone, Copy)]
struct Local {
    slot: u16,
    ty: TypeId,
    constant: bool,
}

struct FunctionLowerer<'a> {
    env: &'a mut Lowering,
    scopes: Vec<HashMap<String, Local>>,
    next_slot: u16,
    receiver: Option<TypeId>,
    ret: TypeId,
    /// The entry function's body is the program's top level, where
    /// definition statements were already consumed by the declare pass.
    is_entry: bool,
}

impl<'a> FunctionLowerer<'a> {
    fn new(env: &'a mut Lowering, receiver: Option<TypeId>, ret: TypeId) -> Self {
        Self {
            env,
            scopes: Vec::new(),
            next_slot: 0,
            receiver,
            ret,
            is_entry: false,
        }
    }

    fn push_scope(&mut self) {
        self.scopes.push(HashMap::new());
    }

    fn pop_scope(&mut self) {
        self.scopes.pop();
    }

    fn declare_local(
        &mut self,
        name: &str,
        ty: TypeId,
        constant: bool,
        span: Span,
    ) -> Result<u16, CodegenError> {
        let slot = self.next_slot;
        if slot == u16::MAX {
            return Err(CodegenError::new("too many locals", span));
        }
        let scope = self.scopes.last_mut().expect("scope stack is never empty");
        if scope.contains_key(name) {
            return Err(CodegenError::new(
                format!("`{name}` is already declared in this scope"),
                span,
            ));
        }
        scope.insert(
            name.to_string(),
            Local {
                slot,
                ty,
                constant,
            },
        );
        self.next_slot += 1;
        Ok(slot)
    }

    fn lookup_local(&self, name: &str) -> Option<Local> {
        self.scopes
            .iter()
            .rev()
            .find_map(|scope| scope.get(name).copied())
    }

    fn type_name(&self, id: TypeId) -> String {
        self.env.types.get(id).name.clone()
    }

    fn check_assignable(
        &self,
        value: TypeId,
        expected: TypeId,
        span: Span,
    ) -> Result<(), CodegenError> {
        if self.env.types.is_subtype(value, expected) {
            return Ok(());
        }
        Err(CodegenError::new(
            format!(
                "type mismatch: expected `{}`, found `{}`",
                self.type_name(expected),
                self.type_name(value)
            ),
            span,
        ))
    }

    fn require_value(&self, ir: &Ir, span: Span) -> Result<(), CodegenError> {
        if ir.ty == TypeStore::VOID {
            return Err(CodegenError::new("expression has no value", span));
        }
        Ok(())
    }

    // ── statements ─────────────────────────────────────────────────

    /// Lower one statement. Returns `None` for definitions the declare
    /// pass already consumed.
    fn lower_statement(
        &mut self,
        node: &Node,
    ) -> Result<Option<Ir>, CodegenError> {
        let loc = node.span.start;
        match &node.kind {
            NodeKind::Class(_) | NodeKind::Extend(_) => Ok(None),
            NodeKind::Fn(def) => {
                if !self.is_entry || self.scopes.len() > 1 {
                    return Err(CodegenError::new(
                        "nested function definitions are not supported",
                        def.span,
                    ));
                }
                Ok(None)
            }
            NodeKind::Decl {
                name,
                ty,
                value,
                constant,
            } => {
                let declared = match ty {
                    Some(expr) => Some(self.env.resolve_type(expr)?),
                    None => None,
                };
                let (init, var_ty) = match value {
                    Some(value_node) => {
                        let init = self.lower_expr(value_node)?;
                        self.require_value(&init, value_node.span)?;
                        let var_ty = match declared {
                            Some(expected) => {
                                self.check_assignable(
                                    init.ty,
                                    expected,
                                    value_node.span,
                                )?;
                                expected
                            }
                            None => init.ty,
                        };
                        (init, var_ty)
                    }
                    None => {
                        let var_ty = declared.expect("parser requires a type");
                        (self.default_value(var_ty, loc), var_ty)
                    }
                };
                let slot =
                    self.declare_local(name, var_ty, *constant, node.span)?;
                Ok(Some(Ir::new(
                    IrKind::StoreLocal {
                        slot,
                        value: Box::new(init),
                    },
                    TypeStore::VOID,
                    loc,
                )))
            }
            NodeKind::Assign { target, value } => {
                self.lower_assign(target, value, loc).map(Some)
            }
            NodeKind::If {
                condition,
                consequence,
                alternative,
            } => {
                let condition = self.lower_expr(condition)?;
                if condition.ty != TypeStore::BOOL {
                    return Err(CodegenError::new(
                        "if condition must be a bool",
                        node.span,
                    ));
                }
                let consequence = self.lower_block(consequence)?;
                let alternative = self.lower_block(alternative)?;
                Ok(Some(Ir::new(
                    IrKind::If {
                        condition: Box::new(condition),
                        consequence,
                        alternative,
                    },
                    TypeStore::VOID,
                    loc,
                )))
            }
            NodeKind::While { condition, body } => {
                let condition = self.lower_expr(condition)?;
                if condition.ty != TypeStore::BOOL {
                    return Err(CodegenError::new(
                        "while condition must be a bool",
                        node.span,
                    ));
                }
                let body = self.lower_block(body)?;
                Ok(Some(Ir::new(
                    IrKind::While {
                        condition: Box::new(condition),
                        body,
                    },
                    TypeStore::VOID,
                    loc,
                )))
            }
            NodeKind::Return { value } => {
                let value = match value {
                    Some(value_node) => {
                        if self.ret == TypeStore::VOID {
                            return Err(CodegenError::new(
                                "cannot return a value from a void function",
                                node.span,
                            ));
                        }
                        let ir = self.lower_expr(value_node)?;
                        self.check_assignable(ir.ty, self.ret, value_node.span)?;
                        Some(Box::new(ir))
                    }
                    None => {
                        if self.ret != TypeStore::VOID {
                            return Err(CodegenError::new(
                                "this function must return a value",
                                node.span,
                            ));
                        }
                        None
                    }
                };
                Ok(Some(Ir::new(
                    IrKind::Return { value },
                    TypeStore::VOID,
                    loc,
                )))
            }
            _ => {
                let ir = self.lower_expr(node)?;
                if ir.ty == TypeStore::VOID {
                    // Nothing to drop; the expression is the statement.
                    return Ok(Some(ir));
                }
                Ok(Some(Ir::new(
                    IrKind::Discard {
                        value: Box::new(ir),
                        count: 1,
                    },
                    TypeStore::VOID,
                    loc,
                )))
            }
        }
    }

    fn lower_block(&mut self, nodes: &[Node]) -> Result<Vec<Ir>, CodegenError> {
        self.push_scope();
        let mut out = Vec::with_capacity(nodes.len());
        for node in nodes {
            if let Some(ir) = self.lower_statement(node)? {
                out.push(ir);
            }
        }
        self.pop_scope();
        Ok(out)
    }

    fn default_value(&self, ty: TypeId, loc: Pos) -> Ir {
        let kind = if ty == TypeStore::INT {
            IrKind::ConstFixnum(0)
        } else if ty == TypeStore::DOUBLE {
            IrKind::ConstDouble(0.0)
        } else if ty == TypeStore::BOOL {
            IrKind::ConstBool(false)
        } else if ty == TypeStore::CHAR {
            IrKind::ConstChar('\0')
        } else {
            IrKind::Nothing
        };
        Ir::new(kind, ty, loc)
    }

    fn lower_assign(
        &mut self,
        target: &Node,
        value: &Node,
        loc: Pos,
    ) -> Result<Ir, CodegenError> {
        match &target.kind {
            NodeKind::Ident(name) => {
                let local = self.lookup_local(name).ok_or_else(|| {
                    CodegenError::new(
                        format!("unresolved name `{name}`"),
                        target.span,
                    )
                })?;
                if local.constant {
                    return Err(CodegenError::new(
                        format!("cannot assign to constant `{name}`"),
                        target.span,
                    ));
                }
                let value_ir = self.lower_expr(value)?;
                self.require_value(&value_ir, value.span)?;
                self.check_assignable(value_ir.ty, local.ty, value.span)?;
                Ok(Ir::new(
                    IrKind::StoreLocal {
                        slot: local.slot,
                        value: Box::new(value_ir),
                    },
                    TypeStore::VOID,
                    loc,
                ))
            }
            NodeKind::Member { base, name } => {
                let object = self.lower_expr(base)?;
                let type_name = self.type_name(object.ty);
                if !self.env.is_user_class(object.ty) {
                    return Err(CodegenError::new(
                        format!("cannot assign to field of `{type_name}`"),
                        target.span,
                    ));
                }
                let (index, field_ty) = {
                    let info = self.env.types.get(object.ty);
                    let index = info.field_index(name).ok_or_else(|| {
                        CodegenError::new(
                            format!(
                                "type `{type_name}` has no field `{name}`"
                            ),
                            target.span,
                        )
                    })?;
                    (index, info.fields[index].ty)
                };
                let value_ir = self.lower_expr(value)?;
                self.require_value(&value_ir, value.span)?;
                self.check_assignable(value_ir.ty, field_ty, value.span)?;
                Ok(Ir::new(
                    IrKind::StoreField {
                        object: Box::new(object),
                        index: index as u16,
                        value: Box::new(value_ir),
                    },
                    TypeStore::VOID,
                    loc,
                ))
            }
            NodeKind::Index { base, index } => {
                let base_ir = self.lower_expr(base)?;
                let index_ir = self.lower_expr(index)?;
                let value_ir = self.lower_expr(value)?;
                self.require_value(&value_ir, value.span)?;
                let base_info = self.env.types.get(base_ir.ty);
                if let Some(element) = base_info.element_type {
                    if index_ir.ty != TypeStore::INT {
                        return Err(CodegenError::new(
                            "array index must be an int",
                            index.span,
                        ));
                    }
                    self.check_assignable(value_ir.ty, element, value.span)?;
                    return Ok(Ir::new(
                        IrKind::StoreIndex {
                            base: Box::new(base_ir),
                            index: Box::new(index_ir),
                            value: Box::new(value_ir),
                        },
                        TypeStore::VOID,
                        loc,
                    ));
                }
                if base_ir.ty == TypeStore::BUFFER {
                    if index_ir.ty != TypeStore::INT
                        || value_ir.ty != TypeStore::INT
                    {
                        return Err(CodegenError::new(
                            "buffer stores take int index and int value",
                            target.span,
                        ));
                    }
                    return Ok(Ir::new(
                        IrKind::StoreIndex {
                            base: Box::new(base_ir),
                            index: Box::new(index_ir),
                            value: Box::new(value_ir),
                        },
                        TypeStore::VOID,
                        loc,
                    ));
                }
                // `[]=` operator method on extended types.
                let args = vec![base_ir, index_ir, value_ir];
                let call = self.method_call_ir(
                    "[]=",
                    args,
                    target.span,
                    loc,
                )?;
                if call.ty == TypeStore::VOID {
                    return Ok(call);
                }
                Ok(Ir::new(
                    IrKind::Discard {
                        value: Box::new(call),
                        count: 1,
                    },
                    TypeStore::VOID,
                    loc,
                ))
            }
            _ => Err(CodegenError::new(
                "left-hand side of assignment is not an lvalue",
                target.span,
            )),
        }
    }

    // ── expressions ────────────────────────────────────────────────

    fn lower_expr(&mut self, node: &Node) -> Result<Ir, CodegenError> {
        let loc = node.span.start;
        match &node.kind {
            NodeKind::Integer(value) => {
                let value = i32::try_from(*value).map_err(|_| {
                    CodegenError::new(
                        format!("integer literal {value} does not fit a fixnum"),
                        node.span,
                    )
                })?;
                Ok(Ir::new(IrKind::ConstFixnum(value), TypeStore::INT, loc))
            }
            NodeKind::Real(value) => {
                Ok(Ir::new(IrKind::ConstDouble(*value), TypeStore::DOUBLE, loc))
            }
            NodeKind::Str(value) => Ok(Ir::new(
                IrKind::ConstString(value.clone()),
                TypeStore::STRING,
                loc,
            )),
            NodeKind::CharLit(value) => {
                Ok(Ir::new(IrKind::ConstChar(*value), TypeStore::CHAR, loc))
            }
            NodeKind::Bool(value) => {
                Ok(Ir::new(IrKind::ConstBool(*value), TypeStore::BOOL, loc))
            }
            NodeKind::Ident(name) => {
                let local = self.lookup_local(name).ok_or_else(|| {
                    CodegenError::new(
                        format!("unresolved name `{name}`"),
                        node.span,
                    )
                })?;
                Ok(Ir::new(IrKind::LoadLocal(local.slot), local.ty, loc))
            }
            NodeKind::Receiver => {
                let ty = self.receiver.ok_or_else(|| {
                    CodegenError::new(
                        "`@` is only meaningful inside a method",
                        node.span,
                    )
                })?;
                Ok(Ir::new(IrKind::LoadLocal(0), ty, loc))
            }
            NodeKind::Unary { op, operand } => {
                self.lower_unary(*op, operand, node.span, loc)
            }
            NodeKind::Binary { op, lhs, rhs } => {
                self.lower_binary(*op, lhs, rhs, node.span, loc)
            }
            NodeKind::Call { callee, args } => {
                self.lower_call(callee, args, node.span, loc)
            }
            NodeKind::Index { base, index } => {
                self.lower_index(base, index, node.span, loc)
            }
            NodeKind::Member { base, name } => {
                self.lower_member(base, name, node.span, loc)
            }
            NodeKind::ArrayLit(elements) => {
                let mut lowered = Vec::with_capacity(elements.len());
                for element in elements {
                    let ir = self.lower_expr(element)?;
                    self.require_value(&ir, element.span)?;
                    lowered.push(ir);
                }
                let element_ty = lowered[0].ty;
                for (ir, node) in lowered.iter().zip(elements) {
                    if ir.ty != element_ty {
                        return Err(CodegenError::new(
                            "array literal elements must share one type",
                            node.span,
                        ));
                    }
                }
                let array_ty = self.env.types.array_of(element_ty);
                Ok(Ir::new(
                    IrKind::ArrayLit {
                        element: element_ty,
                        elements: lowered,
                    },
                    array_ty,
                    loc,
                ))
            }
            NodeKind::NewArray { length, element } => {
                let element = self.env.resolve_type(element)?;
                let length_ir = self.lower_expr(length)?;
                if length_ir.ty != TypeStore::INT {
                    return Err(CodegenError::new(
                        "array length must be an int",
                        length.span,
                    ));
                }
                let array_ty = self.env.types.array_of(element);
                Ok(Ir::new(
                    IrKind::AllocArray {
                        element,
                        length: Box::new(length_ir),
                    },
                    array_ty,
                    loc,
                ))
            }
            _ => Err(CodegenError::new(
                "expected an expression",
                node.span,
            )),
        }
    }

    fn lower_unary(
        &mut self,
        op: UnaryOp,
        operand: &Node,
        span: Span,
        loc: Pos,
    ) -> Result<Ir, CodegenError> {
        let operand_ir = self.lower_expr(operand)?;
        self.require_value(&operand_ir, operand.span)?;
        let ty = operand_ir.ty;
        let is_int = ty == TypeStore::INT;
        let is_double = ty == TypeStore::DOUBLE;
        let is_bool = ty == TypeStore::BOOL;
        if op == UnaryOp::Pos && (is_int || is_double) {
            // Unary plus is the identity on numbers.
            return Ok(operand_ir);
        }
        let opcode = match op {
            UnaryOp::Neg if is_int => Op::INeg,
            UnaryOp::Neg if is_double => Op::DNeg,
            UnaryOp::Invert if is_int => Op::IInvert,
            UnaryOp::Not if is_bool => Op::Not,
            _ => {
                let args = vec![operand_ir];
                return self.method_call_ir(op.method_name(), args, span, loc);
            }
        };
        Ok(Ir::new(
            IrKind::Unary {
                op: opcode,
                operand: Box::new(operand_ir),
            },
            ty,
            loc,
        ))
    }

    fn lower_binary(
        &mut self,
        op: BinaryOp,
        lhs: &Node,
        rhs: &Node,
        span: Span,
        loc: Pos,
    ) -> Result<Ir, CodegenError> {
        let lhs_ir = self.lower_expr(lhs)?;
        let rhs_ir = self.lower_expr(rhs)?;
        self.require_value(&lhs_ir, lhs.span)?;
        self.require_value(&rhs_ir, rhs.span)?;

        if matches!(op, BinaryOp::LogAnd | BinaryOp::LogOr) {
            if lhs_ir.ty != TypeStore::BOOL || rhs_ir.ty != TypeStore::BOOL {
                return Err(CodegenError::new(
                    format!("`{}` takes bool operands", op.token()),
                    span,
                ));
            }
            let kind = if op == BinaryOp::LogAnd {
                IrKind::LogicalAnd {
                    lhs: Box::new(lhs_ir),
                    rhs: Box::new(rhs_ir),
                }
            } else {
                IrKind::LogicalOr {
                    lhs: Box::new(lhs_ir),
                    rhs: Box::new(rhs_ir),
                }
            };
            return Ok(Ir::new(kind, TypeStore::BOOL, loc));
        }

        let specialized =
            if lhs_ir.ty == TypeStore::INT && rhs_ir.ty == TypeStore::INT {
                int_opcode(op)
            } else if lhs_ir.ty == TypeStore::DOUBLE
                && rhs_ir.ty == TypeStore::DOUBLE
            {
                double_opcode(op)
            } else {
                None
            };
        if let Some(opcode) = specialized {
            let ty = if op.is_comparison() {
                TypeStore::BOOL
            } else {
                lhs_ir.ty
            };
            return Ok(Ir::new(
                IrKind::Binary {
                    op: opcode,
                    lhs: Box::new(lhs_ir),
                    rhs: Box::new(rhs_ir),
                },
                ty,
                loc,
            ));
        }

        // Operator methods: mixed int/double pairs resolve to the
        // registered natives, extended types to their own definitions.
        let args = vec![lhs_ir, rhs_ir];
        self.method_call_ir(op.token(), args, span, loc)
    }

    /// Resolve `(receiver type, name, arg types)` to a method and build
    /// the matching call IR node. `args[0]` is the receiver.
    fn method_call_ir(
        &mut self,
        name: &str,
        args: Vec<Ir>,
        span: Span,
        loc: Pos,
    ) -> Result<Ir, CodegenError> {
        let arg_types: Vec<TypeId> = args.iter().map(|a| a.ty).collect();
        let receiver_ty = arg_types[0];
        let (slot, method) = self
            .env
            .types
            .find_method(receiver_ty, name, &arg_types)
            .ok_or_else(|| {
                CodegenError::new(
                    format!(
                        "no method `{name}({})` on type `{}`",
                        arg_types[1..]
                            .iter()
                            .map(|&t| self.type_name(t))
                            .collect::<Vec<_>>()
                            .join(", "),
                        self.type_name(receiver_ty)
                    ),
                    span,
                )
            })?;
        let ret = method.ret;
        let id = method.function;
        let kind = if self.env.is_user_class(receiver_ty) {
            IrKind::CallVirtual {
                slot: slot as u16,
                args,
            }
        } else if self.env.functions.get(id).is_native() {
            IrKind::CallNative { id, args }
        } else {
            IrKind::CallMethod { id, args }
        };
        Ok(Ir::new(kind, ret, loc))
    }

    fn lower_call(
        &mut self,
        callee: &Node,
        args: &[Node],
        span: Span,
        loc: Pos,
    ) -> Result<Ir, CodegenError> {
        match &callee.kind {
            NodeKind::Ident(name) => {
                // Intrinsics first.
                if name == "breakpoint" && args.is_empty() {
                    return Ok(Ir::new(IrKind::Breakpoint, TypeStore::VOID, loc));
                }
                let mut lowered = Vec::with_capacity(args.len());
                for arg in args {
                    let ir = self.lower_expr(arg)?;
                    self.require_value(&ir, arg.span)?;
                    lowered.push(ir);
                }
                if name == "deallocate" {
                    if lowered.len() != 1
                        || !self.env.types.get(lowered[0].ty).is_reference()
                    {
                        return Err(CodegenError::new(
                            "deallocate takes one object argument",
                            span,
                        ));
                    }
                    let object = lowered.pop().expect("length checked");
                    return Ok(Ir::new(
                        IrKind::DeallocObject {
                            object: Box::new(object),
                        },
                        TypeStore::VOID,
                        loc,
                    ));
                }

                // Constructor call: the callee names a class.
                if let Some(type_id) = self.env.types.lookup(name) {
                    if self.env.is_user_class(type_id) {
                        return self.lower_construct(type_id, lowered, span, loc);
                    }
                }

                // Bound function.
                let arg_types: Vec<TypeId> =
                    lowered.iter().map(|a| a.ty).collect();
                let id = self
                    .env
                    .functions
                    .resolve(&self.env.types, name, &arg_types)
                    .ok_or_else(|| {
                        CodegenError::new(
                            format!(
                                "unresolved function `{name}({})`",
                                arg_types
                                    .iter()
                                    .map(|&t| self.type_name(t))
                                    .collect::<Vec<_>>()
                                    .join(", ")
                            ),
                            span,
                        )
                    })?;
                let function = self.env.functions.get(id);
                let ret = function.ret;
                let kind = if function.is_native() {
                    IrKind::CallNative { id, args: lowered }
                } else {
                    IrKind::Call { id, args: lowered }
                };
                Ok(Ir::new(kind, ret, loc))
            }
            NodeKind::Member { base, name } => {
                let receiver = self.lower_expr(base)?;
                self.require_value(&receiver, base.span)?;
                let mut lowered = vec![receiver];
                for arg in args {
                    let ir = self.lower_expr(arg)?;
                    self.require_value(&ir, arg.span)?;
                    lowered.push(ir);
                }
                self.method_call_ir(name, lowered, span, loc)
            }
            _ => Err(CodegenError::new(
                "expression is not callable",
                callee.span,
            )),
        }
    }

    fn lower_construct(
        &mut self,
        type_id: TypeId,
        args: Vec<Ir>,
        span: Span,
        loc: Pos,
    ) -> Result<Ir, CodegenError> {
        let mut full = vec![type_id];
        full.extend(args.iter().map(|a| a.ty));
        let init = match self.env.types.find_method(type_id, "init", &full) {
            Some((_, method)) => {
                if method.ret != TypeStore::VOID {
                    return Err(CodegenError::new(
                        "`init` must not return a value",
                        span,
                    ));
                }
                Some(method.function)
            }
            None => {
                if !args.is_empty() {
                    return Err(CodegenError::new(
                        format!(
                            "type `{}` has no matching `init`",
                            self.type_name(type_id)
                        ),
                        span,
                    ));
                }
                None
            }
        };
        Ok(Ir::new(
            IrKind::Construct {
                type_id,
                init,
                args,
            },
            type_id,
            loc,
        ))
    }

    fn lower_index(
        &mut self,
        base: &Node,
        index: &Node,
        span: Span,
        loc: Pos,
    ) -> Result<Ir, CodegenError> {
        let base_ir = self.lower_expr(base)?;
        let index_ir = self.lower_expr(index)?;
        self.require_value(&base_ir, base.span)?;
        self.require_value(&index_ir, index.span)?;

        if let Some(element) = self.env.types.get(base_ir.ty).element_type {
            if index_ir.ty != TypeStore::INT {
                return Err(CodegenError::new(
                    "array index must be an int",
                    index.span,
                ));
            }
            return Ok(Ir::new(
                IrKind::LoadIndex {
                    base: Box::new(base_ir),
                    index: Box::new(index_ir),
                },
                element,
                loc,
            ));
        }
        if base_ir.ty == TypeStore::BUFFER {
            if index_ir.ty != TypeStore::INT {
                return Err(CodegenError::new(
                    "buffer index must be an int",
                    index.span,
                ));
            }
            return Ok(Ir::new(
                IrKind::LoadIndex {
                    base: Box::new(base_ir),
                    index: Box::new(index_ir),
                },
                TypeStore::INT,
                loc,
            ));
        }
        // `[]` operator method on extended types.
        let args = vec![base_ir, index_ir];
        self.method_call_ir("[]", args, span, loc)
    }

    fn lower_member(
        &mut self,
        base: &Node,
        name: &str,
        span: Span,
        loc: Pos,
    ) -> Result<Ir, CodegenError> {
        let base_ir = self.lower_expr(base)?;
        self.require_value(&base_ir, base.span)?;
        let info = self.env.types.get(base_ir.ty);

        if (info.is_array() || base_ir.ty == TypeStore::BUFFER)
            && name == "length"
        {
            return Ok(Ir::new(
                IrKind::ArrayLen {
                    base: Box::new(base_ir),
                },
                TypeStore::INT,
                loc,
            ));
        }
        if let Some(index) = info.field_index(name) {
            let field_ty = info.fields[index].ty;
            return Ok(Ir::new(
                IrKind::LoadField {
                    object: Box::new(base_ir),
                    index: index as u16,
                },
                field_ty,
                loc,
            ));
        }
        Err(CodegenError::new(
            format!("type `{}` has no field `{name}`", info.name),
            span,
        ))
    }
}

fn int_opcode(op: BinaryOp) -> Option<Op> {
    Some(match op {
        BinaryOp::Add => Op::IAdd,
        BinaryOp::Sub => Op::ISub,
        BinaryOp::Mul => Op::IMul,
        BinaryOp::Div => Op::IDiv,
        BinaryOp::Mod => Op::IMod,
        BinaryOp::Shl => Op::IShl,
        BinaryOp::Shr => Op::IShr,
        BinaryOp::BitAnd => Op::IAnd,
        BinaryOp::BitOr => Op::IOr,
        BinaryOp::BitXor => Op::IXor,
        BinaryOp::Eq => Op::IEq,
        BinaryOp::Ne => Op::INe,
        BinaryOp::Lt => Op::ILt,
        BinaryOp::Le => Op::ILe,
        BinaryOp::Gt => Op::IGt,
        BinaryOp::Ge => Op::IGe,
        BinaryOp::LogAnd | BinaryOp::LogOr => return None,
    })
}

fn double_opcode(op: BinaryOp) -> Option<Op> {
    Some(match op {
        BinaryOp::Add => Op::DAdd,
        BinaryOp::Sub => Op::DSub,
        BinaryOp::Mul => Op::DMul,
        BinaryOp::Div => Op::DDiv,
        BinaryOp::Mod => Op::DMod,
        BinaryOp::Eq => Op::DEq,
        BinaryOp::Ne => Op::DNe,
        BinaryOp::Lt => Op::DLt,
        BinaryOp::Le => Op::DLe,
        BinaryOp::Gt => Op::DGt,
        BinaryOp::Ge => Op::DGe,
        _ => return None,
    })
}
