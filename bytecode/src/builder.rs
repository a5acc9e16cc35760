use crate::op::Op;

/// A forward branch whose offset has not yet been resolved.
///
/// Created by [`BytecodeBuilder::branch`] and friends; resolve it with
/// [`BytecodeBuilder::bind`].
#[derive(Debug)]
#[must_use = "unbound labels leave a zero offset in the stream"]
pub struct Label {
    /// Position of the i32 offset bytes in the buffer.
    offset_pos: usize,
    /// Position right after the branch instruction (base for the
    /// relative offset).
    base: usize,
}

/// Builds a bytecode byte sequence with two-pass label resolution:
/// forward branches are emitted with placeholder offsets and patched
/// when their label is bound.
pub struct BytecodeBuilder {
    buf: Vec<u8>,
}

impl BytecodeBuilder {
    pub fn new() -> Self {
        Self { buf: Vec::new() }
    }

    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            buf: Vec::with_capacity(capacity),
        }
    }

    /// Current byte offset in the bytecode stream.
    pub fn current_offset(&self) -> usize {
        self.buf.len()
    }

    pub fn into_bytes(self) -> Vec<u8> {
        self.buf
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.buf
    }

    // ── emit helpers ───────────────────────────────────────────────

    fn emit_op(&mut self, op: Op) {
        self.buf.push(op as u8);
    }

    fn emit_u8(&mut self, v: u8) {
        self.buf.push(v);
    }

    fn emit_u16(&mut self, v: u16) {
        self.buf.extend_from_slice(&v.to_le_bytes());
    }

    fn emit_i32(&mut self, v: i32) {
        self.buf.extend_from_slice(&v.to_le_bytes());
    }

    // ── constants / loads ──────────────────────────────────────────

    pub fn load_const(&mut self, idx: u16) {
        self.emit_op(Op::LoadConst);
        self.emit_u16(idx);
    }

    pub fn load_true(&mut self) {
        self.emit_op(Op::LoadTrue);
    }

    pub fn load_false(&mut self) {
        self.emit_op(Op::LoadFalse);
    }

    pub fn load_nothing(&mut self) {
        self.emit_op(Op::LoadNothing);
    }

    // ── locals ─────────────────────────────────────────────────────

    pub fn load_local(&mut self, slot: u16) {
        self.emit_op(Op::LoadLocal);
        self.emit_u16(slot);
    }

    pub fn store_local(&mut self, slot: u16) {
        self.emit_op(Op::StoreLocal);
        self.emit_u16(slot);
    }

    pub fn alloc_locals(&mut self, count: u16) {
        self.emit_op(Op::AllocLocals);
        self.emit_u16(count);
    }

    // ── stack ──────────────────────────────────────────────────────

    pub fn dup(&mut self) {
        self.emit_op(Op::Dup);
    }

    pub fn drop_top(&mut self) {
        self.emit_op(Op::Drop);
    }

    pub fn drop_n(&mut self, count: u8) {
        self.emit_op(Op::DropN);
        self.emit_u8(count);
    }

    /// Emit a bare opcode (the arithmetic and comparison families and
    /// other operand-less instructions).
    pub fn simple(&mut self, op: Op) {
        debug_assert_eq!(op.operand_bytes(), 0, "{op:?} takes operands");
        self.emit_op(op);
    }

    // ── control ────────────────────────────────────────────────────

    /// Emit an unconditional forward branch. Returns a [`Label`] to be
    /// resolved with [`bind`](Self::bind).
    pub fn branch(&mut self) -> Label {
        self.emit_branch_placeholder(Op::Branch)
    }

    pub fn branch_if_true(&mut self) -> Label {
        self.emit_branch_placeholder(Op::BranchIfTrue)
    }

    pub fn branch_if_false(&mut self) -> Label {
        self.emit_branch_placeholder(Op::BranchIfFalse)
    }

    /// Bind a forward branch label to the current position.
    pub fn bind(&mut self, label: Label) {
        let target = self.buf.len();
        let offset = (target as i64 - label.base as i64) as i32;
        self.buf[label.offset_pos..label.offset_pos + 4]
            .copy_from_slice(&offset.to_le_bytes());
    }

    /// Emit an unconditional backward branch to `target` (a byte offset
    /// obtained from [`current_offset`](Self::current_offset)).
    pub fn branch_back(&mut self, target: usize) {
        self.emit_op(Op::Branch);
        let base = self.buf.len() + 4;
        self.emit_i32((target as i64 - base as i64) as i32);
    }

    pub fn branch_back_if_false(&mut self, target: usize) {
        self.emit_op(Op::BranchIfFalse);
        let base = self.buf.len() + 4;
        self.emit_i32((target as i64 - base as i64) as i32);
    }

    fn emit_branch_placeholder(&mut self, op: Op) -> Label {
        self.emit_op(op);
        let offset_pos = self.buf.len();
        self.emit_i32(0); // placeholder
        let base = self.buf.len();
        Label { offset_pos, base }
    }

    pub fn ret(&mut self) {
        self.emit_op(Op::Return);
    }

    // ── calls ──────────────────────────────────────────────────────

    pub fn call(&mut self, id: u16) {
        self.emit_op(Op::Call);
        self.emit_u16(id);
    }

    pub fn call_method(&mut self, id: u16) {
        self.emit_op(Op::CallMethod);
        self.emit_u16(id);
    }

    pub fn call_virtual(&mut self, slot: u16, argc: u8) {
        self.emit_op(Op::CallVirtual);
        self.emit_u16(slot);
        self.emit_u8(argc);
    }

    pub fn call_native(&mut self, id: u16) {
        self.emit_op(Op::CallNative);
        self.emit_u16(id);
    }

    // ── objects ────────────────────────────────────────────────────

    pub fn alloc_object(&mut self, type_id: u16) {
        self.emit_op(Op::AllocObject);
        self.emit_u16(type_id);
    }

    pub fn dealloc_object(&mut self) {
        self.emit_op(Op::DeallocObject);
    }

    pub fn load_field(&mut self, index: u16) {
        self.emit_op(Op::LoadField);
        self.emit_u16(index);
    }

    pub fn store_field(&mut self, index: u16) {
        self.emit_op(Op::StoreField);
        self.emit_u16(index);
    }

    pub fn alloc_array(&mut self, elem_type_id: u16) {
        self.emit_op(Op::AllocArray);
        self.emit_u16(elem_type_id);
    }

    pub fn load_index(&mut self) {
        self.emit_op(Op::LoadIndex);
    }

    pub fn store_index(&mut self) {
        self.emit_op(Op::StoreIndex);
    }

    pub fn array_len(&mut self) {
        self.emit_op(Op::ArrayLen);
    }

    pub fn breakpoint(&mut self) {
        self.emit_op(Op::Breakpoint);
    }
}

impl Default for BytecodeBuilder {
    fn default() -> Self {
        Self::new()
    }
}
