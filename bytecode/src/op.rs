/// Bytecode opcodes.
///
/// Every opcode has a fixed-width operand encoding; the decoder advances
/// the program counter by `1 + operand_bytes()`. Pool and table indices
/// are 16-bit, branch offsets are 32-bit and relative to the end of the
/// instruction.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum Op {
    // ── Constants / loads ──────────────────────────────────────────
    /// Push a constant pool entry. Operands: `idx:u16`
    LoadConst = 0,
    /// Push `true`.
    LoadTrue,
    /// Push `false`.
    LoadFalse,
    /// Push the nothing value (null reference / void result).
    LoadNothing,

    // ── Locals ─────────────────────────────────────────────────────
    /// Push local slot `n` of the current frame. Operands: `n:u16`
    LoadLocal,
    /// Pop into local slot `n`. Operands: `n:u16`
    StoreLocal,
    /// Reserve `n` zeroed local slots; first instruction of a function.
    /// Operands: `n:u16`
    AllocLocals,

    // ── Stack ──────────────────────────────────────────────────────
    Dup,
    Drop,
    /// Pop `n` values. Operands: `n:u8`
    DropN,

    // ── Integer arithmetic / logic ─────────────────────────────────
    IAdd,
    ISub,
    IMul,
    /// Traps on a zero divisor.
    IDiv,
    /// Traps on a zero divisor.
    IMod,
    IShl,
    IShr,
    IAnd,
    IOr,
    IXor,
    IEq,
    INe,
    ILt,
    ILe,
    IGt,
    IGe,
    INeg,
    /// Bitwise complement.
    IInvert,

    // ── Boolean ────────────────────────────────────────────────────
    Not,

    // ── Double arithmetic ──────────────────────────────────────────
    DAdd,
    DSub,
    DMul,
    DDiv,
    DMod,
    DEq,
    DNe,
    DLt,
    DLe,
    DGt,
    DGe,
    DNeg,

    // ── Control ────────────────────────────────────────────────────
    /// Unconditional relative jump. Operands: `off:i32`
    Branch,
    /// Pop a boolean; jump when true. Operands: `off:i32`
    BranchIfTrue,
    /// Pop a boolean; jump when false. Operands: `off:i32`
    BranchIfFalse,
    /// Return from the current frame; the result (if the callee is
    /// non-void) is on top of the data stack.
    Return,

    // ── Calls ──────────────────────────────────────────────────────
    /// Call a bound bytecode function. Operands: `id:u16`
    Call,
    /// Call a statically resolved method. Operands: `id:u16`
    CallMethod,
    /// Dispatch through the receiver's vtable.
    /// Operands: `slot:u16`, `argc:u8`
    CallVirtual,
    /// Invoke a native thunk. Operands: `id:u16`
    CallNative,

    // ── Objects ────────────────────────────────────────────────────
    /// Allocate a plain object of the given type (GC safepoint).
    /// Operands: `type_id:u16`
    AllocObject,
    /// Advisory free: pops the reference and drops it; sweep reclaims.
    DeallocObject,
    /// Pop an object, push field `n`. Operands: `n:u16`
    LoadField,
    /// Pop a value and an object, store field `n`. Operands: `n:u16`
    StoreField,
    /// Pop a length, allocate an array of the element type (GC
    /// safepoint). Operands: `elem_type_id:u16`
    AllocArray,
    /// Pop an index and an array/buffer, push the element.
    LoadIndex,
    /// Pop a value, an index, and an array/buffer; store the element.
    StoreIndex,
    /// Pop an array/buffer, push its length as a fixnum.
    ArrayLen,

    // ── Debug ──────────────────────────────────────────────────────
    Breakpoint,
}

impl Op {
    pub const COUNT: usize = Op::Breakpoint as usize + 1;

    /// Convert a raw byte to an opcode without a bounds check.
    ///
    /// # Safety
    ///
    /// `byte` must be a valid opcode value (`< Op::COUNT`).
    #[inline(always)]
    pub unsafe fn from_u8_unchecked(byte: u8) -> Self {
        debug_assert!(
            (byte as usize) < Self::COUNT,
            "invalid opcode: 0x{byte:02x}"
        );
        core::mem::transmute::<u8, Op>(byte)
    }

    /// Width of this opcode's operands in bytes.
    pub const fn operand_bytes(self) -> usize {
        match self {
            Op::LoadConst
            | Op::LoadLocal
            | Op::StoreLocal
            | Op::AllocLocals
            | Op::Call
            | Op::CallMethod
            | Op::CallNative
            | Op::AllocObject
            | Op::LoadField
            | Op::StoreField
            | Op::AllocArray => 2,
            Op::CallVirtual => 3,
            Op::DropN => 1,
            Op::Branch | Op::BranchIfTrue | Op::BranchIfFalse => 4,
            _ => 0,
        }
    }

    /// Net change to the data stack height, when it is the same at every
    /// use of the opcode. Calls and `DropN` return `None`: their effect
    /// depends on the callee's signature or the operand.
    pub const fn stack_delta(self) -> Option<i8> {
        match self {
            Op::LoadConst
            | Op::LoadTrue
            | Op::LoadFalse
            | Op::LoadNothing
            | Op::LoadLocal
            | Op::Dup
            | Op::AllocObject => Some(1),
            Op::StoreLocal
            | Op::Drop
            | Op::DeallocObject
            | Op::BranchIfTrue
            | Op::BranchIfFalse
            | Op::LoadIndex => Some(-1),
            Op::IAdd
            | Op::ISub
            | Op::IMul
            | Op::IDiv
            | Op::IMod
            | Op::IShl
            | Op::IShr
            | Op::IAnd
            | Op::IOr
            | Op::IXor
            | Op::IEq
            | Op::INe
            | Op::ILt
            | Op::ILe
            | Op::IGt
            | Op::IGe
            | Op::DAdd
            | Op::DSub
            | Op::DMul
            | Op::DDiv
            | Op::DMod
            | Op::DEq
            | Op::DNe
            | Op::DLt
            | Op::DLe
            | Op::DGt
            | Op::DGe => Some(-1),
            Op::INeg
            | Op::IInvert
            | Op::Not
            | Op::DNeg
            | Op::AllocLocals
            | Op::Branch
            | Op::LoadField
            | Op::AllocArray
            | Op::ArrayLen
            | Op::Breakpoint => Some(0),
            Op::StoreField => Some(-2),
            Op::StoreIndex => Some(-3),
            Op::Return | Op::Call | Op::CallMethod | Op::CallVirtual
            | Op::CallNative | Op::DropN => None,
        }
    }
}

impl TryFrom<u8> for Op {
    type Error = u8;

    fn try_from(byte: u8) -> Result<Self, u8> {
        if byte < Self::COUNT as u8 {
            // SAFETY: Op is repr(u8) with contiguous variants starting at 0.
            Ok(unsafe { core::mem::transmute::<u8, Op>(byte) })
        } else {
            Err(byte)
        }
    }
}
