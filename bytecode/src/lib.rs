//! The Malang bytecode format: opcodes, the instruction builder and
//! decoder, and the pc→source side table used for stack traces.

mod builder;
mod decoder;
mod instruction;
mod op;
mod source_map;

pub use builder::{BytecodeBuilder, Label};
pub use decoder::{decode_at, BytecodeDecoder};
pub use instruction::Instruction;
pub use op::Op;
pub use source_map::{source_map_lookup, SourceMapBuilder};

#[cfg(test)]
mod tests {
    use super::*;

    fn decode_all(bytes: &[u8]) -> Vec<Instruction> {
        BytecodeDecoder::new(bytes).collect()
    }

    #[test]
    fn round_trip_loads_and_locals() {
        let mut b = BytecodeBuilder::new();
        b.load_const(42);
        b.load_true();
        b.load_false();
        b.load_nothing();
        b.load_local(5);
        b.store_local(1000);
        b.alloc_locals(7);
        b.dup();
        b.drop_top();
        b.drop_n(3);
        b.ret();

        assert_eq!(decode_all(b.as_bytes()), vec![
            Instruction::LoadConst { idx: 42 },
            Instruction::LoadTrue,
            Instruction::LoadFalse,
            Instruction::LoadNothing,
            Instruction::LoadLocal { slot: 5 },
            Instruction::StoreLocal { slot: 1000 },
            Instruction::AllocLocals { count: 7 },
            Instruction::Dup,
            Instruction::Drop,
            Instruction::DropN { count: 3 },
            Instruction::Return,
        ]);
    }

    #[test]
    fn round_trip_arithmetic() {
        let mut b = BytecodeBuilder::new();
        for op in [
            Op::IAdd,
            Op::ISub,
            Op::IMul,
            Op::IDiv,
            Op::IMod,
            Op::IShl,
            Op::IShr,
            Op::IAnd,
            Op::IOr,
            Op::IXor,
            Op::IEq,
            Op::ILt,
            Op::INeg,
            Op::IInvert,
            Op::Not,
            Op::DAdd,
            Op::DDiv,
            Op::DLe,
            Op::DNeg,
        ] {
            b.simple(op);
        }

        assert_eq!(decode_all(b.as_bytes()), vec![
            Instruction::IAdd,
            Instruction::ISub,
            Instruction::IMul,
            Instruction::IDiv,
            Instruction::IMod,
            Instruction::IShl,
            Instruction::IShr,
            Instruction::IAnd,
            Instruction::IOr,
            Instruction::IXor,
            Instruction::IEq,
            Instruction::ILt,
            Instruction::INeg,
            Instruction::IInvert,
            Instruction::Not,
            Instruction::DAdd,
            Instruction::DDiv,
            Instruction::DLe,
            Instruction::DNeg,
        ]);
    }

    #[test]
    fn round_trip_calls_and_objects() {
        let mut b = BytecodeBuilder::new();
        b.call(3);
        b.call_method(65535);
        b.call_virtual(2, 3);
        b.call_native(9);
        b.alloc_object(11);
        b.dealloc_object();
        b.load_field(0);
        b.store_field(4);
        b.alloc_array(1);
        b.load_index();
        b.store_index();
        b.array_len();
        b.breakpoint();

        assert_eq!(decode_all(b.as_bytes()), vec![
            Instruction::Call { id: 3 },
            Instruction::CallMethod { id: 65535 },
            Instruction::CallVirtual { slot: 2, argc: 3 },
            Instruction::CallNative { id: 9 },
            Instruction::AllocObject { type_id: 11 },
            Instruction::DeallocObject,
            Instruction::LoadField { index: 0 },
            Instruction::StoreField { index: 4 },
            Instruction::AllocArray { elem_type_id: 1 },
            Instruction::LoadIndex,
            Instruction::StoreIndex,
            Instruction::ArrayLen,
            Instruction::Breakpoint,
        ]);
    }

    #[test]
    fn forward_branch_binds_to_following_instruction() {
        let mut b = BytecodeBuilder::new();
        b.load_false();
        let skip = b.branch_if_false();
        b.load_const(1);
        b.bind(skip);
        b.ret();

        assert_eq!(decode_all(b.as_bytes()), vec![
            Instruction::LoadFalse,
            Instruction::BranchIfFalse { offset: 3 },
            Instruction::LoadConst { idx: 1 },
            Instruction::Return,
        ]);
    }

    #[test]
    fn backward_branch() {
        let mut b = BytecodeBuilder::new();
        let top = b.current_offset();
        b.load_local(0);
        b.drop_top();
        b.branch_back(top);

        // LoadLocal (3) + Drop (1) + Branch opcode (1) + offset (4) = 9.
        assert_eq!(decode_all(b.as_bytes()), vec![
            Instruction::LoadLocal { slot: 0 },
            Instruction::Drop,
            Instruction::Branch { offset: -9 },
        ]);
    }

    #[test]
    fn while_shape_loops_back_to_condition() {
        // condition, BranchIfFalse end, body, Branch top, end:
        let mut b = BytecodeBuilder::new();
        let top = b.current_offset();
        b.load_true();
        let end = b.branch_if_false();
        b.load_const(0);
        b.drop_top();
        b.branch_back(top);
        b.bind(end);
        b.ret();

        let decoded = decode_all(b.as_bytes());
        assert_eq!(decoded[1], Instruction::BranchIfFalse { offset: 9 });
        assert_eq!(decoded[4], Instruction::Branch { offset: -15 });
    }

    #[test]
    fn conditional_backward_branch() {
        let mut b = BytecodeBuilder::new();
        let top = b.current_offset();
        b.load_false();
        b.branch_back_if_false(top);

        // LoadFalse (1) + BranchIfFalse opcode (1) + offset (4) = 6.
        assert_eq!(decode_all(b.as_bytes()), vec![
            Instruction::LoadFalse,
            Instruction::BranchIfFalse { offset: -6 },
        ]);
    }

    #[test]
    fn display_for_disassembly() {
        assert_eq!(Instruction::LoadConst { idx: 3 }.to_string(), "LoadConst #3");
        assert_eq!(Instruction::LoadLocal { slot: 2 }.to_string(), "LoadLocal l2");
        assert_eq!(
            Instruction::CallVirtual { slot: 1, argc: 2 }.to_string(),
            "CallVirtual slot 1 argc 2"
        );
        assert_eq!(
            Instruction::Branch { offset: -9 }.to_string(),
            "Branch -9"
        );
        assert_eq!(
            Instruction::BranchIfTrue { offset: 4 }.to_string(),
            "BranchIfTrue +4"
        );
    }

    #[test]
    fn decode_at_reports_next_pc() {
        let mut b = BytecodeBuilder::new();
        b.load_const(7);
        b.simple(Op::IAdd);
        let bytes = b.as_bytes();
        let (instr, next) = decode_at(bytes, 0);
        assert_eq!(instr, Instruction::LoadConst { idx: 7 });
        assert_eq!(next, 3);
        let (instr, next) = decode_at(bytes, next);
        assert_eq!(instr, Instruction::IAdd);
        assert_eq!(next, 4);
    }

    #[test]
    fn operand_bytes_match_encoding() {
        let mut b = BytecodeBuilder::new();
        b.load_const(1);
        assert_eq!(b.as_bytes().len(), 1 + Op::LoadConst.operand_bytes());

        let mut b = BytecodeBuilder::new();
        b.call_virtual(1, 2);
        assert_eq!(b.as_bytes().len(), 1 + Op::CallVirtual.operand_bytes());

        let mut b = BytecodeBuilder::new();
        let label = b.branch();
        b.bind(label);
        assert_eq!(b.as_bytes().len(), 1 + Op::Branch.operand_bytes());
    }
}
