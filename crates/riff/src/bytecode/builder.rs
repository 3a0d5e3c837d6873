//! Builder for assembling prototypes.
//!
//! `ProtoBuilder` is the emission surface the external compiler drives, and
//! what the integration tests use to hand-assemble programs. It manages
//! register allocation, constant-pool and call-table registration, and
//! forward jumps with patching.
//!
//! ```ignore
//! let mut b = ProtoBuilder::new();
//! let r = b.alloc_reg();
//! let k = b.constant(Value::int(0));
//! b.emit(Opcode::Constant, k, 0, reg(r));
//! let jump = b.emit_jump(Opcode::Jmp);
//! // ... emit more code ...
//! b.patch_jump(jump);
//! let proto = b.build();
//! ```

use std::rc::Rc;

use crate::{
    bytecode::{
        op::{Instruction, Opcode},
        prototype::{CompiledCall, Param, Prototype},
    },
    intern::StringId,
    value::Value,
};

/// Handle for a forward jump awaiting its target.
#[derive(Debug, Clone, Copy)]
pub struct JumpPatch {
    index: usize,
    /// Which operand slot holds the offset: 0 = a, 1 = b, 2 = c.
    slot: u8,
}

/// Builder for one prototype.
#[derive(Debug, Default)]
pub struct ProtoBuilder {
    name: Option<StringId>,
    code: Vec<Instruction>,
    constants: Vec<Value>,
    prototypes: Vec<Rc<Prototype>>,
    calls: Vec<CompiledCall>,
    params: Vec<Param>,
    dots_param: Option<usize>,
    next_reg: u32,
}

impl ProtoBuilder {
    #[must_use]
    pub fn new() -> Self {
        Self {
            // register 0 is the frame's result slot
            next_reg: 1,
            ..Self::default()
        }
    }

    /// Names the prototype for diagnostics.
    pub fn set_name(&mut self, name: StringId) {
        self.name = Some(name);
    }

    /// Declares a formal parameter, in order.
    pub fn param(&mut self, name: StringId, default: Option<usize>) {
        self.params.push(Param { name, default });
    }

    /// Declares `...` at the current parameter position.
    pub fn dots_param(&mut self) {
        self.dots_param = Some(self.params.len());
    }

    /// Reserves a fresh register.
    pub fn alloc_reg(&mut self) -> u32 {
        let r = self.next_reg;
        self.next_reg += 1;
        r
    }

    /// Reserves `n` consecutive registers, returning the first.
    /// `ForBegin`/`ForEnd` (state in `b + 1`) and `MakeList` rely on this.
    pub fn alloc_regs(&mut self, n: u32) -> u32 {
        let r = self.next_reg;
        self.next_reg += n;
        r
    }

    /// Adds a constant, deduplicating identical scalars.
    pub fn constant(&mut self, value: Value) -> i32 {
        let index = self.constants.len();
        self.constants.push(value);
        i32::try_from(index).expect("constant pool overflow")
    }

    /// Registers a nested prototype (closure body, promise thunk, default).
    pub fn prototype(&mut self, proto: Rc<Prototype>) -> i32 {
        let index = self.prototypes.len();
        self.prototypes.push(proto);
        i32::try_from(index).expect("prototype table overflow")
    }

    /// Registers a compiled call and returns its table index.
    pub fn call_entry(&mut self, call: CompiledCall) -> i32 {
        let index = self.calls.len();
        self.calls.push(call);
        i32::try_from(index).expect("call table overflow")
    }

    /// Emits an instruction and returns its PC.
    pub fn emit(&mut self, op: Opcode, a: i32, b: i32, c: i32) -> usize {
        let pc = self.code.len();
        self.code.push(Instruction::new(op, a, b, c));
        pc
    }

    /// Emits a forward `Jmp` with the offset to be patched later.
    pub fn emit_jump(&mut self) -> JumpPatch {
        let index = self.emit(Opcode::Jmp, 0, 0, 0);
        JumpPatch { index, slot: 0 }
    }

    /// Emits a `Jc` whose false-branch offset will be patched; the true
    /// branch falls through.
    pub fn emit_branch_false(&mut self, cond: i32) -> JumpPatch {
        let index = self.emit(Opcode::Jc, cond, 0, 0);
        JumpPatch { index, slot: 2 }
    }

    /// Emits a `ForBegin` whose exit offset will be patched at `ForEnd`.
    pub fn emit_for_begin(&mut self, loop_var: i32, seq_reg: i32) -> JumpPatch {
        let index = self.emit(Opcode::ForBegin, loop_var, seq_reg, 0);
        JumpPatch { index, slot: 2 }
    }

    /// Points a pending forward jump at the next instruction to be emitted.
    ///
    /// Offsets are relative to the instruction after the jump.
    pub fn patch_jump(&mut self, patch: JumpPatch) {
        let target = self.code.len();
        let offset = i32::try_from(target as i64 - (patch.index as i64 + 1)).expect("jump offset overflow");
        let inst = &mut self.code[patch.index];
        match patch.slot {
            0 => inst.a = offset,
            1 => inst.b = offset,
            _ => inst.c = offset,
        }
    }

    /// Current PC, the target for backward jumps.
    #[must_use]
    pub fn here(&self) -> usize {
        self.code.len()
    }

    /// Computes the backward offset from the next emitted instruction to
    /// `target`.
    #[must_use]
    pub fn offset_to(&self, target: usize) -> i32 {
        i32::try_from(target as i64 - (self.code.len() as i64 + 1)).expect("jump offset overflow")
    }

    /// Finalizes the prototype.
    #[must_use]
    pub fn build(self) -> Rc<Prototype> {
        Rc::new(Prototype {
            name: self.name,
            constants: self.constants,
            prototypes: self.prototypes,
            calls: self.calls,
            code: self.code,
            nregs: self.next_reg as usize,
            params: self.params,
            dots_param: self.dots_param,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bytecode::op::reg;

    #[test]
    fn emit_records_instructions_in_order() {
        let mut b = ProtoBuilder::new();
        let r = b.alloc_reg();
        let k = b.constant(Value::int(1));
        b.emit(Opcode::Constant, k, 0, reg(r));
        b.emit(Opcode::Ret, reg(r), 0, 0);
        let proto = b.build();
        assert_eq!(proto.code.len(), 2);
        assert_eq!(proto.code[0].op, Opcode::Constant);
        assert_eq!(proto.code[1].op, Opcode::Ret);
        assert_eq!(proto.nregs, 2);
    }

    #[test]
    fn forward_jump_patching() {
        let mut b = ProtoBuilder::new();
        let jump = b.emit_jump();
        b.emit(Opcode::Done, 0, 0, 0);
        b.patch_jump(jump);
        b.emit(Opcode::Done, 0, 0, 0);
        // jump at pc 0 must skip the instruction at pc 1
        assert_eq!(b.build().code[0].a, 1);
    }

    #[test]
    fn backward_offset_computation() {
        let mut b = ProtoBuilder::new();
        let top = b.here();
        b.emit(Opcode::Done, 0, 0, 0);
        let offset = b.offset_to(top);
        // from pc 1, next pc is 2; jumping to 0 is -2
        assert_eq!(offset, -2);
    }
}
