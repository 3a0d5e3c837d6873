//! x86-64 assembler surface.
//!
//! Provides the 64-bit encodings for the opcode subset the trace lowering
//! uses: integer ALU operations, SSE2 scalar/packed double arithmetic,
//! moves, and jumps in short and long forms. Labels resolve forward
//! references through a linked list threaded through the unresolved
//! reference sites, fixed up on `bind`.
//!
//! The internal buffer grows by doubling on overflow. An assembler over an
//! external fixed-size buffer instead records an overflow error that
//! `finish` reports to the caller.

use std::fmt;

/// General-purpose registers, hardware encoding order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum Reg {
    Rax = 0,
    Rcx = 1,
    Rdx = 2,
    Rbx = 3,
    Rsp = 4,
    Rbp = 5,
    Rsi = 6,
    Rdi = 7,
    R8 = 8,
    R9 = 9,
    R10 = 10,
    R11 = 11,
    R12 = 12,
    R13 = 13,
    R14 = 14,
    R15 = 15,
}

/// SSE registers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum Xmm {
    Xmm0 = 0,
    Xmm1 = 1,
    Xmm2 = 2,
    Xmm3 = 3,
    Xmm4 = 4,
    Xmm5 = 5,
    Xmm6 = 6,
    Xmm7 = 7,
}

/// Condition codes (the low nibble of the 0F 8x jcc opcodes).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum Cond {
    O = 0x0,
    No = 0x1,
    B = 0x2,
    Ae = 0x3,
    E = 0x4,
    Ne = 0x5,
    Be = 0x6,
    A = 0x7,
    S = 0x8,
    Ns = 0x9,
    L = 0xC,
    Ge = 0xD,
    Le = 0xE,
    G = 0xF,
}

impl Cond {
    /// The condition that jumps exactly when `self` does not.
    #[must_use]
    pub fn negate(self) -> Self {
        // flip the low bit of the condition code
        match self {
            Self::O => Self::No,
            Self::No => Self::O,
            Self::B => Self::Ae,
            Self::Ae => Self::B,
            Self::E => Self::Ne,
            Self::Ne => Self::E,
            Self::Be => Self::A,
            Self::A => Self::Be,
            Self::S => Self::Ns,
            Self::Ns => Self::S,
            Self::L => Self::Ge,
            Self::Ge => Self::L,
            Self::Le => Self::G,
            Self::G => Self::Le,
        }
    }
}

/// Assembler error: only external fixed buffers can fail.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BufferOverflow;

impl fmt::Display for BufferOverflow {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "fixed assembler buffer overflow")
    }
}

impl std::error::Error for BufferOverflow {}

/// A label: an index into the assembler's label table.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Label(usize);

/// Sentinel terminating a fixup chain.
const CHAIN_END: u32 = u32::MAX;

#[derive(Debug, Clone, Copy)]
enum LabelState {
    /// Head of the linked list of unresolved rel32 sites, threaded through
    /// the placeholder bytes themselves.
    Unbound { head: u32 },
    Bound { pos: usize },
}

/// The assembler.
#[derive(Debug)]
pub struct Assembler {
    buf: Vec<u8>,
    len: usize,
    /// None: owned, grows by doubling. Some(cap): external fixed size.
    fixed: Option<usize>,
    overflowed: bool,
    labels: Vec<LabelState>,
}

impl Default for Assembler {
    fn default() -> Self {
        Self::new()
    }
}

impl Assembler {
    /// An assembler with an owned, growable buffer.
    #[must_use]
    pub fn new() -> Self {
        Self {
            buf: vec![0; 256],
            len: 0,
            fixed: None,
            overflowed: false,
            labels: Vec::new(),
        }
    }

    /// An assembler over a fixed-size buffer; emission past the end is an
    /// error surfaced by [`Self::finish`].
    #[must_use]
    pub fn fixed(capacity: usize) -> Self {
        Self {
            buf: vec![0; capacity],
            len: 0,
            fixed: Some(capacity),
            overflowed: false,
            labels: Vec::new(),
        }
    }

    /// Bytes emitted so far.
    #[must_use]
    pub fn len(&self) -> usize {
        self.len
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Finalizes the code.
    ///
    /// # Errors
    /// An external fixed buffer that overflowed is fatal to the caller.
    pub fn finish(mut self) -> Result<Vec<u8>, BufferOverflow> {
        if self.overflowed {
            return Err(BufferOverflow);
        }
        debug_assert!(
            self.labels.iter().all(|l| matches!(l, LabelState::Bound { .. })),
            "finish with unbound labels"
        );
        self.buf.truncate(self.len);
        Ok(self.buf)
    }

    fn byte(&mut self, b: u8) {
        if self.len == self.buf.len() {
            match self.fixed {
                Some(_) => {
                    self.overflowed = true;
                    return;
                }
                None => self.buf.resize((self.buf.len() * 2).max(256), 0),
            }
        }
        if self.len < self.buf.len() {
            self.buf[self.len] = b;
            self.len += 1;
        }
    }

    fn bytes(&mut self, bs: &[u8]) {
        for &b in bs {
            self.byte(b);
        }
    }

    fn u32le(&mut self, v: u32) {
        self.bytes(&v.to_le_bytes());
    }

    fn rex(&mut self, w: bool, reg: u8, rm: u8) {
        let mut b = 0x40;
        if w {
            b |= 0x08;
        }
        if reg >= 8 {
            b |= 0x04;
        }
        if rm >= 8 {
            b |= 0x01;
        }
        if b != 0x40 || w {
            self.byte(b);
        }
    }

    fn modrm(&mut self, md: u8, reg: u8, rm: u8) {
        self.byte((md << 6) | ((reg & 7) << 3) | (rm & 7));
    }

    // ---- labels ----

    /// Creates a fresh unbound label.
    pub fn label(&mut self) -> Label {
        self.labels.push(LabelState::Unbound { head: CHAIN_END });
        Label(self.labels.len() - 1)
    }

    /// Binds a label to the current position, resolving its fixup chain.
    ///
    /// Each unresolved rel32 site holds the offset of the previous site;
    /// binding walks the chain and patches every site relative to its own
    /// end.
    pub fn bind(&mut self, label: Label) {
        let pos = self.len;
        let LabelState::Unbound { mut head } = self.labels[label.0] else {
            panic!("label bound twice");
        };
        while head != CHAIN_END {
            let site = head as usize;
            let next = u32::from_le_bytes(self.buf[site..site + 4].try_into().expect("truncated fixup site"));
            let rel = i32::try_from(pos as i64 - (site as i64 + 4)).expect("jump distance overflow");
            self.buf[site..site + 4].copy_from_slice(&rel.to_le_bytes());
            head = next;
        }
        self.labels[label.0] = LabelState::Bound { pos };
    }

    /// Emits a rel32 referencing `label`: either the resolved displacement
    /// or a new link in the fixup chain.
    fn rel32(&mut self, label: Label) {
        match self.labels[label.0] {
            LabelState::Bound { pos } => {
                let rel = i32::try_from(pos as i64 - (self.len as i64 + 4)).expect("jump distance overflow");
                self.u32le(rel as u32);
            }
            LabelState::Unbound { head } => {
                let site = self.len as u32;
                self.u32le(head);
                self.labels[label.0] = LabelState::Unbound { head: site };
            }
        }
    }

    // ---- moves ----

    /// `mov r64, imm64`.
    pub fn mov_imm64(&mut self, dst: Reg, imm: i64) {
        self.rex(true, 0, dst as u8);
        self.byte(0xB8 + (dst as u8 & 7));
        self.bytes(&imm.to_le_bytes());
    }

    /// `mov r64, r64`.
    pub fn mov_rr(&mut self, dst: Reg, src: Reg) {
        self.rex(true, src as u8, dst as u8);
        self.byte(0x89);
        self.modrm(3, src as u8, dst as u8);
    }

    /// `mov r64, [base + disp32]`.
    pub fn mov_rm(&mut self, dst: Reg, base: Reg, disp: i32) {
        assert!(!matches!(base, Reg::Rsp | Reg::R12), "SIB bases are not supported");
        self.rex(true, dst as u8, base as u8);
        self.byte(0x8B);
        self.modrm(2, dst as u8, base as u8);
        self.u32le(disp as u32);
    }

    /// `mov [base + disp32], r64`.
    pub fn mov_mr(&mut self, base: Reg, disp: i32, src: Reg) {
        assert!(!matches!(base, Reg::Rsp | Reg::R12), "SIB bases are not supported");
        self.rex(true, src as u8, base as u8);
        self.byte(0x89);
        self.modrm(2, src as u8, base as u8);
        self.u32le(disp as u32);
    }

    /// `mov r64, [base + index*8 + disp32]` (the gather addressing mode).
    pub fn mov_r_index8(&mut self, dst: Reg, base: Reg, index: Reg, disp: i32) {
        assert!(!matches!(index, Reg::Rsp), "rsp cannot be an index");
        let mut rex = 0x48;
        if dst as u8 >= 8 {
            rex |= 0x04;
        }
        if index as u8 >= 8 {
            rex |= 0x02;
        }
        if base as u8 >= 8 {
            rex |= 0x01;
        }
        self.byte(rex);
        self.byte(0x8B);
        // mod=10 rm=100 selects the SIB byte; scale=3 encodes *8
        self.modrm(2, dst as u8, 4);
        self.byte((3 << 6) | ((index as u8 & 7) << 3) | (base as u8 & 7));
        self.u32le(disp as u32);
    }

    // ---- integer ALU ----

    pub fn add_rr(&mut self, dst: Reg, src: Reg) {
        self.rex(true, src as u8, dst as u8);
        self.byte(0x01);
        self.modrm(3, src as u8, dst as u8);
    }

    pub fn sub_rr(&mut self, dst: Reg, src: Reg) {
        self.rex(true, src as u8, dst as u8);
        self.byte(0x29);
        self.modrm(3, src as u8, dst as u8);
    }

    pub fn imul_rr(&mut self, dst: Reg, src: Reg) {
        self.rex(true, dst as u8, src as u8);
        self.bytes(&[0x0F, 0xAF]);
        self.modrm(3, dst as u8, src as u8);
    }

    pub fn cmp_rr(&mut self, a: Reg, b: Reg) {
        self.rex(true, b as u8, a as u8);
        self.byte(0x39);
        self.modrm(3, b as u8, a as u8);
    }

    pub fn test_rr(&mut self, a: Reg, b: Reg) {
        self.rex(true, b as u8, a as u8);
        self.byte(0x85);
        self.modrm(3, b as u8, a as u8);
    }

    // ---- stack ----

    pub fn push(&mut self, reg: Reg) {
        if reg as u8 >= 8 {
            self.byte(0x41);
        }
        self.byte(0x50 + (reg as u8 & 7));
    }

    pub fn pop(&mut self, reg: Reg) {
        if reg as u8 >= 8 {
            self.byte(0x41);
        }
        self.byte(0x58 + (reg as u8 & 7));
    }

    // ---- control ----

    /// `jmp rel32` to a label (long form).
    pub fn jmp(&mut self, label: Label) {
        self.byte(0xE9);
        self.rel32(label);
    }

    /// `jmp rel8` with a fixed displacement (short form).
    pub fn jmp_short(&mut self, disp: i8) {
        self.bytes(&[0xEB, disp.to_ne_bytes()[0]]);
    }

    /// `jcc rel32` to a label (long form).
    pub fn jcc(&mut self, cond: Cond, label: Label) {
        self.bytes(&[0x0F, 0x80 + cond as u8]);
        self.rel32(label);
    }

    /// `jcc rel8` with a fixed displacement (short form).
    pub fn jcc_short(&mut self, cond: Cond, disp: i8) {
        self.bytes(&[0x70 + cond as u8, disp.to_ne_bytes()[0]]);
    }

    /// `mov eax, imm32` (zero-extends; used for exit indices).
    pub fn mov_eax_imm32(&mut self, imm: u32) {
        self.byte(0xB8);
        self.u32le(imm);
    }

    pub fn ret(&mut self) {
        self.byte(0xC3);
    }

    // ---- SSE2 double arithmetic ----

    /// `movsd xmm, [base + disp32]`.
    pub fn movsd_rm(&mut self, dst: Xmm, base: Reg, disp: i32) {
        self.bytes(&[0xF2, 0x0F, 0x10]);
        self.modrm(2, dst as u8, base as u8);
        self.u32le(disp as u32);
    }

    /// `movsd [base + disp32], xmm`.
    pub fn movsd_mr(&mut self, base: Reg, disp: i32, src: Xmm) {
        self.bytes(&[0xF2, 0x0F, 0x11]);
        self.modrm(2, src as u8, base as u8);
        self.u32le(disp as u32);
    }

    pub fn addsd(&mut self, dst: Xmm, src: Xmm) {
        self.bytes(&[0xF2, 0x0F, 0x58]);
        self.modrm(3, dst as u8, src as u8);
    }

    pub fn subsd(&mut self, dst: Xmm, src: Xmm) {
        self.bytes(&[0xF2, 0x0F, 0x5C]);
        self.modrm(3, dst as u8, src as u8);
    }

    pub fn mulsd(&mut self, dst: Xmm, src: Xmm) {
        self.bytes(&[0xF2, 0x0F, 0x59]);
        self.modrm(3, dst as u8, src as u8);
    }

    pub fn divsd(&mut self, dst: Xmm, src: Xmm) {
        self.bytes(&[0xF2, 0x0F, 0x5E]);
        self.modrm(3, dst as u8, src as u8);
    }

    /// Packed forms over two doubles per register.
    pub fn addpd(&mut self, dst: Xmm, src: Xmm) {
        self.bytes(&[0x66, 0x0F, 0x58]);
        self.modrm(3, dst as u8, src as u8);
    }

    pub fn mulpd(&mut self, dst: Xmm, src: Xmm) {
        self.bytes(&[0x66, 0x0F, 0x59]);
        self.modrm(3, dst as u8, src as u8);
    }

    /// `ucomisd xmm, xmm` (sets integer flags from a double compare).
    pub fn ucomisd(&mut self, a: Xmm, b: Xmm) {
        self.bytes(&[0x66, 0x0F, 0x2E]);
        self.modrm(3, a as u8, b as u8);
    }

    /// `cvtsi2sd xmm, r64`.
    pub fn cvtsi2sd(&mut self, dst: Xmm, src: Reg) {
        self.byte(0xF2);
        self.rex(true, dst as u8, src as u8);
        self.bytes(&[0x0F, 0x2A]);
        self.modrm(3, dst as u8, src as u8);
    }
}

/// Executable memory holding finalized code.
///
/// Pages are mapped read-write for the copy, then flipped to read-execute;
/// the mapping never stays writable and executable at once.
#[derive(Debug)]
pub struct ExecBuffer {
    ptr: *mut u8,
    len: usize,
}

impl ExecBuffer {
    /// Copies `code` into fresh executable pages.
    #[must_use]
    pub fn new(code: &[u8]) -> Option<Self> {
        if code.is_empty() {
            return None;
        }
        let page = 4096usize;
        let len = code.len().div_ceil(page) * page;
        // SAFETY: anonymous private mapping of a computed length; the
        // result is checked against MAP_FAILED before use.
        let ptr = unsafe {
            libc::mmap(
                std::ptr::null_mut(),
                len,
                libc::PROT_READ | libc::PROT_WRITE,
                libc::MAP_PRIVATE | libc::MAP_ANONYMOUS,
                -1,
                0,
            )
        };
        if ptr == libc::MAP_FAILED {
            return None;
        }
        let ptr = ptr.cast::<u8>();
        // SAFETY: ptr points at a fresh len-byte mapping and code fits.
        unsafe {
            std::ptr::copy_nonoverlapping(code.as_ptr(), ptr, code.len());
        }
        // SAFETY: flipping our own fresh mapping to read-execute.
        let rc = unsafe { libc::mprotect(ptr.cast(), len, libc::PROT_READ | libc::PROT_EXEC) };
        if rc != 0 {
            // SAFETY: unmapping the mapping created above.
            unsafe {
                libc::munmap(ptr.cast(), len);
            }
            return None;
        }
        Some(Self { ptr, len })
    }

    /// Calls the code as `fn(*mut i64) -> i64`.
    ///
    /// # Safety
    /// The buffer must contain a complete function following the SysV
    /// calling convention that only dereferences `state` and the pointers
    /// stored in it, and returns.
    #[must_use]
    pub unsafe fn call(&self, state: *mut i64) -> i64 {
        // SAFETY: caller guarantees the code is a well-formed function.
        let f: extern "C" fn(*mut i64) -> i64 = unsafe { std::mem::transmute(self.ptr) };
        f(state)
    }
}

impl Drop for ExecBuffer {
    fn drop(&mut self) {
        // SAFETY: releasing the mapping created in `new`.
        unsafe {
            libc::munmap(self.ptr.cast(), self.len);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn emit(f: impl FnOnce(&mut Assembler)) -> Vec<u8> {
        let mut asm = Assembler::new();
        f(&mut asm);
        asm.finish().expect("owned buffers cannot overflow")
    }

    #[test]
    fn mov_imm64_encoding() {
        let code = emit(|a| a.mov_imm64(Reg::Rax, 0x1122_3344_5566_7788));
        assert_eq!(code, [0x48, 0xB8, 0x88, 0x77, 0x66, 0x55, 0x44, 0x33, 0x22, 0x11]);
    }

    #[test]
    fn alu_encodings() {
        assert_eq!(emit(|a| a.add_rr(Reg::Rax, Reg::Rbx)), [0x48, 0x01, 0xD8]);
        assert_eq!(emit(|a| a.sub_rr(Reg::Rcx, Reg::Rdx)), [0x48, 0x29, 0xD1]);
        assert_eq!(emit(|a| a.imul_rr(Reg::Rax, Reg::Rcx)), [0x48, 0x0F, 0xAF, 0xC1]);
        assert_eq!(emit(|a| a.cmp_rr(Reg::Rax, Reg::Rbx)), [0x48, 0x39, 0xD8]);
    }

    #[test]
    fn extended_register_rex_bits() {
        assert_eq!(emit(|a| a.add_rr(Reg::R8, Reg::Rax)), [0x49, 0x01, 0xC0]);
        assert_eq!(emit(|a| a.add_rr(Reg::Rax, Reg::R9)), [0x4C, 0x01, 0xC8]);
        assert_eq!(emit(|a| a.push(Reg::R12)), [0x41, 0x54]);
        assert_eq!(emit(|a| a.push(Reg::Rbx)), [0x53]);
    }

    #[test]
    fn memory_operand_encodings() {
        assert_eq!(
            emit(|a| a.mov_rm(Reg::Rax, Reg::Rdi, 0x10)),
            [0x48, 0x8B, 0x87, 0x10, 0x00, 0x00, 0x00]
        );
        assert_eq!(
            emit(|a| a.mov_mr(Reg::Rdi, 8, Reg::Rax)),
            [0x48, 0x89, 0x87, 0x08, 0x00, 0x00, 0x00]
        );
    }

    #[test]
    fn indexed_load_uses_sib_scale_8() {
        // mov rax, [rsi + rcx*8 + 0]
        assert_eq!(
            emit(|a| a.mov_r_index8(Reg::Rax, Reg::Rsi, Reg::Rcx, 0)),
            [0x48, 0x8B, 0x84, 0xCE, 0x00, 0x00, 0x00, 0x00]
        );
    }

    #[test]
    fn sse2_encodings() {
        assert_eq!(emit(|a| a.addsd(Xmm::Xmm0, Xmm::Xmm1)), [0xF2, 0x0F, 0x58, 0xC1]);
        assert_eq!(emit(|a| a.addpd(Xmm::Xmm0, Xmm::Xmm1)), [0x66, 0x0F, 0x58, 0xC1]);
        assert_eq!(
            emit(|a| a.movsd_rm(Xmm::Xmm0, Reg::Rdi, 0)),
            [0xF2, 0x0F, 0x10, 0x87, 0x00, 0x00, 0x00, 0x00]
        );
    }

    #[test]
    fn short_jumps() {
        assert_eq!(emit(|a| a.jmp_short(-2)), [0xEB, 0xFE]);
        assert_eq!(emit(|a| a.jcc_short(Cond::E, 4)), [0x74, 0x04]);
    }

    #[test]
    fn forward_label_chain_resolves_on_bind() {
        let mut asm = Assembler::new();
        let target = asm.label();
        asm.jmp(target); // site at 1..5
        asm.jcc(Cond::E, target); // site at 7..11
        asm.bind(target);
        asm.ret();
        let code = asm.finish().unwrap();
        // first jmp: rel = 11 - 5 = 6; jcc: rel = 11 - 11 = 0
        assert_eq!(&code[..5], [0xE9, 0x06, 0x00, 0x00, 0x00]);
        assert_eq!(&code[5..11], [0x0F, 0x84, 0x00, 0x00, 0x00, 0x00]);
        assert_eq!(code[11], 0xC3);
    }

    #[test]
    fn backward_label_resolves_immediately() {
        let mut asm = Assembler::new();
        let top = asm.label();
        asm.bind(top);
        asm.add_rr(Reg::Rax, Reg::Rbx); // 3 bytes
        asm.jmp(top); // rel = 0 - (3 + 5) = -8
        let code = asm.finish().unwrap();
        assert_eq!(&code[3..], [0xE9, 0xF8, 0xFF, 0xFF, 0xFF]);
    }

    #[test]
    fn fixed_buffer_overflow_is_fatal() {
        let mut asm = Assembler::fixed(4);
        asm.mov_imm64(Reg::Rax, 1); // 10 bytes
        assert!(asm.finish().is_err());
    }

    #[test]
    fn owned_buffer_grows_by_doubling() {
        let mut asm = Assembler::new();
        for _ in 0..1000 {
            asm.ret();
        }
        let code = asm.finish().unwrap();
        assert_eq!(code.len(), 1000);
        assert!(code.iter().all(|&b| b == 0xC3));
    }

    #[test]
    #[cfg(target_arch = "x86_64")]
    fn emitted_code_executes() {
        // fn(state) -> state[0] + state[1], returned in rax
        let mut asm = Assembler::new();
        asm.mov_rm(Reg::Rax, Reg::Rdi, 0);
        asm.mov_rm(Reg::Rcx, Reg::Rdi, 8);
        asm.add_rr(Reg::Rax, Reg::Rcx);
        asm.ret();
        let code = asm.finish().unwrap();
        let buf = ExecBuffer::new(&code).expect("mmap failed");
        let mut state = [40i64, 2i64];
        // SAFETY: the code above is a complete SysV function reading only
        // the two state slots.
        let out = unsafe { buf.call(state.as_mut_ptr()) };
        assert_eq!(out, 42);
    }
}
