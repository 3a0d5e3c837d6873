//! The bytecode interpreter.
//!
//! A [`Thread`] owns everything execution needs: the register file, the
//! call-frame stack, the environment arena and its free list, the intern
//! table, and the trace cache. Execution is strictly single-threaded;
//! multiple threads may exist but do not interact.
//!
//! The register file is a single growable vector indexed from a moving
//! `base`; instruction operands encode register slots as non-positive values
//! and interned names as positive values (see [`crate::bytecode::op`]).
//!
//! Promise forcing and JIT entry are both modeled as "return a new PC and
//! push a frame": an operand fetch that hits a promise pushes a frame for
//! the thunk whose return PC is the *current* instruction, so the
//! instruction re-executes once the forced value is in place. There is no
//! call-stack surgery and no suspension.

pub(crate) mod arith;
mod builtins;
mod call;
mod subset;

pub use builtins::Builtin;

use std::rc::Rc;

use ahash::AHashMap;
use smallvec::SmallVec;

use crate::{
    bytecode::{Instruction, Opcode, Operand, Prototype, decode},
    config::{Backend, JitConfig},
    deparse,
    env::EnvArena,
    error::{ErrorKind, RunError, RunResult},
    intern::{Interns, StringId},
    trace::{cache::TraceCache, exec, record::{self, RecordOutcome, Recorder}},
    tracer::{JitTracer, NoopTracer},
    value::{Closure, EnvId, PromiseData, Value},
};

/// Where a frame's result is written on return.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Dest {
    /// Absolute register slot in the caller's frame.
    Register(usize),
    /// Named binding in an environment.
    Binding(EnvId, StringId),
    /// Promise force: write the forced value back to the originating
    /// register slot (when the promise was fetched from one) and to the
    /// promise's own binding slot.
    Force {
        register: Option<usize>,
        slot: (EnvId, StringId),
    },
}

/// One interpreter call frame.
#[derive(Debug, Clone)]
pub struct StackFrame {
    pub env: EnvId,
    pub proto: Rc<Prototype>,
    /// Saved base-of-registers to restore on return.
    pub return_base: usize,
    /// Saved instruction pointer in the caller's prototype.
    pub return_pc: usize,
    pub dest: Dest,
    /// The caller's environment (dynamic parent of `env`).
    pub caller_env: EnvId,
    /// This frame created `env` and may recycle it on return if the result
    /// is closure-safe.
    pub owns_env: bool,
}

/// A single-threaded execution context.
pub struct Thread<Tr: JitTracer = NoopTracer> {
    pub(crate) interns: Interns,
    pub(crate) envs: EnvArena,
    pub(crate) global: EnvId,
    pub(crate) registers: Vec<Value>,
    pub(crate) base: usize,
    pub(crate) frames: Vec<StackFrame>,
    pub(crate) config: JitConfig,
    pub(crate) tracer: Tr,
    pub(crate) cache: TraceCache,
    /// Back-edge execution counts keyed by (prototype identity, target PC).
    pub(crate) hot: AHashMap<(usize, usize), u32>,
    pub(crate) recorder: Option<Recorder>,
}

impl Thread<NoopTracer> {
    #[must_use]
    pub fn new(config: JitConfig) -> Self {
        Self::with_tracer(config, NoopTracer)
    }
}

impl<Tr: JitTracer> Thread<Tr> {
    #[must_use]
    pub fn with_tracer(config: JitConfig, tracer: Tr) -> Self {
        let mut envs = EnvArena::new();
        let global = envs.alloc(None, None);
        Self {
            interns: Interns::new(),
            envs,
            global,
            registers: Vec::with_capacity(256),
            base: 0,
            frames: Vec::with_capacity(16),
            config,
            tracer,
            cache: TraceCache::new(),
            hot: AHashMap::new(),
            recorder: None,
        }
    }

    #[must_use]
    pub fn global_env(&self) -> EnvId {
        self.global
    }

    pub fn interns_mut(&mut self) -> &mut Interns {
        &mut self.interns
    }

    #[must_use]
    pub fn interns(&self) -> &Interns {
        &self.interns
    }

    #[must_use]
    pub fn tracer(&self) -> &Tr {
        &self.tracer
    }

    #[must_use]
    pub fn env_arena(&self) -> &EnvArena {
        &self.envs
    }

    pub fn env_arena_mut(&mut self) -> &mut EnvArena {
        &mut self.envs
    }

    /// Renders a value with this thread's intern table.
    #[must_use]
    pub fn deparse(&self, value: &Value) -> String {
        deparse::deparse(value, &self.interns)
    }

    // ---- frame plumbing ----

    /// Absolute register slot for operand register `r` of the current frame.
    #[inline]
    pub(crate) fn slot(&self, r: u32) -> usize {
        self.base + r as usize
    }

    pub(crate) fn current_env(&self) -> EnvId {
        self.frames.last().map_or(self.global, |f| f.env)
    }

    fn push_frame(&mut self, proto: Rc<Prototype>, env: EnvId, dest: Dest, return_pc: usize, owns_env: bool) {
        let caller_env = self.current_env();
        let return_base = self.base;
        self.base = self.registers.len();
        self.registers.resize(self.base + proto.nregs, Value::Nil);
        self.frames.push(StackFrame {
            env,
            proto,
            return_base,
            return_pc,
            dest,
            caller_env,
            owns_env,
        });
    }

    /// Pops the current frame, writes `value` into its destination, restores
    /// the caller's base, and recycles the frame environment when possible.
    /// Returns the PC to resume at.
    fn pop_frame(&mut self, value: Value) -> usize {
        let frame = self.frames.pop().expect("pop on empty frame stack");
        self.registers.truncate(self.base);
        self.base = frame.return_base;
        if frame.owns_env && value.is_closure_safe(frame.env) {
            self.envs.release(frame.env);
        }
        match frame.dest {
            Dest::Register(abs) => self.registers[abs] = value,
            Dest::Binding(env, name) => self.envs.get_mut(env).assign(name, value),
            Dest::Force { register, slot } => {
                if let Some(abs) = register {
                    self.registers[abs] = value.clone();
                }
                // replace the promise in its slot only if still unforced
                let binding = self.envs.get(slot.0).get(slot.1);
                if matches!(binding, Value::Promise(_) | Value::Default(_)) {
                    self.envs.get_mut(slot.0).assign(slot.1, value);
                }
            }
        }
        frame.return_pc
    }

    /// Pushes a frame to evaluate a promise thunk, re-entering `pc` when it
    /// returns.
    fn push_force_frame(&mut self, promise: &Rc<PromiseData>, register: Option<usize>, pc: usize) {
        self.push_frame(
            promise.proto.clone(),
            promise.env,
            Dest::Force {
                register,
                slot: promise.slot,
            },
            pc,
            false,
        );
    }

    // ---- operand fetch ----

    /// Fetches an operand, forcing promises. `Ok(None)` means a thunk frame
    /// was pushed and the current instruction must be re-entered.
    fn fetch(&mut self, operand: i32, pc: usize) -> RunResult<Option<Value>> {
        match decode(operand) {
            Operand::Register(r) => {
                let abs = self.slot(r);
                match &self.registers[abs] {
                    Value::Promise(p) | Value::Default(p) => {
                        let p = p.clone();
                        self.push_force_frame(&p, Some(abs), pc);
                        Ok(None)
                    }
                    Value::Nil => Err(RunError::internal(format!("read of undefined register {r}"))),
                    v => Ok(Some(v.clone())),
                }
            }
            Operand::Name(name) => {
                let env = self.current_env();
                let (_, value) = self.envs.get_recursive(env, name);
                match value {
                    Value::Nil => Err(RunError::not_found(self.interns.get(name))),
                    Value::Promise(p) | Value::Default(p) => {
                        let p = p.clone();
                        self.push_force_frame(&p, None, pc);
                        Ok(None)
                    }
                    v => Ok(Some(v)),
                }
            }
        }
    }

    /// `getRaw`-style fetch: promises come back uninterpreted, unbound names
    /// come back Nil.
    fn fetch_raw(&self, operand: i32) -> Value {
        match decode(operand) {
            Operand::Register(r) => self.registers[self.slot(r)].clone(),
            Operand::Name(name) => self.envs.get_recursive(self.current_env(), name).1,
        }
    }

    /// Writes a value to a storage operand.
    pub(crate) fn write(&mut self, operand: i32, value: Value) {
        match decode(operand) {
            Operand::Register(r) => {
                let abs = self.slot(r);
                self.registers[abs] = value;
            }
            Operand::Name(name) => {
                let env = self.current_env();
                self.envs.get_mut(env).assign(name, value);
            }
        }
    }

    /// Forces a value to completion via a nested interpreter invocation.
    ///
    /// This is the builtin ABI's `force(thread, arg)`: unlike operand-fetch
    /// forcing (which pushes a frame and re-enters the instruction), this
    /// runs the thunk in a fresh nested `eval`.
    pub fn force(&mut self, value: Value) -> RunResult<Value> {
        match value {
            Value::Promise(p) | Value::Default(p) => {
                let forced = self.eval(p.proto.clone(), p.env)?;
                let binding = self.envs.get(p.slot.0).get(p.slot.1);
                if matches!(binding, Value::Promise(_) | Value::Default(_)) {
                    self.envs.get_mut(p.slot.0).assign(p.slot.1, forced.clone());
                }
                Ok(forced)
            }
            v => Ok(v),
        }
    }

    // ---- entry ----

    /// Runs a prototype in an environment to completion.
    ///
    /// Builds a sentinel frame whose destination is a pre-reserved result
    /// slot, runs the dispatch loop until that frame returns, and yields the
    /// result. Reentrant: builtins and promise forcing may call `eval` while
    /// an outer `eval` is on the stack; the base pointer and stack height are
    /// preserved across error unwinds.
    pub fn eval(&mut self, proto: Rc<Prototype>, env: EnvId) -> RunResult<Value> {
        let entry_depth = self.frames.len();
        let saved_base = self.base;
        let saved_len = self.registers.len();

        // pre-reserved result slot
        let result_slot = self.registers.len();
        self.registers.push(Value::Nil);
        self.push_frame(proto, env, Dest::Register(result_slot), usize::MAX, false);

        match self.run(entry_depth) {
            Ok(()) => {
                let result = std::mem::take(&mut self.registers[result_slot]);
                self.frames.truncate(entry_depth);
                self.registers.truncate(saved_len);
                self.base = saved_base;
                Ok(result)
            }
            Err(err) => {
                // unwind to the invocation boundary, preserving base and
                // stack height for the enclosing eval
                self.recorder = None;
                self.frames.truncate(entry_depth);
                self.registers.truncate(saved_len);
                self.base = saved_base;
                Err(err)
            }
        }
    }

    /// The dispatch loop. Runs until the frame stack shrinks back to
    /// `entry_depth`.
    fn run(&mut self, entry_depth: usize) -> RunResult<()> {
        let mut proto: Rc<Prototype> = self.frames.last().expect("run without a frame").proto.clone();
        let mut pc: usize = 0;

        macro_rules! reload {
            () => {{
                proto = self.frames.last().expect("frame stack underflow").proto.clone();
            }};
        }

        // fetch an operand; on promise force, fall through to re-enter the
        // same instruction after the thunk frame returns
        macro_rules! force_fetch {
            ($operand:expr) => {
                match self.fetch($operand, pc)? {
                    Some(v) => v,
                    None => {
                        reload!();
                        pc = 0;
                        continue;
                    }
                }
            };
        }

        loop {
            let inst: Instruction = proto.code[pc];
            self.tracer.on_instruction(pc, inst.op);

            // shadow-mode recording: every instruction also emits IR
            if self.recorder.is_some() {
                let mut rec = self.recorder.take().expect("recorder vanished");
                match rec.step(self, &proto, pc, &inst) {
                    RecordOutcome::Continue => self.recorder = Some(rec),
                    RecordOutcome::Complete => {
                        record::finish(self, rec);
                        // the compiled trace starts at this PC; enter it now
                        if let Some(new_pc) = self.maybe_run_trace(&proto, pc)? {
                            pc = new_pc;
                            continue;
                        }
                    }
                    RecordOutcome::Abort => {
                        self.tracer.on_trace_abort(pc, inst.op);
                    }
                }
            }

            match inst.op {
                // ============================================================
                // Control
                // ============================================================
                Opcode::Done => return Ok(()),
                Opcode::Ret => {
                    let value = force_fetch!(inst.a);
                    let return_pc = self.pop_frame(value);
                    if self.frames.len() == entry_depth {
                        return Ok(());
                    }
                    reload!();
                    pc = return_pc;
                    continue;
                }
                Opcode::Jmp => {
                    pc = offset(pc, inst.a);
                    continue;
                }
                Opcode::Jc => {
                    let cond = force_fetch!(inst.a);
                    let taken = cond.as_condition()?;
                    pc = offset(pc, if taken { inst.b } else { inst.c });
                    continue;
                }
                Opcode::Branch => {
                    let selector = force_fetch!(inst.a);
                    let arms = inst.b as usize;
                    let i = selector
                        .as_integer_scalar()
                        .ok_or_else(|| RunError::new(ErrorKind::Invalid, "branch selector is not an integer"))?;
                    // table of `arms` jumps follows; out-of-range falls past it
                    if i >= 1 && (i as usize) <= arms {
                        pc += i as usize;
                    } else {
                        pc += arms + 1;
                    }
                    continue;
                }
                Opcode::Call => {
                    let callee = force_fetch!(inst.a);
                    let entry = &proto.calls[inst.b as usize];
                    let dest = Dest::Register(self.slot_of_operand(inst.c));
                    match callee.strip() {
                        Value::Function(closure) => {
                            call::invoke(self, &proto, &closure, entry, dest, pc + 1)?;
                            reload!();
                            pc = 0;
                            continue;
                        }
                        other => {
                            return Err(RunError::type_error(format!(
                                "attempt to apply non-function (type {})",
                                other.ty()
                            )));
                        }
                    }
                }
                Opcode::Ncall => {
                    let callee = force_fetch!(inst.a);
                    let entry = &proto.calls[inst.b as usize];
                    let dest = Dest::Register(self.slot_of_operand(inst.c));
                    match callee.strip() {
                        Value::Function(closure) => {
                            call::invoke_positional(self, &closure, entry, dest, pc + 1)?;
                            reload!();
                            pc = 0;
                            continue;
                        }
                        other => {
                            return Err(RunError::type_error(format!(
                                "attempt to apply non-function (type {})",
                                other.ty()
                            )));
                        }
                    }
                }
                Opcode::UseMethod => {
                    let object = force_fetch!(inst.b);
                    let generic = name_operand(inst.a)?;
                    let dest = Dest::Register(self.slot_of_operand(inst.c));
                    call::dispatch_method(self, generic, &object, dest, pc + 1)?;
                    reload!();
                    pc = 0;
                    continue;
                }
                Opcode::ForBegin => {
                    let seq = force_fetch!(inst.b);
                    let n = seq.len();
                    // counter register: the slot after the sequence register;
                    // the sequence length rides in the counter value's header
                    let counter_reg = counter_slot(inst.b);
                    if n == 0 {
                        pc = offset(pc, inst.c);
                        continue;
                    }
                    let abs = self.slot(counter_reg);
                    self.registers[abs] = Value::int(0);
                    let first = seq.element(0);
                    self.write(inst.a, first);
                }
                Opcode::ForEnd => {
                    let seq = force_fetch!(inst.b);
                    let counter_reg = counter_slot(inst.b);
                    let abs = self.slot(counter_reg);
                    let i = self.registers[abs]
                        .as_integer_scalar()
                        .ok_or_else(|| RunError::internal("for-loop counter clobbered"))?;
                    let next = i + 1;
                    if (next as usize) < seq.len() {
                        self.registers[abs] = Value::int(next);
                        self.write(inst.a, seq.element(next as usize));
                        let target = offset(pc, inst.c);
                        self.note_back_edge(&proto, target)?;
                        if let Some(new_pc) = self.maybe_run_trace(&proto, target)? {
                            pc = new_pc;
                        } else {
                            pc = target;
                        }
                        continue;
                    }
                }

                // ============================================================
                // Memory
                // ============================================================
                Opcode::Constant => {
                    let value = proto.constants[inst.a as usize].clone();
                    self.write(inst.c, value);
                }
                Opcode::Mov => {
                    let value = force_fetch!(inst.a);
                    self.write(inst.c, value);
                }
                Opcode::FastMov => {
                    let value = self.fetch_raw(inst.a);
                    self.write(inst.c, value);
                }
                Opcode::Assign => {
                    let value = force_fetch!(inst.a);
                    let name = name_operand(inst.b)?;
                    let env = self.current_env();
                    self.envs.get_mut(env).assign(name, value);
                }
                Opcode::Assign2 => {
                    let value = force_fetch!(inst.a);
                    let name = name_operand(inst.b)?;
                    let env = self.current_env();
                    self.envs.insert_recursive(env, name, value);
                }
                Opcode::IAssign => {
                    let value = force_fetch!(inst.a);
                    let index = force_fetch!(inst.b);
                    let target = force_fetch!(inst.c);
                    let updated = subset::assign_subset(self, target, &index, &value)?;
                    self.write(inst.c, updated);
                }
                Opcode::EAssign => {
                    let value = force_fetch!(inst.a);
                    let index = force_fetch!(inst.b);
                    let target = force_fetch!(inst.c);
                    let updated = subset::assign_element(self, target, &index, &value)?;
                    self.write(inst.c, updated);
                }
                Opcode::Subset => {
                    let vector = force_fetch!(inst.a);
                    let index = force_fetch!(inst.b);
                    if let Some(pc_after) = subset::dispatch_or_subset(self, &vector, &index, inst.c, pc)? {
                        reload!();
                        pc = pc_after;
                        continue;
                    }
                }
                Opcode::Subset2 => {
                    let vector = force_fetch!(inst.a);
                    let index = force_fetch!(inst.b);
                    let result = subset::subset2(self, &vector, &index)?;
                    self.write(inst.c, result);
                }
                Opcode::Dollar => {
                    let value = force_fetch!(inst.a);
                    let name = name_operand(inst.b)?;
                    let result = subset::dollar(self, &value, name)?;
                    self.write(inst.c, result);
                }

                // ============================================================
                // Arithmetic / logical / folds
                // ============================================================
                op if op.is_binary_arith() => {
                    let a = force_fetch!(inst.a);
                    let b = force_fetch!(inst.b);
                    if self.maybe_trigger_binary(&proto, pc, &a, &b) {
                        // re-dispatch so the recorder sees this instruction
                        continue;
                    }
                    if let Some(new_pc) = self.maybe_run_trace(&proto, pc)? {
                        pc = new_pc;
                        continue;
                    }
                    let result = arith::binary(self, op, &a, &b)?;
                    self.write(inst.c, result);
                }
                op if op.is_unary_arith() => {
                    let a = force_fetch!(inst.a);
                    let result = arith::unary(self, op, &a)?;
                    self.write(inst.c, result);
                }
                op if op.is_fold() => {
                    let a = force_fetch!(inst.a);
                    let result = arith::fold(self, op, &a)?;
                    self.write(inst.c, result);
                }
                Opcode::IfElse => {
                    let cond = force_fetch!(inst.a);
                    let yes = force_fetch!(inst.b);
                    let no = force_fetch!(inst.c);
                    let result = arith::ifelse(self, &cond, &yes, &no)?;
                    self.write(inst.c, result);
                }
                Opcode::Split => {
                    let data = force_fetch!(inst.a);
                    let factor = force_fetch!(inst.b);
                    let levels = force_fetch!(inst.c);
                    let result = arith::split(self, &data, &factor, &levels)?;
                    self.write(inst.c, result);
                }

                // ============================================================
                // Vector construction
                // ============================================================
                Opcode::Seq => {
                    let len = force_fetch!(inst.a);
                    let step = force_fetch!(inst.b);
                    if self.maybe_trigger_seq(&proto, pc, &len) {
                        continue;
                    }
                    if let Some(new_pc) = self.maybe_run_trace(&proto, pc)? {
                        pc = new_pc;
                        continue;
                    }
                    let result = arith::seq(&len, &step)?;
                    self.write(inst.c, result);
                }
                Opcode::Colon => {
                    let from = force_fetch!(inst.a);
                    let to = force_fetch!(inst.b);
                    let result = arith::colon(&from, &to)?;
                    self.write(inst.c, result);
                }
                Opcode::Rep => {
                    let x = force_fetch!(inst.a);
                    let times = force_fetch!(inst.b);
                    let result = arith::rep(&x, &times)?;
                    self.write(inst.c, result);
                }
                Opcode::MakeList => {
                    let first = register_operand(inst.a)?;
                    let count = inst.b as usize;
                    // entries may be promises placed by dots expansion; each
                    // forces via its own thunk frame before the list is built
                    let mut items = Vec::with_capacity(count);
                    let mut forced_all = true;
                    for i in 0..count {
                        let operand = crate::bytecode::reg(first + u32::try_from(i).expect("list too long"));
                        match self.fetch(operand, pc)? {
                            Some(v) => items.push(v),
                            None => {
                                forced_all = false;
                                break;
                            }
                        }
                    }
                    if !forced_all {
                        reload!();
                        pc = 0;
                        continue;
                    }
                    self.write(inst.c, Value::list(items));
                }
                Opcode::Type => {
                    let value = force_fetch!(inst.a);
                    let ty_name: &'static str = value.ty().into();
                    let id = self.interns.intern(ty_name);
                    self.write(inst.c, Value::chr(id));
                }
                Opcode::Length => {
                    let value = force_fetch!(inst.a);
                    let n = i64::try_from(value.len()).expect("length overflow");
                    self.write(inst.c, Value::int(n));
                }
                Opcode::Strip => {
                    let value = force_fetch!(inst.a);
                    self.write(inst.c, value.strip());
                }

                // ============================================================
                // Introspection
                // ============================================================
                Opcode::Missing => {
                    let name = name_operand(inst.a)?;
                    let env = self.current_env();
                    let binding = self.envs.get(env).get(name);
                    let missing = matches!(binding, Value::Nil | Value::Default(_));
                    self.write(inst.c, Value::lgl(missing));
                }
                Opcode::Function => {
                    let nested = proto.prototypes[inst.a as usize].clone();
                    let env = self.current_env();
                    self.write(inst.c, Value::Function(Rc::new(Closure { proto: nested, env })));
                }
                Opcode::Internal => {
                    let builtin = Builtin::from_index(inst.a)?;
                    let entry = &proto.calls[inst.b as usize];
                    // argument registers; promises force through their own
                    // frames before the builtin runs
                    let mut args: SmallVec<[Value; 4]> = SmallVec::new();
                    let mut forced_all = true;
                    for arg in &entry.args {
                        let operand = match arg {
                            crate::bytecode::CallArg::Register(r) => crate::bytecode::reg(*r),
                            _ => return Err(RunError::internal("builtin arguments must be registers")),
                        };
                        match self.fetch(operand, pc)? {
                            Some(v) => args.push(v),
                            None => {
                                forced_all = false;
                                break;
                            }
                        }
                    }
                    if !forced_all {
                        reload!();
                        pc = 0;
                        continue;
                    }
                    let result = builtin.call(self, &args)?;
                    self.write(inst.c, result);
                }

                other => {
                    return Err(RunError::internal(format!("unhandled opcode {other}")));
                }
            }

            pc += 1;
        }
    }

    /// Absolute register slot for a register-encoded operand.
    fn slot_of_operand(&self, operand: i32) -> usize {
        match decode(operand) {
            Operand::Register(r) => self.slot(r),
            Operand::Name(_) => panic!("expected a register operand"),
        }
    }

    // ---- JIT trigger points ----

    /// Loop back-edge bookkeeping: bumps the hot counter and starts a loop
    /// trace once it crosses the threshold. Idempotent while recording.
    fn note_back_edge(&mut self, proto: &Rc<Prototype>, target: usize) -> RunResult<()> {
        if !self.config.enabled || self.recorder.is_some() {
            return Ok(());
        }
        let key = (proto.identity(), target);
        if self.cache.root(key).is_some() {
            return Ok(());
        }
        let count = self.hot.entry(key).or_insert(0);
        *count += 1;
        if *count >= self.config.hot_loop_threshold {
            *count = 0;
            record::start(self, proto, target, crate::trace::ir::TraceKind::Loop);
        }
        Ok(())
    }

    /// Vector-arithmetic trigger: both operand types numeric/logical and
    /// either length at or beyond the tile threshold. Idempotent while
    /// recording. Returns true when recording just started, in which case
    /// the caller re-dispatches the instruction under the recorder.
    fn maybe_trigger_binary(&mut self, proto: &Rc<Prototype>, pc: usize, a: &Value, b: &Value) -> bool {
        if !self.config.enabled || self.recorder.is_some() {
            return false;
        }
        let long_enough = a.len() >= self.config.vector_threshold || b.len() >= self.config.vector_threshold;
        if long_enough
            && a.ty().is_numeric_like()
            && b.ty().is_numeric_like()
            && self.cache.root((proto.identity(), pc)).is_none()
        {
            record::start(self, proto, pc, crate::trace::ir::TraceKind::Linear);
            return true;
        }
        false
    }

    fn maybe_trigger_seq(&mut self, proto: &Rc<Prototype>, pc: usize, len: &Value) -> bool {
        if !self.config.enabled || self.recorder.is_some() {
            return false;
        }
        let n = len.as_integer_scalar().unwrap_or(0);
        if n >= self.config.vector_threshold as i64 && self.cache.root((proto.identity(), pc)).is_none() {
            record::start(self, proto, pc, crate::trace::ir::TraceKind::Linear);
            return true;
        }
        false
    }

    /// Runs the compiled trace cached at `pc`, if any. Returns the reenter
    /// PC after a side exit, or None when no trace is cached (or the thread
    /// is recording, in which case entering a trace would tear the shadow
    /// state).
    fn maybe_run_trace(&mut self, proto: &Rc<Prototype>, pc: usize) -> RunResult<Option<usize>> {
        if !self.config.enabled || self.recorder.is_some() {
            return Ok(None);
        }
        let key = (proto.identity(), pc);
        let Some(compiled) = self.cache.root(key) else {
            return Ok(None);
        };
        let Some(outcome) = exec::run_trace(self, key, &compiled)? else {
            // entry checks failed; interpret this pass
            return Ok(None);
        };
        // a hot exit becomes a side-trace candidate at its reenter PC
        if let Some((exit, reenter_pc)) = outcome.hot_exit
            && self.cache.side(key, exit).is_none()
        {
            record::start_side(self, proto, reenter_pc, key.1, exit);
        }
        Ok(Some(outcome.pc))
    }

    /// Test-and-diagnostics access to the trace cache.
    #[must_use]
    pub fn trace_cache(&self) -> &TraceCache {
        &self.cache
    }

    #[must_use]
    pub fn config(&self) -> &JitConfig {
        &self.config
    }

    #[must_use]
    pub(crate) fn machine_backend(&self) -> bool {
        self.config.backend == Backend::MachineCode
    }
}

/// Applies a relative jump offset to a PC (offset is from the instruction
/// after the jump).
#[inline]
fn offset(pc: usize, delta: i32) -> usize {
    usize::try_from(pc as i64 + 1 + i64::from(delta)).expect("jump to negative PC")
}

/// The counter register of a for loop: the slot after the sequence register.
fn counter_slot(seq_operand: i32) -> u32 {
    match decode(seq_operand) {
        Operand::Register(r) => r + 1,
        Operand::Name(_) => panic!("for-loop sequence must live in a register"),
    }
}

fn name_operand(operand: i32) -> RunResult<StringId> {
    match decode(operand) {
        Operand::Name(id) => Ok(id),
        Operand::Register(_) => Err(RunError::internal("expected a name operand")),
    }
}

fn register_operand(operand: i32) -> RunResult<u32> {
    match decode(operand) {
        Operand::Register(r) => Ok(r),
        Operand::Name(_) => Err(RunError::internal("expected a register operand")),
    }
}

/// Convenience entry point mirroring the thread API: evaluate a prototype in
/// the global environment of a fresh interpreter-only thread.
pub fn eval_standalone(proto: &Rc<Prototype>) -> RunResult<Value> {
    let mut thread = Thread::new(JitConfig::disabled());
    let global = thread.global_env();
    thread.eval(proto.clone(), global)
}
