//! JIT configuration.
//!
//! A [`JitConfig`] is owned by each [`Thread`](crate::interp::Thread) and
//! consulted at the trigger points in the interpreter. All thresholds are
//! plain fields so tests can force tracing on tiny inputs.

/// Which backend executes compiled traces.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Backend {
    /// Tile-wise IR interpreter over fixed-width lanes.
    #[default]
    Tile,
    /// x86-64 machine code where the lowering supports the trace; falls back
    /// to the tile interpreter otherwise.
    MachineCode,
}

/// Tunables for the trace pipeline.
#[derive(Debug, Clone, Copy)]
pub struct JitConfig {
    /// Gate for every trigger path; when false the interpreter never records.
    pub enabled: bool,
    /// Loop back-edge executions at one PC before a root trace is recorded.
    pub hot_loop_threshold: u32,
    /// Operand length at which vector arithmetic and `seq` hand control to
    /// the recorder.
    pub vector_threshold: usize,
    /// Lengths at or below this are specialized: the recorder guards that the
    /// length still equals its observed value and treats it as a constant.
    /// Longer lengths are tracked symbolically.
    pub specialize_len_max: usize,
    /// Side-exit hits before the exit becomes a side-trace candidate.
    pub exit_hot_threshold: u32,
    /// Upper bound on raw trace length before the recorder bails out.
    pub max_trace_nodes: usize,
    pub backend: Backend,
}

impl Default for JitConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            hot_loop_threshold: 50,
            vector_threshold: 128,
            specialize_len_max: 16,
            exit_hot_threshold: 10,
            max_trace_nodes: 4096,
            backend: Backend::Tile,
        }
    }
}

impl JitConfig {
    /// Interpreter-only execution; no trigger ever fires.
    #[must_use]
    pub fn disabled() -> Self {
        Self {
            enabled: false,
            ..Self::default()
        }
    }

    /// Configuration with thresholds low enough that tests trigger tracing
    /// on small loops and short vectors.
    #[must_use]
    pub fn eager() -> Self {
        Self {
            hot_loop_threshold: 2,
            vector_threshold: 4,
            exit_hot_threshold: 2,
            ..Self::default()
        }
    }
}
