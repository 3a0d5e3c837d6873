//! The trace pipeline: recorder, optimizer, scheduler, register assigner,
//! and executor.
//!
//! The interpreter hands control to [`record`] at a hot loop back-edge or a
//! long-vector arithmetic instruction. The recorder shadows dispatch,
//! emitting raw IR with guards; on completion the raw trace flows through
//! [`opt`] (replay with CSE, forwarding, dead-store elimination, store
//! sinking, phi insertion), [`schedule`] (fusion-group marking),
//! [`regalloc`] (tile register assignment), and optionally [`codegen`]
//! (x86-64 lowering), landing in the [`cache`]. [`exec`] runs compiled
//! traces and routes guard failures back into the interpreter.

pub mod cache;
pub mod codegen;
pub mod exec;
pub mod ir;
pub mod opt;
pub mod record;
pub mod regalloc;
pub mod schedule;
