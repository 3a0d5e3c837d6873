//! Fusion-group marking.
//!
//! A single forward pass over the optimized IR marks each node as either
//! extending the current fusion group or starting a new one. A contiguous
//! fusable run is lowered as a single loop over vector tiles, eliminating
//! intermediate buffers.
//!
//! A node becomes a boundary when:
//! * it is a guard, a load (`sload`/`load`/`env`/`lenv`), a store, or any
//!   other administrative node — these never fuse;
//! * its input shape differs from the running group's shape;
//! * it is a `gather` or `scatter` whose base vector was defined inside the
//!   current group (read-after-write and write-after-write aliasing);
//! * it consumes a fold computed in the current group (the accumulator is
//!   only complete once the group's tile loop finishes).

use ahash::AHashSet;

use crate::trace::ir::{IrOp, IrRef, Shape, Trace};

/// Marks fusion boundaries in place.
pub(crate) fn mark(trace: &mut Trace) {
    let mut group_shape: Option<Shape> = None;
    let mut members: AHashSet<IrRef> = AHashSet::new();
    let mut folds: AHashSet<IrRef> = AHashSet::new();

    for i in 0..trace.nodes.len() {
        let node = &trace.nodes[i];
        let administrative = node.op.is_administrative();

        let boundary = if administrative {
            true
        } else if matches!(node.op, IrOp::Gather | IrOp::Scatter) && members.contains(&node.a) {
            // aliasing with a base produced in this group
            true
        } else if [node.a, node.b, node.c].iter().any(|r| folds.contains(r)) {
            true
        } else {
            match group_shape {
                Some(shape) => node.in_shape != shape,
                None => true,
            }
        };

        let node = &mut trace.nodes[i];
        node.boundary = boundary;
        if boundary {
            members.clear();
            folds.clear();
            group_shape = if administrative { None } else { Some(node.out_shape) };
        }
        if !administrative {
            members.insert(IrRef(i as u32));
            if node.op.is_fold() {
                folds.insert(IrRef(i as u32));
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        trace::ir::{IrNode, NONE, TraceKind},
        value::{EnvId, Ty},
    };

    fn compute(op: IrOp, a: IrRef, b: IrRef, shape: Shape) -> IrNode {
        IrNode::new(op, a, b, NONE, Ty::Integer, shape, shape)
    }

    #[test]
    fn elementwise_run_fuses_until_shape_changes() {
        let s1 = Shape::new(IrRef(0), 100);
        let s2 = Shape::new(IrRef(1), 4);
        let mut trace = Trace {
            kind: TraceKind::Linear,
            start_pc: 0,
            entry_env: EnvId(0),
            nodes: vec![
                IrNode::new(IrOp::Sload, NONE, NONE, NONE, Ty::Integer, s1, s1),
                compute(IrOp::Add, IrRef(0), IrRef(0), s1),
                compute(IrOp::Mul, IrRef(1), IrRef(0), s1),
                compute(IrOp::Add, IrRef(0), IrRef(0), s2),
            ],
            consts: vec![],
            exits: vec![],
            loop_marker: None,
        };
        mark(&mut trace);
        assert!(trace.nodes[0].boundary, "loads are boundaries");
        assert!(trace.nodes[1].boundary, "first compute after a load starts a group");
        assert!(!trace.nodes[2].boundary, "same-shape compute extends the group");
        assert!(trace.nodes[3].boundary, "shape change starts a new group");
    }

    #[test]
    fn gather_from_group_local_base_is_a_boundary() {
        let s = Shape::new(IrRef(0), 100);
        let mut trace = Trace {
            kind: TraceKind::Linear,
            start_pc: 0,
            entry_env: EnvId(0),
            nodes: vec![
                IrNode::new(IrOp::Sload, NONE, NONE, NONE, Ty::Integer, s, s),
                compute(IrOp::Add, IrRef(0), IrRef(0), s),
                compute(IrOp::Gather, IrRef(1), IrRef(0), s),
            ],
            consts: vec![],
            exits: vec![],
            loop_marker: None,
        };
        mark(&mut trace);
        assert!(trace.nodes[2].boundary, "gather from a base computed in-group must not fuse");
    }

    #[test]
    fn fold_consumer_starts_a_new_group() {
        let s = Shape::new(IrRef(0), 100);
        let mut trace = Trace {
            kind: TraceKind::Linear,
            start_pc: 0,
            entry_env: EnvId(0),
            nodes: vec![
                IrNode::new(IrOp::Sload, NONE, NONE, NONE, Ty::Integer, s, s),
                compute(IrOp::Add, IrRef(0), IrRef(0), s),
                compute(IrOp::Sum, IrRef(1), NONE, s),
                compute(IrOp::Mul, IrRef(0), IrRef(2), s),
            ],
            consts: vec![],
            exits: vec![],
            loop_marker: None,
        };
        mark(&mut trace);
        assert!(!trace.nodes[2].boundary, "the fold itself fuses into its producer group");
        assert!(trace.nodes[3].boundary, "a consumer of the fold cannot join the same tile loop");
    }
}
