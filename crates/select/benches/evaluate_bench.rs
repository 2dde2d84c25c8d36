//! Criterion benchmarks for selection tree evaluation.
//!
//! Uses synthetic boolean and subexpression trees over systems of varying
//! size to benchmark the per-frame evaluation path.
//!
//! Run with: cargo bench -p rst-select

use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion};
use rst_select::selection::{
    BoolOp, EvalFn, ExprPayload, IndexGroup, MethodContext, NodeId, NodeKind, Result, SelMethod,
    SelNode, SelValue, SelectionCollection, ValueKind,
};
use rst_select::trajectory::Frame;

/// Group-valued method selecting every `stride`-th atom of the group.
struct StrideMethod {
    stride: usize,
}

impl SelMethod for StrideMethod {
    fn name(&self) -> &str {
        "stride"
    }

    fn update(
        &mut self,
        _ctx: &MethodContext<'_>,
        g: &IndexGroup,
        out: &mut SelValue,
    ) -> Result<()> {
        let indices: Vec<usize> = g.iter().step_by(self.stride).collect();
        out.group_mut()?.set_indices(&indices);
        Ok(())
    }
}

fn stride_node(sc: &mut SelectionCollection, stride: usize) -> NodeId {
    let mut node = SelNode::new(
        NodeKind::Expression(ExprPayload::new(Box::new(StrideMethod { stride }))),
        ValueKind::Group,
    )
    .with_eval(EvalFn::Method);
    node.flags.atom_val = true;
    node.mempool = true;
    sc.add_node(node)
}

/// `stride 2 and not stride 3`, evaluated over the whole system.
fn build_boolean_collection(natoms: usize) -> SelectionCollection {
    let mut sc = SelectionCollection::new(natoms);
    let a = stride_node(&mut sc, 2);
    let b = stride_node(&mut sc, 3);
    let not = sc.add_node(
        SelNode::new(NodeKind::Boolean(BoolOp::Not), ValueKind::Group).with_eval(EvalFn::Not),
    );
    sc.link_child(not, b);
    sc.node_mut(not).mempool = true;
    let and = sc.add_node(
        SelNode::new(NodeKind::Boolean(BoolOp::And), ValueKind::Group).with_eval(EvalFn::And),
    );
    sc.link_child(and, a);
    sc.link_child(and, not);
    let root = sc.add_node(
        SelNode::new(
            NodeKind::Root {
                cgrp: Some(IndexGroup::full(natoms)),
            },
            ValueKind::None,
        )
        .with_eval(EvalFn::Root),
    );
    sc.link_child(root, and);
    sc.add_root(root);
    sc.add_selection("bench", root, IndexGroup::full(natoms));
    sc
}

/// A shared subexpression referenced by two selections over overlapping
/// halves of the system.
fn build_subexpr_collection(natoms: usize) -> SelectionCollection {
    let mut sc = SelectionCollection::new(natoms);
    let child = stride_node(&mut sc, 2);
    let sub = sc.add_node(
        SelNode::new(
            NodeKind::SubExpr {
                cgrp: IndexGroup::new(),
            },
            ValueKind::Group,
        )
        .with_eval(EvalFn::SubExpr),
    );
    sc.link_child(sub, child);
    let sub_root = sc.add_node(
        SelNode::new(
            NodeKind::Root {
                cgrp: Some(IndexGroup::new()),
            },
            ValueKind::None,
        )
        .with_eval(EvalFn::Root),
    );
    sc.link_child(sub_root, sub);
    sc.add_root(sub_root);

    let halves = [
        (0..natoms * 2 / 3).collect::<Vec<_>>(),
        (natoms / 3..natoms).collect::<Vec<_>>(),
    ];
    for (i, over) in halves.into_iter().enumerate() {
        let r = sc.add_node(
            SelNode::new(NodeKind::SubExprRef { param: None }, ValueKind::Group)
                .with_eval(EvalFn::SubExprRef),
        );
        sc.link_child(r, sub);
        let root = sc.add_node(
            SelNode::new(
                NodeKind::Root {
                    cgrp: Some(IndexGroup::from_indices(over.clone())),
                },
                ValueKind::None,
            )
            .with_eval(EvalFn::Root),
        );
        sc.link_child(root, r);
        sc.add_root(root);
        sc.add_selection(format!("half{}", i), root, IndexGroup::from_indices(over));
    }
    sc
}

fn bench_boolean(c: &mut Criterion) {
    let mut group = c.benchmark_group("boolean_frame");
    for natoms in [1_000usize, 10_000, 100_000] {
        let mut sc = build_boolean_collection(natoms);
        let fr = Frame::new(0, 0.0, vec![[0.0; 3]; natoms]);
        group.bench_with_input(BenchmarkId::from_parameter(natoms), &natoms, |b, _| {
            b.iter(|| {
                sc.evaluate(black_box(&fr), None).unwrap();
                black_box(sc.selection("bench").unwrap().atom_indices().len())
            })
        });
    }
    group.finish();
}

fn bench_subexpr(c: &mut Criterion) {
    let mut group = c.benchmark_group("subexpr_frame");
    for natoms in [1_000usize, 10_000, 100_000] {
        let mut sc = build_subexpr_collection(natoms);
        let fr = Frame::new(0, 0.0, vec![[0.0; 3]; natoms]);
        group.bench_with_input(BenchmarkId::from_parameter(natoms), &natoms, |b, _| {
            b.iter(|| {
                sc.evaluate(black_box(&fr), None).unwrap();
                black_box(sc.selection("half1").unwrap().atom_indices().len())
            })
        });
    }
    group.finish();
}

criterion_group!(benches, bench_boolean, bench_subexpr);
criterion_main!(benches);
