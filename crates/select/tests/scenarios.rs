//! End-to-end evaluation scenarios against a full selection collection.

use std::cell::{Cell, RefCell};
use std::rc::Rc;

use rst_select::selection::{
    ArithOp, BoolOp, EvalFn, ExprPayload, IndexGroup, MethodContext, NodeId, NodeKind, Result,
    SelMethod, SelNode, SelValue, SelectionCollection, ValueKind,
};
use rst_select::topology::Topology;
use rst_select::trajectory::Frame;

type Seen = Rc<RefCell<Vec<Vec<usize>>>>;

/// Group-valued method: a fixed set intersected with the evaluation group.
struct MaskMethod {
    set: Vec<usize>,
    seen: Seen,
}

impl SelMethod for MaskMethod {
    fn name(&self) -> &str {
        "mask"
    }

    fn update(
        &mut self,
        _ctx: &MethodContext<'_>,
        g: &IndexGroup,
        out: &mut SelValue,
    ) -> Result<()> {
        self.seen.borrow_mut().push(g.indices().to_vec());
        let set = IndexGroup::from_indices(self.set.clone());
        out.group_mut()?.assign_intersection(&set, g);
        Ok(())
    }
}

/// Group-valued method selecting the first `step + 1` atoms of the group.
struct StepWindow;

impl SelMethod for StepWindow {
    fn name(&self) -> &str {
        "step_window"
    }

    fn update(
        &mut self,
        ctx: &MethodContext<'_>,
        g: &IndexGroup,
        out: &mut SelValue,
    ) -> Result<()> {
        let keep = (ctx.fr.step as usize + 1).min(g.len());
        let indices: Vec<usize> = g.iter().take(keep).collect();
        out.group_mut()?.set_indices(&indices);
        Ok(())
    }
}

/// Group-valued identity method with a counted per-frame init callback.
struct CountedInit {
    inits: Rc<Cell<usize>>,
}

impl SelMethod for CountedInit {
    fn name(&self) -> &str {
        "counted_init"
    }

    fn has_init_frame(&self) -> bool {
        true
    }

    fn init_frame(&mut self, _ctx: &MethodContext<'_>) -> Result<()> {
        self.inits.set(self.inits.get() + 1);
        Ok(())
    }

    fn update(
        &mut self,
        _ctx: &MethodContext<'_>,
        g: &IndexGroup,
        out: &mut SelValue,
    ) -> Result<()> {
        out.group_mut()?.copy_from(g);
        Ok(())
    }
}

fn frame(step: i64, natoms: usize) -> Frame {
    Frame::new(step, step as f64, vec![[0.0; 3]; natoms])
}

fn mask_node(sc: &mut SelectionCollection, set: &[usize], seen: &Seen) -> NodeId {
    let mut node = SelNode::new(
        NodeKind::Expression(ExprPayload::new(Box::new(MaskMethod {
            set: set.to_vec(),
            seen: seen.clone(),
        }))),
        ValueKind::Group,
    )
    .with_eval(EvalFn::Method);
    node.flags.atom_val = true;
    node.mempool = true;
    sc.add_node(node)
}

fn bool_root(
    sc: &mut SelectionCollection,
    op: BoolOp,
    func: EvalFn,
    children: &[NodeId],
    over: &[usize],
) -> NodeId {
    let b = sc.add_node(SelNode::new(NodeKind::Boolean(op), ValueKind::Group).with_eval(func));
    for &c in children {
        sc.link_child(b, c);
    }
    let root = sc.add_node(
        SelNode::new(
            NodeKind::Root {
                cgrp: Some(IndexGroup::from_indices(over.to_vec())),
            },
            ValueKind::None,
        )
        .with_eval(EvalFn::Root),
    );
    sc.link_child(root, b);
    sc.add_root(root);
    root
}

#[test]
fn not_over_atoms() {
    let mut sc = SelectionCollection::new(10);
    let seen = Seen::default();
    let child = mask_node(&mut sc, &[2, 4, 6], &seen);
    let root = bool_root(
        &mut sc,
        BoolOp::Not,
        EvalFn::Not,
        &[child],
        &(0..10).collect::<Vec<_>>(),
    );
    sc.add_selection("not", root, IndexGroup::full(10));

    sc.evaluate(&frame(0, 10), None).unwrap();
    assert_eq!(
        sc.selection("not").unwrap().atom_indices(),
        &[0, 1, 3, 5, 7, 8, 9]
    );
    assert_eq!(sc.pool().active_reservations(), 0);
}

#[test]
fn short_circuit_and() {
    let mut sc = SelectionCollection::new(10);
    let seen = Seen::default();
    let a = mask_node(&mut sc, &[0, 1, 2], &seen);
    let b = mask_node(&mut sc, &[5, 6, 7], &seen);
    let root = bool_root(
        &mut sc,
        BoolOp::And,
        EvalFn::And,
        &[a, b],
        &(0..10).collect::<Vec<_>>(),
    );
    sc.add_selection("and", root, IndexGroup::full(10));

    sc.evaluate(&frame(0, 10), None).unwrap();
    assert!(sc.selection("and").unwrap().atom_indices().is_empty());
    let seen = seen.borrow();
    assert_eq!(seen[0], (0..10).collect::<Vec<_>>());
    // the second child observes the running intersection
    assert_eq!(seen[1], vec![0, 1, 2]);
}

#[test]
fn or_union_over_remainder() {
    let mut sc = SelectionCollection::new(10);
    let seen = Seen::default();
    let a = mask_node(&mut sc, &[0, 1], &seen);
    let b = mask_node(&mut sc, &[1, 2, 3], &seen);
    let root = bool_root(
        &mut sc,
        BoolOp::Or,
        EvalFn::Or,
        &[a, b],
        &(0..10).collect::<Vec<_>>(),
    );
    sc.add_selection("or", root, IndexGroup::full(10));

    sc.evaluate(&frame(0, 10), None).unwrap();
    let atoms = sc.selection("or").unwrap().atom_indices().to_vec();
    assert_eq!(atoms, vec![0, 1, 2, 3]);
    // the second child is only invoked over the remaining partition
    assert_eq!(seen.borrow()[1], (2..10).collect::<Vec<_>>());
}

#[test]
fn subexpr_memoization_across_references() {
    let mut sc = SelectionCollection::new(10);
    let seen = Seen::default();

    // shared subexpression with its own root so per-frame state is reset
    let child = mask_node(&mut sc, &[0, 1, 2, 3, 4, 5, 6, 7, 8, 9], &seen);
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

    // two references evaluated over different groups
    let mut add_ref = |sc: &mut SelectionCollection, over: &[usize], name: &str| {
        let r = sc.add_node(
            SelNode::new(NodeKind::SubExprRef { param: None }, ValueKind::Group)
                .with_eval(EvalFn::SubExprRef),
        );
        sc.link_child(r, sub);
        let root = sc.add_node(
            SelNode::new(
                NodeKind::Root {
                    cgrp: Some(IndexGroup::from_indices(over.to_vec())),
                },
                ValueKind::None,
            )
            .with_eval(EvalFn::Root),
        );
        sc.link_child(root, r);
        sc.add_root(root);
        sc.add_selection(name, root, IndexGroup::from_indices(over.to_vec()));
    };
    add_ref(&mut sc, &[0, 2, 4], "first");
    add_ref(&mut sc, &[2, 4, 6], "second");

    sc.evaluate(&frame(0, 10), None).unwrap();
    assert_eq!(sc.selection("first").unwrap().atom_indices(), &[0, 2, 4]);
    assert_eq!(sc.selection("second").unwrap().atom_indices(), &[2, 4, 6]);
    {
        let seen = seen.borrow();
        assert_eq!(seen.len(), 2);
        assert_eq!(seen[0], vec![0, 2, 4]);
        // only the uncovered part is re-evaluated
        assert_eq!(seen[1], vec![6]);
    }

    // a new frame resets the cache and evaluates again
    sc.evaluate(&frame(1, 10), None).unwrap();
    assert_eq!(seen.borrow().len(), 4);
    assert_eq!(sc.pool().active_reservations(), 0);
}

#[test]
fn arithmetic_broadcast() {
    let mut sc = SelectionCollection::new(3);
    let left = sc.add_node(SelNode::new(
        NodeKind::Arithmetic(ArithOp::Plus),
        ValueKind::Real,
    ));
    sc.node_mut(left).flags.single_val = true;
    sc.node_mut(left).value.reserve_for(1);
    sc.node_mut(left).value.reals_mut().unwrap()[0] = 2.0;
    sc.node_mut(left).value.nr = 1;
    let right = sc.add_node(SelNode::new(
        NodeKind::Arithmetic(ArithOp::Plus),
        ValueKind::Real,
    ));
    sc.node_mut(right).value.reserve_for(3);
    sc.node_mut(right)
        .value
        .reals_mut()
        .unwrap()
        .copy_from_slice(&[1.0, 2.0, 3.0]);
    sc.node_mut(right).value.nr = 3;

    let mult = sc.add_node(
        SelNode::new(NodeKind::Arithmetic(ArithOp::Mult), ValueKind::Real)
            .with_eval(EvalFn::Arithmetic),
    );
    sc.link_child(mult, left);
    sc.node_mut(left).next = Some(right);
    let root = sc.add_node(
        SelNode::new(
            NodeKind::Root {
                cgrp: Some(IndexGroup::full(3)),
            },
            ValueKind::None,
        )
        .with_eval(EvalFn::Root),
    );
    sc.link_child(root, mult);
    sc.add_root(root);

    sc.evaluate(&frame(0, 3), None).unwrap();
    assert_eq!(sc.node(mult).value.reals().unwrap()[..3], [2.0, 4.0, 6.0]);
    assert_eq!(sc.node(mult).value.nr, 3);
}

#[test]
fn init_frame_fires_once_per_frame_across_references() {
    let mut sc = SelectionCollection::new(6);
    let inits = Rc::new(Cell::new(0));

    let mut method = SelNode::new(
        NodeKind::Expression(ExprPayload::new(Box::new(CountedInit {
            inits: inits.clone(),
        }))),
        ValueKind::Group,
    )
    .with_eval(EvalFn::Method);
    method.flags.atom_val = true;
    method.mempool = true;
    let method = sc.add_node(method);

    let sub = sc.add_node(
        SelNode::new(
            NodeKind::SubExpr {
                cgrp: IndexGroup::new(),
            },
            ValueKind::Group,
        )
        .with_eval(EvalFn::SubExpr),
    );
    sc.link_child(sub, method);
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

    // three references, each evaluated every frame
    for (i, over) in [[0usize, 1].as_slice(), &[2, 3], &[4, 5]].iter().enumerate() {
        let r = sc.add_node(
            SelNode::new(NodeKind::SubExprRef { param: None }, ValueKind::Group)
                .with_eval(EvalFn::SubExprRef),
        );
        sc.link_child(r, sub);
        let root = sc.add_node(
            SelNode::new(
                NodeKind::Root {
                    cgrp: Some(IndexGroup::from_indices(over.to_vec())),
                },
                ValueKind::None,
            )
            .with_eval(EvalFn::Root),
        );
        sc.link_child(root, r);
        sc.add_root(root);
        sc.add_selection(format!("ref{}", i), root, IndexGroup::from_indices(over.to_vec()));
    }

    sc.evaluate(&frame(0, 6), None).unwrap();
    assert_eq!(inits.get(), 1);
    sc.evaluate(&frame(1, 6), None).unwrap();
    assert_eq!(inits.get(), 2);
}

#[test]
fn determinism_of_repeated_evaluation() {
    let mut sc = SelectionCollection::new(10);
    let seen = Seen::default();
    let a = mask_node(&mut sc, &[0, 1, 2, 5], &seen);
    let b = mask_node(&mut sc, &[2, 5, 9], &seen);
    let root = bool_root(
        &mut sc,
        BoolOp::Or,
        EvalFn::Or,
        &[a, b],
        &(0..10).collect::<Vec<_>>(),
    );
    sc.add_selection("sel", root, IndexGroup::full(10));

    let fr = frame(0, 10);
    sc.evaluate(&fr, None).unwrap();
    let first = sc.selection("sel").unwrap().atom_indices().to_vec();
    sc.evaluate(&fr, None).unwrap();
    let second = sc.selection("sel").unwrap().atom_indices().to_vec();
    assert_eq!(first, second);
}

#[test]
fn covered_fraction_and_masses_across_frames() {
    let n = 4;
    let mut sc = SelectionCollection::new(n);
    sc.set_topology(Topology::new(
        vec!["N".into(), "CA".into(), "C".into(), "O".into()],
        vec![14.0, 12.0, 12.0, 16.0],
        vec![-0.3, 0.1, 0.5, -0.5],
    ));

    let mut method = SelNode::new(
        NodeKind::Expression(ExprPayload::new(Box::new(StepWindow))),
        ValueKind::Group,
    )
    .with_eval(EvalFn::Method);
    method.flags.atom_val = true;
    let method = sc.add_node(method);
    let root = sc.add_node(
        SelNode::new(
            NodeKind::Root {
                cgrp: Some(IndexGroup::full(n)),
            },
            ValueKind::None,
        )
        .with_eval(EvalFn::Root),
    );
    sc.link_child(root, method);
    sc.add_root(root);
    let index = sc.add_selection("window", root, IndexGroup::full(n));
    sc.selections_mut()[index].set_covered_fraction_enabled(true);

    sc.evaluate(&frame(0, n), None).unwrap();
    {
        let sel = sc.selection("window").unwrap();
        assert_eq!(sel.atom_indices(), &[0]);
        assert_eq!(sel.masses(), &[14.0]);
        assert_eq!(sel.charges(), &[-0.3]);
        assert_eq!(sel.covered_fraction(), 0.25);
    }

    sc.evaluate(&frame(1, n), None).unwrap();
    assert_eq!(sc.selection("window").unwrap().atom_indices(), &[0, 1]);
    assert_eq!(sc.selection("window").unwrap().covered_fraction(), 0.5);

    sc.evaluate_final(2);
    let sel = sc.selection("window").unwrap();
    // original atom set restored, covered fraction averaged over frames
    assert_eq!(sel.atom_indices(), &[0, 1, 2, 3]);
    assert_eq!(sel.masses(), &[14.0, 12.0, 12.0, 16.0]);
    assert!((sel.average_covered_fraction() - 0.375).abs() < 1e-12);
}
