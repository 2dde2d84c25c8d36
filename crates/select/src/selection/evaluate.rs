//! Frame evaluation of compiled selection trees.
//!
//! One evaluator per dispatch slot, all sharing the signature
//! `eval(state, node, group)`: `group` is the set of atoms the node should be
//! computed over, and `None` means "use the values already present on the
//! child without restricting". Scratch storage comes from the evaluation
//! pool through scoped guards; every guard releases on both the success and
//! the failure path.

use tracing::trace;

use crate::selection::error::{Result, SelectionError};
use crate::selection::group::IndexGroup;
use crate::selection::mempool::{GroupReserver, MemPool, NodeReserver, TempValueAssigner};
use crate::selection::method::MethodContext;
use crate::selection::node::{ArithOp, EvalFn, NodeArena, NodeId, NodeKind, SelNode};
use crate::selection::value::{ValueData, ValueKind};
use crate::topology::Topology;
use crate::trajectory::{Frame, Pbc};

/// Everything an evaluator call needs for the current frame.
pub(crate) struct EvalState<'a> {
    pub(crate) nodes: &'a mut NodeArena,
    pub(crate) pool: &'a mut MemPool,
    /// Group holding all atoms of the system.
    pub(crate) gall: &'a IndexGroup,
    pub(crate) top: Option<&'a Topology>,
    pub(crate) fr: &'a Frame,
    pub(crate) pbc: Option<&'a Pbc>,
}

/// Clear per-frame flags on every node reachable from `start` through
/// child/next links, marking methods that want a first-touch callback.
///
/// Does not descend through subexpression references; their targets are
/// reached through the root list.
pub(crate) fn init_frame_eval(nodes: &mut NodeArena, start: Option<NodeId>) {
    let mut cur = start;
    while let Some(id) = cur {
        let node = &mut nodes[id];
        node.flags.init_frame = false;
        node.flags.eval_frame = false;
        if let NodeKind::Expression(expr) = &node.kind {
            if expr.method.has_init_frame() {
                node.flags.init_frame = true;
            }
        }
        let descend = !matches!(node.kind, NodeKind::SubExprRef { .. });
        let child = node.child;
        cur = node.next;
        if descend {
            init_frame_eval(nodes, child);
        }
    }
}

impl<'a> EvalState<'a> {
    /// Run the evaluator named by the node's dispatch slot.
    pub(crate) fn evaluate(&mut self, id: NodeId, g: Option<&IndexGroup>) -> Result<()> {
        let Some(func) = self.nodes[id].eval else {
            return Err(SelectionError::internal(format!(
                "node {} has no evaluator",
                id
            )));
        };
        match func {
            EvalFn::Root => self.eval_root(id),
            EvalFn::Static => self.eval_static(id, g),
            EvalFn::SubExprSimple => self.eval_subexpr_simple(id, g),
            EvalFn::SubExprStaticEval => self.eval_subexpr_staticeval(id, g),
            EvalFn::SubExpr => self.eval_subexpr(id, g),
            EvalFn::SubExprRefSimple => self.eval_subexprref_simple(id, g),
            EvalFn::SubExprRef => self.eval_subexprref(id, g),
            EvalFn::Method => self.eval_method(id, g),
            EvalFn::Modifier => self.eval_modifier(id, g),
            EvalFn::Not => self.eval_not(id, g),
            EvalFn::And => self.eval_and(id, g),
            EvalFn::Or => self.eval_or(id, g),
            EvalFn::Arithmetic => self.eval_arithmetic(id, g),
        }
    }

    fn child_of(&self, id: NodeId) -> Result<NodeId> {
        self.nodes[id]
            .child
            .ok_or_else(|| SelectionError::internal(format!("node {} has no child", id)))
    }

    fn has_eval(&self, id: NodeId) -> bool {
        self.nodes[id].eval.is_some()
    }

    fn require_group<'g>(&self, g: Option<&'g IndexGroup>) -> Result<&'g IndexGroup> {
        g.ok_or_else(|| {
            SelectionError::internal("evaluator requires an explicit evaluation group")
        })
    }

    fn group_size(&self, g: Option<&IndexGroup>) -> usize {
        g.map_or(self.gall.len(), IndexGroup::len)
    }

    fn method_context(&self) -> MethodContext<'a> {
        MethodContext {
            top: self.top,
            fr: self.fr,
            pbc: self.pbc,
        }
    }

    /// Evaluate every child that has an evaluator over `g`.
    fn evaluate_children(&mut self, id: NodeId, g: Option<&IndexGroup>) -> Result<()> {
        let mut child = self.nodes[id].child;
        while let Some(c) = child {
            if self.has_eval(c) {
                self.evaluate(c, g)?;
            }
            child = self.nodes[c].next;
        }
        Ok(())
    }

    /// Parameter-child sub-protocol for method and modifier nodes: children
    /// already evaluated this frame are skipped, per-atom children follow the
    /// current group, everything else is evaluated once with no restriction.
    fn evaluate_params(&mut self, id: NodeId, g: &IndexGroup) -> Result<()> {
        let mut child = self.nodes[id].child;
        while let Some(c) = child {
            if self.has_eval(c) && !self.nodes[c].flags.eval_frame {
                if self.nodes[c].flags.atom_val {
                    self.evaluate(c, Some(g))?;
                } else {
                    self.nodes[c].flags.eval_frame = true;
                    self.evaluate(c, None)?;
                }
            }
            child = self.nodes[c].next;
        }
        Ok(())
    }

    /// Reserve scratch on `node`, run `f`, release on every path.
    fn with_node_scratch(
        &mut self,
        node: NodeId,
        count: usize,
        f: impl FnOnce(&mut Self) -> Result<()>,
    ) -> Result<()> {
        let mut reserver = NodeReserver::new();
        reserver.reserve(self.nodes, self.pool, node, count)?;
        let res = f(self);
        reserver.release(self.nodes, self.pool);
        res
    }

    /// Root of one compiled tree: delegates to the child over the tree's
    /// evaluation group. An empty group means nothing to do; `None` means the
    /// whole universe and passes no restriction down.
    fn eval_root(&mut self, id: NodeId) -> Result<()> {
        let Some(child) = self.nodes[id].child else {
            return Ok(());
        };
        {
            let NodeKind::Root { cgrp } = &self.nodes[id].kind else {
                return Err(SelectionError::internal("root evaluator on a non-root node"));
            };
            if matches!(cgrp, Some(g) if g.is_empty()) {
                return Ok(());
            }
        }
        if !self.has_eval(child) {
            return Ok(());
        }
        let taken = match &mut self.nodes[id].kind {
            NodeKind::Root { cgrp } => cgrp.take(),
            _ => unreachable!(),
        };
        let res = self.evaluate(child, taken.as_ref());
        if let NodeKind::Root { cgrp } = &mut self.nodes[id].kind {
            *cgrp = taken;
        }
        res
    }

    /// Constant group: the value is the constant restricted to `g`.
    fn eval_static(&mut self, id: NodeId, g: Option<&IndexGroup>) -> Result<()> {
        let SelNode { kind, value, .. } = &mut self.nodes[id];
        let NodeKind::Const { group: cgrp } = &*kind else {
            return Err(SelectionError::internal(
                "static evaluator on a non-constant node",
            ));
        };
        let out = value.group_mut()?;
        match g {
            Some(g) => out.assign_intersection(cgrp, g),
            None => out.copy_from(cgrp),
        }
        Ok(())
    }

    /// Subexpression referenced exactly once: the child writes straight into
    /// this node's storage.
    fn eval_subexpr_simple(&mut self, id: NodeId, g: Option<&IndexGroup>) -> Result<()> {
        let child = self.child_of(id)?;
        if self.has_eval(child) {
            let count = self.group_size(g);
            self.nodes[id].value.reserve_for(count);
            let mut assigner = TempValueAssigner::new();
            assigner.assign(self.nodes, child, id)?;
            let res = self.evaluate(child, g);
            assigner.restore(self.nodes);
            res?;
        } else {
            let (sn, cn) = self.nodes.get_two_mut(id, child);
            if sn.value.kind() != cn.value.kind() {
                return Err(SelectionError::internal(
                    "mismatching value kinds between subexpression and child",
                ));
            }
            let data = cn.value.data().clone();
            sn.value.replace_data(data);
        }
        self.nodes[id].value.nr = self.nodes[child].value.nr;
        Ok(())
    }

    /// Subexpression whose evaluation group is the same for every reference:
    /// the first call this frame evaluates the child, later calls reuse the
    /// stored value.
    fn eval_subexpr_staticeval(&mut self, id: NodeId, g: Option<&IndexGroup>) -> Result<()> {
        {
            let NodeKind::SubExpr { cgrp } = &self.nodes[id].kind else {
                return Err(SelectionError::internal(
                    "subexpression evaluator on a non-subexpression node",
                ));
            };
            if !cgrp.is_empty() {
                return Ok(());
            }
        }
        let g = self.require_group(g)?;
        let child = self.child_of(id)?;
        self.nodes[id].value.reserve_for(g.len());
        let mut assigner = TempValueAssigner::new();
        assigner.assign(self.nodes, child, id)?;
        let res = self.evaluate(child, Some(g));
        assigner.restore(self.nodes);
        res?;
        self.nodes[id].value.nr = self.nodes[child].value.nr;
        match &mut self.nodes[id].kind {
            // keeps its own name even when g carries one
            NodeKind::SubExpr { cgrp } => cgrp.set_indices(g.indices()),
            _ => unreachable!(),
        }
        Ok(())
    }

    /// General memoized subexpression. The cached group records the union of
    /// groups the child has been evaluated over this frame; a call only
    /// evaluates the child over the part of `g` not yet covered and merges
    /// the fresh values in by atom index.
    fn eval_subexpr(&mut self, id: NodeId, g: Option<&IndexGroup>) -> Result<()> {
        let g = self.require_group(g)?;
        let child = self.child_of(id)?;
        let cgrp_empty = match &self.nodes[id].kind {
            NodeKind::SubExpr { cgrp } => cgrp.is_empty(),
            _ => {
                return Err(SelectionError::internal(
                    "subexpression evaluator on a non-subexpression node",
                ));
            }
        };
        if cgrp_empty {
            self.nodes[id].value.reserve_for(g.len());
            let mut assigner = TempValueAssigner::new();
            assigner.assign(self.nodes, child, id)?;
            let res = self.evaluate(child, Some(g));
            assigner.restore(self.nodes);
            res?;
            self.nodes[id].value.nr = self.nodes[child].value.nr;
            match &mut self.nodes[id].kind {
                // keeps its own name even when g carries one
                NodeKind::SubExpr { cgrp } => cgrp.set_indices(g.indices()),
                _ => unreachable!(),
            }
            return Ok(());
        }
        let mut gmissr = GroupReserver::new();
        let res = self.eval_subexpr_missing(id, child, g, &mut gmissr);
        gmissr.release(self.pool);
        res
    }

    fn eval_subexpr_missing(
        &mut self,
        id: NodeId,
        child: NodeId,
        g: &IndexGroup,
        gmissr: &mut GroupReserver,
    ) -> Result<()> {
        let gmiss = gmissr.reserve(self.pool, g.len())?;
        match &self.nodes[id].kind {
            NodeKind::SubExpr { cgrp } => {
                debug_assert!(cgrp.is_sorted());
                gmiss.assign_difference(g, cgrp);
            }
            _ => unreachable!(),
        }
        if gmiss.is_empty() {
            return Ok(());
        }
        let mut reserver = NodeReserver::new();
        reserver.reserve(self.nodes, self.pool, child, gmiss.len())?;
        let mut res = self.evaluate(child, Some(gmiss));
        if res.is_ok() {
            res = self.merge_subexpr_values(id, child, gmiss);
        }
        reserver.release(self.nodes, self.pool);
        res?;
        match &mut self.nodes[id].kind {
            NodeKind::SubExpr { cgrp } => cgrp.merge_with(gmiss),
            _ => unreachable!(),
        }
        Ok(())
    }

    /// Merge values freshly computed for `gmiss` (in the child's scratch)
    /// into this node's cached values, keeping them ordered by atom index.
    fn merge_subexpr_values(&mut self, id: NodeId, child: NodeId, gmiss: &IndexGroup) -> Result<()> {
        let (sn, cn) = self.nodes.get_two_mut(id, child);
        let SelNode { kind, value, .. } = sn;
        let NodeKind::SubExpr { cgrp } = &*kind else {
            unreachable!();
        };
        let (nold, nnew) = (cgrp.len(), gmiss.len());
        if value.kind() == ValueKind::Group {
            let cg = cn.value.group()?;
            value.group_mut()?.merge_with(cg);
            return Ok(());
        }
        debug_assert_eq!(cn.value.nr, nnew, "child produced a short value vector");
        match (value.data_mut(), cn.value.data()) {
            (ValueData::Int(dst), ValueData::Int(src)) => {
                merge_values(dst, src, cgrp.indices(), gmiss.indices());
            }
            (ValueData::Real(dst), ValueData::Real(src)) => {
                merge_values(dst, src, cgrp.indices(), gmiss.indices());
            }
            (ValueData::Str(dst), ValueData::Str(src)) => {
                merge_values(dst, src, cgrp.indices(), gmiss.indices());
            }
            (ValueData::Pos(_), _) => {
                return Err(SelectionError::NotImplemented(
                    "position-valued subexpressions",
                ));
            }
            _ => {
                return Err(SelectionError::internal("invalid subexpression value kind"));
            }
        }
        value.nr = nold + nnew;
        Ok(())
    }

    /// Reference to a subexpression with a single reference chain: the target
    /// and its child write straight into this node's storage.
    fn eval_subexprref_simple(&mut self, id: NodeId, g: Option<&IndexGroup>) -> Result<()> {
        let target = self.child_of(id)?;
        if let Some(g) = g {
            self.nodes[id].value.reserve_for(g.len());
            let mut assigner = TempValueAssigner::new();
            assigner.assign(self.nodes, target, id)?;
            let res = self.evaluate(target, Some(g));
            assigner.restore(self.nodes);
            res?;
            self.nodes[id].value.nr = self.nodes[target].value.nr;
        } else {
            // target already evaluated through its own root
            let (rn, tn) = self.nodes.get_two_mut(id, target);
            if rn.value.kind() != tn.value.kind() {
                return Err(SelectionError::internal(
                    "mismatching value kinds between reference and subexpression",
                ));
            }
            let data = tn.value.data().clone();
            rn.value.replace_data(data);
            rn.value.nr = tn.value.nr;
        }
        self.mirror_param(id);
        Ok(())
    }

    /// General subexpression reference: evaluates the target over `g` and
    /// gathers the values corresponding to `g`'s atoms out of the target's
    /// cache.
    fn eval_subexprref(&mut self, id: NodeId, g: Option<&IndexGroup>) -> Result<()> {
        let target = self.child_of(id)?;
        if let Some(g) = g {
            self.evaluate(target, Some(g))?;
        }
        let count = match g {
            Some(g) => g.len(),
            None => self.nodes[target].value.nr,
        };
        self.nodes[id].value.reserve_for(count);
        let (rn, tn) = self.nodes.get_two_mut(id, target);
        let tcgrp = match &tn.kind {
            NodeKind::SubExpr { cgrp } => cgrp,
            _ => {
                return Err(SelectionError::internal(
                    "reference target is not a subexpression",
                ));
            }
        };
        let nr = match (rn.value.data_mut(), tn.value.data()) {
            (ValueData::Int(dst), ValueData::Int(src)) => {
                extract_values(dst, src, tcgrp, g, tn.value.nr)?
            }
            (ValueData::Real(dst), ValueData::Real(src)) => {
                extract_values(dst, src, tcgrp, g, tn.value.nr)?
            }
            (ValueData::Str(dst), ValueData::Str(src)) => {
                extract_values(dst, src, tcgrp, g, tn.value.nr)?
            }
            (ValueData::Pos(dst), ValueData::Pos(src)) => {
                dst.copy_from(src);
                tn.value.nr
            }
            (ValueData::Group(dst), ValueData::Group(src)) => {
                match g {
                    Some(g) => dst.assign_intersection(src, g),
                    None => dst.copy_from(src),
                }
                1
            }
            _ => {
                return Err(SelectionError::internal(
                    "invalid subexpression reference value kind",
                ));
            }
        };
        rn.value.nr = nr;
        self.mirror_param(id);
        Ok(())
    }

    /// Mirror the produced element count into the outbound parameter slot.
    fn mirror_param(&mut self, id: NodeId) {
        let nr = self.nodes[id].value.nr;
        if let NodeKind::SubExprRef { param: Some(p) } = &self.nodes[id].kind {
            p.set(nr);
        }
    }

    /// Method expression: evaluate parameters, run the first-touch callback
    /// if this is the method's first evaluation this frame, then hand off to
    /// the update callback (position form when a position calculator is
    /// attached).
    fn eval_method(&mut self, id: NodeId, g: Option<&IndexGroup>) -> Result<()> {
        let g = match g {
            Some(g) => g,
            None => self.gall,
        };
        self.evaluate_params(id, g)?;
        let mctx = self.method_context();
        if self.nodes[id].flags.init_frame {
            self.nodes[id].flags.init_frame = false;
            let NodeKind::Expression(expr) = &mut self.nodes[id].kind else {
                return Err(SelectionError::internal(
                    "method evaluator on a non-expression node",
                ));
            };
            trace!(method = expr.method.name(), "init_frame");
            expr.method.init_frame(&mctx)?;
        }
        let count = if self.nodes[id].flags.single_val {
            1
        } else {
            g.len()
        };
        self.nodes[id].value.reserve_for(count);
        self.nodes[id].value.nr = count;
        let fr = self.fr;
        let pbc = self.pbc;
        let SelNode { kind, value, .. } = &mut self.nodes[id];
        let NodeKind::Expression(expr) = kind else {
            return Err(SelectionError::internal(
                "method evaluator on a non-expression node",
            ));
        };
        if let Some(pc) = &mut expr.pc {
            pc.update(&mut expr.pos, g, fr, pbc)?;
            expr.method.pos_update(&mctx, &expr.pos, value)
        } else {
            expr.method.update(&mctx, g, value)
        }
    }

    /// Modifier expression: like a method, but consumes the positions
    /// produced by its child instead of an atom group.
    fn eval_modifier(&mut self, id: NodeId, g: Option<&IndexGroup>) -> Result<()> {
        let g = match g {
            Some(g) => g,
            None => self.gall,
        };
        self.evaluate_params(id, g)?;
        let mctx = self.method_context();
        if self.nodes[id].flags.init_frame {
            self.nodes[id].flags.init_frame = false;
            let NodeKind::Modifier(expr) = &mut self.nodes[id].kind else {
                return Err(SelectionError::internal(
                    "modifier evaluator on a non-modifier node",
                ));
            };
            expr.method.init_frame(&mctx)?;
        }
        let child = self.nodes[id]
            .child
            .expect("modifier element with a value must have a child");
        if self.nodes[child].value.kind() != ValueKind::Pos {
            return Err(SelectionError::NotImplemented(
                "non-position valued modifiers",
            ));
        }
        let count = if self.nodes[id].flags.single_val {
            1
        } else {
            self.nodes[child].value.nr
        };
        self.nodes[id].value.reserve_for(count);
        self.nodes[id].value.nr = count;
        let (mn, cn) = self.nodes.get_two_mut(id, child);
        let pos = cn.value.positions()?;
        let SelNode { kind, value, .. } = mn;
        let NodeKind::Modifier(expr) = kind else {
            return Err(SelectionError::internal(
                "modifier evaluator on a non-modifier node",
            ));
        };
        expr.method.pos_update(&mctx, pos, value)
    }

    /// Boolean NOT: the value is `g` minus the child's value.
    fn eval_not(&mut self, id: NodeId, g: Option<&IndexGroup>) -> Result<()> {
        let g = self.require_group(g)?;
        let child = self.child_of(id)?;
        let mut result = self.nodes[id].value.take_group()?;
        let res = self.with_node_scratch(child, g.len(), |state| {
            state.evaluate(child, Some(g))?;
            result.assign_difference(g, state.nodes[child].value.group()?);
            Ok(())
        });
        self.nodes[id].value.put_group(result);
        res
    }

    /// Short-circuiting AND: each child is evaluated over the running
    /// intersection of the previous children's values, stopping as soon as
    /// it becomes empty. A leading child without an evaluator is skipped;
    /// its value is known to cover the evaluation group.
    fn eval_and(&mut self, id: NodeId, g: Option<&IndexGroup>) -> Result<()> {
        let g = self.require_group(g)?;
        let mut first = self.child_of(id)?;
        if !self.has_eval(first) {
            first = self.nodes[first].next.ok_or_else(|| {
                SelectionError::internal("conjunction has no evaluable children")
            })?;
        }
        let mut running = self.nodes[id].value.take_group()?;
        let mut res = self.with_node_scratch(first, g.len(), |state| {
            state.evaluate(first, Some(g))?;
            running.copy_from(state.nodes[first].value.group()?);
            Ok(())
        });
        let mut next = self.nodes[first].next;
        while res.is_ok() && !running.is_empty() {
            let Some(c) = next else { break };
            res = self.with_node_scratch(c, running.len(), |state| {
                state.evaluate(c, Some(&running))?;
                running.intersect_with(state.nodes[c].value.group()?);
                Ok(())
            });
            next = self.nodes[c].next;
        }
        self.nodes[id].value.put_group(running);
        res
    }

    /// Short-circuiting OR: each child is evaluated over the part of `g` no
    /// previous child matched, stopping once nothing remains. A leading child
    /// without an evaluator contributes its existing value unevaluated.
    fn eval_or(&mut self, id: NodeId, g: Option<&IndexGroup>) -> Result<()> {
        let g = self.require_group(g)?;
        let first = self.child_of(id)?;
        let mut result = self.nodes[id].value.take_group()?;
        result.clear();
        let mut remaining = IndexGroup::new();
        let mut res = if self.has_eval(first) {
            self.with_node_scratch(first, g.len(), |state| {
                state.evaluate(first, Some(g))?;
                let (inside, outside) = g.partition(state.nodes[first].value.group()?);
                result = inside;
                remaining = outside;
                Ok(())
            })
        } else {
            let (inside, outside) = g.partition(self.nodes[first].value.group()?);
            result = inside;
            remaining = outside;
            Ok(())
        };
        let mut next = self.nodes[first].next;
        while res.is_ok() && !remaining.is_empty() {
            let Some(c) = next else { break };
            res = self.with_node_scratch(c, remaining.len(), |state| {
                state.evaluate(c, Some(&remaining))?;
                let (inside, outside) = remaining.partition(state.nodes[c].value.group()?);
                result.extend_from(&inside);
                remaining = outside;
                Ok(())
            });
            next = self.nodes[c].next;
        }
        result.sort();
        self.nodes[id].value.put_group(result);
        res
    }

    /// Arithmetic over real-valued operands with scalar broadcast. An
    /// operand whose storage comes from the pool is retargeted to write into
    /// this node's storage, so the result needs no extra copy.
    fn eval_arithmetic(&mut self, id: NodeId, g: Option<&IndexGroup>) -> Result<()> {
        let op = match &self.nodes[id].kind {
            NodeKind::Arithmetic(op) => *op,
            _ => {
                return Err(SelectionError::internal(
                    "arithmetic evaluator on a non-arithmetic node",
                ));
            }
        };
        let left = self.child_of(id)?;
        let right = self.nodes[left].next;
        debug_assert!(
            right.is_some() || op == ArithOp::Neg,
            "right operand can only be missing for negation"
        );
        let n = if self.nodes[id].flags.single_val {
            1
        } else {
            self.require_group(g)?.len()
        };
        let scratch = self.group_size(g);
        self.nodes[id].value.reserve_for(n);

        let mut assigner = TempValueAssigner::new();
        let mut reserver = NodeReserver::new();
        let mut left_inplace = false;
        let mut right_inplace = false;
        if self.nodes[left].mempool {
            assigner.assign(self.nodes, left, id)?;
            left_inplace = true;
            if let Some(r) = right {
                if let Err(err) = reserver.reserve(self.nodes, self.pool, r, scratch) {
                    assigner.restore(self.nodes);
                    return Err(err);
                }
            }
        } else if let Some(r) = right {
            if self.nodes[r].mempool {
                assigner.assign(self.nodes, r, id)?;
                right_inplace = true;
            }
        }

        let mut res = self.evaluate_children(id, g);
        if res.is_ok() {
            res = self.apply_arithmetic(op, id, left, right, left_inplace, right_inplace, n);
        }
        reserver.release(self.nodes, self.pool);
        assigner.restore(self.nodes);
        res?;
        self.nodes[id].value.nr = n;
        Ok(())
    }

    fn apply_arithmetic(
        &mut self,
        op: ArithOp,
        id: NodeId,
        left: NodeId,
        right: Option<NodeId>,
        left_inplace: bool,
        right_inplace: bool,
        n: usize,
    ) -> Result<()> {
        let left_single = self.nodes[left].flags.single_val;
        let right_single = right.map_or(true, |r| self.nodes[r].flags.single_val);
        match (left_inplace, right_inplace, right) {
            (true, _, Some(r)) => {
                let (ln, rn) = self.nodes.get_two_mut(left, r);
                let rv = rn.value.reals()?;
                let dst = ln.value.reals_mut()?;
                arith_loop(op, dst, Operand::InPlace, Some(Operand::Slice(rv)), n, left_single, right_single);
            }
            (true, _, None) => {
                let dst = self.nodes[left].value.reals_mut()?;
                arith_loop(op, dst, Operand::InPlace, None, n, left_single, true);
            }
            (false, true, Some(r)) => {
                let (rn, ln) = self.nodes.get_two_mut(r, left);
                let lv = ln.value.reals()?;
                let dst = rn.value.reals_mut()?;
                arith_loop(op, dst, Operand::Slice(lv), Some(Operand::InPlace), n, left_single, right_single);
            }
            (false, false, Some(r)) => {
                let (on, ln, rn) = self.nodes.get_three_mut(id, left, r);
                let lv = ln.value.reals()?;
                let rv = rn.value.reals()?;
                let dst = on.value.reals_mut()?;
                arith_loop(op, dst, Operand::Slice(lv), Some(Operand::Slice(rv)), n, left_single, right_single);
            }
            (false, false, None) => {
                let (on, ln) = self.nodes.get_two_mut(id, left);
                let lv = ln.value.reals()?;
                let dst = on.value.reals_mut()?;
                arith_loop(op, dst, Operand::Slice(lv), None, n, left_single, true);
            }
            (false, true, None) => unreachable!(),
        }
        Ok(())
    }
}

/// Where an arithmetic operand's values live: in the destination buffer
/// itself (a pooled operand retargeted at the output) or in another node's
/// storage.
#[derive(Clone, Copy)]
enum Operand<'a> {
    InPlace,
    Slice(&'a [f64]),
}

fn arith_loop(
    op: ArithOp,
    dst: &mut [f64],
    lsrc: Operand<'_>,
    rsrc: Option<Operand<'_>>,
    n: usize,
    left_single: bool,
    right_single: bool,
) {
    let (mut i1, mut i2) = (0usize, 0usize);
    for i in 0..n {
        let lval = match lsrc {
            Operand::InPlace => dst[i1],
            Operand::Slice(s) => s[i1],
        };
        let rval = match rsrc {
            None => 0.0,
            Some(Operand::InPlace) => dst[i2],
            Some(Operand::Slice(s)) => s[i2],
        };
        dst[i] = match op {
            ArithOp::Plus => lval + rval,
            ArithOp::Minus => lval - rval,
            ArithOp::Neg => -lval,
            ArithOp::Mult => lval * rval,
            ArithOp::Div => lval / rval,
            ArithOp::Exp => lval.powf(rval),
        };
        if !left_single {
            i1 += 1;
        }
        if rsrc.is_some() && !right_single {
            i2 += 1;
        }
    }
}

/// Merge values for `new_idx` (in `src`) into the cached values for
/// `old_idx` (the head of `dst`), ordering the result by atom index. Walks
/// both sources from the high end writing right to left, so the merge is in
/// place in `dst`.
fn merge_values<T: Clone>(dst: &mut Vec<T>, src: &[T], old_idx: &[usize], new_idx: &[usize]) {
    let nold = old_idx.len();
    let nnew = new_idx.len();
    debug_assert!(dst.len() >= nold && src.len() >= nnew);
    if nnew == 0 {
        return;
    }
    if dst.len() < nold + nnew {
        let filler = src[0].clone();
        dst.resize(nold + nnew, filler);
    }
    let mut i = nold as isize - 1;
    let mut j = nnew as isize - 1;
    for k in (0..nold + nnew).rev() {
        if i < 0 || (j >= 0 && old_idx[i as usize] < new_idx[j as usize]) {
            dst[k] = src[j as usize].clone();
            j -= 1;
        } else {
            let v = dst[i as usize].clone();
            dst[k] = v;
            i -= 1;
        }
    }
}

/// Gather the values for `g`'s atoms out of a subexpression's cache, walking
/// the cached group once. With no group, all cached values are copied.
fn extract_values<T: Clone>(
    dst: &mut [T],
    src: &[T],
    cgrp: &IndexGroup,
    g: Option<&IndexGroup>,
    src_nr: usize,
) -> Result<usize> {
    let Some(g) = g else {
        dst[..src_nr].clone_from_slice(&src[..src_nr]);
        return Ok(src_nr);
    };
    let cidx = cgrp.indices();
    let mut j = 0;
    for (i, atom) in g.iter().enumerate() {
        while j < cidx.len() && cidx[j] < atom {
            j += 1;
        }
        if j >= cidx.len() || cidx[j] != atom {
            return Err(SelectionError::internal(
                "reference group not covered by the subexpression cache",
            ));
        }
        dst[i] = src[j].clone();
        j += 1;
    }
    Ok(g.len())
}
