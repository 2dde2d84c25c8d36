//! Selection-expression evaluation against trajectory frames.
//!
//! A [`SelectionCollection`] owns a set of compiled selection trees sharing
//! one node arena and one evaluation memory pool. Each frame is evaluated
//! with [`SelectionCollection::evaluate`], which resets per-frame state,
//! runs every root in list order, and refreshes the exported [`Selection`]
//! records; [`SelectionCollection::evaluate_final`] closes out a run.
//!
//! The parser and compiler that produce the trees live elsewhere; trees are
//! assembled here through the node accessors.

pub mod error;
pub mod evaluate;
pub mod group;
pub mod mempool;
pub mod method;
pub mod node;
pub mod value;

pub use error::{Result, SelectionError};
pub use group::IndexGroup;
pub use mempool::MemPool;
pub use method::{AtomPosCalc, MethodContext, PosCalc, SelMethod};
pub use node::{
    evalfunc_name, ArithOp, BoolOp, EvalFn, ExprPayload, NodeArena, NodeFlags, NodeId, NodeKind,
    ParamSlot, SelNode,
};
pub use value::{PosSet, SelValue, ValueData, ValueKind};

use rustc_hash::FxHashMap;
use tracing::debug;

use crate::topology::Topology;
use crate::trajectory::{Frame, Pbc};
use evaluate::{init_frame_eval, EvalState};

/// One exported selection: a view of a compiled tree's current value plus
/// the per-atom data and statistics maintained across frames.
#[derive(Debug)]
pub struct Selection {
    name: String,
    root: NodeId,
    /// Atoms selected in the current frame.
    atoms: IndexGroup,
    /// The selection's full atom set, before any dynamic restriction.
    full_atoms: IndexGroup,
    masses: Vec<f64>,
    charges: Vec<f64>,
    cfrac_enabled: bool,
    cfrac: f64,
    cfrac_sum: f64,
    avg_cfrac: f64,
}

impl Selection {
    fn new(name: String, root: NodeId, full_atoms: IndexGroup) -> Self {
        let atoms = full_atoms.clone();
        Self {
            name,
            root,
            atoms,
            full_atoms,
            masses: Vec::new(),
            charges: Vec::new(),
            cfrac_enabled: false,
            cfrac: 1.0,
            cfrac_sum: 0.0,
            avg_cfrac: 1.0,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn root(&self) -> NodeId {
        self.root
    }

    /// Atoms selected in the most recently evaluated frame.
    pub fn atom_indices(&self) -> &[usize] {
        self.atoms.indices()
    }

    /// Per-atom masses matching [`atom_indices`].
    ///
    /// [`atom_indices`]: Selection::atom_indices
    pub fn masses(&self) -> &[f64] {
        &self.masses
    }

    /// Per-atom charges matching [`atom_indices`].
    ///
    /// [`atom_indices`]: Selection::atom_indices
    pub fn charges(&self) -> &[f64] {
        &self.charges
    }

    /// Track what fraction of the selection's full atom set is covered each
    /// frame.
    pub fn set_covered_fraction_enabled(&mut self, enabled: bool) {
        self.cfrac_enabled = enabled;
        self.cfrac = 1.0;
        self.cfrac_sum = 0.0;
        self.avg_cfrac = 1.0;
    }

    /// Covered fraction of the most recently evaluated frame.
    pub fn covered_fraction(&self) -> f64 {
        self.cfrac
    }

    /// Time-averaged covered fraction; valid after
    /// [`SelectionCollection::evaluate_final`].
    pub fn average_covered_fraction(&self) -> f64 {
        self.avg_cfrac
    }

    /// Pull the current frame's atom set out of the evaluated tree.
    fn refresh_atoms(&mut self, nodes: &NodeArena) {
        let Some(child) = nodes[self.root].child else {
            return;
        };
        let value = &nodes[child].value;
        match value.data() {
            ValueData::Group(g) => self.atoms.set_indices(g.indices()),
            ValueData::Pos(p) => self.atoms.set_indices(p.group.indices()),
            _ => {}
        }
    }

    fn refresh_masses_and_charges(&mut self, top: Option<&Topology>) {
        self.masses.clear();
        self.charges.clear();
        for atom in self.atoms.iter() {
            match top {
                Some(top) if atom < top.n_atoms() => {
                    self.masses.push(top.masses[atom]);
                    self.charges.push(top.charges[atom]);
                }
                _ => {
                    self.masses.push(1.0);
                    self.charges.push(0.0);
                }
            }
        }
    }

    fn update_covered_fraction_for_frame(&mut self) {
        if !self.cfrac_enabled {
            self.cfrac = 1.0;
            return;
        }
        self.cfrac = if self.full_atoms.is_empty() {
            0.0
        } else {
            self.atoms.len() as f64 / self.full_atoms.len() as f64
        };
        self.cfrac_sum += self.cfrac;
    }

    fn restore_original_positions(&mut self, top: Option<&Topology>) {
        self.atoms.set_indices(self.full_atoms.indices());
        self.refresh_masses_and_charges(top);
    }

    fn compute_average_covered_fraction(&mut self, nframes: usize) {
        self.avg_cfrac = if self.cfrac_enabled && nframes > 0 {
            self.cfrac_sum / nframes as f64
        } else {
            1.0
        };
    }
}

/// An ordered list of compiled selection trees sharing a node arena, an
/// evaluation memory pool, and per-frame context.
///
/// Evaluation is single-threaded per collection: roots run in list order,
/// children in sibling order, and that order is observable through method
/// side effects and boolean short-circuiting.
#[derive(Debug, Default)]
pub struct SelectionCollection {
    nodes: NodeArena,
    roots: Vec<NodeId>,
    selections: Vec<Selection>,
    by_name: FxHashMap<String, usize>,
    pool: MemPool,
    gall: IndexGroup,
    top: Option<Topology>,
}

impl SelectionCollection {
    /// Create a collection for a system of `natoms` atoms.
    pub fn new(natoms: usize) -> Self {
        Self {
            gall: IndexGroup::full(natoms).with_name("all"),
            ..Self::default()
        }
    }

    pub fn set_topology(&mut self, top: Topology) {
        self.top = Some(top);
    }

    /// Group holding all atoms of the system.
    pub fn universe(&self) -> &IndexGroup {
        &self.gall
    }

    pub fn pool(&self) -> &MemPool {
        &self.pool
    }

    pub fn add_node(&mut self, node: SelNode) -> NodeId {
        self.nodes.push(node)
    }

    pub fn node(&self, id: NodeId) -> &SelNode {
        &self.nodes[id]
    }

    pub fn node_mut(&mut self, id: NodeId) -> &mut SelNode {
        &mut self.nodes[id]
    }

    /// Attach `child` under `parent`, appending to the sibling chain.
    pub fn link_child(&mut self, parent: NodeId, child: NodeId) {
        match self.nodes[parent].child {
            None => self.nodes[parent].child = Some(child),
            Some(first) => {
                let mut cur = first;
                while let Some(next) = self.nodes[cur].next {
                    cur = next;
                }
                self.nodes[cur].next = Some(child);
            }
        }
    }

    /// Append a root node to the evaluation order.
    pub fn add_root(&mut self, root: NodeId) {
        self.roots.push(root);
    }

    pub fn roots(&self) -> &[NodeId] {
        &self.roots
    }

    /// Export a selection rooted at `root` under `name`; `full_atoms` is the
    /// selection's maximal atom set.
    pub fn add_selection(
        &mut self,
        name: impl Into<String>,
        root: NodeId,
        full_atoms: IndexGroup,
    ) -> usize {
        let name = name.into();
        let index = self.selections.len();
        self.by_name.insert(name.clone(), index);
        self.selections.push(Selection::new(name, root, full_atoms));
        index
    }

    pub fn selections(&self) -> &[Selection] {
        &self.selections
    }

    pub fn selections_mut(&mut self) -> &mut [Selection] {
        &mut self.selections
    }

    pub fn selection(&self, name: &str) -> Option<&Selection> {
        self.by_name.get(name).map(|&i| &self.selections[i])
    }

    /// Evaluate every selection tree for one frame.
    ///
    /// Clears per-frame node state, runs each root in list order, then
    /// refreshes the exported selections' masses, charges, and
    /// covered-fraction counters.
    pub fn evaluate(&mut self, fr: &Frame, pbc: Option<&Pbc>) -> Result<()> {
        debug!(
            step = fr.step,
            time = fr.time,
            roots = self.roots.len(),
            "evaluating frame"
        );
        for i in 0..self.roots.len() {
            init_frame_eval(&mut self.nodes, Some(self.roots[i]));
        }
        for i in 0..self.roots.len() {
            let root = self.roots[i];
            if let Some(child) = self.nodes[root].child {
                if let NodeKind::SubExpr { cgrp } = &mut self.nodes[child].kind {
                    cgrp.clear();
                    if self.nodes[child].value.kind() == ValueKind::Group {
                        self.nodes[child].value.group_mut()?.clear();
                    }
                }
            }
            if self.nodes[root].eval.is_some() {
                let mut state = EvalState {
                    nodes: &mut self.nodes,
                    pool: &mut self.pool,
                    gall: &self.gall,
                    top: self.top.as_ref(),
                    fr,
                    pbc,
                };
                state.evaluate(root, None)?;
            }
        }
        let nodes = &self.nodes;
        let top = self.top.as_ref();
        for sel in &mut self.selections {
            sel.refresh_atoms(nodes);
            sel.refresh_masses_and_charges(top);
            sel.update_covered_fraction_for_frame();
        }
        Ok(())
    }

    /// Close out a run of `nframes` frames: restore each selection's
    /// original atom set and compute time-averaged covered fractions.
    pub fn evaluate_final(&mut self, nframes: usize) {
        let top = self.top.as_ref();
        for sel in &mut self.selections {
            sel.restore_original_positions(top);
            sel.compute_average_covered_fraction(nframes);
        }
    }
}
