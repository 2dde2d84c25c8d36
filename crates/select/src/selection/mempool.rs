//! Evaluation memory pool and the scoped guards built on it.
//!
//! Scratch buffers used while evaluating a frame come from a pool owned by
//! the collection so they are recycled across frames instead of reallocated.
//! Every reservation is bounded by a guard that must release on each exit
//! path, success or failure; the pool keeps an active-reservation count so
//! leaks are observable.

use crate::selection::error::{Result, SelectionError};
use crate::selection::group::IndexGroup;
use crate::selection::node::{NodeArena, NodeId};
use crate::selection::value::{ValueData, ValueKind};

/// Frame-lifetime arena of reusable value buffers.
#[derive(Debug, Default)]
pub struct MemPool {
    groups: Vec<Vec<usize>>,
    ints: Vec<Vec<i64>>,
    reals: Vec<Vec<f64>>,
    strs: Vec<Vec<String>>,
    active: usize,
}

impl MemPool {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of currently outstanding reservations.
    pub fn active_reservations(&self) -> usize {
        self.active
    }

    /// Hand out an empty index group with capacity for `count` atoms.
    pub fn alloc_group(&mut self, count: usize) -> IndexGroup {
        self.active += 1;
        let mut buf = self.groups.pop().unwrap_or_default();
        buf.clear();
        buf.reserve(count);
        IndexGroup::from_buffer(buf)
    }

    /// Return an index group's buffer to the pool.
    pub fn free_group(&mut self, g: IndexGroup) {
        assert!(self.active > 0, "pool release without a reservation");
        self.active -= 1;
        self.groups.push(g.into_buffer());
    }

    /// Hand out value storage sized for `count` elements of the given kind.
    pub fn alloc_value(&mut self, kind: ValueKind, count: usize) -> Result<ValueData> {
        let data = match kind {
            ValueKind::Int => {
                let mut v = self.ints.pop().unwrap_or_default();
                v.clear();
                v.resize(count, 0);
                ValueData::Int(v)
            }
            ValueKind::Real => {
                let mut v = self.reals.pop().unwrap_or_default();
                v.clear();
                v.resize(count, 0.0);
                ValueData::Real(v)
            }
            ValueKind::Str => {
                let mut v = self.strs.pop().unwrap_or_default();
                v.clear();
                v.resize(count, String::new());
                ValueData::Str(v)
            }
            ValueKind::Group => {
                let mut buf = self.groups.pop().unwrap_or_default();
                buf.clear();
                buf.reserve(count);
                ValueData::Group(IndexGroup::from_buffer(buf))
            }
            ValueKind::None | ValueKind::Pos => {
                return Err(SelectionError::internal(format!(
                    "cannot reserve pool storage for a {} value",
                    kind.name()
                )));
            }
        };
        self.active += 1;
        Ok(data)
    }

    /// Return value storage to the pool.
    pub fn free_value(&mut self, data: ValueData) {
        assert!(self.active > 0, "pool release without a reservation");
        self.active -= 1;
        match data {
            ValueData::Int(v) => self.ints.push(v),
            ValueData::Real(v) => self.reals.push(v),
            ValueData::Str(v) => self.strs.push(v),
            ValueData::Group(g) => self.groups.push(g.into_buffer()),
            ValueData::None | ValueData::Pos(_) => {
                unreachable!("pool never hands out this storage kind")
            }
        }
    }
}

/// Reserve value storage for a node, returning it on release.
///
/// For a pool-backed node the storage comes from the pool and goes back on
/// release; for other nodes the node's own buffer is grown and release is a
/// no-op. Double release is a programmer error.
fn node_reserve(nodes: &mut NodeArena, pool: &mut MemPool, id: NodeId, count: usize) -> Result<()> {
    let node = &mut nodes[id];
    if node.mempool {
        if node.reserved {
            return Err(SelectionError::internal(format!(
                "node {} already holds a pool reservation",
                id
            )));
        }
        let data = pool.alloc_value(node.value.kind(), count)?;
        node.value.replace_data(data);
        node.reserved = true;
    } else {
        node.value.reserve_for(count);
    }
    Ok(())
}

fn node_release(nodes: &mut NodeArena, pool: &mut MemPool, id: NodeId) {
    let node = &mut nodes[id];
    if node.mempool {
        assert!(node.reserved, "pool release without a reservation");
        let data = node.value.take_data();
        pool.free_value(data);
        node.reserved = false;
        node.value.nr = 0;
    }
}

/// Scoped reservation of value storage on a single node.
///
/// At most one reservation per instance; the holder calls [`release`] on
/// every exit path. Dropping an instance that still holds a reservation is a
/// leak and trips a debug assertion.
///
/// [`release`]: NodeReserver::release
#[derive(Debug, Default)]
#[must_use]
pub struct NodeReserver {
    node: Option<NodeId>,
}

impl NodeReserver {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn reserve(
        &mut self,
        nodes: &mut NodeArena,
        pool: &mut MemPool,
        id: NodeId,
        count: usize,
    ) -> Result<()> {
        if self.node.is_some() {
            return Err(SelectionError::internal(
                "node reserver already holds a reservation",
            ));
        }
        node_reserve(nodes, pool, id, count)?;
        self.node = Some(id);
        Ok(())
    }

    pub fn release(mut self, nodes: &mut NodeArena, pool: &mut MemPool) {
        if let Some(id) = self.node.take() {
            node_release(nodes, pool, id);
        }
    }
}

impl Drop for NodeReserver {
    fn drop(&mut self) {
        debug_assert!(
            self.node.is_none() || std::thread::panicking(),
            "node reservation leaked"
        );
    }
}

/// Scoped reservation of an index group from the pool.
#[derive(Debug, Default)]
#[must_use]
pub struct GroupReserver {
    group: Option<IndexGroup>,
}

impl GroupReserver {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn reserve(&mut self, pool: &mut MemPool, count: usize) -> Result<&mut IndexGroup> {
        if self.group.is_some() {
            return Err(SelectionError::internal(
                "group reserver already holds a reservation",
            ));
        }
        self.group = Some(pool.alloc_group(count));
        match &mut self.group {
            Some(g) => Ok(g),
            None => unreachable!(),
        }
    }

    pub fn release(mut self, pool: &mut MemPool) {
        if let Some(g) = self.group.take() {
            pool.free_group(g);
        }
    }
}

impl Drop for GroupReserver {
    fn drop(&mut self) {
        debug_assert!(
            self.group.is_none() || std::thread::panicking(),
            "group reservation leaked"
        );
    }
}

/// Scoped redirection of a node's value storage at another node's storage.
///
/// While the assignment is live, the source node's buffer is held by the
/// redirected node, so everything the redirected node writes lands in the
/// buffer the source ends up owning again after [`restore`]. The two nodes
/// must have the same value kind.
///
/// [`restore`]: TempValueAssigner::restore
#[derive(Debug, Default)]
#[must_use]
pub struct TempValueAssigner {
    saved: Option<Saved>,
}

#[derive(Debug)]
struct Saved {
    node: NodeId,
    source: NodeId,
    old_data: ValueData,
}

impl TempValueAssigner {
    pub fn new() -> Self {
        Self::default()
    }

    /// Point `node`'s value storage at `source`'s storage.
    pub fn assign(&mut self, nodes: &mut NodeArena, node: NodeId, source: NodeId) -> Result<()> {
        if self.saved.is_some() {
            return Err(SelectionError::internal(
                "value assigner already holds an assignment",
            ));
        }
        let (n, s) = nodes.get_two_mut(node, source);
        if n.value.kind() != s.value.kind() {
            return Err(SelectionError::internal(format!(
                "mismatching value kinds in temporary assignment: {} vs {}",
                n.value.kind().name(),
                s.value.kind().name()
            )));
        }
        let moved = s.value.take_data();
        let old_data = n.value.replace_data(moved);
        self.saved = Some(Saved {
            node,
            source,
            old_data,
        });
        Ok(())
    }

    /// Undo the assignment: the redirected node gets its own storage back and
    /// the source receives the buffer with whatever was written to it.
    pub fn restore(mut self, nodes: &mut NodeArena) {
        if let Some(saved) = self.saved.take() {
            let (n, s) = nodes.get_two_mut(saved.node, saved.source);
            let written = n.value.replace_data(saved.old_data);
            s.value.replace_data(written);
        }
    }
}

impl Drop for TempValueAssigner {
    fn drop(&mut self) {
        debug_assert!(
            self.saved.is_none() || std::thread::panicking(),
            "temporary value assignment leaked"
        );
    }
}
