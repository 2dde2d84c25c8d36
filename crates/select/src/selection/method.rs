//! Method plugin and position-calculation interfaces.
//!
//! Selection methods are the pluggable leaves of a selection tree: given the
//! current frame and an atom group (or precomputed reference positions) they
//! write a value into the owning node. The evaluator only ever talks to them
//! through [`SelMethod`]; what a method computes is its own business.

use crate::selection::error::{Result, SelectionError};
use crate::selection::group::IndexGroup;
use crate::selection::value::{PosSet, SelValue};
use crate::topology::Topology;
use crate::trajectory::{Frame, Pbc};

/// Per-frame inputs handed to method callbacks.
pub struct MethodContext<'a> {
    pub top: Option<&'a Topology>,
    pub fr: &'a Frame,
    pub pbc: Option<&'a Pbc>,
}

/// A selection method callback table.
///
/// A method implements at least one of [`update`] (atom-group form) or
/// [`pos_update`] (position form). The chosen callback writes into `out`
/// without growing its storage; the caller has already sized it. Methods that
/// need per-frame setup report it via [`has_init_frame`] and receive exactly
/// one [`init_frame`] call per frame, before the first update.
///
/// [`update`]: SelMethod::update
/// [`pos_update`]: SelMethod::pos_update
/// [`has_init_frame`]: SelMethod::has_init_frame
/// [`init_frame`]: SelMethod::init_frame
pub trait SelMethod {
    fn name(&self) -> &str;

    /// Whether this method wants a first-touch callback each frame.
    fn has_init_frame(&self) -> bool {
        false
    }

    /// Called once per frame before the first update.
    fn init_frame(&mut self, _ctx: &MethodContext<'_>) -> Result<()> {
        Ok(())
    }

    /// Evaluate over an atom group.
    fn update(
        &mut self,
        _ctx: &MethodContext<'_>,
        _g: &IndexGroup,
        _out: &mut SelValue,
    ) -> Result<()> {
        Err(SelectionError::internal(format!(
            "method '{}' has no atom-group update callback",
            self.name()
        )))
    }

    /// Evaluate over reference positions.
    fn pos_update(
        &mut self,
        _ctx: &MethodContext<'_>,
        _pos: &PosSet,
        _out: &mut SelValue,
    ) -> Result<()> {
        Err(SelectionError::internal(format!(
            "method '{}' has no position update callback",
            self.name()
        )))
    }
}

/// Computes reference positions for an atom group.
///
/// The engine that decides *how* positions are derived (atom, center of mass,
/// residue center, ...) lives outside the evaluator; this is the seam it is
/// called through.
pub trait PosCalc {
    fn update(
        &mut self,
        out: &mut PosSet,
        g: &IndexGroup,
        fr: &Frame,
        pbc: Option<&Pbc>,
    ) -> Result<()>;
}

/// Position calculator that uses atom coordinates directly.
#[derive(Debug, Default)]
pub struct AtomPosCalc;

impl PosCalc for AtomPosCalc {
    fn update(
        &mut self,
        out: &mut PosSet,
        g: &IndexGroup,
        fr: &Frame,
        _pbc: Option<&Pbc>,
    ) -> Result<()> {
        out.coords.clear();
        for atom in g.iter() {
            let coord = fr.positions.get(atom).ok_or_else(|| {
                SelectionError::internal(format!(
                    "atom {} not present in frame of {} atoms",
                    atom,
                    fr.positions.len()
                ))
            })?;
            out.coords.push(*coord);
        }
        out.group.copy_from(g);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_atom_poscalc_copies_group_coordinates() {
        let fr = Frame::new(
            0,
            0.0,
            vec![[0.0, 0.0, 0.0], [1.0, 0.0, 0.0], [2.0, 0.0, 0.0]],
        );
        let g = IndexGroup::from_indices(vec![0, 2]);
        let mut pos = PosSet::default();
        AtomPosCalc.update(&mut pos, &g, &fr, None).unwrap();
        assert_eq!(pos.coords, vec![[0.0, 0.0, 0.0], [2.0, 0.0, 0.0]]);
        assert_eq!(pos.group.indices(), &[0, 2]);
    }

    #[test]
    fn test_atom_poscalc_out_of_range() {
        let fr = Frame::new(0, 0.0, vec![[0.0; 3]]);
        let g = IndexGroup::from_indices(vec![5]);
        let mut pos = PosSet::default();
        assert!(AtomPosCalc.update(&mut pos, &g, &fr, None).is_err());
    }
}
