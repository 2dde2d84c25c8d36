//! Minimal read-only topology used during selection evaluation.
//!
//! The full parsers live elsewhere in the toolkit; the evaluator only needs
//! per-atom names, masses, and charges.

/// Per-atom static properties of the system.
#[derive(Debug, Clone, Default)]
pub struct Topology {
    pub atom_names: Vec<String>,
    pub masses: Vec<f64>,
    pub charges: Vec<f64>,
}

impl Topology {
    pub fn new(atom_names: Vec<String>, masses: Vec<f64>, charges: Vec<f64>) -> Self {
        debug_assert_eq!(atom_names.len(), masses.len());
        debug_assert_eq!(atom_names.len(), charges.len());
        Self {
            atom_names,
            masses,
            charges,
        }
    }

    pub fn n_atoms(&self) -> usize {
        self.atom_names.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_n_atoms() {
        let top = Topology::new(
            vec!["N".to_string(), "CA".to_string()],
            vec![14.0, 12.0],
            vec![-0.3, 0.1],
        );
        assert_eq!(top.n_atoms(), 2);
    }
}
