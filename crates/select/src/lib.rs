//! Selection engine for rust-simulation-tools.
//!
//! Evaluates compiled atom-selection trees against trajectory frames,
//! producing typed values: integer, real, and string vectors, position
//! sets, and index groups. Shared subexpressions are memoized per frame,
//! boolean operators short-circuit over sorted index groups, and scratch
//! storage is recycled through a frame-lifetime memory pool.

pub mod selection;
pub mod topology;
pub mod trajectory;
