//! A classical interatomic-potential evaluation engine: neighbor lists over a periodic
//! supercell, bond-order-factor caches, a nested 1/2/3/4-body interaction loop, an optional
//! Ewald long-range add-on, and a rank-partitioned parallel reducer.
//!
//! [`state::CoreState`] is the entry point: register atoms and a cell, register potentials and
//! bond-order factors, build neighbor lists, then call one of the `calculate_*` methods.

pub mod atom;
pub mod cache;
pub mod cell;
pub mod config;
pub mod debug;
pub mod error;
pub mod ewald;
pub mod forms;
pub mod interaction;
pub mod neighbor;
pub mod reduce;
pub mod registry;
pub mod state;
pub mod subcell;

pub use atom::{Atom, AtomId, AtomStore};
pub use cell::Supercell;
pub use error::{CoreError, CoreResult};
pub use state::CoreState;
