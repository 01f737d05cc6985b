//! These models represent the objects passed around by the execution core.
//!
//! Several related formats meet here: the transcript shape chains and agents
//! accumulate, the wire shape inference backends speak, and the generation
//! shape the cache stores. They overlap to varying degrees, so the internal
//! structs are not an exact match to any one of them; backends convert at
//! the boundary with to/from helpers.
pub mod content;
pub mod generation;
pub mod message;
pub mod role;
pub mod tool;
