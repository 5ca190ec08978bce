//! Single cell methods. Builds on the dense layers, neighbour searches and
//! data containers in `core`.

pub mod alignment;
