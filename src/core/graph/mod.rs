//! Neighbour searches and clustering on dense embeddings.

pub mod clustering;
pub mod knn;
