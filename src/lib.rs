//! # ANN From Scratch
//!
//! Approximate nearest-neighbor search over fixed-dimensionality points.
//!
//! This library provides:
//! - Exhaustive, randomized KD-forest, single KD-tree, hierarchical k-means
//!   tree, hierarchical clustering forest, multi-probe LSH and composite
//!   backends behind one contract
//! - An autotuner that picks a backend and its parameters for a target
//!   precision
//! - Incremental insertion and removal with stable point IDs
//! - Binary index persistence checked against the indexed dataset
//! - A handle-based [`Engine`] exposing the full operation set
//!
//! ## Example
//!
//! ```rust
//! use ann_from_scratch::{Index, Parameters};
//!
//! let points: Vec<f32> = (0..300).map(|i| (i % 97) as f32).collect();
//! let index = Index::from_rows(&points, 100, 3, &Parameters::kdtree(4)).unwrap();
//!
//! let neighbors = index.search(&[1.0, 2.0, 3.0], 5).unwrap();
//! assert_eq!(neighbors.len(), 5);
//! ```

pub mod ann_index;
pub mod autotune;
pub mod backend;
pub mod clustering;
pub mod composite;
pub mod dataset;
pub mod distance;
pub mod element;
pub mod engine;
pub mod error;
pub mod hierarchical;
pub mod index;
pub mod kdtree;
pub mod kmeans;
pub mod linear;
pub mod lsh;
mod parallel;
pub mod params;
pub mod persistence;
pub mod result_set;

pub use ann_index::{find_nearest_neighbors, Index, Neighbors};
pub use autotune::AutotuneReport;
pub use clustering::compute_cluster_centers;
pub use dataset::Dataset;
pub use distance::DistanceMetric;
pub use element::{DistanceValue, Element};
pub use engine::{status, Engine, IndexHandle};
pub use error::{AnnError, Result};
pub use params::{Algorithm, CentersInit, Checks, Parameters, SearchParams};
pub use result_set::Neighbor;
