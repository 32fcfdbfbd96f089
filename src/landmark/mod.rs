//! Landmarks and the landmark store.

pub mod landmark;
pub mod manager;

pub use landmark::{Landmark, LandmarkFlag, LandmarkObservation};
pub use manager::{LandmarkManager, LandmarkStore, triangulate_two_view};
