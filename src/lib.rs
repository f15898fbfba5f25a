// projeto: npredict
// file: src/lib.rs
// Neural-network time-series prediction engine

pub mod neural;

pub use neural::*;
