#![deny(clippy::all)]

pub mod acquisition;
pub mod config;
pub mod convert;
pub mod descriptor;
pub mod matcher;
pub mod utils;
pub mod volume;

pub use config::{DatasetConfig, DatasetLayout};
