pub mod dicom;
pub mod helpers;
pub mod logging;

pub use helpers::*;
pub use logging::{init_tracing, progress_bar};
