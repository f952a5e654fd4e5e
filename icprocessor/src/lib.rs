mod args;
mod driver;
mod export;
mod progress;

pub use args::*;
pub use driver::{ICProcessor, ICProcessorError};
