pub mod trace;
pub mod crossover;
pub mod baseline;
pub mod dataset;
pub mod peak_shape;
pub mod peak_fit;
pub mod pipeline;
pub mod reader;
