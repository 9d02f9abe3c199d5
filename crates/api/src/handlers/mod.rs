pub mod generation;
pub mod streams;
