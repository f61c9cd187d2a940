//! Concrete capture sources

pub mod command;
pub mod reader;
pub mod sample;

pub use command::CommandProducer;
pub use reader::{ReaderProducer, DEFAULT_CHUNK_SIZE};
pub use sample::SampleProducer;
