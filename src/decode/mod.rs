//! Decoder: reproduce captured channels from a locator

pub mod resolver;
pub mod traversal;

pub use resolver::{RecordResolver, ResolverConfig, ResolverStats};
pub use traversal::{ChannelGap, DecodeItem, DecodedChunk, Decoder};
