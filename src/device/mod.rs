pub mod codec;
pub mod event;
pub mod parse;
pub mod stats;
