pub mod multiplexer;
pub mod sequencer;
