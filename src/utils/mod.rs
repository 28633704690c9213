//! Process-level helpers shared by the relay binary and embedders.

pub mod bootstrap;
