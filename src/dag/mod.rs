// Per-window execution graphs

pub mod builder;
pub mod graph;

pub use builder::build_graph;
pub use graph::*;
