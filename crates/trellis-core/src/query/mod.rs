pub mod dead_code;
pub mod graph;
pub mod guards;
