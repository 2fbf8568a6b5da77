pub mod callgraph;
pub mod cancel;
pub mod coordinator;
pub mod filesystem;
pub mod pipeline;
pub mod report;
pub mod symbols;
