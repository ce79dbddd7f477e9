mod balloon;
mod cfg;
mod dataflow;
