pub mod admission;
pub mod artifact;
pub mod broadcast;
pub mod config;
pub mod executors;
pub mod job;
pub mod journal;
pub mod orchestrator;
pub mod pipeline;
pub mod registry;
pub mod stage;
pub mod types;

#[cfg(test)]
mod tests;
