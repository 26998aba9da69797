pub mod checkpoint;
pub mod collaborator;
pub mod config;
pub mod context;
pub mod errors;
pub mod events;
pub mod feature;
pub mod impact;
pub mod logs;
pub mod orchestrator;
pub mod store;
