pub mod api;
pub mod config;
pub mod error;
pub mod evaluation;
pub mod geo;
pub mod maintenance;
pub mod mesh;
pub mod node;
pub mod scheduler;
pub mod shutdown;
pub mod status;
pub mod worker;
