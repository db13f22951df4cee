pub mod bundle;
pub mod cleanup;
pub mod config;
pub mod dependency_graph;
pub mod deploy;
pub mod dirs;
pub mod engine;
pub mod error;
pub mod graph_builder;
pub mod job;
pub mod orchestrator;
pub mod post_process;
pub mod protocol;
pub mod require_discovery;
pub mod resolver;
pub mod stubber;
pub mod types;
pub mod validator;
pub mod worker;
