pub mod config;
pub mod embeddings;
pub mod escalation;
pub mod followup;
pub mod llm;
pub mod model;
pub mod orchestrator;
pub mod prompts;
pub mod retrieval;
pub mod server;
pub mod stage;
pub mod store;
pub mod style;
