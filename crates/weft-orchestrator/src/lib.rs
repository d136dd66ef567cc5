pub mod context;
pub mod dispatcher;
pub mod worker;

pub use dispatcher::SkillDispatcher;
pub use worker::Orchestrator;
