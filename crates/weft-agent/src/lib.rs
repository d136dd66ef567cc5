pub mod assistant;
pub mod context;
pub mod gateway;
pub mod mock;
pub mod openai;
pub mod tool_agent;

pub use assistant::AssistantAgent;
pub use context::TaskContext;
pub use gateway::{
    GatewayError, ModelGateway, ModelMessage, ModelRequest, ModelTurn, ToolDefinition, TurnEvent,
    TurnStream,
};
pub use tool_agent::ToolAgent;
