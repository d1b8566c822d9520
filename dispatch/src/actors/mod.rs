pub mod agent_listener;

pub use agent_listener::{
    spawn_agent_listener, AgentListenerActor, AgentListenerArguments, AgentListenerError,
    AgentListenerMsg, ListenerStatus, ResultWaiter,
};
