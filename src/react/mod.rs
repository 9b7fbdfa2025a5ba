//! 推理层：主循环状态机、beam search、集成协调、提示词与过程事件

pub mod beam;
pub mod ensemble;
pub mod events;
pub mod loop_;
pub mod prompts;

pub use beam::{parse_verdict, select_winner, BeamOutcome, BeamSearchCoordinator, BeamSettings, Candidate};
pub use ensemble::{format_agent_results, AgentFailure, AgentRunner, EnsembleCoordinator, EnsembleResult};
pub use events::ReactEvent;
pub use loop_::{is_termination, LoopOutcome, LoopSettings, LoopState, ReasoningLoop, TaskInput, TERMINATION_PHRASES};
