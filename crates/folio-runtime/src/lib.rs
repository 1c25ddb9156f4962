pub mod mock;
pub mod openai;
pub mod sse;

pub use mock::{ScriptStep, ScriptedRuntime};
pub use openai::{OpenAiConfig, OpenAiRuntime};
