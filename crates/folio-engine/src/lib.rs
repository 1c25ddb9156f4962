pub mod capabilities;
pub mod continuation;
pub mod describe;
pub mod error;
pub mod ledger;
pub mod multiplexer;
pub mod prompts;
pub mod registry;
pub mod session_store;
pub mod tools;
pub mod turn;

pub use continuation::{ContinuationConfig, ContinuationResolver};
pub use error::{EngineError, ToolError};
pub use multiplexer::{StreamConfig, TurnStream};
pub use session_store::{Lease, SessionSnapshot, SessionStore, SessionStoreConfig};
pub use turn::{ActiveTurnInfo, TurnConfig, TurnOrchestrator, TurnPhase, TurnRequest};
