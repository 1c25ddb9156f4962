pub mod document;
pub mod edits;
pub mod errors;
pub mod events;
pub mod ids;
pub mod runtime;
pub mod tools;
