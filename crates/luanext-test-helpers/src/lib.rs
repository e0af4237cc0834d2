//! Shared fixtures for LuaNext dev server tests

pub mod channel;
pub mod fixtures;
pub mod runtime;

pub use channel::RecordingChannel;
pub use fixtures::ProjectFixture;
pub use runtime::RuntimeHarness;
