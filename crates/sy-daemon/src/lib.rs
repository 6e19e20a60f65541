//! The control-plane daemon: event routing, role consumers, and wiring.

pub mod admin;
pub mod app;
pub mod consumers;
pub mod dispatcher;
pub mod runner;

pub use app::{AppConfig, AppContainer};
pub use consumers::RoleConsumer;
pub use dispatcher::Dispatcher;
pub use runner::CommandRunner;
