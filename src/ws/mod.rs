pub mod connection;
pub mod dispatcher;
pub mod frame;
pub mod hub;

pub use dispatcher::Dispatcher;
pub use frame::Frame;
pub use hub::{ConnectionHub, HubError};
