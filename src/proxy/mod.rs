pub mod client;
pub mod compression;
pub mod context;
mod handler;
pub mod sse;
pub mod websocket;

pub use context::BoxBody;
pub use handler::handle_request;
