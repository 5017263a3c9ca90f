pub mod auth;
pub mod handlers;
pub mod rest;
pub mod types;

pub use handlers::{configure, GatewayState};
pub use rest::RestApi;
