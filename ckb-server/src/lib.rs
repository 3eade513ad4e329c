pub mod admin;
pub mod webhooks;
pub mod wire;
