pub mod app;
pub mod prompting;
pub mod relay;
pub mod session;
pub mod store;
pub mod types;
