pub mod client;
pub mod dispatcher;
pub mod models;
pub mod models_handler;
pub mod retry;
