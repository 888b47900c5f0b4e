mod command;
mod error;
mod handlers;
mod http_server;
pub mod listeners;
mod request_ext;
mod response_body;
mod route;
mod router;
mod server_context;
mod upload_form;

pub use command::{Command, Options};
pub use error::Error;
pub use http_server::serve_request;
pub use server_context::ServerContext;
