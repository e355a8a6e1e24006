//! Minimal HTTP/1.1 front end for the contact endpoint

mod cors;
mod handler;
mod request;
mod response;
mod server;

pub use cors::CorsPolicy;
pub use handler::{HttpApp, EMAIL_PATH};
pub use request::{HttpRequest, RequestError, RequestParser, MAX_BODY_BYTES};
pub use response::HttpResponse;
pub use server::run_http_server;
