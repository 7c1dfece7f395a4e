//! HTTP request parsing, response assembly, and method handlers.

pub mod autoindex;
pub mod handlers;
pub mod request;
pub mod response;

pub use handlers::{dispatch, RequestContext};
pub use request::{parse_request, HttpError, Method, Request};
pub use response::Response;
