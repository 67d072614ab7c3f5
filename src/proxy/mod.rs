//! The governed proxy surface: admission middleware, request inspection
//! and the handlers that hand admitted requests to a bridge or a route.

pub mod emitter;
pub mod handlers;
pub mod inspect;
pub mod jsonpath;
pub mod middleware;
pub mod multipart;
pub mod scope;

pub use handlers::{proxy_handler, route_handler};
pub use middleware::governance;
