//! netsys-http: HTTP/1.1 on top of the netsys messaging core.
//!
//! The server assembles requests from raw TCP chunks ([`buffer`]), routes
//! them through a `:param` pattern table ([`router`]), and serialises
//! responses back onto the session; the client runs one connection per
//! request with Content-Length assembly and a total-request timeout.

pub mod buffer;
pub mod client;
pub mod cookie;
pub mod error;
pub mod facade;
pub mod multipart;
pub mod parser;
pub mod router;
pub mod server;
pub mod types;

pub use client::{HttpClient, HttpUrl};
pub use error::{HttpError, HttpErrorCode};
pub use facade::{ClientConfig, HttpFacade, ServerConfig};
pub use router::{HttpHandler, HttpRequestContext};
pub use server::HttpServer;
pub use types::{HttpMethod, HttpRequest, HttpResponse, HttpVersion};
