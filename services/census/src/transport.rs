//! Framework-free HTTP surface. Routing and encoding live here so every route
//! can be exercised without a socket; `transport_axum` only moves bytes.

mod http;
mod middleware;
mod routes;

use std::sync::Arc;

use crate::CensusService;

pub use http::{HttpRequest, HttpResponse};
pub use routes::handle_request;

pub(crate) const MAX_HTTP_BODY_BYTES: usize = 16 * 1024 * 1024;

pub type SharedService = Arc<CensusService>;
