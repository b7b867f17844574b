//! HTTP surface: the admission chain, its tower middleware and the server.

mod chain;
mod middleware;
pub mod response;
mod server;
mod status;

pub use chain::{AdmissionChain, Quota, Rejection, Verdict};
pub use middleware::{AdmissionLayer, AdmissionService};
pub use server::{router, HttpServer};
