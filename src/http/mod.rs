//! HTTP surface: the admission middleware, its responses, and the server.

mod middleware;
mod response;
mod server;

pub use middleware::{admission_middleware, Admission, Outcome, Verdict};
pub use response::{
    apply_fail_open_header, apply_rate_limit_headers, apply_security_headers, rejection,
    RejectionBody, FAIL_OPEN_MESSAGE,
};
pub use server::{apply_admission, router, HttpServer};
