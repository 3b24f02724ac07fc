//! HTTP surface: one-shot request parsing, response composition with the
//! common header block, and the keepalive worker threads.

pub mod request;
pub mod response;
pub mod worker;
