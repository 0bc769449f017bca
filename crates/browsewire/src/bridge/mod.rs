//! Wire layer for talking to the automation server.
//!
//! # Architecture
//!
//! - **protocol**: JSON-RPC envelopes (Request, Response, Notification)
//! - **codec**: newline-delimited JSON framing for AsyncRead/AsyncWrite

pub mod codec;
pub mod protocol;
