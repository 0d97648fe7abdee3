//! # imrpc CLI
//!
//! Command-line front end for imrpc.
//!
//! - `imrpc serve`: run a server exposing the demo `Echo` service
//! - `imrpc call`: call a method on one or more servers and print the JSON
//!   result, one line per answer

pub mod call;
pub mod demo;
