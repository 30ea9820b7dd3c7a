//! The gateway's in-process tool implementations.
//!
//! `exec` runs one command to completion under a byte/time budget;
//! `artifacts` externalizes oversized results. The gateway's Tool
//! Dispatcher (C9) exposes `exec` over MCP via the `tool-host` binary in
//! this crate, spawned as a stdio child process.

pub mod artifacts;
pub mod exec;
