//! peerdrop Client Library
//!
//! The peer server that shares a directory, the concurrent downloader, and the
//! HTTP client for the discovery registry.

pub mod config;
pub mod discovery;
pub mod downloader;
pub mod server;
