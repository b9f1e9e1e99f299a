//! Viewgate - per-session workspace viewers behind one HTTP entry point
//!
//! This library provides a reverse proxy that:
//! - Launches one viewer process per (session, workspace) on demand, or reuses it
//! - Routes view requests of a session to its viewer by cookie and workspace path
//! - Forwards HTTP requests and tunnels the viewer's Broadway WebSocket
//! - Shuts a viewer down as soon as its tunnel closes from either side
//! - Runs viewers as local processes or Docker containers
//! - Lists workspaces on disk and the jobs of an OCR-D controller

pub mod config;
pub mod docker;
pub mod error;
pub mod forward;
pub mod jobs;
pub mod launcher;
pub mod pages;
pub mod proxy;
pub mod registry;
pub mod routes;
pub mod tunnel;
pub mod workspace;

pub const PKG_NAME: &str = env!("CARGO_PKG_NAME");
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
