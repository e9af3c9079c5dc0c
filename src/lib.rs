//! Core of a multi-camera live-stream viewer.

pub mod archive;
pub mod backend;
pub mod credentials;
pub mod gesture;
pub mod layout;
pub mod network;
pub mod prefs;
pub mod session;
pub mod store;
pub mod viewer;
