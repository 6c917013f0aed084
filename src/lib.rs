pub mod analysis;
pub mod checker;
pub mod config;
pub mod control;
pub mod error;
pub mod logging;
pub mod model;
pub mod notify;
pub mod paths;
pub mod permissions;
pub mod popup;
pub mod scheduler;
pub mod screenshot;
pub mod service;
pub mod session;
pub mod settings;
pub mod tab;

#[cfg(test)]
pub(crate) mod fakes;
