//! Building blocks of the `sidecargo-operator` binary: command line options,
//! logging setup, the `SidecarGo` watch loop and the Pod mutating webhook.
pub mod cli;
pub mod controller;
pub mod logging;
pub mod webhook;

/// The name used for log files.
pub const APP_NAME: &str = "sidecargo-operator";
