//! svcwrap - run any program as a supervised system service
//!
//! The binary has two faces:
//! - Admin: installs, removes and controls services. Each service entry in
//!   the OS service database points back at this binary with
//!   `--run-as-service <id>`, the real launch configuration lives in the store.
//! - Host: re-entered by the OS, reads the configuration, starts the program
//!   and keeps it running according to its exit policy.
//!
//! # Architecture
//!
//! ```text
//! ┌──────────────────────────────────────────────────────┐
//! │  admin CLI ──▶ Installer              OS ──▶ Host     │
//! ├──────────────────────────────────────────────────────┤
//! │  SCM Client │ Config Store │ Supervisor │ Terminate   │
//! ├──────────────────────────────────────────────────────┤
//! │  systemd units + D-Bus      │  Windows SCM + registry │
//! └──────────────────────────────────────────────────────┘
//! ```

pub mod config;
pub mod error;
pub mod host;
pub mod ini;
pub mod installer;
pub mod logging;
pub mod scm;
pub mod settings;
pub mod store;
pub mod supervisor;
pub mod terminate;

pub use config::{ExitAction, ExitPolicy, LaunchParameters, ServiceConfiguration};
pub use error::{OperationReport, ServiceError};
pub use installer::{ServiceInfo, ServiceInstaller};
pub use supervisor::Supervisor;
