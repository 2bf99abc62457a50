//! Per-stage environment bootstrap on worker hosts.
//!
//! Each stage of a packaged topology starts through a generated bash script
//! (see [`script`]) that provisions one shared environment per topology
//! instance and then hands the process over to the stage runner.
//! [`provision`] and [`handoff`] implement the same protocol natively for
//! `squall bootstrap`.

pub mod handoff;
pub mod instance;
pub mod provision;
pub mod script;

pub use handoff::{exec_stage, stage_command};
pub use instance::InstanceLayout;
pub use provision::{CommandInstaller, EnvironmentInstaller, ProvisionOutcome, Provisioner};
pub use script::{render, setup_script_name, ScriptParams, SETUP_INTERPRETER};
