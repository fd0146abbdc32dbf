//! Registry Provisioner: deploys and wires identity, claim and compliance
//! registry suites through an external signer, recording every confirmed
//! action in an append-only ledger.

pub mod api;
pub mod bootstrap;
pub mod cli;
pub mod config;
pub mod error;
pub mod provision;
pub mod runtime;
pub mod settings;
