//! Credit ledger services and daemon
//!
//! This crate wires the ledger into runnable form:
//! - Vote, clap and rate use-cases with their precondition chains
//! - Reference adapters for the directory, eligibility and notification ports
//! - Configuration loading and service-graph assembly
//! - The reconciliation scheduler driven by `creditd`

#![deny(unsafe_code)]
#![cfg_attr(feature = "strict-docs", warn(missing_docs))]
#![cfg_attr(not(feature = "strict-docs"), allow(missing_docs))]
#![warn(rust_2018_idioms)]

pub mod adapters;
pub mod config;
pub mod error;
pub mod scheduler;
pub mod services;
pub mod usecases;

pub use config::CreditConfig;
pub use error::{DaemonError, DaemonResult};
pub use scheduler::Scheduler;
pub use services::{Collaborators, CreditServices};
pub use usecases::{AllocationRequest, BulkRatingItem, ClapUseCase, RateUseCase, VoteUseCase};
