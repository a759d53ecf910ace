//! Admission control and task orchestration in front of a metered AI
//! image-processing provider.
//!
//! Requests are priced against a [`ledger::CreditLedger`], queued by tier,
//! and executed by workers that run a declarative pipeline: submit a remote
//! task, poll it to completion, refine the result locally and store it.
//! Every outbound call shares one [`rate_gate::RateGate`] and goes through
//! a [`retry::RetryingInvoker`].

pub mod cli;
pub mod collaborators;
pub mod config;
pub mod credits;
pub mod engine;
pub mod error;
pub mod job;
pub mod ledger;
pub mod pipeline;
pub mod poller;
pub mod provider;
pub mod queue;
pub mod rate_gate;
pub mod retry;
pub mod ui;

pub use config::EngineConfig;
pub use credits::Credits;
pub use engine::{Collaborators, Engine, JobRequest};
pub use error::{EngineError, ErrorKind, RetryGuidance};
pub use job::{AuditRecord, Job, JobKind, JobStatus, Tier};
