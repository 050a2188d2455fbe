// SPDX-License-Identifier: Apache-2.0
// Copyright Open Network Fabric Authors

//! Network policy (ACL) and security group resolution for flows.

#![deny(clippy::all, clippy::pedantic)]
#![allow(clippy::module_name_repetitions)]

mod acl;
mod classify;
mod sg;

pub use acl::{AclOutcome, evaluate_acl, rule_matches};
pub use classify::{ClassifyInput, Classifier, PolicyVerdict};
pub use sg::{SgOutcome, evaluate_sg};

use tracectl::trace_target;
trace_target!("classifier", LevelFilter::INFO, &["flow"]);
