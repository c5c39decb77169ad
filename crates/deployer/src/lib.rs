/*
 * 5D Labs Agent Platform - Kubernetes Rollout Executor
 * Copyright (C) 2025 5D Labs
 *
 * This program is free software: you can redistribute it and/or modify
 * it under the terms of the GNU Affero General Public License as published
 * by the Free Software Foundation, either version 3 of the License, or
 * (at your option) any later version.
 *
 * This program is distributed in the hope that it will be useful,
 * but WITHOUT ANY WARRANTY; without even the implied warranty of
 * MERCHANTABILITY or FITNESS FOR A PARTICULAR PURPOSE. See the
 * GNU Affero General Public License for more details.
 *
 * You should have received a copy of the GNU Affero General Public License
 * along with this program. If not, see <https://www.gnu.org/licenses/>.
 */

//! Rollout executor core library
//!
//! Drives a multi-role, multi-deploy-group release onto Kubernetes clusters
//! and supervises it to a verdict: template validation, release assembly,
//! parallel apply, the stability monitor state machine, failure
//! diagnostics, rollback and the blue/green traffic switch.

pub mod applier;
pub mod blue_green;
pub mod config;
pub mod diagnostics;
pub mod error;
pub mod executor;
pub mod kubernetes;
pub mod monitor;
pub mod output;
pub mod parallel;
pub mod plan;
pub mod release;
pub mod reporter;
pub mod rollback;
pub mod testing;
pub mod validator;

pub use config::DeployerConfig;
pub use error::{Error, Result};
pub use executor::{DeployExecutor, DeployOptions, DeployOutcome};
pub use monitor::{ReleaseStatus, RolloutState, WaitOutcome};
pub use plan::DeployPlan;
