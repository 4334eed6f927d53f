//! Policy-driven JSON Patch mutator
//!
//! Evaluates compiled rules against a job, rejects it when the rules bind
//! `errors`, and otherwise applies the JSON Patch document bound to `patch`.
//! Patch application is all-or-nothing: on failure the caller keeps the
//! original job.

use async_trait::async_trait;
use json_patch::Patch;
use serde_json::Value;
use tracing::debug;

use super::{annotate, AggregateError, JobMutator};
use crate::config::RuleConfig;
use crate::error::{Error, Result};
use crate::policy::PreparedPolicy;

/// Mutator backed by a compiled policy whose `patch` binding rewrites jobs
pub struct JsonPatchMutator {
    name: String,
    policy: PreparedPolicy,
}

impl JsonPatchMutator {
    /// Compile the rules; fails at startup on a broken module or query
    pub fn new(name: impl Into<String>, rules: &[RuleConfig]) -> Result<Self> {
        Ok(Self {
            name: name.into(),
            policy: PreparedPolicy::compile(rules)?,
        })
    }
}

#[async_trait]
impl JobMutator for JsonPatchMutator {
    fn name(&self) -> &str {
        &self.name
    }

    async fn mutate(&self, job: &Value) -> Result<(Value, Vec<String>)> {
        let outcome = self.policy.evaluate(job)?;

        if let Some(agg) = AggregateError::new(annotate(outcome.errors(), &self.name)) {
            debug!(mutator = %self.name, errors = ?agg.messages(), "rules rejected job");
            return Err(Error::Admission(agg));
        }

        let warnings = annotate(outcome.warnings(), &self.name);
        if !warnings.is_empty() {
            debug!(mutator = %self.name, ?warnings, "rules emitted warnings");
        }

        let patch: Patch = serde_json::from_value(outcome.patch()).map_err(|e| {
            Error::Patch(format!(
                "mutator '{}' produced an invalid patch document: {e}",
                self.name
            ))
        })?;
        if patch.0.is_empty() {
            return Ok((job.clone(), warnings));
        }

        debug!(mutator = %self.name, ops = patch.0.len(), "applying patch");
        let mut mutated = job.clone();
        json_patch::patch(&mut mutated, &patch)
            .map_err(|e| Error::Patch(format!("mutator '{}' patch failed to apply: {e}", self.name)))?;

        Ok((mutated, warnings))
    }
}
