//! Policy-driven validator
//!
//! Evaluates compiled rules against a job and surfaces their `warnings` and
//! `errors` bindings. The job is never modified.

use async_trait::async_trait;
use serde_json::Value;
use tracing::debug;

use super::{annotate, AggregateError, JobValidator};
use crate::config::RuleConfig;
use crate::error::{Error, Result};
use crate::policy::PreparedPolicy;

/// Validator backed by a compiled policy
pub struct PolicyValidator {
    name: String,
    policy: PreparedPolicy,
}

impl PolicyValidator {
    /// Compile the rules; fails at startup on a broken module or query
    pub fn new(name: impl Into<String>, rules: &[RuleConfig]) -> Result<Self> {
        Ok(Self {
            name: name.into(),
            policy: PreparedPolicy::compile(rules)?,
        })
    }
}

#[async_trait]
impl JobValidator for PolicyValidator {
    fn name(&self) -> &str {
        &self.name
    }

    async fn validate(&self, job: &Value) -> Result<Vec<String>> {
        let outcome = self.policy.evaluate(job)?;

        if let Some(agg) = AggregateError::new(annotate(outcome.errors(), &self.name)) {
            debug!(validator = %self.name, errors = ?agg.messages(), "rules rejected job");
            return Err(Error::Admission(agg));
        }

        let warnings = annotate(outcome.warnings(), &self.name);
        if !warnings.is_empty() {
            debug!(validator = %self.name, ?warnings, "rules emitted warnings");
        }
        Ok(warnings)
    }
}
