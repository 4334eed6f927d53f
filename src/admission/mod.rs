//! Job admission pipeline
//!
//! An ordered list of mutators rewrites an incoming job, then an ordered list
//! of validators inspects the final result. Warnings are non-fatal and
//! accumulate across the whole pipeline. A mutator error aborts the pipeline
//! immediately; validator errors are aggregated so the client sees every
//! violation at once.

pub mod mutator;
pub mod validator;

use std::fmt;

use async_trait::async_trait;
use serde_json::Value;
use tracing::debug;

use crate::config::{MutatorConfig, ValidatorConfig};
use crate::error::{Error, Result};
use self::mutator::JsonPatchMutator;
use self::validator::PolicyValidator;

/// A component that may rewrite a job and emit warnings
#[async_trait]
pub trait JobMutator: Send + Sync {
    /// Display name used to annotate warnings and errors
    fn name(&self) -> &str;

    /// Produce a rewritten job plus any warnings
    async fn mutate(&self, job: &Value) -> Result<(Value, Vec<String>)>;
}

/// A component that inspects a job and emits warnings and/or errors without
/// modifying it
#[async_trait]
pub trait JobValidator: Send + Sync {
    /// Display name used to annotate warnings and errors
    fn name(&self) -> &str;

    /// Check the job, returning warnings on success
    async fn validate(&self, job: &Value) -> Result<Vec<String>>;
}

/// An ordered collection of rule-emitted messages that rejected a job
///
/// Renders with the same multi-message format as merged warnings: a single
/// entry verbatim, several entries under an `N error(s):` header.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AggregateError {
    messages: Vec<String>,
}

impl AggregateError {
    /// Build from already-annotated messages; `None` when there are none,
    /// so an empty aggregate can never reject a job.
    pub fn new(messages: Vec<String>) -> Option<Self> {
        if messages.is_empty() {
            None
        } else {
            Some(Self { messages })
        }
    }

    /// The individual messages, in insertion order
    pub fn messages(&self) -> &[String] {
        &self.messages
    }

    /// Consume the aggregate, yielding its messages
    pub fn into_messages(self) -> Vec<String> {
        self.messages
    }
}

impl fmt::Display for AggregateError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&render_messages("error(s)", &self.messages))
    }
}

impl std::error::Error for AggregateError {}

/// Merge the upstream warnings string with locally accumulated warnings into
/// the wire format clients already parse: one warning verbatim, several under
/// an `N warning(s):` header with `* ` bullets.
pub fn merge_warnings(upstream: &str, local: &[String]) -> String {
    let mut all = Vec::with_capacity(local.len() + 1);
    if !upstream.is_empty() {
        all.push(upstream.to_string());
    }
    all.extend_from_slice(local);
    render_messages("warning(s)", &all)
}

fn render_messages(noun: &str, messages: &[String]) -> String {
    match messages {
        [] => String::new(),
        [only] => only.clone(),
        many => {
            let mut out = format!("{} {noun}:\n", many.len());
            let bullets: Vec<String> = many.iter().map(|m| format!("* {m}")).collect();
            out.push_str(&bullets.join("\n"));
            out
        }
    }
}

/// Suffix each rule-emitted message with the producing component's name
pub(crate) fn annotate(messages: &[String], name: &str) -> Vec<String> {
    messages.iter().map(|m| format!("{m} ({name})")).collect()
}

/// The admission pipeline: mutators in configuration order, then validators
/// in configuration order
pub struct JobHandler {
    mutators: Vec<Box<dyn JobMutator>>,
    validators: Vec<Box<dyn JobValidator>>,
}

impl JobHandler {
    /// Build a pipeline from already-constructed components
    pub fn new(mutators: Vec<Box<dyn JobMutator>>, validators: Vec<Box<dyn JobValidator>>) -> Self {
        Self {
            mutators,
            validators,
        }
    }

    /// Run the full pipeline: every mutator, then every validator
    ///
    /// A mutator error aborts immediately; a validator aggregate becomes the
    /// returned error after all validators have run.
    pub async fn apply_admission_controllers(
        &self,
        job: &Value,
    ) -> Result<(Value, Vec<String>)> {
        let (job, mut warnings) = self.admission_mutators(job).await?;
        let (validator_warnings, validation_error) = self.admission_validators(&job).await;
        warnings.extend(validator_warnings);
        if let Some(err) = validation_error {
            return Err(Error::Admission(err));
        }
        Ok((job, warnings))
    }

    /// Run every mutator in order, each observing its predecessor's output
    pub async fn admission_mutators(&self, job: &Value) -> Result<(Value, Vec<String>)> {
        let mut current = job.clone();
        let mut warnings = Vec::new();
        for mutator in &self.mutators {
            let (next, mutator_warnings) = mutator.mutate(&current).await?;
            debug!(mutator = mutator.name(), "applied job mutator");
            current = next;
            warnings.extend(mutator_warnings);
        }
        Ok((current, warnings))
    }

    /// Run every validator against the final job
    ///
    /// All validators run even when one fails so the client sees the full set
    /// of violations; their errors come back as one aggregate.
    pub async fn admission_validators(
        &self,
        job: &Value,
    ) -> (Vec<String>, Option<AggregateError>) {
        let mut warnings = Vec::new();
        let mut errors = Vec::new();
        for validator in &self.validators {
            match validator.validate(job).await {
                Ok(validator_warnings) => warnings.extend(validator_warnings),
                Err(Error::Admission(agg)) => errors.extend(agg.into_messages()),
                Err(other) => errors.push(other.to_string()),
            }
            debug!(validator = validator.name(), "ran job validator");
        }
        (warnings, AggregateError::new(errors))
    }
}

/// Construct the mutator pipeline from configuration
pub fn build_mutators(configs: &[MutatorConfig]) -> Result<Vec<Box<dyn JobMutator>>> {
    let mut mutators: Vec<Box<dyn JobMutator>> = Vec::new();
    for config in configs {
        match config.kind.as_str() {
            "opa_json_patch" => {
                mutators.push(Box::new(JsonPatchMutator::new(&config.name, &config.rules)?));
            }
            "webhook" => {
                return Err(Error::Config(format!(
                    "mutator '{}': webhook mutators are not available in this build",
                    config.name
                )));
            }
            other => {
                return Err(Error::Config(format!(
                    "mutator '{}': unknown type '{other}'",
                    config.name
                )));
            }
        }
    }
    Ok(mutators)
}

/// Construct the validator pipeline from configuration
pub fn build_validators(configs: &[ValidatorConfig]) -> Result<Vec<Box<dyn JobValidator>>> {
    let mut validators: Vec<Box<dyn JobValidator>> = Vec::new();
    for config in configs {
        match config.kind.as_str() {
            "opa" => {
                validators.push(Box::new(PolicyValidator::new(&config.name, &config.rules)?));
            }
            "webhook" => {
                return Err(Error::Config(format!(
                    "validator '{}': webhook validators are not available in this build",
                    config.name
                )));
            }
            other => {
                return Err(Error::Config(format!(
                    "validator '{}': unknown type '{other}'",
                    config.name
                )));
            }
        }
    }
    Ok(validators)
}
