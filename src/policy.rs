//! Policy query adapter
//!
//! Hides the embedded Rego engine behind a small contract: compile a list of
//! (module, query) rules once at startup, evaluate the compiled form against
//! a job, and read the reserved `patch`, `warnings` and `errors` bindings out
//! of the result. Mutators and validators are both driven through this one
//! adapter so the engine never leaks into the pipeline.

use regorus::Engine;
use serde_json::Value;

use crate::config::RuleConfig;
use crate::error::{Error, Result};

/// Binding carrying a JSON Patch document
const PATCH_BINDING: &str = "patch";

/// Binding carrying non-fatal messages
const WARNINGS_BINDING: &str = "warnings";

/// Binding carrying fatal messages
const ERRORS_BINDING: &str = "errors";

/// A compiled set of policy rules
///
/// Immutable after construction. Evaluation clones the engine, so one
/// instance may be shared across request tasks without locking.
#[derive(Clone)]
pub struct PreparedPolicy {
    engine: Engine,
    queries: Vec<String>,
}

impl PreparedPolicy {
    /// Load every rule module into one evaluation context and check that
    /// every query parses. Fails on an unparsable module, an unknown builtin
    /// or a syntactically invalid query.
    pub fn compile(rules: &[RuleConfig]) -> Result<Self> {
        let mut engine = Engine::new();
        for rule in rules {
            engine
                .add_policy_from_file(rule.module.clone())
                .map_err(|e| Error::Compile(format!("module {}: {e}", rule.module)))?;
        }

        // Probe every query against an empty input so a broken query fails
        // the process at startup rather than the first request.
        let mut probe = engine.clone();
        let empty = regorus::Value::from_json_str("{}")
            .map_err(|e| Error::Compile(e.to_string()))?;
        probe.set_input(empty);
        for rule in rules {
            probe
                .eval_query(rule.query.clone(), false)
                .map_err(|e| Error::Compile(format!("query {:?}: {e}", rule.query)))?;
        }

        Ok(Self {
            engine,
            queries: rules.iter().map(|r| r.query.clone()).collect(),
        })
    }

    /// Evaluate every query against a job, merging recognized bindings in
    /// rule order.
    pub fn evaluate(&self, job: &Value) -> Result<PolicyOutcome> {
        let input = regorus::Value::from_json_str(&job.to_string())
            .map_err(|e| Error::Evaluate(format!("job is not valid policy input: {e}")))?;

        let mut engine = self.engine.clone();
        engine.set_input(input);

        let mut outcome = PolicyOutcome::default();
        for query in &self.queries {
            let results = engine
                .eval_query(query.clone(), false)
                .map_err(|e| Error::Evaluate(format!("query {query:?}: {e}")))?;
            for result in results.result {
                let bindings = serde_json::to_value(&result.bindings)
                    .map_err(|e| Error::Evaluate(format!("unreadable bindings: {e}")))?;
                outcome.absorb(&bindings);
            }
        }

        Ok(outcome)
    }
}

/// The merged result of one evaluation
#[derive(Debug, Default, Clone)]
pub struct PolicyOutcome {
    patch: Vec<Value>,
    warnings: Vec<String>,
    errors: Vec<String>,
}

impl PolicyOutcome {
    fn absorb(&mut self, bindings: &Value) {
        let Some(map) = bindings.as_object() else {
            return;
        };
        if let Some(patch) = map.get(PATCH_BINDING) {
            match patch {
                Value::Null => {}
                Value::Array(ops) => self.patch.extend(ops.iter().cloned()),
                // Not a patch document; kept so the mutator surfaces a
                // decode error instead of silently dropping the binding.
                other => self.patch.push(other.clone()),
            }
        }
        if let Some(warnings) = map.get(WARNINGS_BINDING) {
            coerce_strings(warnings, &mut self.warnings);
        }
        if let Some(errors) = map.get(ERRORS_BINDING) {
            coerce_strings(errors, &mut self.errors);
        }
    }

    /// The JSON Patch document bound to `patch`; empty when absent
    pub fn patch(&self) -> Value {
        Value::Array(self.patch.clone())
    }

    /// Messages bound to `warnings`, in rule order
    pub fn warnings(&self) -> &[String] {
        &self.warnings
    }

    /// Messages bound to `errors`, in rule order
    pub fn errors(&self) -> &[String] {
        &self.errors
    }
}

/// Coerce a binding value to an ordered sequence of strings. Non-string
/// entries keep their JSON rendering so nothing a rule emits is lost.
fn coerce_strings(value: &Value, out: &mut Vec<String>) {
    match value {
        Value::Null => {}
        Value::String(s) => out.push(s.clone()),
        Value::Array(items) => {
            for item in items {
                match item {
                    Value::String(s) => out.push(s.clone()),
                    other => out.push(other.to_string()),
                }
            }
        }
        other => out.push(other.to_string()),
    }
}
