//! Proxy configuration
//!
//! Loaded from a YAML file selected on the command line. The file describes
//! the listen address, the upstream orchestrator, optional TLS material for
//! both sides, and the ordered mutator/validator pipelines.

use std::path::Path;

use serde::Deserialize;

use crate::error::{Error, Result};

/// Default listen port
const DEFAULT_PORT: u16 = 6464;

/// Default upstream address
const DEFAULT_NOMAD_ADDRESS: &str = "http://localhost:4646";

/// Top-level proxy configuration
#[derive(Debug, Clone, Deserialize, PartialEq)]
#[serde(deny_unknown_fields)]
pub struct Config {
    /// Listen port
    #[serde(default = "default_port")]
    pub port: u16,

    /// Listen address
    #[serde(default = "default_bind")]
    pub bind: String,

    /// Log level filter (overridden by `RUST_LOG` when set)
    #[serde(default = "default_log_level")]
    pub log_level: String,

    /// TLS material for the proxy's own listener; plain HTTP when absent
    #[serde(default)]
    pub tls: Option<ProxyTls>,

    /// Upstream orchestrator
    #[serde(default)]
    pub nomad: NomadConfig,

    /// Ordered mutator pipeline
    #[serde(default)]
    pub mutators: Vec<MutatorConfig>,

    /// Ordered validator pipeline
    #[serde(default)]
    pub validators: Vec<ValidatorConfig>,
}

/// Upstream orchestrator endpoint
#[derive(Debug, Clone, Deserialize, PartialEq)]
#[serde(deny_unknown_fields)]
pub struct NomadConfig {
    /// Base URL of the orchestrator API
    #[serde(default = "default_nomad_address")]
    pub address: String,

    /// Client TLS material for talking to the orchestrator
    #[serde(default)]
    pub tls: Option<NomadTls>,
}

/// Client TLS material for the upstream connection
#[derive(Debug, Clone, Deserialize, PartialEq)]
#[serde(deny_unknown_fields)]
pub struct NomadTls {
    /// CA bundle used to verify the orchestrator certificate
    pub ca_file: String,
    /// Client certificate presented to the orchestrator
    pub cert_file: String,
    /// Private key for the client certificate
    pub key_file: String,
    /// Skip upstream certificate verification
    #[serde(default)]
    pub insecure_skip_verify: bool,
}

/// TLS material for the proxy's own listener
#[derive(Debug, Clone, Deserialize, PartialEq)]
#[serde(deny_unknown_fields)]
pub struct ProxyTls {
    /// Server certificate
    pub cert_file: String,
    /// Server private key
    pub key_file: String,
}

/// One entry of the mutator pipeline
#[derive(Debug, Clone, Deserialize, PartialEq)]
#[serde(deny_unknown_fields)]
pub struct MutatorConfig {
    /// Component type tag (`opa_json_patch`, `webhook`)
    #[serde(rename = "type")]
    pub kind: String,

    /// Display name used to annotate warnings and errors
    pub name: String,

    /// Policy rules driving a policy-backed mutator
    #[serde(default)]
    pub rules: Vec<RuleConfig>,

    /// Webhook parameters; the type is recognized but not built by this binary
    #[serde(default)]
    pub webhook: Option<WebhookConfig>,
}

/// One entry of the validator pipeline
#[derive(Debug, Clone, Deserialize, PartialEq)]
#[serde(deny_unknown_fields)]
pub struct ValidatorConfig {
    /// Component type tag (`opa`, `webhook`)
    #[serde(rename = "type")]
    pub kind: String,

    /// Display name used to annotate warnings and errors
    pub name: String,

    /// Policy rules driving a policy-backed validator
    #[serde(default)]
    pub rules: Vec<RuleConfig>,

    /// Webhook parameters; the type is recognized but not built by this binary
    #[serde(default)]
    pub webhook: Option<WebhookConfig>,
}

/// A policy rule: one Rego module plus the query naming its result bindings
#[derive(Debug, Clone, Deserialize, PartialEq)]
#[serde(deny_unknown_fields)]
pub struct RuleConfig {
    /// Path to the Rego module file
    pub module: String,

    /// Binding query, e.g. `patch = data.hello_world_meta.patch`
    pub query: String,
}

/// Webhook endpoint parameters
#[derive(Debug, Clone, Deserialize, PartialEq)]
#[serde(deny_unknown_fields)]
pub struct WebhookConfig {
    /// Endpoint URL
    pub endpoint: String,
    /// HTTP method used to call the endpoint
    pub method: String,
}

fn default_port() -> u16 {
    DEFAULT_PORT
}

fn default_bind() -> String {
    "0.0.0.0".to_string()
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_nomad_address() -> String {
    DEFAULT_NOMAD_ADDRESS.to_string()
}

impl Default for Config {
    fn default() -> Self {
        Self {
            port: default_port(),
            bind: default_bind(),
            log_level: default_log_level(),
            tls: None,
            nomad: NomadConfig::default(),
            mutators: Vec::new(),
            validators: Vec::new(),
        }
    }
}

impl Default for NomadConfig {
    fn default() -> Self {
        Self {
            address: default_nomad_address(),
            tls: None,
        }
    }
}

impl Config {
    /// Load configuration from a YAML file
    pub fn load(path: &Path) -> Result<Self> {
        let raw = std::fs::read_to_string(path)
            .map_err(|e| Error::Config(format!("failed to read {}: {e}", path.display())))?;
        serde_yaml::from_str(&raw)
            .map_err(|e| Error::Config(format!("failed to parse {}: {e}", path.display())))
    }
}
