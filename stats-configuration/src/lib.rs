// Copyright 2025 The kmesh Authors
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//   http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.
//

//! Typed configuration for the telemetry stats engine.
//!
//! The proxy's configuration plane parses the filter's raw configuration
//! elsewhere and hands this crate's [`StatsConfig`] to the engine at
//! startup. An invalid configuration never aborts the worker: the caller
//! logs a warning and leaves reporting inactive for that configuration
//! generation.

pub mod logging;

use compact_str::CompactString;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::warn;

pub type Result<T> = std::result::Result<T, ConfigError>;

const DEFAULT_STAT_PREFIX: &str = "istio";
const DEFAULT_FIELD_SEPARATOR: &str = ";.;";
const DEFAULT_VALUE_SEPARATOR: &str = "=.=";
const DEFAULT_MAX_PEER_CACHE_SIZE: usize = 500;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ConfigError {
    #[error("failed to parse stats configuration: {0}")]
    Parse(String),

    #[error("stat prefix must not be empty")]
    EmptyStatPrefix,

    #[error("field and value separators must not be empty")]
    EmptySeparator,

    #[error("max_peer_cache_size must be at least 4")]
    PeerCacheTooSmall,

    #[error("duplicate custom dimension `{0}`")]
    DuplicateDimension(CompactString),

    #[error("custom dimension `{0}` has an empty expression")]
    EmptyExpression(CompactString),

    #[error("custom dimension name `{0}` collides with a built-in dimension")]
    ReservedDimension(CompactString),

    #[error("metric toggle with an empty name")]
    EmptyMetricToggle,

    #[error("duplicate metric toggle `{0}`")]
    DuplicateMetricToggle(CompactString),
}

impl From<ConfigError> for stats_error::Error {
    fn from(e: ConfigError) -> Self {
        stats_error::Error::from(e.to_string())
    }
}

/// Traffic direction of the listener this engine instance is attached to.
///
/// Direction decides which side of the dimension set is fixed at configure
/// time (the local workload) and which side is resolved per peer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum TrafficDirection {
    Inbound,
    Outbound,
}

impl TrafficDirection {
    pub fn is_outbound(self) -> bool {
        matches!(self, TrafficDirection::Outbound)
    }

    /// Reporter label value exported with every metric.
    pub fn reporter(self) -> &'static str {
        match self {
            TrafficDirection::Inbound => "destination",
            TrafficDirection::Outbound => "source",
        }
    }
}

/// Identity of the workload this proxy fronts, fixed for the lifetime of
/// the worker.
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize, Serialize)]
pub struct LocalNode {
    #[serde(default)]
    pub workload_name: CompactString,
    #[serde(default)]
    pub namespace: CompactString,
    #[serde(default)]
    pub app: CompactString,
    #[serde(default)]
    pub version: CompactString,
    #[serde(default)]
    pub canonical_service: CompactString,
    #[serde(default)]
    pub canonical_revision: CompactString,
}

/// A metric label computed by the external expression evaluator.
///
/// The expression text is opaque here; the engine only needs a stable name
/// and an index into the evaluator's compiled expression set.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize)]
pub struct CustomDimension {
    pub name: CompactString,
    pub expression: CompactString,
}

/// Per-metric toggle. A dropped metric is skipped entirely: no host
/// metric is defined for it and nothing is recorded.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize)]
pub struct MetricToggle {
    pub name: CompactString,
    #[serde(default)]
    pub drop: bool,
}

/// How the terminal TCP report treats peer metadata that has not arrived.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum TcpReportPolicy {
    /// Defer the report and retry on a later connection callback.
    #[default]
    WaitForPeer,
    /// Never defer; report immediately with `"unknown"` peer fields.
    Immediate,
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize)]
pub struct StatsConfig {
    pub direction: TrafficDirection,

    #[serde(default)]
    pub local_node: LocalNode,

    #[serde(default = "default_stat_prefix")]
    pub stat_prefix: CompactString,

    /// Separator between `label<value_separator>value` pairs when the
    /// metric name is flattened for string-only host metric namespaces.
    #[serde(default = "default_field_separator")]
    pub field_separator: CompactString,

    #[serde(default = "default_value_separator")]
    pub value_separator: CompactString,

    /// Upper bound on decoded peer descriptors kept per worker. Exceeding
    /// it evicts a quarter of the cache in one pass.
    #[serde(default = "default_max_peer_cache_size")]
    pub max_peer_cache_size: usize,

    #[serde(default)]
    pub custom_dimensions: Vec<CustomDimension>,

    /// Per-metric drop toggles, keyed by the unprefixed stat name
    /// (e.g. `request_bytes`).
    #[serde(default)]
    pub metrics: Vec<MetricToggle>,

    #[serde(default)]
    pub tcp_report_policy: TcpReportPolicy,
}

fn default_stat_prefix() -> CompactString {
    CompactString::const_new(DEFAULT_STAT_PREFIX)
}

fn default_field_separator() -> CompactString {
    CompactString::const_new(DEFAULT_FIELD_SEPARATOR)
}

fn default_value_separator() -> CompactString {
    CompactString::const_new(DEFAULT_VALUE_SEPARATOR)
}

fn default_max_peer_cache_size() -> usize {
    DEFAULT_MAX_PEER_CACHE_SIZE
}

/// Built-in dimension names a custom dimension is not allowed to shadow.
pub const RESERVED_DIMENSIONS: &[&str] = &[
    "reporter",
    "source_workload",
    "source_workload_namespace",
    "source_principal",
    "source_app",
    "source_version",
    "source_canonical_service",
    "source_canonical_revision",
    "destination_workload",
    "destination_workload_namespace",
    "destination_principal",
    "destination_app",
    "destination_version",
    "destination_canonical_service",
    "destination_canonical_revision",
    "destination_service",
    "destination_port",
    "request_protocol",
    "response_code",
    "grpc_response_status",
    "response_flags",
    "connection_security_policy",
];

impl StatsConfig {
    pub fn new(direction: TrafficDirection, local_node: LocalNode) -> Self {
        StatsConfig {
            direction,
            local_node,
            stat_prefix: default_stat_prefix(),
            field_separator: default_field_separator(),
            value_separator: default_value_separator(),
            max_peer_cache_size: default_max_peer_cache_size(),
            custom_dimensions: Vec::new(),
            metrics: Vec::new(),
            tcp_report_policy: TcpReportPolicy::default(),
        }
    }

    pub fn from_yaml(input: &str) -> Result<Self> {
        let config: StatsConfig =
            serde_yaml::from_str(input).map_err(|e| ConfigError::Parse(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    /// Rejects configurations the engine cannot honor. Callers are expected
    /// to warn and keep reporting inactive rather than abort.
    pub fn validate(&self) -> Result<()> {
        if self.stat_prefix.is_empty() {
            return Err(ConfigError::EmptyStatPrefix);
        }
        if self.field_separator.is_empty() || self.value_separator.is_empty() {
            return Err(ConfigError::EmptySeparator);
        }
        // The quarter-eviction bound needs room for at least one eviction.
        if self.max_peer_cache_size < 4 {
            return Err(ConfigError::PeerCacheTooSmall);
        }
        for (i, dim) in self.custom_dimensions.iter().enumerate() {
            if dim.expression.is_empty() {
                return Err(ConfigError::EmptyExpression(dim.name.clone()));
            }
            if RESERVED_DIMENSIONS.contains(&dim.name.as_str()) {
                return Err(ConfigError::ReservedDimension(dim.name.clone()));
            }
            if self.custom_dimensions[..i].iter().any(|d| d.name == dim.name) {
                return Err(ConfigError::DuplicateDimension(dim.name.clone()));
            }
        }
        for (i, toggle) in self.metrics.iter().enumerate() {
            if toggle.name.is_empty() {
                return Err(ConfigError::EmptyMetricToggle);
            }
            if self.metrics[..i].iter().any(|t| t.name == toggle.name) {
                return Err(ConfigError::DuplicateMetricToggle(toggle.name.clone()));
            }
        }
        Ok(())
    }

    /// Whether the given stat was switched off by a drop toggle.
    pub fn drops_metric(&self, name: &str) -> bool {
        self.metrics.iter().any(|t| t.drop && t.name == name)
    }

    /// Convenience for the configure path: validates and logs the rejection
    /// reason so the caller can fail closed with a one-liner.
    pub fn validated(self) -> Option<Self> {
        match self.validate() {
            Ok(()) => Some(self),
            Err(e) => {
                warn!("stats configuration rejected, reporting disabled: {e}");
                None
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tracing_test::traced_test;

    fn base_config() -> StatsConfig {
        StatsConfig::new(
            TrafficDirection::Outbound,
            LocalNode { workload_name: "svc-a".into(), namespace: "default".into(), ..Default::default() },
        )
    }

    #[test]
    fn test_defaults() {
        let config = base_config();
        assert_eq!(config.stat_prefix, "istio");
        assert_eq!(config.field_separator, ";.;");
        assert_eq!(config.value_separator, "=.=");
        assert_eq!(config.max_peer_cache_size, 500);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_from_yaml_minimal() {
        let config = StatsConfig::from_yaml("direction: OUTBOUND\n").unwrap();
        assert_eq!(config.direction, TrafficDirection::Outbound);
        assert_eq!(config.direction.reporter(), "source");
        assert!(config.custom_dimensions.is_empty());
    }

    #[test]
    fn test_from_yaml_full() {
        let yaml = r#"
direction: INBOUND
local_node:
  workload_name: productpage-v1
  namespace: bookinfo
  app: productpage
  version: v1
stat_prefix: mesh
max_peer_cache_size: 64
custom_dimensions:
  - name: request_host
    expression: request.host
"#;
        let config = StatsConfig::from_yaml(yaml).unwrap();
        assert_eq!(config.direction.reporter(), "destination");
        assert_eq!(config.stat_prefix, "mesh");
        assert_eq!(config.max_peer_cache_size, 64);
        assert_eq!(config.custom_dimensions.len(), 1);
        assert_eq!(config.custom_dimensions[0].name, "request_host");
    }

    #[test]
    fn test_rejects_empty_separator() {
        let mut config = base_config();
        config.field_separator = "".into();
        assert_eq!(config.validate(), Err(ConfigError::EmptySeparator));
    }

    #[test]
    fn test_rejects_tiny_peer_cache() {
        let mut config = base_config();
        config.max_peer_cache_size = 3;
        assert_eq!(config.validate(), Err(ConfigError::PeerCacheTooSmall));
    }

    #[test]
    fn test_rejects_duplicate_custom_dimension() {
        let mut config = base_config();
        config.custom_dimensions = vec![
            CustomDimension { name: "host".into(), expression: "request.host".into() },
            CustomDimension { name: "host".into(), expression: "request.authority".into() },
        ];
        assert_eq!(config.validate(), Err(ConfigError::DuplicateDimension("host".into())));
    }

    #[test]
    fn test_rejects_reserved_custom_dimension() {
        let mut config = base_config();
        config.custom_dimensions =
            vec![CustomDimension { name: "response_code".into(), expression: "response.code".into() }];
        assert_eq!(config.validate(), Err(ConfigError::ReservedDimension("response_code".into())));
    }

    #[test]
    fn test_from_yaml_metric_toggles_and_tcp_policy() {
        let yaml = r#"
direction: OUTBOUND
metrics:
  - name: request_bytes
    drop: true
  - name: response_bytes
tcp_report_policy: IMMEDIATE
"#;
        let config = StatsConfig::from_yaml(yaml).unwrap();
        assert!(config.drops_metric("request_bytes"));
        assert!(!config.drops_metric("response_bytes"));
        assert!(!config.drops_metric("requests_total"));
        assert_eq!(config.tcp_report_policy, TcpReportPolicy::Immediate);
    }

    #[test]
    fn test_tcp_policy_defaults_to_wait_for_peer() {
        let config = StatsConfig::from_yaml("direction: OUTBOUND\n").unwrap();
        assert_eq!(config.tcp_report_policy, TcpReportPolicy::WaitForPeer);
    }

    #[test]
    fn test_rejects_duplicate_metric_toggle() {
        let mut config = base_config();
        config.metrics = vec![
            MetricToggle { name: "request_bytes".into(), drop: true },
            MetricToggle { name: "request_bytes".into(), drop: false },
        ];
        assert_eq!(config.validate(), Err(ConfigError::DuplicateMetricToggle("request_bytes".into())));
    }

    #[test]
    fn test_rejects_empty_metric_toggle_name() {
        let mut config = base_config();
        config.metrics = vec![MetricToggle { name: "".into(), drop: true }];
        assert_eq!(config.validate(), Err(ConfigError::EmptyMetricToggle));
    }

    #[traced_test]
    #[test]
    fn test_validated_warns_and_fails_closed() {
        let mut config = base_config();
        config.stat_prefix = "".into();
        assert!(config.validated().is_none());
        assert!(logs_contain("reporting disabled"));
    }
}
