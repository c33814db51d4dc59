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

//! Per-worker telemetry stats engine for a sidecar proxy.
//!
//! For every proxied HTTP exchange or TCP connection this crate derives a
//! canonical, direction-aware set of metric dimensions, resolves them to
//! pre-built host metric handles through two caches (decoded peer identity
//! and metric sets), and correlates TCP close callbacks into exactly one
//! terminal report.
//!
//! Everything here is single-threaded by contract: each worker owns one
//! [`StatsFilter`] and the host guarantees thread affinity of the stream
//! callbacks, so there are no locks and no async anywhere on the hot path.

pub mod dimensions;
pub mod host;
pub mod metric_cache;
pub mod peer;
pub mod report;
pub mod request_info;
pub mod tcp_tracker;

pub use dimensions::{Dimensions, Field};
pub use host::{ExpressionEvaluator, MetricId, MetricKind, MetricRegistry, PropertyReader};
pub use peer::{Node, PeerLookup, PeerMetadataCache};
pub use report::{ReportEngine, StatsFilter};
pub use request_info::{RequestInfo, RequestProtocol};
pub use stats_configuration::{MetricToggle, StatsConfig, TcpReportPolicy, TrafficDirection};
pub use tcp_tracker::TcpRequestTracker;

pub type Error = stats_error::Error;
pub type Result<T> = ::core::result::Result<T, Error>;
