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

//! Report orchestration and the per-worker filter state.
//!
//! [`ReportEngine`] stitches the caches together for a single report:
//! resolve the peer, map the dimensions, look up or create the metric set,
//! record. [`StatsFilter`] is the explicit per-worker state struct built at
//! configure time; the host's stream callbacks land here.
//!
//! HTTP and TCP deliberately differ on missing peer metadata. HTTP has
//! exactly one terminal callback per exchange, so it always reports with
//! best-effort values. TCP has natural retry points (data callbacks), so a
//! report is deferred while the metadata may still arrive.

use compact_str::CompactString;
use stats_configuration::{ConfigError, StatsConfig, TcpReportPolicy};
use tracing::warn;

use crate::dimensions::Dimensions;
use crate::host::{ExpressionEvaluator, MetricRegistry, PropertyReader};
use crate::metric_cache::{MetricSetCache, StatGenerator, HTTP_STATS, TCP_STATS};
use crate::peer::{
    PeerLookup, PeerMetadataCache, DOWNSTREAM_PEER, DOWNSTREAM_PEER_ID, UPSTREAM_PEER, UPSTREAM_PEER_ID,
};
use crate::request_info::RequestInfo;
use crate::tcp_tracker::TcpRequestTracker;

pub struct ReportEngine {
    peer_id_path: &'static [&'static str],
    peer_metadata_path: &'static [&'static str],
    dims: Dimensions,
    custom_count: usize,
    http_stats: Vec<StatGenerator>,
    tcp_stats: Vec<StatGenerator>,
    tcp_report_policy: TcpReportPolicy,
    peer_cache: PeerMetadataCache,
    metric_cache: MetricSetCache,
    properties: Box<dyn PropertyReader>,
    registry: Box<dyn MetricRegistry>,
    evaluator: Option<Box<dyn ExpressionEvaluator>>,
}

impl ReportEngine {
    pub fn try_new(
        config: &StatsConfig,
        properties: Box<dyn PropertyReader>,
        mut registry: Box<dyn MetricRegistry>,
        evaluator: Option<Box<dyn ExpressionEvaluator>>,
    ) -> Result<Self, ConfigError> {
        config.validate()?;
        let outbound = config.direction.is_outbound();
        // The peer is whoever sits on the far side of this worker's
        // traffic: the upstream endpoint when outbound, the caller when
        // inbound.
        let (peer_id_path, peer_metadata_path) =
            if outbound { (UPSTREAM_PEER_ID, UPSTREAM_PEER) } else { (DOWNSTREAM_PEER_ID, DOWNSTREAM_PEER) };
        let custom_names: Vec<CompactString> =
            config.custom_dimensions.iter().map(|d| d.name.clone()).collect();
        for toggle in &config.metrics {
            if !HTTP_STATS.iter().chain(TCP_STATS.iter()).any(|g| g.name == toggle.name) {
                warn!("metric toggle `{}` does not match any stat, ignoring", toggle.name);
            }
        }
        let keep = |generators: &'static [StatGenerator]| -> Vec<StatGenerator> {
            generators.iter().filter(|g| !config.drops_metric(g.name)).copied().collect()
        };
        let metric_cache = MetricSetCache::new(
            &config.stat_prefix,
            &config.field_separator,
            &config.value_separator,
            custom_names,
            registry.as_mut(),
        );
        Ok(ReportEngine {
            peer_id_path,
            peer_metadata_path,
            dims: Dimensions::new(outbound, &config.local_node, config.custom_dimensions.len()),
            custom_count: config.custom_dimensions.len(),
            http_stats: keep(&HTTP_STATS),
            tcp_stats: keep(&TCP_STATS),
            tcp_report_policy: config.tcp_report_policy,
            peer_cache: PeerMetadataCache::new(config.max_peer_cache_size),
            metric_cache,
            properties,
            registry,
            evaluator,
        })
    }

    /// Emits all configured stats for one exchange/connection.
    ///
    /// Returns `false` only for TCP with peer metadata that has not
    /// arrived yet; the caller retries on a later callback. Every other
    /// outcome, including decidedly absent or malformed metadata, reports
    /// immediately with `"unknown"` peer fields.
    pub fn report(&mut self, info: &RequestInfo, is_tcp: bool) -> bool {
        self.do_report(info, is_tcp, false)
    }

    /// Like [`report`](Self::report) but never defers; used when the
    /// stream is going away and this is the last chance to account for it.
    pub fn force_report(&mut self, info: &RequestInfo, is_tcp: bool) {
        self.do_report(info, is_tcp, true);
    }

    fn do_report(&mut self, info: &RequestInfo, is_tcp: bool, force: bool) -> bool {
        let lookup =
            self.peer_cache.get_peer(self.properties.as_ref(), self.peer_id_path, self.peer_metadata_path);
        if is_tcp
            && !force
            && self.tcp_report_policy == TcpReportPolicy::WaitForPeer
            && matches!(lookup, PeerLookup::Pending)
        {
            return false;
        }
        let peer = lookup.node_or_unknown();
        self.dims.map_peer(peer);
        self.dims.map_request(info);
        for index in 0..self.custom_count {
            let value =
                self.evaluator.as_deref().and_then(|e| e.eval(index, info)).unwrap_or_default();
            self.dims.set_custom(index, value);
        }
        self.dims.fill_unknown();

        let generators = if is_tcp { &self.tcp_stats } else { &self.http_stats };
        self.metric_cache.report(&self.dims, info, generators, self.registry.as_mut());
        true
    }

    pub fn metric_cache_len(&self) -> usize {
        self.metric_cache.len()
    }

    pub fn peer_cache_len(&self) -> usize {
        self.peer_cache.len()
    }
}

/// Per-worker filter state: one engine, one TCP tracker, constructed at
/// configure time and torn down with the worker. There is no global
/// registry behind this; everything the callbacks touch lives here.
pub struct StatsFilter {
    engine: ReportEngine,
    tcp: TcpRequestTracker,
}

impl StatsFilter {
    pub fn try_new(
        config: &StatsConfig,
        properties: Box<dyn PropertyReader>,
        registry: Box<dyn MetricRegistry>,
        evaluator: Option<Box<dyn ExpressionEvaluator>>,
    ) -> crate::Result<Self> {
        let engine = ReportEngine::try_new(config, properties, registry, evaluator)?;
        Ok(StatsFilter { engine, tcp: TcpRequestTracker::new() })
    }

    /// Fail-closed constructor for the configure path: an invalid
    /// configuration logs a warning and yields no filter, so reporting
    /// simply does not activate for this configuration generation.
    pub fn new_or_inactive(
        config: &StatsConfig,
        properties: Box<dyn PropertyReader>,
        registry: Box<dyn MetricRegistry>,
        evaluator: Option<Box<dyn ExpressionEvaluator>>,
    ) -> Option<Self> {
        match Self::try_new(config, properties, registry, evaluator) {
            Ok(filter) => Some(filter),
            Err(e) => {
                warn!("stats filter not activated: {e}");
                None
            },
        }
    }

    pub fn engine(&self) -> &ReportEngine {
        &self.engine
    }

    /// Terminal HTTP callback. There is exactly one per exchange, so this
    /// never defers on missing peer metadata.
    pub fn on_http_log(&mut self, info: &mut RequestInfo) {
        if info.duration.is_zero() {
            info.finish();
        }
        self.engine.report(info, false);
    }

    pub fn on_new_connection(&mut self, connection_id: u64) {
        self.tcp.add(connection_id);
    }

    pub fn on_downstream_data(&mut self, connection_id: u64, size: u64) {
        let engine = &mut self.engine;
        self.tcp.on_downstream_data(connection_id, size, &mut |info| engine.report(info, true));
    }

    pub fn on_upstream_data(&mut self, connection_id: u64, size: u64) {
        let engine = &mut self.engine;
        self.tcp.on_upstream_data(connection_id, size, &mut |info| engine.report(info, true));
    }

    pub fn on_downstream_close(&mut self, connection_id: u64) {
        let engine = &mut self.engine;
        self.tcp.on_downstream_close(connection_id, &mut |info| engine.report(info, true));
    }

    pub fn on_upstream_close(&mut self, connection_id: u64) {
        let engine = &mut self.engine;
        self.tcp.on_upstream_close(connection_id, &mut |info| engine.report(info, true));
    }

    /// Host teardown of the connection record; the last chance to report.
    pub fn remove_connection(&mut self, connection_id: u64) {
        let engine = &mut self.engine;
        self.tcp.remove(connection_id, &mut |info| engine.force_report(info, true));
    }

    pub fn tracked_connections(&self) -> usize {
        self.tcp.len()
    }
}
