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

//! Pre-resolved metric handles keyed by the dimension set.
//!
//! The cache trades memory for hot-path cost: a hit records every stat of
//! the entry through stored metric ids with no string construction at all.
//! Entries are never evicted. Cardinality is bounded by the number of
//! distinct dimension combinations actually observed, which the deployment
//! model keeps low; that assumption is deliberate and documented rather
//! than defended with an eviction policy.

use compact_str::CompactString;
use rustc_hash::FxHashMap as HashMap;

use crate::dimensions::Dimensions;
use crate::host::{MetricId, MetricKind, MetricRegistry};
use crate::request_info::RequestInfo;

/// Self-instrumentation is flushed to the host in batches to keep the
/// per-request overhead at a local integer increment.
const FLUSH_BATCH: u32 = 100;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StatOp {
    /// Counter-style: add the extracted value.
    Increment,
    /// Histogram-style: record the extracted value as a sample.
    Record,
}

/// A configured stat to emit per report.
#[derive(Clone, Copy)]
pub struct StatGenerator {
    pub name: &'static str,
    pub kind: MetricKind,
    pub op: StatOp,
    pub extract: fn(&RequestInfo) -> u64,
}

/// An immutable (metric id, extractor) pair, resolved once per distinct
/// dimension set.
#[derive(Debug, Clone, Copy)]
pub struct SimpleStat {
    id: MetricId,
    op: StatOp,
    extract: fn(&RequestInfo) -> u64,
}

impl SimpleStat {
    fn record(&self, info: &RequestInfo, registry: &mut dyn MetricRegistry) {
        let value = (self.extract)(info);
        match self.op {
            StatOp::Increment => registry.increment_metric(self.id, i64::try_from(value).unwrap_or(i64::MAX)),
            StatOp::Record => registry.record_metric(self.id, value),
        }
    }
}

pub static HTTP_STATS: [StatGenerator; 4] = [
    StatGenerator { name: "requests_total", kind: MetricKind::Counter, op: StatOp::Increment, extract: |_| 1 },
    StatGenerator {
        name: "request_duration_milliseconds",
        kind: MetricKind::Histogram,
        op: StatOp::Record,
        extract: RequestInfo::duration_millis,
    },
    StatGenerator {
        name: "request_bytes",
        kind: MetricKind::Histogram,
        op: StatOp::Record,
        extract: |info| info.request_bytes,
    },
    StatGenerator {
        name: "response_bytes",
        kind: MetricKind::Histogram,
        op: StatOp::Record,
        extract: |info| info.response_bytes,
    },
];

pub static TCP_STATS: [StatGenerator; 4] = [
    StatGenerator {
        name: "tcp_sent_bytes_total",
        kind: MetricKind::Counter,
        op: StatOp::Increment,
        extract: |info| info.tcp_sent_bytes,
    },
    StatGenerator {
        name: "tcp_received_bytes_total",
        kind: MetricKind::Counter,
        op: StatOp::Increment,
        extract: |info| info.tcp_received_bytes,
    },
    StatGenerator {
        name: "tcp_connections_opened_total",
        kind: MetricKind::Counter,
        op: StatOp::Increment,
        extract: |info| info.tcp_connections_opened,
    },
    StatGenerator {
        name: "tcp_connections_closed_total",
        kind: MetricKind::Counter,
        op: StatOp::Increment,
        extract: |info| info.tcp_connections_closed,
    },
];

pub struct MetricSetCache {
    stat_prefix: CompactString,
    field_separator: CompactString,
    value_separator: CompactString,
    custom_names: Vec<CompactString>,
    entries: HashMap<Dimensions, Vec<SimpleStat>>,
    hits: u32,
    misses: u32,
    cache_hits_id: MetricId,
    cache_misses_id: MetricId,
}

impl MetricSetCache {
    pub fn new(
        stat_prefix: &str,
        field_separator: &str,
        value_separator: &str,
        custom_names: Vec<CompactString>,
        registry: &mut dyn MetricRegistry,
    ) -> Self {
        let mut hits_name = CompactString::from(stat_prefix);
        hits_name.push_str("_metric_cache_hits_total");
        let mut misses_name = CompactString::from(stat_prefix);
        misses_name.push_str("_metric_cache_misses_total");
        let cache_hits_id = registry.define_metric(MetricKind::Counter, &hits_name, &[]);
        let cache_misses_id = registry.define_metric(MetricKind::Counter, &misses_name, &[]);
        MetricSetCache {
            stat_prefix: CompactString::from(stat_prefix),
            field_separator: CompactString::from(field_separator),
            value_separator: CompactString::from(value_separator),
            custom_names,
            entries: HashMap::default(),
            hits: 0,
            misses: 0,
            cache_hits_id,
            cache_misses_id,
        }
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Records every configured stat for `dims`. Returns `true` on a cache
    /// hit. A miss resolves the ordered dimension values, defines one host
    /// metric per generator, and records the initial values.
    pub fn report(
        &mut self,
        dims: &Dimensions,
        info: &RequestInfo,
        generators: &[StatGenerator],
        registry: &mut dyn MetricRegistry,
    ) -> bool {
        if let Some(stats) = self.entries.get(dims) {
            for stat in stats {
                stat.record(info, registry);
            }
            self.hits += 1;
            self.maybe_flush(registry);
            return true;
        }

        let tags = self.resolve_tags(dims);
        let mut stats = Vec::with_capacity(generators.len());
        for generator in generators {
            let name = self.flatten_name(generator.name, &tags);
            let id = registry.define_metric(generator.kind, &name, &tags);
            let stat = SimpleStat { id, op: generator.op, extract: generator.extract };
            stat.record(info, registry);
            stats.push(stat);
        }
        self.entries.insert(dims.clone(), stats);
        self.misses += 1;
        self.maybe_flush(registry);
        false
    }

    /// Ordered (label, value) list: built-in fields in table order, then
    /// the configured custom dimensions.
    fn resolve_tags(&self, dims: &Dimensions) -> Vec<(CompactString, CompactString)> {
        let mut tags: Vec<(CompactString, CompactString)> =
            Vec::with_capacity(crate::dimensions::FIELD_COUNT + self.custom_names.len());
        for (name, value) in dims.labels() {
            tags.push((CompactString::const_new(name), CompactString::from(value)));
        }
        for (name, value) in self.custom_names.iter().zip(dims.custom_values()) {
            tags.push((name.clone(), value.clone()));
        }
        tags
    }

    /// Flattened metric identity for hosts with a string-only metric
    /// namespace: `prefix_name<fs>label<vs>value<fs>...`.
    fn flatten_name(&self, stat_name: &str, tags: &[(CompactString, CompactString)]) -> String {
        let mut name = String::with_capacity(64 + tags.len() * 24);
        name.push_str(&self.stat_prefix);
        name.push('_');
        name.push_str(stat_name);
        for (label, value) in tags {
            name.push_str(&self.field_separator);
            name.push_str(label);
            name.push_str(&self.value_separator);
            name.push_str(value);
        }
        name
    }

    fn maybe_flush(&mut self, registry: &mut dyn MetricRegistry) {
        if self.hits >= FLUSH_BATCH {
            registry.increment_metric(self.cache_hits_id, i64::from(self.hits));
            self.hits = 0;
        }
        if self.misses >= FLUSH_BATCH {
            registry.increment_metric(self.cache_misses_id, i64::from(self.misses));
            self.misses = 0;
        }
    }
}
