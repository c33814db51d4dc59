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

//! Seams to the embedding proxy host.
//!
//! The engine never talks to the host ABI directly; it goes through these
//! traits so the host glue stays outside this crate. All calls are
//! synchronous intrinsics: a failed lookup is permanent for the current
//! callback, not transient, and is answered with the "unknown" fallback by
//! the callers.

use std::cell::RefCell;
use std::rc::Rc;

use compact_str::CompactString;
use rustc_hash::FxHashMap as HashMap;

use crate::request_info::RequestInfo;

pub type MetricId = u32;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MetricKind {
    Counter,
    Gauge,
    Histogram,
}

/// Read access to host-published stream/node properties, addressed by
/// dotted path segments.
pub trait PropertyReader {
    fn get_property(&self, path: &[&str]) -> Option<Vec<u8>>;
}

/// The host metric namespace. Defining the same name twice must yield the
/// same id; the engine relies on that only for its own hit/miss counters.
pub trait MetricRegistry {
    fn define_metric(
        &mut self,
        kind: MetricKind,
        name: &str,
        tags: &[(CompactString, CompactString)],
    ) -> MetricId;
    fn record_metric(&mut self, id: MetricId, value: u64);
    fn increment_metric(&mut self, id: MetricId, offset: i64);
}

/// Foreign expression evaluator for configured custom dimensions. The
/// expressions were compiled elsewhere; the engine addresses them by their
/// index in the configured dimension list. `None` means the expression did
/// not produce a value for this stream.
pub trait ExpressionEvaluator {
    fn eval(&self, index: usize, info: &RequestInfo) -> Option<CompactString>;
}

/// In-memory host used by the test suites and by embedders running the
/// engine outside a real proxy.
#[derive(Debug, Default)]
pub struct MemoryHost {
    properties: HashMap<CompactString, Vec<u8>>,
    names: HashMap<CompactString, MetricId>,
    metrics: Vec<MetricState>,
}

#[derive(Debug)]
struct MetricState {
    kind: MetricKind,
    name: CompactString,
    tags: Vec<(CompactString, CompactString)>,
    value: i64,
    recorded: Vec<u64>,
}

impl MemoryHost {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_property(&mut self, path: &[&str], value: impl Into<Vec<u8>>) {
        self.properties.insert(Self::join(path), value.into());
    }

    pub fn clear_property(&mut self, path: &[&str]) {
        self.properties.remove(&Self::join(path));
    }

    fn join(path: &[&str]) -> CompactString {
        let mut key = CompactString::default();
        for (i, segment) in path.iter().enumerate() {
            if i > 0 {
                key.push('.');
            }
            key.push_str(segment);
        }
        key
    }

    pub fn defined_metrics(&self) -> usize {
        self.metrics.len()
    }

    /// Current counter value of the first metric whose name starts with
    /// `prefix`, or `None` if no such metric was defined.
    pub fn counter_value(&self, prefix: &str) -> Option<i64> {
        self.metrics.iter().find(|m| m.name.starts_with(prefix)).map(|m| m.value)
    }

    pub fn recorded_values(&self, prefix: &str) -> &[u64] {
        self.metrics.iter().find(|m| m.name.starts_with(prefix)).map_or(&[], |m| &m.recorded)
    }

    pub fn metric_tags(&self, prefix: &str) -> Option<&[(CompactString, CompactString)]> {
        self.metrics.iter().find(|m| m.name.starts_with(prefix)).map(|m| m.tags.as_slice())
    }

    pub fn metric_kind(&self, prefix: &str) -> Option<MetricKind> {
        self.metrics.iter().find(|m| m.name.starts_with(prefix)).map(|m| m.kind)
    }
}

impl PropertyReader for MemoryHost {
    fn get_property(&self, path: &[&str]) -> Option<Vec<u8>> {
        self.properties.get(&Self::join(path)).cloned()
    }
}

impl MetricRegistry for MemoryHost {
    fn define_metric(
        &mut self,
        kind: MetricKind,
        name: &str,
        tags: &[(CompactString, CompactString)],
    ) -> MetricId {
        if let Some(id) = self.names.get(name) {
            return *id;
        }
        let id = u32::try_from(self.metrics.len()).unwrap_or(u32::MAX);
        self.metrics.push(MetricState {
            kind,
            name: CompactString::from(name),
            tags: tags.to_vec(),
            value: 0,
            recorded: Vec::new(),
        });
        self.names.insert(CompactString::from(name), id);
        id
    }

    fn record_metric(&mut self, id: MetricId, value: u64) {
        if let Some(metric) = self.metrics.get_mut(id as usize) {
            metric.recorded.push(value);
        }
    }

    fn increment_metric(&mut self, id: MetricId, offset: i64) {
        if let Some(metric) = self.metrics.get_mut(id as usize) {
            metric.value += offset;
        }
    }
}

/// Clonable handle over a [`MemoryHost`] so one in-memory host can back
/// both the property seam and the metric seam of an engine. `Rc<RefCell>`
/// matches the engine's single-owner-per-worker model; nothing here is
/// sent across threads.
#[derive(Debug, Clone, Default)]
pub struct SharedMemoryHost(Rc<RefCell<MemoryHost>>);

impl SharedMemoryHost {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_property(&self, path: &[&str], value: impl Into<Vec<u8>>) {
        self.0.borrow_mut().set_property(path, value);
    }

    pub fn clear_property(&self, path: &[&str]) {
        self.0.borrow_mut().clear_property(path);
    }

    pub fn defined_metrics(&self) -> usize {
        self.0.borrow().defined_metrics()
    }

    pub fn counter_value(&self, prefix: &str) -> Option<i64> {
        self.0.borrow().counter_value(prefix)
    }

    pub fn recorded_values(&self, prefix: &str) -> Vec<u64> {
        self.0.borrow().recorded_values(prefix).to_vec()
    }

    pub fn metric_tags(&self, prefix: &str) -> Option<Vec<(CompactString, CompactString)>> {
        self.0.borrow().metric_tags(prefix).map(<[_]>::to_vec)
    }

    pub fn metric_kind(&self, prefix: &str) -> Option<MetricKind> {
        self.0.borrow().metric_kind(prefix)
    }
}

impl PropertyReader for SharedMemoryHost {
    fn get_property(&self, path: &[&str]) -> Option<Vec<u8>> {
        self.0.borrow().get_property(path)
    }
}

impl MetricRegistry for SharedMemoryHost {
    fn define_metric(
        &mut self,
        kind: MetricKind,
        name: &str,
        tags: &[(CompactString, CompactString)],
    ) -> MetricId {
        self.0.borrow_mut().define_metric(kind, name, tags)
    }

    fn record_metric(&mut self, id: MetricId, value: u64) {
        self.0.borrow_mut().record_metric(id, value);
    }

    fn increment_metric(&mut self, id: MetricId, offset: i64) {
        self.0.borrow_mut().increment_metric(id, offset);
    }
}
