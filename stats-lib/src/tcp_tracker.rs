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

//! TCP connection lifecycle correlation.
//!
//! A TCP connection produces several independent host callbacks (new
//! connection, data in both directions, one close per side). This tracker
//! folds them into exactly one terminal report, emitted only once both
//! sides have closed, whichever side closes first. Reporting itself is the
//! engine's job; the tracker drives it through a callback so the two stay
//! decoupled.
//!
//! A report attempt may legitimately be deferred (peer metadata not yet
//! arrived); the connection then stays in the table with a pending flag
//! and the next callback retries. Removal force-reports anything still
//! unreported so an abruptly torn down connection cannot vanish without a
//! metric.

use rustc_hash::FxHashMap as HashMap;
use tracing::debug;

use crate::request_info::RequestInfo;

#[derive(Debug)]
struct TrackedConnection {
    info: RequestInfo,
    downstream_closed: bool,
    upstream_closed: bool,
    reported: bool,
    report_pending: bool,
}

impl TrackedConnection {
    fn new() -> Self {
        TrackedConnection {
            info: RequestInfo::new_tcp(),
            downstream_closed: false,
            upstream_closed: false,
            reported: false,
            report_pending: false,
        }
    }

    /// Attempts the terminal report if the connection has fully closed.
    /// The `reported` guard makes this exactly-once under any ordering of
    /// close callbacks and retries.
    fn try_terminal<F>(&mut self, report: &mut F)
    where
        F: FnMut(&mut RequestInfo) -> bool,
    {
        if self.reported || !self.downstream_closed || !self.upstream_closed {
            return;
        }
        self.info.finish();
        self.info.tcp_connections_closed = 1;
        if report(&mut self.info) {
            self.reported = true;
            self.report_pending = false;
        } else {
            self.report_pending = true;
        }
    }
}

#[derive(Debug, Default)]
pub struct TcpRequestTracker {
    table: HashMap<u64, TrackedConnection>,
}

impl TcpRequestTracker {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.table.len()
    }

    pub fn is_empty(&self) -> bool {
        self.table.is_empty()
    }

    pub fn add(&mut self, connection_id: u64) {
        if self.table.insert(connection_id, TrackedConnection::new()).is_some() {
            debug!("connection {connection_id} was already tracked, restarting its record");
        }
    }

    /// Bytes flowing from the downstream peer. Counters only ever grow for
    /// the lifetime of the connection.
    pub fn on_downstream_data<F>(&mut self, connection_id: u64, size: u64, report: &mut F)
    where
        F: FnMut(&mut RequestInfo) -> bool,
    {
        if let Some(tracked) = self.table.get_mut(&connection_id) {
            tracked.info.tcp_received_bytes += size;
            if tracked.report_pending {
                tracked.try_terminal(report);
            }
        }
    }

    /// Bytes flowing towards the downstream peer.
    pub fn on_upstream_data<F>(&mut self, connection_id: u64, size: u64, report: &mut F)
    where
        F: FnMut(&mut RequestInfo) -> bool,
    {
        if let Some(tracked) = self.table.get_mut(&connection_id) {
            tracked.info.tcp_sent_bytes += size;
            if tracked.report_pending {
                tracked.try_terminal(report);
            }
        }
    }

    pub fn on_downstream_close<F>(&mut self, connection_id: u64, report: &mut F)
    where
        F: FnMut(&mut RequestInfo) -> bool,
    {
        if let Some(tracked) = self.table.get_mut(&connection_id) {
            tracked.downstream_closed = true;
            tracked.try_terminal(report);
        }
    }

    pub fn on_upstream_close<F>(&mut self, connection_id: u64, report: &mut F)
    where
        F: FnMut(&mut RequestInfo) -> bool,
    {
        if let Some(tracked) = self.table.get_mut(&connection_id) {
            tracked.upstream_closed = true;
            tracked.try_terminal(report);
        }
    }

    /// Drops the record. A connection that never managed its terminal
    /// report (deferred peer, abrupt teardown) is force-reported with
    /// best-effort values first; `force_report` must not defer.
    pub fn remove<F>(&mut self, connection_id: u64, force_report: &mut F)
    where
        F: FnMut(&mut RequestInfo),
    {
        if let Some(mut tracked) = self.table.remove(&connection_id) {
            if !tracked.reported {
                tracked.info.finish();
                tracked.info.tcp_connections_closed = 1;
                force_report(&mut tracked.info);
            }
        }
    }
}
