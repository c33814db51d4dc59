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

//! Per-stream accumulator read once at report time.
//!
//! One `RequestInfo` lives for the duration of a single HTTP exchange or a
//! single TCP connection. The stream callbacks mutate it in place; the
//! report path only reads it.

use std::time::{Duration, SystemTime};

use compact_str::CompactString;
use http::StatusCode;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RequestProtocol {
    Http,
    Grpc,
    Tcp,
}

impl RequestProtocol {
    pub fn as_str(self) -> &'static str {
        match self {
            RequestProtocol::Http => "http",
            RequestProtocol::Grpc => "grpc",
            RequestProtocol::Tcp => "tcp",
        }
    }
}

#[derive(Debug, Clone)]
pub struct RequestInfo {
    pub start_time: SystemTime,
    pub duration: Duration,
    pub request_protocol: RequestProtocol,

    pub response_code: Option<StatusCode>,
    pub grpc_status: Option<i32>,
    pub response_flags: CompactString,

    pub destination_service: CompactString,
    pub destination_port: u16,
    pub source_principal: CompactString,
    pub destination_principal: CompactString,
    /// Downstream connection used mTLS. Only meaningful on the inbound
    /// side, where this proxy terminated the connection.
    pub mutual_tls: bool,

    pub request_bytes: u64,
    pub response_bytes: u64,

    // TCP lifetime counters; monotonic, never reset mid-connection.
    pub tcp_received_bytes: u64,
    pub tcp_sent_bytes: u64,
    pub tcp_connections_opened: u64,
    pub tcp_connections_closed: u64,
}

impl RequestInfo {
    fn new(protocol: RequestProtocol) -> Self {
        RequestInfo {
            start_time: SystemTime::now(),
            duration: Duration::ZERO,
            request_protocol: protocol,
            response_code: None,
            grpc_status: None,
            response_flags: CompactString::default(),
            destination_service: CompactString::default(),
            destination_port: 0,
            source_principal: CompactString::default(),
            destination_principal: CompactString::default(),
            mutual_tls: false,
            request_bytes: 0,
            response_bytes: 0,
            tcp_received_bytes: 0,
            tcp_sent_bytes: 0,
            tcp_connections_opened: 0,
            tcp_connections_closed: 0,
        }
    }

    pub fn new_http() -> Self {
        Self::new(RequestProtocol::Http)
    }

    pub fn new_tcp() -> Self {
        let mut info = Self::new(RequestProtocol::Tcp);
        info.tcp_connections_opened = 1;
        info
    }

    pub fn duration_millis(&self) -> u64 {
        u64::try_from(self.duration.as_millis()).unwrap_or(u64::MAX)
    }

    /// Stamps the duration from the recorded start time. Called once, just
    /// before the terminal report.
    pub fn finish(&mut self) {
        self.duration = SystemTime::now().duration_since(self.start_time).unwrap_or(Duration::ZERO);
    }
}
