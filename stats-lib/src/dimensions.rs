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

//! The direction-aware composite dimension key.
//!
//! One [`Dimensions`] instance lives for the whole worker. Local-side
//! identity is fixed at configure time; peer and per-request fields are
//! overwritten in place on every report, and the struct is only cloned
//! into the metric cache on a miss.
//!
//! Equality and hashing are asymmetric on purpose: the local side of the
//! exchange is constant for this worker, so only the peer-varying side
//! participates (destination fields when outbound, source fields when
//! inbound). Folding the constant side in would not change the key space
//! and would only cost cycles per lookup.

use std::hash::{Hash, Hasher};

use compact_str::CompactString;
use stats_configuration::LocalNode;

use crate::peer::Node;
use crate::request_info::RequestInfo;

pub const UNKNOWN_VALUE: &str = "unknown";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(usize)]
pub enum Field {
    Reporter = 0,
    SourceWorkload,
    SourceWorkloadNamespace,
    SourcePrincipal,
    SourceApp,
    SourceVersion,
    SourceCanonicalService,
    SourceCanonicalRevision,
    DestinationWorkload,
    DestinationWorkloadNamespace,
    DestinationPrincipal,
    DestinationApp,
    DestinationVersion,
    DestinationCanonicalService,
    DestinationCanonicalRevision,
    DestinationService,
    DestinationPort,
    RequestProtocol,
    ResponseCode,
    GrpcResponseStatus,
    ResponseFlags,
    ConnectionSecurityPolicy,
}

pub const FIELD_COUNT: usize = Field::ConnectionSecurityPolicy as usize + 1;

/// Which traffic direction makes a field vary per peer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Relevance {
    /// Varies per request in both directions.
    Shared,
    /// Peer identity when inbound, local identity when outbound.
    Source,
    /// Peer identity when outbound, local identity when inbound.
    Destination,
}

impl Relevance {
    pub fn applies(self, outbound: bool) -> bool {
        match self {
            Relevance::Shared => true,
            Relevance::Source => !outbound,
            Relevance::Destination => outbound,
        }
    }
}

pub struct FieldSpec {
    pub field: Field,
    pub name: &'static str,
    pub relevance: Relevance,
}

/// Every exported dimension, in export order. Hashing, equality, and
/// label export all walk this table; there is no other field list.
pub static FIELD_TABLE: [FieldSpec; FIELD_COUNT] = [
    FieldSpec { field: Field::Reporter, name: "reporter", relevance: Relevance::Shared },
    FieldSpec { field: Field::SourceWorkload, name: "source_workload", relevance: Relevance::Source },
    FieldSpec {
        field: Field::SourceWorkloadNamespace,
        name: "source_workload_namespace",
        relevance: Relevance::Source,
    },
    FieldSpec { field: Field::SourcePrincipal, name: "source_principal", relevance: Relevance::Source },
    FieldSpec { field: Field::SourceApp, name: "source_app", relevance: Relevance::Source },
    FieldSpec { field: Field::SourceVersion, name: "source_version", relevance: Relevance::Source },
    FieldSpec {
        field: Field::SourceCanonicalService,
        name: "source_canonical_service",
        relevance: Relevance::Source,
    },
    FieldSpec {
        field: Field::SourceCanonicalRevision,
        name: "source_canonical_revision",
        relevance: Relevance::Source,
    },
    FieldSpec {
        field: Field::DestinationWorkload,
        name: "destination_workload",
        relevance: Relevance::Destination,
    },
    FieldSpec {
        field: Field::DestinationWorkloadNamespace,
        name: "destination_workload_namespace",
        relevance: Relevance::Destination,
    },
    FieldSpec {
        field: Field::DestinationPrincipal,
        name: "destination_principal",
        relevance: Relevance::Destination,
    },
    FieldSpec { field: Field::DestinationApp, name: "destination_app", relevance: Relevance::Destination },
    FieldSpec {
        field: Field::DestinationVersion,
        name: "destination_version",
        relevance: Relevance::Destination,
    },
    FieldSpec {
        field: Field::DestinationCanonicalService,
        name: "destination_canonical_service",
        relevance: Relevance::Destination,
    },
    FieldSpec {
        field: Field::DestinationCanonicalRevision,
        name: "destination_canonical_revision",
        relevance: Relevance::Destination,
    },
    // Request-derived despite the name, so they key the cache in both
    // directions.
    FieldSpec { field: Field::DestinationService, name: "destination_service", relevance: Relevance::Shared },
    FieldSpec { field: Field::DestinationPort, name: "destination_port", relevance: Relevance::Shared },
    FieldSpec { field: Field::RequestProtocol, name: "request_protocol", relevance: Relevance::Shared },
    FieldSpec { field: Field::ResponseCode, name: "response_code", relevance: Relevance::Shared },
    FieldSpec { field: Field::GrpcResponseStatus, name: "grpc_response_status", relevance: Relevance::Shared },
    FieldSpec { field: Field::ResponseFlags, name: "response_flags", relevance: Relevance::Shared },
    FieldSpec {
        field: Field::ConnectionSecurityPolicy,
        name: "connection_security_policy",
        relevance: Relevance::Shared,
    },
];

#[derive(Debug, Clone)]
pub struct Dimensions {
    outbound: bool,
    fields: [CompactString; FIELD_COUNT],
    custom: Vec<CompactString>,
}

impl Dimensions {
    /// Fixes the reporter and the local side once. `custom_count` slots
    /// are reserved for expression-derived values.
    pub fn new(outbound: bool, local: &LocalNode, custom_count: usize) -> Self {
        let mut dims = Dimensions {
            outbound,
            fields: std::array::from_fn(|_| CompactString::default()),
            custom: vec![CompactString::default(); custom_count],
        };
        dims.set(Field::Reporter, if outbound { "source" } else { "destination" });
        if outbound {
            dims.set(Field::SourceWorkload, local.workload_name.as_str());
            dims.set(Field::SourceWorkloadNamespace, local.namespace.as_str());
            dims.set(Field::SourceApp, local.app.as_str());
            dims.set(Field::SourceVersion, local.version.as_str());
            dims.set(Field::SourceCanonicalService, local.canonical_service.as_str());
            dims.set(Field::SourceCanonicalRevision, local.canonical_revision.as_str());
        } else {
            dims.set(Field::DestinationWorkload, local.workload_name.as_str());
            dims.set(Field::DestinationWorkloadNamespace, local.namespace.as_str());
            dims.set(Field::DestinationApp, local.app.as_str());
            dims.set(Field::DestinationVersion, local.version.as_str());
            dims.set(Field::DestinationCanonicalService, local.canonical_service.as_str());
            dims.set(Field::DestinationCanonicalRevision, local.canonical_revision.as_str());
        }
        dims
    }

    pub fn outbound(&self) -> bool {
        self.outbound
    }

    pub fn set(&mut self, field: Field, value: impl Into<CompactString>) {
        self.fields[field as usize] = value.into();
    }

    pub fn get(&self, field: Field) -> &str {
        &self.fields[field as usize]
    }

    /// Fills the peer side of the key. Which side that is depends on the
    /// direction fixed at construction.
    pub fn map_peer(&mut self, peer: &Node) {
        if self.outbound {
            self.set(Field::DestinationWorkload, peer.workload_name.as_str());
            self.set(Field::DestinationWorkloadNamespace, peer.namespace.as_str());
            self.set(Field::DestinationApp, peer.app.as_str());
            self.set(Field::DestinationVersion, peer.version.as_str());
            self.set(Field::DestinationCanonicalService, peer.canonical_service.as_str());
            self.set(Field::DestinationCanonicalRevision, peer.canonical_revision.as_str());
        } else {
            self.set(Field::SourceWorkload, peer.workload_name.as_str());
            self.set(Field::SourceWorkloadNamespace, peer.namespace.as_str());
            self.set(Field::SourceApp, peer.app.as_str());
            self.set(Field::SourceVersion, peer.version.as_str());
            self.set(Field::SourceCanonicalService, peer.canonical_service.as_str());
            self.set(Field::SourceCanonicalRevision, peer.canonical_revision.as_str());
        }
    }

    /// Fills the per-request fields from the accumulator.
    pub fn map_request(&mut self, info: &RequestInfo) {
        let mut buffer = itoa::Buffer::new();

        self.set(Field::RequestProtocol, info.request_protocol.as_str());
        self.set(Field::DestinationService, info.destination_service.as_str());
        self.set(Field::SourcePrincipal, info.source_principal.as_str());
        self.set(Field::DestinationPrincipal, info.destination_principal.as_str());
        self.set(Field::ResponseFlags, info.response_flags.as_str());

        match info.response_code {
            Some(code) => self.set(Field::ResponseCode, buffer.format(code.as_u16())),
            None => self.set(Field::ResponseCode, ""),
        }
        match info.grpc_status {
            Some(status) => self.set(Field::GrpcResponseStatus, buffer.format(status)),
            None => self.set(Field::GrpcResponseStatus, ""),
        }
        if info.destination_port == 0 {
            self.set(Field::DestinationPort, "");
        } else {
            self.set(Field::DestinationPort, buffer.format(info.destination_port));
        }

        // Security posture is only known where this proxy terminated the
        // downstream connection.
        if self.outbound {
            self.set(Field::ConnectionSecurityPolicy, "");
        } else {
            self.set(Field::ConnectionSecurityPolicy, if info.mutual_tls { "mutual_tls" } else { "none" });
        }
    }

    pub fn set_custom(&mut self, index: usize, value: CompactString) {
        if let Some(slot) = self.custom.get_mut(index) {
            *slot = value;
        }
    }

    pub fn custom_values(&self) -> &[CompactString] {
        &self.custom
    }

    /// Replaces every still-empty field with the literal `"unknown"` so an
    /// absent value can never collide with a legitimately empty label at
    /// hash or export time.
    pub fn fill_unknown(&mut self) {
        for field in &mut self.fields {
            if field.is_empty() {
                *field = CompactString::const_new(UNKNOWN_VALUE);
            }
        }
        for value in &mut self.custom {
            if value.is_empty() {
                *value = CompactString::const_new(UNKNOWN_VALUE);
            }
        }
    }

    /// Built-in labels in export order.
    pub fn labels(&self) -> impl Iterator<Item = (&'static str, &str)> + '_ {
        FIELD_TABLE.iter().map(|spec| (spec.name, self.get(spec.field)))
    }
}

impl PartialEq for Dimensions {
    fn eq(&self, other: &Self) -> bool {
        if self.outbound != other.outbound || self.custom != other.custom {
            return false;
        }
        FIELD_TABLE.iter().all(|spec| {
            !spec.relevance.applies(self.outbound)
                || self.fields[spec.field as usize] == other.fields[spec.field as usize]
        })
    }
}

impl Eq for Dimensions {}

impl Hash for Dimensions {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.outbound.hash(state);
        for spec in &FIELD_TABLE {
            if spec.relevance.applies(self.outbound) {
                self.fields[spec.field as usize].hash(state);
            }
        }
        for value in &self.custom {
            value.hash(state);
        }
    }
}
