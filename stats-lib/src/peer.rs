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

//! Decoded peer identity and its per-worker cache.
//!
//! Peers announce themselves through a metadata-exchange side channel: the
//! host exposes a stable peer-id token and, separately, the raw metadata
//! blob for that token. Decoding the blob is the expensive part, so decoded
//! [`Node`]s are cached by token. The cache is owned by exactly one worker
//! and is never shared, hence no locking.

use std::sync::OnceLock;

use compact_str::CompactString;
use rustc_hash::FxHashMap as HashMap;
use serde::Deserialize;
use tracing::debug;

use crate::host::PropertyReader;

/// Host property holding the peer-id token of the downstream peer.
pub const DOWNSTREAM_PEER_ID: &[&str] = &["wasm", "downstream_peer_id"];
/// Host property holding the raw metadata blob of the downstream peer.
pub const DOWNSTREAM_PEER: &[&str] = &["wasm", "downstream_peer"];
pub const UPSTREAM_PEER_ID: &[&str] = &["wasm", "upstream_peer_id"];
pub const UPSTREAM_PEER: &[&str] = &["wasm", "upstream_peer"];

/// Sentinel token the metadata-exchange layer writes when it has decided
/// the peer will never supply metadata. Its presence means "decidedly
/// absent", as opposed to the property missing entirely ("not yet
/// arrived").
pub const PEER_NOT_FOUND_TOKEN: &str = "peer_unknown";

/// Identity labels of one endpoint of an exchange, decoded once per
/// distinct metadata blob. Empty fields are exported as `"unknown"` by the
/// dimension mapping, never as empty strings.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Node {
    pub workload_name: CompactString,
    pub namespace: CompactString,
    pub app: CompactString,
    pub version: CompactString,
    pub canonical_service: CompactString,
    pub canonical_revision: CompactString,
}

const LABEL_APP: &str = "app";
const LABEL_VERSION: &str = "version";
const LABEL_CANONICAL_NAME: &str = "service.istio.io/canonical-name";
const LABEL_CANONICAL_REVISION: &str = "service.istio.io/canonical-revision";

#[derive(Deserialize)]
struct RawPeer {
    #[serde(default, alias = "NAME")]
    name: CompactString,
    #[serde(default, alias = "NAMESPACE")]
    namespace: CompactString,
    #[serde(default, alias = "LABELS")]
    labels: HashMap<CompactString, CompactString>,
}

impl Node {
    /// Decodes a raw metadata blob (a JSON-encoded object as flattened by
    /// the host) into a `Node`.
    pub fn decode(blob: &[u8]) -> Result<Node, serde_json::Error> {
        let raw: RawPeer = serde_json::from_slice(blob)?;
        let app = raw.labels.get(LABEL_APP).cloned().unwrap_or_default();
        let version = raw.labels.get(LABEL_VERSION).cloned().unwrap_or_default();
        // Canonical identity falls back to the plain app/version labels
        // when the canonical labels were not stamped on the workload.
        let canonical_service =
            raw.labels.get(LABEL_CANONICAL_NAME).cloned().unwrap_or_else(|| app.clone());
        let canonical_revision =
            raw.labels.get(LABEL_CANONICAL_REVISION).cloned().unwrap_or_else(|| version.clone());
        Ok(Node {
            workload_name: raw.name,
            namespace: raw.namespace,
            app,
            version,
            canonical_service,
            canonical_revision,
        })
    }
}

/// The shared all-empty `Node` used whenever peer identity cannot be
/// resolved.
pub fn unknown_node() -> &'static Node {
    static UNKNOWN: OnceLock<Node> = OnceLock::new();
    UNKNOWN.get_or_init(Node::default)
}

/// Outcome of a peer lookup.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PeerLookup<'a> {
    /// Metadata arrived and decoded (possibly to the unknown fallback if
    /// it was malformed).
    Known(&'a Node),
    /// The metadata-exchange layer declared the peer metadata absent.
    Unknown(&'a Node),
    /// Nothing has arrived yet; the caller may retry on a later callback.
    Pending,
}

impl<'a> PeerLookup<'a> {
    /// The node to report with when deferral is not an option.
    pub fn node_or_unknown(self) -> &'a Node {
        match self {
            PeerLookup::Known(node) | PeerLookup::Unknown(node) => node,
            PeerLookup::Pending => unknown_node(),
        }
    }
}

/// Bounded cache of decoded peers, keyed by the raw peer-id token.
///
/// Eviction is deliberately coarse: once an insertion would exceed
/// `max_size`, a quarter of the entries is dropped in one bulk pass, in
/// map iteration order. That is an approximation of recency, not LRU, and
/// keeps the per-insert cost amortized O(1).
#[derive(Debug)]
pub struct PeerMetadataCache {
    nodes: HashMap<CompactString, Node>,
    max_size: usize,
}

impl PeerMetadataCache {
    /// `max_size` below 4 is clamped up: the quarter-eviction pass must
    /// remove at least one entry or the bound cannot hold.
    pub fn new(max_size: usize) -> Self {
        PeerMetadataCache { nodes: HashMap::default(), max_size: max_size.max(4) }
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    /// Resolves the peer behind `id_path`/`metadata_path`.
    ///
    /// Malformed metadata is never an error: it decodes to the unknown
    /// node, which is cached under the token like any other entry so the
    /// blob is not re-parsed on every request.
    pub fn get_peer(
        &mut self,
        props: &dyn PropertyReader,
        id_path: &[&str],
        metadata_path: &[&str],
    ) -> PeerLookup<'_> {
        let Some(raw_id) = props.get_property(id_path) else {
            return PeerLookup::Pending;
        };
        let id = CompactString::from(String::from_utf8_lossy(&raw_id).as_ref());
        if id == PEER_NOT_FOUND_TOKEN {
            return PeerLookup::Unknown(unknown_node());
        }

        if !self.nodes.contains_key(id.as_str()) {
            let node = match props.get_property(metadata_path) {
                Some(blob) => Node::decode(&blob).unwrap_or_else(|e| {
                    debug!("malformed peer metadata for id {id}: {e}");
                    Node::default()
                }),
                None => {
                    debug!("peer id {id} present but metadata missing");
                    Node::default()
                },
            };
            if self.nodes.len() >= self.max_size {
                self.evict_quarter();
            }
            self.nodes.insert(id.clone(), node);
        }

        match self.nodes.get(id.as_str()) {
            Some(node) => PeerLookup::Known(node),
            None => PeerLookup::Unknown(unknown_node()),
        }
    }

    fn evict_quarter(&mut self) {
        let count = self.max_size / 4;
        let victims: Vec<CompactString> = self.nodes.keys().take(count).cloned().collect();
        for key in &victims {
            self.nodes.remove(key);
        }
        debug!("peer cache full, evicted {} of {} entries", victims.len(), self.max_size);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::host::MemoryHost;
    use tracing_test::traced_test;

    fn peer_blob(name: &str, namespace: &str, app: &str, version: &str) -> Vec<u8> {
        format!(
            r#"{{"NAME":"{name}","NAMESPACE":"{namespace}","LABELS":{{"app":"{app}","version":"{version}"}}}}"#
        )
        .into_bytes()
    }

    #[test]
    fn test_decode_with_canonical_fallback() {
        let node = Node::decode(&peer_blob("svc-b-v1-abc", "shop", "svc-b", "v1")).unwrap();
        assert_eq!(node.workload_name, "svc-b-v1-abc");
        assert_eq!(node.namespace, "shop");
        assert_eq!(node.canonical_service, "svc-b");
        assert_eq!(node.canonical_revision, "v1");
    }

    #[test]
    fn test_decode_prefers_canonical_labels() {
        let blob = br#"{"NAME":"w","NAMESPACE":"ns","LABELS":{"app":"a","service.istio.io/canonical-name":"storefront","service.istio.io/canonical-revision":"stable"}}"#;
        let node = Node::decode(blob).unwrap();
        assert_eq!(node.canonical_service, "storefront");
        assert_eq!(node.canonical_revision, "stable");
    }

    #[test]
    fn test_pending_when_id_absent() {
        let host = MemoryHost::new();
        let mut cache = PeerMetadataCache::new(8);
        let lookup = cache.get_peer(&host, UPSTREAM_PEER_ID, UPSTREAM_PEER);
        assert_eq!(lookup, PeerLookup::Pending);
        assert!(cache.is_empty());
    }

    #[test]
    fn test_unknown_when_sentinel_token_present() {
        let mut host = MemoryHost::new();
        host.set_property(UPSTREAM_PEER_ID, PEER_NOT_FOUND_TOKEN.as_bytes().to_vec());
        let mut cache = PeerMetadataCache::new(8);
        let lookup = cache.get_peer(&host, UPSTREAM_PEER_ID, UPSTREAM_PEER);
        assert_eq!(lookup, PeerLookup::Unknown(unknown_node()));
        assert!(cache.is_empty());
    }

    #[test]
    fn test_hit_skips_decode() {
        let mut host = MemoryHost::new();
        host.set_property(UPSTREAM_PEER_ID, b"peer-1".to_vec());
        host.set_property(UPSTREAM_PEER, peer_blob("w", "ns", "a", "v1"));
        let mut cache = PeerMetadataCache::new(8);

        assert!(matches!(cache.get_peer(&host, UPSTREAM_PEER_ID, UPSTREAM_PEER), PeerLookup::Known(_)));
        assert_eq!(cache.len(), 1);

        // Corrupt the blob; the cached entry must still answer.
        host.set_property(UPSTREAM_PEER, b"not json".to_vec());
        match cache.get_peer(&host, UPSTREAM_PEER_ID, UPSTREAM_PEER) {
            PeerLookup::Known(node) => assert_eq!(node.workload_name, "w"),
            other => panic!("expected cache hit, got {other:?}"),
        }
        assert_eq!(cache.len(), 1);
    }

    #[traced_test]
    #[test]
    fn test_malformed_blob_decodes_to_unknown_and_logs_debug() {
        let mut host = MemoryHost::new();
        host.set_property(DOWNSTREAM_PEER_ID, b"peer-bad".to_vec());
        host.set_property(DOWNSTREAM_PEER, b"{broken".to_vec());
        let mut cache = PeerMetadataCache::new(8);

        match cache.get_peer(&host, DOWNSTREAM_PEER_ID, DOWNSTREAM_PEER) {
            PeerLookup::Known(node) => assert_eq!(node, unknown_node()),
            other => panic!("expected decoded unknown node, got {other:?}"),
        }
        assert!(logs_contain("malformed peer metadata"));
    }

    #[test]
    fn test_tiny_bound_is_clamped_and_still_evicts() {
        let mut host = MemoryHost::new();
        let mut cache = PeerMetadataCache::new(0);

        for i in 0..20 {
            let id = format!("peer-{i}");
            host.set_property(UPSTREAM_PEER_ID, id.into_bytes());
            host.set_property(UPSTREAM_PEER, peer_blob("w", "ns", "a", "v1"));
            cache.get_peer(&host, UPSTREAM_PEER_ID, UPSTREAM_PEER);
            assert!(cache.len() <= 4);
        }
    }

    #[test]
    fn test_bulk_eviction_keeps_cache_bounded() {
        let mut host = MemoryHost::new();
        let mut cache = PeerMetadataCache::new(8);

        for i in 0..8 {
            let id = format!("peer-{i}");
            host.set_property(UPSTREAM_PEER_ID, id.into_bytes());
            host.set_property(UPSTREAM_PEER, peer_blob("w", "ns", "a", "v1"));
            cache.get_peer(&host, UPSTREAM_PEER_ID, UPSTREAM_PEER);
        }
        assert_eq!(cache.len(), 8);

        // The ninth insertion triggers one bulk pass of max_size / 4.
        host.set_property(UPSTREAM_PEER_ID, b"peer-8".to_vec());
        cache.get_peer(&host, UPSTREAM_PEER_ID, UPSTREAM_PEER);
        assert_eq!(cache.len(), 8 - 2 + 1);
    }
}
