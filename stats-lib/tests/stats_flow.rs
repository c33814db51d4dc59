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

//! End-to-end flows through a configured filter: configuration parsing,
//! peer resolution, dimension mapping, metric-set caching, and the TCP
//! close correlation, all against the in-memory host.

use http::StatusCode;
use stats_lib::host::SharedMemoryHost;
use stats_lib::peer::{DOWNSTREAM_PEER, DOWNSTREAM_PEER_ID, UPSTREAM_PEER, UPSTREAM_PEER_ID};
use stats_lib::{RequestInfo, StatsConfig, StatsFilter};

fn filter_from_yaml(yaml: &str) -> (StatsFilter, SharedMemoryHost) {
    let config = StatsConfig::from_yaml(yaml).unwrap();
    let host = SharedMemoryHost::new();
    let filter =
        StatsFilter::try_new(&config, Box::new(host.clone()), Box::new(host.clone()), None).unwrap();
    (filter, host)
}

fn peer_blob(workload: &str, namespace: &str) -> Vec<u8> {
    format!(
        r#"{{"NAME":"{workload}","NAMESPACE":"{namespace}","LABELS":{{"app":"{workload}","version":"v1"}}}}"#
    )
    .into_bytes()
}

#[test]
fn inbound_http_exchange_reports_with_mtls_policy() {
    let (mut filter, host) = filter_from_yaml(
        r#"
direction: INBOUND
local_node:
  workload_name: productpage-v1
  namespace: bookinfo
  app: productpage
  version: v1
"#,
    );
    host.set_property(DOWNSTREAM_PEER_ID, b"caller-1".to_vec());
    host.set_property(DOWNSTREAM_PEER, peer_blob("reviews-v2", "bookinfo"));

    let mut info = RequestInfo::new_http();
    info.response_code = Some(StatusCode::OK);
    info.mutual_tls = true;
    info.destination_port = 9080;
    info.destination_service = "productpage.bookinfo.svc.cluster.local".into();
    filter.on_http_log(&mut info);

    let tags = host.metric_tags("istio_requests_total").unwrap();
    let get = |name: &str| tags.iter().find(|(n, _)| n == name).map(|(_, v)| v.clone()).unwrap();
    assert_eq!(get("reporter"), "destination");
    assert_eq!(get("source_workload"), "reviews-v2");
    assert_eq!(get("source_workload_namespace"), "bookinfo");
    assert_eq!(get("destination_workload"), "productpage-v1");
    assert_eq!(get("destination_port"), "9080");
    assert_eq!(get("connection_security_policy"), "mutual_tls");
    assert_eq!(host.counter_value("istio_requests_total"), Some(1));
}

#[test]
fn distinct_response_codes_create_distinct_metric_sets() {
    let (mut filter, host) = filter_from_yaml("direction: OUTBOUND\n");
    host.set_property(UPSTREAM_PEER_ID, b"peer-1".to_vec());
    host.set_property(UPSTREAM_PEER, peer_blob("svc-b", "shop"));

    for code in [StatusCode::OK, StatusCode::OK, StatusCode::SERVICE_UNAVAILABLE] {
        let mut info = RequestInfo::new_http();
        info.response_code = Some(code);
        filter.on_http_log(&mut info);
    }

    assert_eq!(filter.engine().metric_cache_len(), 2);
    assert_eq!(host.counter_value("istio_requests_total"), Some(2));
}

#[test]
fn peer_cache_stays_bounded_across_many_peers() {
    let (mut filter, host) = filter_from_yaml(
        r#"
direction: OUTBOUND
max_peer_cache_size: 16
"#,
    );

    for i in 0..100 {
        let id = format!("peer-{i}");
        host.set_property(UPSTREAM_PEER_ID, id.into_bytes());
        host.set_property(UPSTREAM_PEER, peer_blob("svc-b", "shop"));
        let mut info = RequestInfo::new_http();
        info.response_code = Some(StatusCode::OK);
        filter.on_http_log(&mut info);
    }

    assert!(filter.engine().peer_cache_len() <= 16);
    assert_eq!(host.counter_value("istio_requests_total"), Some(100));
}

#[test]
fn tcp_connection_with_late_peer_metadata_reports_once() {
    let (mut filter, host) = filter_from_yaml("direction: OUTBOUND\n");

    filter.on_new_connection(42);
    filter.on_downstream_data(42, 1024);
    filter.on_upstream_data(42, 256);
    filter.on_downstream_close(42);
    // Metadata has not arrived: the terminal attempt defers.
    filter.on_upstream_close(42);
    assert_eq!(host.counter_value("istio_tcp_connections_closed_total"), None);

    host.set_property(UPSTREAM_PEER_ID, b"peer-1".to_vec());
    host.set_property(UPSTREAM_PEER, peer_blob("svc-b", "shop"));
    filter.on_upstream_data(42, 0);
    filter.remove_connection(42);

    assert_eq!(host.counter_value("istio_tcp_connections_closed_total"), Some(1));
    assert_eq!(host.counter_value("istio_tcp_received_bytes_total"), Some(1024));
    assert_eq!(host.counter_value("istio_tcp_sent_bytes_total"), Some(256));
    let tags = host.metric_tags("istio_tcp_sent_bytes_total").unwrap();
    assert!(tags.contains(&("destination_workload".into(), "svc-b".into())));
    assert_eq!(filter.tracked_connections(), 0);
}

#[test]
fn tcp_connection_removed_before_close_still_reports() {
    let (mut filter, host) = filter_from_yaml("direction: OUTBOUND\n");

    filter.on_new_connection(7);
    filter.on_downstream_data(7, 100);
    filter.remove_connection(7);

    assert_eq!(host.counter_value("istio_tcp_connections_opened_total"), Some(1));
    let tags = host.metric_tags("istio_tcp_connections_opened_total").unwrap();
    assert!(tags.contains(&("destination_workload".into(), "unknown".into())));
}

#[test]
fn custom_stat_prefix_and_separators_are_honored() {
    let (mut filter, host) = filter_from_yaml(
        r#"
direction: OUTBOUND
stat_prefix: mesh
field_separator: "|"
value_separator: "="
"#,
    );
    host.set_property(UPSTREAM_PEER_ID, b"peer-1".to_vec());
    host.set_property(UPSTREAM_PEER, peer_blob("svc-b", "shop"));

    let mut info = RequestInfo::new_http();
    info.response_code = Some(StatusCode::OK);
    filter.on_http_log(&mut info);

    assert_eq!(host.counter_value("mesh_requests_total"), Some(1));
    assert!(host.counter_value("istio_requests_total").is_none());
}
