//! Bootstrap configuration renderer.
//!
//! The production generator injected into the agent: it turns an
//! environment snapshot into a proxy bootstrap document with an admin
//! block, discovery clusters, and TCP-level inbound listeners for
//! host-local instances and management ports. Routing and filter
//! construction stay upstream; the agent only ever sees the bytes.
//!
//! Output is canonical: collections are sorted and field order is fixed,
//! so byte-equal snapshots always render byte-equal payloads.

use std::sync::Arc;

use serde::Serialize;

use crate::artifact::{Generator, RenderError};
use crate::config::{AuthPolicy, ProxyConfig};
use crate::environment::{Environment, NodeIdentity};

const LOCALHOST: &str = "127.0.0.1";
const DEFAULT_ACCESS_LOG: &str = "/dev/stdout";
const SDS_NAME: &str = "sds";
const CDS_NAME: &str = "cds";

#[derive(Debug, Serialize)]
struct Bootstrap {
    listeners: Vec<Listener>,
    admin: Admin,
    cluster_manager: ClusterManager,
    #[serde(skip_serializing_if = "Option::is_none")]
    statsd_udp_ip_address: Option<String>,
}

#[derive(Debug, Serialize)]
struct Admin {
    access_log_path: String,
    address: String,
}

#[derive(Debug, Serialize)]
struct ClusterManager {
    clusters: Vec<Cluster>,
    sds: DiscoveryCluster,
    cds: DiscoveryCluster,
}

#[derive(Debug, Serialize)]
struct DiscoveryCluster {
    cluster: Cluster,
    refresh_delay_ms: u64,
}

#[derive(Debug, Serialize)]
struct Cluster {
    name: String,
    #[serde(rename = "type")]
    cluster_type: String,
    connect_timeout_ms: u64,
    lb_type: String,
    hosts: Vec<Host>,
}

#[derive(Debug, Serialize)]
struct Host {
    url: String,
}

#[derive(Debug, Serialize)]
struct Listener {
    name: String,
    address: String,
    filters: Vec<serde_json::Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    ssl_context: Option<SslContext>,
}

#[derive(Debug, Serialize)]
struct SslContext {
    cert_chain_file: String,
    private_key_file: String,
    ca_cert_file: String,
}

/// Build the production generator for the given proxy settings.
#[must_use]
pub fn renderer(proxy: ProxyConfig) -> Generator {
    Arc::new(move |environment, node| render(&proxy, environment, node))
}

/// Render a bootstrap document for one node.
///
/// # Errors
///
/// Serialization failures indicate a bug in the document model and are
/// reported as `Permanent`.
pub fn render(
    proxy: &ProxyConfig,
    environment: &Environment,
    node: &NodeIdentity,
) -> Result<Vec<u8>, RenderError> {
    let mut environment = environment.clone();
    environment.canonicalize();

    let mut listeners = Vec::new();
    let mut clusters = Vec::new();

    for instance in &environment.host_instances {
        let cluster = inbound_cluster(instance.endpoint_port, proxy);
        listeners.push(inbound_listener(
            &instance.endpoint_address,
            instance.endpoint_port,
            &cluster.name,
            proxy,
        ));
        clusters.push(cluster);
    }

    // Management listeners bind to the node address and skip inbound auth;
    // health checkers speak plain TCP. A management port that collides
    // with a service listener is omitted, or the probes would stop
    // responding.
    for port in &environment.management_ports {
        let address = format!("tcp://{}:{}", node.ip_address, port.port);
        if listeners.iter().any(|l| l.address == address) {
            continue;
        }
        let cluster = inbound_cluster(port.port, proxy);
        let mut listener = inbound_listener(&node.ip_address, port.port, &cluster.name, proxy);
        listener.ssl_context = None;
        listeners.push(listener);
        clusters.push(cluster);
    }

    clusters.sort_by(|a, b| a.name.cmp(&b.name));
    clusters.dedup_by(|a, b| a.name == b.name);
    listeners.sort_by(|a, b| a.name.cmp(&b.name));

    let bootstrap = Bootstrap {
        listeners,
        admin: Admin {
            access_log_path: DEFAULT_ACCESS_LOG.to_string(),
            address: format!("tcp://{LOCALHOST}:{}", proxy.proxy_admin_port),
        },
        cluster_manager: ClusterManager {
            clusters,
            sds: discovery_cluster(SDS_NAME, proxy),
            cds: discovery_cluster(CDS_NAME, proxy),
        },
        statsd_udp_ip_address: proxy.statsd_address.clone(),
    };

    serde_json::to_vec_pretty(&bootstrap)
        .map_err(|err| RenderError::Permanent(format!("bootstrap serialization: {err}")))
}

fn inbound_cluster(port: u16, proxy: &ProxyConfig) -> Cluster {
    Cluster {
        name: format!("inbound|{port}"),
        cluster_type: "static".to_string(),
        connect_timeout_ms: duration_ms(proxy.connect_timeout),
        lb_type: "round_robin".to_string(),
        hosts: vec![Host {
            url: format!("tcp://{LOCALHOST}:{port}"),
        }],
    }
}

fn inbound_listener(address: &str, port: u16, cluster: &str, proxy: &ProxyConfig) -> Listener {
    let ssl_context = match proxy.auth_policy {
        AuthPolicy::None => None,
        AuthPolicy::MutualTls => Some(ssl_context(proxy)),
    };
    Listener {
        name: format!("tcp_{address}_{port}"),
        address: format!("tcp://{address}:{port}"),
        filters: vec![serde_json::json!({
            "type": "read",
            "name": "tcp_proxy",
            "config": {
                "stat_prefix": "tcp",
                "route_config": {
                    "routes": [{ "cluster": cluster }],
                },
            },
        })],
        ssl_context,
    }
}

fn discovery_cluster(name: &str, proxy: &ProxyConfig) -> DiscoveryCluster {
    DiscoveryCluster {
        cluster: Cluster {
            name: name.to_string(),
            cluster_type: "strict_dns".to_string(),
            connect_timeout_ms: duration_ms(proxy.connect_timeout),
            lb_type: "round_robin".to_string(),
            hosts: vec![Host {
                url: format!("tcp://{}", proxy.discovery_address),
            }],
        },
        refresh_delay_ms: duration_ms(proxy.discovery_refresh_delay),
    }
}

fn ssl_context(proxy: &ProxyConfig) -> SslContext {
    let certs = &proxy.auth_certs_path;
    SslContext {
        cert_chain_file: certs.join("cert-chain.pem").display().to_string(),
        private_key_file: certs.join("key.pem").display().to_string(),
        ca_cert_file: certs.join("root-cert.pem").display().to_string(),
    }
}

#[allow(clippy::cast_possible_truncation)] // config durations are far below u64 millis
fn duration_ms(duration: std::time::Duration) -> u64 {
    duration.as_millis() as u64
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::environment::{Port, Protocol, ServiceInstance};

    fn node() -> NodeIdentity {
        NodeIdentity {
            service_cluster: "checkout".to_string(),
            service_node: "checkout-7f9c".to_string(),
            ip_address: "10.0.0.9".to_string(),
        }
    }

    fn instance(address: &str, port: u16) -> ServiceInstance {
        ServiceInstance {
            service_hostname: "checkout.local".to_string(),
            endpoint_address: address.to_string(),
            endpoint_port: port,
            service_port: Port {
                name: "http".to_string(),
                port,
                protocol: Protocol::Http,
            },
        }
    }

    #[test]
    fn test_render_is_deterministic() {
        let proxy = ProxyConfig::default();
        let env = Environment {
            host_instances: vec![instance("10.0.0.9", 8080), instance("10.0.0.9", 9090)],
            ..Default::default()
        };

        // Same snapshot content in a different order must render identically.
        let mut shuffled = env.clone();
        shuffled.host_instances.reverse();

        let first = render(&proxy, &env, &node()).unwrap();
        let second = render(&proxy, &shuffled, &node()).unwrap();
        assert_eq!(first, second);
    }

    #[test]
    fn test_admin_and_discovery_blocks() {
        let proxy = ProxyConfig {
            proxy_admin_port: 15001,
            discovery_address: "discovery:15003".to_string(),
            statsd_address: Some("10.0.0.5:9125".to_string()),
            ..Default::default()
        };

        let payload = render(&proxy, &Environment::default(), &node()).unwrap();
        let doc: serde_json::Value = serde_json::from_slice(&payload).unwrap();

        assert_eq!(doc["admin"]["address"], "tcp://127.0.0.1:15001");
        assert_eq!(
            doc["cluster_manager"]["sds"]["cluster"]["hosts"][0]["url"],
            "tcp://discovery:15003"
        );
        assert_eq!(doc["statsd_udp_ip_address"], "10.0.0.5:9125");
    }

    #[test]
    fn test_statsd_omitted_when_unset() {
        let payload = render(&ProxyConfig::default(), &Environment::default(), &node()).unwrap();
        let doc: serde_json::Value = serde_json::from_slice(&payload).unwrap();
        assert!(doc.get("statsd_udp_ip_address").is_none());
    }

    #[test]
    fn test_mutual_tls_adds_ssl_context_to_instance_listeners() {
        let proxy = ProxyConfig {
            auth_policy: AuthPolicy::MutualTls,
            auth_certs_path: "/etc/certs".into(),
            ..Default::default()
        };
        let env = Environment {
            host_instances: vec![instance("10.0.0.9", 8080)],
            management_ports: vec![Port {
                name: "health".to_string(),
                port: 9001,
                protocol: Protocol::Tcp,
            }],
            ..Default::default()
        };

        let payload = render(&proxy, &env, &node()).unwrap();
        let doc: serde_json::Value = serde_json::from_slice(&payload).unwrap();
        let listeners = doc["listeners"].as_array().unwrap();

        let service = listeners
            .iter()
            .find(|l| l["name"] == "tcp_10.0.0.9_8080")
            .unwrap();
        assert_eq!(
            service["ssl_context"]["cert_chain_file"],
            "/etc/certs/cert-chain.pem"
        );

        // Management listeners stay plain so health probes keep working.
        let mgmt = listeners
            .iter()
            .find(|l| l["name"] == "tcp_10.0.0.9_9001")
            .unwrap();
        assert!(mgmt.get("ssl_context").is_none());
    }

    #[test]
    fn test_duplicate_ports_collapse_to_one_cluster() {
        let env = Environment {
            host_instances: vec![instance("10.0.0.9", 8080)],
            management_ports: vec![Port {
                name: "probe".to_string(),
                port: 8080,
                protocol: Protocol::Tcp,
            }],
            ..Default::default()
        };

        let payload = render(&ProxyConfig::default(), &env, &node()).unwrap();
        let doc: serde_json::Value = serde_json::from_slice(&payload).unwrap();
        let clusters = doc["cluster_manager"]["clusters"].as_array().unwrap();
        let inbound: Vec<_> = clusters
            .iter()
            .filter(|c| c["name"] == "inbound|8080")
            .collect();
        assert_eq!(inbound.len(), 1);

        // The colliding management listener is omitted entirely.
        let listeners = doc["listeners"].as_array().unwrap();
        let colliding: Vec<_> = listeners
            .iter()
            .filter(|l| l["name"] == "tcp_10.0.0.9_8080")
            .collect();
        assert_eq!(colliding.len(), 1);
    }

    #[test]
    fn test_renderer_closure_matches_direct_render() {
        let proxy = ProxyConfig::default();
        let generator = renderer(proxy.clone());
        let env = Environment::default();

        let via_closure = generator(&env, &node()).unwrap();
        let direct = render(&proxy, &env, &node()).unwrap();
        assert_eq!(via_closure, direct);
    }
}
