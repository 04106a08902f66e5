//! URL discovery for routed services
//!
//! The URLs of an LLMInferenceService come from the Gateways its HTTPRoutes
//! attach to. For each parent ref, in route order, the listener supplies
//! scheme and port. The route hostnames (or failing that, the gateway's
//! status addresses) supply hosts, and the first path match supplies the path.

use std::fmt;
use std::net::IpAddr;

use async_trait::async_trait;

#[cfg(test)]
use mockall::automock;

use kserve_common::network::{Gateway, GatewayListener, HttpRoute, ParentRef};
use kserve_common::{Error, Result};

/// Read access to Gateways
#[cfg_attr(test, automock)]
#[async_trait]
pub trait GatewayReader: Send + Sync {
    /// Get a Gateway, `None` if it does not exist
    async fn get_gateway(&self, name: &str, namespace: &str) -> Result<Option<Gateway>>;
}

/// A URL at which a routed service answers
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct DiscoveredUrl {
    /// `http` or `https`
    pub scheme: String,
    /// Hostname or IP address
    pub host: String,
    /// Port, `None` for the scheme default
    pub port: Option<i32>,
    /// Absolute path
    pub path: String,
}

impl DiscoveredUrl {
    /// Whether the host is only reachable from inside the cluster or host
    pub fn is_internal(&self) -> bool {
        is_internal_host(&self.host)
    }
}

impl fmt::Display for DiscoveredUrl {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.host.contains(':') {
            write!(f, "{}://[{}]", self.scheme, self.host)?;
        } else {
            write!(f, "{}://{}", self.scheme, self.host)?;
        }
        if let Some(port) = self.port {
            write!(f, ":{port}")?;
        }
        write!(f, "{}", self.path)
    }
}

/// Discover every URL of `route`, one group per parent ref in route order.
///
/// A missing gateway is `NotFound`. A gateway with neither route hostnames
/// nor status addresses is `ExternalAddressNotFound`.
pub async fn discover_urls(
    gateways: &dyn GatewayReader,
    route: &HttpRoute,
) -> Result<Vec<DiscoveredUrl>> {
    let route_namespace = route.metadata.namespace.clone().unwrap_or_default();
    let path = route_path(route);
    let mut urls = Vec::new();

    for parent in &route.spec.parent_refs {
        let namespace = parent
            .namespace
            .as_deref()
            .filter(|ns| !ns.is_empty())
            .unwrap_or(&route_namespace);

        let gateway = gateways
            .get_gateway(&parent.name, namespace)
            .await?
            .ok_or_else(|| Error::not_found("Gateway", format!("{namespace}/{}", parent.name)))?;

        let listener = select_listener(&gateway, parent);
        let (scheme, port) = match listener {
            Some(l) => (l.scheme(), explicit_port(l)),
            None => ("http", None),
        };

        let hosts = hosts_for(route, &gateway);
        if hosts.is_empty() {
            return Err(Error::ExternalAddressNotFound {
                gateway: format!("{namespace}/{}", parent.name),
            });
        }

        urls.extend(hosts.into_iter().map(|host| DiscoveredUrl {
            scheme: scheme.to_string(),
            host,
            port,
            path: path.clone(),
        }));
    }

    Ok(urls)
}

/// URLs whose host is internal, input order preserved
pub fn filter_internal_urls(urls: &[DiscoveredUrl]) -> Vec<DiscoveredUrl> {
    urls.iter().filter(|u| u.is_internal()).cloned().collect()
}

/// URLs whose host is external, input order preserved
pub fn filter_external_urls(urls: &[DiscoveredUrl]) -> Vec<DiscoveredUrl> {
    urls.iter().filter(|u| !u.is_internal()).cloned().collect()
}

/// Private, loopback or link-local IPs, `localhost` and cluster-local suffixes
pub fn is_internal_host(host: &str) -> bool {
    if let Ok(ip) = host.trim_matches(['[', ']']).parse::<IpAddr>() {
        return match ip {
            IpAddr::V4(v4) => v4.is_private() || v4.is_loopback() || v4.is_link_local(),
            IpAddr::V6(v6) => {
                v6.is_loopback()
                    // fc00::/7 unique local, fe80::/10 link local
                    || (v6.segments()[0] & 0xfe00) == 0xfc00
                    || (v6.segments()[0] & 0xffc0) == 0xfe80
            }
        };
    }
    let host = host.to_ascii_lowercase();
    host == "localhost"
        || host.ends_with(".local")
        || host.ends_with(".localhost")
        || host.ends_with(".internal")
}

fn select_listener<'a>(gateway: &'a Gateway, parent: &ParentRef) -> Option<&'a GatewayListener> {
    let listeners = &gateway.spec.listeners;
    parent
        .section_name
        .as_deref()
        .and_then(|section| listeners.iter().find(|l| l.name == section))
        .or_else(|| listeners.first())
}

fn explicit_port(listener: &GatewayListener) -> Option<i32> {
    match listener.port {
        0 | 80 | 443 => None,
        port => Some(port),
    }
}

fn hosts_for(route: &HttpRoute, gateway: &Gateway) -> Vec<String> {
    let mut hosts: Vec<String> = route
        .spec
        .hostnames
        .iter()
        .filter(|h| !h.is_empty() && h.as_str() != "*")
        .cloned()
        .collect();
    if hosts.is_empty() {
        hosts = gateway
            .status_addresses()
            .into_iter()
            .map(|a| a.value.clone())
            .filter(|v| !v.is_empty())
            .collect();
    }
    hosts.sort();
    hosts.dedup();
    hosts
}

fn route_path(route: &HttpRoute) -> String {
    route
        .spec
        .rules
        .first()
        .and_then(|r| r.matches.first())
        .and_then(|m| m.path.as_ref())
        .and_then(|p| p.value.clone())
        .filter(|v| !v.is_empty())
        .unwrap_or_else(|| "/".to_string())
}
