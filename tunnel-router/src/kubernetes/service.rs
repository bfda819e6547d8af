use std::collections::BTreeSet;
use std::net::Ipv4Addr;
use std::path::Path;

use k8s_openapi::api::core::v1::Service as KubeService;
use k8s_openapi::api::discovery::v1::{Endpoint as KubeEndpoint, EndpointConditions, EndpointSlice};
use kube::ResourceExt;
use tracing::{trace, warn};
use tunnel_router_kernel::NetNsRef;

use crate::reconcile::{Endpoint, EndpointSnapshot, Service};
use crate::{Error, Result};

pub(crate) const SERVICE_OWNER_LABEL: &str = "kubernetes.io/service-name";

/// Services carrying a parseable tunnel IP annotation. With a
/// `name_limit`, services whose names are too long to name a tunnel
/// interface after are skipped.
pub fn managed_services(
    services: &[KubeService],
    annotation: &str,
    name_limit: Option<usize>,
) -> ahash::HashSet<Service> {
    services
        .iter()
        .filter(|svc| svc.metadata.deletion_timestamp.is_none())
        .filter(|svc| match name_limit {
            Some(limit) if svc.name_any().len() > limit => {
                warn!(
                    service = svc.name_any(),
                    limit, "service name too long for a tunnel interface, skipping"
                );
                false
            }
            _ => true,
        })
        .filter_map(|svc| match tunnel_ip(svc, annotation) {
            Ok(Some(ip)) => Some(Service::new(
                svc.name_any(),
                svc.namespace().unwrap_or_default(),
                ip,
            )),
            Ok(None) => None,
            Err(e) => {
                warn!(%e, "skipping service");
                None
            }
        })
        .collect()
}

fn tunnel_ip(svc: &KubeService, annotation: &str) -> Result<Option<Ipv4Addr>> {
    let Some(value) = svc.annotations().get(annotation) else {
        return Ok(None);
    };
    value
        .trim()
        .parse()
        .map(Some)
        .map_err(|_| Error::InvalidAnnotation {
            service: format!("{}/{}", svc.namespace().unwrap_or_default(), svc.name_any()),
            value: value.clone(),
        })
}

/// Groups the ready IPv4 backends of `slices` under the service owning them.
pub fn endpoints_by_service(
    slices: &[EndpointSlice],
    services: &ahash::HashSet<Service>,
    node_name: &str,
    netns_dir: &Path,
) -> EndpointSnapshot {
    let mut snapshot: EndpointSnapshot = services
        .iter()
        .map(|s| (s.clone(), BTreeSet::new()))
        .collect();
    let owners: ahash::HashMap<(&str, &str), &Service> = services
        .iter()
        .map(|s| ((s.namespace.as_str(), s.name.as_str()), s))
        .collect();

    for slice in slices.iter().filter(|s| s.address_type == "IPv4") {
        let Some(owner) = slice.labels().get(SERVICE_OWNER_LABEL) else {
            continue;
        };
        let namespace = slice.namespace().unwrap_or_default();
        let Some(service) = owners.get(&(namespace.as_str(), owner.as_str())) else {
            continue;
        };
        trace!(slice = slice.name_any(), %service, "collecting endpoints");

        let Some(endpoints) = snapshot.get_mut(*service) else {
            continue;
        };
        for ep in &slice.endpoints {
            if !ep.conditions.as_ref().is_none_or(endpoint_ready) {
                continue;
            }
            let netns = local_netns(ep, node_name, netns_dir);
            for address in &ep.addresses {
                let Ok(ip) = address.parse::<Ipv4Addr>() else {
                    continue;
                };
                let endpoint = match &netns {
                    Some(netns) => Endpoint::local(ip, netns.clone()),
                    None => Endpoint::remote(ip),
                };
                endpoints.insert(endpoint);
            }
        }
    }

    snapshot
}

fn endpoint_ready(ep_cond: &EndpointConditions) -> bool {
    (ep_cond.ready == Some(true) || ep_cond.ready.is_none()) && (ep_cond.terminating != Some(true))
}

/// Namespace of a backend pod scheduled on this node.
fn local_netns(ep: &KubeEndpoint, node_name: &str, netns_dir: &Path) -> Option<NetNsRef> {
    if ep.node_name.as_deref() != Some(node_name) {
        return None;
    }
    let target = ep.target_ref.as_ref()?;
    if target.kind.as_deref() != Some("Pod") {
        return None;
    }
    let name = target.name.as_deref()?;
    let namespace = target.namespace.as_deref()?;
    Some(NetNsRef::new(netns_dir.join(format!("{namespace}_{name}"))))
}

#[cfg(test)]
mod test {
    use std::collections::BTreeMap;

    use k8s_openapi::api::core::v1::ObjectReference;
    use kube::api::ObjectMeta;

    use super::*;

    const ANNOTATION: &str = "cmd.nu/tunnel";

    fn kube_service(name: &str, tunnel: Option<&str>) -> KubeService {
        let annotations = tunnel.map(|t| BTreeMap::from([(ANNOTATION.to_string(), t.to_string())]));
        KubeService {
            metadata: ObjectMeta {
                name: Some(name.into()),
                namespace: Some("test-namespace".into()),
                annotations,
                ..Default::default()
            },
            ..Default::default()
        }
    }

    fn slice(service: &str, address_type: &str, endpoints: Vec<KubeEndpoint>) -> EndpointSlice {
        let labels = BTreeMap::from([(SERVICE_OWNER_LABEL.to_string(), service.to_string())]);
        EndpointSlice {
            address_type: address_type.into(),
            endpoints,
            metadata: ObjectMeta {
                labels: Some(labels),
                name: Some(format!("{service}-abcde")),
                namespace: Some("test-namespace".into()),
                ..Default::default()
            },
            ports: None,
        }
    }

    fn endpoint(address: &str, ready: Option<bool>, terminating: Option<bool>) -> KubeEndpoint {
        KubeEndpoint {
            addresses: vec![address.into()],
            conditions: Some(EndpointConditions {
                ready,
                serving: ready,
                terminating,
            }),
            ..Default::default()
        }
    }

    fn pod_endpoint(address: &str, node: &str, pod: &str) -> KubeEndpoint {
        KubeEndpoint {
            node_name: Some(node.into()),
            target_ref: Some(ObjectReference {
                kind: Some("Pod".into()),
                name: Some(pod.into()),
                namespace: Some("test-namespace".into()),
                ..Default::default()
            }),
            ..endpoint(address, Some(true), None)
        }
    }

    fn web() -> Service {
        Service::new("web", "test-namespace", Ipv4Addr::new(10, 0, 0, 5))
    }

    #[test]
    fn test_managed_services() {
        let services = vec![
            kube_service("web", Some("10.0.0.5")),
            kube_service("plain", None),
            kube_service("broken", Some("not-an-ip")),
            kube_service("v6", Some("fd00::1")),
        ];

        let managed = managed_services(&services, ANNOTATION, None);
        let expected: ahash::HashSet<Service> = [web()].into_iter().collect();
        assert_eq!(managed, expected);
    }

    #[test]
    fn test_long_names_skipped_when_limited() {
        let services = vec![
            kube_service("web", Some("10.0.0.5")),
            kube_service("a-very-long-service-one", Some("10.0.0.8")),
        ];

        assert_eq!(managed_services(&services, ANNOTATION, None).len(), 2);
        let managed = managed_services(&services, ANNOTATION, Some(13));
        let expected: ahash::HashSet<Service> = [web()].into_iter().collect();
        assert_eq!(managed, expected);
    }

    #[test]
    fn test_invalid_annotation() {
        let err = tunnel_ip(&kube_service("broken", Some("nope")), ANNOTATION).unwrap_err();
        assert!(matches!(err, Error::InvalidAnnotation { .. }));
        assert_eq!(
            tunnel_ip(&kube_service("web", Some(" 10.0.0.5 ")), ANNOTATION).unwrap(),
            Some(Ipv4Addr::new(10, 0, 0, 5))
        );
    }

    #[test]
    fn test_endpoints_by_service() {
        let services: ahash::HashSet<Service> = [web()].into_iter().collect();
        let slices = vec![
            slice(
                "web",
                "IPv4",
                vec![
                    endpoint("192.168.1.1", Some(true), None),
                    endpoint("192.168.1.2", None, None),
                    endpoint("192.168.1.3", Some(false), None),
                    endpoint("192.168.1.4", Some(true), Some(true)),
                ],
            ),
            slice("web", "IPv6", vec![endpoint("fd00::2", Some(true), None)]),
            slice("other", "IPv4", vec![endpoint("192.168.2.1", Some(true), None)]),
        ];

        let snapshot = endpoints_by_service(&slices, &services, "node-a", Path::new("/run/netns"));
        assert_eq!(snapshot.len(), 1);
        let ips: Vec<Ipv4Addr> = snapshot[&web()].iter().map(|e| e.ip).collect();
        assert_eq!(
            ips,
            vec![Ipv4Addr::new(192, 168, 1, 1), Ipv4Addr::new(192, 168, 1, 2)]
        );
    }

    #[test]
    fn test_service_without_slices_is_empty() {
        let services: ahash::HashSet<Service> = [web()].into_iter().collect();
        let snapshot = endpoints_by_service(&[], &services, "node-a", Path::new("/run/netns"));
        assert_eq!(snapshot.get(&web()), Some(&BTreeSet::new()));
    }

    #[test]
    fn test_local_endpoints_carry_netns() {
        let services: ahash::HashSet<Service> = [web()].into_iter().collect();
        let slices = vec![slice(
            "web",
            "IPv4",
            vec![
                pod_endpoint("192.168.1.1", "node-a", "web-0"),
                pod_endpoint("192.168.1.2", "node-b", "web-1"),
            ],
        )];

        let snapshot = endpoints_by_service(&slices, &services, "node-a", Path::new("/run/netns"));
        let endpoints: Vec<&Endpoint> = snapshot[&web()].iter().collect();
        assert_eq!(
            endpoints[0].netns,
            Some(NetNsRef::new("/run/netns/test-namespace_web-0"))
        );
        assert_eq!(endpoints[1].netns, None);
    }
}
