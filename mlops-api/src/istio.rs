//! Typed bodies for the two Istio kinds the operator owns. Only the fields
//! the operator writes are modelled; the mesh tolerates the rest missing.

use std::collections::BTreeMap;

use kube::CustomResource;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

/// Port opened by a gateway server
#[derive(Clone, Debug, Default, Deserialize, JsonSchema, PartialEq, Serialize)]
pub struct ServerPort {
    /// Protocol name, e.g. `http`
    pub name: String,
    /// Port number
    pub number: i32,
    /// Protocol, e.g. `HTTP`
    pub protocol: String,
}

/// One listen rule of a gateway
#[derive(Clone, Debug, Default, Deserialize, JsonSchema, PartialEq, Serialize)]
pub struct Server {
    /// Host names this server accepts
    pub hosts: Vec<String>,
    /// Port this server listens on
    pub port: ServerPort,
}

/// Spec of a mesh ingress gateway
#[derive(CustomResource, Clone, Debug, Default, Deserialize, JsonSchema, PartialEq, Serialize)]
#[kube(
    group = "networking.istio.io",
    version = "v1beta1",
    kind = "Gateway",
    namespaced
)]
pub struct GatewaySpec {
    /// Labels of the ingress pods implementing this gateway
    pub selector: BTreeMap<String, String>,
    /// Listen rules
    pub servers: Vec<Server>,
}

/// Port selector of a route destination
#[derive(Clone, Debug, Default, Deserialize, JsonSchema, PartialEq, Serialize)]
pub struct PortSelector {
    /// Port number
    pub number: i32,
}

/// Service a route forwards to
#[derive(Clone, Debug, Default, Deserialize, JsonSchema, PartialEq, Serialize)]
pub struct Destination {
    /// Target service host
    pub host: String,
    /// Target service port
    pub port: PortSelector,
}

/// One weighted routing target
#[derive(Clone, Debug, Default, Deserialize, JsonSchema, PartialEq, Serialize)]
pub struct WeightedDestination {
    /// Where the traffic goes
    pub destination: Destination,
    /// Relative weight of this target
    pub weight: i32,
}

/// One HTTP routing rule
#[derive(Clone, Debug, Default, Deserialize, JsonSchema, PartialEq, Serialize)]
pub struct HttpRoute {
    /// Weighted targets, in user-declared order
    pub route: Vec<WeightedDestination>,
}

/// Spec of a mesh routing rule bound to a gateway
#[derive(CustomResource, Clone, Debug, Default, Deserialize, JsonSchema, PartialEq, Serialize)]
#[kube(
    group = "networking.istio.io",
    version = "v1beta1",
    kind = "VirtualService",
    namespaced
)]
pub struct VirtualServiceSpec {
    /// Gateways this rule binds to
    pub gateways: Vec<String>,
    /// Host names this rule matches
    pub hosts: Vec<String>,
    /// HTTP rules; the operator always writes exactly one
    pub http: Vec<HttpRoute>,
}

/// Build one weighted routing target
#[must_use]
pub fn weighted_route(host: &str, port: i32, weight: i32) -> WeightedDestination {
    WeightedDestination {
        destination: Destination {
            host: host.to_owned(),
            port: PortSelector { number: port },
        },
        weight,
    }
}

#[cfg(test)]
mod test {
    use super::weighted_route;

    #[test]
    fn test_weighted_route() {
        let route = weighted_route("titanic-rfc-0abc-00", 8080, 42);
        assert_eq!(route.destination.host, "titanic-rfc-0abc-00");
        assert_eq!(route.destination.port.number, 8080);
        assert_eq!(route.weight, 42);
    }
}
