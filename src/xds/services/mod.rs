//! gRPC discovery service implementations.

pub mod ads;
pub mod stream;

pub use ads::{
    AggregatedDiscovery, ClusterDiscovery, EndpointDiscovery, ListenerDiscovery, RouteDiscovery,
    SecretDiscovery,
};
