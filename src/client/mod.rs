pub mod gateway;
pub mod memory;
pub mod rest;

pub use gateway::{
    ClientError, EdgeGateway, GatewayClient, IpRange, NatRule, NatRuleSpec, Pool, PoolSpec,
    Protocol, ResourceRef, VirtualService, VirtualServiceSpec, VirtualServiceStatus,
};
pub use memory::InMemoryGateway;
pub use rest::RestGatewayClient;
