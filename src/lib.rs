pub mod engine;
pub mod model;
pub mod mqtt;
pub mod normalize;
pub mod notify;
pub mod observability;
pub mod store;
pub mod wire;
