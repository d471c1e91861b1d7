pub mod ecs;
pub mod k8s;
pub mod os;
pub mod store;
