//! Host port allocation for tasks with published container ports.
//!
//! The cluster is created with the host range pre-mapped onto the
//! server node's NodePort range, so an allocation is pure bookkeeping:
//! pick a free host port, remember it under the task ARN, and derive
//! the NodePort arithmetically. Releasing only frees the bookkeeping;
//! the underlying Docker port mapping persists until the cluster is
//! recreated.

use crate::util::config::{HOST_PORT_RANGE_END, HOST_PORT_RANGE_START, NODE_PORT_BASE};
use kecs_shared::ecs::error::EcsError;
use log::trace;
use std::collections::HashMap;
use std::sync::Mutex;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct PortAllocation {
    pub host_port: u16,
    pub node_port: u16,
}

/// NodePort the cluster exposes for a given allocated host port.
pub fn node_port_for(host_port: u16) -> u16 {
    NODE_PORT_BASE + (host_port - HOST_PORT_RANGE_START)
}

pub struct PortAllocator {
    range_start: u16,
    range_end: u16,
    /// task ARN -> allocated host port
    allocations: Mutex<HashMap<String, u16>>,
}

impl PortAllocator {
    pub fn new(range_start: u16, range_end: u16) -> Self {
        PortAllocator {
            range_start,
            range_end,
            allocations: Mutex::new(HashMap::new()),
        }
    }

    /// Allocate the lowest free host port in the range for the task.
    /// Allocating again for the same task returns the existing port.
    pub fn allocate(&self, task_arn: &str) -> Result<PortAllocation, EcsError> {
        let mut allocations = self
            .allocations
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        if let Some(port) = allocations.get(task_arn) {
            return Ok(PortAllocation {
                host_port: *port,
                node_port: node_port_for(*port),
            });
        }
        let in_use: std::collections::HashSet<u16> = allocations.values().copied().collect();
        let free = (self.range_start..=self.range_end).find(|port| !in_use.contains(port));
        match free {
            Some(port) => {
                allocations.insert(task_arn.to_string(), port);
                trace!("allocate - {} -> host port {}", task_arn, port);
                Ok(PortAllocation {
                    host_port: port,
                    node_port: node_port_for(port),
                })
            }
            None => Err(EcsError::Internal(format!(
                "host port range {}-{} exhausted",
                self.range_start, self.range_end
            ))),
        }
    }

    /// Release a task's allocation; a no-op for unknown tasks.
    pub fn release(&self, task_arn: &str) -> Option<u16> {
        let mut allocations = self
            .allocations
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        let released = allocations.remove(task_arn);
        if let Some(port) = released {
            trace!("release - {} freed host port {}", task_arn, port);
        }
        released
    }

    pub fn allocation_for(&self, task_arn: &str) -> Option<PortAllocation> {
        let allocations = self
            .allocations
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        allocations.get(task_arn).map(|port| PortAllocation {
            host_port: *port,
            node_port: node_port_for(*port),
        })
    }
}

impl Default for PortAllocator {
    fn default() -> Self {
        PortAllocator::new(HOST_PORT_RANGE_START, HOST_PORT_RANGE_END)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_allocation_stays_in_range_with_derived_node_port() {
        let allocator = PortAllocator::default();
        let allocation = allocator.allocate("arn:task/a").unwrap();
        assert!((32000..=32999).contains(&allocation.host_port));
        assert_eq!(
            30000 + (allocation.host_port - 32000),
            allocation.node_port
        );
    }

    #[test]
    fn test_allocate_is_idempotent_per_task() {
        let allocator = PortAllocator::default();
        let first = allocator.allocate("arn:task/a").unwrap();
        let again = allocator.allocate("arn:task/a").unwrap();
        assert_eq!(first, again);
    }

    #[test]
    fn test_release_frees_the_port() {
        let allocator = PortAllocator::new(32000, 32001);
        let a = allocator.allocate("arn:task/a").unwrap();
        let _b = allocator.allocate("arn:task/b").unwrap();
        assert!(matches!(
            allocator.allocate("arn:task/c"),
            Err(EcsError::Internal(_))
        ));
        assert_eq!(Some(a.host_port), allocator.release("arn:task/a"));
        let c = allocator.allocate("arn:task/c").unwrap();
        assert_eq!(a.host_port, c.host_port);
        assert!(allocator.release("arn:task/unknown").is_none());
    }

    #[test]
    fn test_allocation_lookup() {
        let allocator = PortAllocator::default();
        assert!(allocator.allocation_for("arn:task/a").is_none());
        let allocation = allocator.allocate("arn:task/a").unwrap();
        assert_eq!(Some(allocation), allocator.allocation_for("arn:task/a"));
    }
}
