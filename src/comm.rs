//! Distributed communicator interface and mini-batch shard planning

use crate::error::{PoolError, Result};

/// The slice of the distributed communicator the pooling core needs
pub trait Communicator: Send + Sync {
    /// Number of processes that together hold one model replica
    fn procs_per_model(&self) -> usize;

    /// Rank of this process inside its model replica
    fn rank_in_model(&self) -> usize;
}

/// Single-process communicator
#[derive(Debug, Clone, Copy, Default)]
pub struct LocalComm;

impl Communicator for LocalComm {
    fn procs_per_model(&self) -> usize {
        1
    }

    fn rank_in_model(&self) -> usize {
        0
    }
}

/// Fixed-size communicator, used when the process layout is known up front
#[derive(Debug, Clone, Copy)]
pub struct StaticComm {
    procs_per_model: usize,
    rank_in_model: usize,
}

impl StaticComm {
    pub fn new(procs_per_model: usize, rank_in_model: usize) -> Result<Self> {
        if procs_per_model == 0 || rank_in_model >= procs_per_model {
            return Err(PoolError::invalid_parameter(
                "rank_in_model".to_string(),
                format!("rank {} outside a model of {} processes", rank_in_model, procs_per_model),
            ));
        }
        Ok(StaticComm { procs_per_model, rank_in_model })
    }
}

impl Communicator for StaticComm {
    fn procs_per_model(&self) -> usize {
        self.procs_per_model
    }

    fn rank_in_model(&self) -> usize {
        self.rank_in_model
    }
}

/// How one mini-batch is split across processes and then across devices
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ShardPlan {
    pub mini_batch_size: usize,
    pub local_mini_batch_size: usize,
    pub num_devices: usize,
    pub per_device: usize,
}

impl ShardPlan {
    /// Ceil-divide the mini-batch over processes, then the local shard over devices
    pub fn new(mini_batch_size: usize, procs_per_model: usize, num_devices: usize) -> Result<Self> {
        if mini_batch_size == 0 {
            return Err(PoolError::invalid_parameter("mini_batch_size", "must be >= 1"));
        }
        if procs_per_model == 0 {
            return Err(PoolError::invalid_parameter("procs_per_model", "must be >= 1"));
        }
        if num_devices == 0 {
            return Err(PoolError::invalid_parameter("num_devices", "must be >= 1"));
        }
        let local_mini_batch_size = (mini_batch_size + procs_per_model - 1) / procs_per_model;
        let per_device = (local_mini_batch_size + num_devices - 1) / num_devices;
        Ok(ShardPlan {
            mini_batch_size,
            local_mini_batch_size,
            num_devices,
            per_device,
        })
    }

    /// Host-only plan: a single pseudo device holding the whole local shard
    pub fn host(mini_batch_size: usize, comm: &dyn Communicator) -> Result<Self> {
        Self::new(mini_batch_size, comm.procs_per_model(), 1)
    }

    /// Rows `[start, end)` of a local matrix of `width` samples owned by `device`
    pub fn device_rows(&self, device: usize, width: usize) -> (usize, usize) {
        let start = (device * self.per_device).min(width);
        let end = ((device + 1) * self.per_device).min(width);
        (start, end)
    }
}
