//! Owned descriptor handles
//!
//! Each wrapper holds the backend that created it and destroys its
//! descriptor when dropped, so every exit path releases it.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use crate::error::{PoolError, Result};
use crate::layers::PoolMode;
use crate::tensor::PoolWindow;
use super::backend::{DescriptorId, DeviceBackend, PoolingOp, TensorLayout};

/// Tensor layout registered with a backend
pub struct TensorDescriptor {
    backend: Arc<dyn DeviceBackend>,
    id: DescriptorId,
    layout: TensorLayout,
}

impl TensorDescriptor {
    /// Packed descriptor over `dims` in the backend's data type
    pub fn packed(backend: &Arc<dyn DeviceBackend>, dims: &[usize]) -> Result<Self> {
        let layout = TensorLayout::packed(backend.data_type(), dims);
        let id = backend.create_tensor_descriptor(&layout)?;
        log::trace!("created tensor descriptor {:?} for dims {:?}", id, dims);
        Ok(TensorDescriptor {
            backend: Arc::clone(backend),
            id,
            layout,
        })
    }

    pub fn id(&self) -> DescriptorId {
        self.id
    }

    pub fn dims(&self) -> &[usize] {
        &self.layout.dims
    }

    pub fn layout(&self) -> &TensorLayout {
        &self.layout
    }
}

impl Drop for TensorDescriptor {
    fn drop(&mut self) {
        log::trace!("destroying tensor descriptor {:?}", self.id);
        self.backend.destroy_descriptor(self.id);
    }
}

/// Pooling operation registered with a backend
pub struct PoolingDescriptor {
    backend: Arc<dyn DeviceBackend>,
    id: DescriptorId,
    op: PoolingOp,
}

impl PoolingDescriptor {
    pub fn new(backend: &Arc<dyn DeviceBackend>, mode: PoolMode, window: &PoolWindow) -> Result<Self> {
        let op = PoolingOp {
            mode,
            window: window.clone(),
            propagate_nan: true,
        };
        let id = backend.create_pooling_descriptor(&op)?;
        log::trace!("created pooling descriptor {:?} ({})", id, mode);
        Ok(PoolingDescriptor {
            backend: Arc::clone(backend),
            id,
            op,
        })
    }

    pub fn id(&self) -> DescriptorId {
        self.id
    }

    pub fn mode(&self) -> PoolMode {
        self.op.mode
    }

    /// Output dims reported by the device primitive for `input`
    pub fn output_dims(&self, input: &TensorDescriptor) -> Result<Vec<usize>> {
        self.backend.pooling_output_dims(self.id, input.id())
    }
}

impl Drop for PoolingDescriptor {
    fn drop(&mut self) {
        log::trace!("destroying pooling descriptor {:?}", self.id);
        self.backend.destroy_descriptor(self.id);
    }
}

/// Backend-side descriptor state
#[derive(Debug, Clone)]
pub enum DescriptorEntry {
    Tensor(TensorLayout),
    Pooling(PoolingOp),
}

/// Id allocation and lookup for descriptors, shared by backend implementations
#[derive(Debug, Default)]
pub struct DescriptorTable {
    next_id: AtomicU64,
    entries: Mutex<HashMap<DescriptorId, DescriptorEntry>>,
}

impl DescriptorTable {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&self, entry: DescriptorEntry) -> Result<DescriptorId> {
        let id = DescriptorId(self.next_id.fetch_add(1, Ordering::Relaxed));
        self.entries
            .lock()
            .map_err(|_| PoolError::device_failure("create_descriptor", "descriptor table poisoned"))?
            .insert(id, entry);
        Ok(id)
    }

    pub fn remove(&self, id: DescriptorId) {
        if let Ok(mut entries) = self.entries.lock() {
            entries.remove(&id);
        }
    }

    pub fn tensor(&self, id: DescriptorId) -> Result<TensorLayout> {
        match self.get(id)? {
            DescriptorEntry::Tensor(layout) => Ok(layout),
            DescriptorEntry::Pooling(_) => Err(PoolError::device_failure(
                "descriptor_lookup",
                format!("{:?} is a pooling descriptor, expected a tensor descriptor", id),
            )),
        }
    }

    pub fn pooling(&self, id: DescriptorId) -> Result<PoolingOp> {
        match self.get(id)? {
            DescriptorEntry::Pooling(op) => Ok(op),
            DescriptorEntry::Tensor(_) => Err(PoolError::device_failure(
                "descriptor_lookup",
                format!("{:?} is a tensor descriptor, expected a pooling descriptor", id),
            )),
        }
    }

    /// Number of live descriptors
    pub fn len(&self) -> usize {
        self.entries.lock().map(|entries| entries.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn get(&self, id: DescriptorId) -> Result<DescriptorEntry> {
        self.entries
            .lock()
            .map_err(|_| PoolError::device_failure("descriptor_lookup", "descriptor table poisoned"))?
            .get(&id)
            .cloned()
            .ok_or_else(|| PoolError::device_failure("descriptor_lookup", format!("unknown descriptor {:?}", id)))
    }
}
