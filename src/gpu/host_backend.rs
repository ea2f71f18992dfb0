//! Device backend simulated in host memory
//!
//! Each simulated device owns a private memory arena, so data only moves
//! between host and device through explicit writes and reads, exactly as it
//! would with a real accelerator. Pooling runs directly over the packed
//! tensors (no column matrix) with the same semantics a vendor primitive
//! has: padding never wins a max window, `AverageNoPad` divides by the
//! in-bounds count and NaN propagates through max pooling.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Mutex, MutexGuard};
use ndarray::{ArrayViewMut2, Axis, Zip};
use crate::error::{PoolError, Result};
use crate::layers::PoolMode;
use super::backend::{
    BufferId, DescriptorId, DeviceBackend, DeviceType, PoolingBackward, PoolingForward, PoolingOp,
    PoolingProblem, TensorLayout, forward_output_dims,
};
use super::constants::DEFAULT_HOST_DEVICES;
use super::descriptor::{DescriptorEntry, DescriptorTable};

#[derive(Default)]
struct DeviceMemory {
    buffers: HashMap<BufferId, Vec<f32>>,
}

impl DeviceMemory {
    fn get(&self, id: BufferId, len: usize) -> Result<&[f32]> {
        let buffer = self
            .buffers
            .get(&id)
            .ok_or_else(|| PoolError::device_failure("buffer_lookup", format!("unknown buffer {:?}", id)))?;
        check_len(id, buffer.len(), len)?;
        Ok(buffer)
    }

    fn take(&mut self, id: BufferId, len: usize) -> Result<Vec<f32>> {
        let buffer = self
            .buffers
            .remove(&id)
            .ok_or_else(|| PoolError::device_failure("buffer_lookup", format!("unknown buffer {:?}", id)))?;
        if let Err(e) = check_len(id, buffer.len(), len) {
            self.buffers.insert(id, buffer);
            return Err(e);
        }
        Ok(buffer)
    }
}

fn check_len(id: BufferId, actual: usize, expected: usize) -> Result<()> {
    if actual != expected {
        return Err(PoolError::device_failure(
            "buffer_lookup",
            format!("buffer {:?} holds {} elements, descriptor needs {}", id, actual, expected),
        ));
    }
    Ok(())
}

/// Host-memory device backend
pub struct HostDeviceBackend {
    memories: Vec<Mutex<DeviceMemory>>,
    descriptors: DescriptorTable,
    next_buffer: AtomicU64,
}

impl HostDeviceBackend {
    /// Simulate `num_devices` devices (at least one)
    pub fn new(num_devices: usize) -> Self {
        let num_devices = if num_devices == 0 {
            log::warn!("host device backend needs at least one device, using 1");
            1
        } else {
            num_devices
        };
        log::info!("host device backend with {} simulated device(s)", num_devices);
        HostDeviceBackend {
            memories: (0..num_devices).map(|_| Mutex::new(DeviceMemory::default())).collect(),
            descriptors: DescriptorTable::new(),
            next_buffer: AtomicU64::new(0),
        }
    }

    /// Number of allocations alive across all devices
    pub fn live_buffers(&self) -> usize {
        self.memories
            .iter()
            .map(|memory| memory.lock().map(|m| m.buffers.len()).unwrap_or(0))
            .sum()
    }

    /// Number of descriptors not yet destroyed
    pub fn live_descriptors(&self) -> usize {
        self.descriptors.len()
    }

    fn memory(&self, device: usize) -> Result<MutexGuard<'_, DeviceMemory>> {
        self.memories
            .get(device)
            .ok_or_else(|| {
                PoolError::device_failure(
                    "select_device",
                    format!("device {} out of range ({} devices)", device, self.memories.len()),
                )
            })?
            .lock()
            .map_err(|_| PoolError::device_failure("select_device", format!("device {} memory poisoned", device)))
    }
}

impl Default for HostDeviceBackend {
    fn default() -> Self {
        Self::new(DEFAULT_HOST_DEVICES)
    }
}

impl DeviceBackend for HostDeviceBackend {
    fn device_type(&self) -> DeviceType {
        DeviceType::Host
    }

    fn num_devices(&self) -> usize {
        self.memories.len()
    }

    fn device_info(&self, device: usize) -> Result<String> {
        let memory = self.memory(device)?;
        let resident: usize = memory.buffers.values().map(|b| b.len()).sum();
        Ok(format!(
            "Device: Host simulated device {}\nVendor: poolnet\nResident elements: {}",
            device, resident
        ))
    }

    fn allocate(&self, device: usize, len: usize) -> Result<BufferId> {
        let id = BufferId(self.next_buffer.fetch_add(1, Ordering::Relaxed));
        self.memory(device)?.buffers.insert(id, vec![0.0; len]);
        Ok(id)
    }

    fn deallocate(&self, device: usize, buffer: BufferId) {
        if let Ok(mut memory) = self.memory(device) {
            memory.buffers.remove(&buffer);
        }
    }

    fn write(&self, device: usize, buffer: BufferId, data: &[f32]) -> Result<()> {
        let mut memory = self.memory(device)?;
        let mut target = memory.take(buffer, data.len())?;
        target.copy_from_slice(data);
        memory.buffers.insert(buffer, target);
        Ok(())
    }

    fn read(&self, device: usize, buffer: BufferId, out: &mut [f32]) -> Result<()> {
        let memory = self.memory(device)?;
        out.copy_from_slice(memory.get(buffer, out.len())?);
        Ok(())
    }

    fn create_tensor_descriptor(&self, layout: &TensorLayout) -> Result<DescriptorId> {
        if layout.dims.len() != layout.strides.len() || layout.dims.is_empty() {
            return Err(PoolError::device_failure(
                "create_tensor_descriptor",
                format!("dims {:?} and strides {:?} disagree", layout.dims, layout.strides),
            ));
        }
        self.descriptors.insert(DescriptorEntry::Tensor(layout.clone()))
    }

    fn create_pooling_descriptor(&self, op: &PoolingOp) -> Result<DescriptorId> {
        op.window
            .validate()
            .map_err(|e| PoolError::device_failure("create_pooling_descriptor", e))?;
        self.descriptors.insert(DescriptorEntry::Pooling(op.clone()))
    }

    fn destroy_descriptor(&self, descriptor: DescriptorId) {
        self.descriptors.remove(descriptor);
    }

    fn pooling_output_dims(&self, pooling: DescriptorId, input: DescriptorId) -> Result<Vec<usize>> {
        let op = self.descriptors.pooling(pooling)?;
        let layout = self.descriptors.tensor(input)?;
        forward_output_dims(&op, &layout)
    }

    fn pooling_forward(&self, device: usize, args: &PoolingForward) -> Result<()> {
        let op = self.descriptors.pooling(args.pooling)?;
        let x_layout = self.descriptors.tensor(args.x_desc)?;
        let y_layout = self.descriptors.tensor(args.y_desc)?;
        let problem = PoolingProblem::resolve(&op, &x_layout, &y_layout)?;
        if args.x == args.y {
            return Err(PoolError::device_failure("pooling_forward", "in-place pooling is not supported"));
        }

        let mut memory = self.memory(device)?;
        let mut y = memory.take(args.y, problem.output_len())?;
        let result = memory
            .get(args.x, problem.input_len())
            .and_then(|x| pool_forward(&problem, x, &mut y));
        memory.buffers.insert(args.y, y);
        result
    }

    fn pooling_backward(&self, device: usize, args: &PoolingBackward) -> Result<()> {
        let op = self.descriptors.pooling(args.pooling)?;
        let x_layout = self.descriptors.tensor(args.x_desc)?;
        let y_layout = self.descriptors.tensor(args.y_desc)?;
        let problem = PoolingProblem::resolve(&op, &x_layout, &y_layout)?;
        if self.descriptors.tensor(args.dy_desc)?.dims != y_layout.dims
            || self.descriptors.tensor(args.dx_desc)?.dims != x_layout.dims
        {
            return Err(PoolError::device_failure(
                "pooling_backward",
                "gradient descriptors must match their forward counterparts",
            ));
        }
        if [args.x, args.y, args.dy].contains(&args.dx) {
            return Err(PoolError::device_failure("pooling_backward", "in-place pooling is not supported"));
        }

        let mut memory = self.memory(device)?;
        let mut dx = memory.take(args.dx, problem.input_len())?;
        let result = memory.get(args.y, problem.output_len()).and_then(|_| {
            let x = memory.get(args.x, problem.input_len())?;
            let dy = memory.get(args.dy, problem.output_len())?;
            pool_backward(&problem, x, dy, &mut dx)
        });
        memory.buffers.insert(args.dx, dx);
        result
    }

    fn synchronize(&self, device: usize) -> Result<()> {
        // Work completes inside the enqueue call
        self.memory(device).map(|_| ())
    }
}

/// Reduce the window at `position` over one channel plane
fn reduce_window(problem: &PoolingProblem, plane: &[f32], position: usize) -> f32 {
    let mut max = f32::NEG_INFINITY;
    let mut saw_nan = false;
    let mut sum = 0.0f32;
    let mut count = 0usize;
    problem.geometry.for_each_window_element(position, |_, index| {
        if let Some(s) = index {
            let v = plane[s];
            saw_nan |= v.is_nan();
            if v > max {
                max = v;
            }
            sum += v;
            count += 1;
        }
    });

    match problem.mode {
        PoolMode::Max if saw_nan && problem.propagate_nan => f32::NAN,
        PoolMode::Max if count == 0 => 0.0,
        PoolMode::Max => max,
        PoolMode::Average => sum / problem.geometry.window_size() as f32,
        PoolMode::AverageNoPad if count == 0 => 0.0,
        PoolMode::AverageNoPad => sum / count as f32,
    }
}

/// Direct pooling forward over packed `(batch, channels, spatial...)` tensors
pub fn pool_forward(problem: &PoolingProblem, x: &[f32], y: &mut [f32]) -> Result<()> {
    let geometry = &problem.geometry;
    let (in_len, out_len) = (geometry.input_len(), geometry.output_len());
    let (in_size, out_size) = (geometry.input_size(), geometry.output_size());
    let mut output = ArrayViewMut2::from_shape((problem.batch, out_len), y)
        .map_err(|e| PoolError::device_failure("pooling_forward", e))?;

    Zip::indexed(output.axis_iter_mut(Axis(0))).par_for_each(|n, mut sample| {
        let input = &x[n * in_len..(n + 1) * in_len];
        for c in 0..geometry.channels() {
            let plane = &input[c * in_size..(c + 1) * in_size];
            for j in 0..out_size {
                sample[c * out_size + j] = reduce_window(problem, plane, j);
            }
        }
    });
    Ok(())
}

/// Direct pooling backward; max windows route the gradient to their first maximal element
pub fn pool_backward(problem: &PoolingProblem, x: &[f32], dy: &[f32], dx: &mut [f32]) -> Result<()> {
    let geometry = &problem.geometry;
    let (in_len, out_len) = (geometry.input_len(), geometry.output_len());
    let (in_size, out_size) = (geometry.input_size(), geometry.output_size());
    let window_size = geometry.window_size() as f32;
    let mut gradient = ArrayViewMut2::from_shape((problem.batch, in_len), dx)
        .map_err(|e| PoolError::device_failure("pooling_backward", e))?;

    Zip::indexed(gradient.axis_iter_mut(Axis(0))).par_for_each(|n, mut sample| {
        sample.fill(0.0);
        let input = &x[n * in_len..(n + 1) * in_len];
        for c in 0..geometry.channels() {
            let plane = &input[c * in_size..(c + 1) * in_size];
            let base = c * in_size;
            for j in 0..out_size {
                let grad = dy[n * out_len + c * out_size + j];
                match problem.mode {
                    PoolMode::Max => {
                        let mut best: Option<(usize, f32)> = None;
                        geometry.for_each_window_element(j, |_, index| {
                            if let Some(s) = index {
                                let v = plane[s];
                                let better = match best {
                                    None => true,
                                    Some((_, b)) if b.is_nan() => false,
                                    Some((_, b)) => v > b || (problem.propagate_nan && v.is_nan()),
                                };
                                if better {
                                    best = Some((s, v));
                                }
                            }
                        });
                        if let Some((s, _)) = best {
                            sample[base + s] += grad;
                        }
                    }
                    PoolMode::Average => {
                        geometry.for_each_window_element(j, |_, index| {
                            if let Some(s) = index {
                                sample[base + s] += grad / window_size;
                            }
                        });
                    }
                    PoolMode::AverageNoPad => {
                        let mut count = 0usize;
                        geometry.for_each_window_element(j, |_, index| count += index.is_some() as usize);
                        if count > 0 {
                            let share = grad / count as f32;
                            geometry.for_each_window_element(j, |_, index| {
                                if let Some(s) = index {
                                    sample[base + s] += share;
                                }
                            });
                        }
                    }
                }
            }
        }
    });
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use crate::gpu::backend::DataType;
    use crate::tensor::PoolWindow;

    fn problem(mode: PoolMode, batch: usize, channels: usize, dims: &[usize], window: PoolWindow) -> PoolingProblem {
        let op = PoolingOp { mode, window, propagate_nan: true };
        let mut x_dims = vec![batch, channels];
        x_dims.extend_from_slice(dims);
        let x = TensorLayout::packed(DataType::Float32, &x_dims);
        let y = TensorLayout::packed(DataType::Float32, &forward_output_dims(&op, &x).unwrap());
        PoolingProblem::resolve(&op, &x, &y).unwrap()
    }

    #[test]
    fn test_max_ignores_padding() {
        let p = problem(PoolMode::Max, 1, 1, &[2, 2], PoolWindow::uniform(2, 2, 1, 2).unwrap());
        let x = [-1.0, -2.0, -3.0, -4.0];
        let mut y = [0.0; 4];
        pool_forward(&p, &x, &mut y).unwrap();
        assert_eq!(y, [-1.0, -2.0, -3.0, -4.0]);
    }

    #[test]
    fn test_average_variants_at_border() {
        // length 3, window 2, pad 1, stride 2 -> windows [pad, 0], [1, 2]
        let window = PoolWindow::uniform(1, 2, 1, 2).unwrap();
        let x = [4.0, 2.0, 6.0];

        let p = problem(PoolMode::Average, 1, 1, &[3], window.clone());
        let mut y = [0.0; 2];
        pool_forward(&p, &x, &mut y).unwrap();
        assert_eq!(y, [2.0, 4.0]);

        let p = problem(PoolMode::AverageNoPad, 1, 1, &[3], window);
        pool_forward(&p, &x, &mut y).unwrap();
        assert_eq!(y, [4.0, 4.0]);

        let mut dx = [0.0; 3];
        pool_backward(&p, &x, &[1.0, 1.0], &mut dx).unwrap();
        assert_eq!(dx, [1.0, 0.5, 0.5]);
    }

    #[test]
    fn test_nan_propagates_through_max() {
        let p = problem(PoolMode::Max, 1, 1, &[4], PoolWindow::uniform(1, 2, 0, 2).unwrap());
        let x = [1.0, f32::NAN, 3.0, 2.0];
        let mut y = [0.0; 2];
        pool_forward(&p, &x, &mut y).unwrap();
        assert!(y[0].is_nan());
        assert_eq!(y[1], 3.0);

        let mut dx = [0.0; 4];
        pool_backward(&p, &x, &[5.0, 7.0], &mut dx).unwrap();
        assert_eq!(dx, [0.0, 5.0, 7.0, 0.0]);
    }

    #[test]
    fn test_device_memory_is_isolated() {
        let backend = HostDeviceBackend::new(2);
        let a = backend.allocate(0, 3).unwrap();
        backend.write(0, a, &[1.0, 2.0, 3.0]).unwrap();

        // Same id does not exist on the other device
        let mut out = [0.0; 3];
        assert!(backend.read(1, a, &mut out).is_err());
        backend.read(0, a, &mut out).unwrap();
        assert_eq!(out, [1.0, 2.0, 3.0]);

        assert!(backend.write(0, a, &[1.0]).is_err());
        backend.deallocate(0, a);
        assert_eq!(backend.live_buffers(), 0);
        assert!(backend.allocate(2, 1).is_err());
    }

    #[test]
    fn test_forward_through_trait() {
        let backend: Arc<dyn DeviceBackend> = Arc::new(HostDeviceBackend::new(1));
        let op = PoolingOp {
            mode: PoolMode::Max,
            window: PoolWindow::uniform(1, 2, 0, 2).unwrap(),
            propagate_nan: true,
        };
        let pooling = backend.create_pooling_descriptor(&op).unwrap();
        let x_desc = backend
            .create_tensor_descriptor(&TensorLayout::packed(DataType::Float32, &[1, 1, 4]))
            .unwrap();
        let y_desc = backend
            .create_tensor_descriptor(&TensorLayout::packed(DataType::Float32, &[1, 1, 2]))
            .unwrap();
        let x = backend.allocate(0, 4).unwrap();
        let y = backend.allocate(0, 2).unwrap();
        backend.write(0, x, &[3.0, 1.0, 2.0, 8.0]).unwrap();

        let args = PoolingForward { pooling, x_desc, x, y_desc, y };
        backend.pooling_forward(0, &args).unwrap();
        backend.synchronize(0).unwrap();

        let mut out = [0.0; 2];
        backend.read(0, y, &mut out).unwrap();
        assert_eq!(out, [3.0, 8.0]);

        let in_place = PoolingForward { y: x, ..args };
        assert!(backend.pooling_forward(0, &in_place).is_err());
    }
}
