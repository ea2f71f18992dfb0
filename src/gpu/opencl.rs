//! OpenCL device backend
//!
//! Every device of the selected platform gets its own queue; buffers live on
//! the device they were allocated for. Pooling runs through the kernels in
//! `kernels/pooling.cl`, one work item per output (forward) or per input
//! element (backward).

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;
use ocl::enums::{DeviceInfo, DeviceInfoResult};
use ocl::{flags, Buffer, Context, Device, Kernel, Platform, Program, Queue};
use ocl::DeviceType as OclDeviceType;
use crate::error::{PoolError, Result};
use crate::layers::PoolMode;
use super::backend::{
    BufferId, DescriptorId, DeviceBackend, DeviceType, PoolingBackward, PoolingForward, PoolingOp,
    PoolingProblem, TensorLayout, forward_output_dims,
};
use super::constants::{
    KERNEL_GEOMETRY_LEN, KERNEL_MODE_AVERAGE, KERNEL_MODE_AVERAGE_NO_PAD, KERNEL_MODE_MAX, MAX_SPATIAL_DIMS,
};
use super::descriptor::{DescriptorEntry, DescriptorTable};

const POOLING_KERNELS: &str = include_str!("kernels/pooling.cl");

struct OclDevice {
    device: Device,
    queue: Queue,
    buffers: Mutex<HashMap<BufferId, Buffer<f32>>>,
}

/// Pooling backend on OpenCL devices
pub struct OpenClBackend {
    devices: Vec<OclDevice>,
    program: Program,
    device_type: DeviceType,
    descriptors: DescriptorTable,
    next_buffer: AtomicU64,
}

impl OpenClBackend {
    /// Use every device of the best available platform
    pub fn new() -> Result<Self> {
        Self::with_max_devices(usize::MAX)
    }

    /// Use at most `max_devices` devices of the best available platform
    pub fn with_max_devices(max_devices: usize) -> Result<Self> {
        let (platform, mut devices, device_type) = find_devices()?;
        devices.truncate(max_devices.max(1));

        let context = Context::builder().platform(platform).devices(&devices[..]).build()?;
        let program = Program::builder()
            .source(POOLING_KERNELS)
            .devices(&devices[..])
            .build(&context)?;

        let devices = devices
            .into_iter()
            .map(|device| {
                Ok(OclDevice {
                    device,
                    queue: Queue::new(&context, device, None)?,
                    buffers: Mutex::new(HashMap::new()),
                })
            })
            .collect::<Result<Vec<_>>>()?;

        log::info!("OpenCL backend on {} {:?} device(s)", devices.len(), device_type);
        Ok(OpenClBackend {
            devices,
            program,
            device_type,
            descriptors: DescriptorTable::new(),
            next_buffer: AtomicU64::new(0),
        })
    }

    fn device(&self, device: usize) -> Result<&OclDevice> {
        self.devices.get(device).ok_or_else(|| {
            PoolError::device_failure(
                "select_device",
                format!("device {} out of range ({} devices)", device, self.devices.len()),
            )
        })
    }

    fn buffer(&self, device: usize, id: BufferId, len: usize) -> Result<Buffer<f32>> {
        let buffers = self
            .device(device)?
            .buffers
            .lock()
            .map_err(|_| PoolError::device_failure("buffer_lookup", format!("device {} poisoned", device)))?;
        let buffer = buffers
            .get(&id)
            .ok_or_else(|| PoolError::device_failure("buffer_lookup", format!("unknown buffer {:?}", id)))?;
        if buffer.len() != len {
            return Err(PoolError::device_failure(
                "buffer_lookup",
                format!("buffer {:?} holds {} elements, descriptor needs {}", id, buffer.len(), len),
            ));
        }
        Ok(buffer.clone())
    }

    fn geometry_buffer(&self, device: &OclDevice, problem: &PoolingProblem) -> Result<Buffer<i32>> {
        let words = kernel_geometry(problem)?;
        let buffer = Buffer::<i32>::builder()
            .queue(device.queue.clone())
            .flags(flags::MEM_READ_ONLY)
            .len(words.len())
            .copy_host_slice(&words)
            .build()?;
        Ok(buffer)
    }

    fn problem(&self, pooling: DescriptorId, x_desc: DescriptorId, y_desc: DescriptorId) -> Result<PoolingProblem> {
        let op = self.descriptors.pooling(pooling)?;
        let x = self.descriptors.tensor(x_desc)?;
        let y = self.descriptors.tensor(y_desc)?;
        PoolingProblem::resolve(&op, &x, &y)
    }
}

impl DeviceBackend for OpenClBackend {
    fn device_type(&self) -> DeviceType {
        self.device_type
    }

    fn num_devices(&self) -> usize {
        self.devices.len()
    }

    fn device_info(&self, device: usize) -> Result<String> {
        let device = self.device(device)?.device;
        let name = device.name().map_err(|e| PoolError::device_failure("device_info", e))?;
        let vendor = device.vendor().map_err(|e| PoolError::device_failure("device_info", e))?;
        let version = device.version().map_err(|e| PoolError::device_failure("device_info", e))?;
        let compute_units = match device
            .info(DeviceInfo::MaxComputeUnits)
            .map_err(|e| PoolError::device_failure("device_info", e))?
        {
            DeviceInfoResult::MaxComputeUnits(units) => units,
            _ => 0,
        };
        Ok(format!(
            "Device: {}\nVendor: {}\nVersion: {}\nCompute Units: {}",
            name, vendor, version, compute_units
        ))
    }

    fn allocate(&self, device: usize, len: usize) -> Result<BufferId> {
        if len == 0 {
            return Err(PoolError::device_failure("allocate", "zero-length buffers are not supported"));
        }
        let target = self.device(device)?;
        let buffer = Buffer::<f32>::builder()
            .queue(target.queue.clone())
            .flags(flags::MEM_READ_WRITE)
            .len(len)
            .fill_val(0.0f32)
            .build()?;
        let id = BufferId(self.next_buffer.fetch_add(1, Ordering::Relaxed));
        target
            .buffers
            .lock()
            .map_err(|_| PoolError::device_failure("allocate", format!("device {} poisoned", device)))?
            .insert(id, buffer);
        Ok(id)
    }

    fn deallocate(&self, device: usize, buffer: BufferId) {
        if let Ok(target) = self.device(device) {
            if let Ok(mut buffers) = target.buffers.lock() {
                buffers.remove(&buffer);
            }
        }
    }

    fn write(&self, device: usize, buffer: BufferId, data: &[f32]) -> Result<()> {
        self.buffer(device, buffer, data.len())?.write(data).enq()?;
        Ok(())
    }

    fn read(&self, device: usize, buffer: BufferId, out: &mut [f32]) -> Result<()> {
        self.buffer(device, buffer, out.len())?.read(out).enq()?;
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
        if op.window.num_spatial_dims() > MAX_SPATIAL_DIMS {
            return Err(PoolError::device_failure(
                "create_pooling_descriptor",
                format!(
                    "{} spatial dims requested, kernels support at most {}",
                    op.window.num_spatial_dims(),
                    MAX_SPATIAL_DIMS
                ),
            ));
        }
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
        let problem = self.problem(args.pooling, args.x_desc, args.y_desc)?;
        if args.x == args.y {
            return Err(PoolError::device_failure("pooling_forward", "in-place pooling is not supported"));
        }
        let target = self.device(device)?;
        let x = self.buffer(device, args.x, problem.input_len())?;
        let y = self.buffer(device, args.y, problem.output_len())?;
        let geometry = self.geometry_buffer(target, &problem)?;

        let kernel = Kernel::builder()
            .program(&self.program)
            .name("pool_forward")
            .queue(target.queue.clone())
            .arg(&x)
            .arg(&y)
            .arg(&geometry)
            .arg(problem.geometry.channels() as i32)
            .arg(problem.batch as i32)
            .arg(kernel_mode(problem.mode))
            .arg(problem.propagate_nan as i32)
            .build()?;

        unsafe {
            kernel.cmd().global_work_size(problem.output_len()).enq()?;
        }
        Ok(())
    }

    fn pooling_backward(&self, device: usize, args: &PoolingBackward) -> Result<()> {
        let problem = self.problem(args.pooling, args.x_desc, args.y_desc)?;
        if self.descriptors.tensor(args.dy_desc)?.dims != self.descriptors.tensor(args.y_desc)?.dims
            || self.descriptors.tensor(args.dx_desc)?.dims != self.descriptors.tensor(args.x_desc)?.dims
        {
            return Err(PoolError::device_failure(
                "pooling_backward",
                "gradient descriptors must match their forward counterparts",
            ));
        }
        if [args.x, args.y, args.dy].contains(&args.dx) {
            return Err(PoolError::device_failure("pooling_backward", "in-place pooling is not supported"));
        }
        let target = self.device(device)?;
        let x = self.buffer(device, args.x, problem.input_len())?;
        let dy = self.buffer(device, args.dy, problem.output_len())?;
        let dx = self.buffer(device, args.dx, problem.input_len())?;
        let geometry = self.geometry_buffer(target, &problem)?;

        let kernel = Kernel::builder()
            .program(&self.program)
            .name("pool_backward")
            .queue(target.queue.clone())
            .arg(&x)
            .arg(&dy)
            .arg(&dx)
            .arg(&geometry)
            .arg(problem.geometry.channels() as i32)
            .arg(problem.batch as i32)
            .arg(kernel_mode(problem.mode))
            .arg(problem.propagate_nan as i32)
            .build()?;

        unsafe {
            kernel.cmd().global_work_size(problem.input_len()).enq()?;
        }
        Ok(())
    }

    fn synchronize(&self, device: usize) -> Result<()> {
        self.device(device)?.queue.finish()?;
        Ok(())
    }
}

fn kernel_mode(mode: PoolMode) -> i32 {
    match mode {
        PoolMode::Max => KERNEL_MODE_MAX,
        PoolMode::Average => KERNEL_MODE_AVERAGE,
        PoolMode::AverageNoPad => KERNEL_MODE_AVERAGE_NO_PAD,
    }
}

/// Pack geometry into the word layout the kernels read
fn kernel_geometry(problem: &PoolingProblem) -> Result<Vec<i32>> {
    let geometry = &problem.geometry;
    let window = geometry.window();
    let nd = geometry.input_dims().len();
    if nd > MAX_SPATIAL_DIMS {
        return Err(PoolError::device_failure(
            "pooling",
            format!("{} spatial dims exceed kernel limit {}", nd, MAX_SPATIAL_DIMS),
        ));
    }

    let mut words = vec![0i32; KERNEL_GEOMETRY_LEN];
    words[0] = nd as i32;
    for d in 0..nd {
        words[1 + d] = geometry.input_dims()[d] as i32;
        words[1 + MAX_SPATIAL_DIMS + d] = geometry.output_dims()[d] as i32;
        words[1 + 2 * MAX_SPATIAL_DIMS + d] = window.dims[d] as i32;
        words[1 + 3 * MAX_SPATIAL_DIMS + d] = window.pads[d] as i32;
        words[1 + 4 * MAX_SPATIAL_DIMS + d] = window.strides[d] as i32;
    }
    Ok(words)
}

fn gpu_kind(vendor: &str) -> DeviceType {
    if vendor.contains("Intel") {
        DeviceType::IntelGpu
    } else if vendor.contains("NVIDIA") {
        DeviceType::NvidiaGpu
    } else if vendor.contains("AMD") || vendor.contains("Advanced Micro Devices") {
        DeviceType::AmdGpu
    } else {
        DeviceType::OtherGpu
    }
}

fn preference(kind: DeviceType) -> u8 {
    match kind {
        DeviceType::IntelGpu => 0,
        DeviceType::NvidiaGpu => 1,
        DeviceType::AmdGpu => 2,
        DeviceType::OtherGpu => 3,
        DeviceType::OpenClCpu | DeviceType::Host => 4,
    }
}

fn has_type(device: &Device, wanted: OclDeviceType) -> Result<bool> {
    match device
        .info(DeviceInfo::Type)
        .map_err(|e| PoolError::device_failure("list_devices", e))?
    {
        DeviceInfoResult::Type(kind) => Ok(kind.contains(wanted)),
        _ => Ok(false),
    }
}

/// Pick one platform and all of its devices.
///
/// Priority: Intel GPU > NVIDIA GPU > AMD GPU > any GPU > CPU device.
fn find_devices() -> Result<(Platform, Vec<Device>, DeviceType)> {
    let platforms = std::panic::catch_unwind(Platform::list)
        .map_err(|_| PoolError::BackendUnavailable("OpenCL runtime not available".to_string()))?;
    if platforms.is_empty() {
        return Err(PoolError::BackendUnavailable("no OpenCL platforms found".to_string()));
    }

    let mut best: Option<(Platform, Vec<Device>, DeviceType)> = None;
    for platform in &platforms {
        let devices = Device::list_all(platform).map_err(|e| PoolError::device_failure("list_devices", e))?;

        let mut gpus = Vec::new();
        let mut cpus = Vec::new();
        for device in devices {
            if has_type(&device, OclDeviceType::GPU)? {
                gpus.push(device);
            } else if has_type(&device, OclDeviceType::CPU)? {
                cpus.push(device);
            }
        }

        let candidate = if let Some(first) = gpus.first() {
            let vendor = first.vendor().map_err(|e| PoolError::device_failure("list_devices", e))?;
            (*platform, gpus, gpu_kind(&vendor))
        } else if !cpus.is_empty() {
            (*platform, cpus, DeviceType::OpenClCpu)
        } else {
            continue;
        };

        let better = match &best {
            None => true,
            Some((_, _, kind)) => preference(candidate.2) < preference(*kind),
        };
        if better {
            best = Some(candidate);
        }
    }

    match best {
        Some((platform, devices, kind)) => {
            if kind == DeviceType::OpenClCpu {
                log::warn!("no OpenCL GPU found, using CPU OpenCL device(s)");
            }
            Ok((platform, devices, kind))
        }
        None => Err(PoolError::BackendUnavailable(
            "no OpenCL device found (neither GPU nor CPU)".to_string(),
        )),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::gpu::backend::{DataType, PoolingOp};
    use crate::tensor::PoolWindow;

    #[test]
    fn test_kernel_geometry_layout() {
        let op = PoolingOp {
            mode: PoolMode::Max,
            window: PoolWindow::new(vec![3, 2], vec![1, 0], vec![2, 1]).unwrap(),
            propagate_nan: true,
        };
        let x = TensorLayout::packed(DataType::Float32, &[2, 4, 7, 5]);
        let y = TensorLayout::packed(DataType::Float32, &forward_output_dims(&op, &x).unwrap());
        let problem = PoolingProblem::resolve(&op, &x, &y).unwrap();

        let words = kernel_geometry(&problem).unwrap();
        assert_eq!(words.len(), KERNEL_GEOMETRY_LEN);
        assert_eq!(words[0], 2);
        assert_eq!(&words[1..3], &[7, 5]);
        assert_eq!(&words[4..6], &[4, 4]);
        assert_eq!(&words[7..9], &[3, 2]);
        assert_eq!(&words[10..12], &[1, 0]);
        assert_eq!(&words[13..15], &[2, 1]);
    }

    #[test]
    fn test_vendor_preference() {
        assert_eq!(gpu_kind("Intel(R) Corporation"), DeviceType::IntelGpu);
        assert_eq!(gpu_kind("Advanced Micro Devices, Inc."), DeviceType::AmdGpu);
        assert!(preference(DeviceType::NvidiaGpu) < preference(DeviceType::OtherGpu));
        assert!(preference(DeviceType::OtherGpu) < preference(DeviceType::OpenClCpu));
    }
}
