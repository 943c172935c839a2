//! Buffer allocation, host access, events and cross-context copies

#![cfg(feature = "gpu")]

use fulcrum_backends::backend::{BackendFamily, BackendReg, ComputeStatus, DeviceRef, Event, MemoryKind};
use fulcrum_backends::backends::common::MemoryRegion;
use fulcrum_backends::backends::gpu::{BufferPolicy, GpuBackendReg};
use fulcrum_backends::config::{GpuDeviceConfig, RuntimeConfig};
use fulcrum_backends::tensor::{ComputeGraph, DataType, Op, Tensor};
use fulcrum_backends::{BackendError, CpuBackendReg, GpuDevice, Result};
use std::sync::Arc;
use std::time::Duration;

fn gpu_devices(n: usize, gpu: GpuDeviceConfig) -> Vec<DeviceRef> {
    fulcrum_tracing::init_for_tests();
    let reg = GpuBackendReg::new(&RuntimeConfig::default().with_gpu_devices(n).with_gpu(gpu));
    (0..reg.device_count()).map(|i| reg.device(i)).collect()
}

fn gpu_device() -> DeviceRef {
    gpu_devices(1, GpuDeviceConfig::default()).remove(0)
}

#[test]
fn test_memset_reads_back() -> Result<()> {
    for shared in [true, false] {
        let device = gpu_devices(1, GpuDeviceConfig::default().with_shared_buffers(shared)).remove(0);
        let buffer = device.buffer_type().alloc_buffer(1024)?;
        assert_eq!(buffer.size(), 1024);
        assert_eq!(buffer.memory_kind() == MemoryKind::Shared, shared);

        buffer.memset(0, 0xAB, 1024)?;
        assert!(buffer.read(0, 1024)?.iter().all(|&b| b == 0xAB));

        buffer.clear(0)?;
        assert_eq!(buffer.read(1000, 24)?, vec![0; 24]);
    }
    Ok(())
}

#[test]
fn test_allocation_accounting() -> Result<()> {
    let mib = 1024 * 1024;
    let device = gpu_devices(
        1,
        GpuDeviceConfig::default().with_memory_size(4 * mib).with_max_buffer_size(2 * mib),
    )
    .remove(0);
    let buft = device.buffer_type();
    assert_eq!(device.memory(), (4 * mib, 4 * mib));

    let first = buft.alloc_buffer(2 * mib)?;
    assert_eq!(device.memory().0, 2 * mib);

    let too_big = buft.alloc_buffer(2 * mib + 1).unwrap_err();
    assert!(matches!(too_big, BackendError::AllocationFailed { .. }));

    let second = buft.alloc_buffer(2 * mib)?;
    assert!(buft.alloc_buffer(1).is_err(), "pool is exhausted");

    drop(first);
    drop(second);
    assert_eq!(device.memory().0, 4 * mib);
    Ok(())
}

#[test]
fn test_buffer_from_host_memory() -> Result<()> {
    let device = gpu_device();
    let host = MemoryRegion::shared(4096);
    host.write(0, &[7u8; 16])?;

    let buffer = device.buffer_from_host(host.clone(), 4096)?;
    assert_eq!(buffer.read(0, 16)?, vec![7; 16]);
    buffer.memset(0, 1, 4)?;
    assert_eq!(host.read_vec(0, 4)?, vec![1; 4]);

    let gpu = device
        .as_any()
        .downcast_ref::<GpuDevice>()
        .ok_or_else(|| BackendError::Other("not a GPU device".into()))?;
    assert!(device.supports_buft(gpu.buffer_type_for(BufferPolicy::Mapped).as_ref()));
    Ok(())
}

#[test]
fn test_event_orders_host_reads() -> Result<()> {
    let device = gpu_device();
    let backend = device.init_backend(None)?;
    let t = Tensor::new_1d("t", DataType::F32, 256).into_ref();
    let buffer = device.buffer_type().alloc_buffer(t.nbytes())?;
    t.bind(&buffer, 0)?;

    let event = device.event_new().ok_or_else(|| BackendError::Other("no events".into()))?;
    let values: Vec<f32> = (0..256).map(|i| i as f32 * 0.5).collect();
    backend.set_tensor_async(&t, bytemuck::cast_slice(&values).to_vec(), 0)?;
    backend.event_record(&event);
    device.event_synchronize(&event);

    assert_eq!(t.to_f32_vec()?, values);
    Ok(())
}

#[test]
#[should_panic(expected = "foreign Cpu event")]
fn test_foreign_event_aborts() {
    let device = gpu_device();
    let backend = device.init_backend(None).unwrap();
    let event = Event::new("CPU", BackendFamily::Cpu, Box::new(()));
    backend.event_record(&event);
}

#[test]
fn test_copy_between_devices() -> Result<()> {
    let devices = gpu_devices(2, GpuDeviceConfig::default());
    let (src_dev, dst_dev) = (&devices[0], &devices[1]);
    let src_ctx = src_dev.init_backend(None)?;
    let dst_ctx = dst_dev.init_backend(None)?;

    let src = Tensor::new_1d("src", DataType::F32, 64).into_ref();
    let dst = Tensor::new_1d("dst", DataType::F32, 64).into_ref();
    let src_buf = src_dev.buffer_type().alloc_buffer(src.nbytes())?;
    let dst_buf = dst_dev.buffer_type().alloc_buffer(dst.nbytes())?;
    src.bind(&src_buf, 0)?;
    dst.bind(&dst_buf, 0)?;

    let values: Vec<f32> = (0..64).map(|i| -(i as f32)).collect();
    src_ctx.set_tensor_async(&src, bytemuck::cast_slice(&values).to_vec(), 0)?;
    assert!(src_ctx.cpy_tensor_async(dst_ctx.as_ref(), &src, &dst));

    // reads on the destination context are ordered after the copy
    let copied = dst_ctx.get_tensor_async(&dst, 0, dst.nbytes())?.wait()?;
    assert_eq!(bytemuck::pod_collect_to_vec::<u8, f32>(&copied), values);
    Ok(())
}

#[test]
fn test_copies_while_destination_computes() -> Result<()> {
    let devices = gpu_devices(2, GpuDeviceConfig::default());
    let src_ctx = Arc::new(devices[0].init_backend(None)?);
    let dst_ctx = Arc::new(devices[1].init_backend(None)?);

    let src = Tensor::new_1d("src", DataType::F32, 64).into_ref();
    let dst = Tensor::new_1d("dst", DataType::F32, 64).into_ref();
    let src_buf = devices[0].buffer_type().alloc_buffer(src.nbytes())?;
    src.bind(&src_buf, 0)?;
    let a = Tensor::new_1d("a", DataType::F32, 64).into_ref();
    let sum = Tensor::with_op("sum", Op::Add, DataType::F32, a.ne(), vec![Some(a.clone()), Some(a.clone())]).into_ref();
    let dst_buf = devices[1].buffer_type().alloc_buffer(3 * 256)?;
    dst.bind(&dst_buf, 0)?;
    a.bind(&dst_buf, 256)?;
    sum.bind(&dst_buf, 512)?;

    let values: Vec<f32> = (0..64).map(|i| i as f32).collect();
    src.set_f32(&values)?;
    a.set_f32(&values)?;
    let graph = ComputeGraph::build_forward(&[sum.clone()]);

    let copiers: Vec<_> = (0..4)
        .map(|_| {
            let (src_ctx, dst_ctx) = (Arc::clone(&src_ctx), Arc::clone(&dst_ctx));
            let (src, dst) = (src.clone(), dst.clone());
            std::thread::spawn(move || (0..50).all(|_| src_ctx.cpy_tensor_async(dst_ctx.as_ref().as_ref(), &src, &dst)))
        })
        .collect();
    for _ in 0..20 {
        assert_eq!(dst_ctx.graph_compute(&graph), ComputeStatus::Success);
    }
    for copier in copiers {
        assert!(copier.join().unwrap());
    }

    let (tx, rx) = crossbeam_channel::bounded(1);
    let (s, d) = (Arc::clone(&src_ctx), Arc::clone(&dst_ctx));
    std::thread::spawn(move || {
        s.synchronize();
        d.synchronize();
        let _ = tx.send(());
    });
    assert!(rx.recv_timeout(Duration::from_secs(10)).is_ok(), "contexts did not drain");

    assert_eq!(dst.to_f32_vec()?, values);
    assert_eq!(sum.to_f32_vec()?, values.iter().map(|v| v * 2.0).collect::<Vec<_>>());
    Ok(())
}

#[test]
fn test_copy_to_cpu_context_is_declined() -> Result<()> {
    let device = gpu_device();
    let ctx = device.init_backend(None)?;
    let cpu = CpuBackendReg::new(Default::default()).device(0).init_backend(None)?;

    let src = Tensor::new_1d("src", DataType::F32, 4).into_ref();
    let dst = Tensor::new_1d("dst", DataType::F32, 4).into_ref();
    assert!(!ctx.cpy_tensor_async(cpu.as_ref(), &src, &dst));
    assert_eq!(cpu.graph_compute(&Default::default()), ComputeStatus::Success);
    Ok(())
}
