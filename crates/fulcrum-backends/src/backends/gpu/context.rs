//! GPU execution context
//!
//! Everything a context issues lands on its own [`CommandStream`] and runs
//! in issue order. `graph_compute` only validates and encodes; kernels run
//! later on the stream, so a kernel failure is reported by the stream's
//! sticky error rather than by the call that issued it.

use super::encoder;
use super::event::{gpu_event, GpuEvent};
use super::memory::{device_region, DeviceAccess};
use super::stream::CommandStream;
use super::GpuDevice;
use crate::backend::{
    AbortCallback, Backend, BackendFamily, ComputeStatus, Device, DeviceRef, Event, PendingRead,
};
use crate::backends::common::HostMemory;
use crate::error::{BackendError, Result};
use crate::tensor::{ComputeGraph, Tensor, TensorRef};
use fulcrum_tracing::performance;
use std::any::Any;
use std::sync::atomic::Ordering;
use std::sync::Arc;

pub struct GpuBackend {
    device: Arc<GpuDevice>,
    stream: Arc<CommandStream>,
    abort: Option<AbortCallback>,
}

impl GpuBackend {
    pub fn new(device: Arc<GpuDevice>) -> Result<Self> {
        let id = device.contexts.fetch_add(1, Ordering::Relaxed);
        let stream = CommandStream::spawn(format!("{}-ctx{id}", device.name))?;
        tracing::debug!(device = %device.name, stream = stream.name(), "GPU context created");
        Ok(Self {
            device,
            stream,
            abort: None,
        })
    }

    pub fn stream(&self) -> &Arc<CommandStream> {
        &self.stream
    }

    /// Clear and return the first kernel failure recorded by the stream.
    pub fn take_error(&self) -> Option<BackendError> {
        self.stream.take_error()
    }

    /// Device memory behind `tensor` and the absolute offset of byte
    /// `offset` within it, after checking `size` bytes fit the tensor.
    fn locate(&self, tensor: &Tensor, offset: usize, size: usize) -> Result<(HostMemory, usize)> {
        if offset.checked_add(size).is_none_or(|end| end > tensor.nbytes()) {
            return Err(BackendError::BufferOutOfBounds {
                offset,
                size,
                buffer_size: tensor.nbytes(),
            });
        }
        let storage = tensor.storage_or_err()?;
        let region = device_region(&storage.buffer)
            .ok_or_else(|| BackendError::invalid_tensor(tensor.name(), "not in GPU memory"))?;
        Ok((Arc::clone(region), storage.offset + offset))
    }

    /// Whether every buffer `node` touches is one of this device's own.
    fn reachable(&self, node: &Tensor) -> bool {
        std::iter::once(node)
            .chain(node.srcs().map(|s| s.as_ref()))
            .filter_map(|t| t.buffer())
            .all(|buffer| self.device.supports_buft(buffer.buffer_type().as_ref()))
    }

    fn aborted(&self) -> bool {
        self.abort.as_ref().is_some_and(|abort| abort())
    }

    fn encode(&self, groups: &[Vec<TensorRef>], dispatched: &mut usize) -> ComputeStatus {
        let device = &self.device;
        for group in groups {
            let (Some(head), Some(out)) = (group.first(), group.last()) else {
                continue;
            };
            if self.aborted() {
                tracing::warn!(device = %device.name, node = head.name(), "graph aborted");
                return ComputeStatus::Aborted;
            }
            for node in group {
                if !device.supports_op(node) {
                    crate::fatal!(
                        "{}: unsupported op {} ({}) on node {}",
                        device.name,
                        node.op(),
                        node.dtype(),
                        node.name()
                    );
                }
            }
            if !group.iter().all(|node| self.reachable(node)) {
                tracing::warn!(device = %device.name, node = head.name(), "node bound to memory this device cannot reach");
                return ComputeStatus::Unsupported;
            }
            let pipelines = match device.library.pipelines_for(group) {
                Ok(pipelines) => pipelines,
                Err(err) => {
                    tracing::error!(
                        device = %device.name,
                        node = head.name(),
                        op = %head.op(),
                        error = %err,
                        "no pipeline for node"
                    );
                    return ComputeStatus::ComputeError;
                }
            };
            for pipeline in &pipelines {
                let launch = encoder::launch_config(pipeline, out);
                if launch.shared_memory > device.config.max_threadgroup_memory {
                    tracing::error!(
                        device = %device.name,
                        node = head.name(),
                        pipeline = %pipeline.key(),
                        smem = launch.shared_memory,
                        max = device.config.max_threadgroup_memory,
                        "threadgroup memory exceeds device limit"
                    );
                    return ComputeStatus::ComputeError;
                }
                tracing::debug!(device = %device.name, pipeline = %pipeline.key(), %launch, n_fuse = group.len(), "dispatch");
            }
            let group = group.clone();
            self.stream.submit("dispatch", move || {
                for pipeline in &pipelines {
                    pipeline.kernel().launch(&group, &DeviceAccess)?;
                }
                Ok(())
            });
            *dispatched += 1;
        }
        ComputeStatus::Success
    }
}

impl Backend for GpuBackend {
    fn name(&self) -> &str {
        &self.device.name
    }

    fn family(&self) -> BackendFamily {
        BackendFamily::Gpu
    }

    fn device(&self) -> DeviceRef {
        Arc::clone(&self.device) as DeviceRef
    }

    fn set_tensor_async(&self, tensor: &Tensor, data: Vec<u8>, offset: usize) -> Result<()> {
        let (region, at) = self.locate(tensor, offset, data.len())?;
        self.stream.submit("set_tensor", move || region.write(at, &data));
        Ok(())
    }

    fn get_tensor_async(&self, tensor: &Tensor, offset: usize, size: usize) -> Result<PendingRead> {
        let (region, at) = self.locate(tensor, offset, size)?;
        let (tx, pending) = PendingRead::channel();
        self.stream.submit("get_tensor", move || {
            let _ = tx.send(region.read_vec(at, size));
            Ok(())
        });
        Ok(pending)
    }

    fn cpy_tensor_async(&self, dst_backend: &dyn Backend, src: &Tensor, dst: &Tensor) -> bool {
        if dst_backend.family() != BackendFamily::Gpu {
            return false;
        }
        let Some(dst_ctx) = dst_backend.as_any().downcast_ref::<GpuBackend>() else {
            return false;
        };
        let (Some(src_storage), Some(dst_storage)) = (src.storage(), dst.storage()) else {
            return false;
        };
        if src_storage.buffer.family() != BackendFamily::Gpu
            || dst_storage.buffer.family() != BackendFamily::Gpu
            || src.nbytes() != dst.nbytes()
        {
            return false;
        }
        let (Some(from), Some(to)) = (device_region(&src_storage.buffer), device_region(&dst_storage.buffer)) else {
            return false;
        };
        let (from, to) = (Arc::clone(from), Arc::clone(to));
        let (src_offset, dst_offset, size) = (src_storage.offset, dst_storage.offset, src.nbytes());
        self.stream
            .submit("copy_tensor", move || to.copy_from(&from, src_offset, dst_offset, size));

        // the destination stream must not touch dst before the copy lands
        let done = GpuEvent::new();
        done.record(&self.stream);
        if let Some(mark) = done.mark() {
            dst_ctx.stream.submit("wait_copy", move || {
                mark.wait();
                Ok(())
            });
        }
        tracing::debug!(src = src.name(), dst = dst.name(), size, to = dst_ctx.name(), "cross-context copy");
        true
    }

    fn synchronize(&self) {
        self.stream.synchronize();
        if let Some(err) = self.stream.error_message() {
            tracing::error!(device = %self.device.name, stream = self.stream.name(), error = %err, "stream reported a failure");
        }
    }

    #[tracing::instrument(skip_all, fields(device = %self.device.name, n_nodes = graph.len()))]
    fn graph_compute(&self, graph: &ComputeGraph) -> ComputeStatus {
        if let Some(err) = self.stream.error_message() {
            tracing::error!(error = %err, "earlier stream failure not yet retrieved");
            return ComputeStatus::ComputeError;
        }
        let ((status, dispatched), duration_us) = fulcrum_tracing::timed_block!("graph_compute", {
            let groups = encoder::fuse(graph.nodes(), self.device.config.use_fusion);
            fulcrum_tracing::perf_event!("graph_fused", nodes = graph.len(), groups = groups.len());
            let mut dispatched = 0;
            let status = self.encode(&groups, &mut dispatched);
            (status, dispatched)
        });
        performance::record_graph(&self.device.name, graph.len(), dispatched, duration_us);
        status
    }

    fn event_record(&self, event: &Event) {
        gpu_event(&self.device.name, event).record(&self.stream);
    }

    fn event_wait(&self, event: &Event) {
        if let Some(mark) = gpu_event(&self.device.name, event).mark() {
            self.stream.submit("event_wait", move || {
                mark.wait();
                Ok(())
            });
        }
    }

    fn set_abort_callback(&mut self, callback: Option<AbortCallback>) {
        self.abort = callback;
    }

    fn as_any(&self) -> &dyn Any {
        self
    }
}

impl Drop for GpuBackend {
    fn drop(&mut self) {
        self.stream.synchronize();
        tracing::debug!(device = %self.device.name, stream = self.stream.name(), "GPU context released");
    }
}
