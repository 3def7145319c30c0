//! Host-memory simulation of a set of accelerator devices.
//!
//! Each stream is a deferred in-order queue. Queued work runs when the host
//! synchronizes on the stream (or on an event it records), when a synchronous
//! device-to-host copy is issued on it, or when another stream that is being
//! drained waits on one of its events. Work on a stream that nobody waits for
//! stays queued, so a missing dependency shows up as stale data in tests
//! instead of being hidden by eager execution.

use std::collections::VecDeque;
use std::sync::{Mutex, MutexGuard};

use tracing::{debug, trace};

use super::{DeviceHeap, DeviceProperties, DevicePtr, Driver, Event, Kernel, MemInfo, Stream};
use crate::error::DriverError;

/// Shape of one simulated device.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SimDeviceSpec {
    pub name: String,
    pub total_memory: usize,
    pub capability: u32,
}

impl SimDeviceSpec {
    pub fn new(name: impl Into<String>, total_memory: usize, capability: u32) -> Self {
        Self {
            name: name.into(),
            total_memory,
            capability,
        }
    }
}

/// Per-device call counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SimStats {
    pub mallocs: usize,
    pub frees: usize,
    pub launches: usize,
    pub copies: usize,
    pub bytes_in_use: usize,
}

enum StreamOp {
    Kernel {
        name: &'static str,
        kernel: Kernel,
    },
    Upload {
        dst: DevicePtr,
        data: Vec<u8>,
    },
    Copy {
        dst: DevicePtr,
        src: DevicePtr,
        len: usize,
    },
    Copy2d {
        dst: DevicePtr,
        dst_pitch: usize,
        src: DevicePtr,
        src_pitch: usize,
        width: usize,
        height: usize,
    },
    Memset {
        dst: DevicePtr,
        value: u8,
        len: usize,
    },
    Record {
        event: usize,
        gen: u64,
    },
    Wait {
        event: usize,
        gen: u64,
    },
}

struct SimStream {
    device: usize,
    queue: VecDeque<StreamOp>,
    error: Option<DriverError>,
    running: bool,
}

struct SimEvent {
    device: usize,
    recorded: u64,
    /// Records submitted but not yet executed: (generation, stream id).
    pending: VecDeque<(u64, usize)>,
}

struct SimState {
    heaps: Vec<DeviceHeap>,
    stats: Vec<SimStats>,
    streams: Vec<Option<SimStream>>,
    events: Vec<Option<SimEvent>>,
    next_alloc: u64,
    pinned: usize,
}

/// A driver whose devices live in host memory.
pub struct SimDriver {
    specs: Vec<SimDeviceSpec>,
    pinned_limit: Option<usize>,
    state: Mutex<SimState>,
}

impl SimDriver {
    pub fn new(specs: Vec<SimDeviceSpec>) -> Self {
        let heaps = (0..specs.len()).map(DeviceHeap::new).collect();
        let stats = vec![SimStats::default(); specs.len()];
        debug!(devices = specs.len(), "simulated driver created");
        Self {
            specs,
            pinned_limit: None,
            state: Mutex::new(SimState {
                heaps,
                stats,
                streams: Vec::new(),
                events: Vec::new(),
                next_alloc: 1,
                pinned: 0,
            }),
        }
    }

    /// `count` identical devices.
    pub fn uniform(count: usize, total_memory: usize, capability: u32) -> Self {
        Self::new(
            (0..count)
                .map(|i| SimDeviceSpec::new(format!("sim-{}", i), total_memory, capability))
                .collect(),
        )
    }

    /// Limit the total amount of pinned host memory.
    pub fn with_pinned_limit(mut self, bytes: usize) -> Self {
        self.pinned_limit = Some(bytes);
        self
    }

    pub fn stats(&self, device: usize) -> SimStats {
        self.lock().stats.get(device).copied().unwrap_or_default()
    }

    /// Operations still queued on `stream`.
    pub fn pending_ops(&self, stream: Stream) -> usize {
        self.lock()
            .streams
            .get(stream.id)
            .and_then(|s| s.as_ref())
            .map_or(0, |s| s.queue.len())
    }

    pub fn pinned_bytes(&self) -> usize {
        self.lock().pinned
    }

    fn lock(&self) -> MutexGuard<'_, SimState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn check_device(&self, device: usize) -> Result<(), DriverError> {
        if device < self.specs.len() {
            Ok(())
        } else {
            Err(DriverError::InvalidDevice(device))
        }
    }

    fn submit(&self, stream: Stream, op: StreamOp) -> Result<(), DriverError> {
        let mut state = self.lock();
        state.stream_mut(stream)?.queue.push_back(op);
        Ok(())
    }
}

impl SimState {
    fn stream_mut(&mut self, stream: Stream) -> Result<&mut SimStream, DriverError> {
        self.stream_by_id(stream.id)
            .filter(|s| s.device == stream.device)
            .ok_or(DriverError::InvalidStream(stream.id))
    }

    fn stream_by_id(&mut self, id: usize) -> Option<&mut SimStream> {
        self.streams.get_mut(id).and_then(|s| s.as_mut())
    }

    fn event_mut(&mut self, event: Event) -> Result<&mut SimEvent, DriverError> {
        self.events
            .get_mut(event.id)
            .and_then(|e| e.as_mut())
            .filter(|e| e.device == event.device)
            .ok_or(DriverError::InvalidEvent(event.id))
    }

    /// Whether record `gen` of event `id` has executed (or was dropped).
    fn event_done(&self, id: usize, gen: u64) -> bool {
        match self.events.get(id).and_then(|e| e.as_ref()) {
            Some(ev) => !ev.pending.iter().any(|&(g, _)| g == gen),
            None => true,
        }
    }

    fn event_owner(&self, id: usize, gen: u64) -> Option<usize> {
        self.events
            .get(id)
            .and_then(|e| e.as_ref())
            .and_then(|ev| ev.pending.iter().find(|&&(g, _)| g == gen).map(|&(_, s)| s))
    }

    /// Execute queued work on stream `id`, stopping early once record `until`
    /// has executed.
    fn run_stream(&mut self, id: usize, until: Option<(usize, u64)>) -> Result<(), DriverError> {
        match self.stream_by_id(id) {
            Some(s) if s.running => return Err(DriverError::Deadlock),
            Some(s) => s.running = true,
            None => return Ok(()),
        }
        let result = self.run_queue(id, until);
        if let Some(s) = self.stream_by_id(id) {
            s.running = false;
        }
        result
    }

    fn run_queue(&mut self, id: usize, until: Option<(usize, u64)>) -> Result<(), DriverError> {
        loop {
            if let Some((event, gen)) = until {
                if self.event_done(event, gen) {
                    return Ok(());
                }
            }
            let Some(stream) = self.stream_by_id(id) else {
                return Ok(());
            };
            let device = stream.device;
            let failed = stream.error.is_some();
            let Some(op) = stream.queue.pop_front() else {
                return Ok(());
            };
            match op {
                StreamOp::Record { event, gen } => {
                    if let Some(Some(ev)) = self.events.get_mut(event) {
                        ev.pending.retain(|&(g, _)| g != gen);
                    }
                }
                StreamOp::Wait { event, gen } => {
                    if !self.event_done(event, gen) {
                        if let Some(owner) = self.event_owner(event, gen) {
                            trace!(stream = id, owner, event, gen, "stream waits on event");
                            self.run_stream(owner, Some((event, gen)))?;
                        }
                    }
                }
                op if failed => drop(op),
                op => {
                    if let Err(e) = self.execute(device, op) {
                        debug!(stream = id, error = %e, "queued work failed");
                        if let Some(s) = self.stream_by_id(id) {
                            s.error = Some(e);
                        }
                    }
                }
            }
        }
    }

    fn heap(&mut self, device: usize) -> Result<&mut DeviceHeap, DriverError> {
        self.heaps
            .get_mut(device)
            .ok_or(DriverError::InvalidDevice(device))
    }

    fn execute(&mut self, device: usize, op: StreamOp) -> Result<(), DriverError> {
        match op {
            StreamOp::Kernel { name, kernel } => {
                trace!(device, kernel = name, "kernel");
                kernel(self.heap(device)?)
            }
            StreamOp::Upload { dst, data } => {
                self.heap(dst.device)?
                    .bytes_mut(dst, data.len())?
                    .copy_from_slice(&data);
                Ok(())
            }
            StreamOp::Copy { dst, src, len } => {
                let data = self.heap(src.device)?.read_bytes(src, len)?;
                self.heap(dst.device)?
                    .bytes_mut(dst, len)?
                    .copy_from_slice(&data);
                Ok(())
            }
            StreamOp::Copy2d {
                dst,
                dst_pitch,
                src,
                src_pitch,
                width,
                height,
            } => {
                for row in 0..height {
                    let data = self
                        .heap(src.device)?
                        .read_bytes(src.add(row * src_pitch), width)?;
                    self.heap(dst.device)?
                        .bytes_mut(dst.add(row * dst_pitch), width)?
                        .copy_from_slice(&data);
                }
                Ok(())
            }
            StreamOp::Memset { dst, value, len } => {
                self.heap(dst.device)?.bytes_mut(dst, len)?.fill(value);
                Ok(())
            }
            StreamOp::Record { .. } | StreamOp::Wait { .. } => Ok(()),
        }
    }

    /// Drain every stream on `device`.
    fn drain_device(&mut self, device: usize) -> Result<(), DriverError> {
        let ids: Vec<usize> = self
            .streams
            .iter()
            .enumerate()
            .filter_map(|(i, s)| s.as_ref().filter(|s| s.device == device).map(|_| i))
            .collect();
        for id in ids {
            self.run_stream(id, None)?;
        }
        Ok(())
    }
}

impl Driver for SimDriver {
    fn device_count(&self) -> usize {
        self.specs.len()
    }

    fn properties(&self, device: usize) -> Result<DeviceProperties, DriverError> {
        let spec = self
            .specs
            .get(device)
            .ok_or(DriverError::InvalidDevice(device))?;
        Ok(DeviceProperties {
            name: spec.name.clone(),
            total_memory: spec.total_memory,
            capability: spec.capability,
        })
    }

    fn mem_info(&self, device: usize) -> Result<MemInfo, DriverError> {
        self.check_device(device)?;
        let total = self.specs[device].total_memory;
        let used = self.lock().stats[device].bytes_in_use;
        Ok(MemInfo {
            free: total.saturating_sub(used),
            total,
        })
    }

    fn malloc(&self, device: usize, size: usize) -> Result<DevicePtr, DriverError> {
        self.check_device(device)?;
        let total = self.specs[device].total_memory;
        let mut state = self.lock();
        let used = state.stats[device].bytes_in_use;
        if used + size > total {
            return Err(DriverError::OutOfMemory {
                device,
                requested: size,
                free: total - used,
            });
        }
        let alloc = state.next_alloc;
        state.next_alloc += 1;
        state.heaps[device].insert(alloc, size);
        let stats = &mut state.stats[device];
        stats.mallocs += 1;
        stats.bytes_in_use += size;
        trace!(device, size, alloc, "malloc");
        Ok(DevicePtr {
            device,
            alloc,
            offset: 0,
        })
    }

    fn free(&self, ptr: DevicePtr) -> Result<(), DriverError> {
        self.check_device(ptr.device)?;
        if ptr.offset != 0 {
            return Err(DriverError::InvalidPointer(ptr.to_string()));
        }
        let mut state = self.lock();
        // Freeing waits for outstanding work on the device.
        state.drain_device(ptr.device)?;
        let size = state.heaps[ptr.device]
            .remove(ptr.alloc)
            .ok_or_else(|| DriverError::InvalidPointer(ptr.to_string()))?;
        let stats = &mut state.stats[ptr.device];
        stats.frees += 1;
        stats.bytes_in_use -= size;
        trace!(device = ptr.device, size, alloc = ptr.alloc, "free");
        Ok(())
    }

    fn host_register(&self, size: usize) -> Result<(), DriverError> {
        let mut state = self.lock();
        if let Some(limit) = self.pinned_limit {
            if state.pinned + size > limit {
                return Err(DriverError::HostAllocFailed(size));
            }
        }
        state.pinned += size;
        Ok(())
    }

    fn host_unregister(&self, size: usize) -> Result<(), DriverError> {
        let mut state = self.lock();
        state.pinned = state.pinned.saturating_sub(size);
        Ok(())
    }

    fn create_stream(&self, device: usize) -> Result<Stream, DriverError> {
        self.check_device(device)?;
        let mut state = self.lock();
        state.streams.push(Some(SimStream {
            device,
            queue: VecDeque::new(),
            error: None,
            running: false,
        }));
        Ok(Stream {
            device,
            id: state.streams.len() - 1,
        })
    }

    fn destroy_stream(&self, stream: Stream) -> Result<(), DriverError> {
        let mut state = self.lock();
        state.stream_mut(stream)?;
        state.run_stream(stream.id, None)?;
        state.streams[stream.id] = None;
        Ok(())
    }

    fn stream_synchronize(&self, stream: Stream) -> Result<(), DriverError> {
        let mut state = self.lock();
        state.stream_mut(stream)?;
        state.run_stream(stream.id, None)?;
        match state.stream_mut(stream)?.error.clone() {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }

    fn create_event(&self, device: usize) -> Result<Event, DriverError> {
        self.check_device(device)?;
        let mut state = self.lock();
        state.events.push(Some(SimEvent {
            device,
            recorded: 0,
            pending: VecDeque::new(),
        }));
        Ok(Event {
            device,
            id: state.events.len() - 1,
        })
    }

    fn destroy_event(&self, event: Event) -> Result<(), DriverError> {
        let mut state = self.lock();
        state.event_mut(event)?;
        state.events[event.id] = None;
        Ok(())
    }

    fn record_event(&self, event: Event, stream: Stream) -> Result<(), DriverError> {
        let mut state = self.lock();
        state.stream_mut(stream)?;
        let ev = state.event_mut(event)?;
        ev.recorded += 1;
        let gen = ev.recorded;
        ev.pending.push_back((gen, stream.id));
        state.stream_mut(stream)?.queue.push_back(StreamOp::Record {
            event: event.id,
            gen,
        });
        Ok(())
    }

    fn stream_wait_event(&self, stream: Stream, event: Event) -> Result<(), DriverError> {
        let mut state = self.lock();
        let gen = state.event_mut(event)?.recorded;
        let s = state.stream_mut(stream)?;
        // Waiting on a never-recorded event is a no-op.
        if gen > 0 {
            s.queue.push_back(StreamOp::Wait {
                event: event.id,
                gen,
            });
        }
        Ok(())
    }

    fn event_synchronize(&self, event: Event) -> Result<(), DriverError> {
        let mut state = self.lock();
        let gen = state.event_mut(event)?.recorded;
        if let Some(owner) = state.event_owner(event.id, gen) {
            state.run_stream(owner, Some((event.id, gen)))?;
            if let Some(e) = state.stream_by_id(owner).and_then(|s| s.error.clone()) {
                return Err(e);
            }
        }
        Ok(())
    }

    fn memcpy_h2d_async(
        &self,
        dst: DevicePtr,
        src: &[u8],
        stream: Stream,
    ) -> Result<(), DriverError> {
        self.check_device(dst.device)?;
        let mut state = self.lock();
        state.stats[dst.device].copies += 1;
        state.stream_mut(stream)?.queue.push_back(StreamOp::Upload {
            dst,
            data: src.to_vec(),
        });
        Ok(())
    }

    fn memcpy_d2h(&self, dst: &mut [u8], src: DevicePtr, stream: Stream) -> Result<(), DriverError> {
        self.check_device(src.device)?;
        let mut state = self.lock();
        state.stream_mut(stream)?;
        state.run_stream(stream.id, None)?;
        if let Some(e) = state.stream_mut(stream)?.error.clone() {
            return Err(e);
        }
        state.stats[src.device].copies += 1;
        dst.copy_from_slice(state.heaps[src.device].bytes(src, dst.len())?);
        Ok(())
    }

    fn memcpy_d2d_async(
        &self,
        dst: DevicePtr,
        src: DevicePtr,
        len: usize,
        stream: Stream,
    ) -> Result<(), DriverError> {
        self.check_device(dst.device)?;
        self.check_device(src.device)?;
        let mut state = self.lock();
        state.stats[dst.device].copies += 1;
        state
            .stream_mut(stream)?
            .queue
            .push_back(StreamOp::Copy { dst, src, len });
        Ok(())
    }

    fn memcpy_2d_async(
        &self,
        dst: DevicePtr,
        dst_pitch: usize,
        src: DevicePtr,
        src_pitch: usize,
        width: usize,
        height: usize,
        stream: Stream,
    ) -> Result<(), DriverError> {
        self.check_device(dst.device)?;
        self.check_device(src.device)?;
        let mut state = self.lock();
        state.stats[dst.device].copies += 1;
        state.stream_mut(stream)?.queue.push_back(StreamOp::Copy2d {
            dst,
            dst_pitch,
            src,
            src_pitch,
            width,
            height,
        });
        Ok(())
    }

    fn memset_async(
        &self,
        dst: DevicePtr,
        value: u8,
        len: usize,
        stream: Stream,
    ) -> Result<(), DriverError> {
        self.check_device(dst.device)?;
        self.submit(stream, StreamOp::Memset { dst, value, len })
    }

    fn launch(&self, stream: Stream, name: &'static str, kernel: Kernel) -> Result<(), DriverError> {
        let mut state = self.lock();
        state.stream_mut(stream)?.queue.push_back(StreamOp::Kernel { name, kernel });
        state.stats[stream.device].launches += 1;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn driver(n: usize) -> SimDriver {
        SimDriver::uniform(n, 1 << 20, 860)
    }

    fn read(d: &SimDriver, ptr: DevicePtr, len: usize, stream: Stream) -> Vec<u8> {
        let mut out = vec![0u8; len];
        d.memcpy_d2h(&mut out, ptr, stream).unwrap();
        out
    }

    #[test]
    fn test_malloc_respects_total_memory() {
        let d = SimDriver::uniform(1, 1000, 610);
        let a = d.malloc(0, 600).unwrap();
        assert_eq!(d.mem_info(0).unwrap().free, 400);
        let err = d.malloc(0, 500).unwrap_err();
        assert!(matches!(err, DriverError::OutOfMemory { requested: 500, free: 400, .. }));
        d.free(a).unwrap();
        assert_eq!(d.mem_info(0).unwrap().free, 1000);
        assert_eq!(d.stats(0).mallocs, 1);
        assert_eq!(d.stats(0).frees, 1);
    }

    #[test]
    fn test_free_rejects_unknown_and_interior_pointers() {
        let d = driver(1);
        let a = d.malloc(0, 64).unwrap();
        assert!(d.free(a.add(8)).is_err());
        d.free(a).unwrap();
        assert!(matches!(d.free(a), Err(DriverError::InvalidPointer(_))));
    }

    #[test]
    fn test_invalid_device() {
        let d = driver(2);
        assert!(matches!(d.malloc(2, 8), Err(DriverError::InvalidDevice(2))));
        assert!(d.properties(5).is_err());
        assert_eq!(d.properties(1).unwrap().capability, 860);
    }

    #[test]
    fn test_work_is_deferred_until_synchronize() {
        let d = driver(1);
        let s = d.create_stream(0).unwrap();
        let p = d.malloc(0, 8).unwrap();
        d.memset_async(p, 3, 8, s).unwrap();
        assert_eq!(d.pending_ops(s), 1);
        d.stream_synchronize(s).unwrap();
        assert_eq!(d.pending_ops(s), 0);
        assert_eq!(read(&d, p, 8, s), vec![3u8; 8]);
    }

    #[test]
    fn test_consumer_sees_producer_data_only_after_wait() {
        let d = driver(2);
        let producer = d.create_stream(0).unwrap();
        let consumer = d.create_stream(1).unwrap();
        let src = d.malloc(0, 16).unwrap();
        let dst_a = d.malloc(1, 16).unwrap();
        let dst_b = d.malloc(1, 16).unwrap();

        d.memset_async(src, 9, 16, producer).unwrap();

        // Without a wait the peer copy runs before the producer's memset.
        d.memcpy_d2d_async(dst_a, src, 16, consumer).unwrap();
        assert_eq!(read(&d, dst_a, 16, consumer), vec![0u8; 16]);

        let done = d.create_event(0).unwrap();
        d.record_event(done, producer).unwrap();
        d.stream_wait_event(consumer, done).unwrap();
        d.memcpy_d2d_async(dst_b, src, 16, consumer).unwrap();
        assert_eq!(read(&d, dst_b, 16, consumer), vec![9u8; 16]);
    }

    #[test]
    fn test_kernel_errors_are_sticky() {
        let d = driver(1);
        let s = d.create_stream(0).unwrap();
        let p = d.malloc(0, 4).unwrap();
        d.launch(
            s,
            "bad",
            Box::new(move |heap| heap.write_f32(p.add(4), &[1.0])),
        )
        .unwrap();
        d.memset_async(p, 1, 4, s).unwrap();
        assert!(matches!(
            d.stream_synchronize(s),
            Err(DriverError::OutOfBounds { .. })
        ));
        // The memset after the failure was discarded.
        let mut out = [0u8; 4];
        assert!(d.memcpy_d2h(&mut out, p, s).is_err());
        assert_eq!(d.stats(0).launches, 1);
    }

    #[test]
    fn test_pitched_copy() {
        let d = driver(1);
        let s = d.create_stream(0).unwrap();
        let src = d.malloc(0, 6).unwrap();
        let dst = d.malloc(0, 12).unwrap();
        d.memcpy_h2d_async(src, &[1, 2, 3, 4, 5, 6], s).unwrap();
        // Three rows of two bytes, spread to a pitch of four.
        d.memcpy_2d_async(dst, 4, src, 2, 2, 3, s).unwrap();
        assert_eq!(read(&d, dst, 12, s), vec![1, 2, 0, 0, 3, 4, 0, 0, 5, 6, 0, 0]);
    }

    #[test]
    fn test_event_synchronize_runs_owner() {
        let d = driver(1);
        let s = d.create_stream(0).unwrap();
        let p = d.malloc(0, 4).unwrap();
        let e = d.create_event(0).unwrap();
        d.launch(s, "fill", Box::new(move |heap| heap.write_f32(p, &[2.5])))
            .unwrap();
        d.record_event(e, s).unwrap();
        d.event_synchronize(e).unwrap();
        assert_eq!(d.pending_ops(s), 0);
    }

    #[test]
    fn test_pinned_limit() {
        let d = driver(1).with_pinned_limit(100);
        d.host_register(60).unwrap();
        assert!(matches!(d.host_register(60), Err(DriverError::HostAllocFailed(60))));
        d.host_unregister(60).unwrap();
        assert_eq!(d.pinned_bytes(), 0);
    }
}
