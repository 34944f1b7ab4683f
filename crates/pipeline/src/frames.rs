//! In-flight frame registry and the free pools feeding it.

use std::collections::{BTreeMap, VecDeque};

use thiserror::Error;

use crate::device::NodeKind;
use crate::request::{Request, StreamId};

/// Why a frame could not be created.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum RegistryError {
    #[error("parameter buffer underrun")]
    ParamUnderrun,
    #[error("statistics buffer underrun")]
    StatUnderrun,
    #[error("request has no buffer for the stream")]
    InvalidStream,
}

/// Counters for free-pool behavior.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PoolMetrics {
    pub acquired: u64,
    pub released: u64,
    pub underruns: u64,
}

/// FIFO of currently-free buffer indices for one metadata stream.
#[derive(Debug, Default)]
pub struct FreePool {
    free: VecDeque<u32>,
    capacity: usize,
    metrics: PoolMetrics,
}

impl FreePool {
    /// Fill the pool with indices `0..count`, replacing any prior content.
    fn seed(&mut self, count: u32) {
        self.free = (0..count).collect();
        self.capacity = count as usize;
    }

    fn peek(&self) -> Option<u32> {
        self.free.front().copied()
    }

    fn take(&mut self) -> Option<u32> {
        let index = self.free.pop_front();
        if index.is_some() {
            self.metrics.acquired += 1;
        }
        index
    }

    fn put(&mut self, index: u32) {
        self.metrics.released += 1;
        self.free.push_back(index);
    }

    fn drain(&mut self) {
        self.free.clear();
        self.capacity = 0;
    }

    pub fn len(&self) -> usize {
        self.free.len()
    }

    pub fn is_empty(&self) -> bool {
        self.free.is_empty()
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn metrics(&self) -> PoolMetrics {
        self.metrics
    }
}

/// Record binding one frame number, one request and the three kernel
/// buffers serving it.
///
/// The three flags are independent: the 3A and the kernel report progress
/// in whatever order the hardware produces it.
#[derive(Debug)]
pub struct FrameInfo {
    pub frame: u32,
    pub request: Request,
    pub param_buffer: u32,
    pub stat_buffer: u32,
    pub video_buffer: u32,
    pub param_filled: bool,
    pub param_dequeued: bool,
    pub metadata_processed: bool,
}

/// Bidirectional index over in-flight frames, owning the free pools.
///
/// Creation is the only consumer of the pools and destruction the only
/// producer, so pool accounting follows frame lifetimes exactly:
/// `live + free == capacity` at all times.
#[derive(Debug, Default)]
pub struct FrameRegistry {
    infos: BTreeMap<u32, FrameInfo>,
    params: FreePool,
    stats: FreePool,
}

impl FrameRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Size both pools to `count` fresh buffer indices.
    pub fn seed_pools(&mut self, count: u32) {
        self.params.seed(count);
        self.stats.seed(count);
    }

    /// Empty both pools (buffer teardown).
    pub fn drain_pools(&mut self) {
        self.params.drain();
        self.stats.drain();
    }

    pub fn params(&self) -> &FreePool {
        &self.params
    }

    pub fn stats(&self) -> &FreePool {
        &self.stats
    }

    /// Bind `request` to `frame`, drawing one parameter and one statistics
    /// buffer from the pools and resolving the video buffer from the
    /// request's binding for `stream`.
    ///
    /// Nothing is consumed on failure; the request is handed back.
    pub fn create(
        &mut self,
        frame: u32,
        request: Request,
        stream: StreamId,
    ) -> Result<&FrameInfo, (RegistryError, Request)> {
        let Some(param_buffer) = self.params.peek() else {
            self.params.metrics.underruns += 1;
            return Err((RegistryError::ParamUnderrun, request));
        };
        let Some(stat_buffer) = self.stats.peek() else {
            self.stats.metrics.underruns += 1;
            return Err((RegistryError::StatUnderrun, request));
        };
        let Some(video_buffer) = request.buffer(stream) else {
            return Err((RegistryError::InvalidStream, request));
        };

        self.params.take();
        self.stats.take();

        let info = FrameInfo {
            frame,
            request,
            param_buffer,
            stat_buffer,
            video_buffer,
            param_filled: false,
            param_dequeued: false,
            metadata_processed: false,
        };

        // Frame numbers are allocated monotonically by the controller, so
        // the slot must be vacant.
        let prev = self.infos.insert(frame, info);
        debug_assert!(prev.is_none());
        Ok(&self.infos[&frame])
    }

    /// Remove `frame`, returning its buffers to the pools and yielding the
    /// record (with its request) to the caller.
    pub fn destroy(&mut self, frame: u32) -> Option<FrameInfo> {
        let info = self.infos.remove(&frame)?;
        self.params.put(info.param_buffer);
        self.stats.put(info.stat_buffer);
        Some(info)
    }

    pub fn get(&self, frame: u32) -> Option<&FrameInfo> {
        self.infos.get(&frame)
    }

    pub fn get_mut(&mut self, frame: u32) -> Option<&mut FrameInfo> {
        self.infos.get_mut(&frame)
    }

    /// Find the frame holding `index` in the `node` buffer slot.
    ///
    /// Linear over live frames, which the pool sizes bound to the buffer
    /// count plus one.
    pub fn find_by_buffer(&self, node: NodeKind, index: u32) -> Option<u32> {
        self.infos
            .values()
            .find(|info| {
                let slot = match node {
                    NodeKind::Video => info.video_buffer,
                    NodeKind::Param => info.param_buffer,
                    NodeKind::Stat => info.stat_buffer,
                };
                slot == index
            })
            .map(|info| info.frame)
    }

    /// Find the frame serving the request identified by `cookie`.
    pub fn find_by_request(&self, cookie: u64) -> Option<u32> {
        self.infos
            .values()
            .find(|info| info.request.cookie() == cookie)
            .map(|info| info.frame)
    }

    /// Discard every in-flight frame, returning buffers to the pools and
    /// handing the orphaned requests back.
    pub fn clear(&mut self) -> Vec<Request> {
        let frames: Vec<u32> = self.infos.keys().copied().collect();
        frames
            .into_iter()
            .filter_map(|frame| self.destroy(frame))
            .map(|info| info.request)
            .collect()
    }

    pub fn len(&self) -> usize {
        self.infos.len()
    }

    pub fn is_empty(&self) -> bool {
        self.infos.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn request_with_buffer(cookie: u64, index: u32) -> Request {
        let mut request = Request::new(cookie);
        request.add_buffer(StreamId(0), index);
        request
    }

    fn seeded(count: u32) -> FrameRegistry {
        let mut registry = FrameRegistry::new();
        registry.seed_pools(count);
        registry
    }

    #[test]
    fn create_binds_distinct_buffers() {
        let mut registry = seeded(3);
        let a = registry
            .create(0, request_with_buffer(1, 10), StreamId(0))
            .map(|info| (info.param_buffer, info.stat_buffer))
            .unwrap();
        let b = registry
            .create(1, request_with_buffer(2, 11), StreamId(0))
            .map(|info| (info.param_buffer, info.stat_buffer))
            .unwrap();
        assert_ne!(a.0, b.0);
        assert_ne!(a.1, b.1);
        assert_eq!(registry.len() + registry.params().len(), 3);
        assert_eq!(registry.len() + registry.stats().len(), 3);
    }

    #[test]
    fn underrun_reports_without_consuming() {
        let mut registry = seeded(2);
        registry
            .create(0, request_with_buffer(1, 10), StreamId(0))
            .unwrap();
        registry
            .create(1, request_with_buffer(2, 11), StreamId(0))
            .unwrap();

        let err = registry
            .create(2, request_with_buffer(3, 12), StreamId(0))
            .err()
            .expect("pool exhausted");
        assert_eq!(err.0, RegistryError::ParamUnderrun);
        assert_eq!(err.1.cookie(), 3);
        assert_eq!(registry.len(), 2);
        assert_eq!(registry.params().metrics().underruns, 1);
    }

    #[test]
    fn missing_stream_binding_keeps_pools_intact() {
        let mut registry = seeded(2);
        let err = registry
            .create(0, Request::new(9), StreamId(0))
            .err()
            .expect("no binding");
        assert_eq!(err.0, RegistryError::InvalidStream);
        assert_eq!(registry.params().len(), 2);
        assert_eq!(registry.stats().len(), 2);
    }

    #[test]
    fn destroy_recycles_fifo_order() {
        let mut registry = seeded(2);
        registry
            .create(0, request_with_buffer(1, 10), StreamId(0))
            .unwrap();
        registry
            .create(1, request_with_buffer(2, 11), StreamId(0))
            .unwrap();

        let info = registry.destroy(0).unwrap();
        assert_eq!(info.request.cookie(), 1);
        assert!(registry.destroy(0).is_none());

        // The recycled index comes back out after the seed order is spent.
        let next = registry
            .create(2, request_with_buffer(3, 12), StreamId(0))
            .unwrap();
        assert_eq!(next.param_buffer, info.param_buffer);
    }

    #[test]
    fn lookup_views_agree() {
        let mut registry = seeded(2);
        registry
            .create(5, request_with_buffer(42, 10), StreamId(0))
            .unwrap();
        let info = registry.get(5).unwrap();
        let (param, stat) = (info.param_buffer, info.stat_buffer);

        assert_eq!(registry.find_by_buffer(NodeKind::Video, 10), Some(5));
        assert_eq!(registry.find_by_buffer(NodeKind::Param, param), Some(5));
        assert_eq!(registry.find_by_buffer(NodeKind::Stat, stat), Some(5));
        assert_eq!(registry.find_by_request(42), Some(5));
        assert_eq!(registry.find_by_request(43), None);
        assert_eq!(registry.find_by_buffer(NodeKind::Video, 99), None);
    }

    #[test]
    fn clear_restores_full_pools() {
        let mut registry = seeded(3);
        for frame in 0..3 {
            registry
                .create(frame, request_with_buffer(frame as u64, frame), StreamId(0))
                .unwrap();
        }
        let orphans = registry.clear();
        assert_eq!(orphans.len(), 3);
        assert!(registry.is_empty());
        assert_eq!(registry.params().len(), 3);
        assert_eq!(registry.stats().len(), 3);
    }
}
