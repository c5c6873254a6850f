//! GPU queries.
//!
//! Query slots come from pools of [`QUERY_POOL_SIZE`] queries per pool class.
//! A query object owns a slot while it is active. Ending a query, or
//! submitting the command buffer it is active in, turns the slot into a
//! pending query whose results are folded into the query object once the GPU
//! produced them.

use ash::vk;
use d3dvk_tracing::trace_span;
use slab::Slab;
use slotmap::{new_key_type, SlotMap};

use crate::backend::Device;
use crate::{Context, Error};

/// Number of queries in a single query pool.
pub const QUERY_POOL_SIZE: u32 = 256;

const MAX_RESULTS: usize = 11;

#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash)]
pub enum QueryType {
    /// Number of samples passing the depth and stencil tests.
    Occlusion,
    Timestamp,
    PipelineStatistics,
    /// Primitives written and needed for stream output on all streams.
    StreamOutputStatistics,
    /// Primitives written and needed for stream output on a single stream.
    StreamOutputStatisticsStream(u32),
    Event,
    TimestampDisjoint,
    TimestampFrequency,
    StreamOutputOverflow,
}

impl QueryType {
    fn pool_class(self) -> Option<PoolClass> {
        match self {
            Self::Occlusion => Some(PoolClass::Occlusion),
            Self::Timestamp => Some(PoolClass::Timestamp),
            Self::PipelineStatistics => Some(PoolClass::PipelineStatistics),
            Self::StreamOutputStatistics => Some(PoolClass::StreamOutputStatistics),
            Self::StreamOutputStatisticsStream(stream) if stream < 4 => {
                Some(PoolClass::StreamOutputStatistics)
            }
            _ => None,
        }
    }

    /// Vertex stream counted by a stream output query.
    fn stream(self) -> u32 {
        match self {
            Self::StreamOutputStatisticsStream(stream) => stream,
            _ => 0,
        }
    }
}

#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash)]
enum PoolClass {
    Occlusion,
    Timestamp,
    PipelineStatistics,
    StreamOutputStatistics,
}

impl PoolClass {
    const COUNT: usize = 4;

    const fn vk_type(self) -> vk::QueryType {
        match self {
            Self::Occlusion => vk::QueryType::OCCLUSION,
            Self::Timestamp => vk::QueryType::TIMESTAMP,
            Self::PipelineStatistics => vk::QueryType::PIPELINE_STATISTICS,
            Self::StreamOutputStatistics => vk::QueryType::TRANSFORM_FEEDBACK_STREAM_EXT,
        }
    }

    fn statistics(self) -> vk::QueryPipelineStatisticFlags {
        match self {
            Self::PipelineStatistics => {
                vk::QueryPipelineStatisticFlags::INPUT_ASSEMBLY_VERTICES
                    | vk::QueryPipelineStatisticFlags::INPUT_ASSEMBLY_PRIMITIVES
                    | vk::QueryPipelineStatisticFlags::VERTEX_SHADER_INVOCATIONS
                    | vk::QueryPipelineStatisticFlags::GEOMETRY_SHADER_INVOCATIONS
                    | vk::QueryPipelineStatisticFlags::GEOMETRY_SHADER_PRIMITIVES
                    | vk::QueryPipelineStatisticFlags::CLIPPING_INVOCATIONS
                    | vk::QueryPipelineStatisticFlags::CLIPPING_PRIMITIVES
                    | vk::QueryPipelineStatisticFlags::FRAGMENT_SHADER_INVOCATIONS
                    | vk::QueryPipelineStatisticFlags::TESSELLATION_CONTROL_SHADER_PATCHES
                    | vk::QueryPipelineStatisticFlags::TESSELLATION_EVALUATION_SHADER_INVOCATIONS
                    | vk::QueryPipelineStatisticFlags::COMPUTE_SHADER_INVOCATIONS
            }
            _ => vk::QueryPipelineStatisticFlags::empty(),
        }
    }

    /// Number of 64-bit values a query of this class produces.
    const fn result_count(self) -> usize {
        match self {
            Self::Occlusion | Self::Timestamp => 1,
            Self::PipelineStatistics => MAX_RESULTS,
            Self::StreamOutputStatistics => 2,
        }
    }
}

#[derive(Debug)]
struct QueryPool {
    pool: vk::QueryPool,
    class: PoolClass,
    /// Set bits are allocated queries.
    allocated: [u64; QUERY_POOL_SIZE as usize / 64],
}

impl QueryPool {
    fn alloc(&mut self) -> Option<u32> {
        for (word_index, word) in self.allocated.iter_mut().enumerate() {
            if *word == u64::MAX {
                continue;
            }

            let bit = word.trailing_ones();
            *word |= 1 << bit;
            return Some(word_index as u32 * 64 + bit);
        }

        None
    }

    /// Frees a query. Returns `true` if the pool was full before.
    fn free(&mut self, index: u32) -> bool {
        let was_full = self.is_full();
        self.allocated[index as usize / 64] &= !(1 << (index % 64));
        was_full
    }

    fn is_full(&self) -> bool {
        self.allocated.iter().all(|word| *word == u64::MAX)
    }
}

/// A single query in a query pool.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash)]
pub struct QuerySlot {
    pub pool: vk::QueryPool,
    pub index: u32,
    pool_index: usize,
}

new_key_type! {
    /// Identifies a query object of a [`Context`].
    pub struct QueryId;
}

#[derive(Clone, Debug)]
struct Query {
    ty: QueryType,
    /// The slot the query is recording into.
    slot: Option<QuerySlot>,
    /// Whether the query was begun and not yet ended.
    active: bool,
    /// Number of pending slots whose results are still missing.
    pending: u32,
    data: [u64; MAX_RESULTS],
}

#[derive(Copy, Clone, Debug)]
struct PendingQuery {
    query: QueryId,
    slot: QuerySlot,
}

#[derive(Debug, Default)]
pub struct QueryManager {
    pools: Slab<QueryPool>,
    /// Pools with at least one free query per pool class.
    free_pools: [Vec<usize>; PoolClass::COUNT],
    queries: SlotMap<QueryId, Query>,
    pending: Vec<Option<PendingQuery>>,
    free_pending: Vec<usize>,
}

impl QueryManager {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of query pools.
    #[inline]
    pub fn pool_count(&self) -> usize {
        self.pools.len()
    }

    /// Number of query slots waiting for their results.
    pub fn pending_count(&self) -> usize {
        self.pending.len() - self.free_pending.len()
    }

    fn allocate<D: Device>(&mut self, device: &D, ty: QueryType) -> Result<QuerySlot, Error> {
        let _span = trace_span!("QueryManager::allocate").entered();

        let class = ty.pool_class().ok_or(Error::UnsupportedQuery(ty))?;
        let free_pools = &mut self.free_pools[class as usize];

        while let Some(&pool_index) = free_pools.last() {
            let pool = &mut self.pools[pool_index];
            if let Some(index) = pool.alloc() {
                return Ok(QuerySlot {
                    pool: pool.pool,
                    index,
                    pool_index,
                });
            }

            free_pools.pop();
        }

        if free_pools.try_reserve(1).is_err() {
            tracing::error!("failed to track query pool");
            return Err(Error::CacheInsert("query pool"));
        }

        let raw = device
            .create_query_pool(class.vk_type(), QUERY_POOL_SIZE, class.statistics())
            .map_err(|err| {
                tracing::error!("failed to create {:?} query pool: {}", class, err);
                err
            })?;

        let mut pool = QueryPool {
            pool: raw,
            class,
            allocated: Default::default(),
        };
        let index = pool.alloc().ok_or(Error::CacheInsert("query pool"))?;

        let pool_index = self.pools.insert(pool);
        free_pools.push(pool_index);

        tracing::trace!("created {:?} query pool {:?}", class, raw);
        Ok(QuerySlot {
            pool: raw,
            index,
            pool_index,
        })
    }

    fn free(&mut self, slot: QuerySlot) {
        let Some(pool) = self.pools.get_mut(slot.pool_index) else {
            tracing::error!("freeing query of unknown pool {:?}", slot.pool);
            return;
        };

        if pool.free(slot.index) {
            let free_pools = &mut self.free_pools[pool.class as usize];
            if free_pools.try_reserve(1).is_err() {
                tracing::error!("failed to make query pool {:?} available", slot.pool);
                return;
            }
            free_pools.push(slot.pool_index);
        }
    }

    fn add_pending(&mut self, query: QueryId, slot: QuerySlot) {
        let entry = Some(PendingQuery { query, slot });

        if let Some(index) = self.free_pending.pop() {
            self.pending[index] = entry;
        } else if self.pending.try_reserve(1).is_ok() && self.free_pending.try_reserve(1).is_ok()
        {
            self.pending.push(entry);
        } else {
            tracing::error!("failed to track pending query, dropping results");
            self.free(slot);
            return;
        }

        if let Some(query) = self.queries.get_mut(query) {
            query.pending += 1;
        }
    }

    fn remove_pending(&mut self, index: usize) {
        if index + 1 == self.pending.len() {
            self.pending.pop();
        } else if self.pending[index].take().is_some() {
            self.free_pending.push(index);
        }
    }

    /// Drops the pending slots of `query` without reading them.
    fn discard_pending(&mut self, query: QueryId) {
        for index in (0..self.pending.len()).rev() {
            match self.pending[index] {
                Some(entry) if entry.query == query => {
                    self.free(entry.slot);
                    self.remove_pending(index);
                }
                _ => (),
            }
        }

        let len = self.pending.len();
        self.free_pending.retain(|index| *index < len);

        if let Some(query) = self.queries.get_mut(query) {
            query.pending = 0;
        }
    }

    /// Reads the results of every pending query that finished on the GPU.
    fn accumulate<D: Device>(&mut self, device: &D) {
        let _span = trace_span!("QueryManager::accumulate").entered();

        for index in (0..self.pending.len()).rev() {
            let Some(entry) = self.pending[index] else {
                continue;
            };

            let Some(query) = self.queries.get_mut(entry.query) else {
                self.free(entry.slot);
                self.remove_pending(index);
                continue;
            };

            let class = self.pools[entry.slot.pool_index].class;
            let count = class.result_count();
            let mut data = [0; MAX_RESULTS];
            match device.query_results(entry.slot.pool, entry.slot.index, &mut data[..count]) {
                Ok(true) => (),
                Ok(false) => continue,
                Err(err) => {
                    tracing::error!(
                        "failed to read query {} of pool {:?}: {}",
                        entry.slot.index,
                        entry.slot.pool,
                        err
                    );
                    continue;
                }
            }

            if class == PoolClass::Timestamp {
                query.data[0] = data[0];
            } else {
                for (acc, value) in query.data.iter_mut().zip(&data[..count]) {
                    *acc = acc.wrapping_add(*value);
                }
            }
            query.pending = query.pending.saturating_sub(1);

            self.free(entry.slot);
            self.remove_pending(index);
        }

        let len = self.pending.len();
        self.free_pending.retain(|index| *index < len);
    }

    pub(crate) fn destroy<D: Device>(&mut self, device: &D) {
        for pool in self.pools.drain() {
            device.destroy_query_pool(pool.pool);
        }

        for free_pools in &mut self.free_pools {
            free_pools.clear();
        }
        self.pending.clear();
        self.free_pending.clear();
        for (_, query) in self.queries.iter_mut() {
            query.slot = None;
            query.pending = 0;
        }
    }
}

fn begin<D: Device>(device: &D, buffer: vk::CommandBuffer, ty: QueryType, slot: QuerySlot) {
    device.cmd_reset_query(buffer, slot.pool, slot.index);

    match ty {
        QueryType::StreamOutputStatistics | QueryType::StreamOutputStatisticsStream(_) => {
            device.cmd_begin_query_indexed(
                buffer,
                slot.pool,
                slot.index,
                vk::QueryControlFlags::empty(),
                ty.stream(),
            );
        }
        QueryType::Occlusion => {
            device.cmd_begin_query(
                buffer,
                slot.pool,
                slot.index,
                vk::QueryControlFlags::PRECISE,
            );
        }
        _ => {
            device.cmd_begin_query(buffer, slot.pool, slot.index, vk::QueryControlFlags::empty());
        }
    }
}

fn end<D: Device>(device: &D, buffer: vk::CommandBuffer, ty: QueryType, slot: QuerySlot) {
    match ty {
        QueryType::StreamOutputStatistics | QueryType::StreamOutputStatisticsStream(_) => {
            device.cmd_end_query_indexed(buffer, slot.pool, slot.index, ty.stream());
        }
        _ => device.cmd_end_query(buffer, slot.pool, slot.index),
    }
}

impl<D: Device> Context<D> {
    /// Allocates a query slot for a query of type `ty`.
    ///
    /// The slot is owned by the caller until it is passed to
    /// [`free_query`](Self::free_query).
    pub fn allocate_query(&mut self, ty: QueryType) -> Result<QuerySlot, Error> {
        self.queries.allocate(&self.device, ty)
    }

    pub fn free_query(&mut self, slot: QuerySlot) {
        self.queries.free(slot);
    }

    pub fn create_query(&mut self, ty: QueryType) -> Result<QueryId, Error> {
        let _span = trace_span!("Context::create_query").entered();

        let Some(class) = ty.pool_class() else {
            tracing::error!("unsupported query type {:?}", ty);
            return Err(Error::UnsupportedQuery(ty));
        };

        if class == PoolClass::StreamOutputStatistics && !self.info.transform_feedback {
            tracing::error!("stream output queries need transform feedback");
            return Err(Error::UnsupportedQuery(ty));
        }

        Ok(self.queries.queries.insert(Query {
            ty,
            slot: None,
            active: false,
            pending: 0,
            data: [0; MAX_RESULTS],
        }))
    }

    /// Starts counting. Results of a previous run of the query are dropped.
    pub fn begin_query(&mut self, id: QueryId) -> Result<(), Error> {
        let _span = trace_span!("Context::begin_query").entered();

        let query = self.queries.queries.get(id).ok_or(Error::InvalidQuery)?;
        let ty = query.ty;
        if ty == QueryType::Timestamp {
            return Ok(());
        }

        if query.active {
            self.end_query(id)?;
        }

        self.queries.discard_pending(id);
        self.end_current_render_pass();
        let buffer = self.get_command_buffer()?;
        let slot = self.queries.allocate(&self.device, ty)?;

        begin(&self.device, buffer, ty, slot);

        let query = self.queries.queries.get_mut(id).ok_or(Error::InvalidQuery)?;
        query.data = [0; MAX_RESULTS];
        query.slot = Some(slot);
        query.active = true;
        Ok(())
    }

    /// Stops counting, or writes the timestamp for timestamp queries.
    pub fn end_query(&mut self, id: QueryId) -> Result<(), Error> {
        let _span = trace_span!("Context::end_query").entered();

        let query = self.queries.queries.get(id).ok_or(Error::InvalidQuery)?;
        let ty = query.ty;

        if ty == QueryType::Timestamp {
            self.queries.discard_pending(id);
            self.end_current_render_pass();
            let buffer = self.get_command_buffer()?;
            let slot = self.queries.allocate(&self.device, ty)?;

            self.device.cmd_reset_query(buffer, slot.pool, slot.index);
            self.device.cmd_write_timestamp(buffer, slot.pool, slot.index);
            self.queries.add_pending(id, slot);
            return Ok(());
        }

        if !query.active {
            tracing::warn!("ending query {:?} that was not begun", id);
            return Ok(());
        }

        let slot = query.slot;
        if let (Some(slot), Some(buffer)) = (slot, self.commands_current()) {
            end(&self.device, buffer, ty, slot);
            self.queries.add_pending(id, slot);
        }

        let query = self.queries.queries.get_mut(id).ok_or(Error::InvalidQuery)?;
        query.slot = None;
        query.active = false;
        Ok(())
    }

    /// Returns the results of the query once every slot it used finished.
    ///
    /// Results only become available after the command buffers recording
    /// the query were submitted.
    pub fn query_result(&mut self, id: QueryId) -> Result<Option<&[u64]>, Error> {
        let _span = trace_span!("Context::query_result").entered();

        self.queries.accumulate(&self.device);

        let query = self.queries.queries.get(id).ok_or(Error::InvalidQuery)?;
        if query.active || query.pending != 0 {
            return Ok(None);
        }

        let count = query
            .ty
            .pool_class()
            .map_or(0, PoolClass::result_count);
        Ok(Some(&query.data[..count]))
    }

    pub fn destroy_query(&mut self, id: QueryId) {
        let _span = trace_span!("Context::destroy_query").entered();

        let Some(query) = self.queries.queries.get(id) else {
            return;
        };

        if query.active {
            if let Err(err) = self.end_query(id) {
                tracing::error!("failed to end query {:?}: {}", id, err);
            }
        }

        self.queries.discard_pending(id);
        self.queries.queries.remove(id);
    }

    /// Collects the results of every finished pending query.
    pub(crate) fn accumulate_pending_queries(&mut self) {
        self.queries.accumulate(&self.device);
    }

    /// Ends every active query before its command buffer is submitted.
    pub(crate) fn suspend_queries(&mut self, buffer: vk::CommandBuffer) {
        let _span = trace_span!("Context::suspend_queries").entered();

        let suspended: Vec<_> = self
            .queries
            .queries
            .iter_mut()
            .filter(|(_, query)| query.active)
            .filter_map(|(id, query)| Some((id, query.ty, query.slot.take()?)))
            .collect();

        for (id, ty, slot) in suspended {
            end(&self.device, buffer, ty, slot);
            self.queries.add_pending(id, slot);
        }
    }

    /// Continues every active query in a new command buffer.
    pub(crate) fn resume_queries(&mut self, buffer: vk::CommandBuffer) {
        let _span = trace_span!("Context::resume_queries").entered();

        let resumed: Vec<_> = self
            .queries
            .queries
            .iter()
            .filter(|(_, query)| query.active && query.slot.is_none())
            .map(|(id, query)| (id, query.ty))
            .collect();

        for (id, ty) in resumed {
            let slot = match self.queries.allocate(&self.device, ty) {
                Ok(slot) => slot,
                Err(err) => {
                    tracing::error!("failed to resume query {:?}: {}", id, err);
                    continue;
                }
            };

            begin(&self.device, buffer, ty, slot);
            if let Some(query) = self.queries.queries.get_mut(id) {
                query.slot = Some(slot);
            }
        }
    }

    fn commands_current(&self) -> Option<vk::CommandBuffer> {
        self.commands.current_buffer()
    }
}
