//! Instrumented shaders and the registry that owns them.
//!
//! A [`ShaderRecord`] is created once per distinct module and set of checks, when the front end
//! creates a shader module or a pipeline. It holds the binary to hand to the driver and
//! everything the decoder needs to attribute records written by that binary.
//!
//! The registry only holds weak references: a record lives as long as a pipeline, a shader
//! object or a command buffer that recorded it holds on to it.

use crate::{
    cache::WeakArcOnceCache,
    instrument::{
        self, CheckCategories, DebugSymbolTable, InstrumentError, InstrumentOptions,
        InstrumentedShader,
    },
    vk,
};
use foldhash::HashMap;
use parking_lot::RwLock;
use spirv::ExecutionModel;
use std::sync::{Arc, Weak};

/// A shader stage, as far as the validator distinguishes them.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
#[non_exhaustive]
pub enum ShaderStage {
    Vertex,
    TessellationControl,
    TessellationEvaluation,
    Geometry,
    Fragment,
    Compute,
    Task,
    Mesh,
    RayGeneration,
    AnyHit,
    ClosestHit,
    Miss,
    Intersection,
    Callable,
    /// An execution model the validator doesn't know.
    Other,
}

impl ShaderStage {
    /// Converts a SPIR-V execution model.
    pub fn from_execution_model(execution_model: u32) -> Self {
        match ExecutionModel::from_u32(execution_model) {
            Some(ExecutionModel::Vertex) => ShaderStage::Vertex,
            Some(ExecutionModel::TessellationControl) => ShaderStage::TessellationControl,
            Some(ExecutionModel::TessellationEvaluation) => ShaderStage::TessellationEvaluation,
            Some(ExecutionModel::Geometry) => ShaderStage::Geometry,
            Some(ExecutionModel::Fragment) => ShaderStage::Fragment,
            Some(ExecutionModel::GLCompute) => ShaderStage::Compute,
            Some(ExecutionModel::TaskNV | ExecutionModel::TaskEXT) => ShaderStage::Task,
            Some(ExecutionModel::MeshNV | ExecutionModel::MeshEXT) => ShaderStage::Mesh,
            Some(ExecutionModel::RayGenerationKHR) => ShaderStage::RayGeneration,
            Some(ExecutionModel::AnyHitKHR) => ShaderStage::AnyHit,
            Some(ExecutionModel::ClosestHitKHR) => ShaderStage::ClosestHit,
            Some(ExecutionModel::MissKHR) => ShaderStage::Miss,
            Some(ExecutionModel::IntersectionKHR) => ShaderStage::Intersection,
            Some(ExecutionModel::CallableKHR) => ShaderStage::Callable,
            _ => ShaderStage::Other,
        }
    }

    /// Returns the Vulkan stage flag of the stage.
    pub fn to_vk(self) -> vk::ShaderStageFlags {
        match self {
            ShaderStage::Vertex => vk::ShaderStageFlags::VERTEX,
            ShaderStage::TessellationControl => vk::ShaderStageFlags::TESSELLATION_CONTROL,
            ShaderStage::TessellationEvaluation => vk::ShaderStageFlags::TESSELLATION_EVALUATION,
            ShaderStage::Geometry => vk::ShaderStageFlags::GEOMETRY,
            ShaderStage::Fragment => vk::ShaderStageFlags::FRAGMENT,
            ShaderStage::Compute => vk::ShaderStageFlags::COMPUTE,
            ShaderStage::Task => vk::ShaderStageFlags::TASK_EXT,
            ShaderStage::Mesh => vk::ShaderStageFlags::MESH_EXT,
            ShaderStage::RayGeneration => vk::ShaderStageFlags::RAYGEN_KHR,
            ShaderStage::AnyHit => vk::ShaderStageFlags::ANY_HIT_KHR,
            ShaderStage::ClosestHit => vk::ShaderStageFlags::CLOSEST_HIT_KHR,
            ShaderStage::Miss => vk::ShaderStageFlags::MISS_KHR,
            ShaderStage::Intersection => vk::ShaderStageFlags::INTERSECTION_KHR,
            ShaderStage::Callable => vk::ShaderStageFlags::CALLABLE_KHR,
            ShaderStage::Other => vk::ShaderStageFlags::empty(),
        }
    }
}

/// An entry point of a module.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct EntryPointInfo {
    pub name: String,
    pub stage: ShaderStage,
    pub execution_model: u32,
    /// Id of the entry point's function.
    pub function: u32,
    /// The `LocalSize` execution mode, if the entry point has one.
    pub local_size: Option<[u32; 3]>,
}

/// A shader module, instrumented once and shared by everything that uses it.
#[derive(Debug)]
pub struct ShaderRecord {
    unique_id: u32,
    original_hash: u64,
    checks: CheckCategories,
    instrumented_binary: Vec<u32>,
    debug_symbols: DebugSymbolTable,
    entry_points: Vec<EntryPointInfo>,
}

impl ShaderRecord {
    fn new(shader: InstrumentedShader, checks: CheckCategories) -> Self {
        ShaderRecord {
            unique_id: shader.shader_id,
            original_hash: shader.original_hash,
            checks,
            instrumented_binary: shader.binary,
            debug_symbols: shader.debug_symbols,
            entry_points: shader.entry_points,
        }
    }

    /// Returns the id the module writes into its records.
    #[inline]
    pub fn unique_id(&self) -> u32 {
        self.unique_id
    }

    #[inline]
    pub fn original_hash(&self) -> u64 {
        self.original_hash
    }

    #[inline]
    pub fn checks(&self) -> CheckCategories {
        self.checks
    }

    /// Returns the binary to hand to the driver instead of the original.
    #[inline]
    pub fn instrumented_binary(&self) -> &[u32] {
        &self.instrumented_binary
    }

    #[inline]
    pub fn debug_symbols(&self) -> &DebugSymbolTable {
        &self.debug_symbols
    }

    #[inline]
    pub fn entry_points(&self) -> &[EntryPointInfo] {
        &self.entry_points
    }

    /// Returns the entry point named `name`.
    pub fn entry_point(&self, name: &str) -> Option<&EntryPointInfo> {
        self.entry_points
            .iter()
            .find(|entry_point| entry_point.name == name)
    }

    /// Returns the stage of the record's entry points, if they all share one.
    pub fn stage(&self) -> Option<ShaderStage> {
        let (first, rest) = self.entry_points.split_first()?;

        rest.iter()
            .all(|entry_point| entry_point.stage == first.stage)
            .then_some(first.stage)
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
struct ShaderKey {
    content_hash: u64,
    len: usize,
    checks: CheckCategories,
    reserved_set: u32,
}

/// Every live [`ShaderRecord`], by content and by id.
#[derive(Debug, Default)]
pub(crate) struct ShaderRegistry {
    records: WeakArcOnceCache<ShaderKey, ShaderRecord>,
    by_id: RwLock<HashMap<u32, Weak<ShaderRecord>>>,
}

impl ShaderRegistry {
    /// Returns the record for `words` instrumented with `options`, instrumenting it if no live
    /// record exists. Concurrent callers for the same module instrument it once.
    pub(crate) fn get_or_instrument(
        &self,
        words: &[u32],
        options: &InstrumentOptions,
    ) -> Result<Arc<ShaderRecord>, InstrumentError> {
        let (_, content_hash) = instrument::shader_id(words, options);
        let key = ShaderKey {
            content_hash,
            len: words.len(),
            checks: options.checks,
            reserved_set: options.reserved_set,
        };

        self.records.get_or_try_insert(key, |_| {
            let shader = instrument::instrument(words, options)?;
            let record = Arc::new(ShaderRecord::new(shader, options.checks));

            let mut by_id = self.by_id.write();

            if by_id.len() >= 64 && by_id.len().is_power_of_two() {
                by_id.retain(|_, weak| weak.strong_count() != 0);
            }

            if let Some(other) = by_id.get(&record.unique_id).and_then(Weak::upgrade) {
                log::warn!(
                    "shader id {:#010x} is shared by two live modules, records of one of them \
                    may be attributed to the other",
                    other.unique_id,
                );
            }

            by_id.insert(record.unique_id, Arc::downgrade(&record));

            Ok(record)
        })
    }

    /// Returns the live record whose id is `unique_id`.
    pub(crate) fn get(&self, unique_id: u32) -> Option<Arc<ShaderRecord>> {
        self.by_id.read().get(&unique_id).and_then(Weak::upgrade)
    }

    /// Returns the number of live records.
    pub(crate) fn live_count(&self) -> usize {
        self.records.live_count()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tests::Assembler;
    use std::sync::Barrier;

    #[test]
    fn registry_shares_records() {
        let registry = ShaderRegistry::default();
        let words = Assembler::compute_store_shader(25);
        let options = InstrumentOptions::default();

        let first = registry.get_or_instrument(&words, &options).unwrap();
        let second = registry.get_or_instrument(&words, &options).unwrap();
        assert!(Arc::ptr_eq(&first, &second));
        assert!(Arc::ptr_eq(&registry.get(first.unique_id()).unwrap(), &first));
        assert_eq!(first.stage(), Some(ShaderStage::Compute));
        assert_eq!(first.entry_point("main").unwrap().local_size, Some([64, 1, 1]));

        let id = first.unique_id();
        drop(first);
        drop(second);
        assert!(registry.get(id).is_none());
        assert_eq!(registry.live_count(), 0);
    }

    #[test]
    fn concurrent_instrumentation_shares_one_record() {
        let registry = Arc::new(ShaderRegistry::default());
        let barrier = Arc::new(Barrier::new(4));

        let handles: Vec<_> = (0..4)
            .map(|_| {
                let registry = registry.clone();
                let barrier = barrier.clone();

                std::thread::spawn(move || {
                    let words = Assembler::compute_store_shader(25);
                    barrier.wait();
                    registry
                        .get_or_instrument(&words, &InstrumentOptions::default())
                        .unwrap()
                })
            })
            .collect();

        let records: Vec<_> = handles.into_iter().map(|h| h.join().unwrap()).collect();
        assert!(records.iter().all(|r| Arc::ptr_eq(r, &records[0])));
    }

    #[test]
    fn stage_mapping() {
        assert_eq!(ShaderStage::from_execution_model(0), ShaderStage::Vertex);
        assert_eq!(ShaderStage::from_execution_model(5), ShaderStage::Compute);
        assert_eq!(ShaderStage::from_execution_model(5365), ShaderStage::Mesh);
        assert_eq!(ShaderStage::from_execution_model(9999), ShaderStage::Other);
        assert_eq!(ShaderStage::Compute.to_vk(), vk::ShaderStageFlags::COMPUTE);
    }
}
