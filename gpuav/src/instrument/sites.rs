//! Finding the instructions to instrument.

use super::{
    analysis::{AccessLayout, IntValue, ModuleInfo, Type},
    debug::SiteCheck,
    module::Module,
    CheckCategories, InstrumentOptions,
};
use crate::record::AccessKind;
use smallvec::SmallVec;
use spirv::{Op, StorageClass};

/// An instruction that gets a check inserted before it.
#[derive(Clone, Debug, PartialEq, Eq)]
pub(super) struct Site {
    /// Word offset of the instruction in the original binary.
    pub(super) id: u32,
    pub(super) function: usize,
    pub(super) instruction: usize,
    /// The variable the instruction accesses, if it goes through one.
    pub(super) variable: Option<u32>,
    pub(super) action: SiteAction,
}

/// Identifies the descriptor an instruction accesses.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(super) struct DescriptorRef {
    pub(super) set: u32,
    pub(super) binding: u32,
    pub(super) index: IntValue,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub(super) enum SiteAction {
    /// A load, store or atomic through a uniform or storage buffer descriptor. The byte range is
    /// checked if `layout` is present, otherwise only the descriptor is.
    Buffer {
        descriptor: DescriptorRef,
        layout: Option<AccessLayout>,
        access: AccessKind,
    },
    /// A read or write of a texel buffer.
    Texel {
        descriptor: DescriptorRef,
        texel: IntValue,
        access: AccessKind,
    },
    /// A load of an image, sampler or acceleration structure descriptor.
    Descriptor { descriptor: DescriptorRef },
    /// A load or store through a `PhysicalStorageBuffer` pointer.
    Address {
        pointer: u32,
        size: u32,
        access: AccessKind,
    },
    RayQuery {
        flags: u32,
        origin: u32,
        t_min: u32,
        direction: u32,
        t_max: u32,
    },
}

impl SiteAction {
    pub(super) fn check(&self) -> SiteCheck {
        match self {
            SiteAction::Buffer { layout: Some(_), .. } => SiteCheck::BufferBounds,
            SiteAction::Buffer { layout: None, .. } | SiteAction::Descriptor { .. } => {
                SiteCheck::Descriptor
            }
            SiteAction::Texel { .. } => SiteCheck::TexelBounds,
            SiteAction::Address { .. } => SiteCheck::BufferAddress,
            SiteAction::RayQuery { .. } => SiteCheck::RayQuery,
        }
    }
}

pub(super) fn collect_sites(
    module: &Module,
    info: &ModuleInfo,
    options: &InstrumentOptions,
) -> Vec<Site> {
    let collector = Collector {
        module,
        info,
        checks: options.checks,
        shader_int64: options.shader_int64,
    };
    let mut sites = Vec::new();

    for (function, body) in module.functions.iter().enumerate() {
        for (instruction, inst) in body.instructions.iter().enumerate() {
            let (Some(op), Some(id)) = (inst.op(), inst.offset) else {
                continue;
            };

            let found = match op {
                Op::Load => inst.operand(2).and_then(|pointer| {
                    collector
                        .memory_access(pointer, AccessKind::Load)
                        .or_else(|| collector.descriptor_load(pointer))
                }),
                Op::Store => inst
                    .operand(0)
                    .and_then(|pointer| collector.memory_access(pointer, AccessKind::Store)),
                Op::AtomicStore => inst
                    .operand(0)
                    .and_then(|pointer| collector.memory_access(pointer, AccessKind::Atomic)),
                Op::AtomicLoad
                | Op::AtomicExchange
                | Op::AtomicCompareExchange
                | Op::AtomicIIncrement
                | Op::AtomicIDecrement
                | Op::AtomicIAdd
                | Op::AtomicISub
                | Op::AtomicSMin
                | Op::AtomicUMin
                | Op::AtomicSMax
                | Op::AtomicUMax
                | Op::AtomicAnd
                | Op::AtomicOr
                | Op::AtomicXor => inst
                    .operand(2)
                    .and_then(|pointer| collector.memory_access(pointer, AccessKind::Atomic)),
                Op::ImageFetch | Op::ImageRead => inst.operand(2).zip(inst.operand(3)).and_then(
                    |(image, coordinate)| collector.texel(image, coordinate, AccessKind::Load),
                ),
                Op::ImageWrite => inst.operand(0).zip(inst.operand(1)).and_then(
                    |(image, coordinate)| collector.texel(image, coordinate, AccessKind::Store),
                ),
                Op::RayQueryInitializeKHR
                    if options.checks.intersects(CheckCategories::RAY_QUERY)
                        && inst.operands.len() >= 8 =>
                {
                    Some((
                        None,
                        SiteAction::RayQuery {
                            flags: inst.operands[2],
                            origin: inst.operands[4],
                            t_min: inst.operands[5],
                            direction: inst.operands[6],
                            t_max: inst.operands[7],
                        },
                    ))
                }
                _ => None,
            };

            if let Some((variable, action)) = found {
                sites.push(Site {
                    id,
                    function,
                    instruction,
                    variable,
                    action,
                });
            }
        }
    }

    sites
}

struct Collector<'a> {
    module: &'a Module,
    info: &'a ModuleInfo,
    checks: CheckCategories,
    shader_int64: bool,
}

impl Collector<'_> {
    fn memory_access(&self, pointer: u32, access: AccessKind) -> Option<(Option<u32>, SiteAction)> {
        let (storage_class, pointee) = self.info.pointer_info(pointer)?;

        if storage_class == StorageClass::PhysicalStorageBuffer as u32 {
            if !self.checks.intersects(CheckCategories::BUFFER_ADDRESS) || !self.shader_int64 {
                return None;
            }

            let size = self.info.size_of(pointee, Default::default()).unwrap_or(0);

            return Some((
                None,
                SiteAction::Address {
                    pointer,
                    size,
                    access,
                },
            ));
        }

        let (variable, indices) = self.trace_chain(pointer)?;
        let global = self.info.globals.get(&variable)?;

        if global.storage_class != StorageClass::Uniform as u32
            && global.storage_class != StorageClass::StorageBuffer as u32
        {
            return None;
        }

        let (descriptor, block, rest) = self.descriptor_ref(variable, &indices)?;

        if !self.info.is_block(block) {
            return None;
        }

        let layout = if self.checks.intersects(CheckCategories::BOUNDS) {
            self.info.walk_access_chain(block, rest)
        } else {
            None
        };

        if layout.is_none() && !self.checks.intersects(CheckCategories::DESCRIPTOR_VALIDITY) {
            return None;
        }

        Some((
            Some(variable),
            SiteAction::Buffer {
                descriptor,
                layout,
                access,
            },
        ))
    }

    fn descriptor_load(&self, pointer: u32) -> Option<(Option<u32>, SiteAction)> {
        if !self.checks.intersects(CheckCategories::DESCRIPTOR_VALIDITY) {
            return None;
        }

        let (variable, indices) = self.trace_chain(pointer)?;
        let global = self.info.globals.get(&variable)?;

        if global.storage_class != StorageClass::UniformConstant as u32 {
            return None;
        }

        let (descriptor, element, rest) = self.descriptor_ref(variable, &indices)?;

        if !rest.is_empty() || !self.info.is_descriptor_type(element) {
            return None;
        }

        Some((Some(variable), SiteAction::Descriptor { descriptor }))
    }

    fn texel(
        &self,
        image: u32,
        coordinate: u32,
        access: AccessKind,
    ) -> Option<(Option<u32>, SiteAction)> {
        if !self.checks.intersects(CheckCategories::BOUNDS) {
            return None;
        }

        let (variable, indices) = self.trace_image(image)?;
        let global = self.info.globals.get(&variable)?;

        if global.storage_class != StorageClass::UniformConstant as u32 {
            return None;
        }

        let (descriptor, element, rest) = self.descriptor_ref(variable, &indices)?;

        if !rest.is_empty() || !self.info.is_texel_buffer(element) {
            return None;
        }

        Some((
            Some(variable),
            SiteAction::Texel {
                descriptor,
                texel: self.info.int_value(coordinate),
                access,
            },
        ))
    }

    /// Follows access chains from `pointer` back to a global variable, returning the variable
    /// and the concatenated indices.
    fn trace_chain(&self, mut pointer: u32) -> Option<(u32, SmallVec<[u32; 8]>)> {
        let mut indices = SmallVec::new();

        loop {
            if self.info.globals.contains_key(&pointer) {
                return Some((pointer, indices));
            }

            let def = self.info.local_def(self.module, pointer)?;

            match def.op()? {
                Op::AccessChain | Op::InBoundsAccessChain => {
                    let mut outer: SmallVec<[u32; 8]> = SmallVec::from_slice(def.operands.get(3..)?);
                    outer.extend(indices);
                    indices = outer;
                    pointer = def.operand(2)?;
                }
                Op::CopyObject => pointer = def.operand(2)?,
                _ => return None,
            }
        }
    }

    /// Follows an image value back to the load of its descriptor.
    fn trace_image(&self, mut image: u32) -> Option<(u32, SmallVec<[u32; 8]>)> {
        loop {
            let def = self.info.local_def(self.module, image)?;

            match def.op()? {
                Op::Load => return self.trace_chain(def.operand(2)?),
                Op::Image | Op::SampledImage | Op::CopyObject => image = def.operand(2)?,
                _ => return None,
            }
        }
    }

    /// Splits the indices of an access chain rooted at a descriptor variable into the
    /// descriptor array index and the indices into the descriptor's contents.
    fn descriptor_ref<'i>(
        &self,
        variable: u32,
        indices: &'i [u32],
    ) -> Option<(DescriptorRef, u32, &'i [u32])> {
        let global = self.info.globals.get(&variable)?;
        let set = *self.info.decorations.descriptor_set.get(&variable)?;
        let binding = *self.info.decorations.binding.get(&variable)?;

        match self.info.ty(global.pointee)? {
            &Type::Array { element, .. } | &Type::RuntimeArray { element } => {
                let (&first, rest) = indices.split_first()?;

                Some((
                    DescriptorRef {
                        set,
                        binding,
                        index: self.info.int_value(first),
                    },
                    element,
                    rest,
                ))
            }
            _ => Some((
                DescriptorRef {
                    set,
                    binding,
                    index: IntValue::Constant(0),
                },
                global.pointee,
                indices,
            )),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tests::Assembler;

    #[test]
    fn finds_store_through_descriptor() {
        let words = Assembler::compute_store_shader(25);
        let module = Module::parse(&words).unwrap();
        let info = ModuleInfo::analyze(&module);
        let sites = collect_sites(&module, &info, &InstrumentOptions::default());

        assert_eq!(sites.len(), 1);
        let site = &sites[0];
        assert_eq!(site.action.check(), SiteCheck::BufferBounds);

        let SiteAction::Buffer {
            descriptor,
            layout: Some(layout),
            access,
        } = &site.action
        else {
            panic!("unexpected site {:?}", site.action);
        };
        assert_eq!(descriptor.set, 0);
        assert_eq!(descriptor.binding, 0);
        assert_eq!(descriptor.index, IntValue::Constant(0));
        assert_eq!(layout.constant_offset, 100);
        assert_eq!(*access, AccessKind::Store);

        // The site is the word offset of the `OpStore` in the original binary.
        let word = words[site.id as usize];
        assert_eq!(word & 0xFFFF, Op::Store as u32);
    }

    #[test]
    fn descriptor_only_without_bounds() {
        let words = Assembler::compute_store_shader(25);
        let module = Module::parse(&words).unwrap();
        let info = ModuleInfo::analyze(&module);
        let options = InstrumentOptions {
            checks: CheckCategories::DESCRIPTOR_VALIDITY,
            ..Default::default()
        };
        let sites = collect_sites(&module, &info, &options);

        assert_eq!(sites.len(), 1);
        assert_eq!(sites[0].action.check(), SiteCheck::Descriptor);
    }

    fn sites_with(words: &[u32], options: &InstrumentOptions) -> Vec<Site> {
        let module = Module::parse(words).unwrap();
        let info = ModuleInfo::analyze(&module);

        collect_sites(&module, &info, options)
    }

    fn checks(sites: &[Site]) -> Vec<SiteCheck> {
        sites.iter().map(|site| site.action.check()).collect()
    }

    #[test]
    fn runtime_index_becomes_a_runtime_term() {
        let words = Assembler::compute_indexed_store_shader();
        let sites = sites_with(&words, &InstrumentOptions::default());

        assert_eq!(sites.len(), 2);

        let SiteAction::Buffer {
            layout: Some(layout),
            access: AccessKind::Store,
            ..
        } = &sites[0].action
        else {
            panic!("unexpected site {:?}", sites[0].action);
        };
        assert_eq!(layout.constant_offset, 0);
        assert_eq!(layout.size, Some(4));
        assert_eq!(layout.runtime_terms.len(), 1);
        assert!(matches!(
            layout.runtime_terms[0],
            (
                IntValue::Id {
                    width: 32,
                    signed: false,
                    ..
                },
                4,
            )
        ));

        let SiteAction::Buffer {
            layout: Some(layout),
            access: AccessKind::Load,
            ..
        } = &sites[1].action
        else {
            panic!("unexpected site {:?}", sites[1].action);
        };
        assert_eq!(layout.constant_offset, 100);
        assert!(layout.runtime_terms.is_empty());
    }

    #[test]
    fn texel_buffer_accesses() {
        let words = Assembler::texel_buffer_shader();
        let sites = sites_with(&words, &InstrumentOptions::default());

        // Every load of an image or sampler variable is a descriptor access of its own.
        assert_eq!(
            checks(&sites),
            [
                SiteCheck::Descriptor,
                SiteCheck::TexelBounds,
                SiteCheck::Descriptor,
                SiteCheck::TexelBounds,
                SiteCheck::TexelBounds,
                SiteCheck::Descriptor,
            ],
        );

        let texels: Vec<_> = sites
            .iter()
            .filter_map(|site| match site.action {
                SiteAction::Texel {
                    descriptor,
                    texel,
                    access,
                } => Some((descriptor.binding, texel, access)),
                _ => None,
            })
            .collect();
        assert_eq!(texels.len(), 3);
        assert_eq!((texels[0].0, texels[0].2), (0, AccessKind::Load));
        assert_eq!((texels[1].0, texels[1].2), (1, AccessKind::Load));
        assert_eq!(texels[2], (1, IntValue::Constant(3), AccessKind::Store));

        let opcodes: Vec<_> = sites
            .iter()
            .map(|site| words[site.id as usize] & 0xFFFF)
            .collect();
        assert_eq!(
            opcodes,
            [
                Op::Load as u32,
                Op::ImageFetch as u32,
                Op::Load as u32,
                Op::ImageRead as u32,
                Op::ImageWrite as u32,
                Op::Load as u32,
            ],
        );

        let bounds_only = InstrumentOptions {
            checks: CheckCategories::BOUNDS,
            ..Default::default()
        };
        assert_eq!(
            checks(&sites_with(&words, &bounds_only)),
            [SiteCheck::TexelBounds; 3],
        );
    }

    #[test]
    fn buffer_address_accesses_need_int64() {
        let words = Assembler::buffer_address_shader();

        assert!(sites_with(&words, &InstrumentOptions::default()).is_empty());

        let options = InstrumentOptions {
            shader_int64: true,
            ..Default::default()
        };
        let sites = sites_with(&words, &options);
        let accesses: Vec<_> = sites
            .iter()
            .map(|site| match site.action {
                SiteAction::Address { size, access, .. } => (size, access),
                _ => panic!("unexpected site {:?}", site.action),
            })
            .collect();
        assert_eq!(accesses, [(4, AccessKind::Load), (4, AccessKind::Store)]);
        assert!(sites.iter().all(|site| site.variable.is_none()));
    }

    #[test]
    fn ray_query_initialization() {
        let words = Assembler::ray_query_shader();
        let sites = sites_with(&words, &InstrumentOptions::default());

        assert_eq!(
            checks(&sites),
            [SiteCheck::Descriptor, SiteCheck::RayQuery],
        );
        let SiteAction::Descriptor { descriptor } = sites[0].action else {
            unreachable!();
        };
        assert_eq!((descriptor.set, descriptor.binding), (0, 0));
        assert_eq!(
            words[sites[1].id as usize] & 0xFFFF,
            Op::RayQueryInitializeKHR as u32,
        );

        let ray_query_only = InstrumentOptions {
            checks: CheckCategories::RAY_QUERY,
            ..Default::default()
        };
        assert_eq!(
            checks(&sites_with(&words, &ray_query_only)),
            [SiteCheck::RayQuery],
        );
    }
}
