use super::{analysis::ModuleInfo, module::Module, sites::Site};
use spirv::Op;
use std::{
    collections::BTreeMap,
    fmt::{Display, Error as FmtError, Formatter},
    sync::Arc,
};

/// Maps the sites of an instrumented module back to where they came from.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct DebugSymbolTable {
    sites: BTreeMap<u32, SiteInfo>,
}

/// What is known about one instrumented instruction.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct SiteInfo {
    /// Opcode of the instrumented instruction.
    pub opcode: u16,

    /// Id of the function containing the instruction.
    pub function: u32,

    /// `OpName` of the function containing the instruction.
    pub function_name: Option<Arc<str>>,

    /// The check inserted before the instruction.
    pub check: SiteCheck,

    /// The `OpLine` in effect at the instruction.
    pub location: Option<SourceLocation>,

    /// `OpName` of the variable the instruction accesses.
    pub variable: Option<Arc<str>>,
}

/// The kind of check inserted at a site.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum SiteCheck {
    BufferBounds,
    TexelBounds,
    Descriptor,
    BufferAddress,
    RayQuery,
}

/// A position in the source code a module was compiled from.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct SourceLocation {
    pub file: Option<Arc<str>>,
    pub line: u32,
    pub column: u32,
}

impl Display for SourceLocation {
    fn fmt(&self, f: &mut Formatter<'_>) -> Result<(), FmtError> {
        match &self.file {
            Some(file) => write!(f, "{}:{}:{}", file, self.line, self.column),
            None => write!(f, "line {}, column {}", self.line, self.column),
        }
    }
}

impl DebugSymbolTable {
    pub(super) fn build(module: &Module, info: &ModuleInfo, sites: &[Site]) -> Self {
        let mut table = BTreeMap::new();
        let name = |id: u32| info.names.get(&id).map(|name| Arc::from(name.as_str()));
        let mut sites = sites.iter().peekable();

        for (function_index, function) in module.functions.iter().enumerate() {
            let function_id = function.id().unwrap_or_default();
            let mut line = None;

            for (index, inst) in function.instructions.iter().enumerate() {
                match inst.op() {
                    Some(Op::Line) => {
                        line = Some(SourceLocation {
                            file: inst.operand(0).and_then(|file| {
                                info.strings.get(&file).map(|file| Arc::from(file.as_str()))
                            }),
                            line: inst.operand(1).unwrap_or_default(),
                            column: inst.operand(2).unwrap_or_default(),
                        });
                    }
                    // Line information ends with the block.
                    Some(Op::NoLine | Op::Label) => line = None,
                    _ => {}
                }

                while let Some(site) = sites
                    .next_if(|site| site.function == function_index && site.instruction == index)
                {
                    table.insert(
                        site.id,
                        SiteInfo {
                            opcode: inst.opcode,
                            function: function_id,
                            function_name: name(function_id),
                            check: site.action.check(),
                            location: line.clone(),
                            variable: site.variable.and_then(name),
                        },
                    );
                }
            }
        }

        DebugSymbolTable { sites: table }
    }

    /// Returns what is known about `site`.
    #[inline]
    pub fn get(&self, site: u32) -> Option<&SiteInfo> {
        self.sites.get(&site)
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.sites.len()
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.sites.is_empty()
    }

    /// Iterates over the sites in ascending order.
    pub fn iter(&self) -> impl ExactSizeIterator<Item = (u32, &SiteInfo)> {
        self.sites.iter().map(|(&site, info)| (site, info))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        instrument::{sites::collect_sites, InstrumentOptions},
        tests::Assembler,
    };

    #[test]
    fn resolves_lines_and_names() {
        let words = Assembler::compute_store_shader(25);
        let module = Module::parse(&words).unwrap();
        let info = ModuleInfo::analyze(&module);
        let sites = collect_sites(&module, &info, &InstrumentOptions::default());
        let table = DebugSymbolTable::build(&module, &info, &sites);

        let (site, site_info) = table.iter().next().unwrap();
        assert_eq!(site, sites[0].id);
        assert_eq!(site_info.opcode, Op::Store as u16);
        assert_eq!(site_info.check, SiteCheck::BufferBounds);
        assert_eq!(site_info.variable.as_deref(), Some("data"));
        assert_eq!(site_info.function_name.as_deref(), Some("main"));

        let location = site_info.location.as_ref().unwrap();
        assert_eq!(location.file.as_deref(), Some("store.comp"));
        assert_eq!(location.line, 7);
        assert_eq!(location.to_string(), "store.comp:7:5");
    }
}
