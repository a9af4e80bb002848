//! Portable module: the structured form an artifact decodes to.

use std::collections::BTreeMap;

use indexmap::IndexMap;
use mobc_core::{
    bytecode::helpers::{validate_method, Scope},
    BackingBuffer, ConstPool, ConstValue, Method, SCHEMA_VERSION,
};

use crate::{codec::Meta, Error, Result};

/// Source text bundle: file name → assembler text.
pub type SourceBundle = BTreeMap<String, String>;

/// Decoded artifact, before it becomes an executable module.
///
/// Both the upgrader and the format adapter consume this. `methods` is the
/// bytecode table; `sources` (possibly empty) is the text the adapter
/// recompiles.
#[derive(Debug, Clone)]
pub struct PortableModule {
    /// Schema version the bytecode follows.
    pub version: u32,
    /// Name, producer, key/values.
    pub meta: Meta,
    /// Bytecode table.
    pub methods: Vec<Method>,
    /// Constant pool indexed by `methods` and `sources`.
    pub constants: ConstPool,
    /// Object state.
    pub attributes: IndexMap<String, ConstValue>,
    /// Source bundle.
    pub sources: SourceBundle,
    pub(crate) buffer: Option<BackingBuffer>,
}

impl PortableModule {
    /// Empty module stamped with the current version.
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            version: SCHEMA_VERSION,
            meta: Meta { name: name.into(), ..Meta::default() },
            methods: Vec::new(),
            constants: ConstPool::new(),
            attributes: IndexMap::new(),
            sources: SourceBundle::new(),
            buffer: None,
        }
    }

    /// Module name.
    pub fn name(&self) -> &str { &self.meta.name }

    /// Buffer the module was decoded from.
    pub fn backing_buffer(&self) -> Option<&BackingBuffer> { self.buffer.as_ref() }

    /// True if any method carries a line table.
    pub fn has_debug_info(&self) -> bool { self.methods.iter().any(Method::has_debug_info) }

    /// Check the bytecode table against the pool and the attributes.
    pub fn validate(&self) -> Result<()> {
        let has_attr = |n: &str| self.attributes.contains_key(n);
        let scope = Scope { pool: &self.constants, method_count: self.methods.len(), has_attr: Some(&has_attr) };
        for (i, method) in self.methods.iter().enumerate() {
            if self.methods[..i].iter().any(|m| m.name == method.name) {
                return Err(Error::format(format!("duplicate method `{}` in bytecode table", method.name)));
            }
            validate_method(method, scope).map_err(|e| Error::format(e.to_string()))?;
        }
        Ok(())
    }
}
