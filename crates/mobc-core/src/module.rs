//! Executable module: the rich in-memory form saved to and rebuilt from an
//! artifact.

use indexmap::IndexMap;

use crate::{
    buffer::BackingBuffer,
    bytecode::Method,
    value::{ConstPool, ConstValue, Tensor},
    SCHEMA_VERSION,
};

/// Module = named attributes (parameters, buffers, plain values), a shared
/// constant pool and compiled methods indexing into it.
///
/// A loaded module may retain the artifact's [`BackingBuffer`]; tensors
/// inside it are views into that buffer.
#[derive(Debug, Clone)]
pub struct Module {
    /// Module name (also names its source file in the bundle).
    pub name: String,
    /// Attributes in declaration order.
    pub attributes: IndexMap<String, ConstValue>,
    /// Constant pool shared by all methods.
    pub constants: ConstPool,
    /// Methods in declaration order; `Op::CallMethod` indexes this list.
    pub methods: Vec<Method>,
    /// Schema version whose semantics the bytecode follows. Built modules
    /// start at [`SCHEMA_VERSION`]; a module loaded without upgrading keeps
    /// the version it was written under.
    pub bytecode_version: u32,
    backing: Option<BackingBuffer>,
}

impl Default for Module {
    fn default() -> Self {
        Self {
            name: String::new(),
            attributes: IndexMap::new(),
            constants: ConstPool::new(),
            methods: Vec::new(),
            bytecode_version: SCHEMA_VERSION,
            backing: None,
        }
    }
}

impl Module {
    /// Empty module.
    pub fn new(name: impl Into<String>) -> Self { Self { name: name.into(), ..Self::default() } }

    /// Set (or replace) an attribute.
    pub fn set_attr(&mut self, name: impl Into<String>, value: impl Into<ConstValue>) {
        self.attributes.insert(name.into(), value.into());
    }

    /// Attribute by name.
    pub fn attr(&self, name: &str) -> Option<&ConstValue> { self.attributes.get(name) }

    /// Append a method and return its index.
    pub fn add_method(&mut self, method: Method) -> u32 {
        self.methods.push(method);
        crate::len_u32(self.methods.len() - 1)
    }

    /// Method by name.
    pub fn method(&self, name: &str) -> Option<&Method> { self.methods.iter().find(|m| m.name == name) }

    /// Index of a method by name.
    pub fn method_index(&self, name: &str) -> Option<u32> {
        self.methods.iter().position(|m| m.name == name).map(|i| i as u32)
    }

    /// Every tensor reachable from attributes and constants.
    pub fn tensors(&self) -> Vec<&Tensor> {
        let mut out = Vec::new();
        for value in self.attributes.values().chain(self.constants.as_slice()) {
            value.walk(&mut |v| {
                if let ConstValue::Tensor(t) = v {
                    out.push(t);
                }
            });
        }
        out
    }

    /// Keep `buffer` alive for as long as this module (or a clone) lives.
    pub fn retain_buffer(&mut self, buffer: BackingBuffer) { self.backing = Some(buffer); }

    /// Buffer this module was loaded from, if any.
    pub fn backing_buffer(&self) -> Option<&BackingBuffer> { self.backing.as_ref() }

    /// True if the bytecode predates the current schema.
    pub const fn is_outdated(&self) -> bool { self.bytecode_version < SCHEMA_VERSION }
}

/// Equality ignores the retained buffer: two modules are equal when their
/// content is.
impl PartialEq for Module {
    fn eq(&self, other: &Self) -> bool {
        self.name == other.name
            && self.attributes == other.attributes
            && self.constants == other.constants
            && self.methods == other.methods
            && self.bytecode_version == other.bytecode_version
    }
}
