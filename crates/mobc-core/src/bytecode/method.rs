//! Compiled method bodies: operator table, instruction stream, line table.

use core::{fmt, ops::Range, str::FromStr};

#[cfg(feature = "serde")]
use serde::{Deserialize, Serialize};

use crate::{CoreError, CoreResult};

/* ─────────────────────────── Op ─────────────────────────── */

/// Instruction set of the portable bytecode.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub enum Op {
    /// Push constant `u32` (module constant pool) onto the stack.
    LoadConst(u32),
    /// Push argument `u32` of the current method.
    LoadArg(u32),
    /// Push the module attribute named by the `Str` constant `u32`.
    GetAttr(u32),
    /// Call entry `u32` of the method's operator table.
    CallOp(u32),
    /// Call method `u32` of the module.
    CallMethod(u32),
    /// Return the top of the stack.
    Return,
}

impl Op {
    /// Wire opcode.
    pub const fn opcode(self) -> u8 {
        match self {
            Self::LoadConst(_) => 0x10,
            Self::LoadArg(_) => 0x11,
            Self::GetAttr(_) => 0x12,
            Self::CallOp(_) => 0x13,
            Self::CallMethod(_) => 0x14,
            Self::Return => 0x1F,
        }
    }

    /// Operand, if the op has one.
    pub const fn operand(self) -> Option<u32> {
        match self {
            Self::LoadConst(x) | Self::LoadArg(x) | Self::GetAttr(x) | Self::CallOp(x) | Self::CallMethod(x) => Some(x),
            Self::Return => None,
        }
    }

    /// Rebuild an op from its wire opcode and operand.
    pub const fn from_parts(opcode: u8, operand: u32) -> Option<Self> {
        match opcode {
            0x10 => Some(Self::LoadConst(operand)),
            0x11 => Some(Self::LoadArg(operand)),
            0x12 => Some(Self::GetAttr(operand)),
            0x13 => Some(Self::CallOp(operand)),
            0x14 => Some(Self::CallMethod(operand)),
            0x1F => Some(Self::Return),
            _ => None,
        }
    }
}

/* ─────────────────────────── OperatorRef ─────────────────────────── */

/// Reference to a versioned operator, e.g. `aten::div.Tensor/2`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub struct OperatorRef {
    /// Qualified name (`aten::div`).
    pub name: String,
    /// Overload name (`Tensor`), empty for the default overload.
    pub overload: String,
    /// Number of arguments pushed by the caller, when known.
    pub num_args: Option<u32>,
}

impl OperatorRef {
    /// Build a reference without argument count.
    pub fn new(name: impl Into<String>, overload: impl Into<String>) -> Self {
        Self { name: name.into(), overload: overload.into(), num_args: None }
    }

    /// Same reference with an argument count.
    #[must_use]
    pub fn with_args(mut self, n: u32) -> Self {
        self.num_args = Some(n);
        self
    }

    /// True if name and overload match (argument count ignored).
    pub fn is(&self, name: &str, overload: &str) -> bool { self.name == name && self.overload == overload }
}

impl fmt::Display for OperatorRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.name)?;
        if !self.overload.is_empty() {
            write!(f, ".{}", self.overload)?;
        }
        if let Some(n) = self.num_args {
            write!(f, "/{n}")?;
        }
        Ok(())
    }
}

impl FromStr for OperatorRef {
    type Err = CoreError;

    /// Parse `ns::name[.overload][/nargs]`.
    fn from_str(s: &str) -> CoreResult<Self> {
        let (head, num_args) = match s.rsplit_once('/') {
            Some((h, n)) => {
                let n = n.parse::<u32>().map_err(|_| CoreError::invalid(format!("bad argument count in `{s}`")))?;
                (h, Some(n))
            }
            None => (s, None),
        };
        // the overload separator is the first '.' after the last "::"
        let name_start = head.rfind("::").map_or(0, |i| i + 2);
        let (name, overload) = match head[name_start..].find('.') {
            Some(dot) => (&head[..name_start + dot], &head[name_start + dot + 1..]),
            None => (head, ""),
        };
        if name.is_empty() || name.ends_with("::") || name.chars().any(char::is_whitespace) {
            return Err(CoreError::invalid(format!("bad operator name `{s}`")));
        }
        Ok(Self { name: name.to_owned(), overload: overload.to_owned(), num_args })
    }
}

/* ─────────────────────────── LineTable ─────────────────────────── */

/// Line table (pc → source line) with contiguous range iteration helpers.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct LineTable {
    lines: Vec<u32>,
}

impl LineTable {
    /// Create an empty line table.
    pub fn new() -> Self { Self { lines: Vec::new() } }
    /// Append a mapping for the given program counter.
    pub fn push(&mut self, line: u32) { self.lines.push(line); }
    /// Number of stored line entries.
    pub fn len(&self) -> usize { self.lines.len() }
    /// True if no mapping is recorded.
    pub fn is_empty(&self) -> bool { self.lines.is_empty() }
    /// Iterate over contiguous ranges of the same line number.
    pub fn iter_ranges(&self) -> LineRangeIter<'_> { LineRangeIter { lines: &self.lines, index: 0 } }
    /// Insert a mapping at `pc`, shifting later entries.
    pub fn insert(&mut self, pc: usize, line: u32) { self.lines.insert(pc, line); }
    /// Remove all recorded mappings.
    pub fn clear(&mut self) { self.lines.clear(); }
    /// Raw entries, one per op.
    pub fn as_slice(&self) -> &[u32] { &self.lines }
}

impl From<Vec<u32>> for LineTable {
    fn from(lines: Vec<u32>) -> Self { Self { lines } }
}

/// Iterator yielding contiguous line ranges `(start..end, line)`.
pub struct LineRangeIter<'a> {
    lines: &'a [u32],
    index: usize,
}

impl Iterator for LineRangeIter<'_> {
    type Item = (Range<u32>, u32);

    fn next(&mut self) -> Option<Self::Item> {
        if self.index >= self.lines.len() {
            return None;
        }
        let start = self.index;
        let line = self.lines[start];
        self.index += 1;
        while self.index < self.lines.len() && self.lines[self.index] == line {
            self.index += 1;
        }
        Some((start as u32..self.index as u32, line))
    }
}

/* ─────────────────────────── Method ─────────────────────────── */

/// Compiled method: operator table, linear op list and optional line table.
///
/// The line table is either empty (debug info stripped) or holds exactly one
/// entry per op.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Method {
    /// Method name, unique inside a module.
    pub name: String,
    /// Parameter names (`self` included when the method takes it).
    pub params: Vec<String>,
    /// Operators referenced by `Op::CallOp`.
    pub operators: Vec<OperatorRef>,
    /// Linear list of bytecode operations.
    pub ops: Vec<Op>,
    /// Mapping between program counters and source lines.
    pub lines: LineTable,
}

impl Method {
    /// Create an empty method.
    pub fn new<S: Into<String>>(name: impl Into<String>, params: impl IntoIterator<Item = S>) -> Self {
        Self {
            name: name.into(),
            params: params.into_iter().map(Into::into).collect(),
            ..Self::default()
        }
    }

    /// Intern an operator and return its table index.
    pub fn add_operator(&mut self, op: OperatorRef) -> u32 {
        if let Some(ix) = self.operators.iter().position(|o| *o == op) {
            return ix as u32;
        }
        self.operators.push(op);
        crate::len_u32(self.operators.len() - 1)
    }

    /// Push an opcode while recording its source line.
    pub fn push_op(&mut self, op: Op, line: u32) {
        self.ops.push(op);
        self.lines.push(line);
    }

    /// Push an opcode without line information (stripped methods).
    pub fn push(&mut self, op: Op) { self.ops.push(op); }

    /// Append `call <operator>` and return the op's pc.
    pub fn call_op(&mut self, op: OperatorRef, line: u32) -> usize {
        let ix = self.add_operator(op);
        self.push_op(Op::CallOp(ix), line);
        self.ops.len() - 1
    }

    /// True if a line is recorded for every op.
    pub fn has_debug_info(&self) -> bool { !self.ops.is_empty() && self.lines.len() == self.ops.len() }

    /// Drop the line table.
    pub fn strip_debug(&mut self) { self.lines.clear(); }

    /// Operator called at `pc`, if that op is a `CallOp`.
    pub fn operator_at(&self, pc: usize) -> Option<&OperatorRef> {
        match self.ops.get(pc)? {
            Op::CallOp(ix) => self.operators.get(*ix as usize),
            _ => None,
        }
    }
}
