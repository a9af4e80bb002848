//! Typed values stored in the constant pool and in module attributes.

use core::{
    fmt,
    hash::{Hash, Hasher},
    mem, slice,
};

use smallvec::SmallVec;

#[cfg(feature = "serde")]
use serde::{Deserialize, Serialize};

use crate::{buffer::BufferView, CoreError, CoreResult};

/* ─────────────────────────── DType ─────────────────────────── */

/// Element type of a tensor.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
#[repr(u8)]
pub enum DType {
    /// 1-byte boolean.
    Bool = 0,
    /// Unsigned byte.
    U8 = 1,
    /// 32-bit signed integer.
    I32 = 2,
    /// 64-bit signed integer.
    I64 = 3,
    /// 32-bit float.
    F32 = 4,
    /// 64-bit float.
    F64 = 5,
}

impl DType {
    /// Size of one element in bytes.
    pub const fn itemsize(self) -> usize {
        match self {
            Self::Bool | Self::U8 => 1,
            Self::I32 | Self::F32 => 4,
            Self::I64 | Self::F64 => 8,
        }
    }

    /// Wire code.
    pub const fn code(self) -> u8 { self as u8 }

    /// Decode a wire code.
    pub const fn from_code(code: u8) -> Option<Self> {
        match code {
            0 => Some(Self::Bool),
            1 => Some(Self::U8),
            2 => Some(Self::I32),
            3 => Some(Self::I64),
            4 => Some(Self::F32),
            5 => Some(Self::F64),
            _ => None,
        }
    }

    /// Short lowercase name (`f32`, `i64`, ...).
    pub const fn name(self) -> &'static str {
        match self {
            Self::Bool => "bool",
            Self::U8 => "u8",
            Self::I32 => "i32",
            Self::I64 => "i64",
            Self::F32 => "f32",
            Self::F64 => "f64",
        }
    }
}

/* ─────────────────────────── Tensor ─────────────────────────── */

/// Dense, contiguous tensor whose bytes live in a [`BufferView`].
///
/// Loaded tensors are views into the artifact buffer (no copy). Cloning a
/// tensor clones the view, not the data.
#[derive(Clone, PartialEq, Eq)]
pub struct Tensor {
    dtype: DType,
    shape: SmallVec<[u64; 4]>,
    data: BufferView,
}

impl Tensor {
    /// Build a tensor, checking that `data` holds exactly `numel * itemsize` bytes.
    pub fn new(dtype: DType, shape: &[u64], data: BufferView) -> CoreResult<Self> {
        let numel = shape
            .iter()
            .try_fold(1u64, |acc, &d| acc.checked_mul(d))
            .ok_or_else(|| CoreError::invalid("tensor shape overflows"))?;
        let expected = numel
            .checked_mul(dtype.itemsize() as u64)
            .ok_or_else(|| CoreError::invalid("tensor byte size overflows"))?;
        if expected != data.len() as u64 {
            return Err(CoreError::invalid(format!(
                "tensor {}{shape:?} needs {expected} bytes, got {}",
                dtype.name(),
                data.len()
            )));
        }
        Ok(Self { dtype, shape: SmallVec::from_slice(shape), data })
    }

    /// 1-D `f32` tensor owning a fresh buffer.
    pub fn from_f32(values: &[f32]) -> Self {
        let bytes: Vec<u8> = values.iter().flat_map(|v| v.to_le_bytes()).collect();
        Self { dtype: DType::F32, shape: SmallVec::from_slice(&[values.len() as u64]), data: BufferView::from_vec(bytes) }
    }

    /// 1-D `i64` tensor owning a fresh buffer.
    pub fn from_i64(values: &[i64]) -> Self {
        let bytes: Vec<u8> = values.iter().flat_map(|v| v.to_le_bytes()).collect();
        Self { dtype: DType::I64, shape: SmallVec::from_slice(&[values.len() as u64]), data: BufferView::from_vec(bytes) }
    }

    /// Same data, new shape (element count must match).
    pub fn reshape(&self, shape: &[u64]) -> CoreResult<Self> { Self::new(self.dtype, shape, self.data.clone()) }

    /// Element type.
    pub fn dtype(&self) -> DType { self.dtype }

    /// Dimensions.
    pub fn shape(&self) -> &[u64] { &self.shape }

    /// Number of elements.
    pub fn numel(&self) -> u64 { self.shape.iter().product() }

    /// Raw little-endian bytes.
    pub fn bytes(&self) -> &[u8] { self.data.as_slice() }

    /// Storage view (shares the backing buffer).
    pub fn view(&self) -> &BufferView { &self.data }
}

impl fmt::Debug for Tensor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Tensor({}{:?}, {:?})", self.dtype.name(), self.shape.as_slice(), self.data)
    }
}

/* ─────────────────────────── ConstValue ─────────────────────────── */

/// Values that can live in the constant pool or in module attributes.
#[derive(Debug, Clone)]
pub enum ConstValue {
    /// Null literal.
    Null,
    /// Boolean literal.
    Bool(bool),
    /// 64-bit signed integer.
    I64(i64),
    /// 64-bit floating point number.
    F64(f64),
    /// UTF-8 string constant.
    Str(String),
    /// Raw byte blob.
    Bytes(Vec<u8>),
    /// Heterogeneous list.
    List(Vec<ConstValue>),
    /// Dense tensor.
    Tensor(Tensor),
}

impl ConstValue {
    /// Short kind name used in diagnostics.
    pub const fn kind(&self) -> &'static str {
        match self {
            Self::Null => "null",
            Self::Bool(_) => "bool",
            Self::I64(_) => "i64",
            Self::F64(_) => "f64",
            Self::Str(_) => "str",
            Self::Bytes(_) => "bytes",
            Self::List(_) => "list",
            Self::Tensor(_) => "tensor",
        }
    }

    /// String payload, if any.
    pub fn as_str(&self) -> Option<&str> {
        match self {
            Self::Str(s) => Some(s),
            _ => None,
        }
    }

    /// Visit this value and every nested value, depth first.
    pub fn walk<'a>(&'a self, f: &mut impl FnMut(&'a Self)) {
        f(self);
        if let Self::List(items) = self {
            for item in items {
                item.walk(f);
            }
        }
    }
}

impl PartialEq for ConstValue {
    fn eq(&self, other: &Self) -> bool {
        match (self, other) {
            (Self::Null, Self::Null) => true,
            (Self::Bool(a), Self::Bool(b)) => a == b,
            (Self::I64(a), Self::I64(b)) => a == b,
            (Self::F64(a), Self::F64(b)) => a.to_bits() == b.to_bits(),
            (Self::Str(a), Self::Str(b)) => a == b,
            (Self::Bytes(a), Self::Bytes(b)) => a == b,
            (Self::List(a), Self::List(b)) => a == b,
            (Self::Tensor(a), Self::Tensor(b)) => a == b,
            _ => false,
        }
    }
}

impl Eq for ConstValue {}

impl Hash for ConstValue {
    fn hash<H: Hasher>(&self, state: &mut H) {
        mem::discriminant(self).hash(state);
        match self {
            Self::Null => {}
            Self::Bool(b) => b.hash(state),
            Self::I64(v) => v.hash(state),
            Self::F64(v) => v.to_bits().hash(state),
            Self::Str(s) => s.hash(state),
            Self::Bytes(bytes) => bytes.hash(state),
            Self::List(items) => items.hash(state),
            Self::Tensor(t) => {
                t.dtype.hash(state);
                t.shape.hash(state);
                t.bytes().hash(state);
            }
        }
    }
}

impl From<bool> for ConstValue { fn from(v: bool) -> Self { Self::Bool(v) } }
impl From<i64> for ConstValue { fn from(v: i64) -> Self { Self::I64(v) } }
impl From<f64> for ConstValue { fn from(v: f64) -> Self { Self::F64(v) } }
impl From<&str> for ConstValue { fn from(v: &str) -> Self { Self::Str(v.to_owned()) } }
impl From<String> for ConstValue { fn from(v: String) -> Self { Self::Str(v) } }
impl From<Vec<u8>> for ConstValue { fn from(v: Vec<u8>) -> Self { Self::Bytes(v) } }
impl From<Tensor> for ConstValue { fn from(v: Tensor) -> Self { Self::Tensor(v) } }

/* ─────────────────────────── ConstPool ─────────────────────────── */

/// Constant pool with stable indices (0-based).
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ConstPool {
    values: Vec<ConstValue>,
}

impl ConstPool {
    /// Create an empty pool.
    pub fn new() -> Self { Self { values: Vec::new() } }

    /// Number of stored constants.
    pub fn len(&self) -> usize { self.values.len() }

    /// Whether the pool is empty.
    pub fn is_empty(&self) -> bool { self.values.is_empty() }

    /// Iterate as `(index, &ConstValue)`.
    pub fn iter(&self) -> ConstIter<'_> { ConstIter { inner: self.values.iter().enumerate() } }

    /// Pushes a value and returns its index.
    pub fn add(&mut self, value: ConstValue) -> u32 {
        let idx = crate::len_u32(self.values.len());
        self.values.push(value);
        idx
    }

    /// Lookup a constant by index.
    pub fn get(&self, idx: u32) -> Option<&ConstValue> { self.values.get(idx as usize) }

    /// All constants in index order.
    pub fn as_slice(&self) -> &[ConstValue] { &self.values }
}

impl From<Vec<ConstValue>> for ConstPool {
    fn from(values: Vec<ConstValue>) -> Self { Self { values } }
}

impl FromIterator<ConstValue> for ConstPool {
    fn from_iter<I: IntoIterator<Item = ConstValue>>(iter: I) -> Self { Self { values: iter.into_iter().collect() } }
}

/// Iterator returned by [`ConstPool::iter`].
pub struct ConstIter<'a> {
    inner: core::iter::Enumerate<slice::Iter<'a, ConstValue>>,
}

impl<'a> Iterator for ConstIter<'a> {
    type Item = (u32, &'a ConstValue);

    fn next(&mut self) -> Option<Self::Item> {
        self.inner.next().map(|(idx, value)| (idx as u32, value))
    }
}

impl<'a> IntoIterator for &'a ConstPool {
    type Item = (u32, &'a ConstValue);
    type IntoIter = ConstIter<'a>;

    fn into_iter(self) -> Self::IntoIter { self.iter() }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;

    #[test]
    fn tensor_size_is_checked() {
        let view = BufferView::from_vec(vec![0; 12]);
        assert!(Tensor::new(DType::F32, &[3], view.clone()).is_ok());
        assert!(Tensor::new(DType::F32, &[2, 2], view.clone()).is_err());
        assert!(Tensor::new(DType::I64, &[u64::MAX, 2], view).is_err());
    }

    #[test]
    fn reshape_keeps_storage() {
        let t = Tensor::from_f32(&[1.0, 2.0, 3.0, 4.0]);
        let r = t.reshape(&[2, 2]).unwrap();
        assert_eq!(r.shape(), &[2, 2]);
        assert!(r.view().aliases(t.view()));
    }

    #[test]
    fn structural_equality_and_hash() {
        let mut set = HashSet::new();
        set.insert(ConstValue::F64(0.5));
        set.insert(ConstValue::F64(0.5));
        set.insert(ConstValue::Tensor(Tensor::from_i64(&[1, 2])));
        set.insert(ConstValue::Tensor(Tensor::from_i64(&[1, 2])));
        set.insert(ConstValue::List(vec![1i64.into(), "a".into()]));
        assert_eq!(set.len(), 3);
        assert_ne!(ConstValue::I64(1), ConstValue::F64(1.0));
    }

    #[test]
    fn walk_visits_nested_values() {
        let v = ConstValue::List(vec![ConstValue::Null, ConstValue::List(vec![true.into()])]);
        let mut kinds = Vec::new();
        v.walk(&mut |x| kinds.push(x.kind()));
        assert_eq!(kinds, ["list", "null", "list", "bool"]);
    }

    #[test]
    fn pool_indices_are_stable() {
        let mut pool = ConstPool::new();
        assert_eq!(pool.add(1i64.into()), 0);
        assert_eq!(pool.add("x".into()), 1);
        assert_eq!(pool.get(1), Some(&ConstValue::Str("x".into())));
        let collected: Vec<u32> = pool.iter().map(|(i, _)| i).collect();
        assert_eq!(collected, [0, 1]);
    }
}
