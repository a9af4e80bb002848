//! Section payload encodings.
//!
//! Every section is a little-endian stream written with [`ByteWriter`] and
//! read back with a [`ByteReader`] based at the section's absolute offset, so
//! decoding errors point into the artifact.

use std::collections::{BTreeMap, HashMap};

use indexmap::IndexMap;
use mobc_core::{
    BackingBuffer, BufferView, ByteReader, ByteWriter, ConstPool, ConstValue, CoreResult, DType, LineTable, Method, Op,
    OperatorRef, Tensor,
};

use crate::{layout::TENSOR_ALIGN, Error, ExtraFiles, Result};

/// Run `f` on a fresh writer. Lengths over the 32-bit limit surface as
/// [`Error::Invalid`].
fn encode(f: impl FnOnce(&mut ByteWriter) -> CoreResult<()>) -> Result<Vec<u8>> {
    let mut w = ByteWriter::new();
    f(&mut w).map_err(Error::oversized)?;
    Ok(w.into_vec())
}

/* ─────────────────────────── META ─────────────────────────── */

/// Module metadata (`META`).
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Meta {
    /// Module name.
    pub name: String,
    /// Producer string (`mobc-format <version>`).
    pub producer: String,
    /// Free-form key/values.
    pub entries: BTreeMap<String, String>,
}

/// Encode `META`.
pub fn write_meta(meta: &Meta) -> Result<Vec<u8>> {
    encode(|w| {
        w.write_str(&meta.name)?;
        w.write_str(&meta.producer)?;
        w.write_len(meta.entries.len())?;
        for (k, v) in &meta.entries {
            w.write_str(k)?;
            w.write_str(v)?;
        }
        Ok(())
    })
}

/// Decode `META`.
pub fn read_meta(r: &mut ByteReader<'_>) -> Result<Meta> {
    let name = r.read_str()?.to_owned();
    let producer = r.read_str()?.to_owned();
    let count = r.read_count(8)?;
    let mut entries = BTreeMap::new();
    for _ in 0..count {
        let k = r.read_str()?.to_owned();
        let v = r.read_str()?.to_owned();
        entries.insert(k, v);
    }
    Ok(Meta { name, producer, entries })
}

/* ─────────────────────────── TSTO ─────────────────────────── */

/// Tensor storages collected while values are encoded. Views aliasing the
/// same bytes of the same buffer are stored once.
#[derive(Debug, Default)]
pub struct StorageTable {
    views: Vec<BufferView>,
    index: HashMap<(usize, usize, usize), u32>,
}

impl StorageTable {
    /// Empty table.
    pub fn new() -> Self { Self::default() }

    /// Index of `view`, adding it on first sight.
    pub fn intern(&mut self, view: &BufferView) -> u32 {
        let range = view.range();
        let key = (view.buffer().storage_id(), range.start, range.end);
        let next = mobc_core::len_u32(self.views.len());
        *self.index.entry(key).or_insert_with(|| {
            self.views.push(view.clone());
            next
        })
    }

    /// Number of distinct storages.
    pub fn len(&self) -> usize { self.views.len() }

    /// True when no tensor was encoded.
    pub fn is_empty(&self) -> bool { self.views.is_empty() }

    /// Encode `TSTO`: `count`, `count × {offset u64, len u64}` relative to the
    /// section start, then the data, each storage on a [`TENSOR_ALIGN`]
    /// boundary. The section itself must start on that boundary.
    pub fn encode(&self) -> Result<Vec<u8>> {
        let header_len = 4 + self.views.len() * 16;
        let mut offsets = Vec::with_capacity(self.views.len());
        let mut pos = align_up(header_len, TENSOR_ALIGN);
        for view in &self.views {
            offsets.push(pos);
            pos = align_up(pos + view.len(), TENSOR_ALIGN);
        }

        encode(|w| {
            w.write_len(self.views.len())?;
            for (view, &off) in self.views.iter().zip(&offsets) {
                w.write_u64_le(off as u64);
                w.write_u64_le(view.len() as u64);
            }
            for view in &self.views {
                w.align_to(TENSOR_ALIGN);
                w.write_bytes(view.as_slice());
            }
            Ok(())
        })
    }
}

const fn align_up(n: usize, align: usize) -> usize { n.div_ceil(align) * align }

/// Decode `TSTO` into views of `buffer` (no copy).
pub fn read_storages(buffer: &BackingBuffer, section: std::ops::Range<usize>) -> Result<Vec<BufferView>> {
    let base = section.start;
    let bytes = &buffer.as_slice()[section.clone()];
    let mut r = ByteReader::with_base(bytes, base);
    let count = r.read_count(16)?;
    let mut views = Vec::with_capacity(count);
    for _ in 0..count {
        let at = r.absolute_offset();
        let off = r.read_u64_le()?;
        let len = r.read_u64_le()?;
        let start = usize::try_from(off).ok().and_then(|o| o.checked_add(base));
        let end = start.zip(usize::try_from(len).ok()).and_then(|(s, l)| s.checked_add(l));
        let view = match (start, end) {
            (Some(s), Some(e)) if e <= section.end => buffer.view(s..e),
            _ => None,
        }
        .ok_or_else(|| Error::format_at(at, format!("tensor storage [{off}; {len}] lies outside its section")))?;
        views.push(view);
    }
    Ok(views)
}

/* ─────────────────────────── Values ─────────────────────────── */

const V_NULL: u8 = 0;
const V_BOOL: u8 = 1;
const V_I64: u8 = 2;
const V_F64: u8 = 3;
const V_STR: u8 = 4;
const V_BYTES: u8 = 5;
const V_LIST: u8 = 6;
const V_TENSOR: u8 = 7;

/// Nesting limit for lists (hostile inputs must not blow the stack).
const MAX_DEPTH: usize = 64;

/// Encode one value; tensors go through `storages`.
pub fn write_value(w: &mut ByteWriter, value: &ConstValue, storages: &mut StorageTable) -> CoreResult<()> {
    match value {
        ConstValue::Null => w.write_u8(V_NULL),
        ConstValue::Bool(b) => {
            w.write_u8(V_BOOL);
            w.write_u8(u8::from(*b));
        }
        ConstValue::I64(v) => {
            w.write_u8(V_I64);
            w.write_i64_le(*v);
        }
        ConstValue::F64(v) => {
            w.write_u8(V_F64);
            w.write_f64_le(*v);
        }
        ConstValue::Str(s) => {
            w.write_u8(V_STR);
            w.write_str(s)?;
        }
        ConstValue::Bytes(b) => {
            w.write_u8(V_BYTES);
            w.write_len_prefixed(b)?;
        }
        ConstValue::List(items) => {
            w.write_u8(V_LIST);
            w.write_len(items.len())?;
            for item in items {
                write_value(w, item, storages)?;
            }
        }
        ConstValue::Tensor(t) => {
            w.write_u8(V_TENSOR);
            w.write_u8(t.dtype().code());
            w.write_len(t.shape().len())?;
            for &d in t.shape() {
                w.write_u64_le(d);
            }
            w.write_u32_le(storages.intern(t.view()));
        }
    }
    Ok(())
}

/// Decode one value; tensor operands index `storages`.
pub fn read_value(r: &mut ByteReader<'_>, storages: &[BufferView]) -> Result<ConstValue> { read_value_at(r, storages, 0) }

fn read_value_at(r: &mut ByteReader<'_>, storages: &[BufferView], depth: usize) -> Result<ConstValue> {
    let at = r.absolute_offset();
    Ok(match r.read_u8()? {
        V_NULL => ConstValue::Null,
        V_BOOL => match r.read_u8()? {
            0 => ConstValue::Bool(false),
            1 => ConstValue::Bool(true),
            b => return Err(Error::format_at(at + 1, format!("bad bool byte {b}"))),
        },
        V_I64 => ConstValue::I64(r.read_i64_le()?),
        V_F64 => ConstValue::F64(r.read_f64_le()?),
        V_STR => ConstValue::Str(r.read_str()?.to_owned()),
        V_BYTES => ConstValue::Bytes(r.read_len_prefixed()?.to_vec()),
        V_LIST => {
            if depth >= MAX_DEPTH {
                return Err(Error::format_at(at, "lists nested too deeply"));
            }
            let count = r.read_count(1)?;
            let mut items = Vec::with_capacity(count);
            for _ in 0..count {
                items.push(read_value_at(r, storages, depth + 1)?);
            }
            ConstValue::List(items)
        }
        V_TENSOR => {
            let code = r.read_u8()?;
            let dtype = DType::from_code(code).ok_or_else(|| Error::format_at(at + 1, format!("unknown dtype {code}")))?;
            let ndim = r.read_count(8)?;
            let mut shape = Vec::with_capacity(ndim);
            for _ in 0..ndim {
                shape.push(r.read_u64_le()?);
            }
            let six = r.read_u32_le()?;
            let storage = storages
                .get(six as usize)
                .ok_or_else(|| Error::format_at(at, format!("tensor references storage {six} of {}", storages.len())))?;
            let tensor = Tensor::new(dtype, &shape, storage.clone()).map_err(|e| Error::format_at(at, e.to_string()))?;
            ConstValue::Tensor(tensor)
        }
        tag => return Err(Error::format_at(at, format!("unknown value tag {tag}"))),
    })
}

/// Encode `CNST`.
pub fn write_constants(pool: &ConstPool, storages: &mut StorageTable) -> Result<Vec<u8>> {
    encode(|w| {
        w.write_len(pool.len())?;
        pool.iter().try_for_each(|(_, value)| write_value(w, value, storages))
    })
}

/// Decode `CNST`.
pub fn read_constants(r: &mut ByteReader<'_>, storages: &[BufferView]) -> Result<ConstPool> {
    let count = r.read_count(1)?;
    let mut values = Vec::with_capacity(count);
    for _ in 0..count {
        values.push(read_value(r, storages)?);
    }
    Ok(ConstPool::from(values))
}

/// Encode `OBJS` (attributes in declaration order).
pub fn write_attributes(attrs: &IndexMap<String, ConstValue>, storages: &mut StorageTable) -> Result<Vec<u8>> {
    encode(|w| {
        w.write_len(attrs.len())?;
        for (name, value) in attrs {
            w.write_str(name)?;
            write_value(w, value, storages)?;
        }
        Ok(())
    })
}

/// Decode `OBJS`.
pub fn read_attributes(r: &mut ByteReader<'_>, storages: &[BufferView]) -> Result<IndexMap<String, ConstValue>> {
    let count = r.read_count(5)?;
    let mut attrs = IndexMap::with_capacity(count);
    for _ in 0..count {
        let at = r.absolute_offset();
        let name = r.read_str()?.to_owned();
        let value = read_value(r, storages)?;
        if attrs.insert(name, value).is_some() {
            return Err(Error::format_at(at, "duplicate attribute name"));
        }
    }
    Ok(attrs)
}

/* ─────────────────────────── CODE ─────────────────────────── */

/// Encode `CODE`.
pub fn write_methods(methods: &[Method]) -> Result<Vec<u8>> {
    encode(|w| {
        w.write_len(methods.len())?;
        for m in methods {
            w.write_str(&m.name)?;
            w.write_len(m.params.len())?;
            for p in &m.params {
                w.write_str(p)?;
            }
            w.write_len(m.operators.len())?;
            for op in &m.operators {
                w.write_str(&op.name)?;
                w.write_str(&op.overload)?;
                match op.num_args {
                    Some(n) => {
                        w.write_u8(1);
                        w.write_u32_le(n);
                    }
                    None => {
                        w.write_u8(0);
                        w.write_u32_le(0);
                    }
                }
            }
            w.write_len(m.ops.len())?;
            for op in &m.ops {
                w.write_u8(op.opcode());
                w.write_u32_le(op.operand().unwrap_or(0));
            }
            w.write_len(m.lines.len())?;
            for &line in m.lines.as_slice() {
                w.write_u32_le(line);
            }
        }
        Ok(())
    })
}

/// Decode `CODE`. Operand ranges are checked later, against the whole module.
pub fn read_methods(r: &mut ByteReader<'_>) -> Result<Vec<Method>> {
    let count = r.read_count(20)?;
    let mut methods = Vec::with_capacity(count);
    for _ in 0..count {
        let name = r.read_str()?.to_owned();
        let nparams = r.read_count(4)?;
        let mut params = Vec::with_capacity(nparams);
        for _ in 0..nparams {
            params.push(r.read_str()?.to_owned());
        }
        let mut method = Method::new(name, params);

        let nops = r.read_count(13)?;
        for _ in 0..nops {
            let at = r.absolute_offset();
            let name = r.read_str()?.to_owned();
            let overload = r.read_str()?.to_owned();
            let num_args = match (r.read_u8()?, r.read_u32_le()?) {
                (0, _) => None,
                (1, n) => Some(n),
                (flag, _) => return Err(Error::format_at(at, format!("bad argument-count flag {flag}"))),
            };
            method.operators.push(OperatorRef { name, overload, num_args });
        }

        let nins = r.read_count(5)?;
        method.ops.reserve(nins);
        for _ in 0..nins {
            let at = r.absolute_offset();
            let opcode = r.read_u8()?;
            let operand = r.read_u32_le()?;
            let op = Op::from_parts(opcode, operand)
                .ok_or_else(|| Error::format_at(at, format!("unknown opcode 0x{opcode:02X}")))?;
            method.ops.push(op);
        }

        let at = r.absolute_offset();
        let nlines = r.read_count(4)?;
        if nlines != 0 && nlines != nins {
            return Err(Error::format_at(at, format!("`{}`: {nlines} line entries for {nins} ops", method.name)));
        }
        let mut lines = Vec::with_capacity(nlines);
        for _ in 0..nlines {
            lines.push(r.read_u32_le()?);
        }
        method.lines = LineTable::from(lines);
        methods.push(method);
    }
    Ok(methods)
}

/* ─────────────────────────── SRCS / XTRA ─────────────────────────── */

/// Encode a name → bytes table (sorted, as `BTreeMap` iterates).
pub fn write_files<'a, I>(files: I) -> Result<Vec<u8>>
where
    I: ExactSizeIterator<Item = (&'a String, &'a [u8])>,
{
    encode(|w| {
        w.write_len(files.len())?;
        for (name, data) in files {
            w.write_str(name)?;
            w.write_len_prefixed(data)?;
        }
        Ok(())
    })
}

/// Decode `SRCS` (UTF-8 text per file).
pub fn read_sources(r: &mut ByteReader<'_>) -> Result<BTreeMap<String, String>> {
    let count = r.read_count(8)?;
    let mut out = BTreeMap::new();
    for _ in 0..count {
        let at = r.absolute_offset();
        let name = r.read_str()?.to_owned();
        let text = r.read_str()?.to_owned();
        if out.insert(name, text).is_some() {
            return Err(Error::format_at(at, "duplicate source file"));
        }
    }
    Ok(out)
}

/// Decode `XTRA` into `out`. Keys already present in `out` keep the caller's
/// value; new keys are added.
pub fn read_extra_files_into(r: &mut ByteReader<'_>, out: &mut ExtraFiles) -> Result<usize> {
    let count = r.read_count(8)?;
    let mut added = 0;
    for _ in 0..count {
        let name = r.read_str()?;
        let data = r.read_len_prefixed()?;
        if !out.contains_key(name) {
            out.insert(name.to_owned(), data.to_vec());
            added += 1;
        }
    }
    Ok(added)
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn shared_storage_is_written_once() {
        let t = Tensor::from_f32(&[1.0, 2.0, 3.0, 4.0]);
        let reshaped = t.reshape(&[2, 2]).unwrap();
        let other = Tensor::from_f32(&[1.0, 2.0, 3.0, 4.0]);
        let mut table = StorageTable::new();
        let a = table.intern(t.view());
        let b = table.intern(reshaped.view());
        let c = table.intern(other.view());
        assert_eq!((a, b, c), (0, 0, 1));
        assert_eq!(table.len(), 2);
    }

    #[test]
    fn storages_decode_as_views_into_the_buffer() {
        let mut table = StorageTable::new();
        table.intern(Tensor::from_i64(&[7, 8]).view());
        table.intern(Tensor::from_f32(&[0.5]).view());
        // section must start on the alignment boundary
        let mut bytes = vec![0u8; TENSOR_ALIGN];
        let payload = table.encode().unwrap();
        bytes.extend_from_slice(&payload);
        let buffer = BackingBuffer::from_vec(bytes);
        let views = read_storages(&buffer, TENSOR_ALIGN..TENSOR_ALIGN + payload.len()).unwrap();
        assert_eq!(views.len(), 2);
        assert_eq!(views[1].as_slice(), &0.5f32.to_le_bytes());
        for v in &views {
            assert!(v.buffer().ptr_eq(&buffer));
            assert_eq!(v.range().start % TENSOR_ALIGN, 0);
        }
    }

    #[test]
    fn values_decode_to_equal_values() {
        let pool = ConstPool::from(vec![
            ConstValue::Null,
            ConstValue::Bool(true),
            ConstValue::I64(-3),
            ConstValue::F64(0.25),
            ConstValue::Str("héllo".into()),
            ConstValue::Bytes(vec![0, 255]),
            ConstValue::List(vec![ConstValue::I64(1), ConstValue::List(vec![])]),
        ]);
        let mut storages = StorageTable::new();
        let bytes = write_constants(&pool, &mut storages).unwrap();
        assert!(storages.is_empty());
        let back = read_constants(&mut ByteReader::new(&bytes), &[]).unwrap();
        assert_eq!(back, pool);
    }

    #[cfg(target_pointer_width = "64")]
    #[test]
    fn oversized_lengths_fail_the_encode() {
        let err = encode(|w| {
            w.write_u8(V_BYTES);
            w.write_len(u32::MAX as usize + 1)
        })
        .unwrap_err();
        assert!(matches!(err, Error::Invalid(_)), "{err:?}");
    }

    #[test]
    fn hostile_inputs_fail_cleanly() {
        // unknown tag
        let err = read_value(&mut ByteReader::with_base(&[0x42], 100), &[]).unwrap_err();
        assert!(matches!(err, Error::Format { offset: Some(100), .. }));
        // huge list count with no payload
        let mut w = ByteWriter::new();
        w.write_u8(V_LIST);
        w.write_u32_le(u32::MAX);
        assert!(read_value(&mut ByteReader::new(w.as_slice()), &[]).is_err());
        // tensor pointing at a missing storage
        let mut w = ByteWriter::new();
        w.write_u8(V_TENSOR);
        w.write_u8(DType::F32.code());
        w.write_u32_le(0);
        w.write_u32_le(3);
        assert!(read_value(&mut ByteReader::new(w.as_slice()), &[]).is_err());
    }

    #[test]
    fn extra_files_are_insert_if_absent() {
        let mut files = ExtraFiles::new();
        files.insert("a".into(), b"new".to_vec());
        files.insert("b".into(), b"new".to_vec());
        let bytes = write_files(files.iter().map(|(k, v)| (k, v.as_slice()))).unwrap();

        let mut out = ExtraFiles::new();
        out.insert("a".into(), b"mine".to_vec());
        let added = read_extra_files_into(&mut ByteReader::new(&bytes), &mut out).unwrap();
        assert_eq!(added, 1);
        assert_eq!(out["a"], b"mine");
        assert_eq!(out["b"], b"new");
    }

    #[test]
    fn methods_decode_with_operator_tables_and_lines() {
        let mut m = Method::new("forward", ["self", "x"]);
        m.push_op(Op::LoadArg(1), 3);
        m.call_op(OperatorRef::new("aten::relu", "").with_args(1), 3);
        m.push_op(Op::Return, 4);
        let mut plain = Method::new("helper", ["self"]);
        plain.push(Op::Return);
        let bytes = write_methods(&[m.clone(), plain.clone()]).unwrap();
        let back = read_methods(&mut ByteReader::new(&bytes)).unwrap();
        assert_eq!(back, vec![m, plain]);
    }
}
