//! Source text emission: compiled methods → assembler text.
//!
//! The emitted text is what [`super::asm`] reads back. Constant operands are
//! written as `#index` into the module constant pool; a trailing `;` comment
//! previews the value and is ignored by the assembler.

use core::fmt::Write;

use crate::{
    bytecode::method::{Method, Op},
    value::{ConstPool, ConstValue},
};

/// First line of every emitted source file.
pub const SOURCE_HEADER: &str = "; mobc source v";

/// Emit the source text of a whole module.
///
/// `version` is the schema version whose operator semantics the text
/// describes. Line directives are written only when `debug_info` is set and
/// the method carries a line table.
pub fn emit_module_source(name: &str, methods: &[Method], pool: &ConstPool, version: u32, debug_info: bool) -> String {
    let mut out = String::new();
    let _ = writeln!(out, "{SOURCE_HEADER}{version}");
    let _ = writeln!(out, ".module {name}");
    for method in methods {
        let _ = writeln!(out);
        emit_method(&mut out, method, methods, pool, debug_info);
    }
    out
}

fn emit_method(out: &mut String, method: &Method, methods: &[Method], pool: &ConstPool, debug_info: bool) {
    let _ = writeln!(out, ".method {}({})", method.name, method.params.join(", "));
    if debug_info && method.has_debug_info() {
        for (range, line) in method.lines.iter_ranges() {
            let _ = writeln!(out, ".line {line}");
            for pc in range {
                emit_op(out, method, methods, pool, method.ops[pc as usize]);
            }
        }
    } else {
        for op in &method.ops {
            emit_op(out, method, methods, pool, *op);
        }
    }
    let _ = writeln!(out, ".end");
}

fn emit_op(out: &mut String, method: &Method, methods: &[Method], pool: &ConstPool, op: Op) {
    match op {
        Op::LoadConst(ix) => {
            let _ = write!(out, "    LOAD_CONST #{ix}");
            if let Some(v) = pool.get(ix) {
                let _ = write!(out, " ; {}", show_const(v));
            }
        }
        Op::GetAttr(ix) => {
            let _ = write!(out, "    GET_ATTR #{ix}");
            if let Some(v) = pool.get(ix) {
                let _ = write!(out, " ; {}", show_const(v));
            }
        }
        Op::LoadArg(ix) => {
            let _ = write!(out, "    LOAD_ARG {ix}");
        }
        Op::CallOp(ix) => match method.operators.get(ix as usize) {
            Some(op) => {
                let _ = write!(out, "    CALL_OP {op}");
            }
            None => {
                let _ = write!(out, "    CALL_OP ?{ix}");
            }
        },
        Op::CallMethod(ix) => match methods.get(ix as usize) {
            Some(m) => {
                let _ = write!(out, "    CALL_METHOD {}", m.name);
            }
            None => {
                let _ = write!(out, "    CALL_METHOD ?{ix}");
            }
        },
        Op::Return => out.push_str("    RETURN"),
    }
    out.push('\n');
}

/// One-line-per-op variant used by quick CLI previews.
pub fn disassemble_compact(method: &Method, pool: &ConstPool) -> String {
    let mut out = String::new();
    for (pc, op) in method.ops.iter().enumerate() {
        let preview = match *op {
            Op::LoadConst(ix) | Op::GetAttr(ix) => pool.get(ix).map(show_const),
            Op::CallOp(ix) => method.operators.get(ix as usize).map(ToString::to_string),
            _ => None,
        };
        match preview {
            Some(p) => {
                let _ = writeln!(out, "{pc:04}: {op:?} ;; {p}");
            }
            None => {
                let _ = writeln!(out, "{pc:04}: {op:?}");
            }
        }
    }
    out
}

/// Short single-line rendering of a constant.
pub fn show_const(value: &ConstValue) -> String {
    match value {
        ConstValue::Null => "null".into(),
        ConstValue::Bool(b) => format!("{b}"),
        ConstValue::I64(i) => format!("{i}"),
        ConstValue::F64(f) => format!("{f:?}"),
        ConstValue::Str(s) => {
            if s.chars().count() <= 64 {
                format!("{s:?}")
            } else {
                let head: String = s.chars().take(64).collect();
                format!("{head:?}…")
            }
        }
        ConstValue::Bytes(bytes) => format!("bytes[{}]", bytes.len()),
        ConstValue::List(items) => format!("list[{}]", items.len()),
        ConstValue::Tensor(t) => format!("tensor<{}>{:?}", t.dtype().name(), t.shape()),
    }
}
