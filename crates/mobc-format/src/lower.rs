//! Lowering: executable methods → the restricted bytecode table written to
//! `CODE`.

use std::collections::HashMap;

use mobc_core::{
    bytecode::helpers::{validate_module, validate_names},
    CoreError, Method, Module, Op,
};

use crate::{Error, Result};

/// Validate `module` and lower every method.
///
/// Fails with [`Error::Invalid`] when an operand is out of range, a line
/// table disagrees with its ops, a method reads an unknown attribute or
/// calls an unknown method, or a name cannot be carried by the source text.
pub fn lower(module: &Module, include_debug_info: bool) -> Result<Vec<Method>> {
    let invalid = |e: CoreError| Error::Invalid(format!("module `{}`: {e}", module.name));
    validate_names(module).map_err(invalid)?;
    validate_module(module).map_err(invalid)?;
    Ok(module.methods.iter().map(|m| lower_method(m, include_debug_info)).collect())
}

/// Compact the operator table to the entries actually called (first-use
/// order) and keep the line table only when asked.
fn lower_method(method: &Method, include_debug_info: bool) -> Method {
    let mut out = Method::new(method.name.clone(), method.params.iter().cloned());
    let mut remap: HashMap<u32, u32> = HashMap::new();
    for op in &method.ops {
        let op = match *op {
            Op::CallOp(ix) => {
                let next = mobc_core::len_u32(out.operators.len());
                let new_ix = *remap.entry(ix).or_insert_with(|| {
                    out.operators.push(method.operators[ix as usize].clone());
                    next
                });
                Op::CallOp(new_ix)
            }
            other => other,
        };
        out.ops.push(op);
    }
    if include_debug_info && method.has_debug_info() {
        out.lines = method.lines.clone();
    }
    out
}
