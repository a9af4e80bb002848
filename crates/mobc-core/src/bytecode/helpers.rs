//! Structural validation reused by the loader, the lowering pass and the
//! upgrader.

use crate::{
    bytecode::method::{Method, Op, OperatorRef},
    module::Module,
    value::{ConstPool, ConstValue},
    CoreError, CoreResult,
};

/// What a method body may reference.
#[derive(Clone, Copy)]
pub struct Scope<'a> {
    /// Module constant pool.
    pub pool: &'a ConstPool,
    /// Number of methods in the module (`CallMethod` bound).
    pub method_count: usize,
    /// Attribute lookup for `GetAttr`; `None` skips the check.
    pub has_attr: Option<&'a dyn Fn(&str) -> bool>,
}

/// Basic structural validation of a method.
///
/// Indices must be in range, the line table is either empty or one entry per
/// op, and the body ends with `Return`.
pub fn validate_method(method: &Method, scope: Scope<'_>) -> CoreResult<()> {
    let name = &method.name;
    if !method.lines.is_empty() && method.lines.len() != method.ops.len() {
        return Err(CoreError::invalid(format!(
            "`{name}`: line table has {} entries for {} ops",
            method.lines.len(),
            method.ops.len()
        )));
    }
    if method.ops.last() != Some(&Op::Return) {
        return Err(CoreError::invalid(format!("`{name}` does not end with RETURN")));
    }

    for (pc, op) in method.ops.iter().enumerate() {
        match *op {
            Op::LoadConst(ix) if scope.pool.get(ix).is_none() => {
                return Err(CoreError::invalid(format!(
                    "`{name}` pc {pc} references const {ix} but pool size is {}",
                    scope.pool.len()
                )));
            }
            Op::GetAttr(ix) => match scope.pool.get(ix) {
                Some(ConstValue::Str(attr)) => {
                    if let Some(has_attr) = scope.has_attr {
                        if !has_attr(attr) {
                            return Err(CoreError::invalid(format!("`{name}` pc {pc} reads unknown attribute `{attr}`")));
                        }
                    }
                }
                Some(other) => {
                    return Err(CoreError::invalid(format!(
                        "`{name}` pc {pc}: attribute name must be a string, got {}",
                        other.kind()
                    )));
                }
                None => {
                    return Err(CoreError::invalid(format!("`{name}` pc {pc} references const {ix} (out of range)")));
                }
            },
            Op::LoadArg(ix) if ix as usize >= method.params.len() => {
                return Err(CoreError::invalid(format!(
                    "`{name}` pc {pc} loads argument {ix} of {}",
                    method.params.len()
                )));
            }
            Op::CallOp(ix) if ix as usize >= method.operators.len() => {
                return Err(CoreError::invalid(format!("`{name}` pc {pc} calls operator {ix} (out of range)")));
            }
            Op::CallMethod(ix) if ix as usize >= scope.method_count => {
                return Err(CoreError::invalid(format!("`{name}` pc {pc} calls method {ix} (out of range)")));
            }
            _ => {}
        }
    }
    Ok(())
}

/// Validate every method of a module, and that method names are unique.
pub fn validate_module(module: &Module) -> CoreResult<()> {
    let has_attr = |n: &str| module.attributes.contains_key(n);
    let scope = Scope { pool: &module.constants, method_count: module.methods.len(), has_attr: Some(&has_attr) };
    for (i, method) in module.methods.iter().enumerate() {
        if module.methods[..i].iter().any(|m| m.name == method.name) {
            return Err(CoreError::invalid(format!("duplicate method `{}`", method.name)));
        }
        validate_method(method, scope)?;
    }
    Ok(())
}

/// Identifier accepted by the source text: `[_A-Za-z][_A-Za-z0-9]*`
/// (Unicode letters and digits allowed).
pub fn is_ident(s: &str) -> bool {
    let mut chars = s.chars();
    matches!(chars.next(), Some(c) if c == '_' || c.is_alphabetic()) && chars.all(|c| c == '_' || c.is_alphanumeric())
}

/// True if `op` prints as a single `CALL_OP` operand that parses back to
/// the same reference.
pub fn is_textual_operator(op: &OperatorRef) -> bool {
    let text = op.to_string();
    !text.contains(|c: char| c == ';' || c.is_whitespace()) && text.parse::<OperatorRef>().is_ok_and(|back| back == *op)
}

/// Check that every name in `module` can be written to and read back from
/// the source text: module, method and parameter names are identifiers,
/// operators survive printing.
pub fn validate_names(module: &Module) -> CoreResult<()> {
    if !is_ident(&module.name) {
        return Err(CoreError::invalid(format!("module name `{}` is not an identifier", module.name)));
    }
    for method in &module.methods {
        let name = &method.name;
        if !is_ident(name) {
            return Err(CoreError::invalid(format!("method name `{name}` is not an identifier")));
        }
        if let Some(bad) = method.params.iter().find(|p| !is_ident(p)) {
            return Err(CoreError::invalid(format!("`{name}`: parameter `{bad}` is not an identifier")));
        }
        if let Some(bad) = method.operators.iter().find(|op| !is_textual_operator(op)) {
            return Err(CoreError::invalid(format!(
                "`{name}`: operator `{}` overload `{}` cannot be written as text",
                bad.name, bad.overload
            )));
        }
    }
    Ok(())
}
