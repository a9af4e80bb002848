//! Assembler for the method source text emitted by [`super::disasm`].
//!
//! ```text
//! ; mobc source v4
//! .module net
//! .method forward(self, x)
//! .line 3
//!     LOAD_ARG 1
//!     GET_ATTR #0
//!     CALL_OP aten::mul.Tensor/2
//!     CALL_METHOD helper
//!     RETURN
//! .end
//! ```
//!
//! - `#k` operands index the constant pool bound to the assembler; they are
//!   range-checked, never re-numbered.
//! - `CALL_METHOD` resolves by name once every file has been fed, so methods
//!   may call methods defined later or in another file of the bundle.
//! - `;` starts a comment (the disassembler's previews are comments).

use std::borrow::Cow;

use crate::{
    bytecode::{
        helpers::is_ident,
        method::{Method, Op, OperatorRef},
    },
    value::ConstPool,
    CoreError, CoreResult,
};

/// Result of assembling a bundle.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Assembly {
    /// Name given by the last `.module` directive, if any.
    pub module_name: Option<String>,
    /// Methods in source order (across files, in feeding order).
    pub methods: Vec<Method>,
}

struct Fixup {
    method: usize,
    pc: usize,
    target: String,
    file: String,
    line: u32,
}

/// Multi-file assembler bound to a constant pool.
pub struct Assembler<'p> {
    pool: &'p ConstPool,
    out: Assembly,
    fixups: Vec<Fixup>,
}

impl<'p> Assembler<'p> {
    /// New assembler; `#k` operands must index `pool`.
    pub fn new(pool: &'p ConstPool) -> Self {
        Self { pool, out: Assembly::default(), fixups: Vec::new() }
    }

    /// Assemble one source file.
    pub fn feed(&mut self, file: &str, source: &str) -> CoreResult<()> {
        let err = |line: u32, msg: Cow<'static, str>| CoreError::Syntax { file: file.to_owned(), line, msg };

        let mut current: Option<Method> = None;
        let mut line_no: Option<u32> = None;

        for (idx, raw_line) in source.lines().enumerate() {
            let src_line = (idx + 1) as u32;
            let line = raw_line.split(';').next().unwrap_or_default().trim();
            if line.is_empty() {
                continue;
            }

            if let Some(rest) = line.strip_prefix(".module") {
                let name = rest.trim();
                if !is_ident(name) || current.is_some() {
                    return Err(err(src_line, "`.module` expects a name outside of a method".into()));
                }
                self.out.module_name = Some(name.to_owned());
                continue;
            }

            if let Some(rest) = line.strip_prefix(".method") {
                if current.is_some() {
                    return Err(err(src_line, "nested `.method` (missing `.end`)".into()));
                }
                let method = parse_signature(rest.trim()).map_err(|m| err(src_line, m))?;
                if self.out.methods.iter().any(|m| m.name == method.name) {
                    return Err(err(src_line, format!("duplicate method `{}`", method.name).into()));
                }
                current = Some(method);
                line_no = None;
                continue;
            }

            let Some(method) = current.as_mut() else {
                return Err(err(src_line, format!("instruction outside of a method: `{line}`").into()));
            };

            if line == ".end" {
                if let Some(done) = current.take() {
                    self.out.methods.push(done);
                }
                continue;
            }

            if let Some(rest) = line.strip_prefix(".line") {
                let n = rest
                    .trim()
                    .parse::<u32>()
                    .map_err(|_| err(src_line, format!("`.line` expects a number: `{rest}`").into()))?;
                // ops emitted before the first directive get line 0
                while method.lines.len() < method.ops.len() {
                    method.lines.push(0);
                }
                line_no = Some(n);
                continue;
            }

            let (mnemonic, operand) = match line.split_once(char::is_whitespace) {
                Some((m, rest)) => (m, rest.trim()),
                None => (line, ""),
            };

            let op = match mnemonic.to_ascii_uppercase().as_str() {
                "LOAD_CONST" => Op::LoadConst(self.const_operand(operand).map_err(|m| err(src_line, m))?),
                "GET_ATTR" => Op::GetAttr(self.const_operand(operand).map_err(|m| err(src_line, m))?),
                "LOAD_ARG" => {
                    let ix = operand
                        .parse::<u32>()
                        .map_err(|_| err(src_line, format!("LOAD_ARG expects an index: `{operand}`").into()))?;
                    if ix as usize >= method.params.len() {
                        return Err(err(src_line, format!("argument {ix} out of range for `{}`", method.name).into()));
                    }
                    Op::LoadArg(ix)
                }
                "CALL_OP" => {
                    let target: OperatorRef = operand.parse().map_err(|e: CoreError| err(src_line, e.to_string().into()))?;
                    Op::CallOp(method.add_operator(target))
                }
                "CALL_METHOD" => {
                    if operand.is_empty() || operand.contains(char::is_whitespace) {
                        return Err(err(src_line, "CALL_METHOD expects a method name".into()));
                    }
                    self.fixups.push(Fixup {
                        method: self.out.methods.len(),
                        pc: method.ops.len(),
                        target: operand.to_owned(),
                        file: file.to_owned(),
                        line: src_line,
                    });
                    Op::CallMethod(u32::MAX)
                }
                "RETURN" if operand.is_empty() => Op::Return,
                other => return Err(err(src_line, format!("unsupported instruction: `{other}`").into())),
            };

            match line_no {
                Some(n) => method.push_op(op, n),
                None => method.push(op),
            }
        }

        if let Some(open) = current {
            let last = crate::len_u32(source.lines().count());
            return Err(err(last, format!("method `{}` is missing `.end`", open.name).into()));
        }
        Ok(())
    }

    /// Resolve method calls and return the assembled methods.
    pub fn finish(mut self) -> CoreResult<Assembly> {
        for fix in self.fixups {
            let target = self
                .out
                .methods
                .iter()
                .position(|m| m.name == fix.target)
                .ok_or_else(|| CoreError::Syntax {
                    file: fix.file.clone(),
                    line: fix.line,
                    msg: format!("unknown method `{}`", fix.target).into(),
                })?;
            self.out.methods[fix.method].ops[fix.pc] = Op::CallMethod(crate::len_u32(target));
        }
        Ok(self.out)
    }

    fn const_operand(&self, operand: &str) -> Result<u32, Cow<'static, str>> {
        let ix = operand
            .strip_prefix('#')
            .and_then(|n| n.parse::<u32>().ok())
            .ok_or_else(|| Cow::from(format!("expected `#index`, got `{operand}`")))?;
        if self.pool.get(ix).is_none() {
            return Err(format!("constant #{ix} out of range (pool size {})", self.pool.len()).into());
        }
        Ok(ix)
    }
}

/// Assemble a single file against `pool`.
pub fn assemble(file: &str, source: &str, pool: &ConstPool) -> CoreResult<Assembly> {
    let mut asm = Assembler::new(pool);
    asm.feed(file, source)?;
    asm.finish()
}

fn parse_signature(sig: &str) -> Result<Method, Cow<'static, str>> {
    let (name, rest) = sig
        .split_once('(')
        .ok_or_else(|| Cow::from(format!("expected `name(params)`, got `{sig}`")))?;
    let params = rest
        .strip_suffix(')')
        .ok_or_else(|| Cow::from(format!("unclosed parameter list in `{sig}`")))?;
    let name = name.trim();
    if !is_ident(name) {
        return Err(format!("bad method name `{name}`").into());
    }
    let params: Vec<&str> = params.split(',').map(str::trim).filter(|p| !p.is_empty()).collect();
    if let Some(bad) = params.iter().find(|p| !is_ident(p)) {
        return Err(format!("bad parameter name `{bad}`").into());
    }
    Ok(Method::new(name, params))
}
