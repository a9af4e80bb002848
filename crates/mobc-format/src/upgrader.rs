//! Operator upgraders: rewrite calls recorded under an older schema version
//! so they keep their meaning on the current runtime.
//!
//! A registry entry matches an operator by name, overload and an inclusive
//! range of schema versions; the first matching entry (declaration order)
//! wins. Two actions exist:
//!
//! - **Redirect**: the method's operator table entry is renamed to an
//!   operator with the old semantics.
//! - **Method**: a replacement method is injected into the module once, its
//!   constants appended to the pool (existing indices stay valid), and each
//!   matching `CALL_OP` becomes `CALL_METHOD` to it.
//!
//! The applier works on copies and commits only when every method upgraded.

use std::{collections::HashSet, ops::RangeInclusive, sync::OnceLock};

use mobc_core::{ConstPool, ConstValue, Method, Op, OperatorRef, SCHEMA_VERSION};
use tracing::{debug, info, instrument};

#[cfg(feature = "serde")]
use serde::Serialize;

use crate::{portable::PortableModule, Error, Result};

/* ─────────────────────────── Registry ─────────────────────────── */

/// Replacement method body plus the constants it indexes (`LOAD_CONST #k`
/// refers to `constants[k]`).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UpgraderMethod {
    /// Body; may use `LOAD_ARG`, `LOAD_CONST`, `CALL_OP`, `RETURN`.
    pub method: Method,
    /// Local constants.
    pub constants: Vec<ConstValue>,
}

/// What an upgrader does to a matching call.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum UpgradeAction {
    /// Rename the operator (argument count kept from the call site).
    Redirect(OperatorRef),
    /// Call an injected method instead.
    Method(UpgraderMethod),
}

/// One registry entry.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Upgrader {
    /// Qualified operator name.
    pub name: String,
    /// Overload name.
    pub overload: String,
    /// Schema versions whose calls need upgrading.
    pub versions: RangeInclusive<u32>,
    /// Action.
    pub action: UpgradeAction,
}

impl Upgrader {
    /// Redirect `name.overload` to `target` for `versions`.
    pub fn redirect(name: &str, overload: &str, versions: RangeInclusive<u32>, target: OperatorRef) -> Self {
        Self { name: name.into(), overload: overload.into(), versions, action: UpgradeAction::Redirect(target) }
    }

    /// Replace `name.overload` by an injected method for `versions`.
    pub fn method(name: &str, overload: &str, versions: RangeInclusive<u32>, body: UpgraderMethod) -> Self {
        Self { name: name.into(), overload: overload.into(), versions, action: UpgradeAction::Method(body) }
    }

    /// True if a call to `op` recorded under `version` needs this upgrader.
    pub fn matches(&self, op: &OperatorRef, version: u32) -> bool {
        op.is(&self.name, &self.overload) && self.versions.contains(&version)
    }
}

/// Immutable list of upgraders, consulted in declaration order.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct UpgraderRegistry {
    entries: Vec<Upgrader>,
}

impl UpgraderRegistry {
    /// Empty registry.
    pub fn new() -> Self { Self::default() }

    /// Add an entry (builder style).
    #[must_use]
    pub fn with(mut self, upgrader: Upgrader) -> Self {
        self.entries.push(upgrader);
        self
    }

    /// First entry matching `op` at `version`.
    pub fn find(&self, op: &OperatorRef, version: u32) -> Option<&Upgrader> {
        self.entries.iter().find(|u| u.matches(op, version))
    }

    /// Entries in declaration order.
    pub fn iter(&self) -> impl Iterator<Item = &Upgrader> { self.entries.iter() }

    /// Number of entries.
    pub fn len(&self) -> usize { self.entries.len() }

    /// True if empty.
    pub fn is_empty(&self) -> bool { self.entries.is_empty() }

    /// Compiled-in upgraders, built on first use.
    pub fn builtin() -> &'static Self {
        static BUILTIN: OnceLock<UpgraderRegistry> = OnceLock::new();
        BUILTIN.get_or_init(|| {
            let registry = builtin_upgraders();
            debug!(entries = registry.len(), "builtin upgrader registry initialised");
            registry
        })
    }
}

/// Integer `div` truncated before schema 4; newer runtimes need the rounding
/// mode spelled out.
fn div_upgrader(name: &str, mode_overload: &str) -> UpgraderMethod {
    let mut method = Method::new(name, ["self_", "other"]);
    method.push(Op::LoadArg(0));
    method.push(Op::LoadArg(1));
    method.push(Op::LoadConst(0));
    let div = method.add_operator(OperatorRef::new("aten::div", mode_overload).with_args(3));
    method.push(Op::CallOp(div));
    method.push(Op::Return);
    UpgraderMethod { method, constants: vec![ConstValue::Str("trunc".into())] }
}

fn builtin_upgraders() -> UpgraderRegistry {
    UpgraderRegistry::new()
        .with(Upgrader::method("aten::div", "Tensor", 1..=3, div_upgrader("div_Tensor_1_3", "Tensor_mode")))
        .with(Upgrader::method("aten::div", "Scalar", 1..=3, div_upgrader("div_Scalar_1_3", "Scalar_mode")))
        .with(Upgrader::redirect(
            "aten::_convolution",
            "",
            1..=2,
            OperatorRef::new("aten::_convolution", "deprecated"),
        ))
}

/* ─────────────────────────── Applier ─────────────────────────── */

/// What an upgrade pass changed.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(Serialize))]
pub struct UpgradeReport {
    /// Declared version before the pass.
    pub from: u32,
    /// Version after the pass.
    pub to: u32,
    /// Operator table entries renamed.
    pub redirected: usize,
    /// `CALL_OP` instructions turned into `CALL_METHOD`.
    pub rewritten_calls: usize,
    /// Methods injected, in injection order.
    pub injected_methods: Vec<String>,
}

impl UpgradeReport {
    /// True if nothing was rewritten.
    pub fn is_noop(&self) -> bool {
        self.redirected == 0 && self.rewritten_calls == 0 && self.injected_methods.is_empty()
    }
}

/// Upgraded copies of a method list and its pool.
#[derive(Debug, Clone)]
pub struct Upgraded {
    /// Methods, injected ones appended.
    pub methods: Vec<Method>,
    /// Pool, upgrader constants appended.
    pub constants: ConstPool,
    /// Summary.
    pub report: UpgradeReport,
}

/// Upgrade `methods` (recorded under schema `from`) to the current version.
///
/// Inputs are left untouched; on error nothing is returned.
pub fn upgrade_methods(methods: &[Method], constants: &ConstPool, from: u32, registry: &UpgraderRegistry) -> Result<Upgraded> {
    if from > SCHEMA_VERSION {
        return Err(Error::unsupported(from));
    }
    let mut methods = methods.to_vec();
    let mut pool = constants.clone();
    let mut report = UpgradeReport { from, to: SCHEMA_VERSION, ..UpgradeReport::default() };
    if from == SCHEMA_VERSION {
        return Ok(Upgraded { methods, constants: pool, report });
    }

    let declared = methods.len();
    for mi in 0..declared {
        let table = methods[mi].operators.clone();
        let mut redirected = HashSet::new();
        for pc in 0..methods[mi].ops.len() {
            let Op::CallOp(ix) = methods[mi].ops[pc] else { continue };
            let fail = |operator: String, reason: String| Error::Upgrade { method: methods[mi].name.clone(), pc, operator, reason };
            let operator = table
                .get(ix as usize)
                .ok_or_else(|| fail(format!("#{ix}"), format!("operator index out of range ({} entries)", table.len())))?;
            let Some(upgrader) = registry.find(operator, from) else { continue };

            match &upgrader.action {
                UpgradeAction::Redirect(target) => {
                    if redirected.insert(ix) {
                        let entry = &mut methods[mi].operators[ix as usize];
                        entry.name.clone_from(&target.name);
                        entry.overload.clone_from(&target.overload);
                        report.redirected += 1;
                    }
                }
                UpgradeAction::Method(body) => {
                    let arity = body.method.params.len();
                    if let Some(n) = operator.num_args.filter(|&n| n as usize != arity) {
                        return Err(fail(
                            operator.to_string(),
                            format!("upgrader `{}` takes {arity} arguments, call passes {n}", body.method.name),
                        ));
                    }
                    let target = match methods.iter().position(|m| m.name == body.method.name) {
                        Some(existing) => existing,
                        None => {
                            let injected = inject(body, &mut pool).map_err(|reason| fail(operator.to_string(), reason))?;
                            report.injected_methods.push(injected.name.clone());
                            methods.push(injected);
                            methods.len() - 1
                        }
                    };
                    methods[mi].ops[pc] = Op::CallMethod(mobc_core::len_u32(target));
                    report.rewritten_calls += 1;
                }
            }
        }
    }

    Ok(Upgraded { methods, constants: pool, report })
}

/// Rebase an upgrader body onto the module pool.
fn inject(body: &UpgraderMethod, pool: &mut ConstPool) -> std::result::Result<Method, String> {
    let slots: Vec<u32> = body
        .constants
        .iter()
        .map(|c| {
            let existing = pool.iter().find(|(_, v)| *v == c).map(|(ix, _)| ix);
            existing.unwrap_or_else(|| pool.add(c.clone()))
        })
        .collect();

    let mut method = body.method.clone();
    for op in &mut method.ops {
        *op = match *op {
            Op::LoadConst(k) => Op::LoadConst(
                *slots
                    .get(k as usize)
                    .ok_or_else(|| format!("upgrader `{}` loads constant {k} of {}", body.method.name, slots.len()))?,
            ),
            Op::GetAttr(_) | Op::CallMethod(_) => {
                return Err(format!("upgrader `{}` may not read attributes or call methods", body.method.name));
            }
            other => other,
        };
    }
    Ok(method)
}

/// Upgrade the bytecode table of `portable` in place and stamp it with the
/// current version. A no-op when it is already current.
#[instrument(level = "debug", skip_all, fields(module = %portable.meta.name, from = portable.version))]
pub fn apply_upgraders(portable: &mut PortableModule, registry: &UpgraderRegistry) -> Result<UpgradeReport> {
    let Upgraded { methods, constants, report } =
        upgrade_methods(&portable.methods, &portable.constants, portable.version, registry)?;
    portable.methods = methods;
    portable.constants = constants;
    portable.version = report.to;
    if !report.is_noop() {
        info!(
            from = report.from,
            to = report.to,
            redirected = report.redirected,
            rewritten = report.rewritten_calls,
            injected = ?report.injected_methods,
            "bytecode upgraded"
        );
    }
    Ok(report)
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    fn legacy_forward() -> Method {
        let mut m = Method::new("forward", ["self", "a", "b"]);
        m.push(Op::LoadArg(1));
        m.push(Op::LoadArg(2));
        let div = m.add_operator(OperatorRef::new("aten::div", "Tensor").with_args(2));
        m.push(Op::CallOp(div));
        m.push(Op::LoadArg(1));
        m.push(Op::CallOp(div));
        let conv = m.add_operator(OperatorRef::new("aten::_convolution", "").with_args(13));
        m.push(Op::CallOp(conv));
        m.push(Op::Return);
        m
    }

    #[test]
    fn builtin_registry_is_shared() {
        assert!(std::ptr::eq(UpgraderRegistry::builtin(), UpgraderRegistry::builtin()));
        assert_eq!(UpgraderRegistry::builtin().len(), 3);
    }

    #[test]
    fn rewrites_calls_and_injects_once() {
        let pool = ConstPool::from(vec![ConstValue::I64(1)]);
        let up = upgrade_methods(&[legacy_forward()], &pool, 2, UpgraderRegistry::builtin()).unwrap();

        assert_eq!(up.report.rewritten_calls, 2);
        assert_eq!(up.report.redirected, 1);
        assert_eq!(up.report.injected_methods, vec!["div_Tensor_1_3".to_owned()]);
        assert_eq!(up.methods.len(), 2);
        assert_eq!(up.methods[0].ops[2], Op::CallMethod(1));
        assert_eq!(up.methods[0].ops[4], Op::CallMethod(1));
        assert_eq!(up.methods[0].operators[1], OperatorRef::new("aten::_convolution", "deprecated").with_args(13));
        // existing constants keep their index, the upgrader's are appended
        assert_eq!(up.constants.as_slice(), &[ConstValue::I64(1), ConstValue::Str("trunc".into())]);
        assert_eq!(up.methods[1].ops[2], Op::LoadConst(1));
    }

    #[test]
    fn current_version_is_a_noop_and_second_pass_changes_nothing() {
        let pool = ConstPool::new();
        let methods = vec![legacy_forward()];
        let same = upgrade_methods(&methods, &pool, SCHEMA_VERSION, UpgraderRegistry::builtin()).unwrap();
        assert!(same.report.is_noop());
        assert_eq!(same.methods, methods);

        let once = upgrade_methods(&methods, &pool, 1, UpgraderRegistry::builtin()).unwrap();
        let twice = upgrade_methods(&once.methods, &once.constants, once.report.to, UpgraderRegistry::builtin()).unwrap();
        assert_eq!(twice.methods, once.methods);
        assert_eq!(twice.constants, once.constants);
    }

    #[test]
    fn version_ranges_are_inclusive() {
        let methods = vec![legacy_forward()];
        let pool = ConstPool::new();
        // _convolution redirect covers 1..=2 only
        let v3 = upgrade_methods(&methods, &pool, 3, UpgraderRegistry::builtin()).unwrap();
        assert_eq!(v3.report.redirected, 0);
        assert_eq!(v3.report.rewritten_calls, 2);
    }

    #[test]
    fn first_matching_entry_wins() {
        let registry = UpgraderRegistry::new()
            .with(Upgrader::redirect("aten::div", "Tensor", 1..=3, OperatorRef::new("aten::div", "first")))
            .with(Upgrader::redirect("aten::div", "Tensor", 1..=3, OperatorRef::new("aten::div", "second")));
        let up = upgrade_methods(&[legacy_forward()], &ConstPool::new(), 2, &registry).unwrap();
        assert_eq!(up.methods[0].operators[0].overload, "first");
        assert_eq!(up.report.redirected, 1);
    }

    #[test]
    fn arity_mismatch_fails_without_touching_the_module() {
        let mut m = Method::new("forward", ["self", "a"]);
        m.push(Op::LoadArg(1));
        let div = m.add_operator(OperatorRef::new("aten::div", "Tensor").with_args(1));
        m.push(Op::CallOp(div));
        m.push(Op::Return);

        let mut portable = PortableModule::new("net");
        portable.version = 2;
        portable.methods = vec![m.clone()];
        let err = apply_upgraders(&mut portable, UpgraderRegistry::builtin()).unwrap_err();
        match err {
            Error::Upgrade { method, pc, operator, .. } => {
                assert_eq!((method.as_str(), pc, operator.as_str()), ("forward", 1, "aten::div.Tensor/1"));
            }
            other => panic!("unexpected {other:?}"),
        }
        assert_eq!(portable.version, 2);
        assert_eq!(portable.methods, vec![m]);
    }

    #[test]
    fn apply_stamps_current_version() {
        let mut portable = PortableModule::new("net");
        portable.version = 1;
        portable.methods = vec![legacy_forward()];
        let report = apply_upgraders(&mut portable, UpgraderRegistry::builtin()).unwrap();
        assert_eq!((report.from, report.to), (1, SCHEMA_VERSION));
        assert_eq!(portable.version, SCHEMA_VERSION);
        assert!(apply_upgraders(&mut portable, UpgraderRegistry::builtin()).unwrap().is_noop());
    }
}
