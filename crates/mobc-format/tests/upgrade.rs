mod common;

use common::options;
use mobc_core::{bytecode::disasm::emit_module_source, ConstPool, ConstValue, Method, Op, OperatorRef, SCHEMA_VERSION};
use mobc_format::{
    adapter::source_file_name, inspect, load, load_portable_with, load_with, save_portable, save_with, BackingBuffer, Error,
    ExtraFiles, LoadOptions, PortableModule, Upgrader, UpgraderRegistry,
};
use pretty_assertions::assert_eq;

/// `forward(self, a, b)`: `a / b` then `_convolution(a)`.
fn legacy_method() -> Method {
    let mut m = Method::new("forward", ["self", "a", "b"]);
    m.push(Op::LoadArg(1));
    m.push(Op::LoadArg(2));
    let div = m.add_operator(OperatorRef::new("aten::div", "Tensor").with_args(2));
    m.push(Op::CallOp(div));
    m.push(Op::LoadConst(0));
    let conv = m.add_operator(OperatorRef::new("aten::_convolution", "").with_args(2));
    m.push(Op::CallOp(conv));
    m.push(Op::Return);
    m
}

/// Artifact as a schema-`version` writer would have produced it.
fn legacy_artifact(version: u32, with_sources: bool) -> Vec<u8> {
    let pool = ConstPool::from(vec![ConstValue::I64(7)]);
    let methods = vec![legacy_method()];
    let mut portable = PortableModule::new("legacy");
    portable.version = version;
    if with_sources {
        portable.sources.insert(source_file_name("legacy"), emit_module_source("legacy", &methods, &pool, version, false));
    }
    portable.methods = methods;
    portable.constants = pool;
    save_portable(&portable, &ExtraFiles::new()).unwrap()
}

fn load_bytes(bytes: Vec<u8>) -> mobc_format::Result<mobc_core::Module> { load(BackingBuffer::from_vec(bytes), &mut ExtraFiles::new()) }

#[test]
fn old_artifacts_are_upgraded_on_load() {
    for with_sources in [true, false] {
        let bytes = legacy_artifact(2, with_sources);
        assert_eq!(inspect(&bytes).unwrap().version, 2);

        let module = load_bytes(bytes).unwrap();
        let names: Vec<_> = module.methods.iter().map(|m| m.name.as_str()).collect();
        assert_eq!(names, ["forward", "div_Tensor_1_3"], "with_sources = {with_sources}");

        let forward = &module.methods[0];
        assert_eq!(forward.ops[2], Op::CallMethod(1));
        assert_eq!(forward.operator_at(4).unwrap(), &OperatorRef::new("aten::_convolution", "deprecated").with_args(2));
        assert_eq!(module.constants.as_slice(), &[ConstValue::I64(7), ConstValue::Str("trunc".into())]);

        let helper = &module.methods[1];
        assert_eq!(helper.operators, vec![OperatorRef::new("aten::div", "Tensor_mode").with_args(3)]);
        assert_eq!(helper.ops[2], Op::LoadConst(1));
    }
}

#[test]
fn version_three_only_needs_the_method_upgrader() {
    let module = load_bytes(legacy_artifact(3, true)).unwrap();
    assert_eq!(module.methods.len(), 2);
    assert_eq!(module.methods[0].operator_at(4).unwrap().overload, "");
}

#[test]
fn resaving_an_upgraded_module_is_monotonic_and_idempotent() {
    let upgraded = load_bytes(legacy_artifact(1, true)).unwrap();

    let resaved = save_with(&upgraded, &ExtraFiles::new(), &options(false, true)).unwrap();
    assert_eq!(inspect(&resaved).unwrap().version, SCHEMA_VERSION);

    // the dead `aten::div.Tensor` entry is compacted away on save
    let again = load_bytes(resaved.clone()).unwrap();
    assert_eq!(
        again.methods[0].ops,
        vec![Op::LoadArg(1), Op::LoadArg(2), Op::CallMethod(1), Op::LoadConst(0), Op::CallOp(0), Op::Return]
    );
    assert_eq!(again.methods[1], upgraded.methods[1]);
    assert_eq!(again.constants, upgraded.constants);

    let third = save_with(&again, &ExtraFiles::new(), &options(false, true)).unwrap();
    assert_eq!(third, resaved);
    assert_eq!(load_bytes(third).unwrap(), again);
}

#[test]
fn current_artifacts_are_left_alone() {
    let bytes = legacy_artifact(SCHEMA_VERSION, true);
    let module = load_bytes(bytes).unwrap();
    assert_eq!(module.methods, vec![legacy_method()]);
    assert_eq!(module.constants.len(), 1);
}

#[test]
fn disabled_upgraders_keep_the_old_bytecode() {
    let options = LoadOptions { apply_upgraders: false, registry: UpgraderRegistry::builtin() };
    let bytes = BackingBuffer::from_vec(legacy_artifact(2, true));

    let portable = load_portable_with(&bytes, &mut ExtraFiles::new(), &options).unwrap();
    assert_eq!(portable.version, 2);
    let module = load_with(bytes, &mut ExtraFiles::new(), &options).unwrap();
    assert_eq!(module.methods, vec![legacy_method()]);
    assert_eq!(module.bytecode_version, 2);
    assert!(module.is_outdated());
}

#[test]
fn outdated_bytecode_is_never_stamped_current() {
    let off = LoadOptions { apply_upgraders: false, registry: UpgraderRegistry::builtin() };
    let on = LoadOptions { apply_upgraders: true, registry: UpgraderRegistry::builtin() };

    for with_sources in [true, false] {
        let bytes = BackingBuffer::from_vec(legacy_artifact(2, with_sources));
        let stale = load_with(bytes.clone(), &mut ExtraFiles::new(), &off).unwrap();
        assert_eq!(stale.bytecode_version, 2, "with_sources = {with_sources}");
        let err = save_with(&stale, &ExtraFiles::new(), &options(false, true)).unwrap_err();
        assert!(matches!(err, Error::Invalid(_)), "{err:?}");

        // the truncating division still gets its helper after a resave
        let fresh = load_with(bytes, &mut ExtraFiles::new(), &on).unwrap();
        let resaved = save_with(&fresh, &ExtraFiles::new(), &options(false, with_sources)).unwrap();
        let back = load_with(BackingBuffer::from_vec(resaved), &mut ExtraFiles::new(), &on).unwrap();
        assert_eq!(back.bytecode_version, SCHEMA_VERSION);
        assert_eq!(back.method("div_Tensor_1_3").unwrap().operators[0].overload, "Tensor_mode");
        assert_eq!(back.methods[0].ops[2], Op::CallMethod(1));
    }
}

#[test]
fn failing_upgrader_aborts_the_load() {
    let mut body = Method::new("div_one_arg", ["x"]);
    body.push(Op::LoadArg(0));
    body.push(Op::Return);
    let registry = UpgraderRegistry::new().with(Upgrader::method(
        "aten::div",
        "Tensor",
        1..=3,
        mobc_format::upgrader::UpgraderMethod { method: body, constants: Vec::new() },
    ));
    let options = LoadOptions { apply_upgraders: true, registry: &registry };

    let mut found = ExtraFiles::new();
    let err = load_with(BackingBuffer::from_vec(legacy_artifact(2, true)), &mut found, &options).unwrap_err();
    match err {
        Error::Upgrade { method, pc, operator, .. } => {
            assert_eq!((method.as_str(), pc, operator.as_str()), ("forward", 2, "aten::div.Tensor/2"));
        }
        other => panic!("expected an upgrade error, got {other:?}"),
    }
    assert!(found.is_empty());
}
