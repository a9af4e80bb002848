#![allow(dead_code)]

use mobc_core::{ConstValue, Method, Module, Op, OperatorRef, Tensor};
use mobc_format::{ExtraFiles, SaveOptions};

/// One method building a tuple from the pool `[1, "x"]`.
pub fn tuple_module() -> Module {
    let mut module = Module::new("tuple");
    module.constants.add(ConstValue::I64(1));
    module.constants.add(ConstValue::Str("x".into()));
    let mut m = Method::new("forward", ["self"]);
    let tuple = m.add_operator(OperatorRef::new("prim::TupleConstruct", "").with_args(2));
    m.push(Op::LoadConst(0));
    m.push(Op::LoadConst(1));
    m.push(Op::CallOp(tuple));
    m.push(Op::Return);
    module.add_method(m);
    module
}

/// Two methods, tensors in attributes and constants, a shared storage.
pub fn linear_module() -> Module {
    let mut module = Module::new("linear");
    let weight = Tensor::from_f32(&[0.5, -1.0, 2.0, 4.0]).reshape(&[2, 2]).unwrap();
    module.set_attr("weight", weight.clone());
    module.set_attr("weight_t", weight);
    module.set_attr("bias", Tensor::from_f32(&[0.0, 1.0]));
    module.set_attr("training", false);

    let w = module.constants.add(ConstValue::Str("weight".into()));
    let b = module.constants.add(ConstValue::Str("bias".into()));
    let eps = module.constants.add(ConstValue::F64(1e-5));
    let shape = module.constants.add(ConstValue::List(vec![ConstValue::I64(2), ConstValue::I64(2)]));
    let table = module.constants.add(ConstValue::Tensor(Tensor::from_i64(&[3, 1, 4])));

    let mut fwd = Method::new("forward", ["self", "x"]);
    let linear = fwd.add_operator(OperatorRef::new("aten::linear", "").with_args(3));
    fwd.push_op(Op::LoadArg(1), 3);
    fwd.push_op(Op::GetAttr(w), 3);
    fwd.push_op(Op::GetAttr(b), 3);
    fwd.push_op(Op::CallOp(linear), 3);
    fwd.push_op(Op::CallMethod(1), 4);
    fwd.push_op(Op::Return, 4);
    module.add_method(fwd);

    let mut norm = Method::new("normalize", ["self", "y"]);
    let add = norm.add_operator(OperatorRef::new("aten::add", "Scalar").with_args(2));
    let view = norm.add_operator(OperatorRef::new("aten::view", "").with_args(2));
    norm.push_op(Op::LoadArg(1), 8);
    norm.push_op(Op::LoadConst(eps), 8);
    norm.push_op(Op::CallOp(add), 8);
    norm.push_op(Op::LoadConst(shape), 9);
    norm.push_op(Op::CallOp(view), 9);
    norm.push_op(Op::LoadConst(table), 9);
    norm.push_op(Op::Return, 10);
    module.add_method(norm);
    module
}

pub fn extra(files: &[(&str, &str)]) -> ExtraFiles {
    files.iter().map(|(k, v)| ((*k).to_owned(), v.as_bytes().to_vec())).collect()
}

pub const fn options(include_debug_info: bool, emit_source: bool) -> SaveOptions {
    SaveOptions { include_debug_info, emit_source }
}

/// Same module with every line table dropped.
pub fn stripped(module: &Module) -> Module {
    let mut out = module.clone();
    for m in &mut out.methods {
        m.strip_debug();
    }
    out
}
