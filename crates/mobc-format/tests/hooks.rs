use std::ptr;

use mobc_core::{ConstValue, Method, Module, Op};
use mobc_format::{hooks::registration_count, register_all, registered_hooks, BackingBuffer, ExtraFiles};
use pretty_assertions::assert_eq;

// Single test: the hook table is process-wide.
#[test]
fn registration_is_idempotent_and_hooks_roundtrip() {
    assert!(registered_hooks().is_none());
    assert_eq!(registration_count(), 0);

    let first = register_all();
    let second = std::thread::spawn(|| register_all() as *const _ as usize).join().unwrap();
    assert!(ptr::eq(first, register_all()));
    assert_eq!(second, first as *const _ as usize);
    assert_eq!(registration_count(), 1);
    assert!(ptr::eq(registered_hooks().unwrap(), first));

    let mut module = Module::new("hooked");
    module.constants.add(ConstValue::Bool(true));
    let mut m = Method::new("forward", ["self"]);
    m.push(Op::LoadConst(0));
    m.push(Op::Return);
    module.add_method(m);

    let mut sink = Vec::new();
    let mut calls = 0;
    (first.save)(&module, &ExtraFiles::new(), false, &mut |bytes: &[u8]| {
        calls += 1;
        sink.extend_from_slice(bytes);
        bytes.len()
    })
    .unwrap();
    assert_eq!(calls, 1);

    let back = (first.load)(BackingBuffer::from_vec(sink), &mut ExtraFiles::new()).unwrap();
    assert_eq!(back, module);
}
