mod common;

use common::{linear_module, options};
use mobc_core::ConstValue;
use mobc_format::{load, save_with, BackingBuffer, ExtraFiles};

fn loaded() -> (BackingBuffer, mobc_core::Module) {
    let bytes = save_with(&linear_module(), &ExtraFiles::new(), &options(false, false)).unwrap();
    let buffer = BackingBuffer::from_vec(bytes);
    let module = load(buffer.clone(), &mut ExtraFiles::new()).unwrap();
    (buffer, module)
}

fn tensor<'a>(module: &'a mobc_core::Module, name: &str) -> &'a mobc_core::Tensor {
    match module.attr(name) {
        Some(ConstValue::Tensor(t)) => t,
        other => panic!("`{name}` is not a tensor: {other:?}"),
    }
}

#[test]
fn tensors_are_views_into_the_artifact() {
    let (buffer, module) = loaded();
    assert!(module.backing_buffer().unwrap().ptr_eq(&buffer));
    for t in module.tensors() {
        assert!(t.view().buffer().ptr_eq(&buffer));
        assert_eq!(t.view().range().start % 64, 0, "storage is 64-byte aligned");
    }
    assert_eq!(tensor(&module, "weight").shape(), &[2, 2]);
    assert_eq!(tensor(&module, "bias").bytes(), [0.0_f32, 1.0].iter().flat_map(|v| v.to_le_bytes()).collect::<Vec<_>>());
}

#[test]
fn shared_storage_is_written_once() {
    let (_, module) = loaded();
    let weight = tensor(&module, "weight");
    let weight_t = tensor(&module, "weight_t");
    assert!(weight.view().aliases(weight_t.view()));
    assert!(!weight.view().aliases(tensor(&module, "bias").view()));
}

#[test]
fn views_outlive_the_module() {
    let (buffer, module) = loaded();
    let weight = tensor(&module, "weight").clone();
    let before = buffer.strong_count();
    drop(module);
    assert!(buffer.strong_count() < before);
    drop(buffer);
    assert_eq!(weight.numel(), 4);
    assert_eq!(&weight.bytes()[..4], &0.5_f32.to_le_bytes());
}
