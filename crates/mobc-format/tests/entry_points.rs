mod common;

use std::{fs, io};

use common::{extra, linear_module, options, stripped, tuple_module};
use mobc_format::{
    load, load_from_file, load_from_reader, save, save_to_file, save_to_writer, save_with, save_with_writer_fn, BackingBuffer,
    Error, ExtraFiles,
};
use pretty_assertions::assert_eq;

#[test]
fn file_roundtrip() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("linear.mobc");
    let module = linear_module();
    save_to_file(&module, &path, &extra(&[("notes.txt", "v1")])).unwrap();

    let mut found = ExtraFiles::new();
    let back = load_from_file(&path, &mut found).unwrap();
    assert_eq!(back, stripped(&module));
    assert_eq!(found, extra(&[("notes.txt", "v1")]));
    assert_eq!(fs::read(&path).unwrap(), save(&module, &found).unwrap());
}

#[test]
fn missing_file_is_an_io_error() {
    let dir = tempfile::tempdir().unwrap();
    let err = load_from_file(dir.path().join("absent.mobc"), &mut ExtraFiles::new()).unwrap_err();
    assert!(matches!(err, Error::Io(ref e) if e.kind() == io::ErrorKind::NotFound), "{err}");
}

#[test]
fn stream_roundtrip() {
    let module = tuple_module();
    let mut stream = Vec::new();
    save_to_writer(&module, &mut stream, &ExtraFiles::new()).unwrap();
    let back = load_from_reader(io::Cursor::new(stream), &mut ExtraFiles::new()).unwrap();
    assert_eq!(back, module);
}

#[test]
fn writer_fn_is_called_once_with_the_whole_artifact() {
    let module = tuple_module();
    let files = extra(&[("README", "hi")]);
    let mut captured = Vec::new();
    let mut calls = 0;
    save_with_writer_fn(&module, &files, false, |bytes| {
        calls += 1;
        captured.extend_from_slice(bytes);
        bytes.len()
    })
    .unwrap();
    assert_eq!(calls, 1);

    let mut found = ExtraFiles::new();
    assert_eq!(load(BackingBuffer::from_vec(captured), &mut found).unwrap(), module);
    assert_eq!(found, files);
}

#[test]
fn short_writes_are_io_errors() {
    let err = save_with_writer_fn(&tuple_module(), &ExtraFiles::new(), false, |bytes| bytes.len() - 1).unwrap_err();
    assert!(matches!(err, Error::Io(ref e) if e.kind() == io::ErrorKind::WriteZero), "{err}");
}

#[test]
fn extra_files_never_overwrite_caller_entries() {
    let bytes = save(&tuple_module(), &extra(&[("README", "hi"), ("LICENSE", "MIT")])).unwrap();

    let mut found = extra(&[("README", "mine"), ("other.txt", "x")]);
    load(BackingBuffer::from_vec(bytes), &mut found).unwrap();
    assert_eq!(found, extra(&[("LICENSE", "MIT"), ("README", "mine"), ("other.txt", "x")]));
}

#[test]
fn failed_loads_leave_extra_files_untouched() {
    let mut bytes = save(&tuple_module(), &extra(&[("README", "hi")])).unwrap();
    let last = bytes.len() - 1;
    bytes[last] ^= 0xFF;

    let mut found = extra(&[("kept", "1")]);
    assert!(load(BackingBuffer::from_vec(bytes), &mut found).unwrap_err().is_format());
    assert_eq!(found, extra(&[("kept", "1")]));
}

#[test]
fn invalid_modules_are_refused_on_save() {
    let mut module = tuple_module();
    module.methods[0].ops[0] = mobc_core::Op::LoadConst(9);
    assert!(matches!(save(&module, &ExtraFiles::new()), Err(Error::Invalid(_))));
}

#[test]
fn names_the_source_text_cannot_carry_are_refused_on_save() {
    use mobc_core::OperatorRef;

    let renamed = |f: &dyn Fn(&mut mobc_core::Module)| {
        let mut module = tuple_module();
        f(&mut module);
        save_with(&module, &ExtraFiles::new(), &options(false, true))
    };
    let refused = [
        renamed(&|m| m.name.clear()),
        renamed(&|m| m.methods[0].name = "forward-v2".into()),
        renamed(&|m| m.methods[0].params[0] = "x y".into()),
        renamed(&|m| m.methods[0].operators[0] = OperatorRef::new("aten::foo.bar", "").with_args(2)),
    ];
    for result in refused {
        assert!(matches!(result, Err(Error::Invalid(_))), "{result:?}");
    }

    let mut module = tuple_module();
    module.methods[0].name = "vorwärts_2".into();
    module.methods[0].operators[0] = OperatorRef::new("aten::foo", "bar.baz").with_args(2);
    let bytes = save_with(&module, &ExtraFiles::new(), &options(false, true)).unwrap();
    assert_eq!(load(BackingBuffer::from_vec(bytes), &mut ExtraFiles::new()).unwrap(), module);
}
