//! Load/save entry points.
//!
//! Everything funnels into [`load_with`] and [`save_with`]; the file, stream
//! and callback variants only move bytes.

use std::{
    fs,
    io::{self, Read, Write},
    path::Path,
};

use mobc_core::{BackingBuffer, Module, SCHEMA_VERSION};
use tracing::{info, instrument};

use crate::{
    adapter,
    layout::{self, Inspection},
    portable::PortableModule,
    reader,
    settings::{LoadOptions, SaveOptions},
    upgrader, writer, Error, ExtraFiles, Result,
};

/* ─────────────────────────── Load ─────────────────────────── */

/// Load a module from `buffer` with default options.
///
/// Extra files found in the artifact are added to `extra` unless the key is
/// already present. The module keeps `buffer` alive.
pub fn load(buffer: BackingBuffer, extra: &mut ExtraFiles) -> Result<Module> { load_with(buffer, extra, &LoadOptions::default()) }

/// Load a module from `buffer`.
///
/// Nothing is merged into `extra` unless the whole load succeeds.
#[instrument(level = "info", skip_all, fields(len = buffer.len()))]
pub fn load_with(buffer: BackingBuffer, extra: &mut ExtraFiles, options: &LoadOptions<'_>) -> Result<Module> {
    let mut found = ExtraFiles::new();
    let portable = load_portable_with(&buffer, &mut found, options)?;
    let registry = options.apply_upgraders.then_some(options.registry);
    let module = adapter::to_executable(portable, registry)?;
    merge_extra_files(extra, found);
    info!(module = %module.name, methods = module.methods.len(), constants = module.constants.len(), "module loaded");
    Ok(module)
}

/// Decode `buffer` into its portable form (upgraded per default options).
pub fn load_portable(buffer: &BackingBuffer, extra: &mut ExtraFiles) -> Result<PortableModule> {
    load_portable_with(buffer, extra, &LoadOptions::default())
}

/// Decode `buffer` into its portable form.
pub fn load_portable_with(buffer: &BackingBuffer, extra: &mut ExtraFiles, options: &LoadOptions<'_>) -> Result<PortableModule> {
    let mut found = ExtraFiles::new();
    let mut portable = reader::deserialize(buffer, &mut found)?;
    if options.apply_upgraders && portable.version < SCHEMA_VERSION {
        upgrader::apply_upgraders(&mut portable, options.registry)?;
    }
    merge_extra_files(extra, found);
    Ok(portable)
}

/// Load from a file read fully into memory.
pub fn load_from_file<P: AsRef<Path>>(path: P, extra: &mut ExtraFiles) -> Result<Module> {
    load(BackingBuffer::read_file(path)?, extra)
}

/// Load from a memory-mapped file.
#[cfg(feature = "mmap")]
pub fn load_from_mmap<P: AsRef<Path>>(path: P, extra: &mut ExtraFiles) -> Result<Module> {
    load(BackingBuffer::map_file(path)?, extra)
}

/// Load from a stream, reading it to the end first.
pub fn load_from_reader<R: Read>(reader: R, extra: &mut ExtraFiles) -> Result<Module> {
    load(BackingBuffer::from_reader(reader)?, extra)
}

fn merge_extra_files(into: &mut ExtraFiles, found: ExtraFiles) {
    for (name, data) in found {
        into.entry(name).or_insert(data);
    }
}

/* ─────────────────────────── Save ─────────────────────────── */

/// Save `module` with default options.
pub fn save(module: &Module, extra: &ExtraFiles) -> Result<Vec<u8>> { save_with(module, extra, &SaveOptions::default()) }

/// Save `module`, stamped with the current schema version.
#[instrument(level = "info", skip_all, fields(module = %module.name))]
pub fn save_with(module: &Module, extra: &ExtraFiles, options: &SaveOptions) -> Result<Vec<u8>> {
    let portable = adapter::to_portable(module, options)?;
    let bytes = writer::serialize(&portable, extra)?;
    info!(bytes = bytes.len(), version = portable.version, "module saved");
    Ok(bytes)
}

/// Encode a portable module as is (its version is kept).
pub fn save_portable(portable: &PortableModule, extra: &ExtraFiles) -> Result<Vec<u8>> { writer::serialize(portable, extra) }

/// Save to `path`, replacing it.
pub fn save_to_file<P: AsRef<Path>>(module: &Module, path: P, extra: &ExtraFiles) -> Result<()> {
    let bytes = save(module, extra)?;
    fs::write(path, bytes)?;
    Ok(())
}

/// Save into a stream.
pub fn save_to_writer<W: Write>(module: &Module, mut writer: W, extra: &ExtraFiles) -> Result<()> {
    let bytes = save(module, extra)?;
    writer.write_all(&bytes)?;
    writer.flush()?;
    Ok(())
}

/// Save through a callback invoked once with the whole artifact. The
/// callback returns how many bytes it accepted; anything short is an I/O
/// error.
pub fn save_with_writer_fn<F>(module: &Module, extra: &ExtraFiles, debug_info: bool, writer: F) -> Result<()>
where
    F: FnOnce(&[u8]) -> usize,
{
    let options = SaveOptions { include_debug_info: debug_info, ..SaveOptions::default() };
    let bytes = save_with(module, extra, &options)?;
    let written = writer(&bytes);
    if written != bytes.len() {
        return Err(Error::Io(io::Error::new(
            io::ErrorKind::WriteZero,
            format!("writer accepted {written} of {} bytes", bytes.len()),
        )));
    }
    Ok(())
}

/* ─────────────────────────── Inspect ─────────────────────────── */

/// Header/TOC summary; see [`layout::inspect`].
pub fn inspect(bytes: &[u8]) -> Result<Inspection> { layout::inspect(bytes) }
