//! Format adapter: executable [`Module`] ⇄ [`PortableModule`].
//!
//! Save side: lower the methods and emit the source bundle against the
//! module's constant pool, which is carried over slot for slot.
//! Load side: reassemble the source bundle against the pool, upgrading the
//! result when it was written under an older schema; without a bundle the
//! (already upgraded) bytecode table is used as is.

use mobc_core::{
    bytecode::{
        asm::Assembler,
        disasm::{emit_module_source, SOURCE_HEADER},
        helpers::validate_module,
    },
    ConstPool, Method, Module, OLDEST_SCHEMA_VERSION, SCHEMA_VERSION,
};
use tracing::{debug, instrument};

use crate::{
    codec::Meta,
    lower,
    portable::{PortableModule, SourceBundle},
    settings::SaveOptions,
    upgrader::{upgrade_methods, UpgraderRegistry},
    Error, Result,
};

/// Producer string stamped into `META`.
pub const PRODUCER: &str = concat!("mobc-format ", env!("CARGO_PKG_VERSION"));

/// Bundle file holding the methods of module `name`.
pub fn source_file_name(name: &str) -> String { format!("code/{name}.masm") }

/* ─────────────────────────── Save ─────────────────────────── */

/// Build the portable form of `module`, stamped with the current version.
///
/// Bytecode that still follows an older schema (loaded with upgraders
/// disabled) is refused with [`Error::Invalid`].
#[instrument(level = "debug", skip_all, fields(module = %module.name))]
pub fn to_portable(module: &Module, options: &SaveOptions) -> Result<PortableModule> {
    if module.bytecode_version != SCHEMA_VERSION {
        return Err(Error::Invalid(format!(
            "module `{}` holds schema v{} bytecode; load it with upgraders enabled before saving",
            module.name, module.bytecode_version
        )));
    }
    let methods = lower::lower(module, options.include_debug_info)?;
    let constants = module.constants.clone();

    let mut sources = SourceBundle::new();
    if options.emit_source {
        let text = emit_module_source(&module.name, &methods, &constants, SCHEMA_VERSION, options.include_debug_info);
        sources.insert(source_file_name(&module.name), text);
    }
    debug!(methods = methods.len(), constants = constants.len(), "module lowered");

    let mut portable = PortableModule::new(module.name.clone());
    portable.meta = Meta { name: module.name.clone(), producer: PRODUCER.to_owned(), entries: Default::default() };
    portable.methods = methods;
    portable.constants = constants;
    portable.attributes = module.attributes.clone();
    portable.sources = sources;
    Ok(portable)
}

/* ─────────────────────────── Load ─────────────────────────── */

/// Build the executable module. `registry` is `None` when upgrading is
/// disabled. The module keeps the artifact buffer alive.
#[instrument(level = "debug", skip_all, fields(module = %portable.meta.name))]
pub fn to_executable(portable: PortableModule, registry: Option<&UpgraderRegistry>) -> Result<Module> {
    let PortableModule { version, meta, methods, mut constants, attributes, sources, buffer } = portable;

    let (methods, bytecode_version) = if sources.is_empty() {
        debug!(version, "no source bundle; using the bytecode table");
        (methods, version)
    } else {
        compile_sources(&meta.name, &sources, &mut constants, registry)?
    };

    let mut module = Module::new(meta.name);
    module.attributes = attributes;
    module.constants = constants;
    module.methods = methods;
    module.bytecode_version = bytecode_version;
    validate_module(&module).map_err(|e| Error::format(format!("reassembled module is inconsistent: {e}")))?;
    if let Some(buffer) = buffer {
        module.retain_buffer(buffer);
    }
    Ok(module)
}

fn compile_sources(
    name: &str,
    sources: &SourceBundle,
    constants: &mut ConstPool,
    registry: Option<&UpgraderRegistry>,
) -> Result<(Vec<Method>, u32)> {
    let mut declared: Option<u32> = None;
    for (file, text) in sources {
        let version = source_version(file, text)?;
        match declared {
            Some(v) if v != version => {
                return Err(Error::format(format!("{file}: source version {version} differs from {v}")));
            }
            _ => declared = Some(version),
        }
    }
    let declared = declared.unwrap_or(SCHEMA_VERSION);
    if !(OLDEST_SCHEMA_VERSION..=SCHEMA_VERSION).contains(&declared) {
        return Err(Error::unsupported(declared));
    }

    let mut asm = Assembler::new(constants);
    for (file, text) in sources {
        asm.feed(file, text)?;
    }
    let assembly = asm.finish()?;
    if let Some(found) = assembly.module_name.as_deref().filter(|n| *n != name) {
        return Err(Error::format(format!("source bundle describes module `{found}`, artifact names `{name}`")));
    }
    debug!(files = sources.len(), methods = assembly.methods.len(), declared, "source bundle assembled");

    match registry {
        Some(registry) if declared < SCHEMA_VERSION => {
            let upgraded = upgrade_methods(&assembly.methods, constants, declared, registry)?;
            *constants = upgraded.constants;
            Ok((upgraded.methods, SCHEMA_VERSION))
        }
        _ => Ok((assembly.methods, declared)),
    }
}

fn source_version(file: &str, text: &str) -> Result<u32> {
    text.lines()
        .next()
        .and_then(|l| l.strip_prefix(SOURCE_HEADER))
        .and_then(|v| v.trim().parse().ok())
        .ok_or_else(|| Error::format(format!("{file}: missing `{SOURCE_HEADER}<n>` header")))
}
