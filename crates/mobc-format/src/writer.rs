//! Serializer: [`PortableModule`] → artifact bytes.

use mobc_core::SectionTag;
use tracing::{debug, instrument};

use crate::{
    codec::{self, StorageTable},
    layout::{ArtifactWriter, HeaderFlags, TENSOR_ALIGN},
    portable::PortableModule,
    Error, ExtraFiles, Result,
};

/// Encode `portable` and `extra` into one artifact stamped with
/// `portable.version`.
///
/// Output is deterministic: sections in a fixed order, attributes in
/// declaration order, source and extra files sorted by name.
#[instrument(level = "debug", skip_all, fields(module = %portable.meta.name, version = portable.version))]
pub fn serialize(portable: &PortableModule, extra: &ExtraFiles) -> Result<Vec<u8>> {
    if portable.version > mobc_core::SCHEMA_VERSION || portable.version < mobc_core::OLDEST_SCHEMA_VERSION {
        return Err(Error::unsupported(portable.version));
    }

    let mut storages = StorageTable::new();
    let constants = codec::write_constants(&portable.constants, &mut storages)?;
    let attributes = codec::write_attributes(&portable.attributes, &mut storages)?;

    let mut flags = HeaderFlags::empty();
    flags.set(HeaderFlags::SOURCE, !portable.sources.is_empty());
    flags.set(HeaderFlags::DEBUG_INFO, portable.has_debug_info());

    let mut out = ArtifactWriter::new(portable.version, flags);
    out.section(SectionTag::META, codec::write_meta(&portable.meta)?);
    out.section(SectionTag::CODE, codec::write_methods(&portable.methods)?);
    out.section(SectionTag::CNST, constants);
    out.section(SectionTag::OBJS, attributes);
    if !portable.sources.is_empty() {
        out.section(SectionTag::SRCS, codec::write_files(portable.sources.iter().map(|(k, v)| (k, v.as_bytes())))?);
    }
    if !extra.is_empty() {
        out.section(SectionTag::XTRA, codec::write_files(extra.iter().map(|(k, v)| (k, v.as_slice())))?);
    }
    if !storages.is_empty() {
        out.aligned_section(SectionTag::TSTO, storages.encode()?, TENSOR_ALIGN);
    }

    let bytes = out.finish()?;
    debug!(bytes = bytes.len(), storages = storages.len(), extra_files = extra.len(), "artifact encoded");
    Ok(bytes)
}
