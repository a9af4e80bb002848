//! Deserializer: artifact bytes → [`PortableModule`].

use mobc_core::{BackingBuffer, ByteReader, SectionTag};
use tracing::{debug, instrument, trace};

use crate::{
    codec,
    layout::{Header, Layout},
    portable::PortableModule,
    Error, ExtraFiles, Result,
};

/// Decode `buffer`.
///
/// Checks run in order: magic, version range, table of contents, CRC. Only
/// then are sections decoded. Extra files are merged into `extra` with
/// insert-if-absent semantics. The returned module keeps `buffer` alive;
/// its tensors are views into it.
#[instrument(level = "debug", skip_all, fields(len = buffer.len()))]
pub fn deserialize(buffer: &BackingBuffer, extra: &mut ExtraFiles) -> Result<PortableModule> {
    let bytes = buffer.as_slice();
    let header = Header::read(bytes)?;
    header.check_version()?;
    let layout = Layout::read(bytes)?;

    for entry in layout.toc.iter().filter(|e| e.section().is_none()) {
        debug!(tag = %entry.tag_name(), offset = entry.offset, len = entry.len, "skipping unknown section");
    }

    let section = |tag: SectionTag| {
        layout.section(tag).map(|e| {
            let range = e.range();
            (ByteReader::with_base(&bytes[range.clone()], range.start), range)
        })
    };
    let required = |tag: SectionTag| section(tag).ok_or_else(|| Error::format(format!("required section {tag} is missing")));

    let storages = match section(SectionTag::TSTO) {
        Some((_, range)) => codec::read_storages(buffer, range)?,
        None => Vec::new(),
    };
    trace!(storages = storages.len(), "tensor storages mapped");

    let (mut r, _) = required(SectionTag::META)?;
    let meta = codec::read_meta(&mut r)?;
    finish(&r, SectionTag::META)?;

    let (mut r, _) = required(SectionTag::CODE)?;
    let methods = codec::read_methods(&mut r)?;
    finish(&r, SectionTag::CODE)?;

    let (mut r, _) = required(SectionTag::CNST)?;
    let constants = codec::read_constants(&mut r, &storages)?;
    finish(&r, SectionTag::CNST)?;

    let attributes = match section(SectionTag::OBJS) {
        Some((mut r, _)) => {
            let attrs = codec::read_attributes(&mut r, &storages)?;
            finish(&r, SectionTag::OBJS)?;
            attrs
        }
        None => indexmap::IndexMap::new(),
    };

    let sources = match section(SectionTag::SRCS) {
        Some((mut r, _)) => {
            let sources = codec::read_sources(&mut r)?;
            finish(&r, SectionTag::SRCS)?;
            sources
        }
        None => crate::portable::SourceBundle::new(),
    };
    if sources.is_empty() == layout.header.flags.contains(crate::HeaderFlags::SOURCE) {
        return Err(Error::format_at(12, "SOURCE flag disagrees with the source bundle"));
    }

    if let Some((mut r, _)) = section(SectionTag::XTRA) {
        let added = codec::read_extra_files_into(&mut r, extra)?;
        finish(&r, SectionTag::XTRA)?;
        debug!(added, "extra files extracted");
    }

    let portable = PortableModule {
        version: header.version,
        meta,
        methods,
        constants,
        attributes,
        sources,
        buffer: Some(buffer.clone()),
    };
    portable.validate()?;
    debug!(
        module = %portable.meta.name,
        version = portable.version,
        methods = portable.methods.len(),
        constants = portable.constants.len(),
        "artifact decoded"
    );
    Ok(portable)
}

fn finish(r: &ByteReader<'_>, tag: SectionTag) -> Result<()> {
    if r.is_empty() {
        Ok(())
    } else {
        Err(Error::format_at(r.absolute_offset(), format!("{} trailing bytes in section {tag}", r.remaining())))
    }
}
