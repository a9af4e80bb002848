//! Binary layout: fixed header, table of contents, CRC trailer.
//!
//! ```text
//! 0      magic    b"MOBC\x89PK\n"
//! 8      version  u32 LE
//! 12     flags    u16 LE (HeaderFlags)
//! 14     reserved u16 = 0
//! 16     count    u32 LE
//! 20     TOC      count × { tag[4], offset u32 LE, len u32 LE }
//! ..     sections (absolute offsets, no overlap)
//! end-8  "CRCC" + crc32 u32 LE over [0, end-8)
//! ```

use core::ops::Range;

use bitflags::bitflags;
use byteorder::{ByteOrder, LittleEndian};
use mobc_core::{ByteReader, ByteWriter, SectionTag, MAGIC_MOBC, OLDEST_SCHEMA_VERSION, SCHEMA_VERSION};

#[cfg(feature = "serde")]
use serde::Serialize;

use crate::{Error, Result};

/// Taille de l'en-tête fixe.
pub const HEADER_LEN: usize = 20;
/// Taille d'une entrée de table des matières.
pub const TOC_ENTRY_LEN: usize = 12;
/// Taille du trailer CRC.
pub const TRAILER_LEN: usize = 8;
/// Alignement des stockages de tenseurs.
pub const TENSOR_ALIGN: usize = 64;

/// Sections sans lesquelles un artefact est refusé.
pub const REQUIRED_SECTIONS: [SectionTag; 3] = [SectionTag::META, SectionTag::CODE, SectionTag::CNST];

bitflags! {
    /// Header flags.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
    pub struct HeaderFlags: u16 {
        /// The artifact carries a source bundle (`SRCS`).
        const SOURCE     = 1 << 0;
        /// Methods carry line tables.
        const DEBUG_INFO = 1 << 1;
    }
}

/* ─────────────────────────── Header ─────────────────────────── */

/// Fixed-size header.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Header {
    /// Schema version stamped at save time.
    pub version: u32,
    /// Flags.
    pub flags: HeaderFlags,
    /// Number of TOC entries.
    pub toc_len: u32,
}

impl Header {
    /// Read and check magic, flags and reserved bits. The version is *not*
    /// range-checked here (see [`Header::check_version`]).
    pub fn read(bytes: &[u8]) -> Result<Self> {
        let mut r = ByteReader::new(bytes);
        if r.read_bytes(MAGIC_MOBC.len())? != MAGIC_MOBC {
            return Err(Error::format_at(0, "bad magic (not a mobc artifact)"));
        }
        let version = r.read_u32_le()?;
        let raw_flags = r.read_u16_le()?;
        let flags = HeaderFlags::from_bits(raw_flags)
            .ok_or_else(|| Error::format_at(12, format!("unknown header flags 0x{raw_flags:04X}")))?;
        if r.read_u16_le()? != 0 {
            return Err(Error::format_at(14, "reserved header field is not zero"));
        }
        let toc_len = r.read_u32_le()?;
        Ok(Self { version, flags, toc_len })
    }

    /// Refuse versions this runtime cannot interpret.
    pub fn check_version(&self) -> Result<()> {
        if self.version > SCHEMA_VERSION || self.version < OLDEST_SCHEMA_VERSION {
            return Err(Error::unsupported(self.version));
        }
        Ok(())
    }
}

/* ─────────────────────────── TOC ─────────────────────────── */

/// One table of contents entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TocEntry {
    /// Raw fourcc (unknown tags are kept, then skipped).
    pub tag: [u8; 4],
    /// Absolute offset.
    pub offset: u32,
    /// Length in bytes.
    pub len: u32,
}

impl TocEntry {
    /// Known section kind, if any.
    pub const fn section(&self) -> Option<SectionTag> { SectionTag::from_be_bytes(self.tag) }

    /// Absolute byte range.
    pub const fn range(&self) -> Range<usize> { self.offset as usize..self.offset as usize + self.len as usize }

    /// Printable tag.
    pub fn tag_name(&self) -> String { self.tag.iter().map(|&b| if b.is_ascii_graphic() { b as char } else { '?' }).collect() }
}

/// Parsed and checked layout of an artifact.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Layout {
    /// Header.
    pub header: Header,
    /// TOC entries in file order.
    pub toc: Vec<TocEntry>,
    /// CRC stored in the trailer (already verified).
    pub crc32: u32,
}

impl Layout {
    /// Parse the header and TOC, then verify bounds, overlaps, required
    /// sections and the CRC trailer.
    pub fn read(bytes: &[u8]) -> Result<Self> {
        let header = Header::read(bytes)?;
        let end = bytes.len();

        let toc_end = (header.toc_len as usize)
            .checked_mul(TOC_ENTRY_LEN)
            .and_then(|n| n.checked_add(HEADER_LEN))
            .filter(|&n| n.saturating_add(TRAILER_LEN) <= end)
            .ok_or_else(|| Error::format_at(16, format!("table of contents ({} entries) runs past the end", header.toc_len)))?;
        let body_end = end - TRAILER_LEN;

        let trailer = &bytes[body_end..];
        if trailer[..4] != SectionTag::CRCC.to_be_bytes() {
            return Err(Error::format_at(body_end, "missing CRC trailer"));
        }
        let crc32 = LittleEndian::read_u32(&trailer[4..]);

        let mut r = ByteReader::with_base(&bytes[HEADER_LEN..toc_end], HEADER_LEN);
        let mut toc = Vec::with_capacity(header.toc_len as usize);
        for _ in 0..header.toc_len {
            let at = r.absolute_offset();
            let entry = TocEntry { tag: r.read_fourcc()?, offset: r.read_u32_le()?, len: r.read_u32_le()? };
            let range = entry.range();
            if range.start < toc_end || range.end > body_end {
                return Err(Error::format_at(
                    at,
                    format!("section {} [{}..{}) lies outside [{toc_end}..{body_end})", entry.tag_name(), range.start, range.end),
                ));
            }
            if let Some(tag) = entry.section() {
                if tag == SectionTag::CRCC || toc.iter().any(|e: &TocEntry| e.section() == Some(tag)) {
                    return Err(Error::format_at(at, format!("duplicate or misplaced section {tag}")));
                }
            }
            toc.push(entry);
        }

        let mut ranges: Vec<(Range<usize>, &TocEntry)> = toc.iter().map(|e| (e.range(), e)).collect();
        ranges.sort_by_key(|(r, _)| (r.start, r.end));
        for pair in ranges.windows(2) {
            let ((a, ea), (b, eb)) = (&pair[0], &pair[1]);
            if a.end > b.start {
                return Err(Error::format_at(b.start, format!("sections {} and {} overlap", ea.tag_name(), eb.tag_name())));
            }
        }

        for tag in REQUIRED_SECTIONS {
            if !toc.iter().any(|e| e.section() == Some(tag)) {
                return Err(Error::format(format!("required section {tag} is missing")));
            }
        }

        let actual = crc32fast::hash(&bytes[..body_end]);
        if actual != crc32 {
            return Err(Error::format_at(body_end, format!("CRC mismatch: stored {crc32:08x}, computed {actual:08x}")));
        }

        Ok(Self { header, toc, crc32 })
    }

    /// Entry of a known section.
    pub fn section(&self, tag: SectionTag) -> Option<&TocEntry> { self.toc.iter().find(|e| e.section() == Some(tag)) }
}

/* ─────────────────────────── Writer ─────────────────────────── */

struct PendingSection {
    tag: SectionTag,
    align: usize,
    payload: Vec<u8>,
}

/// Lays sections out behind a header and TOC, then seals the CRC trailer.
pub struct ArtifactWriter {
    version: u32,
    flags: HeaderFlags,
    sections: Vec<PendingSection>,
}

impl ArtifactWriter {
    /// New artifact stamped with `version`.
    pub const fn new(version: u32, flags: HeaderFlags) -> Self { Self { version, flags, sections: Vec::new() } }

    /// Append a section.
    pub fn section(&mut self, tag: SectionTag, payload: Vec<u8>) { self.aligned_section(tag, payload, 1); }

    /// Append a section whose first byte lands on a multiple of `align`.
    pub fn aligned_section(&mut self, tag: SectionTag, payload: Vec<u8>, align: usize) {
        self.sections.push(PendingSection { tag, align: align.max(1), payload });
    }

    /// Serialise everything into one buffer.
    pub fn finish(self) -> Result<Vec<u8>> {
        let too_big = || Error::Invalid("artifact exceeds the 4 GiB offset range".into());
        let mut w = ByteWriter::new();
        w.write_bytes(MAGIC_MOBC);
        w.write_u32_le(self.version);
        w.write_u16_le(self.flags.bits());
        w.write_u16_le(0);
        w.write_u32_le(u32::try_from(self.sections.len()).map_err(|_| too_big())?);

        let toc_at = w.position();
        for s in &self.sections {
            w.write_tag(s.tag);
            w.write_u32_le(0);
            w.write_u32_le(0);
        }

        for (i, s) in self.sections.iter().enumerate() {
            w.align_to(s.align);
            let offset = u32::try_from(w.position()).map_err(|_| too_big())?;
            let len = u32::try_from(s.payload.len()).map_err(|_| too_big())?;
            w.write_bytes(&s.payload);
            let entry = toc_at + i * TOC_ENTRY_LEN;
            w.patch_u32_le(entry + 4, offset);
            w.patch_u32_le(entry + 8, len);
        }
        u32::try_from(w.position() + TRAILER_LEN).map_err(|_| too_big())?;

        let crc = crc32fast::hash(w.as_slice());
        w.write_tag(SectionTag::CRCC);
        w.write_u32_le(crc);
        Ok(w.into_vec())
    }
}

/* ─────────────────────────── Inspection ─────────────────────────── */

/// Header/TOC summary used by the dump tool.
#[derive(Debug, Clone, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(Serialize))]
pub struct Inspection {
    /// Stamped schema version.
    pub version: u32,
    /// Whether this runtime can load it.
    pub supported: bool,
    /// Names of the set header flags.
    pub flags: Vec<&'static str>,
    /// Artifact size in bytes.
    pub size: usize,
    /// Trailer CRC.
    pub crc32: u32,
    /// Sections in TOC order.
    pub sections: Vec<SectionSummary>,
}

/// One TOC entry, printable.
#[derive(Debug, Clone, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(Serialize))]
pub struct SectionSummary {
    /// Fourcc.
    pub tag: String,
    /// Absolute offset.
    pub offset: u32,
    /// Length.
    pub len: u32,
    /// Whether this runtime knows the tag.
    pub known: bool,
}

/// Summarise an artifact without decoding its sections. Unsupported versions
/// are reported, not rejected.
pub fn inspect(bytes: &[u8]) -> Result<Inspection> {
    let layout = Layout::read(bytes)?;
    Ok(Inspection {
        version: layout.header.version,
        supported: layout.header.check_version().is_ok(),
        flags: layout.header.flags.iter_names().map(|(name, _)| name).collect(),
        size: bytes.len(),
        crc32: layout.crc32,
        sections: layout
            .toc
            .iter()
            .map(|e| SectionSummary { tag: e.tag_name(), offset: e.offset, len: e.len, known: e.section().is_some() })
            .collect(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    fn minimal(version: u32) -> Vec<u8> {
        let mut w = ArtifactWriter::new(version, HeaderFlags::empty());
        w.section(SectionTag::META, b"meta".to_vec());
        w.section(SectionTag::CODE, vec![0; 4]);
        w.section(SectionTag::CNST, vec![0; 4]);
        w.aligned_section(SectionTag::TSTO, vec![7; 3], TENSOR_ALIGN);
        w.finish().unwrap()
    }

    #[test]
    fn writer_output_parses_back() {
        let bytes = minimal(SCHEMA_VERSION);
        let layout = Layout::read(&bytes).unwrap();
        assert_eq!(layout.header.version, SCHEMA_VERSION);
        assert_eq!(layout.toc.len(), 4);
        let tsto = layout.section(SectionTag::TSTO).unwrap();
        assert_eq!(tsto.offset as usize % TENSOR_ALIGN, 0);
        assert_eq!(&bytes[tsto.range()], &[7, 7, 7]);
        assert_eq!(&bytes[layout.section(SectionTag::META).unwrap().range()], b"meta");
    }

    #[test]
    fn bad_magic_and_crc_are_format_errors() {
        let mut bytes = minimal(SCHEMA_VERSION);
        bytes[HEADER_LEN + 4 * TOC_ENTRY_LEN] ^= 0xFF;
        assert!(Layout::read(&bytes).unwrap_err().is_format());
        bytes[0] = b'X';
        assert!(matches!(Layout::read(&bytes), Err(Error::Format { offset: Some(0), .. })));
    }

    #[test]
    fn overlapping_sections_are_rejected() {
        let mut bytes = minimal(SCHEMA_VERSION);
        // point CODE at META's offset
        let meta_off = LittleEndian::read_u32(&bytes[HEADER_LEN + 4..]);
        LittleEndian::write_u32(&mut bytes[HEADER_LEN + TOC_ENTRY_LEN + 4..], meta_off);
        let body_end = bytes.len() - TRAILER_LEN;
        let crc = crc32fast::hash(&bytes[..body_end]);
        LittleEndian::write_u32(&mut bytes[body_end + 4..], crc);
        let err = Layout::read(&bytes).unwrap_err();
        assert!(err.to_string().contains("overlap"), "{err}");
    }

    #[test]
    fn version_range_is_checked_separately() {
        let bytes = minimal(SCHEMA_VERSION + 1);
        let header = Header::read(&bytes).unwrap();
        assert!(matches!(header.check_version(), Err(Error::UnsupportedVersion { found, .. }) if found == SCHEMA_VERSION + 1));
        let summary = inspect(&bytes).unwrap();
        assert!(!summary.supported);
        assert_eq!(summary.sections.iter().map(|s| s.tag.as_str()).collect::<Vec<_>>(), ["META", "CODE", "CNST", "TSTO"]);
    }
}
