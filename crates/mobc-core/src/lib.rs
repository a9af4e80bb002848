//! mobc-core — primitives partagées du format de module portable
//!
//! Fournit :
//! - Valeurs typées (`ConstValue`, `Tensor`, `DType`) + `ConstPool`
//! - Bytecode (`Op`, `OperatorRef`, `Method`, `LineTable`) + `Module` exécutable
//! - Tampon partagé (`BackingBuffer`, `BufferView`) pour les vues zéro-copie
//! - Constantes d'artefact (`MAGIC_MOBC`, `SCHEMA_VERSION`) + `SectionTag` (fourcc)
//! - IO mémoire (little-endian) : `ByteWriter`, `ByteReader`
//! - Assembleur / désassembleur du texte source des méthodes
//! - Erreurs `CoreError` + alias `CoreResult<T>`
//!
//! Features :
//! - `serde` (par défaut) : derive (dé)sérialisation sur les structures plates
//! - `mmap` : `BackingBuffer::map_file`

#![deny(missing_docs)]

/* ─────────────────────────── Imports ─────────────────────────── */

use std::{borrow::Cow, fmt};

use byteorder::{ByteOrder, LittleEndian};

/* ─────────────────────────── Modules publics ─────────────────────────── */

/// Tampon d'octets partagé (compté par référence) et vues zéro-copie.
pub mod buffer;
/// Primitives de bytecode (méthodes, assembleur, désassembleur, validation).
pub mod bytecode;
/// Module exécutable (attributs, pool de constantes, méthodes).
pub mod module;
/// Valeurs typées du pool de constantes et des attributs.
pub mod value;

pub use buffer::{BackingBuffer, BufferView};
pub use bytecode::{LineTable, Method, Op, OperatorRef};
pub use module::Module;
pub use value::{ConstPool, ConstValue, DType, Tensor};

/* ─────────────────────────── Résultat commun ─────────────────────────── */

/// Alias résultat commun au core.
pub type CoreResult<T> = core::result::Result<T, CoreError>;

/* ─────────────────────────── Artefact — Constantes & Tags ─────────────────────────── */

/// Magic d'un artefact : `b"MOBC\x89PK\n"` (8 octets, non-ASCII pour détecter les transferts texte).
pub const MAGIC_MOBC: &[u8; 8] = b"MOBC\x89PK\n";

/// Version de schéma bytecode écrite par ce runtime.
pub const SCHEMA_VERSION: u32 = 4;

/// Plus ancienne version de schéma que ce runtime sait relire (avec upgraders).
pub const OLDEST_SCHEMA_VERSION: u32 = 1;

/// Tags de section (fourcc) — exactement 4 octets.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[repr(u32)]
pub enum SectionTag {
    /// META : nom du module, producteur, paires clé/valeur
    META = u32::from_be_bytes(*b"META"),
    /// CODE : table des méthodes (opérateurs, instructions, lignes)
    CODE = u32::from_be_bytes(*b"CODE"),
    /// CNST : pool de constantes ordonné
    CNST = u32::from_be_bytes(*b"CNST"),
    /// OBJS : attributs du module (état objet)
    OBJS = u32::from_be_bytes(*b"OBJS"),
    /// TSTO : stockages de tenseurs (alignés)
    TSTO = u32::from_be_bytes(*b"TSTO"),
    /// SRCS : texte source des méthodes
    SRCS = u32::from_be_bytes(*b"SRCS"),
    /// XTRA : fichiers annexes opaques
    XTRA = u32::from_be_bytes(*b"XTRA"),
    /// CRCC : CRC32 trailer (u32 LE)
    CRCC = u32::from_be_bytes(*b"CRCC"),
}

impl SectionTag {
    /// Tags connus, dans l'ordre d'écriture.
    pub const ALL: [Self; 7] = [
        Self::META,
        Self::CODE,
        Self::CNST,
        Self::OBJS,
        Self::TSTO,
        Self::SRCS,
        Self::XTRA,
    ];

    /// Renvoie le fourcc sous forme de 4 octets big-endian.
    pub const fn to_be_bytes(self) -> [u8; 4] { (self as u32).to_be_bytes() }

    /// Lit un tag depuis 4 octets big-endian (`None` si inconnu).
    pub const fn from_be_bytes(b: [u8; 4]) -> Option<Self> {
        match u32::from_be_bytes(b) {
            x if x == Self::META as u32 => Some(Self::META),
            x if x == Self::CODE as u32 => Some(Self::CODE),
            x if x == Self::CNST as u32 => Some(Self::CNST),
            x if x == Self::OBJS as u32 => Some(Self::OBJS),
            x if x == Self::TSTO as u32 => Some(Self::TSTO),
            x if x == Self::SRCS as u32 => Some(Self::SRCS),
            x if x == Self::XTRA as u32 => Some(Self::XTRA),
            x if x == Self::CRCC as u32 => Some(Self::CRCC),
            _ => None,
        }
    }

    /// Nom lisible (fourcc ASCII).
    pub const fn name(self) -> &'static str {
        match self {
            Self::META => "META",
            Self::CODE => "CODE",
            Self::CNST => "CNST",
            Self::OBJS => "OBJS",
            Self::TSTO => "TSTO",
            Self::SRCS => "SRCS",
            Self::XTRA => "XTRA",
            Self::CRCC => "CRCC",
        }
    }
}

impl fmt::Display for SectionTag {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result { f.write_str(self.name()) }
}

/* ─────────────────────────── Byte Writer (LE) ─────────────────────────── */

/// Buffer d'écriture (croît automatiquement).
#[derive(Debug, Default, Clone)]
pub struct ByteWriter {
    buf: Vec<u8>,
}

impl ByteWriter {
    /// Crée un writer vide.
    pub fn new() -> Self { Self { buf: Vec::new() } }
    /// Accès en lecture au contenu.
    pub fn as_slice(&self) -> &[u8] { &self.buf }
    /// Récupère le buffer (consomme).
    pub fn into_vec(self) -> Vec<u8> { self.buf }
    /// Position d'écriture courante (= taille actuelle).
    pub fn position(&self) -> usize { self.buf.len() }
    /// Ajoute des octets bruts.
    pub fn write_bytes(&mut self, bytes: &[u8]) { self.buf.extend_from_slice(bytes); }
    /// Écrit un tag (fourcc big-endian).
    pub fn write_tag(&mut self, tag: SectionTag) { self.write_bytes(&tag.to_be_bytes()); }
    /// Écrit un u8.
    pub fn write_u8(&mut self, v: u8) { self.buf.push(v); }
    /// Écrit un u16 little-endian.
    pub fn write_u16_le(&mut self, v: u16) {
        let mut b = [0u8; 2];
        LittleEndian::write_u16(&mut b, v);
        self.write_bytes(&b);
    }
    /// Écrit un u32 little-endian.
    pub fn write_u32_le(&mut self, v: u32) {
        let mut b = [0u8; 4];
        LittleEndian::write_u32(&mut b, v);
        self.write_bytes(&b);
    }
    /// Écrit un u64 little-endian.
    pub fn write_u64_le(&mut self, v: u64) {
        let mut b = [0u8; 8];
        LittleEndian::write_u64(&mut b, v);
        self.write_bytes(&b);
    }
    /// Écrit un i64 little-endian.
    pub fn write_i64_le(&mut self, v: i64) {
        let mut b = [0u8; 8];
        LittleEndian::write_i64(&mut b, v);
        self.write_bytes(&b);
    }
    /// Écrit un f64 little-endian.
    pub fn write_f64_le(&mut self, v: f64) {
        let mut b = [0u8; 8];
        LittleEndian::write_f64(&mut b, v);
        self.write_bytes(&b);
    }
    /// Écrit une longueur (ou un compte) sur 32 bits.
    ///
    /// # Errors
    /// [`CoreError::Invalid`] si `len` ne tient pas sur 32 bits ; rien n'est écrit.
    pub fn write_len(&mut self, len: usize) -> CoreResult<()> {
        self.write_u32_le(checked_len_u32(len)?);
        Ok(())
    }
    /// Écrit une longueur `u32` suivie des octets.
    ///
    /// # Errors
    /// Voir [`ByteWriter::write_len`].
    pub fn write_len_prefixed(&mut self, bytes: &[u8]) -> CoreResult<()> {
        self.write_len(bytes.len())?;
        self.write_bytes(bytes);
        Ok(())
    }
    /// Écrit une chaîne UTF-8 préfixée par sa longueur.
    ///
    /// # Errors
    /// Voir [`ByteWriter::write_len`].
    pub fn write_str(&mut self, s: &str) -> CoreResult<()> { self.write_len_prefixed(s.as_bytes()) }
    /// Complète avec des zéros jusqu'au prochain multiple de `align`.
    pub fn align_to(&mut self, align: usize) {
        let rem = self.buf.len() % align;
        if rem != 0 {
            self.buf.resize(self.buf.len() + (align - rem), 0);
        }
    }
    /// Réécrit un u32 LE déjà émis à `offset` (patch de table des matières).
    ///
    /// # Panics
    /// Si `offset + 4` dépasse la taille écrite.
    pub fn patch_u32_le(&mut self, offset: usize, v: u32) {
        LittleEndian::write_u32(&mut self.buf[offset..offset + 4], v);
    }
}

/// Convertit une longueur en `u32` (les tables du format sont bornées à 4 Gio).
///
/// # Errors
/// [`CoreError::Invalid`] si `len` ne tient pas sur 32 bits.
pub fn checked_len_u32(len: usize) -> CoreResult<u32> {
    u32::try_from(len).map_err(|_| CoreError::invalid(format!("length {len} exceeds the 4 GiB table limit")))
}

/// Index `u32` d'un élément en mémoire (pool, méthodes, opérateurs).
///
/// # Panics
/// Si `len` ne tient pas sur 32 bits.
pub fn len_u32(len: usize) -> u32 {
    u32::try_from(len).unwrap_or_else(|_| panic!("index {len} exceeds the u32 range"))
}

/* ─────────────────────────── Byte Reader (LE) ─────────────────────────── */

/// Lecteur séquentiel sur un slice d'octets (helpers LE).
///
/// `base` est l'offset absolu du slice dans l'artefact : les erreurs
/// rapportent des positions absolues même pour un sous-lecteur de section.
#[derive(Debug, Clone)]
pub struct ByteReader<'a> {
    data: &'a [u8],
    off: usize,
    base: usize,
}

impl<'a> ByteReader<'a> {
    /// Construit un lecteur.
    pub fn new(data: &'a [u8]) -> Self { Self { data, off: 0, base: 0 } }
    /// Construit un lecteur dont le premier octet est à l'offset absolu `base`.
    pub fn with_base(data: &'a [u8], base: usize) -> Self { Self { data, off: 0, base } }
    /// Offset courant (relatif au slice).
    pub fn offset(&self) -> usize { self.off }
    /// Offset courant absolu.
    pub fn absolute_offset(&self) -> usize { self.base + self.off }
    /// Taille restante.
    pub fn remaining(&self) -> usize { self.data.len().saturating_sub(self.off) }

    /// Lit `n` octets (ou erreur si EOF).
    pub fn read_bytes(&mut self, n: usize) -> CoreResult<&'a [u8]> {
        if self.remaining() < n {
            return Err(CoreError::UnexpectedEof { needed: n as u64, at: self.absolute_offset() as u64 });
        }
        let start = self.off;
        self.off += n;
        Ok(&self.data[start..self.off])
    }

    /// Lit un fourcc brut (tags inconnus compris).
    pub fn read_fourcc(&mut self) -> CoreResult<[u8; 4]> {
        let b = self.read_bytes(4)?;
        Ok([b[0], b[1], b[2], b[3]])
    }

    /// Lit un tag connu (fourcc big-endian).
    pub fn read_tag(&mut self) -> CoreResult<SectionTag> {
        let arr = self.read_fourcc()?;
        SectionTag::from_be_bytes(arr).ok_or(CoreError::InvalidSectionTag { raw: u32::from_be_bytes(arr) })
    }

    /// Lit un u8.
    pub fn read_u8(&mut self) -> CoreResult<u8> { Ok(self.read_bytes(1)?[0]) }

    /// Lit un u16 LE.
    pub fn read_u16_le(&mut self) -> CoreResult<u16> { Ok(LittleEndian::read_u16(self.read_bytes(2)?)) }

    /// Lit un u32 LE.
    pub fn read_u32_le(&mut self) -> CoreResult<u32> { Ok(LittleEndian::read_u32(self.read_bytes(4)?)) }

    /// Lit un u64 LE.
    pub fn read_u64_le(&mut self) -> CoreResult<u64> { Ok(LittleEndian::read_u64(self.read_bytes(8)?)) }

    /// Lit un i64 LE.
    pub fn read_i64_le(&mut self) -> CoreResult<i64> { Ok(LittleEndian::read_i64(self.read_bytes(8)?)) }

    /// Lit un f64 LE.
    pub fn read_f64_le(&mut self) -> CoreResult<f64> { Ok(LittleEndian::read_f64(self.read_bytes(8)?)) }

    /// Lit des octets préfixés par une longueur `u32`.
    pub fn read_len_prefixed(&mut self) -> CoreResult<&'a [u8]> {
        let len = self.read_u32_le()? as usize;
        self.read_bytes(len)
    }

    /// Lit une chaîne UTF-8 préfixée par sa longueur.
    pub fn read_str(&mut self) -> CoreResult<&'a str> {
        let at = self.absolute_offset() as u64;
        let bytes = self.read_len_prefixed()?;
        core::str::from_utf8(bytes).map_err(|_| CoreError::InvalidUtf8 { at })
    }

    /// Lit un compteur d'éléments en vérifiant qu'il reste au moins
    /// `count * min_item` octets (évite les pré-allocations aberrantes).
    pub fn read_count(&mut self, min_item: usize) -> CoreResult<usize> {
        let at = self.absolute_offset() as u64;
        let count = self.read_u32_le()? as usize;
        if count.saturating_mul(min_item) > self.remaining() {
            return Err(CoreError::InvalidLength { section: None, len: count as u64, at });
        }
        Ok(count)
    }

    /// Vrai si tout le slice a été consommé.
    pub fn is_empty(&self) -> bool { self.remaining() == 0 }
}

/* ─────────────────────────── Erreurs ─────────────────────────── */

/// Erreurs de bas niveau communes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CoreError {
    /// Magic invalide (attendu [`MAGIC_MOBC`]).
    InvalidMagic,
    /// Tag de section inconnu.
    InvalidSectionTag {
        /// Valeur brute du tag.
        raw: u32,
    },
    /// Fin de buffer inattendue.
    UnexpectedEof {
        /// Nombre d'octets manquants.
        needed: u64,
        /// Offset où l'erreur s'est produite.
        at: u64,
    },
    /// Longueur invalide (ex: dépasse le buffer).
    InvalidLength {
        /// Nom de section (si connu).
        section: Option<Cow<'static, str>>,
        /// Longueur fautive.
        len: u64,
        /// Offset de la longueur.
        at: u64,
    },
    /// UTF-8 invalide.
    InvalidUtf8 {
        /// Offset de la chaîne.
        at: u64,
    },
    /// Données corrompues (CRC / format).
    Corrupted(Cow<'static, str>),
    /// Texte source mal formé.
    Syntax {
        /// Fichier du bundle source.
        file: String,
        /// Ligne (1-based).
        line: u32,
        /// Message.
        msg: Cow<'static, str>,
    },
    /// Structure incohérente (index hors bornes, tables désalignées).
    Invalid(Cow<'static, str>),
}

impl CoreError {
    /// Construit une erreur « corrompu ».
    pub fn corrupted(msg: impl Into<Cow<'static, str>>) -> Self { Self::Corrupted(msg.into()) }

    /// Construit une erreur « structure invalide ».
    pub fn invalid(msg: impl Into<Cow<'static, str>>) -> Self { Self::Invalid(msg.into()) }

    /// Offset absolu associé à l'erreur, si connu.
    pub fn offset(&self) -> Option<u64> {
        match self {
            Self::UnexpectedEof { at, .. } | Self::InvalidLength { at, .. } | Self::InvalidUtf8 { at } => Some(*at),
            _ => None,
        }
    }
}

impl fmt::Display for CoreError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::InvalidMagic => write!(f, "invalid mobc magic"),
            Self::InvalidSectionTag { raw } => write!(f, "invalid section tag: 0x{raw:08X}"),
            Self::UnexpectedEof { needed, at } => write!(f, "unexpected EOF: need {needed} bytes at {at}"),
            Self::InvalidLength { section, len, at } => {
                if let Some(s) = section { write!(f, "invalid length for {s}: {len} (at {at})") }
                else { write!(f, "invalid length: {len} (at {at})") }
            }
            Self::InvalidUtf8 { at } => write!(f, "invalid utf-8 at {at}"),
            Self::Corrupted(msg) => write!(f, "corrupted: {msg}"),
            Self::Syntax { file, line, msg } => write!(f, "{file}:{line}: {msg}"),
            Self::Invalid(msg) => write!(f, "invalid: {msg}"),
        }
    }
}

impl std::error::Error for CoreError {}

/* ─────────────────────────── Prélude (reexports utiles) ─────────────────────────── */

/// Prélude pratique pour importer les types/funcs clés du crate.
pub mod prelude {
    /// Réexports utiles pour une importation rapide.
    pub use super::{
        BackingBuffer, BufferView, ByteReader, ByteWriter, ConstPool, ConstValue, CoreError,
        CoreResult, DType, LineTable, Method, Module, Op, OperatorRef, SectionTag, Tensor,
        MAGIC_MOBC, OLDEST_SCHEMA_VERSION, SCHEMA_VERSION,
    };
}

/* ─────────────────────────── Tests ─────────────────────────── */
