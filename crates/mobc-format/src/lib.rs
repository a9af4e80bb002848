//! mobc-format — artefact de module portable : layout, lecture/écriture,
//! upgraders et adaptateur source.
//!
//! Format :
//! ```text
//! Header: b"MOBC\x89PK\n" + version u32 + flags u16 + reserved u16 + count u32
//! TOC:    count × (TAG[4] + offset u32 + len u32), offsets absolus
//! Sections: META CODE CNST OBJS [SRCS] [XTRA] [TSTO aligné 64]
//! Trailer: "CRCC" + u32 (CRC32 de tout ce qui précède)
//! ```
//!
//! Pipeline :
//! - chargement : octets → [`BackingBuffer`] → [`reader::deserialize`] →
//!   [`upgrader::apply_upgraders`] → [`adapter::to_executable`] → [`Module`]
//! - sauvegarde : [`Module`] → [`adapter::to_portable`] (lowering, pool
//!   aplati, texte source) → [`writer::serialize`] → octets
//!
//! API :
//! - [`load`] / [`save`] et variantes fichier, flux, callback
//! - [`load_portable`] / [`save_portable`] pour l'outillage
//! - [`register_all`] installe les hooks une seule fois
//!
//! Features :
//! - `serde` (par défaut) : rapports et réglages sérialisables
//! - `mmap` : `load_from_mmap`
//! - `cli` : binaire `mobc-dump`

#![deny(missing_docs)]

use std::collections::BTreeMap;

pub use mobc_core::{BackingBuffer, Module};

/// Adaptateur exécutable ⇄ portable.
pub mod adapter;
/// Points d'entrée load/save.
pub mod api;
/// Encodage des sections.
pub mod codec;
/// Erreurs.
pub mod error;
/// Hooks de processus.
pub mod hooks;
/// En-tête, table des matières, trailer.
pub mod layout;
/// Lowering vers la table de bytecode.
pub mod lower;
/// Module portable.
pub mod portable;
/// Désérialiseur.
pub mod reader;
/// Réglages et options.
pub mod settings;
/// Registre et applicateur d'upgraders.
pub mod upgrader;
/// Sérialiseur.
pub mod writer;

#[cfg(feature = "mmap")]
pub use api::load_from_mmap;
pub use api::{
    inspect, load, load_from_file, load_from_reader, load_portable, load_portable_with, load_with, save, save_portable,
    save_to_file, save_to_writer, save_with, save_with_writer_fn,
};
pub use error::{Error, Result};
pub use hooks::{register_all, registered_hooks, Hooks};
pub use layout::{HeaderFlags, Inspection};
pub use portable::{PortableModule, SourceBundle};
pub use settings::{LoadOptions, SaveOptions, Settings};
pub use upgrader::{UpgradeReport, Upgrader, UpgraderRegistry};

/// Fichiers annexes : nom → octets, écrits triés par nom.
pub type ExtraFiles = BTreeMap<String, Vec<u8>>;
