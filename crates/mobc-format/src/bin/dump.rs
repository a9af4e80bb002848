//! `mobc-dump` — inspecte un artefact de module portable
//!
//! En-tête + table des matières par défaut ; `--methods`, `--source` et
//! `--extra` chargent le module complet.

#![forbid(unsafe_code)]

use std::{path::PathBuf, process::ExitCode};

use anyhow::{Context, Result};
use clap::{ArgAction, Parser};
use tracing_subscriber::EnvFilter;

use mobc_core::bytecode::disasm::disassemble_compact;
use mobc_format::{load_portable, BackingBuffer, ExtraFiles, Inspection};

// ──────────────────────────── CLI (clap) ────────────────────────────

#[derive(Debug, Parser)]
#[command(name = "mobc-dump", version, about = "Inspecter un artefact de module portable mobc", long_about = None)]
struct Opt {
    /// Artefact à lire
    file: PathBuf,

    /// Augmente la verbosité (-v, -vv, -vvv) ; RUST_LOG l'emporte
    #[arg(short = 'v', long = "verbose", action = ArgAction::Count)]
    verbose: u8,

    /// Sortie JSON (inspection seulement)
    #[arg(long)]
    json: bool,

    /// Désassembler chaque méthode
    #[arg(long)]
    methods: bool,

    /// Afficher le texte source embarqué
    #[arg(long)]
    source: bool,

    /// Lister les fichiers annexes
    #[arg(long)]
    extra: bool,
}

// ──────────────────────────── Logger ────────────────────────────

fn init_telemetry(verbose: u8) {
    let level = match verbose {
        0 => "warn",
        1 => "info",
        2 => "debug",
        _ => "trace",
    };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));
    let _ = tracing_subscriber::fmt().with_env_filter(filter).with_writer(std::io::stderr).try_init();
}

// ──────────────────────────── Affichage ────────────────────────────

fn print_inspection(info: &Inspection) {
    println!("version   {}{}", info.version, if info.supported { "" } else { " (unsupported)" });
    println!("flags     {}", if info.flags.is_empty() { "-".to_owned() } else { info.flags.join(" | ") });
    println!("size      {} bytes", info.size);
    println!("crc32     {:#010x}", info.crc32);
    println!("sections  {}", info.sections.len());
    for s in &info.sections {
        let mark = if s.known { "" } else { "  (skipped)" };
        println!("  {:<4}  @{:<8} {:>8} bytes{mark}", s.tag, s.offset, s.len);
    }
}

// ──────────────────────────── main ────────────────────────────

fn main() -> ExitCode {
    if let Err(e) = real_main() {
        eprintln!("error: {e:#}");
        return ExitCode::from(1);
    }
    ExitCode::SUCCESS
}

fn real_main() -> Result<()> {
    let opt = Opt::parse();
    init_telemetry(opt.verbose);

    let buffer = BackingBuffer::read_file(&opt.file).with_context(|| format!("lecture de {}", opt.file.display()))?;
    let info = mobc_format::inspect(&buffer).context("artefact illisible")?;

    if opt.json {
        println!("{}", serde_json::to_string_pretty(&info)?);
    } else {
        print_inspection(&info);
    }

    if !(opt.methods || opt.source || opt.extra) {
        return Ok(());
    }

    let mut extra = ExtraFiles::new();
    let portable = load_portable(&buffer, &mut extra).context("décodage du module")?;

    if opt.methods {
        println!();
        for method in &portable.methods {
            println!("{}", disassemble_compact(method, &portable.constants));
        }
    }
    if opt.source {
        for (file, text) in &portable.sources {
            println!("\n── {file} ──");
            print!("{text}");
        }
    }
    if opt.extra {
        println!();
        for (name, data) in &extra {
            println!("extra  {name:<24} {:>8} bytes", data.len());
        }
    }
    Ok(())
}
