//! ELF preload path, §4.3 "ELF load" / §6 "Persisted state".
//!
//! A convenience layered on top of [`Backend::mem_write`]: parse a
//! little-endian RISC-V ELF with the `object` crate's `File::parse` +
//! `ObjectSection`/`ObjectSymbol` API, flatten its loadable sections into
//! one contiguous image, and hand that image to the back end in a single
//! write.

use std::fs;
use std::path::{Path, PathBuf};

use object::{Object, ObjectSection, ObjectSymbol, SectionFlags, SectionKind};
use thiserror::Error;

use crate::libs::backend::{Backend, BackendError};
use crate::libs::dmi::DmiTransport;

#[derive(Debug, Error)]
pub enum ElfLoadError {
    #[error("failed to read {0:?}: {1}")]
    Io(PathBuf, std::io::Error),
    #[error("failed to parse ELF: {0}")]
    Parse(#[from] object::Error),
    #[error("ELF has no loadable sections")]
    Empty,
    #[error("back end memory write failed: {0}")]
    Backend(#[from] BackendError),
    #[error("failed to write symbol table to {0:?}: {1}")]
    SymbolTable(PathBuf, std::io::Error),
}

/// A flattened view of an ELF's loadable content, ready to hand to
/// [`Backend::mem_write`] as one contiguous write.
pub struct ElfImage {
    pub xlen: u32,
    pub min_addr: u64,
    pub max_addr: u64,
    pub bytes: Vec<u8>,
    pub start: Option<u64>,
    pub exit: Option<u64>,
    pub tohost: Option<u64>,
}

/// ALLOC sections whose ELF section kind is one of
/// `PROGBITS/NOBITS/INIT_ARRAY/FINI_ARRAY`; WRITE/EXECINSTR sections are
/// already a subset of ALLOC in any sane linker script, so gating on
/// ALLOC plus this kind set is equivalent in practice.
fn is_loadable(kind: SectionKind, flags: SectionFlags) -> bool {
    let alloc = match flags {
        SectionFlags::Elf { sh_flags } => sh_flags & u64::from(object::elf::SHF_ALLOC) != 0,
        _ => false,
    };
    alloc
        && matches!(
            kind,
            SectionKind::Text
                | SectionKind::Data
                | SectionKind::ReadOnlyData
                | SectionKind::UninitializedData
        )
}

/// Parses `data` as an ELF and flattens its loadable sections, §4.3.
pub fn parse(data: &[u8]) -> Result<ElfImage, ElfLoadError> {
    let obj = object::File::parse(data)?;
    let xlen: u32 = if obj.is_64() { 64 } else { 32 };

    let mut min_addr = u64::MAX;
    let mut max_addr = 0u64;
    let mut loadable = Vec::new();
    for section in obj.sections() {
        if !is_loadable(section.kind(), section.flags()) {
            continue;
        }
        let address = section.address();
        let size = section.size();
        if size == 0 {
            continue;
        }
        min_addr = min_addr.min(address);
        max_addr = max_addr.max(address + size - 1);
        loadable.push((address, size, section.kind()));
    }
    if loadable.is_empty() {
        return Err(ElfLoadError::Empty);
    }

    let image_len = (max_addr - min_addr + 1) as usize;
    let mut bytes = vec![0u8; image_len];
    for section in obj.sections() {
        if !is_loadable(section.kind(), section.flags()) {
            continue;
        }
        let address = section.address();
        let size = section.size() as usize;
        if size == 0 {
            continue;
        }
        let offset = (address - min_addr) as usize;
        if section.kind() == SectionKind::UninitializedData {
            // NOBITS: already zero-filled, nothing to copy.
            continue;
        }
        let data = section
            .uncompressed_data()
            .map_err(ElfLoadError::Parse)?;
        bytes[offset..offset + data.len()].copy_from_slice(&data);
    }

    let mut start = None;
    let mut exit = None;
    let mut tohost = None;
    for symbol in obj.symbols() {
        let Ok(name) = symbol.name() else { continue };
        match name {
            "_start" => start = Some(symbol.address()),
            "exit" => exit = Some(symbol.address()),
            "tohost" => tohost = Some(symbol.address()),
            _ => {}
        }
    }

    Ok(ElfImage {
        xlen,
        min_addr,
        max_addr,
        bytes,
        start,
        exit,
        tohost,
    })
}

/// Reads `path`, parses it, and writes the flattened image through the
/// back end in one call, then emits the diagnostic `symbol_table.txt`
/// described in §6 "Persisted state" alongside it.
pub fn load_file<T: DmiTransport>(
    backend: &mut Backend<T>,
    path: &Path,
) -> Result<ElfImage, ElfLoadError> {
    let data = fs::read(path).map_err(|e| ElfLoadError::Io(path.to_path_buf(), e))?;
    let image = parse(&data)?;
    backend.mem_write(image.min_addr, &image.bytes)?;

    let symtab_path = path
        .parent()
        .unwrap_or_else(|| Path::new("."))
        .join("symbol_table.txt");
    write_symbol_table(&symtab_path, &image)
        .map_err(|e| ElfLoadError::SymbolTable(symtab_path.clone(), e))?;

    Ok(image)
}

fn write_symbol_table(path: &Path, image: &ElfImage) -> std::io::Result<()> {
    let mut out = String::new();
    if let Some(addr) = image.start {
        out.push_str(&format!("_start 0x{addr:x}\n"));
    }
    if let Some(addr) = image.exit {
        out.push_str(&format!("exit 0x{addr:x}\n"));
    }
    if let Some(addr) = image.tohost {
        out.push_str(&format!("tohost 0x{addr:x}\n"));
    }
    fs::write(path, out)
}

#[cfg(test)]
mod tests {
    use super::*;

    // A minimal, hand-built little-endian RV32 ELF with a single PROGBITS
    // ALLOC section isn't worth constructing byte-by-byte here; `is_loadable`
    // is the only pure-logic unit in this module worth testing directly.

    #[test]
    fn is_loadable_requires_alloc_flag() {
        let flags = SectionFlags::Elf {
            sh_flags: u64::from(object::elf::SHF_WRITE),
        };
        assert!(!is_loadable(SectionKind::Data, flags));
    }

    #[test]
    fn is_loadable_accepts_alloc_progbits_like_kinds() {
        let flags = SectionFlags::Elf {
            sh_flags: u64::from(object::elf::SHF_ALLOC | object::elf::SHF_EXECINSTR),
        };
        assert!(is_loadable(SectionKind::Text, flags));
    }

    #[test]
    fn is_loadable_accepts_alloc_bss() {
        let flags = SectionFlags::Elf {
            sh_flags: u64::from(object::elf::SHF_ALLOC | object::elf::SHF_WRITE),
        };
        assert!(is_loadable(SectionKind::UninitializedData, flags));
    }
}
