//! Synthesis of the in-memory ELF image that describes JIT functions to a
//! debugger.

use crate::DebugInfoError;
use gimli::write::{Address, AttributeValue, DwarfUnit, EndianVec, Sections};
use gimli::{Encoding, Format, LittleEndian};
use object::write::{Object, StandardSegment, Symbol, SymbolSection};
use object::{Architecture, BinaryFormat, Endianness, SectionKind, SymbolFlags, SymbolKind, SymbolScope};

/// Longest function name kept, in bytes.
pub const MAX_NAME_LEN: usize = 255;

const PRODUCER: &str = "wasmjit";
const UNIT_NAME: &str = "<jit>";

/// One compiled function.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FunctionInfo {
    /// Symbol name.
    pub name: String,
    /// Address of the first instruction.
    pub addr: u64,
    /// Size of the body in bytes.
    pub size: u32,
    /// The function's wasm index.
    pub func_idx: i32,
}

impl FunctionInfo {
    pub(crate) fn contains(&self, addr: u64) -> bool {
        addr >= self.addr && addr - self.addr < u64::from(self.size)
    }
}

/// The result of resolving an address.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Symbolized {
    /// Name of the containing function.
    pub name: String,
    /// Its wasm index.
    pub func_idx: i32,
    /// Offset of the address from the start of the function.
    pub offset: u64,
}

pub(crate) fn lookup_in(functions: &[FunctionInfo], addr: u64) -> Option<Symbolized> {
    functions.iter().find(|f| f.contains(addr)).map(|f| Symbolized {
        name: f.name.clone(),
        func_idx: f.func_idx,
        offset: addr - f.addr,
    })
}

/// Truncates `name` to [`MAX_NAME_LEN`] bytes on a character boundary.
fn truncate_name(name: &str) -> String {
    if name.len() <= MAX_NAME_LEN {
        return name.to_string();
    }
    let mut end = MAX_NAME_LEN;
    while !name.is_char_boundary(end) {
        end -= 1;
    }
    name[..end].to_string()
}

/// Accumulates the functions of one compiled module and the overall code
/// range they cover.
#[derive(Debug, Clone)]
pub struct JitDebugInfo {
    functions: Vec<FunctionInfo>,
    low_pc: u64,
    high_pc: u64,
}

impl Default for JitDebugInfo {
    fn default() -> Self {
        Self::new()
    }
}

impl JitDebugInfo {
    /// An empty function table.
    pub fn new() -> Self {
        Self {
            functions: Vec::new(),
            low_pc: u64::MAX,
            high_pc: 0,
        }
    }

    /// Records a compiled function and widens the covered range.
    pub fn add_function(&mut self, name: &str, addr: u64, size: u32, func_idx: i32) {
        let end = addr.saturating_add(u64::from(size));
        self.low_pc = self.low_pc.min(addr);
        self.high_pc = self.high_pc.max(end);
        self.functions.push(FunctionInfo {
            name: truncate_name(name),
            addr,
            size,
            func_idx,
        });
    }

    /// The recorded functions, in insertion order.
    pub fn functions(&self) -> &[FunctionInfo] {
        &self.functions
    }

    /// Lowest function address, or `u64::MAX` while empty.
    pub fn low_pc(&self) -> u64 {
        self.low_pc
    }

    /// One past the highest function byte, or 0 while empty.
    pub fn high_pc(&self) -> u64 {
        self.high_pc
    }

    /// Resolves `addr` against this table only.
    pub fn lookup(&self, addr: u64) -> Option<Symbolized> {
        lookup_in(&self.functions, addr)
    }

    /// Builds the debugger image: an ELF object whose `.text` covers
    /// `[low_pc, high_pc)` without carrying the code bytes, a symbol per
    /// function, and a DWARF compile unit with one subprogram per function.
    pub fn build_image(&self) -> Result<Vec<u8>, DebugInfoError> {
        if self.functions.is_empty() {
            return Err(DebugInfoError::NoFunctions);
        }
        let mut obj = Object::new(BinaryFormat::Elf, host_architecture()?, Endianness::Little);

        let text = obj.add_section(Vec::new(), b".text".to_vec(), SectionKind::UninitializedData);
        obj.append_section_bss(text, self.high_pc - self.low_pc, 16);
        for f in &self.functions {
            obj.add_symbol(Symbol {
                name: f.name.as_bytes().to_vec(),
                value: f.addr,
                size: u64::from(f.size),
                kind: SymbolKind::Text,
                scope: SymbolScope::Compilation,
                weak: false,
                section: SymbolSection::Section(text),
                flags: SymbolFlags::None,
            });
        }

        let mut sections = Sections::new(EndianVec::new(LittleEndian));
        self.dwarf().write(&mut sections)?;
        let debug_segment = obj.segment_name(StandardSegment::Debug).to_vec();
        sections.for_each(|id, data| -> Result<(), DebugInfoError> {
            if data.slice().is_empty() {
                return Ok(());
            }
            let section = obj.add_section(
                debug_segment.clone(),
                id.name().as_bytes().to_vec(),
                SectionKind::Debug,
            );
            obj.append_section_data(section, data.slice(), 1);
            Ok(())
        })?;

        let mut bytes = obj.write()?;
        make_loadable(&mut bytes, self.low_pc, self.high_pc - self.low_pc)?;
        Ok(bytes)
    }

    fn dwarf(&self) -> DwarfUnit {
        let encoding = Encoding {
            format: Format::Dwarf32,
            version: 4,
            address_size: 8,
        };
        let mut dwarf = DwarfUnit::new(encoding);
        let root = dwarf.unit.root();
        let cu = dwarf.unit.get_mut(root);
        cu.set(gimli::DW_AT_producer, AttributeValue::String(PRODUCER.as_bytes().to_vec()));
        cu.set(gimli::DW_AT_language, AttributeValue::Language(gimli::DW_LANG_Mips_Assembler));
        cu.set(gimli::DW_AT_name, AttributeValue::String(UNIT_NAME.as_bytes().to_vec()));
        cu.set(gimli::DW_AT_low_pc, AttributeValue::Address(Address::Constant(self.low_pc)));
        cu.set(gimli::DW_AT_high_pc, AttributeValue::Udata(self.high_pc - self.low_pc));

        for f in &self.functions {
            let id = dwarf.unit.add(root, gimli::DW_TAG_subprogram);
            let die = dwarf.unit.get_mut(id);
            die.set(gimli::DW_AT_name, AttributeValue::String(f.name.as_bytes().to_vec()));
            die.set(gimli::DW_AT_low_pc, AttributeValue::Address(Address::Constant(f.addr)));
            die.set(gimli::DW_AT_high_pc, AttributeValue::Udata(u64::from(f.size)));
        }
        dwarf
    }
}

fn host_architecture() -> Result<Architecture, DebugInfoError> {
    if cfg!(target_arch = "x86_64") {
        Ok(Architecture::X86_64)
    } else if cfg!(target_arch = "aarch64") {
        Ok(Architecture::Aarch64)
    } else {
        Err(DebugInfoError::UnsupportedArchitecture)
    }
}

// ELF64 little-endian layout offsets.
const E_TYPE: usize = 16;
const E_PHOFF: usize = 32;
const E_SHOFF: usize = 40;
const E_PHENTSIZE: usize = 54;
const E_PHNUM: usize = 56;
const E_SHENTSIZE: usize = 58;
const E_SHNUM: usize = 60;
const E_SHSTRNDX: usize = 62;
const SH_NAME: usize = 0;
const SH_FLAGS: usize = 8;
const SH_ADDR: usize = 16;
const SH_OFFSET: usize = 24;
const PHDR_SIZE: usize = 56;

fn read_u16(bytes: &[u8], at: usize) -> Result<u16, DebugInfoError> {
    let raw = bytes.get(at..at + 2).ok_or(DebugInfoError::MalformedImage)?;
    Ok(u16::from_le_bytes([raw[0], raw[1]]))
}

fn read_u32(bytes: &[u8], at: usize) -> Result<u32, DebugInfoError> {
    let raw = bytes.get(at..at + 4).ok_or(DebugInfoError::MalformedImage)?;
    Ok(u32::from_le_bytes([raw[0], raw[1], raw[2], raw[3]]))
}

fn read_u64(bytes: &[u8], at: usize) -> Result<u64, DebugInfoError> {
    let lo = read_u32(bytes, at)?;
    let hi = read_u32(bytes, at + 4)?;
    Ok(u64::from(lo) | (u64::from(hi) << 32))
}

fn write_bytes(bytes: &mut [u8], at: usize, value: &[u8]) -> Result<(), DebugInfoError> {
    bytes
        .get_mut(at..at + value.len())
        .ok_or(DebugInfoError::MalformedImage)?
        .copy_from_slice(value);
    Ok(())
}

/// File offset of the header of the section called `name`.
fn find_section(bytes: &[u8], name: &[u8]) -> Result<usize, DebugInfoError> {
    let shoff = read_u64(bytes, E_SHOFF)? as usize;
    let shentsize = usize::from(read_u16(bytes, E_SHENTSIZE)?);
    let shnum = usize::from(read_u16(bytes, E_SHNUM)?);
    let shstrndx = usize::from(read_u16(bytes, E_SHSTRNDX)?);
    let strtab = read_u64(bytes, shoff + shstrndx * shentsize + SH_OFFSET)? as usize;
    for header in (0..shnum).map(|i| shoff + i * shentsize) {
        let start = strtab + read_u32(bytes, header + SH_NAME)? as usize;
        let entry = bytes.get(start..).ok_or(DebugInfoError::MalformedImage)?;
        if entry.starts_with(name) && entry.get(name.len()) == Some(&0) {
            return Ok(header);
        }
    }
    Err(DebugInfoError::MalformedImage)
}

/// Turns the relocatable object into something debuggers treat as loaded:
/// `.text` gets its runtime address and a single `PT_LOAD` segment appended
/// at the end of the file maps it.
fn make_loadable(bytes: &mut Vec<u8>, addr: u64, size: u64) -> Result<(), DebugInfoError> {
    use object::elf::{ET_DYN, PF_R, PF_X, PT_LOAD, SHF_ALLOC, SHF_EXECINSTR};

    if read_u64(bytes, E_PHOFF)? != 0 || read_u16(bytes, E_PHNUM)? != 0 {
        return Err(DebugInfoError::MalformedImage);
    }
    let text = find_section(bytes, b".text")?;
    let text_offset = read_u64(bytes, text + SH_OFFSET)?;
    write_bytes(bytes, text + SH_ADDR, &addr.to_le_bytes())?;
    write_bytes(bytes, text + SH_FLAGS, &u64::from(SHF_ALLOC | SHF_EXECINSTR).to_le_bytes())?;

    let phoff = bytes.len();
    bytes.resize(phoff + PHDR_SIZE, 0);
    let mut phdr = Vec::with_capacity(PHDR_SIZE);
    phdr.extend_from_slice(&PT_LOAD.to_le_bytes());
    phdr.extend_from_slice(&(PF_R | PF_X).to_le_bytes());
    phdr.extend_from_slice(&text_offset.to_le_bytes());
    phdr.extend_from_slice(&addr.to_le_bytes()); // p_vaddr
    phdr.extend_from_slice(&addr.to_le_bytes()); // p_paddr
    phdr.extend_from_slice(&0u64.to_le_bytes()); // p_filesz
    phdr.extend_from_slice(&size.to_le_bytes()); // p_memsz
    phdr.extend_from_slice(&16u64.to_le_bytes());
    write_bytes(bytes, phoff, &phdr)?;

    write_bytes(bytes, E_TYPE, &ET_DYN.to_le_bytes())?;
    write_bytes(bytes, E_PHOFF, &(phoff as u64).to_le_bytes())?;
    write_bytes(bytes, E_PHENTSIZE, &(PHDR_SIZE as u16).to_le_bytes())?;
    write_bytes(bytes, E_PHNUM, &1u16.to_le_bytes())?;
    Ok(())
}
