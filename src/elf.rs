//! Native-symbol resolution from the hosting ELF image and its loaded
//! shared objects.
//!
//! For every object reported by `dl_iterate_phdr` (the vDSO excluded)
//! three strategies are tried in order:
//!
//! 1. read `.symtab`/`.strtab` from the on-disk image via the section
//!    headers — debug builds and unstripped binaries resolve fully;
//! 2. walk the in-memory `PT_DYNAMIC` segment (`DT_SYMTAB`, `DT_STRTAB`,
//!    `DT_HASH` or `DT_GNU_HASH`) — stripped objects still expose their
//!    dynamic symbols;
//! 3. emit a single entry for the object's base address and name, so a
//!    decoder can at least attribute samples to the right object.
//!
//! Every transient table is released on every exit path; tables with
//! implausible sizes are refused rather than allocated.

use std::ffi::CStr;
use std::fs::File;
use std::io::{Read, Seek, SeekFrom};
use std::mem;
use std::slice;

use libc::{c_int, c_void, dl_iterate_phdr, dl_phdr_info, size_t, Elf64_Ehdr, Elf64_Shdr,
           Elf64_Sym, PT_DYNAMIC};

use error::{Error, Result};
use symtab;
use wbuf::Wbuf;

/// Refuse to allocate more than this for one symbol or string table.
const MAX_TABLE_BYTES: usize = 64 * 1024 * 1024;

// Section/symbol constants libc does not re-export.
const ELFCLASS64: u8 = 2;
const SHT_SYMTAB: u32 = 2;
const STT_FUNC: u8 = 2;

// Dynamic-entry tags.
const DT_NULL: i64 = 0;
const DT_HASH: i64 = 4;
const DT_STRTAB: i64 = 5;
const DT_SYMTAB: i64 = 6;
const DT_GNU_HASH: i64 = 0x6fff_fef5;

// libc carries the header, section and symbol shapes but not the
// dynamic entry.
#[repr(C)]
#[derive(Clone, Copy)]
struct Elf64Dyn {
    d_tag: i64,
    d_val: u64,
}

struct Visitor<'a> {
    out: &'a mut Wbuf,
}

/// Emit a `CFUNC` symtab entry for every function symbol resolvable from
/// the loaded ELF objects. Best effort: an object that cannot be read
/// degrades to its base-address entry, never to a failed profiling run.
pub fn dump_symbols(out: &mut Wbuf) {
    let mut visitor = Visitor { out };
    // NOTE(unsafe) dl_iterate_phdr only runs our callback synchronously
    // on this thread; the visitor reference cannot outlive this call.
    unsafe {
        dl_iterate_phdr(Some(dump_object), &mut visitor as *mut Visitor as *mut c_void);
    }
}

unsafe extern "C" fn dump_object(
    info: *mut dl_phdr_info,
    _size: size_t,
    data: *mut c_void,
) -> c_int {
    let visitor = &mut *(data as *mut Visitor);
    let info = &*info;

    let name = if info.dlpi_name.is_null() {
        ""
    } else {
        CStr::from_ptr(info.dlpi_name).to_str().unwrap_or("")
    };
    // The vDSO has no on-disk image and its dynamic segment layout is
    // the kernel's business.
    if name == "linux-vdso.so.1" || name == "linux-gate.so.1" {
        return 0;
    }

    // The main executable reports an empty name.
    let path = if name.is_empty() { "/proc/self/exe" } else { name };
    let base = info.dlpi_addr as u64;

    match dump_from_disk(visitor.out, path, base) {
        Ok(true) => return 0,
        Ok(false) => {}
        Err(e) => {
            warn!("skipping section headers of {}: {}", path, e);
        }
    }

    if !dump_dynamic(visitor.out, info) {
        // Last resort: one entry for the object itself.
        visitor.out.add_byte(symtab::SYMTAB_CFUNC);
        symtab::write_cfunc(visitor.out, base, path);
    }

    0
}

/// Preferred path: the on-disk image's full `.symtab`.
fn dump_from_disk(out: &mut Wbuf, path: &str, base: u64) -> Result<bool> {
    let mut file = match File::open(path) {
        Ok(f) => f,
        // Deleted or synthetic objects fall through to the dynamic walk.
        Err(_) => return Ok(false),
    };

    let mut ehdr: Elf64_Ehdr = unsafe { mem::zeroed() };
    if read_struct(&mut file, &mut ehdr).is_err() {
        return Ok(false);
    }
    if &ehdr.e_ident[..4] != b"\x7fELF" || ehdr.e_ident[4] != ELFCLASS64 {
        return Ok(false);
    }
    if ehdr.e_shoff == 0
        || ehdr.e_shnum == 0
        || ehdr.e_shentsize as usize != mem::size_of::<Elf64_Shdr>()
    {
        return Ok(false);
    }

    let shnum = ehdr.e_shnum as usize;
    let mut shdrs: Vec<Elf64_Shdr> = vec![unsafe { mem::zeroed() }; shnum];
    file.seek(SeekFrom::Start(ehdr.e_shoff))
        .map_err(Error::from)?;
    read_slice(&mut file, &mut shdrs)?;

    let symtab_hdr = match shdrs.iter().find(|sh| sh.sh_type == SHT_SYMTAB) {
        Some(sh) => *sh,
        None => return Ok(false),
    };
    let strtab_hdr = match shdrs.get(symtab_hdr.sh_link as usize) {
        Some(sh) => *sh,
        None => return Ok(false),
    };

    let nsyms = symtab_hdr.sh_size as usize / mem::size_of::<Elf64_Sym>();
    if symtab_hdr.sh_size as usize > MAX_TABLE_BYTES || strtab_hdr.sh_size as usize > MAX_TABLE_BYTES
    {
        return Err(Error::Mem);
    }

    let mut syms: Vec<Elf64_Sym> = vec![unsafe { mem::zeroed() }; nsyms];
    file.seek(SeekFrom::Start(symtab_hdr.sh_offset))
        .map_err(Error::from)?;
    read_slice(&mut file, &mut syms)?;

    let mut strtab = vec![0u8; strtab_hdr.sh_size as usize];
    file.seek(SeekFrom::Start(strtab_hdr.sh_offset))
        .map_err(Error::from)?;
    file.read_exact(&mut strtab).map_err(Error::from)?;

    let mut emitted = 0usize;
    for sym in &syms {
        if let Some(name) = function_name(sym, &strtab) {
            out.add_byte(symtab::SYMTAB_CFUNC);
            symtab::write_cfunc(out, base + sym.st_value, name);
            emitted += 1;
        }
    }
    debug!("resolved {} function symbols from {}", emitted, path);
    // A symtab with no named function symbols resolves nothing; let the
    // caller fall through to the dynamic walk and the last resort.
    Ok(emitted > 0)
}

/// Fallback: the dynamic segment of the live image.
unsafe fn dump_dynamic(out: &mut Wbuf, info: &dl_phdr_info) -> bool {
    let base = info.dlpi_addr as u64;
    let phdrs = slice::from_raw_parts(info.dlpi_phdr, info.dlpi_phnum as usize);
    let dynamic = match phdrs.iter().find(|ph| ph.p_type == PT_DYNAMIC) {
        Some(ph) => (base + ph.p_vaddr) as *const Elf64Dyn,
        None => return false,
    };

    let mut symtab_addr = 0u64;
    let mut strtab_addr = 0u64;
    let mut hash_addr = 0u64;
    let mut gnu_hash_addr = 0u64;

    // Loaders differ in whether the live dynamic entries were relocated;
    // values below the mapping base still need the base added.
    let reloc = |v: u64| if v < base { base + v } else { v };

    let mut d = dynamic;
    while (*d).d_tag != DT_NULL {
        match (*d).d_tag {
            DT_SYMTAB => symtab_addr = reloc((*d).d_val),
            DT_STRTAB => strtab_addr = reloc((*d).d_val),
            DT_HASH => hash_addr = reloc((*d).d_val),
            DT_GNU_HASH => gnu_hash_addr = reloc((*d).d_val),
            _ => {}
        }
        d = d.add(1);
    }

    if symtab_addr == 0 || strtab_addr == 0 {
        return false;
    }
    let nsyms = if hash_addr != 0 {
        // Classic hash: [nbucket, nchain, ...]; nchain equals the
        // symbol count.
        *(hash_addr as *const u32).add(1) as usize
    } else if gnu_hash_addr != 0 {
        gnu_hash_symcount(gnu_hash_addr as *const u32)
    } else {
        return false;
    };
    if nsyms == 0 || nsyms > MAX_TABLE_BYTES / mem::size_of::<Elf64_Sym>() {
        return false;
    }

    let syms = slice::from_raw_parts(symtab_addr as *const Elf64_Sym, nsyms);
    let mut emitted = 0usize;
    for sym in syms {
        if sym.st_name == 0 || sym.st_value == 0 || sym.st_info & 0xf != STT_FUNC {
            continue;
        }
        let name = CStr::from_ptr((strtab_addr + u64::from(sym.st_name)) as *const _);
        if let Ok(name) = name.to_str() {
            out.add_byte(symtab::SYMTAB_CFUNC);
            symtab::write_cfunc(out, base + sym.st_value, name);
            emitted += 1;
        }
    }
    emitted > 0
}

/// Symbol count of a `DT_GNU_HASH` table: find the highest bucket entry,
/// then follow its chain until the terminator bit.
unsafe fn gnu_hash_symcount(tab: *const u32) -> usize {
    let nbuckets = *tab as usize;
    let symoffset = *tab.add(1) as usize;
    let bloom_size = *tab.add(2) as usize;
    let buckets = (tab.add(4) as *const u64).add(bloom_size) as *const u32;
    let chains = buckets.add(nbuckets);

    let mut last = 0usize;
    for i in 0..nbuckets {
        let b = *buckets.add(i) as usize;
        if b > last {
            last = b;
        }
    }
    if last < symoffset {
        return symoffset;
    }
    loop {
        let h = *chains.add(last - symoffset);
        if h & 1 != 0 {
            return last + 1;
        }
        last += 1;
    }
}

fn function_name<'a>(sym: &Elf64_Sym, strtab: &'a [u8]) -> Option<&'a str> {
    if sym.st_name == 0 || sym.st_value == 0 || sym.st_info & 0xf != STT_FUNC {
        return None;
    }
    let start = sym.st_name as usize;
    if start >= strtab.len() {
        return None;
    }
    let tail = &strtab[start..];
    let end = tail.iter().position(|&b| b == 0)?;
    ::std::str::from_utf8(&tail[..end]).ok()
}

fn read_struct<T>(file: &mut File, value: &mut T) -> ::std::io::Result<()> {
    // NOTE(unsafe) plain-old-data ELF structs, read straight off disk.
    let bytes = unsafe {
        slice::from_raw_parts_mut(value as *mut T as *mut u8, mem::size_of::<T>())
    };
    file.read_exact(bytes)
}

fn read_slice<T>(file: &mut File, values: &mut [T]) -> Result<()> {
    let bytes = unsafe {
        slice::from_raw_parts_mut(
            values.as_mut_ptr() as *mut u8,
            values.len() * mem::size_of::<T>(),
        )
    };
    file.read_exact(bytes).map_err(Error::from)
}
