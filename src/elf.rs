//! ELF header summarization for platform/libc detection.

use object::Endianness;
use object::elf;
use object::read::elf::{FileHeader, ProgramHeader};

use crate::{Architecture, LibcFlavor, SelfprofError, SelfprofResult};

/// Size of the `e_ident` array at the start of an ELF header.
const EI_NIDENT: usize = 16;
/// Index of the file-class byte within `e_ident`.
const EI_CLASS: usize = 4;

/// The header fields needed to classify the running process image: class,
/// machine, and the `PT_INTERP` dynamic-linker path (absent for static
/// binaries).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ElfSummary {
    pub is_64bit: bool,
    pub architecture: Architecture,
    pub interpreter: Option<String>,
}

/// Parses an ELF image from a byte buffer. Pure: no file access, so tests
/// feed literal header fixtures.
pub fn summarize(data: &[u8]) -> SelfprofResult<ElfSummary> {
    let ident = data
        .get(..EI_NIDENT)
        .ok_or_else(|| SelfprofError::PlatformUnsupported("elf image too short".to_string()))?;
    if ident[..4] != [0x7f, b'E', b'L', b'F'] {
        return Err(SelfprofError::PlatformUnsupported(
            "invalid elf magic".to_string(),
        ));
    }

    match ident[EI_CLASS] {
        elf::ELFCLASS32 => summarize_class::<elf::FileHeader32<Endianness>>(data, false),
        elf::ELFCLASS64 => summarize_class::<elf::FileHeader64<Endianness>>(data, true),
        other => Err(SelfprofError::PlatformUnsupported(format!(
            "unknown elf class {other}"
        ))),
    }
}

fn summarize_class<Elf: FileHeader<Endian = Endianness>>(
    data: &[u8],
    is_64bit: bool,
) -> SelfprofResult<ElfSummary> {
    let header = Elf::parse(data)
        .map_err(|e| SelfprofError::PlatformUnsupported(format!("elf header: {e}")))?;
    let endian = header
        .endian()
        .map_err(|e| SelfprofError::PlatformUnsupported(format!("elf endianness: {e}")))?;

    let architecture = match header.e_machine(endian) {
        elf::EM_386 => Architecture::X86,
        elf::EM_X86_64 => Architecture::X64,
        elf::EM_ARM => Architecture::Arm,
        elf::EM_AARCH64 => Architecture::Arm64,
        other => {
            return Err(SelfprofError::PlatformUnsupported(format!(
                "unknown elf machine {other}"
            )));
        }
    };

    let mut interpreter = None;
    let program_headers = header
        .program_headers(endian, data)
        .map_err(|e| SelfprofError::PlatformUnsupported(format!("elf program headers: {e}")))?;
    for ph in program_headers {
        if ph.p_type(endian) != elf::PT_INTERP {
            continue;
        }
        let bytes = ph.data(endian, data).map_err(|()| {
            SelfprofError::PlatformUnsupported("elf interpreter segment out of range".to_string())
        })?;
        let end = bytes.iter().position(|b| *b == 0).unwrap_or(bytes.len());
        interpreter = Some(String::from_utf8_lossy(&bytes[..end]).into_owned());
        break;
    }

    Ok(ElfSummary {
        is_64bit,
        architecture,
        interpreter,
    })
}

/// Classifies the dynamic-linker path into a libc flavor by its file name.
/// The directory part is ignored so NixOS/snap style interpreter paths
/// classify the same as `/lib` ones.
pub fn interpreter_libc(interpreter: &str) -> SelfprofResult<LibcFlavor> {
    let (dir, file_name) = match interpreter.rfind('/') {
        Some(n) => (&interpreter[..n], &interpreter[n + 1..]),
        None => ("", interpreter),
    };

    if file_name.starts_with("ld-linux-") || file_name.starts_with("ld-linux.") {
        return Ok(LibcFlavor::Glibc);
    }
    if file_name.starts_with("ld-musl-") || file_name.starts_with("ld-musl.") {
        return Ok(LibcFlavor::Musl);
    }

    // Loaders named plain `ld-2.27.so` appear under a target-triple directory.
    if file_name.starts_with("ld-") || file_name.starts_with("ld.") {
        let triple = dir.rsplit('/').next().unwrap_or_default();
        if triple.contains("-linux-gnu") {
            return Ok(LibcFlavor::Glibc);
        }
        if triple.contains("-linux-musl") {
            return Ok(LibcFlavor::Musl);
        }
    }

    Err(SelfprofError::PlatformUnsupported(format!(
        "unknown elf interpreter {interpreter}"
    )))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn push_u16(out: &mut Vec<u8>, value: u16) {
        out.extend_from_slice(&value.to_le_bytes());
    }

    fn push_u32(out: &mut Vec<u8>, value: u32) {
        out.extend_from_slice(&value.to_le_bytes());
    }

    fn push_u64(out: &mut Vec<u8>, value: u64) {
        out.extend_from_slice(&value.to_le_bytes());
    }

    fn elf64_with_interp(machine: u16, interpreter: &str) -> Vec<u8> {
        let mut interp = interpreter.as_bytes().to_vec();
        interp.push(0);

        let mut out = Vec::new();
        out.extend_from_slice(&[0x7f, b'E', b'L', b'F']);
        out.push(elf::ELFCLASS64);
        out.push(elf::ELFDATA2LSB);
        out.push(1); // EV_CURRENT
        out.extend_from_slice(&[0; 9]);
        push_u16(&mut out, elf::ET_DYN);
        push_u16(&mut out, machine);
        push_u32(&mut out, 1); // e_version
        push_u64(&mut out, 0); // e_entry
        push_u64(&mut out, 64); // e_phoff
        push_u64(&mut out, 0); // e_shoff
        push_u32(&mut out, 0); // e_flags
        push_u16(&mut out, 64); // e_ehsize
        push_u16(&mut out, 56); // e_phentsize
        push_u16(&mut out, 1); // e_phnum
        push_u16(&mut out, 0); // e_shentsize
        push_u16(&mut out, 0); // e_shnum
        push_u16(&mut out, 0); // e_shstrndx
        assert_eq!(out.len(), 64);

        push_u32(&mut out, elf::PT_INTERP);
        push_u32(&mut out, 0); // p_flags
        push_u64(&mut out, 120); // p_offset
        push_u64(&mut out, 0); // p_vaddr
        push_u64(&mut out, 0); // p_paddr
        push_u64(&mut out, interp.len() as u64);
        push_u64(&mut out, interp.len() as u64);
        push_u64(&mut out, 1); // p_align
        assert_eq!(out.len(), 120);

        out.extend_from_slice(&interp);
        out
    }

    fn elf32_with_interp(machine: u16, interpreter: &str) -> Vec<u8> {
        let mut interp = interpreter.as_bytes().to_vec();
        interp.push(0);

        let mut out = Vec::new();
        out.extend_from_slice(&[0x7f, b'E', b'L', b'F']);
        out.push(elf::ELFCLASS32);
        out.push(elf::ELFDATA2LSB);
        out.push(1); // EV_CURRENT
        out.extend_from_slice(&[0; 9]);
        push_u16(&mut out, elf::ET_EXEC);
        push_u16(&mut out, machine);
        push_u32(&mut out, 1); // e_version
        push_u32(&mut out, 0); // e_entry
        push_u32(&mut out, 52); // e_phoff
        push_u32(&mut out, 0); // e_shoff
        push_u32(&mut out, 0); // e_flags
        push_u16(&mut out, 52); // e_ehsize
        push_u16(&mut out, 32); // e_phentsize
        push_u16(&mut out, 1); // e_phnum
        push_u16(&mut out, 0); // e_shentsize
        push_u16(&mut out, 0); // e_shnum
        push_u16(&mut out, 0); // e_shstrndx
        assert_eq!(out.len(), 52);

        push_u32(&mut out, elf::PT_INTERP);
        push_u32(&mut out, 84); // p_offset
        push_u32(&mut out, 0); // p_vaddr
        push_u32(&mut out, 0); // p_paddr
        push_u32(&mut out, interp.len() as u32);
        push_u32(&mut out, interp.len() as u32);
        push_u32(&mut out, 0); // p_flags
        push_u32(&mut out, 1); // p_align
        assert_eq!(out.len(), 84);

        out.extend_from_slice(&interp);
        out
    }

    #[test]
    fn summarizes_an_x86_64_glibc_image() {
        let data = elf64_with_interp(elf::EM_X86_64, "/lib64/ld-linux-x86-64.so.2");
        let summary = summarize(&data).expect("summarize");
        assert!(summary.is_64bit);
        assert_eq!(summary.architecture, Architecture::X64);
        assert_eq!(
            summary.interpreter.as_deref(),
            Some("/lib64/ld-linux-x86-64.so.2")
        );
    }

    #[test]
    fn summarizes_an_arm32_image() {
        let data = elf32_with_interp(elf::EM_ARM, "/lib/ld-musl-armhf.so.1");
        let summary = summarize(&data).expect("summarize");
        assert!(!summary.is_64bit);
        assert_eq!(summary.architecture, Architecture::Arm);
        assert_eq!(summary.interpreter.as_deref(), Some("/lib/ld-musl-armhf.so.1"));
    }

    #[test]
    fn rejects_non_elf_data() {
        assert!(summarize(b"not an elf").is_err());
    }

    #[test]
    fn classifies_common_interpreters() {
        let glibc = [
            "/lib/ld-linux-aarch64.so.1",
            "/snap/core18/current/lib/ld-linux.so.2",
            "/nix/store/c1nq-glibc-2.32-54/lib/ld-linux-aarch64.so.1",
            "/snap/dotnet-sdk/current/lib/x86_64-linux-gnu/ld-2.27.so",
        ];
        for interp in glibc {
            assert_eq!(interpreter_libc(interp).expect(interp), LibcFlavor::Glibc);
        }

        let musl = ["/lib/ld-musl-x86_64.so.1", "/lib/ld-musl-aarch64.so.1"];
        for interp in musl {
            assert_eq!(interpreter_libc(interp).expect(interp), LibcFlavor::Musl);
        }
    }

    #[test]
    fn unknown_interpreter_is_unsupported() {
        assert!(interpreter_libc("/lib/weird-loader.so").is_err());
    }
}
