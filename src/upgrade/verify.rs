//! Structural verification of a staged executable.
//!
//! This is a sanity check, not a trust decision: it confirms the staged file
//! is an executable container for the host OS and targets the host CPU. It
//! catches the common deployment mistakes (truncated download, HTML error
//! page saved as a binary, wrong architecture asset) before the live binary
//! is touched. Signatures are not checked.
//!
//! | Host OS | Container | Machine field |
//! |---------|-----------|---------------|
//! | Linux, FreeBSD | ELF (parsed with `xmas-elf`) | `e_machine`, byte order from `EI_DATA` |
//! | macOS | Mach-O thin or universal | `cputype` (any slice for universal) |
//! | Windows | PE | COFF `Machine` |
//! | other | none | only the empty check applies |

use crate::core::VerifyError;
use crate::utils::platform::{Arch, Os, Platform};
use std::fs::File;
use std::io::{Read, Seek, SeekFrom};
use std::path::Path;
use tracing::debug;
use xmas_elf::ElfFile;
use xmas_elf::header::{Data, Machine as ElfMachine};

const HEADER_LEN: usize = 4096;

const EM_386: u16 = 3;
const EM_ARM: u16 = 40;
const EM_X86_64: u16 = 62;
const EM_AARCH64: u16 = 183;

const MH_MAGIC: u32 = 0xfeed_face;
const MH_MAGIC_64: u32 = 0xfeed_facf;
const MH_CIGAM: u32 = 0xcefa_edfe;
const MH_CIGAM_64: u32 = 0xcffa_edfe;
const FAT_MAGIC: u32 = 0xcafe_babe;
const FAT_MAGIC_64: u32 = 0xcafe_babf;
// Java class files share FAT_MAGIC; their "count" is a class version >= 45.
const MAX_FAT_SLICES: u32 = 30;
const CPU_ARCH_ABI64: u32 = 0x0100_0000;
const CPU_TYPE_X86: u32 = 7;
const CPU_TYPE_ARM: u32 = 12;
const CPU_TYPE_X86_64: u32 = CPU_TYPE_X86 | CPU_ARCH_ABI64;
const CPU_TYPE_ARM64: u32 = CPU_TYPE_ARM | CPU_ARCH_ABI64;

const IMAGE_FILE_MACHINE_I386: u32 = 0x014c;
const IMAGE_FILE_MACHINE_ARM: u32 = 0x01c0;
const IMAGE_FILE_MACHINE_ARMNT: u32 = 0x01c4;
const IMAGE_FILE_MACHINE_AMD64: u32 = 0x8664;
const IMAGE_FILE_MACHINE_ARM64: u32 = 0xaa64;

/// CPU family declared by a container header.
#[derive(Debug, Clone, PartialEq, Eq)]
enum Machine {
    X86_64,
    Aarch64,
    Arm,
    X86,
    Unknown(String),
}

impl Machine {
    fn unknown(code: u32) -> Self {
        Self::Unknown(format!("machine {code:#x}"))
    }

    fn matches(&self, host: &Arch) -> bool {
        matches!(
            (self, host),
            (Self::X86_64, Arch::X86_64)
                | (Self::Aarch64, Arch::Aarch64)
                | (Self::Arm, Arch::Armv7 | Arch::Armv6)
                | (Self::X86, Arch::X86)
        )
    }

    fn describe(&self) -> String {
        match self {
            Self::X86_64 => "x86_64".to_string(),
            Self::Aarch64 => "aarch64".to_string(),
            Self::Arm => "arm".to_string(),
            Self::X86 => "x86".to_string(),
            Self::Unknown(name) => name.clone(),
        }
    }
}

/// Check that `path` is a non-empty executable for `platform`.
///
/// # Errors
///
/// - [`VerifyError::Empty`] for a zero-length file
/// - [`VerifyError::InvalidFormat`] when the container header is wrong
/// - [`VerifyError::ArchitectureMismatch`] when the header names another CPU
/// - [`VerifyError::Unreadable`] when the file cannot be read
pub fn verify(path: &Path, platform: &Platform) -> Result<(), VerifyError> {
    let unreadable = |e: std::io::Error| VerifyError::Unreadable {
        reason: format!("{}: {e}", path.display()),
    };

    let mut file = File::open(path).map_err(unreadable)?;
    let len = file.metadata().map_err(unreadable)?.len();
    if len == 0 {
        return Err(VerifyError::Empty);
    }

    let mut header = Vec::with_capacity(HEADER_LEN);
    (&mut file).take(HEADER_LEN as u64).read_to_end(&mut header).map_err(unreadable)?;

    let result = match platform.os {
        Os::Linux | Os::FreeBsd => check(platform, "ELF", elf_machine(&header)),
        Os::MacOs => check_macho(platform, &header),
        Os::Windows => {
            let machine = pe_machine(&header, &mut file).map_err(unreadable)?;
            check(platform, "PE", machine)
        }
        Os::Other(_) => Ok(()),
    };

    if result.is_ok() {
        debug!(path = %path.display(), platform = %platform, "Staged binary verified");
    }
    result
}

fn check(platform: &Platform, format: &str, machine: Option<Machine>) -> Result<(), VerifyError> {
    let machine = machine.ok_or_else(|| VerifyError::InvalidFormat {
        expected: format.to_string(),
    })?;

    if matches!(platform.arch, Arch::Other(_)) || machine.matches(&platform.arch) {
        Ok(())
    } else {
        Err(VerifyError::ArchitectureMismatch {
            expected: platform.arch.to_string(),
            found: machine.describe(),
        })
    }
}

fn check_macho(platform: &Platform, header: &[u8]) -> Result<(), VerifyError> {
    let invalid = || VerifyError::InvalidFormat {
        expected: "Mach-O".to_string(),
    };

    let magic = read_u32(header, 0, true).ok_or_else(invalid)?;
    if magic != FAT_MAGIC && magic != FAT_MAGIC_64 {
        return check(platform, "Mach-O", macho_machine(header));
    }

    let slices = fat_machines(header, magic == FAT_MAGIC_64).ok_or_else(invalid)?;
    if matches!(platform.arch, Arch::Other(_)) || slices.iter().any(|m| m.matches(&platform.arch)) {
        return Ok(());
    }

    Err(VerifyError::ArchitectureMismatch {
        expected: platform.arch.to_string(),
        found: slices.iter().map(Machine::describe).collect::<Vec<_>>().join(", "),
    })
}

fn elf_machine(header: &[u8]) -> Option<Machine> {
    let elf = ElfFile::new(header).ok()?;
    let foreign_order = match elf.header.pt1.data() {
        Data::LittleEndian => cfg!(target_endian = "big"),
        Data::BigEndian => cfg!(target_endian = "little"),
        _ => return None,
    };

    Some(match elf.header.pt2.machine().as_machine() {
        ElfMachine::X86_64 => Machine::X86_64,
        ElfMachine::AArch64 => Machine::Aarch64,
        ElfMachine::Arm => Machine::Arm,
        ElfMachine::X86 => Machine::X86,
        // xmas-elf reads fields in host byte order.
        ElfMachine::Other(code) if foreign_order => elf_code(code.swap_bytes()),
        ElfMachine::Other(code) => Machine::unknown(u32::from(code)),
        other => Machine::Unknown(format!("{other:?}")),
    })
}

fn elf_code(code: u16) -> Machine {
    match code {
        EM_X86_64 => Machine::X86_64,
        EM_AARCH64 => Machine::Aarch64,
        EM_ARM => Machine::Arm,
        EM_386 => Machine::X86,
        other => Machine::unknown(u32::from(other)),
    }
}

fn macho_machine(header: &[u8]) -> Option<Machine> {
    let big_endian = match read_u32(header, 0, true)? {
        MH_MAGIC | MH_MAGIC_64 => true,
        MH_CIGAM | MH_CIGAM_64 => false,
        _ => return None,
    };
    Some(cpu_type(read_u32(header, 4, big_endian)?))
}

fn fat_machines(header: &[u8], wide: bool) -> Option<Vec<Machine>> {
    let count = read_u32(header, 4, true)?;
    if count == 0 || count > MAX_FAT_SLICES {
        return None;
    }
    let entry_len = if wide {
        32
    } else {
        20
    };
    (0..count as usize)
        .map(|i| read_u32(header, 8 + i * entry_len, true).map(cpu_type))
        .collect()
}

fn cpu_type(code: u32) -> Machine {
    match code {
        CPU_TYPE_X86_64 => Machine::X86_64,
        CPU_TYPE_ARM64 => Machine::Aarch64,
        CPU_TYPE_ARM => Machine::Arm,
        CPU_TYPE_X86 => Machine::X86,
        other => Machine::unknown(other),
    }
}

fn pe_machine(header: &[u8], file: &mut File) -> std::io::Result<Option<Machine>> {
    if header.get(..2) != Some(b"MZ".as_slice()) {
        return Ok(None);
    }
    let Some(offset) = read_u32(header, 0x3c, false) else {
        return Ok(None);
    };
    let offset = offset as usize;

    let signature = match header.get(offset..offset + 6) {
        Some(bytes) => bytes.to_vec(),
        None => {
            // e_lfanew points past the first block
            let mut bytes = vec![0u8; 6];
            file.seek(SeekFrom::Start(offset as u64))?;
            match file.read_exact(&mut bytes) {
                Ok(()) => bytes,
                Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => return Ok(None),
                Err(e) => return Err(e),
            }
        }
    };

    if &signature[..4] != b"PE\0\0" {
        return Ok(None);
    }
    let code = u32::from(u16::from_le_bytes([signature[4], signature[5]]));
    Ok(Some(match code {
        IMAGE_FILE_MACHINE_AMD64 => Machine::X86_64,
        IMAGE_FILE_MACHINE_ARM64 => Machine::Aarch64,
        IMAGE_FILE_MACHINE_ARM | IMAGE_FILE_MACHINE_ARMNT => Machine::Arm,
        IMAGE_FILE_MACHINE_I386 => Machine::X86,
        other => Machine::unknown(other),
    }))
}

fn read_u32(bytes: &[u8], offset: usize, big_endian: bool) -> Option<u32> {
    let raw: [u8; 4] = bytes.get(offset..offset + 4)?.try_into().ok()?;
    Some(if big_endian {
        u32::from_be_bytes(raw)
    } else {
        u32::from_le_bytes(raw)
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_utils::binaries;
    use tempfile::TempDir;

    fn write(temp: &TempDir, name: &str, bytes: &[u8]) -> std::path::PathBuf {
        let path = temp.path().join(name);
        std::fs::write(&path, bytes).unwrap();
        path
    }

    fn linux(arch: Arch) -> Platform {
        Platform::new(Os::Linux, arch)
    }

    #[test]
    fn test_empty_file() {
        let temp = TempDir::new().unwrap();
        let path = write(&temp, "svc.new", b"");
        assert_eq!(verify(&path, &linux(Arch::X86_64)), Err(VerifyError::Empty));
    }

    #[test]
    fn test_missing_file_is_unreadable() {
        let temp = TempDir::new().unwrap();
        let err = verify(&temp.path().join("absent"), &linux(Arch::X86_64)).unwrap_err();
        assert!(matches!(err, VerifyError::Unreadable { .. }));
    }

    #[test]
    fn test_elf_matching_arch() {
        let temp = TempDir::new().unwrap();
        let path = write(&temp, "svc.new", &binaries::elf(EM_X86_64, false));
        assert_eq!(verify(&path, &linux(Arch::X86_64)), Ok(()));

        let path = write(&temp, "arm.new", &binaries::elf(EM_ARM, false));
        assert_eq!(verify(&path, &linux(Arch::Armv6)), Ok(()));
        assert_eq!(verify(&path, &Platform::new(Os::FreeBsd, Arch::Armv7)), Ok(()));
    }

    #[test]
    fn test_big_endian_elf_reads_machine_in_file_order() {
        let temp = TempDir::new().unwrap();
        let path = write(&temp, "svc.new", &binaries::elf(EM_AARCH64, true));
        assert_eq!(verify(&path, &linux(Arch::Aarch64)), Ok(()));
    }

    #[test]
    fn test_big_endian_elf_mismatch_names_file_machine() {
        let temp = TempDir::new().unwrap();
        let path = write(&temp, "svc.new", &binaries::elf(EM_X86_64, true));
        assert_eq!(
            verify(&path, &linux(Arch::Aarch64)),
            Err(VerifyError::ArchitectureMismatch {
                expected: "aarch64".to_string(),
                found: "x86_64".to_string(),
            })
        );
    }

    #[test]
    fn test_truncated_elf_is_invalid() {
        let temp = TempDir::new().unwrap();
        let full = binaries::elf(EM_X86_64, false);
        let path = write(&temp, "svc.new", &full[..20]);
        assert_eq!(
            verify(&path, &linux(Arch::X86_64)),
            Err(VerifyError::InvalidFormat {
                expected: "ELF".to_string(),
            })
        );
    }

    #[test]
    fn test_elf_arch_mismatch() {
        let temp = TempDir::new().unwrap();
        let path = write(&temp, "svc.new", &binaries::elf(EM_AARCH64, false));
        assert_eq!(
            verify(&path, &linux(Arch::X86_64)),
            Err(VerifyError::ArchitectureMismatch {
                expected: "x86_64".to_string(),
                found: "aarch64".to_string(),
            })
        );
    }

    #[test]
    fn test_non_elf_on_linux_is_invalid() {
        let temp = TempDir::new().unwrap();
        let path = write(&temp, "svc.new", b"<html>404 Not Found</html>");
        assert_eq!(
            verify(&path, &linux(Arch::X86_64)),
            Err(VerifyError::InvalidFormat {
                expected: "ELF".to_string(),
            })
        );

        let pe = write(&temp, "svc.exe", &binaries::pe(IMAGE_FILE_MACHINE_AMD64 as u16));
        assert!(matches!(verify(&pe, &linux(Arch::X86_64)), Err(VerifyError::InvalidFormat { .. })));
    }

    #[test]
    fn test_unknown_host_arch_only_checks_format() {
        let temp = TempDir::new().unwrap();
        let host = linux(Arch::Other("riscv64".to_string()));
        let path = write(&temp, "svc.new", &binaries::elf(EM_X86_64, false));
        assert_eq!(verify(&path, &host), Ok(()));

        let junk = write(&temp, "junk.new", b"#!/bin/sh\necho hi\n");
        assert!(matches!(verify(&junk, &host), Err(VerifyError::InvalidFormat { .. })));
    }

    #[test]
    fn test_macho_thin_both_byte_orders() {
        let temp = TempDir::new().unwrap();
        let mac = Platform::new(Os::MacOs, Arch::Aarch64);

        let le = write(&temp, "le", &binaries::macho(CPU_TYPE_ARM64, false));
        assert_eq!(verify(&le, &mac), Ok(()));
        let be = write(&temp, "be", &binaries::macho(CPU_TYPE_ARM64, true));
        assert_eq!(verify(&be, &mac), Ok(()));

        let intel = write(&temp, "intel", &binaries::macho(CPU_TYPE_X86_64, false));
        assert!(matches!(verify(&intel, &mac), Err(VerifyError::ArchitectureMismatch { .. })));
    }

    #[test]
    fn test_macho_universal_needs_matching_slice() {
        let temp = TempDir::new().unwrap();
        let universal = write(
            &temp,
            "universal",
            &binaries::fat(&[CPU_TYPE_X86_64, CPU_TYPE_ARM64]),
        );
        assert_eq!(verify(&universal, &Platform::new(Os::MacOs, Arch::Aarch64)), Ok(()));
        assert_eq!(verify(&universal, &Platform::new(Os::MacOs, Arch::X86_64)), Ok(()));

        let intel_only = write(&temp, "intel", &binaries::fat(&[CPU_TYPE_X86_64]));
        assert_eq!(
            verify(&intel_only, &Platform::new(Os::MacOs, Arch::Aarch64)),
            Err(VerifyError::ArchitectureMismatch {
                expected: "aarch64".to_string(),
                found: "x86_64".to_string(),
            })
        );
    }

    #[test]
    fn test_pe_machine() {
        let temp = TempDir::new().unwrap();
        let windows = Platform::new(Os::Windows, Arch::X86_64);

        let path = write(&temp, "svc.exe", &binaries::pe(IMAGE_FILE_MACHINE_AMD64 as u16));
        assert_eq!(verify(&path, &windows), Ok(()));

        let arm = write(&temp, "arm.exe", &binaries::pe(IMAGE_FILE_MACHINE_ARM64 as u16));
        assert_eq!(
            verify(&arm, &windows),
            Err(VerifyError::ArchitectureMismatch {
                expected: "x86_64".to_string(),
                found: "aarch64".to_string(),
            })
        );

        let elf = write(&temp, "elf.exe", &binaries::elf(EM_X86_64, false));
        assert_eq!(
            verify(&elf, &windows),
            Err(VerifyError::InvalidFormat {
                expected: "PE".to_string(),
            })
        );
    }

    #[test]
    fn test_pe_header_beyond_first_block() {
        let temp = TempDir::new().unwrap();
        let mut bytes = vec![0u8; 8192];
        bytes[..2].copy_from_slice(b"MZ");
        bytes[0x3c..0x40].copy_from_slice(&5000u32.to_le_bytes());
        bytes[5000..5004].copy_from_slice(b"PE\0\0");
        bytes[5004..5006].copy_from_slice(&(IMAGE_FILE_MACHINE_AMD64 as u16).to_le_bytes());
        let path = write(&temp, "big.exe", &bytes);

        assert_eq!(verify(&path, &Platform::new(Os::Windows, Arch::X86_64)), Ok(()));
    }

    #[test]
    fn test_other_os_is_permissive() {
        let temp = TempDir::new().unwrap();
        let path = write(&temp, "svc.new", b"anything");
        let host = Platform::new(Os::Other("plan9".to_string()), Arch::X86_64);
        assert_eq!(verify(&path, &host), Ok(()));
    }

    #[test]
    fn test_java_class_is_not_universal_binary() {
        let temp = TempDir::new().unwrap();
        let mut class = 0xcafe_babe_u32.to_be_bytes().to_vec();
        class.extend_from_slice(&[0, 0, 0, 52]);
        let path = write(&temp, "Main.class", &class);
        assert!(matches!(
            verify(&path, &Platform::new(Os::MacOs, Arch::Aarch64)),
            Err(VerifyError::InvalidFormat { .. })
        ));
    }
}
