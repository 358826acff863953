//! Minimal executable headers.
//!
//! Each builder produces just enough bytes for the verifier to recognize the
//! container and read its machine field. None of them are runnable.

use crate::utils::platform::{Arch, Os, Platform};

/// ELF header with `e_machine` written in the requested byte order.
#[must_use]
pub fn elf(machine: u16, big_endian: bool) -> Vec<u8> {
    let mut bytes = vec![0u8; 64];
    bytes[..4].copy_from_slice(b"\x7fELF");
    bytes[4] = 2; // ELFCLASS64
    bytes[5] = if big_endian {
        2
    } else {
        1
    };
    bytes[6] = 1; // EV_CURRENT
    let machine = if big_endian {
        machine.to_be_bytes()
    } else {
        machine.to_le_bytes()
    };
    bytes[18..20].copy_from_slice(&machine);
    bytes
}

/// Little-endian ELF for `arch`.
#[must_use]
pub fn elf_for(arch: &Arch) -> Vec<u8> {
    let machine = match arch {
        Arch::X86_64 => 62,
        Arch::Aarch64 => 183,
        Arch::Armv7 | Arch::Armv6 => 40,
        Arch::X86 => 3,
        Arch::Other(_) => 0,
    };
    elf(machine, false)
}

/// Thin 64-bit Mach-O header for `cputype`.
#[must_use]
pub fn macho(cputype: u32, big_endian: bool) -> Vec<u8> {
    let mut bytes = vec![0u8; 32];
    if big_endian {
        bytes[..4].copy_from_slice(&0xfeed_facf_u32.to_be_bytes());
        bytes[4..8].copy_from_slice(&cputype.to_be_bytes());
    } else {
        bytes[..4].copy_from_slice(&0xfeed_facf_u32.to_le_bytes());
        bytes[4..8].copy_from_slice(&cputype.to_le_bytes());
    }
    bytes
}

/// Universal (fat) Mach-O header listing one slice per `cputypes` entry.
#[must_use]
pub fn fat(cputypes: &[u32]) -> Vec<u8> {
    let mut bytes = Vec::new();
    bytes.extend_from_slice(&0xcafe_babe_u32.to_be_bytes());
    bytes.extend_from_slice(&(cputypes.len() as u32).to_be_bytes());
    for (i, cputype) in cputypes.iter().enumerate() {
        let offset = 0x4000 * (i as u32 + 1);
        bytes.extend_from_slice(&cputype.to_be_bytes());
        bytes.extend_from_slice(&0u32.to_be_bytes()); // cpusubtype
        bytes.extend_from_slice(&offset.to_be_bytes());
        bytes.extend_from_slice(&0x1000u32.to_be_bytes()); // size
        bytes.extend_from_slice(&14u32.to_be_bytes()); // align
    }
    bytes
}

/// PE image with the COFF `Machine` field set.
#[must_use]
pub fn pe(machine: u16) -> Vec<u8> {
    let mut bytes = vec![0u8; 256];
    bytes[..2].copy_from_slice(b"MZ");
    bytes[0x3c..0x40].copy_from_slice(&0x80u32.to_le_bytes());
    bytes[0x80..0x84].copy_from_slice(b"PE\0\0");
    bytes[0x84..0x86].copy_from_slice(&machine.to_le_bytes());
    bytes
}

/// A header the verifier accepts on `platform`.
#[must_use]
pub fn for_platform(platform: &Platform) -> Vec<u8> {
    match platform.os {
        Os::Linux | Os::FreeBsd => elf_for(&platform.arch),
        Os::MacOs => {
            let cputype = match platform.arch {
                Arch::Aarch64 => 0x0100_000c,
                Arch::X86_64 => 0x0100_0007,
                Arch::Armv7 | Arch::Armv6 => 12,
                Arch::X86 => 7,
                Arch::Other(_) => 0,
            };
            macho(cputype, false)
        }
        Os::Windows => {
            let machine = match platform.arch {
                Arch::X86_64 => 0x8664,
                Arch::Aarch64 => 0xaa64,
                Arch::Armv7 | Arch::Armv6 => 0x01c4,
                Arch::X86 => 0x014c,
                Arch::Other(_) => 0,
            };
            pe(machine)
        }
        Os::Other(_) => b"#!/bin/sh\n".to_vec(),
    }
}
