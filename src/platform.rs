//! Host platform, architecture, and libc flavor detection.

use std::sync::OnceLock;

use crate::{SelfprofError, SelfprofResult, elf};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Platform {
    Windows,
    Linux,
    MacOs,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Architecture {
    X86,
    X64,
    Arm,
    Arm64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LibcFlavor {
    Glibc,
    Musl,
}

/// Detected facts about the running process's host. On Linux the
/// architecture and libc flavor come from the process's own ELF image;
/// shelling out to diagnostic tools is unreliable in containers and is
/// never done here.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HostInfo {
    pub platform: Platform,
    pub architecture: Architecture,
    pub libc: Option<LibcFlavor>,
}

impl HostInfo {
    /// Qualifier used in platform-specific package ids and cache folder
    /// names, e.g. `windows-x64`, `linux-musl-arm64`.
    pub fn runtime_qualifier(&self) -> String {
        let os = match self.platform {
            Platform::Windows => "windows",
            Platform::Linux => "linux",
            Platform::MacOs => "macos",
        };
        let arch = match self.architecture {
            Architecture::X86 => "x86",
            Architecture::X64 => "x64",
            Architecture::Arm => "arm",
            Architecture::Arm64 => "arm64",
        };
        match self.libc {
            Some(LibcFlavor::Musl) => format!("{os}-musl-{arch}"),
            _ => format!("{os}-{arch}"),
        }
    }
}

static HOST: OnceLock<SelfprofResult<HostInfo>> = OnceLock::new();

/// Detects the host once per process and memoizes the outcome. A probe
/// failure is fatal: there is no sensible fallback guess, so every call
/// keeps reporting it.
pub fn host() -> SelfprofResult<&'static HostInfo> {
    match HOST.get_or_init(detect) {
        Ok(info) => Ok(info),
        Err(err) => Err(SelfprofError::PlatformUnsupported(err.to_string())),
    }
}

fn detect() -> SelfprofResult<HostInfo> {
    if cfg!(target_os = "linux") {
        detect_linux()
    } else if cfg!(target_os = "macos") {
        Ok(HostInfo {
            platform: Platform::MacOs,
            architecture: process_architecture()?,
            libc: None,
        })
    } else if cfg!(target_os = "windows") {
        Ok(HostInfo {
            platform: Platform::Windows,
            architecture: process_architecture()?,
            libc: None,
        })
    } else {
        Err(SelfprofError::PlatformUnsupported(
            std::env::consts::OS.to_string(),
        ))
    }
}

fn process_architecture() -> SelfprofResult<Architecture> {
    if cfg!(target_arch = "x86_64") {
        Ok(Architecture::X64)
    } else if cfg!(target_arch = "x86") {
        Ok(Architecture::X86)
    } else if cfg!(target_arch = "aarch64") {
        Ok(Architecture::Arm64)
    } else if cfg!(target_arch = "arm") {
        Ok(Architecture::Arm)
    } else {
        Err(SelfprofError::PlatformUnsupported(
            std::env::consts::ARCH.to_string(),
        ))
    }
}

fn detect_linux() -> SelfprofResult<HostInfo> {
    let image = std::fs::read("/proc/self/exe")?;
    let summary = elf::summarize(&image)?;
    tracing::debug!(
        is_64bit = summary.is_64bit,
        interpreter = summary.interpreter.as_deref().unwrap_or("<none>"),
        "parsed own process image"
    );

    let interpreter = summary.interpreter.ok_or_else(|| {
        SelfprofError::PlatformUnsupported("no elf interpreter in process image".to_string())
    })?;
    let libc = elf::interpreter_libc(&interpreter)?;

    Ok(HostInfo {
        platform: Platform::Linux,
        architecture: summary.architecture,
        libc: Some(libc),
    })
}
