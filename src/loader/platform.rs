//! Platform detection and the artifact naming scheme.
//!
//! Bundled engines are keyed by operating system family and CPU architecture:
//!
//! ```text
//! natives/<os>-<arch>/<file>
//! natives/linux-x86-64/libenet-jni.so
//! natives/macos-arm64/libenet-jni.dylib
//! natives/windows-x86-64/enet-jni.dll
//! ```
//!
//! Prebuilt artifacts depend on this layout; it must not change.

use std::fmt;

/// Root directory of the bundled artifact tree.
pub const NATIVES_ROOT: &str = "natives";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum OsFamily {
    Windows,
    MacOs,
    /// Linux and every other unix-like system.
    Linux,
}

impl OsFamily {
    pub fn as_str(self) -> &'static str {
        match self {
            OsFamily::Windows => "windows",
            OsFamily::MacOs => "macos",
            OsFamily::Linux => "linux",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Arch {
    Arm64,
    /// 64-bit x86; also the fallback for unrecognised architectures.
    X86_64,
}

impl Arch {
    pub fn as_str(self) -> &'static str {
        match self {
            Arch::Arm64 => "arm64",
            Arch::X86_64 => "x86-64",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Platform {
    pub os: OsFamily,
    pub arch: Arch,
}

impl Platform {
    /// The platform this binary was compiled for.
    pub fn current() -> Self {
        Self::detect(std::env::consts::OS, std::env::consts::ARCH)
    }

    /// Classifies free-form OS and architecture names.
    pub fn detect(os_name: &str, arch_name: &str) -> Self {
        let os_name = os_name.to_ascii_lowercase();
        let arch_name = arch_name.to_ascii_lowercase();

        let os = if os_name.contains("win") && !os_name.contains("darwin") {
            OsFamily::Windows
        } else if os_name.contains("mac") || os_name.contains("darwin") {
            OsFamily::MacOs
        } else {
            OsFamily::Linux
        };

        let arch = if arch_name == "aarch64" || arch_name.contains("arm64") {
            Arch::Arm64
        } else {
            Arch::X86_64
        };

        Self { os, arch }
    }

    /// `<os>-<arch>`, e.g. `linux-x86-64`.
    pub fn tag(&self) -> String {
        format!("{}-{}", self.os.as_str(), self.arch.as_str())
    }

    pub fn library_file_name(&self) -> &'static str {
        match self.os {
            OsFamily::Windows => "enet-jni.dll",
            OsFamily::MacOs => "libenet-jni.dylib",
            OsFamily::Linux => "libenet-jni.so",
        }
    }

    /// `natives/<tag>/<file>`, always with forward slashes.
    pub fn resource_path(&self) -> String {
        format!("{NATIVES_ROOT}/{}/{}", self.tag(), self.library_file_name())
    }
}

impl fmt::Display for Platform {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.tag())
    }
}
