use std::path::{Path, PathBuf};

use aya::programs::SchedClassifier;
use aya::Ebpf;
use thiserror::Error;

pub const PROG_INGRESS: &str = "tc_ingress";
pub const PROG_EGRESS: &str = "tc_egress";
pub const MAP_EVENTS: &str = "events";

/// Location of the precompiled classifier objects relative to the binary.
const OBJECT_DIR: &str = "../../bpf/network/build";

#[derive(Debug, Error)]
pub enum LoadError {
    #[error("unsupported architecture: {0}")]
    UnsupportedArch(&'static str),
    #[error("failed to locate the classifier object: {0}")]
    Io(#[from] std::io::Error),
    #[error("failed to raise RLIMIT_MEMLOCK: {0}")]
    Memlock(#[source] std::io::Error),
    #[error("failed to load the classifier object: {0}")]
    Load(#[from] aya::EbpfError),
    #[error("program {0} missing from the classifier object")]
    MissingProgram(&'static str),
    #[error("failed to load program {program}: {source}")]
    Program {
        program: &'static str,
        #[source]
        source: aya::programs::ProgramError,
    },
}

/// Resolve the classifier object path for the running architecture:
/// `<bin-dir>/../../bpf/network/build/tc-<arch>.o`.
pub fn object_path() -> Result<PathBuf, LoadError> {
    let arch = match std::env::consts::ARCH {
        arch @ ("x86_64" | "aarch64" | "riscv64") => arch,
        other => return Err(LoadError::UnsupportedArch(other)),
    };
    let exe = std::env::current_exe()?;
    let bin_dir = exe
        .parent()
        .map(Path::to_path_buf)
        .unwrap_or_else(|| PathBuf::from("."));
    Ok(bin_dir.join(OBJECT_DIR).join(format!("tc-{arch}.o")))
}

/// Raise RLIMIT_MEMLOCK to infinity so map creation cannot fail on kernels
/// that still account BPF memory against it.
pub fn raise_memlock_limit() -> Result<(), LoadError> {
    let limit = libc::rlimit {
        rlim_cur: libc::RLIM_INFINITY,
        rlim_max: libc::RLIM_INFINITY,
    };
    // SAFETY: setrlimit reads the rlimit struct; the pointer is valid for
    // the duration of the call.
    let ret = unsafe { libc::setrlimit(libc::RLIMIT_MEMLOCK, &limit) };
    if ret != 0 {
        return Err(LoadError::Memlock(std::io::Error::last_os_error()));
    }
    Ok(())
}

/// Load the classifier object from disk and load both TC programs into the
/// kernel. The object must export `tc_ingress`, `tc_egress` and a
/// perf-event-array map named `events`.
pub fn load_classifier(path: &Path) -> Result<Ebpf, LoadError> {
    let mut bpf = Ebpf::load_file(path)?;
    for name in [PROG_INGRESS, PROG_EGRESS] {
        let program: &mut SchedClassifier = bpf
            .program_mut(name)
            .ok_or(LoadError::MissingProgram(name))?
            .try_into()
            .map_err(|source| LoadError::Program {
                program: name,
                source,
            })?;
        program.load().map_err(|source| LoadError::Program {
            program: name,
            source,
        })?;
    }
    Ok(bpf)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    #[cfg(any(
        target_arch = "x86_64",
        target_arch = "aarch64",
        target_arch = "riscv64"
    ))]
    fn object_path_is_arch_specific() {
        let path = object_path().unwrap();
        let file = path.file_name().unwrap().to_string_lossy();
        assert_eq!(file, format!("tc-{}.o", std::env::consts::ARCH));
        assert!(path.to_string_lossy().contains("bpf/network/build"));
    }
}
