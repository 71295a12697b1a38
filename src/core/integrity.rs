//! C2: resolve vendored transcoder/probe binaries, hash-verify against a
//! pinned contract, expose a diagnostics-only bypass (spec §4.2).

use std::collections::HashMap;
use std::io::Read;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use crate::core::logger::Logger;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum BinaryKind {
    Ffmpeg,
    Ffprobe,
}

impl BinaryKind {
    pub fn name(self) -> &'static str {
        match self {
            BinaryKind::Ffmpeg => "ffmpeg",
            BinaryKind::Ffprobe => "ffprobe",
        }
    }
}

/// One entry of the pinned (`platform`, `arch`) → binary contract (spec §4.2).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BinaryContractEntry {
    pub rel_path: String,
    pub sha256: String,
    pub runtime_sha256: Option<String>,
    pub required: bool,
}

/// Pinned contract for the current (platform, arch), keyed by binary kind.
#[derive(Debug, Clone)]
pub struct BinaryContract {
    pub key: String,
    pub entries: HashMap<BinaryKind, BinaryContractEntry>,
}

/// Outcome of verifying one binary against the contract.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VerifiedBinary {
    pub kind_name: String,
    pub path: PathBuf,
    pub hash: Option<String>,
    pub ok: bool,
}

/// Process-wide outcome of the integrity check (spec §4.2 step 4).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IntegrityState {
    pub contract_key: String,
    pub bypass_used: bool,
    pub unpackaged: bool,
    pub rendering_allowed: bool,
    pub binaries: Vec<VerifiedBinary>,
}

fn sha256_file(path: &Path) -> anyhow::Result<String> {
    let mut file = std::fs::File::open(path)?;
    let mut hasher = Sha256::new();
    let mut buf = [0u8; 64 * 1024];
    loop {
        let n = file.read(&mut buf)?;
        if n == 0 {
            break;
        }
        hasher.update(&buf[..n]);
    }
    Ok(format!("{:x}", hasher.finalize()))
}

/// Resolves a binary path relative to the packaged resources root, falling
/// back to a known dependency-provided path only when unpackaged (spec §4.2
/// step 1).
pub fn resolve_binary_path(resources_root: Option<&Path>, rel_path: &str, fallback: Option<&Path>) -> Option<PathBuf> {
    if let Some(root) = resources_root {
        let candidate = root.join(rel_path);
        if candidate.is_file() {
            return Some(candidate);
        }
    }
    fallback.map(Path::to_path_buf)
}

/// Verifies the resolved binaries for one contract and decides the process-wide
/// integrity state (spec §4.2 steps 2-4).
///
/// `packaged` distinguishes a bundled release build from a development run
/// launched straight out of `cargo`/`tauri dev`.
pub fn verify_contract(
    contract: &BinaryContract,
    resolved: &HashMap<BinaryKind, PathBuf>,
    packaged: bool,
    allow_bin_mismatch: bool,
    logger: &dyn Logger,
) -> IntegrityState {
    let mut binaries = Vec::new();
    let mut any_mismatch = false;

    for (kind, entry) in &contract.entries {
        let Some(path) = resolved.get(kind) else {
            if entry.required {
                any_mismatch = true;
            }
            binaries.push(VerifiedBinary {
                kind_name: kind.name().to_string(),
                path: PathBuf::new(),
                hash: None,
                ok: !entry.required,
            });
            continue;
        };

        let hash = sha256_file(path).ok();
        let expected: Vec<&str> = entry
            .runtime_sha256
            .as_deref()
            .into_iter()
            .chain(std::iter::once(entry.sha256.as_str()))
            .collect();
        let ok = hash.as_deref().is_some_and(|h| expected.contains(&h));
        if !ok && entry.required {
            any_mismatch = true;
        }
        binaries.push(VerifiedBinary {
            kind_name: kind.name().to_string(),
            path: path.clone(),
            hash,
            ok,
        });
    }

    let (bypass_used, rendering_allowed) = if !packaged {
        if any_mismatch {
            logger.log(
                "bin.integrity.warn",
                serde_json::json!({"contractKey": contract.key, "packaged": false}),
            );
        }
        (false, true)
    } else if !any_mismatch {
        logger.log("bin.integrity.ok", serde_json::json!({"contractKey": contract.key}));
        (false, true)
    } else if allow_bin_mismatch {
        logger.log(
            "bin.integrity.bypassed",
            serde_json::json!({"contractKey": contract.key}),
        );
        logger.log("bin.integrity.diagnostics_mode", serde_json::json!({}));
        (true, false)
    } else {
        logger.log("bin.integrity.fail", serde_json::json!({"contractKey": contract.key}));
        (false, false)
    };

    IntegrityState {
        contract_key: contract.key.clone(),
        bypass_used,
        unpackaged: !packaged,
        rendering_allowed,
        binaries,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn contract(sha: &str) -> BinaryContract {
        let mut entries = HashMap::new();
        entries.insert(
            BinaryKind::Ffmpeg,
            BinaryContractEntry {
                rel_path: "ffmpeg".into(),
                sha256: sha.into(),
                runtime_sha256: None,
                required: true,
            },
        );
        BinaryContract {
            key: "linux-x86_64".into(),
            entries,
        }
    }

    #[test]
    fn matching_hash_marks_ok() {
        let dir = tempfile::tempdir().unwrap();
        let bin = dir.path().join("ffmpeg");
        std::fs::write(&bin, b"fake-binary").unwrap();
        let hash = sha256_file(&bin).unwrap();
        let c = contract(&hash);
        let mut resolved = HashMap::new();
        resolved.insert(BinaryKind::Ffmpeg, bin);
        let state = verify_contract(&c, &resolved, true, false, &crate::core::logger::NullLogger);
        assert!(state.rendering_allowed);
        assert!(!state.bypass_used);
    }

    #[test]
    fn mismatch_without_bypass_blocks_rendering() {
        let dir = tempfile::tempdir().unwrap();
        let bin = dir.path().join("ffmpeg");
        std::fs::write(&bin, b"fake-binary").unwrap();
        let c = contract("0000000000000000000000000000000000000000000000000000000000000000");
        let mut resolved = HashMap::new();
        resolved.insert(BinaryKind::Ffmpeg, bin);
        let state = verify_contract(&c, &resolved, true, false, &crate::core::logger::NullLogger);
        assert!(!state.rendering_allowed);
        assert!(!state.bypass_used);
    }

    #[test]
    fn mismatch_with_bypass_enters_diagnostics_mode() {
        let dir = tempfile::tempdir().unwrap();
        let bin = dir.path().join("ffmpeg");
        std::fs::write(&bin, b"fake-binary").unwrap();
        let c = contract("0000000000000000000000000000000000000000000000000000000000000000");
        let mut resolved = HashMap::new();
        resolved.insert(BinaryKind::Ffmpeg, bin);
        let state = verify_contract(&c, &resolved, true, true, &crate::core::logger::NullLogger);
        assert!(!state.rendering_allowed);
        assert!(state.bypass_used);
    }

    #[test]
    fn unpackaged_warns_but_continues() {
        let dir = tempfile::tempdir().unwrap();
        let bin = dir.path().join("ffmpeg");
        std::fs::write(&bin, b"fake-binary").unwrap();
        let c = contract("mismatch");
        let mut resolved = HashMap::new();
        resolved.insert(BinaryKind::Ffmpeg, bin);
        let state = verify_contract(&c, &resolved, false, false, &crate::core::logger::NullLogger);
        assert!(state.rendering_allowed);
        assert!(state.unpackaged);
    }
}
