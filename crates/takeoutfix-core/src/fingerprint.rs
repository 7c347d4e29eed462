//! Lazy media content identity.
//!
//! Sharing one sidecar across several media files is only allowed when all
//! claimants are byte-identical. The proof is a size + SHA-256 pair computed
//! the first time a claim needs it and cached per relative path; read
//! failures are cached too so a broken file is not re-opened per claim.

use std::collections::{HashMap, HashSet};
use std::fs::File;
use std::io;
use std::path::{Path, PathBuf};

use sha2::{Digest, Sha256};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct Fingerprint {
    size: u64,
    hash: [u8; 32],
}

pub struct FingerprintCache {
    root: PathBuf,
    ok: HashMap<String, Fingerprint>,
    failed: HashSet<String>,
}

impl FingerprintCache {
    pub fn new(root: &Path) -> Self {
        Self {
            root: root.to_path_buf(),
            ok: HashMap::new(),
            failed: HashSet::new(),
        }
    }

    /// True when every claimed path hashes to the same content. A single
    /// claim is trivially identical; any unreadable claim disqualifies the
    /// whole group.
    pub fn all_identical(&mut self, claims: &[String]) -> bool {
        if claims.len() <= 1 {
            return true;
        }
        let Some(first) = self.fingerprint(&claims[0]) else {
            return false;
        };
        for claim in &claims[1..] {
            match self.fingerprint(claim) {
                Some(fp) if fp == first => {}
                _ => return false,
            }
        }
        true
    }

    fn fingerprint(&mut self, rel: &str) -> Option<Fingerprint> {
        if let Some(fp) = self.ok.get(rel) {
            return Some(*fp);
        }
        if self.failed.contains(rel) {
            return None;
        }
        match hash_file(&self.root.join(rel)) {
            Ok(fp) => {
                self.ok.insert(rel.to_string(), fp);
                Some(fp)
            }
            Err(_) => {
                self.failed.insert(rel.to_string());
                None
            }
        }
    }
}

fn hash_file(path: &Path) -> io::Result<Fingerprint> {
    let mut file = File::open(path)?;
    let mut hasher = Sha256::new();
    let size = io::copy(&mut file, &mut hasher)?;
    Ok(Fingerprint {
        size,
        hash: hasher.finalize().into(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;

    #[test]
    fn identical_and_distinct_content() {
        let dir = tempfile::tempdir().unwrap();
        fs::write(dir.path().join("a.jpg"), b"same bytes").unwrap();
        fs::write(dir.path().join("b.jpg"), b"same bytes").unwrap();
        fs::write(dir.path().join("c.jpg"), b"other bytes").unwrap();

        let mut cache = FingerprintCache::new(dir.path());
        assert!(cache.all_identical(&["a.jpg".into(), "b.jpg".into()]));
        assert!(!cache.all_identical(&["a.jpg".into(), "c.jpg".into()]));
        // same size, different content
        fs::write(dir.path().join("d.jpg"), b"same byteZ").unwrap();
        assert!(!cache.all_identical(&["a.jpg".into(), "d.jpg".into()]));
    }

    #[test]
    fn unreadable_claim_disqualifies_and_is_cached() {
        let dir = tempfile::tempdir().unwrap();
        fs::write(dir.path().join("a.jpg"), b"x").unwrap();

        let mut cache = FingerprintCache::new(dir.path());
        assert!(!cache.all_identical(&["a.jpg".into(), "gone.jpg".into()]));
        assert!(cache.failed.contains("gone.jpg"));
        assert!(!cache.all_identical(&["a.jpg".into(), "gone.jpg".into()]));
    }

    #[test]
    fn single_claim_is_trivially_identical() {
        let dir = tempfile::tempdir().unwrap();
        let mut cache = FingerprintCache::new(dir.path());
        assert!(cache.all_identical(&["whatever.jpg".into()]));
        assert!(cache.all_identical(&[]));
    }
}
