//! The authentication cookie.

use std::io::{self, Read, Write};
use std::os::unix::fs::OpenOptionsExt;
use std::path::Path;

use log::info;
use rand::RngCore;

use crate::protocol::COOKIE_LENGTH;

/// Loads the cookie from `path`, generating and persisting a fresh random
/// one (mode 0600) if the file does not exist yet.
pub fn load_or_generate(path: &Path) -> io::Result<[u8; COOKIE_LENGTH]> {
    let mut cookie = [0u8; COOKIE_LENGTH];

    match std::fs::File::open(path) {
        Ok(mut f) => {
            f.read_exact(&mut cookie)?;
            Ok(cookie)
        }
        Err(e) if e.kind() == io::ErrorKind::NotFound => {
            rand::rng().fill_bytes(&mut cookie);

            if let Some(parent) = path.parent() {
                if !parent.as_os_str().is_empty() {
                    std::fs::create_dir_all(parent)?;
                }
            }

            let mut f = std::fs::OpenOptions::new()
                .write(true)
                .create_new(true)
                .mode(0o600)
                .open(path)?;
            f.write_all(&cookie)?;

            info!("generated auth cookie at {}", path.display());
            Ok(cookie)
        }
        Err(e) => Err(e),
    }
}

/// Compares a presented cookie in constant time, so mismatch position does
/// not leak through timing.
pub fn cookie_matches(expected: &[u8; COOKIE_LENGTH], presented: &[u8]) -> bool {
    if presented.len() != COOKIE_LENGTH {
        return false;
    }

    let mut diff = 0u8;
    for (a, b) in expected.iter().zip(presented) {
        diff |= a ^ b;
    }

    diff == 0
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn generate_then_load() -> anyhow::Result<()> {
        let dir = std::env::temp_dir().join(format!("sonord-cookie-{}", std::process::id()));
        let path = dir.join("cookie");

        let first = load_or_generate(&path)?;
        let second = load_or_generate(&path)?;
        assert_eq!(first, second);

        std::fs::remove_dir_all(&dir)?;
        Ok(())
    }

    #[test]
    fn comparison() {
        let cookie = [7u8; COOKIE_LENGTH];
        assert!(cookie_matches(&cookie, &[7u8; COOKIE_LENGTH]));

        let mut other = [7u8; COOKIE_LENGTH];
        other[COOKIE_LENGTH - 1] = 8;
        assert!(!cookie_matches(&cookie, &other));
        assert!(!cookie_matches(&cookie, &[7u8; 16]));
    }
}
