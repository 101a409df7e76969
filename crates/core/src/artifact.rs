#![forbid(unsafe_code)]

use sha2::Digest as _;
use std::fmt::Write as _;

const ANON_ID_HEX_LEN: usize = 16;

/// Derives the opaque job id used in remote artifact paths and agent arguments,
/// so the scheduler's job id never appears in files the monitored user can read.
#[derive(Clone, Debug)]
pub struct Anonymizer {
    salt: String,
}

impl Anonymizer {
    pub fn new(salt: impl Into<String>) -> Self {
        Self { salt: salt.into() }
    }

    pub fn job_id(&self, jid: &str) -> String {
        let mut hasher = sha2::Sha256::new();
        hasher.update(self.salt.as_bytes());
        hasher.update(b":");
        hasher.update(jid.as_bytes());
        let digest = hasher.finalize();

        let mut out = String::with_capacity(ANON_ID_HEX_LEN);
        for b in digest.iter().take(ANON_ID_HEX_LEN / 2) {
            let _ = write!(&mut out, "{:02x}", b);
        }
        out
    }
}

/// File the agent writes on `host`: `<prefix>-<anon>-<host>.dat`.
pub fn artifact_file_name(prefix: &str, anonymized_job_id: &str, host: &str) -> String {
    format!("{prefix}-{anonymized_job_id}-{host}.dat")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn anonymized_id_is_stable_and_salted() {
        let a = Anonymizer::new("salt-a");
        let b = Anonymizer::new("salt-b");
        assert_eq!(a.job_id("1001"), a.job_id("1001"));
        assert_ne!(a.job_id("1001"), a.job_id("1002"));
        assert_ne!(a.job_id("1001"), b.job_id("1001"));

        let id = a.job_id("1001");
        assert_eq!(id.len(), ANON_ID_HEX_LEN);
        assert!(id.bytes().all(|c| c.is_ascii_hexdigit()));
    }

    #[test]
    fn artifact_name_embeds_host() {
        assert_eq!(
            artifact_file_name("pfmon", "ab12", "nid00010"),
            "pfmon-ab12-nid00010.dat"
        );
    }
}
