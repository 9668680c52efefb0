use base64::{engine::general_purpose::URL_SAFE_NO_PAD, Engine};
use rand::{distributions::Alphanumeric, Rng};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

const VERIFIER_LENGTH: usize = 64;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PkceChallenge {
    pub code_verifier: String,
    pub code_challenge: String,
    pub code_challenge_method: String,
}

impl PkceChallenge {
    /// Fresh verifier with its S256 challenge
    pub fn generate() -> Self {
        let code_verifier: String = rand::thread_rng()
            .sample_iter(&Alphanumeric)
            .take(VERIFIER_LENGTH)
            .map(char::from)
            .collect();

        Self {
            code_challenge: code_challenge_for(&code_verifier),
            code_verifier,
            code_challenge_method: "S256".to_string(),
        }
    }
}

pub fn code_challenge_for(verifier: &str) -> String {
    let hash = Sha256::digest(verifier.as_bytes());
    URL_SAFE_NO_PAD.encode(hash)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_generate() {
        let pkce = PkceChallenge::generate();
        assert_eq!(pkce.code_verifier.len(), VERIFIER_LENGTH);
        assert_eq!(pkce.code_challenge_method, "S256");
        assert_eq!(pkce.code_challenge, code_challenge_for(&pkce.code_verifier));
        assert_ne!(pkce.code_verifier, PkceChallenge::generate().code_verifier);
    }

    #[test]
    fn test_known_challenge() {
        // base64url(sha256(verifier)) without padding
        assert_eq!(
            code_challenge_for("dBjftJeZ4CVP-mB92K27uhbUJU1p1r7wW1gFWFOEjXk"),
            "bwWFMyPfdG9qreDhH2lmftFx_dFeLDalzcT1gb_j68g"
        );
    }
}
