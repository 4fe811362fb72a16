use crate::types::PkceChallenge;
use base64::{engine::general_purpose::URL_SAFE_NO_PAD, Engine as _};
use rand::RngCore;
use sha2::{Digest, Sha256};

/// Generate a fresh PKCE verifier and its S256 challenge (RFC 7636).
pub fn generate_pkce_challenge() -> PkceChallenge {
    let code_verifier = generate_code_verifier();
    let code_challenge = code_challenge_for(&code_verifier);

    PkceChallenge {
        code_verifier,
        code_challenge,
        code_challenge_method: "S256".to_string(),
    }
}

/// 32 random bytes, base64url encoded to 43 characters.
fn generate_code_verifier() -> String {
    let mut random_bytes = [0u8; 32];
    rand::thread_rng().fill_bytes(&mut random_bytes);
    URL_SAFE_NO_PAD.encode(random_bytes)
}

/// code_challenge = BASE64URL-ENCODE(SHA256(ASCII(code_verifier)))
pub fn code_challenge_for(code_verifier: &str) -> String {
    URL_SAFE_NO_PAD.encode(Sha256::digest(code_verifier.as_bytes()))
}

pub fn verify_pkce_challenge(code_verifier: &str, code_challenge: &str) -> bool {
    code_challenge_for(code_verifier) == code_challenge
}
