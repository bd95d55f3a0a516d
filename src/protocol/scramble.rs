use rand::Rng;
use sha1::{Digest, Sha1};

use super::handshake::SCRAMBLE_SIZE;

/// Generate the 20-byte handshake challenge.
///
/// Bytes are drawn from the printable ASCII range and never 0x00, `'` or `"`,
/// so the scramble survives NUL-terminated and quoted framing on peers that
/// treat it as text.
pub fn gen_scramble() -> [u8; SCRAMBLE_SIZE] {
    let mut rng = rand::thread_rng();
    let mut scramble = [0u8; SCRAMBLE_SIZE];
    for byte in scramble.iter_mut() {
        *byte = loop {
            let b: u8 = rng.gen_range(0x20..=0x7E);
            if b != b'\'' && b != b'"' {
                break b;
            }
        };
    }
    scramble
}

/// SHA1 of one input.
pub fn sha1(data: &[u8]) -> [u8; 20] {
    let mut hasher = Sha1::new();
    hasher.update(data);
    hasher.finalize().into()
}

/// SHA1 over the concatenation of two inputs.
fn sha1_pair(a: &[u8], b: &[u8]) -> [u8; 20] {
    let mut hasher = Sha1::new();
    hasher.update(a);
    hasher.update(b);
    hasher.finalize().into()
}

/// `SHA1(SHA1(password))` — the digest stored in the user catalog.
pub fn double_sha1(password: &[u8]) -> [u8; 20] {
    sha1(&sha1(password))
}

/// Verify a client's `mysql_native_password` token against the stored
/// `SHA1(SHA1(password))` digest.
///
/// On success returns the recovered `SHA1(password)` (stage-1 hash). This is
/// the only credential material ever forwarded to backends; the cleartext
/// password never reaches the proxy.
///
/// The check mirrors the server side of the protocol:
/// 1. `step1 = SHA1(scramble || stored)`
/// 2. `step2 = token XOR step1` — the claimed `SHA1(password)`
/// 3. accept iff `SHA1(step2) == stored`
pub fn verify_native_password(
    scramble: &[u8],
    client_token: &[u8],
    stored_double_sha1: &[u8; 20],
) -> Option<[u8; 20]> {
    if client_token.len() != 20 {
        return None;
    }

    let step1 = sha1_pair(scramble, stored_double_sha1);

    let mut step2 = [0u8; 20];
    for (out, (t, s)) in step2.iter_mut().zip(client_token.iter().zip(step1.iter())) {
        *out = t ^ s;
    }

    if sha1(&step2) == *stored_double_sha1 {
        Some(step2)
    } else {
        None
    }
}

/// Build the token a client sends for `mysql_native_password`.
///
/// `token = SHA1(password) XOR SHA1(scramble || SHA1(SHA1(password)))`.
/// Empty passwords produce an empty token.
pub fn build_client_token(scramble: &[u8], password: &str) -> Vec<u8> {
    if password.is_empty() {
        return Vec::new();
    }

    let stage1 = sha1(password.as_bytes());
    token_from_stage1(scramble, &stage1)
}

/// Build an auth token from a stage-1 hash instead of a cleartext password.
/// Used to replay the client's credentials against backends.
pub fn token_from_stage1(scramble: &[u8], stage1: &[u8; 20]) -> Vec<u8> {
    let mask = sha1_pair(scramble, &sha1(stage1));
    stage1
        .iter()
        .zip(mask.iter())
        .map(|(a, b)| a ^ b)
        .collect()
}

/// Decode a 40-char hex digest into its 20-byte form.
pub fn hex_to_digest(hex: &str) -> Option<[u8; 20]> {
    if hex.len() != 40 {
        return None;
    }

    let mut digest = [0u8; 20];
    for (i, out) in digest.iter_mut().enumerate() {
        let pair = hex.get(i * 2..i * 2 + 2)?;
        *out = u8::from_str_radix(pair, 16).ok()?;
    }
    Some(digest)
}

/// Hex-encode a digest the way the catalog stores it.
pub fn digest_to_hex(digest: &[u8]) -> String {
    digest.iter().map(|b| format!("{b:02x}")).collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_scramble_charset() {
        for _ in 0..200 {
            let scramble = gen_scramble();
            for &b in &scramble {
                assert!((0x20..=0x7E).contains(&b), "byte {b:#04x} out of range");
                assert_ne!(b, 0x00);
                assert_ne!(b, b'\'');
                assert_ne!(b, b'"');
            }
        }
    }

    #[test]
    fn test_verify_roundtrip() {
        for pwd in ["secret", "a", "longer password with spaces", "Ünïcødé"] {
            let scramble = gen_scramble();
            let stored = double_sha1(pwd.as_bytes());
            let token = build_client_token(&scramble, pwd);

            let stage1 = verify_native_password(&scramble, &token, &stored)
                .expect("valid token must verify");
            assert_eq!(stage1, sha1(pwd.as_bytes()));
        }
    }

    #[test]
    fn test_verify_rejects_wrong_password() {
        let scramble = gen_scramble();
        let stored = double_sha1(b"secret");
        let token = build_client_token(&scramble, "not-secret");
        assert!(verify_native_password(&scramble, &token, &stored).is_none());
    }

    #[test]
    fn test_verify_rejects_bad_token_length() {
        let scramble = gen_scramble();
        let stored = double_sha1(b"secret");
        assert!(verify_native_password(&scramble, &[], &stored).is_none());
        assert!(verify_native_password(&scramble, &[0u8; 19], &stored).is_none());
    }

    #[test]
    fn test_token_from_stage1_matches_password_token() {
        let scramble = gen_scramble();
        let stage1 = sha1(b"secret");
        assert_eq!(
            token_from_stage1(&scramble, &stage1),
            build_client_token(&scramble, "secret")
        );
    }

    #[test]
    fn test_hex_digest_roundtrip() {
        let digest = double_sha1(b"secret");
        let hex = digest_to_hex(&digest);
        assert_eq!(hex.len(), 40);
        assert_eq!(hex_to_digest(&hex), Some(digest));

        assert_eq!(hex_to_digest("zz"), None);
        assert_eq!(hex_to_digest(&"0".repeat(39)), None);
        assert_eq!(hex_to_digest(&"g".repeat(40)), None);
    }
}
