use base64::{Engine as _, engine::general_purpose::URL_SAFE_NO_PAD};
use rand::rngs::OsRng;
use rand::{Rng, RngCore};

/// Number of digits in an email verification code.
pub const VERIFICATION_CODE_LENGTH: usize = 6;

/// Generates an opaque refresh token secret.
///
/// 32 bytes from the operating system RNG, base64url encoded without padding.
pub fn generate_token_secret() -> String {
    let mut bytes = [0u8; 32];
    OsRng.fill_bytes(&mut bytes);
    URL_SAFE_NO_PAD.encode(bytes)
}

/// Generates a numeric one-time code.
///
/// Each digit is drawn independently with `gen_range`, which samples
/// uniformly by rejection rather than reducing a wider value modulo 10.
pub fn generate_verification_code() -> String {
    let mut rng = OsRng;
    (0..VERIFICATION_CODE_LENGTH)
        .map(|_| char::from(b'0' + rng.gen_range(0..10u8)))
        .collect()
}

/// True if `code` has the exact shape of a verification code.
pub fn is_verification_code(code: &str) -> bool {
    code.len() == VERIFICATION_CODE_LENGTH && code.bytes().all(|b| b.is_ascii_digit())
}
