//! Calculation of the values a client derives from its password, so that the server can check them.
//!
//! Only the NT responses are covered. LM responses require the password in the OEM code page, and
//! this crate does not transcode beyond UTF-16LE.


use cipher::{BlockEncrypt, KeyInit};
use cipher::generic_array::GenericArray;
use cipher::generic_array::typenum::U8;
use chrono::Utc;
use des::Des;
use digest::Digest;
use hmac::{Hmac, Mac};
use md4::Md4;
use md5::Md5;


/// Seconds between 1601-01-01 (the Windows epoch) and 1970-01-01 (the Unix epoch).
const WINDOWS_TO_UNIX_EPOCH_SECS: i64 = 11_644_473_600;


/// Obtains the current NTLM timestamp, in tenths of a microsecond since 1601-01-01.
pub fn get_ntlm_time() -> i64 {
    let now = Utc::now();
    (now.timestamp() + WINDOWS_TO_UNIX_EPOCH_SECS) * 10_000_000
        + i64::from(now.timestamp_subsec_nanos() / 100)
}


/// Spreads 56 key bits over the 8 bytes DES expects, leaving the parity bits clear.
fn des_key(key7: [u8; 7]) -> GenericArray<u8, U8> {
    GenericArray::from([
        key7[0] & 0xFE,
        ((key7[0] << 7) | (key7[1] >> 1)) & 0xFE,
        ((key7[1] << 6) | (key7[2] >> 2)) & 0xFE,
        ((key7[2] << 5) | (key7[3] >> 3)) & 0xFE,
        ((key7[3] << 4) | (key7[4] >> 4)) & 0xFE,
        ((key7[4] << 3) | (key7[5] >> 5)) & 0xFE,
        ((key7[5] << 2) | (key7[6] >> 6)) & 0xFE,
        key7[6] << 1,
    ])
}

/// Performs the NTLMv1 DES encryption (DESL) to calculate the response value to the challenge.
pub fn des_long(key: [u8; 16], data: [u8; 8]) -> [u8; 24] {
    let keys = [
        [key[0], key[1], key[2], key[3], key[4], key[5], key[6]],
        [key[7], key[8], key[9], key[10], key[11], key[12], key[13]],
        [key[14], key[15], 0, 0, 0, 0, 0],
    ];

    let mut ret = [0u8; 24];
    for (key7, out) in keys.into_iter().zip(ret.chunks_exact_mut(8)) {
        let mut block = GenericArray::from(data);
        Des::new(&des_key(key7)).encrypt_block(&mut block);
        out.copy_from_slice(block.as_slice());
    }
    ret
}

fn utf16_le_bytes(s: &str) -> Vec<u8> {
    s.encode_utf16()
        .flat_map(|p| p.to_le_bytes())
        .collect()
}

fn hmac_md5(key: &[u8]) -> Hmac<Md5> {
    <Hmac<Md5> as Mac>::new_from_slice(key)
        .expect("HMAC accepts keys of any length")
}


/// Derives the NT hash of a password (NTOWFv1).
///
/// The password is encoded as UTF-16 in little-endian byte order (without the Byte Order Mark) and
/// hashed using MD4.
pub fn ntowf_v1(password: &str) -> [u8; 16] {
    let mut md4_state = <Md4 as Digest>::new();
    md4_state.update(utf16_le_bytes(password));
    md4_state.finalize().into()
}

/// Derives the NTLMv2 response key (NTOWFv2).
///
/// This is HMAC-MD5 keyed with the NT hash over the uppercase username followed by the domain in
/// its original case, both UTF-16LE.
pub fn ntowf_v2(password: &str, username: &str, domain: &str) -> [u8; 16] {
    let mut mac = hmac_md5(&ntowf_v1(password));
    mac.update(&utf16_le_bytes(&username.to_uppercase()));
    mac.update(&utf16_le_bytes(domain));
    mac.finalize().into_bytes().into()
}

/// Calculates the plain NTLMv1 response to a server challenge.
pub fn ntlm_v1_response(nt_hash: [u8; 16], server_challenge: [u8; 8]) -> [u8; 24] {
    des_long(nt_hash, server_challenge)
}

/// Calculates the NTLMv1 response with extended session security (`NEGOTIATE_NTLM2_KEY`).
///
/// The client challenge travels in the first eight bytes of the LM response field.
pub fn ntlm_v1_extended_response(nt_hash: [u8; 16], server_challenge: [u8; 8], client_challenge: [u8; 8]) -> [u8; 24] {
    let mut md5 = <Md5 as Digest>::new();
    md5.update(server_challenge);
    md5.update(client_challenge);
    let digest = md5.finalize();

    let mut desl_plaintext = [0u8; 8];
    desl_plaintext.copy_from_slice(&digest.as_slice()[0..8]);
    des_long(nt_hash, desl_plaintext)
}

/// Calculates the NTLMv2 proof (NTProofStr) over the server challenge and the client's blob.
///
/// The blob is everything in the NTLMv2 response after the proof itself.
pub fn nt_proof_v2(response_key: [u8; 16], server_challenge: [u8; 8], blob: &[u8]) -> [u8; 16] {
    let mut mac = hmac_md5(&response_key);
    mac.update(&server_challenge);
    mac.update(blob);
    mac.finalize().into_bytes().into()
}

/// Checks an NTLMv2 proof in constant time.
pub fn verify_nt_proof_v2(response_key: [u8; 16], server_challenge: [u8; 8], blob: &[u8], proof: &[u8]) -> bool {
    let mut mac = hmac_md5(&response_key);
    mac.update(&server_challenge);
    mac.update(blob);
    mac.verify_slice(proof).is_ok()
}

/// Compares two byte strings without exiting early on the first difference.
pub fn constant_time_eq(a: &[u8], b: &[u8]) -> bool {
    if a.len() != b.len() {
        return false;
    }
    a.iter().zip(b).fold(0u8, |acc, (x, y)| acc | (x ^ y)) == 0
}


#[cfg(test)]
mod tests {
    use super::*;

    // test vectors from [MS-NLMP] section 4.2 (user "User", domain "Domain", password "Password")
    const SERVER_CHALLENGE: [u8; 8] = [0x01, 0x23, 0x45, 0x67, 0x89, 0xAB, 0xCD, 0xEF];

    #[test]
    fn ntowf_v1_vector() {
        assert_eq!(
            ntowf_v1("Password"),
            [0xA4, 0xF4, 0x9C, 0x40, 0x65, 0x10, 0xBD, 0xCA, 0xB6, 0x82, 0x4E, 0xE7, 0xC3, 0x0F, 0xD8, 0x52],
        );
    }

    #[test]
    fn ntowf_v2_vector() {
        assert_eq!(
            ntowf_v2("Password", "User", "Domain"),
            [0x0C, 0x86, 0x8A, 0x40, 0x3B, 0xFD, 0x7A, 0x93, 0xA3, 0x00, 0x1E, 0xF2, 0x2E, 0xF0, 0x2E, 0x3F],
        );
        // the username is case-insensitive, the domain is not
        assert_eq!(ntowf_v2("Password", "USER", "Domain"), ntowf_v2("Password", "user", "Domain"));
        assert_ne!(ntowf_v2("Password", "User", "Domain"), ntowf_v2("Password", "User", "DOMAIN"));
    }

    #[test]
    fn ntlm_v1_vector() {
        assert_eq!(
            ntlm_v1_response(ntowf_v1("Password"), SERVER_CHALLENGE),
            [
                0x67, 0xC4, 0x30, 0x11, 0xF3, 0x02, 0x98, 0xA2, 0xAD, 0x35, 0xEC, 0xE6,
                0x4F, 0x16, 0x33, 0x1C, 0x44, 0xBD, 0xBE, 0xD9, 0x27, 0x84, 0x1F, 0x94,
            ],
        );
    }

    #[test]
    fn extended_response_depends_on_client_challenge() {
        let nt_hash = ntowf_v1("Password");
        let a = ntlm_v1_extended_response(nt_hash, SERVER_CHALLENGE, [0xAA; 8]);
        let b = ntlm_v1_extended_response(nt_hash, SERVER_CHALLENGE, [0xBB; 8]);
        assert_ne!(a, b);
        assert_ne!(a, ntlm_v1_response(nt_hash, SERVER_CHALLENGE));
    }

    #[test]
    fn nt_proof_v2_verifies() {
        let key = ntowf_v2("Password", "User", "Domain");
        let blob = [0x01, 0x01, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0xAA, 0xBB];
        let proof = nt_proof_v2(key, SERVER_CHALLENGE, &blob);
        assert!(verify_nt_proof_v2(key, SERVER_CHALLENGE, &blob, &proof));
        assert!(!verify_nt_proof_v2(key, [0u8; 8], &blob, &proof));
        assert!(!verify_nt_proof_v2(key, SERVER_CHALLENGE, &blob[1..], &proof));
    }

    #[test]
    fn constant_time_comparison() {
        assert!(constant_time_eq(b"abc", b"abc"));
        assert!(!constant_time_eq(b"abc", b"abd"));
        assert!(!constant_time_eq(b"abc", b"ab"));
    }

    #[test]
    fn ntlm_time_is_after_2020() {
        // 2020-01-01T00:00:00Z
        assert!(get_ntlm_time() > 132_223_104_000_000_000);
    }
}
