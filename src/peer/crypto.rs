//! Message Stream Encryption primitives: the fixed-group Diffie–Hellman
//! key exchange, RC4 stream ciphers with the mandated 1024 byte drop, and
//! the SHA-1 constructions the obfuscated handshake is built from.
//!
//! RC4 and SHA-1 are mandated by the MSE wire protocol; replacing them with
//! anything modern would break compatibility with every other client.

use num_bigint::BigUint;
use rand::Rng;
use sha1::{Digest, Sha1};

use crate::Sha1Hash;

/// DH public keys and the shared secret are exchanged as 96 byte (768 bit)
/// big-endian integers.
pub(crate) const DH_KEY_LEN: usize = 96;

/// The verification constant an initiator encrypts to prove key agreement.
pub(crate) const VC: [u8; 8] = [0; 8];

/// crypto_provide / crypto_select bit: plaintext payload.
pub(crate) const CRYPTO_PLAINTEXT: u32 = 0x01;
/// crypto_provide / crypto_select bit: RC4 payload.
pub(crate) const CRYPTO_RC4: u32 = 0x02;

/// The most pad bytes either side may send in the obfuscated handshake,
/// and therefore how far a sync scan has to look.
pub(crate) const MAX_PAD_LEN: usize = 512;

/// The number of RC4 keystream bytes both sides discard before touching
/// payload.
const RC4_DROP: usize = 1024;

/// The fixed 768 bit MSE prime; the generator is 2.
const DH_PRIME: [u8; DH_KEY_LEN] = [
    0xff, 0xff, 0xff, 0xff, 0xff, 0xff, 0xff, 0xff, 0xc9, 0x0f, 0xda, 0xa2,
    0x21, 0x68, 0xc2, 0x34, 0xc4, 0xc6, 0x62, 0x8b, 0x80, 0xdc, 0x1c, 0xd1,
    0x29, 0x02, 0x4e, 0x08, 0x8a, 0x67, 0xcc, 0x74, 0x02, 0x0b, 0xbe, 0xa6,
    0x3b, 0x13, 0x9b, 0x22, 0x51, 0x4a, 0x08, 0x79, 0x8e, 0x34, 0x04, 0xdd,
    0xef, 0x95, 0x19, 0xb3, 0xcd, 0x3a, 0x43, 0x1b, 0x30, 0x2b, 0x0a, 0x6d,
    0xf2, 0x5f, 0x14, 0x37, 0x4f, 0xe1, 0x35, 0x6d, 0x6d, 0x51, 0xc2, 0x45,
    0xe4, 0x85, 0xb5, 0x76, 0x62, 0x5e, 0x7e, 0xc6, 0xf4, 0x4c, 0x42, 0xe9,
    0xa6, 0x3a, 0x36, 0x21, 0x00, 0x00, 0x00, 0x00, 0x00, 0x09, 0x05, 0x63,
];

/// One side's half of the Diffie–Hellman exchange.
pub(crate) struct DhKeyExchange {
    private_key: BigUint,
    public_key: [u8; DH_KEY_LEN],
}

impl DhKeyExchange {
    /// Generates a fresh random key pair.
    pub fn new(rng: &mut impl Rng) -> Self {
        let mut secret = [0u8; DH_KEY_LEN];
        rng.fill(&mut secret[..]);
        let private_key = BigUint::from_bytes_be(&secret);
        let prime = BigUint::from_bytes_be(&DH_PRIME);
        let public =
            BigUint::from(2u32).modpow(&private_key, &prime);
        Self {
            private_key,
            public_key: export_key(&public),
        }
    }

    /// Our public key, as sent on the wire.
    pub fn public_key(&self) -> &[u8; DH_KEY_LEN] {
        &self.public_key
    }

    /// Computes the shared secret from the remote public key.
    pub fn compute_secret(&self, remote_key: &[u8]) -> [u8; DH_KEY_LEN] {
        debug_assert_eq!(remote_key.len(), DH_KEY_LEN);
        let prime = BigUint::from_bytes_be(&DH_PRIME);
        let remote = BigUint::from_bytes_be(remote_key);
        export_key(&remote.modpow(&self.private_key, &prime))
    }
}

/// Serializes a DH value as a fixed-width big-endian integer.
fn export_key(key: &BigUint) -> [u8; DH_KEY_LEN] {
    let bytes = key.to_bytes_be();
    debug_assert!(bytes.len() <= DH_KEY_LEN);
    let mut out = [0; DH_KEY_LEN];
    out[DH_KEY_LEN - bytes.len()..].copy_from_slice(&bytes);
    out
}

/// Plain RC4, as the protocol demands.
#[derive(Clone)]
pub(crate) struct Rc4 {
    s: [u8; 256],
    i: u8,
    j: u8,
}

impl Rc4 {
    pub fn new(key: &[u8]) -> Self {
        debug_assert!(!key.is_empty());
        let mut s = [0u8; 256];
        for (i, b) in s.iter_mut().enumerate() {
            *b = i as u8;
        }
        let mut j = 0u8;
        for i in 0..256 {
            j = j
                .wrapping_add(s[i])
                .wrapping_add(key[i % key.len()]);
            s.swap(i, j as usize);
        }
        Self { s, i: 0, j: 0 }
    }

    /// Encrypts or decrypts (the cipher is symmetric) in place.
    pub fn apply_keystream(&mut self, data: &mut [u8]) {
        for b in data.iter_mut() {
            self.i = self.i.wrapping_add(1);
            self.j = self.j.wrapping_add(self.s[self.i as usize]);
            self.s.swap(self.i as usize, self.j as usize);
            let k = self.s[(self.s[self.i as usize]
                .wrapping_add(self.s[self.j as usize]))
                as usize];
            *b ^= k;
        }
    }

    fn drop_keystream(&mut self, n: usize) {
        let mut scratch = [0u8; 64];
        let mut remaining = n;
        while remaining > 0 {
            let chunk = remaining.min(scratch.len());
            self.apply_keystream(&mut scratch[..chunk]);
            remaining -= chunk;
        }
    }
}

/// The two directions' stream ciphers, ready for payload (the initial
/// keystream already dropped).
pub(crate) struct Rc4Pair {
    /// Encrypts what we send.
    pub outgoing: Rc4,
    /// Decrypts what the peer sent.
    pub incoming: Rc4,
}

/// Derives the RC4 keys from the DH secret and the torrent's info hash.
///
/// The outgoing side of a connection encrypts with SHA1('keyA', S, SKEY)
/// and decrypts with SHA1('keyB', S, SKEY); an incoming connection
/// mirrors the two.
pub(crate) fn rc4_pair(
    secret: &[u8; DH_KEY_LEN],
    info_hash: &Sha1Hash,
    outgoing: bool,
) -> Rc4Pair {
    let derive = |label: &[u8]| -> Sha1Hash {
        let mut h = Sha1::new();
        h.update(label);
        h.update(&secret[..]);
        h.update(info_hash);
        h.finalize().into()
    };
    let key_a = derive(b"keyA");
    let key_b = derive(b"keyB");
    let (local_key, remote_key) =
        if outgoing { (key_a, key_b) } else { (key_b, key_a) };

    let mut pair = Rc4Pair {
        outgoing: Rc4::new(&local_key),
        incoming: Rc4::new(&remote_key),
    };
    pair.outgoing.drop_keystream(RC4_DROP);
    pair.incoming.drop_keystream(RC4_DROP);
    pair
}

/// SHA1('req1', S): the constant the responder syncs on.
pub(crate) fn req1_hash(secret: &[u8; DH_KEY_LEN]) -> Sha1Hash {
    let mut h = Sha1::new();
    h.update(b"req1");
    h.update(&secret[..]);
    h.finalize().into()
}

/// SHA1('req2', SKEY) xor SHA1('req3', S): the obfuscated info hash the
/// initiator identifies the torrent with.
pub(crate) fn obfuscated_info_hash(
    info_hash: &Sha1Hash,
    secret: &[u8; DH_KEY_LEN],
) -> Sha1Hash {
    let mut h = Sha1::new();
    h.update(b"req2");
    h.update(info_hash);
    let req2: Sha1Hash = h.finalize().into();

    let mut h = Sha1::new();
    h.update(b"req3");
    h.update(&secret[..]);
    let req3: Sha1Hash = h.finalize().into();

    let mut out = [0; 20];
    for (i, b) in out.iter_mut().enumerate() {
        *b = req2[i] ^ req3[i];
    }
    out
}

/// SHA1('req3', S), needed by the responder to strip the obfuscation.
pub(crate) fn req3_hash(secret: &[u8; DH_KEY_LEN]) -> Sha1Hash {
    let mut h = Sha1::new();
    h.update(b"req3");
    h.update(&secret[..]);
    h.finalize().into()
}

/// Picks the payload encryption from the initiator's `crypto_provide`
/// bitfield, honoring our allowed level and the RC4 preference. `None`
/// means no overlap and the connection must fail.
pub(crate) fn select_crypto(
    provided: u32,
    allowed: crate::conf::EncLevel,
    prefer_rc4: bool,
) -> Option<u32> {
    use crate::conf::EncLevel;
    let allowed_mask = match allowed {
        EncLevel::Plaintext => CRYPTO_PLAINTEXT,
        EncLevel::Rc4 => CRYPTO_RC4,
        EncLevel::Both => CRYPTO_PLAINTEXT | CRYPTO_RC4,
    };
    let overlap = provided & allowed_mask;
    if overlap == 0 {
        None
    } else if overlap == (CRYPTO_PLAINTEXT | CRYPTO_RC4) {
        Some(if prefer_rc4 { CRYPTO_RC4 } else { CRYPTO_PLAINTEXT })
    } else {
        Some(overlap)
    }
}

/// Finds `needle` in `haystack`, for syncing on the req1 hash or the
/// decrypted verification constant.
pub(crate) fn find(haystack: &[u8], needle: &[u8]) -> Option<usize> {
    if haystack.len() < needle.len() {
        return None;
    }
    haystack
        .windows(needle.len())
        .position(|window| window == needle)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::conf::EncLevel;

    #[test]
    fn test_rc4_known_vector() {
        // the classic "Key"/"Plaintext" vector
        let mut rc4 = Rc4::new(b"Key");
        let mut data = *b"Plaintext";
        rc4.apply_keystream(&mut data);
        assert_eq!(
            data,
            [0xbb, 0xf3, 0x16, 0xe8, 0xd9, 0x40, 0xaf, 0x0a, 0xd3]
        );
    }

    #[test]
    fn test_dh_exchange_agrees() {
        let mut rng = rand::thread_rng();
        let a = DhKeyExchange::new(&mut rng);
        let b = DhKeyExchange::new(&mut rng);

        let secret_a = a.compute_secret(b.public_key());
        let secret_b = b.compute_secret(a.public_key());
        assert_eq!(secret_a[..], secret_b[..]);
    }

    #[test]
    fn test_rc4_pair_is_mirrored() {
        let secret = [0x5a; DH_KEY_LEN];
        let info_hash = [0x11; 20];
        let mut initiator = rc4_pair(&secret, &info_hash, true);
        let mut responder = rc4_pair(&secret, &info_hash, false);

        let mut data = *b"a block of payload bytes";
        initiator.outgoing.apply_keystream(&mut data);
        assert_ne!(&data, b"a block of payload bytes");
        responder.incoming.apply_keystream(&mut data);
        assert_eq!(&data, b"a block of payload bytes");

        let mut reply = *b"and the reply direction";
        responder.outgoing.apply_keystream(&mut reply);
        initiator.incoming.apply_keystream(&mut reply);
        assert_eq!(&reply, b"and the reply direction");
    }

    #[test]
    fn test_obfuscated_info_hash_is_reversible() {
        let secret = [0x42; DH_KEY_LEN];
        let info_hash = [0x77; 20];
        let obfuscated = obfuscated_info_hash(&info_hash, &secret);
        let req3 = req3_hash(&secret);

        // the responder xors req3 back out and gets SHA1('req2', SKEY),
        // which it can compare against each of its torrents
        let mut recovered = [0; 20];
        for i in 0..20 {
            recovered[i] = obfuscated[i] ^ req3[i];
        }
        let mut h = Sha1::new();
        h.update(b"req2");
        h.update(&info_hash);
        let expected: Sha1Hash = h.finalize().into();
        assert_eq!(recovered, expected);
    }

    #[test]
    fn test_select_crypto() {
        let both = CRYPTO_PLAINTEXT | CRYPTO_RC4;
        assert_eq!(
            select_crypto(both, EncLevel::Both, false),
            Some(CRYPTO_PLAINTEXT)
        );
        assert_eq!(
            select_crypto(both, EncLevel::Both, true),
            Some(CRYPTO_RC4)
        );
        assert_eq!(
            select_crypto(both, EncLevel::Rc4, false),
            Some(CRYPTO_RC4)
        );
        assert_eq!(
            select_crypto(CRYPTO_PLAINTEXT, EncLevel::Rc4, true),
            None
        );
        assert_eq!(
            select_crypto(CRYPTO_RC4, EncLevel::Plaintext, false),
            None
        );
    }

    #[test]
    fn test_find() {
        assert_eq!(find(b"xxabcyy", b"abc"), Some(2));
        assert_eq!(find(b"xxabcyy", b"abz"), None);
        assert_eq!(find(b"ab", b"abc"), None);
    }
}
