//! Message stream encryption (MSE/PE): RC4 obfuscation negotiated with a
//! Diffie-Hellman exchange.
//!
//! Outgoing connections try the plaintext handshake first and fall back to
//! MSE when the peer hangs up; incoming connections are sniffed by their
//! first byte (19 means plaintext). Once [`initiate`] or [`accept`]
//! finishes, the returned [`CipherPair`] makes the stream byte-transparent
//! to the framing layer.

use num_bigint::BigUint;
use num_traits::Num;
use rand::Rng as _;
use sha1::{Digest, Sha1};
use thiserror::Error;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;

/// Verification constant: eight zero bytes inside the encrypted envelope.
const VC: [u8; 8] = [0u8; 8];
/// RC4 keystream bytes discarded on each direction before use.
const RC4_DISCARD: usize = 1024;
/// crypto field bit for RC4.
const CRYPTO_RC4: u32 = 0x02;
/// crypto field bit for plaintext.
const CRYPTO_PLAIN: u32 = 0x01;
/// Longest padding either side may insert (PadA/PadB/PadC/PadD).
const MAX_PAD: usize = 512;

/// Errors from the encrypted-handshake negotiation.
#[derive(Debug, Error)]
pub enum MseError {
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    /// The synchronization marker never appeared within the padding window.
    #[error("stream synchronization failed")]
    SyncFailed,

    /// Decrypted verification constant was not all zeros.
    #[error("verification constant mismatch")]
    VcMismatch,

    /// The initiator asked for a torrent we are not serving.
    #[error("unknown info hash")]
    UnknownInfoHash,

    /// Neither RC4 nor plaintext was mutually acceptable.
    #[error("no common crypto method")]
    NoCommonCrypto,

    /// A declared padding length exceeded the protocol bound.
    #[error("padding too long")]
    PadTooLong,
}

/// How the negotiated stream carries subsequent traffic.
pub enum MseOutcome {
    /// RC4 in both directions.
    Encrypted(CipherPair),
    /// The peer selected plaintext; the stream continues unwrapped.
    Plaintext,
}

/// Paired RC4 states for the two directions of one connection.
pub struct CipherPair {
    enc: Rc4,
    dec: Rc4,
}

impl CipherPair {
    /// Encrypts outgoing bytes in place.
    pub fn encrypt(&mut self, data: &mut [u8]) {
        self.enc.apply(data);
    }

    /// Decrypts incoming bytes in place.
    pub fn decrypt(&mut self, data: &mut [u8]) {
        self.dec.apply(data);
    }
}

/// Runs the initiator side of the MSE handshake.
///
/// `ia` is the initial payload carried inside the encrypted envelope; we
/// always put the 68-byte BitTorrent handshake there so the peer can reply
/// without another round trip. On success the peer's reply stream is
/// positioned right after its PadD.
pub async fn initiate(
    stream: &mut TcpStream,
    info_hash: &[u8; 20],
    ia: &[u8],
) -> Result<MseOutcome, MseError> {
    // Step 1: our public key, followed by random padding. Half the pad
    // budget is plenty for obfuscation and keeps the handshake short.
    let (private, public) = dh_keypair();
    let pad_len = rand::rng().random_range(0..=MAX_PAD / 2);
    let mut opening = Vec::with_capacity(96 + pad_len);
    opening.extend_from_slice(&to_fixed(&public, 96));
    let mut pad = vec![0u8; pad_len];
    rand::rng().fill(pad.as_mut_slice());
    opening.extend_from_slice(&pad);
    stream.write_all(&opening).await?;

    // Step 2: the peer's public key.
    let mut their_pub = [0u8; 96];
    stream.read_exact(&mut their_pub).await?;
    let shared = BigUint::from_bytes_be(&their_pub).modpow(&private, &dh_prime());
    let secret = to_fixed(&shared, 96);

    let req1 = sha1_cat(b"req1", &secret);
    let req2 = sha1_cat(b"req2", info_hash);
    let req3 = sha1_cat(b"req3", &secret);
    let xor: Vec<u8> = req2.iter().zip(req3.iter()).map(|(a, b)| a ^ b).collect();

    let (key_out, key_in) = derive_keys(&secret, info_hash);
    let mut enc = Rc4::new(&key_out);
    enc.discard(RC4_DISCARD);

    // Step 3: sync hashes in the clear, then the encrypted envelope:
    // VC, crypto_provide, len(PadC), PadC, len(IA), IA.
    let provide = CRYPTO_RC4 | CRYPTO_PLAIN;
    let mut envelope = Vec::with_capacity(8 + 4 + 2 + 2 + ia.len());
    envelope.extend_from_slice(&VC);
    envelope.extend_from_slice(&provide.to_be_bytes());
    envelope.extend_from_slice(&0u16.to_be_bytes());
    envelope.extend_from_slice(&(ia.len() as u16).to_be_bytes());
    envelope.extend_from_slice(ia);
    enc.apply(&mut envelope);

    let mut step3 = Vec::with_capacity(20 + 20 + envelope.len());
    step3.extend_from_slice(&req1);
    step3.extend_from_slice(&xor);
    step3.extend_from_slice(&envelope);
    stream.write_all(&step3).await?;

    // Step 4: hunt for the encrypted VC through the peer's PadB. The
    // pattern is what VC looks like after their keystream, which we can
    // precompute.
    let mut vc_pattern = VC;
    {
        let mut preview = Rc4::new(&key_in);
        preview.discard(RC4_DISCARD);
        preview.apply(&mut vc_pattern);
    }
    scan_for(stream, &vc_pattern, MAX_PAD + 8).await?;

    let mut dec = Rc4::new(&key_in);
    dec.discard(RC4_DISCARD + 8);

    // crypto_select and PadD length.
    let mut header = [0u8; 6];
    stream.read_exact(&mut header).await?;
    dec.apply(&mut header);
    let select = u32::from_be_bytes([header[0], header[1], header[2], header[3]]);
    let pad_d = u16::from_be_bytes([header[4], header[5]]) as usize;
    if pad_d > MAX_PAD {
        return Err(MseError::PadTooLong);
    }
    if pad_d > 0 {
        let mut pad = vec![0u8; pad_d];
        stream.read_exact(&mut pad).await?;
        dec.apply(&mut pad);
    }

    if select & CRYPTO_RC4 != 0 {
        Ok(MseOutcome::Encrypted(CipherPair { enc, dec }))
    } else if select & CRYPTO_PLAIN != 0 {
        Ok(MseOutcome::Plaintext)
    } else {
        Err(MseError::NoCommonCrypto)
    }
}

/// Runs the receiver side of the MSE handshake.
///
/// `first_byte` was already consumed by the caller to tell MSE from a
/// plaintext handshake. Returns the negotiated outcome plus the initiator's
/// initial payload, which carries its BitTorrent handshake.
pub async fn accept(
    stream: &mut TcpStream,
    info_hash: &[u8; 20],
    first_byte: u8,
) -> Result<(MseOutcome, Vec<u8>), MseError> {
    // The peer's public key, first byte already in hand.
    let mut their_pub = [0u8; 96];
    their_pub[0] = first_byte;
    stream.read_exact(&mut their_pub[1..]).await?;

    let (private, public) = dh_keypair();
    stream.write_all(&to_fixed(&public, 96)).await?;

    let shared = BigUint::from_bytes_be(&their_pub).modpow(&private, &dh_prime());
    let secret = to_fixed(&shared, 96);

    // Resynchronize on HASH('req1', S), skipping the initiator's PadA.
    let req1 = sha1_cat(b"req1", &secret);
    scan_for(stream, &req1, MAX_PAD + 20).await?;

    // The obfuscated info hash must match the torrent we serve.
    let mut xor = [0u8; 20];
    stream.read_exact(&mut xor).await?;
    let req3 = sha1_cat(b"req3", &secret);
    let req2: Vec<u8> = xor.iter().zip(req3.iter()).map(|(a, b)| a ^ b).collect();
    if req2 != sha1_cat(b"req2", info_hash) {
        return Err(MseError::UnknownInfoHash);
    }

    // Initiator encrypts with keyA; we decrypt with it and answer with keyB.
    let (key_their, key_ours) = derive_keys(&secret, info_hash);
    let mut dec = Rc4::new(&key_their);
    dec.discard(RC4_DISCARD);

    let mut header = [0u8; 14];
    stream.read_exact(&mut header).await?;
    dec.apply(&mut header);
    if header[..8] != VC {
        return Err(MseError::VcMismatch);
    }
    let provide = u32::from_be_bytes([header[8], header[9], header[10], header[11]]);
    let pad_c = u16::from_be_bytes([header[12], header[13]]) as usize;
    if pad_c > MAX_PAD {
        return Err(MseError::PadTooLong);
    }
    if pad_c > 0 {
        let mut pad = vec![0u8; pad_c];
        stream.read_exact(&mut pad).await?;
        dec.apply(&mut pad);
    }

    let mut ia_len = [0u8; 2];
    stream.read_exact(&mut ia_len).await?;
    dec.apply(&mut ia_len);
    let mut ia = vec![0u8; u16::from_be_bytes(ia_len) as usize];
    if !ia.is_empty() {
        stream.read_exact(&mut ia).await?;
        dec.apply(&mut ia);
    }

    let select = if provide & CRYPTO_RC4 != 0 {
        CRYPTO_RC4
    } else if provide & CRYPTO_PLAIN != 0 {
        CRYPTO_PLAIN
    } else {
        return Err(MseError::NoCommonCrypto);
    };

    let mut enc = Rc4::new(&key_ours);
    enc.discard(RC4_DISCARD);
    let mut reply = Vec::with_capacity(14);
    reply.extend_from_slice(&VC);
    reply.extend_from_slice(&select.to_be_bytes());
    reply.extend_from_slice(&0u16.to_be_bytes());
    enc.apply(&mut reply);
    stream.write_all(&reply).await?;

    let outcome = if select == CRYPTO_RC4 {
        MseOutcome::Encrypted(CipherPair { enc, dec })
    } else {
        MseOutcome::Plaintext
    };
    Ok((outcome, ia))
}

/// Reads byte-by-byte until `pattern` has streamed past, or fails after
/// `budget` bytes. Byte-wise reads keep us from consuming anything beyond
/// the marker.
async fn scan_for(stream: &mut TcpStream, pattern: &[u8], budget: usize) -> Result<(), MseError> {
    let mut window = Vec::with_capacity(pattern.len());
    for _ in 0..budget {
        let mut byte = [0u8; 1];
        stream.read_exact(&mut byte).await?;
        window.push(byte[0]);
        if window.len() > pattern.len() {
            window.remove(0);
        }
        if window == pattern {
            return Ok(());
        }
    }
    Err(MseError::SyncFailed)
}

fn sha1_cat(prefix: &[u8], data: &[u8]) -> [u8; 20] {
    let mut hasher = Sha1::new();
    hasher.update(prefix);
    hasher.update(data);
    hasher.finalize().into()
}

/// keyA/keyB derivation; returns (initiator's key, receiver's key).
fn derive_keys(secret: &[u8], info_hash: &[u8; 20]) -> ([u8; 20], [u8; 20]) {
    let mut joined = Vec::with_capacity(secret.len() + 20);
    joined.extend_from_slice(secret);
    joined.extend_from_slice(info_hash);
    (sha1_cat(b"keyA", &joined), sha1_cat(b"keyB", &joined))
}

fn dh_keypair() -> (BigUint, BigUint) {
    let mut exponent = [0u8; 20];
    rand::rng().fill(&mut exponent);
    let private = BigUint::from_bytes_be(&exponent);
    let public = BigUint::from(2u8).modpow(&private, &dh_prime());
    (private, public)
}

/// The fixed 768-bit MSE prime, generator 2.
fn dh_prime() -> BigUint {
    const HEX: &str = "FFFFFFFFFFFFFFFFC90FDAA22168C234C4C6628B80DC1CD1\
                       29024E088A67CC74020BBEA63B139B22514A08798E3404DD\
                       EF9519B3CD3A431B302B0A6DF25F14374FE1356D6D51C245\
                       E485B576625E7EC6F44C42E9A63A3620FFFFFFFFFFFFFFFF";
    BigUint::from_str_radix(HEX, 16).expect("prime literal parses")
}

fn to_fixed(value: &BigUint, len: usize) -> Vec<u8> {
    let bytes = value.to_bytes_be();
    if bytes.len() >= len {
        bytes[bytes.len() - len..].to_vec()
    } else {
        let mut out = vec![0u8; len - bytes.len()];
        out.extend_from_slice(&bytes);
        out
    }
}

/// RC4 stream cipher state.
pub struct Rc4 {
    s: [u8; 256],
    i: u8,
    j: u8,
}

impl Rc4 {
    pub fn new(key: &[u8]) -> Self {
        let mut s = [0u8; 256];
        for (i, slot) in s.iter_mut().enumerate() {
            *slot = i as u8;
        }
        let mut j = 0u8;
        for i in 0..256usize {
            j = j.wrapping_add(s[i]).wrapping_add(key[i % key.len()]);
            s.swap(i, j as usize);
        }
        Self { s, i: 0, j: 0 }
    }

    /// XORs the keystream over `data` in place; the same call both
    /// encrypts and decrypts.
    pub fn apply(&mut self, data: &mut [u8]) {
        for byte in data {
            self.i = self.i.wrapping_add(1);
            self.j = self.j.wrapping_add(self.s[self.i as usize]);
            self.s.swap(self.i as usize, self.j as usize);
            let k = self.s[self.s[self.i as usize].wrapping_add(self.s[self.j as usize]) as usize];
            *byte ^= k;
        }
    }

    pub fn discard(&mut self, count: usize) {
        let mut sink = vec![0u8; count];
        self.apply(&mut sink);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::net::TcpListener;

    #[test]
    fn test_rc4_roundtrip() {
        let mut enc = Rc4::new(b"Key");
        let mut dec = Rc4::new(b"Key");
        let mut data = b"Plaintext".to_vec();
        enc.apply(&mut data);
        assert_ne!(data, b"Plaintext");
        dec.apply(&mut data);
        assert_eq!(data, b"Plaintext");
    }

    #[test]
    fn test_rc4_known_vector() {
        // RFC 6229-adjacent classic test vector.
        let mut rc4 = Rc4::new(b"Key");
        let mut data = b"Plaintext".to_vec();
        rc4.apply(&mut data);
        assert_eq!(data, [0xBB, 0xF3, 0x16, 0xE8, 0xD9, 0x40, 0xAF, 0x0A, 0xD3]);
    }

    #[test]
    fn test_key_derivation_symmetry() {
        let secret = [7u8; 96];
        let info_hash = [3u8; 20];
        let (a1, b1) = derive_keys(&secret, &info_hash);
        let (a2, b2) = derive_keys(&secret, &info_hash);
        assert_eq!(a1, a2);
        assert_eq!(b1, b2);
        assert_ne!(a1, b1);
    }

    #[test]
    fn test_to_fixed_pads_and_truncates() {
        let v = BigUint::from(0x0102u32);
        assert_eq!(to_fixed(&v, 4), vec![0, 0, 1, 2]);
        assert_eq!(to_fixed(&v, 1), vec![2]);
    }

    #[tokio::test]
    async fn test_full_handshake_over_loopback() {
        let info_hash = [5u8; 20];
        let ia = b"initial-payload".to_vec();
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();

        let server_ia = ia.clone();
        let server = tokio::spawn(async move {
            let (mut stream, _) = listener.accept().await.unwrap();
            let mut first = [0u8; 1];
            stream.read_exact(&mut first).await.unwrap();
            let (outcome, got_ia) = accept(&mut stream, &info_hash, first[0]).await.unwrap();
            assert_eq!(got_ia, server_ia);
            let mut ciphers = match outcome {
                MseOutcome::Encrypted(c) => c,
                MseOutcome::Plaintext => panic!("expected rc4"),
            };

            let mut hello = b"pong".to_vec();
            ciphers.encrypt(&mut hello);
            stream.write_all(&hello).await.unwrap();

            let mut inbound = [0u8; 4];
            stream.read_exact(&mut inbound).await.unwrap();
            ciphers.decrypt(&mut inbound);
            assert_eq!(&inbound, b"ping");
        });

        let mut client = TcpStream::connect(addr).await.unwrap();
        let outcome = initiate(&mut client, &info_hash, &ia).await.unwrap();
        let mut ciphers = match outcome {
            MseOutcome::Encrypted(c) => c,
            MseOutcome::Plaintext => panic!("expected rc4"),
        };

        let mut inbound = [0u8; 4];
        client.read_exact(&mut inbound).await.unwrap();
        ciphers.decrypt(&mut inbound);
        assert_eq!(&inbound, b"pong");

        let mut outbound = b"ping".to_vec();
        ciphers.encrypt(&mut outbound);
        client.write_all(&outbound).await.unwrap();

        server.await.unwrap();
    }

    #[tokio::test]
    async fn test_accept_rejects_unknown_info_hash() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();

        let server = tokio::spawn(async move {
            let (mut stream, _) = listener.accept().await.unwrap();
            let mut first = [0u8; 1];
            stream.read_exact(&mut first).await.unwrap();
            accept(&mut stream, &[1u8; 20], first[0]).await
        });

        let mut client = TcpStream::connect(addr).await.unwrap();
        // Initiator handshakes for a different torrent.
        let _ = initiate(&mut client, &[2u8; 20], b"").await;

        match server.await.unwrap() {
            Err(MseError::UnknownInfoHash) => {}
            other => panic!("expected unknown info hash, got {:?}", other.is_ok()),
        }
    }
}
