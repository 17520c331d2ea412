//! DNSCrypt v2 protocol primitives.
//!
//! Shared between the upstream client and the server listener: the signed
//! certificate format, query/response sealing with X25519 plus
//! XSalsa20-Poly1305 or XChaCha20-Poly1305, ISO 7816-4 padding, and
//! `sdns://` stamp parsing.

use std::net::SocketAddr;
use std::time::{SystemTime, UNIX_EPOCH};

use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine;
use crypto_box::aead::Aead;
use crypto_box::{ChaChaBox, Nonce, PublicKey, SalsaBox, SecretKey};
use ed25519_dalek::{Signature, Signer, SigningKey, Verifier, VerifyingKey};
use rand::RngCore;

/// First bytes of every certificate TXT payload.
pub const CERT_MAGIC: [u8; 4] = *b"DNSC";

/// First bytes of every encrypted response.
pub const RESOLVER_MAGIC: [u8; 8] = *b"r6fnvWj8";

/// Queries are padded to a multiple of 64 with this floor, hiding their
/// length.
pub const MIN_QUERY_LEN: usize = 256;

const NONCE_LEN: usize = 24;
const HALF_NONCE_LEN: usize = 12;
const CERT_LEN: usize = 124;
const SIGNED_PORTION_OFFSET: usize = 72;

/// Errors from DNSCrypt encoding and crypto.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum DnsCryptError {
    #[error("malformed certificate: {0}")]
    BadCert(&'static str),

    #[error("certificate signature verification failed")]
    BadSignature,

    #[error("certificate is not currently valid")]
    CertExpired,

    #[error("malformed encrypted message: {0}")]
    BadMessage(&'static str),

    #[error("decryption failed")]
    DecryptFailed,

    #[error("malformed sdns stamp: {0}")]
    BadStamp(&'static str),
}

/// Encryption system negotiated through the certificate.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EsVersion {
    XSalsa20Poly1305,
    XChaCha20Poly1305,
}

impl EsVersion {
    fn from_u16(v: u16) -> Option<Self> {
        match v {
            1 => Some(Self::XSalsa20Poly1305),
            2 => Some(Self::XChaCha20Poly1305),
            _ => None,
        }
    }

    fn as_u16(self) -> u16 {
        match self {
            Self::XSalsa20Poly1305 => 1,
            Self::XChaCha20Poly1305 => 2,
        }
    }
}

/// A parsed resolver certificate.
#[derive(Debug, Clone)]
pub struct Cert {
    pub es_version: EsVersion,
    pub resolver_pk: [u8; 32],
    pub client_magic: [u8; 8],
    pub serial: u32,
    pub ts_start: u32,
    pub ts_end: u32,
}

impl Cert {
    /// Parse and signature-check a certificate TXT payload.
    pub fn parse(data: &[u8], provider_pk: &VerifyingKey) -> Result<Self, DnsCryptError> {
        if data.len() != CERT_LEN {
            return Err(DnsCryptError::BadCert("wrong length"));
        }
        if data[..4] != CERT_MAGIC {
            return Err(DnsCryptError::BadCert("wrong magic"));
        }
        let es_version = EsVersion::from_u16(u16::from_be_bytes([data[4], data[5]]))
            .ok_or(DnsCryptError::BadCert("unknown es-version"))?;

        let signature = Signature::from_slice(&data[8..72])
            .map_err(|_| DnsCryptError::BadCert("bad signature field"))?;
        provider_pk
            .verify(&data[SIGNED_PORTION_OFFSET..], &signature)
            .map_err(|_| DnsCryptError::BadSignature)?;

        let mut resolver_pk = [0u8; 32];
        resolver_pk.copy_from_slice(&data[72..104]);
        let mut client_magic = [0u8; 8];
        client_magic.copy_from_slice(&data[104..112]);

        Ok(Self {
            es_version,
            resolver_pk,
            client_magic,
            serial: u32::from_be_bytes(data[112..116].try_into().unwrap()),
            ts_start: u32::from_be_bytes(data[116..120].try_into().unwrap()),
            ts_end: u32::from_be_bytes(data[120..124].try_into().unwrap()),
        })
    }

    /// Whether the certificate covers the current time.
    pub fn is_valid_now(&self) -> bool {
        let now = unix_now();
        u64::from(self.ts_start) <= now && now <= u64::from(self.ts_end)
    }

    /// Serialize and sign a certificate (server side).
    pub fn build(
        es_version: EsVersion,
        resolver_pk: &[u8; 32],
        client_magic: &[u8; 8],
        serial: u32,
        ts_start: u32,
        ts_end: u32,
        signing_key: &SigningKey,
    ) -> Vec<u8> {
        let mut signed = Vec::with_capacity(52);
        signed.extend_from_slice(resolver_pk);
        signed.extend_from_slice(client_magic);
        signed.extend_from_slice(&serial.to_be_bytes());
        signed.extend_from_slice(&ts_start.to_be_bytes());
        signed.extend_from_slice(&ts_end.to_be_bytes());

        let signature = signing_key.sign(&signed);

        let mut out = Vec::with_capacity(CERT_LEN);
        out.extend_from_slice(&CERT_MAGIC);
        out.extend_from_slice(&es_version.as_u16().to_be_bytes());
        out.extend_from_slice(&0u16.to_be_bytes());
        out.extend_from_slice(&signature.to_bytes());
        out.extend_from_slice(&signed);
        out
    }
}

/// The precomputed shared box for one client/resolver key pair.
pub enum CipherBox {
    Salsa(Box<SalsaBox>),
    ChaCha(Box<ChaChaBox>),
}

impl CipherBox {
    pub fn new(es_version: EsVersion, peer_pk: &[u8; 32], secret: &SecretKey) -> Self {
        let peer = PublicKey::from(*peer_pk);
        match es_version {
            EsVersion::XSalsa20Poly1305 => Self::Salsa(Box::new(SalsaBox::new(&peer, secret))),
            EsVersion::XChaCha20Poly1305 => Self::ChaCha(Box::new(ChaChaBox::new(&peer, secret))),
        }
    }

    fn seal(&self, nonce: &[u8; NONCE_LEN], plaintext: &[u8]) -> Result<Vec<u8>, DnsCryptError> {
        let nonce = Nonce::from(*nonce);
        match self {
            Self::Salsa(b) => b.encrypt(&nonce, plaintext),
            Self::ChaCha(b) => b.encrypt(&nonce, plaintext),
        }
        .map_err(|_| DnsCryptError::DecryptFailed)
    }

    fn open(&self, nonce: &[u8; NONCE_LEN], ciphertext: &[u8]) -> Result<Vec<u8>, DnsCryptError> {
        let nonce = Nonce::from(*nonce);
        match self {
            Self::Salsa(b) => b.decrypt(&nonce, ciphertext),
            Self::ChaCha(b) => b.decrypt(&nonce, ciphertext),
        }
        .map_err(|_| DnsCryptError::DecryptFailed)
    }
}

/// Seal a client query: `client-magic || client-pk || half-nonce ||
/// box(padded query)`. Returns the message and the client half-nonce
/// needed to validate the response.
pub fn seal_query(
    cipher: &CipherBox,
    client_magic: &[u8; 8],
    client_pk: &PublicKey,
    query: &[u8],
) -> Result<(Vec<u8>, [u8; HALF_NONCE_LEN]), DnsCryptError> {
    let mut client_nonce = [0u8; HALF_NONCE_LEN];
    rand::thread_rng().fill_bytes(&mut client_nonce);
    let mut nonce = [0u8; NONCE_LEN];
    nonce[..HALF_NONCE_LEN].copy_from_slice(&client_nonce);

    let sealed = cipher.seal(&nonce, &pad(query))?;

    let mut out = Vec::with_capacity(8 + 32 + HALF_NONCE_LEN + sealed.len());
    out.extend_from_slice(client_magic);
    out.extend_from_slice(client_pk.as_bytes());
    out.extend_from_slice(&client_nonce);
    out.extend_from_slice(&sealed);
    Ok((out, client_nonce))
}

/// A client query after the server tore the envelope open.
pub struct OpenedQuery {
    pub client_pk: [u8; 32],
    pub client_nonce: [u8; HALF_NONCE_LEN],
    pub query: Vec<u8>,
}

/// Open a client query on the server.
pub fn open_query(
    es_version: EsVersion,
    server_secret: &SecretKey,
    client_magic: &[u8; 8],
    msg: &[u8],
) -> Result<OpenedQuery, DnsCryptError> {
    if msg.len() < 8 + 32 + HALF_NONCE_LEN + 16 {
        return Err(DnsCryptError::BadMessage("query too short"));
    }
    if msg[..8] != *client_magic {
        return Err(DnsCryptError::BadMessage("wrong client magic"));
    }

    let mut client_pk = [0u8; 32];
    client_pk.copy_from_slice(&msg[8..40]);
    let mut client_nonce = [0u8; HALF_NONCE_LEN];
    client_nonce.copy_from_slice(&msg[40..52]);
    let mut nonce = [0u8; NONCE_LEN];
    nonce[..HALF_NONCE_LEN].copy_from_slice(&client_nonce);

    let cipher = CipherBox::new(es_version, &client_pk, server_secret);
    let padded = cipher.open(&nonce, &msg[52..])?;

    Ok(OpenedQuery {
        client_pk,
        client_nonce,
        query: unpad(&padded)?,
    })
}

/// Seal a server response: `resolver-magic || nonce || box(padded
/// response)` where the nonce is the client half plus a fresh server
/// half.
pub fn seal_response(
    cipher: &CipherBox,
    client_nonce: &[u8; HALF_NONCE_LEN],
    response: &[u8],
) -> Result<Vec<u8>, DnsCryptError> {
    let mut nonce = [0u8; NONCE_LEN];
    nonce[..HALF_NONCE_LEN].copy_from_slice(client_nonce);
    rand::thread_rng().fill_bytes(&mut nonce[HALF_NONCE_LEN..]);

    let sealed = cipher.seal(&nonce, &pad(response))?;

    let mut out = Vec::with_capacity(8 + NONCE_LEN + sealed.len());
    out.extend_from_slice(&RESOLVER_MAGIC);
    out.extend_from_slice(&nonce);
    out.extend_from_slice(&sealed);
    Ok(out)
}

/// Open a server response on the client, checking the echoed half-nonce.
pub fn open_response(
    cipher: &CipherBox,
    client_nonce: &[u8; HALF_NONCE_LEN],
    msg: &[u8],
) -> Result<Vec<u8>, DnsCryptError> {
    if msg.len() < 8 + NONCE_LEN + 16 {
        return Err(DnsCryptError::BadMessage("response too short"));
    }
    if msg[..8] != RESOLVER_MAGIC {
        return Err(DnsCryptError::BadMessage("wrong resolver magic"));
    }
    let mut nonce = [0u8; NONCE_LEN];
    nonce.copy_from_slice(&msg[8..8 + NONCE_LEN]);
    if nonce[..HALF_NONCE_LEN] != *client_nonce {
        return Err(DnsCryptError::BadMessage("nonce mismatch"));
    }

    let padded = cipher.open(&nonce, &msg[8 + NONCE_LEN..])?;
    unpad(&padded)
}

/// ISO 7816-4 padding: 0x80 then zeros to a 64-byte boundary, with the
/// minimum-query floor.
fn pad(data: &[u8]) -> Vec<u8> {
    let target = (data.len() + 1).max(MIN_QUERY_LEN).div_ceil(64) * 64;
    let mut out = Vec::with_capacity(target);
    out.extend_from_slice(data);
    out.push(0x80);
    out.resize(target, 0);
    out
}

fn unpad(data: &[u8]) -> Result<Vec<u8>, DnsCryptError> {
    let end = data
        .iter()
        .rposition(|&b| b != 0)
        .ok_or(DnsCryptError::BadMessage("all-zero padding"))?;
    if data[end] != 0x80 {
        return Err(DnsCryptError::BadMessage("bad padding terminator"));
    }
    Ok(data[..end].to_vec())
}

/// The fields relaybox needs from a DNSCrypt `sdns://` stamp: resolver
/// address, provider name, and the provider's ed25519 public key.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DnsCryptStamp {
    pub addr: SocketAddr,
    pub provider_name: String,
    pub provider_pk: [u8; 32],
}

impl DnsCryptStamp {
    /// Parse an `sdns://` stamp of protocol type 0x01 (DNSCrypt).
    pub fn parse(stamp: &str) -> Result<Self, DnsCryptError> {
        let encoded = stamp
            .strip_prefix("sdns://")
            .ok_or(DnsCryptError::BadStamp("missing sdns:// prefix"))?;
        let data = URL_SAFE_NO_PAD
            .decode(encoded)
            .map_err(|_| DnsCryptError::BadStamp("invalid base64"))?;

        if data.first() != Some(&0x01) {
            return Err(DnsCryptError::BadStamp("not a dnscrypt stamp"));
        }
        // 8 bytes of properties follow the protocol id.
        let mut pos = 9;

        let addr_raw = read_lp(&data, &mut pos)?;
        let addr_str = std::str::from_utf8(addr_raw)
            .map_err(|_| DnsCryptError::BadStamp("address is not utf-8"))?;
        let addr: SocketAddr = if addr_str.contains(':') && !addr_str.contains('[') && addr_str.matches(':').count() > 1 {
            // Bare IPv6 without port.
            format!("[{addr_str}]:443").parse()
        } else if addr_str.parse::<std::net::IpAddr>().is_ok() {
            format!("{addr_str}:443").parse()
        } else {
            addr_str.parse()
        }
        .map_err(|_| DnsCryptError::BadStamp("unparsable address"))?;

        let pk_raw = read_lp(&data, &mut pos)?;
        let provider_pk: [u8; 32] = pk_raw
            .try_into()
            .map_err(|_| DnsCryptError::BadStamp("public key is not 32 bytes"))?;

        let name_raw = read_lp(&data, &mut pos)?;
        let provider_name = std::str::from_utf8(name_raw)
            .map_err(|_| DnsCryptError::BadStamp("provider name is not utf-8"))?
            .to_string();

        Ok(Self {
            addr,
            provider_name,
            provider_pk,
        })
    }

    /// Encode back to an `sdns://` stamp (used by tests and by servers
    /// printing their own stamp).
    pub fn encode(&self) -> String {
        let mut data = vec![0x01];
        data.extend_from_slice(&[0u8; 8]);
        let addr = self.addr.to_string();
        data.push(addr.len() as u8);
        data.extend_from_slice(addr.as_bytes());
        data.push(32);
        data.extend_from_slice(&self.provider_pk);
        data.push(self.provider_name.len() as u8);
        data.extend_from_slice(self.provider_name.as_bytes());
        format!("sdns://{}", URL_SAFE_NO_PAD.encode(data))
    }
}

fn read_lp<'a>(data: &'a [u8], pos: &mut usize) -> Result<&'a [u8], DnsCryptError> {
    let len = *data
        .get(*pos)
        .ok_or(DnsCryptError::BadStamp("truncated length"))? as usize;
    *pos += 1;
    let end = *pos + len;
    let slice = data
        .get(*pos..end)
        .ok_or(DnsCryptError::BadStamp("truncated field"))?;
    *pos = end;
    Ok(slice)
}

fn unix_now() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or(0)
}

/// Current unix time as u32, saturating far in the future.
pub fn unix_now_u32() -> u32 {
    unix_now().min(u64::from(u32::MAX)) as u32
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::Rng;

    fn keypair() -> (SecretKey, PublicKey) {
        let bytes: [u8; 32] = rand::thread_rng().gen();
        let secret = SecretKey::from(bytes);
        let public = secret.public_key();
        (secret, public)
    }

    #[test]
    fn should_round_trip_query_and_response() {
        for es in [EsVersion::XSalsa20Poly1305, EsVersion::XChaCha20Poly1305] {
            let (server_sk, server_pk) = keypair();
            let (client_sk, client_pk) = keypair();
            let client_magic = *b"rbx\0test";

            let client_cipher = CipherBox::new(es, server_pk.as_bytes(), &client_sk);
            let (wire, client_nonce) =
                seal_query(&client_cipher, &client_magic, &client_pk, b"hello query").unwrap();

            let opened = open_query(es, &server_sk, &client_magic, &wire).unwrap();
            assert_eq!(opened.query, b"hello query");
            assert_eq!(opened.client_nonce, client_nonce);

            let server_cipher = CipherBox::new(es, &opened.client_pk, &server_sk);
            let resp_wire =
                seal_response(&server_cipher, &opened.client_nonce, b"the answer").unwrap();

            let resp = open_response(&client_cipher, &client_nonce, &resp_wire).unwrap();
            assert_eq!(resp, b"the answer");
        }
    }

    #[test]
    fn should_reject_wrong_client_magic() {
        let (server_sk, server_pk) = keypair();
        let (client_sk, client_pk) = keypair();
        let cipher = CipherBox::new(EsVersion::XSalsa20Poly1305, server_pk.as_bytes(), &client_sk);
        let (wire, _) = seal_query(&cipher, b"goodmagc", &client_pk, b"q").unwrap();

        let err = open_query(EsVersion::XSalsa20Poly1305, &server_sk, b"badmagic", &wire);
        assert!(matches!(err, Err(DnsCryptError::BadMessage(_))));
    }

    #[test]
    fn should_reject_tampered_ciphertext() {
        let (server_sk, server_pk) = keypair();
        let (client_sk, client_pk) = keypair();
        let magic = *b"rbx\0test";
        let cipher = CipherBox::new(EsVersion::XSalsa20Poly1305, server_pk.as_bytes(), &client_sk);
        let (mut wire, _) = seal_query(&cipher, &magic, &client_pk, b"q").unwrap();
        let last = wire.len() - 1;
        wire[last] ^= 0xff;

        let err = open_query(EsVersion::XSalsa20Poly1305, &server_sk, &magic, &wire);
        assert!(matches!(err, Err(DnsCryptError::DecryptFailed)));
    }

    #[test]
    fn should_pad_to_min_query_length() {
        let padded = pad(b"short");
        assert_eq!(padded.len(), MIN_QUERY_LEN);
        assert_eq!(unpad(&padded).unwrap(), b"short");

        let long = vec![7u8; 300];
        let padded = pad(&long);
        assert_eq!(padded.len() % 64, 0);
        assert!(padded.len() > 300);
        assert_eq!(unpad(&padded).unwrap(), long);
    }

    #[test]
    fn should_build_and_verify_certificates() {
        let seed: [u8; 32] = rand::thread_rng().gen();
        let signing = SigningKey::from_bytes(&seed);
        let (server_sk, _) = keypair();
        let resolver_pk = *server_sk.public_key().as_bytes();
        let magic = *b"rbx\0cert";
        let now = unix_now_u32();

        let bytes = Cert::build(
            EsVersion::XChaCha20Poly1305,
            &resolver_pk,
            &magic,
            7,
            now - 60,
            now + 3600,
            &signing,
        );
        let cert = Cert::parse(&bytes, &signing.verifying_key()).unwrap();
        assert_eq!(cert.es_version, EsVersion::XChaCha20Poly1305);
        assert_eq!(cert.resolver_pk, resolver_pk);
        assert_eq!(cert.client_magic, magic);
        assert_eq!(cert.serial, 7);
        assert!(cert.is_valid_now());

        // A different verifying key must fail.
        let other = SigningKey::from_bytes(&rand::thread_rng().gen());
        assert!(matches!(
            Cert::parse(&bytes, &other.verifying_key()),
            Err(DnsCryptError::BadSignature)
        ));
    }

    #[test]
    fn should_round_trip_sdns_stamps() {
        let stamp = DnsCryptStamp {
            addr: "198.51.100.4:8443".parse().unwrap(),
            provider_name: "2.dnscrypt-cert.example.com".into(),
            provider_pk: [0xab; 32],
        };
        let encoded = stamp.encode();
        assert!(encoded.starts_with("sdns://"));
        assert_eq!(DnsCryptStamp::parse(&encoded).unwrap(), stamp);
    }

    #[test]
    fn should_reject_non_dnscrypt_stamps() {
        // Protocol 0x02 (DoH) stamp header.
        let data = URL_SAFE_NO_PAD.encode([0x02, 0, 0, 0, 0, 0, 0, 0, 0]);
        assert!(matches!(
            DnsCryptStamp::parse(&format!("sdns://{data}")),
            Err(DnsCryptError::BadStamp(_))
        ));
        assert!(DnsCryptStamp::parse("https://example.com").is_err());
    }
}
