//! SRTP packet protection (RFC 3711).
//!
//! Implements the two AES-CM/HMAC-SHA1 crypto suites hosts negotiate for
//! this pipeline. The crypto suite name and base64 master key arrive
//! verbatim from the host; session keys are derived here.

use aes::cipher::{KeyIvInit, StreamCipher};
use aes::Aes128;
use base64::{engine::general_purpose::STANDARD as BASE64, Engine};
use ctr::Ctr128BE;
use hmac::{Hmac, Mac};
use sha1::Sha1;

use super::packet::RtpHeader;
use crate::error::{Error, Result};

type Aes128Ctr = Ctr128BE<Aes128>;
type HmacSha1 = Hmac<Sha1>;

/// Master key length for the AES_CM_128 suites.
pub const SRTP_MASTER_KEY_LEN: usize = 16;

/// Master salt length.
pub const SRTP_MASTER_SALT_LEN: usize = 14;

const SESSION_AUTH_KEY_LEN: usize = 20;

// Key derivation labels (RFC 3711 §4.3.1).
const LABEL_RTP_ENCRYPTION: u8 = 0x00;
const LABEL_RTP_AUTH: u8 = 0x01;
const LABEL_RTP_SALT: u8 = 0x02;

/// Supported SRTP crypto suites.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CryptoSuite {
    AesCm128HmacSha1_80,
    AesCm128HmacSha1_32,
}

impl CryptoSuite {
    /// Resolves a suite from its SDES name.
    pub fn from_name(name: &str) -> Option<Self> {
        match name {
            "AES_CM_128_HMAC_SHA1_80" => Some(Self::AesCm128HmacSha1_80),
            "AES_CM_128_HMAC_SHA1_32" => Some(Self::AesCm128HmacSha1_32),
            _ => None,
        }
    }

    /// Authentication tag length in bytes.
    pub fn tag_len(self) -> usize {
        match self {
            Self::AesCm128HmacSha1_80 => 10,
            Self::AesCm128HmacSha1_32 => 4,
        }
    }
}

/// Outbound SRTP protection context for one stream.
pub struct SrtpContext {
    session_key: [u8; SRTP_MASTER_KEY_LEN],
    session_salt: [u8; SRTP_MASTER_SALT_LEN],
    auth_key: [u8; SESSION_AUTH_KEY_LEN],
    tag_len: usize,
    rollover_count: u32,
    last_seq: Option<u16>,
}

impl SrtpContext {
    /// Creates a context from a suite name and the base64 concatenation of
    /// master key and master salt (30 bytes decoded).
    pub fn from_base64(suite_name: &str, key_base64: &str) -> Result<Self> {
        let suite = CryptoSuite::from_name(suite_name)
            .ok_or_else(|| Error::Srtp(format!("unsupported crypto suite '{}'", suite_name)))?;
        let material = BASE64
            .decode(key_base64.trim())
            .map_err(|e| Error::Srtp(format!("invalid key base64: {}", e)))?;
        Self::new(suite, &material)
    }

    /// Creates a context from raw master key material (key then salt).
    pub fn new(suite: CryptoSuite, master: &[u8]) -> Result<Self> {
        if master.len() != SRTP_MASTER_KEY_LEN + SRTP_MASTER_SALT_LEN {
            return Err(Error::Srtp(format!(
                "master key material must be {} bytes, got {}",
                SRTP_MASTER_KEY_LEN + SRTP_MASTER_SALT_LEN,
                master.len()
            )));
        }

        let master_key: [u8; SRTP_MASTER_KEY_LEN] =
            master[..SRTP_MASTER_KEY_LEN].try_into().unwrap();
        let master_salt: [u8; SRTP_MASTER_SALT_LEN] =
            master[SRTP_MASTER_KEY_LEN..].try_into().unwrap();

        let mut session_key = [0u8; SRTP_MASTER_KEY_LEN];
        let mut auth_key = [0u8; SESSION_AUTH_KEY_LEN];
        let mut session_salt = [0u8; SRTP_MASTER_SALT_LEN];
        derive_key(&master_key, &master_salt, LABEL_RTP_ENCRYPTION, &mut session_key);
        derive_key(&master_key, &master_salt, LABEL_RTP_AUTH, &mut auth_key);
        derive_key(&master_key, &master_salt, LABEL_RTP_SALT, &mut session_salt);

        Ok(Self {
            session_key,
            session_salt,
            auth_key,
            tag_len: suite.tag_len(),
            rollover_count: 0,
            last_seq: None,
        })
    }

    /// Authentication tag length for the negotiated suite.
    pub fn tag_len(&self) -> usize {
        self.tag_len
    }

    /// Encrypts the packet payload in place and appends the authentication
    /// tag. `packet` must hold a complete RTP packet.
    pub fn protect(&mut self, packet: &mut Vec<u8>) -> Result<()> {
        let (header, payload_offset) = RtpHeader::parse(packet)
            .ok_or_else(|| Error::Srtp("cannot protect malformed rtp packet".into()))?;

        let seq = header.sequence_number;
        if let Some(last) = self.last_seq {
            if seq < last && last - seq > 0x8000 {
                self.rollover_count = self.rollover_count.wrapping_add(1);
            }
        }
        self.last_seq = Some(seq);
        let index = ((self.rollover_count as u64) << 16) | seq as u64;

        // IV = (salt << 16) XOR (ssrc << 64) XOR (index << 16)
        let mut iv = [0u8; 16];
        iv[..SRTP_MASTER_SALT_LEN].copy_from_slice(&self.session_salt);
        for (i, b) in header.ssrc.to_be_bytes().iter().enumerate() {
            iv[4 + i] ^= b;
        }
        for (i, b) in index.to_be_bytes()[2..].iter().enumerate() {
            iv[8 + i] ^= b;
        }

        let mut cipher = Aes128Ctr::new(&self.session_key.into(), &iv.into());
        cipher.apply_keystream(&mut packet[payload_offset..]);

        // Tag over the protected packet plus the rollover counter.
        let mut mac = HmacSha1::new_from_slice(&self.auth_key)
            .map_err(|e| Error::Srtp(format!("hmac init failed: {}", e)))?;
        mac.update(packet);
        mac.update(&self.rollover_count.to_be_bytes());
        let tag = mac.finalize().into_bytes();
        packet.extend_from_slice(&tag[..self.tag_len]);

        Ok(())
    }
}

/// AES-CM key derivation (RFC 3711 §4.3): the session key for `label` is
/// the AES-CTR keystream under the master key with IV
/// `(master_salt XOR label·2^48) << 16`.
fn derive_key(master_key: &[u8; 16], master_salt: &[u8; 14], label: u8, out: &mut [u8]) {
    let mut x = *master_salt;
    x[7] ^= label;

    let mut iv = [0u8; 16];
    iv[..14].copy_from_slice(&x);

    out.fill(0);
    let mut cipher = Aes128Ctr::new(master_key.into(), &iv.into());
    cipher.apply_keystream(out);
}

#[cfg(test)]
mod tests {
    use super::*;

    fn hex(s: &str) -> Vec<u8> {
        (0..s.len())
            .step_by(2)
            .map(|i| u8::from_str_radix(&s[i..i + 2], 16).unwrap())
            .collect()
    }

    #[test]
    fn test_key_derivation_rfc3711_vectors() {
        // RFC 3711 appendix B.3
        let master_key: [u8; 16] = hex("E1F97A0D3E018BE0D64FA32C06DE4139").try_into().unwrap();
        let master_salt: [u8; 14] = hex("0EC675AD498AFEEBB6960B3AABE6").try_into().unwrap();

        let mut cipher_key = [0u8; 16];
        derive_key(&master_key, &master_salt, LABEL_RTP_ENCRYPTION, &mut cipher_key);
        assert_eq!(cipher_key.to_vec(), hex("C61E7A93744F39EE10734AFE3FF7A087"));

        let mut auth_key = [0u8; 20];
        derive_key(&master_key, &master_salt, LABEL_RTP_AUTH, &mut auth_key);
        assert_eq!(
            auth_key.to_vec(),
            hex("CEBE321F6FF7716B6FD4AB49AF256A156D38BAA4")
        );

        let mut salt = [0u8; 14];
        derive_key(&master_key, &master_salt, LABEL_RTP_SALT, &mut salt);
        assert_eq!(salt.to_vec(), hex("30CBBC08863D8C85D49DB34A9AE1"));
    }

    #[test]
    fn test_suite_names() {
        assert_eq!(
            CryptoSuite::from_name("AES_CM_128_HMAC_SHA1_80"),
            Some(CryptoSuite::AesCm128HmacSha1_80)
        );
        assert_eq!(
            CryptoSuite::from_name("AES_CM_128_HMAC_SHA1_32"),
            Some(CryptoSuite::AesCm128HmacSha1_32)
        );
        assert_eq!(CryptoSuite::from_name("AEAD_AES_128_GCM"), None);
    }

    #[test]
    fn test_protect_appends_tag_and_encrypts() {
        let master = vec![7u8; 30];
        let mut ctx = SrtpContext::new(CryptoSuite::AesCm128HmacSha1_80, &master).unwrap();

        let mut packet = Vec::new();
        crate::rtp::RtpHeader {
            version: 2,
            padding: false,
            extension: false,
            csrc_count: 0,
            marker: false,
            payload_type: 111,
            sequence_number: 100,
            timestamp: 960,
            ssrc: 9,
        }
        .write_to(&mut packet);
        packet.extend_from_slice(&[1, 2, 3, 4, 5, 6, 7, 8]);
        let clear = packet.clone();

        ctx.protect(&mut packet).unwrap();
        assert_eq!(packet.len(), clear.len() + 10);
        // Header stays in the clear, payload does not.
        assert_eq!(&packet[..12], &clear[..12]);
        assert_ne!(&packet[12..20], &clear[12..]);
    }

    #[test]
    fn test_protect_is_deterministic_per_index() {
        let master = vec![3u8; 30];
        let build = || {
            let mut packet = Vec::new();
            crate::rtp::RtpHeader {
                version: 2,
                padding: false,
                extension: false,
                csrc_count: 0,
                marker: false,
                payload_type: 111,
                sequence_number: 1,
                timestamp: 0,
                ssrc: 5,
            }
            .write_to(&mut packet);
            packet.extend_from_slice(b"payload");
            packet
        };

        let mut a = build();
        let mut b = build();
        SrtpContext::new(CryptoSuite::AesCm128HmacSha1_80, &master)
            .unwrap()
            .protect(&mut a)
            .unwrap();
        SrtpContext::new(CryptoSuite::AesCm128HmacSha1_80, &master)
            .unwrap()
            .protect(&mut b)
            .unwrap();
        assert_eq!(a, b);
    }

    #[test]
    fn test_rollover_tracking() {
        let master = vec![1u8; 30];
        let mut ctx = SrtpContext::new(CryptoSuite::AesCm128HmacSha1_32, &master).unwrap();

        for seq in [65534u16, 65535, 0, 1] {
            let mut packet = Vec::new();
            crate::rtp::RtpHeader {
                version: 2,
                padding: false,
                extension: false,
                csrc_count: 0,
                marker: false,
                payload_type: 111,
                sequence_number: seq,
                timestamp: 0,
                ssrc: 5,
            }
            .write_to(&mut packet);
            packet.push(0xAB);
            ctx.protect(&mut packet).unwrap();
        }
        assert_eq!(ctx.rollover_count, 1);
    }

    #[test]
    fn test_bad_key_material_rejected() {
        assert!(SrtpContext::new(CryptoSuite::AesCm128HmacSha1_80, &[0u8; 16]).is_err());
        assert!(SrtpContext::from_base64("NOT_A_SUITE", "AAAA").is_err());
        assert!(SrtpContext::from_base64("AES_CM_128_HMAC_SHA1_80", "!!!").is_err());
    }
}
