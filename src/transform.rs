//! Transformation between raw IP packets and the authenticated intermediate
//! representation exchanged by peer ZTPs.
//!
//! IR wire layout:
//!
//! ```text
//! offset  size  field
//!   0      1    version     (0x01)
//!   1      3    zone id     (little-endian 24 bit)
//!   4      4    timestamp   (little-endian u32, unix seconds)
//!   8     12    nonce       (LE counter || random tail)
//!  20      N    ciphertext  (AES-GCM of the inner IP packet)
//!  20+N   16    tag
//! ```
//!
//! The 8-byte header doubles as the AEAD associated data.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, RwLock};

use aes_gcm::aead::{Aead, KeyInit, Payload};
use aes_gcm::{Aes128Gcm, Aes256Gcm, Nonce};
use chrono::Utc;

use crate::error::{Result, ZtpError};

/// Bumped on breaking changes to the IR layout or AEAD.
pub const IR_VERSION: u8 = 0x01;
pub const HEADER_LEN: usize = 8;
pub const ZONE_OFF: usize = 1;
pub const ZONE_LEN: usize = 3;
pub const TIME_OFF: usize = 4;
pub const TIME_LEN: usize = 4;
pub const NONCE_LEN: usize = 12;
pub const TAG_LEN: usize = 16;

/// Bytes added to an inner packet by the IR envelope.
pub const fn overhead() -> usize {
    HEADER_LEN + NONCE_LEN + TAG_LEN
}

/// AES-GCM keyed by derived key length: 16 bytes selects AES-128, 32 AES-256.
enum AeadCipher {
    Aes128(Aes128Gcm),
    Aes256(Aes256Gcm),
}

impl AeadCipher {
    fn new(key: &[u8]) -> Result<Self> {
        match key.len() {
            16 => Ok(AeadCipher::Aes128(
                Aes128Gcm::new_from_slice(key).map_err(|_| ZtpError::AuthFailed)?,
            )),
            32 => Ok(AeadCipher::Aes256(
                Aes256Gcm::new_from_slice(key).map_err(|_| ZtpError::AuthFailed)?,
            )),
            n => Err(ZtpError::KeyUnavailable(format!(
                "AEAD key must be 16 or 32 bytes, got {}",
                n
            ))),
        }
    }

    fn seal(&self, nonce: &[u8], aad: &[u8], plaintext: &[u8]) -> Result<Vec<u8>> {
        let payload = Payload {
            msg: plaintext,
            aad,
        };
        let res = match self {
            AeadCipher::Aes128(c) => c.encrypt(Nonce::from_slice(nonce), payload),
            AeadCipher::Aes256(c) => c.encrypt(Nonce::from_slice(nonce), payload),
        };
        res.map_err(|_| ZtpError::AuthFailed)
    }

    fn open(&self, nonce: &[u8], aad: &[u8], ciphertext: &[u8]) -> Result<Vec<u8>> {
        let payload = Payload {
            msg: ciphertext,
            aad,
        };
        let res = match self {
            AeadCipher::Aes128(c) => c.decrypt(Nonce::from_slice(nonce), payload),
            AeadCipher::Aes256(c) => c.decrypt(Nonce::from_slice(nonce), payload),
        };
        res.map_err(|_| ZtpError::AuthFailed)
    }
}

/// Per-peer nonce generator.
///
/// The wire nonce is the little-endian counter in the first 8 bytes followed
/// by a random tail drawn once per state. The tail is immutable after init;
/// uniqueness under one key therefore reduces to counter uniqueness, which
/// the CAS loop guarantees across concurrent sealers.
struct NonceState {
    counter: AtomicU64,
    counter_max: u64,
    tail: Vec<u8>,
}

impl NonceState {
    fn new() -> Self {
        let (counter_max, tail_len) = if NONCE_LEN >= 8 {
            (u64::MAX, NONCE_LEN - 8)
        } else {
            ((1u64 << (NONCE_LEN * 8)) - 1, 0)
        };
        let tail: Vec<u8> = (0..tail_len).map(|_| rand::random()).collect();
        NonceState {
            counter: AtomicU64::new(0),
            counter_max,
            tail,
        }
    }

    /// Write the next nonce into `buf`. Fails once the counter saturates;
    /// the caller must rotate the key and reset this state.
    fn next_nonce(&self, buf: &mut [u8]) -> Result<()> {
        loop {
            let current = self.counter.load(Ordering::Acquire);
            if current == self.counter_max {
                return Err(ZtpError::NonceExhausted);
            }
            let next = current + 1;
            if self
                .counter
                .compare_exchange(current, next, Ordering::AcqRel, Ordering::Acquire)
                .is_ok()
            {
                let ctr_bytes = next.to_le_bytes();
                let buf_len = buf.len();
                let n = buf_len.min(8);
                buf[..n].copy_from_slice(&ctr_bytes[..n]);
                buf[n..].copy_from_slice(&self.tail[..buf_len - n]);
                return Ok(());
            }
        }
    }
}

/// Stateful IR transformer. Keeps one `NonceState` per remote peer.
pub struct Transformer {
    states: RwLock<HashMap<String, Arc<NonceState>>>,
}

impl Default for Transformer {
    fn default() -> Self {
        Self::new()
    }
}

impl Transformer {
    pub fn new() -> Self {
        Transformer {
            states: RwLock::new(HashMap::new()),
        }
    }

    /// Replace the nonce state for `remote`. Must be called after every key
    /// rotation, before the first seal under the new key.
    pub fn reset_state(&self, remote: &str) {
        let mut states = self.states.write().unwrap();
        states.insert(remote.to_string(), Arc::new(NonceState::new()));
    }

    fn state(&self, remote: &str) -> Arc<NonceState> {
        if let Some(ns) = self.states.read().unwrap().get(remote) {
            return Arc::clone(ns);
        }
        let mut states = self.states.write().unwrap();
        Arc::clone(
            states
                .entry(remote.to_string())
                .or_insert_with(|| Arc::new(NonceState::new())),
        )
    }

    /// Seal an inner IP packet into its intermediate representation.
    pub fn to_ir(&self, remote: &str, key: &[u8], packet: &[u8], dst_zone: u32) -> Result<Vec<u8>> {
        let ns = self.state(remote);

        // One allocation holding header, nonce, ciphertext and tag.
        let mut out = vec![0u8; packet.len() + overhead()];
        build_header(&mut out[..HEADER_LEN], dst_zone);
        ns.next_nonce(&mut out[HEADER_LEN..HEADER_LEN + NONCE_LEN])?;

        let cipher = AeadCipher::new(key)?;
        let (head, body) = out.split_at_mut(HEADER_LEN + NONCE_LEN);
        let sealed = cipher.seal(&head[HEADER_LEN..], &head[..HEADER_LEN], packet)?;
        body.copy_from_slice(&sealed);
        Ok(out)
    }

    /// Open an IR blob, returning the authenticated header and the inner
    /// packet. No partial plaintext escapes on failure.
    pub fn from_ir(&self, key: &[u8], message: &[u8]) -> Result<(Vec<u8>, Vec<u8>)> {
        if message.len() <= overhead() {
            return Err(ZtpError::Payload(format!(
                "IR too small, need more than {} bytes",
                overhead()
            )));
        }
        let aad = &message[..HEADER_LEN];
        let nonce = &message[HEADER_LEN..HEADER_LEN + NONCE_LEN];
        let ciphertext = &message[HEADER_LEN + NONCE_LEN..];

        let cipher = AeadCipher::new(key)?;
        let inner = cipher.open(nonce, aad, ciphertext)?;
        Ok((aad.to_vec(), inner))
    }

    /// Read the destination zone out of an IR blob without decrypting.
    pub fn get_zone(&self, message: &[u8]) -> Result<u32> {
        if message.len() < ZONE_OFF + ZONE_LEN {
            return Err(ZtpError::Payload(
                "cannot read zone ID, message too short".into(),
            ));
        }
        Ok(u32::from(message[ZONE_OFF])
            | u32::from(message[ZONE_OFF + 1]) << 8
            | u32::from(message[ZONE_OFF + 2]) << 16)
    }

    #[cfg(test)]
    fn saturate_counter(&self, remote: &str) {
        let ns = self.state(remote);
        ns.counter.store(ns.counter_max, Ordering::Release);
    }
}

fn build_header(buf: &mut [u8], zone: u32) {
    buf[0] = IR_VERSION;
    let zone_le = zone.to_le_bytes();
    buf[ZONE_OFF..ZONE_OFF + ZONE_LEN].copy_from_slice(&zone_le[..ZONE_LEN]);
    let now = Utc::now().timestamp() as u32;
    buf[TIME_OFF..TIME_OFF + TIME_LEN].copy_from_slice(&now.to_le_bytes());
}

/// Read the embedded IR timestamp (unix seconds).
pub fn read_timestamp(message: &[u8]) -> Result<u32> {
    if message.len() < TIME_OFF + TIME_LEN {
        return Err(ZtpError::Payload(
            "cannot read timestamp, message too short".into(),
        ));
    }
    let bytes: [u8; TIME_LEN] = message[TIME_OFF..TIME_OFF + TIME_LEN].try_into().unwrap();
    Ok(u32::from_le_bytes(bytes))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;

    const KEY: [u8; 16] = [7u8; 16];

    #[test]
    fn seal_open_round_trip() {
        let tr = Transformer::new();
        let inner = vec![0u8; 64];
        let ir = tr.to_ir("peer", &KEY, &inner, 2).unwrap();
        assert_eq!(ir.len(), inner.len() + overhead());
        assert_eq!(ir[0], IR_VERSION);
        assert_eq!(&ir[1..4], &[2, 0, 0]);

        let (aad, opened) = tr.from_ir(&KEY, &ir).unwrap();
        assert_eq!(aad, &ir[..HEADER_LEN]);
        assert_eq!(opened, inner);
    }

    #[test]
    fn round_trip_aes256() {
        let tr = Transformer::new();
        let key = [9u8; 32];
        let inner = b"inner ip packet".to_vec();
        let ir = tr.to_ir("peer", &key, &inner, 7).unwrap();
        let (_, opened) = tr.from_ir(&key, &ir).unwrap();
        assert_eq!(opened, inner);
    }

    #[test]
    fn any_bit_flip_fails_auth() {
        let tr = Transformer::new();
        let inner = vec![0xabu8; 32];
        let ir = tr.to_ir("peer", &KEY, &inner, 1).unwrap();
        for byte in 0..ir.len() {
            let mut tampered = ir.clone();
            tampered[byte] ^= 0x01;
            match tr.from_ir(&KEY, &tampered) {
                Err(ZtpError::AuthFailed) => {}
                other => panic!("byte {} flip not detected: {:?}", byte, other),
            }
        }
    }

    #[test]
    fn wrong_key_fails_auth() {
        let tr = Transformer::new();
        let ir = tr.to_ir("peer", &KEY, &[1, 2, 3, 4], 1).unwrap();
        let wrong = [8u8; 16];
        assert!(matches!(tr.from_ir(&wrong, &ir), Err(ZtpError::AuthFailed)));
    }

    #[test]
    fn zone_encodes_full_24_bit_range() {
        let tr = Transformer::new();
        for zone in [0u32, 1, 0x0000ff, 0xffffff] {
            let ir = tr.to_ir("peer", &KEY, &[0u8; 8], zone).unwrap();
            assert_eq!(tr.get_zone(&ir).unwrap(), zone);
        }
    }

    #[test]
    fn nonces_are_unique_and_monotonic() {
        let tr = Transformer::new();
        let mut seen = HashSet::new();
        for i in 1..=200u64 {
            let ir = tr.to_ir("peer", &KEY, &[0u8; 4], 1).unwrap();
            let nonce = ir[HEADER_LEN..HEADER_LEN + NONCE_LEN].to_vec();
            let ctr = u64::from_le_bytes(nonce[..8].try_into().unwrap());
            assert_eq!(ctr, i);
            assert!(seen.insert(nonce));
        }
    }

    #[test]
    fn concurrent_sealing_yields_distinct_nonces() {
        let tr = std::sync::Arc::new(Transformer::new());
        let mut handles = Vec::new();
        for _ in 0..8 {
            let tr = std::sync::Arc::clone(&tr);
            handles.push(std::thread::spawn(move || {
                let mut nonces = Vec::new();
                for _ in 0..50 {
                    let ir = tr.to_ir("peer", &KEY, &[0u8; 4], 1).unwrap();
                    nonces.push(ir[HEADER_LEN..HEADER_LEN + NONCE_LEN].to_vec());
                }
                nonces
            }));
        }
        let mut seen = HashSet::new();
        for h in handles {
            for nonce in h.join().unwrap() {
                assert!(seen.insert(nonce), "duplicate nonce under contention");
            }
        }
        assert_eq!(seen.len(), 400);
    }

    #[test]
    fn reset_state_restarts_counter() {
        let tr = Transformer::new();
        for _ in 0..5 {
            tr.to_ir("peer", &KEY, &[0u8; 4], 1).unwrap();
        }
        tr.reset_state("peer");
        let ir = tr.to_ir("peer", &KEY, &[0u8; 4], 1).unwrap();
        let ctr = u64::from_le_bytes(ir[HEADER_LEN..HEADER_LEN + 8].try_into().unwrap());
        assert_eq!(ctr, 1);
    }

    #[test]
    fn saturated_counter_reports_exhaustion() {
        let tr = Transformer::new();
        tr.to_ir("peer", &KEY, &[0u8; 4], 1).unwrap();
        tr.saturate_counter("peer");
        assert!(matches!(
            tr.to_ir("peer", &KEY, &[0u8; 4], 1),
            Err(ZtpError::NonceExhausted)
        ));
    }

    #[test]
    fn rejects_blob_of_exactly_overhead_size() {
        let tr = Transformer::new();
        let blob = vec![0u8; overhead()];
        assert!(tr.from_ir(&KEY, &blob).is_err());
    }

    #[test]
    fn timestamp_is_recent() {
        let tr = Transformer::new();
        let ir = tr.to_ir("peer", &KEY, &[0u8; 4], 1).unwrap();
        let ts = read_timestamp(&ir).unwrap() as i64;
        let now = Utc::now().timestamp();
        assert!((now - ts).abs() <= 2);
    }
}
