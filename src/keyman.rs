//! Symmetric key hierarchy.
//!
//! Three levels: L0 is derived from the process-wide master secret with
//! PBKDF2 and cached until its TTL runs out; L1 is the per-peer key,
//! CMAC-AES of the peer identifier under L0; L2 is the per-peer-per-zone
//! key, CMAC-AES of the 24-bit zone under L1 and is what the transformer
//! seals with.
//!
//! `derive_*` is purely local and used on ingress to verify traffic from a
//! peer. `fetch_*` is used on egress: the sending side must ask the
//! receiving side for the L1 the receiver derives for it, so both ends hold
//! the same key. Fetched L1 keys are cached with the TTL the peer reported.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::{Arc, Mutex as StdMutex, RwLock};

use aes::{Aes128, Aes256};
use chrono::{DateTime, Duration as ChronoDuration, Utc};
use cmac::{Cmac, Mac};
use log::{debug, info, warn};
use pbkdf2::pbkdf2_hmac;
use serde::{Deserialize, Serialize};
use sha2::Sha256;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::Mutex as AsyncMutex;
use tokio::time::{interval, timeout};

use crate::config::KeyConfig;
use crate::error::{Result, ZtpError};
use crate::peers::{key_service_addr, PeerTable};

const L0_SALT: &[u8] = b"L0 Salt value";
const L0_ITERATIONS: u32 = 1000;

/// Request token a peer writes to the L1 key service.
pub const KEY_REQUEST: &[u8] = b"get-key";

/// JSON payload exchanged by the L1 key service. Field casing is part of
/// the wire format.
#[derive(Debug, Serialize, Deserialize)]
pub struct KeyPayload {
    #[serde(rename = "Key", with = "base64_bytes")]
    pub key: Vec<u8>,
    #[serde(rename = "TTL")]
    pub ttl: DateTime<Utc>,
}

mod base64_bytes {
    use base64::engine::general_purpose::STANDARD;
    use base64::Engine;
    use serde::de::Error;
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(bytes: &[u8], s: S) -> Result<S::Ok, S::Error> {
        s.serialize_str(&STANDARD.encode(bytes))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Vec<u8>, D::Error> {
        let s = String::deserialize(d)?;
        STANDARD.decode(s).map_err(Error::custom)
    }
}

struct L0State {
    ms: Vec<u8>,
    key: Option<Vec<u8>>,
    expires_at: DateTime<Utc>,
}

#[derive(Clone)]
struct CachedKey {
    key: Vec<u8>,
    expires_at: DateTime<Utc>,
}

/// Thread-safe store managing the L0/L1/L2 hierarchy.
pub struct KeyMan {
    cfg: KeyConfig,
    l0: RwLock<L0State>,
    cache: RwLock<HashMap<String, CachedKey>>,
    /// Per-peer fetch gates: at most one remote fetch in flight per peer.
    inflight: StdMutex<HashMap<String, Arc<AsyncMutex<()>>>>,
}

impl KeyMan {
    pub fn new(master_secret: Vec<u8>, cfg: KeyConfig) -> Self {
        KeyMan {
            cfg,
            l0: RwLock::new(L0State {
                ms: master_secret,
                key: None,
                expires_at: DateTime::<Utc>::MIN_UTC,
            }),
            cache: RwLock::new(HashMap::new()),
            inflight: StdMutex::new(HashMap::new()),
        }
    }

    /// Replace the master secret. The cached L0 is dropped so the next
    /// derivation picks up the new secret immediately.
    pub fn set_master(&self, master_secret: Vec<u8>) {
        let mut l0 = self.l0.write().unwrap();
        l0.ms = master_secret;
        l0.key = None;
    }

    /// Current L0 key and its expiry, refreshing if absent or expired.
    fn l0_key(&self) -> Result<(Vec<u8>, DateTime<Utc>)> {
        {
            let l0 = self.l0.read().unwrap();
            if let Some(key) = &l0.key {
                if l0.expires_at > Utc::now() {
                    return Ok((key.clone(), l0.expires_at));
                }
            }
        }

        let mut l0 = self.l0.write().unwrap();
        // Double-check under the write lock: several readers may have raced
        // into the refresh path and another one may already have renewed.
        if let Some(key) = &l0.key {
            if l0.expires_at > Utc::now() {
                return Ok((key.clone(), l0.expires_at));
            }
        }
        if l0.ms.is_empty() {
            return Err(ZtpError::KeyUnavailable(
                "master secret cannot be empty".into(),
            ));
        }
        let mut key = vec![0u8; self.cfg.key_length];
        pbkdf2_hmac::<Sha256>(&l0.ms, L0_SALT, L0_ITERATIONS, &mut key);
        l0.key = Some(key.clone());
        l0.expires_at = Utc::now() + ChronoDuration::seconds(self.cfg.key_ttl_secs as i64);
        Ok((key, l0.expires_at))
    }

    /// Derive the L1 key for `remote` from the local master secret.
    pub fn derive_l1(&self, remote: &str) -> Result<Vec<u8>> {
        Ok(self.derive_l1_with_expiry(remote)?.0)
    }

    fn derive_l1_with_expiry(&self, remote: &str) -> Result<(Vec<u8>, DateTime<Utc>)> {
        let (l0, expires_at) = self.l0_key()?;
        let l1 = derive_key(&l0, remote.as_bytes(), self.cfg.key_length)?;
        Ok((l1, expires_at))
    }

    /// Derive the L2 key for `(remote, zone)` from the local master secret.
    /// Used on ingress to verify traffic claiming to come from `remote`.
    pub fn derive_l2(&self, remote: &str, zone: u32) -> Result<Vec<u8>> {
        let l1 = self.derive_l1(remote)?;
        derive_l2_from_l1(&l1, zone, self.cfg.key_length)
    }

    /// L1 key for sending to `remote`, fetched from the peer's key service
    /// unless a live cached copy exists. `fresh` is true iff this call hit
    /// the network and repopulated the cache.
    pub async fn fetch_l1(&self, remote: &str) -> Result<(Vec<u8>, bool)> {
        if remote.is_empty() {
            return Err(ZtpError::KeyUnavailable("remote cannot be empty".into()));
        }
        if let Some(key) = self.cached(remote) {
            return Ok((key, false));
        }

        let gate = self.fetch_gate(remote);
        let _in_flight = gate.lock().await;
        // Another task may have completed the fetch while we waited.
        if let Some(key) = self.cached(remote) {
            return Ok((key, false));
        }

        let key = match timeout(self.cfg.fetch_timeout(), self.fetch_l1_from_remote(remote)).await
        {
            Ok(res) => res?,
            Err(_) => return Err(ZtpError::Timeout),
        };
        Ok((key, true))
    }

    /// L2 key for sending to `(remote, zone)`. `fresh` reflects the
    /// underlying L1 fetch.
    pub async fn fetch_l2(&self, remote: &str, zone: u32) -> Result<(Vec<u8>, bool)> {
        let (l1, fresh) = self.fetch_l1(remote).await?;
        let l2 = derive_l2_from_l1(&l1, zone, self.cfg.key_length)?;
        Ok((l2, fresh))
    }

    /// Drop the cached L1 for `remote` so the next fetch goes remote.
    /// Used to force rotation when a nonce counter saturates.
    pub fn invalidate_l1(&self, remote: &str) {
        self.cache.write().unwrap().remove(remote);
    }

    fn cached(&self, remote: &str) -> Option<Vec<u8>> {
        let cache = self.cache.read().unwrap();
        cache
            .get(remote)
            .filter(|entry| entry.expires_at > Utc::now())
            .map(|entry| entry.key.clone())
    }

    fn fetch_gate(&self, remote: &str) -> Arc<AsyncMutex<()>> {
        let mut inflight = self.inflight.lock().unwrap();
        Arc::clone(
            inflight
                .entry(remote.to_string())
                .or_insert_with(|| Arc::new(AsyncMutex::new(()))),
        )
    }

    async fn fetch_l1_from_remote(&self, remote: &str) -> Result<Vec<u8>> {
        let addr = key_service_addr(remote, self.cfg.server_port)?;
        let mut stream = TcpStream::connect(addr).await?;
        stream.write_all(KEY_REQUEST).await?;
        stream.shutdown().await?;

        let mut buf = Vec::new();
        stream.read_to_end(&mut buf).await?;
        let payload: KeyPayload = serde_json::from_slice(&buf)
            .map_err(|e| ZtpError::Payload(format!("invalid key payload: {}", e)))?;

        if payload.key.len() != self.cfg.key_length {
            return Err(ZtpError::Payload(format!(
                "fetched key has invalid length {}",
                payload.key.len()
            )));
        }
        if payload.ttl <= Utc::now() {
            return Err(ZtpError::Payload("fetched key is expired".into()));
        }
        debug!("fetched L1 key from {}", remote);

        self.cache.write().unwrap().insert(
            remote.to_string(),
            CachedKey {
                key: payload.key.clone(),
                expires_at: payload.ttl,
            },
        );
        Ok(payload.key)
    }

    /// Remove expired cache entries; returns how many were dropped.
    pub fn purge_expired(&self) -> usize {
        let mut cache = self.cache.write().unwrap();
        let before = cache.len();
        let now = Utc::now();
        cache.retain(|_, entry| entry.expires_at > now);
        before - cache.len()
    }

    /// Periodic sweep of the L1 cache.
    pub async fn run_purge(self: Arc<Self>) {
        let mut ticker = interval(self.cfg.key_purge_interval());
        loop {
            ticker.tick().await;
            let purged = self.purge_expired();
            if purged > 0 {
                debug!("purged {} expired L1 cache entries", purged);
            }
        }
    }

    /// Serve L1 key requests from authenticated peers. Runs until the
    /// socket dies; a bind failure is fatal and returned to the caller.
    pub async fn serve_l1(self: Arc<Self>, peers: Arc<PeerTable>) -> Result<()> {
        let listener = TcpListener::bind(("0.0.0.0", self.cfg.server_port)).await?;
        info!("L1 key service listening on port {}", self.cfg.server_port);
        loop {
            let (stream, addr) = match listener.accept().await {
                Ok(conn) => conn,
                Err(e) => {
                    warn!("key service accept failed: {}", e);
                    continue;
                }
            };
            let km = Arc::clone(&self);
            let peers = Arc::clone(&peers);
            tokio::spawn(async move {
                if let Err(e) = km.handle_key_session(stream, addr, &peers).await {
                    warn!("key session from {} failed: {}", addr, e);
                }
            });
        }
    }

    async fn handle_key_session(
        &self,
        mut stream: TcpStream,
        addr: SocketAddr,
        peers: &PeerTable,
    ) -> Result<()> {
        // The underlay authenticates the peer; its identity is taken from
        // the connection address, never from the request body.
        let remote_id = peers
            .id_by_ip(addr.ip())
            .ok_or_else(|| ZtpError::KeyUnavailable(format!("unknown peer IP {}", addr.ip())))?
            .to_string();

        let mut request = Vec::new();
        stream.read_to_end(&mut request).await?;
        if request != KEY_REQUEST {
            return Err(ZtpError::Payload("unexpected key request".into()));
        }
        debug!("L1 key request from {}", remote_id);

        let (key, ttl) = self.derive_l1_with_expiry(&remote_id)?;
        let payload = KeyPayload { key, ttl };
        let encoded = serde_json::to_vec(&payload)
            .map_err(|e| ZtpError::Payload(format!("failed to encode key payload: {}", e)))?;
        stream.write_all(&encoded).await?;
        stream.shutdown().await?;
        Ok(())
    }

    #[cfg(test)]
    fn cache_insert(&self, remote: &str, key: Vec<u8>, expires_at: DateTime<Utc>) {
        self.cache
            .write()
            .unwrap()
            .insert(remote.to_string(), CachedKey { key, expires_at });
    }
}

/// One CMAC-AES block over `data`. The AES variant follows the key length.
fn cmac_block(key: &[u8], data: &[u8]) -> Result<[u8; 16]> {
    let tag = match key.len() {
        16 => {
            let mut mac = <Cmac<Aes128> as Mac>::new_from_slice(key)
                .map_err(|_| ZtpError::KeyUnavailable("invalid CMAC key".into()))?;
            mac.update(data);
            mac.finalize().into_bytes()
        }
        32 => {
            let mut mac = <Cmac<Aes256> as Mac>::new_from_slice(key)
                .map_err(|_| ZtpError::KeyUnavailable("invalid CMAC key".into()))?;
            mac.update(data);
            mac.finalize().into_bytes()
        }
        n => {
            return Err(ZtpError::KeyUnavailable(format!(
                "CMAC key must be 16 or 32 bytes, got {}",
                n
            )))
        }
    };
    Ok(tag.into())
}

/// Derive `out_len` key bytes from `key` and `data`. For 16-byte output
/// this is exactly one CMAC block; 32-byte output appends a second block
/// chained over the first.
fn derive_key(key: &[u8], data: &[u8], out_len: usize) -> Result<Vec<u8>> {
    let first = cmac_block(key, data)?;
    let mut out = first.to_vec();
    if out_len > 16 {
        let second = cmac_block(key, &first)?;
        out.extend_from_slice(&second);
    }
    out.truncate(out_len);
    Ok(out)
}

/// L2 from a given L1: CMAC over the three little-endian zone bytes.
fn derive_l2_from_l1(l1: &[u8], zone: u32, out_len: usize) -> Result<Vec<u8>> {
    let zone_le = zone.to_le_bytes();
    derive_key(l1, &zone_le[..3], out_len)
}
