//! Authentication stage.
//!
//! Egress seals the packet for its destination peer under the fetched L2
//! key; ingress checks freshness, derives the matching L2 locally and opens
//! the IR. A fresh L1 fetch always resets the peer's nonce state before the
//! next seal so nonces never repeat under a rotated key.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use log::debug;

use crate::error::{Result, ZtpError};
use crate::keyman::KeyMan;
use crate::packet::Packet;
use crate::transform::{read_timestamp, Transformer};

pub struct AuthStage {
    km: Arc<KeyMan>,
    tr: Arc<Transformer>,
    ingress: bool,
    max_time_diff: Duration,
}

impl AuthStage {
    pub fn new(km: Arc<KeyMan>, tr: Arc<Transformer>, ingress: bool, max_time_diff: Duration) -> Self {
        AuthStage {
            km,
            tr,
            ingress,
            max_time_diff,
        }
    }

    pub async fn handle(&self, pkt: Packet) -> Result<Packet> {
        if self.ingress {
            self.handle_ingress(pkt)
        } else {
            self.handle_egress(pkt).await
        }
    }

    async fn handle_egress(&self, mut pkt: Packet) -> Result<Packet> {
        if pkt.remote_tp.is_empty() {
            return Err(ZtpError::KeyUnavailable(
                "destination TP not set in packet".into(),
            ));
        }
        let (key, fresh) = self.km.fetch_l2(&pkt.remote_tp, pkt.dst_zone).await?;
        if fresh {
            self.tr.reset_state(&pkt.remote_tp);
        }
        match self.tr.to_ir(&pkt.remote_tp, &key, &pkt.raw, pkt.dst_zone) {
            Ok(ir) => {
                pkt.raw = ir;
                Ok(pkt)
            }
            Err(ZtpError::NonceExhausted) => {
                // Counter saturated under the current key: force an L1
                // rotation and retry once with a clean nonce state.
                debug!("nonce exhausted for {}, rotating L2", pkt.remote_tp);
                self.km.invalidate_l1(&pkt.remote_tp);
                let (key, _) = self.km.fetch_l2(&pkt.remote_tp, pkt.dst_zone).await?;
                self.tr.reset_state(&pkt.remote_tp);
                pkt.raw = self.tr.to_ir(&pkt.remote_tp, &key, &pkt.raw, pkt.dst_zone)?;
                Ok(pkt)
            }
            Err(e) => Err(e),
        }
    }

    fn handle_ingress(&self, mut pkt: Packet) -> Result<Packet> {
        if pkt.remote_tp.is_empty() {
            return Err(ZtpError::KeyUnavailable(
                "source TP not set in packet".into(),
            ));
        }
        // Freshness first: no key derivation or AEAD work for stale blobs.
        let ts = read_timestamp(&pkt.raw)?;
        self.check_freshness(ts)?;

        let zone = self.tr.get_zone(&pkt.raw)?;
        let key = self.km.derive_l2(&pkt.remote_tp, zone)?;
        let (_aad, inner) = self.tr.from_ir(&key, &pkt.raw)?;
        pkt.raw = inner;
        Ok(pkt)
    }

    fn check_freshness(&self, ts: u32) -> Result<()> {
        let now = Utc::now().timestamp();
        let diff = (now - i64::from(ts)).unsigned_abs();
        if diff > self.max_time_diff.as_secs() {
            return Err(ZtpError::FreshnessFailed);
        }
        Ok(())
    }
}
