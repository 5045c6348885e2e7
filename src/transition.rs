//! Zone transition policy.
//!
//! A policy snapshot maps every known subnet to its zone and owning
//! translation point, and carries the directed allow-set of zone pairs.
//! Snapshots are built from controller data, swapped in atomically, and
//! consulted by both pipeline directions under a read lock.

use std::collections::{HashMap, HashSet};
use std::net::IpAddr;
use std::sync::{Arc, Mutex, RwLock};
use std::time::{Duration, Instant};

use log::{debug, info, warn};
use tokio::sync::watch;
use tokio::time::interval;

use crate::error::{Result, ZtpError};
use crate::fetcher::Fetcher;
use crate::packet::{Handled, Packet};
use crate::tunnel::Tunnel;
use crate::types::{addr_bits, Subnet, Transitions, ZoneId};

#[derive(Default)]
struct TrieNode {
    children: [Option<Box<TrieNode>>; 2],
    subnet: Option<usize>,
}

impl TrieNode {
    /// Store a network; returns false if the exact prefix is already taken.
    fn insert(&mut self, bits: u128, prefix_len: u8, subnet_idx: usize) -> bool {
        let mut node = self;
        for i in 0..prefix_len {
            let bit = ((bits >> (127 - i as u32)) & 1) as usize;
            node = node.children[bit].get_or_insert_with(Default::default);
        }
        if node.subnet.is_some() {
            return false;
        }
        node.subnet = Some(subnet_idx);
        true
    }

    /// Indices of every stored network containing `bits`, shortest prefix
    /// first. A well-formed snapshot yields exactly one.
    fn containing(&self, bits: u128, max_depth: u8) -> Vec<usize> {
        let mut matches = Vec::new();
        let mut node = self;
        for i in 0..=max_depth {
            if let Some(idx) = node.subnet {
                matches.push(idx);
            }
            if i == max_depth {
                break;
            }
            let bit = ((bits >> (127 - i as u32)) & 1) as usize;
            match &node.children[bit] {
                Some(child) => node = child,
                None => break,
            }
        }
        matches
    }
}

/// One immutable policy snapshot: an LPM index over the subnets plus the
/// transition allow-set.
pub struct PolicyIndex {
    v4: TrieNode,
    v6: TrieNode,
    subnets: Vec<Subnet>,
    transitions: HashMap<ZoneId, HashSet<ZoneId>>,
}

impl PolicyIndex {
    /// Build an index from a controller snapshot. Zone identifiers were
    /// validated at ingest (`ZoneId` construction); what is rejected here
    /// is a snapshot listing the same network twice.
    pub fn build(subnets: Vec<Subnet>, transitions: &Transitions) -> Result<Self> {
        let mut index = PolicyIndex {
            v4: TrieNode::default(),
            v6: TrieNode::default(),
            subnets: Vec::with_capacity(subnets.len()),
            transitions: HashMap::new(),
        };
        for subnet in subnets {
            let idx = index.subnets.len();
            let trie = if subnet.cidr.is_ipv4() {
                &mut index.v4
            } else {
                &mut index.v6
            };
            if !trie.insert(subnet.cidr.bits(), subnet.cidr.prefix_len, idx) {
                return Err(ZtpError::Config(format!(
                    "duplicate subnet {} in policy snapshot",
                    subnet.cidr
                )));
            }
            index.subnets.push(subnet);
        }
        for (&from, targets) in transitions {
            let entry = index.transitions.entry(from).or_default();
            for &to in targets {
                entry.insert(to);
            }
        }
        Ok(index)
    }

    /// Longest-prefix lookup requiring exactly one containing network.
    pub fn find(&self, ip: IpAddr) -> Result<&Subnet> {
        let (trie, max_depth) = match ip {
            IpAddr::V4(_) => (&self.v4, 32u8),
            IpAddr::V6(_) => (&self.v6, 128u8),
        };
        let matches = trie.containing(addr_bits(ip), max_depth);
        match matches.len() {
            0 => Err(ZtpError::ZoneNotFound(ip)),
            1 => Ok(&self.subnets[matches[0]]),
            n => Err(ZtpError::ZoneLookupAmbiguous { ip, matches: n }),
        }
    }

    pub fn transition_allowed(&self, from: ZoneId, to: ZoneId) -> bool {
        self.transitions
            .get(&from)
            .is_some_and(|targets| targets.contains(&to))
    }

    pub fn subnet_count(&self) -> usize {
        self.subnets.len()
    }
}

/// Reverse-direction admission window for established flows.
struct FlowBypass {
    ttl: Duration,
    seen: Mutex<HashMap<(IpAddr, IpAddr), Instant>>,
}

impl FlowBypass {
    fn new(ttl: Duration) -> Self {
        FlowBypass {
            ttl,
            seen: Mutex::new(HashMap::new()),
        }
    }

    fn record(&self, src: IpAddr, dst: IpAddr) {
        let mut seen = self.seen.lock().unwrap();
        let now = Instant::now();
        let ttl = self.ttl;
        seen.retain(|_, t| now.duration_since(*t) <= ttl);
        seen.insert((src, dst), now);
    }

    fn reverse_recent(&self, src: IpAddr, dst: IpAddr) -> bool {
        let seen = self.seen.lock().unwrap();
        seen.get(&(dst, src))
            .is_some_and(|t| t.elapsed() <= self.ttl)
    }
}

/// Transition stage: zone lookup, spoof check and allow-set enforcement.
pub struct TransitionStage {
    index: RwLock<Option<PolicyIndex>>,
    tunnel: Arc<dyn Tunnel>,
    bypass: Option<FlowBypass>,
}

impl TransitionStage {
    pub fn new(
        tunnel: Arc<dyn Tunnel>,
        flow_bypass: bool,
        flow_bypass_ttl: Duration,
    ) -> Self {
        TransitionStage {
            index: RwLock::new(None),
            tunnel,
            bypass: flow_bypass.then(|| FlowBypass::new(flow_bypass_ttl)),
        }
    }

    /// Swap in a freshly built snapshot. The previous snapshot stays live
    /// until the build has succeeded.
    pub fn apply_snapshot(&self, subnets: Vec<Subnet>, transitions: &Transitions) -> Result<()> {
        let next = PolicyIndex::build(subnets, transitions)?;
        let count = next.subnet_count();
        *self.index.write().unwrap() = Some(next);
        debug!("policy snapshot applied, {} subnets", count);
        Ok(())
    }

    pub fn handle(&self, pkt: Packet) -> Result<Handled> {
        if pkt.ingress {
            self.handle_ingress(pkt).map(Handled::Forward)
        } else {
            self.handle_egress(pkt)
        }
    }

    fn handle_egress(&self, mut pkt: Packet) -> Result<Handled> {
        let src = host(pkt.src_host)?;
        let dst = host(pkt.dst_host)?;

        let (src_tp, dst_zone, dst_tp) = {
            let guard = self.index.read().unwrap();
            let index = guard.as_ref().ok_or(ZtpError::PolicyUnavailable)?;
            let src_net = index.find(src)?;
            let dst_net = index.find(dst)?;
            self.check_transition(index, src_net.zone_id, dst_net.zone_id, src, dst)?;
            (
                src_net.tp_addr.clone(),
                dst_net.zone_id,
                dst_net.tp_addr.clone(),
            )
        };

        pkt.remote_tp = dst_tp.clone();
        pkt.dst_zone = dst_zone.get();

        // Both endpoints behind this ZTP: deliver locally, nothing goes to
        // the underlay.
        if src_tp == dst_tp {
            self.tunnel.write_packet(&pkt.raw)?;
            return Ok(Handled::Consumed);
        }
        Ok(Handled::Forward(pkt))
    }

    fn handle_ingress(&self, pkt: Packet) -> Result<Packet> {
        let src = host(pkt.src_host)?;
        let dst = host(pkt.dst_host)?;

        let guard = self.index.read().unwrap();
        let index = guard.as_ref().ok_or(ZtpError::PolicyUnavailable)?;
        let src_net = index.find(src)?;
        let dst_net = index.find(dst)?;

        // The AEAD already proved the packet came from remote_tp; what is
        // left to check is that remote_tp actually owns the claimed source.
        if src_net.tp_addr != pkt.remote_tp {
            return Err(ZtpError::SpoofedSource {
                src,
                remote_tp: pkt.remote_tp.clone(),
            });
        }

        self.check_transition(index, src_net.zone_id, dst_net.zone_id, src, dst)?;
        drop(guard);
        Ok(pkt)
    }

    fn check_transition(
        &self,
        index: &PolicyIndex,
        from: ZoneId,
        to: ZoneId,
        src: IpAddr,
        dst: IpAddr,
    ) -> Result<()> {
        if index.transition_allowed(from, to) {
            if let Some(bypass) = &self.bypass {
                bypass.record(src, dst);
            }
            return Ok(());
        }
        if let Some(bypass) = &self.bypass {
            if bypass.reverse_recent(src, dst) {
                debug!(
                    "admitting {} -> {} via established-flow bypass",
                    src, dst
                );
                return Ok(());
            }
        }
        Err(ZtpError::TransitionDenied {
            from: from.get(),
            to: to.get(),
        })
    }
}

/// Periodic policy refresh. The initial fetch must succeed or the error is
/// returned to the caller (fatal at startup); later failures log and keep
/// the previous snapshot. Cancellation is honored at ticker boundaries.
pub async fn run_refresh<F: Fetcher>(
    stage: Arc<TransitionStage>,
    fetcher: F,
    refresh_interval: Duration,
    mut shutdown: watch::Receiver<bool>,
) -> Result<()> {
    let subnets = fetcher.fetch_subnets().await?;
    let transitions = fetcher.fetch_transitions().await?;
    stage.apply_snapshot(subnets, &transitions)?;
    info!("initial policy snapshot loaded");

    let mut ticker = interval(refresh_interval);
    ticker.tick().await; // the first tick fires immediately
    loop {
        tokio::select! {
            _ = shutdown.changed() => {
                info!("policy refresh stopping");
                return Ok(());
            }
            _ = ticker.tick() => {
                match refresh_once(&stage, &fetcher).await {
                    Ok(()) => debug!("policy snapshot refreshed"),
                    Err(e) => warn!("policy refresh failed, keeping previous snapshot: {}", e),
                }
            }
        }
    }
}

async fn refresh_once<F: Fetcher>(stage: &TransitionStage, fetcher: &F) -> Result<()> {
    let subnets = fetcher.fetch_subnets().await?;
    let transitions = fetcher.fetch_transitions().await?;
    stage.apply_snapshot(subnets, &transitions)
}

fn host(ip: Option<IpAddr>) -> Result<IpAddr> {
    ip.ok_or_else(|| ZtpError::BadHeader("packet not classified".into()))
}

#[cfg(test)]
mod tests {
    use super::*;

    struct SinkTunnel(Mutex<Vec<Vec<u8>>>);

    impl SinkTunnel {
        fn new() -> Arc<Self> {
            Arc::new(SinkTunnel(Mutex::new(Vec::new())))
        }

        fn packets(&self) -> usize {
            self.0.lock().unwrap().len()
        }
    }

    impl Tunnel for SinkTunnel {
        fn write_packet(&self, raw: &[u8]) -> std::io::Result<()> {
            self.0.lock().unwrap().push(raw.to_vec());
            Ok(())
        }
    }

    const LOCAL_TP: &str = "1-ff00:0:110,10.0.0.1";
    const REMOTE_TP: &str = "1-ff00:0:111,10.0.0.2";

    fn zid(id: u32) -> ZoneId {
        ZoneId::new(id).unwrap()
    }

    fn subnet(cidr: &str, zone: u32, tp: &str) -> Subnet {
        Subnet {
            cidr: cidr.parse().unwrap(),
            zone_id: zid(zone),
            tp_addr: tp.to_string(),
        }
    }

    fn sample_subnets() -> Vec<Subnet> {
        vec![
            subnet("10.0.1.0/24", 1, LOCAL_TP),
            subnet("10.0.2.0/24", 2, REMOTE_TP),
            subnet("10.0.3.0/24", 3, LOCAL_TP),
            subnet("fd00:1::/32", 4, REMOTE_TP),
        ]
    }

    fn sample_transitions() -> Transitions {
        HashMap::from([(zid(1), vec![zid(2), zid(3)]), (zid(2), vec![zid(1)])])
    }

    fn stage(bypass: bool) -> (Arc<TransitionStage>, Arc<SinkTunnel>) {
        let tunnel = SinkTunnel::new();
        let stage = Arc::new(TransitionStage::new(
            Arc::clone(&tunnel) as Arc<dyn Tunnel>,
            bypass,
            Duration::from_secs(2),
        ));
        stage
            .apply_snapshot(sample_subnets(), &sample_transitions())
            .unwrap();
        (stage, tunnel)
    }

    fn egress_pkt(src: &str, dst: &str) -> Packet {
        let mut pkt = Packet::egress(vec![0x45, 0, 0, 0]);
        pkt.src_host = Some(src.parse().unwrap());
        pkt.dst_host = Some(dst.parse().unwrap());
        pkt
    }

    fn ingress_pkt(src: &str, dst: &str, remote_tp: &str) -> Packet {
        let mut pkt = Packet::ingress(vec![0x45, 0, 0, 0], remote_tp.to_string());
        pkt.src_host = Some(src.parse().unwrap());
        pkt.dst_host = Some(dst.parse().unwrap());
        pkt
    }

    #[test]
    fn index_finds_longest_prefix_owner() {
        let index = PolicyIndex::build(sample_subnets(), &sample_transitions()).unwrap();
        let net = index.find("10.0.2.77".parse().unwrap()).unwrap();
        assert_eq!(net.zone_id, zid(2));
        assert_eq!(net.tp_addr, REMOTE_TP);
        let net6 = index.find("fd00:1::42".parse().unwrap()).unwrap();
        assert_eq!(net6.zone_id, zid(4));
    }

    #[test]
    fn index_reports_unknown_and_ambiguous() {
        let index = PolicyIndex::build(sample_subnets(), &sample_transitions()).unwrap();
        assert!(matches!(
            index.find("192.168.1.1".parse().unwrap()),
            Err(ZtpError::ZoneNotFound(_))
        ));

        let mut overlapping = sample_subnets();
        overlapping.push(subnet("10.0.2.0/25", 9, LOCAL_TP));
        let index = PolicyIndex::build(overlapping, &sample_transitions()).unwrap();
        assert!(matches!(
            index.find("10.0.2.10".parse().unwrap()),
            Err(ZtpError::ZoneLookupAmbiguous { matches: 2, .. })
        ));
    }

    #[test]
    fn index_rejects_duplicate_subnets() {
        let dup = vec![
            subnet("10.0.9.0/24", 1, LOCAL_TP),
            subnet("10.0.9.0/24", 2, REMOTE_TP),
        ];
        assert!(matches!(
            PolicyIndex::build(dup, &HashMap::new()),
            Err(ZtpError::Config(_))
        ));
    }

    #[test]
    fn index_carries_boundary_zone_ids() {
        let edge = vec![subnet("10.0.9.0/24", (1 << 24) - 1, LOCAL_TP)];
        let index = PolicyIndex::build(edge, &HashMap::new()).unwrap();
        assert_eq!(
            index.find("10.0.9.1".parse().unwrap()).unwrap().zone_id.get(),
            (1 << 24) - 1
        );
    }

    #[test]
    fn rebuilding_from_same_snapshot_is_idempotent() {
        let a = PolicyIndex::build(sample_subnets(), &sample_transitions()).unwrap();
        let b = PolicyIndex::build(sample_subnets(), &sample_transitions()).unwrap();
        for ip in ["10.0.1.5", "10.0.2.5", "10.0.3.5"] {
            let ip: IpAddr = ip.parse().unwrap();
            assert_eq!(a.find(ip).unwrap(), b.find(ip).unwrap());
        }
        assert_eq!(
            a.transition_allowed(zid(1), zid(2)),
            b.transition_allowed(zid(1), zid(2))
        );
    }

    #[test]
    fn egress_sets_remote_tp_and_zone() {
        let (stage, _) = stage(false);
        match stage.handle(egress_pkt("10.0.1.5", "10.0.2.5")).unwrap() {
            Handled::Forward(pkt) => {
                assert_eq!(pkt.remote_tp, REMOTE_TP);
                assert_eq!(pkt.dst_zone, 2);
            }
            Handled::Consumed => panic!("inter-site packet must forward"),
        }
    }

    #[test]
    fn egress_denies_disallowed_transition() {
        let (stage, _) = stage(false);
        // zone 2 -> zone 3 is not in the allow-set
        let err = stage
            .handle(egress_pkt("10.0.2.5", "10.0.3.5"))
            .unwrap_err();
        assert!(matches!(
            err,
            ZtpError::TransitionDenied { from: 2, to: 3 }
        ));
    }

    #[test]
    fn intra_site_egress_is_consumed_into_tunnel() {
        let (stage, tunnel) = stage(false);
        // zones 1 and 3 are both behind the local TP
        match stage.handle(egress_pkt("10.0.1.5", "10.0.3.5")).unwrap() {
            Handled::Consumed => {}
            Handled::Forward(_) => panic!("intra-site packet must not forward"),
        }
        assert_eq!(tunnel.packets(), 1);
    }

    #[test]
    fn ingress_accepts_owned_source() {
        let (stage, _) = stage(false);
        let handled = stage
            .handle(ingress_pkt("10.0.2.5", "10.0.1.5", REMOTE_TP))
            .unwrap();
        assert!(matches!(handled, Handled::Forward(_)));
    }

    #[test]
    fn ingress_rejects_spoofed_source() {
        let (stage, _) = stage(false);
        // 10.0.1.5 is behind the local TP, not the delivering peer.
        let err = stage
            .handle(ingress_pkt("10.0.1.5", "10.0.3.5", REMOTE_TP))
            .unwrap_err();
        assert!(matches!(err, ZtpError::SpoofedSource { .. }));
    }

    #[test]
    fn lookups_fail_before_first_snapshot() {
        let tunnel = SinkTunnel::new();
        let stage = TransitionStage::new(
            tunnel as Arc<dyn Tunnel>,
            false,
            Duration::from_secs(2),
        );
        let err = stage.handle(egress_pkt("10.0.1.5", "10.0.2.5")).unwrap_err();
        assert!(matches!(err, ZtpError::PolicyUnavailable));
    }

    #[test]
    fn bypass_admits_recent_reverse_flow() {
        let (stage, _) = stage(true);
        // 3 -> 1 is not in the allow-set and no forward flow exists yet.
        let err = stage
            .handle(egress_pkt("10.0.3.7", "10.0.1.7"))
            .unwrap_err();
        assert!(matches!(err, ZtpError::TransitionDenied { .. }));

        // After the permitted 1 -> 3 flow, its reverse is admitted.
        stage.handle(egress_pkt("10.0.1.7", "10.0.3.7")).unwrap();
        let admitted = stage.handle(egress_pkt("10.0.3.7", "10.0.1.7"));
        assert!(admitted.is_ok(), "reverse of a recent flow must be admitted");
    }

    #[test]
    fn bypass_disabled_by_default_config() {
        let (stage, _) = stage(false);
        stage.handle(egress_pkt("10.0.1.7", "10.0.3.7")).unwrap();
        // Reverse direction 3 -> 1 is not in the allow-set and bypass is off.
        let err = stage
            .handle(egress_pkt("10.0.3.7", "10.0.1.7"))
            .unwrap_err();
        assert!(matches!(err, ZtpError::TransitionDenied { .. }));
    }

    #[derive(Clone)]
    struct StaticFetcher {
        subnets: Vec<Subnet>,
        transitions: Transitions,
        fail: bool,
    }

    impl Fetcher for StaticFetcher {
        async fn fetch_subnets(&self) -> crate::error::Result<Vec<Subnet>> {
            if self.fail {
                return Err(ZtpError::Transport(std::io::Error::other("controller down")));
            }
            Ok(self.subnets.clone())
        }

        async fn fetch_transitions(&self) -> crate::error::Result<Transitions> {
            if self.fail {
                return Err(ZtpError::Transport(std::io::Error::other("controller down")));
            }
            Ok(self.transitions.clone())
        }
    }

    #[tokio::test]
    async fn refresh_fails_fast_when_initial_fetch_fails() {
        let tunnel = SinkTunnel::new();
        let stage = Arc::new(TransitionStage::new(
            tunnel as Arc<dyn Tunnel>,
            false,
            Duration::from_secs(2),
        ));
        let fetcher = StaticFetcher {
            subnets: Vec::new(),
            transitions: HashMap::new(),
            fail: true,
        };
        let (_tx, rx) = watch::channel(false);
        let res = run_refresh(stage, fetcher, Duration::from_millis(10), rx).await;
        assert!(res.is_err());
    }

    #[tokio::test]
    async fn refresh_loads_initial_snapshot_and_stops_on_shutdown() {
        let tunnel = SinkTunnel::new();
        let stage = Arc::new(TransitionStage::new(
            tunnel as Arc<dyn Tunnel>,
            false,
            Duration::from_secs(2),
        ));
        let fetcher = StaticFetcher {
            subnets: sample_subnets(),
            transitions: sample_transitions(),
            fail: false,
        };
        let (tx, rx) = watch::channel(false);
        let handle = tokio::spawn(run_refresh(
            Arc::clone(&stage),
            fetcher,
            Duration::from_millis(10),
            rx,
        ));
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(matches!(
            stage.handle(egress_pkt("10.0.1.5", "10.0.2.5")).unwrap(),
            Handled::Forward(_)
        ));
        tx.send(true).unwrap();
        handle.await.unwrap().unwrap();
    }
}
