//! Packet record and processing pipeline.
//!
//! A packet flows through an ordered list of stages. Egress order is
//! Classify -> Transition -> Auth, ingress is Auth -> Classify -> Transition.
//! Stages keep no pipeline state of their own; shared state lives in the
//! objects they reference (key manager, transformer, policy index).

use std::net::IpAddr;
use std::sync::Arc;

use crate::auth::AuthStage;
use crate::classify::Classifier;
use crate::error::Result;
use crate::transition::TransitionStage;

/// A raw IP packet threaded through the pipeline with its metadata.
///
/// On egress entry `raw` holds a cleartext inner packet and `remote_tp` is
/// empty; on egress exit `raw` is the sealed intermediate representation and
/// `remote_tp` names the peer responsible for it. Ingress is the inverse.
#[derive(Debug, Clone, Default)]
pub struct Packet {
    pub ingress: bool,
    pub src_host: Option<IpAddr>,
    pub dst_host: Option<IpAddr>,
    /// Identifier of the remote ZTP, format `"<IA>,<IP>"`.
    pub remote_tp: String,
    pub dst_zone: u32,
    pub raw: Vec<u8>,
}

impl Packet {
    /// New egress packet wrapping a cleartext IP packet read from the tunnel.
    pub fn egress(raw: Vec<u8>) -> Self {
        Packet {
            ingress: false,
            raw,
            ..Default::default()
        }
    }

    /// New ingress packet as delivered by the underlay from `remote_tp`.
    pub fn ingress(raw: Vec<u8>, remote_tp: String) -> Self {
        Packet {
            ingress: true,
            raw,
            remote_tp,
            ..Default::default()
        }
    }
}

/// Outcome of a stage or of the whole pipeline.
#[derive(Debug)]
pub enum Handled {
    /// Continue with (or finish holding) this packet.
    Forward(Packet),
    /// The packet was delivered locally; later stages do not run.
    Consumed,
}

/// One element of the pipeline.
///
/// Stages are enumerated rather than boxed so dispatch stays static and the
/// async `handle` needs no trait-object machinery.
pub enum Stage {
    Classify(Classifier),
    Auth(AuthStage),
    Transition(Arc<TransitionStage>),
}

impl Stage {
    pub async fn handle(&self, pkt: Packet) -> Result<Handled> {
        match self {
            Stage::Classify(c) => c.handle(pkt).map(Handled::Forward),
            Stage::Auth(a) => a.handle(pkt).await.map(Handled::Forward),
            Stage::Transition(t) => t.handle(pkt),
        }
    }
}

/// An immutable ordered list of stages applied to each packet.
pub struct Pipeline {
    stages: Vec<Stage>,
}

impl Pipeline {
    /// Build a pipeline from stages in processing order. The list is fixed
    /// after construction; all packets observe the same order.
    pub fn new(stages: Vec<Stage>) -> Self {
        Pipeline { stages }
    }

    /// Apply every stage in order. The first error short-circuits and is
    /// returned; a `Consumed` verdict stops the walk without error.
    pub async fn handle(&self, pkt: Packet) -> Result<Handled> {
        let mut pkt = pkt;
        for stage in &self.stages {
            match stage.handle(pkt).await? {
                Handled::Forward(p) => pkt = p,
                Handled::Consumed => return Ok(Handled::Consumed),
            }
        }
        Ok(Handled::Forward(pkt))
    }
}
