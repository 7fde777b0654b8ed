//! Stand-in gossiper for channels nobody registered locally.
//!
//! Lets a peer relay traffic for channels it does not itself use: unicasts
//! addressed to it are dropped, everything else is passed on untouched.

use super::{GossipData, Gossiper};
use crate::error::MeshError;
use crate::peer::PeerName;

/// Raw payloads relayed by a surrogate channel.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SurrogateData(pub Vec<Vec<u8>>);

impl GossipData for SurrogateData {
    fn encode(&self) -> Vec<Vec<u8>> {
        self.0.clone()
    }

    fn merge(&mut self, other: Self) {
        for payload in other.0 {
            if !self.0.contains(&payload) {
                self.0.push(payload);
            }
        }
    }
}

/// Gossiper that relays everything and keeps nothing.
#[derive(Debug, Clone, Copy, Default)]
pub struct SurrogateGossiper;

impl Gossiper for SurrogateGossiper {
    type Data = SurrogateData;

    fn on_gossip_unicast(&self, _sender: PeerName, _msg: &[u8]) -> Result<(), MeshError> {
        Ok(())
    }

    fn on_gossip_broadcast(
        &self,
        _source: PeerName,
        update: &[u8],
    ) -> Result<Option<SurrogateData>, MeshError> {
        Ok(Some(SurrogateData(vec![update.to_vec()])))
    }

    fn gossip(&self) -> Option<SurrogateData> {
        None
    }

    fn on_gossip(&self, update: &[u8]) -> Result<Option<SurrogateData>, MeshError> {
        Ok(Some(SurrogateData(vec![update.to_vec()])))
    }
}
