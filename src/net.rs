//! Gossip messages and transport.
//!
//! The TCP layer frames these messages as length-prefixed JSON; here only
//! the message types and an in-memory channel transport are provided.
use crate::error::Error;
use crate::event::WireEvent;
use async_std::channel::{bounded, Sender};
use async_std::future::timeout;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::time::Duration;

#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
pub struct SyncRequest {
    pub from_id: String,
    pub known: HashMap<String, i64>,
}

#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
pub struct SyncResponse {
    pub from_id: String,
    pub sync_limit: bool,
    pub events: Vec<WireEvent>,
    pub known: HashMap<String, i64>,
}

#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
pub struct EagerSyncRequest {
    pub from_id: String,
    pub events: Vec<WireEvent>,
}

#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
pub struct EagerSyncResponse {
    pub from_id: String,
    pub success: bool,
}

#[derive(Clone, Debug)]
pub enum Request {
    Sync(SyncRequest),
    EagerSync(EagerSyncRequest),
}

#[derive(Clone, Debug)]
pub enum Response {
    Sync(SyncResponse),
    EagerSync(EagerSyncResponse),
}

/// An incoming request paired with its reply channel.
#[derive(Debug)]
pub struct Rpc {
    pub request: Request,
    pub resp: Sender<Response>,
}

/// Channel-backed transport between nodes in the same process.
///
/// Requests are posted to the receiver's inbox and the reply is awaited
/// with a deadline, so two nodes syncing into each other at the same time
/// cannot wedge one another.
#[derive(Clone, Debug, Default)]
pub struct InmemTransport {
    peers: HashMap<String, Sender<Rpc>>,
    reply_timeout: Option<Duration>,
}

impl InmemTransport {
    pub fn new(reply_timeout: Duration) -> Self {
        Self {
            peers: HashMap::new(),
            reply_timeout: Some(reply_timeout),
        }
    }

    pub fn add_peer(&mut self, id: impl Into<String>, inbox: Sender<Rpc>) {
        self.peers.insert(id.into(), inbox);
    }

    async fn call(&self, peer: &str, request: Request) -> Result<Response, Error> {
        let inbox = self
            .peers
            .get(peer)
            .ok_or_else(|| Error::UnknownParticipant(peer.to_string()))?;
        let (tx, rx) = bounded(1);
        inbox
            .send(Rpc { request, resp: tx })
            .await
            .map_err(|_| Error::Shutdown)?;
        let response = match self.reply_timeout {
            Some(deadline) => timeout(deadline, rx.recv())
                .await
                .map_err(|_| Error::ProxyTimeout)?,
            None => rx.recv().await,
        };
        response.map_err(|_| Error::Shutdown)
    }

    pub async fn sync(&self, peer: &str, req: SyncRequest) -> Result<SyncResponse, Error> {
        match self.call(peer, Request::Sync(req)).await? {
            Response::Sync(resp) => Ok(resp),
            Response::EagerSync(_) => Err(Error::Shutdown),
        }
    }

    pub async fn eager_sync(
        &self,
        peer: &str,
        req: EagerSyncRequest,
    ) -> Result<EagerSyncResponse, Error> {
        match self.call(peer, Request::EagerSync(req)).await? {
            Response::EagerSync(resp) => Ok(resp),
            Response::Sync(_) => Err(Error::Shutdown),
        }
    }
}
