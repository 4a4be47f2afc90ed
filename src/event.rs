//! Events and their wire form.
use crate::block::BlockSignature;
use crate::error::Error;
use crate::hash::{Hash, Hasher};
use crate::identity::{self, participant_id, Identity, Signature};
use serde::{Deserialize, Serialize};
use std::time::{SystemTime, UNIX_EPOCH};

/// Creator-local wall clock in Unix nanoseconds.
pub fn timestamp_now() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_nanos() as i64)
        .unwrap_or_default()
}

/// The signed portion of an event. Immutable once hashed.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
pub struct EventBody {
    pub transactions: Vec<Vec<u8>>,
    pub block_signatures: Vec<BlockSignature>,
    pub self_parent: Hash,
    pub other_parent: Hash,
    /// Creator's SEC1 public key bytes.
    pub creator: Vec<u8>,
    pub index: i64,
    pub timestamp: i64,
}

impl EventBody {
    pub fn new(
        transactions: Vec<Vec<u8>>,
        block_signatures: Vec<BlockSignature>,
        self_parent: Hash,
        other_parent: Hash,
        creator: Vec<u8>,
        index: i64,
    ) -> Self {
        Self {
            transactions,
            block_signatures,
            self_parent,
            other_parent,
            creator,
            index,
            timestamp: timestamp_now(),
        }
    }

    /// Canonical byte encoding; the event hash is the SHA-256 of these
    /// bytes.
    pub fn canonical_bytes(&self) -> Result<Vec<u8>, Error> {
        Ok(bincode::serialize(self)?)
    }

    pub fn hash(&self) -> Result<Hash, Error> {
        Ok(Hasher::digest(&self.canonical_bytes()?))
    }
}

/// A node of the gossip graph: a signed body plus state derived by the
/// consensus engine.
#[derive(Clone, Debug)]
pub struct Event {
    body: EventBody,
    signature: Signature,
    hash: Hash,
    creator_id: String,
    pub(crate) topological_index: i64,
    pub(crate) round: Option<i64>,
    pub(crate) witness: Option<bool>,
    pub(crate) round_received: Option<i64>,
    pub(crate) consensus_timestamp: Option<i64>,
}

impl Event {
    /// Wrap a body with an existing signature, recomputing the hash.
    pub fn new(body: EventBody, signature: Signature) -> Result<Self, Error> {
        let hash = body.hash()?;
        let creator_id = participant_id(&body.creator);
        Ok(Self {
            body,
            signature,
            hash,
            creator_id,
            topological_index: -1,
            round: None,
            witness: None,
            round_received: None,
            consensus_timestamp: None,
        })
    }

    /// Hash and sign a body with the creator's key.
    pub fn sign(body: EventBody, identity: &Identity) -> Result<Self, Error> {
        let hash = body.hash()?;
        let signature = identity.sign(&*hash);
        Self::new(body, signature)
    }

    /// Check the creator's signature over the event hash.
    pub fn verify(&self) -> Result<(), Error> {
        identity::verify(&self.body.creator, &*self.hash, &self.signature)
    }

    pub fn transactions(&self) -> &[Vec<u8>] {
        &self.body.transactions
    }

    pub fn block_signatures(&self) -> &[BlockSignature] {
        &self.body.block_signatures
    }

    pub fn self_parent(&self) -> Hash {
        self.body.self_parent
    }

    pub fn other_parent(&self) -> Hash {
        self.body.other_parent
    }

    pub fn creator(&self) -> &[u8] {
        &self.body.creator
    }

    pub fn creator_id(&self) -> &str {
        &self.creator_id
    }

    pub fn index(&self) -> i64 {
        self.body.index
    }

    pub fn timestamp(&self) -> i64 {
        self.body.timestamp
    }

    pub fn hash(&self) -> &Hash {
        &self.hash
    }

    pub fn signature(&self) -> &Signature {
        &self.signature
    }

    /// Round assigned by the engine, once divided.
    pub fn round(&self) -> Option<i64> {
        self.round
    }

    /// Is this the creator's first event of its round.
    pub fn witness(&self) -> Option<bool> {
        self.witness
    }

    pub fn round_received(&self) -> Option<i64> {
        self.round_received
    }

    pub fn consensus_timestamp(&self) -> Option<i64> {
        self.consensus_timestamp
    }
}

/// Event as gossiped: parents are (participant, index) coordinates so the
/// receiver reconstructs the hashes from its own store.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct WireBody {
    pub transactions: Vec<Vec<u8>>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub block_signatures: Vec<BlockSignature>,
    pub self_parent_index: i64,
    pub other_parent_creator_id: String,
    pub other_parent_index: i64,
    pub creator_id: String,
    pub index: i64,
    pub timestamp: i64,
}

#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
pub struct WireEvent {
    pub body: WireBody,
    pub signature: Signature,
}
