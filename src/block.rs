//! Finalized blocks of application transactions.
use crate::error::Error;
use crate::hash::{Hash, Hasher};
use crate::identity::{self, Identity, Signature};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// A participant's signature over a block, gossiped inside events.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
pub struct BlockSignature {
    /// Participant id of the signer.
    pub validator: String,
    /// Index of the signed block.
    pub index: i64,
    pub signature: Vec<u8>,
}

/// The signed portion of a block.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
pub struct BlockBody {
    pub index: i64,
    pub round_received: i64,
    /// Application state hash returned by the commit callback.
    pub state_hash: Vec<u8>,
    pub transactions: Vec<Vec<u8>>,
}

/// An ordered group of finalized transactions. Emitted with strictly
/// increasing indices starting at 0.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
pub struct Block {
    body: BlockBody,
    signatures: BTreeMap<String, Vec<u8>>,
}

impl Block {
    pub fn new(index: i64, round_received: i64, transactions: Vec<Vec<u8>>) -> Self {
        Self {
            body: BlockBody {
                index,
                round_received,
                state_hash: Vec::new(),
                transactions,
            },
            signatures: BTreeMap::new(),
        }
    }

    pub fn index(&self) -> i64 {
        self.body.index
    }

    pub fn round_received(&self) -> i64 {
        self.body.round_received
    }

    pub fn transactions(&self) -> &[Vec<u8>] {
        &self.body.transactions
    }

    pub fn state_hash(&self) -> &[u8] {
        &self.body.state_hash
    }

    pub fn set_state_hash(&mut self, state_hash: Vec<u8>) {
        self.body.state_hash = state_hash;
    }

    pub fn signatures(&self) -> &BTreeMap<String, Vec<u8>> {
        &self.signatures
    }

    pub fn hash(&self) -> Result<Hash, Error> {
        Ok(Hasher::digest(&bincode::serialize(&self.body)?))
    }

    /// Sign the block body and produce a gossipable signature record.
    pub fn sign(&self, identity: &Identity) -> Result<BlockSignature, Error> {
        let signature = identity.sign(&*self.hash()?);
        Ok(BlockSignature {
            validator: identity.id(),
            index: self.index(),
            signature: signature.to_bytes().to_vec(),
        })
    }

    /// Verify a peer signature against its public key and attach it.
    pub fn add_signature(&mut self, bs: &BlockSignature, pub_bytes: &[u8]) -> Result<(), Error> {
        let signature = Signature::from_bytes(&bs.signature)?;
        identity::verify(pub_bytes, &*self.hash()?, &signature)?;
        self.signatures
            .insert(bs.validator.clone(), bs.signature.clone());
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sign_and_attach() {
        let id = Identity::generate();
        let mut block = Block::new(0, 1, vec![b"tx1".to_vec(), b"tx2".to_vec()]);
        block.set_state_hash(b"state".to_vec());

        let bs = block.sign(&id).unwrap();
        assert_eq!(bs.index, 0);
        block.add_signature(&bs, &id.public_bytes()).unwrap();
        assert_eq!(block.signatures().len(), 1);

        // signature over a different body is rejected
        let other = Block::new(1, 2, vec![]).sign(&id).unwrap();
        assert!(block.add_signature(&other, &id.public_bytes()).is_err());
    }

    #[test]
    fn hash_covers_state() {
        let mut a = Block::new(0, 1, vec![b"tx".to_vec()]);
        let h1 = a.hash().unwrap();
        a.set_state_hash(b"state".to_vec());
        assert_ne!(h1, a.hash().unwrap());
    }
}
