//! Participant identities and signatures.
use crate::error::Error;
use core::cmp::Ordering;
use core::fmt::{Debug, Formatter, Result as FmtResult};
use core::hash::{Hash, Hasher};
use data_encoding::HEXUPPER;
use p256::ecdsa::signature::{Signer, Verifier};
use p256::ecdsa::{Signature as RawSignature, SigningKey, VerifyingKey};
use p256::elliptic_curve::sec1::ToEncodedPoint;
use rand::rngs::OsRng;
use serde::de::Error as SerdeError;
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use std::collections::BTreeMap;

pub const SIGNATURE_LENGTH: usize = 64;

/// Stable participant id derived from the public key bytes.
pub fn participant_id(pub_bytes: &[u8]) -> String {
    format!("0x{}", HEXUPPER.encode(pub_bytes))
}

/// An ECDSA signature over a 32-byte digest.
#[derive(Clone, Eq, PartialEq)]
pub struct Signature(RawSignature);

impl Debug for Signature {
    fn fmt(&self, f: &mut Formatter) -> FmtResult {
        write!(f, "{}", HEXUPPER.encode(&self.to_bytes()))
    }
}

impl Serialize for Signature {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_bytes(&self.to_bytes())
    }
}

impl<'de> Deserialize<'de> for Signature {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let bytes: Vec<u8> = Deserialize::deserialize(deserializer)?;
        Self::from_bytes(&bytes).map_err(SerdeError::custom)
    }
}

impl PartialOrd for Signature {
    fn partial_cmp(&self, other: &Signature) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for Signature {
    fn cmp(&self, other: &Signature) -> Ordering {
        self.to_bytes().cmp(&other.to_bytes())
    }
}

impl Hash for Signature {
    fn hash<H: Hasher>(&self, h: &mut H) {
        self.to_bytes().hash(h);
    }
}

impl Signature {
    pub fn from_bytes(bytes: &[u8]) -> Result<Self, Error> {
        let raw = RawSignature::from_slice(bytes).map_err(|_| Error::InvalidSignature)?;
        Ok(Self(raw))
    }

    /// Fixed-width `r || s` encoding.
    pub fn to_bytes(&self) -> [u8; SIGNATURE_LENGTH] {
        let mut bytes = [0u8; SIGNATURE_LENGTH];
        bytes.copy_from_slice(&self.0.to_bytes());
        bytes
    }
}

/// Verify `sig` over `msg` against SEC1-encoded public key bytes.
pub fn verify(pub_bytes: &[u8], msg: &[u8], sig: &Signature) -> Result<(), Error> {
    let key = VerifyingKey::from_sec1_bytes(pub_bytes).map_err(|_| Error::InvalidSignature)?;
    key.verify(msg, &sig.0).map_err(|_| Error::InvalidSignature)
}

/// A participant's signing keypair.
#[derive(Clone, Debug)]
pub struct Identity(SigningKey);

impl Identity {
    pub fn generate() -> Self {
        Self(SigningKey::random(&mut OsRng))
    }

    pub fn from_bytes(bytes: &[u8]) -> Result<Self, Error> {
        let key = SigningKey::from_slice(bytes).map_err(|_| Error::InvalidSignature)?;
        Ok(Self(key))
    }

    pub fn sign(&self, msg: &[u8]) -> Signature {
        Signature(self.0.sign(msg))
    }

    /// Uncompressed SEC1 public key bytes.
    pub fn public_bytes(&self) -> Vec<u8> {
        self.0
            .verifying_key()
            .to_encoded_point(false)
            .as_bytes()
            .to_vec()
    }

    pub fn id(&self) -> String {
        participant_id(&self.public_bytes())
    }
}

/// The fixed participant set, keyed by id.
#[derive(Clone, Debug, Default)]
pub struct Participants {
    inner: BTreeMap<String, Vec<u8>>,
}

impl Participants {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a participant by public key bytes and return its id.
    pub fn add(&mut self, pub_bytes: &[u8]) -> String {
        let id = participant_id(pub_bytes);
        self.inner.insert(id.clone(), pub_bytes.to_vec());
        id
    }

    pub fn contains(&self, id: &str) -> bool {
        self.inner.contains_key(id)
    }

    pub fn pub_key(&self, id: &str) -> Result<&[u8], Error> {
        self.inner
            .get(id)
            .map(|b| b.as_slice())
            .ok_or_else(|| Error::UnknownParticipant(id.to_string()))
    }

    /// Ids in stable (sorted) order.
    pub fn ids(&self) -> Vec<String> {
        self.inner.keys().cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.inner.len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.is_empty()
    }

    /// Supermajority threshold: the smallest count strictly greater than
    /// two thirds of the population.
    pub fn supermajority(&self) -> usize {
        2 * self.len() / 3 + 1
    }
}
