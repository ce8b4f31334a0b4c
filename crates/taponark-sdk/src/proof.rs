use serde::{Deserialize, Serialize};

/// An asset ownership proof file. Opaque: only the asset wallet reads or
/// extends it.
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProofFile(#[serde(with = "hex::serde")] Vec<u8>);

impl ProofFile {
    pub fn new(bytes: Vec<u8>) -> Self {
        Self(bytes)
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }

    pub fn into_bytes(self) -> Vec<u8> {
        self.0
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl std::fmt::Debug for ProofFile {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "ProofFile({} bytes)", self.0.len())
    }
}

/// The partial transition proof an asset wallet produces when it commits an
/// anchor template. Completed with block data once the anchor confirms.
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TransitionProof(#[serde(with = "hex::serde")] Vec<u8>);

impl TransitionProof {
    pub fn new(bytes: Vec<u8>) -> Self {
        Self(bytes)
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }
}

impl std::fmt::Debug for TransitionProof {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "TransitionProof({})", hex::encode(&self.0))
    }
}
