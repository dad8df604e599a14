//! Transactions and their payload encodings.
//!
//! A transaction is immutable once created: its `id` is the BLAKE3 content
//! hash over every other field, and `depth`/`confidence` are derived from its
//! parents at construction time. The view graph re-derives and checks both
//! when the transaction's ancestry becomes fully available.

use serde::{Deserialize, Serialize};

use crate::{AccountId, TransactionId};

/// The kind of operation a transaction performs.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Tag {
    /// No state change; used to keep the graph moving.
    Nop,
    /// Move PERL between accounts, optionally invoking a contract.
    Transfer,
    /// Deploy a smart contract.
    Contract,
    /// Place or withdraw stake, or request a reward withdrawal.
    Stake,
    /// A batch of sub-transactions applied recursively.
    Batch,
}

impl Tag {
    /// Wire value of the tag.
    pub fn as_u8(self) -> u8 {
        match self {
            Tag::Nop => 0,
            Tag::Transfer => 1,
            Tag::Contract => 2,
            Tag::Stake => 3,
            Tag::Batch => 4,
        }
    }

    /// Decode a wire tag value. Returns `None` for unknown tags.
    pub fn from_u8(value: u8) -> Option<Tag> {
        match value {
            0 => Some(Tag::Nop),
            1 => Some(Tag::Transfer),
            2 => Some(Tag::Contract),
            3 => Some(Tag::Stake),
            4 => Some(Tag::Batch),
            _ => None,
        }
    }
}

/// A transaction in the view graph.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Transaction {
    /// Content hash over all other fields.
    pub id: TransactionId,
    /// The account that relayed this transaction into the network.
    pub sender: AccountId,
    /// The account whose funds and nonce this transaction spends.
    pub creator: AccountId,
    /// Per-creator counter.
    pub nonce: u64,
    /// Parent transaction ids: non-empty, strictly ascending, unique.
    pub parent_ids: Vec<TransactionId>,
    /// 1 + max(parent depth).
    pub depth: u64,
    /// Sum of parent confidences + number of parents.
    pub confidence: u64,
    /// One byte derived from `id`, used as a difficulty index.
    pub seed: u8,
    /// Operation kind.
    pub tag: Tag,
    /// Tag-specific payload; empty iff `tag == Nop`.
    pub payload: Vec<u8>,
}

impl Transaction {
    /// Build a transaction on top of the given parents.
    ///
    /// Parent ids are sorted ascending and deduplicated; `depth`,
    /// `confidence`, `id` and `seed` are computed here. The caller is
    /// responsible for passing currently eligible parents.
    pub fn new(
        sender: AccountId,
        creator: AccountId,
        nonce: u64,
        tag: Tag,
        payload: Vec<u8>,
        parents: &[&Transaction],
    ) -> Transaction {
        let mut unique: Vec<&Transaction> = Vec::new();
        for parent in parents {
            if !unique.iter().any(|p| p.id == parent.id) {
                unique.push(parent);
            }
        }

        let mut parent_ids: Vec<TransactionId> = unique.iter().map(|p| p.id).collect();
        parent_ids.sort();

        let depth = unique.iter().map(|p| p.depth).max().unwrap_or(0) + 1;
        let confidence =
            unique.iter().map(|p| p.confidence).sum::<u64>() + parent_ids.len() as u64;

        let id = Self::compute_id(
            &sender, &creator, nonce, &parent_ids, depth, confidence, tag, &payload,
        );

        Transaction {
            id,
            sender,
            creator,
            nonce,
            parent_ids,
            depth,
            confidence,
            seed: id.0[0],
            tag,
            payload,
        }
    }

    /// Compute the content hash of a transaction from its fields.
    #[allow(clippy::too_many_arguments)]
    pub fn compute_id(
        sender: &AccountId,
        creator: &AccountId,
        nonce: u64,
        parent_ids: &[TransactionId],
        depth: u64,
        confidence: u64,
        tag: Tag,
        payload: &[u8],
    ) -> TransactionId {
        let mut hasher = blake3::Hasher::new();
        hasher.update(&sender.0);
        hasher.update(&creator.0);
        hasher.update(&nonce.to_le_bytes());
        hasher.update(&(parent_ids.len() as u64).to_le_bytes());
        for parent in parent_ids {
            hasher.update(&parent.0);
        }
        hasher.update(&depth.to_le_bytes());
        hasher.update(&confidence.to_le_bytes());
        hasher.update(&[tag.as_u8()]);
        hasher.update(payload);
        TransactionId(*hasher.finalize().as_bytes())
    }

    /// The zero transaction: the implicit root of an empty graph.
    pub fn zero() -> Transaction {
        Transaction {
            id: TransactionId::default(),
            sender: AccountId::default(),
            creator: AccountId::default(),
            nonce: 0,
            parent_ids: Vec::new(),
            depth: 0,
            confidence: 0,
            seed: 0,
            tag: Tag::Nop,
            payload: Vec::new(),
        }
    }
}

/// Errors from payload decoding.
#[derive(Clone, Debug, thiserror::Error)]
pub enum PayloadError {
    #[error("payload does not decode as {kind}: {reason}")]
    Malformed { kind: &'static str, reason: String },
    #[error("batch entry {index} carries unknown tag {tag}")]
    UnknownTag { index: usize, tag: u8 },
    #[error("batch tag/payload counts differ: {tags} tags, {payloads} payloads")]
    BatchLengthMismatch { tags: usize, payloads: usize },
    #[error("batch is empty")]
    EmptyBatch,
    #[error("batch exceeds maximum size of {max} entries")]
    BatchTooLarge { max: usize },
}

fn decode<T: serde::de::DeserializeOwned>(
    kind: &'static str,
    bytes: &[u8],
) -> Result<T, PayloadError> {
    bincode::deserialize(bytes).map_err(|e| PayloadError::Malformed {
        kind,
        reason: e.to_string(),
    })
}

fn encode<T: Serialize>(value: &T) -> Vec<u8> {
    // Serialization of in-memory payload structs cannot fail.
    bincode::serialize(value).unwrap_or_default()
}

/// Payload of a [`Tag::Transfer`] transaction.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TransferPayload {
    pub recipient: AccountId,
    pub amount: u64,
    pub gas_limit: u64,
    pub gas_deposit: u64,
    pub func_name: Vec<u8>,
    pub func_params: Vec<u8>,
}

impl TransferPayload {
    pub fn decode(bytes: &[u8]) -> Result<TransferPayload, PayloadError> {
        decode("transfer", bytes)
    }

    pub fn encode(&self) -> Vec<u8> {
        encode(self)
    }
}

/// Stake operation selector.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum StakeOpcode {
    PlaceStake,
    WithdrawStake,
    WithdrawReward,
}

/// Payload of a [`Tag::Stake`] transaction.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct StakePayload {
    pub opcode: StakeOpcode,
    pub amount: u64,
}

impl StakePayload {
    pub fn decode(bytes: &[u8]) -> Result<StakePayload, PayloadError> {
        decode("stake", bytes)
    }

    pub fn encode(&self) -> Vec<u8> {
        encode(self)
    }
}

/// Payload of a [`Tag::Contract`] transaction.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ContractPayload {
    pub gas_limit: u64,
    pub gas_deposit: u64,
    pub params: Vec<u8>,
    pub code: Vec<u8>,
}

impl ContractPayload {
    pub fn decode(bytes: &[u8]) -> Result<ContractPayload, PayloadError> {
        decode("contract", bytes)
    }

    pub fn encode(&self) -> Vec<u8> {
        encode(self)
    }
}

/// Maximum number of entries in a batch transaction.
pub const MAX_BATCH_SIZE: usize = u8::MAX as usize;

/// Payload of a [`Tag::Batch`] transaction.
///
/// Each entry is a (tag, payload) pair applied recursively as a synthesized
/// sub-transaction inheriting the outer id, sender, creator and nonce.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct BatchPayload {
    pub tags: Vec<u8>,
    pub payloads: Vec<Vec<u8>>,
}

impl BatchPayload {
    pub fn decode(bytes: &[u8]) -> Result<BatchPayload, PayloadError> {
        let batch: BatchPayload = decode("batch", bytes)?;
        batch.validate()?;
        Ok(batch)
    }

    pub fn encode(&self) -> Vec<u8> {
        encode(self)
    }

    /// Append an entry to the batch.
    pub fn push(&mut self, tag: Tag, payload: Vec<u8>) {
        self.tags.push(tag.as_u8());
        self.payloads.push(payload);
    }

    pub fn len(&self) -> usize {
        self.tags.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tags.is_empty()
    }

    fn validate(&self) -> Result<(), PayloadError> {
        if self.tags.len() != self.payloads.len() {
            return Err(PayloadError::BatchLengthMismatch {
                tags: self.tags.len(),
                payloads: self.payloads.len(),
            });
        }
        if self.tags.is_empty() {
            return Err(PayloadError::EmptyBatch);
        }
        if self.tags.len() > MAX_BATCH_SIZE {
            return Err(PayloadError::BatchTooLarge { max: MAX_BATCH_SIZE });
        }
        for (index, &tag) in self.tags.iter().enumerate() {
            if Tag::from_u8(tag).is_none() {
                return Err(PayloadError::UnknownTag { index, tag });
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn account(byte: u8) -> AccountId {
        AccountId([byte; 32])
    }

    #[test]
    fn new_transaction_derives_depth_and_confidence() {
        let root = Transaction::zero();
        let a = Transaction::new(account(1), account(1), 0, Tag::Nop, vec![], &[&root]);
        assert_eq!(a.depth, 1);
        assert_eq!(a.confidence, 1);

        let b = Transaction::new(account(2), account(2), 0, Tag::Nop, vec![], &[&root]);
        let c = Transaction::new(account(3), account(3), 0, Tag::Nop, vec![], &[&a, &b]);
        assert_eq!(c.depth, 2);
        assert_eq!(c.confidence, a.confidence + b.confidence + 2);
        assert_eq!(c.parent_ids.len(), 2);
        assert!(c.parent_ids[0] < c.parent_ids[1]);
    }

    #[test]
    fn seed_comes_from_id() {
        let root = Transaction::zero();
        let tx = Transaction::new(account(1), account(1), 7, Tag::Nop, vec![], &[&root]);
        assert_eq!(tx.seed, tx.id.0[0]);
    }

    #[test]
    fn id_changes_with_content() {
        let root = Transaction::zero();
        let a = Transaction::new(account(1), account(1), 0, Tag::Nop, vec![], &[&root]);
        let b = Transaction::new(account(1), account(1), 1, Tag::Nop, vec![], &[&root]);
        assert_ne!(a.id, b.id);
    }

    #[test]
    fn transfer_payload_round_trips() {
        let payload = TransferPayload {
            recipient: account(9),
            amount: 1234,
            gas_limit: 50_000,
            gas_deposit: 10,
            func_name: b"on_receive".to_vec(),
            func_params: vec![1, 2, 3],
        };
        let decoded = TransferPayload::decode(&payload.encode()).unwrap();
        assert_eq!(decoded, payload);
    }

    #[test]
    fn malformed_payload_rejected() {
        assert!(TransferPayload::decode(&[0x01]).is_err());
        assert!(StakePayload::decode(b"garbage").is_err());
    }

    #[test]
    fn batch_validation_catches_mismatch() {
        let batch = BatchPayload {
            tags: vec![Tag::Nop.as_u8(), Tag::Transfer.as_u8()],
            payloads: vec![vec![]],
        };
        assert!(matches!(
            BatchPayload::decode(&batch.encode()),
            Err(PayloadError::BatchLengthMismatch { .. })
        ));
    }

    #[test]
    fn batch_validation_catches_unknown_tag() {
        let batch = BatchPayload {
            tags: vec![99],
            payloads: vec![vec![]],
        };
        assert!(matches!(
            BatchPayload::decode(&batch.encode()),
            Err(PayloadError::UnknownTag { index: 0, tag: 99 })
        ));
    }

    #[test]
    fn empty_batch_rejected() {
        let batch = BatchPayload::default();
        assert!(matches!(
            BatchPayload::decode(&batch.encode()),
            Err(PayloadError::EmptyBatch)
        ));
    }
}
