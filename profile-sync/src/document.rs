//! Profile documents and their CRDT container.
//!
//! A [`Document`] is an opaque JSON record. Inside the replicated yrs doc it
//! lives as one serialized string under a single designated field:
//!
//! ```text
//! Doc ── Map "profile" ── "snapshot": "<compact JSON>"
//! ```
//!
//! Nothing here interprets the nested structure; the string is parsed only
//! to validate it and to produce a canonical form for change detection.

use serde::{Deserialize, Serialize};
use yrs::updates::decoder::Decode;
use yrs::updates::encoder::Encode;
use yrs::{Any, Map, MapRef, Observable, Out, ReadTxn, Transact};

use crate::protocol::ProtocolError;

/// Name of the shared map holding the profile.
pub const PROFILE_MAP: &str = "profile";

/// Key of the designated snapshot field inside [`PROFILE_MAP`].
pub const SNAPSHOT_FIELD: &str = "snapshot";

/// An arbitrary JSON-serializable profile record.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Document(serde_json::Value);

impl Document {
    pub fn new(value: serde_json::Value) -> Self {
        Self(value)
    }

    /// Parse a serialized snapshot.
    pub fn parse(raw: &str) -> Result<Self, ProtocolError> {
        serde_json::from_str(raw)
            .map(Self)
            .map_err(|e| ProtocolError::DeserializationError(e.to_string()))
    }

    /// Canonical compact serialization. Object keys come out sorted, so two
    /// documents with equal content always produce identical bytes.
    pub fn to_snapshot(&self) -> String {
        self.0.to_string()
    }

    pub fn as_value(&self) -> &serde_json::Value {
        &self.0
    }

    pub fn into_value(self) -> serde_json::Value {
        self.0
    }
}

impl From<serde_json::Value> for Document {
    fn from(value: serde_json::Value) -> Self {
        Self(value)
    }
}

/// Yrs document carrying one profile snapshot.
pub struct ProfileDoc {
    doc: yrs::Doc,
    map: MapRef,
}

impl ProfileDoc {
    pub fn new() -> Self {
        let doc = yrs::Doc::new();
        let map = doc.get_or_insert_map(PROFILE_MAP);
        Self { doc, map }
    }

    /// Current raw value of the snapshot field.
    pub fn snapshot(&self) -> Option<String> {
        let txn = self.doc.transact();
        read_snapshot(&self.map, &txn)
    }

    /// Overwrite the snapshot field and return the encoded update.
    pub fn set_snapshot(&self, raw: &str) -> Vec<u8> {
        let mut txn = self.doc.transact_mut();
        self.map.insert(&mut txn, SNAPSHOT_FIELD, raw.to_string());
        txn.encode_update_v1()
    }

    /// Encoded state vector, for a SyncStep1.
    pub fn state_vector(&self) -> Vec<u8> {
        let txn = self.doc.transact();
        txn.state_vector().encode_v1()
    }

    /// Everything the remote side is missing, for a SyncStep2.
    pub fn diff(&self, remote_state_vector: &[u8]) -> Result<Vec<u8>, ProtocolError> {
        let sv = yrs::StateVector::decode_v1(remote_state_vector)
            .map_err(|e| ProtocolError::InvalidUpdate(e.to_string()))?;
        let txn = self.doc.transact();
        Ok(txn.encode_diff_v1(&sv))
    }

    /// Full state as a single update.
    pub fn full_state(&self) -> Vec<u8> {
        let txn = self.doc.transact();
        txn.encode_state_as_update_v1(&yrs::StateVector::default())
    }

    /// Integrate a remote update (SyncStep2 or Update payload).
    pub fn apply_update(&self, update: &[u8]) -> Result<(), ProtocolError> {
        let update = yrs::Update::decode_v1(update)
            .map_err(|e| ProtocolError::InvalidUpdate(e.to_string()))?;
        let mut txn = self.doc.transact_mut();
        txn.apply_update(update)
            .map_err(|e| ProtocolError::InvalidUpdate(format!("{e:?}")))
    }

    /// Run `f` with the new raw snapshot whenever the profile map changes.
    ///
    /// The callback fires inside the committing transaction: it must not
    /// open another transaction on this document. Dropping the returned
    /// subscription removes the observer.
    pub fn observe_snapshot<F>(&self, f: F) -> yrs::Subscription
    where
        F: Fn(String) + Send + Sync + 'static,
    {
        self.map.observe(move |txn, event| {
            if let Some(raw) = read_snapshot(event.target(), txn) {
                f(raw);
            }
        })
    }
}

impl Default for ProfileDoc {
    fn default() -> Self {
        Self::new()
    }
}

fn read_snapshot<T: ReadTxn>(map: &MapRef, txn: &T) -> Option<String> {
    match map.get(txn, SNAPSHOT_FIELD)? {
        Out::Any(Any::String(s)) => Some(s.to_string()),
        other => {
            log::debug!("Ignoring non-string snapshot field: {other:?}");
            None
        }
    }
}
