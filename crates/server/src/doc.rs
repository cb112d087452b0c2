// Document handle over yrs (the y-crdt Rust implementation).
//
// The relay treats document content as opaque: it only ever applies updates,
// encodes full state for snapshots, and computes diffs for the handshake.
// The text helpers exist for tests, which need to observe convergence.

use anyhow::{Context, Result};
use yrs::updates::decoder::Decode;
use yrs::updates::encoder::Encode;
use yrs::{Doc, GetString, ReadTxn, StateVector, Text, Transact, Update};

#[derive(Debug)]
pub struct SharedDoc {
    doc: Doc,
}

impl SharedDoc {
    pub fn new() -> Self {
        Self { doc: Doc::new() }
    }

    /// Deterministic client id, for tests that compare encoded state.
    pub fn with_client_id(client_id: u64) -> Self {
        let options = yrs::Options { client_id, ..Default::default() };
        Self { doc: Doc::with_options(options) }
    }

    /// Rebuild a document from a full-state update (snapshot hydration).
    pub fn from_state(data: &[u8]) -> Result<Self> {
        let doc = Self::new();
        doc.apply_update(data)?;
        Ok(doc)
    }

    /// Merge an encoded update into the document.
    pub fn apply_update(&self, data: &[u8]) -> Result<()> {
        let update = Update::decode_v1(data).context("failed to decode document update")?;
        self.doc.transact_mut().apply_update(update).context("failed to apply document update")?;
        Ok(())
    }

    /// Full document state as a single self-contained update.
    pub fn encode_state(&self) -> Vec<u8> {
        self.doc.transact().encode_state_as_update_v1(&StateVector::default())
    }

    pub fn encode_state_vector(&self) -> Vec<u8> {
        self.doc.transact().state_vector().encode_v1()
    }

    /// Everything the peer behind `remote_sv` has not seen yet.
    pub fn encode_diff(&self, remote_sv: &[u8]) -> Result<Vec<u8>> {
        let sv = StateVector::decode_v1(remote_sv).context("failed to decode state vector")?;
        Ok(self.doc.transact().encode_diff_v1(&sv))
    }

    pub fn insert_text(&self, name: &str, index: u32, content: &str) {
        let text = self.doc.get_or_insert_text(name);
        let mut txn = self.doc.transact_mut();
        text.insert(&mut txn, index, content);
    }

    pub fn get_text_string(&self, name: &str) -> String {
        let text = self.doc.get_or_insert_text(name);
        text.get_string(&self.doc.transact())
    }
}

impl Default for SharedDoc {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn state_round_trips_through_encode_and_rebuild() {
        let doc = SharedDoc::new();
        doc.insert_text("script", 0, "INT. CAVERN - NIGHT");

        let state = doc.encode_state();
        let restored = SharedDoc::from_state(&state).expect("state should decode");
        assert_eq!(restored.get_text_string("script"), "INT. CAVERN - NIGHT");
    }

    #[test]
    fn diff_against_state_vector_syncs_peers() {
        let doc_a = SharedDoc::with_client_id(1);
        let doc_b = SharedDoc::with_client_id(2);
        doc_a.insert_text("script", 0, "hello");

        let diff = doc_a.encode_diff(&doc_b.encode_state_vector()).expect("sv should decode");
        doc_b.apply_update(&diff).expect("diff should apply");

        assert_eq!(doc_b.get_text_string("script"), "hello");
    }

    #[test]
    fn garbage_update_is_an_error() {
        let doc = SharedDoc::new();
        assert!(doc.apply_update(&[0xff, 0xff, 0xff, 0xff]).is_err());
        assert!(doc.encode_diff(&[0xff, 0xff]).is_err());
    }

    #[test]
    fn concurrent_updates_converge_in_any_order() {
        // Three writers branch from the same snapshot and each produce one
        // update; every application order must yield identical full state.
        let base = {
            let doc = SharedDoc::with_client_id(100);
            doc.insert_text("script", 0, "base");
            doc.encode_state()
        };

        let mut updates = Vec::new();
        for (client_id, line) in [(1u64, "[a]"), (2, "[b]"), (3, "[c]")] {
            let doc = SharedDoc::with_client_id(client_id);
            doc.apply_update(&base).expect("base should apply");
            let before = doc.encode_state_vector();
            doc.insert_text("script", 0, line);
            updates.push(doc.encode_diff(&before).expect("own sv should decode"));
        }

        let orders: [[usize; 3]; 6] =
            [[0, 1, 2], [0, 2, 1], [1, 0, 2], [1, 2, 0], [2, 0, 1], [2, 1, 0]];
        let mut reference: Option<(Vec<u8>, String)> = None;
        for order in orders {
            let doc = SharedDoc::with_client_id(200);
            doc.apply_update(&base).expect("base should apply");
            for index in order {
                doc.apply_update(&updates[index]).expect("update should apply");
            }
            let result = (doc.encode_state(), doc.get_text_string("script"));
            match &reference {
                None => reference = Some(result),
                Some(expected) => assert_eq!(&result, expected, "order {order:?} diverged"),
            }
        }
    }
}
