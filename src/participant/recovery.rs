//! Startup recovery
//!
//! Rebuilds the transaction table and store by re-running every logged
//! transition once, in order, through the same `apply_record` the live path
//! uses. No network interaction happens here.

use crate::common::{Result, Wal};
use crate::participant::txn::{Participant, ParticipantRecord};

/// Replay the participant's own WAL into it. Returns the number of records
/// applied.
pub(crate) fn replay(participant: &mut Participant) -> Result<usize> {
    let path = participant.wal_path().to_path_buf();
    let mut applied = 0usize;

    Wal::<ParticipantRecord>::replay(&path, |entry| {
        participant.apply_record(&entry.record);
        applied += 1;
        Ok(())
    })?;

    if applied > 0 {
        let status = participant.status();
        tracing::info!(
            node = %participant.node_id(),
            records = applied,
            transactions = status.transactions.len(),
            keys = status.store.len(),
            "Recovered state from WAL"
        );
    }
    Ok(applied)
}
