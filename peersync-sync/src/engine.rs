//! Sync engine: documents, sessions and the merge path.
//!
//! All mutable state sits behind one async mutex. A critical section is
//! exactly one local apply, one chunk merge or one session transition.
//! Serialization, compression and encryption run outside the lock.

use crate::codec;
use crate::error::{SyncError, SyncResult};
use crate::event::SyncEvent;
use crate::pairing::PairwiseKeyStore;
use crate::protocol::{SessionConfiguration, SyncDataChunk};
use crate::state::{SessionState, SyncConflict, SyncProgress, SyncSession, SyncStatistics};
use peersync_crdt::{ConflictPolicy, CrdtDocument, CrdtOperation, OperationDraft};
use peersync_crypto::{ChaChaEncryptionService, EncryptionService};
use peersync_types::{
    ChunkId, DeviceId, DocumentId, HybridLogicalClock, HybridTimestamp, SessionId,
};
use serde_json::Value;
use std::collections::{BTreeMap, BTreeSet, HashMap, HashSet, VecDeque};
use std::sync::Arc;
use tokio::sync::{Mutex, broadcast};
use tracing::{debug, info, warn};

/// Configuration for the sync engine.
#[derive(Debug, Clone)]
pub struct SyncConfig {
    /// Device name for identification.
    pub device_name: String,
    /// How concurrent writes are resolved.
    pub conflict_policy: ConflictPolicy,
    /// Payload options used when a session does not specify its own.
    pub default_configuration: SessionConfiguration,
    /// Capacity of the event and progress broadcast channels.
    pub event_capacity: usize,
    /// How many finished sessions stay queryable before being dropped.
    pub session_history: usize,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            device_name: "PeerSync Device".to_string(),
            conflict_policy: ConflictPolicy::default(),
            default_configuration: SessionConfiguration::default(),
            event_capacity: 256,
            session_history: 64,
        }
    }
}

/// Outcome of merging one chunk.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MergeReport {
    /// Operations that were new to this device.
    pub merged: usize,
    /// Operations already present (ignored).
    pub duplicates: usize,
    /// Conflicts recorded while merging.
    pub conflicts: usize,
    /// Greatest operation timestamp in the chunk.
    pub cursor: Option<HybridTimestamp>,
}

struct Identity {
    device_id: DeviceId,
    clock: HybridLogicalClock,
}

/// A chunk sent to a peer and not yet acknowledged.
struct InFlight {
    session_id: SessionId,
    peer: DeviceId,
    /// Oldest operation merged from another device since the chunk was
    /// built. The peer has not seen it, whatever the ack claims.
    floor: Option<HybridTimestamp>,
}

#[derive(Default)]
struct EngineState {
    identity: Option<Identity>,
    documents: BTreeMap<DocumentId, CrdtDocument>,
    sessions: HashMap<SessionId, SyncSession>,
    /// Terminal sessions, oldest first.
    finished: VecDeque<SessionId>,
    /// Per peer: everything up to this timestamp is known to have arrived.
    peer_cursors: HashMap<DeviceId, HybridTimestamp>,
    in_flight: HashMap<ChunkId, InFlight>,
    total_conflicts: usize,
}

impl EngineState {
    fn identity_mut(&mut self) -> SyncResult<&mut Identity> {
        self.identity.as_mut().ok_or(SyncError::NotInitialized)
    }

    fn device_id(&self) -> SyncResult<&DeviceId> {
        self.identity
            .as_ref()
            .map(|identity| &identity.device_id)
            .ok_or(SyncError::NotInitialized)
    }

    fn session_mut(&mut self, session_id: SessionId) -> SyncResult<&mut SyncSession> {
        self.sessions
            .get_mut(&session_id)
            .ok_or(SyncError::SessionNotFound(session_id))
    }

    /// Like [`Self::session_mut`], but rejects sessions that already ended.
    fn active_session_mut(&mut self, session_id: SessionId) -> SyncResult<&mut SyncSession> {
        let session = self.session_mut(session_id)?;
        if session.state.is_terminal() {
            return Err(SyncError::SessionClosed {
                session_id,
                state: session.state,
            });
        }
        Ok(session)
    }

    /// Pulls back cursors of other peers so an operation that arrived late
    /// (relayed from a third device) is offered to them again. Chunks still
    /// in flight to those peers remember it too, so their ack cannot carry
    /// the cursor past it.
    fn rewind_cursors(&mut self, from: &DeviceId, timestamp: &HybridTimestamp) {
        for (peer, cursor) in &mut self.peer_cursors {
            if peer != from && *cursor >= *timestamp {
                *cursor = just_before(timestamp);
            }
        }
        for chunk in self.in_flight.values_mut() {
            let lower = chunk.floor.as_ref().is_none_or(|floor| timestamp < floor);
            if chunk.peer != *from && lower {
                chunk.floor = Some(timestamp.clone());
            }
        }
    }

    /// Drops what a finished session left behind and evicts the oldest
    /// finished sessions beyond `keep`.
    fn retire(&mut self, session_id: SessionId, keep: usize) {
        self.in_flight.retain(|_, chunk| chunk.session_id != session_id);
        self.finished.push_back(session_id);
        while self.finished.len() > keep {
            if let Some(oldest) = self.finished.pop_front() {
                self.sessions.remove(&oldest);
            }
        }
    }
}

/// The greatest timestamp ordered before `timestamp` on its wall clock.
fn just_before(timestamp: &HybridTimestamp) -> HybridTimestamp {
    HybridTimestamp::new(
        timestamp.wall_clock_millis().saturating_sub(1),
        u32::MAX,
        timestamp.device_id().clone(),
    )
}

/// The sync engine. Cheap to share behind an `Arc`.
pub struct SyncEngine {
    config: SyncConfig,
    state: Mutex<EngineState>,
    encryption: Arc<dyn EncryptionService>,
    keys: Arc<dyn PairwiseKeyStore>,
    events: broadcast::Sender<SyncEvent>,
    progress: broadcast::Sender<SyncProgress>,
}

impl SyncEngine {
    /// Creates an engine using ChaCha20-Poly1305 for payloads.
    pub fn new(config: SyncConfig, keys: Arc<dyn PairwiseKeyStore>) -> Self {
        Self::with_encryption(config, keys, Arc::new(ChaChaEncryptionService))
    }

    /// Creates an engine with a custom encryption service.
    pub fn with_encryption(
        config: SyncConfig,
        keys: Arc<dyn PairwiseKeyStore>,
        encryption: Arc<dyn EncryptionService>,
    ) -> Self {
        let (events, _) = broadcast::channel(config.event_capacity.max(1));
        let (progress, _) = broadcast::channel(config.event_capacity.max(1));
        Self {
            config,
            state: Mutex::new(EngineState::default()),
            encryption,
            keys,
            events,
            progress,
        }
    }

    #[must_use]
    pub fn config(&self) -> &SyncConfig {
        &self.config
    }

    /// Binds the engine to this device's identity. Must be called exactly once.
    pub async fn initialize(&self, device_id: DeviceId) -> SyncResult<()> {
        let mut state = self.state.lock().await;
        if state.identity.is_some() {
            return Err(SyncError::AlreadyInitialized);
        }
        info!("Sync engine initialized as {device_id}");
        state.identity = Some(Identity {
            clock: HybridLogicalClock::new(device_id.clone()),
            device_id,
        });
        Ok(())
    }

    /// The local device id, once initialized.
    pub async fn device_id(&self) -> Option<DeviceId> {
        self.state.lock().await.device_id().ok().cloned()
    }

    // ── Local changes ───────────────────────────────────────────

    /// Stamps a local change and adds it to its document.
    pub async fn apply_local_operation(&self, draft: OperationDraft) -> SyncResult<CrdtOperation> {
        draft.validate()?;

        let mut state = self.state.lock().await;
        let identity = state.identity_mut()?;
        let timestamp = identity.clock.tick();
        let device_id = identity.device_id.clone();

        let document = state
            .documents
            .entry(draft.document_id.clone())
            .or_insert_with(|| CrdtDocument::new(draft.document_id.clone(), &draft.document_type));
        let context = document.advance_local_clock(&device_id);
        let operation = CrdtOperation::from_draft(draft, device_id, timestamp.clone(), context);
        document.apply_operation(operation.clone(), timestamp);

        debug!(
            "Applied local {} on {}/{}",
            operation.operation_type, operation.document_id, operation.field_path
        );
        Ok(operation)
    }

    /// Applies a change described by a textual operation type, as the
    /// domain layer hands it over.
    pub async fn apply_local_change(
        &self,
        document_id: impl Into<DocumentId>,
        document_type: &str,
        operation_type: &str,
        field_path: &str,
        value: Value,
    ) -> SyncResult<CrdtOperation> {
        let draft = OperationDraft::from_parts(
            document_id,
            document_type,
            operation_type,
            field_path,
            value,
        )?;
        self.apply_local_operation(draft).await
    }

    // ── Sessions ────────────────────────────────────────────────

    /// Opens a session with `participants` on this (initiating) device.
    pub async fn start_sync_session(
        &self,
        participants: Vec<DeviceId>,
        configuration: Option<SessionConfiguration>,
    ) -> SyncResult<SessionId> {
        let session_id = SessionId::new();
        let mut state = self.state.lock().await;
        let initiator = state.device_id()?.clone();
        let participants: BTreeSet<DeviceId> = participants
            .into_iter()
            .filter(|device| *device != initiator)
            .collect();
        if participants.is_empty() {
            return Err(SyncError::InvalidOperation(
                "a session needs at least one other participant".to_string(),
            ));
        }
        self.open_session(&mut state, session_id, initiator, participants, configuration)?;
        Ok(session_id)
    }

    /// Joins a session opened by `initiator` (responder side). Joining a
    /// session that is already known is a no-op.
    pub async fn join_sync_session(
        &self,
        session_id: SessionId,
        initiator: DeviceId,
        configuration: Option<SessionConfiguration>,
    ) -> SyncResult<bool> {
        let mut state = self.state.lock().await;
        state.device_id()?;
        if state.sessions.contains_key(&session_id) {
            return Ok(false);
        }
        let participants = BTreeSet::from([initiator.clone()]);
        self.open_session(&mut state, session_id, initiator, participants, configuration)?;
        Ok(true)
    }

    fn open_session(
        &self,
        state: &mut EngineState,
        session_id: SessionId,
        initiator: DeviceId,
        participants: BTreeSet<DeviceId>,
        configuration: Option<SessionConfiguration>,
    ) -> SyncResult<()> {
        let configuration = configuration.unwrap_or(self.config.default_configuration);
        let mut session = SyncSession::new(
            session_id,
            initiator,
            participants,
            configuration,
            state.documents.len(),
        );
        let participants: Vec<DeviceId> = session.participants.iter().cloned().collect();
        self.emit(SyncEvent::SessionStarted {
            session_id,
            participants: participants.clone(),
        });

        session.transition(SessionState::Active)?;
        let progress = session.progress.clone();
        state.sessions.insert(session_id, session);

        info!("Session {session_id} active with {participants:?}");
        self.emit(SyncEvent::SessionStateChanged {
            session_id,
            state: SessionState::Active,
        });
        let _ = self.progress.send(progress);
        Ok(())
    }

    /// Marks a session completed. Returns false if it was already terminal.
    pub async fn complete_sync_session(&self, session_id: SessionId) -> SyncResult<bool> {
        self.finish_session(session_id, SessionState::Completed, None).await
    }

    /// Cancels a session. Returns false (and does nothing) if the session
    /// already reached a terminal state.
    pub async fn cancel_sync_session(&self, session_id: SessionId) -> SyncResult<bool> {
        self.finish_session(session_id, SessionState::Cancelled, None).await
    }

    /// Marks a session failed. Returns false if it was already terminal.
    pub async fn fail_sync_session(
        &self,
        session_id: SessionId,
        reason: impl Into<String>,
    ) -> SyncResult<bool> {
        self.finish_session(session_id, SessionState::Failed, Some(reason.into()))
            .await
    }

    async fn finish_session(
        &self,
        session_id: SessionId,
        next: SessionState,
        reason: Option<String>,
    ) -> SyncResult<bool> {
        let mut state = self.state.lock().await;
        let session = state.session_mut(session_id)?;
        if session.state.is_terminal() {
            return Ok(false);
        }
        session.transition(next)?;
        if let Some(reason) = reason {
            warn!("Session {session_id} failed: {reason}");
            session.failure_reason = Some(reason);
        } else {
            info!("Session {session_id} {next}");
        }
        state.retire(session_id, self.config.session_history);
        drop(state);

        self.emit(SyncEvent::SessionStateChanged {
            session_id,
            state: next,
        });
        Ok(true)
    }

    /// Snapshot of a session.
    pub async fn session(&self, session_id: SessionId) -> Option<SyncSession> {
        self.state.lock().await.sessions.get(&session_id).cloned()
    }

    /// Snapshots of every non-terminal session.
    pub async fn active_sessions(&self) -> Vec<SyncSession> {
        self.state
            .lock()
            .await
            .sessions
            .values()
            .filter(|session| session.is_active())
            .cloned()
            .collect()
    }

    /// Records that `device` merged chunk `chunk_id` up to `cursor`.
    /// Returns true once the session's exchange is complete.
    ///
    /// The peer's cursor only moves forward, and never past an operation
    /// this device merged from someone else after building the chunk. An
    /// ack for a chunk this device does not remember sending still counts
    /// towards completion but leaves the cursor alone.
    pub async fn record_acknowledgment(
        &self,
        session_id: SessionId,
        device: &DeviceId,
        chunk_id: ChunkId,
        cursor: Option<HybridTimestamp>,
    ) -> SyncResult<bool> {
        let mut state = self.state.lock().await;
        state.active_session_mut(session_id)?;

        let chunk = state
            .in_flight
            .remove(&chunk_id)
            .filter(|chunk| chunk.session_id == session_id && chunk.peer == *device);
        match (chunk, cursor) {
            (Some(chunk), Some(cursor)) => {
                let cursor = match chunk.floor {
                    Some(floor) if floor <= cursor => {
                        debug!("Ack from {device} held back before {floor:?}");
                        just_before(&floor)
                    }
                    _ => cursor,
                };
                state
                    .peer_cursors
                    .entry(device.clone())
                    .and_modify(|current| {
                        if cursor > *current {
                            *current = cursor.clone();
                        }
                    })
                    .or_insert(cursor);
            }
            (None, _) => {
                warn!("Session {session_id}: {device} acknowledged unknown chunk {chunk_id}");
            }
            (Some(_), None) => {}
        }

        let session = state.session_mut(session_id)?;
        session.acknowledged.insert(device.clone());
        debug!("Session {session_id}: {device} acknowledged {chunk_id}");
        Ok(session.exchange_complete())
    }

    /// True once every participant acknowledged our data and delivered theirs.
    pub async fn exchange_complete(&self, session_id: SessionId) -> SyncResult<bool> {
        let state = self.state.lock().await;
        state
            .sessions
            .get(&session_id)
            .map(SyncSession::exchange_complete)
            .ok_or(SyncError::SessionNotFound(session_id))
    }

    /// Everything up to the returned timestamp is known to have reached `device`.
    pub async fn peer_cursor(&self, device: &DeviceId) -> Option<HybridTimestamp> {
        self.state.lock().await.peer_cursors.get(device).cloned()
    }

    // ── Outbound data ───────────────────────────────────────────

    /// Builds the chunk carrying every local operation newer than `since`
    /// (all of them if `None`) for `to_device`.
    pub async fn generate_sync_data(
        &self,
        session_id: SessionId,
        to_device: &DeviceId,
        since: Option<&HybridTimestamp>,
    ) -> SyncResult<SyncDataChunk> {
        let chunk_id = ChunkId::new();
        let (operations, configuration, from_device, timestamp) = {
            let mut state = self.state.lock().await;
            let configuration = state.active_session_mut(session_id)?.configuration;
            let mut operations: Vec<CrdtOperation> = state
                .documents
                .values()
                .flat_map(|document| document.operations_since(since))
                .cloned()
                .collect();
            operations.sort_by(|a, b| {
                a.causal_timestamp
                    .cmp(&b.causal_timestamp)
                    .then(a.operation_id.cmp(&b.operation_id))
            });
            let identity = state.identity_mut()?;
            let timestamp = identity.clock.tick();
            let from_device = identity.device_id.clone();
            state.in_flight.insert(
                chunk_id,
                InFlight {
                    session_id,
                    peer: to_device.clone(),
                    floor: None,
                },
            );
            (operations, configuration, from_device, timestamp)
        };

        let mut data = codec::serialize_operations(&operations)?;
        if configuration.compress {
            data = codec::compress(&data)?;
        }
        let mut encryption_metadata = None;
        if configuration.encrypt {
            let key = self
                .keys
                .pairwise_key(to_device)
                .await
                .ok_or_else(|| SyncError::DeviceNotPaired(to_device.clone()))?;
            let sealed = peersync_crypto::seal(self.encryption.as_ref(), &data, &key)
                .map_err(|e| SyncError::InvalidOperation(format!("encryption failed: {e}")))?;
            data = sealed.ciphertext;
            encryption_metadata = Some(sealed.metadata);
        }

        debug!(
            "Session {session_id}: {} operations for {to_device} ({} bytes)",
            operations.len(),
            data.len()
        );
        Ok(SyncDataChunk {
            chunk_id,
            session_id,
            from_device_id: from_device,
            to_device_id: to_device.clone(),
            data,
            compressed: configuration.compress,
            encrypted: configuration.encrypt,
            encryption_metadata,
            timestamp,
            operations_count: operations.len(),
        })
    }

    // ── Inbound data ────────────────────────────────────────────

    /// Merges a chunk received from `from_device`.
    ///
    /// A chunk that cannot be decrypted, decompressed or parsed is reported
    /// on the event stream and returned as an error; the session stays
    /// active.
    pub async fn process_sync_data(
        &self,
        session_id: SessionId,
        from_device: &DeviceId,
        chunk: &SyncDataChunk,
    ) -> SyncResult<MergeReport> {
        {
            let mut state = self.state.lock().await;
            state.device_id()?;
            state.active_session_mut(session_id)?;
        }

        let operations = match self.decode_chunk(from_device, chunk).await {
            Ok(operations) => operations,
            Err(err) => {
                warn!("Session {session_id}: rejected chunk {} from {from_device}: {err}", chunk.chunk_id);
                self.emit(SyncEvent::Error {
                    session_id: Some(session_id),
                    message: err.to_string(),
                    failure: err.failure_kind(),
                });
                return Err(err);
            }
        };

        let policy = self.config.conflict_policy;
        let mut report = MergeReport {
            cursor: operations.iter().map(|op| op.causal_timestamp.clone()).max(),
            ..MergeReport::default()
        };
        let mut conflicts = Vec::new();

        let progress = {
            let mut state = self.state.lock().await;
            // The session may have ended while the chunk was being decoded.
            state.active_session_mut(session_id)?;
            let mut touched = HashSet::new();

            for operation in operations {
                let identity = state.identity_mut()?;
                let observed_at = identity.clock.update(&operation.causal_timestamp);

                let document = state
                    .documents
                    .entry(operation.document_id.clone())
                    .or_insert_with(|| {
                        CrdtDocument::new(operation.document_id.clone(), &operation.document_type)
                    });
                if document.contains(&operation.operation_id) {
                    report.duplicates += 1;
                    continue;
                }

                let local = document.detect_conflict(&operation, policy).cloned();
                let timestamp = operation.causal_timestamp.clone();
                let field_path = operation.field_path.clone();
                let remote = local.as_ref().map(|_| operation.clone());
                touched.insert(operation.document_id.clone());
                document.apply_operation(operation, observed_at);

                if let (Some(local), Some(remote)) = (local, remote) {
                    let winner = document
                        .current_writer(&field_path, policy)
                        .map_or(remote.operation_id, |op| op.operation_id);
                    info!(
                        "Conflict on {}/{}: {} vs {}, {} wins",
                        remote.document_id, field_path, local.origin_device_id,
                        remote.origin_device_id, winner
                    );
                    conflicts.push(SyncConflict::new(&local, &remote, winner));
                }
                state.rewind_cursors(from_device, &timestamp);
                report.merged += 1;
            }

            report.conflicts = conflicts.len();
            state.total_conflicts += conflicts.len();
            let session = state.session_mut(session_id)?;
            session.conflicts.extend(conflicts.iter().cloned());
            session.received_from.insert(from_device.clone());
            session.progress.processed_documents += touched.len();
            session.progress.total_documents = session
                .progress
                .total_documents
                .max(session.progress.processed_documents);
            session.progress.operations_merged += report.merged;
            session.progress.conflicts_detected += report.conflicts;
            session.progress.clone()
        };

        for conflict in conflicts {
            self.emit(SyncEvent::ConflictDetected {
                session_id,
                conflict: Box::new(conflict),
            });
        }
        self.emit(SyncEvent::OperationsMerged {
            session_id,
            from_device: from_device.clone(),
            merged: report.merged,
            duplicates: report.duplicates,
        });
        let _ = self.progress.send(progress);

        info!(
            "Session {session_id}: merged {} operations from {from_device} ({} duplicates, {} conflicts)",
            report.merged, report.duplicates, report.conflicts
        );
        Ok(report)
    }

    async fn decode_chunk(
        &self,
        from_device: &DeviceId,
        chunk: &SyncDataChunk,
    ) -> SyncResult<Vec<CrdtOperation>> {
        let mut data = chunk.data.clone();
        if chunk.encrypted {
            let metadata = chunk.encryption_metadata.as_ref().ok_or_else(|| {
                SyncError::DecryptionFailure("encrypted chunk carries no key metadata".to_string())
            })?;
            let key = self.keys.pairwise_key(from_device).await.ok_or_else(|| {
                SyncError::DecryptionFailure(format!("no pairwise key for {from_device}"))
            })?;
            data = peersync_crypto::open(self.encryption.as_ref(), &data, metadata, &key)
                .map_err(|e| SyncError::DecryptionFailure(e.to_string()))?;
        }
        if chunk.compressed {
            data = codec::decompress(&data)?;
        }
        codec::parse_operations(&data)
    }

    // ── Queries ─────────────────────────────────────────────────

    /// Read-only aggregate for status displays.
    pub async fn get_sync_statistics(&self) -> SyncStatistics {
        let state = self.state.lock().await;
        SyncStatistics {
            device_id: state.device_id().ok().cloned(),
            document_count: state.documents.len(),
            operation_count: state.documents.values().map(CrdtDocument::len).sum(),
            active_sessions: state.sessions.values().filter(|s| s.is_active()).count(),
            total_conflicts: state.total_conflicts,
            known_peers: state.peer_cursors.len(),
        }
    }

    /// Snapshot of a document.
    pub async fn document(&self, document_id: &DocumentId) -> Option<CrdtDocument> {
        self.state.lock().await.documents.get(document_id).cloned()
    }

    /// Ids of every known document.
    pub async fn document_ids(&self) -> Vec<DocumentId> {
        self.state.lock().await.documents.keys().cloned().collect()
    }

    /// Current value of a field under the configured conflict policy.
    pub async fn field_value(&self, document_id: &DocumentId, field_path: &str) -> Option<Value> {
        self.state
            .lock()
            .await
            .documents
            .get(document_id)?
            .field_value(field_path, self.config.conflict_policy)
    }

    // ── Streams ─────────────────────────────────────────────────

    pub fn subscribe_events(&self) -> broadcast::Receiver<SyncEvent> {
        self.events.subscribe()
    }

    pub fn subscribe_progress(&self) -> broadcast::Receiver<SyncProgress> {
        self.progress.subscribe()
    }

    /// Publishes an error that happened outside the engine (for example in
    /// the transport layer) on the event stream.
    pub fn report_error(&self, session_id: Option<SessionId>, error: &SyncError) {
        self.emit(SyncEvent::Error {
            session_id,
            message: error.to_string(),
            failure: error.failure_kind(),
        });
    }

    fn emit(&self, event: SyncEvent) {
        // No subscribers is fine; events are at-most-once.
        let _ = self.events.send(event);
    }
}

impl std::fmt::Debug for SyncEngine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SyncEngine")
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}
