//! The appender: top-level orchestration tying the submission queue,
//! sequencer, integrator, checkpoint publisher, witness gateway, and
//! antispam follower into one running log instance.
//!
//! Mirrors the shape of the teacher's top-level service structs
//! (`DepositTrackerService`, `RedemptionService`): a builder-style
//! constructor, a handful of background loops spawned once and then left
//! running, and a thin public surface (`add`, `checkpoint_snapshot`,
//! `tree_size`) that personalities call into directly.

use crate::antispam::{AntispamDecorator, AntispamFollower, IdentityFn, IntegratedSizeFn};
use crate::checkpoint::{Checkpoint, CheckpointPublisher, Signer};
use crate::config::TesseraConfig;
use crate::entry::Entry;
use crate::error::{Result, TesseraError};
use crate::integrator::Integrator;
use crate::queue::{FlushFn, Index, SubmissionQueue};
use crate::sequencer::Sequencer;
use crate::storage::traits::{AntispamStore, CoordinatorStore, ObjectStore};
use crate::witness::WitnessGateway;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;

/// Errors surfaced directly by the appender's own orchestration, distinct
/// from the module-local errors ([`crate::error::TesseraError`]) that
/// individual components raise and that flow through unchanged.
#[derive(Debug, Error)]
pub enum AppenderError {
    #[error("appender is not yet running: {0}")]
    NotRunning(String),
}

/// A fully wired, running log instance.
///
/// Construction order matches the data-flow diagram: coordinator and
/// object stores first, then the sequencer and integrator built on top of
/// them, then the submission queue wrapping the sequencer's flush
/// function, then the checkpoint publisher and (optionally) the witness
/// gateway and antispam decorator. Background loops are not spawned by
/// `new` itself; call the `spawn_*` methods once after construction.
pub struct Appender<C: CoordinatorStore, O: ObjectStore, A: AntispamStore> {
    sequencer: Arc<Sequencer<C>>,
    integrator: Arc<Integrator<O>>,
    queue: SubmissionQueue,
    checkpoint_publisher: Arc<CheckpointPublisher<C, O>>,
    antispam: Option<AntispamDecorator<A>>,
    antispam_pushback_threshold: u64,
    integration_limit: usize,
}

impl<C: CoordinatorStore, O: ObjectStore, A: AntispamStore> Appender<C, O, A> {
    /// Wire a log instance from already-initialized stores.
    pub async fn new(
        config: &TesseraConfig,
        coordinator_store: Arc<C>,
        object_store: Arc<O>,
        antispam_store: Option<Arc<A>>,
        signer: Arc<dyn Signer>,
    ) -> Result<Self> {
        coordinator_store.init_schema().await?;
        coordinator_store.check_compatibility().await?;
        if let Some(store) = &antispam_store {
            store.init_schema().await?;
            store.check_compatibility().await?;
        }

        let sequencer = Arc::new(Sequencer::new(Arc::clone(&coordinator_store), config.max_outstanding));
        let integrator = Arc::new(Integrator::new(Arc::clone(&object_store)));

        let flush_fn: FlushFn = sequencer.flush_fn();
        let queue = SubmissionQueue::new(flush_fn, config.batch_max_size, config.batch_max_age);

        let antispam_pushback_threshold = config.antispam_pushback_threshold;
        let antispam = antispam_store.map(|store| {
            let pushback_seq = Arc::clone(&sequencer);
            let pushback_store = Arc::clone(&store);
            let pushback_check: Arc<dyn Fn() -> Pin<Box<dyn Future<Output = Result<bool>> + Send>> + Send + Sync> =
                Arc::new(move || {
                    let seq = Arc::clone(&pushback_seq);
                    let store = Arc::clone(&pushback_store);
                    Box::pin(async move {
                        let (integrated, _) = seq.current_tree().await?;
                        let position = store.follow_position().await.map_err(TesseraError::from)?;
                        Ok(integrated.saturating_sub(position) > antispam_pushback_threshold)
                    })
                });
            AntispamDecorator::new(store, pushback_check)
        });

        let witness_gateway = if config.witness_policy.is_enabled() {
            Some(Arc::new(WitnessGateway::new(
                config.witness_policy.clone(),
                Arc::clone(&object_store),
                Duration::from_secs(10),
            )))
        } else {
            None
        };

        let checkpoint_publisher = Arc::new(CheckpointPublisher::new(
            Arc::clone(&sequencer),
            Arc::clone(&object_store),
            signer,
            config.origin.clone(),
            config.checkpoint_interval,
            Duration::from_millis(0),
            witness_gateway,
        ));

        Ok(Self {
            sequencer,
            integrator,
            queue,
            checkpoint_publisher,
            antispam,
            antispam_pushback_threshold: config.antispam_pushback_threshold,
            integration_limit: config.batch_max_size.max(256),
        })
    }

    /// Submit an entry for inclusion in the log. If an antispam decorator is
    /// configured, checks pushback and identity-hash deduplication before
    /// the entry ever reaches the submission queue.
    pub async fn add(&self, entry: Entry) -> Result<Index> {
        if let Some(antispam) = &self.antispam {
            if let Some(index) = antispam.check(entry.identity_hash()).await? {
                return Ok(index);
            }
        }
        self.queue.add(entry).await
    }

    /// Force an immediate flush of whatever is currently buffered in the
    /// submission queue, bypassing the batch size/age thresholds.
    pub fn flush_now(&self) {
        self.queue.flush_now();
    }

    /// Run one integration step immediately (mainly for tests and
    /// deterministic drivers; [`Appender::spawn_integration_loop`] is the
    /// production entry point).
    pub async fn integrate_once(&self) -> Result<bool> {
        self.integrator.integrate_once(&self.sequencer, self.integration_limit, false).await
    }

    /// Run one checkpoint publish attempt immediately.
    pub async fn publish_checkpoint_once(&self) -> Result<bool> {
        self.checkpoint_publisher.publish_once().await
    }

    /// The currently committed tree size and root hash. A narrow read of
    /// state the appender itself just produced, not a general leaf-content
    /// read API.
    pub async fn tree_size(&self) -> Result<(u64, [u8; 32])> {
        self.sequencer.current_tree().await
    }

    /// A snapshot checkpoint over the currently committed tree, unsigned.
    /// Personalities that need the signed, published checkpoint should read
    /// it back from object storage at its canonical path instead.
    pub async fn checkpoint_snapshot(&self, origin: &str) -> Result<Checkpoint> {
        let (size, root) = self.tree_size().await?;
        Ok(Checkpoint::unsigned(origin.to_string(), size, root))
    }

    /// Spawn the integration loop: repeatedly drains pending batches until
    /// none remain, then waits briefly before checking again. Grounded in
    /// the teacher's poll-then-sleep service idiom, adapted to drain
    /// eagerly rather than wait a fixed interval when there is backlog.
    pub fn spawn_integration_loop(self: &Arc<Self>, poll_interval: Duration)
    where
        C: 'static,
        O: 'static,
        A: 'static,
    {
        let this = Arc::clone(self);
        tokio::spawn(async move {
            loop {
                match this.integrate_once().await {
                    Ok(true) => continue,
                    Ok(false) => tokio::time::sleep(poll_interval).await,
                    Err(e) => {
                        tracing::error!(target: "tessera::appender", error = %e, "integration step failed");
                        tokio::time::sleep(poll_interval).await;
                    }
                }
            }
        });
    }

    /// Spawn the checkpoint publisher's own interval loop.
    pub fn spawn_checkpoint_loop(self: &Arc<Self>)
    where
        C: 'static,
        O: 'static,
        A: 'static,
    {
        let publisher = Arc::clone(&self.checkpoint_publisher);
        tokio::spawn(async move { publisher.run().await });
    }

    /// Spawn the antispam follower's loop, if antispam is configured.
    pub fn spawn_antispam_loop(self: &Arc<Self>, identity_fn: IdentityFn, antispam_store: Arc<A>)
    where
        C: 'static,
        O: 'static,
        A: 'static,
    {
        let sequencer = Arc::clone(&self.sequencer);
        let integrated_size: IntegratedSizeFn = Arc::new(move || {
            let sequencer = Arc::clone(&sequencer);
            Box::pin(async move { Ok(sequencer.current_tree().await?.0) })
        });
        let object_store = self.integrator.object_store();
        let pushback_threshold = self.antispam_pushback_threshold;
        tokio::spawn(async move {
            let follower = AntispamFollower::new(
                antispam_store,
                object_store,
                integrated_size,
                identity_fn,
                pushback_threshold,
                crate::path::TILE_WIDTH,
            );
            follower.run().await;
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::checkpoint::Ed25519Signer;
    use crate::config::WitnessPolicy;
    use crate::entry::Entry;
    use crate::storage::memory::{MemoryAntispamStore, MemoryCoordinatorStore, MemoryObjectStore};
    use rand::rngs::OsRng;
    use std::time::Duration as StdDuration;

    fn test_config() -> TesseraConfig {
        TesseraConfig {
            sqlite_path: "unused".to_string(),
            object_root: "unused".to_string(),
            batch_max_size: 4,
            batch_max_age: StdDuration::from_millis(20),
            max_outstanding: 10_000,
            origin: "T/test".to_string(),
            signing_key: hex::encode([1u8; 32]),
            checkpoint_interval: StdDuration::from_secs(1),
            witness_policy: WitnessPolicy::disabled(),
            antispam_pushback_threshold: 100_000,
            log_level: "info".to_string(),
        }
    }

    #[tokio::test]
    async fn test_add_then_integrate_grows_tree() {
        let config = test_config();
        let coordinator = Arc::new(MemoryCoordinatorStore::new());
        let objects = Arc::new(MemoryObjectStore::new());
        let signing_key = ed25519_dalek::SigningKey::generate(&mut OsRng);
        let signer: Arc<dyn Signer> = Arc::new(Ed25519Signer::new("T/test", signing_key));

        let appender: Appender<MemoryCoordinatorStore, MemoryObjectStore, MemoryAntispamStore> =
            Appender::new(&config, coordinator, objects, None, signer).await.unwrap();

        let idx = appender.add(Entry::new(b"hello".to_vec())).await.unwrap();
        assert!(!idx.is_duplicate);

        assert!(appender.integrate_once().await.unwrap());
        let (size, _) = appender.tree_size().await.unwrap();
        assert_eq!(size, 1);
    }

    #[tokio::test]
    async fn test_checkpoint_snapshot_reflects_integrated_size() {
        let config = test_config();
        let coordinator = Arc::new(MemoryCoordinatorStore::new());
        let objects = Arc::new(MemoryObjectStore::new());
        let signing_key = ed25519_dalek::SigningKey::generate(&mut OsRng);
        let signer: Arc<dyn Signer> = Arc::new(Ed25519Signer::new("T/test", signing_key));

        let appender: Appender<MemoryCoordinatorStore, MemoryObjectStore, MemoryAntispamStore> =
            Appender::new(&config, coordinator, objects, None, signer).await.unwrap();

        appender.add(Entry::new(b"hello".to_vec())).await.unwrap();
        appender.integrate_once().await.unwrap();

        let snapshot = appender.checkpoint_snapshot("T/test").await.unwrap();
        assert_eq!(snapshot.size, 1);
    }

    #[tokio::test]
    async fn test_antispam_decorator_deduplicates_within_appender() {
        let config = test_config();
        let coordinator = Arc::new(MemoryCoordinatorStore::new());
        let objects = Arc::new(MemoryObjectStore::new());
        let antispam = Arc::new(MemoryAntispamStore::new());
        antispam.advance(&[([4u8; 32], 9)], 10).await.unwrap();
        let signing_key = ed25519_dalek::SigningKey::generate(&mut OsRng);
        let signer: Arc<dyn Signer> = Arc::new(Ed25519Signer::new("T/test", signing_key));

        let appender = Appender::new(&config, coordinator, objects, Some(antispam), signer)
            .await
            .unwrap();

        let entry = Entry::new(b"dup".to_vec()).with_identity_hash([4u8; 32]);
        let result = appender.add(entry).await.unwrap();
        assert!(result.is_duplicate);
        assert_eq!(result.index, 9);
    }
}
