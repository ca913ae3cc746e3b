//! Witness cosigning: sends a freshly signed checkpoint, together with an
//! RFC 6962 consistency proof against the last checkpoint a witness has
//! seen, to each configured witness and folds their signature lines onto
//! the checkpoint once a threshold of them have cosigned.
//!
//! Witnesses are an external fork-detection control: each one remembers
//! the last checkpoint size it accepted and refuses to cosign anything
//! that is not a provable extension of it, so a log operator who tries to
//! serve two incompatible histories gets caught the moment an honest
//! witness sees both.

use crate::checkpoint::{key_hash, Checkpoint, SignatureLine};
use crate::config::{WitnessEndpoint, WitnessPolicy};
use crate::error::{Result, TesseraError};
use crate::range::{decompose_range, CompactRange};
use crate::storage::traits::ObjectStore;
use crate::tile::TileReadCache;
use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use std::collections::HashMap;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::time::Duration;

/// Upper bound on how many times a single witness is re-asked within one
/// round after a 409 corrects our view of its known size. Bounds the
/// round's duration if a witness's reported size keeps moving.
const MAX_WITNESS_ATTEMPTS: usize = 3;

/// Cosigns checkpoints against an externally configured N-of-M witness
/// policy.
pub struct WitnessGateway<O: ObjectStore> {
    policy: WitnessPolicy,
    read_cache: Arc<TileReadCache<O>>,
    http_client: reqwest::Client,
    request_timeout: Duration,
    /// Each witness's last known accepted size, keyed by `key_name`.
    /// Populated from 200 responses (the size just accepted) and 409
    /// responses (the size the witness reports it actually holds), so a
    /// later round proves from where that specific witness left off
    /// instead of repeating a proof from genesis or replaying a size the
    /// witness has already moved past. Reset on process restart; a
    /// witness is never locked out by that, since a 0 cursor is always
    /// valid to restate and will simply be corrected again by its first
    /// 409 if the witness knows better.
    last_known_sizes: tokio::sync::Mutex<HashMap<String, u64>>,
}

impl<O: ObjectStore> WitnessGateway<O> {
    pub fn new(policy: WitnessPolicy, object_store: Arc<O>, request_timeout: Duration) -> Self {
        Self {
            policy,
            read_cache: Arc::new(TileReadCache::new(object_store)),
            http_client: reqwest::Client::builder()
                .timeout(request_timeout)
                .build()
                .expect("failed to build witness HTTP client"),
            request_timeout,
            last_known_sizes: tokio::sync::Mutex::new(HashMap::new()),
        }
    }

    /// Request cosignatures for `checkpoint` from every configured witness
    /// concurrently, appending every signature received (after verifying
    /// it against the witness's configured public key) until the
    /// threshold is reached. Returns an error — and the publish cycle
    /// should be skipped — if fewer than `threshold` witnesses
    /// contributed within the round.
    pub async fn witness(&self, checkpoint: Checkpoint) -> Result<Checkpoint> {
        if !self.policy.is_enabled() {
            return Ok(checkpoint);
        }

        let initial_sizes: Vec<u64> = {
            let known = self.last_known_sizes.lock().await;
            self.policy
                .endpoints
                .iter()
                .map(|e| known.get(&e.key_name).copied().unwrap_or(0))
                .collect()
        };

        let tasks: Vec<_> = self
            .policy
            .endpoints
            .iter()
            .cloned()
            .zip(initial_sizes)
            .map(|(endpoint, old_size)| {
                let client = self.http_client.clone();
                let read_cache = Arc::clone(&self.read_cache);
                let timeout = self.request_timeout;
                let checkpoint = checkpoint.clone();
                tokio::spawn(async move {
                    witness_one(&client, read_cache.as_ref(), &endpoint, &checkpoint, old_size, timeout).await
                })
            })
            .collect();

        let mut checkpoint = checkpoint;
        let mut contributed = 0usize;
        for (endpoint, task) in self.policy.endpoints.iter().zip(tasks) {
            let outcome = task
                .await
                .unwrap_or_else(|e| Err(TesseraError::witness(format!("witness task panicked: {}", e))));
            match outcome {
                Ok(attempt) => {
                    {
                        let mut known = self.last_known_sizes.lock().await;
                        known.insert(endpoint.key_name.clone(), attempt.last_known_size);
                    }
                    match attempt.line {
                        Some(line) => {
                            if verify_signature_line(endpoint, &checkpoint, &line) {
                                crate::logging::log_witness_round(&endpoint.url, true, None);
                                checkpoint.add_signature(line);
                                contributed += 1;
                            } else {
                                crate::logging::log_witness_round(
                                    &endpoint.url,
                                    false,
                                    Some("signature verification failed"),
                                );
                            }
                        }
                        None => {
                            crate::logging::log_witness_round(
                                &endpoint.url,
                                false,
                                Some("no contribution this round"),
                            );
                        }
                    }
                }
                Err(e) => {
                    crate::logging::log_witness_round(&endpoint.url, false, Some(&e.to_string()));
                }
            }
        }

        if contributed < self.policy.threshold {
            return Err(TesseraError::witness(format!(
                "only {} of {} required witnesses cosigned this round",
                contributed, self.policy.threshold
            )));
        }
        Ok(checkpoint)
    }
}

/// The `old <known_size>\n<proof line>*\n\n<signed checkpoint>` wire body.
fn build_witness_request(old_size: u64, proof: &[[u8; 32]], checkpoint: &Checkpoint) -> String {
    let mut body = format!("old {}\n", old_size);
    for hash in proof {
        body.push_str(&BASE64.encode(hash));
        body.push('\n');
    }
    body.push('\n');
    body.push_str(&checkpoint.format());
    body
}

/// Result of a single round's worth of contact with one witness, after
/// any 409 retries have been exhausted.
struct WitnessAttempt {
    line: Option<SignatureLine>,
    /// The size to remember as this witness's cursor for next round.
    last_known_size: u64,
}

/// Outcome of one HTTP attempt against a witness.
enum WitnessOutcome {
    Signed(SignatureLine),
    /// 409: the witness's actual known size, parsed from the response
    /// body, which differs from the `old_size` we proved against.
    Stale(u64),
    /// 404/403/422: a permanent rejection for this round.
    Rejected,
}

/// Drives one witness through up to [`MAX_WITNESS_ATTEMPTS`] requests,
/// recomputing the consistency proof against a corrected `old_size`
/// whenever the witness reports (via 409) that it knows a different size
/// than the one we started from.
async fn witness_one<O: ObjectStore>(
    client: &reqwest::Client,
    read_cache: &TileReadCache<O>,
    endpoint: &WitnessEndpoint,
    checkpoint: &Checkpoint,
    mut old_size: u64,
    timeout: Duration,
) -> Result<WitnessAttempt> {
    for attempt in 0..MAX_WITNESS_ATTEMPTS {
        let proof = if checkpoint.size > 0 && old_size < checkpoint.size {
            consistency_proof(read_cache, old_size, checkpoint.size).await?
        } else {
            Vec::new()
        };
        let body = build_witness_request(old_size, &proof, checkpoint);

        match call_witness(client, endpoint, &body, timeout).await? {
            WitnessOutcome::Signed(line) => {
                return Ok(WitnessAttempt { line: Some(line), last_known_size: checkpoint.size });
            }
            WitnessOutcome::Stale(current_size) => {
                if current_size == old_size || attempt + 1 == MAX_WITNESS_ATTEMPTS {
                    return Ok(WitnessAttempt { line: None, last_known_size: current_size });
                }
                old_size = current_size;
            }
            WitnessOutcome::Rejected => {
                return Ok(WitnessAttempt { line: None, last_known_size: old_size });
            }
        }
    }
    unreachable!("loop above always returns within MAX_WITNESS_ATTEMPTS iterations")
}

/// Parses a 409 response body's first line as the witness's actual known
/// size. Witnesses report this either as a bare integer or as `old
/// <size>`, matching the request's own `old <size>` line shape.
fn parse_witness_known_size(body: &str, endpoint: &WitnessEndpoint) -> Result<u64> {
    let first_line = body.lines().next().unwrap_or("").trim();
    let token = first_line.rsplit(' ').next().filter(|t| !t.is_empty()).ok_or_else(|| {
        TesseraError::witness(format!("{}: 409 response carried an empty body", endpoint.url))
    })?;
    token.parse::<u64>().map_err(|_| {
        TesseraError::witness(format!(
            "{}: 409 response size {:?} is not a valid integer",
            endpoint.url, first_line
        ))
    })
}

async fn call_witness(
    client: &reqwest::Client,
    endpoint: &WitnessEndpoint,
    body: &str,
    timeout: Duration,
) -> Result<WitnessOutcome> {
    let response = client
        .post(&endpoint.url)
        .timeout(timeout)
        .body(body.to_string())
        .send()
        .await
        .map_err(|e| TesseraError::witness(format!("{}: {}", endpoint.url, e)))?;

    match response.status().as_u16() {
        200 => {
            let text = response
                .text()
                .await
                .map_err(|e| TesseraError::witness(format!("{}: {}", endpoint.url, e)))?;
            let signed = Checkpoint::parse(&text)?;
            let line = signed
                .signatures
                .into_iter()
                .find(|l| l.key_name == endpoint.key_name)
                .ok_or_else(|| {
                    TesseraError::witness(format!(
                        "{}: response carried no signature line for {}",
                        endpoint.url, endpoint.key_name
                    ))
                })?;
            Ok(WitnessOutcome::Signed(line))
        }
        // Stale: the witness's own known size disagrees with the `old_size`
        // we proved against. Its body carries that size so the caller can
        // recompute the proof and retry within the round.
        409 => {
            let text = response
                .text()
                .await
                .map_err(|e| TesseraError::witness(format!("{}: {}", endpoint.url, e)))?;
            let current_size = parse_witness_known_size(&text, endpoint)?;
            Ok(WitnessOutcome::Stale(current_size))
        }
        // Unknown or rejected: no contribution this round, not a hard
        // failure — a future round may succeed.
        404 | 403 | 422 => Ok(WitnessOutcome::Rejected),
        other => Err(TesseraError::witness(format!(
            "{}: unexpected status {}",
            endpoint.url, other
        ))),
    }
}

/// Verify a witness's signature line against the checkpoint body and the
/// witness's configured Ed25519 public key.
pub fn verify_signature_line(endpoint: &WitnessEndpoint, checkpoint: &Checkpoint, line: &SignatureLine) -> bool {
    if line.key_name != endpoint.key_name {
        return false;
    }
    if line.key_hash != key_hash(&endpoint.key_name, &endpoint.public_key) {
        return false;
    }
    let Ok(verifying_key) = ed25519_dalek::VerifyingKey::from_bytes(&endpoint.public_key) else {
        return false;
    };
    let signature = ed25519_dalek::Signature::from_bytes(&line.signature);
    use ed25519_dalek::Verifier;
    verifying_key
        .verify(checkpoint.signed_body().as_bytes(), &signature)
        .is_ok()
}

/// The RFC 6962 root hash of leaves `[begin, end)`, read through the tile
/// cache rather than replayed from raw entry data.
async fn range_root<O: ObjectStore>(
    read_cache: &TileReadCache<O>,
    begin: u64,
    end: u64,
    tree_size: u64,
) -> Result<[u8; 32]> {
    let ids = decompose_range(begin, end);
    read_cache.prewarm(&ids, tree_size).await?;
    let mut nodes = Vec::with_capacity(ids.len());
    for (level, index) in ids {
        let hash = read_cache.node_hash(level, index, tree_size).await?;
        nodes.push((level, index, hash));
    }
    CompactRange::from_nodes(begin, end, nodes).root_hash()
}

fn largest_power_of_two_less_than(n: u64) -> u64 {
    debug_assert!(n > 1);
    let mut k = 1u64;
    while k * 2 < n {
        k *= 2;
    }
    k
}

/// `SUBPROOF(m, D[begin:begin+n], b)` from RFC 6962 section 2.1.2,
/// generalized to read node hashes from storage instead of replaying raw
/// leaves. `tree_size` is the size of the tree the hashes are being read
/// from (needed to resolve partial vs. full tiles).
fn subproof<'a, O: ObjectStore>(
    read_cache: &'a TileReadCache<O>,
    m: u64,
    begin: u64,
    n: u64,
    b: bool,
    tree_size: u64,
) -> Pin<Box<dyn Future<Output = Result<Vec<[u8; 32]>>> + Send + 'a>> {
    Box::pin(async move {
        if m == n {
            if b {
                Ok(Vec::new())
            } else {
                Ok(vec![range_root(read_cache, begin, begin + n, tree_size).await?])
            }
        } else {
            let k = largest_power_of_two_less_than(n);
            if m <= k {
                let mut proof = subproof(read_cache, m, begin, k, b, tree_size).await?;
                proof.push(range_root(read_cache, begin + k, begin + n, tree_size).await?);
                Ok(proof)
            } else {
                let mut proof = subproof(read_cache, m - k, begin + k, n - k, false, tree_size).await?;
                proof.push(range_root(read_cache, begin, begin + k, tree_size).await?);
                Ok(proof)
            }
        }
    })
}

/// `PROOF(old_size, D[new_size])`: the ordered list of node hashes a
/// verifier needs to confirm that the tree of size `old_size` they
/// already trust is a prefix of the tree of size `new_size`.
pub async fn consistency_proof<O: ObjectStore>(
    read_cache: &TileReadCache<O>,
    old_size: u64,
    new_size: u64,
) -> Result<Vec<[u8; 32]>> {
    if old_size == 0 || old_size == new_size {
        return Ok(Vec::new());
    }
    if old_size > new_size {
        return Err(TesseraError::validation(format!(
            "old_size {} must not exceed new_size {}",
            old_size, new_size
        )));
    }
    subproof(read_cache, old_size, 0, new_size, true, new_size).await
}
