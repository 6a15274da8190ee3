//! A one-off key sync, initiated by the leader enclave, with a worker
//! enclave. It proceeds in the following steps:
//!
//! * The leader creates a nonce and requests the worker's attestation
//!   document, which must embed that nonce.
//! * The leader verifies the document and extracts the worker's
//!   ephemeral public key and the worker's own nonce.
//! * The leader seals a copy of its keys to the worker's public key.
//! * The leader commits to the sealed keys with its own attestation
//!   document, which embeds the worker's nonce and the hash of the
//!   sealed keys.
//! * The leader posts its document and the sealed keys to the worker.
//!
//! Only the attestation request is retried. A failed attestation is a
//! trust failure, and the key delivery is not repeated so that a worker
//! never receives the same keys twice.

use std::sync::Arc;

use rand_core::OsRng;
use reqwest::header::CONTENT_TYPE;
use reqwest::{StatusCode, Url};
use shared::sealed::seal_anonymous;
use shared::tee::Attester;
use shared::{AttestationMessage, LeaderAuxInfo, Nonce, WorkerAuxInfo, max_read_len};
use zeroize::Zeroizing;

use crate::error::{ProtocolViolation, Result, SyncError};
use crate::keys::KeySet;
use crate::observer::{SyncObserver, TracingObserver};
use crate::transport::{Backoff, read_limited, retry_with_backoff};

/// The progress of a single sync. A sync moves through these in
/// order, or ends in `Failed` from any step.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum SyncState {
    Start,
    NonceCreated,
    AttestationRequested,
    AttestationVerified,
    KeysEncrypted,
    CommitmentAttested,
    Delivered,
    Failed,
}

/// Everything a leader needs to sync its keys with workers.
///
/// A single instance may run many syncs concurrently. Each sync uses
/// its own nonce and its own copy of the keys.
pub struct LeaderSync<A, K> {
    attester: A,
    keys: Arc<K>,
    client: reqwest::Client,
    backoff: Backoff,
    observer: Arc<dyn SyncObserver>,
}

impl<A, K> LeaderSync<A, K>
where
    A: Attester + Send + Sync,
    K: KeySet + Send,
{
    pub fn new(attester: A, keys: Arc<K>, client: reqwest::Client) -> Self {
        Self {
            attester,
            keys,
            client,
            backoff: Backoff::default(),
            observer: Arc::new(TracingObserver),
        }
    }

    /// Set the retry policy for fetching a worker's attestation
    pub fn with_backoff(mut self, backoff: Backoff) -> Self {
        self.backoff = backoff;
        self
    }

    pub fn with_observer(mut self, observer: Arc<dyn SyncObserver>) -> Self {
        self.observer = observer;
        self
    }

    /// Initiate a key sync with the worker enclave at `worker`.
    pub async fn sync_with(&self, worker: &Url) -> Result<()> {
        let host = worker_host(worker);
        self.observer.transition(&host, SyncState::Start);
        let outcome = self.run(worker, &host).await;
        if outcome.is_err() {
            self.observer.transition(&host, SyncState::Failed);
        }
        self.observer.finished(&host, outcome.as_ref().map(|_| ()));
        outcome
    }

    async fn run(&self, worker: &Url, host: &str) -> Result<()> {
        let advance = |state| self.observer.transition(host, state);

        // Step 1: Create a nonce that the worker must embed in its
        // attestation document, to prevent replay attacks.
        let nonce = Nonce::generate(&mut OsRng)?;
        advance(SyncState::NonceCreated);

        // Step 2: Request the worker's attestation document, and provide
        // the nonce.
        let mut req_url = worker.clone();
        req_url.set_query(Some(&format!("nonce={nonce:x}")));
        let resp = retry_with_backoff(&self.backoff, &*self.observer, host, || {
            self.client.get(req_url.clone()).send()
        })
        .await
        .map_err(|exhausted| SyncError::TransportExhausted {
            attempts: exhausted.attempts,
            status: exhausted.last_response.map(|r| r.status()),
            error: exhausted.last_error,
        })?;
        advance(SyncState::AttestationRequested);

        // Step 3: Verify the worker's attestation document and extract
        // its auxiliary information.
        let worker_aux = self.verify_worker(resp, &nonce).await?;
        advance(SyncState::AttestationVerified);

        // Step 4: Encrypt a copy of the leader's keys with the ephemeral
        // public key of the worker.
        let recipient = x25519_dalek::PublicKey::from(worker_aux.public_key.0);
        let plaintext = Zeroizing::new(
            self.keys
                .to_bytes()
                .map_err(|e| SyncError::Encryption(e.to_string()))?,
        );
        let encrypted = seal_anonymous(&plaintext, &recipient, OsRng)?;
        advance(SyncState::KeysEncrypted);

        // Step 5: Attest to the worker's nonce and the hash of the
        // encrypted keys.
        let leader_aux = LeaderAuxInfo::commit(worker_aux.workers_nonce, &encrypted);
        let document = self
            .attester
            .create_attestation(&leader_aux.into())
            .map_err(|e| SyncError::AttestationCreate(e.to_string()))?;
        advance(SyncState::CommitmentAttested);

        // Step 6: Send the leader's attestation document and the keys to
        // the worker.
        let body = AttestationMessage::key_delivery(document, encrypted)
            .to_json()
            .map_err(SyncError::Serialization)?;
        let delivery_failed = |status: Option<StatusCode>, error| SyncError::DeliveryFailed {
            url: worker.to_string(),
            status,
            error,
        };
        let resp = self
            .client
            .post(worker.clone())
            .header(CONTENT_TYPE, "text/plain")
            .body(body)
            .send()
            .await
            .map_err(|e| delivery_failed(None, Some(e)))?;
        if resp.status() != StatusCode::OK {
            return Err(delivery_failed(Some(resp.status()), None));
        }
        advance(SyncState::Delivered);
        Ok(())
    }

    /// Check the worker's reply to an attestation request. None of the
    /// failures here are retried.
    async fn verify_worker(&self, resp: reqwest::Response, nonce: &Nonce) -> Result<WorkerAuxInfo> {
        let limit = max_read_len();
        let body = read_limited(resp, limit)
            .await
            .map_err(ProtocolViolation::UnreadableBody)?
            .ok_or(ProtocolViolation::BodyTooLarge(limit))?;
        let msg = AttestationMessage::from_json(&body)
            .map_err(|e| ProtocolViolation::MalformedMessage(e.to_string()))?;
        if msg.has_keys() {
            return Err(ProtocolViolation::UnexpectedKeys.into());
        }

        let aux = self
            .attester
            .verify_attestation(&msg.document.0, nonce)
            .map_err(|e| SyncError::AttestationInvalid(e.to_string()))?;
        let worker_aux =
            WorkerAuxInfo::try_from(aux).map_err(ProtocolViolation::UnexpectedAuxInfo)?;
        if worker_aux.leaders_nonce != *nonce {
            return Err(SyncError::AttestationInvalid(format!(
                "Expected nonce {nonce:x}, received nonce: {:x}",
                worker_aux.leaders_nonce
            )));
        }
        Ok(worker_aux)
    }
}

/// The worker's `host[:port]`, used to name it in reports
fn worker_host(worker: &Url) -> String {
    match (worker.host_str(), worker.port()) {
        (Some(host), Some(port)) => format!("{host}:{port}"),
        (Some(host), None) => host.to_string(),
        (None, _) => worker.to_string(),
    }
}

#[cfg(all(test, feature = "transparent"))]
mod tests {
    use std::collections::HashMap;
    use std::sync::Mutex;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::time::{Duration, Instant};

    use axum::Router;
    use axum::extract::{Query, State};
    use axum::routing::get;
    use shared::sealed::open_anonymous;
    use shared::{AuxInfo, Base64Bytes, HexBytes};
    use sha2::{Digest, Sha256};
    use x25519_dalek::{EphemeralSecret, PublicKey};

    use super::*;
    use crate::keys::{EnclaveKeys, KeyMaterial};
    use crate::transparent::TransparentAttester;
    use crate::transport::unauthenticated_client;

    const CODE: &[u8] = b"keysync enclave image";

    /// How the mock worker misbehaves, if at all
    #[derive(Debug, Copy, Clone, PartialEq, Eq)]
    enum Mode {
        Honest,
        StaleNonce,
        SendsKeys,
        Oversized,
        LeaderAux,
        Unavailable,
        RejectsDelivery,
    }

    struct MockWorker {
        mode: Mode,
        attester: TransparentAttester,
        gets: AtomicU32,
        posts: AtomicU32,
        session: Mutex<Option<(EphemeralSecret, Nonce)>>,
        delivered: Mutex<Option<(AttestationMessage, Nonce)>>,
        received_keys: Mutex<Option<Vec<u8>>>,
    }

    impl MockWorker {
        fn new(mode: Mode) -> Self {
            Self {
                mode,
                attester: TransparentAttester::new(TransparentAttester::measure(CODE)),
                gets: AtomicU32::new(0),
                posts: AtomicU32::new(0),
                session: Mutex::new(None),
                delivered: Mutex::new(None),
                received_keys: Mutex::new(None),
            }
        }
    }

    async fn attestation(
        State(worker): State<Arc<MockWorker>>,
        Query(params): Query<HashMap<String, String>>,
    ) -> std::result::Result<String, StatusCode> {
        worker.gets.fetch_add(1, Ordering::SeqCst);
        let leaders_nonce = params
            .get("nonce")
            .and_then(|n| Nonce::from_hex(n).ok())
            .ok_or(StatusCode::BAD_REQUEST)?;
        let secret = EphemeralSecret::random_from_rng(OsRng);
        let workers_nonce = Nonce::generate(&mut OsRng).unwrap();
        let public_key = HexBytes(PublicKey::from(&secret).to_bytes());
        let aux = match worker.mode {
            Mode::Unavailable => return Err(StatusCode::INTERNAL_SERVER_ERROR),
            Mode::Oversized => return Ok("x".repeat(max_read_len() + 1)),
            Mode::StaleNonce => AuxInfo::from(WorkerAuxInfo {
                workers_nonce,
                leaders_nonce: Nonce::from([0; shared::NONCE_LEN]),
                public_key,
            }),
            Mode::LeaderAux => AuxInfo::from(LeaderAuxInfo::commit(leaders_nonce, b"")),
            _ => AuxInfo::from(WorkerAuxInfo {
                workers_nonce,
                leaders_nonce,
                public_key,
            }),
        };
        let document = worker.attester.create_attestation(&aux).unwrap();
        *worker.session.lock().unwrap() = Some((secret, workers_nonce));

        let mut msg = AttestationMessage::request_reply(document);
        if worker.mode == Mode::SendsKeys {
            msg.encrypted_keys = Base64Bytes(vec![1, 2, 3]);
        }
        Ok(String::from_utf8(msg.to_json().unwrap()).unwrap())
    }

    async fn delivery(State(worker): State<Arc<MockWorker>>, body: String) -> StatusCode {
        worker.posts.fetch_add(1, Ordering::SeqCst);
        if worker.mode == Mode::RejectsDelivery {
            return StatusCode::FORBIDDEN;
        }
        let Ok(msg) = AttestationMessage::from_json(body.as_bytes()) else {
            return StatusCode::BAD_REQUEST;
        };
        let Some((secret, workers_nonce)) = worker.session.lock().unwrap().take() else {
            return StatusCode::BAD_REQUEST;
        };
        let Ok(aux) = worker
            .attester
            .verify_attestation(&msg.document.0, &workers_nonce)
        else {
            return StatusCode::UNAUTHORIZED;
        };
        let Ok(leader_aux) = LeaderAuxInfo::try_from(aux) else {
            return StatusCode::BAD_REQUEST;
        };
        if !leader_aux.commits_to(&msg.encrypted_keys.0) {
            return StatusCode::UNAUTHORIZED;
        }
        let Ok(keys) = open_anonymous(&msg.encrypted_keys.0, secret) else {
            return StatusCode::UNAUTHORIZED;
        };
        *worker.received_keys.lock().unwrap() = Some(keys);
        *worker.delivered.lock().unwrap() = Some((msg, workers_nonce));
        StatusCode::OK
    }

    async fn spawn_worker(mode: Mode) -> (Arc<MockWorker>, Url) {
        let worker = Arc::new(MockWorker::new(mode));
        let app = Router::new()
            .route("/enclave/sync", get(attestation).post(delivery))
            .with_state(worker.clone());
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move { axum::serve(listener, app).await.unwrap() });
        let url = format!("http://{addr}/enclave/sync").parse().unwrap();
        (worker, url)
    }

    /// Records every state a sync passes through
    #[derive(Default)]
    struct Transitions(Mutex<Vec<SyncState>>);

    impl SyncObserver for Transitions {
        fn attempt_failed(&self, _: &str, _: u32, _: Option<Duration>, _: &str) {}

        fn transition(&self, _: &str, state: SyncState) {
            self.0.lock().unwrap().push(state);
        }

        fn finished(&self, _: &str, _: std::result::Result<(), &SyncError>) {}
    }

    fn test_backoff() -> Backoff {
        Backoff {
            max_attempts: 5,
            max_wait: Duration::from_millis(60),
            unit: Duration::from_millis(1),
        }
    }

    fn test_keys() -> Arc<EnclaveKeys> {
        Arc::new(EnclaveKeys::new(KeyMaterial {
            node_cert: b"certificate".to_vec(),
            node_key: b"node key".to_vec(),
            app_keys: b"app keys".to_vec(),
        }))
    }

    fn leader<A: Attester + Send + Sync>(attester: A) -> LeaderSync<A, EnclaveKeys> {
        LeaderSync::new(attester, test_keys(), unauthenticated_client(None).unwrap())
            .with_backoff(test_backoff())
    }

    fn transparent_leader() -> LeaderSync<TransparentAttester, EnclaveKeys> {
        leader(TransparentAttester::new(TransparentAttester::measure(CODE)))
    }

    /// An attester that forgets to check the nonce
    struct Lax(TransparentAttester);

    impl Attester for Lax {
        type Error = <TransparentAttester as Attester>::Error;

        fn verify_attestation(
            &self,
            document: &[u8],
            _: &Nonce,
        ) -> std::result::Result<AuxInfo, Self::Error> {
            let any = Nonce::from([0; shared::NONCE_LEN]);
            self.0.verify_attestation(document, &any)
        }

        fn create_attestation(&self, aux: &AuxInfo) -> std::result::Result<Vec<u8>, Self::Error> {
            self.0.create_attestation(aux)
        }
    }

    #[tokio::test]
    async fn test_sync_delivers_committed_keys() {
        let (worker, url) = spawn_worker(Mode::Honest).await;
        let transitions = Arc::new(Transitions::default());
        let leader = transparent_leader().with_observer(transitions.clone());
        leader.sync_with(&url).await.expect("Test failed");

        assert_eq!(worker.gets.load(Ordering::SeqCst), 1);
        assert_eq!(worker.posts.load(Ordering::SeqCst), 1);
        let received = worker.received_keys.lock().unwrap().take().expect("Test failed");
        let received: KeyMaterial = serde_json::from_slice(&received).expect("Test failed");
        assert_eq!(received, test_keys().copy());

        // the digest in the leader's document covers the exact bytes on the wire
        let (msg, workers_nonce) = worker.delivered.lock().unwrap().take().expect("Test failed");
        let aux = worker
            .attester
            .verify_attestation(&msg.document.0, &workers_nonce)
            .expect("Test failed");
        let AuxInfo::Leader(leader_aux) = aux else {
            panic!("Test failed");
        };
        let digest: [u8; 32] = Sha256::digest(&msg.encrypted_keys.0).into();
        assert_eq!(leader_aux.hash_of_encrypted.0, digest);
        assert_eq!(leader_aux.workers_nonce, workers_nonce);

        assert_eq!(
            *transitions.0.lock().unwrap(),
            vec![
                SyncState::Start,
                SyncState::NonceCreated,
                SyncState::AttestationRequested,
                SyncState::AttestationVerified,
                SyncState::KeysEncrypted,
                SyncState::CommitmentAttested,
                SyncState::Delivered,
            ]
        );
    }

    #[tokio::test]
    async fn test_stale_nonce_is_rejected() {
        let (worker, url) = spawn_worker(Mode::StaleNonce).await;
        let transitions = Arc::new(Transitions::default());
        let leader = transparent_leader().with_observer(transitions.clone());
        let err = leader.sync_with(&url).await.expect_err("Test failed");

        assert!(matches!(err, SyncError::AttestationInvalid(_)));
        assert_eq!(worker.gets.load(Ordering::SeqCst), 1);
        assert_eq!(worker.posts.load(Ordering::SeqCst), 0);
        assert_eq!(
            *transitions.0.lock().unwrap(),
            vec![
                SyncState::Start,
                SyncState::NonceCreated,
                SyncState::AttestationRequested,
                SyncState::Failed,
            ]
        );
    }

    /// Even if an attester skips the nonce check, the leader does not
    /// accept a document made for another nonce.
    #[tokio::test]
    async fn test_nonce_is_checked_regardless_of_attester() {
        let (worker, url) = spawn_worker(Mode::StaleNonce).await;
        let leader = leader(Lax(TransparentAttester::new(TransparentAttester::measure(CODE))));
        let err = leader.sync_with(&url).await.expect_err("Test failed");
        assert!(matches!(err, SyncError::AttestationInvalid(_)));
        assert_eq!(worker.posts.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_unexpected_measurement_is_rejected() {
        let (worker, url) = spawn_worker(Mode::Honest).await;
        let leader = leader(TransparentAttester::new(TransparentAttester::measure(
            b"some other image",
        )));
        let err = leader.sync_with(&url).await.expect_err("Test failed");
        assert!(matches!(err, SyncError::AttestationInvalid(_)));
        assert!(err.is_trust_failure());
        assert_eq!(worker.posts.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_keys_in_attestation_reply_are_rejected() {
        let (worker, url) = spawn_worker(Mode::SendsKeys).await;
        let err = transparent_leader().sync_with(&url).await.expect_err("Test failed");
        assert!(matches!(
            err,
            SyncError::ProtocolViolation(ProtocolViolation::UnexpectedKeys)
        ));
        assert_eq!(worker.gets.load(Ordering::SeqCst), 1);
        assert_eq!(worker.posts.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_oversized_reply_is_rejected() {
        let (worker, url) = spawn_worker(Mode::Oversized).await;
        let err = transparent_leader().sync_with(&url).await.expect_err("Test failed");
        assert!(matches!(
            err,
            SyncError::ProtocolViolation(ProtocolViolation::BodyTooLarge(limit)) if limit == max_read_len()
        ));
        assert_eq!(worker.posts.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_wrong_aux_info_is_rejected() {
        let (worker, url) = spawn_worker(Mode::LeaderAux).await;
        let err = transparent_leader().sync_with(&url).await.expect_err("Test failed");
        assert!(matches!(
            err,
            SyncError::ProtocolViolation(ProtocolViolation::UnexpectedAuxInfo(_))
        ));
        assert_eq!(worker.posts.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_unavailable_worker_exhausts_retries() {
        let (worker, url) = spawn_worker(Mode::Unavailable).await;
        let start = Instant::now();
        let err = transparent_leader().sync_with(&url).await.expect_err("Test failed");

        let SyncError::TransportExhausted {
            attempts,
            status,
            error,
        } = err
        else {
            panic!("Test failed");
        };
        assert_eq!(attempts, 5);
        assert_eq!(status, Some(StatusCode::INTERNAL_SERVER_ERROR));
        assert!(error.is_none());
        assert_eq!(worker.gets.load(Ordering::SeqCst), 5);
        assert_eq!(worker.posts.load(Ordering::SeqCst), 0);
        assert!(start.elapsed() >= test_backoff().worst_case_sleep());
    }

    /// Records which worker each failed attempt was reported for
    #[derive(Default)]
    struct Attempts(Mutex<Vec<(String, u32)>>);

    impl SyncObserver for Attempts {
        fn attempt_failed(&self, worker: &str, attempt: u32, _: Option<Duration>, _: &str) {
            self.0.lock().unwrap().push((worker.to_string(), attempt));
        }

        fn transition(&self, _: &str, _: SyncState) {}

        fn finished(&self, _: &str, _: std::result::Result<(), &SyncError>) {}
    }

    #[tokio::test]
    async fn test_failed_attempts_name_the_worker() {
        let (_, url) = spawn_worker(Mode::Unavailable).await;
        let attempts = Arc::new(Attempts::default());
        let leader = transparent_leader().with_observer(attempts.clone());
        leader.sync_with(&url).await.expect_err("Test failed");

        let host = worker_host(&url);
        assert_eq!(
            *attempts.0.lock().unwrap(),
            (1..=5).map(|n| (host.clone(), n)).collect::<Vec<_>>()
        );
    }

    #[tokio::test]
    async fn test_unreachable_worker_exhausts_retries() {
        let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        let url: Url = format!("http://{}/", listener.local_addr().unwrap())
            .parse()
            .unwrap();
        drop(listener);
        let err = transparent_leader().sync_with(&url).await.expect_err("Test failed");
        assert!(matches!(
            err,
            SyncError::TransportExhausted {
                attempts: 5,
                status: None,
                error: Some(_)
            }
        ));
    }

    #[tokio::test]
    async fn test_rejected_delivery_is_not_retried() {
        let (worker, url) = spawn_worker(Mode::RejectsDelivery).await;
        let err = transparent_leader().sync_with(&url).await.expect_err("Test failed");
        assert!(matches!(
            err,
            SyncError::DeliveryFailed {
                status: Some(StatusCode::FORBIDDEN),
                ..
            }
        ));
        assert_eq!(worker.posts.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_concurrent_syncs() {
        let (first, first_url) = spawn_worker(Mode::Honest).await;
        let (second, second_url) = spawn_worker(Mode::Honest).await;
        let leader = transparent_leader();
        let (a, b) = tokio::join!(leader.sync_with(&first_url), leader.sync_with(&second_url));
        a.expect("Test failed");
        b.expect("Test failed");
        let first = first.delivered.lock().unwrap().take().expect("Test failed");
        let second = second.delivered.lock().unwrap().take().expect("Test failed");
        assert_ne!(first.1, second.1);
        assert_ne!(first.0.encrypted_keys, second.0.encrypted_keys);
    }
}
