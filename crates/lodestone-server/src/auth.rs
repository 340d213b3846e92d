use std::future::Future;
use std::net::IpAddr;
use std::pin::Pin;
use std::sync::Arc;
use std::time::Duration;

use lodestone_types::{GameProfile, ProfileProperty};
use num_bigint::BigInt;
use rand::Rng;
use rsa::pkcs8::EncodePublicKey;
use rsa::{Pkcs1v15Encrypt, RsaPrivateKey, RsaPublicKey};
use serde::Deserialize;
use sha1::{Digest, Sha1};
use tokio::runtime::{Handle, Runtime};
use tokio::sync::Semaphore;
use tracing::{debug, warn};
use uuid::Uuid;

const RSA_KEY_SIZE: usize = 1024;

pub const VERIFY_TOKEN_SIZE: usize = 4;

const HTTP_TIMEOUT: Duration = Duration::from_secs(10);

#[derive(Debug, thiserror::Error)]
pub enum AuthError {
    #[error("RSA error: {0}")]
    Rsa(#[from] rsa::Error),

    #[error("PKCS8 error: {0}")]
    Pkcs8(#[from] rsa::pkcs8::spki::Error),

    #[error("Verify token mismatch")]
    VerifyTokenMismatch,

    #[error("Shared secret must be 16 bytes, got {0}")]
    BadSharedSecret(usize),

    /// The session service could not be reached or failed on its side.
    #[error("Session service unavailable: {0}")]
    Unavailable(String),

    /// The session service has no record of this player joining.
    #[error("Session not found")]
    ProfileNotFound,

    #[error("Unexpected session service response: {0}")]
    InvalidResponse(String),

    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),
}

/// The server's RSA keypair, generated once at startup.
pub struct AuthKeys {
    private_key: RsaPrivateKey,
    public_key_der: Vec<u8>,
}

impl AuthKeys {
    pub fn generate() -> Result<Self, AuthError> {
        let private_key = RsaPrivateKey::new(&mut rand::thread_rng(), RSA_KEY_SIZE)?;
        let public_key = RsaPublicKey::from(&private_key);
        let public_key_der = public_key.to_public_key_der()?.into_vec();

        Ok(Self {
            private_key,
            public_key_der,
        })
    }

    pub fn public_key_der(&self) -> &[u8] {
        &self.public_key_der
    }

    /// Decrypt the client's shared secret and check its copy of the
    /// verify token against the one this session sent.
    pub fn decrypt_response(
        &self,
        encrypted_secret: &[u8],
        encrypted_token: &[u8],
        expected_token: &[u8],
    ) -> Result<[u8; 16], AuthError> {
        let decrypted_token = self.private_key.decrypt(Pkcs1v15Encrypt, encrypted_token)?;
        if decrypted_token != expected_token {
            return Err(AuthError::VerifyTokenMismatch);
        }

        let shared_secret = self
            .private_key
            .decrypt(Pkcs1v15Encrypt, encrypted_secret)?;
        shared_secret
            .as_slice()
            .try_into()
            .map_err(|_| AuthError::BadSharedSecret(shared_secret.len()))
    }

    /// `SHA1(server_id + shared_secret + public_key)` in the signed hex form
    /// the session service expects.
    pub fn server_hash(&self, server_id: &str, shared_secret: &[u8]) -> String {
        let mut hasher = Sha1::new();
        hasher.update(server_id.as_bytes());
        hasher.update(shared_secret);
        hasher.update(&self.public_key_der);
        minecraft_hex_digest(&hasher.finalize())
    }
}

impl std::fmt::Debug for AuthKeys {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AuthKeys")
            .field("public_key_der", &self.public_key_der.len())
            .finish_non_exhaustive()
    }
}

/// A fresh random verify token for one login attempt.
pub fn new_verify_token() -> [u8; VERIFY_TOKEN_SIZE] {
    let mut token = [0u8; VERIFY_TOKEN_SIZE];
    rand::thread_rng().fill(&mut token);
    token
}

/// Treat a SHA-1 digest as a two's complement number and print it in hex
/// without leading zeros.
pub fn minecraft_hex_digest(hash: &[u8]) -> String {
    let bigint = BigInt::from_signed_bytes_be(hash);
    format!("{bigint:x}")
}

/// What a session service needs to confirm that a player joined.
#[derive(Debug, Clone)]
pub struct VerifyRequest {
    pub name: String,
    pub server_hash: String,
    pub ip: Option<IpAddr>,
}

pub type BoxFuture<'a, T> = Pin<Box<dyn Future<Output = T> + Send + 'a>>;

/// Confirms that a player authenticated with the account service.
pub trait SessionService: Send + Sync + 'static {
    fn has_joined<'a>(
        &'a self,
        request: &'a VerifyRequest,
    ) -> BoxFuture<'a, Result<GameProfile, AuthError>>;
}

#[derive(Debug, Deserialize)]
struct SessionResponse {
    id: String,
    name: String,
    #[serde(default)]
    properties: Vec<SessionProperty>,
}

#[derive(Debug, Deserialize)]
struct SessionProperty {
    name: String,
    value: String,
    signature: Option<String>,
}

/// The Mojang `hasJoined` endpoint.
pub struct MojangSessionService {
    client: reqwest::Client,
    base_url: String,
}

impl MojangSessionService {
    pub fn new(base_url: &str) -> Result<Self, AuthError> {
        let client = reqwest::Client::builder().timeout(HTTP_TIMEOUT).build()?;
        Ok(Self {
            client,
            base_url: base_url.trim_end_matches('/').to_string(),
        })
    }

    async fn query(&self, request: &VerifyRequest) -> Result<GameProfile, AuthError> {
        let url = format!("{}/session/minecraft/hasJoined", self.base_url);
        let mut query = vec![
            ("username", request.name.clone()),
            ("serverId", request.server_hash.clone()),
        ];
        if let Some(ip) = request.ip {
            query.push(("ip", ip.to_string()));
        }

        let response = match self.client.get(&url).query(&query).send().await {
            Ok(response) => response,
            Err(e) if e.is_connect() || e.is_timeout() || e.is_request() => {
                return Err(AuthError::Unavailable(e.to_string()));
            }
            Err(e) => return Err(e.into()),
        };

        let status = response.status();
        if status == reqwest::StatusCode::NO_CONTENT {
            return Err(AuthError::ProfileNotFound);
        }
        if status.is_server_error() {
            return Err(AuthError::Unavailable(format!(
                "session server returned {}",
                status
            )));
        }
        if !status.is_success() {
            return Err(AuthError::InvalidResponse(format!(
                "session server returned {}",
                status
            )));
        }

        let session: SessionResponse = response.json().await?;

        // The service sends the UUID without hyphens.
        let uuid = Uuid::parse_str(&session.id)
            .map_err(|e| AuthError::InvalidResponse(format!("invalid UUID: {e}")))?;

        let properties = session
            .properties
            .into_iter()
            .map(|p| ProfileProperty {
                name: p.name,
                value: p.value,
                signature: p.signature,
            })
            .collect();

        Ok(GameProfile {
            uuid,
            name: session.name,
            properties,
        })
    }
}

impl SessionService for MojangSessionService {
    fn has_joined<'a>(
        &'a self,
        request: &'a VerifyRequest,
    ) -> BoxFuture<'a, Result<GameProfile, AuthError>> {
        Box::pin(self.query(request))
    }
}

/// Runs session-service calls with bounded concurrency, off the event loops.
pub struct AuthPool {
    service: Arc<dyn SessionService>,
    permits: Arc<Semaphore>,
    handle: Handle,
    runtime: Option<Runtime>,
}

impl AuthPool {
    /// Start a dedicated runtime with `workers` threads.
    pub fn new(service: Arc<dyn SessionService>, workers: usize) -> std::io::Result<Self> {
        let workers = workers.max(1);
        let runtime = tokio::runtime::Builder::new_multi_thread()
            .worker_threads(workers)
            .thread_name("auth-worker")
            .enable_all()
            .build()?;
        Ok(Self {
            service,
            permits: Arc::new(Semaphore::new(workers)),
            handle: runtime.handle().clone(),
            runtime: Some(runtime),
        })
    }

    /// Run verifications on an existing runtime instead of a dedicated one.
    pub fn with_handle(service: Arc<dyn SessionService>, workers: usize, handle: Handle) -> Self {
        Self {
            service,
            permits: Arc::new(Semaphore::new(workers.max(1))),
            handle,
            runtime: None,
        }
    }

    /// Verify `request` in the background and hand the outcome to `on_complete`.
    pub fn submit<F>(&self, request: VerifyRequest, on_complete: F)
    where
        F: FnOnce(Result<GameProfile, AuthError>) + Send + 'static,
    {
        let service = self.service.clone();
        let permits = self.permits.clone();
        self.handle.spawn(async move {
            let result = match permits.acquire_owned().await {
                Ok(_permit) => {
                    debug!("Verifying session of {}", request.name);
                    service.has_joined(&request).await
                }
                Err(_) => Err(AuthError::Unavailable("authentication pool closed".into())),
            };
            if let Err(e) = &result {
                warn!("Session verification of {} failed: {}", request.name, e);
            }
            on_complete(result);
        });
    }
}

impl Drop for AuthPool {
    fn drop(&mut self) {
        if let Some(runtime) = self.runtime.take() {
            runtime.shutdown_background();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rsa::pkcs8::DecodePublicKey;
    use tokio::sync::oneshot;

    #[test]
    fn test_minecraft_hex_digest() {
        // "Notch"
        let hash1: [u8; 20] = [
            0x4e, 0xd1, 0xf4, 0x6b, 0xbe, 0x04, 0xbc, 0x75, 0x6b, 0xcb, 0x17, 0xc0, 0xc7, 0xce,
            0x3e, 0x46, 0x32, 0xf0, 0x6a, 0x48,
        ];
        assert_eq!(
            minecraft_hex_digest(&hash1),
            "4ed1f46bbe04bc756bcb17c0c7ce3e4632f06a48"
        );

        // "jeb_"
        let hash2: [u8; 20] = [
            0x83, 0x62, 0xa4, 0xff, 0xbb, 0x3e, 0xcf, 0xef, 0x65, 0xa2, 0x84, 0xa0, 0x4a, 0x3c,
            0xe8, 0x3f, 0xd4, 0xb1, 0xd7, 0x3f,
        ];
        assert_eq!(
            minecraft_hex_digest(&hash2),
            "-7c9d5b0044c130109a5d7b5fb5c317c02b4e28c1"
        );
    }

    #[test]
    fn test_sha1_of_names() {
        assert_eq!(
            minecraft_hex_digest(&Sha1::digest(b"Notch")),
            "4ed1f46bbe04bc756bcb17c0c7ce3e4632f06a48"
        );
        assert_eq!(
            minecraft_hex_digest(&Sha1::digest(b"simon")),
            "88e16a1019277b15d58faf0541e11910eb756f6"
        );
    }

    #[test]
    fn test_key_exchange() {
        let keys = AuthKeys::generate().unwrap();
        let public = RsaPublicKey::from_public_key_der(keys.public_key_der()).unwrap();
        let mut rng = rand::thread_rng();

        let secret = [7u8; 16];
        let token = new_verify_token();
        let enc_secret = public.encrypt(&mut rng, Pkcs1v15Encrypt, &secret).unwrap();
        let enc_token = public.encrypt(&mut rng, Pkcs1v15Encrypt, &token).unwrap();

        let decrypted = keys.decrypt_response(&enc_secret, &enc_token, &token).unwrap();
        assert_eq!(decrypted, secret);

        let wrong = [token[0] ^ 0xFF, token[1], token[2], token[3]];
        assert!(matches!(
            keys.decrypt_response(&enc_secret, &enc_token, &wrong),
            Err(AuthError::VerifyTokenMismatch)
        ));
    }

    #[test]
    fn test_short_secret_is_rejected() {
        let keys = AuthKeys::generate().unwrap();
        let public = RsaPublicKey::from_public_key_der(keys.public_key_der()).unwrap();
        let mut rng = rand::thread_rng();
        let token = new_verify_token();
        let enc_secret = public.encrypt(&mut rng, Pkcs1v15Encrypt, &[1u8; 8]).unwrap();
        let enc_token = public.encrypt(&mut rng, Pkcs1v15Encrypt, &token).unwrap();
        assert!(matches!(
            keys.decrypt_response(&enc_secret, &enc_token, &token),
            Err(AuthError::BadSharedSecret(8))
        ));
    }

    struct Fixed(Option<GameProfile>);

    impl SessionService for Fixed {
        fn has_joined<'a>(
            &'a self,
            _request: &'a VerifyRequest,
        ) -> BoxFuture<'a, Result<GameProfile, AuthError>> {
            let result = self.0.clone().ok_or(AuthError::ProfileNotFound);
            Box::pin(async move { result })
        }
    }

    #[tokio::test]
    async fn test_pool_delivers_result() {
        let profile = GameProfile::new(Uuid::new_v4(), "Notch");
        let pool = AuthPool::with_handle(
            Arc::new(Fixed(Some(profile.clone()))),
            2,
            Handle::current(),
        );
        let (tx, rx) = oneshot::channel();
        pool.submit(
            VerifyRequest {
                name: "Notch".into(),
                server_hash: "abc".into(),
                ip: None,
            },
            move |result| {
                let _ = tx.send(result);
            },
        );
        assert_eq!(rx.await.unwrap().unwrap(), profile);
    }

    #[test]
    fn test_dedicated_pool_reports_not_found() {
        let pool = AuthPool::new(Arc::new(Fixed(None)), 1).unwrap();
        let (tx, rx) = std::sync::mpsc::channel();
        pool.submit(
            VerifyRequest {
                name: "Ghost".into(),
                server_hash: "abc".into(),
                ip: None,
            },
            move |result| {
                let _ = tx.send(result);
            },
        );
        let result = rx.recv_timeout(Duration::from_secs(5)).unwrap();
        assert!(matches!(result, Err(AuthError::ProfileNotFound)));
    }
}
