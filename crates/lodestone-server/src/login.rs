use lodestone_protocol_core::{ConnectionError, Packet, ProtocolState};
use lodestone_types::GameProfile;
use tokio::io::{AsyncRead, AsyncWrite};
use tracing::{debug, error, info, warn};

use crate::auth::{new_verify_token, AuthError, VerifyRequest, VERIFY_TOKEN_SIZE};
use crate::driver::{unexpected, DriverError, Flow, SessionDriver};
use crate::session::Command;

pub const AUTH_SERVERS_DOWN: &str =
    "Authentication servers are down. Please try again later, sorry!";
pub const FAILED_TO_VERIFY: &str = "Failed to verify username!";

const MAX_NAME_LEN: usize = 16;

#[derive(Debug)]
pub(crate) enum LoginStage {
    /// Waiting for Login Start.
    Hello,
    /// Encryption request sent, waiting for the client's shared secret.
    Key {
        name: String,
        verify_token: [u8; VERIFY_TOKEN_SIZE],
    },
    /// The session service has been asked about `name`.
    Authenticating { name: String },
    Done,
}

pub fn is_valid_name(name: &str) -> bool {
    !name.is_empty()
        && name.len() <= MAX_NAME_LEN
        && name.chars().all(|c| c.is_ascii_alphanumeric() || c == '_')
}

impl<R, W> SessionDriver<R, W>
where
    R: AsyncRead + Unpin + Send,
    W: AsyncWrite + Unpin + Send,
{
    pub(crate) async fn handle_login(&mut self, packet: Packet) -> Result<Flow, DriverError> {
        match packet {
            Packet::LoginStart { name } if matches!(self.login, LoginStage::Hello) => {
                self.login_start(name).await
            }
            Packet::EncryptionResponse {
                shared_secret,
                verify_token,
            } if matches!(self.login, LoginStage::Key { .. }) => {
                self.encryption_response(&shared_secret, &verify_token).await
            }
            other => Err(unexpected(self.state, &other)),
        }
    }

    async fn login_start(&mut self, name: String) -> Result<Flow, DriverError> {
        if !is_valid_name(&name) {
            return self.disconnect("Invalid characters in username".into()).await;
        }

        let peer = self.session.peer_addr();
        if !self.ctx.config.online_mode.authenticates(&peer) {
            info!("Offline login for {} from {}", name, peer);
            return self.finish_login(GameProfile::offline(&name)).await;
        }

        let Some(keys) = self.ctx.keys.as_ref() else {
            return Err(DriverError::Protocol(
                "Online login without a server keypair".into(),
            ));
        };
        let verify_token = new_verify_token();
        let request = Packet::EncryptionRequest {
            server_id: String::new(),
            public_key: keys.public_key_der().to_vec(),
            verify_token: verify_token.to_vec(),
        };
        self.login = LoginStage::Key { name, verify_token };
        self.write(&request).await?;
        Ok(Flow::Continue)
    }

    async fn encryption_response(
        &mut self,
        encrypted_secret: &[u8],
        encrypted_token: &[u8],
    ) -> Result<Flow, DriverError> {
        let LoginStage::Key { name, verify_token } =
            std::mem::replace(&mut self.login, LoginStage::Done)
        else {
            return Err(DriverError::Protocol("Unexpected encryption response".into()));
        };
        let ctx = self.ctx.clone();
        let (Some(keys), Some(auth)) = (ctx.keys.as_ref(), ctx.auth.as_ref()) else {
            return Err(DriverError::Protocol(
                "Online login without a session service".into(),
            ));
        };

        let secret = keys
            .decrypt_response(encrypted_secret, encrypted_token, &verify_token)
            .map_err(|e| DriverError::Protocol(e.to_string()))?;
        let server_hash = keys.server_hash("", &secret);

        self.enable_encryption(&secret)?;

        if !self.session.begin_verification() {
            return Err(DriverError::Protocol(
                "Verification already in progress".into(),
            ));
        }
        let ip = ctx
            .config
            .prevent_proxy_connections
            .then(|| self.session.peer_addr().ip());
        let session = self.session.clone();
        auth.submit(
            VerifyRequest {
                name: name.clone(),
                server_hash,
                ip,
            },
            move |result| {
                if !session.deliver(Command::VerificationComplete(result)) {
                    session.end_verification();
                    debug!(
                        "Dropping verification result for closed session {}",
                        session.id()
                    );
                }
            },
        );
        self.login = LoginStage::Authenticating { name };
        Ok(Flow::Continue)
    }

    /// Turn on the cipher for both directions. Only allowed once.
    pub(crate) fn enable_encryption(&mut self, secret: &[u8]) -> Result<(), DriverError> {
        if !self.session.mark_encrypted() {
            return Err(ConnectionError::EncryptionAlreadyEnabled.into());
        }
        self.reader.enable_encryption(secret)?;
        self.writer.enable_encryption(secret)?;
        Ok(())
    }

    /// Announce the threshold (while still uncompressed), then compress
    /// everything after it in both directions.
    pub(crate) async fn set_compression(&mut self, threshold: i32) -> Result<(), DriverError> {
        if threshold >= 0 {
            self.write(&Packet::SetCompression { threshold }).await?;
        }
        self.reader.set_compression(threshold);
        self.writer.set_compression(threshold);
        self.session.set_compression_threshold(threshold);
        Ok(())
    }

    pub(crate) async fn complete_verification(
        &mut self,
        result: Result<GameProfile, AuthError>,
    ) -> Result<Flow, DriverError> {
        self.session.end_verification();
        let name = match std::mem::replace(&mut self.login, LoginStage::Done) {
            LoginStage::Authenticating { name } => name,
            other => {
                self.login = other;
                return Ok(Flow::Continue);
            }
        };
        if self.session.is_closed() {
            return Ok(Flow::Stop);
        }

        match result {
            Ok(profile) => {
                info!("UUID of player {} is {}", profile.name, profile.uuid);
                self.finish_login(profile).await
            }
            Err(AuthError::Unavailable(cause)) => {
                warn!(
                    "Authentication servers are down, could not verify {}: {}",
                    name, cause
                );
                self.disconnect(AUTH_SERVERS_DOWN.into()).await
            }
            Err(AuthError::ProfileNotFound) => {
                warn!("Failed to verify username {}", name);
                self.disconnect(FAILED_TO_VERIFY.into()).await
            }
            Err(e) => {
                error!("Could not verify username {}: {}", name, e);
                self.disconnect(FAILED_TO_VERIFY.into()).await
            }
        }
    }

    async fn finish_login(&mut self, profile: GameProfile) -> Result<Flow, DriverError> {
        let threshold = self.ctx.config.compression_threshold;
        self.set_compression(threshold).await?;
        self.write(&Packet::LoginSuccess {
            profile: profile.clone(),
        })
        .await?;
        self.login = LoginStage::Done;
        self.set_state(ProtocolState::Play);
        self.session.touch_keep_alive();

        if !self.session.set_identity(profile.clone()) {
            return Err(DriverError::Protocol("Identity already attached".into()));
        }
        info!(
            "{} ({}) logged in from {}",
            profile.name,
            profile.uuid,
            self.session.peer_addr()
        );
        self.ctx.listener.on_session_ready(&self.session, &profile);
        Ok(Flow::Continue)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_name_rules() {
        assert!(is_valid_name("Steve"));
        assert!(is_valid_name("jeb_"));
        assert!(is_valid_name("abcdefghijklmnop"));
        assert!(!is_valid_name(""));
        assert!(!is_valid_name("abcdefghijklmnopq"));
        assert!(!is_valid_name("bad name"));
        assert!(!is_valid_name("Stéve"));
    }
}
