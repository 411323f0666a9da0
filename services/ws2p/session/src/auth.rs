//! Handshake strategies.
//!
//! A session runs two halves of the handshake at once:
//!
//! - [`LocalAuth`] proves our identity: it emits CONNECT, checks the remote
//!   ACK and answers with OK.
//! - [`RemoteAuth`] checks the remote identity: it verifies the remote
//!   CONNECT, answers with ACK and checks the remote OK.
//!
//! The pubkey strategies sign with a [`KeyPair`]; the `No*` strategies skip
//! the exchange entirely and are meant for local tooling and tests.

use crate::crypto::{verify, KeyPair};
use crate::error::AuthError;
use async_trait::async_trait;
use std::sync::Arc;
use tracing::{debug, trace};
use uuid::Uuid;
use ws2p_wire::{Ack, AuthOk, Connect, WireMessage};

/// Decides whether a remote key may open a session
#[async_trait]
pub trait AdmissionPolicy: Send + Sync {
    /// Return true to let `pubkey` authenticate
    async fn accept(&self, pubkey: &str) -> bool;
}

/// Admission policy accepting every key
#[derive(Debug, Default, Clone, Copy)]
pub struct AcceptAll;

#[async_trait]
impl AdmissionPolicy for AcceptAll {
    async fn accept(&self, _pubkey: &str) -> bool {
        true
    }
}

/// Our side of the handshake
#[async_trait]
pub trait LocalAuth: Send + Sync {
    /// CONNECT frame to open the handshake, if any
    fn connect_message(&self) -> Option<WireMessage>;

    /// Check the remote ACK; on success the remote is authenticated
    async fn register_ack(&mut self, ack: &Ack) -> Result<(), AuthError>;

    /// OK frame confirming a valid ACK, if any
    fn ok_message(&self) -> Option<WireMessage>;

    /// True once the remote ACK was verified
    fn is_remote_authenticated(&self) -> bool;
}

/// The remote side of the handshake
#[async_trait]
pub trait RemoteAuth: Send + Sync {
    /// Check the remote CONNECT and remember its key and challenge
    async fn register_connect(&mut self, connect: &Connect) -> Result<(), AuthError>;

    /// ACK frame answering a valid CONNECT, if any
    fn ack_message(&self) -> Option<WireMessage>;

    /// Check the remote OK; on success we are authenticated by the remote
    fn register_ok(&mut self, ok: &AuthOk) -> Result<(), AuthError>;

    /// True once the remote OK was verified
    fn is_authenticated_by_remote(&self) -> bool;

    /// Key presented in the remote CONNECT
    fn remote_pubkey(&self) -> Option<&str>;
}

/// Fresh unguessable challenge
pub fn new_challenge() -> String {
    format!("{}{}", Uuid::new_v4(), Uuid::new_v4())
}

/// Keypair-based local authentication
pub struct PubkeyLocalAuth {
    currency: String,
    pair: Arc<KeyPair>,
    challenge: String,
    policy: Arc<dyn AdmissionPolicy>,
    authenticated: bool,
}

impl PubkeyLocalAuth {
    /// Create a local authenticator with a fresh challenge
    pub fn new(
        currency: impl Into<String>,
        pair: Arc<KeyPair>,
        policy: Arc<dyn AdmissionPolicy>,
    ) -> Self {
        Self {
            currency: currency.into(),
            pair,
            challenge: new_challenge(),
            policy,
            authenticated: false,
        }
    }
}

#[async_trait]
impl LocalAuth for PubkeyLocalAuth {
    fn connect_message(&self) -> Option<WireMessage> {
        let message = format!(
            "WS2P:CONNECT:{}:{}:{}",
            self.currency,
            self.pair.pubkey(),
            self.challenge
        );
        trace!("sendCONNECT >>> {}", message);
        Some(WireMessage::Connect(Connect {
            pubkey: self.pair.pubkey().to_string(),
            challenge: self.challenge.clone(),
            sig: self.pair.sign(&message),
            currency: Some(self.currency.clone()),
        }))
    }

    async fn register_ack(&mut self, ack: &Ack) -> Result<(), AuthError> {
        if !self.policy.accept(&ack.pubkey).await {
            return Err(AuthError::Rejected(ack.pubkey.clone()));
        }
        let message = format!("WS2P:ACK:{}:{}:{}", self.currency, ack.pubkey, self.challenge);
        trace!("registerACK >>> {}", message);
        if !verify(&message, &ack.sig, &ack.pubkey) {
            return Err(AuthError::WrongAckSignature);
        }
        self.authenticated = true;
        Ok(())
    }

    fn ok_message(&self) -> Option<WireMessage> {
        let message = format!(
            "WS2P:OK:{}:{}:{}",
            self.currency,
            self.pair.pubkey(),
            self.challenge
        );
        trace!("sendOK >>> {}", message);
        Some(WireMessage::Ok(AuthOk {
            sig: self.pair.sign(&message),
        }))
    }

    fn is_remote_authenticated(&self) -> bool {
        self.authenticated
    }
}

/// Keypair-based remote authentication
pub struct PubkeyRemoteAuth {
    currency: String,
    pair: Arc<KeyPair>,
    challenge: String,
    remote_pub: Option<String>,
    policy: Arc<dyn AdmissionPolicy>,
    authenticated_by_remote: bool,
}

impl PubkeyRemoteAuth {
    /// Create a remote authenticator
    pub fn new(
        currency: impl Into<String>,
        pair: Arc<KeyPair>,
        policy: Arc<dyn AdmissionPolicy>,
    ) -> Self {
        Self {
            currency: currency.into(),
            pair,
            challenge: new_challenge(),
            remote_pub: None,
            policy,
            authenticated_by_remote: false,
        }
    }
}

#[async_trait]
impl RemoteAuth for PubkeyRemoteAuth {
    async fn register_connect(&mut self, connect: &Connect) -> Result<(), AuthError> {
        if !self.policy.accept(&connect.pubkey).await {
            return Err(AuthError::Rejected(connect.pubkey.clone()));
        }
        if let Some(currency) = connect.currency.as_deref() {
            if !currency.is_empty() && currency != self.currency {
                return Err(AuthError::WrongCurrency {
                    expected: self.currency.clone(),
                    got: currency.to_string(),
                });
            }
        }
        let message = format!(
            "WS2P:CONNECT:{}:{}:{}",
            self.currency, connect.pubkey, connect.challenge
        );
        trace!("registerCONNECT >>> {}", message);
        if !verify(&message, &connect.sig, &connect.pubkey) {
            return Err(AuthError::WrongConnectSignature);
        }
        self.challenge = connect.challenge.clone();
        self.remote_pub = Some(connect.pubkey.clone());
        Ok(())
    }

    fn ack_message(&self) -> Option<WireMessage> {
        let message = format!(
            "WS2P:ACK:{}:{}:{}",
            self.currency,
            self.pair.pubkey(),
            self.challenge
        );
        trace!("sendACK >>> {}", message);
        Some(WireMessage::Ack(Ack {
            pubkey: self.pair.pubkey().to_string(),
            sig: self.pair.sign(&message),
        }))
    }

    fn register_ok(&mut self, ok: &AuthOk) -> Result<(), AuthError> {
        let Some(remote_pub) = self.remote_pub.as_deref() else {
            return Err(AuthError::WrongOkSignature);
        };
        let message = format!("WS2P:OK:{}:{}:{}", self.currency, remote_pub, self.challenge);
        trace!("registerOK >>> {}", message);
        if !verify(&message, &ok.sig, remote_pub) {
            return Err(AuthError::WrongOkSignature);
        }
        debug!("Remote {} confirmed the handshake", remote_pub);
        self.authenticated_by_remote = true;
        Ok(())
    }

    fn is_authenticated_by_remote(&self) -> bool {
        self.authenticated_by_remote
    }

    fn remote_pubkey(&self) -> Option<&str> {
        self.remote_pub.as_deref()
    }
}

/// Local authentication that trusts the remote without any exchange
#[derive(Debug, Default)]
pub struct NoLocalAuth;

#[async_trait]
impl LocalAuth for NoLocalAuth {
    fn connect_message(&self) -> Option<WireMessage> {
        None
    }

    async fn register_ack(&mut self, _ack: &Ack) -> Result<(), AuthError> {
        Ok(())
    }

    fn ok_message(&self) -> Option<WireMessage> {
        None
    }

    fn is_remote_authenticated(&self) -> bool {
        true
    }
}

/// Remote authentication that considers the handshake done from the start
#[derive(Debug, Default)]
pub struct NoRemoteAuth {
    remote_pub: Option<String>,
}

#[async_trait]
impl RemoteAuth for NoRemoteAuth {
    async fn register_connect(&mut self, connect: &Connect) -> Result<(), AuthError> {
        self.remote_pub = Some(connect.pubkey.clone());
        Ok(())
    }

    fn ack_message(&self) -> Option<WireMessage> {
        None
    }

    fn register_ok(&mut self, _ok: &AuthOk) -> Result<(), AuthError> {
        Ok(())
    }

    fn is_authenticated_by_remote(&self) -> bool {
        true
    }

    fn remote_pubkey(&self) -> Option<&str> {
        self.remote_pub.as_deref()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn pair() -> Arc<KeyPair> {
        Arc::new(KeyPair::generate())
    }

    struct DenyAll;

    #[async_trait]
    impl AdmissionPolicy for DenyAll {
        async fn accept(&self, _pubkey: &str) -> bool {
            false
        }
    }

    fn unwrap_connect(msg: Option<WireMessage>) -> Connect {
        match msg {
            Some(WireMessage::Connect(c)) => c,
            other => panic!("expected CONNECT, got {:?}", other),
        }
    }

    fn unwrap_ack(msg: Option<WireMessage>) -> Ack {
        match msg {
            Some(WireMessage::Ack(a)) => a,
            other => panic!("expected ACK, got {:?}", other),
        }
    }

    fn unwrap_ok(msg: Option<WireMessage>) -> AuthOk {
        match msg {
            Some(WireMessage::Ok(o)) => o,
            other => panic!("expected OK, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_three_step_exchange() {
        let (a, b) = (pair(), pair());
        let mut a_local = PubkeyLocalAuth::new("g1", a.clone(), Arc::new(AcceptAll));
        let mut b_remote = PubkeyRemoteAuth::new("g1", b.clone(), Arc::new(AcceptAll));

        let connect = unwrap_connect(a_local.connect_message());
        b_remote.register_connect(&connect).await.unwrap();
        assert_eq!(b_remote.remote_pubkey(), Some(a.pubkey()));

        let ack = unwrap_ack(b_remote.ack_message());
        a_local.register_ack(&ack).await.unwrap();
        assert!(a_local.is_remote_authenticated());

        let ok = unwrap_ok(a_local.ok_message());
        b_remote.register_ok(&ok).unwrap();
        assert!(b_remote.is_authenticated_by_remote());
    }

    #[tokio::test]
    async fn test_forged_ack_is_refused() {
        let (a, b, mallory) = (pair(), pair(), pair());
        let mut a_local = PubkeyLocalAuth::new("g1", a.clone(), Arc::new(AcceptAll));
        let mut b_remote = PubkeyRemoteAuth::new("g1", b.clone(), Arc::new(AcceptAll));
        let connect = unwrap_connect(a_local.connect_message());
        b_remote.register_connect(&connect).await.unwrap();

        let mut ack = unwrap_ack(b_remote.ack_message());
        ack.pubkey = mallory.pubkey().to_string();
        assert_eq!(
            a_local.register_ack(&ack).await,
            Err(AuthError::WrongAckSignature)
        );
        assert!(!a_local.is_remote_authenticated());
    }

    #[tokio::test]
    async fn test_currency_mismatch_and_denied_key() {
        let a = pair();
        let a_local = PubkeyLocalAuth::new("g1", a.clone(), Arc::new(AcceptAll));
        let connect = unwrap_connect(a_local.connect_message());

        let mut other_currency = PubkeyRemoteAuth::new("g1-test", pair(), Arc::new(AcceptAll));
        assert!(matches!(
            other_currency.register_connect(&connect).await,
            Err(AuthError::WrongCurrency { .. })
        ));

        let mut denying = PubkeyRemoteAuth::new("g1", pair(), Arc::new(DenyAll));
        assert_eq!(
            denying.register_connect(&connect).await,
            Err(AuthError::Rejected(a.pubkey().to_string()))
        );
    }

    #[test]
    fn test_ok_before_connect_fails() {
        let mut remote = PubkeyRemoteAuth::new("g1", pair(), Arc::new(AcceptAll));
        let ok = AuthOk { sig: "x".into() };
        assert_eq!(remote.register_ok(&ok), Err(AuthError::WrongOkSignature));
    }
}
