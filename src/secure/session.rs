//! Authenticated session establishment and sealed messaging
//!
//! The handshake is symmetric; both peers run the same four steps:
//!
//! 1. Send own public key as an unsealed framed message. Its nonce seeds
//!    the peer's inbound counter.
//! 2. Receive the peer's public key, verify it against the allow-list, and
//!    precompute the shared key.
//! 3. Trade fresh session tokens inside the sealed channel.
//! 4. Echo the peer's token back and verify the peer echoed ours. A
//!    replayed transcript carries stale tokens and dies here.
//!
//! After the handshake every frame in each direction advances that
//! direction's nonce by exactly one; any duplicate, skipped, or reordered
//! nonce terminates the session.

use super::{
    EntropySource, KeyPair, Nonce, PublicKey, SecureError, SecureStream, SystemEntropy, KEY_LEN,
    NONCE_LEN, TOKEN_LEN,
};
use crate::framing::FramedIo;
use bytes::Bytes;
use crypto_box::aead::Aead;
use crypto_box::SalsaBox;
use std::sync::Arc;
use tokio::io::{AsyncRead, AsyncWrite};
use tracing::debug;

/// Session parameters: who we are and who we will talk to.
pub struct SessionConfig {
    pub keypair: KeyPair,
    /// Peer public keys acceptable for this session.
    pub allowed: Vec<PublicKey>,
    pub entropy: Arc<dyn EntropySource>,
}

impl SessionConfig {
    pub fn new(keypair: KeyPair, allowed: Vec<PublicKey>) -> Self {
        Self {
            keypair,
            allowed,
            entropy: Arc::new(SystemEntropy),
        }
    }

    pub fn with_entropy(mut self, entropy: Arc<dyn EntropySource>) -> Self {
        self.entropy = entropy;
        self
    }
}

/// Shared-key cipher state plus the two directional nonce counters.
///
/// Used by [`Session`] for whole-message I/O and moved into
/// [`SecureStream`] when the session is adapted to a byte stream.
pub(crate) struct SessionCrypto {
    shared: SalsaBox,
    tx_nonce: Option<Nonce>,
    rx_nonce: Option<Nonce>,
    entropy: Arc<dyn EntropySource>,
}

impl SessionCrypto {
    fn next_tx(&mut self) -> Nonce {
        let next = match self.tx_nonce {
            Some(n) => n.next(),
            None => Nonce::generate(&*self.entropy),
        };
        self.tx_nonce = Some(next);
        next
    }

    fn accept_rx(&mut self, raw: [u8; NONCE_LEN]) -> Result<Nonce, SecureError> {
        let got = Nonce::from_bytes(raw);
        let expected = match self.rx_nonce {
            Some(n) => n.next(),
            // First inbound frame: adopt whatever the peer seeded.
            None => got,
        };
        if got != expected {
            return Err(SecureError::ReplayOrTampered);
        }
        self.rx_nonce = Some(expected);
        Ok(expected)
    }

    /// Seal `plaintext` under the next outbound nonce.
    pub(crate) fn seal(&mut self, plaintext: &[u8]) -> Result<(Nonce, Vec<u8>), SecureError> {
        let nonce = self.next_tx();
        let ciphertext = self
            .shared
            .encrypt(crypto_box::Nonce::from_slice(nonce.as_bytes()), plaintext)
            .map_err(|_| SecureError::CryptoIntegrity)?;
        Ok((nonce, ciphertext))
    }

    /// Verify the inbound nonce progression, then open the ciphertext.
    pub(crate) fn open(
        &mut self,
        raw_nonce: [u8; NONCE_LEN],
        ciphertext: &[u8],
    ) -> Result<Vec<u8>, SecureError> {
        let nonce = self.accept_rx(raw_nonce)?;
        self.shared
            .decrypt(crypto_box::Nonce::from_slice(nonce.as_bytes()), ciphertext)
            .map_err(|_| SecureError::CryptoIntegrity)
    }
}

/// A mutually authenticated, replay-resistant message channel.
///
/// Each [`write`](Session::write) produces exactly one sealed frame on the
/// wire; [`read`](Session::read) yields whole plaintext messages. For a
/// byte-stream view, see [`Session::into_stream`].
pub struct Session<T> {
    framed: FramedIo<T>,
    crypto: SessionCrypto,
    peer_public: PublicKey,
}

impl<T: AsyncRead + AsyncWrite + Unpin> Session<T> {
    /// Establish a session over `io`.
    ///
    /// Fails with [`SecureError::AuthRejected`] when the peer key is not in
    /// the allow-list and [`SecureError::ReplayOrTampered`] when the token
    /// exchange does not check out.
    pub async fn handshake(io: T, config: &SessionConfig) -> Result<Self, SecureError> {
        let mut framed = FramedIo::new(io);
        let entropy = config.entropy.clone();

        // Our public key travels unsealed; its nonce seeds our counter.
        let first_nonce = Nonce::generate(&*entropy);
        framed
            .write_message(first_nonce.as_bytes(), config.keypair.public.as_bytes())
            .await?;

        let (raw_nonce, data) = framed.read_message().await?;
        if data.len() != KEY_LEN {
            return Err(SecureError::ProtocolViolation("bad public key frame"));
        }
        let peer_public = PublicKey::from_bytes(&data)?;
        if !config.allowed.iter().any(|k| k == &peer_public) {
            return Err(SecureError::AuthRejected(peer_public.to_base64()));
        }

        let shared = SalsaBox::new(&peer_public.to_box(), &config.keypair.private.to_box());
        let mut crypto = SessionCrypto {
            shared,
            tx_nonce: Some(first_nonce),
            rx_nonce: Some(Nonce::from_bytes(raw_nonce)),
            entropy,
        };

        // Token dance: possession of the private key is not liveness. Each
        // side must echo the other's fresh token inside the sealed channel.
        let mut token = [0u8; TOKEN_LEN];
        crypto.entropy.fill(&mut token);

        let (nonce, sealed) = crypto.seal(&token)?;
        framed.write_message(nonce.as_bytes(), &sealed).await?;

        let (raw_nonce, sealed) = framed.read_message().await?;
        let peer_token = crypto.open(raw_nonce, &sealed)?;

        let (nonce, sealed) = crypto.seal(&peer_token)?;
        framed.write_message(nonce.as_bytes(), &sealed).await?;

        let (raw_nonce, sealed) = framed.read_message().await?;
        let echoed = crypto.open(raw_nonce, &sealed)?;
        if echoed != token {
            return Err(SecureError::ReplayOrTampered);
        }

        debug!(peer = %peer_public, "secure session established");
        Ok(Self {
            framed,
            crypto,
            peer_public,
        })
    }

    /// The authenticated peer's public key.
    pub fn peer_public(&self) -> &PublicKey {
        &self.peer_public
    }

    /// Read and open the next sealed message.
    pub async fn read(&mut self) -> Result<Bytes, SecureError> {
        let (raw_nonce, sealed) = self.framed.read_message().await?;
        Ok(Bytes::from(self.crypto.open(raw_nonce, &sealed)?))
    }

    /// Seal `data` as a single message and write it.
    pub async fn write(&mut self, data: &[u8]) -> Result<(), SecureError> {
        let (nonce, sealed) = self.crypto.seal(data)?;
        self.framed.write_message(nonce.as_bytes(), &sealed).await?;
        Ok(())
    }

    /// Adapt the session into a reliable byte stream, e.g. to layer a
    /// multiplexer on top.
    pub fn into_stream(self) -> SecureStream<T> {
        SecureStream::new(self.framed.into_inner(), self.crypto)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::secure::SystemEntropy;

    fn crypto_pair() -> (SessionCrypto, SessionCrypto) {
        let a = KeyPair::generate(&SystemEntropy);
        let b = KeyPair::generate(&SystemEntropy);
        let entropy: Arc<dyn EntropySource> = Arc::new(SystemEntropy);
        let ab = SessionCrypto {
            shared: SalsaBox::new(&b.public.to_box(), &a.private.to_box()),
            tx_nonce: None,
            rx_nonce: None,
            entropy: entropy.clone(),
        };
        let ba = SessionCrypto {
            shared: SalsaBox::new(&a.public.to_box(), &b.private.to_box()),
            tx_nonce: None,
            rx_nonce: None,
            entropy,
        };
        (ab, ba)
    }

    #[test]
    fn test_seal_open_roundtrip() {
        let (mut tx, mut rx) = crypto_pair();
        let (nonce, sealed) = tx.seal(b"first").unwrap();
        assert_eq!(rx.open(*nonce.as_bytes(), &sealed).unwrap(), b"first");
        let (nonce, sealed) = tx.seal(b"second").unwrap();
        assert_eq!(rx.open(*nonce.as_bytes(), &sealed).unwrap(), b"second");
    }

    #[test]
    fn test_skipped_nonce_rejected() {
        let (mut tx, mut rx) = crypto_pair();
        let (nonce, sealed) = tx.seal(b"first").unwrap();
        rx.open(*nonce.as_bytes(), &sealed).unwrap();
        // Drop one frame.
        let _ = tx.seal(b"second").unwrap();
        let (nonce, sealed) = tx.seal(b"third").unwrap();
        assert!(matches!(
            rx.open(*nonce.as_bytes(), &sealed),
            Err(SecureError::ReplayOrTampered)
        ));
    }

    #[test]
    fn test_duplicate_nonce_rejected() {
        let (mut tx, mut rx) = crypto_pair();
        let (nonce, sealed) = tx.seal(b"first").unwrap();
        rx.open(*nonce.as_bytes(), &sealed).unwrap();
        assert!(matches!(
            rx.open(*nonce.as_bytes(), &sealed),
            Err(SecureError::ReplayOrTampered)
        ));
    }

    #[test]
    fn test_tampered_ciphertext_rejected() {
        let (mut tx, mut rx) = crypto_pair();
        let (nonce, mut sealed) = tx.seal(b"first").unwrap();
        sealed[0] ^= 0xff;
        assert!(matches!(
            rx.open(*nonce.as_bytes(), &sealed),
            Err(SecureError::CryptoIntegrity)
        ));
    }

    #[tokio::test]
    async fn test_handshake_and_exchange() {
        let (a, b) = tokio::io::duplex(4096);
        let server_keys = KeyPair::generate(&SystemEntropy);
        let client_keys = KeyPair::generate(&SystemEntropy);

        let server_config =
            SessionConfig::new(server_keys.clone(), vec![client_keys.public.clone()]);
        let client_config =
            SessionConfig::new(client_keys.clone(), vec![server_keys.public.clone()]);

        let server = tokio::spawn(async move {
            let mut session = Session::handshake(a, &server_config).await.unwrap();
            let msg = session.read().await.unwrap();
            session.write(b"pong").await.unwrap();
            msg
        });

        let mut session = Session::handshake(b, &client_config).await.unwrap();
        assert_eq!(session.peer_public(), &server_keys.public);
        session.write(b"ping").await.unwrap();
        let reply = session.read().await.unwrap();

        assert_eq!(&server.await.unwrap()[..], b"ping");
        assert_eq!(&reply[..], b"pong");
    }

    #[tokio::test]
    async fn test_handshake_rejects_unknown_peer() {
        let (a, b) = tokio::io::duplex(4096);
        let server_keys = KeyPair::generate(&SystemEntropy);
        let client_keys = KeyPair::generate(&SystemEntropy);
        let stranger = KeyPair::generate(&SystemEntropy);

        // Server only trusts a key the client does not hold.
        let server_config = SessionConfig::new(server_keys.clone(), vec![stranger.public]);
        let client_config = SessionConfig::new(client_keys, vec![server_keys.public]);

        let server = tokio::spawn(async move { Session::handshake(a, &server_config).await });
        let _ = Session::handshake(b, &client_config).await;

        assert!(matches!(
            server.await.unwrap(),
            Err(SecureError::AuthRejected(_))
        ));
    }
}
