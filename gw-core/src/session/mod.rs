//! Per-device authentication state machine.
//!
//! Drives the crypto core and packet codec through the handshake described
//! by the session invariants: keygen, public-key exchange, session-key
//! request, auth-status challenge, challenge-response, and the
//! authenticated steady state with keepalive.

use std::time::Duration;

use md5::{Digest, Md5};

use crate::codec::{InnerPacket, PacketVersion};
use crate::crypto::{CryptoError, KeyPair, SharedSecret};
use crate::devices::DeviceVariant;

/// Authentication and connection states, matching the invariants exactly.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Disconnected,
    Connecting,
    ServiceDiscovery,
    Subscribed,
    PublicKeyExchange,
    RequestingSessionKey,
    RequestingAuthStatus,
    Authenticating,
    Authenticated,
}

/// Why a session transitioned back to [`SessionState::Disconnected`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DisconnectReason {
    LinkLoss,
    Timeout,
    MaxRetries,
    AuthenticationDenied,
    Requested,
}

#[derive(Debug, thiserror::Error)]
pub enum SessionError {
    #[error(transparent)]
    Crypto(#[from] CryptoError),

    #[error("operation requires state {expected:?}, session is in {actual:?}")]
    WrongState { expected: SessionState, actual: SessionState },

    #[error("no state progression for more than {0:?}")]
    Timeout(Duration),

    #[error("device denied authentication")]
    AuthenticationDenied,
}

/// Pre-authentication state progression timeout, applied uniformly to every
/// state before `Authenticated`.
pub const AUTH_TIMEOUT: Duration = Duration::from_secs(10);

/// Cadence at which an authenticated session sends a keepalive.
pub const KEEPALIVE_INTERVAL: Duration = Duration::from_secs(5);

/// Inner-packet command-set/id used for the V2/V3-sensitive handshake
/// packets.
const CMD_SET_AUTH: u8 = 0x35;
const CMD_ID_AUTHENTICATING: u8 = 0x86;
const CMD_ID_REQUEST_AUTH_STATUS: u8 = 0x89;

/// AC setter command-id range that must never be echoed back by the reply
/// policy (V2 only); echoing creates a device-side interpretation loop.
const AC_SETTER_RANGE: std::ops::RangeInclusive<u8> = 0x51..=0x5E;

/// Drives one device's handshake and steady-state traffic.
pub struct SessionStateMachine {
    variant: DeviceVariant,
    version: PacketVersion,
    state: SessionState,
    product_id: u8,
    sequence: u32,
    keypair: Option<KeyPair>,
    shared_secret: Option<SharedSecret>,
    session_key: Option<[u8; 16]>,
}

impl SessionStateMachine {
    pub fn new(variant: DeviceVariant, version: PacketVersion, product_id: u8) -> Self {
        SessionStateMachine {
            variant,
            version,
            state: SessionState::Disconnected,
            product_id,
            sequence: 1,
            keypair: None,
            shared_secret: None,
            session_key: None,
        }
    }

    pub fn state(&self) -> SessionState {
        self.state
    }

    pub fn session_key(&self) -> Option<&[u8; 16]> {
        self.session_key.as_ref()
    }

    /// The handshake-derived IV, which stays in force for every
    /// post-authentication AES-CBC call even though the session key
    /// supersedes `k_shared` for the key itself — the IV is never
    /// re-derived or chained across messages.
    pub fn aes_iv(&self) -> Option<[u8; 16]> {
        self.shared_secret.as_ref().map(|secret| secret.aes_iv())
    }

    fn require(&self, expected: SessionState) -> Result<(), SessionError> {
        if self.state == expected {
            Ok(())
        } else {
            Err(SessionError::WrongState { expected, actual: self.state })
        }
    }

    /// Resets all key material and the sequence counter; called at every
    /// authentication attempt.
    fn reset_key_material(&mut self) {
        self.sequence = 1;
        self.keypair = None;
        self.shared_secret = None;
        self.session_key = None;
    }

    pub fn on_connect_requested(&mut self) -> Result<(), SessionError> {
        self.require(SessionState::Disconnected)?;
        self.reset_key_material();
        self.state = SessionState::Connecting;
        Ok(())
    }

    pub fn on_link_established(&mut self) -> Result<(), SessionError> {
        self.require(SessionState::Connecting)?;
        self.state = SessionState::ServiceDiscovery;
        Ok(())
    }

    pub fn on_services_discovered(&mut self) -> Result<(), SessionError> {
        self.require(SessionState::ServiceDiscovery)?;
        self.state = SessionState::Subscribed;
        Ok(())
    }

    /// Generates the local key pair and returns the public key to send.
    pub fn begin_public_key_exchange<R: rand_core::RngCore + rand_core::CryptoRng>(
        &mut self,
        rng: &mut R,
    ) -> Result<[u8; 40], SessionError> {
        self.require(SessionState::Subscribed)?;
        let keypair = KeyPair::generate(rng);
        let public_key = keypair.public_key();
        self.keypair = Some(keypair);
        self.state = SessionState::PublicKeyExchange;
        Ok(public_key)
    }

    /// Consumes the peer's public key, computes the shared secret, and
    /// advances to requesting the session-key material.
    pub fn on_peer_public_key(&mut self, peer_public: &[u8; 40]) -> Result<(), SessionError> {
        self.require(SessionState::PublicKeyExchange)?;
        let keypair = self.keypair.as_ref().expect("keypair generated in Subscribed->PublicKeyExchange");
        let shared = keypair.shared_secret(peer_public)?;
        self.shared_secret = Some(shared);
        self.state = SessionState::RequestingSessionKey;
        Ok(())
    }

    /// Consumes the device-provided seed and random nonce, derives the
    /// session key from the key table, and advances to requesting
    /// auth-status.
    pub fn on_session_key_material(&mut self, key_table: &[u8], seed: [u8; 2], srand: &[u8; 16]) -> Result<(), SessionError> {
        self.require(SessionState::RequestingSessionKey)?;
        let key = crate::crypto::derive_session_key(key_table, seed, srand)?;
        self.session_key = Some(key);
        self.state = SessionState::RequestingAuthStatus;
        Ok(())
    }

    /// Builds the `RequestAuthStatus` inner packet (`0x35`/`0x89`),
    /// observing the V2/V3 sequence quirk: V2 uses the incrementing
    /// sequence and version byte 2; V3 uses sequence 0 and version byte 3.
    pub fn build_request_auth_status(&mut self) -> Result<InnerPacket, SessionError> {
        self.require(SessionState::RequestingAuthStatus)?;
        Ok(self.build_handshake_packet(CMD_ID_REQUEST_AUTH_STATUS, Vec::new()))
    }

    /// Moves from `RequestingAuthStatus` to `Authenticating` once the
    /// device's challenge arrives, and builds the response packet
    /// containing `MD5(userId ‖ deviceSn)` as a hex string.
    pub fn on_auth_challenge(&mut self, user_id: &str, device_sn: &str) -> Result<InnerPacket, SessionError> {
        self.require(SessionState::RequestingAuthStatus)?;
        self.state = SessionState::Authenticating;

        let mut hasher = Md5::new();
        hasher.update(user_id.as_bytes());
        hasher.update(device_sn.as_bytes());
        let digest: [u8; 16] = hasher.finalize().into();
        let hex_digest = digest.iter().map(|b| format!("{:02x}", b)).collect::<String>();

        Ok(self.build_handshake_packet(CMD_ID_AUTHENTICATING, hex_digest.into_bytes()))
    }

    fn build_handshake_packet(&mut self, command_id: u8, payload: Vec<u8>) -> InnerPacket {
        let (version, sequence) = match self.version {
            PacketVersion::V2 => (PacketVersion::V2, self.next_sequence()),
            PacketVersion::V3 => (PacketVersion::V3, 0),
        };
        InnerPacket {
            version,
            product_id: self.product_id,
            sequence,
            source: self.variant.source(),
            destination: self.variant.destination(),
            check_type: if version == PacketVersion::V3 { Some(0) } else { None },
            encrypted: if version == PacketVersion::V3 { Some(1) } else { None },
            command_set: CMD_SET_AUTH,
            command_id,
            payload,
        }
    }

    pub fn on_auth_result(&mut self, success: bool) -> Result<(), SessionError> {
        self.require(SessionState::Authenticating)?;
        if success {
            self.state = SessionState::Authenticated;
            Ok(())
        } else {
            self.state = SessionState::Disconnected;
            Err(SessionError::AuthenticationDenied)
        }
    }

    /// Allocates the next sequence number for an authenticated outbound
    /// command. Returns `None` if the session isn't authenticated.
    pub fn next_outbound_sequence(&mut self) -> Option<u32> {
        if self.state == SessionState::Authenticated {
            Some(self.next_sequence())
        } else {
            None
        }
    }

    fn next_sequence(&mut self) -> u32 {
        let seq = self.sequence;
        self.sequence = self.sequence.wrapping_add(1);
        seq
    }

    pub fn on_disconnected(&mut self, _reason: DisconnectReason) {
        self.reset_key_material();
        self.state = SessionState::Disconnected;
    }

    /// Whether a received, authenticated packet destined for us should be
    /// echoed back per the reply policy. V2 AC setters (`0x51..=0x5E`) are
    /// the mandatory exception: echoing them creates a device-side
    /// interpretation loop.
    pub fn should_echo(&self, packet: &InnerPacket) -> bool {
        if self.state != SessionState::Authenticated {
            return false;
        }
        if packet.destination != self.variant.source() {
            return false;
        }
        if self.version == PacketVersion::V2 && AC_SETTER_RANGE.contains(&packet.command_id) {
            return false;
        }
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::rngs::OsRng;

    fn make_machine() -> SessionStateMachine {
        SessionStateMachine::new(DeviceVariant::Battery, PacketVersion::V3, 0x01)
    }

    #[test]
    fn happy_path_reaches_authenticated() {
        let mut local = make_machine();
        let mut peer = KeyPair::generate(&mut OsRng);

        local.on_connect_requested().unwrap();
        local.on_link_established().unwrap();
        local.on_services_discovered().unwrap();
        let local_pub = local.begin_public_key_exchange(&mut OsRng).unwrap();

        let peer_shared = peer.shared_secret(&local_pub).unwrap();
        local.on_peer_public_key(&peer.public_key()).unwrap();

        let mut key_table = vec![0u8; 4096];
        key_table[0..16].copy_from_slice(&[0xAB; 16]);
        let srand = [0x5A; 16];
        local.on_session_key_material(&key_table, [0, 1], &srand).unwrap();

        let expected_key = crate::crypto::derive_session_key(&key_table, [0, 1], &srand).unwrap();
        assert_eq!(local.session_key(), Some(&expected_key));
        let _ = peer_shared; // peer-side derivation isn't under test here

        local.build_request_auth_status().unwrap();
        local.on_auth_challenge("user-1", "SN00001").unwrap();
        assert_eq!(local.state(), SessionState::Authenticating);
        local.on_auth_result(true).unwrap();
        assert_eq!(local.state(), SessionState::Authenticated);
    }

    #[test]
    fn v2_and_v3_handshake_packets_differ_in_version_and_sequence() {
        let mut v2 = SessionStateMachine::new(DeviceVariant::Battery, PacketVersion::V2, 0x01);
        let mut v3 = SessionStateMachine::new(DeviceVariant::Battery, PacketVersion::V3, 0x01);
        for m in [&mut v2, &mut v3] {
            m.on_connect_requested().unwrap();
            m.on_link_established().unwrap();
            m.on_services_discovered().unwrap();
            m.begin_public_key_exchange(&mut OsRng).unwrap();
            let peer = KeyPair::generate(&mut OsRng);
            m.on_peer_public_key(&peer.public_key()).unwrap();
            m.on_session_key_material(&vec![0u8; 4096], [0, 1], &[0u8; 16]).unwrap();
        }

        let v2_packet = v2.build_request_auth_status().unwrap();
        let v3_packet = v3.build_request_auth_status().unwrap();
        assert_eq!(v2_packet.version, PacketVersion::V2);
        assert_eq!(v3_packet.version, PacketVersion::V3);
        assert_eq!(v3_packet.sequence, 0);
        assert_eq!(v2_packet.sequence, 1);
    }

    #[test]
    fn reply_policy_echoes_authenticated_traffic_except_ac_setters() {
        let mut machine = SessionStateMachine::new(DeviceVariant::AirConditioner, PacketVersion::V2, 0x01);
        machine.on_connect_requested().unwrap();
        machine.on_link_established().unwrap();
        machine.on_services_discovered().unwrap();
        machine.begin_public_key_exchange(&mut OsRng).unwrap();
        let peer = KeyPair::generate(&mut OsRng);
        machine.on_peer_public_key(&peer.public_key()).unwrap();
        machine.on_session_key_material(&vec![0u8; 4096], [0, 1], &[0u8; 16]).unwrap();
        machine.build_request_auth_status().unwrap();
        machine.on_auth_challenge("u", "sn").unwrap();
        machine.on_auth_result(true).unwrap();

        let normal = InnerPacket {
            version: PacketVersion::V2,
            product_id: 1,
            sequence: 1,
            source: 0,
            destination: machine_source(&machine),
            check_type: None,
            encrypted: None,
            command_set: 0xFE,
            command_id: 0x15,
            payload: vec![],
        };
        assert!(machine.should_echo(&normal));

        let ac_setter = InnerPacket { command_id: 0x52, ..normal.clone() };
        assert!(!machine.should_echo(&ac_setter));
    }

    fn machine_source(machine: &SessionStateMachine) -> u8 {
        machine.variant.source()
    }

    #[test]
    fn disconnect_resets_sequence_and_key_material() {
        let mut machine = make_machine();
        machine.on_connect_requested().unwrap();
        machine.on_link_established().unwrap();
        machine.on_services_discovered().unwrap();
        machine.begin_public_key_exchange(&mut OsRng).unwrap();
        machine.on_disconnected(DisconnectReason::LinkLoss);
        assert_eq!(machine.state(), SessionState::Disconnected);
        assert!(machine.session_key().is_none());
    }
}
