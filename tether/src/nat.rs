//! NAT rendezvous (hole punching).
//!
//! Three parties: two private peers and a public relay. Every message rides
//! in a `NatMessage` datagram whose payload starts with a [`NatMessageKind`]
//! byte:
//!
//! ```text
//! IntroductionRequest  internal addr, token           peer  -> relay
//! Introduction         is_host u8, internal addr,
//!                      external addr, token           relay -> both peers
//! Punch                is_external u8, token          peer  -> peer (x2)
//! ```
//!
//! The relay matches two requests carrying the same token and introduces the
//! senders to each other. A request waiting for its partner is refreshed by
//! repeats from the same sender and evicted after [`NAT_REQUEST_TIMEOUT`].

use crate::{Result, TetherError};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::net::SocketAddr;
use std::time::{Duration, Instant};
use tether_shared::wire::{WireReader, WireWriter};

/// Longest accepted token, in bytes.
pub const NAT_TOKEN_MAX: usize = 256;

/// Idle time after which an unmatched introduction request is dropped.
pub const NAT_REQUEST_TIMEOUT: Duration = Duration::from_secs(6);

/// How long a peer keeps accepting punches for a token.
const PUNCH_WAIT_TIMEOUT: Duration = Duration::from_secs(30);

#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NatMessageKind {
    IntroductionRequest = 0,
    Introduction = 1,
    Punch = 2,
}

impl NatMessageKind {
    fn from_u8(value: u8) -> Option<Self> {
        match value {
            0 => Some(Self::IntroductionRequest),
            1 => Some(Self::Introduction),
            2 => Some(Self::Punch),
            _ => None,
        }
    }
}

/// Which of the introduced endpoints answered.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NatAddressType {
    Internal,
    External,
}

fn check_token(token: &str) -> Result<()> {
    if token.len() > NAT_TOKEN_MAX {
        return Err(TetherError::PayloadTooLarge {
            size: token.len(),
            max: NAT_TOKEN_MAX,
        });
    }
    Ok(())
}

fn encode_request(internal: SocketAddr, token: &str) -> Vec<u8> {
    let mut buf = Vec::with_capacity(24 + token.len());
    let mut w = WireWriter::new(&mut buf);
    w.write_u8(NatMessageKind::IntroductionRequest as u8);
    w.write_addr(&internal);
    w.write_str(token);
    buf
}

fn encode_introduction(is_host: bool, internal: SocketAddr, external: SocketAddr, token: &str) -> Vec<u8> {
    let mut buf = Vec::with_capacity(48 + token.len());
    let mut w = WireWriter::new(&mut buf);
    w.write_u8(NatMessageKind::Introduction as u8);
    w.write_u8(is_host as u8);
    w.write_addr(&internal);
    w.write_addr(&external);
    w.write_str(token);
    buf
}

fn encode_punch(is_external: bool, token: &str) -> Vec<u8> {
    let mut buf = Vec::with_capacity(4 + token.len());
    let mut w = WireWriter::new(&mut buf);
    w.write_u8(NatMessageKind::Punch as u8);
    w.write_u8(is_external as u8);
    w.write_str(token);
    buf
}

#[derive(Debug, Clone)]
struct WaitPeer {
    internal: SocketAddr,
    external: SocketAddr,
    refreshed_at: Instant,
}

#[derive(Debug, Default)]
struct NatState {
    /// Relay side: unmatched requests by token.
    waiting: HashMap<String, WaitPeer>,
    /// Peer side: tokens we expect punches for.
    expecting: HashMap<String, Instant>,
}

/// Successful punch.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct NatSuccess {
    pub endpoint: SocketAddr,
    pub address_type: NatAddressType,
    pub token: String,
}

/// Result of processing one NAT message.
#[derive(Debug, Default)]
pub(crate) struct NatOutput {
    /// NAT payloads to send, each wrapped in a `NatMessage` datagram.
    pub sends: Vec<(SocketAddr, Vec<u8>)>,
    pub success: Option<NatSuccess>,
}

#[derive(Debug, Default)]
pub(crate) struct NatPunchModule {
    state: Mutex<NatState>,
}

impl NatPunchModule {
    pub fn new() -> Self {
        Self::default()
    }

    /// Payload asking `relay` to introduce us; remembers the token.
    pub fn introduction_request(&self, internal: SocketAddr, token: &str, now: Instant) -> Result<Vec<u8>> {
        check_token(token)?;
        self.state.lock().expecting.insert(token.to_string(), now);
        Ok(encode_request(internal, token))
    }

    /// Introductions for both sides of a match.
    pub fn introduce(
        host_internal: SocketAddr,
        host_external: SocketAddr,
        client_internal: SocketAddr,
        client_external: SocketAddr,
        token: &str,
    ) -> Result<Vec<(SocketAddr, Vec<u8>)>> {
        check_token(token)?;
        Ok(vec![
            (
                host_external,
                encode_introduction(true, client_internal, client_external, token),
            ),
            (
                client_external,
                encode_introduction(false, host_internal, host_external, token),
            ),
        ])
    }

    /// Handle a NAT payload received from `from`.
    pub fn process(&self, from: SocketAddr, payload: &[u8], now: Instant) -> NatOutput {
        let mut output = NatOutput::default();
        let mut r = WireReader::new(payload);
        let Some(kind) = r.read_u8().and_then(NatMessageKind::from_u8) else {
            trace_trace!(%from, "nat: unknown message");
            return output;
        };
        match kind {
            NatMessageKind::IntroductionRequest => {
                let (Some(internal), Some(token)) = (r.read_addr(), r.read_str(NAT_TOKEN_MAX)) else {
                    return output;
                };
                self.on_request(from, internal, token, now, &mut output);
            }
            NatMessageKind::Introduction => {
                let (Some(is_host), Some(internal), Some(external), Some(token)) = (
                    r.read_u8(),
                    r.read_addr(),
                    r.read_addr(),
                    r.read_str(NAT_TOKEN_MAX),
                ) else {
                    return output;
                };
                trace_debug!(%internal, %external, is_host, token, "nat: introduction");
                self.state.lock().expecting.insert(token.to_string(), now);
                output.sends.push((internal, encode_punch(false, token)));
                output.sends.push((external, encode_punch(true, token)));
            }
            NatMessageKind::Punch => {
                let (Some(is_external), Some(token)) = (r.read_u8(), r.read_str(NAT_TOKEN_MAX)) else {
                    return output;
                };
                if self.state.lock().expecting.remove(token).is_some() {
                    trace_info!(%from, token, "nat: punch succeeded");
                    output.success = Some(NatSuccess {
                        endpoint: from,
                        address_type: if is_external != 0 {
                            NatAddressType::External
                        } else {
                            NatAddressType::Internal
                        },
                        token: token.to_string(),
                    });
                }
            }
        }
        output
    }

    fn on_request(&self, external: SocketAddr, internal: SocketAddr, token: &str, now: Instant, output: &mut NatOutput) {
        let mut state = self.state.lock();
        let matched = match state.waiting.get_mut(token) {
            Some(wait) if now.saturating_duration_since(wait.refreshed_at) >= NAT_REQUEST_TIMEOUT => None,
            Some(wait) if wait.external == external => {
                wait.internal = internal;
                wait.refreshed_at = now;
                return;
            }
            Some(wait) => Some(wait.clone()),
            None => None,
        };
        match matched {
            Some(host) => {
                state.waiting.remove(token);
                drop(state);
                trace_debug!(host = %host.external, client = %external, token, "nat: matched");
                // Token length was checked by the reader.
                if let Ok(sends) = Self::introduce(host.internal, host.external, internal, external, token) {
                    output.sends.extend(sends);
                }
            }
            None => {
                state.waiting.insert(
                    token.to_string(),
                    WaitPeer {
                        internal,
                        external,
                        refreshed_at: now,
                    },
                );
            }
        }
    }

    /// Evict idle wait records and expired punch expectations.
    pub fn update(&self, now: Instant) {
        let mut state = self.state.lock();
        state
            .waiting
            .retain(|_, w| now.saturating_duration_since(w.refreshed_at) < NAT_REQUEST_TIMEOUT);
        state
            .expecting
            .retain(|_, at| now.saturating_duration_since(*at) < PUNCH_WAIT_TIMEOUT);
    }

    #[cfg(test)]
    pub fn waiting(&self) -> usize {
        self.state.lock().waiting.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn addr(s: &str) -> SocketAddr {
        s.parse().unwrap()
    }

    fn decode_introduction(payload: &[u8]) -> (bool, SocketAddr, SocketAddr, String) {
        let mut r = WireReader::new(payload);
        assert_eq!(r.read_u8(), Some(NatMessageKind::Introduction as u8));
        let is_host = r.read_u8().unwrap() != 0;
        let internal = r.read_addr().unwrap();
        let external = r.read_addr().unwrap();
        let token = r.read_str(NAT_TOKEN_MAX).unwrap().to_string();
        (is_host, internal, external, token)
    }

    #[test]
    fn test_relay_matches_two_requests() {
        let relay = NatPunchModule::new();
        let now = Instant::now();
        let (host_int, host_ext) = (addr("10.0.0.2:5000"), addr("1.1.1.1:40000"));
        let (client_int, client_ext) = (addr("192.168.0.7:6000"), addr("2.2.2.2:50000"));

        let first = relay.process(host_ext, &encode_request(host_int, "room"), now);
        assert!(first.sends.is_empty());
        assert_eq!(relay.waiting(), 1);

        let second = relay.process(client_ext, &encode_request(client_int, "room"), now);
        assert_eq!(second.sends.len(), 2);
        assert_eq!(relay.waiting(), 0);

        let (to_host, host_msg) = &second.sends[0];
        assert_eq!(*to_host, host_ext);
        assert_eq!(
            decode_introduction(host_msg),
            (true, client_int, client_ext, "room".to_string())
        );
        let (to_client, client_msg) = &second.sends[1];
        assert_eq!(*to_client, client_ext);
        assert_eq!(
            decode_introduction(client_msg),
            (false, host_int, host_ext, "room".to_string())
        );

        // a third request after the match starts a fresh wait record
        let third = relay.process(addr("3.3.3.3:1000"), &encode_request(addr("10.1.1.1:1"), "room"), now);
        assert!(third.sends.is_empty());
        assert_eq!(relay.waiting(), 1);
    }

    #[test]
    fn test_repeat_request_refreshes() {
        let relay = NatPunchModule::new();
        let now = Instant::now();
        let ext = addr("1.1.1.1:40000");
        relay.process(ext, &encode_request(addr("10.0.0.2:5000"), "t"), now);
        let later = now + Duration::from_secs(5);
        let out = relay.process(ext, &encode_request(addr("10.0.0.2:5000"), "t"), later);
        assert!(out.sends.is_empty());

        // refreshed at +5s, still alive at +10s
        relay.update(now + Duration::from_secs(10));
        assert_eq!(relay.waiting(), 1);
        relay.update(now + Duration::from_secs(12));
        assert_eq!(relay.waiting(), 0);
    }

    #[test]
    fn test_expired_request_not_matched() {
        let relay = NatPunchModule::new();
        let now = Instant::now();
        relay.process(addr("1.1.1.1:1"), &encode_request(addr("10.0.0.1:1"), "t"), now);
        let out = relay.process(
            addr("2.2.2.2:2"),
            &encode_request(addr("10.0.0.2:2"), "t"),
            now + NAT_REQUEST_TIMEOUT,
        );
        assert!(out.sends.is_empty());
        assert_eq!(relay.waiting(), 1);
    }

    #[test]
    fn test_introduction_triggers_punches_and_single_success() {
        let peer = NatPunchModule::new();
        let now = Instant::now();
        let (int, ext) = (addr("10.0.0.9:7000"), addr("9.9.9.9:7000"));
        let out = peer.process(
            addr("5.5.5.5:3478"),
            &encode_introduction(false, int, ext, "tok"),
            now,
        );
        assert_eq!(out.sends.len(), 2);
        assert_eq!(out.sends[0].0, int);
        assert_eq!(out.sends[1].0, ext);

        let first = peer.process(ext, &encode_punch(true, "tok"), now);
        assert_eq!(
            first.success,
            Some(NatSuccess {
                endpoint: ext,
                address_type: NatAddressType::External,
                token: "tok".to_string()
            })
        );
        let second = peer.process(int, &encode_punch(false, "tok"), now);
        assert!(second.success.is_none());
    }

    #[test]
    fn test_punch_before_introduction_accepted_for_requested_token() {
        let peer = NatPunchModule::new();
        let now = Instant::now();
        peer.introduction_request(addr("10.0.0.1:1"), "early", now).unwrap();
        let out = peer.process(addr("8.8.8.8:8"), &encode_punch(false, "early"), now);
        assert!(out.success.is_some());
    }

    #[test]
    fn test_unknown_punch_ignored() {
        let peer = NatPunchModule::new();
        let out = peer.process(addr("8.8.8.8:8"), &encode_punch(true, "nope"), Instant::now());
        assert!(out.success.is_none());
    }

    #[test]
    fn test_token_too_long() {
        let peer = NatPunchModule::new();
        let token = "x".repeat(NAT_TOKEN_MAX + 1);
        assert!(peer
            .introduction_request(addr("10.0.0.1:1"), &token, Instant::now())
            .is_err());
    }
}
