// SPDX-License-Identifier: Apache-2.0
// Copyright 2024-2026 GridMesh Systems

//! End-to-end exchanges between a coordinator and device-side clients,
//! driven purely through the effect lists both FSMs return.

use gm_boot::client::{self, BootClient, ClientState, NoPersistence, PersistedAttributes, RestoredNetwork};
use gm_boot::codec::{
    ConfigParam, EapBody, EapFrame, Envelope, EnvelopeCode, EnvelopePayload, ParamResult,
    ATTR_GMK_ACTIVATION,
};
use gm_boot::pansort::{PanCandidate, PanSortConfig};
use gm_boot::rekey::RekeyError;
use gm_boot::server::{self, BootServer, ServerState};
use gm_common::config::{AccessMode, BootClientConfig, BootServerConfig};
use gm_common::time::{Millis, Ticks};
use gm_common::{Error, ExtendedAddress, MediaType, PanId, ShortAddress};
use gm_crypto::{Aes128Key, CryptoError, CryptoRng};

const PAN: PanId = PanId::new(0x7812);

// Deterministic xorshift64 generator for reproducible handshakes
struct TestRng(u64);

impl CryptoRng for TestRng {
    fn fill_bytes(&mut self, dest: &mut [u8]) -> Result<(), CryptoError> {
        for byte in dest.iter_mut() {
            self.0 ^= self.0 << 13;
            self.0 ^= self.0 >> 7;
            self.0 ^= self.0 << 17;
            *byte = self.0 as u8;
        }
        Ok(())
    }
}

fn device_addr(n: u8) -> ExtendedAddress {
    ExtendedAddress::new([0x02, 0, 0, 0, 0, 0, 0, n])
}

fn coordinator_addr() -> ExtendedAddress {
    ExtendedAddress::new([0x02, 0xC0, 0, 0, 0, 0, 0, 0])
}

fn new_server_with(mode: AccessMode) -> BootServer {
    let mut config = BootServerConfig::DEFAULT;
    config.access_mode = mode;
    BootServer::new(config, coordinator_addr(), PAN, Aes128Key::new([0xD1; 16]))
}

fn new_server() -> BootServer {
    new_server_with(AccessMode::AllowList)
}

fn new_client(n: u8) -> BootClient {
    BootClient::new(
        BootClientConfig::DEFAULT,
        PanSortConfig::DEFAULT,
        device_addr(n),
    )
}

fn start_server(server: &mut BootServer) {
    let effects = server.start(Ticks::ZERO).unwrap();
    assert!(matches!(effects[0], server::Effect::StartNetwork(p) if p == PAN));
    server.network_start_confirm(true, Ticks::ZERO).unwrap();
    assert_eq!(server.state(), ServerState::Active);
}

fn good_candidate() -> PanCandidate {
    PanCandidate {
        pan_id: PAN,
        relay: ShortAddress::COORDINATOR,
        link_quality: 200,
        route_cost: 1,
        media: MediaType::Powerline,
    }
}

fn server_sends(effects: &server::Effects) -> Vec<Envelope> {
    effects
        .iter()
        .filter_map(|e| match e {
            server::Effect::Send(env) => Some(env.clone()),
            _ => None,
        })
        .collect()
}

fn client_sends(effects: &client::Effects) -> Vec<Envelope> {
    effects
        .iter()
        .filter_map(|e| match e {
            client::Effect::Send(env) => Some(env.clone()),
            _ => None,
        })
        .collect()
}

/// Drive a client from power-on until it has a join request on the wire
fn client_to_join_request<P: PersistedAttributes>(
    client: &mut BootClient,
    rng: &mut TestRng,
    persisted: &mut P,
) -> Envelope {
    let now = Ticks::ZERO;
    client.start(now, rng, persisted).unwrap();
    client.timer_fired(now).unwrap();
    let effects = client.discovery_complete(&[good_candidate()], now).unwrap();
    assert!(matches!(effects[0], client::Effect::RequestPanSort(_)));
    let effects = client.pan_sort_response(None, now).unwrap();
    let sends = client_sends(&effects);
    assert_eq!(sends.len(), 1);
    sends[0].clone()
}

/// Ping-pong envelopes until neither side has anything left to transmit
fn pump(
    server: &mut BootServer,
    client: &mut BootClient,
    first: Envelope,
    rng: &mut TestRng,
    persisted: &mut NoPersistence,
) -> (Vec<server::Effect>, Vec<client::Effect>) {
    let now = Ticks::new(10);
    let mut to_server = vec![first];
    let mut to_client: Vec<Envelope> = Vec::new();
    let mut server_out = Vec::new();
    let mut client_out = Vec::new();

    for _ in 0..16 {
        for env in to_server.drain(..) {
            let effects = server
                .on_envelope(&env, MediaType::Powerline, now, rng)
                .unwrap();
            let sends = server_sends(&effects);
            server_out.extend(effects.iter().cloned());
            // The MAC layer reports every success frame as transmitted
            for send in &sends {
                if send.code == EnvelopeCode::Accepted {
                    let confirmed = server.send_confirm(&send.target, true, now).unwrap();
                    server_out.extend(confirmed.iter().cloned());
                }
            }
            to_client.extend(sends);
        }
        if to_client.is_empty() {
            break;
        }
        for env in to_client.drain(..) {
            let effects = client.on_envelope(&env, now, rng, persisted).unwrap();
            to_server.extend(client_sends(&effects));
            client_out.extend(effects.iter().cloned());
        }
        if to_server.is_empty() && to_client.is_empty() {
            break;
        }
    }
    (server_out, client_out)
}

/// Full admission of device `n` against a server with its PSK provisioned
fn admit(server: &mut BootServer, n: u8, rng: &mut TestRng) -> (BootClient, ShortAddress) {
    server
        .access_mut()
        .provision(gm_boot::AccessEntry {
            ext_addr: device_addr(n),
            psk: Aes128Key::new(BootClientConfig::DEFAULT.psk),
            short_addr: None,
        })
        .unwrap();

    let mut client = new_client(n);
    let mut persisted = NoPersistence;
    let join = client_to_join_request(&mut client, rng, &mut persisted);
    let (server_out, client_out) = pump(server, &mut client, join, rng, &mut persisted);

    let short = server_out
        .iter()
        .find_map(|e| match e {
            server::Effect::NotifyJoin { ext_addr, short_addr } if *ext_addr == device_addr(n) => {
                Some(*short_addr)
            }
            _ => None,
        })
        .expect("device admitted");
    assert!(client_out
        .iter()
        .any(|e| matches!(e, client::Effect::JoinComplete { short_addr, .. } if *short_addr == short)));
    assert_eq!(client.state(), ClientState::Connected);
    assert_eq!(client.short_addr(), short);
    (client, short)
}

mod admission {
    use super::*;

    #[test]
    fn provisioned_device_joins_end_to_end() {
        let mut server = new_server();
        start_server(&mut server);
        let mut rng = TestRng(0x1234_5678);

        let (client, short) = admit(&mut server, 1, &mut rng);
        assert!(short.is_assigned());
        assert_ne!(short, ShortAddress::COORDINATOR);
        assert_eq!(client.stats().joins_completed, 1);
        assert_eq!(server.stats().joins_completed, 1);
        assert_eq!(server.stats().silent_discards, 0);
    }

    #[test]
    fn two_devices_get_distinct_addresses() {
        let mut server = new_server();
        start_server(&mut server);
        let mut rng = TestRng(0xAB);

        let (_, short1) = admit(&mut server, 1, &mut rng);
        let (_, short2) = admit(&mut server, 2, &mut rng);
        assert_ne!(short1, short2);
    }

    #[test]
    fn allowlist_refuses_unprovisioned_device() {
        let mut config = BootServerConfig::DEFAULT;
        config.access_mode = AccessMode::AllowList;
        let mut server = BootServer::new(config, coordinator_addr(), PAN, Aes128Key::new([1; 16]));
        start_server(&mut server);
        let mut rng = TestRng(7);

        let join = Envelope::empty(EnvelopeCode::Joining, device_addr(9), ShortAddress::COORDINATOR);
        let effects = server
            .on_envelope(&join, MediaType::Powerline, Ticks::ZERO, &mut rng)
            .unwrap();
        let sends = server_sends(&effects);
        assert_eq!(sends.len(), 1);
        assert_eq!(sends[0].code, EnvelopeCode::Decline);
        assert_eq!(server.stats().joins_declined, 1);
    }

    #[test]
    fn tampered_challenge_echo_is_silently_dropped() {
        let mut server = new_server();
        start_server(&mut server);
        server
            .access_mut()
            .provision(gm_boot::AccessEntry {
                ext_addr: device_addr(1),
                psk: Aes128Key::new(BootClientConfig::DEFAULT.psk),
                short_addr: None,
            })
            .unwrap();
        let mut rng = TestRng(99);
        let mut client = new_client(1);
        let mut persisted = NoPersistence;

        let join = client_to_join_request(&mut client, &mut rng, &mut persisted);
        let effects = server
            .on_envelope(&join, MediaType::Powerline, Ticks::ZERO, &mut rng)
            .unwrap();
        let first = server_sends(&effects)[0].clone();

        let effects = client
            .on_envelope(&first, Ticks::ZERO, &mut rng, &mut persisted)
            .unwrap();
        let mut second = client_sends(&effects)[0].clone();

        // Corrupt the echoed challenge inside the response
        let EnvelopePayload::Eap(mut frame) = second.parse_payload().unwrap() else {
            panic!("expected eap");
        };
        if let EapBody::Second { rand_s, .. } = &mut frame.body {
            rand_s[0] ^= 0xFF;
        }
        second.payload = frame.encode().unwrap();

        let effects = server
            .on_envelope(&second, MediaType::Powerline, Ticks::ZERO, &mut rng)
            .unwrap();
        assert!(effects.is_empty());
        assert_eq!(server.stats().silent_discards, 1);
    }

    #[test]
    fn relay_change_mid_handshake_gets_one_refusal() {
        let mut server = new_server_with(AccessMode::DenyList);
        start_server(&mut server);
        let mut rng = TestRng(3);

        let join = Envelope::empty(EnvelopeCode::Joining, device_addr(4), ShortAddress::COORDINATOR);
        server
            .on_envelope(&join, MediaType::Powerline, Ticks::ZERO, &mut rng)
            .unwrap();

        // Same device shows up again through a different relay
        let moved = Envelope::empty(EnvelopeCode::Joining, device_addr(4), ShortAddress::new(0x0030));
        let effects = server
            .on_envelope(&moved, MediaType::Powerline, Ticks::new(5), &mut rng)
            .unwrap();
        let sends = server_sends(&effects);
        assert_eq!(sends.len(), 1);
        assert_eq!(sends[0].code, EnvelopeCode::Decline);

        // The slate is clean: the next request through the new relay starts over
        let effects = server
            .on_envelope(&moved, MediaType::Powerline, Ticks::new(6), &mut rng)
            .unwrap();
        assert!(effects
            .iter()
            .any(|e| matches!(e, server::Effect::RequestPsk(_))));
    }

    #[test]
    fn response_through_wrong_relay_is_refused() {
        let mut server = new_server();
        start_server(&mut server);
        server
            .access_mut()
            .provision(gm_boot::AccessEntry {
                ext_addr: device_addr(1),
                psk: Aes128Key::new(BootClientConfig::DEFAULT.psk),
                short_addr: None,
            })
            .unwrap();
        let mut rng = TestRng(42);
        let mut client = new_client(1);
        let mut persisted = NoPersistence;

        let join = client_to_join_request(&mut client, &mut rng, &mut persisted);
        let effects = server
            .on_envelope(&join, MediaType::Powerline, Ticks::ZERO, &mut rng)
            .unwrap();
        let first = server_sends(&effects)[0].clone();

        let effects = client
            .on_envelope(&first, Ticks::ZERO, &mut rng, &mut persisted)
            .unwrap();
        let mut second = client_sends(&effects)[0].clone();
        second.relay = ShortAddress::new(0x0042);

        let effects = server
            .on_envelope(&second, MediaType::Powerline, Ticks::ZERO, &mut rng)
            .unwrap();
        let sends = server_sends(&effects);
        assert_eq!(sends.len(), 1);
        assert_eq!(sends[0].code, EnvelopeCode::Decline);
        assert_eq!(server.stats().joins_declined, 1);
    }

    #[test]
    fn join_table_overflow_refuses_without_side_effects() {
        let mut server = new_server_with(AccessMode::DenyList);
        start_server(&mut server);
        let mut rng = TestRng(11);

        for n in 1..=16u8 {
            let join = Envelope::empty(EnvelopeCode::Joining, device_addr(n), ShortAddress::COORDINATOR);
            let effects = server
                .on_envelope(&join, MediaType::Powerline, Ticks::ZERO, &mut rng)
                .unwrap();
            assert!(matches!(effects[0], server::Effect::RequestPsk(_)));
        }

        let join = Envelope::empty(EnvelopeCode::Joining, device_addr(17), ShortAddress::COORDINATOR);
        let effects = server
            .on_envelope(&join, MediaType::Powerline, Ticks::ZERO, &mut rng)
            .unwrap();
        let sends = server_sends(&effects);
        assert_eq!(sends.len(), 1);
        assert_eq!(sends[0].code, EnvelopeCode::Decline);
        // The overflow device has no exchange on the books
        assert_eq!(
            server
                .psk_response(&device_addr(17), None, Ticks::ZERO)
                .unwrap_err(),
            Error::NotFound
        );
        // Existing exchanges are untouched
        assert!(server.psk_response(&device_addr(3), None, Ticks::ZERO).is_ok());
    }

    /// Walk one admission message by message, stopping before the confirm
    fn admission_to_accept(
        server: &mut BootServer,
        client: &mut BootClient,
        rng: &mut TestRng,
        persisted: &mut NoPersistence,
    ) -> Envelope {
        let now = Ticks::ZERO;
        let join = client_to_join_request(client, rng, persisted);
        let effects = server
            .on_envelope(&join, MediaType::Powerline, now, rng)
            .unwrap();
        let first = server_sends(&effects)[0].clone();
        let second = {
            let effects = client.on_envelope(&first, now, rng, persisted).unwrap();
            client_sends(&effects)[0].clone()
        };
        let effects = server
            .on_envelope(&second, MediaType::Powerline, now, rng)
            .unwrap();
        let third = server_sends(&effects)[0].clone();
        let fourth = {
            let effects = client.on_envelope(&third, now, rng, persisted).unwrap();
            client_sends(&effects)[0].clone()
        };
        let effects = server
            .on_envelope(&fourth, MediaType::Powerline, now, rng)
            .unwrap();
        // Nothing finalizes until the success frame is confirmed out
        assert!(!effects
            .iter()
            .any(|e| matches!(e, server::Effect::NotifyJoin { .. })));
        let sends = server_sends(&effects);
        assert_eq!(sends.len(), 1);
        assert_eq!(sends[0].code, EnvelopeCode::Accepted);
        sends[0].clone()
    }

    #[test]
    fn admission_finalizes_on_the_transmit_confirm() {
        let mut server = new_server();
        start_server(&mut server);
        server
            .access_mut()
            .provision(gm_boot::AccessEntry {
                ext_addr: device_addr(1),
                psk: Aes128Key::new(BootClientConfig::DEFAULT.psk),
                short_addr: None,
            })
            .unwrap();
        let mut rng = TestRng(0x90);
        let mut client = new_client(1);
        let mut persisted = NoPersistence;

        let accept = admission_to_accept(&mut server, &mut client, &mut rng, &mut persisted);
        assert_eq!(server.stats().joins_completed, 0);

        let effects = server.send_confirm(&device_addr(1), true, Ticks::ZERO).unwrap();
        assert!(effects
            .iter()
            .any(|e| matches!(e, server::Effect::NotifyJoin { ext_addr, .. } if *ext_addr == device_addr(1))));
        assert_eq!(server.stats().joins_completed, 1);
        assert_eq!(
            server.devices().get(&device_addr(1)).unwrap().state,
            gm_boot::ConnectionState::Connected
        );

        let effects = client
            .on_envelope(&accept, Ticks::ZERO, &mut rng, &mut persisted)
            .unwrap();
        assert!(effects
            .iter()
            .any(|e| matches!(e, client::Effect::JoinComplete { .. })));
    }

    #[test]
    fn failed_accept_transmit_drops_the_admission() {
        let mut server = new_server();
        start_server(&mut server);
        server
            .access_mut()
            .provision(gm_boot::AccessEntry {
                ext_addr: device_addr(1),
                psk: Aes128Key::new(BootClientConfig::DEFAULT.psk),
                short_addr: None,
            })
            .unwrap();
        let mut rng = TestRng(0x91);
        let mut client = new_client(1);
        let mut persisted = NoPersistence;

        admission_to_accept(&mut server, &mut client, &mut rng, &mut persisted);
        let effects = server.send_confirm(&device_addr(1), false, Ticks::ZERO).unwrap();
        assert!(effects.is_empty());
        assert_eq!(server.stats().joins_completed, 0);
        assert_eq!(server.stats().joins_declined, 1);
        assert!(server.devices().get(&device_addr(1)).is_none());
    }
}

mod psk_lookup {
    use super::*;

    #[test]
    fn unknown_device_joins_with_operator_psk() {
        let mut server = new_server_with(AccessMode::DenyList);
        start_server(&mut server);
        let mut rng = TestRng(0xC0FFEE);
        let mut client = new_client(1);
        let mut persisted = NoPersistence;

        let join = client_to_join_request(&mut client, &mut rng, &mut persisted);
        let effects = server
            .on_envelope(&join, MediaType::Powerline, Ticks::ZERO, &mut rng)
            .unwrap();
        assert!(matches!(effects[0], server::Effect::RequestPsk(a) if a == device_addr(1)));

        let effects = server
            .psk_response(
                &device_addr(1),
                Some(Aes128Key::new(BootClientConfig::DEFAULT.psk)),
                Ticks::new(100),
            )
            .unwrap();
        let first = server_sends(&effects)[0].clone();
        let effects = client
            .on_envelope(&first, Ticks::new(100), &mut rng, &mut persisted)
            .unwrap();
        let second = client_sends(&effects)[0].clone();
        let (_, client_out) = pump(&mut server, &mut client, second, &mut rng, &mut persisted);
        assert!(client_out
            .iter()
            .any(|e| matches!(e, client::Effect::JoinComplete { .. })));
        // One admission, counted once despite the external PSK detour
        assert_eq!(server.stats().joins_started, 1);
        assert_eq!(server.stats().joins_completed, 1);
    }

    #[test]
    fn default_psk_fallback_fires_exactly_once() {
        let mut server = new_server_with(AccessMode::DenyList);
        start_server(&mut server);
        let mut rng = TestRng(0xBEEF);
        let mut client = new_client(1);
        let mut persisted = NoPersistence;

        let join = client_to_join_request(&mut client, &mut rng, &mut persisted);
        server
            .on_envelope(&join, MediaType::Powerline, Ticks::ZERO, &mut rng)
            .unwrap();

        // Operator never answers; the deadline substitutes the default PSK
        let deadline = Ticks::ZERO + BootServerConfig::DEFAULT.psk_deadline + Millis::new(1);
        let effects = server.sweep(deadline, &mut rng).unwrap();
        let sends = server_sends(&effects);
        assert_eq!(sends.len(), 1);
        assert_eq!(sends[0].code, EnvelopeCode::Challenge);

        // A later sweep must not fire the fallback again
        let later = deadline + Millis::new(100);
        let effects = server.sweep(later, &mut rng).unwrap();
        assert!(server_sends(&effects).is_empty());

        // The default PSK matches the factory device PSK, so the handshake
        // completes from here
        let first = sends[0].clone();
        let second = {
            let effects = client
                .on_envelope(&first, deadline, &mut rng, &mut persisted)
                .unwrap();
            client_sends(&effects)[0].clone()
        };
        let (server_out, _) = pump(&mut server, &mut client, second, &mut rng, &mut persisted);
        assert!(server_out
            .iter()
            .any(|e| matches!(e, server::Effect::NotifyJoin { .. })));
        assert_eq!(server.stats().joins_started, 1);
    }

    #[test]
    fn refused_psk_declines_the_device() {
        let mut server = new_server_with(AccessMode::DenyList);
        start_server(&mut server);
        let mut rng = TestRng(5);

        let join = Envelope::empty(EnvelopeCode::Joining, device_addr(2), ShortAddress::COORDINATOR);
        server
            .on_envelope(&join, MediaType::Powerline, Ticks::ZERO, &mut rng)
            .unwrap();
        let effects = server
            .psk_response(&device_addr(2), None, Ticks::new(10))
            .unwrap();
        let sends = server_sends(&effects);
        assert_eq!(sends[0].code, EnvelopeCode::Decline);
        assert_eq!(server.stats().joins_declined, 1);
    }
}

mod rekeying {
    use super::*;

    fn connected_trio(server: &mut BootServer, rng: &mut TestRng) -> [BootClient; 3] {
        let (c1, _) = admit(server, 1, rng);
        let (c2, _) = admit(server, 2, rng);
        let (c3, _) = admit(server, 3, rng);
        [c1, c2, c3]
    }

    /// Feed one server envelope into its addressed client, returning what
    /// goes back to the server
    fn route_to_clients(
        clients: &mut [BootClient; 3],
        env: &Envelope,
        now: Ticks,
        rng: &mut TestRng,
    ) -> Vec<Envelope> {
        let mut persisted = NoPersistence;
        for client in clients.iter_mut() {
            let effects = client.on_envelope(env, now, rng, &mut persisted).unwrap();
            let sends = client_sends(&effects);
            if !sends.is_empty() {
                return sends;
            }
        }
        Vec::new()
    }

    #[test]
    fn rotation_over_three_devices_commits_new_index() {
        let mut server = new_server();
        start_server(&mut server);
        let mut rng = TestRng(0xFEED);
        let mut clients = connected_trio(&mut server, &mut rng);
        assert_eq!(server.gmk_index(), 0);
        let now = Ticks::new(1_000);

        let effects = server
            .rekey_start(Aes128Key::new([0xE2; 16]), now, &mut rng)
            .unwrap();
        assert!(matches!(effects[0], server::Effect::InstallGmk { index: 1, .. }));
        let mut pending = server_sends(&effects);

        let mut commit_seen = false;
        for _ in 0..64 {
            let Some(env) = pending.pop() else { break };
            let replies = route_to_clients(&mut clients, &env, now, &mut rng);
            for reply in replies {
                let effects = server
                    .on_envelope(&reply, MediaType::Powerline, now, &mut rng)
                    .unwrap();
                pending.extend(server_sends(&effects));
                if effects
                    .iter()
                    .any(|e| matches!(e, server::Effect::CommitGmkIndex(1)))
                {
                    commit_seen = true;
                }
            }
        }
        assert!(commit_seen);

        let effects = server.attribute_confirm(true, now).unwrap();
        assert!(effects
            .iter()
            .any(|e| matches!(e, server::Effect::RekeyDone(RekeyError::None))));
        assert_eq!(server.gmk_index(), 1);
        assert_eq!(server.stats().rekeys_completed, 1);

        // Every device staged and switched to the new slot
        for client in &clients {
            assert_eq!(client.stats().rekeys_applied, 1);
        }
    }

    #[test]
    fn activation_failure_rolls_back_earlier_devices_only() {
        let mut server = new_server();
        start_server(&mut server);
        let mut rng = TestRng(0xDEAD);
        let mut clients = connected_trio(&mut server, &mut rng);
        let now = Ticks::new(1_000);

        let effects = server
            .rekey_start(Aes128Key::new([0xE2; 16]), now, &mut rng)
            .unwrap();
        let mut pending = server_sends(&effects);

        // Walk delivery and the first activation normally, then fail the
        // second device's activation
        let mut rollback_effects = None;
        for _ in 0..64 {
            let Some(env) = pending.pop() else { break };
            let is_activation_for_dev2 = env.target == device_addr(2)
                && matches!(
                    env.parse_payload(),
                    Ok(EnvelopePayload::Params(ref p))
                        if p.iter().any(|c| matches!(c, ConfigParam::GmkActivation { .. }))
                );
            if is_activation_for_dev2 {
                let refusal = Envelope::with_params(
                    EnvelopeCode::Joining,
                    device_addr(2),
                    env.relay,
                    &[ConfigParam::ParamResult {
                        result: ParamResult::InvalidValue,
                        attr_id: ATTR_GMK_ACTIVATION,
                    }],
                )
                .unwrap();
                rollback_effects = Some(
                    server
                        .on_envelope(&refusal, MediaType::Powerline, now, &mut rng)
                        .unwrap(),
                );
                break;
            }
            let replies = route_to_clients(&mut clients, &env, now, &mut rng);
            for reply in replies {
                let effects = server
                    .on_envelope(&reply, MediaType::Powerline, now, &mut rng)
                    .unwrap();
                pending.extend(server_sends(&effects));
            }
        }

        let effects = rollback_effects.expect("activation for device 2 observed");
        let sends = server_sends(&effects);
        // Exactly one deactivation, aimed at the device that already switched
        assert_eq!(sends.len(), 1);
        assert_eq!(sends[0].target, device_addr(1));
        match sends[0].parse_payload().unwrap() {
            EnvelopePayload::Params(params) => {
                assert!(params
                    .iter()
                    .any(|p| matches!(p, ConfigParam::GmkActivation { index: 0 })));
            }
            other => panic!("unexpected payload {other:?}"),
        }
        assert!(effects
            .iter()
            .any(|e| matches!(e, server::Effect::RekeyDone(RekeyError::Param))));
        assert_eq!(server.gmk_index(), 0);
        assert_eq!(server.stats().rekeys_failed, 1);
    }

    #[test]
    fn kick_is_refused_while_rotation_runs() {
        let mut server = new_server();
        start_server(&mut server);
        let mut rng = TestRng(0x50);
        let _clients = connected_trio(&mut server, &mut rng);
        let now = Ticks::new(1_000);

        server
            .rekey_start(Aes128Key::new([0x77; 16]), now, &mut rng)
            .unwrap();
        assert_eq!(server.kick(&device_addr(3), now), Err(Error::Busy));
        // The device is still connected and untouched
        let record = server.devices().get(&device_addr(3)).unwrap();
        assert_eq!(record.state, gm_boot::ConnectionState::Connected);
    }

    #[test]
    fn rotation_with_no_devices_commits_immediately() {
        let mut server = new_server();
        start_server(&mut server);
        let mut rng = TestRng(0x51);
        let now = Ticks::new(10);

        let effects = server
            .rekey_start(Aes128Key::new([0x33; 16]), now, &mut rng)
            .unwrap();
        assert!(effects
            .iter()
            .any(|e| matches!(e, server::Effect::CommitGmkIndex(1))));
        let effects = server.attribute_confirm(true, now).unwrap();
        assert!(effects
            .iter()
            .any(|e| matches!(e, server::Effect::RekeyDone(RekeyError::None))));
        assert_eq!(server.gmk_index(), 1);
    }

    #[test]
    fn rotation_reuses_the_admission_psk() {
        let mut server = new_server_with(AccessMode::DenyList);
        start_server(&mut server);
        let mut rng = TestRng(0x53);
        let mut persisted = NoPersistence;

        // Admission runs under an operator-supplied key the access table
        // never sees
        let psk = [0x5E; 16];
        let mut config = BootClientConfig::DEFAULT;
        config.psk = psk;
        let mut client = BootClient::new(config, PanSortConfig::DEFAULT, device_addr(1));
        let join = client_to_join_request(&mut client, &mut rng, &mut persisted);
        server
            .on_envelope(&join, MediaType::Powerline, Ticks::ZERO, &mut rng)
            .unwrap();
        let effects = server
            .psk_response(&device_addr(1), Some(Aes128Key::new(psk)), Ticks::ZERO)
            .unwrap();
        let first = server_sends(&effects)[0].clone();
        let second = {
            let effects = client
                .on_envelope(&first, Ticks::ZERO, &mut rng, &mut persisted)
                .unwrap();
            client_sends(&effects)[0].clone()
        };
        let (server_out, _) = pump(&mut server, &mut client, second, &mut rng, &mut persisted);
        assert!(server_out
            .iter()
            .any(|e| matches!(e, server::Effect::NotifyJoin { .. })));

        // The rotation must re-authenticate under that same key
        let now = Ticks::new(2_000);
        let effects = server
            .rekey_start(Aes128Key::new([0xE7; 16]), now, &mut rng)
            .unwrap();
        let mut pending = server_sends(&effects);
        let mut commit_seen = false;
        for _ in 0..32 {
            let Some(env) = pending.pop() else { break };
            let effects = client
                .on_envelope(&env, now, &mut rng, &mut persisted)
                .unwrap();
            for reply in client_sends(&effects) {
                let effects = server
                    .on_envelope(&reply, MediaType::Powerline, now, &mut rng)
                    .unwrap();
                pending.extend(server_sends(&effects));
                if effects
                    .iter()
                    .any(|e| matches!(e, server::Effect::CommitGmkIndex(1)))
                {
                    commit_seen = true;
                }
            }
        }
        assert!(commit_seen);
        assert_eq!(server.stats().silent_discards, 0);
    }

    #[test]
    fn rekey_stage_runs_on_its_own_deadline() {
        let mut server = new_server();
        start_server(&mut server);
        let mut rng = TestRng(0x54);
        admit(&mut server, 1, &mut rng);
        let t0 = Ticks::new(1_000);

        let effects = server
            .rekey_start(Aes128Key::new([0x44; 16]), t0, &mut rng)
            .unwrap();
        assert_eq!(server_sends(&effects).len(), 1);

        // The admission retry deadline does not apply to a rekeying stage
        let admission_deadline = t0 + BootServerConfig::DEFAULT.retry_timeout + Millis::new(1);
        let effects = server.sweep(admission_deadline, &mut rng).unwrap();
        assert!(server_sends(&effects).is_empty());

        let phase_deadline = t0 + BootServerConfig::DEFAULT.rekey.phase_timeout + Millis::new(1);
        let effects = server.sweep(phase_deadline, &mut rng).unwrap();
        let sends = server_sends(&effects);
        assert_eq!(sends.len(), 1);
        assert_eq!(sends[0].code, EnvelopeCode::Challenge);
    }

    #[test]
    fn platform_attribute_refusal_reverts_index() {
        let mut server = new_server();
        start_server(&mut server);
        let mut rng = TestRng(0x52);
        let now = Ticks::new(10);

        server
            .rekey_start(Aes128Key::new([0x33; 16]), now, &mut rng)
            .unwrap();
        let effects = server.attribute_confirm(false, now).unwrap();
        assert!(effects
            .iter()
            .any(|e| matches!(e, server::Effect::RekeyDone(RekeyError::SetAttribute))));
        assert_eq!(server.gmk_index(), 0);
    }
}

mod departure {
    use super::*;

    #[test]
    fn kick_removes_device_on_both_sides() {
        let mut server = new_server();
        start_server(&mut server);
        let mut rng = TestRng(0x60);
        let (mut client, _) = admit(&mut server, 1, &mut rng);
        let now = Ticks::new(500);

        let effects = server.kick(&device_addr(1), now).unwrap();
        let sends = server_sends(&effects);
        assert_eq!(sends[0].code, EnvelopeCode::Kick);
        // Removal waits for the transmission confirm
        assert!(server.devices().get(&device_addr(1)).is_some());
        let effects = server.send_confirm(&device_addr(1), true, now).unwrap();
        assert!(effects
            .iter()
            .any(|e| matches!(e, server::Effect::NotifyLeave(a) if *a == device_addr(1))));
        assert!(server.devices().get(&device_addr(1)).is_none());
        assert_eq!(server.stats().kicks, 1);

        // The device obeys without any further exchange
        let mut persisted = NoPersistence;
        let effects = client
            .on_envelope(&sends[0], now, &mut rng, &mut persisted)
            .unwrap();
        assert!(effects
            .iter()
            .any(|e| matches!(e, client::Effect::LeftNetwork)));
        assert!(client_sends(&effects).is_empty());
        assert_eq!(client.state(), ClientState::Disconnected);
        assert_eq!(client.short_addr(), ShortAddress::UNASSIGNED);
    }

    #[test]
    fn failed_kick_transmit_keeps_the_device() {
        let mut server = new_server();
        start_server(&mut server);
        let mut rng = TestRng(0x63);
        admit(&mut server, 1, &mut rng);
        let now = Ticks::new(500);

        server.kick(&device_addr(1), now).unwrap();
        // A second kick is refused while the first awaits its confirm
        assert_eq!(server.kick(&device_addr(1), now), Err(Error::Busy));

        let effects = server.send_confirm(&device_addr(1), false, now).unwrap();
        assert!(effects.is_empty());
        assert_eq!(server.stats().kicks, 0);
        assert_eq!(
            server.devices().get(&device_addr(1)).unwrap().state,
            gm_boot::ConnectionState::Connected
        );
        // The operator may try again
        assert!(server.kick(&device_addr(1), now).is_ok());
    }

    #[test]
    fn local_leave_notifies_the_coordinator() {
        let mut server = new_server();
        start_server(&mut server);
        let mut rng = TestRng(0x61);
        let (mut client, _) = admit(&mut server, 1, &mut rng);
        let now = Ticks::new(500);

        let effects = client.leave(now).unwrap();
        let announce = client_sends(&effects)[0].clone();
        assert_eq!(announce.code, EnvelopeCode::Kick);

        let effects = server
            .on_envelope(&announce, MediaType::Powerline, now, &mut rng)
            .unwrap();
        assert!(effects
            .iter()
            .any(|e| matches!(e, server::Effect::NotifyLeave(a) if *a == device_addr(1))));

        let mut persisted = NoPersistence;
        let effects = client.leave_confirm(now, &mut persisted).unwrap();
        assert!(effects
            .iter()
            .any(|e| matches!(e, client::Effect::LeftNetwork)));
        assert_eq!(client.state(), ClientState::Disconnected);
    }

    #[test]
    fn silent_device_is_demoted_by_the_sweep() {
        let mut server = new_server();
        start_server(&mut server);
        let mut rng = TestRng(0x62);
        admit(&mut server, 1, &mut rng);

        let past_ttl = Ticks::new(10) + BootServerConfig::DEFAULT.device_ttl + Millis::new(1);
        let effects = server.sweep(past_ttl, &mut rng).unwrap();
        assert!(effects
            .iter()
            .any(|e| matches!(e, server::Effect::NotifyLeave(a) if *a == device_addr(1))));
        assert_eq!(
            server.devices().get(&device_addr(1)).unwrap().state,
            gm_boot::ConnectionState::Disconnected
        );
    }
}

mod discovery {
    use super::*;

    #[test]
    fn all_candidates_below_threshold_fails_without_traffic() {
        let mut client = new_client(1);
        let mut rng = TestRng(0x70);
        let mut persisted = NoPersistence;
        let now = Ticks::ZERO;

        client.start(now, &mut rng, &mut persisted).unwrap();
        client.timer_fired(now).unwrap();

        let weak = PanCandidate {
            link_quality: BootClientConfig::DEFAULT.link_quality_threshold - 1,
            ..good_candidate()
        };
        let effects = client.discovery_complete(&[weak, weak], now).unwrap();
        assert!(effects
            .iter()
            .any(|e| matches!(e, client::Effect::JoinFailed)));
        assert!(client_sends(&effects).is_empty());
        assert_eq!(client.state(), ClientState::Disconnected);
    }

    #[test]
    fn resorted_list_respects_the_quality_floor() {
        let mut client = new_client(1);
        let mut rng = TestRng(0x73);
        let mut persisted = NoPersistence;
        let now = Ticks::ZERO;

        client.start(now, &mut rng, &mut persisted).unwrap();
        client.timer_fired(now).unwrap();
        client.discovery_complete(&[good_candidate()], now).unwrap();

        // The external sort hands back only an unusable candidate
        let weak = PanCandidate {
            link_quality: BootClientConfig::DEFAULT.link_quality_threshold - 1,
            ..good_candidate()
        };
        let effects = client.pan_sort_response(Some(&[weak]), now).unwrap();
        assert!(effects
            .iter()
            .any(|e| matches!(e, client::Effect::JoinFailed)));
        assert!(client_sends(&effects).is_empty());
        assert_eq!(client.state(), ClientState::Disconnected);
    }

    #[test]
    fn unanswered_candidate_is_retried_then_abandoned() {
        let mut client = new_client(1);
        let mut rng = TestRng(0x71);
        let mut persisted = NoPersistence;
        let now = Ticks::ZERO;

        client.start(now, &mut rng, &mut persisted).unwrap();
        client.timer_fired(now).unwrap();
        client.discovery_complete(&[good_candidate()], now).unwrap();
        let effects = client.pan_sort_response(None, now).unwrap();
        assert_eq!(client_sends(&effects).len(), 1);

        // Exhaust the per-candidate retry budget through timeouts
        let mut at = now;
        let mut failed = false;
        for _ in 0..BootClientConfig::DEFAULT.join_retries + 1 {
            at = at + BootClientConfig::DEFAULT.join_timeout + Millis::new(1);
            let effects = client.sweep(at).unwrap();
            if effects.iter().any(|e| matches!(e, client::Effect::JoinFailed)) {
                failed = true;
                break;
            }
            assert_eq!(client_sends(&effects).len(), 1);
        }
        assert!(failed);
        assert_eq!(client.state(), ClientState::Disconnected);
    }

    #[test]
    fn sort_window_expiry_proceeds_with_local_order() {
        let mut client = new_client(1);
        let mut rng = TestRng(0x72);
        let mut persisted = NoPersistence;
        let now = Ticks::ZERO;

        client.start(now, &mut rng, &mut persisted).unwrap();
        client.timer_fired(now).unwrap();
        client.discovery_complete(&[good_candidate()], now).unwrap();

        let past_wait = now + BootClientConfig::DEFAULT.sort_wait + Millis::new(1);
        let effects = client.sweep(past_wait).unwrap();
        assert_eq!(client_sends(&effects).len(), 1);
        assert_eq!(client.state(), ClientState::Bootstrapping);
    }
}

mod warm_restore {
    use super::*;

    #[derive(Default)]
    struct MemoryStore(Option<RestoredNetwork>);

    impl PersistedAttributes for MemoryStore {
        fn load(&self) -> Option<RestoredNetwork> {
            self.0
        }
        fn store(&mut self, network: &RestoredNetwork) {
            self.0 = Some(*network);
        }
        fn clear(&mut self) {
            self.0 = None;
        }
    }

    #[test]
    fn stored_attributes_skip_the_handshake() {
        let mut store = MemoryStore::default();
        store.store(&RestoredNetwork {
            pan_id: PAN,
            short_addr: ShortAddress::new(0x0005),
            gmk_index: 1,
            gmk: [0x9A; 16],
        });

        let mut client = new_client(1);
        let mut rng = TestRng(0x80);
        let effects = client.start(Ticks::ZERO, &mut rng, &store).unwrap();

        assert_eq!(client.state(), ClientState::Connected);
        assert!(effects
            .iter()
            .any(|e| matches!(e, client::Effect::InstallGmk { index: 1, .. })));
        assert!(effects
            .iter()
            .any(|e| matches!(e, client::Effect::ActivateGmkIndex(1))));
        assert!(effects
            .iter()
            .any(|e| matches!(e, client::Effect::JoinComplete { short_addr, .. }
                if *short_addr == ShortAddress::new(0x0005))));
        assert!(client_sends(&effects).is_empty());
    }

    #[test]
    fn kick_clears_the_store() {
        let mut store = MemoryStore::default();
        store.store(&RestoredNetwork {
            pan_id: PAN,
            short_addr: ShortAddress::new(0x0005),
            gmk_index: 0,
            gmk: [0x9A; 16],
        });
        let mut client = new_client(1);
        let mut rng = TestRng(0x81);
        client.start(Ticks::ZERO, &mut rng, &store).unwrap();

        let kick = Envelope::empty(EnvelopeCode::Kick, device_addr(1), ShortAddress::new(0x0005));
        client
            .on_envelope(&kick, Ticks::new(1), &mut rng, &mut store)
            .unwrap();
        assert!(store.load().is_none());
        assert_eq!(client.state(), ClientState::Disconnected);
    }
}
