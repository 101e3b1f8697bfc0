// SPDX-License-Identifier: Apache-2.0
// Copyright Open Network Fabric Authors

//! End-to-end scenarios spanning Pool4, BIB, and Sessions through the dispatcher: a full TCP
//! handshake, simultaneous close, and deadline-driven cleanup.

use std::net::{Ipv4Addr, Ipv6Addr};
use std::time::Duration;

use dataplane_nat64::config::{ConfigStore, GlobalConfig, NatDuration};
use dataplane_nat64::dispatcher::{Dispatcher, PacketEvent, Verdict};
use dataplane_nat64::pool4::Pool4Db;
use dataplane_nat64::session::{TcpEvent, TcpState};
use dataplane_nat64::tuple::{L4Proto, Tuple4, Tuple4Endpoint, Tuple6, Tuple6Endpoint};

fn dispatcher_with_fast_tcp_trans() -> Dispatcher {
    let pool4 = Pool4Db::init_power(16).unwrap();
    pool4
        .add(0, L4Proto::Tcp, Ipv4Addr::new(192, 0, 2, 1), 2000, 2000)
        .unwrap();
    let mut cfg = GlobalConfig::default();
    cfg.ttl.tcp_trans = NatDuration::from_millis(1);
    Dispatcher::new(ConfigStore::new(cfg), pool4)
}

#[test]
fn tcp_handshake_then_simultaneous_close_expires_the_binding() {
    let d = dispatcher_with_fast_tcp_trans();

    let v6_host = Tuple6Endpoint::new(Ipv6Addr::LOCALHOST, 33000);
    let v6_dst = Tuple6Endpoint::new(Ipv6Addr::UNSPECIFIED, 80);
    let remote4 = Tuple4Endpoint::new(Ipv4Addr::new(198, 51, 100, 9), 80);

    let syn6 = Tuple6::new(v6_host, v6_dst, L4Proto::Tcp, 0);
    let verdict = d.process_6in(syn6, remote4, PacketEvent::Tcp(TcpEvent::Syn6In));
    assert_eq!(verdict, Verdict::Translate);

    let local4 = d
        .bib
        .get6(L4Proto::Tcp, v6_host)
        .expect("dynamic bib entry installed")
        .ipv4;
    assert_eq!(local4.addr, Ipv4Addr::new(192, 0, 2, 1));
    assert_eq!(local4.port, 2000);

    let key = dataplane_nat64::session::SessionKey {
        remote6: v6_host,
        local6: v6_dst,
        local4,
        remote4,
        proto: L4Proto::Tcp,
    };
    assert_eq!(d.sessions.get(&key).unwrap().state, TcpState::V6Init);

    let syn4 = Tuple4::new(remote4, local4, L4Proto::Tcp, 0);
    let v6_for_4in = v6_host;
    let verdict = d.process_4in(syn4, v6_for_4in, PacketEvent::Tcp(TcpEvent::Syn4In));
    assert_eq!(verdict, Verdict::Translate);
    assert_eq!(
        d.sessions.get(&key).unwrap().state,
        TcpState::Established
    );

    let verdict = d.process_6in(syn6, remote4, PacketEvent::Tcp(TcpEvent::Fin6In));
    assert_eq!(verdict, Verdict::Translate);
    assert_eq!(d.sessions.get(&key).unwrap().state, TcpState::V6FinRcv);

    let fin4 = Tuple4::new(remote4, local4, L4Proto::Tcp, 0);
    let verdict = d.process_4in(fin4, v6_for_4in, PacketEvent::Tcp(TcpEvent::Fin4In));
    assert_eq!(verdict, Verdict::Translate);
    assert_eq!(
        d.sessions.get(&key).unwrap().state,
        TcpState::V4V6FinRcv
    );

    std::thread::sleep(Duration::from_millis(20));
    let reaped = d.sessions.sweep_expired(&d.bib);
    assert_eq!(reaped, 1);
    assert!(d.sessions.get(&key).is_none());
    assert!(!d.bib.contains4(L4Proto::Tcp, local4));
}

#[test]
fn drop_external_tcp_blocks_unsolicited_v4_syn() {
    let pool4 = Pool4Db::init_power(16).unwrap();
    pool4
        .add(0, L4Proto::Tcp, Ipv4Addr::new(192, 0, 2, 1), 3000, 3000)
        .unwrap();
    let mut cfg = GlobalConfig::default();
    cfg.drop_external_tcp = true;
    let d = Dispatcher::new(ConfigStore::new(cfg), pool4);

    let v6_host = Tuple6Endpoint::new(Ipv6Addr::LOCALHOST, 44000);
    let local4 = Tuple4Endpoint::new(Ipv4Addr::new(192, 0, 2, 1), 3000);
    d.bib
        .add_static(dataplane_nat64::bib::BibEntry {
            ipv6: v6_host,
            ipv4: local4,
            proto: L4Proto::Tcp,
            mark: 0,
            is_static: true,
        })
        .unwrap();

    let remote4 = Tuple4Endpoint::new(Ipv4Addr::new(198, 51, 100, 9), 443);
    let syn4 = Tuple4::new(remote4, local4, L4Proto::Tcp, 0);
    let verdict = d.process_4in(syn4, v6_host, PacketEvent::Tcp(TcpEvent::Syn4In));
    assert_eq!(verdict, Verdict::Drop);
}
